//! Fixed-capacity ring buffer of planner activity.
//!
//! The collaborator that persists or displays these events is external; the
//! planner only appends here and failures to consume never affect it.

use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TtlUnload,
    PressureUnload,
    ManualUnload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub at: SystemTime,
    pub event_type: EventType,
    pub node_id: String,
    pub model_id: String,
    pub note: String,
}

/// Ring buffer of the most recent events, newest first on read.
pub struct ActivityLog {
    inner: RwLock<Ring>,
}

struct Ring {
    buf: Vec<Option<Event>>,
    next: usize,
    full: bool,
}

impl ActivityLog {
    /// `capacity` of zero or less falls back to 200.
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 { 200 } else { capacity };
        Self {
            inner: RwLock::new(Ring {
                buf: vec![None; capacity],
                next: 0,
                full: false,
            }),
        }
    }

    pub fn add(&self, event: Event) {
        let mut ring = self.inner.write().unwrap();
        let next = ring.next;
        ring.buf[next] = Some(event);
        ring.next += 1;
        if ring.next >= ring.buf.len() {
            ring.next = 0;
            ring.full = true;
        }
    }

    /// All retained events, newest first.
    pub fn list(&self) -> Vec<Event> {
        let ring = self.inner.read().unwrap();

        let mut out: Vec<Event> = if ring.full {
            ring.buf[ring.next..]
                .iter()
                .chain(ring.buf[..ring.next].iter())
                .filter_map(|e| e.clone())
                .collect()
        } else {
            ring.buf[..ring.next].iter().filter_map(|e| e.clone()).collect()
        };
        out.reverse();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(model_id: &str) -> Event {
        Event {
            at: SystemTime::now(),
            event_type: EventType::TtlUnload,
            node_id: "n1".into(),
            model_id: model_id.into(),
            note: "ttl".into(),
        }
    }

    #[test]
    fn test_empty_log() {
        let log = ActivityLog::new(4);
        assert!(log.list().is_empty());
    }

    #[test]
    fn test_newest_first() {
        let log = ActivityLog::new(4);
        log.add(event("a"));
        log.add(event("b"));

        let out = log.list();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].model_id, "b");
        assert_eq!(out[1].model_id, "a");
    }

    #[test]
    fn test_wraparound_keeps_latest() {
        let log = ActivityLog::new(3);
        for id in ["a", "b", "c", "d", "e"] {
            log.add(event(id));
        }

        let ids: Vec<_> = log.list().into_iter().map(|e| e.model_id).collect();
        assert_eq!(ids, vec!["e", "d", "c"]);
    }

    #[test]
    fn test_zero_capacity_falls_back() {
        let log = ActivityLog::new(0);
        log.add(event("a"));
        assert_eq!(log.list().len(), 1);
    }
}
