//! Per-worker round-trip latency tracking.
//!
//! Keeps an EWMA of RTT in milliseconds plus rolling ok/error counters per
//! worker. Placement uses the EWMA as a score penalty; the tracker never
//! influences anything else.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Latency record for a single worker.
#[derive(Debug, Clone, Default)]
pub struct NodeLatency {
    /// EWMA of RTT in milliseconds. Zero until the first observation.
    pub ewma_ms: f64,
    pub ok: u64,
    pub error: u64,
    pub last_rtt: Duration,
    pub last_at: Option<Instant>,
}

/// Lock-protected, constant-time latency store.
pub struct LatencyTracker {
    alpha: f64,
    nodes: RwLock<HashMap<String, NodeLatency>>,
}

impl LatencyTracker {
    /// `alpha` is the EWMA smoothing factor; out-of-range values fall back
    /// to 0.2. Higher reacts faster.
    pub fn new(alpha: f64) -> Self {
        let alpha = if alpha <= 0.0 || alpha >= 1.0 { 0.2 } else { alpha };
        Self {
            alpha,
            nodes: RwLock::new(HashMap::new()),
        }
    }

    pub fn observe_ok(&self, node_id: &str, rtt: Duration) {
        self.observe(node_id, rtt, true);
    }

    pub fn observe_error(&self, node_id: &str, rtt: Duration) {
        self.observe(node_id, rtt, false);
    }

    fn observe(&self, node_id: &str, rtt: Duration, ok: bool) {
        let ms = rtt.as_secs_f64() * 1000.0;

        let mut nodes = self.nodes.write().unwrap();
        let n = nodes.entry(node_id.to_string()).or_default();

        // First sample seeds the EWMA so a cold worker is not biased to zero.
        if n.ewma_ms == 0.0 {
            n.ewma_ms = ms;
        } else {
            n.ewma_ms = self.alpha * ms + (1.0 - self.alpha) * n.ewma_ms;
        }

        n.last_rtt = rtt;
        n.last_at = Some(Instant::now());
        if ok {
            n.ok += 1;
        } else {
            n.error += 1;
        }

        metrics::gauge!("fleetmux_node_rtt_ewma_ms", "node" => node_id.to_string())
            .set(n.ewma_ms);
    }

    pub fn get(&self, node_id: &str) -> Option<NodeLatency> {
        self.nodes.read().unwrap().get(node_id).cloned()
    }

    /// Copying snapshot for external readers (diagnostics).
    pub fn snapshot(&self) -> HashMap<String, NodeLatency> {
        self.nodes.read().unwrap().clone()
    }

    pub fn remove(&self, node_id: &str) {
        self.nodes.write().unwrap().remove(node_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_observation_seeds_ewma() {
        let t = LatencyTracker::new(0.2);
        t.observe_ok("n1", Duration::from_millis(100));

        let n = t.get("n1").unwrap();
        assert_eq!(n.ewma_ms, 100.0);
        assert_eq!(n.ok, 1);
        assert_eq!(n.error, 0);
    }

    #[test]
    fn test_ewma_smoothing() {
        let t = LatencyTracker::new(0.2);
        t.observe_ok("n1", Duration::from_millis(100));
        t.observe_ok("n1", Duration::from_millis(200));

        // 0.2 * 200 + 0.8 * 100 = 120
        let n = t.get("n1").unwrap();
        assert!((n.ewma_ms - 120.0).abs() < 1e-9);
        assert_eq!(n.ok, 2);
    }

    #[test]
    fn test_error_counts_separately() {
        let t = LatencyTracker::new(0.2);
        t.observe_ok("n1", Duration::from_millis(50));
        t.observe_error("n1", Duration::from_millis(400));

        let n = t.get("n1").unwrap();
        assert_eq!(n.ok, 1);
        assert_eq!(n.error, 1);
        assert_eq!(n.last_rtt, Duration::from_millis(400));
    }

    #[test]
    fn test_invalid_alpha_falls_back() {
        let t = LatencyTracker::new(7.0);
        t.observe_ok("n1", Duration::from_millis(100));
        t.observe_ok("n1", Duration::from_millis(200));

        let n = t.get("n1").unwrap();
        assert!((n.ewma_ms - 120.0).abs() < 1e-9, "fell back to alpha=0.2");
    }

    #[test]
    fn test_snapshot_and_remove() {
        let t = LatencyTracker::new(0.2);
        t.observe_ok("n1", Duration::from_millis(10));
        t.observe_ok("n2", Duration::from_millis(20));

        assert_eq!(t.snapshot().len(), 2);

        t.remove("n1");
        assert!(t.get("n1").is_none());
        assert_eq!(t.snapshot().len(), 1);
    }

    #[test]
    fn test_get_unknown_node() {
        let t = LatencyTracker::new(0.2);
        assert!(t.get("nope").is_none());
    }
}
