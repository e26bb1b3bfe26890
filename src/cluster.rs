//! Cluster state - the authoritative in-memory view of workers.
//!
//! Written only by the control service (HELLO/STATUS ingestion); read by
//! placement, the planner and diagnostics. Liveness is derived from heartbeat
//! age at read time, the store itself keeps no online/offline flag.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, SystemTime};
use tracing::debug;

/// Residency state of a model on a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    Loading,
    Ready,
    Unloaded,
    Error,
}

/// A worker's record of one model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelResidency {
    pub model_id: String,
    pub state: ModelState,
    /// Best-effort load timestamp supplied by the worker. `None` when the
    /// worker reported zero/absent, which disables TTL checks for the entry.
    pub loaded_since: Option<SystemTime>,
    /// Router-local timestamp of the STATUS that carried this residency.
    pub last_seen: SystemTime,
}

/// Snapshot of a single worker as last reported over the control plane.
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    pub node_id: String,
    pub version: String,
    /// Worker-local inference base URL (agent-side probing).
    pub engine_base_url: String,
    /// Externally reachable URL the router forwards requests to.
    pub data_plane_url: String,
    pub last_heartbeat: Option<SystemTime>,
    pub ram_total_bytes: u64,
    pub ram_available_bytes: u64,
    pub inflight_requests: u32,
    pub models: HashMap<String, ModelResidency>,
}

impl NodeSnapshot {
    fn new(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            version: String::new(),
            engine_base_url: String::new(),
            data_plane_url: String::new(),
            last_heartbeat: None,
            ram_total_bytes: 0,
            ram_available_bytes: 0,
            inflight_requests: 0,
            models: HashMap::new(),
        }
    }

    /// True if the heartbeat is within `ttl` of `now`. A zero TTL disables
    /// the check; a worker that never sent a heartbeat is offline.
    pub fn is_online(&self, now: SystemTime, ttl: Duration) -> bool {
        if ttl.is_zero() {
            return true;
        }
        match self.last_heartbeat {
            Some(hb) => now.duration_since(hb).map(|age| age <= ttl).unwrap_or(true),
            None => false,
        }
    }
}

/// Thread-safe map of `node_id` -> worker record.
///
/// Records are replaced wholesale on STATUS, never mutated through a
/// snapshot: readers always get a deep copy of the residency map.
#[derive(Default)]
pub struct ClusterState {
    nodes: RwLock<HashMap<String, NodeSnapshot>>,
}

impl ClusterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a HELLO. Creates the worker if it was never seen; nothing ever
    /// removes a worker once created.
    pub fn upsert_node_hello(
        &self,
        node_id: &str,
        version: &str,
        engine_base_url: &str,
        data_plane_url: &str,
    ) {
        let mut nodes = self.nodes.write().unwrap();
        let n = nodes
            .entry(node_id.to_string())
            .or_insert_with(|| NodeSnapshot::new(node_id));
        n.version = version.to_string();
        n.engine_base_url = engine_base_url.to_string();
        n.data_plane_url = data_plane_url.to_string();
        n.last_heartbeat = Some(SystemTime::now());
    }

    /// Ingest a STATUS: RAM totals, inflight, heartbeat and the full
    /// residency map are replaced in one write.
    pub fn update_node_status(
        &self,
        node_id: &str,
        ram_total_bytes: u64,
        ram_available_bytes: u64,
        inflight_requests: u32,
        models: HashMap<String, ModelResidency>,
    ) {
        let mut nodes = self.nodes.write().unwrap();
        let n = nodes
            .entry(node_id.to_string())
            .or_insert_with(|| NodeSnapshot::new(node_id));
        n.ram_total_bytes = ram_total_bytes;
        n.ram_available_bytes = ram_available_bytes;
        n.inflight_requests = inflight_requests;
        n.last_heartbeat = Some(SystemTime::now());
        n.models = models;
        debug!(
            node_id,
            ram_available_bytes,
            inflight_requests,
            total_nodes = nodes.len(),
            "cluster state updated"
        );
    }

    /// Consistent copy of every known worker.
    pub fn snapshot(&self) -> Vec<NodeSnapshot> {
        let nodes = self.nodes.read().unwrap();
        nodes.values().cloned().collect()
    }

    /// [`Self::snapshot`] filtered to workers whose heartbeat is within `ttl`.
    pub fn snapshot_online(&self, now: SystemTime, ttl: Duration) -> Vec<NodeSnapshot> {
        let all = self.snapshot();
        if ttl.is_zero() {
            return all;
        }
        all.into_iter().filter(|n| n.is_online(now, ttl)).collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.read().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn residency(model_id: &str, state: ModelState) -> ModelResidency {
        ModelResidency {
            model_id: model_id.to_string(),
            state,
            loaded_since: Some(SystemTime::now()),
            last_seen: SystemTime::now(),
        }
    }

    #[test]
    fn test_hello_creates_node() {
        let cs = ClusterState::new();
        cs.upsert_node_hello("n1", "dev", "http://inner:8080", "http://outer:8080");

        let snap = cs.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].node_id, "n1");
        assert_eq!(snap[0].data_plane_url, "http://outer:8080");
        assert!(snap[0].last_heartbeat.is_some());
    }

    #[test]
    fn test_status_replaces_residency_wholesale() {
        let cs = ClusterState::new();
        cs.upsert_node_hello("n1", "dev", "", "http://outer:8080");

        let mut models = HashMap::new();
        models.insert("m1".to_string(), residency("m1", ModelState::Ready));
        models.insert("m2".to_string(), residency("m2", ModelState::Loading));
        cs.update_node_status("n1", 100, 50, 2, models);

        let mut models = HashMap::new();
        models.insert("m2".to_string(), residency("m2", ModelState::Ready));
        cs.update_node_status("n1", 100, 60, 0, models);

        let snap = cs.snapshot();
        assert_eq!(snap[0].ram_available_bytes, 60);
        assert_eq!(snap[0].inflight_requests, 0);
        assert!(!snap[0].models.contains_key("m1"));
        assert_eq!(snap[0].models["m2"].state, ModelState::Ready);
    }

    #[test]
    fn test_status_before_hello_still_creates_node() {
        let cs = ClusterState::new();
        cs.update_node_status("n1", 100, 50, 0, HashMap::new());
        assert_eq!(cs.node_count(), 1);
    }

    #[test]
    fn test_snapshot_is_a_deep_copy() {
        let cs = ClusterState::new();
        let mut models = HashMap::new();
        models.insert("m1".to_string(), residency("m1", ModelState::Ready));
        cs.update_node_status("n1", 100, 50, 0, models);

        let before = cs.snapshot();
        cs.update_node_status("n1", 100, 50, 0, HashMap::new());

        // The earlier observation must not see the later update.
        assert!(before[0].models.contains_key("m1"));
        assert!(cs.snapshot()[0].models.is_empty());
    }

    #[test]
    fn test_is_online() {
        let now = SystemTime::now();
        let ttl = Duration::from_secs(5);

        let mut n = NodeSnapshot::new("n1");
        assert!(!n.is_online(now, ttl), "no heartbeat means offline");
        assert!(n.is_online(now, Duration::ZERO), "zero ttl disables check");

        n.last_heartbeat = Some(now - Duration::from_secs(2));
        assert!(n.is_online(now, ttl));

        n.last_heartbeat = Some(now - Duration::from_secs(30));
        assert!(!n.is_online(now, ttl));
    }

    #[test]
    fn test_snapshot_online_filters_stale_nodes() {
        let cs = ClusterState::new();
        cs.upsert_node_hello("fresh", "dev", "", "http://a");
        {
            // Backdate one node's heartbeat past the TTL.
            let mut nodes = cs.nodes.write().unwrap();
            let mut stale = NodeSnapshot::new("stale");
            stale.last_heartbeat = Some(SystemTime::now() - Duration::from_secs(30));
            nodes.insert("stale".to_string(), stale);
        }

        let online = cs.snapshot_online(SystemTime::now(), Duration::from_secs(5));
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].node_id, "fresh");

        // Zero TTL returns everything.
        let all = cs.snapshot_online(SystemTime::now(), Duration::ZERO);
        assert_eq!(all.len(), 2);
    }
}
