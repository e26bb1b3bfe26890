//! Placement: per-request model -> worker selection.
//!
//! Requests for a READY model route straight to the best-scoring worker.
//! Requests for a model nobody holds go through the per-model gate, which
//! designates at most one loading worker at a time; every other concurrent
//! caller waits on the gate until a STATUS reports the model READY. Without
//! the gate, N concurrent first-touch requests would each pick a worker
//! independently and several workers would load the same large model.

use crate::cluster::{ClusterState, ModelState, NodeSnapshot};
use crate::control::ModelStateNotifier;
use crate::latency::LatencyTracker;
use crate::policy::{ModelPolicy, PolicyStore};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::Notify;
use tracing::debug;

/// Per-inflight-request score penalty; inflight is a proxy for queueing.
const INFLIGHT_PENALTY_BYTES: i64 = 512 * 1024 * 1024;

/// Converts EWMA latency into a score penalty.
/// 8 MiB/ms means 100 ms costs ~800 MiB of apparent headroom.
const LATENCY_PENALTY_BYTES_PER_MS: i64 = 8 * 1024 * 1024;

/// Bonus for workers that already hold the model in any state.
const AFFINITY_BONUS_BYTES: i64 = 1024 * 1024 * 1024;

/// Forced score for workers that cannot fit the model (OOM guard).
const OOM_SCORE: i64 = -1_000_000_000_000_000;

/// Re-check cadence while waiting on a gate, bounding the cost of a wake
/// that was lost between registering and signalling.
const GATE_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PickMode {
    /// The model is READY on the chosen worker (or the caller is the
    /// designated loader); forward immediately.
    Direct,
    /// Another caller is already loading the model on the chosen worker;
    /// block on gate readiness before forwarding.
    Wait,
}

#[derive(Debug, Clone)]
pub struct Placement {
    pub node_id: String,
    pub data_plane_url: String,
    pub mode: PickMode,
}

#[derive(Debug, thiserror::Error)]
pub enum PlacementError {
    #[error("no nodes available")]
    NoNodesAvailable,

    #[error("timeout waiting for model readiness")]
    GateTimeout,
}

/// Per-model coordination object. `loading_node` is the single designated
/// loader; `ready` wakes waiters whenever any worker reports READY.
struct ModelGate {
    loading_node: Mutex<String>,
    ready: Notify,
}

impl ModelGate {
    fn new() -> Self {
        Self {
            loading_node: Mutex::new(String::new()),
            ready: Notify::new(),
        }
    }
}

pub struct PlacementEngine {
    cluster: Arc<ClusterState>,
    latency: Arc<LatencyTracker>,
    policies: Arc<dyn PolicyStore>,
    node_offline_ttl: Duration,
    gate_wait_ceiling: Duration,
    gates: Mutex<HashMap<String, Arc<ModelGate>>>,
}

impl PlacementEngine {
    pub fn new(
        cluster: Arc<ClusterState>,
        latency: Arc<LatencyTracker>,
        policies: Arc<dyn PolicyStore>,
        node_offline_ttl: Duration,
        gate_wait_ceiling: Duration,
    ) -> Self {
        Self {
            cluster,
            latency,
            policies,
            node_offline_ttl,
            gate_wait_ceiling,
            gates: Mutex::new(HashMap::new()),
        }
    }

    fn gate(&self, model_id: &str) -> Arc<ModelGate> {
        let mut gates = self.gates.lock().unwrap();
        gates
            .entry(model_id.to_string())
            .or_insert_with(|| Arc::new(ModelGate::new()))
            .clone()
    }

    /// The currently designated loading worker for `model_id`, if any.
    pub fn loading_node(&self, model_id: &str) -> Option<String> {
        let gate = self.gate(model_id);
        let node = gate.loading_node.lock().unwrap();
        if node.is_empty() { None } else { Some(node.clone()) }
    }

    /// Select a worker for `model_id`.
    ///
    /// A `Wait` result means the caller MUST block on
    /// [`Self::wait_model_ready`] before forwarding.
    pub async fn pick(&self, model_id: &str) -> Result<Placement, PlacementError> {
        let now = SystemTime::now();
        let snap = self.cluster.snapshot_online(now, self.node_offline_ttl);

        let policy = self
            .policies
            .get_policy(model_id)
            .await
            .unwrap_or_else(|| ModelPolicy::empty(model_id));

        // 1) Any worker already READY for this model wins outright.
        let ready: Vec<&NodeSnapshot> = snap
            .iter()
            .filter(|n| !n.data_plane_url.is_empty())
            .filter(|n| {
                n.models
                    .get(model_id)
                    .map(|m| m.state == ModelState::Ready)
                    .unwrap_or(false)
            })
            .collect();

        if let Some(best) = pick_best_by_score(&ready, model_id, &policy, &self.latency) {
            metrics::counter!("fleetmux_placement_total", "mode" => "direct").increment(1);
            return Ok(Placement {
                node_id: best.node_id.clone(),
                data_plane_url: best.data_plane_url.clone(),
                mode: PickMode::Direct,
            });
        }

        // 2) Gate-based loader coordination.
        let gate = self.gate(model_id);
        let mut loading_node = gate.loading_node.lock().unwrap();

        if !loading_node.is_empty() {
            if let Some(n) = snap
                .iter()
                .find(|n| n.node_id == *loading_node && !n.data_plane_url.is_empty())
            {
                metrics::counter!("fleetmux_placement_total", "mode" => "wait").increment(1);
                return Ok(Placement {
                    node_id: n.node_id.clone(),
                    data_plane_url: n.data_plane_url.clone(),
                    mode: PickMode::Wait,
                });
            }
            // The designated loader went away; re-select below.
            loading_node.clear();
        }

        // 3) Designate the best eligible worker as the loader. The first
        //    forwarded request makes the worker's engine start loading; no
        //    explicit load command exists.
        let eligible: Vec<&NodeSnapshot> = snap
            .iter()
            .filter(|n| !n.data_plane_url.is_empty())
            .collect();

        let best = pick_best_by_score(&eligible, model_id, &policy, &self.latency)
            .ok_or(PlacementError::NoNodesAvailable)?;

        *loading_node = best.node_id.clone();
        debug!(model_id, node_id = %best.node_id, "designated loading node");

        metrics::counter!("fleetmux_placement_total", "mode" => "load").increment(1);
        Ok(Placement {
            node_id: best.node_id.clone(),
            data_plane_url: best.data_plane_url.clone(),
            mode: PickMode::Direct,
        })
    }

    /// Block until `node_id` reports `model_id` READY, the ceiling expires,
    /// or the caller is cancelled. Each wake re-checks the cluster state, so
    /// a READY on a different worker costs one extra loop at most.
    pub async fn wait_model_ready(
        &self,
        model_id: &str,
        node_id: &str,
    ) -> Result<(), PlacementError> {
        let gate = self.gate(model_id);
        let deadline = tokio::time::Instant::now() + self.gate_wait_ceiling;

        loop {
            // Register for the next READY before checking the predicate, so
            // a signal between check and await is not missed.
            let notified = gate.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_ready_on_node(model_id, node_id) {
                return Ok(());
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                metrics::counter!("fleetmux_gate_timeouts_total").increment(1);
                return Err(PlacementError::GateTimeout);
            }

            let wait = GATE_POLL_INTERVAL.min(deadline - now);
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    fn is_ready_on_node(&self, model_id: &str, node_id: &str) -> bool {
        self.cluster.snapshot().iter().any(|n| {
            n.node_id == node_id
                && n.models
                    .get(model_id)
                    .map(|m| m.state == ModelState::Ready)
                    .unwrap_or(false)
        })
    }
}

impl ModelStateNotifier for PlacementEngine {
    /// Invoked by the control service on every STATUS residency. Only READY
    /// does work: it releases the gate and wakes all current waiters.
    fn notify_model_state(&self, node_id: &str, model_id: &str, state: ModelState) {
        if state != ModelState::Ready {
            return;
        }
        let gate = self.gate(model_id);
        gate.loading_node.lock().unwrap().clear();
        gate.ready.notify_waiters();
        debug!(node_id, model_id, "model ready, gate released");
    }
}

/// Comparable score where higher is better.
fn score_node(
    n: &NodeSnapshot,
    model_id: &str,
    policy: &ModelPolicy,
    latency: &LatencyTracker,
) -> i64 {
    // OOM guard: a worker that cannot fit the model is effectively excluded.
    if policy.ram_required_bytes > 0 && n.ram_available_bytes < policy.ram_required_bytes {
        return OOM_SCORE;
    }

    let ram = n.ram_available_bytes as i64;
    let inflight_penalty = n.inflight_requests as i64 * INFLIGHT_PENALTY_BYTES;

    let latency_penalty = latency
        .get(&n.node_id)
        .filter(|l| l.ewma_ms > 0.0)
        .map(|l| l.ewma_ms as i64 * LATENCY_PENALTY_BYTES_PER_MS)
        .unwrap_or(0);

    // Warm affinity: any residency of the model, READY or not.
    let affinity = if n.models.contains_key(model_id) {
        AFFINITY_BONUS_BYTES
    } else {
        0
    };

    ram - inflight_penalty - latency_penalty + affinity
}

fn pick_best_by_score<'a>(
    nodes: &[&'a NodeSnapshot],
    model_id: &str,
    policy: &ModelPolicy,
    latency: &LatencyTracker,
) -> Option<&'a NodeSnapshot> {
    let mut best: Option<&NodeSnapshot> = None;
    let mut best_score = 0i64;

    for &n in nodes {
        let s = score_node(n, model_id, policy, latency);
        match best {
            None => {
                best = Some(n);
                best_score = s;
            }
            Some(_) if s > best_score => {
                best = Some(n);
                best_score = s;
            }
            Some(b) if s == best_score => {
                // Stable tie-break: fewer inflight, then lower node id.
                if n.inflight_requests < b.inflight_requests
                    || (n.inflight_requests == b.inflight_requests && n.node_id < b.node_id)
                {
                    best = Some(n);
                }
            }
            _ => {}
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ModelResidency;
    use crate::policy::MemoryPolicyStore;

    fn residency(model_id: &str, state: ModelState) -> (String, ModelResidency) {
        (
            model_id.to_string(),
            ModelResidency {
                model_id: model_id.to_string(),
                state,
                loaded_since: Some(SystemTime::now()),
                last_seen: SystemTime::now(),
            },
        )
    }

    struct Harness {
        cluster: Arc<ClusterState>,
        latency: Arc<LatencyTracker>,
        policies: Arc<MemoryPolicyStore>,
        engine: Arc<PlacementEngine>,
    }

    fn harness_with(ttl: Duration, ceiling: Duration) -> Harness {
        let cluster = Arc::new(ClusterState::new());
        let latency = Arc::new(LatencyTracker::new(0.2));
        let policies = Arc::new(MemoryPolicyStore::new());
        let engine = Arc::new(PlacementEngine::new(
            cluster.clone(),
            latency.clone(),
            policies.clone(),
            ttl,
            ceiling,
        ));
        Harness {
            cluster,
            latency,
            policies,
            engine,
        }
    }

    fn harness() -> Harness {
        harness_with(Duration::from_secs(5), Duration::from_secs(180))
    }

    fn add_node(
        h: &Harness,
        node_id: &str,
        ram_avail: u64,
        inflight: u32,
        models: Vec<(String, ModelResidency)>,
    ) {
        h.cluster
            .upsert_node_hello(node_id, "dev", "", &format!("http://{node_id}:8080"));
        h.cluster.update_node_status(
            node_id,
            64 << 30,
            ram_avail,
            inflight,
            models.into_iter().collect(),
        );
    }

    #[tokio::test]
    async fn test_ready_model_routes_direct() {
        let h = harness();
        add_node(&h, "a", 8 << 30, 0, vec![residency("m1", ModelState::Ready)]);

        let p = h.engine.pick("m1").await.unwrap();
        assert_eq!(p.node_id, "a");
        assert_eq!(p.mode, PickMode::Direct);
        assert_eq!(p.data_plane_url, "http://a:8080");
        // Direct-to-ready does not designate a loader.
        assert!(h.engine.loading_node("m1").is_none());
    }

    #[tokio::test]
    async fn test_no_nodes_available() {
        let h = harness();
        assert!(matches!(
            h.engine.pick("m1").await,
            Err(PlacementError::NoNodesAvailable)
        ));
    }

    #[tokio::test]
    async fn test_node_without_data_plane_url_is_ineligible() {
        let h = harness();
        h.cluster.upsert_node_hello("a", "dev", "", "");
        h.cluster
            .update_node_status("a", 64 << 30, 32 << 30, 0, HashMap::new());

        assert!(matches!(
            h.engine.pick("m1").await,
            Err(PlacementError::NoNodesAvailable)
        ));
    }

    #[tokio::test]
    async fn test_oom_guard_excludes_small_node() {
        let h = harness();
        add_node(&h, "small", 1 << 30, 0, vec![]);
        add_node(&h, "big", 10 << 30, 0, vec![]);
        h.policies
            .upsert_policy(ModelPolicy {
                model_id: "m3".into(),
                ram_required_bytes: 4 << 30,
                ..ModelPolicy::empty("m3")
            })
            .await;

        let p = h.engine.pick("m3").await.unwrap();
        assert_eq!(p.node_id, "big");
    }

    #[tokio::test]
    async fn test_affinity_prefers_warm_node() {
        let h = harness();
        // "warm" holds an unloaded residency of m1 and has slightly less RAM.
        add_node(
            &h,
            "warm",
            (8u64 << 30) - (1 << 28),
            0,
            vec![residency("m1", ModelState::Unloaded)],
        );
        add_node(&h, "cold", 8 << 30, 0, vec![]);

        let p = h.engine.pick("m1").await.unwrap();
        assert_eq!(p.node_id, "warm", "1 GiB affinity beats 256 MiB of RAM");
    }

    #[tokio::test]
    async fn test_latency_penalty_shifts_choice() {
        let h = harness();
        add_node(&h, "slow", 8 << 30, 0, vec![]);
        add_node(&h, "fast", (8u64 << 30) - (1 << 28), 0, vec![]);
        // 100 ms EWMA costs ~800 MiB, outweighing slow's 256 MiB advantage.
        h.latency.observe_ok("slow", Duration::from_millis(100));

        let p = h.engine.pick("m1").await.unwrap();
        assert_eq!(p.node_id, "fast");
    }

    #[tokio::test]
    async fn test_tie_break_inflight_then_node_id() {
        let h = harness();
        add_node(&h, "b", 8 << 30, 0, vec![]);
        add_node(&h, "a", 8 << 30, 0, vec![]);
        let p = h.engine.pick("m1").await.unwrap();
        assert_eq!(p.node_id, "a", "equal scores break on node id");

        let h = harness();
        add_node(&h, "a", 8 << 30, 0, vec![residency("x", ModelState::Ready)]);
        add_node(&h, "b", 8 << 30, 0, vec![residency("x", ModelState::Ready)]);
        // Equal inflight would pick "a"; inflight wins over node id when the
        // scores still tie (inflight also penalizes the score, so give both
        // the same inflight-derived score by bumping RAM to compensate).
        let mut models = HashMap::new();
        models.insert("x".to_string(), residency("x", ModelState::Ready).1);
        h.cluster.update_node_status(
            "a",
            64 << 30,
            (8u64 << 30) + 512 * 1024 * 1024,
            1,
            models,
        );
        let p = h.engine.pick("x").await.unwrap();
        assert_eq!(p.node_id, "b", "fewer inflight wins the tie");
    }

    #[tokio::test]
    async fn test_pick_is_deterministic() {
        let h = harness();
        add_node(&h, "a", 8 << 30, 0, vec![]);
        add_node(&h, "b", 16 << 30, 0, vec![]);

        let first = h.engine.pick("m1").await.unwrap().node_id;
        for _ in 0..5 {
            // Repeated picks converge on the same worker (now via the gate).
            assert_eq!(h.engine.pick("m1").await.unwrap().node_id, first);
        }
    }

    #[tokio::test]
    async fn test_cold_model_coalesces_on_one_loader() {
        let h = harness();
        add_node(&h, "a", 16 << 30, 0, vec![]);
        add_node(&h, "b", 16 << 30, 0, vec![]);

        let first = h.engine.pick("m2").await.unwrap();
        assert_eq!(first.mode, PickMode::Direct);
        assert_eq!(h.engine.loading_node("m2").as_deref(), Some(first.node_id.as_str()));

        // Every subsequent caller waits on the same worker.
        for _ in 0..3 {
            let next = h.engine.pick("m2").await.unwrap();
            assert_eq!(next.mode, PickMode::Wait);
            assert_eq!(next.node_id, first.node_id);
        }
    }

    #[tokio::test]
    async fn test_gates_are_per_model() {
        let h = harness();
        add_node(&h, "a", 16 << 30, 0, vec![]);

        let p1 = h.engine.pick("m1").await.unwrap();
        let p2 = h.engine.pick("m2").await.unwrap();
        // A loader designated for m1 does not force m2 into Wait.
        assert_eq!(p1.mode, PickMode::Direct);
        assert_eq!(p2.mode, PickMode::Direct);
    }

    #[tokio::test]
    async fn test_offline_loader_is_cleared_and_reselected() {
        let h = harness_with(Duration::from_millis(50), Duration::from_secs(180));
        add_node(&h, "b", 16 << 30, 0, vec![]);

        let first = h.engine.pick("m1").await.unwrap();
        assert_eq!(first.node_id, "b");

        // Let b's heartbeat expire, then bring up a fresh worker.
        tokio::time::sleep(Duration::from_millis(80)).await;
        add_node(&h, "a", 16 << 30, 0, vec![]);

        let second = h.engine.pick("m1").await.unwrap();
        assert_eq!(second.mode, PickMode::Direct, "stale loader was cleared");
        assert_eq!(second.node_id, "a");
        assert_eq!(h.engine.loading_node("m1").as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_heartbeat_expiry_excludes_node_from_placement() {
        let h = harness_with(Duration::from_millis(50), Duration::from_secs(180));
        add_node(&h, "a", 8 << 30, 0, vec![residency("m1", ModelState::Ready)]);
        tokio::time::sleep(Duration::from_millis(80)).await;
        add_node(&h, "b", 8 << 30, 0, vec![]);

        // m1 is only resident on the stale worker; placement must not use it.
        let p = h.engine.pick("m1").await.unwrap();
        assert_eq!(p.node_id, "b");
    }

    #[tokio::test]
    async fn test_ready_notify_wakes_waiter() {
        let h = harness();
        add_node(&h, "a", 16 << 30, 0, vec![]);
        let p = h.engine.pick("m1").await.unwrap();

        let engine = h.engine.clone();
        let node = p.node_id.clone();
        let waiter =
            tokio::spawn(async move { engine.wait_model_ready("m1", &node).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        // STATUS arrives: m1 READY on a. Ingestion order per the control
        // service: cluster first, then the notifier.
        add_node(&h, "a", 16 << 30, 0, vec![residency("m1", ModelState::Ready)]);
        h.engine.notify_model_state("a", "m1", ModelState::Ready);

        waiter.await.unwrap().unwrap();
        assert!(h.engine.loading_node("m1").is_none(), "gate released");
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_already_ready() {
        let h = harness();
        add_node(&h, "a", 16 << 30, 0, vec![residency("m1", ModelState::Ready)]);
        h.engine.wait_model_ready("m1", "a").await.unwrap();
    }

    #[tokio::test]
    async fn test_gate_timeout() {
        let h = harness_with(Duration::from_secs(5), Duration::from_millis(100));
        add_node(&h, "a", 16 << 30, 0, vec![]);

        let err = h.engine.wait_model_ready("m1", "a").await.unwrap_err();
        assert!(matches!(err, PlacementError::GateTimeout));
    }

    #[tokio::test]
    async fn test_non_ready_notify_keeps_gate() {
        let h = harness();
        add_node(&h, "a", 16 << 30, 0, vec![]);
        let p = h.engine.pick("m1").await.unwrap();

        h.engine.notify_model_state("a", "m1", ModelState::Loading);
        assert_eq!(h.engine.loading_node("m1").as_deref(), Some(p.node_id.as_str()));
    }
}
