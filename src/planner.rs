//! Maintenance planner: TTL and pressure-driven unloads.
//!
//! A fixed-period loop snapshots the cluster each tick and issues unload
//! commands through the control plane. Both passes skip workers with
//! requests in flight; unloading a model mid-request would drop responses.
//! Commands are fire-and-forget: the next STATUS is what actually changes
//! placement.

use crate::activity::{ActivityLog, Event, EventType};
use crate::cluster::{ClusterState, ModelState, NodeSnapshot};
use crate::control::ControlError;
use crate::policy::PolicyStore;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Narrow capability the planner holds into the control plane.
pub trait UnloadSender: Send + Sync {
    fn send_unload(
        &self,
        node_id: &str,
        request_id: &str,
        model_id: &str,
    ) -> Result<(), ControlError>;
}

impl UnloadSender for crate::control::ControlService {
    fn send_unload(
        &self,
        node_id: &str,
        request_id: &str,
        model_id: &str,
    ) -> Result<(), ControlError> {
        crate::control::ControlService::send_unload(self, node_id, request_id, model_id)
    }
}

pub struct Planner {
    pub cluster: Arc<ClusterState>,
    pub policies: Arc<dyn PolicyStore>,
    pub commands: Arc<dyn UnloadSender>,
    pub activity: Option<Arc<ActivityLog>>,

    /// Pressure threshold: unloads start when available RAM drops below
    /// this. Zero disables the pressure pass.
    pub min_free_bytes: u64,

    /// Tick frequency.
    pub interval: Duration,

    /// Workers with heartbeats older than this are left alone.
    pub node_offline_ttl: Duration,
}

struct EvictionCandidate {
    model_id: String,
    priority: i32,
    loaded_since: Option<SystemTime>,
    ram_bytes: u64,
}

impl Planner {
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                self.tick().await;
            }
        })
    }

    pub async fn tick(&self) {
        let now = SystemTime::now();
        let nodes = self.cluster.snapshot_online(now, self.node_offline_ttl);

        self.ttl_pass(&nodes, now).await;
        self.pressure_pass(&nodes).await;
    }

    /// Unload READY models whose idle TTL has expired.
    async fn ttl_pass(&self, nodes: &[NodeSnapshot], now: SystemTime) {
        for n in nodes {
            if n.inflight_requests > 0 {
                continue;
            }
            for m in n.models.values() {
                if m.state != ModelState::Ready {
                    continue;
                }
                let Some(policy) = self.policies.get_policy(&m.model_id).await else {
                    continue;
                };
                if policy.ttl_secs <= 0 || policy.pinned {
                    continue;
                }
                // Unknown load time disables the check rather than
                // triggering a false-positive unload on stale data.
                let Some(loaded_since) = m.loaded_since else {
                    continue;
                };

                let age = now.duration_since(loaded_since).unwrap_or(Duration::ZERO);
                if age >= Duration::from_secs(policy.ttl_secs as u64) {
                    self.try_unload(&n.node_id, &m.model_id, "ttl");
                }
            }
        }
    }

    /// Evict models on workers under the free-RAM threshold.
    async fn pressure_pass(&self, nodes: &[NodeSnapshot]) {
        if self.min_free_bytes == 0 {
            return;
        }
        for n in nodes {
            if n.ram_available_bytes >= self.min_free_bytes {
                continue;
            }
            if n.inflight_requests > 0 {
                continue;
            }
            let need = self.min_free_bytes - n.ram_available_bytes;
            self.relieve_pressure(n, need).await;
        }
    }

    async fn relieve_pressure(&self, n: &NodeSnapshot, need_bytes: u64) {
        let mut candidates = Vec::new();
        for m in n.models.values() {
            if m.state != ModelState::Ready {
                continue;
            }
            let policy = self.policies.get_policy(&m.model_id).await;
            if policy.as_ref().map(|p| p.pinned).unwrap_or(false) {
                continue;
            }
            candidates.push(EvictionCandidate {
                model_id: m.model_id.clone(),
                priority: policy.as_ref().map(|p| p.priority).unwrap_or(0),
                loaded_since: m.loaded_since,
                ram_bytes: policy.as_ref().map(|p| p.ram_required_bytes).unwrap_or(0),
            });
        }

        // Low priority goes first, then oldest, unknown load times last,
        // model id as the final stable key.
        candidates.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| match (a.loaded_since, b.loaded_since) {
                    (Some(ta), Some(tb)) => ta.cmp(&tb),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                })
                .then_with(|| a.model_id.cmp(&b.model_id))
        });

        // Freed bytes are estimated from the policy RAM hint. When every
        // estimate is zero the loop would never satisfy `need`, so issue a
        // single unload this tick and let the next tick re-evaluate.
        let total_estimate: u64 = candidates.iter().map(|c| c.ram_bytes).sum();
        let mut freed = 0u64;
        for c in &candidates {
            self.try_unload(&n.node_id, &c.model_id, "pressure");
            if total_estimate == 0 {
                break;
            }
            freed += c.ram_bytes;
            if freed >= need_bytes {
                break;
            }
        }
    }

    fn try_unload(&self, node_id: &str, model_id: &str, reason: &str) {
        let request_id = format!("unload-{}-{}", reason, unix_nanos());
        if let Err(e) = self.commands.send_unload(node_id, &request_id, model_id) {
            warn!(node_id, model_id, reason, error = %e, "unload failed");
            return;
        }

        info!(node_id, model_id, reason, "unload requested");
        metrics::counter!("fleetmux_unloads_total", "reason" => reason.to_string())
            .increment(1);

        if let Some(ref activity) = self.activity {
            let event_type = match reason {
                "ttl" => EventType::TtlUnload,
                "pressure" => EventType::PressureUnload,
                _ => EventType::ManualUnload,
            };
            activity.add(Event {
                at: SystemTime::now(),
                event_type,
                node_id: node_id.to_string(),
                model_id: model_id.to_string(),
                note: reason.to_string(),
            });
        }
    }
}

fn unix_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}
