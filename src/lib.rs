//! # fleetmux
//!
//! Control-plane and data-plane core of a router for a fleet of single-host
//! inference workers. Each worker runs a local inference engine plus an
//! agent that keeps a persistent session with the router; the router accepts
//! OpenAI-shaped requests, picks a worker that holds (or can load) the
//! requested model, and streams the response back.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        fleetmux                          │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │ HTTP front (/v1/*)                                 │  │
//! │  │ - extracts model from request                      │  │
//! │  │ - asks placement for (worker, mode)                │  │
//! │  │ - waits on the model gate when told to             │  │
//! │  └────────────────────────────────────────────────────┘  │
//! │             │                          ▲                 │
//! │  ┌──────────▼──────────┐   ┌───────────┴─────────────┐   │
//! │  │ Placement engine    │   │ Control service         │   │
//! │  │ - scoring           │   │ - WS session per worker │   │
//! │  │ - load-once gate    │◄──│ - STATUS ingestion      │   │
//! │  └─────────────────────┘   │ - unload / ping         │   │
//! │             │              └───────────┬─────────────┘   │
//! │  ┌──────────▼──────────┐   ┌───────────▼─────────────┐   │
//! │  │ Streaming proxy     │   │ Cluster state + planner │   │
//! │  └─────────────────────┘   └─────────────────────────┘   │
//! │      │                                                   │
//! │      ▼                                                   │
//! │  [worker-1:8080]    [worker-2:8080]    [worker-3:8080]   │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod activity;
pub mod api;
pub mod cluster;
pub mod config;
pub mod control;
pub mod engine;
pub mod latency;
pub mod placement;
pub mod planner;
pub mod policy;
pub mod protocol;
pub mod proxy;
pub mod serve;
pub mod telemetry;

pub use activity::ActivityLog;
pub use cluster::{ClusterState, ModelResidency, ModelState, NodeSnapshot};
pub use config::Config;
pub use control::{ControlError, ControlService, ModelStateNotifier};
pub use latency::LatencyTracker;
pub use placement::{PickMode, Placement, PlacementEngine, PlacementError};
pub use planner::Planner;
pub use policy::{MemoryPolicyStore, ModelPolicy, PolicyStore};
pub use proxy::ProxyClient;

use axum::Router;
use std::sync::Arc;
use tracing::info;

/// All long-lived components, explicitly constructed and handed into the
/// HTTP and control wiring. State is soft; teardown flushes nothing.
pub struct App {
    pub router: Router,
    pub cluster: Arc<ClusterState>,
    pub latency: Arc<LatencyTracker>,
    pub placement: Arc<PlacementEngine>,
    pub control: Arc<ControlService>,
    pub planner: Arc<Planner>,
    pub activity: Arc<ActivityLog>,
}

/// Build the complete router stack.
///
/// The control service holds only the placement engine's notifier
/// capability, and the planner only the control service's unload capability;
/// neither sees the other's full type.
pub fn build_app(config: &Config, policies: Arc<dyn PolicyStore>) -> App {
    info!(
        node_offline_secs = config.node_offline_secs,
        planner_interval_secs = config.planner_interval_secs,
        min_free_ram_mb = config.min_free_ram_mb,
        "building fleetmux"
    );

    let cluster = Arc::new(ClusterState::new());
    let latency = Arc::new(LatencyTracker::new(config.ewma_alpha));
    let activity = Arc::new(ActivityLog::new(config.activity_capacity));

    let placement = Arc::new(PlacementEngine::new(
        cluster.clone(),
        latency.clone(),
        policies.clone(),
        config.node_offline_ttl(),
        config.gate_wait_ceiling(),
    ));

    let control = Arc::new(ControlService::new(cluster.clone(), placement.clone()));

    let planner = Arc::new(Planner {
        cluster: cluster.clone(),
        policies,
        commands: control.clone(),
        activity: Some(activity.clone()),
        min_free_bytes: config.min_free_bytes(),
        interval: config.planner_interval(),
        node_offline_ttl: config.node_offline_ttl(),
    });

    let proxy = Arc::new(ProxyClient::new(latency.clone()));

    let router = api::api_router(api::ApiState {
        cluster: cluster.clone(),
        placement: placement.clone(),
        proxy,
        control: control.clone(),
    })
    .merge(control.clone().router());

    App {
        router,
        cluster,
        latency,
        placement,
        control,
        planner,
        activity,
    }
}
