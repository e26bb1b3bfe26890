//! Client-facing HTTP API.
//!
//! Thin dispatch: extract the `model` field, ask placement for a worker,
//! wait on the gate when told to, then hand the request to the proxy. The
//! inference endpoints share one handler because they differ only in path.

use crate::cluster::ClusterState;
use crate::control::ControlService;
use crate::placement::{PickMode, PlacementEngine};
use crate::proxy::ProxyClient;
use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, Response, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use http_body_util::BodyExt;
use serde_json::json;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

#[derive(Clone)]
pub struct ApiState {
    pub cluster: Arc<ClusterState>,
    pub placement: Arc<PlacementEngine>,
    pub proxy: Arc<ProxyClient>,
    pub control: Arc<ControlService>,
}

pub fn api_router(state: ApiState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(completions))
        .route("/v1/completions", post(completions))
        .route("/v1/embeddings", post(completions))
        .route("/v1/models", get(list_models))
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// Shared handler for the OpenAI-shaped inference endpoints. Bodies are
/// forwarded unchanged; only `model` is read out of them.
async fn completions(State(state): State<ApiState>, req: Request<Body>) -> Response<Body> {
    let start = Instant::now();
    let (parts, body) = req.into_parts();

    let body_bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(error = %e, "failed to read request body");
            return text_response(StatusCode::BAD_REQUEST, "failed to read request body");
        }
    };

    let model_id = match extract_model(&body_bytes) {
        Ok(m) => m,
        Err(msg) => return text_response(StatusCode::BAD_REQUEST, msg),
    };

    let placement = match state.placement.pick(&model_id).await {
        Ok(p) => p,
        Err(e) => {
            warn!(model = %model_id, error = %e, "placement failed");
            return text_response(StatusCode::SERVICE_UNAVAILABLE, &e.to_string());
        }
    };

    if placement.mode == PickMode::Wait {
        debug!(model = %model_id, node = %placement.node_id, "waiting on model gate");
        if state
            .placement
            .wait_model_ready(&model_id, &placement.node_id)
            .await
            .is_err()
        {
            return text_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "model is still loading (timeout)",
            );
        }
    }

    metrics::counter!("fleetmux_requests_total", "path" => parts.uri.path().to_string())
        .increment(1);

    let response = state
        .proxy
        .forward(
            &placement.node_id,
            &placement.data_plane_url,
            Request::from_parts(parts, Body::empty()),
            body_bytes,
        )
        .await;

    metrics::histogram!("fleetmux_request_ttfb_seconds").record(start.elapsed().as_secs_f64());
    response
}

/// Pull a non-empty `model` string out of the JSON body.
fn extract_model(body: &Bytes) -> Result<String, &'static str> {
    let json: serde_json::Value =
        serde_json::from_slice(body).map_err(|_| "invalid json body")?;
    match json.get("model").and_then(|v| v.as_str()) {
        Some(model) if !model.is_empty() => Ok(model.to_string()),
        _ => Err("missing model field"),
    }
}

/// Union of residency keys across all known workers, OpenAI list shape.
async fn list_models(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let mut ids: Vec<String> = state
        .cluster
        .snapshot()
        .iter()
        .flat_map(|n| n.models.keys().cloned())
        .collect();
    ids.sort_by_key(|id| id.to_lowercase());
    ids.dedup();

    let created = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let data: Vec<_> = ids
        .into_iter()
        .map(|id| {
            json!({
                "id": id,
                "object": "model",
                "owned_by": "fleetmux",
                "created": created,
            })
        })
        .collect();

    Json(json!({ "object": "list", "data": data }))
}

async fn healthz(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "nodes": state.cluster.node_count(),
        "sessions": state.control.session_count(),
    }))
}

fn text_response(status: StatusCode, message: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(message.to_string()))
        .unwrap()
}
