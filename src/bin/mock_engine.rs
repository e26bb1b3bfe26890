//! mock-engine - a fake single-host inference engine.
//!
//! Stands in for a llama-server-compatible engine during development and
//! integration testing: serves the probe endpoints the agent polls
//! (`/models`, `/slots`), the unload endpoint the router drives
//! (`/models/unload`), and OpenAI-shaped `/v1/*` routes that lazily "load"
//! a model with a configurable delay before answering.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "mock-engine")]
#[command(about = "Mock inference engine for fleetmux development")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8090)]
    port: u16,

    /// Simulated model load time in milliseconds
    #[arg(long, default_value_t = 2000)]
    load_ms: u64,

    /// Models that start out loaded (repeatable)
    #[arg(long)]
    preload: Vec<String>,
}

#[derive(Clone, Copy, PartialEq)]
enum Residency {
    Loading,
    Loaded,
}

#[derive(Clone)]
struct EngineState {
    models: Arc<RwLock<HashMap<String, Residency>>>,
    load_ms: u64,
}

#[derive(Serialize)]
struct ModelsResponse {
    data: Vec<ModelEntry>,
}

#[derive(Serialize)]
struct ModelEntry {
    id: String,
    status: ModelStatus,
}

#[derive(Serialize)]
struct ModelStatus {
    value: &'static str,
    failed: bool,
}

#[derive(Serialize)]
struct Slot {
    is_processing: bool,
}

#[derive(Deserialize)]
struct UnloadRequest {
    model: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let mut initial = HashMap::new();
    for model in &args.preload {
        initial.insert(model.clone(), Residency::Loaded);
    }

    let state = EngineState {
        models: Arc::new(RwLock::new(initial)),
        load_ms: args.load_ms,
    };

    let app = Router::new()
        .route("/models", get(list_models))
        .route("/slots", get(list_slots))
        .route("/models/unload", post(unload_model))
        .route("/v1/chat/completions", post(completion))
        .route("/v1/completions", post(completion))
        .route("/v1/embeddings", post(completion))
        .with_state(state);

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, load_ms = args.load_ms, "mock engine listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn list_models(State(state): State<EngineState>) -> Json<ModelsResponse> {
    let models = state.models.read().await;
    let data = models
        .iter()
        .map(|(id, residency)| ModelEntry {
            id: id.clone(),
            status: ModelStatus {
                value: match residency {
                    Residency::Loading => "loading",
                    Residency::Loaded => "loaded",
                },
                failed: false,
            },
        })
        .collect();
    Json(ModelsResponse { data })
}

async fn list_slots() -> Json<Vec<Slot>> {
    Json(vec![Slot {
        is_processing: false,
    }])
}

async fn unload_model(
    State(state): State<EngineState>,
    Json(body): Json<UnloadRequest>,
) -> StatusCode {
    let removed = state.models.write().await.remove(&body.model).is_some();
    info!(model = %body.model, removed, "unload");
    StatusCode::OK
}

/// Lazily load the requested model, then answer with a canned completion.
async fn completion(
    State(state): State<EngineState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let model = body
        .get("model")
        .and_then(|v| v.as_str())
        .ok_or((StatusCode::BAD_REQUEST, "missing model".to_string()))?
        .to_string();

    let needs_load = {
        let mut models = state.models.write().await;
        match models.get(&model) {
            Some(Residency::Loaded) => false,
            _ => {
                models.insert(model.clone(), Residency::Loading);
                true
            }
        }
    };

    if needs_load {
        info!(model = %model, "loading");
        tokio::time::sleep(Duration::from_millis(state.load_ms)).await;
        state
            .models
            .write()
            .await
            .insert(model.clone(), Residency::Loaded);
    } else {
        // Wait out a concurrent loader.
        while state.models.read().await.get(&model) == Some(&Residency::Loading) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    Ok(Json(serde_json::json!({
        "id": "mock-cmpl-1",
        "object": "chat.completion",
        "model": model,
        "choices": [{"index": 0, "message": {"role": "assistant", "content": "hello from mock-engine"}}]
    })))
}
