//! HTTP client for the worker-local inference engine.
//!
//! The engine is an opaque upstream (llama-server compatible): the agent
//! probes `/models` and `/slots` to build STATUS reports and calls
//! `/models/unload` to execute unload commands. Every call carries a 10 s
//! timeout so a wedged engine cannot stall the agent loop.

use crate::cluster::ModelState;
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const CALL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Deserialize)]
pub struct EngineModelsResponse {
    #[serde(default)]
    pub data: Vec<EngineModel>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineModel {
    pub id: String,
    #[serde(default)]
    pub status: EngineModelStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineModelStatus {
    /// loaded / loading / unloaded, best-effort.
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub failed: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineSlot {
    #[serde(default)]
    pub is_processing: bool,
}

#[derive(Serialize)]
struct UnloadRequest<'a> {
    model: &'a str,
}

/// Map an engine status string to the control-plane residency state.
pub fn map_engine_status(value: &str, failed: bool) -> ModelState {
    if failed {
        return ModelState::Error;
    }
    match value.to_ascii_lowercase().as_str() {
        "loaded" => ModelState::Ready,
        "loading" => ModelState::Loading,
        _ => ModelState::Unloaded,
    }
}

#[derive(Clone)]
pub struct EngineClient {
    pub base_url: String,
    http: reqwest::Client,
}

impl EngineClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(CALL_TIMEOUT)
            .build()
            .context("build engine http client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub async fn get_models(&self) -> Result<EngineModelsResponse> {
        let res = self
            .http
            .get(format!("{}/models", self.base_url))
            .send()
            .await
            .context("engine /models")?;
        if !res.status().is_success() {
            bail!("engine /models returned {}", res.status());
        }
        res.json().await.context("decode engine /models")
    }

    /// Number of busy slots. A non-2xx answer is tolerated as zero because
    /// `/slots` may be disabled on the engine.
    pub async fn get_slots_inflight(&self) -> Result<u32> {
        let res = self
            .http
            .get(format!("{}/slots", self.base_url))
            .send()
            .await
            .context("engine /slots")?;
        if !res.status().is_success() {
            return Ok(0);
        }
        let slots: Vec<EngineSlot> = res.json().await.context("decode engine /slots")?;
        Ok(slots.iter().filter(|s| s.is_processing).count() as u32)
    }

    pub async fn unload_model(&self, model_id: &str) -> Result<()> {
        let res = self
            .http
            .post(format!("{}/models/unload", self.base_url))
            .json(&UnloadRequest { model: model_id })
            .send()
            .await
            .context("engine /models/unload")?;
        if !res.status().is_success() {
            bail!("engine unload returned {}", res.status());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_engine_status() {
        assert_eq!(map_engine_status("loaded", false), ModelState::Ready);
        assert_eq!(map_engine_status("LOADED", false), ModelState::Ready);
        assert_eq!(map_engine_status("loading", false), ModelState::Loading);
        assert_eq!(map_engine_status("unloaded", false), ModelState::Unloaded);
        assert_eq!(map_engine_status("whatever", false), ModelState::Unloaded);
        assert_eq!(map_engine_status("loaded", true), ModelState::Error);
    }

    #[test]
    fn test_models_response_decoding() {
        let json = r#"{
            "data": [
                {"id": "m1", "status": {"value": "loaded", "failed": false}},
                {"id": "m2"}
            ]
        }"#;
        let parsed: EngineModelsResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.data.len(), 2);
        assert_eq!(parsed.data[0].status.value, "loaded");
        assert_eq!(parsed.data[1].status.value, "");
    }

    #[test]
    fn test_base_url_trailing_slash_is_trimmed() {
        let c = EngineClient::new("http://localhost:8080/").unwrap();
        assert_eq!(c.base_url, "http://localhost:8080");
    }
}
