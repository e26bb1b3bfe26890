//! fleetmux-agent - worker-side control-plane agent.
//!
//! Runs next to a single inference engine. Keeps a WebSocket session to the
//! router: announces itself with `hello`, pushes `status` on a heartbeat
//! tick (and immediately on `ping`), and executes `unload_model` commands by
//! calling the engine's unload endpoint, answering with an `ack`.

use anyhow::{Context, Result, bail};
use clap::Parser;
use fleetmux::cluster::ModelState;
use fleetmux::engine::{EngineClient, map_engine_status};
use fleetmux::protocol::{
    CommandAck, NodeHello, NodeMessage, NodeStatus, ResidencyReport, ServerMessage,
};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fleetmux-agent")]
#[command(about = "Worker-side agent for the fleetmux router")]
struct Args {
    /// Stable node identifier, unique across the fleet
    #[arg(long, env = "NODE_ID")]
    node_id: String,

    /// Router control-plane base URL, e.g. ws://router:8080
    #[arg(long, env = "SERVER_URL")]
    server_url: String,

    /// Local inference engine base URL (agent-side probing)
    #[arg(long, env = "ENGINE_BASE_URL")]
    engine_base_url: String,

    /// Externally reachable data-plane URL (defaults to the engine URL)
    #[arg(long, env = "DATA_PLANE_URL")]
    data_plane_url: Option<String>,

    /// Path to meminfo (mount the host's /proc/meminfo when containerized)
    #[arg(long, env = "HOST_MEMINFO_PATH", default_value = "/proc/meminfo")]
    meminfo_path: String,

    #[arg(long, env = "HEARTBEAT_SECONDS", default_value_t = 1)]
    heartbeat_secs: u64,

    #[arg(long, env = "POLL_MODELS_SECONDS", default_value_t = 5)]
    poll_models_secs: u64,

    #[arg(long, env = "POLL_SLOTS_SECONDS", default_value_t = 1)]
    poll_slots_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let engine = EngineClient::new(&args.engine_base_url)?;

    info!(node_id = %args.node_id, server = %args.server_url, "starting fleetmux-agent");

    loop {
        if let Err(e) = run_session(&args, &engine).await {
            warn!(error = %e, "control session ended");
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}

async fn run_session(args: &Args, engine: &EngineClient) -> Result<()> {
    let url = format!("{}/control/stream", args.server_url.trim_end_matches('/'));
    let (socket, _) = connect_async(url.as_str()).await.context("connect control stream")?;
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<NodeMessage>();

    let data_plane_url = args
        .data_plane_url
        .clone()
        .unwrap_or_else(|| args.engine_base_url.clone());
    out_tx
        .send(NodeMessage::Hello(NodeHello {
            node_id: args.node_id.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            engine_base_url: args.engine_base_url.clone(),
            data_plane_url,
        }))
        .ok();

    // Writer task: the single place frames are written.
    let mut writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(t) => t,
                Err(e) => {
                    warn!(error = %e, "failed to encode frame");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // Ping asks for an immediate STATUS; capacity 1 coalesces bursts.
    let (ping_tx, mut ping_rx) = mpsc::channel::<()>(1);

    // Receive loop: commands and pings.
    let recv_engine = engine.clone();
    let recv_out = out_tx.clone();
    let mut recv = tokio::spawn(async move {
        while let Some(frame) = ws_rx.next().await {
            let text = match frame {
                Ok(Message::Text(t)) => t,
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => continue,
            };
            let msg = match serde_json::from_str::<ServerMessage>(&text) {
                Ok(m) => m,
                Err(_) => continue,
            };
            match msg {
                ServerMessage::ServerHello(h) => {
                    info!(server_version = %h.server_version, "connected to router");
                }
                ServerMessage::UnloadModel(cmd) => {
                    info!(model_id = %cmd.model_id, request_id = %cmd.request_id, "unload command");
                    let result = recv_engine.unload_model(&cmd.model_id).await;
                    let ack = CommandAck {
                        request_id: cmd.request_id,
                        ok: result.is_ok(),
                        error: result.err().map(|e| e.to_string()).unwrap_or_default(),
                    };
                    let _ = recv_out.send(NodeMessage::Ack(ack));
                }
                ServerMessage::Ping(_) => {
                    let _ = ping_tx.try_send(());
                }
                ServerMessage::Unknown => {}
            }
        }
    });

    let mut residencies: Vec<ResidencyReport> = Vec::new();
    let mut loaded_at: HashMap<String, i64> = HashMap::new();
    let mut inflight: u32 = 0;

    // Prime initial reads so the first STATUS is not empty.
    refresh_models(engine, &mut residencies, &mut loaded_at).await;
    refresh_slots(engine, &mut inflight).await;

    let mut heartbeat = tokio::time::interval(Duration::from_secs(args.heartbeat_secs.max(1)));
    let mut slots = tokio::time::interval(Duration::from_secs(args.poll_slots_secs.max(1)));
    let mut models = tokio::time::interval(Duration::from_secs(args.poll_models_secs.max(1)));
    let mut models_fast = false;

    loop {
        let mut new_models_period: Option<u64> = None;

        tokio::select! {
            _ = &mut recv => bail!("receive loop ended"),
            _ = &mut writer => bail!("write loop ended"),

            Some(()) = ping_rx.recv() => {
                send_status(args, &out_tx, &residencies, inflight)?;
            }

            _ = slots.tick() => {
                refresh_slots(engine, &mut inflight).await;
            }

            _ = models.tick() => {
                refresh_models(engine, &mut residencies, &mut loaded_at).await;

                // Poll faster while anything is loading so the router sees
                // the READY transition quickly.
                let loading = residencies.iter().any(|m| m.state == ModelState::Loading);
                if loading != models_fast && args.poll_models_secs > 1 {
                    models_fast = loading;
                    new_models_period = Some(if loading { 1 } else { args.poll_models_secs });
                }
            }

            _ = heartbeat.tick() => {
                send_status(args, &out_tx, &residencies, inflight)?;
            }
        }

        // Interval periods cannot change in place; swap outside the select
        // so the tick future no longer borrows the interval.
        if let Some(period) = new_models_period {
            models = tokio::time::interval(Duration::from_secs(period));
            models.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        }
    }
}

fn send_status(
    args: &Args,
    out: &mpsc::UnboundedSender<NodeMessage>,
    residencies: &[ResidencyReport],
    inflight: u32,
) -> Result<()> {
    let (ram_total, ram_available) = match read_meminfo(&args.meminfo_path) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "meminfo read failed, skipping status");
            return Ok(());
        }
    };

    out.send(NodeMessage::Status(NodeStatus {
        ts_unix_ms: unix_ms_now(),
        ram_total_bytes: ram_total,
        ram_available_bytes: ram_available,
        inflight_requests: inflight,
        models: residencies.to_vec(),
    }))
    .map_err(|_| anyhow::anyhow!("status channel closed"))
}

async fn refresh_models(
    engine: &EngineClient,
    residencies: &mut Vec<ResidencyReport>,
    loaded_at: &mut HashMap<String, i64>,
) {
    let response = match engine.get_models().await {
        Ok(r) => r,
        Err(e) => {
            debug!(error = %e, "engine models probe failed");
            return;
        }
    };

    let now = unix_ms_now();
    *residencies = response
        .data
        .iter()
        .map(|m| {
            let state = map_engine_status(&m.status.value, m.status.failed);
            // Track when we first saw the model READY; the engine does not
            // report a load timestamp itself.
            let loaded_since_unix_ms = if state == ModelState::Ready {
                *loaded_at.entry(m.id.clone()).or_insert(now)
            } else {
                loaded_at.remove(&m.id);
                0
            };
            ResidencyReport {
                model_id: m.id.clone(),
                state,
                loaded_since_unix_ms,
            }
        })
        .collect();
}

async fn refresh_slots(engine: &EngineClient, inflight: &mut u32) {
    match engine.get_slots_inflight().await {
        Ok(n) => *inflight = n,
        Err(e) => debug!(error = %e, "engine slots probe failed"),
    }
}

fn read_meminfo(path: &str) -> Result<(u64, u64)> {
    let contents = std::fs::read_to_string(path).with_context(|| format!("read {path}"))?;

    let mut total = None;
    let mut available = None;
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total = parse_meminfo_kb(rest);
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available = parse_meminfo_kb(rest);
        }
    }

    match (total, available) {
        (Some(t), Some(a)) => Ok((t, a)),
        _ => bail!("meminfo missing MemTotal/MemAvailable"),
    }
}

fn parse_meminfo_kb(rest: &str) -> Option<u64> {
    rest.trim()
        .split_whitespace()
        .next()
        .and_then(|v| v.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

fn unix_ms_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_meminfo_kb() {
        assert_eq!(parse_meminfo_kb("  16384 kB"), Some(16384 * 1024));
        assert_eq!(parse_meminfo_kb("garbage"), None);
    }

    #[test]
    fn test_read_meminfo_from_fixture() {
        let dir = std::env::temp_dir();
        let path = dir.join("fleetmux-agent-meminfo-test");
        std::fs::write(
            &path,
            "MemTotal:       16384 kB\nMemFree:        1024 kB\nMemAvailable:    8192 kB\n",
        )
        .unwrap();

        let (total, available) = read_meminfo(path.to_str().unwrap()).unwrap();
        assert_eq!(total, 16384 * 1024);
        assert_eq!(available, 8192 * 1024);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_read_meminfo_missing_fields() {
        let dir = std::env::temp_dir();
        let path = dir.join("fleetmux-agent-meminfo-bad");
        std::fs::write(&path, "SwapTotal: 0 kB\n").unwrap();
        assert!(read_meminfo(path.to_str().unwrap()).is_err());
        std::fs::remove_file(&path).ok();
    }
}
