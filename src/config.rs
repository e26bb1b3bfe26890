//! Router configuration.
//!
//! All knobs come from the environment with conservative defaults, so a bare
//! `fleetmux` starts a working router. The names match what operators deploy
//! alongside the node agents.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Port for the client-facing HTTP API and the control-plane stream.
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Prometheus exporter port (0 to disable).
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Heartbeat age after which a worker is unreachable for placement.
    #[serde(default = "default_node_offline_secs")]
    pub node_offline_secs: u64,

    /// Ping broadcast interval (workers answer with an immediate STATUS).
    #[serde(default = "default_status_poll_interval_secs")]
    pub status_poll_interval_secs: u64,

    /// Maintenance planner tick interval.
    #[serde(default = "default_planner_interval_secs")]
    pub planner_interval_secs: u64,

    /// Pressure threshold: unloads start when a worker's available RAM
    /// drops below this. Zero disables the pressure pass.
    #[serde(default = "default_min_free_ram_mb")]
    pub min_free_ram_mb: u64,

    /// Hard ceiling on how long a request waits for a model to become READY.
    #[serde(default = "default_gate_wait_ceiling_secs")]
    pub gate_wait_ceiling_secs: u64,

    /// EWMA smoothing factor for the latency tracker.
    #[serde(default = "default_ewma_alpha")]
    pub ewma_alpha: f64,

    /// Retained activity events.
    #[serde(default = "default_activity_capacity")]
    pub activity_capacity: usize,
}

fn default_http_port() -> u16 {
    8080
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_node_offline_secs() -> u64 {
    5
}

fn default_status_poll_interval_secs() -> u64 {
    10
}

fn default_planner_interval_secs() -> u64 {
    2
}

fn default_min_free_ram_mb() -> u64 {
    2048
}

fn default_gate_wait_ceiling_secs() -> u64 {
    180
}

fn default_ewma_alpha() -> f64 {
    0.2
}

fn default_activity_capacity() -> usize {
    300
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            metrics_port: default_metrics_port(),
            node_offline_secs: default_node_offline_secs(),
            status_poll_interval_secs: default_status_poll_interval_secs(),
            planner_interval_secs: default_planner_interval_secs(),
            min_free_ram_mb: default_min_free_ram_mb(),
            gate_wait_ceiling_secs: default_gate_wait_ceiling_secs(),
            ewma_alpha: default_ewma_alpha(),
            activity_capacity: default_activity_capacity(),
        }
    }
}

impl Config {
    /// Build from the process environment. Unparseable values fall back to
    /// the default rather than failing startup.
    pub fn from_env() -> Self {
        Self {
            http_port: env_or("HTTP_PORT", default_http_port()),
            metrics_port: env_or("METRICS_PORT", default_metrics_port()),
            node_offline_secs: env_or("NODE_OFFLINE_SECONDS", default_node_offline_secs()),
            status_poll_interval_secs: env_or(
                "STATUS_POLL_INTERVAL_SECONDS",
                default_status_poll_interval_secs(),
            ),
            planner_interval_secs: env_or(
                "PLANNER_INTERVAL_SECONDS",
                default_planner_interval_secs(),
            ),
            min_free_ram_mb: env_or("MIN_FREE_RAM_MB", default_min_free_ram_mb()),
            gate_wait_ceiling_secs: env_or(
                "GATE_WAIT_CEILING_SECONDS",
                default_gate_wait_ceiling_secs(),
            ),
            ewma_alpha: env_or("EWMA_ALPHA", default_ewma_alpha()),
            activity_capacity: env_or("ACTIVITY_CAPACITY", default_activity_capacity()),
        }
    }

    pub fn node_offline_ttl(&self) -> Duration {
        Duration::from_secs(self.node_offline_secs)
    }

    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_secs(self.status_poll_interval_secs)
    }

    pub fn planner_interval(&self) -> Duration {
        Duration::from_secs(self.planner_interval_secs)
    }

    pub fn min_free_bytes(&self) -> u64 {
        self.min_free_ram_mb * 1024 * 1024
    }

    pub fn gate_wait_ceiling(&self) -> Duration {
        Duration::from_secs(self.gate_wait_ceiling_secs)
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(v) => v.parse().unwrap_or(default),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = Config::default();
        assert_eq!(c.node_offline_secs, 5);
        assert_eq!(c.status_poll_interval_secs, 10);
        assert_eq!(c.planner_interval_secs, 2);
        assert_eq!(c.min_free_ram_mb, 2048);
        assert_eq!(c.gate_wait_ceiling_secs, 180);
        assert_eq!(c.min_free_bytes(), 2048 * 1024 * 1024);
        assert_eq!(c.gate_wait_ceiling(), Duration::from_secs(180));
    }

    #[test]
    fn test_parse_from_json_with_defaults() {
        let c: Config = serde_json::from_str(r#"{"node_offline_secs": 12}"#).unwrap();
        assert_eq!(c.node_offline_secs, 12);
        assert_eq!(c.http_port, 8080);
    }

    #[test]
    fn test_env_or_fallback_on_garbage() {
        // SAFETY: test-local variable name nothing else reads.
        unsafe { std::env::set_var("FLEETMUX_TEST_BOGUS", "not-a-number") };
        assert_eq!(env_or("FLEETMUX_TEST_BOGUS", 7u64), 7);
        unsafe { std::env::remove_var("FLEETMUX_TEST_BOGUS") };
    }
}
