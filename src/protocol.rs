//! Control-plane wire protocol.
//!
//! One WebSocket session per worker carries JSON-encoded tagged frames. The
//! first node frame on a session MUST be `hello`; `status` frames refresh the
//! cluster view; `ack` answers unload commands. Unknown frame kinds on either
//! direction are ignored for forward compatibility.

use crate::cluster::ModelState;
use serde::{Deserialize, Serialize};

/// Frames sent from a worker to the router.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeMessage {
    Hello(NodeHello),
    Status(NodeStatus),
    Ack(CommandAck),
    /// Catch-all for frame kinds this router does not know.
    #[serde(other)]
    Unknown,
}

/// Frames sent from the router to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ServerHello(ServerHello),
    UnloadModel(UnloadModel),
    Ping(Ping),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeHello {
    pub node_id: String,
    pub version: String,
    /// Worker-local inference base URL (what the agent probes).
    pub engine_base_url: String,
    /// Externally reachable base URL for data-plane forwarding.
    pub data_plane_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub ts_unix_ms: i64,
    pub ram_total_bytes: u64,
    pub ram_available_bytes: u64,
    pub inflight_requests: u32,
    #[serde(default)]
    pub models: Vec<ResidencyReport>,
}

/// One model's residency as reported by the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResidencyReport {
    pub model_id: String,
    pub state: ModelState,
    /// Zero or absent means unknown; the planner then skips TTL checks.
    #[serde(default)]
    pub loaded_since_unix_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandAck {
    pub request_id: String,
    pub ok: bool,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerHello {
    pub server_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnloadModel {
    pub request_id: String,
    pub model_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ping {
    pub ts_unix_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_round_trip() {
        let msg = NodeMessage::Hello(NodeHello {
            node_id: "n1".into(),
            version: "dev".into(),
            engine_base_url: "http://llama:8080".into(),
            data_plane_url: "http://worker-1:8080".into(),
        });
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"hello""#));

        match serde_json::from_str(&json).unwrap() {
            NodeMessage::Hello(h) => {
                assert_eq!(h.node_id, "n1");
                assert_eq!(h.data_plane_url, "http://worker-1:8080");
            }
            other => panic!("expected hello, got {:?}", other),
        }
    }

    #[test]
    fn test_status_with_residencies() {
        let json = r#"{
            "type": "status",
            "ts_unix_ms": 1000,
            "ram_total_bytes": 64,
            "ram_available_bytes": 32,
            "inflight_requests": 1,
            "models": [
                {"model_id": "m1", "state": "ready", "loaded_since_unix_ms": 500},
                {"model_id": "m2", "state": "loading"}
            ]
        }"#;

        match serde_json::from_str::<NodeMessage>(json).unwrap() {
            NodeMessage::Status(s) => {
                assert_eq!(s.models.len(), 2);
                assert_eq!(s.models[0].state, ModelState::Ready);
                assert_eq!(s.models[1].loaded_since_unix_ms, 0);
            }
            other => panic!("expected status, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_node_frame_is_ignored() {
        let parsed: NodeMessage =
            serde_json::from_str(r#"{"type":"shiny_new_thing","payload":42}"#).unwrap();
        assert!(matches!(parsed, NodeMessage::Unknown));
    }

    #[test]
    fn test_unknown_server_frame_is_ignored() {
        let parsed: ServerMessage =
            serde_json::from_str(r#"{"type":"drain_node","node_id":"n1"}"#).unwrap();
        assert!(matches!(parsed, ServerMessage::Unknown));
    }

    #[test]
    fn test_unload_and_ack_round_trip() {
        let cmd = ServerMessage::UnloadModel(UnloadModel {
            request_id: "unload-ttl-1".into(),
            model_id: "m1".into(),
        });
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains(r#""type":"unload_model""#));

        let ack = NodeMessage::Ack(CommandAck {
            request_id: "unload-ttl-1".into(),
            ok: false,
            error: "engine returned 500".into(),
        });
        let json = serde_json::to_string(&ack).unwrap();
        match serde_json::from_str(&json).unwrap() {
            NodeMessage::Ack(a) => {
                assert_eq!(a.request_id, "unload-ttl-1");
                assert!(!a.ok);
            }
            other => panic!("expected ack, got {:?}", other),
        }
    }

    #[test]
    fn test_model_state_wire_names() {
        assert_eq!(
            serde_json::to_string(&ModelState::Ready).unwrap(),
            r#""ready""#
        );
        assert_eq!(
            serde_json::from_str::<ModelState>(r#""error""#).unwrap(),
            ModelState::Error
        );
    }
}
