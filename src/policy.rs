//! Per-model lifecycle policies.
//!
//! A policy tells the planner and the placement scorer how a model behaves:
//! how much RAM it needs, how long an idle copy may stay resident, whether it
//! is pinned, and how it ranks under pressure. The durable backend is an
//! external collaborator; everything here talks to the [`PolicyStore`] trait
//! and the in-memory implementation backs the binaries and tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Lifecycle policy for one model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPolicy {
    pub model_id: String,

    /// RAM hint used for placement fit and freed-bytes estimation.
    /// Zero means unknown.
    #[serde(default)]
    pub ram_required_bytes: u64,

    /// Idle TTL in seconds. Zero disables TTL unloads for this model.
    #[serde(default)]
    pub ttl_secs: i64,

    /// Pinned models are exempt from all automatic unloads.
    #[serde(default)]
    pub pinned: bool,

    /// Higher priority survives longer under RAM pressure.
    #[serde(default)]
    pub priority: i32,
}

impl ModelPolicy {
    /// Empty policy for a model with no stored record.
    pub fn empty(model_id: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
            ..Self::default()
        }
    }
}

/// Access to per-model policies.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn list_policies(&self) -> Vec<ModelPolicy>;
    async fn get_policy(&self, model_id: &str) -> Option<ModelPolicy>;
    async fn upsert_policy(&self, policy: ModelPolicy);
    async fn delete_policy(&self, model_id: &str);
}

/// In-process policy store.
#[derive(Default)]
pub struct MemoryPolicyStore {
    policies: RwLock<HashMap<String, ModelPolicy>>,
}

impl MemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PolicyStore for MemoryPolicyStore {
    async fn list_policies(&self) -> Vec<ModelPolicy> {
        let mut out: Vec<_> = self.policies.read().await.values().cloned().collect();
        out.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        out
    }

    async fn get_policy(&self, model_id: &str) -> Option<ModelPolicy> {
        self.policies.read().await.get(model_id).cloned()
    }

    async fn upsert_policy(&self, policy: ModelPolicy) {
        self.policies
            .write()
            .await
            .insert(policy.model_id.clone(), policy);
    }

    async fn delete_policy(&self, model_id: &str) {
        self.policies.write().await.remove(model_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upsert_and_get() {
        let store = MemoryPolicyStore::new();
        assert!(store.get_policy("m1").await.is_none());

        store
            .upsert_policy(ModelPolicy {
                model_id: "m1".into(),
                ram_required_bytes: 4 << 30,
                ttl_secs: 60,
                pinned: false,
                priority: 5,
            })
            .await;

        let p = store.get_policy("m1").await.unwrap();
        assert_eq!(p.ram_required_bytes, 4 << 30);
        assert_eq!(p.ttl_secs, 60);

        // Upsert replaces.
        store
            .upsert_policy(ModelPolicy {
                pinned: true,
                ..ModelPolicy::empty("m1")
            })
            .await;
        assert!(store.get_policy("m1").await.unwrap().pinned);
    }

    #[tokio::test]
    async fn test_list_is_sorted() {
        let store = MemoryPolicyStore::new();
        store.upsert_policy(ModelPolicy::empty("zeta")).await;
        store.upsert_policy(ModelPolicy::empty("alpha")).await;

        let ids: Vec<_> = store
            .list_policies()
            .await
            .into_iter()
            .map(|p| p.model_id)
            .collect();
        assert_eq!(ids, vec!["alpha", "zeta"]);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = MemoryPolicyStore::new();
        store.upsert_policy(ModelPolicy::empty("m1")).await;
        store.delete_policy("m1").await;
        assert!(store.get_policy("m1").await.is_none());
    }

    #[test]
    fn test_policy_serde_defaults() {
        let p: ModelPolicy = serde_json::from_str(r#"{"model_id":"m1"}"#).unwrap();
        assert_eq!(p.ram_required_bytes, 0);
        assert_eq!(p.ttl_secs, 0);
        assert!(!p.pinned);
        assert_eq!(p.priority, 0);
    }
}
