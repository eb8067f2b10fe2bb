//! Control-plane configuration: chunk sizing, replica / lifecycle /
//! durability policies, and bus topics.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::bus::topics;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageFabricConfig {
    pub default_chunk_size: u64,
    pub max_chunk_size: u64,
    pub hot_cold_threshold_bytes: u64,
    pub replica_policy: Option<ReplicaPolicyConfig>,
    pub lifecycle_policy: Option<LifecyclePolicyConfig>,
    pub durability_policy: Option<DurabilityPolicyConfig>,
}

impl Default for StorageFabricConfig {
    fn default() -> Self {
        Self {
            default_chunk_size: 8 * 1024 * 1024,
            max_chunk_size: 32 * 1024 * 1024,
            hot_cold_threshold_bytes: 50 * 1024 * 1024,
            replica_policy: Some(ReplicaPolicyConfig::default()),
            lifecycle_policy: Some(LifecyclePolicyConfig::default()),
            durability_policy: Some(DurabilityPolicyConfig::default()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaPolicyConfig {
    pub hot_replicas: u32,
    pub cold_replicas: u32,
    pub min_unique_zones: usize,
    pub spillover_threshold_bytes: u64,
}

impl Default for ReplicaPolicyConfig {
    fn default() -> Self {
        Self {
            hot_replicas: 2,
            cold_replicas: 1,
            min_unique_zones: 2,
            spillover_threshold_bytes: 50 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecyclePolicyConfig {
    pub idle_days_before_cold: i64,
    pub cold_storage_tier: String,
    pub hot_storage_tier: String,
    pub rebalance_interval_seconds: i64,
}

impl Default for LifecyclePolicyConfig {
    fn default() -> Self {
        Self {
            idle_days_before_cold: 30,
            cold_storage_tier: "cold".to_string(),
            hot_storage_tier: "hot".to_string(),
            rebalance_interval_seconds: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurabilityPolicyConfig {
    pub enable_checksums: bool,
    pub enable_scrubbing: bool,
    pub enable_erasure_coding: bool,
    pub evacuation_storage_threshold: f64,
    pub erasure_data_fragments: u32,
    pub erasure_parity_fragments: u32,
    pub erasure_min_object_bytes: u64,
    pub encryption_algorithm: Option<String>,
    pub kms_key_id: String,
}

impl Default for DurabilityPolicyConfig {
    fn default() -> Self {
        Self {
            enable_checksums: true,
            enable_scrubbing: true,
            enable_erasure_coding: false,
            evacuation_storage_threshold: 0.9,
            erasure_data_fragments: 8,
            erasure_parity_fragments: 4,
            erasure_min_object_bytes: 256 * 1024 * 1024,
            encryption_algorithm: Some("AES-256-GCM".to_string()),
            kms_key_id: "kms/default".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageBusConfig {
    pub topics: Vec<String>,
}

impl Default for MessageBusConfig {
    fn default() -> Self {
        Self {
            topics: topics::all().into_iter().map(String::from).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FabricConfig {
    pub storage: StorageFabricConfig,
    pub message_bus: MessageBusConfig,
    pub feature_flags: BTreeMap<String, bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_policy() {
        let config = FabricConfig::default();
        assert!(config.storage.replica_policy.is_some());
        assert!(config.storage.lifecycle_policy.is_some());
        assert!(config.storage.durability_policy.is_some());
        assert_eq!(config.storage.default_chunk_size, 8 * 1024 * 1024);
        assert!(config.message_bus.topics.contains(&"healing.events".to_string()));
    }

    #[test]
    fn round_trips_through_json() {
        let config = FabricConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: FabricConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(
            back.storage.hot_cold_threshold_bytes,
            config.storage.hot_cold_threshold_bytes
        );
    }
}
