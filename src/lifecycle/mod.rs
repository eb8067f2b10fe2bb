//! Hot/cold tiering: post-upload demotion for large objects and periodic
//! idle-based demotion sweeps.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::debug;

use crate::bus::{topics, InMemoryBus, MessageEnvelope};
use crate::config::FabricConfig;
use crate::controller::FabricController;
use crate::metadata::{system_clock, FileManifest, MetadataStore, WallClock, PARITY_TIER};
use crate::replica::ReplicaManager;

pub struct LifecycleManager {
    controller: Arc<Mutex<FabricController>>,
    metadata: Arc<MetadataStore>,
    config: Arc<FabricConfig>,
    replica: Option<Arc<ReplicaManager>>,
    bus: Option<Arc<InMemoryBus>>,
    last_access: Mutex<BTreeMap<String, DateTime<Utc>>>,
    last_rebalance: Mutex<Option<DateTime<Utc>>>,
    clock: WallClock,
}

impl LifecycleManager {
    pub fn new(
        controller: Arc<Mutex<FabricController>>,
        metadata: Arc<MetadataStore>,
        config: Arc<FabricConfig>,
    ) -> Self {
        Self {
            controller,
            metadata,
            config,
            replica: None,
            bus: None,
            last_access: Mutex::new(BTreeMap::new()),
            last_rebalance: Mutex::new(None),
            clock: system_clock(),
        }
    }

    pub fn with_replica_manager(mut self, replica: Arc<ReplicaManager>) -> Self {
        self.replica = Some(replica);
        self
    }

    pub fn with_bus(mut self, bus: Arc<InMemoryBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_clock(mut self, clock: WallClock) -> Self {
        self.clock = clock;
        self
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Annotate zones and, for objects past the hot/cold threshold, demote
    /// every segment but the first to the cold tier.
    pub fn apply_post_upload(&self, manifest: FileManifest) -> FileManifest {
        self.record_access(&manifest.manifest_id);
        let Some(policy) = self.config.storage.lifecycle_policy.as_ref() else {
            return manifest;
        };
        let mut manifest = manifest;
        self.annotate_zones(&mut manifest);
        if manifest.total_size >= self.config.storage.hot_cold_threshold_bytes {
            manifest = self.demote_tail_segments(manifest, &policy.cold_storage_tier);
        }
        manifest
    }

    pub fn record_access(&self, manifest_id: &str) {
        self.last_access
            .lock()
            .insert(manifest_id.to_string(), self.now());
    }

    /// Periodic sweep: demote manifests idle past the policy window and
    /// re-enforce replica policy on the demoted ones.
    pub fn evaluate_transitions(&self) -> Vec<String> {
        let Some(policy) = self.config.storage.lifecycle_policy.as_ref() else {
            return Vec::new();
        };
        let now = self.now();
        {
            let mut last = self.last_rebalance.lock();
            if let Some(previous) = *last {
                let elapsed = (now - previous).num_seconds();
                if policy.rebalance_interval_seconds > 0
                    && elapsed < policy.rebalance_interval_seconds
                {
                    return Vec::new();
                }
            }
            *last = Some(now);
        }

        let cutoff = now - Duration::days(policy.idle_days_before_cold);
        let mut transitioned = Vec::new();
        for manifest in self.metadata.list_manifests() {
            let recently_used = self
                .last_access
                .lock()
                .get(&manifest.manifest_id)
                .map(|t| *t >= cutoff)
                .unwrap_or(false);
            if recently_used {
                continue;
            }
            let mut manifest = manifest;
            self.annotate_zones(&mut manifest);
            let manifest = self.demote_tail_segments(manifest, &policy.cold_storage_tier);
            self.metadata.upsert_manifest(manifest.clone());
            transitioned.push(manifest.manifest_id);
        }

        if !transitioned.is_empty() {
            debug!(count = transitioned.len(), "lifecycle transitions applied");
            if let Some(bus) = &self.bus {
                bus.publish(MessageEnvelope::new(
                    topics::LIFECYCLE_TRANSITIONS,
                    serde_json::json!({ "manifests": transitioned }),
                ));
            }
        }
        transitioned
    }

    fn demote_tail_segments(&self, manifest: FileManifest, cold_tier: &str) -> FileManifest {
        let hot_tier = self
            .config
            .storage
            .lifecycle_policy
            .as_ref()
            .map(|p| p.hot_storage_tier.clone())
            .unwrap_or_else(|| "hot".to_string());
        let mut manifest = manifest;
        let mut tiered = false;

        let mut data_offsets: Vec<u64> = manifest
            .segments
            .iter()
            .filter(|s| s.storage_tier != PARITY_TIER)
            .map(|s| s.offset)
            .collect();
        data_offsets.sort_unstable();
        data_offsets.dedup();
        let first_offset = data_offsets.first().copied();

        for segment in &mut manifest.segments {
            if segment.storage_tier == PARITY_TIER {
                continue;
            }
            let target_tier = if Some(segment.offset) == first_offset {
                hot_tier.as_str()
            } else {
                cold_tier
            };
            if segment.storage_tier != target_tier {
                segment.storage_tier = target_tier.to_string();
                tiered = true;
            }
        }
        if tiered {
            if let Some(replica) = &self.replica {
                manifest = replica.enforce_policy(manifest);
            }
        }
        manifest
    }

    fn annotate_zones(&self, manifest: &mut FileManifest) {
        let controller = self.controller.lock();
        let network = controller.network();
        for segment in &mut manifest.segments {
            if let Some(zone) = network.node(&segment.node_id).and_then(|n| n.zone()) {
                segment.zone = Some(zone.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::NodeSpec;
    use crate::metadata::ManifestSegment;
    use chrono::TimeZone;

    fn manifest_with_segments(total: u64, offsets: &[(u64, u64)]) -> FileManifest {
        FileManifest {
            manifest_id: "m1".to_string(),
            file_id: "m1".to_string(),
            total_size: total,
            segments: offsets
                .iter()
                .map(|(offset, length)| ManifestSegment {
                    node_id: "n1".to_string(),
                    file_id: format!("seg-{offset}"),
                    offset: *offset,
                    length: *length,
                    checksum: None,
                    storage_tier: "hot".to_string(),
                    zone: None,
                    encrypted: false,
                })
                .collect(),
            encryption: None,
            durability: None,
        }
    }

    fn manager() -> LifecycleManager {
        let controller = Arc::new(Mutex::new(FabricController::new()));
        controller
            .lock()
            .add_node("n1", NodeSpec::default())
            .unwrap();
        LifecycleManager::new(
            controller,
            Arc::new(MetadataStore::new()),
            Arc::new(FabricConfig::default()),
        )
    }

    #[test]
    fn small_objects_stay_hot() {
        let manager = manager();
        let manifest = manifest_with_segments(1024 * 1024, &[(0, 1024 * 1024)]);
        let result = manager.apply_post_upload(manifest);
        assert!(result.segments.iter().all(|s| s.storage_tier == "hot"));
    }

    #[test]
    fn large_objects_keep_one_hot_segment() {
        let manager = manager();
        // 100 MiB across three segments crosses the 50 MiB threshold.
        let manifest = manifest_with_segments(
            100 * 1024 * 1024,
            &[
                (0, 40 * 1024 * 1024),
                (40 * 1024 * 1024, 40 * 1024 * 1024),
                (80 * 1024 * 1024, 20 * 1024 * 1024),
            ],
        );
        let result = manager.apply_post_upload(manifest);
        let hot: Vec<_> = result
            .segments
            .iter()
            .filter(|s| s.storage_tier == "hot")
            .collect();
        assert_eq!(hot.len(), 1);
        assert_eq!(hot[0].offset, 0);
        assert!(result
            .segments
            .iter()
            .filter(|s| s.offset > 0)
            .all(|s| s.storage_tier == "cold"));
    }

    #[test]
    fn zones_are_annotated_from_fabric() {
        let manager = manager();
        let manifest = manifest_with_segments(1024, &[(0, 1024)]);
        let result = manager.apply_post_upload(manifest);
        assert!(result.segments[0].zone.is_some());
    }

    #[test]
    fn idle_manifests_demote_on_sweep() {
        let fake_now = Arc::new(Mutex::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()));
        let clock_now = Arc::clone(&fake_now);

        let controller = Arc::new(Mutex::new(FabricController::new()));
        controller
            .lock()
            .add_node("n1", NodeSpec::default())
            .unwrap();
        let metadata = Arc::new(MetadataStore::new());
        let manager = LifecycleManager::new(
            controller,
            Arc::clone(&metadata),
            Arc::new(FabricConfig::default()),
        )
        .with_clock(Arc::new(move || *clock_now.lock()));

        let manifest = manifest_with_segments(
            100 * 1024 * 1024,
            &[(0, 60 * 1024 * 1024), (60 * 1024 * 1024, 40 * 1024 * 1024)],
        );
        metadata.register_manifest(manifest.clone());
        manager.record_access(&manifest.manifest_id);

        // Fresh access: nothing transitions.
        assert!(manager.evaluate_transitions().is_empty());

        // 40 idle days later the tail demotes.
        *fake_now.lock() = Utc.with_ymd_and_hms(2026, 2, 10, 0, 0, 0).unwrap();
        let transitioned = manager.evaluate_transitions();
        assert_eq!(transitioned, vec!["m1".to_string()]);
        let updated = metadata.manifest("m1").unwrap();
        assert!(updated
            .segments
            .iter()
            .any(|s| s.storage_tier == "cold"));
    }

    #[test]
    fn rebalance_interval_throttles_sweeps() {
        let fake_now = Arc::new(Mutex::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()));
        let clock_now = Arc::clone(&fake_now);
        let manager = LifecycleManager::new(
            Arc::new(Mutex::new(FabricController::new())),
            Arc::new(MetadataStore::new()),
            Arc::new(FabricConfig::default()),
        )
        .with_clock(Arc::new(move || *clock_now.lock()));

        assert!(manager.evaluate_transitions().is_empty());
        // Within the 3600 s window the sweep is a no-op even with idle data.
        *fake_now.lock() = Utc.with_ymd_and_hms(2026, 1, 1, 0, 30, 0).unwrap();
        assert!(manager.evaluate_transitions().is_empty());
    }
}
