//! Replica placement enforcement for control-plane manifests.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::config::FabricConfig;
use crate::controller::FabricController;
use crate::metadata::{FileManifest, ManifestSegment, MetadataStore, PARITY_TIER};

pub struct ReplicaManager {
    controller: Arc<Mutex<FabricController>>,
    metadata: Arc<MetadataStore>,
    config: Arc<FabricConfig>,
}

impl ReplicaManager {
    pub fn new(
        controller: Arc<Mutex<FabricController>>,
        metadata: Arc<MetadataStore>,
        config: Arc<FabricConfig>,
    ) -> Self {
        Self {
            controller,
            metadata,
            config,
        }
    }

    /// Top a manifest up to the policy's required copy count, preferring
    /// targets in zones not yet represented while the unique-zone floor is
    /// unmet. The refreshed manifest is committed back to metadata.
    pub fn enforce_policy(&self, manifest: FileManifest) -> FileManifest {
        let Some(policy) = self.config.storage.replica_policy.as_ref() else {
            return manifest;
        };
        let required_copies = (policy.hot_replicas + policy.cold_replicas).max(1) as usize;

        let mut manifest = manifest;
        loop {
            // Copies on failed nodes do not count toward the policy, and a
            // failed node cannot serve as a replica source.
            let failed: BTreeSet<String> = {
                let controller = self.controller.lock();
                controller.network().failed_nodes().iter().cloned().collect()
            };
            let current_nodes: BTreeSet<String> = manifest
                .data_segments()
                .map(|s| s.node_id.clone())
                .filter(|n| !failed.contains(n))
                .collect();
            if current_nodes.len() >= required_copies {
                break;
            }
            let Some(source) = manifest
                .data_segments()
                .find(|s| !failed.contains(&s.node_id))
                .cloned()
            else {
                break;
            };
            let current_zones = self.zones_for_nodes(&current_nodes);
            let Some(target) = self.select_target_node(
                &current_nodes,
                &current_zones,
                source.length,
                policy.min_unique_zones,
            ) else {
                break;
            };

            let refreshed = {
                let mut controller = self.controller.lock();
                let started = controller
                    .initiate_replica_transfer(&source.node_id, &target, &source.file_id)
                    .is_some();
                if !started {
                    None
                } else {
                    controller.run_until_idle();
                    self.manifest_from_fabric(&controller, &manifest.manifest_id)
                }
            };
            match refreshed {
                Some(updated) => {
                    debug!(manifest_id = %manifest.manifest_id, target = %target, "replica placed");
                    manifest = self.merge_fabric_segments(manifest, updated);
                }
                None => break,
            }
        }

        self.metadata.upsert_manifest(manifest.clone());
        manifest
    }

    /// Rebuild the control-plane manifest from fabric state.
    pub fn repair_manifest(&self, manifest_id: &str) -> Option<FileManifest> {
        let manifest = {
            let controller = self.controller.lock();
            self.manifest_from_fabric(&controller, manifest_id)?
        };
        self.metadata.upsert_manifest(manifest.clone());
        Some(manifest)
    }

    fn manifest_from_fabric(
        &self,
        controller: &FabricController,
        manifest_id: &str,
    ) -> Option<FileManifest> {
        let fabric_manifest = controller.network().manifest(manifest_id)?.clone();
        let hot_tier = self
            .config
            .storage
            .lifecycle_policy
            .as_ref()
            .map(|p| p.hot_storage_tier.clone())
            .unwrap_or_else(|| "hot".to_string());
        Some(FileManifest::from_fabric(
            &fabric_manifest,
            &hot_tier,
            |node_id| {
                controller
                    .network()
                    .node(node_id)
                    .and_then(|n| n.zone().map(String::from))
            },
        ))
    }

    /// Keep control-plane annotations (file identity, tiers, checksums,
    /// envelopes) for segments that survived, and adopt new fabric segments
    /// as-is.
    fn merge_fabric_segments(&self, previous: FileManifest, fresh: FileManifest) -> FileManifest {
        let mut merged = fresh;
        merged.file_id = previous.file_id.clone();
        merged.encryption = previous.encryption.clone();
        merged.durability = previous.durability.clone();
        for segment in &mut merged.segments {
            if let Some(old) = previous
                .segments
                .iter()
                .find(|s| s.file_id == segment.file_id && s.node_id == segment.node_id)
            {
                segment.storage_tier = old.storage_tier.clone();
                segment.checksum = old.checksum.clone();
                segment.encrypted = old.encrypted;
            }
        }
        // Parity placements are control-plane only; carry them over.
        for parity in previous
            .segments
            .into_iter()
            .filter(|s| s.storage_tier == PARITY_TIER)
        {
            if !merged.segments.iter().any(|s| s.file_id == parity.file_id) {
                merged.segments.push(parity);
            }
        }
        merged
    }

    fn select_target_node(
        &self,
        exclude: &BTreeSet<String>,
        existing_zones: &BTreeSet<String>,
        required_bytes: u64,
        min_unique_zones: usize,
    ) -> Option<String> {
        let controller = self.controller.lock();
        let network = controller.network();
        let mut preferred = Vec::new();
        let mut fallbacks = Vec::new();
        for node_id in network.node_ids() {
            if exclude.contains(node_id) || network.is_failed(node_id) {
                continue;
            }
            let Some(node) = network.node(node_id) else {
                continue;
            };
            if node.free_storage() < required_bytes {
                continue;
            }
            let zone = node.zone().map(String::from);
            match zone {
                Some(zone)
                    if !existing_zones.contains(&zone)
                        && existing_zones.len() < min_unique_zones =>
                {
                    preferred.push(node_id.clone())
                }
                _ => fallbacks.push(node_id.clone()),
            }
        }
        preferred.into_iter().next().or_else(|| fallbacks.into_iter().next())
    }

    fn zones_for_nodes(&self, nodes: &BTreeSet<String>) -> BTreeSet<String> {
        let controller = self.controller.lock();
        let network = controller.network();
        nodes
            .iter()
            .filter_map(|node_id| {
                network
                    .node(node_id)
                    .and_then(|n| n.zone().map(String::from))
            })
            .collect()
    }
}

pub fn segment_nodes(manifest: &FileManifest) -> BTreeSet<String> {
    manifest
        .segments
        .iter()
        .map(|s| s.node_id.clone())
        .collect()
}

pub fn segment_for_offset(manifest: &FileManifest, offset: u64) -> Option<&ManifestSegment> {
    manifest.segments.iter().find(|s| s.offset == offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::NodeSpec;

    fn wired() -> (Arc<Mutex<FabricController>>, Arc<MetadataStore>, ReplicaManager) {
        let controller = Arc::new(Mutex::new(FabricController::new()));
        {
            let mut c = controller.lock();
            for (id, zone) in [("n1", "us-east-1a"), ("n2", "us-west-2b"), ("n3", "eu-west-1b")] {
                c.add_node(
                    id,
                    NodeSpec {
                        zone: Some(zone.to_string()),
                        ..NodeSpec::default()
                    },
                )
                .unwrap();
            }
            c.connect_nodes("n1", "n2", Some(1000), Some(1.0));
            c.connect_nodes("n2", "n3", Some(1000), Some(1.0));
            c.connect_nodes("n1", "n3", Some(1000), Some(5.0));
        }
        let metadata = Arc::new(MetadataStore::new());
        let config = Arc::new(FabricConfig::default());
        let manager = ReplicaManager::new(Arc::clone(&controller), Arc::clone(&metadata), config);
        (controller, metadata, manager)
    }

    #[test]
    fn enforce_policy_reaches_required_copies() {
        let (controller, metadata, manager) = wired();
        let manifest = {
            let mut c = controller.lock();
            let (_, transfer) = c.push_file("n1", "doc.bin", 4 * 1024 * 1024, true).unwrap();
            c.run_until_idle();
            let fabric = c.network().manifest(&transfer.file_id).unwrap().clone();
            FileManifest::from_fabric(&fabric, "hot", |_| None)
        };

        let enforced = manager.enforce_policy(manifest);
        let nodes = segment_nodes(&enforced);
        // Default policy: 2 hot + 1 cold = 3 copies.
        assert_eq!(nodes.len(), 3);
        assert!(metadata.manifest(&enforced.manifest_id).is_some());
    }

    #[test]
    fn repair_manifest_rebuilds_from_fabric() {
        let (controller, metadata, manager) = wired();
        let master_id = {
            let mut c = controller.lock();
            let (_, transfer) = c.push_file("n2", "lost.bin", 1024 * 1024, true).unwrap();
            c.run_until_idle();
            transfer.file_id
        };
        assert!(metadata.manifest(&master_id).is_none());
        let repaired = manager.repair_manifest(&master_id).unwrap();
        assert_eq!(repaired.manifest_id, master_id);
        assert!(metadata.manifest(&master_id).is_some());
        assert!(manager.repair_manifest("missing").is_none());
    }
}
