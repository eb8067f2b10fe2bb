//! Durability annotations: segment checksums, encryption envelopes, and
//! metadata-only parity fragments.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::config::FabricConfig;
use crate::controller::FabricController;
use crate::metadata::{
    DurabilityMetadata, EncryptionEnvelope, FileManifest, ManifestSegment, MetadataStore,
    PARITY_TIER,
};

const CHECKSUM_ALGORITHM: &str = "blake3";

pub struct DurabilityManager {
    controller: Arc<Mutex<FabricController>>,
    metadata: Arc<MetadataStore>,
    config: Arc<FabricConfig>,
}

impl DurabilityManager {
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

    pub fn apply(&self, manifest: FileManifest) -> FileManifest {
        let manifest = self.ensure_checksums(manifest);
        let manifest = self.ensure_encryption(manifest);
        let manifest = self.ensure_erasure_coding(manifest);
        self.metadata.upsert_manifest(manifest.clone());
        manifest
    }

    /// Fill missing segment checksums deterministically from segment
    /// identity.
    pub fn ensure_checksums(&self, manifest: FileManifest) -> FileManifest {
        let Some(policy) = self.config.storage.durability_policy.as_ref() else {
            return manifest;
        };
        if !policy.enable_checksums {
            return manifest;
        }
        let mut manifest = manifest;
        for segment in &mut manifest.segments {
            if segment.checksum.is_some() {
                continue;
            }
            segment.checksum = Some(Self::checksum_for_segment(segment));
        }
        let encryption_algorithm = manifest.encryption.as_ref().map(|e| e.algorithm.clone());
        match manifest.durability.as_mut() {
            Some(durability) => durability.checksum_algorithm = Some(CHECKSUM_ALGORITHM.into()),
            None => {
                manifest.durability = Some(DurabilityMetadata {
                    data_fragments: manifest.data_segments().count() as u32,
                    parity_fragments: manifest
                        .segments
                        .iter()
                        .filter(|s| s.storage_tier == PARITY_TIER)
                        .count() as u32,
                    checksum_algorithm: Some(CHECKSUM_ALGORITHM.into()),
                    encryption_algorithm,
                });
            }
        }
        manifest
    }

    /// Attach an envelope with a fresh DEK id under the configured KEK.
    pub fn ensure_encryption(&self, manifest: FileManifest) -> FileManifest {
        let Some(policy) = self.config.storage.durability_policy.as_ref() else {
            return manifest;
        };
        let Some(algorithm) = policy.encryption_algorithm.as_ref() else {
            return manifest;
        };
        if manifest.encryption.is_some() {
            return manifest;
        }
        let mut manifest = manifest;
        let dek = Uuid::new_v4().simple().to_string();
        manifest.encryption = Some(EncryptionEnvelope {
            algorithm: algorithm.clone(),
            kek_id: policy.kms_key_id.clone(),
            dek_id: format!("dek-{}-{}", manifest.manifest_id, &dek[..16]),
            last_rotated_at: Utc::now(),
        });
        for segment in &mut manifest.segments {
            segment.encrypted = true;
        }
        manifest
    }

    /// Allocate parity fragments on nodes not yet hosting the manifest.
    /// Fragments are placements only; no coding bytes exist.
    pub fn ensure_erasure_coding(&self, manifest: FileManifest) -> FileManifest {
        let Some(policy) = self.config.storage.durability_policy.as_ref() else {
            return manifest;
        };
        if !policy.enable_erasure_coding
            || manifest.total_size < policy.erasure_min_object_bytes
        {
            return manifest;
        }
        let existing_parity = manifest
            .segments
            .iter()
            .filter(|s| s.storage_tier == PARITY_TIER)
            .count() as u32;
        if existing_parity >= policy.erasure_parity_fragments {
            return manifest;
        }

        let mut manifest = manifest;
        let parity_needed = policy.erasure_parity_fragments - existing_parity;
        let parity_size =
            (manifest.total_size / policy.erasure_data_fragments.max(1) as u64).max(1);
        let mut current_nodes: BTreeSet<String> = manifest
            .segments
            .iter()
            .map(|s| s.node_id.clone())
            .collect();

        for _ in 0..parity_needed {
            let mut controller = self.controller.lock();
            let Some(parity_node) = Self::select_parity_node(&controller, &current_nodes) else {
                break;
            };
            let file_name = format!(
                "ec-{}-{}",
                manifest.file_id,
                &Uuid::new_v4().simple().to_string()[..8]
            );
            let Some(transfer) =
                controller.store_file_locally(&parity_node, &file_name, parity_size)
            else {
                continue;
            };
            let zone = controller
                .network()
                .node(&parity_node)
                .and_then(|n| n.zone().map(String::from));
            drop(controller);
            debug!(manifest_id = %manifest.manifest_id, node = %parity_node, "parity fragment placed");
            let segment = ManifestSegment {
                node_id: parity_node.clone(),
                file_id: transfer.file_id.clone(),
                offset: manifest.total_size,
                length: parity_size,
                checksum: Some(Self::checksum_for_id(&transfer.file_id)),
                storage_tier: PARITY_TIER.to_string(),
                zone,
                encrypted: true,
            };
            manifest.segments.push(segment);
            current_nodes.insert(parity_node);
        }

        manifest.durability = Some(DurabilityMetadata {
            data_fragments: policy.erasure_data_fragments,
            parity_fragments: manifest
                .segments
                .iter()
                .filter(|s| s.storage_tier == PARITY_TIER)
                .count() as u32,
            checksum_algorithm: manifest
                .durability
                .as_ref()
                .and_then(|d| d.checksum_algorithm.clone()),
            encryption_algorithm: manifest.encryption.as_ref().map(|e| e.algorithm.clone()),
        });
        manifest
    }

    fn select_parity_node(
        controller: &FabricController,
        exclude: &BTreeSet<String>,
    ) -> Option<String> {
        let network = controller.network();
        let mut best: Option<(u64, String)> = None;
        for node_id in network.node_ids() {
            if exclude.contains(node_id) || network.is_failed(node_id) {
                continue;
            }
            let free = network.node(node_id).map(|n| n.free_storage()).unwrap_or(0);
            if free == 0 {
                continue;
            }
            let better = best
                .as_ref()
                .map(|(best_free, _)| free > *best_free)
                .unwrap_or(true);
            if better {
                best = Some((free, node_id.clone()));
            }
        }
        best.map(|(_, id)| id)
    }

    fn checksum_for_segment(segment: &ManifestSegment) -> String {
        let payload = format!(
            "{}:{}:{}:{}",
            segment.node_id, segment.file_id, segment.offset, segment.length
        );
        blake3::hash(payload.as_bytes()).to_hex().to_string()
    }

    fn checksum_for_id(file_id: &str) -> String {
        blake3::hash(file_id.as_bytes()).to_hex().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::NodeSpec;
    use crate::metadata::ManifestSegment;

    fn manifest(total: u64) -> FileManifest {
        FileManifest {
            manifest_id: "m1".to_string(),
            file_id: "m1".to_string(),
            total_size: total,
            segments: vec![ManifestSegment {
                node_id: "n1".to_string(),
                file_id: "seg0".to_string(),
                offset: 0,
                length: total,
                checksum: None,
                storage_tier: "hot".to_string(),
                zone: None,
                encrypted: false,
            }],
            encryption: None,
            durability: None,
        }
    }

    fn manager_with(config: FabricConfig) -> DurabilityManager {
        let controller = Arc::new(Mutex::new(FabricController::new()));
        {
            let mut c = controller.lock();
            for id in ["n1", "n2", "n3"] {
                c.add_node(id, NodeSpec::default()).unwrap();
            }
        }
        DurabilityManager::new(
            controller,
            Arc::new(MetadataStore::new()),
            Arc::new(config),
        )
    }

    #[test]
    fn checksums_are_deterministic() {
        let manager = manager_with(FabricConfig::default());
        let first = manager.ensure_checksums(manifest(1024));
        let second = manager.ensure_checksums(manifest(1024));
        assert_eq!(first.segments[0].checksum, second.segments[0].checksum);
        assert!(first.segments[0].checksum.is_some());
        assert_eq!(
            first.durability.as_ref().unwrap().checksum_algorithm.as_deref(),
            Some("blake3")
        );
    }

    #[test]
    fn encryption_envelope_attached_once() {
        let manager = manager_with(FabricConfig::default());
        let first = manager.ensure_encryption(manifest(1024));
        let envelope = first.encryption.clone().unwrap();
        assert_eq!(envelope.algorithm, "AES-256-GCM");
        assert_eq!(envelope.kek_id, "kms/default");
        assert!(first.segments.iter().all(|s| s.encrypted));

        let second = manager.ensure_encryption(first);
        assert_eq!(second.encryption.unwrap().dek_id, envelope.dek_id);
    }

    #[test]
    fn erasure_coding_respects_minimum_size() {
        let mut config = FabricConfig::default();
        config.storage.durability_policy.as_mut().unwrap().enable_erasure_coding = true;
        let manager = manager_with(config);
        let small = manager.ensure_erasure_coding(manifest(1024));
        assert!(small
            .segments
            .iter()
            .all(|s| s.storage_tier != PARITY_TIER));
    }

    #[test]
    fn erasure_coding_places_parity_fragments() {
        let mut config = FabricConfig::default();
        {
            let policy = config.storage.durability_policy.as_mut().unwrap();
            policy.enable_erasure_coding = true;
            policy.erasure_min_object_bytes = 1024;
            policy.erasure_parity_fragments = 2;
            policy.erasure_data_fragments = 4;
        }
        let manager = manager_with(config);
        let result = manager.apply(manifest(4096));
        let parity: Vec<_> = result
            .segments
            .iter()
            .filter(|s| s.storage_tier == PARITY_TIER)
            .collect();
        assert_eq!(parity.len(), 2);
        // Parity lands off the data nodes.
        assert!(parity.iter().all(|s| s.node_id != "n1"));
        assert!(parity.iter().all(|s| s.length == 1024));
        let durability = result.durability.unwrap();
        assert_eq!(durability.parity_fragments, 2);
        assert_eq!(durability.data_fragments, 4);
    }
}
