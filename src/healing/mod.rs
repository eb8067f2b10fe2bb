//! Background healing sweeps: reconcile metadata with the fabric, re-place
//! manifests touching failed or overloaded nodes, and collect orphans.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::bus::{topics, InMemoryBus, MessageEnvelope};
use crate::config::FabricConfig;
use crate::controller::FabricController;
use crate::durability::DurabilityManager;
use crate::lifecycle::LifecycleManager;
use crate::metadata::MetadataStore;
use crate::replica::ReplicaManager;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthReport {
    pub reconciled: Vec<String>,
    pub scrubbed: Vec<String>,
    pub evacuated: Vec<String>,
    pub garbage_collected: Vec<String>,
}

impl HealthReport {
    pub fn is_empty(&self) -> bool {
        self.reconciled.is_empty()
            && self.scrubbed.is_empty()
            && self.evacuated.is_empty()
            && self.garbage_collected.is_empty()
    }
}

pub struct HealingService {
    controller: Arc<Mutex<FabricController>>,
    metadata: Arc<MetadataStore>,
    replica: Arc<ReplicaManager>,
    lifecycle: Option<Arc<LifecycleManager>>,
    durability: Option<Arc<DurabilityManager>>,
    bus: Arc<InMemoryBus>,
    config: Arc<FabricConfig>,
}

impl HealingService {
    pub fn new(
        controller: Arc<Mutex<FabricController>>,
        metadata: Arc<MetadataStore>,
        replica: Arc<ReplicaManager>,
        bus: Arc<InMemoryBus>,
        config: Arc<FabricConfig>,
    ) -> Self {
        Self {
            controller,
            metadata,
            replica,
            lifecycle: None,
            durability: None,
            bus,
            config,
        }
    }

    pub fn with_lifecycle(mut self, lifecycle: Arc<LifecycleManager>) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    pub fn with_durability(mut self, durability: Arc<DurabilityManager>) -> Self {
        self.durability = Some(durability);
        self
    }

    /// One full healing pass. Publishes `healing.events` when anything
    /// changed.
    pub fn run_health_checks(&self) -> HealthReport {
        let report = HealthReport {
            reconciled: self.reconcile_manifests(),
            scrubbed: self.scrub_failed_placements(),
            evacuated: self.evacuate_overloaded_nodes(),
            garbage_collected: self.collect_orphans(),
        };
        if !report.is_empty() {
            let touched = report.reconciled.len()
                + report.scrubbed.len()
                + report.evacuated.len()
                + report.garbage_collected.len();
            crate::metrics::record_healing_actions(touched);
            info!(
                reconciled = report.reconciled.len(),
                scrubbed = report.scrubbed.len(),
                evacuated = report.evacuated.len(),
                collected = report.garbage_collected.len(),
                "healing sweep applied"
            );
            self.bus.publish(MessageEnvelope::new(
                topics::HEALING_EVENTS,
                serde_json::to_value(&report).unwrap_or(serde_json::Value::Null),
            ));
        }
        report
    }

    /// Metadata manifests with no fabric counterpart are rebuilt from
    /// whatever the fabric still knows.
    pub fn reconcile_manifests(&self) -> Vec<String> {
        let mut reconciled = Vec::new();
        for manifest in self.metadata.list_manifests() {
            let missing = {
                let controller = self.controller.lock();
                controller.network().manifest(&manifest.manifest_id).is_none()
            };
            if !missing {
                continue;
            }
            if let Some(repaired) = self.replica.repair_manifest(&manifest.manifest_id) {
                let repaired = match &self.lifecycle {
                    Some(lifecycle) => lifecycle.apply_post_upload(repaired),
                    None => repaired,
                };
                let repaired = match &self.durability {
                    Some(durability) => durability.apply(repaired),
                    None => repaired,
                };
                self.metadata.upsert_manifest(repaired);
                reconciled.push(manifest.manifest_id);
            }
        }
        reconciled
    }

    /// Re-enforce replica policy for manifests referencing failed nodes.
    pub fn scrub_failed_placements(&self) -> Vec<String> {
        if let Some(policy) = self.config.storage.durability_policy.as_ref() {
            if !policy.enable_scrubbing {
                return Vec::new();
            }
        }
        let failed: BTreeSet<String> = {
            let controller = self.controller.lock();
            controller.network().failed_nodes().iter().cloned().collect()
        };
        if failed.is_empty() {
            return Vec::new();
        }
        let mut healed = Vec::new();
        for manifest in self.metadata.list_manifests() {
            if !manifest.segments.iter().any(|s| failed.contains(&s.node_id)) {
                continue;
            }
            let updated = self.replica.enforce_policy(manifest.clone());
            self.metadata.upsert_manifest(updated);
            healed.push(manifest.manifest_id);
        }
        healed
    }

    /// Re-enforce policy for manifests on nodes past the evacuation
    /// storage threshold.
    pub fn evacuate_overloaded_nodes(&self) -> Vec<String> {
        let threshold = self
            .config
            .storage
            .durability_policy
            .as_ref()
            .map(|p| p.evacuation_storage_threshold)
            .unwrap_or(0.9);
        let degraded: BTreeSet<String> = {
            let mut controller = self.controller.lock();
            controller.refresh_telemetry();
            let network = controller.network();
            let mut degraded: BTreeSet<String> =
                network.failed_nodes().iter().cloned().collect();
            for (node_id, telemetry) in network.all_node_telemetry() {
                if telemetry.storage_ratio >= threshold {
                    degraded.insert(node_id.clone());
                }
            }
            degraded
        };
        if degraded.is_empty() {
            return Vec::new();
        }
        let mut evacuated = Vec::new();
        for manifest in self.metadata.list_manifests() {
            if !manifest
                .segments
                .iter()
                .any(|s| degraded.contains(&s.node_id))
            {
                continue;
            }
            let updated = self.replica.enforce_policy(manifest.clone());
            self.metadata.upsert_manifest(updated);
            evacuated.push(manifest.manifest_id);
        }
        evacuated
    }

    /// Fabric manifests unknown to metadata are orphans: purge them from
    /// every node's disk and drop the fabric bookkeeping.
    pub fn collect_orphans(&self) -> Vec<String> {
        let metadata_ids: BTreeSet<String> = self
            .metadata
            .list_manifests()
            .into_iter()
            .map(|m| m.manifest_id)
            .collect();
        let mut controller = self.controller.lock();
        let orphans: Vec<String> = controller
            .network()
            .manifests()
            .map(|m| m.master_id.clone())
            .filter(|id| !metadata_ids.contains(id))
            .collect();
        for master_id in &orphans {
            controller.network_mut().purge_manifest(master_id);
        }
        orphans
    }
}
