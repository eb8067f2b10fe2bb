//! Demand-driven cluster expansion and replica seeding.
//!
//! After chunk movement, per-node telemetry snapshots are compared against
//! the configured thresholds. The trigger priority list picks the cause; the
//! most severe overloaded member of an under-sized cluster is cloned into a
//! replica, wired to its parent's neighbors, and seeded from the parent's
//! stored files.

use tracing::{debug, info};

use super::network::{FabricSimulator, StorageVirtualNetwork};
use super::types::{FabricEvent, NetworkEvent, NodeTelemetry, ScalingTrigger};

const SEED_RETRY_INTERVAL: f64 = 0.05;
const SEED_MAX_ATTEMPTS: u32 = 5;
const PARENT_LINK_MIN_MBPS: u64 = 2_000;
const PARENT_LINK_LATENCY_MS: f64 = 0.2;

impl StorageVirtualNetwork {
    /// Refresh every node's load snapshot.
    pub fn refresh_telemetry(&mut self, now: f64) {
        let ids: Vec<String> = self.nodes.keys().cloned().collect();
        for id in ids {
            let bandwidth_usage = self.node_bandwidth_usage_bps(&id);
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            let storage_ratio =
                node.projected_storage_usage() as f64 / node.total_storage().max(1) as f64;
            let bandwidth_ratio =
                (bandwidth_usage as f64 / node.bandwidth_bps().max(1) as f64).min(1.0);
            let os_memory_ratio = node.os().used_memory() as f64
                / node.os().memory_capacity_bytes().max(1) as f64;
            let baseline = self.failure_baseline.get(&id).copied().unwrap_or(0);
            let os_failure_delta = node.os_process_failures().saturating_sub(baseline);
            self.node_telemetry.insert(
                id,
                NodeTelemetry {
                    storage_ratio,
                    bandwidth_ratio,
                    os_memory_ratio,
                    os_failure_delta,
                    timestamp: now,
                },
            );
        }
    }

    /// Expand any under-sized cluster with an overloaded member.
    pub(crate) fn run_demand_scaling(&mut self, sim: &mut FabricSimulator) {
        if !self.scaling.auto_replication_enabled || self.auto_replication_suspended {
            return;
        }
        let roots: Vec<String> = self.cluster_nodes.keys().cloned().collect();
        for root in roots {
            self.maybe_expand_cluster(sim, &root);
        }
    }

    fn maybe_expand_cluster(&mut self, sim: &mut FabricSimulator, root: &str) {
        let Some(members) = self.cluster_nodes.get(root) else {
            return;
        };
        if members.len() >= self.scaling.max_replicas_per_root {
            return;
        }
        let members: Vec<String> = members.iter().cloned().collect();

        let mut winner: Option<(String, ScalingTrigger)> = None;
        for trigger in self.scaling.trigger_priority.clone() {
            let mut overloaded: Vec<(f64, f64, String)> = Vec::new();
            for member in &members {
                if self.failed_nodes.contains(member) {
                    continue;
                }
                let Some(telemetry) = self.node_telemetry.get(member) else {
                    continue;
                };
                let (value, threshold) = match trigger {
                    ScalingTrigger::Storage => {
                        (telemetry.storage_ratio, self.scaling.storage_threshold)
                    }
                    ScalingTrigger::Bandwidth => {
                        (telemetry.bandwidth_ratio, self.scaling.bandwidth_threshold)
                    }
                    ScalingTrigger::OsMemory => {
                        (telemetry.os_memory_ratio, self.scaling.os_memory_threshold)
                    }
                    ScalingTrigger::OsFailures => (
                        telemetry.os_failure_delta as f64,
                        self.scaling.os_failure_delta.max(1) as f64,
                    ),
                };
                if value >= threshold {
                    overloaded.push((value, telemetry.bandwidth_ratio, member.clone()));
                }
            }
            if !overloaded.is_empty() {
                overloaded.sort_by(|a, b| {
                    b.0.total_cmp(&a.0)
                        .then(b.1.total_cmp(&a.1))
                        .then(a.2.cmp(&b.2))
                });
                winner = Some((overloaded[0].2.clone(), trigger));
                break;
            }
        }

        if let Some((node_id, trigger)) = winner {
            debug!(cluster = root, winner = %node_id, trigger = trigger.as_str(), "expanding cluster");
            self.spawn_replica_node(sim, &node_id, trigger.as_str());
        }
    }

    /// Clone `parent` into a replica: mirror its neighbor links, add a
    /// same-zone high-bandwidth parent link, register it in the cluster,
    /// and schedule seeding.
    pub(crate) fn spawn_replica_node(
        &mut self,
        sim: &mut FabricSimulator,
        parent: &str,
        trigger: &str,
    ) -> Option<String> {
        let Some(parent_node) = self.nodes.get(parent) else {
            return None;
        };
        self.next_replica_seq += 1;
        let replica_id = format!("{parent}-replica-{}", self.next_replica_seq);
        let replica = parent_node.clone_node(&replica_id, 1.0, 1.0, None);
        let neighbors: Vec<(String, u64, f64)> = parent_node
            .connections()
            .iter()
            .map(|(neighbor, bps)| {
                (
                    neighbor.clone(),
                    bps / 1_000_000,
                    parent_node.link_latency(neighbor),
                )
            })
            .collect();
        let parent_bw_mbps = parent_node.bandwidth_bps() / 1_000_000;
        let root = self
            .node_roots
            .get(parent)
            .cloned()
            .unwrap_or_else(|| parent.to_string());

        self.add_node(replica, Some(&root));
        self.replica_parents
            .insert(replica_id.clone(), parent.to_string());
        for (neighbor, bandwidth_mbps, latency_ms) in neighbors {
            if neighbor != replica_id {
                self.add_link_between(&replica_id, &neighbor, bandwidth_mbps, latency_ms);
            }
        }
        self.add_link_between(
            &replica_id,
            parent,
            parent_bw_mbps.max(PARENT_LINK_MIN_MBPS),
            PARENT_LINK_LATENCY_MS,
        );

        info!(parent, replica = %replica_id, trigger, "replica spawned");
        self.emit(
            sim.now(),
            NetworkEvent::ReplicaSpawned {
                parent: parent.to_string(),
                replica: replica_id.clone(),
                trigger: trigger.to_string(),
            },
        );
        let _ = sim.schedule_in(
            SEED_RETRY_INTERVAL,
            FabricEvent::ReplicaSeed {
                parent: parent.to_string(),
                replica: replica_id.clone(),
                attempt: 1,
            },
        );
        Some(replica_id)
    }

    pub(crate) fn add_link_between(
        &mut self,
        a: &str,
        b: &str,
        bandwidth_mbps: u64,
        latency_ms: f64,
    ) {
        if let Some(node) = self.nodes.get_mut(a) {
            node.add_connection(b, bandwidth_mbps, latency_ms);
        }
        if let Some(node) = self.nodes.get_mut(b) {
            node.add_connection(a, bandwidth_mbps, latency_ms);
        }
        self.link_latency_ms
            .insert((a.to_string(), b.to_string()), latency_ms.max(0.0));
        self.link_latency_ms
            .insert((b.to_string(), a.to_string()), latency_ms.max(0.0));
    }

    /// Replay the parent's stored files onto a fresh replica, retrying on
    /// sim-time until the parent has something to replay.
    pub(crate) fn handle_replica_seed(
        &mut self,
        sim: &mut FabricSimulator,
        parent: &str,
        replica: &str,
        attempt: u32,
    ) {
        let now = sim.now();
        let unavailable = !self.nodes.contains_key(parent)
            || !self.nodes.contains_key(replica)
            || self.failed_nodes.contains(parent)
            || self.failed_nodes.contains(replica);
        if unavailable {
            self.emit(
                now,
                NetworkEvent::ReplicaSyncFailed {
                    parent: parent.to_string(),
                    replica: replica.to_string(),
                    reason: "node unavailable".to_string(),
                },
            );
            return;
        }

        let seeds: Vec<String> = {
            let Some(parent_node) = self.nodes.get(parent) else {
                return;
            };
            let mut seen_backing = std::collections::BTreeSet::new();
            parent_node
                .stored_files()
                .values()
                .filter(|t| seen_backing.insert(t.backing_file_id.clone()))
                .map(|t| t.file_id.clone())
                .take(self.scaling.replica_seed_limit)
                .collect()
        };

        if seeds.is_empty() {
            if attempt >= SEED_MAX_ATTEMPTS {
                self.emit(
                    now,
                    NetworkEvent::ReplicaSyncFailed {
                        parent: parent.to_string(),
                        replica: replica.to_string(),
                        reason: "parent has no stored files".to_string(),
                    },
                );
                return;
            }
            let _ = sim.schedule_in(
                SEED_RETRY_INTERVAL,
                FabricEvent::ReplicaSeed {
                    parent: parent.to_string(),
                    replica: replica.to_string(),
                    attempt: attempt + 1,
                },
            );
            return;
        }

        for file_id in seeds {
            if self
                .initiate_replica_transfer(sim, parent, replica, &file_id)
                .is_none()
            {
                self.emit(
                    now,
                    NetworkEvent::ReplicaSyncFailed {
                        parent: parent.to_string(),
                        replica: replica.to_string(),
                        reason: format!("seed transfer refused for {file_id}"),
                    },
                );
            }
        }
    }

    /// Top up a cluster's healthy membership to `min_replicas_per_root`.
    pub(crate) fn ensure_replica_coverage(&mut self, sim: &mut FabricSimulator, node_id: &str) {
        if !self.scaling.auto_replication_enabled || self.auto_replication_suspended {
            return;
        }
        let Some(root) = self.node_roots.get(node_id).cloned() else {
            return;
        };
        loop {
            let Some(members) = self.cluster_nodes.get(&root) else {
                return;
            };
            let members: Vec<String> = members.iter().cloned().collect();
            let healthy: Vec<String> = members
                .iter()
                .filter(|m| !self.failed_nodes.contains(*m))
                .cloned()
                .collect();
            if healthy.len() >= self.scaling.min_replicas_per_root
                || members.len() >= self.scaling.max_replicas_per_root
            {
                return;
            }
            let basis = if !self.failed_nodes.contains(&root) && self.nodes.contains_key(&root) {
                root.clone()
            } else if let Some(first_healthy) = healthy.first() {
                first_healthy.clone()
            } else {
                return;
            };
            if self.spawn_replica_node(sim, &basis, "coverage").is_none() {
                return;
            }
        }
    }
}
