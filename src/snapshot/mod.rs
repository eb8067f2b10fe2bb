//! Advisory JSON snapshot of the fabric.
//!
//! The document captures what operator commands can rebuild: nodes with
//! their stored files, links, failure sets, cluster bookkeeping, scaling
//! config, routing strategy, simulator clock, and the event history.
//! Restore order is nodes → files → links → failure set, with
//! auto-replication suspended while loading.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::controller::{
    ControllerError, ControllerResult, EventRecord, FabricController, NodeSpec,
};
use crate::network::{DemandScalingConfig, RoutingStrategy};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredFileSnapshot {
    pub file_id: String,
    pub file_name: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub node_id: String,
    pub cpu_capacity: u32,
    pub memory_gb: u64,
    pub storage_gb: u64,
    pub bandwidth_mbps: u64,
    pub zone: Option<String>,
    pub root: Option<String>,
    pub replica_parent: Option<String>,
    pub failed: bool,
    pub stored_files: Vec<StoredFileSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkSnapshot {
    pub node_a: String,
    pub node_b: String,
    pub bandwidth_mbps: u64,
    pub latency_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FabricSnapshot {
    pub clock: f64,
    pub routing_strategy: RoutingStrategy,
    pub scaling: DemandScalingConfig,
    pub nodes: Vec<NodeSnapshot>,
    pub links: Vec<LinkSnapshot>,
    pub failed_nodes: Vec<String>,
    pub failed_links: Vec<(String, String)>,
    pub clusters: BTreeMap<String, Vec<String>>,
    pub replica_parents: BTreeMap<String, String>,
    pub events: Vec<EventRecord>,
}

/// Capture the controller's fabric state into a snapshot document.
pub fn capture(controller: &FabricController) -> FabricSnapshot {
    let network = controller.network();
    let mut nodes = Vec::new();
    for node_id in network.node_ids() {
        let node = network.node(node_id).expect("listed id exists");
        nodes.push(NodeSnapshot {
            node_id: node_id.clone(),
            cpu_capacity: node.cpu_capacity(),
            memory_gb: node.memory_capacity_gb(),
            storage_gb: node.total_storage() / (1024 * 1024 * 1024),
            bandwidth_mbps: node.bandwidth_bps() / 1_000_000,
            zone: node.zone().map(String::from),
            root: network.cluster_root(node_id).map(String::from),
            replica_parent: network.replica_parent(node_id).map(String::from),
            failed: network.is_failed(node_id),
            stored_files: node
                .stored_files()
                .values()
                .map(|t| StoredFileSnapshot {
                    file_id: t.file_id.clone(),
                    file_name: t.file_name.clone(),
                    size: t.total_size,
                })
                .collect(),
        });
    }

    let mut links = Vec::new();
    let mut seen: BTreeSet<(String, String)> = BTreeSet::new();
    for node_id in network.node_ids() {
        let node = network.node(node_id).expect("listed id exists");
        for (neighbor, bandwidth_bps) in node.connections() {
            let key = if node_id <= neighbor {
                (node_id.clone(), neighbor.clone())
            } else {
                (neighbor.clone(), node_id.clone())
            };
            if !seen.insert(key.clone()) {
                continue;
            }
            links.push(LinkSnapshot {
                node_a: key.0,
                node_b: key.1,
                bandwidth_mbps: bandwidth_bps / 1_000_000,
                latency_ms: node.link_latency(neighbor),
            });
        }
    }

    let mut failed_links = Vec::new();
    let mut seen_failed: BTreeSet<(String, String)> = BTreeSet::new();
    for (a, b) in network.failed_links() {
        let key = if a <= b {
            (a.clone(), b.clone())
        } else {
            (b.clone(), a.clone())
        };
        if seen_failed.insert(key.clone()) {
            failed_links.push(key);
        }
    }

    FabricSnapshot {
        clock: controller.now(),
        routing_strategy: network.routing_strategy(),
        scaling: network.scaling_config().clone(),
        nodes,
        links,
        failed_nodes: network.failed_nodes().iter().cloned().collect(),
        failed_links,
        clusters: network
            .clusters()
            .iter()
            .map(|(root, members)| (root.clone(), members.iter().cloned().collect()))
            .collect(),
        replica_parents: network
            .clusters()
            .keys()
            .flat_map(|root| {
                network.clusters()[root]
                    .iter()
                    .filter_map(|member| {
                        network
                            .replica_parent(member)
                            .map(|parent| (member.clone(), parent.to_string()))
                    })
                    .collect::<Vec<_>>()
            })
            .collect(),
        events: controller.event_history(),
    }
}

pub fn to_json(snapshot: &FabricSnapshot) -> ControllerResult<String> {
    serde_json::to_string_pretty(snapshot).map_err(|e| ControllerError::Snapshot(e.to_string()))
}

pub fn from_json(document: &str) -> ControllerResult<FabricSnapshot> {
    serde_json::from_str(document).map_err(|e| ControllerError::Snapshot(e.to_string()))
}

/// Rebuild a controller from a snapshot: nodes, then their stored files,
/// then links, then the failure set. Auto-replication stays suspended for
/// the duration of the load so restored clusters do not re-expand.
pub fn restore(snapshot: &FabricSnapshot) -> ControllerResult<FabricController> {
    let mut controller = FabricController::new();
    controller.set_clock(snapshot.clock);
    {
        let network = controller.network_mut();
        network.set_auto_replication_suspended(true);
        network.set_routing_strategy(snapshot.routing_strategy);
        network.set_scaling_config(snapshot.scaling.clone());
    }

    for node in &snapshot.nodes {
        controller.add_node(
            &node.node_id,
            NodeSpec {
                storage_gb: node.storage_gb.max(1),
                bandwidth_mbps: node.bandwidth_mbps.max(1),
                cpu_capacity: node.cpu_capacity,
                memory_gb: node.memory_gb,
                root_id: node.root.clone(),
                zone: node.zone.clone(),
            },
        )?;
    }
    let clock = snapshot.clock;
    for node in &snapshot.nodes {
        for stored in &node.stored_files {
            let restored = controller.network_mut().restore_file_record(
                &node.node_id,
                &stored.file_id,
                &stored.file_name,
                stored.size,
                clock,
            );
            if !restored {
                return Err(ControllerError::Snapshot(format!(
                    "could not restore file {} on {}",
                    stored.file_id, node.node_id
                )));
            }
        }
    }
    for link in &snapshot.links {
        controller.network_mut().connect_nodes(
            &link.node_a,
            &link.node_b,
            link.bandwidth_mbps,
            link.latency_ms,
        );
    }
    {
        let network = controller.network_mut();
        for (replica, parent) in &snapshot.replica_parents {
            network.set_replica_parent(replica, parent);
        }
        for node_id in &snapshot.failed_nodes {
            network.mark_node_failed(node_id);
        }
        for (a, b) in &snapshot.failed_links {
            network.mark_link_failed(a, b);
        }
        network.set_auto_replication_suspended(false);
    }
    controller.load_event_history(snapshot.events.clone());
    Ok(controller)
}
