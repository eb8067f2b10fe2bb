//! The storage virtual network: topology, manifests, clusters, ingestion,
//! and failure injection. The per-tick chunk engine lives in `transfers`,
//! route computation in `routing`, and demand scaling in `scaling`.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use crate::node::{FileTransfer, StorageVirtualNode};
use crate::sim::Simulator;

use super::types::{
    ActiveChunk, AssembleOutcome, DemandScalingConfig, FabricEvent, FabricManifest, FileSegment,
    NetworkEvent, NodeTelemetry, RoutingStrategy, TransferOp, TransferPurpose,
};

pub type FabricSimulator = Simulator<FabricEvent>;

pub(crate) fn link_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

pub struct StorageVirtualNetwork {
    pub(crate) tick_interval: f64,
    pub(crate) routing_strategy: RoutingStrategy,
    pub(crate) scaling: DemandScalingConfig,
    pub(crate) nodes: BTreeMap<String, StorageVirtualNode>,
    pub(crate) failed_nodes: BTreeSet<String>,
    pub(crate) failed_links: BTreeSet<(String, String)>,
    pub(crate) link_latency_ms: BTreeMap<(String, String), f64>,
    pub(crate) transfer_ops: BTreeMap<String, TransferOp>,
    pub(crate) active_chunks: BTreeMap<u64, ActiveChunk>,
    pub(crate) link_occupancy: BTreeMap<(String, String), BTreeSet<u64>>,
    pub(crate) next_chunk_handle: u64,
    pub(crate) tick_scheduled: bool,
    pub(crate) manifests_by_id: BTreeMap<String, FabricManifest>,
    pub(crate) manifest_names: BTreeMap<String, String>,
    pub(crate) segment_owners: BTreeMap<String, String>,
    pub(crate) node_roots: BTreeMap<String, String>,
    pub(crate) cluster_nodes: BTreeMap<String, BTreeSet<String>>,
    pub(crate) replica_parents: BTreeMap<String, String>,
    pub(crate) node_telemetry: BTreeMap<String, NodeTelemetry>,
    pub(crate) failure_baseline: BTreeMap<String, u64>,
    pub(crate) observers: Vec<Box<dyn FnMut(f64, &NetworkEvent) + Send>>,
    pub(crate) next_id_seq: u64,
    pub(crate) next_replica_seq: u64,
    pub(crate) auto_replication_suspended: bool,
}

impl StorageVirtualNetwork {
    pub fn new(tick_interval: f64) -> Self {
        Self {
            tick_interval: if tick_interval > 0.0 { tick_interval } else { 0.005 },
            routing_strategy: RoutingStrategy::LinkState,
            scaling: DemandScalingConfig::default(),
            nodes: BTreeMap::new(),
            failed_nodes: BTreeSet::new(),
            failed_links: BTreeSet::new(),
            link_latency_ms: BTreeMap::new(),
            transfer_ops: BTreeMap::new(),
            active_chunks: BTreeMap::new(),
            link_occupancy: BTreeMap::new(),
            next_chunk_handle: 1,
            tick_scheduled: false,
            manifests_by_id: BTreeMap::new(),
            manifest_names: BTreeMap::new(),
            segment_owners: BTreeMap::new(),
            node_roots: BTreeMap::new(),
            cluster_nodes: BTreeMap::new(),
            replica_parents: BTreeMap::new(),
            node_telemetry: BTreeMap::new(),
            failure_baseline: BTreeMap::new(),
            observers: Vec::new(),
            next_id_seq: 1,
            next_replica_seq: 0,
            auto_replication_suspended: false,
        }
    }

    pub fn with_scaling_config(mut self, scaling: DemandScalingConfig) -> Self {
        self.scaling = scaling;
        self
    }

    pub fn set_scaling_config(&mut self, scaling: DemandScalingConfig) {
        self.scaling = scaling;
    }

    pub fn scaling_config(&self) -> &DemandScalingConfig {
        &self.scaling
    }

    pub fn set_routing_strategy(&mut self, strategy: RoutingStrategy) {
        self.routing_strategy = strategy;
    }

    pub fn routing_strategy(&self) -> RoutingStrategy {
        self.routing_strategy
    }

    pub fn tick_interval(&self) -> f64 {
        self.tick_interval
    }

    /// Suspend auto-replication (snapshot restore runs with it off).
    pub fn set_auto_replication_suspended(&mut self, suspended: bool) {
        self.auto_replication_suspended = suspended;
    }

    // Introspection ------------------------------------------------------

    pub fn node(&self, node_id: &str) -> Option<&StorageVirtualNode> {
        self.nodes.get(node_id)
    }

    pub fn node_mut(&mut self, node_id: &str) -> Option<&mut StorageVirtualNode> {
        self.nodes.get_mut(node_id)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &String> {
        self.nodes.keys()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_failed(&self, node_id: &str) -> bool {
        self.failed_nodes.contains(node_id)
    }

    pub fn failed_nodes(&self) -> &BTreeSet<String> {
        &self.failed_nodes
    }

    pub fn failed_links(&self) -> &BTreeSet<(String, String)> {
        &self.failed_links
    }

    pub fn manifest(&self, master_id: &str) -> Option<&FabricManifest> {
        self.manifests_by_id.get(master_id)
    }

    pub fn manifests(&self) -> impl Iterator<Item = &FabricManifest> {
        self.manifests_by_id.values()
    }

    pub fn manifest_for_name(&self, name: &str) -> Option<&FabricManifest> {
        self.manifest_names
            .get(name)
            .and_then(|id| self.manifests_by_id.get(id))
    }

    pub fn node_telemetry(&self, node_id: &str) -> Option<NodeTelemetry> {
        self.node_telemetry.get(node_id).copied()
    }

    pub fn all_node_telemetry(&self) -> &BTreeMap<String, NodeTelemetry> {
        &self.node_telemetry
    }

    pub fn clusters(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.cluster_nodes
    }

    pub fn replica_parent(&self, node_id: &str) -> Option<&str> {
        self.replica_parents.get(node_id).map(String::as_str)
    }

    pub fn cluster_root(&self, node_id: &str) -> Option<&str> {
        self.node_roots.get(node_id).map(String::as_str)
    }

    pub fn active_transfer_count(&self) -> usize {
        self.transfer_ops.len()
    }

    pub(crate) fn next_file_id(&mut self, hint: &str, now: f64) -> String {
        let seq = self.next_id_seq;
        self.next_id_seq += 1;
        let digest = blake3::hash(format!("{hint}-{now}-{seq}").as_bytes());
        digest.to_hex()[..32].to_string()
    }

    // Observers ----------------------------------------------------------

    pub fn register_observer(
        &mut self,
        observer: Box<dyn FnMut(f64, &NetworkEvent) + Send>,
    ) {
        self.observers.push(observer);
    }

    pub(crate) fn emit(&mut self, now: f64, event: NetworkEvent) {
        match &event {
            NetworkEvent::TransferCompleted { file_id, .. } => {
                debug!(file_id = %file_id, "transfer completed");
                crate::metrics::record_transfer_completed();
            }
            NetworkEvent::TransferFailed { file_id, reason, .. } => {
                warn!(file_id = %file_id, reason = %reason, "transfer failed");
                crate::metrics::record_transfer_failed();
            }
            NetworkEvent::ChunkCompleted { .. } => {
                crate::metrics::record_chunk_completed();
            }
            _ => {}
        }
        for observer in self.observers.iter_mut() {
            observer(now, &event);
        }
    }

    // Topology -----------------------------------------------------------

    pub fn add_node(&mut self, node: StorageVirtualNode, root_id: Option<&str>) {
        let node_id = node.node_id().to_string();
        let root = root_id.unwrap_or(&node_id).to_string();
        info!(node = %node_id, root = %root, "node added");
        self.failure_baseline
            .insert(node_id.clone(), node.os_process_failures());
        self.nodes.insert(node_id.clone(), node);
        self.node_roots.insert(node_id.clone(), root.clone());
        self.cluster_nodes
            .entry(root.clone())
            .or_default()
            .insert(node_id.clone());
        if root != node_id {
            self.replica_parents.insert(node_id, root);
        }
    }

    /// Connect two nodes with a symmetric link. Replica links are
    /// auto-mirrored: replicas in either endpoint's cluster get a link to
    /// the far endpoint with the same profile.
    pub fn connect_nodes(
        &mut self,
        a: &str,
        b: &str,
        bandwidth_mbps: u64,
        latency_ms: f64,
    ) -> bool {
        if a == b || !self.nodes.contains_key(a) || !self.nodes.contains_key(b) {
            return false;
        }
        self.add_link_between(a, b, bandwidth_mbps, latency_ms);
        for replica in self.cluster_replicas_of(a) {
            if replica != b {
                self.add_link_between(&replica, b, bandwidth_mbps, latency_ms);
            }
        }
        for replica in self.cluster_replicas_of(b) {
            if replica != a {
                self.add_link_between(&replica, a, bandwidth_mbps, latency_ms);
            }
        }
        true
    }

    fn cluster_replicas_of(&self, node_id: &str) -> Vec<String> {
        let Some(root) = self.node_roots.get(node_id) else {
            return Vec::new();
        };
        self.cluster_nodes
            .get(root)
            .map(|members| {
                members
                    .iter()
                    .filter(|m| {
                        m.as_str() != node_id && self.replica_parents.contains_key(m.as_str())
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn disconnect_nodes(&mut self, a: &str, b: &str) -> bool {
        if !self.nodes.contains_key(a) || !self.nodes.contains_key(b) {
            return false;
        }
        if let Some(node) = self.nodes.get_mut(a) {
            node.remove_connection(b);
        }
        if let Some(node) = self.nodes.get_mut(b) {
            node.remove_connection(a);
        }
        self.link_latency_ms.remove(&(a.to_string(), b.to_string()));
        self.link_latency_ms.remove(&(b.to_string(), a.to_string()));
        self.failed_links.remove(&(a.to_string(), b.to_string()));
        self.failed_links.remove(&(b.to_string(), a.to_string()));
        true
    }

    /// Fail a node and delete it: stored files, neighbor edges, and cluster
    /// membership go with it; coverage is re-established on the root.
    pub fn remove_node(&mut self, sim: &mut FabricSimulator, node_id: &str) -> bool {
        if !self.nodes.contains_key(node_id) {
            return false;
        }
        self.fail_node(sim, node_id);
        let neighbors: Vec<String> = self
            .nodes
            .get(node_id)
            .map(|n| n.connections().keys().cloned().collect())
            .unwrap_or_default();
        for neighbor in &neighbors {
            if let Some(node) = self.nodes.get_mut(neighbor) {
                node.remove_connection(node_id);
            }
            self.link_latency_ms
                .remove(&(node_id.to_string(), neighbor.clone()));
            self.link_latency_ms
                .remove(&(neighbor.clone(), node_id.to_string()));
        }
        self.nodes.remove(node_id);
        self.failed_nodes.remove(node_id);
        self.node_telemetry.remove(node_id);
        self.failure_baseline.remove(node_id);
        let root = self.node_roots.remove(node_id);
        self.replica_parents.remove(node_id);
        if let Some(root) = root {
            if let Some(members) = self.cluster_nodes.get_mut(&root) {
                members.remove(node_id);
                if members.is_empty() {
                    self.cluster_nodes.remove(&root);
                }
            }
            if self.nodes.contains_key(&root) {
                self.ensure_replica_coverage(sim, &root);
            }
        }
        info!(node = node_id, "node removed");
        true
    }

    // Failure injection --------------------------------------------------

    pub fn fail_link(&mut self, sim: &mut FabricSimulator, a: &str, b: &str) -> bool {
        if !self.nodes.contains_key(a) || !self.nodes.contains_key(b) {
            return false;
        }
        self.failed_links.insert((a.to_string(), b.to_string()));
        self.failed_links.insert((b.to_string(), a.to_string()));
        self.emit(
            sim.now(),
            NetworkEvent::LinkFailed {
                node_a: a.to_string(),
                node_b: b.to_string(),
            },
        );
        let key = link_key(a, b);
        let affected: Vec<u64> = self
            .active_chunks
            .values()
            .filter(|c| {
                let (u, v) = c.current_hop();
                link_key(u, v) == key
            })
            .map(|c| c.handle)
            .collect();
        for handle in affected {
            self.reroute_chunk(sim, handle);
        }
        true
    }

    pub fn restore_link(&mut self, sim: &mut FabricSimulator, a: &str, b: &str) {
        self.failed_links.remove(&(a.to_string(), b.to_string()));
        self.failed_links.remove(&(b.to_string(), a.to_string()));
        self.emit(
            sim.now(),
            NetworkEvent::LinkRestored {
                node_a: a.to_string(),
                node_b: b.to_string(),
            },
        );
    }

    pub fn fail_node(&mut self, sim: &mut FabricSimulator, node_id: &str) -> bool {
        if !self.nodes.contains_key(node_id) || self.failed_nodes.contains(node_id) {
            return false;
        }
        self.failed_nodes.insert(node_id.to_string());
        self.emit(
            sim.now(),
            NetworkEvent::NodeFailed {
                node_id: node_id.to_string(),
            },
        );

        // Transfers with the failed node as an endpoint fail immediately;
        // their pending disk commits become no-op events.
        let endpoint_transfers: Vec<String> = self
            .transfer_ops
            .iter()
            .filter(|(_, op)| op.source == node_id || op.target == node_id)
            .map(|(file_id, _)| file_id.clone())
            .collect();
        for file_id in endpoint_transfers {
            self.fail_transfer(sim, &file_id, "Node failure");
        }

        // Chunks routed through the node (not as an endpoint) reroute.
        let affected: Vec<u64> = self
            .active_chunks
            .values()
            .filter(|c| c.path.iter().any(|hop| hop == node_id))
            .map(|c| c.handle)
            .collect();
        for handle in affected {
            self.reroute_chunk(sim, handle);
        }

        self.ensure_replica_coverage(sim, node_id);
        true
    }

    /// Re-point a replica's parent (snapshot restore path).
    pub fn set_replica_parent(&mut self, node_id: &str, parent: &str) {
        if self.nodes.contains_key(node_id) {
            self.replica_parents
                .insert(node_id.to_string(), parent.to_string());
        }
    }

    /// Mark a node failed without reacting (snapshot restore path).
    pub fn mark_node_failed(&mut self, node_id: &str) {
        if self.nodes.contains_key(node_id) {
            self.failed_nodes.insert(node_id.to_string());
        }
    }

    /// Mark a link failed without reacting (snapshot restore path).
    pub fn mark_link_failed(&mut self, a: &str, b: &str) {
        self.failed_links.insert((a.to_string(), b.to_string()));
        self.failed_links.insert((b.to_string(), a.to_string()));
    }

    pub fn restore_node(&mut self, sim: &mut FabricSimulator, node_id: &str) {
        if self.failed_nodes.remove(node_id) {
            self.emit(
                sim.now(),
                NetworkEvent::NodeRestored {
                    node_id: node_id.to_string(),
                },
            );
        }
    }

    // Transfers ----------------------------------------------------------

    /// Operator-facing transfer of a new file from `source` onto `target`.
    pub fn initiate_file_transfer(
        &mut self,
        sim: &mut FabricSimulator,
        source: &str,
        target: &str,
        file_name: &str,
        file_size: u64,
    ) -> Option<FileTransfer> {
        let file_id = self.next_file_id(file_name, sim.now());
        self.begin_transfer(BeginTransfer {
            sim,
            source,
            target,
            file_name,
            file_size,
            preferred_chunk_size: None,
            purpose: TransferPurpose::Direct,
            backing_file_id: None,
            master_id: None,
            segment_offset: 0,
            is_retrieval: false,
            file_id,
        })
    }

    /// Start a retrieval-backed copy of `file_id` from `owner` to `target`.
    pub fn initiate_replica_transfer(
        &mut self,
        sim: &mut FabricSimulator,
        owner: &str,
        target: &str,
        file_id: &str,
    ) -> Option<FileTransfer> {
        self.replica_transfer_with_purpose(sim, owner, target, file_id, TransferPurpose::Replica)
    }

    pub(crate) fn replica_transfer_with_purpose(
        &mut self,
        sim: &mut FabricSimulator,
        owner: &str,
        target: &str,
        file_id: &str,
        purpose: TransferPurpose,
    ) -> Option<FileTransfer> {
        if owner == target {
            return None;
        }
        let now = sim.now();
        let retrieval = {
            let owner_node = self.nodes.get(owner)?;
            owner_node.retrieve_file(file_id, target, now)?
        };
        let chunk_hint = retrieval.chunks.iter().map(|c| c.size).max();
        let master_id = self.segment_owners.get(file_id).cloned();
        let segment_offset = master_id
            .as_ref()
            .and_then(|m| self.manifests_by_id.get(m))
            .and_then(|manifest| {
                manifest
                    .segments
                    .iter()
                    .find(|s| s.file_id == file_id)
                    .map(|s| s.offset)
            })
            .unwrap_or(0);
        let file_name = retrieval.file_name.clone();
        let total_size = retrieval.total_size;
        let new_id = retrieval.file_id.clone();
        self.begin_transfer(BeginTransfer {
            sim,
            source: owner,
            target,
            file_name: &file_name,
            file_size: total_size,
            preferred_chunk_size: chunk_hint,
            purpose,
            backing_file_id: Some(file_id.to_string()),
            master_id,
            segment_offset,
            is_retrieval: true,
            file_id: new_id,
        })
    }

    pub(crate) fn begin_transfer(&mut self, request: BeginTransfer<'_, '_>) -> Option<FileTransfer> {
        let BeginTransfer {
            sim,
            source,
            target,
            file_name,
            file_size,
            preferred_chunk_size,
            purpose,
            backing_file_id,
            master_id,
            segment_offset,
            is_retrieval,
            file_id,
        } = request;
        if !self.nodes.contains_key(source)
            || self.failed_nodes.contains(source)
            || !self.nodes.contains_key(target)
        {
            return None;
        }

        let mut candidates = vec![target.to_string()];
        if matches!(purpose, TransferPurpose::Direct | TransferPurpose::IngestSegment) {
            // The fabric may redirect to a healthy replica in the target's
            // cluster when the target itself cannot take the reservation.
            if let Some(root) = self.node_roots.get(target) {
                if let Some(members) = self.cluster_nodes.get(root) {
                    for member in members {
                        if member != target && !self.failed_nodes.contains(member) {
                            candidates.push(member.clone());
                        }
                    }
                }
            }
        }

        let now = sim.now();
        let mut routed_any = false;
        for candidate in candidates {
            if self.failed_nodes.contains(&candidate) {
                continue;
            }
            let Some(route) = self.compute_route(source, &candidate) else {
                continue;
            };
            routed_any = true;
            let chunk_hint = preferred_chunk_size
                .or_else(|| Some(self.recommend_chunk_size(file_size, Some(&route))));
            let accepted = {
                let Some(node) = self.nodes.get_mut(&candidate) else {
                    continue;
                };
                node.initiate_file_transfer(
                    &file_id,
                    file_name,
                    file_size,
                    now,
                    chunk_hint,
                    backing_file_id.clone(),
                    segment_offset,
                )
            };
            let Some(mut transfer) = accepted else {
                continue;
            };
            if is_retrieval {
                if let Some(node) = self.nodes.get_mut(&candidate) {
                    node.mark_transfer_retrieval(&file_id);
                }
                transfer.is_retrieval = true;
            }
            self.transfer_ops.insert(
                file_id.clone(),
                TransferOp {
                    source: source.to_string(),
                    target: candidate.clone(),
                    purpose,
                    is_retrieval,
                    backing_file_id: backing_file_id.clone(),
                    master_id: master_id.clone(),
                    segment_offset,
                    path: route,
                },
            );
            self.start_next_chunk(sim, &file_id);
            // The op may already be gone if the first chunk failed outright.
            return Some(transfer);
        }

        if !routed_any {
            self.emit(
                now,
                NetworkEvent::TransferFailed {
                    file_id,
                    source: source.to_string(),
                    target: target.to_string(),
                    reason: "No available route".to_string(),
                },
            );
        }
        None
    }

    // Ingestion ----------------------------------------------------------

    /// Ingest a file into the fabric, either locally on `source` or spread
    /// greedily across reachable nodes, registering a manifest either way.
    pub fn ingest_file(
        &mut self,
        sim: &mut FabricSimulator,
        source: &str,
        file_name: &str,
        file_size: u64,
        prefer_local: bool,
    ) -> Option<(String, FileTransfer)> {
        if !self.nodes.contains_key(source) || self.failed_nodes.contains(source) {
            return None;
        }
        let now = sim.now();

        if prefer_local {
            let transfer = self
                .nodes
                .get_mut(source)?
                .store_local_file(file_name, file_size, now)?;
            let master_id = transfer.file_id.clone();
            self.register_manifest(FabricManifest {
                master_id: master_id.clone(),
                file_name: file_name.to_string(),
                total_size: file_size,
                segments: vec![FileSegment {
                    node_id: source.to_string(),
                    file_id: master_id.clone(),
                    size: file_size,
                    offset: 0,
                }],
                created_at: now,
            });
            return Some((source.to_string(), transfer));
        }

        let reachable = self.reachable_from(source);
        let master_id = self.next_file_id(&format!("ingest-{file_name}"), now);
        let mut segments: Vec<FileSegment> = Vec::new();
        let mut started: Vec<String> = Vec::new();
        let mut excluded: BTreeSet<String> = BTreeSet::new();
        let mut first_transfer: Option<FileTransfer> = None;
        let mut offset = 0u64;
        let mut remaining = file_size;

        while remaining > 0 {
            let candidate = self.rank_ingest_candidates(source, &reachable, &excluded);
            let Some(candidate) = candidate else {
                break;
            };
            let free = self
                .nodes
                .get(&candidate)
                .map(|n| n.free_storage())
                .unwrap_or(0);
            if free == 0 {
                excluded.insert(candidate);
                continue;
            }
            let segment_size = remaining.min(free);
            let segment_id = self.next_file_id(&format!("seg-{file_name}-{offset}"), now);
            let placed = self.begin_transfer(BeginTransfer {
                sim: &mut *sim,
                source,
                target: &candidate,
                file_name,
                file_size: segment_size,
                preferred_chunk_size: None,
                purpose: TransferPurpose::IngestSegment,
                backing_file_id: Some(master_id.clone()),
                master_id: Some(master_id.clone()),
                segment_offset: offset,
                is_retrieval: false,
                file_id: segment_id,
            });
            match placed {
                None => {
                    excluded.insert(candidate);
                }
                Some(transfer) => {
                    let actual_target = transfer
                        .target_node
                        .clone()
                        .unwrap_or_else(|| candidate.clone());
                    segments.push(FileSegment {
                        node_id: actual_target,
                        file_id: transfer.file_id.clone(),
                        size: segment_size,
                        offset,
                    });
                    started.push(transfer.file_id.clone());
                    offset += segment_size;
                    remaining -= segment_size;
                    if first_transfer.is_none() {
                        first_transfer = Some(transfer);
                    }
                }
            }
        }

        if remaining > 0 {
            // Could not place every byte: release what was started.
            for file_id in started {
                self.fail_transfer(sim, &file_id, "Ingestion aborted");
            }
            warn!(file_name, file_size, "ingestion could not place all bytes");
            return None;
        }

        self.register_manifest(FabricManifest {
            master_id,
            file_name: file_name.to_string(),
            total_size: file_size,
            segments,
            created_at: now,
        });
        first_transfer.map(|t| (source.to_string(), t))
    }

    fn rank_ingest_candidates(
        &self,
        source: &str,
        reachable: &BTreeSet<String>,
        excluded: &BTreeSet<String>,
    ) -> Option<String> {
        let source_root = self.node_roots.get(source);
        let mut ranked: Vec<(u8, u64, &String)> = Vec::new();
        for (node_id, node) in &self.nodes {
            if excluded.contains(node_id)
                || self.failed_nodes.contains(node_id)
                || !reachable.contains(node_id)
                || node.free_storage() == 0
            {
                continue;
            }
            let priority = if node_id == source {
                2
            } else if source_root.is_some() && self.node_roots.get(node_id) == source_root {
                0
            } else {
                1
            };
            // Projected-usage ratio in parts-per-million keeps the sort key
            // integral and total.
            let total = node.total_storage().max(1);
            let ratio_ppm = node.projected_storage_usage() * 1_000_000 / total;
            ranked.push((priority, ratio_ppm, node_id));
        }
        ranked.sort();
        ranked.first().map(|(_, _, id)| (*id).clone())
    }

    pub(crate) fn register_manifest(&mut self, manifest: FabricManifest) {
        for segment in &manifest.segments {
            self.segment_owners
                .insert(segment.file_id.clone(), manifest.master_id.clone());
        }
        self.manifest_names
            .insert(manifest.file_name.clone(), manifest.master_id.clone());
        self.manifests_by_id
            .insert(manifest.master_id.clone(), manifest);
    }

    // Retrieval / assembly ----------------------------------------------

    /// Nodes holding a named file, manifest placements first, roots before
    /// replicas in the stored-file fallback.
    pub fn locate_file(&self, file_name: &str) -> Vec<String> {
        if let Some(manifest) = self.manifest_for_name(file_name) {
            let mut seen = BTreeSet::new();
            let mut out = Vec::new();
            for segment in &manifest.segments {
                if seen.insert(segment.node_id.clone()) {
                    out.push(segment.node_id.clone());
                }
            }
            return out;
        }
        let mut holders: Vec<(bool, f64, String)> = Vec::new();
        for (node_id, node) in &self.nodes {
            for transfer in node.stored_files().values() {
                if transfer.file_name == file_name {
                    let is_root = self.node_roots.get(node_id) == Some(node_id);
                    holders.push((
                        is_root,
                        transfer.completed_at.unwrap_or(transfer.created_at),
                        node_id.clone(),
                    ));
                    break;
                }
            }
        }
        holders.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then(a.1.total_cmp(&b.1))
                .then(a.2.cmp(&b.2))
        });
        holders.into_iter().map(|(_, _, id)| id).collect()
    }

    /// Gather every segment of a named file onto `target`, rewriting the
    /// manifest as the copies land.
    pub fn assemble_file(
        &mut self,
        sim: &mut FabricSimulator,
        file_name: &str,
        target: &str,
    ) -> AssembleOutcome {
        if !self.nodes.contains_key(target) {
            return AssembleOutcome::NotFound;
        }
        let Some(manifest) = self.manifest_for_name(file_name).cloned() else {
            let local_ids: Vec<String> = self
                .nodes
                .get(target)
                .map(|node| {
                    node.stored_files()
                        .values()
                        .filter(|t| t.file_name == file_name)
                        .map(|t| t.file_id.clone())
                        .collect()
                })
                .unwrap_or_default();
            if local_ids.is_empty() {
                return AssembleOutcome::NotFound;
            }
            return AssembleOutcome::AlreadyLocal(local_ids);
        };

        let mut local = Vec::new();
        let mut started = Vec::new();
        for segment in &manifest.segments {
            if segment.node_id == target {
                local.push(segment.file_id.clone());
                continue;
            }
            if let Some(transfer) = self.replica_transfer_with_purpose(
                sim,
                &segment.node_id.clone(),
                target,
                &segment.file_id.clone(),
                TransferPurpose::Assemble,
            ) {
                started.push(transfer.file_id);
            }
        }
        if started.is_empty() {
            AssembleOutcome::AlreadyLocal(local)
        } else {
            AssembleOutcome::Started(started)
        }
    }

    /// Healing GC: drop a manifest and every physical copy it references.
    pub fn purge_manifest(&mut self, master_id: &str) {
        let Some(manifest) = self.manifests_by_id.remove(master_id) else {
            return;
        };
        self.manifest_names.remove(&manifest.file_name);
        for segment in &manifest.segments {
            self.segment_owners.remove(&segment.file_id);
            if let Some(node) = self.nodes.get_mut(&segment.node_id) {
                node.purge_stored_file(&segment.file_id);
            }
        }
        info!(master_id, "manifest purged");
    }

    /// Snapshot restore: re-materialize a stored file record on a node.
    pub fn restore_file_record(
        &mut self,
        node_id: &str,
        file_id: &str,
        file_name: &str,
        file_size: u64,
        now: f64,
    ) -> bool {
        self.nodes
            .get_mut(node_id)
            .and_then(|node| node.store_local_file_with_id(file_id, file_name, file_size, now))
            .is_some()
    }

    // Event dispatch -----------------------------------------------------

    pub fn handle_event(&mut self, sim: &mut FabricSimulator, event: FabricEvent) {
        match event {
            FabricEvent::NetworkTick => self.network_tick(sim),
            FabricEvent::DiskCommit {
                target,
                file_id,
                chunk_id,
            } => self.handle_disk_commit(sim, &target, &file_id, chunk_id),
            FabricEvent::ReplicaSeed {
                parent,
                replica,
                attempt,
            } => self.handle_replica_seed(sim, &parent, &replica, attempt),
        }
    }
}

/// Argument bundle for [`StorageVirtualNetwork::begin_transfer`].
pub(crate) struct BeginTransfer<'a, 'b> {
    pub sim: &'a mut FabricSimulator,
    pub source: &'b str,
    pub target: &'b str,
    pub file_name: &'b str,
    pub file_size: u64,
    pub preferred_chunk_size: Option<u64>,
    pub purpose: TransferPurpose,
    pub backing_file_id: Option<String>,
    pub master_id: Option<String>,
    pub segment_offset: u64,
    pub is_retrieval: bool,
    pub file_id: String,
}
