//! Stateful operator surface over the simulator + network pair.
//!
//! Every mutation of fabric state funnels through this controller, which
//! owns the simulator and drives its event loop; sharing it behind a mutex
//! serializes control-plane callers onto that single execution context.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::network::{
    AssembleOutcome, DemandScalingConfig, FabricSimulator, NetworkEvent, StorageVirtualNetwork,
};
use crate::node::{FileTransfer, StorageVirtualNode};
use crate::sim::Simulator;

use super::error::{ControllerError, ControllerResult};

pub const ZONE_CATALOG: [&str; 10] = [
    "us-east-1a",
    "us-east-1b",
    "us-east-2a",
    "us-west-1a",
    "us-west-2b",
    "eu-central-1a",
    "eu-west-1b",
    "ap-south-1a",
    "ap-northeast-1c",
    "sa-east-1a",
];

const DEFAULT_TICK_INTERVAL: f64 = 0.005;
const DEFAULT_EVENT_HISTORY: usize = 200;
const DEFAULT_SEED: u64 = 42;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub time: f64,
    pub event: NetworkEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: String,
    pub online: bool,
    pub storage_used: u64,
    pub storage_total: u64,
    pub bandwidth_bps: u64,
    pub zone: Option<String>,
    pub replica_parent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub online: bool,
    pub neighbors: Vec<String>,
    pub used_storage: u64,
    pub total_storage: u64,
    pub bandwidth_bps: u64,
    pub zone: Option<String>,
    pub replica_parent: Option<String>,
    pub telemetry: Option<crate::network::NodeTelemetry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub storage_gb: u64,
    pub bandwidth_mbps: u64,
    pub cpu_capacity: u32,
    pub memory_gb: u64,
    pub root_id: Option<String>,
    pub zone: Option<String>,
}

impl Default for NodeSpec {
    fn default() -> Self {
        Self {
            storage_gb: 500,
            bandwidth_mbps: 1000,
            cpu_capacity: 8,
            memory_gb: 32,
            root_id: None,
            zone: None,
        }
    }
}

/// Result of a `pull_file` request.
#[derive(Debug, Clone)]
pub enum PullOutcome {
    /// The file already lives on the requested node.
    AlreadyStored(Vec<String>),
    /// Replica transfers were started for the listed file ids.
    Started(Vec<String>),
    NotFound,
}

pub struct FabricController {
    simulator: FabricSimulator,
    network: StorageVirtualNetwork,
    events: Arc<Mutex<VecDeque<EventRecord>>>,
    rng: StdRng,
}

impl FabricController {
    pub fn new() -> Self {
        Self::with_options(DEFAULT_TICK_INTERVAL, DEFAULT_SEED, DEFAULT_EVENT_HISTORY)
    }

    pub fn with_options(tick_interval: f64, seed: u64, event_history: usize) -> Self {
        let mut network = StorageVirtualNetwork::new(tick_interval);
        let events: Arc<Mutex<VecDeque<EventRecord>>> = Arc::new(Mutex::new(VecDeque::new()));
        let sink = Arc::clone(&events);
        let capacity = event_history.max(1);
        network.register_observer(Box::new(move |time, event| {
            let mut history = sink.lock();
            if history.len() >= capacity {
                history.pop_front();
            }
            history.push_back(EventRecord {
                time,
                event: event.clone(),
            });
        }));
        Self {
            simulator: Simulator::new(),
            network,
            events,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn network(&self) -> &StorageVirtualNetwork {
        &self.network
    }

    pub fn network_mut(&mut self) -> &mut StorageVirtualNetwork {
        &mut self.network
    }

    pub fn simulator(&self) -> &FabricSimulator {
        &self.simulator
    }

    pub fn now(&self) -> f64 {
        self.simulator.now()
    }

    pub fn set_scaling_config(&mut self, config: DemandScalingConfig) {
        self.network.set_scaling_config(config);
    }

    // Events -------------------------------------------------------------

    pub fn recent_events(&self, limit: usize) -> Vec<EventRecord> {
        let history = self.events.lock();
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    pub(crate) fn event_history(&self) -> Vec<EventRecord> {
        self.events.lock().iter().cloned().collect()
    }

    pub(crate) fn load_event_history(&mut self, records: Vec<EventRecord>) {
        let mut history = self.events.lock();
        history.clear();
        history.extend(records);
    }

    pub(crate) fn set_clock(&mut self, clock: f64) {
        self.simulator = Simulator::starting_at(clock);
    }

    // Node management ----------------------------------------------------

    pub fn add_node(&mut self, node_id: &str, spec: NodeSpec) -> ControllerResult<()> {
        if self.network.node(node_id).is_some() {
            return Err(ControllerError::DuplicateNode(node_id.to_string()));
        }
        let zone = spec.zone.clone().unwrap_or_else(|| self.random_zone());
        let node = StorageVirtualNode::new(
            node_id,
            spec.cpu_capacity,
            spec.memory_gb,
            spec.storage_gb,
            spec.bandwidth_mbps,
            Some(zone),
        );
        self.network.add_node(node, spec.root_id.as_deref());
        Ok(())
    }

    pub fn remove_node(&mut self, node_id: &str) -> bool {
        self.network.remove_node(&mut self.simulator, node_id)
    }

    pub fn list_node_status(&self) -> Vec<NodeStatus> {
        self.network
            .node_ids()
            .map(|node_id| {
                let node = self.network.node(node_id).expect("listed id exists");
                NodeStatus {
                    node_id: node_id.clone(),
                    online: !self.network.is_failed(node_id),
                    storage_used: node.used_storage(),
                    storage_total: node.total_storage(),
                    bandwidth_bps: node.bandwidth_bps(),
                    zone: node.zone().map(String::from),
                    replica_parent: self.network.replica_parent(node_id).map(String::from),
                }
            })
            .collect()
    }

    pub fn get_node_info(&self, node_id: &str) -> Option<NodeInfo> {
        let node = self.network.node(node_id)?;
        Some(NodeInfo {
            node_id: node_id.to_string(),
            online: !self.network.is_failed(node_id),
            neighbors: node.connections().keys().cloned().collect(),
            used_storage: node.used_storage(),
            total_storage: node.total_storage(),
            bandwidth_bps: node.bandwidth_bps(),
            zone: node.zone().map(String::from),
            replica_parent: self.network.replica_parent(node_id).map(String::from),
            telemetry: self.network.node_telemetry(node_id),
        })
    }

    pub fn get_clusters(&self) -> BTreeMap<String, Vec<String>> {
        self.network
            .clusters()
            .iter()
            .map(|(root, members)| (root.clone(), members.iter().cloned().collect()))
            .collect()
    }

    // Topology -----------------------------------------------------------

    /// Connect two nodes. Missing profile values are inferred from the
    /// zone relationship of the endpoints (seeded, reproducible).
    pub fn connect_nodes(
        &mut self,
        node_a: &str,
        node_b: &str,
        bandwidth_mbps: Option<u64>,
        latency_ms: Option<f64>,
    ) -> bool {
        let (inferred_bw, inferred_latency) = self.auto_link_profile(node_a, node_b);
        let bandwidth = bandwidth_mbps.unwrap_or(inferred_bw);
        let latency = latency_ms.unwrap_or(inferred_latency);
        self.network.connect_nodes(node_a, node_b, bandwidth, latency)
    }

    pub fn disconnect_nodes(&mut self, node_a: &str, node_b: &str) -> bool {
        self.network.disconnect_nodes(node_a, node_b)
    }

    // Transfers ----------------------------------------------------------

    pub fn initiate_transfer(
        &mut self,
        source: &str,
        target: &str,
        file_name: &str,
        size_bytes: u64,
    ) -> ControllerResult<FileTransfer> {
        self.network
            .initiate_file_transfer(&mut self.simulator, source, target, file_name, size_bytes)
            .ok_or_else(|| {
                ControllerError::TransferRejected(
                    "insufficient capacity or no available route".to_string(),
                )
            })
    }

    /// Ingest a file into the fabric and register its manifest.
    pub fn push_file(
        &mut self,
        source: &str,
        file_name: &str,
        size_bytes: u64,
        prefer_local: bool,
    ) -> ControllerResult<(String, FileTransfer)> {
        self.network
            .ingest_file(&mut self.simulator, source, file_name, size_bytes, prefer_local)
            .ok_or_else(|| {
                ControllerError::TransferRejected("could not place file into fabric".to_string())
            })
    }

    /// Gather a named file onto one node.
    pub fn pull_file(&mut self, file_name: &str, target: &str) -> PullOutcome {
        match self
            .network
            .assemble_file(&mut self.simulator, file_name, target)
        {
            AssembleOutcome::AlreadyLocal(ids) => PullOutcome::AlreadyStored(ids),
            AssembleOutcome::Started(ids) => PullOutcome::Started(ids),
            AssembleOutcome::NotFound => PullOutcome::NotFound,
        }
    }

    pub fn store_file_locally(
        &mut self,
        node_id: &str,
        file_name: &str,
        size_bytes: u64,
    ) -> Option<FileTransfer> {
        let now = self.simulator.now();
        self.network
            .node_mut(node_id)
            .and_then(|node| node.store_local_file(file_name, size_bytes, now))
    }

    pub fn locate_file(&self, file_name: &str) -> Vec<String> {
        self.network.locate_file(file_name)
    }

    // Simulation control -------------------------------------------------

    pub fn run_until_idle(&mut self) {
        while let Some(event) = self.simulator.pop_due(None) {
            self.network.handle_event(&mut self.simulator, event.payload);
        }
    }

    pub fn run_for(&mut self, duration: f64) {
        let horizon = self.simulator.now() + duration.max(0.0);
        while let Some(event) = self.simulator.pop_due(Some(horizon)) {
            self.network.handle_event(&mut self.simulator, event.payload);
        }
    }

    pub fn refresh_telemetry(&mut self) {
        let now = self.simulator.now();
        self.network.refresh_telemetry(now);
    }

    // Failure injection --------------------------------------------------

    pub fn fail_node(&mut self, node_id: &str) -> bool {
        self.network.fail_node(&mut self.simulator, node_id)
    }

    pub fn restore_node(&mut self, node_id: &str) {
        self.network.restore_node(&mut self.simulator, node_id);
    }

    pub fn fail_link(&mut self, node_a: &str, node_b: &str) -> bool {
        self.network.fail_link(&mut self.simulator, node_a, node_b)
    }

    pub fn restore_link(&mut self, node_a: &str, node_b: &str) {
        self.network
            .restore_link(&mut self.simulator, node_a, node_b);
    }

    // Fabric access for control-plane services ---------------------------

    pub fn initiate_replica_transfer(
        &mut self,
        owner: &str,
        target: &str,
        file_id: &str,
    ) -> Option<FileTransfer> {
        self.network
            .initiate_replica_transfer(&mut self.simulator, owner, target, file_id)
    }

    // Zones --------------------------------------------------------------

    fn random_zone(&mut self) -> String {
        let index = self.rng.gen_range(0..ZONE_CATALOG.len());
        ZONE_CATALOG[index].to_string()
    }

    fn zone_region(zone: Option<&str>) -> Option<String> {
        let zone = zone?;
        let tokens: Vec<&str> = zone.split('-').collect();
        if tokens.len() < 3 {
            return Some(zone.to_string());
        }
        Some(tokens[..3].join("-"))
    }

    /// Infer a link profile from the endpoints' zone relationship:
    /// same-zone links are fast and near, cross-region links slow and far.
    fn auto_link_profile(&mut self, node_a: &str, node_b: &str) -> (u64, f64) {
        let zone_a = self.network.node(node_a).and_then(|n| n.zone().map(String::from));
        let zone_b = self.network.node(node_b).and_then(|n| n.zone().map(String::from));
        if zone_a.is_none() && zone_b.is_none() {
            return (1000, 1.0);
        }
        let same_zone = zone_a.is_some() && zone_a == zone_b;
        let region_a = Self::zone_region(zone_a.as_deref());
        let region_b = Self::zone_region(zone_b.as_deref());
        let same_region = region_a.is_some() && region_a == region_b;
        if same_zone {
            let bandwidth = self.rng.gen_range(1800..=2500);
            let latency = self.rng.gen_range(0.2..0.8);
            (bandwidth, (latency * 100.0_f64).round() / 100.0)
        } else if same_region {
            let bandwidth = self.rng.gen_range(900..=1600);
            let latency = self.rng.gen_range(2.0..7.0);
            (bandwidth, (latency * 100.0_f64).round() / 100.0)
        } else {
            let bandwidth = self.rng.gen_range(300..=900);
            let latency = self.rng.gen_range(20.0..80.0);
            (bandwidth, (latency * 100.0_f64).round() / 100.0)
        }
    }
}

impl Default for FabricController {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse operator size literals like `1.5gb`, `200mb`, `64kb`, `512b`.
pub fn parse_size(value: &str) -> ControllerResult<u64> {
    let value = value.trim().to_lowercase();
    let parse_float = |s: &str| -> ControllerResult<f64> {
        s.parse::<f64>()
            .map_err(|_| ControllerError::InvalidSize(value.clone()))
    };
    let bytes = if let Some(stripped) = value.strip_suffix("gb") {
        parse_float(stripped)? * 1024.0 * 1024.0 * 1024.0
    } else if let Some(stripped) = value.strip_suffix("mb") {
        parse_float(stripped)? * 1024.0 * 1024.0
    } else if let Some(stripped) = value.strip_suffix("kb") {
        parse_float(stripped)? * 1024.0
    } else if let Some(stripped) = value.strip_suffix('b') {
        parse_float(stripped)?
    } else {
        parse_float(&value)?
    };
    if bytes < 0.0 {
        return Err(ControllerError::InvalidSize(value));
    }
    Ok(bytes as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::TransferStatus;

    fn two_node_controller() -> FabricController {
        let mut controller = FabricController::new();
        controller
            .add_node("A", NodeSpec::default())
            .unwrap();
        controller
            .add_node("B", NodeSpec::default())
            .unwrap();
        controller.connect_nodes("A", "B", Some(1000), Some(1.0));
        controller
    }

    #[test]
    fn add_node_rejects_duplicates() {
        let mut controller = FabricController::new();
        controller.add_node("A", NodeSpec::default()).unwrap();
        assert!(matches!(
            controller.add_node("A", NodeSpec::default()),
            Err(ControllerError::DuplicateNode(_))
        ));
    }

    #[test]
    fn zones_are_assigned_deterministically_per_seed() {
        let mut a = FabricController::with_options(0.005, 7, 50);
        let mut b = FabricController::with_options(0.005, 7, 50);
        for id in ["n1", "n2", "n3"] {
            a.add_node(id, NodeSpec::default()).unwrap();
            b.add_node(id, NodeSpec::default()).unwrap();
        }
        let zones_a: Vec<_> = a.list_node_status().into_iter().map(|s| s.zone).collect();
        let zones_b: Vec<_> = b.list_node_status().into_iter().map(|s| s.zone).collect();
        assert_eq!(zones_a, zones_b);
    }

    #[test]
    fn transfer_completes_end_to_end() {
        let mut controller = two_node_controller();
        let transfer = controller
            .initiate_transfer("A", "B", "report.bin", 10 * 1024 * 1024)
            .unwrap();
        controller.run_until_idle();
        let stored = controller
            .network()
            .node("B")
            .unwrap()
            .stored_file(&transfer.file_id)
            .cloned()
            .unwrap();
        assert_eq!(stored.status, TransferStatus::Completed);
        assert_eq!(stored.total_size, 10 * 1024 * 1024);
        assert!(controller
            .recent_events(10)
            .iter()
            .any(|r| r.event.kind() == "transfer_completed"));
    }

    #[test]
    fn run_for_stops_at_horizon() {
        let mut controller = two_node_controller();
        controller
            .initiate_transfer("A", "B", "big.bin", 200 * 1024 * 1024)
            .unwrap();
        controller.run_for(0.010);
        assert!(controller.now() <= 0.011);
        controller.run_until_idle();
        assert!(controller.now() > 0.011);
    }

    #[test]
    fn push_and_locate_prefer_local() {
        let mut controller = two_node_controller();
        let (node, transfer) = controller
            .push_file("A", "local.bin", 1024 * 1024, true)
            .unwrap();
        assert_eq!(node, "A");
        assert_eq!(transfer.status, TransferStatus::Completed);
        assert_eq!(controller.locate_file("local.bin"), vec!["A".to_string()]);
    }

    #[test]
    fn pull_file_returns_already_stored_without_new_ops() {
        let mut controller = two_node_controller();
        controller.push_file("A", "doc.bin", 1024 * 1024, true).unwrap();
        let pending_before = controller.network().active_transfer_count();
        match controller.pull_file("doc.bin", "A") {
            PullOutcome::AlreadyStored(ids) => assert_eq!(ids.len(), 1),
            other => panic!("expected AlreadyStored, got {other:?}"),
        }
        assert_eq!(controller.network().active_transfer_count(), pending_before);
    }

    #[test]
    fn parse_size_handles_units() {
        assert_eq!(parse_size("512b").unwrap(), 512);
        assert_eq!(parse_size("64kb").unwrap(), 64 * 1024);
        assert_eq!(parse_size("1.5mb").unwrap(), 1024 * 1024 + 512 * 1024);
        assert_eq!(parse_size("2gb").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("1000").unwrap(), 1000);
        assert!(parse_size("twelve").is_err());
    }
}
