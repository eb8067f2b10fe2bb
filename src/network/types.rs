use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    LinkState,
    DistanceVector,
}

/// One physical placement of a slice of a logical file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSegment {
    pub node_id: String,
    pub file_id: String,
    pub size: u64,
    pub offset: u64,
}

/// Fabric-level manifest: where a logical file's bytes physically live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FabricManifest {
    pub master_id: String,
    pub file_name: String,
    pub total_size: u64,
    pub segments: Vec<FileSegment>,
    pub created_at: f64,
}

/// Per-node load snapshot driving demand-scaling decisions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NodeTelemetry {
    pub storage_ratio: f64,
    pub bandwidth_ratio: f64,
    pub os_memory_ratio: f64,
    pub os_failure_delta: u64,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingTrigger {
    Storage,
    Bandwidth,
    OsMemory,
    OsFailures,
}

impl ScalingTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            ScalingTrigger::Storage => "storage",
            ScalingTrigger::Bandwidth => "bandwidth",
            ScalingTrigger::OsMemory => "os_memory",
            ScalingTrigger::OsFailures => "os_failures",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemandScalingConfig {
    pub storage_threshold: f64,
    pub bandwidth_threshold: f64,
    pub os_memory_threshold: f64,
    pub os_failure_delta: u64,
    pub min_replicas_per_root: usize,
    pub max_replicas_per_root: usize,
    pub replica_seed_limit: usize,
    pub trigger_priority: Vec<ScalingTrigger>,
    pub auto_replication_enabled: bool,
}

impl Default for DemandScalingConfig {
    fn default() -> Self {
        Self {
            storage_threshold: 0.85,
            bandwidth_threshold: 0.9,
            os_memory_threshold: 0.9,
            os_failure_delta: 5,
            min_replicas_per_root: 1,
            max_replicas_per_root: 3,
            replica_seed_limit: 3,
            trigger_priority: vec![
                ScalingTrigger::Storage,
                ScalingTrigger::Bandwidth,
                ScalingTrigger::OsMemory,
                ScalingTrigger::OsFailures,
            ],
            auto_replication_enabled: true,
        }
    }
}

/// Why a transfer exists; drives manifest bookkeeping at completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPurpose {
    /// Operator-initiated point-to-point transfer.
    Direct,
    /// One segment of a distributed ingestion.
    IngestSegment,
    /// Additional copy of an existing segment (coverage / seeding).
    Replica,
    /// Copy that re-homes a manifest segment onto the target.
    Assemble,
}

/// A chunk in flight across the fabric. It occupies exactly one link at a
/// time: the hop `(path[hop_index], path[hop_index + 1])`.
#[derive(Debug, Clone)]
pub struct ActiveChunk {
    pub handle: u64,
    pub file_id: String,
    pub chunk_id: u32,
    pub chunk_size: u64,
    pub remaining_bytes: f64,
    pub path: Vec<String>,
    pub hop_index: usize,
    pub sender_pid: Option<u32>,
}

impl ActiveChunk {
    pub fn current_hop(&self) -> (&str, &str) {
        (
            self.path[self.hop_index].as_str(),
            self.path[self.hop_index + 1].as_str(),
        )
    }

    pub fn on_last_hop(&self) -> bool {
        self.hop_index + 2 >= self.path.len()
    }
}

/// Simulator payloads for the fabric. Events carry ids, never references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FabricEvent {
    NetworkTick,
    DiskCommit {
        target: String,
        file_id: String,
        chunk_id: u32,
    },
    ReplicaSeed {
        parent: String,
        replica: String,
        attempt: u32,
    },
}

/// Externally observable state changes, published to registered observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NetworkEvent {
    TransferCompleted {
        file_id: String,
        source: String,
        target: String,
        completed_at: f64,
        route: Vec<String>,
    },
    TransferFailed {
        file_id: String,
        source: String,
        target: String,
        reason: String,
    },
    ChunkCompleted {
        file_id: String,
        chunk_id: u32,
        source: String,
        target: String,
    },
    ReplicaSyncFailed {
        parent: String,
        replica: String,
        reason: String,
    },
    ReplicaSpawned {
        parent: String,
        replica: String,
        trigger: String,
    },
    NodeFailed {
        node_id: String,
    },
    NodeRestored {
        node_id: String,
    },
    LinkFailed {
        node_a: String,
        node_b: String,
    },
    LinkRestored {
        node_a: String,
        node_b: String,
    },
}

impl NetworkEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            NetworkEvent::TransferCompleted { .. } => "transfer_completed",
            NetworkEvent::TransferFailed { .. } => "transfer_failed",
            NetworkEvent::ChunkCompleted { .. } => "chunk_completed",
            NetworkEvent::ReplicaSyncFailed { .. } => "replica_sync_failed",
            NetworkEvent::ReplicaSpawned { .. } => "replica_spawned",
            NetworkEvent::NodeFailed { .. } => "node_failed",
            NetworkEvent::NodeRestored { .. } => "node_restored",
            NetworkEvent::LinkFailed { .. } => "link_failed",
            NetworkEvent::LinkRestored { .. } => "link_restored",
        }
    }
}

/// Result of asking the fabric to gather a named file onto one node.
#[derive(Debug, Clone)]
pub enum AssembleOutcome {
    /// Every segment already lives on the target; ids of the local copies.
    AlreadyLocal(Vec<String>),
    /// Replica transfers were started for the listed segment file ids.
    Started(Vec<String>),
    NotFound,
}

/// Internal bookkeeping for a transfer crossing the fabric.
#[derive(Debug, Clone)]
pub(crate) struct TransferOp {
    pub source: String,
    pub target: String,
    pub purpose: TransferPurpose,
    pub is_retrieval: bool,
    pub backing_file_id: Option<String>,
    pub master_id: Option<String>,
    pub segment_offset: u64,
    pub path: Vec<String>,
}
