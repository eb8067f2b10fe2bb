use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Throughput + seek model for a node's disk. Latency fidelity beyond this
/// single model is out of scope.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DiskIoProfile {
    pub throughput_bytes_per_sec: u64,
    pub seek_time_ms: f64,
    /// Number of concurrent I/O channels.
    pub max_outstanding: usize,
}

impl Default for DiskIoProfile {
    fn default() -> Self {
        Self {
            throughput_bytes_per_sec: 200 * 1024 * 1024,
            seek_time_ms: 2.5,
            max_outstanding: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DiskOpKind {
    Write,
    Read,
}

impl DiskOpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DiskOpKind::Write => "write",
            DiskOpKind::Read => "read",
        }
    }
}

/// Reservation against one of the disk's I/O channels.
#[derive(Debug, Clone)]
pub struct DiskIoTicket {
    pub file_id: String,
    pub chunk_id: u32,
    pub op: DiskOpKind,
    pub completion_time: f64,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct DiskChunk {
    pub size: u64,
    pub payload: Option<Bytes>,
    pub checksum: String,
    pub corrupted: bool,
}

#[derive(Debug, Clone)]
pub struct DiskFile {
    pub file_id: String,
    pub total_size: u64,
    pub committed_bytes: u64,
    pub chunks: BTreeMap<u32, DiskChunk>,
    pub path: String,
    pub metadata: BTreeMap<String, String>,
}
