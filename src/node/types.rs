use serde::{Deserialize, Serialize};

use crate::disk::DiskIoTicket;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChunk {
    pub chunk_id: u32,
    pub size: u64,
    pub checksum: String,
    pub status: TransferStatus,
    pub stored_node: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTransfer {
    pub file_id: String,
    pub file_name: String,
    pub total_size: u64,
    pub chunks: Vec<FileChunk>,
    pub status: TransferStatus,
    pub created_at: f64,
    pub completed_at: Option<f64>,
    pub is_retrieval: bool,
    pub backing_file_id: String,
    pub target_node: Option<String>,
    pub segment_offset: u64,
}

impl FileTransfer {
    pub fn next_pending_chunk(&self) -> Option<&FileChunk> {
        self.chunks
            .iter()
            .find(|c| c.status != TransferStatus::Completed)
    }
}

/// Outcome of handing a chunk to a node: whether the ingest path accepted it
/// and when its disk commit will land.
#[derive(Debug, Clone, Copy)]
pub struct ChunkCommitResult {
    pub success: bool,
    pub completion_time: f64,
}

#[derive(Debug, Clone)]
pub(crate) struct PendingDiskWrite {
    pub ticket: DiskIoTicket,
    pub chunk_id: u32,
}
