use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiskError {
    #[error("file {0} is not reserved")]
    UnknownFile(String),

    #[error("chunk {chunk_id} not found for {file_id}")]
    UnknownChunk { file_id: String, chunk_id: u32 },

    #[error("file {0} already reserved")]
    DuplicateFile(String),

    #[error("{op} already scheduled for {file_id}:{chunk_id}")]
    DuplicateOp {
        file_id: String,
        chunk_id: u32,
        op: &'static str,
    },

    #[error("no pending {op} for {file_id}:{chunk_id}")]
    NoPendingOp {
        file_id: String,
        chunk_id: u32,
        op: &'static str,
    },

    #[error("invalid size: {0}")]
    InvalidSize(String),

    #[error("payload length {actual} does not match expected size {expected}")]
    PayloadMismatch { expected: u64, actual: u64 },

    #[error("chunk {chunk_id} corrupted for {file_id}")]
    Corruption { file_id: String, chunk_id: u32 },

    #[error("committed more bytes than reserved for {0}")]
    OverCommit(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type DiskResult<T> = std::result::Result<T, DiskError>;
