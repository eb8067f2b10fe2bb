mod node;
mod types;

pub use node::StorageVirtualNode;
pub use types::{ChunkCommitResult, FileChunk, FileTransfer, TransferStatus};
