mod disk;
mod error;
mod types;

pub use disk::VirtualDisk;
pub use error::{DiskError, DiskResult};
pub use types::{DiskChunk, DiskFile, DiskIoProfile, DiskIoTicket, DiskOpKind};
