mod store;
mod types;

use std::sync::Arc;

use chrono::{DateTime, Utc};

pub use store::MetadataStore;
pub use types::{
    ChunkState, ChunkStatus, DurabilityMetadata, EncryptionEnvelope, FileEntry, FileManifest,
    FileVersion, ManifestSegment, SessionStatus, UploadSession, PARITY_TIER,
};

/// Injectable wall-clock used by the control plane so tests can drive
/// session expiry and lifecycle idle windows.
pub type WallClock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> WallClock {
    Arc::new(Utc::now)
}
