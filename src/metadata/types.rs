//! Control-plane data models shared across the orchestrator and the
//! replica / lifecycle / durability / healing services.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::network::FabricManifest;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub id: String,
    pub org_id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub checksum: Option<String>,
    pub is_folder: bool,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub deleted_by: Option<String>,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionEnvelope {
    pub algorithm: String,
    pub kek_id: String,
    pub dek_id: String,
    pub last_rotated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurabilityMetadata {
    pub data_fragments: u32,
    pub parity_fragments: u32,
    pub checksum_algorithm: Option<String>,
    pub encryption_algorithm: Option<String>,
}

pub const PARITY_TIER: &str = "parity";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestSegment {
    pub node_id: String,
    pub file_id: String,
    pub offset: u64,
    pub length: u64,
    pub checksum: Option<String>,
    pub storage_tier: String,
    pub zone: Option<String>,
    pub encrypted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileManifest {
    pub manifest_id: String,
    pub file_id: String,
    pub total_size: u64,
    pub segments: Vec<ManifestSegment>,
    pub encryption: Option<EncryptionEnvelope>,
    pub durability: Option<DurabilityMetadata>,
}

impl FileManifest {
    /// Translate a fabric manifest into the control-plane model. Zones come
    /// from the zone lookup; every segment starts in the hot tier.
    pub fn from_fabric<F>(manifest: &FabricManifest, hot_tier: &str, mut zone_of: F) -> Self
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut segments: Vec<ManifestSegment> = manifest
            .segments
            .iter()
            .map(|s| ManifestSegment {
                node_id: s.node_id.clone(),
                file_id: s.file_id.clone(),
                offset: s.offset,
                length: s.size,
                checksum: None,
                storage_tier: hot_tier.to_string(),
                zone: zone_of(&s.node_id),
                encrypted: false,
            })
            .collect();
        segments.sort_by_key(|s| s.offset);
        Self {
            manifest_id: manifest.master_id.clone(),
            file_id: manifest.master_id.clone(),
            total_size: manifest.total_size,
            segments,
            encryption: None,
            durability: None,
        }
    }

    pub fn data_segments(&self) -> impl Iterator<Item = &ManifestSegment> {
        self.segments.iter().filter(|s| s.storage_tier != PARITY_TIER)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileVersion {
    pub version_id: String,
    pub file_id: String,
    pub manifest_id: String,
    pub version_number: u32,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub parent_version_id: Option<String>,
    pub change_summary: Option<String>,
    pub autosave: bool,
    pub is_pinned: bool,
    pub label: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkState {
    Pending,
    Committed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkStatus {
    pub chunk_id: u32,
    pub offset: u64,
    pub length: u64,
    pub checksum: Option<String>,
    pub status: ChunkState,
    pub last_updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Open,
    Ready,
    Finalized,
    Aborted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    pub session_id: String,
    pub file_id: Option<String>,
    pub org_id: String,
    pub parent_id: String,
    pub expected_size: u64,
    pub chunk_size: u64,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub received_bytes: u64,
    pub file_name: Option<String>,
    pub source_node: Option<String>,
    pub manifest_id: Option<String>,
    pub max_parallel_streams: u32,
    pub chunks: BTreeMap<u32, ChunkStatus>,
    pub status: SessionStatus,
    pub last_activity_at: DateTime<Utc>,
    pub client_hints: BTreeMap<String, String>,
}
