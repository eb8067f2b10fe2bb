//! Resumable upload sessions and their finalization into the fabric.
//!
//! Sessions negotiate a chunk size from client hints, accept idempotent
//! chunk commits, publish gap maps for client-side resume, and on finalize
//! materialize a manifest through the fabric, then hand it through the
//! replica, lifecycle, and durability services.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::bus::{topics, InMemoryBus, MessageEnvelope};
use crate::config::FabricConfig;
use crate::controller::FabricController;
use crate::download::DownloadStream;
use crate::durability::DurabilityManager;
use crate::lifecycle::LifecycleManager;
use crate::metadata::{
    system_clock, ChunkState, ChunkStatus, FileManifest, MetadataStore, SessionStatus,
    UploadSession, WallClock,
};
use crate::replica::ReplicaManager;

use super::error::{UploadError, UploadResult};

const SESSION_TTL_HOURS: i64 = 4;
const ACTIVITY_EXTENSION_MINUTES: i64 = 30;
const MOBILE_CHUNK_CAP: u64 = 2 * 1024 * 1024;
const WORKSTATION_CHUNK_SIZE: u64 = 32 * 1024 * 1024;
const WORKSTATION_SIZE_FLOOR: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GapEntry {
    pub chunk_id: u32,
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendOutcome {
    pub received_bytes: u64,
    pub gap_map: Vec<GapEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub session_id: String,
    pub parent_id: String,
    pub expected_size: u64,
    pub chunk_size: u64,
    pub max_parallel_streams: u32,
    pub received_bytes: u64,
    pub status: SessionStatus,
    pub expires_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub total_chunks: u32,
    pub committed_chunks: u32,
    pub gap_map: Vec<GapEntry>,
    pub client_hints: BTreeMap<String, String>,
}

pub struct UploadOrchestrator {
    controller: Arc<Mutex<FabricController>>,
    metadata: Arc<MetadataStore>,
    bus: Arc<InMemoryBus>,
    config: Arc<FabricConfig>,
    replica: Option<Arc<ReplicaManager>>,
    lifecycle: Option<Arc<LifecycleManager>>,
    durability: Option<Arc<DurabilityManager>>,
    sessions: DashMap<String, UploadSession>,
    clock: WallClock,
}

impl UploadOrchestrator {
    pub fn new(
        controller: Arc<Mutex<FabricController>>,
        metadata: Arc<MetadataStore>,
        bus: Arc<InMemoryBus>,
        config: Arc<FabricConfig>,
    ) -> Self {
        Self {
            controller,
            metadata,
            bus,
            config,
            replica: None,
            lifecycle: None,
            durability: None,
            sessions: DashMap::new(),
            clock: system_clock(),
        }
    }

    pub fn with_replica_manager(mut self, replica: Arc<ReplicaManager>) -> Self {
        self.replica = Some(replica);
        self
    }

    pub fn with_lifecycle_manager(mut self, lifecycle: Arc<LifecycleManager>) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    pub fn with_durability_manager(mut self, durability: Arc<DurabilityManager>) -> Self {
        self.durability = Some(durability);
        self
    }

    pub fn with_clock(mut self, clock: WallClock) -> Self {
        self.clock = clock;
        self
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    // Session lifecycle --------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn initiate_session(
        &self,
        org_id: &str,
        parent_id: &str,
        size_bytes: u64,
        created_by: &str,
        file_id: Option<String>,
        requested_chunk_size: Option<u64>,
        client_hints: BTreeMap<String, String>,
        max_parallel_streams: Option<u32>,
    ) -> UploadResult<UploadSession> {
        if size_bytes == 0 {
            return Err(UploadError::InvalidArgument(
                "expected size must be positive".into(),
            ));
        }
        let session_id = Uuid::new_v4().to_string();
        let chunk_size =
            self.negotiate_chunk_size(size_bytes, requested_chunk_size, &client_hints);
        let streams = max_parallel_streams
            .unwrap_or_else(|| Self::suggest_parallel_streams(size_bytes, &client_hints));
        let now = self.now();
        let session = UploadSession {
            session_id: session_id.clone(),
            file_id,
            org_id: org_id.to_string(),
            parent_id: parent_id.to_string(),
            expected_size: size_bytes,
            chunk_size,
            created_by: created_by.to_string(),
            created_at: now,
            expires_at: now + Duration::hours(SESSION_TTL_HOURS),
            received_bytes: 0,
            file_name: None,
            source_node: None,
            manifest_id: None,
            max_parallel_streams: streams,
            chunks: BTreeMap::new(),
            status: SessionStatus::Open,
            last_activity_at: now,
            client_hints,
        };
        self.sessions.insert(session_id.clone(), session.clone());
        crate::metrics::record_active_sessions(self.sessions.len());
        debug!(session_id = %session_id, chunk_size, "upload session initiated");
        Ok(session)
    }

    /// Idempotent chunk commit. Re-sending a committed chunk with matching
    /// metadata only refreshes activity; mismatched metadata is refused.
    #[allow(clippy::too_many_arguments)]
    pub fn append_chunk(
        &self,
        session_id: &str,
        source_node: &str,
        file_name: &str,
        chunk_bytes: u64,
        chunk_id: Option<u32>,
        offset: Option<u64>,
        checksum: Option<String>,
    ) -> UploadResult<AppendOutcome> {
        if chunk_bytes == 0 {
            return Err(UploadError::InvalidArgument(
                "chunk_bytes must be positive".into(),
            ));
        }
        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| UploadError::SessionNotFound(session_id.to_string()))?;
        self.ensure_active(&mut session)?;

        let resolved_chunk_id = chunk_id.unwrap_or_else(|| match offset {
            Some(offset) if session.chunk_size > 0 => (offset / session.chunk_size) as u32,
            _ => session.chunks.len() as u32,
        });
        let resolved_offset = offset.unwrap_or(resolved_chunk_id as u64 * session.chunk_size);
        let now = self.now();

        if let Some(existing) = session.chunks.get(&resolved_chunk_id) {
            if existing.status == ChunkState::Committed {
                if existing.offset != resolved_offset || existing.length != chunk_bytes {
                    return Err(UploadError::MetadataMismatch(session_id.to_string()));
                }
                session.last_activity_at = now;
                let gap_map = Self::gap_map_for(&session);
                return Ok(AppendOutcome {
                    received_bytes: session.received_bytes,
                    gap_map,
                });
            }
            if existing.offset != resolved_offset || existing.length != chunk_bytes {
                return Err(UploadError::MetadataMismatch(session_id.to_string()));
            }
        }

        if session.received_bytes + chunk_bytes > session.expected_size {
            return Err(UploadError::SizeExceeded(session_id.to_string()));
        }

        session.chunks.insert(
            resolved_chunk_id,
            ChunkStatus {
                chunk_id: resolved_chunk_id,
                offset: resolved_offset,
                length: chunk_bytes,
                checksum,
                status: ChunkState::Committed,
                last_updated_at: now,
            },
        );
        session.received_bytes += chunk_bytes;
        if session.source_node.is_none() {
            session.source_node = Some(source_node.to_string());
        }
        if session.file_name.is_none() {
            session.file_name = Some(file_name.to_string());
        }
        session.last_activity_at = now;

        let gap_map = Self::gap_map_for(&session);
        if gap_map.is_empty() && session.received_bytes >= session.expected_size {
            session.status = SessionStatus::Ready;
        }

        self.bus.publish(MessageEnvelope::new(
            topics::INGEST_REQUESTS,
            serde_json::json!({
                "session_id": session_id,
                "chunk_id": resolved_chunk_id,
                "offset": resolved_offset,
                "length": chunk_bytes,
            }),
        ));
        Ok(AppendOutcome {
            received_bytes: session.received_bytes,
            gap_map,
        })
    }

    pub fn describe_session(&self, session_id: &str) -> UploadResult<SessionDescriptor> {
        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| UploadError::SessionNotFound(session_id.to_string()))?;
        self.ensure_active(&mut session)?;
        let gap_map = Self::gap_map_for(&session);
        let committed = session
            .chunks
            .values()
            .filter(|c| c.status == ChunkState::Committed)
            .count() as u32;
        Ok(SessionDescriptor {
            session_id: session.session_id.clone(),
            parent_id: session.parent_id.clone(),
            expected_size: session.expected_size,
            chunk_size: session.chunk_size,
            max_parallel_streams: session.max_parallel_streams,
            received_bytes: session.received_bytes,
            status: session.status,
            expires_at: session.expires_at,
            last_activity_at: session.last_activity_at,
            total_chunks: Self::expected_chunk_count(&session),
            committed_chunks: committed,
            gap_map,
            client_hints: session.client_hints.clone(),
        })
    }

    /// Materialize the manifest through the fabric and run the post-upload
    /// pipeline: metadata entry, replica policy, lifecycle tiering,
    /// durability annotations, version record.
    pub fn finalize(&self, session_id: &str) -> UploadResult<FileManifest> {
        let (source_node, file_name, expected_size, org_id, parent_id, created_by, created_at, preset_file_id) = {
            let mut session = self
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| UploadError::SessionNotFound(session_id.to_string()))?;
            self.ensure_active(&mut session)?;
            if session.status != SessionStatus::Ready {
                return Err(UploadError::FinalizeBeforeReady(session_id.to_string()));
            }
            (
                session.source_node.clone(),
                session
                    .file_name
                    .clone()
                    .unwrap_or_else(|| format!("object-{session_id}")),
                session.expected_size,
                session.org_id.clone(),
                session.parent_id.clone(),
                session.created_by.clone(),
                session.created_at,
                session.file_id.clone(),
            )
        };

        let mut manifest = self.materialize_manifest(source_node.as_deref(), &file_name, expected_size)?;
        if let Some(preset) = preset_file_id.as_ref() {
            manifest.file_id = preset.clone();
        }
        self.metadata.register_manifest(manifest.clone());

        let file_id = manifest.file_id.clone();
        let mime_type = Self::infer_mime_type(&file_name);
        self.metadata.ensure_file_entry(
            &file_id,
            &org_id,
            Some(&parent_id),
            &file_name,
            &mime_type,
            expected_size,
            &created_by,
            None,
        );

        if let Some(replica) = &self.replica {
            manifest = replica.enforce_policy(manifest);
        }
        if let Some(lifecycle) = &self.lifecycle {
            manifest = lifecycle.apply_post_upload(manifest);
        }
        if let Some(durability) = &self.durability {
            manifest = durability.apply(manifest);
        }
        self.metadata.upsert_manifest(manifest.clone());
        self.metadata.record_version(
            &file_id,
            &manifest.manifest_id,
            expected_size,
            &created_by,
            Some("upload"),
        );

        {
            let mut session = self
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| UploadError::SessionNotFound(session_id.to_string()))?;
            session.file_id = Some(file_id.clone());
            session.manifest_id = Some(manifest.manifest_id.clone());
            session.status = SessionStatus::Finalized;
        }

        self.bus.publish(MessageEnvelope::new(
            topics::REPLICATION_REQUESTS,
            serde_json::json!({ "session_id": session_id }),
        ));
        let latency_ms = (self.now() - created_at).num_milliseconds().max(0) as f64;
        crate::metrics::record_upload_finalized(&org_id);
        crate::metrics::record_ingest_latency_ms(&org_id, latency_ms);
        info!(session_id = %session_id, file_id = %file_id, "upload finalized");
        Ok(manifest)
    }

    pub fn abort(&self, session_id: &str) {
        if let Some((_, mut session)) = self.sessions.remove(session_id) {
            session.status = SessionStatus::Aborted;
            self.bus.publish(MessageEnvelope::new(
                topics::UPLOADS_EXPIRED,
                serde_json::json!({ "session_id": session_id }),
            ));
        }
        crate::metrics::record_active_sessions(self.sessions.len());
    }

    // Downloads ----------------------------------------------------------

    /// Lazy range read over a finalized file's manifest.
    pub fn stream_download(
        &self,
        file_id: &str,
        offset: u64,
        length: Option<u64>,
        chunk_size: Option<u64>,
    ) -> UploadResult<DownloadStream> {
        let manifest = self
            .metadata
            .manifest_for_file(file_id)
            .ok_or_else(|| UploadError::FileNotFound(file_id.to_string()))?;
        if offset > manifest.total_size {
            return Err(UploadError::InvalidArgument(
                "offset beyond end of file".into(),
            ));
        }
        let remaining = manifest.total_size - offset;
        let length = length.unwrap_or(remaining).min(remaining);
        let chunk_size = chunk_size
            .filter(|c| *c > 0)
            .unwrap_or(self.config.storage.default_chunk_size);
        if let Some(lifecycle) = &self.lifecycle {
            lifecycle.record_access(&manifest.manifest_id);
        }
        Ok(DownloadStream::new(&manifest, offset, length, chunk_size))
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions.len()
    }

    // Internals ----------------------------------------------------------

    fn materialize_manifest(
        &self,
        source_node: Option<&str>,
        file_name: &str,
        expected_size: u64,
    ) -> UploadResult<FileManifest> {
        let mut controller = self.controller.lock();
        let source = match source_node {
            Some(node) => node.to_string(),
            None => controller
                .network()
                .node_ids()
                .next()
                .cloned()
                .ok_or_else(|| {
                    UploadError::Fabric("no storage nodes available for persistence".into())
                })?,
        };
        let (_, transfer) = controller
            .push_file(&source, file_name, expected_size, true)
            .map_err(|e| UploadError::Fabric(e.to_string()))?;
        let master_id = transfer.backing_file_id.clone();
        let fabric_manifest = controller
            .network()
            .manifest(&master_id)
            .cloned()
            .ok_or_else(|| {
                UploadError::Fabric("storage fabric did not register manifest".into())
            })?;
        let hot_tier = self
            .config
            .storage
            .lifecycle_policy
            .as_ref()
            .map(|p| p.hot_storage_tier.clone())
            .unwrap_or_else(|| "hot".to_string());
        Ok(FileManifest::from_fabric(
            &fabric_manifest,
            &hot_tier,
            |node_id| {
                controller
                    .network()
                    .node(node_id)
                    .and_then(|n| n.zone().map(String::from))
            },
        ))
    }

    fn negotiate_chunk_size(
        &self,
        size_bytes: u64,
        requested: Option<u64>,
        hints: &BTreeMap<String, String>,
    ) -> u64 {
        let max_chunk = self.config.storage.max_chunk_size;
        if let Some(requested) = requested.filter(|r| *r > 0) {
            return requested.min(max_chunk).min(size_bytes).max(1);
        }
        let base = self.config.storage.default_chunk_size;
        if hints.get("network_type").map(String::as_str) == Some("mobile") {
            return MOBILE_CHUNK_CAP.min(size_bytes).max(1);
        }
        if hints.get("device_class").map(String::as_str) == Some("workstation")
            && size_bytes >= WORKSTATION_SIZE_FLOOR
        {
            return WORKSTATION_CHUNK_SIZE.min(size_bytes);
        }
        base.min(size_bytes).max(1)
    }

    fn suggest_parallel_streams(size_bytes: u64, hints: &BTreeMap<String, String>) -> u32 {
        if hints.get("network_type").map(String::as_str) == Some("mobile") {
            return 2;
        }
        if size_bytes >= 512 * 1024 * 1024 {
            8
        } else if size_bytes >= 64 * 1024 * 1024 {
            4
        } else {
            2
        }
    }

    fn expected_chunk_count(session: &UploadSession) -> u32 {
        if session.chunk_size == 0 {
            return 1;
        }
        session.expected_size.div_ceil(session.chunk_size).max(1) as u32
    }

    fn gap_map_for(session: &UploadSession) -> Vec<GapEntry> {
        let chunk_size = session.chunk_size.max(1);
        let total_chunks = Self::expected_chunk_count(session);
        let mut gaps = Vec::new();
        for chunk_id in 0..total_chunks {
            let committed = session
                .chunks
                .get(&chunk_id)
                .map(|c| c.status == ChunkState::Committed)
                .unwrap_or(false);
            if committed {
                continue;
            }
            let offset = chunk_id as u64 * chunk_size;
            let remaining = session.expected_size.saturating_sub(offset);
            gaps.push(GapEntry {
                chunk_id,
                offset,
                length: chunk_size.min(remaining),
            });
        }
        gaps
    }

    /// Expired sessions refuse every operation; live ones get their expiry
    /// extended to at least 30 minutes out.
    fn ensure_active(&self, session: &mut UploadSession) -> UploadResult<()> {
        let now = self.now();
        if session.expires_at < now {
            return Err(UploadError::SessionExpired(session.session_id.clone()));
        }
        let floor = now + Duration::minutes(ACTIVITY_EXTENSION_MINUTES);
        if session.expires_at < floor {
            session.expires_at = floor;
        }
        Ok(())
    }

    fn infer_mime_type(file_name: &str) -> String {
        let lowered = file_name.to_lowercase();
        if lowered.ends_with(".txt") {
            "text/plain"
        } else if lowered.ends_with(".jpg") || lowered.ends_with(".jpeg") {
            "image/jpeg"
        } else if lowered.ends_with(".png") {
            "image/png"
        } else if lowered.ends_with(".pdf") {
            "application/pdf"
        } else {
            "application/octet-stream"
        }
        .to_string()
    }
}
