//! Byte-addressed blob store backing a storage node.
//!
//! Capacity is split between `used` (committed chunks) and `reserved`
//! (in-flight files); a reservation is taken up front so transfers cannot
//! overcommit storage. Writes and reads go through channel tickets whose
//! completion times follow the throughput + seek profile. Chunks carry
//! SHA-256 checksums over the payload, or over zero-bytes of the declared
//! size for content-agnostic files.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use bytes::Bytes;
use sha2::{Digest, Sha256};

use super::error::{DiskError, DiskResult};
use super::types::{DiskChunk, DiskFile, DiskIoProfile, DiskIoTicket, DiskOpKind};

const ZERO_BLOCK: [u8; 8192] = [0u8; 8192];

pub(crate) fn default_checksum(payload: Option<&[u8]>, size: u64) -> String {
    let mut hasher = Sha256::new();
    match payload {
        Some(bytes) => hasher.update(bytes),
        None => {
            let mut remaining = size;
            while remaining > 0 {
                let take = remaining.min(ZERO_BLOCK.len() as u64) as usize;
                hasher.update(&ZERO_BLOCK[..take]);
                remaining -= take as u64;
            }
        }
    }
    hex::encode(hasher.finalize())
}

fn normalize_path(path: &str) -> String {
    let mut normalized = String::from("/");
    for part in path.split('/').filter(|p| !p.is_empty()) {
        if !normalized.ends_with('/') {
            normalized.push('/');
        }
        normalized.push_str(part);
    }
    normalized
}

fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

fn name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or("")
}

pub struct VirtualDisk {
    capacity_bytes: u64,
    io_profile: DiskIoProfile,
    persist_root: Option<PathBuf>,
    integrity_verification: bool,
    used_bytes: u64,
    reserved_bytes: u64,
    files: BTreeMap<String, DiskFile>,
    directories: BTreeMap<String, Vec<String>>,
    scheduled_ops: BTreeMap<(String, u32, DiskOpKind), DiskIoTicket>,
    /// Next-free time per I/O channel; the earliest channel serves the next
    /// ticket, ties resolved by channel index.
    channel_available: Vec<f64>,
}

impl VirtualDisk {
    pub fn new(capacity_bytes: u64) -> DiskResult<Self> {
        if capacity_bytes == 0 {
            return Err(DiskError::InvalidSize(
                "capacity_bytes must be positive".into(),
            ));
        }
        let profile = DiskIoProfile::default();
        let channels = profile.max_outstanding.max(1);
        let mut directories = BTreeMap::new();
        directories.insert("/".to_string(), Vec::new());
        Ok(Self {
            capacity_bytes,
            io_profile: profile,
            persist_root: None,
            integrity_verification: true,
            used_bytes: 0,
            reserved_bytes: 0,
            files: BTreeMap::new(),
            directories,
            scheduled_ops: BTreeMap::new(),
            channel_available: vec![0.0; channels],
        })
    }

    pub fn with_io_profile(mut self, profile: DiskIoProfile) -> Self {
        self.io_profile = profile;
        self.channel_available = vec![0.0; profile.max_outstanding.max(1)];
        self
    }

    pub fn with_persist_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.persist_root = Some(root.into());
        self
    }

    pub fn with_integrity_verification(mut self, enabled: bool) -> Self {
        self.integrity_verification = enabled;
        self
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes
    }

    pub fn reserved_bytes(&self) -> u64 {
        self.reserved_bytes
    }

    pub fn free_bytes(&self) -> u64 {
        self.capacity_bytes
            .saturating_sub(self.used_bytes + self.reserved_bytes)
    }

    pub fn has_capacity(&self, size: u64) -> bool {
        self.used_bytes + self.reserved_bytes + size <= self.capacity_bytes
    }

    pub fn file(&self, file_id: &str) -> Option<&DiskFile> {
        self.files.get(file_id)
    }

    /// Reserve space for a file ahead of its chunk commits.
    ///
    /// Returns `Ok(false)` when the capacity check fails; errors on duplicate
    /// ids and non-positive sizes.
    pub fn reserve_file(
        &mut self,
        file_id: &str,
        total_size: u64,
        path: Option<&str>,
    ) -> DiskResult<bool> {
        if total_size == 0 {
            return Err(DiskError::InvalidSize("total_size must be positive".into()));
        }
        if self.files.contains_key(file_id) {
            return Err(DiskError::DuplicateFile(file_id.to_string()));
        }
        if !self.has_capacity(total_size) {
            return Ok(false);
        }
        let normalized = normalize_path(path.unwrap_or(file_id));
        self.track_path(&normalized);
        self.files.insert(
            file_id.to_string(),
            DiskFile {
                file_id: file_id.to_string(),
                total_size,
                committed_bytes: 0,
                chunks: BTreeMap::new(),
                path: normalized,
                metadata: BTreeMap::new(),
            },
        );
        self.reserved_bytes += total_size;
        Ok(true)
    }

    fn ensure_directory(&mut self, path: &str) {
        if self.directories.contains_key(path) {
            return;
        }
        let parent = parent_of(path);
        if parent != path {
            self.ensure_directory(&parent);
        }
        self.directories.entry(path.to_string()).or_default();
        let name = name_of(path).to_string();
        if !name.is_empty() {
            let children = self.directories.entry(parent).or_default();
            if !children.contains(&name) {
                children.push(name);
            }
        }
    }

    fn track_path(&mut self, file_path: &str) {
        let directory = parent_of(file_path);
        let name = name_of(file_path).to_string();
        self.ensure_directory(&directory);
        let children = self.directories.entry(directory).or_default();
        if !name.is_empty() && !children.contains(&name) {
            children.push(name);
        }
    }

    fn reserve_io_slot(&mut self, size: u64, current_time: f64) -> f64 {
        let size = size.max(1);
        // Earliest-free channel; ties resolve to the lowest index.
        let mut best = 0usize;
        for (idx, available) in self.channel_available.iter().enumerate().skip(1) {
            if *available < self.channel_available[best] {
                best = idx;
            }
        }
        let start_time = self.channel_available[best].max(current_time);
        let throughput = self.io_profile.throughput_bytes_per_sec.max(1) as f64;
        let seek_seconds = (self.io_profile.seek_time_ms / 1000.0).max(0.0);
        let completion_time = start_time + seek_seconds + size as f64 / throughput;
        self.channel_available[best] = completion_time;
        completion_time
    }

    pub fn schedule_write(
        &mut self,
        file_id: &str,
        chunk_id: u32,
        expected_size: u64,
        current_time: f64,
    ) -> DiskResult<DiskIoTicket> {
        if !self.files.contains_key(file_id) {
            return Err(DiskError::UnknownFile(file_id.to_string()));
        }
        let key = (file_id.to_string(), chunk_id, DiskOpKind::Write);
        if self.scheduled_ops.contains_key(&key) {
            return Err(DiskError::DuplicateOp {
                file_id: file_id.to_string(),
                chunk_id,
                op: "write",
            });
        }
        let completion_time = self.reserve_io_slot(expected_size, current_time);
        let ticket = DiskIoTicket {
            file_id: file_id.to_string(),
            chunk_id,
            op: DiskOpKind::Write,
            completion_time,
            size: expected_size,
        };
        self.scheduled_ops.insert(key, ticket.clone());
        Ok(ticket)
    }

    pub fn schedule_read(
        &mut self,
        file_id: &str,
        chunk_id: u32,
        current_time: f64,
    ) -> DiskResult<DiskIoTicket> {
        let expected_size = self
            .files
            .get(file_id)
            .and_then(|f| f.chunks.get(&chunk_id))
            .map(|c| c.size)
            .ok_or_else(|| DiskError::UnknownChunk {
                file_id: file_id.to_string(),
                chunk_id,
            })?;
        let key = (file_id.to_string(), chunk_id, DiskOpKind::Read);
        if self.scheduled_ops.contains_key(&key) {
            return Err(DiskError::DuplicateOp {
                file_id: file_id.to_string(),
                chunk_id,
                op: "read",
            });
        }
        let completion_time = self.reserve_io_slot(expected_size, current_time);
        let ticket = DiskIoTicket {
            file_id: file_id.to_string(),
            chunk_id,
            op: DiskOpKind::Read,
            completion_time,
            size: expected_size,
        };
        self.scheduled_ops.insert(key, ticket.clone());
        Ok(ticket)
    }

    pub fn complete_write(
        &mut self,
        ticket: &DiskIoTicket,
        payload: Option<Bytes>,
    ) -> DiskResult<()> {
        let key = (ticket.file_id.clone(), ticket.chunk_id, DiskOpKind::Write);
        if self.scheduled_ops.remove(&key).is_none() {
            return Err(DiskError::NoPendingOp {
                file_id: ticket.file_id.clone(),
                chunk_id: ticket.chunk_id,
                op: "write",
            });
        }
        self.commit_chunk(&ticket.file_id, ticket.chunk_id, payload, ticket.size)
    }

    pub fn complete_read(&mut self, ticket: &DiskIoTicket) -> DiskResult<Bytes> {
        let key = (ticket.file_id.clone(), ticket.chunk_id, DiskOpKind::Read);
        if self.scheduled_ops.remove(&key).is_none() {
            return Err(DiskError::NoPendingOp {
                file_id: ticket.file_id.clone(),
                chunk_id: ticket.chunk_id,
                op: "read",
            });
        }
        self.read_chunk(&ticket.file_id, ticket.chunk_id)
    }

    pub fn cancel_ticket(&mut self, ticket: &DiskIoTicket) {
        self.scheduled_ops
            .remove(&(ticket.file_id.clone(), ticket.chunk_id, ticket.op));
    }

    /// Commit a chunk without going through a ticket (synchronous path).
    pub fn write_chunk(
        &mut self,
        file_id: &str,
        chunk_id: u32,
        payload: Option<Bytes>,
        expected_size: u64,
    ) -> DiskResult<()> {
        self.commit_chunk(file_id, chunk_id, payload, expected_size)
    }

    fn commit_chunk(
        &mut self,
        file_id: &str,
        chunk_id: u32,
        payload: Option<Bytes>,
        expected_size: u64,
    ) -> DiskResult<()> {
        if expected_size == 0 {
            return Err(DiskError::InvalidSize(
                "expected_size must be positive".into(),
            ));
        }
        if let Some(payload) = payload.as_ref() {
            if payload.len() as u64 != expected_size {
                return Err(DiskError::PayloadMismatch {
                    expected: expected_size,
                    actual: payload.len() as u64,
                });
            }
        }
        let file = self
            .files
            .get_mut(file_id)
            .ok_or_else(|| DiskError::UnknownFile(file_id.to_string()))?;
        if file.chunks.contains_key(&chunk_id) {
            return Err(DiskError::DuplicateOp {
                file_id: file_id.to_string(),
                chunk_id,
                op: "write",
            });
        }
        let checksum = default_checksum(payload.as_deref(), expected_size);
        file.chunks.insert(
            chunk_id,
            DiskChunk {
                size: expected_size,
                payload: payload.clone(),
                checksum,
                corrupted: false,
            },
        );
        file.committed_bytes += expected_size;
        if file.committed_bytes > file.total_size {
            return Err(DiskError::OverCommit(file_id.to_string()));
        }
        self.used_bytes += expected_size;
        self.reserved_bytes = self.reserved_bytes.saturating_sub(expected_size);
        if self.persist_root.is_some() {
            if let Some(bytes) = payload {
                let path = self.files[file_id].path.clone();
                self.persist_chunk(&path, &bytes)?;
            }
        }
        Ok(())
    }

    fn persist_chunk(&self, file_path: &str, payload: &[u8]) -> DiskResult<()> {
        let Some(root) = self.persist_root.as_ref() else {
            return Ok(());
        };
        let relative = file_path.trim_start_matches('/');
        let host_path = root.join(relative);
        if let Some(parent) = host_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut handle = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&host_path)?;
        handle.write_all(payload)?;
        Ok(())
    }

    pub fn read_chunk(&mut self, file_id: &str, chunk_id: u32) -> DiskResult<Bytes> {
        let integrity = self.integrity_verification;
        let chunk = self
            .files
            .get_mut(file_id)
            .and_then(|f| f.chunks.get_mut(&chunk_id))
            .ok_or_else(|| DiskError::UnknownChunk {
                file_id: file_id.to_string(),
                chunk_id,
            })?;
        if chunk.corrupted {
            return Err(DiskError::Corruption {
                file_id: file_id.to_string(),
                chunk_id,
            });
        }
        let payload = chunk
            .payload
            .clone()
            .unwrap_or_else(|| Bytes::from(vec![0u8; chunk.size as usize]));
        if integrity {
            let expected = default_checksum(Some(&payload), chunk.size);
            if expected != chunk.checksum {
                chunk.corrupted = true;
                return Err(DiskError::Corruption {
                    file_id: file_id.to_string(),
                    chunk_id,
                });
            }
        }
        Ok(payload)
    }

    pub fn read_file(&mut self, file_id: &str) -> DiskResult<Bytes> {
        let chunk_ids: Vec<u32> = self
            .files
            .get(file_id)
            .ok_or_else(|| DiskError::UnknownFile(file_id.to_string()))?
            .chunks
            .keys()
            .copied()
            .collect();
        let mut assembled = Vec::new();
        for chunk_id in chunk_ids {
            assembled.extend_from_slice(&self.read_chunk(file_id, chunk_id)?);
        }
        Ok(Bytes::from(assembled))
    }

    pub fn chunk_checksum(&self, file_id: &str, chunk_id: u32) -> Option<&str> {
        self.files
            .get(file_id)
            .and_then(|f| f.chunks.get(&chunk_id))
            .map(|c| c.checksum.as_str())
    }

    /// Fault-injection hook: mark a committed chunk corrupted.
    pub fn inject_corruption(&mut self, file_id: &str, chunk_id: u32) -> DiskResult<()> {
        let chunk = self
            .files
            .get_mut(file_id)
            .and_then(|f| f.chunks.get_mut(&chunk_id))
            .ok_or_else(|| DiskError::UnknownChunk {
                file_id: file_id.to_string(),
                chunk_id,
            })?;
        chunk.corrupted = true;
        Ok(())
    }

    /// Clear a corruption flag, optionally rewriting the payload and checksum.
    pub fn recover_chunk(
        &mut self,
        file_id: &str,
        chunk_id: u32,
        repaired: Option<Bytes>,
    ) -> DiskResult<()> {
        let chunk = self
            .files
            .get_mut(file_id)
            .and_then(|f| f.chunks.get_mut(&chunk_id))
            .ok_or_else(|| DiskError::UnknownChunk {
                file_id: file_id.to_string(),
                chunk_id,
            })?;
        chunk.corrupted = false;
        if let Some(payload) = repaired {
            chunk.checksum = default_checksum(Some(&payload), chunk.size);
            chunk.payload = Some(payload);
        }
        Ok(())
    }

    /// Drop a file, reclaiming both committed bytes and any remaining
    /// reservation. Used on transfer aborts.
    pub fn release_file(&mut self, file_id: &str) {
        if let Some(file) = self.files.remove(file_id) {
            let remaining = file.total_size.saturating_sub(file.committed_bytes);
            self.reserved_bytes = self.reserved_bytes.saturating_sub(remaining);
            self.used_bytes = self.used_bytes.saturating_sub(file.committed_bytes);
        }
    }

    /// Drop a fully committed file, reclaiming its used bytes.
    pub fn delete_file(&mut self, file_id: &str) {
        if let Some(file) = self.files.remove(file_id) {
            self.used_bytes = self.used_bytes.saturating_sub(file.committed_bytes);
        }
    }

    pub fn list_directory(&self, path: &str) -> Vec<String> {
        self.directories
            .get(&normalize_path(path))
            .cloned()
            .unwrap_or_default()
    }
}
