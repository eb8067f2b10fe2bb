//! A storage node: one virtual disk, one virtual OS, and a neighbor table.
//!
//! Chunk lifecycle: an arriving chunk reserves an ingest process on the OS
//! (CPU scaled by chunk size, memory by working set), then schedules a disk
//! write ticket; the fabric calls back at the ticket's completion time to
//! commit it. Outbound chunks hold a NIC reservation slot for the duration
//! of their current hop.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::disk::{DiskIoProfile, VirtualDisk};
use crate::vos::{
    DevicePayload, DeviceSubmitMode, ProcessState, ProcessWork, SyscallArgs, VirtualOs,
};

use super::types::{ChunkCommitResult, FileChunk, FileTransfer, PendingDiskWrite, TransferStatus};

const CPU_SECONDS_PER_MIB: f64 = 0.002;
const WORKING_SET_FRACTION: f64 = 0.05;
const MIN_WORKING_SET_BYTES: u64 = 4 * 1024 * 1024;
const MIN_CHUNK_SIZE_BYTES: u64 = 256 * 1024;
const MAX_CHUNK_SIZE_BYTES: u64 = 32 * 1024 * 1024;
const MAX_PROCESS_TICKS: u32 = 10_000;

pub struct StorageVirtualNode {
    node_id: String,
    cpu_capacity: u32,
    memory_capacity_gb: u64,
    total_storage: u64,
    bandwidth_bps: u64,
    zone: Option<String>,
    connections: BTreeMap<String, u64>,
    link_latencies: BTreeMap<String, f64>,
    disk: Arc<Mutex<VirtualDisk>>,
    os: VirtualOs,
    active_transfers: BTreeMap<String, FileTransfer>,
    stored_files: BTreeMap<String, FileTransfer>,
    pending_disk_writes: BTreeMap<(String, u32), PendingDiskWrite>,
    transmission_tickets: BTreeMap<u32, Option<u64>>,
    maintenance_tickets: BTreeMap<u32, Option<u64>>,
    background_jobs: BTreeMap<String, Vec<u32>>,
    total_requests_processed: u64,
    total_data_transferred: u64,
    failed_transfers: u64,
    os_process_failures: u64,
}

impl StorageVirtualNode {
    /// Capacities are operator units: vCPUs, GB of memory, GB of storage,
    /// Mbps of node bandwidth.
    pub fn new(
        node_id: impl Into<String>,
        cpu_capacity: u32,
        memory_capacity_gb: u64,
        storage_capacity_gb: u64,
        bandwidth_mbps: u64,
        zone: Option<String>,
    ) -> Self {
        let node_id = node_id.into();
        let total_storage = storage_capacity_gb.max(1) * 1024 * 1024 * 1024;
        let memory_capacity_bytes = memory_capacity_gb.max(1) * 1024 * 1024 * 1024;
        let disk = Arc::new(Mutex::new(
            VirtualDisk::new(total_storage)
                .expect("storage capacity is clamped positive")
                .with_io_profile(DiskIoProfile::default()),
        ));
        let os = VirtualOs::new(cpu_capacity.max(1), memory_capacity_bytes).with_time_slice(0.01);
        let mut node = Self {
            node_id,
            cpu_capacity: cpu_capacity.max(1),
            memory_capacity_gb: memory_capacity_gb.max(1),
            total_storage,
            bandwidth_bps: bandwidth_mbps * 1_000_000,
            zone,
            connections: BTreeMap::new(),
            link_latencies: BTreeMap::new(),
            disk,
            os,
            active_transfers: BTreeMap::new(),
            stored_files: BTreeMap::new(),
            pending_disk_writes: BTreeMap::new(),
            transmission_tickets: BTreeMap::new(),
            maintenance_tickets: BTreeMap::new(),
            background_jobs: BTreeMap::new(),
            total_requests_processed: 0,
            total_data_transferred: 0,
            failed_transfers: 0,
            os_process_failures: 0,
        };
        node.register_devices();
        node
    }

    fn register_devices(&mut self) {
        let disk_device = self.disk_device_name();
        let nic_device = self.nic_device_name();
        let maintenance_device = self.maintenance_device_name();

        let disk = Arc::clone(&self.disk);
        self.os
            .devices_mut()
            .register_device(
                &disk_device,
                Some(Box::new(move |payload| match payload {
                    DevicePayload::DiskWrite {
                        file_id,
                        chunk_id,
                        size,
                    } => disk
                        .lock()
                        .write_chunk(file_id, *chunk_id, None, *size)
                        .map_err(|e| e.to_string()),
                    DevicePayload::DiskRead {
                        file_id, chunk_id, ..
                    } => disk
                        .lock()
                        .read_chunk(file_id, *chunk_id)
                        .map(|_| ())
                        .map_err(|e| e.to_string()),
                    other => Err(format!("unsupported disk payload: {other:?}")),
                })),
                4,
            )
            .expect("fresh OS has no devices");

        self.os
            .devices_mut()
            .register_device(&nic_device, None, self.cpu_capacity.max(1) as usize)
            .expect("fresh OS has no devices");
        self.os
            .devices_mut()
            .register_device(&maintenance_device, None, 1)
            .expect("fresh OS has no devices");

        let node_id = self.node_id.clone();
        let device = disk_device.clone();
        self.os.devices_mut().register_syscall(
            "disk_write",
            Box::new(move |ctx, args| match args {
                SyscallArgs::DiskWrite {
                    file_id,
                    chunk_id,
                    size,
                } => ctx.device_call(
                    &device,
                    DevicePayload::DiskWrite {
                        file_id: file_id.clone(),
                        chunk_id: *chunk_id,
                        size: *size,
                    },
                    DeviceSubmitMode::Instant,
                ),
                _ => crate::vos::SyscallResult::failure(format!(
                    "disk_write on {node_id}: wrong arguments"
                )),
            }),
        );

        let node_id = self.node_id.clone();
        let device = disk_device;
        self.os.devices_mut().register_syscall(
            "disk_read",
            Box::new(move |ctx, args| match args {
                SyscallArgs::DiskRead {
                    file_id,
                    chunk_id,
                    size,
                } => ctx.device_call(
                    &device,
                    DevicePayload::DiskRead {
                        file_id: file_id.clone(),
                        chunk_id: *chunk_id,
                        size: *size,
                    },
                    DeviceSubmitMode::Instant,
                ),
                _ => crate::vos::SyscallResult::failure(format!(
                    "disk_read on {node_id}: wrong arguments"
                )),
            }),
        );

        let node_id = self.node_id.clone();
        let device = nic_device;
        self.os.devices_mut().register_syscall(
            "network_send",
            Box::new(move |ctx, args| match args {
                SyscallArgs::NetworkSend { bytes } => ctx.device_call(
                    &device,
                    DevicePayload::NetworkSend {
                        bytes: *bytes,
                        node_id: node_id.clone(),
                    },
                    DeviceSubmitMode::Reservation,
                ),
                _ => crate::vos::SyscallResult::failure("network_send: wrong arguments"),
            }),
        );

        let node_id = self.node_id.clone();
        let device = maintenance_device;
        self.os.devices_mut().register_syscall(
            "maintenance_hook",
            Box::new(move |ctx, args| match args {
                SyscallArgs::MaintenanceHook { job_name } => ctx.device_call(
                    &device,
                    DevicePayload::Maintenance {
                        job: job_name.clone(),
                        node_id: node_id.clone(),
                    },
                    DeviceSubmitMode::Reservation,
                ),
                _ => crate::vos::SyscallResult::failure("maintenance_hook: wrong arguments"),
            }),
        );
    }

    fn disk_device_name(&self) -> String {
        format!("disk:{}", self.node_id)
    }

    fn nic_device_name(&self) -> String {
        format!("nic:{}", self.node_id)
    }

    fn maintenance_device_name(&self) -> String {
        format!("maintenance:{}", self.node_id)
    }

    // Accessors ----------------------------------------------------------

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn zone(&self) -> Option<&str> {
        self.zone.as_deref()
    }

    pub fn cpu_capacity(&self) -> u32 {
        self.cpu_capacity
    }

    pub fn memory_capacity_gb(&self) -> u64 {
        self.memory_capacity_gb
    }

    pub fn bandwidth_bps(&self) -> u64 {
        self.bandwidth_bps
    }

    pub fn total_storage(&self) -> u64 {
        self.total_storage
    }

    pub fn used_storage(&self) -> u64 {
        self.disk.lock().used_bytes()
    }

    pub fn free_storage(&self) -> u64 {
        self.disk.lock().free_bytes()
    }

    pub fn projected_storage_usage(&self) -> u64 {
        let disk = self.disk.lock();
        disk.used_bytes() + disk.reserved_bytes()
    }

    pub fn connections(&self) -> &BTreeMap<String, u64> {
        &self.connections
    }

    pub fn link_latency(&self, neighbor: &str) -> f64 {
        self.link_latencies.get(neighbor).copied().unwrap_or(0.0)
    }

    pub fn os(&self) -> &VirtualOs {
        &self.os
    }

    pub fn os_mut(&mut self) -> &mut VirtualOs {
        &mut self.os
    }

    pub fn disk_handle(&self) -> Arc<Mutex<VirtualDisk>> {
        Arc::clone(&self.disk)
    }

    pub fn total_requests_processed(&self) -> u64 {
        self.total_requests_processed
    }

    pub fn total_data_transferred(&self) -> u64 {
        self.total_data_transferred
    }

    pub fn failed_transfers(&self) -> u64 {
        self.failed_transfers
    }

    pub fn os_process_failures(&self) -> u64 {
        self.os_process_failures
    }

    pub fn stored_files(&self) -> &BTreeMap<String, FileTransfer> {
        &self.stored_files
    }

    pub fn active_transfer(&self, file_id: &str) -> Option<&FileTransfer> {
        self.active_transfers.get(file_id)
    }

    pub fn stored_file(&self, file_id: &str) -> Option<&FileTransfer> {
        self.stored_files.get(file_id)
    }

    pub fn has_stored_file_named(&self, name: &str) -> bool {
        self.stored_files.values().any(|t| t.file_name == name)
    }

    // Topology -----------------------------------------------------------

    pub fn add_connection(&mut self, neighbor: &str, bandwidth_mbps: u64, latency_ms: f64) {
        self.connections
            .insert(neighbor.to_string(), bandwidth_mbps * 1_000_000);
        self.link_latencies
            .insert(neighbor.to_string(), latency_ms.max(0.0));
    }

    pub fn remove_connection(&mut self, neighbor: &str) {
        self.connections.remove(neighbor);
        self.link_latencies.remove(neighbor);
    }

    /// Create a replica node with proportionally scaled resources.
    pub fn clone_node(
        &self,
        node_id: &str,
        storage_factor: f64,
        bandwidth_factor: f64,
        zone: Option<String>,
    ) -> StorageVirtualNode {
        let storage_gb =
            ((self.total_storage as f64 / (1024.0 * 1024.0 * 1024.0)) * storage_factor).ceil();
        let bandwidth_mbps = ((self.bandwidth_bps as f64 / 1_000_000.0) * bandwidth_factor).ceil();
        StorageVirtualNode::new(
            node_id,
            self.cpu_capacity,
            self.memory_capacity_gb,
            (storage_gb as u64).max(1),
            (bandwidth_mbps as u64).max(1),
            zone.or_else(|| self.zone.clone()),
        )
    }

    // Chunking -----------------------------------------------------------

    fn calculate_chunk_size(&self, file_size: u64, hint: Option<u64>) -> u64 {
        if let Some(hint) = hint {
            let normalized = hint.clamp(MIN_CHUNK_SIZE_BYTES, MAX_CHUNK_SIZE_BYTES);
            return normalized.min(file_size).max(1);
        }
        if file_size < 10 * 1024 * 1024 {
            512 * 1024
        } else if file_size < 100 * 1024 * 1024 {
            2 * 1024 * 1024
        } else {
            10 * 1024 * 1024
        }
    }

    fn generate_chunks(&self, file_id: &str, file_size: u64, hint: Option<u64>) -> Vec<FileChunk> {
        let chunk_size = self.calculate_chunk_size(file_size, hint);
        let count = file_size.div_ceil(chunk_size);
        (0..count)
            .map(|i| {
                let actual = chunk_size.min(file_size - i * chunk_size);
                let digest = blake3::hash(format!("{file_id}-{i}").as_bytes());
                FileChunk {
                    chunk_id: i as u32,
                    size: actual,
                    checksum: digest.to_hex()[..32].to_string(),
                    status: TransferStatus::Pending,
                    stored_node: None,
                }
            })
            .collect()
    }

    // Transfers ----------------------------------------------------------

    /// Reserve disk space and create a PENDING transfer toward this node.
    /// Returns `None` when the reservation fails.
    #[allow(clippy::too_many_arguments)]
    pub fn initiate_file_transfer(
        &mut self,
        file_id: &str,
        file_name: &str,
        file_size: u64,
        current_time: f64,
        preferred_chunk_size: Option<u64>,
        backing_file_id: Option<String>,
        segment_offset: u64,
    ) -> Option<FileTransfer> {
        let path = format!("/{}/{}", self.node_id, file_name);
        match self.disk.lock().reserve_file(file_id, file_size, Some(&path)) {
            Ok(true) => {}
            Ok(false) => return None,
            Err(err) => {
                debug!(node = %self.node_id, file_id, %err, "reservation refused");
                return None;
            }
        }
        let chunks = self.generate_chunks(file_id, file_size, preferred_chunk_size);
        let transfer = FileTransfer {
            file_id: file_id.to_string(),
            file_name: file_name.to_string(),
            total_size: file_size,
            chunks,
            status: TransferStatus::Pending,
            created_at: current_time,
            completed_at: None,
            is_retrieval: false,
            backing_file_id: backing_file_id.unwrap_or_else(|| file_id.to_string()),
            target_node: Some(self.node_id.clone()),
            segment_offset,
        };
        self.active_transfers
            .insert(file_id.to_string(), transfer.clone());
        Some(transfer)
    }

    pub fn mark_transfer_retrieval(&mut self, file_id: &str) {
        if let Some(transfer) = self.active_transfers.get_mut(file_id) {
            transfer.is_retrieval = true;
        }
    }

    pub fn mark_transfer_started(&mut self, file_id: &str) {
        if let Some(transfer) = self.active_transfers.get_mut(file_id) {
            if transfer.status == TransferStatus::Pending {
                transfer.status = TransferStatus::InProgress;
            }
        }
    }

    /// Accept an arriving chunk: acquire ingest CPU + memory, then schedule
    /// the disk write. An OS denial aborts the whole transfer.
    pub fn process_chunk_transfer(
        &mut self,
        file_id: &str,
        chunk_id: u32,
        _source_node: &str,
        completed_time: f64,
    ) -> ChunkCommitResult {
        let refused = ChunkCommitResult {
            success: false,
            completion_time: completed_time,
        };
        let Some(transfer) = self.active_transfers.get_mut(file_id) else {
            return refused;
        };
        let Some(chunk) = transfer.chunks.iter_mut().find(|c| c.chunk_id == chunk_id) else {
            return refused;
        };
        chunk.stored_node = Some(self.node_id.clone());
        chunk.status = TransferStatus::InProgress;
        transfer.status = TransferStatus::InProgress;
        let chunk_size = chunk.size;

        if !self.execute_chunk_process(chunk_size, "ingest", 1.0, 1.0, None) {
            self.abort_transfer(file_id);
            return refused;
        }

        let schedule_result = self
            .disk
            .lock()
            .schedule_write(file_id, chunk_id, chunk_size, completed_time);
        let ticket = match schedule_result {
            Ok(ticket) => ticket,
            Err(err) => {
                warn!(node = %self.node_id, file_id, chunk_id, %err, "disk schedule failed");
                self.abort_transfer(file_id);
                return refused;
            }
        };
        let completion_time = ticket.completion_time;
        self.pending_disk_writes
            .insert((file_id.to_string(), chunk_id), PendingDiskWrite { ticket, chunk_id });
        ChunkCommitResult {
            success: true,
            completion_time,
        }
    }

    /// Commit a chunk whose disk ticket has elapsed. Returns false when the
    /// commit failed and the transfer was aborted.
    pub fn finalize_chunk_commit(
        &mut self,
        file_id: &str,
        chunk_id: u32,
        completed_time: f64,
    ) -> bool {
        let Some(pending) = self
            .pending_disk_writes
            .remove(&(file_id.to_string(), chunk_id))
        else {
            return false;
        };
        let complete_result = self.disk.lock().complete_write(&pending.ticket, None);
        if let Err(err) = complete_result {
            warn!(node = %self.node_id, file_id, chunk_id, %err, "disk commit failed");
            self.os_process_failures += 1;
            self.abort_transfer(file_id);
            return false;
        }

        let Some(transfer) = self.active_transfers.get_mut(file_id) else {
            return false;
        };
        if let Some(chunk) = transfer.chunks.iter_mut().find(|c| c.chunk_id == chunk_id) {
            chunk.status = TransferStatus::Completed;
            self.total_data_transferred += chunk.size;
        }
        transfer.status = TransferStatus::InProgress;

        if transfer
            .chunks
            .iter()
            .all(|c| c.status == TransferStatus::Completed)
        {
            transfer.status = TransferStatus::Completed;
            transfer.completed_at = Some(completed_time);
            let finished = self.active_transfers.remove(file_id).expect("present above");
            self.stored_files.insert(file_id.to_string(), finished);
            self.total_requests_processed += 1;
        }
        true
    }

    /// Mark a transfer FAILED, cancel its disk tickets, and reclaim its
    /// reservation. Safe to call repeatedly.
    pub fn abort_transfer(&mut self, file_id: &str) {
        if let Some(transfer) = self.active_transfers.remove(file_id) {
            debug!(node = %self.node_id, file_id, name = %transfer.file_name, "transfer aborted");
            self.failed_transfers += 1;
        }
        let stale: Vec<(String, u32)> = self
            .pending_disk_writes
            .keys()
            .filter(|(fid, _)| fid == file_id)
            .cloned()
            .collect();
        for key in stale {
            if let Some(pending) = self.pending_disk_writes.remove(&key) {
                self.disk.lock().cancel_ticket(&pending.ticket);
            }
        }
        self.disk.lock().release_file(file_id);
    }

    /// Build a retrieval transfer whose chunks mirror a stored file's.
    pub fn retrieve_file(
        &self,
        file_id: &str,
        destination_node: &str,
        current_time: f64,
    ) -> Option<FileTransfer> {
        let stored = self.stored_files.get(file_id)?;
        let digest = blake3::hash(format!("retr-{file_id}-{current_time}").as_bytes());
        Some(FileTransfer {
            file_id: format!("retr-{}", &digest.to_hex()[..24]),
            file_name: stored.file_name.clone(),
            total_size: stored.total_size,
            chunks: stored
                .chunks
                .iter()
                .map(|c| FileChunk {
                    chunk_id: c.chunk_id,
                    size: c.size,
                    checksum: c.checksum.clone(),
                    status: TransferStatus::Pending,
                    stored_node: Some(destination_node.to_string()),
                })
                .collect(),
            status: TransferStatus::Pending,
            created_at: current_time,
            completed_at: None,
            is_retrieval: true,
            backing_file_id: file_id.to_string(),
            target_node: Some(destination_node.to_string()),
            segment_offset: stored.segment_offset,
        })
    }

    /// Persist a file directly onto this node without network hops.
    pub fn store_local_file(
        &mut self,
        file_name: &str,
        file_size: u64,
        current_time: f64,
    ) -> Option<FileTransfer> {
        let digest = blake3::hash(
            format!("local-{}-{}-{}", self.node_id, file_name, current_time).as_bytes(),
        );
        let file_id = digest.to_hex()[..32].to_string();
        self.store_local_file_with_id(&file_id, file_name, file_size, current_time)
    }

    /// Local persistence with a caller-provided id (snapshot restore path).
    pub fn store_local_file_with_id(
        &mut self,
        file_id: &str,
        file_name: &str,
        file_size: u64,
        current_time: f64,
    ) -> Option<FileTransfer> {
        let path = format!("/{}/{}", self.node_id, file_name);
        match self.disk.lock().reserve_file(file_id, file_size, Some(&path)) {
            Ok(true) => {}
            _ => return None,
        }
        let mut chunks = self.generate_chunks(file_id, file_size, None);
        {
            let mut disk = self.disk.lock();
            for chunk in &mut chunks {
                chunk.status = TransferStatus::Completed;
                chunk.stored_node = Some(self.node_id.clone());
                if disk
                    .write_chunk(file_id, chunk.chunk_id, None, chunk.size)
                    .is_err()
                {
                    disk.release_file(file_id);
                    return None;
                }
            }
        }
        let transfer = FileTransfer {
            file_id: file_id.to_string(),
            file_name: file_name.to_string(),
            total_size: file_size,
            chunks,
            status: TransferStatus::Completed,
            created_at: current_time,
            completed_at: Some(current_time),
            is_retrieval: false,
            backing_file_id: file_id.to_string(),
            target_node: Some(self.node_id.clone()),
            segment_offset: 0,
        };
        self.stored_files
            .insert(file_id.to_string(), transfer.clone());
        self.total_data_transferred += file_size;
        self.total_requests_processed += 1;
        Some(transfer)
    }

    /// Drop a stored file and its disk bytes (healing GC path).
    pub fn purge_stored_file(&mut self, file_id: &str) {
        self.stored_files.remove(file_id);
        self.disk.lock().delete_file(file_id);
    }

    // OS integration -----------------------------------------------------

    fn compute_memory_requirement(&self, chunk_size: u64, scale: f64) -> u64 {
        let capacity = self.os.memory_capacity_bytes();
        let working_set = ((capacity as f64 * WORKING_SET_FRACTION) as u64).min(chunk_size);
        let working_set = working_set.max(MIN_WORKING_SET_BYTES.min(capacity));
        ((working_set as f64 * scale.max(0.01)) as u64).max(1)
    }

    fn compute_cpu_requirement(&self, chunk_size: u64, scale: f64) -> f64 {
        let base = (chunk_size as f64 / (1024.0 * 1024.0)) * CPU_SECONDS_PER_MIB
            / self.cpu_capacity.max(1) as f64;
        (base.max(0.001) * scale.max(0.01)).max(0.001)
    }

    fn run_process_to_completion(&mut self, pid: u32) -> bool {
        for _ in 0..MAX_PROCESS_TICKS {
            match self.os.process(pid).map(|p| p.state) {
                None => return false,
                Some(ProcessState::Completed) => return true,
                Some(ProcessState::Failed) => return false,
                _ => self.os.schedule_tick(),
            }
        }
        false
    }

    fn execute_chunk_process(
        &mut self,
        chunk_size: u64,
        purpose: &str,
        cpu_scale: f64,
        memory_scale: f64,
        work: Option<ProcessWork>,
    ) -> bool {
        let name = format!("{purpose}-{}", self.node_id);
        let cpu = self.compute_cpu_requirement(chunk_size, cpu_scale);
        let memory = self.compute_memory_requirement(chunk_size, memory_scale);
        let Some(pid) = self
            .os
            .spawn_process(&name, cpu, memory, work.unwrap_or_else(|| Box::new(|_| Ok(()))))
        else {
            self.os_process_failures += 1;
            return false;
        };
        if !self.run_process_to_completion(pid) {
            self.os.kill_process(pid);
            self.os_process_failures += 1;
            return false;
        }
        true
    }

    /// Acquire a NIC reservation plus an egress process for an outbound
    /// chunk. Returns the process id used to release both later.
    pub fn start_chunk_transmission(&mut self, chunk_size: u64) -> Option<u32> {
        let result = self
            .os
            .invoke_syscall("network_send", &SyscallArgs::NetworkSend { bytes: chunk_size });
        if !result.success {
            self.os_process_failures += 1;
            return None;
        }
        let ticket = result.ticket;
        let nic = self.nic_device_name();
        let name = format!("egress-{}", self.node_id);
        let cpu = self.compute_cpu_requirement(chunk_size, 0.5);
        let memory = self.compute_memory_requirement(chunk_size, 1.0);
        let Some(pid) = self.os.spawn_process(&name, cpu, memory, Box::new(|_| Ok(()))) else {
            let _ = self.os.complete_device_request(
                &nic,
                ticket,
                false,
                Some("chunk-transmission-not-started".into()),
            );
            self.os_process_failures += 1;
            return None;
        };
        self.transmission_tickets.insert(pid, ticket);
        Some(pid)
    }

    /// Release the NIC slot held by a transmission, running its egress
    /// process to completion first.
    pub fn complete_chunk_transmission(&mut self, pid: Option<u32>) {
        let Some(pid) = pid else {
            return;
        };
        let ticket = self.transmission_tickets.remove(&pid).flatten();
        let nic = self.nic_device_name();
        let state = self.os.process(pid).map(|p| p.state);
        match state {
            None => {
                let _ = self.os.complete_device_request(
                    &nic,
                    ticket,
                    false,
                    Some("missing-egress-process".into()),
                );
            }
            Some(ProcessState::Failed) => {
                self.os_process_failures += 1;
                let _ = self.os.complete_device_request(
                    &nic,
                    ticket,
                    false,
                    Some("egress-process-failed".into()),
                );
            }
            Some(ProcessState::Completed) => {
                let _ = self.os.complete_device_request(&nic, ticket, true, None);
            }
            Some(_) => {
                if self.run_process_to_completion(pid) {
                    let _ = self.os.complete_device_request(&nic, ticket, true, None);
                } else {
                    self.os.kill_process(pid);
                    self.os_process_failures += 1;
                    let _ = self.os.complete_device_request(
                        &nic,
                        ticket,
                        false,
                        Some("egress-process-timeout".into()),
                    );
                }
            }
        }
    }

    /// For retrieval transfers: run an OS process whose work reads the
    /// backing chunk through the `disk_read` syscall.
    pub fn prepare_chunk_read(&mut self, backing_file_id: &str, chunk_id: u32, size: u64) -> bool {
        let file_id = backing_file_id.to_string();
        let work: ProcessWork = Box::new(move |sys| {
            let result = sys.invoke(
                "disk_read",
                &SyscallArgs::DiskRead {
                    file_id: file_id.clone(),
                    chunk_id,
                    size,
                },
            );
            if result.success {
                Ok(())
            } else {
                Err(result.error.unwrap_or_else(|| "disk-read-failed".into()))
            }
        });
        self.execute_chunk_process(size, "egress-read", 1.0, 1.0, Some(work))
    }

    /// Spawn a maintenance-device job (max one inflight).
    pub fn schedule_background_job(
        &mut self,
        job_name: &str,
        cpu_seconds: f64,
        memory_bytes: u64,
        task: ProcessWork,
    ) -> Option<u32> {
        let result = self.os.invoke_syscall(
            "maintenance_hook",
            &SyscallArgs::MaintenanceHook {
                job_name: job_name.to_string(),
            },
        );
        if !result.success {
            self.os_process_failures += 1;
            return None;
        }
        let ticket = result.ticket;
        let device = self.maintenance_device_name();
        let name = format!("bg-{job_name}-{}", self.node_id);
        let Some(pid) = self
            .os
            .spawn_process(&name, cpu_seconds.max(0.001), memory_bytes.max(1), task)
        else {
            let _ = self.os.complete_device_request(
                &device,
                ticket,
                false,
                Some("background-process-spawn-failed".into()),
            );
            self.os_process_failures += 1;
            return None;
        };
        self.background_jobs
            .entry(job_name.to_string())
            .or_default()
            .push(pid);
        self.maintenance_tickets.insert(pid, ticket);
        Some(pid)
    }

    /// Run every queued background job to completion, releasing its
    /// maintenance slot.
    pub fn drain_background_jobs(&mut self) {
        let jobs: Vec<(String, Vec<u32>)> = self
            .background_jobs
            .iter()
            .map(|(name, pids)| (name.clone(), pids.clone()))
            .collect();
        let device = self.maintenance_device_name();
        for (job_name, pids) in jobs {
            for pid in pids {
                let success = self.run_process_to_completion(pid);
                if !success {
                    self.os.kill_process(pid);
                    self.os_process_failures += 1;
                }
                let ticket = self.maintenance_tickets.remove(&pid).flatten();
                let _ = self.os.complete_device_request(
                    &device,
                    ticket,
                    success,
                    (!success).then(|| "background-process-failed".to_string()),
                );
            }
            self.background_jobs.insert(job_name, Vec::new());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> StorageVirtualNode {
        StorageVirtualNode::new("n1", 4, 8, 10, 1000, Some("us-east-1a".into()))
    }

    #[test]
    fn chunk_size_hint_is_clamped() {
        let n = node();
        assert_eq!(n.calculate_chunk_size(100 * 1024 * 1024, Some(1)), MIN_CHUNK_SIZE_BYTES);
        assert_eq!(
            n.calculate_chunk_size(1024 * 1024 * 1024, Some(u64::MAX)),
            MAX_CHUNK_SIZE_BYTES
        );
        // Hint larger than the file collapses to the file size.
        assert_eq!(n.calculate_chunk_size(300 * 1024, Some(4 * 1024 * 1024)), 300 * 1024);
    }

    #[test]
    fn chunk_size_heuristic_scales_with_file() {
        let n = node();
        assert_eq!(n.calculate_chunk_size(1024 * 1024, None), 512 * 1024);
        assert_eq!(n.calculate_chunk_size(50 * 1024 * 1024, None), 2 * 1024 * 1024);
        assert_eq!(n.calculate_chunk_size(500 * 1024 * 1024, None), 10 * 1024 * 1024);
    }

    #[test]
    fn initiate_reserves_and_chunks() {
        let mut n = node();
        let transfer = n
            .initiate_file_transfer("f1", "video.mp4", 5 * 1024 * 1024, 0.0, None, None, 0)
            .unwrap();
        assert_eq!(transfer.status, TransferStatus::Pending);
        assert_eq!(transfer.chunks.len(), 10); // 5 MiB / 512 KiB
        assert_eq!(
            transfer.chunks.iter().map(|c| c.size).sum::<u64>(),
            5 * 1024 * 1024
        );
        assert_eq!(n.projected_storage_usage(), 5 * 1024 * 1024);
    }

    #[test]
    fn initiate_refuses_over_capacity() {
        let mut n = node();
        assert!(n
            .initiate_file_transfer("huge", "huge.bin", 100 * 1024 * 1024 * 1024, 0.0, None, None, 0)
            .is_none());
    }

    #[test]
    fn chunk_commit_flow_completes_transfer() {
        let mut n = node();
        let transfer = n
            .initiate_file_transfer("f1", "a.bin", 600 * 1024, 0.0, None, None, 0)
            .unwrap();
        assert_eq!(transfer.chunks.len(), 2);

        let first = n.process_chunk_transfer("f1", 0, "src", 0.1);
        assert!(first.success);
        assert!(first.completion_time > 0.1);
        assert!(n.finalize_chunk_commit("f1", 0, first.completion_time));
        assert!(n.stored_file("f1").is_none());

        let second = n.process_chunk_transfer("f1", 1, "src", 0.2);
        assert!(second.success);
        assert!(n.finalize_chunk_commit("f1", 1, second.completion_time));

        let stored = n.stored_file("f1").unwrap();
        assert_eq!(stored.status, TransferStatus::Completed);
        assert_eq!(n.total_requests_processed(), 1);
        assert_eq!(n.used_storage(), 600 * 1024);
    }

    #[test]
    fn abort_releases_reservation_and_counts_failure() {
        let mut n = node();
        n.initiate_file_transfer("f1", "a.bin", 600 * 1024, 0.0, None, None, 0)
            .unwrap();
        let commit = n.process_chunk_transfer("f1", 0, "src", 0.1);
        assert!(commit.success);
        n.abort_transfer("f1");
        assert_eq!(n.failed_transfers(), 1);
        assert_eq!(n.projected_storage_usage(), 0);
        // The orphaned commit event is a no-op.
        assert!(!n.finalize_chunk_commit("f1", 0, 1.0));
    }

    #[test]
    fn store_local_file_commits_synchronously() {
        let mut n = node();
        let transfer = n.store_local_file("notes.txt", 300 * 1024, 1.0).unwrap();
        assert_eq!(transfer.status, TransferStatus::Completed);
        assert_eq!(n.used_storage(), 300 * 1024);
        assert!(n.has_stored_file_named("notes.txt"));
    }

    #[test]
    fn retrieve_mirrors_stored_chunks() {
        let mut n = node();
        let stored = n.store_local_file("notes.txt", 700 * 1024, 1.0).unwrap();
        let retrieval = n.retrieve_file(&stored.file_id, "n2", 2.0).unwrap();
        assert!(retrieval.is_retrieval);
        assert_eq!(retrieval.backing_file_id, stored.file_id);
        assert_eq!(retrieval.chunks.len(), stored.chunks.len());
        assert_eq!(retrieval.total_size, stored.total_size);
        assert!(n.retrieve_file("missing", "n2", 2.0).is_none());
    }

    #[test]
    fn nic_reservation_exhausts_at_vcpu_count() {
        let mut n = StorageVirtualNode::new("n1", 2, 8, 10, 1000, None);
        let p1 = n.start_chunk_transmission(1024 * 1024);
        let p2 = n.start_chunk_transmission(1024 * 1024);
        assert!(p1.is_some());
        assert!(p2.is_some());
        // Two vCPUs → two NIC slots; the third acquisition fails.
        assert!(n.start_chunk_transmission(1024 * 1024).is_none());
        assert_eq!(n.os_process_failures(), 1);

        n.complete_chunk_transmission(p1);
        assert!(n.start_chunk_transmission(1024 * 1024).is_some());
    }

    #[test]
    fn prepare_chunk_read_fails_for_missing_backing_file() {
        let mut n = node();
        assert!(!n.prepare_chunk_read("missing", 0, 1024));
        assert_eq!(n.os_process_failures(), 1);

        let stored = n.store_local_file("data.bin", 512 * 1024, 0.0).unwrap();
        assert!(n.prepare_chunk_read(&stored.file_id, 0, stored.chunks[0].size));
    }

    #[test]
    fn background_jobs_respect_single_slot() {
        let mut n = node();
        let ran = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let seen = std::sync::Arc::clone(&ran);
        let pid = n.schedule_background_job(
            "scrub",
            0.01,
            1024,
            Box::new(move |_| {
                seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            }),
        );
        assert!(pid.is_some());
        // Maintenance device has one slot; a second job is refused until drain.
        assert!(n
            .schedule_background_job("scrub2", 0.01, 1024, Box::new(|_| Ok(())))
            .is_none());
        n.drain_background_jobs();
        assert_eq!(ran.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(n
            .schedule_background_job("scrub3", 0.01, 1024, Box::new(|_| Ok(())))
            .is_some());
    }

    #[test]
    fn clone_scales_storage_and_bandwidth() {
        let n = node();
        let replica = n.clone_node("n1-replica-1", 2.0, 0.5, None);
        assert_eq!(replica.total_storage(), 20 * 1024 * 1024 * 1024);
        assert_eq!(replica.bandwidth_bps(), 500 * 1_000_000);
        assert_eq!(replica.zone(), Some("us-east-1a"));
    }
}
