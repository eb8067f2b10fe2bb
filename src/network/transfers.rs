//! Per-tick chunk scheduling with per-link max-min fair sharing.
//!
//! Every tick recomputes each link's per-chunk share (capacity / occupant
//! count), advances byte counters, and walks chunks across hop boundaries.
//! A chunk holds a NIC reservation on its current sender; hop advancement
//! releases the old reservation and acquires one on the next sender.
//! Completion hands the chunk to the target node and schedules the disk
//! commit event at the ticket's completion time.

use std::collections::BTreeMap;

use super::network::{link_key, FabricSimulator, StorageVirtualNetwork};
use super::types::{ActiveChunk, FabricEvent, FileSegment, NetworkEvent, TransferPurpose};

impl StorageVirtualNetwork {
    pub(crate) fn ensure_tick(&mut self, sim: &mut FabricSimulator) {
        if !self.tick_scheduled && !self.active_chunks.is_empty() {
            let _ = sim.schedule_in(self.tick_interval, FabricEvent::NetworkTick);
            self.tick_scheduled = true;
        }
    }

    /// Put the next pending chunk of a transfer onto the wire.
    pub(crate) fn start_next_chunk(&mut self, sim: &mut FabricSimulator, file_id: &str) {
        let Some(op) = self.transfer_ops.get(file_id).cloned() else {
            return;
        };
        let next = self
            .nodes
            .get(&op.target)
            .and_then(|n| n.active_transfer(file_id))
            .and_then(|t| t.next_pending_chunk().map(|c| (c.chunk_id, c.size)));
        let Some((chunk_id, chunk_size)) = next else {
            return;
        };

        let Some(path) = self.compute_route(&op.source, &op.target) else {
            self.fail_transfer(sim, file_id, "No available route");
            return;
        };
        if let Some(op_mut) = self.transfer_ops.get_mut(file_id) {
            op_mut.path = path.clone();
        }

        if op.is_retrieval {
            let backing = op.backing_file_id.clone().unwrap_or_default();
            let read_ok = self
                .nodes
                .get_mut(&op.source)
                .map(|n| n.prepare_chunk_read(&backing, chunk_id, chunk_size))
                .unwrap_or(false);
            if !read_ok {
                self.fail_transfer(sim, file_id, "Chunk read failed");
                return;
            }
        }

        if let Some(node) = self.nodes.get_mut(&op.target) {
            node.mark_transfer_started(file_id);
        }

        if path.len() < 2 {
            // Same-node placement: the chunk arrives without touching a link.
            self.dispatch_chunk_arrival(sim, file_id, chunk_id, &op.source, &op.target);
            return;
        }

        let sender_pid = self
            .nodes
            .get_mut(&path[0])
            .and_then(|n| n.start_chunk_transmission(chunk_size));
        let Some(sender_pid) = sender_pid else {
            self.fail_transfer(sim, file_id, "Insufficient node resources");
            return;
        };
        if self.link_capacity_bps(&path[0], &path[1]) == 0 {
            if let Some(node) = self.nodes.get_mut(&path[0]) {
                node.complete_chunk_transmission(Some(sender_pid));
            }
            self.fail_transfer(sim, file_id, "No available bandwidth");
            return;
        }

        let handle = self.next_chunk_handle;
        self.next_chunk_handle += 1;
        self.attach_chunk(ActiveChunk {
            handle,
            file_id: file_id.to_string(),
            chunk_id,
            chunk_size,
            remaining_bytes: chunk_size as f64,
            path,
            hop_index: 0,
            sender_pid: Some(sender_pid),
        });
        self.ensure_tick(sim);
    }

    fn attach_chunk(&mut self, chunk: ActiveChunk) {
        let key = {
            let (u, v) = chunk.current_hop();
            link_key(u, v)
        };
        self.link_occupancy
            .entry(key)
            .or_default()
            .insert(chunk.handle);
        self.active_chunks.insert(chunk.handle, chunk);
    }

    fn detach_from_link(&mut self, handle: u64, u: &str, v: &str) {
        let key = link_key(u, v);
        if let Some(occupants) = self.link_occupancy.get_mut(&key) {
            occupants.remove(&handle);
            if occupants.is_empty() {
                self.link_occupancy.remove(&key);
            }
        }
    }

    /// Advance every in-flight chunk by one tick interval.
    pub(crate) fn network_tick(&mut self, sim: &mut FabricSimulator) {
        self.tick_scheduled = false;
        let now = sim.now();

        // Per-link share recomputation happens before any byte accounting.
        let mut shares: BTreeMap<u64, f64> = BTreeMap::new();
        for ((a, b), occupants) in &self.link_occupancy {
            if occupants.is_empty() {
                continue;
            }
            let capacity = self.link_capacity_bps(a, b) as f64;
            let per_chunk = capacity / occupants.len() as f64;
            for handle in occupants {
                shares.insert(*handle, per_chunk);
            }
        }

        let handles: Vec<u64> = self.active_chunks.keys().copied().collect();
        for handle in handles {
            let Some(mut chunk) = self.active_chunks.remove(&handle) else {
                continue;
            };
            let share_bps = shares.get(&handle).copied().unwrap_or(0.0);
            if share_bps <= 0.0 {
                let (u, v) = {
                    let (u, v) = chunk.current_hop();
                    (u.to_string(), v.to_string())
                };
                self.detach_from_link(handle, &u, &v);
                let pid = chunk.sender_pid.take();
                if let Some(node) = self.nodes.get_mut(&u) {
                    node.complete_chunk_transmission(pid);
                }
                self.fail_transfer(sim, &chunk.file_id, "No available bandwidth");
                continue;
            }

            chunk.remaining_bytes -= share_bps * self.tick_interval / 8.0;

            let mut outcome = ChunkAdvance::InFlight;
            while chunk.remaining_bytes <= 0.0 {
                let (u, v) = {
                    let (u, v) = chunk.current_hop();
                    (u.to_string(), v.to_string())
                };
                self.detach_from_link(handle, &u, &v);
                let pid = chunk.sender_pid.take();
                if let Some(node) = self.nodes.get_mut(&u) {
                    node.complete_chunk_transmission(pid);
                }

                if chunk.on_last_hop() {
                    outcome = ChunkAdvance::Completed;
                    break;
                }

                // Store-and-forward: the overflow carries into the next hop.
                let overflow = -chunk.remaining_bytes;
                chunk.hop_index += 1;
                let (next_u, next_v) = {
                    let (u, v) = chunk.current_hop();
                    (u.to_string(), v.to_string())
                };
                let next_pid = self
                    .nodes
                    .get_mut(&next_u)
                    .and_then(|n| n.start_chunk_transmission(chunk.chunk_size));
                let Some(next_pid) = next_pid else {
                    self.fail_transfer(
                        sim,
                        &chunk.file_id,
                        "Insufficient node resources for next hop",
                    );
                    outcome = ChunkAdvance::Failed;
                    break;
                };
                if self.link_capacity_bps(&next_u, &next_v) == 0 {
                    if let Some(node) = self.nodes.get_mut(&next_u) {
                        node.complete_chunk_transmission(Some(next_pid));
                    }
                    self.fail_transfer(sim, &chunk.file_id, "No available bandwidth");
                    outcome = ChunkAdvance::Failed;
                    break;
                }
                chunk.sender_pid = Some(next_pid);
                self.link_occupancy
                    .entry(link_key(&next_u, &next_v))
                    .or_default()
                    .insert(handle);
                chunk.remaining_bytes = chunk.chunk_size as f64 - overflow;
            }

            match outcome {
                ChunkAdvance::InFlight => {
                    self.active_chunks.insert(handle, chunk);
                }
                ChunkAdvance::Completed => {
                    let source = chunk.path[0].clone();
                    let target = chunk.path.last().expect("path is non-empty").clone();
                    self.dispatch_chunk_arrival(sim, &chunk.file_id, chunk.chunk_id, &source, &target);
                }
                ChunkAdvance::Failed => {}
            }
        }

        self.refresh_telemetry(now);
        self.run_demand_scaling(sim);
        self.ensure_tick(sim);
    }

    /// A chunk finished its last hop: hand it to the target node and
    /// schedule the disk-commit event at the ticket's completion time.
    pub(crate) fn dispatch_chunk_arrival(
        &mut self,
        sim: &mut FabricSimulator,
        file_id: &str,
        chunk_id: u32,
        source: &str,
        target: &str,
    ) {
        let now = sim.now();
        let commit = self
            .nodes
            .get_mut(target)
            .map(|n| n.process_chunk_transfer(file_id, chunk_id, source, now));
        match commit {
            Some(result) if result.success => {
                let at = result.completion_time.max(now);
                let _ = sim.schedule_at(
                    at,
                    FabricEvent::DiskCommit {
                        target: target.to_string(),
                        file_id: file_id.to_string(),
                        chunk_id,
                    },
                );
            }
            _ => {
                self.fail_transfer(sim, file_id, "Chunk processing failed");
            }
        }
    }

    /// The disk ticket for a committed chunk has elapsed.
    pub(crate) fn handle_disk_commit(
        &mut self,
        sim: &mut FabricSimulator,
        target: &str,
        file_id: &str,
        chunk_id: u32,
    ) {
        if !self.transfer_ops.contains_key(file_id) {
            return;
        }
        // Commits aimed at a failed or removed node were discarded when the
        // node failed; the late event is a no-op.
        if self.failed_nodes.contains(target) || !self.nodes.contains_key(target) {
            return;
        }
        let now = sim.now();
        let committed = self
            .nodes
            .get_mut(target)
            .map(|n| n.finalize_chunk_commit(file_id, chunk_id, now))
            .unwrap_or(false);
        if !committed {
            self.fail_transfer(sim, file_id, "Disk commit failed");
            return;
        }
        let source = self
            .transfer_ops
            .get(file_id)
            .map(|op| op.source.clone())
            .unwrap_or_default();
        self.emit(
            now,
            NetworkEvent::ChunkCompleted {
                file_id: file_id.to_string(),
                chunk_id,
                source,
                target: target.to_string(),
            },
        );

        let transfer_done = self
            .nodes
            .get(target)
            .map(|n| n.stored_file(file_id).is_some())
            .unwrap_or(false);
        if transfer_done {
            self.finalize_transfer(sim, file_id);
        } else {
            self.start_next_chunk(sim, file_id);
        }
        self.refresh_telemetry(now);
        self.run_demand_scaling(sim);
    }

    /// Completion bookkeeping: manifest updates per purpose, then the
    /// completion event.
    pub(crate) fn finalize_transfer(&mut self, sim: &mut FabricSimulator, file_id: &str) {
        let Some(op) = self.transfer_ops.remove(file_id) else {
            return;
        };
        let now = sim.now();
        let stored = self
            .nodes
            .get(&op.target)
            .and_then(|n| n.stored_file(file_id))
            .cloned();
        let completed_at = stored
            .as_ref()
            .and_then(|t| t.completed_at)
            .unwrap_or(now);

        match op.purpose {
            TransferPurpose::Direct | TransferPurpose::IngestSegment => {}
            TransferPurpose::Replica => {
                if let (Some(master), Some(stored)) = (op.master_id.clone(), stored.as_ref()) {
                    if let Some(manifest) = self.manifests_by_id.get_mut(&master) {
                        manifest.segments.push(FileSegment {
                            node_id: op.target.clone(),
                            file_id: file_id.to_string(),
                            size: stored.total_size,
                            offset: op.segment_offset,
                        });
                        self.segment_owners.insert(file_id.to_string(), master);
                    }
                }
            }
            TransferPurpose::Assemble => {
                if let Some(master) = op.master_id.clone() {
                    if let Some(manifest) = self.manifests_by_id.get_mut(&master) {
                        let rewritten = manifest.segments.iter_mut().find(|s| {
                            s.offset == op.segment_offset
                                && Some(&s.file_id) == op.backing_file_id.as_ref()
                        });
                        if let Some(segment) = rewritten {
                            segment.node_id = op.target.clone();
                            segment.file_id = file_id.to_string();
                            self.segment_owners.insert(file_id.to_string(), master);
                        }
                    }
                }
            }
        }

        self.emit(
            now,
            NetworkEvent::TransferCompleted {
                file_id: file_id.to_string(),
                source: op.source,
                target: op.target,
                completed_at,
                route: op.path,
            },
        );
    }

    /// Tear a transfer down: drop its chunks from the fabric, release the
    /// sender reservations, abort the target-side transfer (which releases
    /// the disk reservation), and publish the failure.
    pub(crate) fn fail_transfer(&mut self, sim: &mut FabricSimulator, file_id: &str, reason: &str) {
        let Some(op) = self.transfer_ops.remove(file_id) else {
            return;
        };
        let handles: Vec<u64> = self
            .active_chunks
            .values()
            .filter(|c| c.file_id == file_id)
            .map(|c| c.handle)
            .collect();
        for handle in handles {
            if let Some(mut chunk) = self.active_chunks.remove(&handle) {
                let (u, v) = {
                    let (u, v) = chunk.current_hop();
                    (u.to_string(), v.to_string())
                };
                self.detach_from_link(handle, &u, &v);
                let pid = chunk.sender_pid.take();
                if let Some(node) = self.nodes.get_mut(&u) {
                    node.complete_chunk_transmission(pid);
                }
            }
        }
        if let Some(node) = self.nodes.get_mut(&op.target) {
            node.abort_transfer(file_id);
        }
        self.emit(
            sim.now(),
            NetworkEvent::TransferFailed {
                file_id: file_id.to_string(),
                source: op.source,
                target: op.target,
                reason: reason.to_string(),
            },
        );
    }

    /// Detach a chunk from its dead link and restart it from the source on
    /// a freshly computed route (no partial-hop credit).
    pub(crate) fn reroute_chunk(&mut self, sim: &mut FabricSimulator, handle: u64) {
        let Some(mut chunk) = self.active_chunks.remove(&handle) else {
            return;
        };
        let (u, v) = {
            let (u, v) = chunk.current_hop();
            (u.to_string(), v.to_string())
        };
        self.detach_from_link(handle, &u, &v);
        let pid = chunk.sender_pid.take();
        if let Some(node) = self.nodes.get_mut(&u) {
            node.complete_chunk_transmission(pid);
        }

        let Some(op) = self.transfer_ops.get(&chunk.file_id).cloned() else {
            return;
        };
        let Some(path) = self.compute_route(&op.source, &op.target) else {
            self.fail_transfer(sim, &chunk.file_id, "No available route");
            return;
        };
        if path.len() < 2 {
            let file_id = chunk.file_id.clone();
            self.dispatch_chunk_arrival(sim, &file_id, chunk.chunk_id, &op.source, &op.target);
            return;
        }
        let sender_pid = self
            .nodes
            .get_mut(&path[0])
            .and_then(|n| n.start_chunk_transmission(chunk.chunk_size));
        let Some(sender_pid) = sender_pid else {
            self.fail_transfer(sim, &chunk.file_id, "Insufficient node resources");
            return;
        };
        if self.link_capacity_bps(&path[0], &path[1]) == 0 {
            if let Some(node) = self.nodes.get_mut(&path[0]) {
                node.complete_chunk_transmission(Some(sender_pid));
            }
            self.fail_transfer(sim, &chunk.file_id, "No available bandwidth");
            return;
        }
        if let Some(op_mut) = self.transfer_ops.get_mut(&chunk.file_id) {
            op_mut.path = path.clone();
        }
        chunk.path = path;
        chunk.hop_index = 0;
        chunk.remaining_bytes = chunk.chunk_size as f64;
        chunk.sender_pid = Some(sender_pid);
        self.attach_chunk(chunk);
        self.ensure_tick(sim);
    }
}

enum ChunkAdvance {
    InFlight,
    Completed,
    Failed,
}
