//! Cooperative round-robin process scheduler over a single CPU-equivalent.
//!
//! Spawning deducts memory up front; the deduction is returned exactly once
//! when the process reaches a terminal state. Work bodies run at most once,
//! on the process's first slot, and a work error fails the process.

use std::collections::{BTreeMap, VecDeque};

use tracing::debug;

use super::device::{DeviceManager, SyscallArgs, SyscallResult};
use super::error::VosResult;
use super::process::{ProcessState, ProcessWork, VirtualProcess};

pub struct VirtualOs {
    cpu_capacity: u32,
    memory_capacity_bytes: u64,
    cpu_time_slice: f64,
    processes: BTreeMap<u32, VirtualProcess>,
    ready_queue: VecDeque<u32>,
    blocked: Vec<u32>,
    next_pid: u32,
    used_memory: u64,
    sys: DeviceManager,
}

impl VirtualOs {
    pub fn new(cpu_capacity: u32, memory_capacity_bytes: u64) -> Self {
        Self {
            cpu_capacity: cpu_capacity.max(1),
            memory_capacity_bytes,
            cpu_time_slice: 0.01,
            processes: BTreeMap::new(),
            ready_queue: VecDeque::new(),
            blocked: Vec::new(),
            next_pid: 1,
            used_memory: 0,
            sys: DeviceManager::default(),
        }
    }

    pub fn with_time_slice(mut self, cpu_time_slice: f64) -> Self {
        self.cpu_time_slice = cpu_time_slice;
        self
    }

    pub fn cpu_capacity(&self) -> u32 {
        self.cpu_capacity
    }

    pub fn memory_capacity_bytes(&self) -> u64 {
        self.memory_capacity_bytes
    }

    pub fn used_memory(&self) -> u64 {
        self.used_memory
    }

    pub fn devices(&self) -> &DeviceManager {
        &self.sys
    }

    pub fn devices_mut(&mut self) -> &mut DeviceManager {
        &mut self.sys
    }

    /// Admit a process, deducting its memory. Returns `None` when the memory
    /// budget cannot cover it (admission denial, not an error).
    pub fn spawn_process(
        &mut self,
        name: &str,
        cpu_required: f64,
        memory_required: u64,
        work: ProcessWork,
    ) -> Option<u32> {
        if self.used_memory + memory_required > self.memory_capacity_bytes {
            debug!(process = name, memory_required, "memory admission denied");
            return None;
        }
        let pid = self.next_pid;
        self.next_pid += 1;
        self.processes.insert(
            pid,
            VirtualProcess::new(pid, name.to_string(), cpu_required, memory_required, work),
        );
        self.ready_queue.push_back(pid);
        self.used_memory += memory_required;
        Some(pid)
    }

    /// Advance the scheduler by one time slice.
    pub fn schedule_tick(&mut self) {
        let Some(pid) = self.ready_queue.pop_front() else {
            self.sys.drain_interrupts();
            return;
        };
        let Some(process) = self.processes.get_mut(&pid) else {
            self.sys.drain_interrupts();
            return;
        };
        if process.state.is_terminal() {
            self.sys.drain_interrupts();
            return;
        }

        process.state = ProcessState::Running;
        if !process.work_executed {
            process.work_executed = true;
            if let Some(mut work) = process.work.take() {
                if let Err(reason) = work(&mut self.sys) {
                    process.state = ProcessState::Failed;
                    process.failure_reason = Some(reason);
                    self.used_memory = self.used_memory.saturating_sub(process.memory_required);
                    self.sys.drain_interrupts();
                    return;
                }
            }
        }

        let budget = (process.cpu_required - process.cpu_used).min(self.cpu_time_slice);
        process.cpu_used += budget.max(0.0);
        if process.cpu_used >= process.cpu_required {
            process.state = ProcessState::Completed;
            self.used_memory = self.used_memory.saturating_sub(process.memory_required);
        } else {
            process.state = ProcessState::Ready;
            self.ready_queue.push_back(pid);
        }
        self.sys.drain_interrupts();
    }

    pub fn block_process(&mut self, pid: u32) {
        let Some(process) = self.processes.get_mut(&pid) else {
            return;
        };
        if !matches!(process.state, ProcessState::Ready | ProcessState::Running) {
            return;
        }
        process.state = ProcessState::Blocked;
        self.ready_queue.retain(|p| *p != pid);
        self.blocked.push(pid);
    }

    pub fn unblock_process(&mut self, pid: u32) {
        self.blocked.retain(|p| *p != pid);
        let Some(process) = self.processes.get_mut(&pid) else {
            return;
        };
        if process.state != ProcessState::Blocked {
            return;
        }
        process.state = ProcessState::Ready;
        self.ready_queue.push_back(pid);
    }

    /// Force-remove a process, refunding memory unless it already reached a
    /// terminal state (whose transition refunded it).
    pub fn kill_process(&mut self, pid: u32) {
        let Some(mut process) = self.processes.remove(&pid) else {
            return;
        };
        self.ready_queue.retain(|p| *p != pid);
        self.blocked.retain(|p| *p != pid);
        if !process.state.is_terminal() {
            self.used_memory = self.used_memory.saturating_sub(process.memory_required);
        }
        process.state = ProcessState::Failed;
    }

    pub fn has_runnable_work(&self) -> bool {
        !self.ready_queue.is_empty()
    }

    pub fn process(&self, pid: u32) -> Option<&VirtualProcess> {
        self.processes.get(&pid)
    }

    pub fn invoke_syscall(&mut self, name: &str, args: &SyscallArgs) -> SyscallResult {
        let result = self.sys.invoke(name, args);
        self.sys.drain_interrupts();
        result
    }

    pub fn complete_device_request(
        &mut self,
        device: &str,
        ticket: Option<u64>,
        success: bool,
        error: Option<String>,
    ) -> VosResult<()> {
        self.sys.complete_device_request(device, ticket, success, error)?;
        self.sys.drain_interrupts();
        Ok(())
    }
}
