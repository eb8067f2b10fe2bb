use super::device::DeviceManager;

/// Work body executed exactly once on a process's first scheduling slot.
/// It receives the OS device/syscall surface so it can perform device calls
/// without re-entering the scheduler.
pub type ProcessWork = Box<dyn FnMut(&mut DeviceManager) -> Result<(), String> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Ready,
    Running,
    Blocked,
    Completed,
    Failed,
}

impl ProcessState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessState::Completed | ProcessState::Failed)
    }
}

pub struct VirtualProcess {
    pub pid: u32,
    pub name: String,
    pub cpu_required: f64,
    pub memory_required: u64,
    pub state: ProcessState,
    pub cpu_used: f64,
    pub failure_reason: Option<String>,
    pub(crate) work_executed: bool,
    pub(crate) work: Option<ProcessWork>,
}

impl VirtualProcess {
    pub(crate) fn new(
        pid: u32,
        name: String,
        cpu_required: f64,
        memory_required: u64,
        work: ProcessWork,
    ) -> Self {
        Self {
            pid,
            name,
            cpu_required,
            memory_required,
            state: ProcessState::Ready,
            cpu_used: 0.0,
            failure_reason: None,
            work_executed: false,
            work: Some(work),
        }
    }
}

impl std::fmt::Debug for VirtualProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualProcess")
            .field("pid", &self.pid)
            .field("name", &self.name)
            .field("cpu_required", &self.cpu_required)
            .field("memory_required", &self.memory_required)
            .field("state", &self.state)
            .field("cpu_used", &self.cpu_used)
            .field("failure_reason", &self.failure_reason)
            .finish()
    }
}
