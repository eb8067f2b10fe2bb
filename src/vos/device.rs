//! Devices, syscalls, and the interrupt queue.
//!
//! Devices are string-named and bounded by `max_inflight` slots. Instant
//! submissions run the handler synchronously, release the slot, and enqueue
//! an interrupt. Reservation submissions hold a ticket until
//! `complete_device_request` releases the slot and enqueues the interrupt.
//! A saturated device never consumes a slot.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use super::error::{VosError, VosResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DevicePayload {
    DiskWrite {
        file_id: String,
        chunk_id: u32,
        size: u64,
    },
    DiskRead {
        file_id: String,
        chunk_id: u32,
        size: u64,
    },
    NetworkSend {
        bytes: u64,
        node_id: String,
    },
    Maintenance {
        job: String,
        node_id: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSubmitMode {
    Instant,
    Reservation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyscallArgs {
    DiskWrite {
        file_id: String,
        chunk_id: u32,
        size: u64,
    },
    DiskRead {
        file_id: String,
        chunk_id: u32,
        size: u64,
    },
    NetworkSend {
        bytes: u64,
    },
    MaintenanceHook {
        job_name: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyscallResult {
    pub success: bool,
    pub error: Option<String>,
    pub ticket: Option<u64>,
}

impl SyscallResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
            ticket: None,
        }
    }

    pub fn ok_with_ticket(ticket: u64) -> Self {
        Self {
            success: true,
            error: None,
            ticket: Some(ticket),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ticket: None,
        }
    }
}

pub type DeviceHandler = Box<dyn FnMut(&DevicePayload) -> Result<(), String> + Send>;
pub type SyscallHandler = Box<dyn FnMut(&mut SyscallContext<'_>, &SyscallArgs) -> SyscallResult + Send>;
pub type InterruptHandler = Box<dyn FnMut(&Interrupt) + Send>;

#[derive(Debug, Clone)]
pub struct Interrupt {
    pub device: String,
    pub ticket: Option<u64>,
    pub success: bool,
    pub error: Option<String>,
}

pub struct VirtualDevice {
    pub name: String,
    handler: Option<DeviceHandler>,
    pub max_inflight: usize,
    inflight: usize,
    next_ticket: u64,
    active_tickets: BTreeSet<u64>,
}

impl VirtualDevice {
    fn new(name: String, handler: Option<DeviceHandler>, max_inflight: usize) -> Self {
        Self {
            name,
            handler,
            max_inflight: max_inflight.max(1),
            inflight: 0,
            next_ticket: 1,
            active_tickets: BTreeSet::new(),
        }
    }

    pub fn inflight(&self) -> usize {
        self.inflight
    }

    fn saturated(&self) -> bool {
        self.inflight >= self.max_inflight
    }
}

/// Context handed to syscall handlers: the device table plus the interrupt
/// queue, so a handler can submit device work without re-entering the OS.
pub struct SyscallContext<'a> {
    devices: &'a mut BTreeMap<String, VirtualDevice>,
    interrupts: &'a mut VecDeque<Interrupt>,
}

impl<'a> SyscallContext<'a> {
    pub fn device_call(
        &mut self,
        device_name: &str,
        payload: DevicePayload,
        mode: DeviceSubmitMode,
    ) -> SyscallResult {
        let Some(device) = self.devices.get_mut(device_name) else {
            return SyscallResult::failure(format!("unknown device '{device_name}'"));
        };
        if device.saturated() {
            return SyscallResult::failure("device-busy");
        }
        match mode {
            DeviceSubmitMode::Instant => {
                device.inflight += 1;
                let outcome = match device.handler.as_mut() {
                    Some(handler) => handler(&payload),
                    None => Ok(()),
                };
                device.inflight -= 1;
                match outcome {
                    Ok(()) => {
                        self.interrupts.push_back(Interrupt {
                            device: device_name.to_string(),
                            ticket: None,
                            success: true,
                            error: None,
                        });
                        SyscallResult::ok()
                    }
                    Err(reason) => SyscallResult::failure(reason),
                }
            }
            DeviceSubmitMode::Reservation => {
                device.inflight += 1;
                let ticket = device.next_ticket;
                device.next_ticket += 1;
                device.active_tickets.insert(ticket);
                SyscallResult::ok_with_ticket(ticket)
            }
        }
    }
}

/// The OS surface below the process scheduler: device table, syscall
/// registry, interrupt queue, and invocation counters.
#[derive(Default)]
pub struct DeviceManager {
    devices: BTreeMap<String, VirtualDevice>,
    syscalls: BTreeMap<String, SyscallHandler>,
    interrupt_queue: VecDeque<Interrupt>,
    interrupt_handlers: BTreeMap<String, Vec<InterruptHandler>>,
    syscall_invocations: u64,
    syscall_denials: u64,
}

impl DeviceManager {
    pub fn register_device(
        &mut self,
        name: &str,
        handler: Option<DeviceHandler>,
        max_inflight: usize,
    ) -> VosResult<()> {
        if self.devices.contains_key(name) {
            return Err(VosError::DuplicateDevice(name.to_string()));
        }
        self.devices
            .insert(name.to_string(), VirtualDevice::new(name.to_string(), handler, max_inflight));
        Ok(())
    }

    pub fn register_syscall(&mut self, name: &str, handler: SyscallHandler) {
        self.syscalls.insert(name.to_string(), handler);
    }

    pub fn register_interrupt_handler(&mut self, device: &str, handler: InterruptHandler) {
        self.interrupt_handlers
            .entry(device.to_string())
            .or_default()
            .push(handler);
    }

    pub fn device_inflight(&self, name: &str) -> Option<usize> {
        self.devices.get(name).map(|d| d.inflight)
    }

    pub fn syscall_invocations(&self) -> u64 {
        self.syscall_invocations
    }

    pub fn syscall_denials(&self) -> u64 {
        self.syscall_denials
    }

    pub fn invoke(&mut self, name: &str, args: &SyscallArgs) -> SyscallResult {
        self.syscall_invocations += 1;
        let Some(mut handler) = self.syscalls.remove(name) else {
            self.syscall_denials += 1;
            return SyscallResult::failure(format!("unknown syscall '{name}'"));
        };
        let result = {
            let mut ctx = SyscallContext {
                devices: &mut self.devices,
                interrupts: &mut self.interrupt_queue,
            };
            handler(&mut ctx, args)
        };
        self.syscalls.insert(name.to_string(), handler);
        if !result.success {
            self.syscall_denials += 1;
        }
        result
    }

    /// Release a reservation slot and raise the completion interrupt.
    pub fn complete_device_request(
        &mut self,
        device_name: &str,
        ticket: Option<u64>,
        success: bool,
        error: Option<String>,
    ) -> VosResult<()> {
        let device = self
            .devices
            .get_mut(device_name)
            .ok_or_else(|| VosError::UnknownDevice(device_name.to_string()))?;
        if let Some(ticket) = ticket {
            if device.active_tickets.remove(&ticket) {
                device.inflight = device.inflight.saturating_sub(1);
            }
        }
        self.interrupt_queue.push_back(Interrupt {
            device: device_name.to_string(),
            ticket,
            success,
            error,
        });
        Ok(())
    }

    /// Dispatch every queued interrupt to the handlers registered for its
    /// device, then discard it.
    pub fn drain_interrupts(&mut self) {
        while let Some(interrupt) = self.interrupt_queue.pop_front() {
            if let Some(handlers) = self.interrupt_handlers.get_mut(&interrupt.device) {
                for handler in handlers.iter_mut() {
                    handler(&interrupt);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn net_payload() -> DevicePayload {
        DevicePayload::NetworkSend {
            bytes: 64,
            node_id: "n1".into(),
        }
    }

    #[test]
    fn instant_submit_runs_handler_and_enqueues_interrupt() {
        let mut mgr = DeviceManager::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        mgr.register_device(
            "dev",
            Some(Box::new(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })),
            2,
        )
        .unwrap();
        mgr.register_syscall(
            "ping",
            Box::new(|ctx, _| ctx.device_call("dev", net_payload(), DeviceSubmitMode::Instant)),
        );

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_seen = Arc::clone(&fired);
        mgr.register_interrupt_handler(
            "dev",
            Box::new(move |irq| {
                assert!(irq.success);
                fired_seen.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let result = mgr.invoke("ping", &SyscallArgs::NetworkSend { bytes: 64 });
        assert!(result.success);
        mgr.drain_interrupts();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(mgr.device_inflight("dev"), Some(0));
    }

    #[test]
    fn reservation_holds_slot_until_completed() {
        let mut mgr = DeviceManager::default();
        mgr.register_device("nic", None, 1).unwrap();
        mgr.register_syscall(
            "send",
            Box::new(|ctx, _| ctx.device_call("nic", net_payload(), DeviceSubmitMode::Reservation)),
        );

        let first = mgr.invoke("send", &SyscallArgs::NetworkSend { bytes: 1 });
        assert!(first.success);
        let ticket = first.ticket.unwrap();

        // Saturated: refused, no slot consumed.
        let second = mgr.invoke("send", &SyscallArgs::NetworkSend { bytes: 1 });
        assert!(!second.success);
        assert_eq!(second.error.as_deref(), Some("device-busy"));
        assert_eq!(mgr.device_inflight("nic"), Some(1));
        assert_eq!(mgr.syscall_denials(), 1);

        mgr.complete_device_request("nic", Some(ticket), true, None)
            .unwrap();
        assert_eq!(mgr.device_inflight("nic"), Some(0));

        let third = mgr.invoke("send", &SyscallArgs::NetworkSend { bytes: 1 });
        assert!(third.success);
    }

    #[test]
    fn handler_error_becomes_failed_result() {
        let mut mgr = DeviceManager::default();
        mgr.register_device("dev", Some(Box::new(|_| Err("boom".into()))), 1)
            .unwrap();
        mgr.register_syscall(
            "op",
            Box::new(|ctx, _| ctx.device_call("dev", net_payload(), DeviceSubmitMode::Instant)),
        );
        let result = mgr.invoke("op", &SyscallArgs::NetworkSend { bytes: 1 });
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("boom"));
        // Slot released despite the failure.
        assert_eq!(mgr.device_inflight("dev"), Some(0));
    }

    #[test]
    fn unknown_syscall_counts_as_denial() {
        let mut mgr = DeviceManager::default();
        let result = mgr.invoke("nope", &SyscallArgs::NetworkSend { bytes: 1 });
        assert!(!result.success);
        assert_eq!(mgr.syscall_invocations(), 1);
        assert_eq!(mgr.syscall_denials(), 1);
    }

    #[test]
    fn duplicate_device_registration_rejected() {
        let mut mgr = DeviceManager::default();
        mgr.register_device("dev", None, 1).unwrap();
        assert!(matches!(
            mgr.register_device("dev", None, 1),
            Err(VosError::DuplicateDevice(_))
        ));
    }
}
