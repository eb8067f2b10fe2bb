mod device;
mod error;
mod os;
mod process;

pub use device::{
    DeviceHandler, DeviceManager, DevicePayload, DeviceSubmitMode, Interrupt, InterruptHandler,
    SyscallArgs, SyscallContext, SyscallHandler, SyscallResult, VirtualDevice,
};
pub use error::{VosError, VosResult};
pub use os::VirtualOs;
pub use process::{ProcessState, ProcessWork, VirtualProcess};
