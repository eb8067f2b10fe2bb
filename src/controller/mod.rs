mod controller;
mod error;
mod runtime;

pub use controller::{
    parse_size, EventRecord, FabricController, NodeInfo, NodeSpec, NodeStatus, PullOutcome,
};
pub use error::{ControllerError, ControllerResult};
pub use runtime::{ControllerHandle, ControllerRuntime};
