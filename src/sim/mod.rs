mod error;
mod scheduler;

pub use error::{SimError, SimResult};
pub use scheduler::{ScheduledEvent, Simulator};
