mod error;
mod orchestrator;

pub use error::{UploadError, UploadResult};
pub use orchestrator::{AppendOutcome, GapEntry, SessionDescriptor, UploadOrchestrator};
