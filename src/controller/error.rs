use thiserror::Error;

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("node '{0}' already exists")]
    DuplicateNode(String),

    #[error("node '{0}' not found")]
    UnknownNode(String),

    #[error("invalid size literal '{0}'")]
    InvalidSize(String),

    #[error("transfer could not be started: {0}")]
    TransferRejected(String),

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("controller runtime stopped")]
    RuntimeStopped,
}

pub type ControllerResult<T> = std::result::Result<T, ControllerError>;
