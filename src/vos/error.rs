use thiserror::Error;

#[derive(Error, Debug)]
pub enum VosError {
    #[error("device {0} already registered")]
    DuplicateDevice(String),

    #[error("device {0} not registered")]
    UnknownDevice(String),

    #[error("process {0} not found")]
    UnknownProcess(u32),
}

pub type VosResult<T> = std::result::Result<T, VosError>;
