use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SimError {
    #[error("cannot schedule event at {scheduled} before current clock {now}")]
    InvalidTime { scheduled: f64, now: f64 },

    #[error("delay must be non-negative, got {0}")]
    InvalidDelay(f64),
}

pub type SimResult<T> = std::result::Result<T, SimError>;
