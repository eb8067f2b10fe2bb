use thiserror::Error;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("upload session {0} not found")]
    SessionNotFound(String),

    #[error("upload session {0} expired")]
    SessionExpired(String),

    #[error("chunk metadata mismatch for session {0}")]
    MetadataMismatch(String),

    #[error("upload incomplete for session {0}")]
    FinalizeBeforeReady(String),

    #[error("received bytes exceed negotiated size for session {0}")]
    SizeExceeded(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("file {0} not found")]
    FileNotFound(String),

    #[error("storage fabric error: {0}")]
    Fabric(String),
}

pub type UploadResult<T> = std::result::Result<T, UploadError>;
