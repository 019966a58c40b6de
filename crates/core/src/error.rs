use thiserror::Error;

#[derive(Debug, Error)]
pub enum HoplineError {
    #[error("malformed trace context: {0}")]
    MalformedContext(String),

    #[error("downstream timeout: {0}")]
    Timeout(String),

    #[error("downstream error ({status}): {reason}")]
    Downstream { status: u16, reason: String },

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("storage error: {0}")]
    Store(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, HoplineError>;
