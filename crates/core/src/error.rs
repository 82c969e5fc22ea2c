use thiserror::Error;

#[derive(Error, Debug)]
pub enum SignalError {
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Malformed nonce: {0}")]
    MalformedNonce(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid task offer: {0}")]
    InvalidTaskOffer(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, SignalError>;
