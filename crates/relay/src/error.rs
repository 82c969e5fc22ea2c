use thiserror::Error;

use signalcraft_core::{CloseCode, SignalError};
use signalcraft_crypto::CryptoError;

use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Malformed message: {0}")]
    Signal(#[from] SignalError),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Path full")]
    PathFull,

    #[error("No shared task")]
    NoSharedTask,

    #[error("Handshake timed out")]
    Timeout,

    #[error("Outbound queue overflow")]
    Backpressure,

    #[error("Dropped with {0}")]
    Dropped(CloseCode),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    /// Close code sent to the client for this failure
    pub fn close_code(&self) -> CloseCode {
        match self {
            RelayError::Protocol(_) | RelayError::Transport(_) => CloseCode::ProtocolError,
            RelayError::Crypto(e) => match e {
                CryptoError::AuthenticationFailure => CloseCode::AuthenticationFailure,
                CryptoError::SequenceViolation { .. }
                | CryptoError::InvalidInitialSequence(_)
                | CryptoError::SequenceOverflow
                | CryptoError::CookieReuse
                | CryptoError::CookieMismatch => CloseCode::SequenceViolation,
                CryptoError::InvalidKey(_) => CloseCode::InvalidKey,
                CryptoError::MissingKey | CryptoError::EncryptionFailed => {
                    CloseCode::InternalError
                }
            },
            RelayError::Signal(SignalError::InvalidConfig(_)) => CloseCode::InternalError,
            RelayError::Signal(_) => CloseCode::ProtocolError,
            RelayError::InvalidKey(_) => CloseCode::InvalidKey,
            RelayError::PathFull => CloseCode::PathFull,
            RelayError::NoSharedTask => CloseCode::NoSharedTask,
            RelayError::Timeout => CloseCode::Timeout,
            RelayError::Backpressure => CloseCode::Backpressure,
            RelayError::Dropped(code) => *code,
            RelayError::Internal(_) => CloseCode::InternalError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_protocol() {
        let err = RelayError::Protocol("expected client-hello, got client-auth".to_string());
        assert_eq!(
            err.to_string(),
            "Protocol error: expected client-hello, got client-auth"
        );
    }

    #[test]
    fn test_crypto_close_codes() {
        assert_eq!(
            RelayError::from(CryptoError::AuthenticationFailure).close_code(),
            CloseCode::AuthenticationFailure
        );
        assert_eq!(
            RelayError::from(CryptoError::SequenceViolation { expected: 2, got: 1 }).close_code(),
            CloseCode::SequenceViolation
        );
        assert_eq!(
            RelayError::from(CryptoError::CookieReuse).close_code(),
            CloseCode::SequenceViolation
        );
        assert_eq!(
            RelayError::from(CryptoError::SequenceOverflow).close_code(),
            CloseCode::SequenceViolation
        );
    }

    #[test]
    fn test_resource_close_codes() {
        assert_eq!(RelayError::PathFull.close_code(), CloseCode::PathFull);
        assert_eq!(RelayError::Backpressure.close_code(), CloseCode::Backpressure);
        assert_eq!(RelayError::Timeout.close_code(), CloseCode::Timeout);
        assert_eq!(RelayError::NoSharedTask.close_code(), CloseCode::NoSharedTask);
        assert_eq!(
            RelayError::Dropped(CloseCode::DropByInitiator).close_code(),
            CloseCode::DropByInitiator
        );
    }

    #[test]
    fn test_malformed_input_is_protocol_error() {
        let err = RelayError::from(SignalError::Serialization("eof".to_string()));
        assert_eq!(err.close_code(), CloseCode::ProtocolError);
        let err = RelayError::from(SignalError::MalformedNonce("short".to_string()));
        assert_eq!(err.close_code(), CloseCode::ProtocolError);
    }
}
