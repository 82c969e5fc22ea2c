//! Close codes carried in the WebSocket close frame

use std::fmt;

/// Numeric cause sent when the relay closes a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CloseCode {
    NormalClosure = 1000,
    GoingAway = 1001,
    PathFull = 3000,
    ProtocolError = 3001,
    InternalError = 3002,
    DropByInitiator = 3004,
    InitiatorCouldNotDecrypt = 3005,
    NoSharedTask = 3006,
    InvalidKey = 3007,
    Timeout = 3008,
    SequenceViolation = 3009,
    AuthenticationFailure = 3010,
    Backpressure = 3011,
}

impl CloseCode {
    pub fn as_u16(&self) -> u16 {
        *self as u16
    }

    pub fn from_u16(code: u16) -> Option<Self> {
        let code = match code {
            1000 => Self::NormalClosure,
            1001 => Self::GoingAway,
            3000 => Self::PathFull,
            3001 => Self::ProtocolError,
            3002 => Self::InternalError,
            3004 => Self::DropByInitiator,
            3005 => Self::InitiatorCouldNotDecrypt,
            3006 => Self::NoSharedTask,
            3007 => Self::InvalidKey,
            3008 => Self::Timeout,
            3009 => Self::SequenceViolation,
            3010 => Self::AuthenticationFailure,
            3011 => Self::Backpressure,
            _ => return None,
        };
        Some(code)
    }

    /// Codes an initiator may name in `drop-responder`
    pub fn is_valid_drop_reason(&self) -> bool {
        matches!(
            self,
            Self::ProtocolError
                | Self::InternalError
                | Self::DropByInitiator
                | Self::InitiatorCouldNotDecrypt
        )
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.as_u16())
    }
}
