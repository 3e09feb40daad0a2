//! Error types for the feedmux engine
//!
//! Every fallible operation in the workspace returns one of the specific error
//! types below or the unifying [`ReactorError`]. Errors that cross the
//! reactor/worker boundary travel as [`ErrorInfo`], a cloneable summary that is
//! also what applications see on channel events.

use core::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::setup::ChannelSetupState;
use crate::types::{ChannelId, ReactorState, SessionId};

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Failures reported by the socket layer
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection refused by {endpoint}")]
    ConnectionRefused { endpoint: String },
    #[error("Connection to {endpoint} failed: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },
    #[error("Network I/O error: {0}")]
    NetworkIo(#[from] std::io::Error),
    #[error("Channel initialization failed: {reason}")]
    InitializationFailed { reason: String },
    #[error("Transport timeout after {duration_ms}ms")]
    Timeout { duration_ms: u64 },
    #[error("Connection closed by peer")]
    ClosedByPeer,
    #[error("Protocol violation: {reason}")]
    Protocol { reason: String },
}

/// Failures encoding or decoding wire frames
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Failed to encode message: {0}")]
    Encode(#[source] bincode::Error),
    #[error("Failed to decode frame: {0}")]
    Decode(#[source] bincode::Error),
    #[error("Empty frame")]
    EmptyFrame,
    #[error("Frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },
}

/// Failures driving the setup handshake
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SetupError {
    #[error("Unexpected {message} while in setup state {state:?}")]
    UnexpectedMessage {
        state: ChannelSetupState,
        message: &'static str,
    },
    #[error("Login rejected: {text}")]
    LoginRejected { text: String },
    #[error("Invalid setup transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: ChannelSetupState,
        to: ChannelSetupState,
    },
}

/// Failures reported by the token or service-discovery endpoints
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("REST request failed (status {status:?}): {message}")]
pub struct RestError {
    /// HTTP status, if a response arrived
    pub status: Option<u16>,
    /// Server-provided retry hint
    pub retry_after: Option<Duration>,
    pub message: String,
}

impl RestError {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            retry_after: None,
            message: message.into(),
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// The server rejected the grant itself rather than failing transiently
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self.status, Some(400) | Some(401) | Some(403))
    }
}

/// Invalid or unloadable configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {reason}")]
    Invalid { reason: String },
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
}

impl ConfigError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            reason: reason.into(),
        }
    }
}

impl From<figment::Error> for ConfigError {
    fn from(error: figment::Error) -> Self {
        ConfigError::Load(Box::new(error))
    }
}

/// Rejected push onto a closed event queue; the event is handed back
#[derive(PartialEq, Eq)]
pub enum QueueError<T> {
    Closed(T),
}

impl<T> QueueError<T> {
    pub fn into_inner(self) -> T {
        match self {
            QueueError::Closed(event) => event,
        }
    }
}

impl<T> fmt::Debug for QueueError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::Closed(_) => f.write_str("QueueError::Closed(..)"),
        }
    }
}

impl<T> fmt::Display for QueueError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::Closed(_) => f.write_str("Event queue is closed"),
        }
    }
}

impl<T> std::error::Error for QueueError<T> {}

// ----------------------------------------------------------------------------
// Main Error Type
// ----------------------------------------------------------------------------

/// Unified error returned by reactor operations
#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
    #[error("{operation} cannot be called from inside a reactor callback")]
    CalledFromCallback { operation: &'static str },

    #[error("Unknown or stale channel {channel}")]
    UnknownChannel { channel: ChannelId },

    #[error("Channel {channel} is not writable in its current state")]
    ChannelNotActive { channel: ChannelId },

    #[error("Channel {channel} has a blocked write waiting for flush")]
    WritePending { channel: ChannelId },

    #[error("Channel pool exhausted (limit {limit})")]
    PoolExhausted { limit: usize },

    #[error("Reactor is not active (state: {state})")]
    NotActive { state: ReactorState },

    #[error("Unknown token session {session}")]
    UnknownSession { session: SessionId },

    #[error("Channel {channel} is not token-session managed")]
    NotSessionManaged { channel: ChannelId },

    #[error("Worker task failed: {reason}")]
    WorkerFailed { reason: String },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Setup error: {0}")]
    Setup(#[from] SetupError),

    #[error("Token service error: {0}")]
    Rest(#[from] RestError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Result alias for reactor operations
pub type ReactorResult<T> = core::result::Result<T, ReactorError>;

// ----------------------------------------------------------------------------
// Error Summaries
// ----------------------------------------------------------------------------

/// Category of an [`ErrorInfo`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    Transport,
    Codec,
    Setup,
    InitializationTimeout,
    PingTimeout,
    TokenRenewal,
    Discovery,
    Shutdown,
    Internal,
}

/// Cloneable error summary attached to events crossing the reactor/worker
/// boundary and to the channel events given to applications
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub text: String,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }

    pub fn shutdown() -> Self {
        Self::new(ErrorCode::Shutdown, "reactor shut down")
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.text)
    }
}

impl From<&TransportError> for ErrorInfo {
    fn from(error: &TransportError) -> Self {
        let code = match error {
            TransportError::Timeout { .. } => ErrorCode::InitializationTimeout,
            _ => ErrorCode::Transport,
        };
        ErrorInfo::new(code, error.to_string())
    }
}

impl From<&CodecError> for ErrorInfo {
    fn from(error: &CodecError) -> Self {
        ErrorInfo::new(ErrorCode::Codec, error.to_string())
    }
}

impl From<&SetupError> for ErrorInfo {
    fn from(error: &SetupError) -> Self {
        ErrorInfo::new(ErrorCode::Setup, error.to_string())
    }
}

impl From<&RestError> for ErrorInfo {
    fn from(error: &RestError) -> Self {
        ErrorInfo::new(ErrorCode::TokenRenewal, error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_error_returns_event() {
        let error = QueueError::Closed(42u32);
        assert_eq!(error.to_string(), "Event queue is closed");
        assert_eq!(error.into_inner(), 42);
    }

    #[test]
    fn test_rest_error_auth_rejection() {
        assert!(RestError::new(Some(401), "expired").is_auth_rejection());
        assert!(RestError::new(Some(400), "bad grant").is_auth_rejection());
        assert!(!RestError::new(Some(503), "busy").is_auth_rejection());
        assert!(!RestError::new(None, "unreachable").is_auth_rejection());
    }

    #[test]
    fn test_transport_timeout_maps_to_init_timeout() {
        let info = ErrorInfo::from(&TransportError::Timeout { duration_ms: 500 });
        assert_eq!(info.code, ErrorCode::InitializationTimeout);
        assert!(info.text.contains("500ms"));
    }

    #[test]
    fn test_reactor_error_from_setup() {
        let error: ReactorError = SetupError::LoginRejected {
            text: "denied".into(),
        }
        .into();
        assert!(error.to_string().contains("denied"));
    }
}
