// ABOUTME: Error types for the convoke-connect crate.
// ABOUTME: Connection, registration and handler failures, each mapped to a wire error kind.

use convoke_correlator::CorrelationError;
use convoke_proto::{ErrorKind, ErrorPayload, ProtoError};
use thiserror::Error;

/// Errors that can occur while running a connector.
#[derive(Error, Debug)]
pub enum ConnectorError {
    /// The transport could not be opened.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The router refused or never confirmed the registration.
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    /// Reconnect attempts exhausted.
    #[error("gave up after {attempts} connection attempts")]
    MaxAttempts { attempts: u32 },

    /// No connection is currently established.
    #[error("not connected")]
    NotConnected,

    /// The connector is shutting down and accepts no new work.
    #[error("connector is shutting down")]
    ShuttingDown,

    /// A delegated request did not complete.
    #[error(transparent)]
    Correlation(#[from] CorrelationError),

    /// Framing or link failure.
    #[error(transparent)]
    Proto(#[from] ProtoError),
}

impl ConnectorError {
    /// Whether the reconnect loop should try again after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            ConnectorError::ConnectionFailed(_) | ConnectorError::Proto(_) => true,
            ConnectorError::Registration(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Errors from the registration handshake.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    /// Local identity is unusable; never sent.
    #[error("invalid registration: {0}")]
    Invalid(String),

    /// Router answered with `registration_error`.
    #[error("registration rejected: {reason}")]
    Rejected { reason: String },

    /// No confirmation arrived in time.
    #[error("no registration confirmation within {0:?}")]
    Timeout(std::time::Duration),

    /// Link closed before the router answered.
    #[error("connection closed during registration")]
    Closed,
}

impl RegistrationError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RegistrationError::Invalid(_))
    }
}

/// Errors returned by task handlers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The handler ran and reported failure.
    #[error("{0}")]
    Failed(String),

    /// The payload was not what the handler expects.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// No handler is registered for the action.
    #[error("no handler registered for action '{0}'")]
    UnknownAction(String),

    /// The handler panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),

    /// The task was cancelled before it finished.
    #[error("task cancelled")]
    Cancelled,
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }

    /// Wire representation sent back to the requester.
    pub fn to_payload(&self) -> ErrorPayload {
        let kind = match self {
            HandlerError::Cancelled => ErrorKind::Cancelled,
            _ => ErrorKind::HandlerError,
        };
        ErrorPayload::new(kind, self.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::InvalidPayload(err.to_string())
    }
}
