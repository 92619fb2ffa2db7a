// ABOUTME: Error types for the convoke router.
// ABOUTME: Registration, routing and connection-state failures with their wire error kinds.

use std::time::Duration;

use convoke_correlator::CorrelationError;
use convoke_proto::{ErrorKind, ErrorPayload};
use thiserror::Error;

use crate::registry::ConnectionState;

/// Why a registration was refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    /// Another live connection already holds this agent id.
    #[error("duplicate id: {0}")]
    DuplicateId(String),

    /// Identity or capability list is unusable.
    #[error("malformed registration: {0}")]
    Malformed(String),

    /// The connection is already registered under a different id.
    #[error("connection already registered as '{current}', cannot become '{requested}'")]
    IdChanged { current: String, requested: String },

    /// A heartbeat or unregister arrived before registration.
    #[error("connection is not registered")]
    NotRegistered,
}

impl RegistrationError {
    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload::new(ErrorKind::RegistrationError, self.to_string())
    }
}

/// Why a task could not be delivered.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// No ready agent matched within the queueing window.
    #[error("no agent available for {0}")]
    NoAgentAvailable(String),

    /// The envelope names neither a live target nor an agent type.
    #[error("envelope has no routable destination")]
    NoDestination,
}

impl RoutingError {
    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload::new(ErrorKind::RoutingError, self.to_string())
    }
}

/// Errors seen by in-process users of a [`RouterHandle`](crate::RouterHandle).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouterError {
    #[error(transparent)]
    Routing(#[from] RoutingError),

    /// The agent or the router answered with an error envelope.
    #[error("{kind}: {message}")]
    Remote { kind: ErrorKind, message: String },

    /// No reply arrived in time.
    #[error("no reply within {0:?}")]
    Timeout(Duration),

    /// The router actor has stopped.
    #[error("router is not running")]
    Closed,
}

impl RouterError {
    pub fn to_payload(&self) -> ErrorPayload {
        match self {
            RouterError::Routing(e) => e.to_payload(),
            RouterError::Remote { kind, message } => ErrorPayload::new(*kind, message.clone()),
            RouterError::Timeout(_) => ErrorPayload::new(ErrorKind::Timeout, self.to_string()),
            RouterError::Closed => ErrorPayload::new(ErrorKind::ShuttingDown, self.to_string()),
        }
    }
}

impl From<CorrelationError> for RouterError {
    fn from(err: CorrelationError) -> Self {
        match err {
            CorrelationError::Timeout { timeout, .. } => RouterError::Timeout(timeout),
            other => {
                let payload = other.to_payload();
                RouterError::Remote {
                    kind: payload.kind,
                    message: payload.message,
                }
            }
        }
    }
}

/// A connection-state change that is not part of the lifecycle.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("invalid connection transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}
