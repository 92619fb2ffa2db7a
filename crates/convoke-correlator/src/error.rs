// ABOUTME: Error types for the convoke-correlator crate.
// ABOUTME: Every way a correlated wait can end without a successful reply.

use std::time::Duration;

use convoke_proto::{ErrorKind, ErrorPayload};
use thiserror::Error;

/// Errors returned to a caller waiting on a correlated reply.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CorrelationError {
    /// The envelope carried no task/correlation id.
    #[error("envelope has no correlation id")]
    MissingCorrelationId,

    /// Another request with the same id is still waiting.
    #[error("correlation id '{0}' is already pending")]
    DuplicateCorrelationId(String),

    /// The envelope could not be handed to the transport.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// No correlated reply arrived before the deadline.
    #[error("timed out after {timeout:?} waiting for '{correlation_id}'")]
    Timeout {
        correlation_id: String,
        timeout: Duration,
    },

    /// The agent holding the request went away.
    #[error("agent unavailable: {agent_id}")]
    AgentUnavailable { agent_id: String },

    /// The remote side answered with an `error` envelope.
    #[error("{kind}: {message}")]
    Remote { kind: ErrorKind, message: String },

    /// The pending entry was discarded without a reply.
    #[error("request abandoned")]
    Abandoned,
}

impl CorrelationError {
    /// Wire representation, used when relaying the failure to another party.
    pub fn to_payload(&self) -> ErrorPayload {
        let kind = match self {
            CorrelationError::Timeout { .. } => ErrorKind::Timeout,
            CorrelationError::AgentUnavailable { .. } => ErrorKind::AgentUnavailable,
            CorrelationError::Remote { kind, .. } => *kind,
            CorrelationError::MissingCorrelationId
            | CorrelationError::DuplicateCorrelationId(_) => ErrorKind::InvalidEnvelope,
            CorrelationError::SendFailed(_) | CorrelationError::Abandoned => {
                ErrorKind::ConnectionError
            }
        };
        let message = match self {
            CorrelationError::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        };
        ErrorPayload::new(kind, message)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, CorrelationError::Timeout { .. })
    }
}
