// ABOUTME: Agent identity and the registration handshake run after every reconnect.
// ABOUTME: Sends agent_register and waits for registration_confirmed or registration_error.

use std::time::Duration;

use convoke_proto::{Envelope, ErrorKind, MessageType, ProtoError, RegisterPayload, StreamSender};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::RegistrationError;

/// Default time allowed for the router to confirm a registration.
pub const DEFAULT_REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Identity announced to the router.
#[derive(Debug, Clone)]
pub struct RegistrationConfig {
    /// Unique agent id.
    pub agent_id: String,
    /// Agent type used for routing (e.g., "planner", "literature").
    pub agent_type: String,
    /// Actions this agent can perform.
    pub capabilities: Vec<String>,
    /// How long to wait for `registration_confirmed`.
    pub timeout: Duration,
}

impl RegistrationConfig {
    pub fn new(agent_id: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_type: agent_type.into(),
            capabilities: Vec::new(),
            timeout: DEFAULT_REGISTRATION_TIMEOUT,
        }
    }

    pub fn with_capabilities(mut self, caps: Vec<String>) -> Self {
        self.capabilities = caps;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Check the identity before it is ever sent.
    pub fn validate(&self) -> Result<(), RegistrationError> {
        if self.agent_id.trim().is_empty() {
            return Err(RegistrationError::Invalid("agent_id is empty".into()));
        }
        if self.agent_type.trim().is_empty() {
            return Err(RegistrationError::Invalid("agent_type is empty".into()));
        }
        RegisterPayload {
            capabilities: self.capabilities.clone(),
        }
        .check_capabilities()
        .map_err(|e| RegistrationError::Invalid(e.to_string()))
    }

    pub fn envelope(&self) -> Envelope {
        Envelope::register(
            self.agent_id.clone(),
            self.agent_type.clone(),
            self.capabilities.clone(),
        )
    }
}

/// Send the registration and wait for the router's verdict.
///
/// Envelopes other than the verdict that arrive first are ignored.
pub async fn register(
    config: &RegistrationConfig,
    sender: &StreamSender<Envelope>,
    receiver: &mut mpsc::Receiver<Result<Envelope, ProtoError>>,
) -> Result<(), RegistrationError> {
    sender
        .send(config.envelope())
        .await
        .map_err(|_| RegistrationError::Closed)?;

    let wait = async {
        loop {
            let envelope = match receiver.recv().await {
                None => return Err(RegistrationError::Closed),
                Some(Err(e)) if e.is_fatal() => return Err(RegistrationError::Closed),
                Some(Err(e)) => {
                    debug!(error = %e, "Ignoring malformed envelope during registration");
                    continue;
                }
                Some(Ok(envelope)) => envelope,
            };
            match check_verdict(&envelope) {
                Some(verdict) => return verdict,
                None => {
                    debug!(kind = %envelope.kind, "Ignoring envelope while awaiting registration");
                }
            }
        }
    };

    tokio::time::timeout(config.timeout, wait)
        .await
        .unwrap_or(Err(RegistrationError::Timeout(config.timeout)))
}

/// Classify an envelope received during registration; `None` if it is not a verdict.
pub fn check_verdict(envelope: &Envelope) -> Option<Result<(), RegistrationError>> {
    match envelope.kind {
        MessageType::RegistrationConfirmed => Some(Ok(())),
        MessageType::Error => {
            let payload = envelope.error_payload()?;
            if payload.kind == ErrorKind::RegistrationError {
                Some(Err(RegistrationError::Rejected {
                    reason: payload.message,
                }))
            } else {
                None
            }
        }
        _ => None,
    }
}
