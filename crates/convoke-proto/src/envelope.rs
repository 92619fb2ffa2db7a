// ABOUTME: Envelope type exchanged between router, agents and clients.
// ABOUTME: One JSON object per message, discriminated by the `type` field.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ProtoError;

/// Discriminant carried in the `type` field of every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    AgentRegister,
    RegistrationConfirmed,
    AgentUnregister,
    Heartbeat,
    HeartbeatAck,
    TaskSubmit,
    ResearchAction,
    TaskResult,
    TaskCancel,
    Error,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::AgentRegister => "agent_register",
            MessageType::RegistrationConfirmed => "registration_confirmed",
            MessageType::AgentUnregister => "agent_unregister",
            MessageType::Heartbeat => "heartbeat",
            MessageType::HeartbeatAck => "heartbeat_ack",
            MessageType::TaskSubmit => "task_submit",
            MessageType::ResearchAction => "research_action",
            MessageType::TaskResult => "task_result",
            MessageType::TaskCancel => "task_cancel",
            MessageType::Error => "error",
        }
    }

    /// Work that should be routed to an agent and processed by a handler.
    pub fn is_task(&self) -> bool {
        matches!(self, MessageType::TaskSubmit | MessageType::ResearchAction)
    }

    /// A correlated reply to an earlier task.
    pub fn is_reply(&self) -> bool {
        matches!(self, MessageType::TaskResult | MessageType::Error)
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category of an `error` envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConnectionError,
    RegistrationError,
    RoutingError,
    Timeout,
    HandlerError,
    AgentUnavailable,
    LivenessError,
    InvalidEnvelope,
    Cancelled,
    ShuttingDown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConnectionError => "connection_error",
            ErrorKind::RegistrationError => "registration_error",
            ErrorKind::RoutingError => "routing_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::HandlerError => "handler_error",
            ErrorKind::AgentUnavailable => "agent_unavailable",
            ErrorKind::LivenessError => "liveness_error",
            ErrorKind::InvalidEnvelope => "invalid_envelope",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::ShuttingDown => "shutting_down",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of an `error` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Payload of an `agent_register` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterPayload {
    pub capabilities: Vec<String>,
}

impl RegisterPayload {
    /// Reject empty lists, blank names and names listed twice.
    pub fn check_capabilities(&self) -> Result<(), ProtoError> {
        if self.capabilities.is_empty() {
            return Err(ProtoError::InvalidPayload(
                "capability list is empty".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for cap in &self.capabilities {
            if cap.trim().is_empty() {
                return Err(ProtoError::InvalidPayload(
                    "blank capability name".to_string(),
                ));
            }
            if !seen.insert(cap.as_str()) {
                return Err(ProtoError::InvalidPayload(format!(
                    "capability '{}' listed twice",
                    cap
                )));
            }
        }
        Ok(())
    }
}

/// The unit of communication on every connection.
///
/// Envelopes are treated as immutable once sent: the builder methods consume
/// `self` and transports send clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Task id, doubling as the correlation id for replies.
    #[serde(
        default,
        alias = "correlation_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub task_id: Option<String>,
    /// Sender id (for registration and heartbeats, the agent itself).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            task_id: None,
            agent_id: None,
            target_agent_id: None,
            agent_type: None,
            action: None,
            payload: Value::Null,
            timestamp: Utc::now(),
        }
    }

    /// A `task_submit` for any ready agent of `agent_type`, with a fresh task id.
    pub fn task(agent_type: impl Into<String>, action: impl Into<String>, payload: Value) -> Self {
        Self::new(MessageType::TaskSubmit)
            .with_task_id(Uuid::new_v4().to_string())
            .for_type(agent_type)
            .with_action(action)
            .with_payload(payload)
    }

    pub fn register(
        agent_id: impl Into<String>,
        agent_type: impl Into<String>,
        capabilities: Vec<String>,
    ) -> Self {
        Self::new(MessageType::AgentRegister)
            .from_agent(agent_id)
            .for_type(agent_type)
            .with_payload(serde_json::json!({ "capabilities": capabilities }))
    }

    pub fn registration_confirmed(agent_id: impl Into<String>) -> Self {
        Self::new(MessageType::RegistrationConfirmed).from_agent(agent_id)
    }

    pub fn unregister(agent_id: impl Into<String>) -> Self {
        Self::new(MessageType::AgentUnregister).from_agent(agent_id)
    }

    pub fn heartbeat(agent_id: impl Into<String>) -> Self {
        Self::new(MessageType::Heartbeat).from_agent(agent_id)
    }

    pub fn heartbeat_ack(agent_id: impl Into<String>) -> Self {
        Self::new(MessageType::HeartbeatAck).from_agent(agent_id)
    }

    pub fn cancel(task_id: impl Into<String>) -> Self {
        Self::new(MessageType::TaskCancel).with_task_id(task_id)
    }

    /// An `error` envelope, correlated when `task_id` is known.
    pub fn error(task_id: Option<String>, error: ErrorPayload) -> Self {
        let mut envelope = Self::new(MessageType::Error).with_payload(
            serde_json::to_value(&error).unwrap_or(Value::Null),
        );
        envelope.task_id = task_id;
        envelope
    }

    /// Successful `task_result` correlated to this task.
    pub fn reply_ok(&self, sender: impl Into<String>, payload: Value) -> Self {
        let mut reply = Self::new(MessageType::TaskResult)
            .from_agent(sender)
            .with_payload(payload);
        reply.task_id = self.task_id.clone();
        reply.action = self.action.clone();
        reply
    }

    /// `error` reply correlated to this task.
    pub fn reply_error(&self, sender: impl Into<String>, error: ErrorPayload) -> Self {
        let mut reply = Self::error(self.task_id.clone(), error).from_agent(sender);
        reply.action = self.action.clone();
        reply
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn from_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn to_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.target_agent_id = Some(agent_id.into());
        self
    }

    pub fn for_type(mut self, agent_type: impl Into<String>) -> Self {
        self.agent_type = Some(agent_type.into());
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.task_id.as_deref()
    }

    /// Parse the capabilities out of an `agent_register` payload.
    pub fn register_payload(&self) -> Result<RegisterPayload, ProtoError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| ProtoError::InvalidPayload(format!("agent_register: {}", e)))
    }

    /// Parse the payload of an `error` envelope, if this is one.
    pub fn error_payload(&self) -> Option<ErrorPayload> {
        if self.kind != MessageType::Error {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }

    /// Check that the fields required by this envelope's type are present.
    pub fn validate(&self) -> Result<(), ProtoError> {
        let require = |value: &Option<String>, field: &'static str| {
            match value.as_deref().map(str::trim) {
                Some(v) if !v.is_empty() => Ok(()),
                _ => Err(ProtoError::MissingField {
                    kind: self.kind,
                    field,
                }),
            }
        };

        match self.kind {
            MessageType::AgentRegister => {
                require(&self.agent_id, "agent_id")?;
                require(&self.agent_type, "agent_type")
            }
            MessageType::Heartbeat | MessageType::AgentUnregister => {
                require(&self.agent_id, "agent_id")
            }
            MessageType::TaskSubmit | MessageType::ResearchAction => {
                require(&self.task_id, "task_id")?;
                if require(&self.target_agent_id, "target_agent_id").is_err() {
                    require(&self.agent_type, "agent_type")?;
                }
                Ok(())
            }
            MessageType::TaskResult | MessageType::TaskCancel => require(&self.task_id, "task_id"),
            MessageType::RegistrationConfirmed | MessageType::HeartbeatAck | MessageType::Error => {
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_field_names() {
        let env = Envelope::task("planner", "plan", json!({"query": "X"})).from_agent("orch-1");
        let value = serde_json::to_value(&env).unwrap();

        assert_eq!(value["type"], "task_submit");
        assert_eq!(value["agent_type"], "planner");
        assert_eq!(value["action"], "plan");
        assert_eq!(value["agent_id"], "orch-1");
        assert_eq!(value["payload"]["query"], "X");
        assert!(value["task_id"].is_string());
        assert!(value.get("target_agent_id").is_none());
    }

    #[test]
    fn test_correlation_id_alias() {
        let raw = r#"{"type":"task_result","correlation_id":"abc","payload":{"ok":true}}"#;
        let env: Envelope = serde_json::from_str(raw).unwrap();
        assert_eq!(env.kind, MessageType::TaskResult);
        assert_eq!(env.correlation_id(), Some("abc"));
        assert!(env.validate().is_ok());
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let raw = r#"{"type":"teleport","task_id":"abc"}"#;
        assert!(serde_json::from_str::<Envelope>(raw).is_err());
    }

    #[test]
    fn test_validate_task_requires_route() {
        let env = Envelope::new(MessageType::TaskSubmit).with_task_id("t1");
        let err = env.validate().unwrap_err();
        assert!(err.to_string().contains("agent_type"));

        let direct = Envelope::new(MessageType::TaskSubmit)
            .with_task_id("t1")
            .to_agent("agent-7");
        assert!(direct.validate().is_ok());
    }

    #[test]
    fn test_validate_register_requires_identity() {
        let env = Envelope::new(MessageType::AgentRegister).from_agent("a1");
        assert!(matches!(
            env.validate(),
            Err(ProtoError::MissingField {
                field: "agent_type",
                ..
            })
        ));

        let blank = Envelope::register("  ", "planner", vec!["plan".into()]);
        assert!(blank.validate().is_err());
    }

    #[test]
    fn test_reply_keeps_correlation() {
        let task = Envelope::task("planner", "plan", json!({}));
        let ok = task.reply_ok("planner-1", json!({"plan": []}));
        assert_eq!(ok.kind, MessageType::TaskResult);
        assert_eq!(ok.task_id, task.task_id);
        assert_eq!(ok.action.as_deref(), Some("plan"));

        let err = task.reply_error(
            "planner-1",
            ErrorPayload::new(ErrorKind::HandlerError, "boom"),
        );
        assert_eq!(err.task_id, task.task_id);
        let payload = err.error_payload().unwrap();
        assert_eq!(payload.kind, ErrorKind::HandlerError);
        assert_eq!(payload.message, "boom");
    }

    #[test]
    fn test_register_payload() {
        let env = Envelope::register("a1", "planner", vec!["plan".into(), "replan".into()]);
        let payload = env.register_payload().unwrap();
        assert_eq!(payload.capabilities, vec!["plan", "replan"]);

        let bad = Envelope::new(MessageType::AgentRegister)
            .from_agent("a1")
            .for_type("planner")
            .with_payload(json!({"capabilities": "plan"}));
        assert!(matches!(
            bad.register_payload(),
            Err(ProtoError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_error_payload_only_for_errors() {
        let env = Envelope::heartbeat("a1");
        assert!(env.error_payload().is_none());
    }

    #[test]
    fn test_check_capabilities() {
        let ok = RegisterPayload {
            capabilities: vec!["plan".into(), "replan".into()],
        };
        assert!(ok.check_capabilities().is_ok());

        for caps in [vec![], vec!["plan".to_string(), " ".to_string()], vec!["plan".to_string(), "plan".to_string()]] {
            let payload = RegisterPayload { capabilities: caps };
            assert!(payload.check_capabilities().is_err());
        }
    }
}
