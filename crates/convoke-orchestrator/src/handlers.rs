// ABOUTME: Connector handlers exposing the orchestrator to other agents.
// ABOUTME: research_request submits, workflow_status reports, cancel_workflow stops a workflow.

use convoke_connect::{Connector, HandlerError, TaskContext};
use serde_json::{json, Value};

use crate::error::WorkflowError;
use crate::orchestrator::Orchestrator;
use crate::stage::Stage;
use crate::workflow::ResearchRequest;

pub const RESEARCH_REQUEST: &str = "research_request";
pub const WORKFLOW_STATUS: &str = "workflow_status";
pub const CANCEL_WORKFLOW: &str = "cancel_workflow";

/// Actions the orchestrator answers when registered as an agent.
pub fn capabilities() -> Vec<String> {
    [RESEARCH_REQUEST, WORKFLOW_STATUS, CANCEL_WORKFLOW]
        .iter()
        .map(|a| a.to_string())
        .collect()
}

fn handler_error(err: WorkflowError) -> HandlerError {
    match err {
        WorkflowError::EmptyQuery => HandlerError::InvalidPayload(err.to_string()),
        other => HandlerError::Failed(other.to_string()),
    }
}

fn context_id_of(payload: &Value) -> Result<String, HandlerError> {
    payload
        .get("context_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| HandlerError::InvalidPayload("missing context_id".to_string()))
}

impl Orchestrator {
    /// Attach the orchestrator's actions to `connector`.
    pub fn register_handlers(&self, connector: &Connector) {
        let this = self.clone();
        connector.register_handler(RESEARCH_REQUEST, move |_ctx: TaskContext, payload: Value| {
            let this = this.clone();
            async move { this.handle_research_request(payload).await }
        });

        let this = self.clone();
        connector.register_handler(WORKFLOW_STATUS, move |_ctx: TaskContext, payload: Value| {
            let this = this.clone();
            async move { this.handle_workflow_status(payload) }
        });

        let this = self.clone();
        connector.register_handler(CANCEL_WORKFLOW, move |_ctx: TaskContext, payload: Value| {
            let this = this.clone();
            async move { this.handle_cancel_workflow(payload).await }
        });
    }

    pub async fn handle_research_request(&self, payload: Value) -> Result<Value, HandlerError> {
        let request: ResearchRequest = serde_json::from_value(payload)?;
        let context_id = self.submit(request).await.map_err(handler_error)?;
        Ok(json!({ "context_id": context_id, "stage": Stage::Planning }))
    }

    pub fn handle_workflow_status(&self, payload: Value) -> Result<Value, HandlerError> {
        let context_id = context_id_of(&payload)?;
        let state = self
            .status(&context_id)
            .ok_or_else(|| handler_error(WorkflowError::UnknownWorkflow(context_id)))?;
        Ok(serde_json::to_value(state)?)
    }

    pub async fn handle_cancel_workflow(&self, payload: Value) -> Result<Value, HandlerError> {
        let context_id = context_id_of(&payload)?;
        let state = self.cancel(&context_id).await.map_err(handler_error)?;
        Ok(serde_json::to_value(state)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::delegator::Delegator;
    use async_trait::async_trait;
    use convoke_connect::ConnectorError;
    use convoke_proto::Envelope;
    use std::sync::Arc;
    use std::time::Duration;

    /// Never answers; workflows stay in their first stage.
    struct Silent;

    #[async_trait]
    impl Delegator for Silent {
        async fn delegate(&self, _: Envelope, _: Duration) -> Result<Envelope, ConnectorError> {
            std::future::pending().await
        }

        async fn cancel_task(&self, _: &str) -> Result<(), ConnectorError> {
            Ok(())
        }
    }

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(OrchestratorConfig::default(), Arc::new(Silent))
    }

    #[tokio::test]
    async fn test_research_request_handler() {
        let orch = orchestrator();
        let reply = orch
            .handle_research_request(json!({"query": "X"}))
            .await
            .unwrap();
        assert_eq!(reply["stage"], "PLANNING");
        let context_id = reply["context_id"].as_str().unwrap();
        assert!(orch.status(context_id).is_some());

        let err = orch
            .handle_research_request(json!({"query": ""}))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::InvalidPayload(_)));

        let err = orch
            .handle_research_request(json!({"topic": "X"}))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::InvalidPayload(_)));
    }

    #[tokio::test]
    async fn test_status_and_cancel_handlers() {
        let orch = orchestrator();
        let reply = orch
            .handle_research_request(json!({"query": "X"}))
            .await
            .unwrap();
        let context_id = reply["context_id"].as_str().unwrap().to_string();

        let status = orch
            .handle_workflow_status(json!({ "context_id": context_id }))
            .unwrap();
        assert_eq!(status["stage"], "PLANNING");
        assert_eq!(status["request"]["query"], "X");

        let cancelled = orch
            .handle_cancel_workflow(json!({ "context_id": context_id }))
            .await
            .unwrap();
        assert_eq!(cancelled["stage"], "CANCELLED");

        let err = orch
            .handle_cancel_workflow(json!({ "context_id": context_id }))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Failed(_)));

        let err = orch.handle_workflow_status(json!({})).unwrap_err();
        assert_eq!(err, HandlerError::InvalidPayload("missing context_id".into()));
        let err = orch
            .handle_workflow_status(json!({"context_id": "nope"}))
            .unwrap_err();
        assert_eq!(err, HandlerError::Failed("unknown workflow: nope".into()));
    }

    #[test]
    fn test_capabilities() {
        assert_eq!(
            capabilities(),
            vec!["research_request", "workflow_status", "cancel_workflow"]
        );
    }
}
