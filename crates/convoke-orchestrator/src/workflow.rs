// ABOUTME: Research requests and the per-workflow state record.
// ABOUTME: Stage changes go through advance() so history only ever moves forward.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::WorkflowError;
use crate::stage::Stage;

/// An externally submitted unit of research work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchRequest {
    pub query: String,
    /// Free-form options passed through to every stage.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester: Option<String>,
}

impl ResearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            parameters: Value::Null,
            requester: None,
        }
    }

    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.query.trim().is_empty() {
            return Err(WorkflowError::EmptyQuery);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTransition {
    pub stage: Stage,
    pub at: DateTime<Utc>,
}

/// Why a workflow ended in FAILED.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowFailure {
    pub stage: Stage,
    pub message: String,
}

/// Everything known about one workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub context_id: String,
    pub stage: Stage,
    pub request: ResearchRequest,
    /// Ids of every task delegated for this workflow, in order.
    pub task_ids: Vec<String>,
    pub outputs: BTreeMap<Stage, Value>,
    pub history: Vec<StageTransition>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WorkflowFailure>,
}

impl WorkflowState {
    /// A new workflow in PLANNING.
    pub fn new(request: ResearchRequest) -> Self {
        let now = Utc::now();
        Self {
            context_id: Uuid::new_v4().to_string(),
            stage: Stage::Planning,
            request,
            task_ids: Vec::new(),
            outputs: BTreeMap::new(),
            history: vec![StageTransition {
                stage: Stage::Planning,
                at: now,
            }],
            created_at: now,
            updated_at: now,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    pub fn advance(&mut self, next: Stage) -> Result<(), WorkflowError> {
        if !self.stage.can_advance_to(next) {
            return Err(WorkflowError::InvalidTransition {
                from: self.stage,
                to: next,
            });
        }
        let now = Utc::now();
        self.stage = next;
        self.updated_at = now;
        self.history.push(StageTransition { stage: next, at: now });
        Ok(())
    }

    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), WorkflowError> {
        let stage = self.stage;
        self.advance(Stage::Failed)?;
        self.error = Some(WorkflowFailure {
            stage,
            message: message.into(),
        });
        Ok(())
    }

    pub fn record_output(&mut self, stage: Stage, output: Value) {
        self.outputs.insert(stage, output);
        self.updated_at = Utc::now();
    }

    /// Payload delegated for `stage`: the request plus every earlier output.
    pub fn stage_payload(&self, stage: Stage) -> Value {
        json!({
            "context_id": self.context_id,
            "stage": stage,
            "query": self.request.query,
            "request": self.request,
            "previous": self.outputs,
        })
    }
}
