// ABOUTME: Error types for the workflow orchestrator.
// ABOUTME: Submission, lookup and stage-transition failures surfaced to callers.

use thiserror::Error;

use crate::stage::Stage;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("research request has an empty query")]
    EmptyQuery,

    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),

    #[error("workflow {context_id} already finished as {stage}")]
    AlreadyTerminal { context_id: String, stage: Stage },

    #[error("invalid stage transition {from} -> {to}")]
    InvalidTransition { from: Stage, to: Stage },

    /// `process_queue` is already running or the orchestrator has stopped.
    #[error("workflow queue is not available")]
    QueueUnavailable,

    #[error("orchestrator is shutting down")]
    ShuttingDown,
}
