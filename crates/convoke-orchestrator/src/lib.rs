// ABOUTME: Research workflow orchestration for convoke.
// ABOUTME: Chains delegations to planner, cost, literature, processing and synthesis agents.

pub mod config;
pub mod delegator;
pub mod error;
pub mod handlers;
pub mod orchestrator;
pub mod stage;
pub mod workflow;

pub use config::{OrchestratorConfig, StageTarget};
pub use delegator::Delegator;
pub use error::WorkflowError;
pub use handlers::{capabilities, CANCEL_WORKFLOW, RESEARCH_REQUEST, WORKFLOW_STATUS};
pub use orchestrator::Orchestrator;
pub use stage::Stage;
pub use workflow::{ResearchRequest, StageTransition, WorkflowFailure, WorkflowState};
