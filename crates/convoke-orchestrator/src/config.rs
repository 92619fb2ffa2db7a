// ABOUTME: Orchestrator settings: concurrency bound, delegation timeouts and per-stage routing.
// ABOUTME: Each delegating stage names the agent type and action that performs it.

use std::collections::HashMap;
use std::time::Duration;

use crate::stage::Stage;

/// Which agent performs a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageTarget {
    pub agent_type: String,
    pub action: String,
    /// Overrides [`OrchestratorConfig::stage_timeout`] for this stage.
    pub timeout: Option<Duration>,
}

impl StageTarget {
    pub fn new(agent_type: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
            action: action.into(),
            timeout: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Workflows driven at the same time.
    pub max_concurrent_workflows: usize,
    /// Submissions that may wait for a free slot.
    pub queue_capacity: usize,
    /// Default wait for each delegated stage.
    pub stage_timeout: Duration,
    /// Finished workflows kept for `status`; the oldest are evicted first.
    pub max_retained_workflows: usize,
    pub stages: HashMap<Stage, StageTarget>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let stages = [
            (Stage::Planning, StageTarget::new("planner", "plan")),
            (
                Stage::CostEstimation,
                StageTarget::new("cost_estimator", "estimate_cost"),
            ),
            (
                Stage::LiteratureReview,
                StageTarget::new("literature", "review_literature"),
            ),
            (
                Stage::ResultProcessing,
                StageTarget::new("processor", "process_results"),
            ),
            (Stage::Synthesis, StageTarget::new("synthesizer", "synthesize")),
        ]
        .into_iter()
        .collect();

        Self {
            max_concurrent_workflows: 8,
            queue_capacity: 1024,
            stage_timeout: Duration::from_secs(120),
            max_retained_workflows: 1024,
            stages,
        }
    }
}

impl OrchestratorConfig {
    pub fn target(&self, stage: Stage) -> Option<&StageTarget> {
        self.stages.get(&stage)
    }

    pub fn timeout_for(&self, stage: Stage) -> Duration {
        self.target(stage)
            .and_then(|t| t.timeout)
            .unwrap_or(self.stage_timeout)
    }
}
