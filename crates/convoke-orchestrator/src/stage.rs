// ABOUTME: Workflow stages and the forward-only rules for moving between them.
// ABOUTME: FAILED and CANCELLED are reachable from any non-terminal stage.

use serde::{Deserialize, Serialize};

/// Where a workflow is in its pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Planning,
    CostEstimation,
    LiteratureReview,
    ResultProcessing,
    Synthesis,
    Complete,
    Failed,
    Cancelled,
}

impl Stage {
    /// Stages that delegate work, in execution order.
    pub const PIPELINE: [Stage; 5] = [
        Stage::Planning,
        Stage::CostEstimation,
        Stage::LiteratureReview,
        Stage::ResultProcessing,
        Stage::Synthesis,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Planning => "PLANNING",
            Stage::CostEstimation => "COST_ESTIMATION",
            Stage::LiteratureReview => "LITERATURE_REVIEW",
            Stage::ResultProcessing => "RESULT_PROCESSING",
            Stage::Synthesis => "SYNTHESIS",
            Stage::Complete => "COMPLETE",
            Stage::Failed => "FAILED",
            Stage::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Complete | Stage::Failed | Stage::Cancelled)
    }

    /// The stage that follows this one on success.
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Planning => Some(Stage::CostEstimation),
            Stage::CostEstimation => Some(Stage::LiteratureReview),
            Stage::LiteratureReview => Some(Stage::ResultProcessing),
            Stage::ResultProcessing => Some(Stage::Synthesis),
            Stage::Synthesis => Some(Stage::Complete),
            Stage::Complete | Stage::Failed | Stage::Cancelled => None,
        }
    }

    pub fn can_advance_to(&self, target: Stage) -> bool {
        if self.is_terminal() {
            return false;
        }
        match target {
            Stage::Failed | Stage::Cancelled => true,
            other => self.next() == Some(other),
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
