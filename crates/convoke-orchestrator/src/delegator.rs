// ABOUTME: The seam between the orchestrator and whatever carries its delegations.
// ABOUTME: Implemented for the agent connector; tests substitute scripted delegators.

use std::time::Duration;

use async_trait::async_trait;
use convoke_connect::{Connector, ConnectorError};
use convoke_proto::Envelope;

/// Sends a task to another agent and waits for its correlated reply.
#[async_trait]
pub trait Delegator: Send + Sync {
    async fn delegate(&self, envelope: Envelope, timeout: Duration)
        -> Result<Envelope, ConnectorError>;

    /// Best-effort notice that a delegated task is no longer wanted.
    async fn cancel_task(&self, task_id: &str) -> Result<(), ConnectorError>;
}

#[async_trait]
impl Delegator for Connector {
    async fn delegate(
        &self,
        envelope: Envelope,
        timeout: Duration,
    ) -> Result<Envelope, ConnectorError> {
        self.send_and_wait(envelope, timeout).await
    }

    async fn cancel_task(&self, task_id: &str) -> Result<(), ConnectorError> {
        self.cancel_delegated(task_id).await
    }
}
