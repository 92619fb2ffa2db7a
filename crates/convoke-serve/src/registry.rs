// ABOUTME: Agent registry owned by the router actor: identities, liveness and selection.
// ABOUTME: Pure data structure; time is passed in so liveness rules are testable without a clock.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use crate::config::RouterConfig;
use crate::error::{InvalidTransition, RegistrationError};

/// Identifier the router assigns to each accepted connection.
pub type ConnectionId = u64;

/// Health of a registered agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Liveness {
    Active,
    Degraded,
    Evicted,
}

/// Lifecycle of one router connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Connecting,
    Registered,
    Active,
    Degraded,
    Disconnected,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Registered)
                | (Registered, Active)
                | (Active, Degraded)
                | (Degraded, Active)
                | (Connecting, Disconnected)
                | (Registered, Disconnected)
                | (Active, Disconnected)
                | (Degraded, Disconnected)
        )
    }

    /// Move to `next`, rejecting anything outside the lifecycle.
    pub fn transition(&mut self, next: ConnectionState) -> Result<(), InvalidTransition> {
        if !self.can_transition_to(next) {
            return Err(InvalidTransition {
                from: *self,
                to: next,
            });
        }
        *self = next;
        Ok(())
    }
}

/// A registered agent as reported by the router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentIdentity {
    pub agent_id: String,
    pub agent_type: String,
    pub capabilities: Vec<String>,
    pub registered_at: DateTime<Utc>,
    pub liveness: Liveness,
}

impl AgentIdentity {
    pub fn new(
        agent_id: impl Into<String>,
        agent_type: impl Into<String>,
        capabilities: Vec<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_type: agent_type.into(),
            capabilities,
            registered_at: Utc::now(),
            liveness: Liveness::Active,
        }
    }

    pub fn can_perform(&self, action: Option<&str>) -> bool {
        match action {
            Some(action) => self.capabilities.iter().any(|c| c == action),
            None => true,
        }
    }
}

/// Liveness implied by how long an agent has been silent.
pub fn evaluate_liveness(silent_for: Duration, config: &RouterConfig) -> Liveness {
    if silent_for >= config.evicted_after() {
        Liveness::Evicted
    } else if silent_for >= config.degraded_after() {
        Liveness::Degraded
    } else {
        Liveness::Active
    }
}

/// A liveness change produced by [`Registry::sweep`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessChange {
    pub agent_id: String,
    pub from: Liveness,
    pub to: Liveness,
}

#[derive(Debug)]
struct AgentEntry {
    identity: AgentIdentity,
    connection: ConnectionId,
    last_seen: Instant,
}

/// Registered agents, in registration order.
#[derive(Debug, Default)]
pub struct Registry {
    agents: HashMap<String, AgentEntry>,
    order: Vec<String>,
    /// Last agent chosen per agent type, for round-robin.
    last_pick: HashMap<String, String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        identity: AgentIdentity,
        connection: ConnectionId,
        now: Instant,
    ) -> Result<(), RegistrationError> {
        if self.agents.contains_key(&identity.agent_id) {
            return Err(RegistrationError::DuplicateId(identity.agent_id));
        }
        self.order.push(identity.agent_id.clone());
        self.agents.insert(
            identity.agent_id.clone(),
            AgentEntry {
                identity,
                connection,
                last_seen: now,
            },
        );
        Ok(())
    }

    pub fn remove(&mut self, agent_id: &str) -> Option<AgentIdentity> {
        let entry = self.agents.remove(agent_id)?;
        self.order.retain(|id| id != agent_id);
        Some(entry.identity)
    }

    pub fn get(&self, agent_id: &str) -> Option<&AgentIdentity> {
        self.agents.get(agent_id).map(|e| &e.identity)
    }

    pub fn connection_of(&self, agent_id: &str) -> Option<ConnectionId> {
        self.agents.get(agent_id).map(|e| e.connection)
    }

    /// Record a heartbeat. Returns the liveness the agent had before it.
    pub fn touch(&mut self, agent_id: &str, now: Instant) -> Option<Liveness> {
        let entry = self.agents.get_mut(agent_id)?;
        let previous = entry.identity.liveness;
        entry.last_seen = now;
        entry.identity.liveness = Liveness::Active;
        Some(previous)
    }

    /// Re-evaluate every agent. Heartbeats are the only way back to ACTIVE,
    /// so a sweep only ever degrades.
    pub fn sweep(&mut self, now: Instant, config: &RouterConfig) -> Vec<LivenessChange> {
        let mut changes = Vec::new();
        for id in &self.order {
            let Some(entry) = self.agents.get_mut(id) else {
                continue;
            };
            let silent_for = now.saturating_duration_since(entry.last_seen);
            let next = evaluate_liveness(silent_for, config);
            let current = entry.identity.liveness;
            let worse = matches!(
                (current, next),
                (Liveness::Active, Liveness::Degraded)
                    | (Liveness::Active, Liveness::Evicted)
                    | (Liveness::Degraded, Liveness::Evicted)
            );
            if worse {
                entry.identity.liveness = next;
                changes.push(LivenessChange {
                    agent_id: id.clone(),
                    from: current,
                    to: next,
                });
            }
        }
        changes
    }

    /// Pick the next ACTIVE agent of `agent_type` able to perform `action`.
    ///
    /// Candidates are taken in registration order, continuing after the agent
    /// picked last time for this type.
    pub fn select(&mut self, agent_type: &str, action: Option<&str>) -> Option<String> {
        let candidates: Vec<&String> = self
            .order
            .iter()
            .filter(|id| {
                self.agents.get(*id).is_some_and(|e| {
                    e.identity.agent_type == agent_type
                        && e.identity.liveness == Liveness::Active
                        && e.identity.can_perform(action)
                })
            })
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let after = self
            .last_pick
            .get(agent_type)
            .and_then(|last| self.order.iter().position(|id| id == last));
        let chosen = match after {
            Some(pos) => candidates
                .iter()
                .find(|id| self.order.iter().position(|o| o == **id) > Some(pos))
                .unwrap_or(&candidates[0]),
            None => &candidates[0],
        };
        let chosen = (*chosen).clone();
        self.last_pick
            .insert(agent_type.to_string(), chosen.clone());
        Some(chosen)
    }

    /// Whether `agent_id` is registered and not evicted.
    pub fn is_live(&self, agent_id: &str) -> bool {
        self.get(agent_id)
            .is_some_and(|a| a.liveness != Liveness::Evicted)
    }

    /// Every registered agent, in registration order.
    pub fn identities(&self) -> Vec<AgentIdentity> {
        self.order
            .iter()
            .filter_map(|id| self.agents.get(id).map(|e| e.identity.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
