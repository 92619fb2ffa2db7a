// ABOUTME: Workflow orchestrator: a FIFO submission queue feeding bounded concurrent drivers.
// ABOUTME: Each driver runs one workflow's stages in order, delegating every stage to a remote agent.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use convoke_proto::Envelope;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::delegator::Delegator;
use crate::error::WorkflowError;
use crate::stage::Stage;
use crate::workflow::{ResearchRequest, WorkflowState};

/// Completion notifications buffered per subscriber.
const EVENT_BUFFER: usize = 256;

/// Failure message for workflows still unfinished at shutdown.
const SHUTDOWN_MESSAGE: &str = "orchestrator shutting down";

/// Bookkeeping for a workflow that has not finished.
struct Active {
    cancel: CancellationToken,
    /// Task id of the delegation currently awaited.
    in_flight: Option<String>,
}

struct Inner {
    config: OrchestratorConfig,
    delegator: Arc<dyn Delegator>,
    workflows: Mutex<HashMap<String, WorkflowState>>,
    active: Mutex<HashMap<String, Active>>,
    /// Terminal workflows in the order they finished.
    finished: Mutex<VecDeque<String>>,
    queue_tx: mpsc::Sender<String>,
    queue_rx: Mutex<Option<mpsc::Receiver<String>>>,
    events: broadcast::Sender<WorkflowState>,
    slots: Arc<Semaphore>,
    shutdown: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Drives research workflows through their stages.
///
/// Cloning is cheap; all clones share the same workflows.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, delegator: Arc<dyn Delegator>) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let slots = Arc::new(Semaphore::new(config.max_concurrent_workflows.max(1)));
        Self {
            inner: Arc::new(Inner {
                config,
                delegator,
                workflows: Mutex::new(HashMap::new()),
                active: Mutex::new(HashMap::new()),
                finished: Mutex::new(VecDeque::new()),
                queue_tx,
                queue_rx: Mutex::new(Some(queue_rx)),
                events,
                slots,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Accept a request and queue its workflow. Returns the context id.
    pub async fn submit(&self, request: ResearchRequest) -> Result<String, WorkflowError> {
        request.validate()?;
        let state = WorkflowState::new(request);
        let context_id = state.context_id.clone();

        {
            // Holding `active` orders this against `shutdown` draining it.
            let mut active = lock(&self.inner.active);
            if self.inner.shutdown.is_cancelled() {
                return Err(WorkflowError::ShuttingDown);
            }
            lock(&self.inner.workflows).insert(context_id.clone(), state);
            active.insert(
                context_id.clone(),
                Active {
                    cancel: self.inner.shutdown.child_token(),
                    in_flight: None,
                },
            );
        }

        if self.inner.queue_tx.send(context_id.clone()).await.is_err() {
            lock(&self.inner.workflows).remove(&context_id);
            lock(&self.inner.active).remove(&context_id);
            return Err(WorkflowError::QueueUnavailable);
        }
        info!(context_id = %context_id, "Workflow submitted");
        Ok(context_id)
    }

    /// Consume the submission queue until [`shutdown`](Self::shutdown).
    ///
    /// Workflows start in submission order; at most
    /// `max_concurrent_workflows` run at once. Only one consumer may run.
    pub async fn process_queue(&self) -> Result<(), WorkflowError> {
        let mut rx = lock(&self.inner.queue_rx)
            .take()
            .ok_or(WorkflowError::QueueUnavailable)?;
        let shutdown = self.inner.shutdown.clone();

        loop {
            let context_id = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = rx.recv() => match next {
                    Some(id) => id,
                    None => break,
                },
            };

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&self.inner.slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let cancel = lock(&self.inner.active)
                .get(&context_id)
                .map(|a| a.cancel.clone());
            let Some(cancel) = cancel else {
                debug!(context_id = %context_id, "Workflow cancelled before start");
                continue;
            };

            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                let _permit = permit;
                inner.drive(&context_id, &cancel).await;
                lock(&inner.active).remove(&context_id);
            });
        }

        debug!("Workflow queue stopped");
        Ok(())
    }

    /// Stop an unfinished workflow and tell any in-flight agent to stop too.
    pub async fn cancel(&self, context_id: &str) -> Result<WorkflowState, WorkflowError> {
        let snapshot = {
            let mut workflows = lock(&self.inner.workflows);
            let state = workflows
                .get_mut(context_id)
                .ok_or_else(|| WorkflowError::UnknownWorkflow(context_id.to_string()))?;
            if state.is_terminal() {
                return Err(WorkflowError::AlreadyTerminal {
                    context_id: context_id.to_string(),
                    stage: state.stage,
                });
            }
            state.advance(Stage::Cancelled)?;
            state.clone()
        };

        let active = lock(&self.inner.active).remove(context_id);
        if let Some(active) = active {
            active.cancel.cancel();
            if let Some(task_id) = active.in_flight {
                if let Err(e) = self.inner.delegator.cancel_task(&task_id).await {
                    debug!(context_id = %context_id, task_id = %task_id, error = %e, "Cancel notice not delivered");
                }
            }
        }

        info!(context_id = %context_id, "Workflow cancelled");
        self.inner.notify(snapshot.clone());
        Ok(snapshot)
    }

    /// Current or archived state of a workflow.
    pub fn status(&self, context_id: &str) -> Option<WorkflowState> {
        lock(&self.inner.workflows).get(context_id).cloned()
    }

    /// Every known workflow, oldest first.
    pub fn workflows(&self) -> Vec<WorkflowState> {
        let mut all: Vec<WorkflowState> = lock(&self.inner.workflows).values().cloned().collect();
        all.sort_by_key(|w| w.created_at);
        all
    }

    /// Notifications for workflows reaching COMPLETE, FAILED or CANCELLED.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowState> {
        self.inner.events.subscribe()
    }

    /// Stop taking work off the queue and fail every unfinished workflow.
    ///
    /// Running and queued workflows move to FAILED with the message
    /// "orchestrator shutting down" and are announced to subscribers. Agents still
    /// holding a delegated stage are sent a cancel. Later submissions are
    /// refused.
    pub async fn shutdown(&self) {
        let unfinished: Vec<(String, Active)> = {
            let mut active = lock(&self.inner.active);
            self.inner.shutdown.cancel();
            active.drain().collect()
        };
        if !unfinished.is_empty() {
            info!(workflows = unfinished.len(), "Failing unfinished workflows on shutdown");
        }

        for (context_id, active) in unfinished {
            self.inner.fail(&context_id, SHUTDOWN_MESSAGE.to_string());
            if let Some(task_id) = active.in_flight {
                if let Err(e) = self.inner.delegator.cancel_task(&task_id).await {
                    debug!(context_id = %context_id, task_id = %task_id, error = %e, "Cancel notice not delivered");
                }
            }
        }
    }
}

impl Inner {
    /// Announce a terminal state, then trim the archive.
    fn notify(&self, state: WorkflowState) {
        // No subscribers is fine.
        let context_id = state.context_id.clone();
        let _ = self.events.send(state);
        self.evict_finished(&context_id);
    }

    /// Drop the oldest finished workflows beyond `max_retained_workflows`.
    fn evict_finished(&self, context_id: &str) {
        let mut finished = lock(&self.finished);
        finished.push_back(context_id.to_string());
        while finished.len() > self.config.max_retained_workflows {
            let Some(oldest) = finished.pop_front() else {
                break;
            };
            lock(&self.workflows).remove(&oldest);
            debug!(context_id = %oldest, "Finished workflow evicted");
        }
    }

    /// Apply `update` unless the workflow has already finished.
    fn update<R>(
        &self,
        context_id: &str,
        update: impl FnOnce(&mut WorkflowState) -> R,
    ) -> Option<R> {
        let mut workflows = lock(&self.workflows);
        let state = workflows.get_mut(context_id)?;
        if state.is_terminal() {
            return None;
        }
        Some(update(state))
    }

    fn set_in_flight(&self, context_id: &str, task_id: Option<String>) {
        if let Some(active) = lock(&self.active).get_mut(context_id) {
            active.in_flight = task_id;
        }
    }

    fn fail(&self, context_id: &str, message: String) {
        let snapshot = self.update(context_id, |state| {
            if let Err(e) = state.fail(message.clone()) {
                warn!(context_id = %context_id, error = %e, "Could not mark workflow failed");
            }
            state.clone()
        });
        if let Some(state) = snapshot {
            warn!(context_id = %context_id, error = %message, "Workflow failed");
            self.notify(state);
        }
    }

    async fn drive(&self, context_id: &str, cancel: &CancellationToken) {
        info!(context_id = %context_id, "Workflow started");

        for stage in Stage::PIPELINE {
            let entered = self.update(context_id, |state| {
                if state.stage != stage {
                    state.advance(stage)?;
                }
                Ok::<_, WorkflowError>(state.stage_payload(stage))
            });
            let payload = match entered {
                Some(Ok(payload)) => payload,
                Some(Err(e)) => {
                    self.fail(context_id, e.to_string());
                    return;
                }
                None => return,
            };

            let Some(target) = self.config.target(stage) else {
                self.fail(context_id, format!("no agent configured for {}", stage));
                return;
            };
            let envelope = Envelope::task(&target.agent_type, &target.action, payload);
            let task_id = envelope.task_id.clone().unwrap_or_default();
            self.update(context_id, |state| state.task_ids.push(task_id.clone()));
            self.set_in_flight(context_id, Some(task_id.clone()));
            debug!(context_id = %context_id, stage = %stage, task_id = %task_id, agent_type = %target.agent_type, "Delegating stage");

            let result = tokio::select! {
                biased;
                // `cancel` or `shutdown` records the terminal state.
                _ = cancel.cancelled() => {
                    debug!(context_id = %context_id, stage = %stage, "Stage interrupted");
                    return;
                }
                result = self.delegator.delegate(envelope, self.config.timeout_for(stage)) => result,
            };
            self.set_in_flight(context_id, None);

            match result {
                Ok(reply) => {
                    if self
                        .update(context_id, |state| state.record_output(stage, reply.payload))
                        .is_none()
                    {
                        return;
                    }
                }
                Err(e) => {
                    self.fail(context_id, format!("{} failed: {}", stage, e));
                    return;
                }
            }
        }

        let finished = self.update(context_id, |state| {
            state.advance(Stage::Complete).map(|_| state.clone())
        });
        match finished {
            Some(Ok(state)) => {
                info!(context_id = %context_id, "Workflow complete");
                self.notify(state);
            }
            Some(Err(e)) => self.fail(context_id, e.to_string()),
            None => {}
        }
    }
}
