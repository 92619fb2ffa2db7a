// ABOUTME: The agent connector: one persistent router connection with sequential task processing.
// ABOUTME: Reconnects with backoff, re-registers, sends heartbeats, and answers every task it dequeues.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use convoke_correlator::{CorrelationError, Correlator};
use convoke_proto::{
    Envelope, ErrorKind, ErrorPayload, MessageType, ProtoError, StreamSender,
};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::backoff::{jitter_sample, BackoffConfig, ReconnectMachine};
use crate::error::{ConnectorError, HandlerError};
use crate::handler::{self, HandlerRegistry, TaskContext, TaskHandler};
use crate::registration::{self, RegistrationConfig};
use crate::transport::{TcpTransport, Transport};

/// Connector settings.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub registration: RegistrationConfig,
    pub heartbeat_interval: Duration,
    pub backoff: BackoffConfig,
    /// How long shutdown waits for queued and in-flight tasks.
    pub shutdown_grace: Duration,
}

impl ConnectorConfig {
    pub fn new(registration: RegistrationConfig) -> Self {
        Self {
            registration,
            heartbeat_interval: Duration::from_secs(10),
            backoff: BackoffConfig::default(),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Snapshot returned by [`Connector::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectorStatus {
    pub connected: bool,
    pub agent_id: String,
    /// When the router last acknowledged a heartbeat.
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Tasks waiting behind the one in flight.
    pub queue_depth: usize,
}

struct QueuedTask {
    envelope: Envelope,
    epoch: u64,
}

struct InFlight {
    task_id: String,
    epoch: u64,
    cancel: CancellationToken,
}

struct ActiveLink {
    sender: StreamSender<Envelope>,
    epoch: u64,
}

struct Inner {
    config: ConnectorConfig,
    transport: Arc<dyn Transport>,
    handlers: RwLock<HandlerRegistry>,
    correlator: Correlator,

    link: Mutex<Option<ActiveLink>>,
    /// Bumped for every established connection; tasks carry the epoch they arrived on.
    epoch: AtomicU64,
    connected: watch::Sender<bool>,
    /// Milliseconds since the Unix epoch of the last heartbeat ack, 0 if none.
    last_heartbeat: AtomicI64,

    queue: Mutex<VecDeque<QueuedTask>>,
    queue_ready: Notify,
    busy: AtomicBool,
    in_flight: Mutex<Option<InFlight>>,
    idle: Notify,

    accepting: AtomicBool,
    shutdown: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Whole milliseconds for log fields, saturating at `u64::MAX`.
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// The agent-side half of a router connection.
///
/// Cloning is cheap; all clones drive the same connection.
#[derive(Clone)]
pub struct Connector {
    inner: Arc<Inner>,
}

impl Connector {
    pub fn new(config: ConnectorConfig, transport: Arc<dyn Transport>) -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                handlers: RwLock::new(HandlerRegistry::new()),
                correlator: Correlator::new(),
                link: Mutex::new(None),
                epoch: AtomicU64::new(0),
                connected,
                last_heartbeat: AtomicI64::new(0),
                queue: Mutex::new(VecDeque::new()),
                queue_ready: Notify::new(),
                busy: AtomicBool::new(false),
                in_flight: Mutex::new(None),
                idle: Notify::new(),
                accepting: AtomicBool::new(true),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Connector speaking to a router over TCP.
    pub fn tcp(config: ConnectorConfig, address: impl Into<String>) -> Self {
        Self::new(config, Arc::new(TcpTransport::new(address)))
    }

    pub fn agent_id(&self) -> &str {
        &self.inner.config.registration.agent_id
    }

    pub fn correlator(&self) -> &Correlator {
        &self.inner.correlator
    }

    /// Attach an async function to an action name.
    pub fn register_handler<F, Fut>(&self, action: impl Into<String>, callback: F)
    where
        F: Fn(TaskContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.handlers_mut().insert_fn(action, callback);
    }

    pub fn register_task_handler(&self, action: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers_mut().insert(action, handler);
    }

    fn handlers_mut(&self) -> std::sync::RwLockWriteGuard<'_, HandlerRegistry> {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Connect, register and serve until shutdown.
    ///
    /// Transport and registration failures are retried with backoff; this only
    /// returns an error for an invalid identity or exhausted attempts.
    pub async fn run(&self) -> Result<(), ConnectorError> {
        self.inner.config.registration.validate()?;

        let processor = tokio::spawn(process_loop(self.inner.clone()));
        let result = self.connect_loop().await;

        self.inner.shutdown.cancel();
        if let Err(e) = processor.await {
            warn!(error = %e, "Task processor ended abnormally");
        }
        result
    }

    async fn connect_loop(&self) -> Result<(), ConnectorError> {
        let endpoint = self.inner.transport.describe();
        let mut machine = ReconnectMachine::new(self.inner.config.backoff.clone());

        loop {
            if self.inner.shutdown.is_cancelled() {
                return Ok(());
            }

            let attempt = machine.begin_attempt();
            debug!(attempt, endpoint = %endpoint, "Connecting to router");

            let outcome = tokio::select! {
                outcome = self.establish() => outcome,
                _ = self.inner.shutdown.cancelled() => return Ok(()),
            };

            match outcome {
                Ok((sender, receiver)) => {
                    machine.on_connected();
                    info!(
                        agent_id = %self.agent_id(),
                        endpoint = %endpoint,
                        "Registered with router"
                    );
                    self.serve(sender, receiver).await;
                    machine.on_disconnected();
                    if self.inner.shutdown.is_cancelled() {
                        return Ok(());
                    }
                    warn!(agent_id = %self.agent_id(), "Connection to router lost, reconnecting");
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => match machine.on_failure(jitter_sample()) {
                    Some(delay) => {
                        warn!(
                            attempt,
                            delay_ms = millis(delay),
                            error = %e,
                            "Connection attempt failed, backing off"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = self.inner.shutdown.cancelled() => return Ok(()),
                        }
                    }
                    None => {
                        return Err(ConnectorError::MaxAttempts {
                            attempts: machine.attempts(),
                        })
                    }
                },
            }
        }
    }

    async fn establish(
        &self,
    ) -> Result<
        (
            StreamSender<Envelope>,
            mpsc::Receiver<Result<Envelope, ProtoError>>,
        ),
        ConnectorError,
    > {
        let link = self.inner.transport.connect().await?;
        let (sender, mut receiver) = link.split();
        registration::register(&self.inner.config.registration, &sender, &mut receiver).await?;
        Ok((sender, receiver))
    }

    /// Receive loop for one established connection.
    async fn serve(
        &self,
        sender: StreamSender<Envelope>,
        mut receiver: mpsc::Receiver<Result<Envelope, ProtoError>>,
    ) {
        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let conn_cancel = self.inner.shutdown.child_token();

        *lock(&self.inner.link) = Some(ActiveLink {
            sender: sender.clone(),
            epoch,
        });
        self.inner.connected.send_replace(true);

        let heartbeat = tokio::spawn(heartbeat_loop(
            self.agent_id().to_string(),
            sender,
            self.inner.config.heartbeat_interval,
            conn_cancel.clone(),
        ));

        loop {
            let item = tokio::select! {
                item = receiver.recv() => item,
                _ = conn_cancel.cancelled() => break,
            };
            match item {
                None => break,
                Some(Ok(envelope)) => self.deliver(envelope).await,
                Some(Err(e)) if e.is_fatal() => {
                    warn!(error = %e, "Router link failed");
                    break;
                }
                Some(Err(e)) => warn!(error = %e, "Malformed envelope from router ignored"),
            }
        }

        conn_cancel.cancel();
        let _ = heartbeat.await;
        self.inner.detach(epoch);
    }

    /// Inbound callback for every envelope read from the router.
    pub async fn deliver(&self, envelope: Envelope) {
        match envelope.kind {
            MessageType::HeartbeatAck => {
                self.inner
                    .last_heartbeat
                    .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
                trace!("Heartbeat acknowledged");
            }
            MessageType::TaskSubmit | MessageType::ResearchAction => self.enqueue(envelope).await,
            MessageType::TaskCancel => match envelope.task_id.as_deref() {
                Some(task_id) => self.cancel_local(task_id).await,
                None => debug!("task_cancel without task id ignored"),
            },
            MessageType::TaskResult | MessageType::Error => {
                if envelope.task_id.is_none() {
                    if let Some(payload) = envelope.error_payload() {
                        warn!(kind = %payload.kind, message = %payload.message, "Error from router");
                    }
                    return;
                }
                self.inner.correlator.on_response(envelope);
            }
            MessageType::RegistrationConfirmed => debug!("Repeated registration confirmation"),
            MessageType::AgentRegister | MessageType::AgentUnregister | MessageType::Heartbeat => {
                debug!(kind = %envelope.kind, "Unexpected envelope from router ignored");
            }
        }
    }

    async fn enqueue(&self, envelope: Envelope) {
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        if !self.inner.accepting.load(Ordering::SeqCst) {
            debug!(task_id = ?envelope.task_id, "Task refused during shutdown");
            let reply = envelope.reply_error(
                self.agent_id(),
                ErrorPayload::new(ErrorKind::ShuttingDown, "agent is shutting down"),
            );
            self.inner.reply(epoch, reply).await;
            return;
        }

        debug!(task_id = ?envelope.task_id, action = ?envelope.action, "Task queued");
        lock(&self.inner.queue).push_back(QueuedTask { envelope, epoch });
        self.inner.queue_ready.notify_one();
    }

    /// Skip a queued task or abort the in-flight one.
    async fn cancel_local(&self, task_id: &str) {
        let queued = {
            let mut queue = lock(&self.inner.queue);
            queue
                .iter()
                .position(|t| t.envelope.task_id.as_deref() == Some(task_id))
                .and_then(|idx| queue.remove(idx))
        };
        if let Some(task) = queued {
            info!(task_id = %task_id, "Queued task cancelled");
            let reply = task
                .envelope
                .reply_error(self.agent_id(), HandlerError::Cancelled.to_payload());
            self.inner.reply(task.epoch, reply).await;
            return;
        }

        if let Some(in_flight) = lock(&self.inner.in_flight).as_ref() {
            if in_flight.task_id == task_id {
                info!(task_id = %task_id, "In-flight task cancelled");
                in_flight.cancel.cancel();
                return;
            }
        }
        debug!(task_id = %task_id, "Cancel for unknown task ignored");
    }

    fn current_sender(&self) -> Result<StreamSender<Envelope>, ConnectorError> {
        lock(&self.inner.link)
            .as_ref()
            .map(|l| l.sender.clone())
            .ok_or(ConnectorError::NotConnected)
    }

    fn stamp(&self, mut envelope: Envelope) -> Envelope {
        if envelope.agent_id.is_none() {
            envelope.agent_id = Some(self.agent_id().to_string());
        }
        envelope
    }

    /// Send without waiting for a reply.
    pub async fn send(&self, envelope: Envelope) -> Result<(), ConnectorError> {
        let sender = self.current_sender()?;
        sender.send(self.stamp(envelope)).await?;
        Ok(())
    }

    /// Delegate work through the router and wait for the correlated reply.
    pub async fn send_and_wait(
        &self,
        envelope: Envelope,
        timeout: Duration,
    ) -> Result<Envelope, ConnectorError> {
        let sender = self.current_sender()?;
        let reply = self
            .inner
            .correlator
            .send_and_wait(&sender, self.stamp(envelope), timeout)
            .await?;
        Ok(reply)
    }

    /// Ask the router to cancel a task this agent delegated, and stop waiting for it.
    pub async fn cancel_delegated(&self, task_id: &str) -> Result<(), ConnectorError> {
        self.inner.correlator.fail(
            task_id,
            CorrelationError::Remote {
                kind: ErrorKind::Cancelled,
                message: "cancelled by requester".to_string(),
            },
        );
        self.send(Envelope::cancel(task_id)).await
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.inner.link).is_some()
    }

    /// Resolve once a registered connection is up.
    pub async fn wait_connected(&self) {
        let mut rx = self.inner.connected.subscribe();
        let _ = rx.wait_for(|connected| *connected).await;
    }

    pub fn status(&self) -> ConnectorStatus {
        let heartbeat_ms = self.inner.last_heartbeat.load(Ordering::Relaxed);
        ConnectorStatus {
            connected: self.is_connected(),
            agent_id: self.agent_id().to_string(),
            last_heartbeat: if heartbeat_ms == 0 {
                None
            } else {
                DateTime::from_timestamp_millis(heartbeat_ms)
            },
            queue_depth: lock(&self.inner.queue).len(),
        }
    }

    /// Graceful shutdown using the configured grace period.
    pub async fn shutdown(&self) {
        self.shutdown_with_grace(self.inner.config.shutdown_grace)
            .await
    }

    /// Stop accepting tasks, drain for up to `grace`, unregister and disconnect.
    pub async fn shutdown_with_grace(&self, grace: Duration) {
        if !self.inner.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(agent_id = %self.agent_id(), grace_ms = millis(grace), "Shutting down connector");

        let deadline = Instant::now() + grace;
        while !self.inner.is_idle() {
            tokio::select! {
                _ = self.inner.idle.notified() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    warn!("Shutdown grace period elapsed with work outstanding");
                    break;
                }
            }
        }

        let leftover: Vec<QueuedTask> = lock(&self.inner.queue).drain(..).collect();
        for task in leftover {
            let reply = task.envelope.reply_error(
                self.agent_id(),
                ErrorPayload::new(ErrorKind::ShuttingDown, "agent is shutting down"),
            );
            self.inner.reply(task.epoch, reply).await;
        }

        if let Ok(sender) = self.current_sender() {
            if let Err(e) = sender.send(Envelope::unregister(self.agent_id())).await {
                debug!(error = %e, "Could not send unregister");
            }
        }
        self.inner.shutdown.cancel();
    }
}

impl Inner {
    fn agent_id(&self) -> &str {
        &self.config.registration.agent_id
    }

    fn is_idle(&self) -> bool {
        let queue = lock(&self.queue);
        queue.is_empty() && !self.busy.load(Ordering::SeqCst)
    }

    /// Send on the connection the task arrived on; dropped if it is gone.
    async fn reply(&self, epoch: u64, envelope: Envelope) {
        let sender = lock(&self.link)
            .as_ref()
            .filter(|l| l.epoch == epoch)
            .map(|l| l.sender.clone());
        match sender {
            Some(sender) => {
                if let Err(e) = sender.send(envelope).await {
                    debug!(error = %e, "Reply lost with its connection");
                }
            }
            None => debug!(task_id = ?envelope.task_id, "Connection gone, reply dropped"),
        }
    }

    /// Tear down state tied to a dropped connection.
    fn detach(&self, epoch: u64) {
        {
            let mut link = lock(&self.link);
            if link.as_ref().map(|l| l.epoch) == Some(epoch) {
                *link = None;
            }
        }
        self.connected.send_replace(false);

        let discarded = {
            let mut queue = lock(&self.queue);
            let before = queue.len();
            queue.retain(|t| t.epoch != epoch);
            before - queue.len()
        };
        if discarded > 0 {
            warn!(discarded, "Queued tasks from dropped connection discarded");
        }

        if let Some(in_flight) = lock(&self.in_flight).as_ref() {
            if in_flight.epoch == epoch {
                warn!(task_id = %in_flight.task_id, "In-flight task abandoned with its connection");
                in_flight.cancel.cancel();
            }
        }
        self.idle.notify_one();
    }

    async fn process(&self, task: QueuedTask) {
        let QueuedTask { envelope, epoch } = task;
        let task_id = envelope.task_id.clone().unwrap_or_default();
        if epoch != self.epoch.load(Ordering::SeqCst) {
            debug!(task_id = %task_id, "Task from a dropped connection abandoned");
            return;
        }

        let action = envelope.action.clone().unwrap_or_default();
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&action);

        let started = Instant::now();
        let result = match handler {
            None => Err(HandlerError::UnknownAction(action.clone())),
            Some(handler) => {
                let cancel = self.shutdown.child_token();
                *lock(&self.in_flight) = Some(InFlight {
                    task_id: task_id.clone(),
                    epoch,
                    cancel: cancel.clone(),
                });
                let ctx = TaskContext {
                    task_id: task_id.clone(),
                    action: action.clone(),
                    sender: envelope.agent_id.clone(),
                    agent_id: self.agent_id().to_string(),
                    cancel,
                };
                let result = handler::invoke(handler, ctx, envelope.payload.clone()).await;
                *lock(&self.in_flight) = None;
                result
            }
        };

        let elapsed_ms = millis(started.elapsed());
        let reply = match result {
            Ok(value) => {
                info!(task_id = %task_id, action = %action, elapsed_ms, "Task completed");
                envelope.reply_ok(self.agent_id(), value)
            }
            Err(e) => {
                warn!(task_id = %task_id, action = %action, elapsed_ms, error = %e, "Task failed");
                envelope.reply_error(self.agent_id(), e.to_payload())
            }
        };
        self.reply(epoch, reply).await;
    }
}

/// Dequeue and process one task at a time until shutdown.
async fn process_loop(inner: Arc<Inner>) {
    loop {
        let next = {
            let mut queue = lock(&inner.queue);
            let task = queue.pop_front();
            if task.is_some() {
                inner.busy.store(true, Ordering::SeqCst);
            }
            task
        };

        let Some(task) = next else {
            tokio::select! {
                _ = inner.queue_ready.notified() => {}
                _ = inner.shutdown.cancelled() => break,
            }
            continue;
        };

        inner.process(task).await;
        inner.busy.store(false, Ordering::SeqCst);
        inner.idle.notify_one();
    }
    debug!("Task processor stopped");
}

/// Emit heartbeats on one connection until it is cancelled.
async fn heartbeat_loop(
    agent_id: String,
    sender: StreamSender<Envelope>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; registration already proved liveness.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = sender.send(Envelope::heartbeat(agent_id.clone())).await {
                    debug!(error = %e, "Heartbeat send failed");
                    break;
                }
                trace!(agent_id = %agent_id, "Heartbeat sent");
            }
        }
    }
}
