// ABOUTME: Router actor: the single owner of the agent registry and connection table.
// ABOUTME: Connections and in-process callers reach it only through its command channel.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use convoke_correlator::{Correlator, CorrelatorStats};
use convoke_proto::{Envelope, ErrorKind, ErrorPayload, MessageType, StreamSender};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RouterConfig;
use crate::error::{RegistrationError, RouterError, RoutingError};
use crate::registry::{AgentIdentity, ConnectionId, ConnectionState, Liveness, Registry};

/// Commands accepted by the router actor.
pub enum RouterCommand {
    /// A new connection; replies with its id.
    Open {
        sender: StreamSender<Envelope>,
        cancel: CancellationToken,
        reply: oneshot::Sender<ConnectionId>,
    },
    /// A validated envelope read from a connection.
    Inbound {
        conn: ConnectionId,
        envelope: Envelope,
    },
    /// The connection's read side has ended.
    Disconnect { conn: ConnectionId },
    /// A task submitted in-process rather than over a socket.
    Submit {
        envelope: Envelope,
        reply: oneshot::Sender<Result<Envelope, RouterError>>,
    },
    Agents {
        reply: oneshot::Sender<Vec<AgentIdentity>>,
    },
    Stats {
        reply: oneshot::Sender<RouterStats>,
    },
    Shutdown,
}

/// Snapshot of router activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterStats {
    pub connections: usize,
    pub agents: usize,
    pub parked: usize,
    pub correlator: CorrelatorStats,
}

/// Cloneable handle to a running router.
#[derive(Clone)]
pub struct RouterHandle {
    tx: mpsc::Sender<RouterCommand>,
}

impl RouterHandle {
    pub async fn open(
        &self,
        sender: StreamSender<Envelope>,
        cancel: CancellationToken,
    ) -> Result<ConnectionId, RouterError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RouterCommand::Open {
                sender,
                cancel,
                reply,
            })
            .await
            .map_err(|_| RouterError::Closed)?;
        rx.await.map_err(|_| RouterError::Closed)
    }

    pub async fn inbound(&self, conn: ConnectionId, envelope: Envelope) -> Result<(), RouterError> {
        self.tx
            .send(RouterCommand::Inbound { conn, envelope })
            .await
            .map_err(|_| RouterError::Closed)
    }

    pub async fn disconnect(&self, conn: ConnectionId) {
        let _ = self.tx.send(RouterCommand::Disconnect { conn }).await;
    }

    /// Every registered agent, in registration order.
    pub async fn agents(&self) -> Result<Vec<AgentIdentity>, RouterError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RouterCommand::Agents { reply })
            .await
            .map_err(|_| RouterError::Closed)?;
        rx.await.map_err(|_| RouterError::Closed)
    }

    pub async fn stats(&self) -> Result<RouterStats, RouterError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RouterCommand::Stats { reply })
            .await
            .map_err(|_| RouterError::Closed)?;
        rx.await.map_err(|_| RouterError::Closed)
    }

    /// Route a task and wait for the agent's reply.
    ///
    /// Routing failures come back as [`RouterError::Routing`]; error replies
    /// from the agent as [`RouterError::Remote`].
    pub async fn request(
        &self,
        envelope: Envelope,
        timeout: Duration,
    ) -> Result<Envelope, RouterError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RouterCommand::Submit { envelope, reply })
            .await
            .map_err(|_| RouterError::Closed)?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RouterError::Closed),
            Err(_) => Err(RouterError::Timeout(timeout)),
        }
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(RouterCommand::Shutdown).await;
    }
}

/// Where the outcome of a routed task goes.
enum ReplyTo {
    Link(StreamSender<Envelope>),
    Local(oneshot::Sender<Result<Envelope, RouterError>>),
}

impl ReplyTo {
    async fn respond(
        self,
        task_id: Option<String>,
        result: Result<Envelope, RouterError>,
        agent_id: Option<String>,
    ) {
        match self {
            ReplyTo::Local(reply) => {
                let _ = reply.send(result);
            }
            ReplyTo::Link(sender) => {
                let envelope = match result {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        let envelope = Envelope::error(task_id, e.to_payload());
                        match agent_id {
                            Some(agent) => envelope.from_agent(agent),
                            None => envelope,
                        }
                    }
                };
                if sender.send(envelope).await.is_err() {
                    debug!("Origin gone before reply could be relayed");
                }
            }
        }
    }

    /// Respond from inside the actor without awaiting.
    fn respond_now(self, task_id: Option<String>, error: RouterError) {
        match self {
            ReplyTo::Local(reply) => {
                let _ = reply.send(Err(error));
            }
            ReplyTo::Link(sender) => push(&sender, Envelope::error(task_id, error.to_payload())),
        }
    }
}

/// A task waiting for a matching agent to become ready.
struct Parked {
    envelope: Envelope,
    origin: Option<ConnectionId>,
    reply_to: ReplyTo,
    deadline: Instant,
}

struct Connection {
    sender: StreamSender<Envelope>,
    cancel: CancellationToken,
    state: ConnectionState,
    agent_id: Option<String>,
}

impl Connection {
    fn set_state(&mut self, next: ConnectionState) {
        if let Err(e) = self.state.transition(next) {
            warn!(error = %e, agent_id = ?self.agent_id, "Connection state not changed");
        }
    }
}

/// Queue `envelope` on a connection without suspending the actor.
///
/// Control replies go out in the order the actor produced them; only a full
/// buffer falls back to a spawned send.
fn push(sender: &StreamSender<Envelope>, envelope: Envelope) {
    if sender.is_closed() {
        return;
    }
    if sender.try_send(envelope.clone()).is_err() {
        let sender = sender.clone();
        tokio::spawn(async move {
            let _ = sender.send(envelope).await;
        });
    }
}

/// Human-readable destination of a task, used in routing errors.
fn destination(envelope: &Envelope) -> String {
    if let Some(target) = &envelope.target_agent_id {
        return target.clone();
    }
    match (&envelope.agent_type, &envelope.action) {
        (Some(agent_type), Some(action)) => format!("{}/{}", agent_type, action),
        (Some(agent_type), None) => agent_type.clone(),
        _ => "unaddressed task".to_string(),
    }
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// The router actor.
pub struct Router {
    config: RouterConfig,
    registry: Registry,
    connections: HashMap<ConnectionId, Connection>,
    parked: VecDeque<Parked>,
    correlator: Arc<Correlator>,
    /// Connection that submitted each dispatched task; only it may cancel.
    origins: HashMap<String, ConnectionId>,
    /// Routed tasks report here once their reply has been relayed.
    settled: Option<mpsc::UnboundedSender<String>>,
    next_conn: ConnectionId,
}

impl Router {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            registry: Registry::new(),
            connections: HashMap::new(),
            parked: VecDeque::new(),
            correlator: Arc::new(Correlator::new()),
            origins: HashMap::new(),
            settled: None,
            next_conn: 1,
        }
    }

    /// Start the actor on its own task.
    pub fn spawn(config: RouterConfig) -> (RouterHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.command_buffer.max(1));
        let router = Router::new(config);
        let task = tokio::spawn(router.run(rx));
        (RouterHandle { tx }, task)
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<RouterCommand>) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let (settled_tx, mut settled) = mpsc::unbounded_channel();
        self.settled = Some(settled_tx);

        loop {
            let next_expiry = self.parked.iter().map(|p| p.deadline).min();
            tokio::select! {
                command = rx.recv() => match command {
                    Some(RouterCommand::Shutdown) | None => break,
                    Some(command) => self.handle(command),
                },
                Some(task_id) = settled.recv() => {
                    self.origins.remove(&task_id);
                }
                _ = sweep.tick() => self.sweep(),
                _ = sleep_until_some(next_expiry) => self.expire_parked(),
            }
        }

        info!(
            connections = self.connections.len(),
            parked = self.parked.len(),
            "Router stopping"
        );
        for parked in self.parked.drain(..) {
            let error = RouterError::Remote {
                kind: ErrorKind::ShuttingDown,
                message: "router is shutting down".to_string(),
            };
            parked.reply_to.respond_now(parked.envelope.task_id, error);
        }
        for conn in self.connections.values() {
            conn.cancel.cancel();
        }
    }

    fn handle(&mut self, command: RouterCommand) {
        match command {
            RouterCommand::Open {
                sender,
                cancel,
                reply,
            } => {
                let id = self.next_conn;
                self.next_conn += 1;
                self.connections.insert(
                    id,
                    Connection {
                        sender,
                        cancel,
                        state: ConnectionState::Connecting,
                        agent_id: None,
                    },
                );
                debug!(conn = id, "Connection opened");
                let _ = reply.send(id);
            }
            RouterCommand::Inbound { conn, envelope } => self.inbound(conn, envelope),
            RouterCommand::Disconnect { conn } => self.disconnect(conn),
            RouterCommand::Submit { envelope, reply } => {
                if let Err(e) = envelope.validate() {
                    let _ = reply.send(Err(RouterError::Remote {
                        kind: ErrorKind::InvalidEnvelope,
                        message: e.to_string(),
                    }));
                    return;
                }
                self.route(envelope, None, ReplyTo::Local(reply));
            }
            RouterCommand::Agents { reply } => {
                let _ = reply.send(self.registry.identities());
            }
            RouterCommand::Stats { reply } => {
                let _ = reply.send(RouterStats {
                    connections: self.connections.len(),
                    agents: self.registry.len(),
                    parked: self.parked.len(),
                    correlator: self.correlator.stats(),
                });
            }
            RouterCommand::Shutdown => {}
        }
    }

    fn inbound(&mut self, conn: ConnectionId, envelope: Envelope) {
        let Some(sender) = self.connections.get(&conn).map(|c| c.sender.clone()) else {
            debug!(conn, kind = %envelope.kind, "Envelope from closed connection ignored");
            return;
        };

        match envelope.kind {
            MessageType::AgentRegister => self.register(conn, &sender, envelope),
            MessageType::Heartbeat => self.heartbeat(conn, &sender),
            MessageType::AgentUnregister => self.unregister(conn, &sender),
            MessageType::TaskSubmit | MessageType::ResearchAction => {
                self.route(envelope, Some(conn), ReplyTo::Link(sender))
            }
            MessageType::TaskResult | MessageType::Error => self.on_reply(conn, envelope),
            MessageType::TaskCancel => self.cancel(conn, envelope),
            MessageType::RegistrationConfirmed | MessageType::HeartbeatAck => {
                debug!(conn, kind = %envelope.kind, "Unexpected envelope ignored");
            }
        }
    }

    fn register(&mut self, conn: ConnectionId, sender: &StreamSender<Envelope>, envelope: Envelope) {
        match self.try_register(conn, &envelope) {
            Ok(agent_id) => {
                push(sender, Envelope::registration_confirmed(agent_id));
                self.drain_parked();
            }
            Err(e) => {
                warn!(conn, agent_id = ?envelope.agent_id, error = %e, "Registration rejected");
                push(sender, Envelope::error(None, e.to_payload()));
            }
        }
    }

    fn try_register(
        &mut self,
        conn: ConnectionId,
        envelope: &Envelope,
    ) -> Result<String, RegistrationError> {
        let agent_id = envelope
            .agent_id
            .clone()
            .ok_or_else(|| RegistrationError::Malformed("missing agent_id".to_string()))?;
        let agent_type = envelope
            .agent_type
            .clone()
            .ok_or_else(|| RegistrationError::Malformed("missing agent_type".to_string()))?;
        let payload = envelope
            .register_payload()
            .map_err(|e| RegistrationError::Malformed(e.to_string()))?;
        payload
            .check_capabilities()
            .map_err(|e| RegistrationError::Malformed(e.to_string()))?;

        let Some(connection) = self.connections.get_mut(&conn) else {
            return Err(RegistrationError::NotRegistered);
        };
        if let Some(current) = &connection.agent_id {
            if *current == agent_id {
                debug!(agent_id = %agent_id, "Repeated registration confirmed");
                return Ok(agent_id);
            }
            return Err(RegistrationError::IdChanged {
                current: current.clone(),
                requested: agent_id,
            });
        }

        let identity = AgentIdentity::new(agent_id.clone(), agent_type.clone(), payload.capabilities);
        self.registry.insert(identity, conn, Instant::now())?;
        connection.agent_id = Some(agent_id.clone());
        connection.set_state(ConnectionState::Registered);
        connection.set_state(ConnectionState::Active);
        info!(agent_id = %agent_id, agent_type = %agent_type, conn, "Agent registered");
        Ok(agent_id)
    }

    fn heartbeat(&mut self, conn: ConnectionId, sender: &StreamSender<Envelope>) {
        let agent_id = self.connections.get(&conn).and_then(|c| c.agent_id.clone());
        let Some(agent_id) = agent_id else {
            push(
                sender,
                Envelope::error(None, RegistrationError::NotRegistered.to_payload()),
            );
            return;
        };

        let previous = self.registry.touch(&agent_id, Instant::now());
        if previous == Some(Liveness::Degraded) {
            info!(agent_id = %agent_id, "Agent recovered");
            if let Some(connection) = self.connections.get_mut(&conn) {
                connection.set_state(ConnectionState::Active);
            }
        }
        push(sender, Envelope::heartbeat_ack(agent_id));
        if previous == Some(Liveness::Degraded) {
            self.drain_parked();
        }
    }

    fn unregister(&mut self, conn: ConnectionId, sender: &StreamSender<Envelope>) {
        let agent_id = self.connections.get(&conn).and_then(|c| c.agent_id.clone());
        let Some(agent_id) = agent_id else {
            push(
                sender,
                Envelope::error(None, RegistrationError::NotRegistered.to_payload()),
            );
            return;
        };
        info!(agent_id = %agent_id, "Agent unregistered");
        self.forget_agent(&agent_id);
        if let Some(connection) = self.connections.get_mut(&conn) {
            connection.set_state(ConnectionState::Disconnected);
            connection.cancel.cancel();
        }
    }

    /// Remove an agent and fail everything still waiting on it.
    fn forget_agent(&mut self, agent_id: &str) {
        if self.registry.remove(agent_id).is_some() {
            let failed = self.correlator.fail_target(agent_id);
            if failed > 0 {
                info!(agent_id = %agent_id, failed, "Failed requests pending on agent");
            }
        }
    }

    /// Agent to deliver `envelope` to, if one is ready.
    fn pick(&mut self, envelope: &Envelope) -> Option<String> {
        if let Some(target) = &envelope.target_agent_id {
            if self.registry.is_live(target) {
                return Some(target.clone());
            }
        }
        let agent_type = envelope.agent_type.as_deref()?;
        self.registry.select(agent_type, envelope.action.as_deref())
    }

    fn route(&mut self, envelope: Envelope, origin: Option<ConnectionId>, reply_to: ReplyTo) {
        if envelope.target_agent_id.is_none() && envelope.agent_type.is_none() {
            reply_to.respond_now(envelope.task_id, RoutingError::NoDestination.into());
            return;
        }

        if let Some(agent_id) = self.pick(&envelope) {
            self.dispatch(agent_id, envelope, origin, reply_to);
            return;
        }

        if self.config.queue_window.is_zero() {
            let error = RoutingError::NoAgentAvailable(destination(&envelope));
            reply_to.respond_now(envelope.task_id, error.into());
            return;
        }

        debug!(task_id = ?envelope.task_id, destination = %destination(&envelope), "Parking task");
        self.parked.push_back(Parked {
            envelope,
            origin,
            reply_to,
            deadline: Instant::now() + self.config.queue_window,
        });
    }

    fn dispatch(
        &mut self,
        agent_id: String,
        envelope: Envelope,
        origin: Option<ConnectionId>,
        reply_to: ReplyTo,
    ) {
        let sender = self
            .registry
            .connection_of(&agent_id)
            .and_then(|conn| self.connections.get(&conn))
            .map(|c| c.sender.clone());
        let Some(sender) = sender else {
            let error = RoutingError::NoAgentAvailable(destination(&envelope));
            reply_to.respond_now(envelope.task_id, error.into());
            return;
        };

        debug!(task_id = ?envelope.task_id, agent_id = %agent_id, action = ?envelope.action, "Routing task");
        if let (Some(origin), Some(task_id)) = (origin, envelope.task_id.clone()) {
            self.origins.insert(task_id, origin);
        }
        let correlator = Arc::clone(&self.correlator);
        let timeout = self.config.task_timeout;
        let settled = self.settled.clone();
        tokio::spawn(async move {
            let task_id = envelope.task_id.clone();
            let result = correlator
                .send_and_wait_to(Some(agent_id.clone()), &sender, envelope, timeout)
                .await
                .map_err(RouterError::from);
            if let Err(e) = &result {
                debug!(task_id = ?task_id, agent_id = %agent_id, error = %e, "Routed task failed");
            }
            if let (Some(settled), Some(task_id)) = (settled, task_id.clone()) {
                let _ = settled.send(task_id);
            }
            reply_to.respond(task_id, result, Some(agent_id)).await;
        });
    }

    /// Relay a reply, accepted only from the agent the task was routed to.
    fn on_reply(&mut self, conn: ConnectionId, envelope: Envelope) {
        if envelope.task_id.is_none() {
            debug!(conn, payload = %envelope.payload, "Uncorrelated error envelope ignored");
            return;
        }
        let responder = self.connections.get(&conn).and_then(|c| c.agent_id.as_deref());
        self.correlator.on_response_from(responder, envelope);
    }

    /// Cancel a task on behalf of the connection that submitted it.
    fn cancel(&mut self, conn: ConnectionId, envelope: Envelope) {
        let Some(task_id) = envelope.task_id else {
            return;
        };

        if let Some(pos) = self
            .parked
            .iter()
            .position(|p| p.envelope.task_id.as_deref() == Some(task_id.as_str()))
        {
            if self.parked[pos].origin != Some(conn) {
                warn!(conn, task_id = %task_id, "Cancel from a connection that did not submit the task ignored");
                return;
            }
            if let Some(parked) = self.parked.remove(pos) {
                debug!(task_id = %task_id, "Parked task cancelled");
                let error = RouterError::Remote {
                    kind: ErrorKind::Cancelled,
                    message: "task cancelled before dispatch".to_string(),
                };
                parked.reply_to.respond_now(Some(task_id), error);
            }
            return;
        }

        match self.origins.get(&task_id) {
            Some(origin) if *origin == conn => {}
            Some(_) => {
                warn!(conn, task_id = %task_id, "Cancel from a connection that did not submit the task ignored");
                return;
            }
            None => {
                debug!(task_id = %task_id, "Cancel for unknown task ignored");
                return;
            }
        }

        let sender = self
            .correlator
            .target_of(&task_id)
            .and_then(|agent| self.registry.connection_of(&agent))
            .and_then(|conn| self.connections.get(&conn))
            .map(|c| c.sender.clone());
        match sender {
            Some(sender) => push(&sender, Envelope::cancel(task_id)),
            None => debug!(task_id = %task_id, "Cancel for unknown task ignored"),
        }
    }

    fn drain_parked(&mut self) {
        if self.parked.is_empty() {
            return;
        }
        let waiting = std::mem::take(&mut self.parked);
        for parked in waiting {
            match self.pick(&parked.envelope) {
                Some(agent_id) => {
                    self.dispatch(agent_id, parked.envelope, parked.origin, parked.reply_to)
                }
                None => self.parked.push_back(parked),
            }
        }
    }

    fn expire_parked(&mut self) {
        let now = Instant::now();
        let waiting = std::mem::take(&mut self.parked);
        for parked in waiting {
            if parked.deadline > now {
                self.parked.push_back(parked);
                continue;
            }
            let label = destination(&parked.envelope);
            debug!(task_id = ?parked.envelope.task_id, destination = %label, "Parked task expired");
            parked
                .reply_to
                .respond_now(parked.envelope.task_id, RoutingError::NoAgentAvailable(label).into());
        }
    }

    fn sweep(&mut self) {
        let changes = self.registry.sweep(Instant::now(), &self.config);
        for change in changes {
            match change.to {
                Liveness::Degraded => {
                    warn!(agent_id = %change.agent_id, "Agent missed heartbeats, degraded");
                    if let Some(connection) = self.connection_of_agent(&change.agent_id) {
                        connection.set_state(ConnectionState::Degraded);
                    }
                }
                Liveness::Evicted => self.evict(&change.agent_id),
                Liveness::Active => {}
            }
        }
    }

    fn connection_of_agent(&mut self, agent_id: &str) -> Option<&mut Connection> {
        let conn = self.registry.connection_of(agent_id)?;
        self.connections.get_mut(&conn)
    }

    fn evict(&mut self, agent_id: &str) {
        warn!(agent_id = %agent_id, "Agent evicted");
        if let Some(connection) = self.connection_of_agent(agent_id) {
            let notice = Envelope::error(
                None,
                ErrorPayload::new(
                    ErrorKind::LivenessError,
                    format!("agent {} evicted after missed heartbeats", agent_id),
                ),
            );
            push(&connection.sender, notice);
            connection.set_state(ConnectionState::Disconnected);
            connection.cancel.cancel();
        }
        self.forget_agent(agent_id);
    }

    fn disconnect(&mut self, conn: ConnectionId) {
        let Some(mut connection) = self.connections.remove(&conn) else {
            return;
        };
        if connection.state != ConnectionState::Disconnected {
            connection.set_state(ConnectionState::Disconnected);
        }
        if let Some(agent_id) = &connection.agent_id {
            if self.registry.connection_of(agent_id) == Some(conn) {
                info!(agent_id = %agent_id, "Agent disconnected");
                self.forget_agent(agent_id);
            }
        }
        self.parked.retain(|p| p.origin != Some(conn));
        self.origins.retain(|_, origin| *origin != conn);
        debug!(conn, "Connection closed");
    }
}
