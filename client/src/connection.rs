//! Realtime connection manager.
//!
//! One task owns the session, the timers and the [`ConnectionState`]. Every
//! input (connect requests, app lifecycle, network reachability, transport
//! events) reaches it as a message, so the state is never mutated from two
//! places at once. Callers talk to it through a cloneable
//! [`ConnectionHandle`] and observe it through a `watch` channel.

use crate::auth::AuthToken;
use crate::config::ConnectionConfig;
use crate::error::TransportError;
use crate::now_ms;
use crate::websocket::{ClientMessage, RealtimeTransport, ServerMessage, Session, TransportEvent};
use futures::future::{BoxFuture, FutureExt};
use listsync_engine::{CloseDecision, ConnectionState, ConnectionStatus, DisconnectReason, EntityId};
use rand::Rng;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// An entity change pushed by the server for a subscribed topic.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteUpdate {
    pub entity_type: String,
    pub entity_id: EntityId,
    /// `null` when the entity was deleted
    pub payload: Value,
}

#[derive(Debug)]
enum Command {
    Connect(AuthToken),
    Disconnect,
    Join(EntityId),
    Leave(EntityId),
    Foreground,
    Background,
    NetworkChanged(bool),
    AuthFailed(String),
}

/// Cheap, cloneable access to a running connection manager.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    updates: broadcast::Sender<RemoteUpdate>,
}

impl ConnectionHandle {
    fn send(&self, command: Command) {
        if let Err(e) = self.commands.send(command) {
            tracing::debug!(command = ?e.0, "Connection manager is not running");
        }
    }

    /// Connect with `token`. Clears a terminal error.
    pub fn connect(&self, token: AuthToken) {
        self.send(Command::Connect(token));
    }

    /// Close the session on purpose; no reconnect follows.
    pub fn disconnect(&self) {
        self.send(Command::Disconnect);
    }

    /// Subscribe to pushed updates for a list. Idempotent.
    pub fn join_list(&self, id: impl Into<EntityId>) {
        self.send(Command::Join(id.into()));
    }

    pub fn leave_list(&self, id: impl Into<EntityId>) {
        self.send(Command::Leave(id.into()));
    }

    pub fn handle_foreground(&self) {
        self.send(Command::Foreground);
    }

    /// Drop the transport but keep topic subscriptions for the next connect.
    pub fn handle_background(&self) {
        self.send(Command::Background);
    }

    pub fn set_network_available(&self, available: bool) {
        self.send(Command::NetworkChanged(available));
    }

    /// Credentials were rejected somewhere else (e.g. by the remote API).
    pub fn auth_failed(&self, reason: impl Into<String>) {
        self.send(Command::AuthFailed(reason.into()));
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.borrow().status
    }

    pub fn is_online(&self) -> bool {
        self.state.borrow().is_connected()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn remote_updates(&self) -> broadcast::Receiver<RemoteUpdate> {
        self.updates.subscribe()
    }
}

/// Owns the connection task.
pub struct ConnectionManager {
    handle: ConnectionHandle,
    actor: Option<Actor>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig, transport: Arc<dyn RealtimeTransport>) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::new());
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let actor = Actor {
            config,
            transport,
            commands: commands_rx,
            state_tx,
            updates: updates.clone(),
            cancel: cancel.clone(),
            state: ConnectionState::new(),
            token: None,
            session: None,
            joined: BTreeSet::new(),
            pending_joins: BTreeSet::new(),
            network_available: true,
            connecting: None,
            reconnect_at: None,
            ping_at: None,
            pong_deadline: None,
        };

        Self {
            handle: ConnectionHandle {
                commands: commands_tx,
                state: state_rx,
                updates,
            },
            actor: Some(actor),
            cancel,
            task: None,
        }
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// Spawn the connection task. Calling it twice is a no-op.
    pub fn start(&mut self) {
        if let Some(actor) = self.actor.take() {
            self.task = Some(tokio::spawn(actor.run()));
        }
    }

    /// Stop the task and close any open session.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!("Connection task ended abnormally: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.handle.state())
            .field("running", &self.task.is_some())
            .finish()
    }
}

/// How a connect attempt ended.
enum AttemptOutcome {
    Opened(Session),
    ProbeFailed(String),
    OpenFailed(TransportError),
    TimedOut,
}

struct Actor {
    config: ConnectionConfig,
    transport: Arc<dyn RealtimeTransport>,
    commands: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
    updates: broadcast::Sender<RemoteUpdate>,
    cancel: CancellationToken,
    state: ConnectionState,
    token: Option<AuthToken>,
    session: Option<Session>,
    /// Topics the server confirmed (the join was sent on a live session)
    joined: BTreeSet<EntityId>,
    /// Topics requested while no session was up
    pending_joins: BTreeSet<EntityId>,
    network_available: bool,
    /// The connect attempt in flight. Dropping it abandons the attempt.
    connecting: Option<BoxFuture<'static, AttemptOutcome>>,
    reconnect_at: Option<Instant>,
    ping_at: Option<Instant>,
    pong_deadline: Option<Instant>,
}

impl Actor {
    async fn run(mut self) {
        let cancel = self.cancel.clone();
        loop {
            let reconnect_at = self.reconnect_at;
            let ping_at = self.ping_at;
            let pong_deadline = self.pong_deadline;

            tokio::select! {
                _ = cancel.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                outcome = next_outcome(&mut self.connecting) => {
                    self.connecting = None;
                    self.finish_connect(outcome);
                }
                event = next_event(&mut self.session) => self.handle_event(event),
                _ = sleep_until(reconnect_at) => {
                    self.reconnect_at = None;
                    self.begin_attempt(false);
                }
                _ = sleep_until(ping_at) => self.send_ping(),
                _ = sleep_until(pong_deadline) => {
                    tracing::warn!("No pong within {:?}, dropping stale connection", self.config.pong_timeout);
                    self.drop_session();
                    self.on_close(DisconnectReason::PingTimeout);
                }
            }
        }

        self.connecting = None;
        self.drop_session();
        tracing::info!("Connection manager stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(token) => {
                self.token = Some(token);
                if self.state.is_connected() {
                    tracing::debug!("Already connected, token updated");
                    return;
                }
                self.reconnect_at = None;
                self.state.reset_for_connect();
                self.begin_attempt(true);
            }
            Command::Disconnect => {
                self.token = None;
                self.stay_down(DisconnectReason::ClientDisconnect);
            }
            Command::Join(topic) => self.join(topic),
            Command::Leave(topic) => {
                self.pending_joins.remove(&topic);
                if self.joined.remove(&topic) {
                    if let Some(session) = &self.session {
                        let _ = session.send(ClientMessage::Leave { topic });
                    }
                }
            }
            Command::Foreground => {
                self.state.app_foreground = true;
                self.publish();
                if self.state.status == ConnectionStatus::Disconnected && !self.state.is_reconnecting {
                    self.fresh_connect();
                }
            }
            Command::Background => {
                self.state.app_foreground = false;
                self.stay_down(DisconnectReason::Background);
            }
            Command::NetworkChanged(available) => {
                let restored = available && !self.network_available;
                self.network_available = available;
                if !available {
                    self.stay_down(DisconnectReason::NetworkUnavailable);
                } else if restored
                    && self.state.app_foreground
                    && self.state.status == ConnectionStatus::Disconnected
                {
                    self.fresh_connect();
                }
            }
            Command::AuthFailed(reason) => {
                tracing::error!(%reason, "Authentication failed, halting connection");
                self.token = None;
                self.connecting = None;
                self.drop_session();
                self.reconnect_at = None;
                self.state.fail(format!("authentication failed: {reason}"));
                self.publish();
            }
        }
    }

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Message(ServerMessage::Pong) => {
                self.pong_deadline = None;
                self.ping_at = Some(Instant::now() + self.config.ping_interval);
            }
            TransportEvent::Message(ServerMessage::EntityUpdated {
                entity_type,
                entity_id,
                payload,
            }) => {
                if !self.joined.contains(&entity_id) {
                    tracing::debug!(entity_id = %entity_id, "Ignoring update for unsubscribed topic");
                    return;
                }
                let _ = self.updates.send(RemoteUpdate {
                    entity_type,
                    entity_id,
                    payload,
                });
            }
            TransportEvent::Message(ServerMessage::Error { message }) => {
                tracing::warn!(%message, "Realtime server reported an error");
            }
            TransportEvent::Closed(reason) => {
                self.session = None;
                self.on_close(reason);
            }
        }
    }

    /// A connect the user (or the host) asked for, as opposed to a scheduled retry.
    fn fresh_connect(&mut self) {
        if self.token.is_none() {
            return;
        }
        self.reconnect_at = None;
        self.state.reset_for_connect();
        self.begin_attempt(true);
    }

    /// Start a connect attempt. The actor keeps serving commands while it
    /// runs, so losing the network or going to the background abandons it.
    fn begin_attempt(&mut self, preflight: bool) {
        let Some(token) = self.token.clone() else {
            return;
        };
        if !self.network_available {
            tracing::debug!("No network path, not connecting");
            self.connecting = None;
            self.state.park(DisconnectReason::NetworkUnavailable);
            self.publish();
            return;
        }
        if let Err(e) = token.validate(now_ms()) {
            self.connecting = None;
            self.state.fail(e.to_string());
            self.publish();
            return;
        }

        self.drop_session();
        self.state.begin_connect();
        self.publish();
        tracing::info!(attempt = self.state.attempt, "Connecting to realtime endpoint");

        self.connecting = Some(connect_attempt(
            self.transport.clone(),
            token,
            self.config.probe_timeout,
            self.config.connect_timeout,
            preflight,
        ));
    }

    fn finish_connect(&mut self, outcome: AttemptOutcome) {
        match outcome {
            AttemptOutcome::Opened(session) => self.on_open(session),
            AttemptOutcome::ProbeFailed(failure) => {
                tracing::error!(error = %failure, "Pre-flight health check failed");
                self.state.fail(format!("pre-flight health check failed: {failure}"));
                self.publish();
            }
            AttemptOutcome::OpenFailed(TransportError::Unauthorized) => {
                tracing::error!("Realtime endpoint rejected the token");
                self.token = None;
                self.state.fail(TransportError::Unauthorized.to_string());
                self.publish();
            }
            AttemptOutcome::OpenFailed(e) => {
                tracing::warn!(error = %e, "Failed to open realtime session");
                self.on_close(DisconnectReason::TransportError);
            }
            AttemptOutcome::TimedOut => {
                tracing::warn!(timeout = ?self.config.connect_timeout, "Realtime connect timed out");
                self.on_close(DisconnectReason::ConnectTimeout);
            }
        }
    }

    fn on_open(&mut self, session: Session) {
        self.state.opened(now_ms());

        let topics: Vec<EntityId> = self
            .joined
            .union(&self.pending_joins)
            .cloned()
            .collect();
        self.joined.clear();
        self.pending_joins.clear();
        for topic in topics {
            match session.send(ClientMessage::Join {
                topic: topic.clone(),
            }) {
                Ok(()) => self.joined.insert(topic),
                Err(_) => self.pending_joins.insert(topic),
            };
        }

        self.session = Some(session);
        self.ping_at = Some(Instant::now() + self.config.ping_interval);
        self.pong_deadline = None;
        self.publish();
        tracing::info!(topics = self.joined.len(), "Realtime connection established");
    }

    fn on_close(&mut self, reason: DisconnectReason) {
        self.ping_at = None;
        self.pong_deadline = None;

        let jitter = self.jitter();
        let decision = self.state.closed(
            reason,
            &self.config.budgets,
            &self.config.backoff,
            jitter,
        );
        match decision {
            CloseDecision::Stay => {
                tracing::info!(%reason, "Realtime connection closed");
            }
            CloseDecision::Reconnect { attempt, delay } => {
                tracing::warn!(%reason, attempt, ?delay, "Realtime connection lost, scheduling reconnect");
                self.reconnect_at = Some(Instant::now() + delay);
            }
            CloseDecision::GiveUp => {
                tracing::error!(%reason, "Realtime retry budget exhausted");
                self.reconnect_at = None;
            }
        }
        self.publish();
    }

    /// Drop the session (if any) and any scheduled reconnect, and stay down.
    fn stay_down(&mut self, reason: DisconnectReason) {
        self.reconnect_at = None;
        if self.connecting.take().is_some() {
            tracing::info!(%reason, "Connect attempt abandoned");
        }
        if self.session.is_some() {
            self.drop_session();
            self.on_close(reason);
        } else if matches!(
            self.state.status,
            ConnectionStatus::Disconnected | ConnectionStatus::Connecting
        ) {
            self.state.park(reason);
            self.publish();
        }
    }

    fn join(&mut self, topic: EntityId) {
        if self.joined.contains(&topic) || self.pending_joins.contains(&topic) {
            return;
        }
        let sent = match &self.session {
            Some(session) if self.state.is_connected() => session
                .send(ClientMessage::Join {
                    topic: topic.clone(),
                })
                .is_ok(),
            _ => false,
        };
        if sent {
            self.joined.insert(topic);
        } else {
            tracing::debug!(topic = %topic, "Queued topic join until connected");
            self.pending_joins.insert(topic);
        }
    }

    fn send_ping(&mut self) {
        self.ping_at = None;
        let sent = self
            .session
            .as_ref()
            .map(|session| session.send(ClientMessage::Ping).is_ok())
            .unwrap_or(false);
        if sent {
            self.pong_deadline = Some(Instant::now() + self.config.pong_timeout);
        } else {
            self.drop_session();
            self.on_close(DisconnectReason::TransportError);
        }
    }

    fn drop_session(&mut self) {
        self.session = None;
        self.ping_at = None;
        self.pong_deadline = None;
    }

    fn jitter(&self) -> Duration {
        let max = u64::try_from(self.config.max_jitter.as_millis()).unwrap_or(u64::MAX);
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.state.clone());
    }
}

fn connect_attempt(
    transport: Arc<dyn RealtimeTransport>,
    token: AuthToken,
    probe_timeout: Duration,
    connect_timeout: Duration,
    preflight: bool,
) -> BoxFuture<'static, AttemptOutcome> {
    async move {
        if preflight {
            match tokio::time::timeout(probe_timeout, transport.probe()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return AttemptOutcome::ProbeFailed(e.to_string()),
                Err(_) => {
                    return AttemptOutcome::ProbeFailed(format!(
                        "health check timed out after {probe_timeout:?}"
                    ))
                }
            }
        }
        match tokio::time::timeout(connect_timeout, transport.open(&token)).await {
            Ok(Ok(session)) => AttemptOutcome::Opened(session),
            Ok(Err(e)) => AttemptOutcome::OpenFailed(e),
            Err(_) => AttemptOutcome::TimedOut,
        }
    }
    .boxed()
}

async fn next_outcome(attempt: &mut Option<BoxFuture<'static, AttemptOutcome>>) -> AttemptOutcome {
    match attempt {
        Some(attempt) => attempt.await,
        None => std::future::pending().await,
    }
}

async fn next_event(session: &mut Option<Session>) -> TransportEvent {
    match session {
        Some(session) => session.next_event().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
