//! Session event loop.
//!
//! One tokio task per session owns the reconciler and presence tracker.
//! Local actions, remote change events, write outcomes, heartbeat ticks and
//! reconnect probes are handled one at a time, each to completion, so store
//! mutations are atomic from the session's point of view. Gateway writes run
//! in spawned tasks and report back into the loop.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SelectAll, StreamExt};
use rand::Rng;
use shapeshare_canvas::{Placement, Reorder, ShapeStore, StoreError};
use shapeshare_core::config::{self, Config};
use shapeshare_core::gateway::{
    ChangeEvent, ChangeStream, Collection, GatewayError, PersistenceGateway, RemoteWrite, WriteAck,
};
use shapeshare_core::types::{
    now_millis, Cursor, Position, Presence, Shape, ShapeDraft, ShapeId, ShapePatch, UserId,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::presence::PresenceTracker;
use crate::reconciler::{ConnectionState, Reconciler};

/// Shortest heartbeat or cursor throttle period a session will run with.
const MIN_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub user_id: UserId,
    pub display_name: String,
    pub heartbeat_interval: Duration,
    pub cursor_throttle: Duration,
    pub presence_ttl_ms: i64,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
}

impl SessionConfig {
    pub fn new(user_id: impl Into<UserId>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            heartbeat_interval: Duration::from_millis(config::DEFAULT_HEARTBEAT_INTERVAL_MS),
            cursor_throttle: Duration::from_millis(config::DEFAULT_CURSOR_THROTTLE_MS),
            presence_ttl_ms: config::DEFAULT_PRESENCE_TTL_MS as i64,
            reconnect_min: Duration::from_millis(config::DEFAULT_RECONNECT_MIN_MS),
            reconnect_max: Duration::from_millis(config::DEFAULT_RECONNECT_MAX_MS),
        }
    }

    pub fn from_config(
        config: &Config,
        user_id: impl Into<UserId>,
        display_name: impl Into<String>,
    ) -> Self {
        let (reconnect_min, reconnect_max) = config.reconnect_backoff();
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            cursor_throttle: config.cursor_throttle(),
            presence_ttl_ms: config.presence_ttl_ms(),
            reconnect_min,
            reconnect_max,
            ..Self::new(user_id, display_name)
        }
    }
}

/// A local edit submitted to a session.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalAction {
    Create(ShapeDraft),
    CreateAt {
        draft: ShapeDraft,
        placement: Placement,
    },
    Update {
        id: ShapeId,
        patch: ShapePatch,
    },
    Delete {
        id: ShapeId,
    },
    Reorder {
        id: ShapeId,
        reorder: Reorder,
    },
    Move {
        id: ShapeId,
        placement: Placement,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    Created(Shape),
    Updated(ShapeId),
    Deleted(ShapeId),
    Reordered(ShapeId),
}

/// Other collaborators currently online.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Collaborators {
    pub cursors: Vec<Cursor>,
    pub users: Vec<Presence>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("session closed")]
    Closed,
}

enum Command {
    Apply {
        actions: Vec<LocalAction>,
        reply: oneshot::Sender<Vec<Result<ActionOutcome, StoreError>>>,
    },
    Shapes {
        reply: oneshot::Sender<Vec<Shape>>,
    },
    Collaborators {
        reply: oneshot::Sender<Collaborators>,
    },
    PendingWrites {
        reply: oneshot::Sender<usize>,
    },
    MoveCursor(Position),
    Select(Vec<ShapeId>),
    Shutdown,
}

struct WriteOutcome {
    revision: u64,
    result: Result<WriteAck, GatewayError>,
}

/// Cheap, cloneable handle to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    user_id: UserId,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl SessionHandle {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Apply several actions in one loop turn; they become visible together.
    pub async fn apply(
        &self,
        actions: Vec<LocalAction>,
    ) -> Result<Vec<Result<ActionOutcome, StoreError>>, SessionError> {
        self.request(|reply| Command::Apply { actions, reply }).await
    }

    async fn apply_one(&self, action: LocalAction) -> Result<ActionOutcome, SessionError> {
        self.apply(vec![action])
            .await?
            .pop()
            .ok_or(SessionError::Closed)?
            .map_err(SessionError::from)
    }

    pub async fn create(&self, draft: ShapeDraft) -> Result<Shape, SessionError> {
        match self.apply_one(LocalAction::Create(draft)).await? {
            ActionOutcome::Created(shape) => Ok(shape),
            _ => Err(SessionError::Closed),
        }
    }

    pub async fn update(&self, id: impl Into<ShapeId>, patch: ShapePatch) -> Result<(), SessionError> {
        let id = id.into();
        self.apply_one(LocalAction::Update { id, patch }).await.map(|_| ())
    }

    pub async fn delete(&self, id: impl Into<ShapeId>) -> Result<(), SessionError> {
        let id = id.into();
        self.apply_one(LocalAction::Delete { id }).await.map(|_| ())
    }

    pub async fn reorder(&self, id: impl Into<ShapeId>, reorder: Reorder) -> Result<(), SessionError> {
        let id = id.into();
        self.apply_one(LocalAction::Reorder { id, reorder })
            .await
            .map(|_| ())
    }

    /// Current view, front first.
    pub async fn shapes(&self) -> Result<Vec<Shape>, SessionError> {
        self.request(|reply| Command::Shapes { reply }).await
    }

    pub async fn collaborators(&self) -> Result<Collaborators, SessionError> {
        self.request(|reply| Command::Collaborators { reply }).await
    }

    /// Local writes not yet acknowledged by the gateway.
    pub async fn pending_writes(&self) -> Result<usize, SessionError> {
        self.request(|reply| Command::PendingWrites { reply }).await
    }

    pub fn move_cursor(&self, position: Position) -> Result<(), SessionError> {
        self.commands
            .send(Command::MoveCursor(position))
            .map_err(|_| SessionError::Closed)
    }

    pub fn select(&self, selection: Vec<ShapeId>) -> Result<(), SessionError> {
        self.commands
            .send(Command::Select(selection))
            .map_err(|_| SessionError::Closed)
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Ask the loop to stop. Pending writes that were not flushed are lost.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

/// Start a session on its own task.
pub fn spawn_session(
    gateway: Arc<dyn PersistenceGateway>,
    mut config: SessionConfig,
) -> (SessionHandle, JoinHandle<()>) {
    config.heartbeat_interval = config.heartbeat_interval.max(MIN_PERIOD);
    config.cursor_throttle = config.cursor_throttle.max(MIN_PERIOD);
    let reconciler = Reconciler::new(ShapeStore::new(config.user_id.clone()));
    let presence = PresenceTracker::new(
        config.user_id.clone(),
        config.display_name.clone(),
        config.presence_ttl_ms,
        config.cursor_throttle,
    );
    let (commands_tx, commands) = mpsc::unbounded_channel();
    let (outcomes_tx, outcomes) = mpsc::unbounded_channel();

    let handle = SessionHandle {
        user_id: config.user_id.clone(),
        commands: commands_tx,
        state: reconciler.subscribe_state(),
    };

    let task = SessionTask {
        gateway,
        config,
        reconciler,
        presence,
        commands,
        outcomes_tx,
        outcomes,
        streams: None,
        reconnect_at: None,
        attempt: 0,
        connected_once: false,
    };

    (handle, tokio::spawn(task.run()))
}

/// Reconnect delay: exponential from `min`, capped at `max`, with jitter
/// in the upper half.
pub fn reconnect_delay(attempt: u32, min: Duration, max: Duration) -> Duration {
    let base = min
        .saturating_mul(1u32 << attempt.min(16))
        .min(max)
        .max(min);
    let half = base.as_millis() as u64 / 2;
    let jitter = rand::rng().random_range(0..=half);
    Duration::from_millis(half + jitter)
}

struct SessionTask {
    gateway: Arc<dyn PersistenceGateway>,
    config: SessionConfig,
    reconciler: Reconciler,
    presence: PresenceTracker,
    commands: mpsc::UnboundedReceiver<Command>,
    outcomes_tx: mpsc::UnboundedSender<WriteOutcome>,
    outcomes: mpsc::UnboundedReceiver<WriteOutcome>,
    streams: Option<SelectAll<ChangeStream>>,
    reconnect_at: Option<Instant>,
    attempt: u32,
    connected_once: bool,
}

async fn next_event(streams: &mut Option<SelectAll<ChangeStream>>) -> Option<ChangeEvent> {
    match streams {
        Some(streams) => streams.next().await,
        None => futures::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}

impl SessionTask {
    async fn run(mut self) {
        info!(user_id = %self.config.user_id, "Session started");
        self.connect().await;

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let reconnect_at = self.reconnect_at;
            let trailing_at = self.presence.trailing_deadline();

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(outcome) = self.outcomes.recv() => self.handle_outcome(outcome),
                event = next_event(&mut self.streams) => match event {
                    Some(event) => self.handle_remote(event),
                    None => self.on_connection_lost("change stream ended"),
                },
                _ = heartbeat.tick() => self.publish_heartbeat(),
                _ = sleep_until(reconnect_at) => self.connect().await,
                _ = sleep_until(trailing_at) => self.flush_cursor(),
            }

            self.pump();
        }

        if let Some(streams) = self.streams.take() {
            for stream in streams.iter() {
                stream.unsubscribe();
            }
        }
        info!(
            user_id = %self.config.user_id,
            unflushed = self.reconciler.pending_len(),
            "Session stopped"
        );
    }

    async fn connect(&mut self) {
        self.reconnect_at = None;
        match self.subscribe_and_resync().await {
            Ok(()) => {
                info!(
                    user_id = %self.config.user_id,
                    attempt = self.attempt,
                    reconnect = self.connected_once,
                    "Connected"
                );
                #[cfg(feature = "metrics")]
                {
                    if self.connected_once {
                        crate::metrics::record_reconnect();
                    }
                }
                self.attempt = 0;
                self.connected_once = true;
                self.publish_heartbeat();
            }
            Err(e) => {
                self.attempt = self.attempt.saturating_add(1);
                self.reconciler.mark_disconnected(self.attempt);
                warn!(user_id = %self.config.user_id, attempt = self.attempt, error = %e, "Connect failed");
                self.schedule_reconnect();
            }
        }
    }

    /// Subscribe first so nothing committed after the snapshot is missed.
    async fn subscribe_and_resync(&mut self) -> Result<(), GatewayError> {
        let mut streams = SelectAll::new();
        for collection in Collection::ALL {
            streams.push(self.gateway.subscribe(collection).await?);
        }
        let shapes = self.gateway.snapshot(Collection::Shapes).await?;
        let mut presence = self.gateway.snapshot(Collection::Cursors).await?;
        presence.extend(self.gateway.snapshot(Collection::Presence).await?);

        self.streams = Some(streams);
        self.reconciler.resync(shapes);
        self.presence.resync(presence);
        Ok(())
    }

    fn schedule_reconnect(&mut self) {
        if self.reconnect_at.is_some() {
            return;
        }
        let delay = reconnect_delay(
            self.attempt,
            self.config.reconnect_min,
            self.config.reconnect_max,
        );
        debug!(attempt = self.attempt, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");
        self.reconnect_at = Some(Instant::now() + delay);
    }

    fn on_connection_lost(&mut self, reason: &str) {
        if let Some(streams) = self.streams.take() {
            for stream in streams.iter() {
                stream.unsubscribe();
            }
        }
        if self.reconciler.connection_state().is_connected() {
            self.reconciler.mark_disconnected(self.attempt);
        }
        warn!(
            user_id = %self.config.user_id,
            reason,
            pending = self.reconciler.pending_len(),
            "Connection lost"
        );
        self.schedule_reconnect();
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Apply { actions, reply } => {
                let results: Vec<_> = actions
                    .into_iter()
                    .map(|action| self.apply_action(action))
                    .collect();
                let _ = reply.send(results);
            }
            Command::Shapes { reply } => {
                let _ = reply.send(self.reconciler.store().list());
            }
            Command::Collaborators { reply } => {
                let now = now_millis();
                let _ = reply.send(Collaborators {
                    cursors: self.presence.active_cursors(now),
                    users: self.presence.active_users(now),
                });
            }
            Command::PendingWrites { reply } => {
                let _ = reply.send(self.reconciler.pending_len());
            }
            Command::MoveCursor(position) => {
                if let Some(write) = self.presence.move_cursor(position, Instant::now()) {
                    self.send_ephemeral(write);
                }
            }
            Command::Select(selection) => {
                let write = self.presence.set_selection(selection);
                self.send_ephemeral(write);
            }
            // Handled by the loop.
            Command::Shutdown => {}
        }
    }

    fn apply_action(&mut self, action: LocalAction) -> Result<ActionOutcome, StoreError> {
        let outcome = match action {
            LocalAction::Create(draft) => self
                .reconciler
                .apply_local(|store| store.create(draft))
                .map(ActionOutcome::Created),
            LocalAction::CreateAt { draft, placement } => self
                .reconciler
                .apply_local(|store| store.create_at(draft, &placement))
                .map(ActionOutcome::Created),
            LocalAction::Update { id, patch } => self
                .reconciler
                .apply_local(|store| store.update(&id, patch))
                .map(|()| ActionOutcome::Updated(id)),
            LocalAction::Delete { id } => self
                .reconciler
                .apply_local(|store| store.delete(&id))
                .map(|()| ActionOutcome::Deleted(id)),
            LocalAction::Reorder { id, reorder } => self
                .reconciler
                .apply_local(|store| store.reorder(&id, reorder))
                .map(|()| ActionOutcome::Reordered(id)),
            LocalAction::Move { id, placement } => self
                .reconciler
                .apply_local(|store| store.move_to(&id, &placement))
                .map(|()| ActionOutcome::Reordered(id)),
        };
        if let Err(e) = &outcome {
            debug!(user_id = %self.config.user_id, error = %e, "Local action refused");
        }
        outcome
    }

    fn handle_outcome(&mut self, outcome: WriteOutcome) {
        if self.reconciler.on_write_result(outcome.revision, outcome.result) {
            self.on_connection_lost("write failed");
        }
    }

    fn handle_remote(&mut self, event: ChangeEvent) {
        match event.collection {
            Collection::Shapes => {
                self.reconciler.on_remote(&event);
            }
            Collection::Cursors | Collection::Presence => {
                self.presence.on_remote(&event);
            }
        }
    }

    fn publish_heartbeat(&mut self) {
        if !self.reconciler.connection_state().is_connected() {
            return;
        }
        for write in self.presence.heartbeat(Instant::now()) {
            self.send_ephemeral(write);
        }
    }

    fn flush_cursor(&mut self) {
        if let Some(write) = self.presence.flush_trailing(Instant::now()) {
            self.send_ephemeral(write);
        }
    }

    /// Fire-and-forget write for cursor/presence. Not buffered: the next
    /// heartbeat after reconnect carries the latest state.
    fn send_ephemeral(&self, write: RemoteWrite) {
        if !self.reconciler.connection_state().is_connected() {
            return;
        }
        let gateway = self.gateway.clone();
        tokio::spawn(async move {
            let collection = write.collection();
            if let Err(e) = gateway.write(write).await {
                debug!(collection = collection.as_str(), error = %e, "Presence write failed");
            }
        });
    }

    /// Dispatch the head of the outbox if nothing is in flight.
    fn pump(&mut self) {
        let Some((revision, write)) = self.reconciler.next_dispatch() else {
            return;
        };
        let gateway = self.gateway.clone();
        let outcomes = self.outcomes_tx.clone();
        tokio::spawn(async move {
            let result = gateway.write(write).await;
            let _ = outcomes.send(WriteOutcome { revision, result });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_delay_bounds() {
        let min = Duration::from_millis(100);
        let max = Duration::from_millis(1_000);
        for attempt in 0..20 {
            let delay = reconnect_delay(attempt, min, max);
            assert!(delay >= min / 2, "attempt {attempt}: {delay:?}");
            assert!(delay <= max, "attempt {attempt}: {delay:?}");
        }
        assert!(reconnect_delay(10, min, max) >= max / 2);
    }

    #[test]
    fn test_session_config_from_config() {
        let config = Config::default();
        let session = SessionConfig::from_config(&config, "alice", "Alice");
        assert_eq!(session.heartbeat_interval, Duration::from_millis(2_000));
        assert_eq!(session.cursor_throttle, Duration::from_millis(100));
        assert_eq!(session.presence_ttl_ms, 30_000);
        assert_eq!(session.user_id, "alice");
    }
}
