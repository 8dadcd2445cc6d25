//! Persistence Gateway contract.
//!
//! Three logical collections (shapes, cursors, presence) are written through
//! [`PersistenceGateway::write`] and observed through cancellable change
//! streams. The gateway owns the authoritative clock: every committed write is
//! stamped with a server timestamp that orders it against all other writes.

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::types::{
    Cursor, Position, Presence, Shape, ShapeId, ShapePatch, ShapeRecord, Timestamp, UserId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Shapes,
    Cursors,
    Presence,
}

impl Collection {
    pub const ALL: [Collection; 3] = [Collection::Shapes, Collection::Cursors, Collection::Presence];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Shapes => "shapes",
            Collection::Cursors => "cursors",
            Collection::Presence => "presence",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// A record as stored by the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "collection", rename_all = "snake_case")]
pub enum Record {
    Shape(ShapeRecord),
    Cursor(Cursor),
    Presence(Presence),
}

impl Record {
    pub fn id(&self) -> &str {
        match self {
            Record::Shape(r) => &r.shape.id,
            Record::Cursor(c) => &c.user_id,
            Record::Presence(p) => &p.user_id,
        }
    }

    pub fn collection(&self) -> Collection {
        match self {
            Record::Shape(_) => Collection::Shapes,
            Record::Cursor(_) => Collection::Cursors,
            Record::Presence(_) => Collection::Presence,
        }
    }
}

/// One change notification. `record` is `None` for removals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub collection: Collection,
    pub id: String,
    pub record: Option<Record>,
    /// Server timestamp of the write that produced this event.
    pub timestamp: Timestamp,
}

/// Operation on a single shape document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "data", rename_all = "snake_case")]
pub enum ShapeWrite {
    /// Full set. Overwrites an existing document with the same id.
    Create(Shape),
    /// Field merge. Fails with `NotFound` if the document is gone.
    Update(ShapePatch),
    /// Idempotent removal.
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "collection", rename_all = "snake_case")]
pub enum RemoteWrite {
    Shape {
        id: ShapeId,
        author: UserId,
        op: ShapeWrite,
    },
    Cursor {
        user_id: UserId,
        position: Position,
        display_name: String,
        color: String,
    },
    Presence {
        user_id: UserId,
        display_name: String,
        selection: Vec<ShapeId>,
    },
}

impl RemoteWrite {
    pub fn collection(&self) -> Collection {
        match self {
            RemoteWrite::Shape { .. } => Collection::Shapes,
            RemoteWrite::Cursor { .. } => Collection::Cursors,
            RemoteWrite::Presence { .. } => Collection::Presence,
        }
    }

    /// Document key inside the collection.
    pub fn key(&self) -> &str {
        match self {
            RemoteWrite::Shape { id, .. } => id,
            RemoteWrite::Cursor { user_id, .. } => user_id,
            RemoteWrite::Presence { user_id, .. } => user_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteAck {
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("network error: {0}")]
    Network(String),

    #[error("document not found: {0}")]
    NotFound(String),

    #[error("write rejected: {0}")]
    Rejected(String),

    #[error("gateway closed")]
    Closed,
}

impl GatewayError {
    /// Whether the write should stay buffered and be retried after reconnect.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Network(_) | GatewayError::Closed)
    }
}

/// Cancellable stream of change events.
///
/// Ends when the subscription is cancelled through [`ChangeStream::unsubscribe`]
/// (or a token obtained from [`ChangeStream::cancel_token`]) or when the
/// underlying connection drops.
pub struct ChangeStream {
    inner: Pin<Box<dyn Stream<Item = ChangeEvent> + Send>>,
    token: CancellationToken,
}

impl ChangeStream {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = ChangeEvent> + Send + 'static,
    {
        let token = CancellationToken::new();
        let inner = Box::pin(stream.take_until(token.clone().cancelled_owned()));
        Self { inner, token }
    }

    pub fn unsubscribe(&self) {
        self.token.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Stream for ChangeStream {
    type Item = ChangeEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl std::fmt::Debug for ChangeStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeStream")
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

/// External real-time document store with change notification.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Commit a write and return its server timestamp.
    async fn write(&self, write: RemoteWrite) -> Result<WriteAck, GatewayError>;

    /// Subscribe to changes in one collection. Restartable: call again after
    /// the previous stream ends.
    async fn subscribe(&self, collection: Collection) -> Result<ChangeStream, GatewayError>;

    /// Current contents of a collection, used for full resync.
    async fn snapshot(&self, collection: Collection) -> Result<Vec<Record>, GatewayError>;
}
