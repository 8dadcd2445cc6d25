//! In-process Persistence Gateway.
//!
//! One shared backend holds the three collections and the server clock.
//! Each client talks to it through its own link ([`InMemoryGateway::link`]),
//! which can be taken offline to simulate a dropped connection: writes and
//! reads fail with `Network`, and open change streams end.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::gateway::{
    ChangeEvent, ChangeKind, ChangeStream, Collection, GatewayError, PersistenceGateway, Record,
    RemoteWrite, ShapeWrite, WriteAck,
};
use crate::types::{now_millis, Cursor, Presence, ShapeId, ShapeRecord, Timestamp, UserId};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Default)]
struct Tables {
    shapes: HashMap<ShapeId, ShapeRecord>,
    cursors: HashMap<UserId, Cursor>,
    presence: HashMap<UserId, Presence>,
    clock: Timestamp,
    committed: Vec<(Timestamp, RemoteWrite)>,
}

impl Tables {
    /// Monotonic server clock: wall time, but never repeating or going back.
    fn tick(&mut self) -> Timestamp {
        self.clock = now_millis().max(self.clock + 1);
        self.clock
    }
}

struct Backend {
    tables: Mutex<Tables>,
    shapes_tx: broadcast::Sender<ChangeEvent>,
    cursors_tx: broadcast::Sender<ChangeEvent>,
    presence_tx: broadcast::Sender<ChangeEvent>,
}

impl Backend {
    fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            shapes_tx: broadcast::channel(CHANNEL_CAPACITY).0,
            cursors_tx: broadcast::channel(CHANNEL_CAPACITY).0,
            presence_tx: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sender(&self, collection: Collection) -> &broadcast::Sender<ChangeEvent> {
        match collection {
            Collection::Shapes => &self.shapes_tx,
            Collection::Cursors => &self.cursors_tx,
            Collection::Presence => &self.presence_tx,
        }
    }

    fn commit(&self, write: RemoteWrite) -> Result<WriteAck, GatewayError> {
        let mut tables = self.tables();
        let collection = write.collection();
        let id = write.key().to_string();

        let event = match &write {
            RemoteWrite::Shape { id, author, op } => match op {
                ShapeWrite::Create(shape) => {
                    let timestamp = tables.tick();
                    let mut shape = shape.clone();
                    shape.id = id.clone();
                    shape.last_modified_by = author.clone();
                    shape.last_modified_at = timestamp;
                    let record = ShapeRecord::stamped(shape, timestamp);
                    let kind = if tables.shapes.insert(id.clone(), record.clone()).is_some() {
                        ChangeKind::Modified
                    } else {
                        ChangeKind::Added
                    };
                    Some((kind, Some(Record::Shape(record)), timestamp))
                }
                ShapeWrite::Update(patch) => {
                    if !tables.shapes.contains_key(id) {
                        return Err(GatewayError::NotFound(id.clone()));
                    }
                    let timestamp = tables.tick();
                    let record = tables
                        .shapes
                        .get_mut(id)
                        .ok_or_else(|| GatewayError::NotFound(id.clone()))?;
                    patch.apply_to(&mut record.shape);
                    for field in patch.fields() {
                        record.stamps.insert(field, timestamp);
                    }
                    record.shape.last_modified_by = author.clone();
                    record.shape.last_modified_at = timestamp;
                    Some((ChangeKind::Modified, Some(Record::Shape(record.clone())), timestamp))
                }
                ShapeWrite::Delete => {
                    let timestamp = tables.tick();
                    tables
                        .shapes
                        .remove(id)
                        .map(|_| (ChangeKind::Removed, None, timestamp))
                }
            },
            RemoteWrite::Cursor {
                user_id,
                position,
                display_name,
                color,
            } => {
                let timestamp = tables.tick();
                let cursor = Cursor {
                    user_id: user_id.clone(),
                    position: *position,
                    display_name: display_name.clone(),
                    color: color.clone(),
                    last_heartbeat: timestamp,
                };
                let kind = match tables.cursors.insert(user_id.clone(), cursor.clone()) {
                    Some(_) => ChangeKind::Modified,
                    None => ChangeKind::Added,
                };
                Some((kind, Some(Record::Cursor(cursor)), timestamp))
            }
            RemoteWrite::Presence {
                user_id,
                display_name,
                selection,
            } => {
                let timestamp = tables.tick();
                let presence = Presence {
                    user_id: user_id.clone(),
                    display_name: display_name.clone(),
                    last_heartbeat: timestamp,
                    selection: selection.clone(),
                };
                let kind = match tables.presence.insert(user_id.clone(), presence.clone()) {
                    Some(_) => ChangeKind::Modified,
                    None => ChangeKind::Added,
                };
                Some((kind, Some(Record::Presence(presence)), timestamp))
            }
        };

        let timestamp = tables.clock;
        tables.committed.push((timestamp, write));

        if let Some((kind, record, timestamp)) = event {
            debug!(collection = collection.as_str(), %id, ?kind, timestamp, "Committed write");
            // Sent under the lock so subscribers observe commit order.
            let _ = self.sender(collection).send(ChangeEvent {
                kind,
                collection,
                id,
                record,
                timestamp,
            });
        }

        Ok(WriteAck { timestamp })
    }

    fn snapshot(&self, collection: Collection) -> Vec<Record> {
        let tables = self.tables();
        match collection {
            Collection::Shapes => tables.shapes.values().cloned().map(Record::Shape).collect(),
            Collection::Cursors => tables.cursors.values().cloned().map(Record::Cursor).collect(),
            Collection::Presence => tables
                .presence
                .values()
                .cloned()
                .map(Record::Presence)
                .collect(),
        }
    }
}

/// Link to a shared in-memory document store.
#[derive(Clone)]
pub struct InMemoryGateway {
    backend: Arc<Backend>,
    online: Arc<AtomicBool>,
    connection: Arc<Mutex<CancellationToken>>,
}

impl Default for InMemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self {
            backend: Arc::new(Backend::new()),
            online: Arc::new(AtomicBool::new(true)),
            connection: Arc::new(Mutex::new(CancellationToken::new())),
        }
    }

    /// A new client link to the same backend, with its own connectivity.
    pub fn link(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            online: Arc::new(AtomicBool::new(true)),
            connection: Arc::new(Mutex::new(CancellationToken::new())),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Take this link on- or offline. Going offline ends open change streams.
    pub fn set_online(&self, online: bool) {
        let was = self.online.swap(online, Ordering::SeqCst);
        if was == online {
            return;
        }
        let mut connection = self.connection.lock().unwrap_or_else(PoisonError::into_inner);
        if online {
            *connection = CancellationToken::new();
        } else {
            connection.cancel();
        }
        info!(online, "In-memory gateway link changed state");
    }

    /// Every committed write in commit order, with its server timestamp.
    pub fn committed_writes(&self) -> Vec<(Timestamp, RemoteWrite)> {
        self.backend.tables().committed.clone()
    }

    /// Current server record for a shape, bypassing connectivity.
    pub fn shape_record(&self, id: &str) -> Option<ShapeRecord> {
        self.backend.tables().shapes.get(id).cloned()
    }

    fn ensure_online(&self) -> Result<(), GatewayError> {
        if self.is_online() {
            Ok(())
        } else {
            Err(GatewayError::Network("link offline".into()))
        }
    }
}

#[async_trait]
impl PersistenceGateway for InMemoryGateway {
    async fn write(&self, write: RemoteWrite) -> Result<WriteAck, GatewayError> {
        self.ensure_online()?;
        self.backend.commit(write)
    }

    async fn subscribe(&self, collection: Collection) -> Result<ChangeStream, GatewayError> {
        self.ensure_online()?;
        let rx = self.backend.sender(collection).subscribe();
        let dropped = self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        // A lagged receiver has lost events; ending the stream forces a resync.
        let stream = BroadcastStream::new(rx)
            .take_while(|item| futures::future::ready(item.is_ok()))
            .filter_map(|item| futures::future::ready(item.ok()))
            .take_until(dropped.cancelled_owned());

        debug!(collection = collection.as_str(), "Subscribed");
        Ok(ChangeStream::new(stream))
    }

    async fn snapshot(&self, collection: Collection) -> Result<Vec<Record>, GatewayError> {
        self.ensure_online()?;
        Ok(self.backend.snapshot(collection))
    }
}
