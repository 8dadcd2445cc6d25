//! Sync Reconciler.
//!
//! Bridges optimistic local edits and remote change events into one view.
//! Local edits land in the store's view at once and queue in an outbox,
//! each tagged with a strictly increasing revision. The outbox drains
//! stop-and-wait: one write in flight, always the oldest, so the gateway sees
//! this session's writes in issue order. Network failures keep the write at
//! the head and pause dispatch until a reconnect resyncs confirmed state.

use std::collections::VecDeque;

use serde::Serialize;
use shapeshare_canvas::{ShapeOp, ShapeStore, StoreError};
use shapeshare_core::gateway::{
    ChangeEvent, ChangeKind, Collection, GatewayError, Record, RemoteWrite, ShapeWrite, WriteAck,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Connected,
    Reconnecting { attempt: u32 },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingWrite {
    pub revision: u64,
    pub op: ShapeOp,
    pub in_flight: bool,
}

pub struct Reconciler {
    store: ShapeStore,
    outbox: VecDeque<PendingWrite>,
    next_revision: u64,
    state: watch::Sender<ConnectionState>,
}

impl Reconciler {
    /// Starts disconnected; the first successful resync connects it.
    pub fn new(store: ShapeStore) -> Self {
        let (state, _) = watch::channel(ConnectionState::Reconnecting { attempt: 0 });
        Self {
            store,
            outbox: VecDeque::new(),
            next_revision: 1,
            state,
        }
    }

    pub fn store(&self) -> &ShapeStore {
        &self.store
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingWrite> {
        self.outbox.iter()
    }

    pub fn pending_len(&self) -> usize {
        self.outbox.len()
    }

    /// Run a local edit against the store and queue the ops it produced.
    pub fn apply_local<T>(
        &mut self,
        edit: impl FnOnce(&mut ShapeStore) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let result = edit(&mut self.store);
        // Ops journaled before a failure (e.g. a renormalization) are already
        // visible, so they are persisted too.
        for op in self.store.take_ops() {
            self.enqueue(op);
        }
        result
    }

    fn enqueue(&mut self, op: ShapeOp) {
        let revision = self.next_revision;
        self.next_revision += 1;

        if let Some(last) = self.outbox.back_mut() {
            if !last.in_flight && last.op.id == op.id {
                if let ShapeWrite::Update(later) = &op.write {
                    let coalesced = match &mut last.op.write {
                        ShapeWrite::Update(patch) => {
                            patch.merge(later);
                            true
                        }
                        ShapeWrite::Create(shape) => {
                            later.apply_to(shape);
                            true
                        }
                        ShapeWrite::Delete => false,
                    };
                    if coalesced {
                        debug!(id = %op.id, revision, "Coalesced write into pending entry");
                        last.revision = revision;
                        return;
                    }
                }
            }
        }

        debug!(id = %op.id, revision, "Queued write");
        self.outbox.push_back(PendingWrite {
            revision,
            op,
            in_flight: false,
        });

        #[cfg(feature = "metrics")]
        crate::metrics::record_outbox_depth(self.outbox.len());
    }

    /// The next write to send, if connected and nothing is in flight.
    pub fn next_dispatch(&mut self) -> Option<(u64, RemoteWrite)> {
        if !self.connection_state().is_connected() {
            return None;
        }
        let head = self.outbox.front_mut()?;
        if head.in_flight {
            return None;
        }
        head.in_flight = true;
        Some((
            head.revision,
            RemoteWrite::Shape {
                id: head.op.id.clone(),
                author: self.store.author().to_string(),
                op: head.op.write.clone(),
            },
        ))
    }

    /// Handle the outcome of a dispatched write. Returns true when the
    /// connection should be re-established.
    pub fn on_write_result(&mut self, revision: u64, result: Result<WriteAck, GatewayError>) -> bool {
        match self.outbox.front() {
            Some(head) if head.revision == revision && head.in_flight => {}
            _ => {
                warn!(revision, "Outcome for a write that is not in flight; ignoring");
                return false;
            }
        }

        match result {
            Ok(ack) => {
                let Some(done) = self.outbox.pop_front() else {
                    return false;
                };
                debug!(id = %done.op.id, revision, timestamp = ack.timestamp, "Write acknowledged");
                self.store.confirm(&done.op, ack.timestamp);
                self.refresh(&done.op.id);

                #[cfg(feature = "metrics")]
                {
                    crate::metrics::record_write_flushed();
                    crate::metrics::record_outbox_depth(self.outbox.len());
                }
                false
            }
            Err(e) if e.is_retryable() => {
                if let Some(head) = self.outbox.front_mut() {
                    head.in_flight = false;
                }
                warn!(revision, error = %e, pending = self.outbox.len(), "Write failed; buffering until reconnect");
                if self.connection_state().is_connected() {
                    self.mark_disconnected(0);
                }
                true
            }
            Err(e) => {
                let Some(dropped) = self.outbox.pop_front() else {
                    return false;
                };
                warn!(id = %dropped.op.id, revision, error = %e, "Write rejected; dropping");
                self.refresh(&dropped.op.id);

                #[cfg(feature = "metrics")]
                crate::metrics::record_write_dropped();
                false
            }
        }
    }

    /// Apply a remote change event. Returns true if confirmed state changed.
    pub fn on_remote(&mut self, event: &ChangeEvent) -> bool {
        if event.collection != Collection::Shapes {
            return false;
        }
        let changed = match (&event.kind, &event.record) {
            (ChangeKind::Removed, _) => self.store.remove_remote(&event.id, event.timestamp),
            (_, Some(Record::Shape(record))) => self.store.merge_remote(record.clone()),
            (kind, _) => {
                warn!(id = %event.id, ?kind, "Shape event without a shape record");
                false
            }
        };
        if changed {
            self.refresh(&event.id);
        }
        debug!(id = %event.id, kind = ?event.kind, timestamp = event.timestamp, changed, "Remote shape event");

        #[cfg(feature = "metrics")]
        crate::metrics::record_remote_event(changed);

        changed
    }

    /// Replace confirmed state with a full snapshot and mark connected.
    pub fn resync(&mut self, records: Vec<Record>) {
        let shapes = records.into_iter().filter_map(|r| match r {
            Record::Shape(record) => Some(record),
            _ => None,
        });
        self.store.replace_confirmed(shapes);
        self.store
            .rebuild_view(self.outbox.iter().map(|p| &p.op));
        info!(
            shapes = self.store.len(),
            pending = self.outbox.len(),
            "Resynced with remote state"
        );
        self.state.send_replace(ConnectionState::Connected);
    }

    pub fn mark_disconnected(&mut self, attempt: u32) {
        self.state
            .send_replace(ConnectionState::Reconnecting { attempt });
    }

    fn refresh(&mut self, id: &str) {
        self.store
            .refresh(id, self.outbox.iter().map(|p| &p.op));
    }
}
