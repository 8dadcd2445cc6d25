//! Presence Tracker.
//!
//! Publishes this session's heartbeat and cursor, and keeps the last known
//! cursor/presence record of every other collaborator. Staleness is decided
//! on read: records older than the TTL are left in place but never reported.

use std::collections::HashMap;
use std::time::Duration;

use shapeshare_core::color::cursor_color;
use shapeshare_core::gateway::{ChangeEvent, ChangeKind, Collection, Record, RemoteWrite};
use shapeshare_core::types::{is_stale, Cursor, Position, Presence, ShapeId, Timestamp, UserId};
use tokio::time::Instant;
use tracing::debug;

pub struct PresenceTracker {
    user_id: UserId,
    display_name: String,
    color: String,
    ttl_ms: i64,
    throttle: Duration,
    position: Position,
    last_cursor_write: Option<Instant>,
    trailing: Option<Position>,
    selection: Vec<ShapeId>,
    cursors: HashMap<UserId, Cursor>,
    presence: HashMap<UserId, Presence>,
}

impl PresenceTracker {
    pub fn new(
        user_id: impl Into<UserId>,
        display_name: impl Into<String>,
        ttl_ms: i64,
        throttle: Duration,
    ) -> Self {
        let user_id = user_id.into();
        let color = cursor_color(&user_id).to_string();
        Self {
            user_id,
            display_name: display_name.into(),
            color,
            ttl_ms,
            throttle,
            position: Position::default(),
            last_cursor_write: None,
            trailing: None,
            selection: Vec::new(),
            cursors: HashMap::new(),
            presence: HashMap::new(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn color(&self) -> &str {
        &self.color
    }

    pub fn selection(&self) -> &[ShapeId] {
        &self.selection
    }

    fn cursor_write(&mut self, now: Instant) -> RemoteWrite {
        self.last_cursor_write = Some(now);
        self.trailing = None;
        RemoteWrite::Cursor {
            user_id: self.user_id.clone(),
            position: self.position,
            display_name: self.display_name.clone(),
            color: self.color.clone(),
        }
    }

    fn presence_write(&self) -> RemoteWrite {
        RemoteWrite::Presence {
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
            selection: self.selection.clone(),
        }
    }

    /// Writes for one heartbeat: presence plus the current cursor.
    pub fn heartbeat(&mut self, now: Instant) -> Vec<RemoteWrite> {
        vec![self.presence_write(), self.cursor_write(now)]
    }

    /// Record a cursor move. Returns a write unless throttled; a throttled
    /// position is kept and flushed at [`Self::trailing_deadline`].
    pub fn move_cursor(&mut self, position: Position, now: Instant) -> Option<RemoteWrite> {
        self.position = position;
        match self.last_cursor_write {
            Some(last) if now.duration_since(last) < self.throttle => {
                self.trailing = Some(position);
                None
            }
            _ => Some(self.cursor_write(now)),
        }
    }

    pub fn trailing_deadline(&self) -> Option<Instant> {
        self.trailing?;
        self.last_cursor_write.map(|last| last + self.throttle)
    }

    pub fn flush_trailing(&mut self, now: Instant) -> Option<RemoteWrite> {
        match self.trailing_deadline() {
            Some(deadline) if deadline <= now => Some(self.cursor_write(now)),
            _ => None,
        }
    }

    pub fn set_selection(&mut self, selection: Vec<ShapeId>) -> RemoteWrite {
        self.selection = selection;
        self.presence_write()
    }

    /// Track a remote cursor/presence change. Own records are ignored, as
    /// are records with an older heartbeat than the one already held.
    pub fn on_remote(&mut self, event: &ChangeEvent) -> bool {
        if event.id == self.user_id {
            return false;
        }
        match (event.collection, event.kind, &event.record) {
            (Collection::Cursors, ChangeKind::Removed, _) => self.cursors.remove(&event.id).is_some(),
            (Collection::Presence, ChangeKind::Removed, _) => {
                self.presence.remove(&event.id).is_some()
            }
            (_, _, Some(Record::Cursor(cursor))) => {
                keep_newer(&mut self.cursors, &cursor.user_id, cursor, |c| c.last_heartbeat)
            }
            (_, _, Some(Record::Presence(presence))) => {
                keep_newer(&mut self.presence, &presence.user_id, presence, |p| p.last_heartbeat)
            }
            _ => false,
        }
    }

    /// Replace tracked records with a snapshot.
    pub fn resync(&mut self, records: Vec<Record>) {
        self.cursors.clear();
        self.presence.clear();
        for record in records {
            match record {
                Record::Cursor(c) if c.user_id != self.user_id => {
                    self.cursors.insert(c.user_id.clone(), c);
                }
                Record::Presence(p) if p.user_id != self.user_id => {
                    self.presence.insert(p.user_id.clone(), p);
                }
                _ => {}
            }
        }
        debug!(
            cursors = self.cursors.len(),
            presence = self.presence.len(),
            "Resynced presence"
        );
    }

    /// Other collaborators' cursors with a fresh heartbeat, by user id.
    pub fn active_cursors(&self, now: Timestamp) -> Vec<Cursor> {
        let mut cursors: Vec<Cursor> = self
            .cursors
            .values()
            .filter(|c| !is_stale(c.last_heartbeat, now, self.ttl_ms))
            .cloned()
            .collect();
        cursors.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        cursors
    }

    /// Other collaborators who are online, with their selections.
    pub fn active_users(&self, now: Timestamp) -> Vec<Presence> {
        let mut users: Vec<Presence> = self
            .presence
            .values()
            .filter(|p| !is_stale(p.last_heartbeat, now, self.ttl_ms))
            .cloned()
            .collect();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        users
    }
}

/// Store `incoming` unless the held record has a newer heartbeat.
fn keep_newer<T: Clone>(
    records: &mut HashMap<UserId, T>,
    user_id: &str,
    incoming: &T,
    heartbeat: impl Fn(&T) -> Timestamp,
) -> bool {
    if let Some(held) = records.get(user_id) {
        if heartbeat(held) > heartbeat(incoming) {
            debug!(user_id, "Ignoring out-of-order presence record");
            return false;
        }
    }
    records.insert(user_id.to_string(), incoming.clone());
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> PresenceTracker {
        PresenceTracker::new("me", "Me", 30_000, Duration::from_millis(100))
    }

    fn presence_event(user_id: &str, last_heartbeat: Timestamp) -> ChangeEvent {
        ChangeEvent {
            kind: ChangeKind::Modified,
            collection: Collection::Presence,
            id: user_id.into(),
            record: Some(Record::Presence(Presence {
                user_id: user_id.into(),
                display_name: user_id.to_uppercase(),
                last_heartbeat,
                selection: vec!["s1".into()],
            })),
            timestamp: last_heartbeat,
        }
    }

    fn cursor_event(user_id: &str, last_heartbeat: Timestamp) -> ChangeEvent {
        ChangeEvent {
            kind: ChangeKind::Added,
            collection: Collection::Cursors,
            id: user_id.into(),
            record: Some(Record::Cursor(Cursor {
                user_id: user_id.into(),
                position: Position::new(1.0, 2.0),
                display_name: user_id.into(),
                color: cursor_color(user_id).into(),
                last_heartbeat,
            })),
            timestamp: last_heartbeat,
        }
    }

    #[test]
    fn test_ttl_boundary() {
        let mut tracker = tracker();
        tracker.on_remote(&presence_event("bob", 0));
        tracker.on_remote(&cursor_event("bob", 0));

        assert_eq!(tracker.active_users(29_999).len(), 1);
        assert_eq!(tracker.active_cursors(29_999).len(), 1);
        assert!(tracker.active_users(30_001).is_empty());
        assert!(tracker.active_cursors(30_001).is_empty());

        // Filtering never deletes; a fresh heartbeat brings the user back.
        tracker.on_remote(&presence_event("bob", 40_000));
        assert_eq!(tracker.active_users(40_001).len(), 1);
    }

    #[test]
    fn test_late_cursor_write_does_not_rewind_position() {
        let mut tracker = tracker();
        let mut newer = cursor_event("bob", 2_000);
        if let Some(Record::Cursor(c)) = newer.record.as_mut() {
            c.position = Position::new(9.0, 9.0);
        }
        assert!(tracker.on_remote(&newer));
        assert!(!tracker.on_remote(&cursor_event("bob", 1_000)));
        assert!(tracker.on_remote(&presence_event("bob", 2_000)));
        assert!(!tracker.on_remote(&presence_event("bob", 1_000)));
        assert_eq!(tracker.active_users(2_500)[0].last_heartbeat, 2_000);

        let cursors = tracker.active_cursors(2_500);
        assert_eq!(cursors[0].position, Position::new(9.0, 9.0));
        assert_eq!(cursors[0].last_heartbeat, 2_000);

        // Same heartbeat is accepted so repeated writes within one tick land.
        assert!(tracker.on_remote(&cursor_event("bob", 2_000)));
    }

    #[test]
    fn test_own_records_are_excluded() {
        let mut tracker = tracker();
        assert!(!tracker.on_remote(&presence_event("me", 0)));
        assert!(tracker.active_users(1).is_empty());

        tracker.resync(vec![
            Record::Presence(Presence {
                user_id: "me".into(),
                display_name: "Me".into(),
                last_heartbeat: 0,
                selection: Vec::new(),
            }),
            Record::Presence(Presence {
                user_id: "amy".into(),
                display_name: "Amy".into(),
                last_heartbeat: 0,
                selection: Vec::new(),
            }),
        ]);
        let users = tracker.active_users(1);
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].user_id, "amy");
    }

    #[test]
    fn test_cursor_throttle_keeps_trailing_position() {
        let mut tracker = tracker();
        let t0 = Instant::now();

        assert!(tracker.move_cursor(Position::new(1.0, 1.0), t0).is_some());
        assert!(tracker
            .move_cursor(Position::new(2.0, 2.0), t0 + Duration::from_millis(30))
            .is_none());
        assert!(tracker
            .move_cursor(Position::new(3.0, 3.0), t0 + Duration::from_millis(60))
            .is_none());

        let deadline = tracker.trailing_deadline().unwrap();
        assert_eq!(deadline, t0 + Duration::from_millis(100));
        assert!(tracker.flush_trailing(t0 + Duration::from_millis(99)).is_none());

        match tracker.flush_trailing(deadline) {
            Some(RemoteWrite::Cursor { position, .. }) => assert_eq!(position, Position::new(3.0, 3.0)),
            other => panic!("unexpected write: {other:?}"),
        }
        assert!(tracker.trailing_deadline().is_none());

        assert!(tracker
            .move_cursor(Position::new(4.0, 4.0), t0 + Duration::from_millis(250))
            .is_some());
    }

    #[test]
    fn test_heartbeat_carries_selection_and_cursor() {
        let mut tracker = tracker();
        tracker.set_selection(vec!["a".into(), "b".into()]);
        let writes = tracker.heartbeat(Instant::now());
        assert_eq!(writes.len(), 2);
        match &writes[0] {
            RemoteWrite::Presence { selection, .. } => assert_eq!(selection.len(), 2),
            other => panic!("unexpected write: {other:?}"),
        }
        match &writes[1] {
            RemoteWrite::Cursor { color, .. } => assert_eq!(color, tracker.color()),
            other => panic!("unexpected write: {other:?}"),
        }
    }
}
