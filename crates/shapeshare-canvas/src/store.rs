//! Shape Store.
//!
//! Holds the confirmed tier (records as the server last reported them, with
//! a timestamp per field) and the view tier (what this session renders).
//! Local edits change the view immediately and are journaled as [`ShapeOp`]s
//! for the reconciler to persist. Remote records merge into the confirmed
//! tier field by field, last write wins by server timestamp.

use std::cmp::Ordering;
use std::collections::HashMap;

use shapeshare_core::gateway::ShapeWrite;
use shapeshare_core::types::{
    Shape, ShapeDraft, ShapeField, ShapeId, ShapePatch, ShapeRecord, Timestamp, UserId,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::layer_order::{LayerOrderAllocator, LayerOrderError, Placement, Reorder};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("shape not found: {0}")]
    NotFound(ShapeId),

    #[error("shape already exists: {0}")]
    AlreadyExists(ShapeId),

    #[error("shape is locked: {0}")]
    Locked(ShapeId),

    #[error("invalid shape: {0}")]
    Invalid(String),
}

/// A local edit waiting to be persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ShapeOp {
    pub id: ShapeId,
    pub write: ShapeWrite,
}

impl ShapeOp {
    pub fn create(shape: Shape) -> Self {
        Self {
            id: shape.id.clone(),
            write: ShapeWrite::Create(shape),
        }
    }

    pub fn update(id: impl Into<ShapeId>, patch: ShapePatch) -> Self {
        Self {
            id: id.into(),
            write: ShapeWrite::Update(patch),
        }
    }

    pub fn delete(id: impl Into<ShapeId>) -> Self {
        Self {
            id: id.into(),
            write: ShapeWrite::Delete,
        }
    }

    /// Replay this op onto one view slot.
    pub fn replay_onto(&self, slot: &mut Option<Shape>) {
        match &self.write {
            ShapeWrite::Create(shape) => *slot = Some(shape.clone()),
            ShapeWrite::Update(patch) => {
                if let Some(shape) = slot {
                    patch.apply_to(shape);
                }
            }
            ShapeWrite::Delete => *slot = None,
        }
    }
}

/// Paint order: zIndex descending, ties broken by id ascending.
pub fn layer_cmp(a: &Shape, b: &Shape) -> Ordering {
    b.z_index
        .total_cmp(&a.z_index)
        .then_with(|| a.id.cmp(&b.id))
}

pub struct ShapeStore {
    author: UserId,
    confirmed: HashMap<ShapeId, ShapeRecord>,
    tombstones: HashMap<ShapeId, Timestamp>,
    view: HashMap<ShapeId, Shape>,
    allocator: LayerOrderAllocator,
    journal: Vec<ShapeOp>,
}

impl ShapeStore {
    pub fn new(author: impl Into<UserId>) -> Self {
        Self {
            author: author.into(),
            confirmed: HashMap::new(),
            tombstones: HashMap::new(),
            view: HashMap::new(),
            allocator: LayerOrderAllocator::new(),
            journal: Vec::new(),
        }
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    // -- View --

    /// Shapes in paint order, front first.
    pub fn list(&self) -> Vec<Shape> {
        let mut shapes: Vec<Shape> = self.view.values().cloned().collect();
        shapes.sort_by(layer_cmp);
        shapes
    }

    pub fn get(&self, id: &str) -> Option<&Shape> {
        self.view.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.view.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.view.len()
    }

    pub fn is_empty(&self) -> bool {
        self.view.is_empty()
    }

    pub fn confirmed(&self, id: &str) -> Option<&ShapeRecord> {
        self.confirmed.get(id)
    }

    /// Drain the ops produced by local edits since the last call.
    pub fn take_ops(&mut self) -> Vec<ShapeOp> {
        std::mem::take(&mut self.journal)
    }

    // -- Local edits --

    /// Create a shape. Uses the draft's zIndex if given, otherwise the top.
    pub fn create(&mut self, draft: ShapeDraft) -> Result<Shape, StoreError> {
        match draft.z_index {
            Some(z_index) => {
                validate_draft(&draft)?;
                let id = self.fresh_id(&draft)?;
                Ok(self.insert(id, draft, z_index))
            }
            None => self.create_at(draft, &Placement::Top),
        }
    }

    /// Create a shape at a position in the stacking order.
    pub fn create_at(&mut self, draft: ShapeDraft, placement: &Placement) -> Result<Shape, StoreError> {
        validate_draft(&draft)?;
        let id = self.fresh_id(&draft)?;
        let z_index = self.key_for(placement, &id)?;
        Ok(self.insert(id, draft, z_index))
    }

    fn fresh_id(&self, draft: &ShapeDraft) -> Result<ShapeId, StoreError> {
        let id = draft
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if id.trim().is_empty() {
            return Err(StoreError::Invalid("shape id cannot be empty".into()));
        }
        if self.view.contains_key(&id) {
            return Err(StoreError::AlreadyExists(id));
        }
        Ok(id)
    }

    fn insert(&mut self, id: ShapeId, draft: ShapeDraft, z_index: f64) -> Shape {
        let shape = Shape {
            id: id.clone(),
            shape_type: draft.shape_type,
            geometry: draft.geometry,
            style: draft.style,
            text: draft.text,
            font_size: draft.font_size,
            z_index,
            visible: draft.visible,
            locked: draft.locked,
            last_modified_by: self.author.clone(),
            last_modified_at: 0,
        };

        debug!(%id, shape_type = %shape.shape_type, z_index, "Created shape locally");
        self.view.insert(id.clone(), shape.clone());
        self.journal.push(ShapeOp::create(shape.clone()));
        self.renormalize_if_needed();

        self.view.get(&id).cloned().unwrap_or(shape)
    }

    /// Field-level merge into an existing shape.
    pub fn update(&mut self, id: &str, patch: ShapePatch) -> Result<(), StoreError> {
        let shape = self
            .view
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if patch.is_empty() {
            return Ok(());
        }
        if shape.locked && patch.fields().iter().any(|f| *f != ShapeField::Locked) {
            return Err(StoreError::Locked(id.to_string()));
        }
        validate_patch(&patch)?;

        patch.apply_to(shape);
        debug!(%id, fields = ?patch.fields(), "Updated shape locally");
        self.journal.push(ShapeOp::update(id, patch));
        Ok(())
    }

    pub fn delete(&mut self, id: &str) -> Result<(), StoreError> {
        match self.view.get(id) {
            None => return Err(StoreError::NotFound(id.to_string())),
            Some(shape) if shape.locked => return Err(StoreError::Locked(id.to_string())),
            Some(_) => {}
        }
        self.view.remove(id);
        debug!(%id, "Deleted shape locally");
        self.journal.push(ShapeOp::delete(id));
        Ok(())
    }

    /// Move a shape to a new position in the stacking order.
    pub fn move_to(&mut self, id: &str, placement: &Placement) -> Result<(), StoreError> {
        match self.view.get(id) {
            None => return Err(StoreError::NotFound(id.to_string())),
            Some(shape) if shape.locked => return Err(StoreError::Locked(id.to_string())),
            Some(_) => {}
        }
        let key = self.key_for(placement, id)?;
        if let Some(shape) = self.view.get_mut(id) {
            shape.z_index = key;
        }
        self.journal.push(ShapeOp::update(id, ShapePatch::z_index(key)));
        self.renormalize_if_needed();
        Ok(())
    }

    pub fn reorder(&mut self, id: &str, reorder: Reorder) -> Result<(), StoreError> {
        let ordered = self.list();
        let pos = ordered
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let last = ordered.len() - 1;

        let placement = match reorder {
            Reorder::ToFront if pos > 0 => Placement::Top,
            Reorder::ToBack if pos < last => Placement::Bottom,
            Reorder::Forward if pos == 1 => Placement::Top,
            Reorder::Forward if pos > 1 => Placement::Between {
                lower: ordered[pos - 1].id.clone(),
                upper: ordered[pos - 2].id.clone(),
            },
            Reorder::Backward if pos + 1 == last => Placement::Bottom,
            Reorder::Backward if pos + 1 < last => Placement::Between {
                lower: ordered[pos + 2].id.clone(),
                upper: ordered[pos + 1].id.clone(),
            },
            // Already at the requested end.
            _ => return Ok(()),
        };
        self.move_to(id, &placement)
    }

    fn z_of(&self, id: &str) -> Result<f64, StoreError> {
        self.view
            .get(id)
            .map(|s| s.z_index)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// Allocate a key for `moving` at `placement`, ignoring its current key.
    fn key_for(&mut self, placement: &Placement, moving: &str) -> Result<f64, StoreError> {
        match placement {
            Placement::Top | Placement::Bottom => {
                let top = *placement == Placement::Top;
                match self.edge_key(top, moving) {
                    Ok(key) => Ok(key),
                    Err(LayerOrderError::Exhausted { .. }) => {
                        self.renormalize();
                        self.edge_key(top, moving)
                            .map_err(|e| StoreError::Invalid(e.to_string()))
                    }
                    Err(e) => Err(StoreError::Invalid(e.to_string())),
                }
            }
            Placement::Between { lower, upper } => {
                if lower == moving || upper == moving || lower == upper {
                    return Err(StoreError::Invalid(
                        "neighbours must be two other shapes".into(),
                    ));
                }
                let (below, above) = match (self.view.get(lower), self.view.get(upper)) {
                    (Some(below), Some(above)) => (below, above),
                    (None, _) => return Err(StoreError::NotFound(lower.clone())),
                    (_, None) => return Err(StoreError::NotFound(upper.clone())),
                };
                if layer_cmp(below, above) != Ordering::Greater {
                    return Err(StoreError::Invalid(format!(
                        "'{lower}' is not below '{upper}'"
                    )));
                }

                match self.allocator.between(below.z_index, above.z_index) {
                    Ok(key) => Ok(key),
                    Err(LayerOrderError::Exhausted { .. }) => {
                        self.renormalize();
                        let (lo, hi) = (self.z_of(lower)?, self.z_of(upper)?);
                        self.allocator
                            .between(lo, hi)
                            .map_err(|e| StoreError::Invalid(e.to_string()))
                    }
                    Err(e) => Err(StoreError::Invalid(e.to_string())),
                }
            }
        }
    }

    /// Key above (or below) every shape other than `moving`.
    fn edge_key(&mut self, top: bool, moving: &str) -> Result<f64, LayerOrderError> {
        let others: Vec<f64> = self
            .view
            .values()
            .filter(|s| s.id != moving)
            .map(|s| s.z_index)
            .collect();
        if top {
            self.allocator.top(others)
        } else {
            self.allocator.bottom(others)
        }
    }

    fn renormalize_if_needed(&mut self) {
        if self.allocator.needs_renormalization() {
            self.renormalize();
        }
    }

    /// Rewrite every shape to evenly spaced integer keys in current order.
    pub fn renormalize(&mut self) {
        let mut ordered = self.list();
        ordered.reverse();
        let keys = self.allocator.renormalized_keys(ordered.len());

        let mut rewritten = 0;
        for (shape, key) in ordered.iter().zip(keys) {
            if shape.z_index == key {
                continue;
            }
            if let Some(s) = self.view.get_mut(&shape.id) {
                s.z_index = key;
            }
            self.journal
                .push(ShapeOp::update(shape.id.clone(), ShapePatch::z_index(key)));
            rewritten += 1;
        }
        info!(shapes = ordered.len(), rewritten, "Renormalized layer order");
    }

    // -- Remote state --

    /// Merge a server record into the confirmed tier, field by field.
    /// Returns true if anything changed.
    pub fn merge_remote(&mut self, incoming: ShapeRecord) -> bool {
        let id = incoming.shape.id.clone();
        if let Some(&tombstone) = self.tombstones.get(&id) {
            if incoming.newest_stamp() <= tombstone {
                debug!(%id, tombstone, "Ignoring record older than its deletion");
                return false;
            }
        }

        match self.confirmed.get_mut(&id) {
            None => {
                self.confirmed.insert(id, incoming);
                true
            }
            Some(existing) => merge_fields(existing, &incoming),
        }
    }

    /// Apply a server-side delete stamped at `timestamp`.
    pub fn remove_remote(&mut self, id: &str, timestamp: Timestamp) -> bool {
        let tombstone = self.tombstones.entry(id.to_string()).or_insert(timestamp);
        *tombstone = (*tombstone).max(timestamp);

        match self.confirmed.get(id) {
            Some(record) if record.newest_stamp() < timestamp => {
                self.confirmed.remove(id);
                true
            }
            _ => false,
        }
    }

    /// Fold an acknowledged local write into the confirmed tier.
    pub fn confirm(&mut self, op: &ShapeOp, timestamp: Timestamp) -> bool {
        match &op.write {
            ShapeWrite::Create(shape) => {
                let mut shape = shape.clone();
                shape.last_modified_by = self.author.clone();
                shape.last_modified_at = timestamp;
                self.merge_remote(ShapeRecord::stamped(shape, timestamp))
            }
            ShapeWrite::Update(patch) => {
                let Some(existing) = self.confirmed.get_mut(&op.id) else {
                    return false;
                };
                let mut written = existing.shape.clone();
                patch.apply_to(&mut written);
                written.last_modified_by = self.author.clone();
                written.last_modified_at = timestamp;

                let mut incoming = ShapeRecord {
                    shape: written,
                    stamps: existing.stamps.clone(),
                };
                for field in patch.fields() {
                    incoming.stamps.insert(field, timestamp);
                }
                merge_fields(existing, &incoming)
            }
            ShapeWrite::Delete => self.remove_remote(&op.id, timestamp),
        }
    }

    /// Replace the confirmed tier with a full snapshot.
    pub fn replace_confirmed(&mut self, records: impl IntoIterator<Item = ShapeRecord>) {
        self.confirmed = records
            .into_iter()
            .map(|r| (r.shape.id.clone(), r))
            .collect();
        debug!(shapes = self.confirmed.len(), "Replaced confirmed state");
    }

    /// Recompute one shape's view from confirmed state plus pending ops.
    pub fn refresh<'a>(&mut self, id: &str, pending: impl IntoIterator<Item = &'a ShapeOp>) {
        let mut slot = self.confirmed.get(id).map(|r| r.shape.clone());
        for op in pending.into_iter().filter(|op| op.id == id) {
            op.replay_onto(&mut slot);
        }
        match slot {
            Some(shape) => {
                self.view.insert(id.to_string(), shape);
            }
            None => {
                self.view.remove(id);
            }
        }
    }

    /// Recompute the whole view from confirmed state plus pending ops.
    pub fn rebuild_view<'a>(&mut self, pending: impl IntoIterator<Item = &'a ShapeOp>) {
        self.view = self
            .confirmed
            .iter()
            .map(|(id, r)| (id.clone(), r.shape.clone()))
            .collect();
        for op in pending {
            let mut slot = self.view.remove(&op.id);
            op.replay_onto(&mut slot);
            if let Some(shape) = slot {
                self.view.insert(op.id.clone(), shape);
            }
        }
    }
}

fn merge_fields(existing: &mut ShapeRecord, incoming: &ShapeRecord) -> bool {
    let mut changed = false;
    for field in ShapeField::ALL {
        let stamp = incoming.stamp(field);
        if stamp > existing.stamp(field) {
            field.copy(&incoming.shape, &mut existing.shape);
            existing.stamps.insert(field, stamp);
            changed = true;
        }
    }
    if incoming.shape.last_modified_at > existing.shape.last_modified_at {
        existing.shape.last_modified_at = incoming.shape.last_modified_at;
        existing.shape.last_modified_by = incoming.shape.last_modified_by.clone();
    }
    changed
}

fn check_finite(name: &str, value: f64) -> Result<(), StoreError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(StoreError::Invalid(format!("{name} must be a finite number")))
    }
}

fn check_non_negative(name: &str, value: f64) -> Result<(), StoreError> {
    check_finite(name, value)?;
    if value < 0.0 {
        return Err(StoreError::Invalid(format!("{name} cannot be negative")));
    }
    Ok(())
}

fn validate_draft(draft: &ShapeDraft) -> Result<(), StoreError> {
    check_finite("x", draft.geometry.x)?;
    check_finite("y", draft.geometry.y)?;
    check_finite("rotation", draft.geometry.rotation)?;
    check_non_negative("width", draft.geometry.width)?;
    check_non_negative("height", draft.geometry.height)?;
    check_non_negative("strokeWidth", draft.style.stroke_width)?;
    if let Some(z) = draft.z_index {
        check_finite("zIndex", z)?;
    }
    if let Some(size) = draft.font_size {
        check_non_negative("fontSize", size)?;
    }
    Ok(())
}

fn validate_patch(patch: &ShapePatch) -> Result<(), StoreError> {
    for (name, value) in [("x", patch.x), ("y", patch.y), ("rotation", patch.rotation), ("zIndex", patch.z_index)] {
        if let Some(v) = value {
            check_finite(name, v)?;
        }
    }
    for (name, value) in [
        ("width", patch.width),
        ("height", patch.height),
        ("strokeWidth", patch.stroke_width),
        ("fontSize", patch.font_size),
    ] {
        if let Some(v) = value {
            check_non_negative(name, v)?;
        }
    }
    Ok(())
}
