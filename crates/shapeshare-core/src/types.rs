use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub type ShapeId = String;
pub type UserId = String;

/// Authoritative server timestamp in epoch milliseconds.
pub type Timestamp = i64;

/// Shape kinds the canvas understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeType {
    Rectangle,
    Ellipse,
    Text,
}

impl ShapeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShapeType::Rectangle => "rectangle",
            ShapeType::Ellipse => "ellipse",
            ShapeType::Text => "text",
        }
    }
}

impl fmt::Display for ShapeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShapeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rectangle" | "rect" | "square" => Ok(ShapeType::Rectangle),
            "ellipse" | "circle" | "oval" => Ok(ShapeType::Ellipse),
            "text" => Ok(ShapeType::Text),
            other => Err(format!("unknown shape type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    #[serde(default)]
    pub rotation: f64,
}

impl Geometry {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
            rotation: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Style {
    pub fill: String,
    pub stroke: String,
    pub stroke_width: f64,
}

impl Default for Style {
    fn default() -> Self {
        Self {
            fill: "#cccccc".into(),
            stroke: "#000000".into(),
            stroke_width: 1.0,
        }
    }
}

/// A persisted visual object on the shared canvas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shape {
    pub id: ShapeId,
    #[serde(rename = "type")]
    pub shape_type: ShapeType,
    #[serde(flatten)]
    pub geometry: Geometry,
    #[serde(flatten)]
    pub style: Style,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_size: Option<f64>,
    pub z_index: f64,
    pub visible: bool,
    pub locked: bool,
    pub last_modified_by: UserId,
    pub last_modified_at: Timestamp,
}

/// Input for creating a shape. Missing id and z-index are assigned by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShapeDraft {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ShapeId>,
    #[serde(rename = "type")]
    pub shape_type: ShapeType,
    #[serde(flatten)]
    pub geometry: Geometry,
    #[serde(flatten)]
    pub style: Style,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_size: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z_index: Option<f64>,
    pub visible: bool,
    pub locked: bool,
}

impl ShapeDraft {
    pub fn new(shape_type: ShapeType, geometry: Geometry) -> Self {
        Self {
            id: None,
            shape_type,
            geometry,
            style: Style::default(),
            text: None,
            font_size: None,
            z_index: None,
            visible: true,
            locked: false,
        }
    }

    pub fn with_id(mut self, id: impl Into<ShapeId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_fill(mut self, fill: impl Into<String>) -> Self {
        self.style.fill = fill.into();
        self
    }

    pub fn with_text(mut self, text: impl Into<String>, font_size: f64) -> Self {
        self.text = Some(text.into());
        self.font_size = Some(font_size);
        self
    }

    pub fn with_z_index(mut self, z_index: f64) -> Self {
        self.z_index = Some(z_index);
        self
    }
}

/// Individually timestamped fields of a shape. Last-write-wins resolves per field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ShapeField {
    Type,
    X,
    Y,
    Width,
    Height,
    Rotation,
    Fill,
    Stroke,
    StrokeWidth,
    Text,
    FontSize,
    ZIndex,
    Visible,
    Locked,
}

impl ShapeField {
    pub const ALL: [ShapeField; 14] = [
        ShapeField::Type,
        ShapeField::X,
        ShapeField::Y,
        ShapeField::Width,
        ShapeField::Height,
        ShapeField::Rotation,
        ShapeField::Fill,
        ShapeField::Stroke,
        ShapeField::StrokeWidth,
        ShapeField::Text,
        ShapeField::FontSize,
        ShapeField::ZIndex,
        ShapeField::Visible,
        ShapeField::Locked,
    ];

    /// Copy this field's value from one shape into another.
    pub fn copy(self, from: &Shape, to: &mut Shape) {
        match self {
            ShapeField::Type => to.shape_type = from.shape_type,
            ShapeField::X => to.geometry.x = from.geometry.x,
            ShapeField::Y => to.geometry.y = from.geometry.y,
            ShapeField::Width => to.geometry.width = from.geometry.width,
            ShapeField::Height => to.geometry.height = from.geometry.height,
            ShapeField::Rotation => to.geometry.rotation = from.geometry.rotation,
            ShapeField::Fill => to.style.fill = from.style.fill.clone(),
            ShapeField::Stroke => to.style.stroke = from.style.stroke.clone(),
            ShapeField::StrokeWidth => to.style.stroke_width = from.style.stroke_width,
            ShapeField::Text => to.text = from.text.clone(),
            ShapeField::FontSize => to.font_size = from.font_size,
            ShapeField::ZIndex => to.z_index = from.z_index,
            ShapeField::Visible => to.visible = from.visible,
            ShapeField::Locked => to.locked = from.locked,
        }
    }
}

/// Partial field set for an update. `None` means "leave untouched".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShapePatch {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub shape_type: Option<ShapeType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stroke: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stroke_width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_size: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z_index: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visible: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked: Option<bool>,
}

impl ShapePatch {
    pub fn position(x: f64, y: f64) -> Self {
        Self {
            x: Some(x),
            y: Some(y),
            ..Self::default()
        }
    }

    pub fn z_index(z_index: f64) -> Self {
        Self {
            z_index: Some(z_index),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields().is_empty()
    }

    /// Fields this patch touches, in canonical order.
    pub fn fields(&self) -> Vec<ShapeField> {
        ShapeField::ALL
            .into_iter()
            .filter(|f| self.touches(*f))
            .collect()
    }

    pub fn touches(&self, field: ShapeField) -> bool {
        match field {
            ShapeField::Type => self.shape_type.is_some(),
            ShapeField::X => self.x.is_some(),
            ShapeField::Y => self.y.is_some(),
            ShapeField::Width => self.width.is_some(),
            ShapeField::Height => self.height.is_some(),
            ShapeField::Rotation => self.rotation.is_some(),
            ShapeField::Fill => self.fill.is_some(),
            ShapeField::Stroke => self.stroke.is_some(),
            ShapeField::StrokeWidth => self.stroke_width.is_some(),
            ShapeField::Text => self.text.is_some(),
            ShapeField::FontSize => self.font_size.is_some(),
            ShapeField::ZIndex => self.z_index.is_some(),
            ShapeField::Visible => self.visible.is_some(),
            ShapeField::Locked => self.locked.is_some(),
        }
    }

    /// Field-level merge into `shape`; untouched fields keep their value.
    pub fn apply_to(&self, shape: &mut Shape) {
        if let Some(t) = self.shape_type {
            shape.shape_type = t;
        }
        if let Some(v) = self.x {
            shape.geometry.x = v;
        }
        if let Some(v) = self.y {
            shape.geometry.y = v;
        }
        if let Some(v) = self.width {
            shape.geometry.width = v;
        }
        if let Some(v) = self.height {
            shape.geometry.height = v;
        }
        if let Some(v) = self.rotation {
            shape.geometry.rotation = v;
        }
        if let Some(ref v) = self.fill {
            shape.style.fill = v.clone();
        }
        if let Some(ref v) = self.stroke {
            shape.style.stroke = v.clone();
        }
        if let Some(v) = self.stroke_width {
            shape.style.stroke_width = v;
        }
        if let Some(ref v) = self.text {
            shape.text = Some(v.clone());
        }
        if let Some(v) = self.font_size {
            shape.font_size = Some(v);
        }
        if let Some(v) = self.z_index {
            shape.z_index = v;
        }
        if let Some(v) = self.visible {
            shape.visible = v;
        }
        if let Some(v) = self.locked {
            shape.locked = v;
        }
    }

    /// Fold a later patch into this one; the later patch wins where both touch a field.
    pub fn merge(&mut self, later: &ShapePatch) {
        macro_rules! take_later {
            ($($field:ident),*) => {
                $(if later.$field.is_some() {
                    self.$field = later.$field.clone();
                })*
            };
        }
        take_later!(
            shape_type, x, y, width, height, rotation, fill, stroke, stroke_width, text,
            font_size, z_index, visible, locked
        );
    }
}

/// A shape as the persistence layer holds it: values plus the server timestamp
/// of the last write to each field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeRecord {
    pub shape: Shape,
    pub stamps: BTreeMap<ShapeField, Timestamp>,
}

impl ShapeRecord {
    /// Record where every field was written at `timestamp`.
    pub fn stamped(shape: Shape, timestamp: Timestamp) -> Self {
        let stamps = ShapeField::ALL.into_iter().map(|f| (f, timestamp)).collect();
        Self { shape, stamps }
    }

    pub fn stamp(&self, field: ShapeField) -> Timestamp {
        self.stamps.get(&field).copied().unwrap_or(Timestamp::MIN)
    }

    pub fn newest_stamp(&self) -> Timestamp {
        self.stamps.values().copied().max().unwrap_or(Timestamp::MIN)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Live cursor of one collaborator. Ephemeral.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    pub user_id: UserId,
    pub position: Position,
    pub display_name: String,
    pub color: String,
    pub last_heartbeat: Timestamp,
}

/// Liveness record of one collaborator, plus their current selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    pub user_id: UserId,
    pub display_name: String,
    pub last_heartbeat: Timestamp,
    #[serde(default)]
    pub selection: Vec<ShapeId>,
}

/// True when a heartbeat is older than `ttl_ms` as seen at `now`.
pub fn is_stale(last_heartbeat: Timestamp, now: Timestamp, ttl_ms: i64) -> bool {
    now - last_heartbeat > ttl_ms
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_shape() -> Shape {
        Shape {
            id: "s1".into(),
            shape_type: ShapeType::Rectangle,
            geometry: Geometry::new(10.0, 20.0, 100.0, 50.0),
            style: Style::default(),
            text: None,
            font_size: None,
            z_index: 1.0,
            visible: true,
            locked: false,
            last_modified_by: "alice".into(),
            last_modified_at: 0,
        }
    }

    #[test]
    fn test_shape_type_parsing() {
        assert_eq!("Rectangle".parse::<ShapeType>(), Ok(ShapeType::Rectangle));
        assert_eq!("circle".parse::<ShapeType>(), Ok(ShapeType::Ellipse));
        assert_eq!(" text ".parse::<ShapeType>(), Ok(ShapeType::Text));
        assert!("hexagon".parse::<ShapeType>().is_err());
    }

    #[test]
    fn test_shape_serializes_flat_camel_case() {
        let json = serde_json::to_value(sample_shape()).unwrap();
        assert_eq!(json["type"], "rectangle");
        assert_eq!(json["x"], 10.0);
        assert_eq!(json["strokeWidth"], 1.0);
        assert_eq!(json["zIndex"], 1.0);
        assert_eq!(json["lastModifiedBy"], "alice");
        assert!(json.get("text").is_none());
    }

    #[test]
    fn test_patch_applies_only_touched_fields() {
        let mut shape = sample_shape();
        let patch = ShapePatch {
            fill: Some("#ff0000".into()),
            x: Some(42.0),
            ..ShapePatch::default()
        };
        patch.apply_to(&mut shape);
        assert_eq!(shape.geometry.x, 42.0);
        assert_eq!(shape.geometry.y, 20.0);
        assert_eq!(shape.style.fill, "#ff0000");
        assert_eq!(patch.fields(), vec![ShapeField::X, ShapeField::Fill]);
    }

    #[test]
    fn test_patch_merge_later_wins() {
        let mut first = ShapePatch::position(1.0, 2.0);
        let later = ShapePatch {
            y: Some(5.0),
            locked: Some(true),
            ..ShapePatch::default()
        };
        first.merge(&later);
        assert_eq!(first.x, Some(1.0));
        assert_eq!(first.y, Some(5.0));
        assert_eq!(first.locked, Some(true));
    }

    #[test]
    fn test_field_copy() {
        let from = Shape {
            text: Some("hi".into()),
            ..sample_shape()
        };
        let mut to = sample_shape();
        ShapeField::Text.copy(&from, &mut to);
        assert_eq!(to.text.as_deref(), Some("hi"));
    }

    #[test]
    fn test_record_stamps() {
        let record = ShapeRecord::stamped(sample_shape(), 7);
        assert_eq!(record.stamp(ShapeField::Fill), 7);
        assert_eq!(record.newest_stamp(), 7);
    }

    #[test]
    fn test_staleness_boundary() {
        assert!(!is_stale(0, 29_999, 30_000));
        assert!(!is_stale(0, 30_000, 30_000));
        assert!(is_stale(0, 30_001, 30_000));
    }
}
