//! Typed reading of untrusted tool-call arguments.

use serde_json::{Map, Value};
use thiserror::Error;

use shapeshare_core::color::resolve_color;
use shapeshare_core::types::{Geometry, ShapeDraft, ShapePatch, ShapeType, Style};

/// Canvas coordinates accepted from the model.
pub const COORD_RANGE: (f64, f64) = (-100_000.0, 100_000.0);
pub const SIZE_RANGE: (f64, f64) = (1.0, 10_000.0);
pub const ROTATION_RANGE: (f64, f64) = (-360.0, 360.0);
pub const STROKE_WIDTH_RANGE: (f64, f64) = (0.0, 100.0);
pub const FONT_SIZE_RANGE: (f64, f64) = (1.0, 512.0);
pub const MAX_TEXT_LEN: usize = 2_000;

pub const DEFAULT_WIDTH: f64 = 100.0;
pub const DEFAULT_HEIGHT: f64 = 100.0;
pub const DEFAULT_TEXT_WIDTH: f64 = 200.0;
pub const DEFAULT_TEXT_HEIGHT: f64 = 40.0;
pub const DEFAULT_FONT_SIZE: f64 = 16.0;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("arguments must be a JSON object")]
    NotAnObject,

    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("field '{field}' must be {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },

    #[error("field '{field}' = {value} is outside [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("field '{field}' has unsupported value '{value}'")]
    UnknownVariant { field: &'static str, value: String },

    #[error("field '{field}' is not a colour: '{value}'")]
    InvalidColor { field: &'static str, value: String },

    #[error("field '{field}' is longer than {max} characters")]
    TooLong { field: &'static str, max: usize },

    #[error("{0}")]
    Invalid(String),

    #[error("shape {index}: {source}")]
    InBatch {
        index: usize,
        source: Box<ValidationError>,
    },
}

/// Borrowed view over a tool call's argument object.
pub struct Args<'a> {
    map: &'a Map<String, Value>,
}

impl<'a> Args<'a> {
    pub fn new(arguments: &'a Value) -> Result<Self, ValidationError> {
        arguments
            .as_object()
            .map(|map| Self { map })
            .ok_or(ValidationError::NotAnObject)
    }

    fn present(&self, field: &'static str) -> Option<&'a Value> {
        self.map.get(field).filter(|v| !v.is_null())
    }

    pub fn optional_f64(
        &self,
        field: &'static str,
        (min, max): (f64, f64),
    ) -> Result<Option<f64>, ValidationError> {
        let Some(value) = self.present(field) else {
            return Ok(None);
        };
        let n = value.as_f64().filter(|n| n.is_finite()).ok_or(ValidationError::WrongType {
            field,
            expected: "a finite number",
        })?;
        if n < min || n > max {
            return Err(ValidationError::OutOfRange {
                field,
                value: n,
                min,
                max,
            });
        }
        Ok(Some(n))
    }

    pub fn required_f64(
        &self,
        field: &'static str,
        range: (f64, f64),
    ) -> Result<f64, ValidationError> {
        self.optional_f64(field, range)?
            .ok_or(ValidationError::MissingField(field))
    }

    pub fn optional_str(&self, field: &'static str) -> Result<Option<&'a str>, ValidationError> {
        match self.present(field) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(_) => Err(ValidationError::WrongType {
                field,
                expected: "a string",
            }),
        }
    }

    pub fn required_str(&self, field: &'static str) -> Result<&'a str, ValidationError> {
        match self.optional_str(field)? {
            Some(s) if !s.trim().is_empty() => Ok(s),
            _ => Err(ValidationError::MissingField(field)),
        }
    }

    pub fn optional_bool(&self, field: &'static str) -> Result<Option<bool>, ValidationError> {
        match self.present(field) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(_) => Err(ValidationError::WrongType {
                field,
                expected: "a boolean",
            }),
        }
    }

    pub fn optional_color(&self, field: &'static str) -> Result<Option<String>, ValidationError> {
        let Some(raw) = self.optional_str(field)? else {
            return Ok(None);
        };
        resolve_color(raw)
            .map(Some)
            .ok_or_else(|| ValidationError::InvalidColor {
                field,
                value: raw.to_string(),
            })
    }

    pub fn optional_text(&self, field: &'static str) -> Result<Option<String>, ValidationError> {
        match self.optional_str(field)? {
            Some(s) if s.chars().count() > MAX_TEXT_LEN => Err(ValidationError::TooLong {
                field,
                max: MAX_TEXT_LEN,
            }),
            other => Ok(other.map(str::to_string)),
        }
    }

    pub fn shape_type(&self, field: &'static str) -> Result<ShapeType, ValidationError> {
        let raw = self.required_str(field)?;
        raw.parse().map_err(|_| ValidationError::UnknownVariant {
            field,
            value: raw.to_string(),
        })
    }

    pub fn array(&self, field: &'static str) -> Result<&'a Vec<Value>, ValidationError> {
        match self.present(field) {
            None => Err(ValidationError::MissingField(field)),
            Some(Value::Array(items)) => Ok(items),
            Some(_) => Err(ValidationError::WrongType {
                field,
                expected: "an array",
            }),
        }
    }
}

/// Validate a createShape argument object into a draft.
pub fn shape_draft(arguments: &Value) -> Result<ShapeDraft, ValidationError> {
    let args = Args::new(arguments)?;
    let shape_type = args.shape_type("type")?;
    let x = args.required_f64("x", COORD_RANGE)?;
    let y = args.required_f64("y", COORD_RANGE)?;

    let (default_width, default_height) = match shape_type {
        ShapeType::Text => (DEFAULT_TEXT_WIDTH, DEFAULT_TEXT_HEIGHT),
        _ => (DEFAULT_WIDTH, DEFAULT_HEIGHT),
    };
    let mut geometry = Geometry::new(
        x,
        y,
        args.optional_f64("width", SIZE_RANGE)?.unwrap_or(default_width),
        args.optional_f64("height", SIZE_RANGE)?.unwrap_or(default_height),
    );
    geometry.rotation = args.optional_f64("rotation", ROTATION_RANGE)?.unwrap_or(0.0);

    let defaults = Style::default();
    let style = Style {
        fill: args.optional_color("fill")?.unwrap_or(defaults.fill),
        stroke: args.optional_color("stroke")?.unwrap_or(defaults.stroke),
        stroke_width: args
            .optional_f64("strokeWidth", STROKE_WIDTH_RANGE)?
            .unwrap_or(defaults.stroke_width),
    };

    let mut draft = ShapeDraft::new(shape_type, geometry);
    draft.style = style;
    if shape_type == ShapeType::Text {
        let text = args
            .optional_text("text")?
            .filter(|t| !t.trim().is_empty())
            .ok_or(ValidationError::MissingField("text"))?;
        let font_size = args
            .optional_f64("fontSize", FONT_SIZE_RANGE)?
            .unwrap_or(DEFAULT_FONT_SIZE);
        draft = draft.with_text(text, font_size);
    }
    Ok(draft)
}

/// Validate the field set of an updateShape call. The shape id is read separately.
pub fn shape_patch(args: &Args<'_>) -> Result<ShapePatch, ValidationError> {
    let shape_type = match args.optional_str("type")? {
        None => None,
        Some(_) => Some(args.shape_type("type")?),
    };
    let patch = ShapePatch {
        shape_type,
        x: args.optional_f64("x", COORD_RANGE)?,
        y: args.optional_f64("y", COORD_RANGE)?,
        width: args.optional_f64("width", SIZE_RANGE)?,
        height: args.optional_f64("height", SIZE_RANGE)?,
        rotation: args.optional_f64("rotation", ROTATION_RANGE)?,
        fill: args.optional_color("fill")?,
        stroke: args.optional_color("stroke")?,
        stroke_width: args.optional_f64("strokeWidth", STROKE_WIDTH_RANGE)?,
        text: args.optional_text("text")?,
        font_size: args.optional_f64("fontSize", FONT_SIZE_RANGE)?,
        z_index: None,
        visible: args.optional_bool("visible")?,
        locked: args.optional_bool("locked")?,
    };
    if patch.is_empty() {
        return Err(ValidationError::Invalid(
            "updateShape needs at least one field to change".into(),
        ));
    }
    Ok(patch)
}
