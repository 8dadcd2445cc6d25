//! Bounded canvas summary handed to the model.

use serde_json::{Map, Value, json};

use shapeshare_core::types::{Shape, ShapeType};

/// Characters of shape text kept in the summary.
pub const MAX_TEXT_CHARS: usize = 80;

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max).collect();
    out.push('…');
    out
}

fn summarize_shape(shape: &Shape) -> Value {
    let mut entry = Map::new();
    entry.insert("id".into(), json!(shape.id));
    entry.insert("type".into(), json!(shape.shape_type.as_str()));
    entry.insert("x".into(), json!(shape.geometry.x));
    entry.insert("y".into(), json!(shape.geometry.y));
    entry.insert("width".into(), json!(shape.geometry.width));
    entry.insert("height".into(), json!(shape.geometry.height));
    if shape.geometry.rotation != 0.0 {
        entry.insert("rotation".into(), json!(shape.geometry.rotation));
    }
    entry.insert("fill".into(), json!(shape.style.fill));
    if shape.shape_type == ShapeType::Text {
        if let Some(ref text) = shape.text {
            entry.insert("text".into(), json!(truncate(text, MAX_TEXT_CHARS)));
        }
    }
    if shape.locked {
        entry.insert("locked".into(), json!(true));
    }
    if !shape.visible {
        entry.insert("visible".into(), json!(false));
    }
    Value::Object(entry)
}

/// One JSON object per line, topmost shape first, at most `max_shapes` lines.
pub fn summarize(shapes: &[Shape], max_shapes: usize) -> String {
    if shapes.is_empty() {
        return "The canvas is empty.".to_string();
    }
    let mut lines: Vec<String> = shapes
        .iter()
        .take(max_shapes)
        .map(|s| summarize_shape(s).to_string())
        .collect();
    if shapes.len() > max_shapes {
        lines.push(format!(
            "({} more shapes not shown)",
            shapes.len() - max_shapes
        ));
    }
    lines.join("\n")
}
