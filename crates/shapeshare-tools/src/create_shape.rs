//! createShape: add one shape to the canvas.

use serde_json::{Value, json};

use crate::validate::{self, ValidationError};
use crate::{CanvasOperation, CanvasTool};

/// Properties shared by createShape and each item of createMultipleShapes.
pub(crate) fn shape_properties() -> Value {
    json!({
        "type": {
            "type": "string",
            "enum": ["rectangle", "ellipse", "text"],
            "description": "Kind of shape"
        },
        "x": { "type": "number", "description": "Left edge in canvas pixels" },
        "y": { "type": "number", "description": "Top edge in canvas pixels" },
        "width": { "type": "number", "minimum": 1, "description": "Width in pixels (default 100)" },
        "height": { "type": "number", "minimum": 1, "description": "Height in pixels (default 100)" },
        "rotation": { "type": "number", "description": "Rotation in degrees" },
        "fill": { "type": "string", "description": "Fill colour: a CSS name like \"blue\" or a hex code" },
        "stroke": { "type": "string", "description": "Outline colour" },
        "strokeWidth": { "type": "number", "minimum": 0 },
        "text": { "type": "string", "description": "Text content, required for text shapes" },
        "fontSize": { "type": "number", "minimum": 1 }
    })
}

pub struct CreateShapeTool;

impl CanvasTool for CreateShapeTool {
    fn name(&self) -> &str {
        "createShape"
    }

    fn description(&self) -> &str {
        "Create a single shape on the canvas. Coordinates are the top-left corner."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": shape_properties(),
            "required": ["type", "x", "y"]
        })
    }

    fn validate(&self, arguments: &Value) -> Result<CanvasOperation, ValidationError> {
        validate::shape_draft(arguments).map(CanvasOperation::Create)
    }
}
