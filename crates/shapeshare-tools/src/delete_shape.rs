//! deleteShape: remove a shape.

use serde_json::{Value, json};

use crate::validate::{Args, ValidationError};
use crate::{CanvasOperation, CanvasTool};

pub struct DeleteShapeTool;

impl CanvasTool for DeleteShapeTool {
    fn name(&self) -> &str {
        "deleteShape"
    }

    fn description(&self) -> &str {
        "Delete the shape with the given shapeId."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "shapeId": { "type": "string", "description": "Id of the shape to delete" }
            },
            "required": ["shapeId"]
        })
    }

    fn validate(&self, arguments: &Value) -> Result<CanvasOperation, ValidationError> {
        let args = Args::new(arguments)?;
        let id = args.required_str("shapeId")?.to_string();
        Ok(CanvasOperation::Delete { id })
    }
}
