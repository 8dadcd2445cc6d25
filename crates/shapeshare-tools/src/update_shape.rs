//! updateShape: change fields of an existing shape.

use serde_json::{Value, json};

use crate::validate::{self, Args, ValidationError};
use crate::{CanvasOperation, CanvasTool};

pub struct UpdateShapeTool;

impl CanvasTool for UpdateShapeTool {
    fn name(&self) -> &str {
        "updateShape"
    }

    fn description(&self) -> &str {
        "Change one or more properties of an existing shape, identified by shapeId. Only the given fields change."
    }

    fn parameters_schema(&self) -> Value {
        let mut properties = crate::create_shape::shape_properties();
        if let Some(map) = properties.as_object_mut() {
            map.insert(
                "shapeId".into(),
                json!({ "type": "string", "description": "Id of the shape to change" }),
            );
            map.insert("visible".into(), json!({ "type": "boolean" }));
            map.insert("locked".into(), json!({ "type": "boolean" }));
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": ["shapeId"]
        })
    }

    fn validate(&self, arguments: &Value) -> Result<CanvasOperation, ValidationError> {
        let args = Args::new(arguments)?;
        let id = args.required_str("shapeId")?.to_string();
        let patch = validate::shape_patch(&args)?;
        Ok(CanvasOperation::Update { id, patch })
    }
}
