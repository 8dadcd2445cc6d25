//! getState: read-only; the snapshot already travels with the prompt.

use serde_json::{Value, json};

use crate::validate::ValidationError;
use crate::{CanvasOperation, CanvasTool};

pub struct GetStateTool;

impl CanvasTool for GetStateTool {
    fn name(&self) -> &str {
        "getState"
    }

    fn description(&self) -> &str {
        "Return the current canvas shapes. Does not change anything."
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    fn validate(&self, arguments: &Value) -> Result<CanvasOperation, ValidationError> {
        match arguments {
            Value::Object(_) | Value::Null => Ok(CanvasOperation::GetState),
            _ => Err(ValidationError::NotAnObject),
        }
    }
}
