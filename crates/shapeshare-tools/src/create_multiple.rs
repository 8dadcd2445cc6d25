//! createMultipleShapes: several shapes in one call.
//!
//! The batch is validated as a unit: one bad item rejects the whole call.

use serde_json::{Value, json};

use crate::validate::{self, Args, ValidationError};
use crate::{CanvasOperation, CanvasTool};

pub const MAX_BATCH: usize = 50;

pub struct CreateMultipleShapesTool;

impl CanvasTool for CreateMultipleShapesTool {
    fn name(&self) -> &str {
        "createMultipleShapes"
    }

    fn description(&self) -> &str {
        "Create several shapes at once, e.g. a row of buttons or a grid. All shapes must be valid."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "shapes": {
                    "type": "array",
                    "minItems": 1,
                    "maxItems": MAX_BATCH,
                    "items": {
                        "type": "object",
                        "properties": crate::create_shape::shape_properties(),
                        "required": ["type", "x", "y"]
                    }
                }
            },
            "required": ["shapes"]
        })
    }

    fn validate(&self, arguments: &Value) -> Result<CanvasOperation, ValidationError> {
        let args = Args::new(arguments)?;
        let items = args.array("shapes")?;
        if items.is_empty() {
            return Err(ValidationError::Invalid("shapes must not be empty".into()));
        }
        if items.len() > MAX_BATCH {
            return Err(ValidationError::Invalid(format!(
                "at most {MAX_BATCH} shapes per call, got {}",
                items.len()
            )));
        }
        items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                validate::shape_draft(item).map_err(|e| ValidationError::InBatch {
                    index,
                    source: Box::new(e),
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(CanvasOperation::CreateMany)
    }
}
