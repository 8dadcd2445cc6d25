//! Canvas tools exposed to the model.
//!
//! Each tool implements [`CanvasTool`]: a name, a description and a JSON
//! schema for the model, and a validator that turns the model's untrusted
//! arguments into a typed [`CanvasOperation`].

use serde_json::Value;
use tracing::debug;

use shapeshare_core::types::{ShapeDraft, ShapeId, ShapePatch};
use shapeshare_providers::ToolSchema;

pub mod create_multiple;
pub mod create_shape;
pub mod delete_shape;
pub mod get_state;
pub mod update_shape;
pub mod validate;

pub use validate::ValidationError;

/// Version of the tool schemas below. Bumped whenever a schema changes shape.
pub const TOOLSET_VERSION: &str = "canvas-tools/1";

/// A validated canvas edit requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub enum CanvasOperation {
    Create(ShapeDraft),
    CreateMany(Vec<ShapeDraft>),
    Update { id: ShapeId, patch: ShapePatch },
    Delete { id: ShapeId },
    GetState,
}

/// A tool the model may call to edit the canvas.
pub trait CanvasTool: Send + Sync {
    /// Tool name as exposed to the model (e.g. "createShape").
    fn name(&self) -> &str;

    /// Human-readable description for the model.
    fn description(&self) -> &str;

    /// JSON Schema describing the tool's parameters.
    fn parameters_schema(&self) -> Value;

    /// Validate arguments into an operation.
    fn validate(&self, arguments: &Value) -> Result<CanvasOperation, ValidationError>;
}

/// Registry of available tools.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Box<dyn CanvasTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the full canvas toolset.
    pub fn canvas() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(create_shape::CreateShapeTool));
        registry.register(Box::new(update_shape::UpdateShapeTool));
        registry.register(Box::new(delete_shape::DeleteShapeTool));
        registry.register(Box::new(create_multiple::CreateMultipleShapesTool));
        registry.register(Box::new(get_state::GetStateTool));
        registry
    }

    pub fn register(&mut self, tool: Box<dyn CanvasTool>) {
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<&dyn CanvasTool> {
        self.tools.iter().find(|t| t.name() == name).map(|t| t.as_ref())
    }

    pub fn list(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    /// Tool definitions for the inference request.
    pub fn to_llm_tools(&self) -> Vec<ToolSchema> {
        self.tools
            .iter()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect()
    }

    /// Validate one tool call by name.
    pub fn validate_call(
        &self,
        name: &str,
        arguments: &Value,
    ) -> Result<CanvasOperation, ValidationError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ValidationError::UnknownTool(name.to_string()))?;
        let result = tool.validate(arguments);
        if let Err(ref e) = result {
            debug!(tool = name, error = %e, "Rejected tool call");
        }
        result
    }
}
