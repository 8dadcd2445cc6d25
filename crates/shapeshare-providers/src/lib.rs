//! Inference gateway abstraction.
//!
//! The command translator talks to a model through [`InferenceGateway`]: one
//! non-streaming request carrying a system prompt, the user's message and the
//! canvas tool schemas, answered by text plus zero or more tool calls.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod openai;

/// A function the model may call, in JSON-schema form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// A single inference request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub model: String,
    pub system_prompt: String,
    pub message: String,
    pub tools: Vec<ToolSchema>,
    pub temperature: f64,
    pub max_tokens: u32,
}

/// A tool call returned by the model. Arguments are untrusted JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub message: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InferenceError {
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("quota exhausted: {0}")]
    Quota(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("inference timed out")]
    Timeout,

    #[error("internal error: {0}")]
    Internal(String),
}

/// The model endpoint used by the command translator.
#[async_trait]
pub trait InferenceGateway: Send + Sync {
    /// Gateway identifier (e.g. "openai").
    fn id(&self) -> &str;

    /// Run one completion.
    async fn invoke(&self, request: &InferenceRequest) -> Result<InferenceResponse, InferenceError>;
}
