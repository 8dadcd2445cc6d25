//! Command translator: natural-language instructions to canvas edits.
//!
//! An instruction goes through caller verification, the per-user quota and
//! the global concurrency cap, then one inference request carrying the
//! canvas snapshot and tool schemas. Each returned tool call is validated on
//! its own and the valid ones are applied to the session together.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use shapeshare_providers::{InferenceError, Usage};
use shapeshare_sync::SessionError;

pub mod auth;
pub mod prompt;
pub mod quota;
pub mod snapshot;
pub mod translator;

pub use auth::Caller;
pub use translator::CommandTranslator;

/// Which limit was hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Exhausted {
    /// The account behind the model has no quota left.
    Quota,
    /// Too many requests right now; retry later.
    RateLimit,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("resource exhausted ({kind:?}): {message}")]
    ResourceExhausted { kind: Exhausted, message: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl CommandError {
    pub fn rate_limited(message: impl Into<String>) -> Self {
        CommandError::ResourceExhausted {
            kind: Exhausted::RateLimit,
            message: message.into(),
        }
    }

    /// Short label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            CommandError::Unauthenticated(_) => "unauthenticated",
            CommandError::InvalidArgument(_) => "invalid_argument",
            CommandError::ResourceExhausted {
                kind: Exhausted::Quota,
                ..
            } => "quota",
            CommandError::ResourceExhausted {
                kind: Exhausted::RateLimit,
                ..
            } => "rate_limit",
            CommandError::Internal(_) => "internal",
        }
    }
}

impl From<InferenceError> for CommandError {
    fn from(e: InferenceError) -> Self {
        match e {
            InferenceError::Unauthenticated(m) => CommandError::Internal(format!(
                "model endpoint rejected our credentials: {m}"
            )),
            InferenceError::InvalidArgument(m) => CommandError::InvalidArgument(m),
            InferenceError::Quota(message) => CommandError::ResourceExhausted {
                kind: Exhausted::Quota,
                message,
            },
            InferenceError::RateLimited(message) => CommandError::rate_limited(message),
            InferenceError::Timeout => CommandError::Internal("model request timed out".into()),
            InferenceError::Internal(m) => CommandError::Internal(m),
        }
    }
}

impl From<SessionError> for CommandError {
    fn from(e: SessionError) -> Self {
        CommandError::Internal(e.to_string())
    }
}

/// A tool call whose operation reached the canvas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedCall {
    pub call_id: String,
    pub tool: String,
    /// Ids of shapes created or changed.
    pub shape_ids: Vec<String>,
}

/// A tool call that was refused, with the reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedCall {
    pub call_id: String,
    pub tool: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    /// Every tool call applied (or there were none).
    Success,
    /// Some calls applied, some were rejected.
    Partial,
    /// Every tool call was rejected.
    Rejected,
}

/// What happened to one instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandReport {
    /// The model's text reply, if any.
    pub message: String,
    pub applied: Vec<AppliedCall>,
    pub rejected: Vec<RejectedCall>,
    pub usage: Option<Usage>,
}

impl CommandReport {
    pub fn status(&self) -> CommandStatus {
        match (self.applied.is_empty(), self.rejected.is_empty()) {
            (_, true) => CommandStatus::Success,
            (true, false) => CommandStatus::Rejected,
            (false, false) => CommandStatus::Partial,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn applied(id: &str) -> AppliedCall {
        AppliedCall {
            call_id: id.into(),
            tool: "createShape".into(),
            shape_ids: vec![format!("shape-{id}")],
        }
    }

    fn rejected(id: &str) -> RejectedCall {
        RejectedCall {
            call_id: id.into(),
            tool: "createShape".into(),
            reason: "missing required field 'x'".into(),
        }
    }

    #[test]
    fn test_report_status_distinguishes_partial() {
        let mut report = CommandReport {
            message: String::new(),
            applied: vec![applied("1")],
            rejected: Vec::new(),
            usage: None,
        };
        assert_eq!(report.status(), CommandStatus::Success);

        report.rejected.push(rejected("2"));
        assert_eq!(report.status(), CommandStatus::Partial);

        report.applied.clear();
        assert_eq!(report.status(), CommandStatus::Rejected);
    }

    #[test]
    fn test_inference_errors_map_to_categories() {
        assert_eq!(
            CommandError::from(InferenceError::Quota("out".into())).label(),
            "quota"
        );
        assert_eq!(
            CommandError::from(InferenceError::RateLimited("slow".into())).label(),
            "rate_limit"
        );
        assert_eq!(
            CommandError::from(InferenceError::InvalidArgument("bad".into())).label(),
            "invalid_argument"
        );
        assert_eq!(CommandError::from(InferenceError::Timeout).label(), "internal");
    }
}
