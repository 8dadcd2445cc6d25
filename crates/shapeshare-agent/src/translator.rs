//! Instruction → inference → validated canvas edits.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use shapeshare_core::config::Config;
use shapeshare_providers::{InferenceGateway, InferenceRequest, ToolCall};
use shapeshare_sync::{ActionOutcome, LocalAction, SessionHandle};
use shapeshare_tools::{CanvasOperation, ToolRegistry};

use crate::auth::{self, Caller};
use crate::prompt::build_system_prompt;
use crate::quota::QuotaTracker;
use crate::snapshot;
use crate::{AppliedCall, CommandError, CommandReport, RejectedCall};

/// Longest instruction accepted, in characters.
pub const MAX_INSTRUCTION_CHARS: usize = 2_000;

pub struct CommandTranslator {
    gateway: Arc<dyn InferenceGateway>,
    tools: ToolRegistry,
    config: Arc<Config>,
    in_flight: Semaphore,
    quota: QuotaTracker,
}

/// Expand a validated operation into session actions.
fn push_actions(op: CanvasOperation, actions: &mut Vec<LocalAction>) {
    match op {
        CanvasOperation::Create(draft) => actions.push(LocalAction::Create(draft)),
        CanvasOperation::CreateMany(drafts) => {
            actions.extend(drafts.into_iter().map(LocalAction::Create));
        }
        CanvasOperation::Update { id, patch } => actions.push(LocalAction::Update { id, patch }),
        CanvasOperation::Delete { id } => actions.push(LocalAction::Delete { id }),
        CanvasOperation::GetState => {}
    }
}

impl CommandTranslator {
    pub fn new(gateway: Arc<dyn InferenceGateway>, config: Arc<Config>) -> Self {
        Self {
            in_flight: Semaphore::new(config.ai_max_concurrent()),
            quota: QuotaTracker::new(config.commands_per_minute()),
            tools: ToolRegistry::canvas(),
            gateway,
            config,
        }
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Translate one instruction and apply the resulting edits to `session`.
    pub async fn translate(
        &self,
        caller: &Caller,
        instruction: &str,
        session: &SessionHandle,
    ) -> Result<CommandReport, CommandError> {
        let result = self.run(caller, instruction, session).await;

        #[cfg(feature = "metrics")]
        {
            let outcome = match &result {
                Ok(report) => match report.status() {
                    crate::CommandStatus::Success => "success",
                    crate::CommandStatus::Partial => "partial",
                    crate::CommandStatus::Rejected => "rejected",
                },
                Err(e) => e.label(),
            };
            metrics::counter!("shapeshare_ai_commands_total", "outcome" => outcome).increment(1);
        }

        if let Err(ref e) = result {
            warn!(user_id = %caller.user_id, error = %e, "Command failed");
        }
        result
    }

    async fn run(
        &self,
        caller: &Caller,
        instruction: &str,
        session: &SessionHandle,
    ) -> Result<CommandReport, CommandError> {
        auth::verify(&self.config, caller)?;

        let instruction = instruction.trim();
        if instruction.is_empty() {
            return Err(CommandError::InvalidArgument("instruction is empty".into()));
        }
        if instruction.chars().count() > MAX_INSTRUCTION_CHARS {
            return Err(CommandError::InvalidArgument(format!(
                "instruction is longer than {MAX_INSTRUCTION_CHARS} characters"
            )));
        }

        // Only commands that get a slot count against the caller's minute.
        let permit = self
            .in_flight
            .try_acquire()
            .map_err(|_| CommandError::rate_limited("too many AI commands in flight"))?;
        if !self.quota.check(&caller.user_id) {
            return Err(CommandError::rate_limited(format!(
                "at most {} commands per minute",
                self.config.commands_per_minute()
            )));
        }

        let shapes = session.shapes().await?;
        let state = snapshot::summarize(&shapes, self.config.snapshot_max_shapes());
        let request = InferenceRequest {
            model: self.config.ai_model(),
            system_prompt: build_system_prompt(&self.tools, &state),
            message: instruction.to_string(),
            tools: self.tools.to_llm_tools(),
            temperature: self.config.ai_temperature(),
            max_tokens: self.config.ai_max_tokens(),
        };

        info!(
            user_id = %caller.user_id,
            gateway = self.gateway.id(),
            model = %request.model,
            shapes = shapes.len(),
            "Translating command"
        );

        let response = tokio::time::timeout(self.config.ai_timeout(), self.gateway.invoke(&request))
            .await
            .map_err(|_| CommandError::Internal("model request timed out".into()))??;
        drop(permit);

        let mut report = CommandReport {
            message: response.message,
            applied: Vec::new(),
            rejected: Vec::new(),
            usage: response.usage,
        };

        let mut actions = Vec::new();
        let mut planned: Vec<(ToolCall, usize)> = Vec::new();
        for call in response.tool_calls {
            match self.tools.validate_call(&call.name, &call.arguments) {
                Ok(op) => {
                    let before = actions.len();
                    push_actions(op, &mut actions);
                    planned.push((call, actions.len() - before));
                }
                Err(e) => {
                    warn!(call_id = %call.id, tool = %call.name, error = %e, "Tool call rejected");
                    report.rejected.push(RejectedCall {
                        call_id: call.id,
                        tool: call.name,
                        reason: e.to_string(),
                    });
                }
            }
        }

        let outcomes = if actions.is_empty() {
            Vec::new()
        } else {
            session.apply(actions).await?
        };
        let mut outcomes = outcomes.into_iter();

        for (call, count) in planned {
            let mut shape_ids = Vec::new();
            let mut failure = None;
            for outcome in outcomes.by_ref().take(count) {
                match outcome {
                    Ok(ActionOutcome::Created(shape)) => shape_ids.push(shape.id),
                    Ok(
                        ActionOutcome::Updated(id)
                        | ActionOutcome::Deleted(id)
                        | ActionOutcome::Reordered(id),
                    ) => shape_ids.push(id),
                    Err(e) => {
                        failure.get_or_insert(e.to_string());
                    }
                }
            }
            match failure {
                None => {
                    debug!(call_id = %call.id, tool = %call.name, ?shape_ids, "Tool call applied");
                    report.applied.push(AppliedCall {
                        call_id: call.id,
                        tool: call.name,
                        shape_ids,
                    });
                }
                Some(reason) => {
                    warn!(call_id = %call.id, tool = %call.name, %reason, "Tool call refused by store");
                    report.rejected.push(RejectedCall {
                        call_id: call.id,
                        tool: call.name,
                        reason,
                    });
                }
            }
        }

        info!(
            user_id = %caller.user_id,
            applied = report.applied.len(),
            rejected = report.rejected.len(),
            status = ?report.status(),
            "Command translated"
        );
        Ok(report)
    }
}
