use crate::provider::ProviderError;
use crate::validator::ValidationError;

/// Stable error taxonomy for the Agent Execution Core.
///
/// Model-recoverable errors (anything the LLM could react to by choosing
/// differently on the next turn) never reach this enum — the Tool Executor
/// and Agent Runner turn those into a `ToolResult` message instead. What's
/// left here is the set of terminal or infrastructure failures that end a
/// run, plus a couple of variants callers may want to match on even though
/// the runner itself recovers from them (`ContextUpdateTypeError` fails a
/// single tool call, never the run).
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("tool argument validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("tool '{tool_name}' timed out on attempt {attempt}")]
    ToolTimeout { tool_name: String, attempt: u32 },

    #[error("tool '{tool_name}' raised an exception: {message}")]
    ToolHandlerException { tool_name: String, message: String },

    #[error("context update type error: {0}")]
    ContextUpdateTypeError(String),

    #[error("approval for tool call {call_id} was rejected: {reason}")]
    ApprovalRejected { call_id: String, reason: String },

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("max iterations ({max_iterations}) reached")]
    MaxIterationsReached { max_iterations: u32 },

    #[error("model ignored tool_choice=required twice in a row")]
    ToolChoiceViolation,

    #[error("run exceeded its wall-clock timeout")]
    Timeout,

    #[error("run cancelled: {0}")]
    Cancelled(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),
}

impl CoreError {
    /// Stable `kind` tag, independent of the human-readable
    /// `Display` text. Telemetry sinks key off this, not `Display`.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "ValidationError",
            CoreError::ToolTimeout { .. } => "ToolTimeout",
            CoreError::ToolHandlerException { .. } => "ToolHandlerException",
            CoreError::ContextUpdateTypeError(_) => "ContextUpdateTypeError",
            CoreError::ApprovalRejected { .. } => "ApprovalRejected",
            CoreError::Provider(e) => e.kind(),
            CoreError::MaxIterationsReached { .. } => "MaxIterationsReached",
            CoreError::ToolChoiceViolation => "ToolChoiceViolation",
            CoreError::Timeout => "Timeout",
            CoreError::Cancelled(_) => "Cancelled",
            CoreError::UnknownTool(_) => "UnknownTool",
        }
    }

    /// Whether this error is meant to reach a human, rather than being
    /// folded into a tool result the model already saw.
    pub fn user_visible(&self) -> bool {
        matches!(
            self,
            CoreError::Provider(ProviderError::Auth(_))
                | CoreError::Provider(ProviderError::BadRequest(_))
                | CoreError::Provider(ProviderError::Parse(_))
                | CoreError::MaxIterationsReached { .. }
                | CoreError::ToolChoiceViolation
                | CoreError::Timeout
                | CoreError::Cancelled(_)
        )
    }
}
