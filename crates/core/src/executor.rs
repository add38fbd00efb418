use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::instrument;

use crate::backoff;
use crate::context::{ContextUpdate, RunContext};
use crate::hitl::{ApprovalDecision, ApprovalHandler, ApprovalRequest, AutoApprove};
use crate::message::{Message, ToolCall};
use crate::registry::{ToolOutcome, ToolRegistry};
use crate::telemetry::{NoopObserver, Observer, TelemetryEvent};
use crate::usage::Usage;
use crate::validator::validate_arguments;

/// Runs one dispatched tool call through lookup, argument validation, the
/// approval gate, and a timeout/retry loop, finally folding the result
/// into a `ToolResult` message the model gets to see.
///
/// Every failure mode this executes — an unknown tool, bad arguments, a
/// rejected approval, a timed-out handler — ends the same way: a
/// `ToolResult` message with `is_error = true`, never a propagated error.
/// That's deliberate: a tool failure is something the model can
/// react to on its next turn, not a reason to abort the run.
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    approval: Arc<dyn ApprovalHandler>,
    observer: Arc<dyn Observer>,
    default_timeout: Duration,
    approval_timeout: Duration,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            approval: Arc::new(AutoApprove),
            observer: Arc::new(NoopObserver),
            default_timeout: Duration::from_secs(30),
            approval_timeout: Duration::from_secs(300),
            backoff_base: Duration::from_millis(250),
            backoff_max: Duration::from_secs(10),
        }
    }

    pub fn with_approval_handler(mut self, handler: Arc<dyn ApprovalHandler>) -> Self {
        self.approval = handler;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_approval_timeout(mut self, timeout: Duration) -> Self {
        self.approval_timeout = timeout;
        self
    }

    #[instrument(skip(self, call, ctx), fields(session_id = %ctx.session_id, tool_name = %call.name, call_id = %call.id, attempt = tracing::field::Empty, is_error = tracing::field::Empty))]
    pub async fn execute(&self, call: &ToolCall, ctx: RunContext) -> (Message, Vec<ContextUpdate>, Usage) {
        let started = Instant::now();
        self.observer.notify(TelemetryEvent::ToolCallStart {
            session_id: ctx.session_id.clone(),
            tool_name: call.name.clone(),
            call_id: call.id.clone(),
            attempt: 0,
        });

        let (message, updates, usage) = self.execute_inner(call, &ctx).await;
        let is_error = message
            .content
            .iter()
            .any(|p| matches!(p, crate::message::ContentPart::ToolResult { is_error: true, .. }));
        tracing::Span::current().record("is_error", is_error);
        log::debug!(
            "tool '{}' ({}) finished in {:?}, is_error={}",
            call.name,
            call.id,
            started.elapsed(),
            is_error
        );
        self.observer.notify(TelemetryEvent::ToolCallEnd {
            session_id: ctx.session_id.clone(),
            tool_name: call.name.clone(),
            call_id: call.id.clone(),
            is_error,
            duration_ms: started.elapsed().as_millis() as u64,
        });

        (message, updates, usage)
    }

    fn tool_call_usage(retries: u32) -> Usage {
        Usage {
            tool_calls: 1,
            retries,
            ..Default::default()
        }
    }

    async fn execute_inner(&self, call: &ToolCall, ctx: &RunContext) -> (Message, Vec<ContextUpdate>, Usage) {
        let Some((descriptor, handler)) = self.registry.get(&call.name) else {
            log::warn!("tool call {} references unknown tool '{}'", call.id, call.name);
            return (
                Message::tool_result(&call.id, format!("unknown tool '{}'", call.name), true),
                Vec::new(),
                Self::tool_call_usage(0),
            );
        };

        if descriptor.validate_args {
            if let Err(validation_err) = validate_arguments(&descriptor.schema.parameters, &call.arguments) {
                log::warn!("tool call {} failed argument validation: {validation_err}", call.id);
                return (
                    Message::tool_result(&call.id, validation_err.to_string(), true),
                    Vec::new(),
                    Self::tool_call_usage(0),
                );
            }
        }

        let mut arguments = call.arguments.clone();
        if descriptor.requires_approval {
            self.observer.notify(TelemetryEvent::ApprovalRequested {
                session_id: ctx.session_id.clone(),
                tool_name: call.name.clone(),
                call_id: call.id.clone(),
            });
            let request = ApprovalRequest {
                session_id: ctx.session_id.clone(),
                call_id: call.id.clone(),
                tool_name: call.name.clone(),
                arguments: arguments.clone(),
            };
            let decision = match tokio::time::timeout(self.approval_timeout, self.approval.request_approval(request)).await {
                Ok(decision) => decision,
                Err(_) => {
                    log::warn!("approval for tool call {} timed out, defaulting to reject", call.id);
                    ApprovalDecision::Rejected {
                        reason: "approval request timed out".into(),
                    }
                }
            };
            self.observer.notify(TelemetryEvent::ApprovalResolved {
                session_id: ctx.session_id.clone(),
                call_id: call.id.clone(),
                approved: !matches!(decision, ApprovalDecision::Rejected { .. }),
            });
            match decision {
                ApprovalDecision::Approved => {}
                ApprovalDecision::Edited { arguments: edited } => arguments = edited,
                ApprovalDecision::Rejected { reason } => {
                    return (
                        Message::tool_result(&call.id, format!("tool call rejected: {reason}"), true),
                        Vec::new(),
                        Self::tool_call_usage(0),
                    );
                }
            }
        }

        let timeout = Duration::from_millis(descriptor.timeout_ms.unwrap_or(self.default_timeout.as_millis() as u64));
        let max_attempts = descriptor.max_retries + 1;

        for attempt in 0..max_attempts {
            tracing::Span::current().record("attempt", attempt);
            match tokio::time::timeout(timeout, handler.call(arguments.clone(), ctx)).await {
                Ok(outcome) => {
                    let is_error = outcome.is_error();
                    let content = outcome.into_content();
                    return (
                        Message::tool_result(&call.id, content, is_error),
                        ctx.take_updates(),
                        Self::tool_call_usage(attempt),
                    );
                }
                Err(_) if attempt + 1 < max_attempts => {
                    let wait = backoff::next_delay(self.backoff_base, attempt, self.backoff_max);
                    log::warn!(
                        "tool '{}' ({}) timed out on attempt {attempt}, retrying in {wait:?}",
                        call.name,
                        call.id
                    );
                    if backoff::wait_cancellable(wait, &ctx.cancellation_token()).await == backoff::WaitOutcome::Cancelled {
                        return (
                            Message::tool_result(&call.id, "tool call cancelled while waiting to retry", true),
                            ctx.take_updates(),
                            Self::tool_call_usage(attempt + 1),
                        );
                    }
                }
                Err(_) => {
                    log::warn!("tool '{}' ({}) timed out after {max_attempts} attempt(s)", call.name, call.id);
                    return (
                        Message::tool_result(&call.id, format!("tool '{}' timed out", call.name), true),
                        ctx.take_updates(),
                        Self::tool_call_usage(max_attempts - 1),
                    );
                }
            }
        }

        unreachable!("loop always returns before exhausting max_attempts iterations")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Deps;
    use crate::registry::ToolDescriptor;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Echo;

    #[async_trait]
    impl crate::registry::ToolHandler for Echo {
        async fn call(&self, arguments: Value, _ctx: &RunContext) -> ToolOutcome {
            ToolOutcome::Success(arguments.to_string())
        }
    }

    struct AlwaysSlow;

    #[async_trait]
    impl crate::registry::ToolHandler for AlwaysSlow {
        async fn call(&self, _arguments: Value, _ctx: &RunContext) -> ToolOutcome {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            ToolOutcome::Success("unreachable".into())
        }
    }

    struct CountingFlaky {
        calls: AtomicU32,
    }

    #[async_trait]
    impl crate::registry::ToolHandler for CountingFlaky {
        async fn call(&self, _arguments: Value, _ctx: &RunContext) -> ToolOutcome {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            ToolOutcome::Success("recovered".into())
        }
    }

    fn call(name: &str, args: Value) -> ToolCall {
        ToolCall::new("c1", name, args)
    }

    #[tokio::test]
    async fn unknown_tool_becomes_an_error_tool_result_not_a_panic() {
        let registry = Arc::new(ToolRegistry::new());
        let executor = ToolExecutor::new(registry);
        let (message, updates, usage) = executor.execute(&call("missing", json!({})), RunContext::new(Deps::new())).await;
        assert!(updates.is_empty());
        assert_eq!(usage.tool_calls, 1);
        match &message.content[0] {
            crate::message::ContentPart::ToolResult { is_error, content, .. } => {
                assert!(is_error);
                assert!(content.contains("unknown tool"));
            }
            other => panic!("unexpected content: {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_arguments_become_an_error_tool_result() {
        let mut registry = ToolRegistry::new();
        registry.register(
            ToolDescriptor::new("search", "search", json!({"type": "object", "required": ["query"]})),
            Arc::new(Echo),
        );
        let executor = ToolExecutor::new(Arc::new(registry));
        let (message, _, _) = executor.execute(&call("search", json!({})), RunContext::new(Deps::new())).await;
        match &message.content[0] {
            crate::message::ContentPart::ToolResult { is_error, .. } => assert!(is_error),
            other => panic!("unexpected content: {other:?}"),
        }
    }

    #[tokio::test]
    async fn validate_args_false_skips_validation_and_reaches_the_handler() {
        let mut registry = ToolRegistry::new();
        registry.register(
            ToolDescriptor::new("search", "search", json!({"type": "object", "required": ["query"]})).validate_args(false),
            Arc::new(Echo),
        );
        let executor = ToolExecutor::new(Arc::new(registry));
        let (message, _, _) = executor.execute(&call("search", json!({})), RunContext::new(Deps::new())).await;
        match &message.content[0] {
            crate::message::ContentPart::ToolResult { is_error, .. } => assert!(!is_error, "handler should have run unvalidated"),
            other => panic!("unexpected content: {other:?}"),
        }
    }

    #[tokio::test]
    async fn successful_call_returns_non_error_tool_result() {
        let mut registry = ToolRegistry::new();
        registry.register(ToolDescriptor::new("echo", "echo", json!({"type": "object"})), Arc::new(Echo));
        let executor = ToolExecutor::new(Arc::new(registry));
        let (message, _, usage) = executor.execute(&call("echo", json!({"a": 1})), RunContext::new(Deps::new())).await;
        assert_eq!(usage.tool_calls, 1);
        assert_eq!(usage.retries, 0);
        match &message.content[0] {
            crate::message::ContentPart::ToolResult { is_error, .. } => assert!(!is_error),
            other => panic!("unexpected content: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_with_no_retries_becomes_error_tool_result() {
        let mut registry = ToolRegistry::new();
        registry.register(
            ToolDescriptor::new("slow", "slow", json!({"type": "object"})).timeout_ms(10),
            Arc::new(AlwaysSlow),
        );
        let executor = ToolExecutor::new(Arc::new(registry));
        let (message, _, _) = executor.execute(&call("slow", json!({})), RunContext::new(Deps::new())).await;
        match &message.content[0] {
            crate::message::ContentPart::ToolResult { is_error, content, .. } => {
                assert!(is_error);
                assert!(content.contains("timed out"));
            }
            other => panic!("unexpected content: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_recover_after_a_timed_out_attempt() {
        let mut registry = ToolRegistry::new();
        registry.register(
            ToolDescriptor::new("flaky", "flaky", json!({"type": "object"}))
                .timeout_ms(10)
                .max_retries(1),
            Arc::new(CountingFlaky { calls: AtomicU32::new(0) }),
        );
        let executor = ToolExecutor::new(Arc::new(registry));
        let (message, _, usage) = executor.execute(&call("flaky", json!({})), RunContext::new(Deps::new())).await;
        assert_eq!(usage.retries, 1, "one timed-out attempt before the recovering one");
        match &message.content[0] {
            crate::message::ContentPart::ToolResult { is_error, content, .. } => {
                assert!(!is_error);
                assert_eq!(content, "recovered");
            }
            other => panic!("unexpected content: {other:?}"),
        }
    }

    struct RejectAll;

    #[async_trait]
    impl ApprovalHandler for RejectAll {
        async fn request_approval(&self, _request: ApprovalRequest) -> ApprovalDecision {
            ApprovalDecision::Rejected { reason: "denied by policy".into() }
        }
    }

    #[tokio::test]
    async fn rejected_approval_becomes_error_tool_result_without_calling_handler() {
        let mut registry = ToolRegistry::new();
        registry.register(
            ToolDescriptor::new("danger", "danger", json!({"type": "object"})).requires_approval(true),
            Arc::new(Echo),
        );
        let executor = ToolExecutor::new(Arc::new(registry)).with_approval_handler(Arc::new(RejectAll));
        let (message, _, _) = executor.execute(&call("danger", json!({})), RunContext::new(Deps::new())).await;
        match &message.content[0] {
            crate::message::ContentPart::ToolResult { is_error, content, .. } => {
                assert!(is_error);
                assert!(content.contains("denied by policy"));
            }
            other => panic!("unexpected content: {other:?}"),
        }
    }
}
