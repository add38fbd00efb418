use std::sync::Arc;
use std::time::Duration;

use agent_core::context::Context;
use agent_core::executor::ToolExecutor;
use agent_core::message::{ContentPart, Message, Role, ToolCall};
use agent_core::provider::{Provider, ProviderError, ProviderRegistry, Settings, ToolChoice};
use agent_core::registry::ToolRegistry;
use agent_core::stream::{StreamEvent, StreamNormalizer};
use agent_core::telemetry::{NoopObserver, Observer, TelemetryEvent};
use agent_core::usage::Usage;
use agent_core::{CoreError, RunContext};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

const DEFAULT_MAX_ITERATIONS: u32 = 10;
const DEFAULT_PROVIDER_RETRY_ATTEMPTS: u32 = 3;
const PROVIDER_RETRY_BASE: Duration = Duration::from_millis(500);
const PROVIDER_RETRY_MAX: Duration = Duration::from_secs(30);

/// The run-level bookkeeping every [`RunOutcome`] variant carries
/// regardless of how it ended: token accounting, how many Prepare/AwaitModel
/// cycles it took, and a stable tag for why the loop stopped.
#[derive(Debug, Clone, Default)]
pub struct RunMeta {
    pub usage: Usage,
    pub iterations: u32,
    pub stopped_reason: String,
}

/// Terminal result of one [`Agent::run`] call. The accumulated [`Context`]
/// is always returned, even on failure
/// or cancellation, so a caller can inspect whatever the run produced
/// before it stopped.
#[derive(Debug)]
pub enum RunOutcome {
    Done { context: Context, output: String, meta: RunMeta },
    Failed { context: Context, error: CoreError, meta: RunMeta },
    Cancelled { context: Context, meta: RunMeta },
}

impl RunOutcome {
    pub fn meta(&self) -> &RunMeta {
        match self {
            RunOutcome::Done { meta, .. } => meta,
            RunOutcome::Failed { meta, .. } => meta,
            RunOutcome::Cancelled { meta, .. } => meta,
        }
    }

    pub fn context(&self) -> &Context {
        match self {
            RunOutcome::Done { context, .. } => context,
            RunOutcome::Failed { context, .. } => context,
            RunOutcome::Cancelled { context, .. } => context,
        }
    }
}

/// The text a model produced on its final, tool-call-free turn — empty if
/// the run never reached one (it was cancelled or failed first).
pub(crate) fn final_output(context: &Context) -> String {
    context
        .messages
        .iter()
        .rev()
        .find(|m| m.role == agent_core::message::Role::Assistant)
        .map(|m| m.text())
        .unwrap_or_default()
}

/// One increment of a streamed run: either a normalized frame forwarded
/// live from the provider, or the terminal [`RunOutcome`] once the whole
/// run (all turns, all tool dispatches) has stopped.
#[derive(Debug)]
pub enum AgentStreamEvent {
    Frame(StreamEvent),
    ToolCall(ToolCall),
    ToolResult { call_id: String, is_error: bool },
    Finished(RunOutcome),
}

/// Static configuration for one agent: which model it talks to, its
/// system prompt, how many reason-act iterations it's allowed, and the
/// tool-choice policy it enforces.
#[derive(Clone)]
pub struct Agent {
    model_ref: String,
    system_prompt: Option<String>,
    max_iterations: u32,
    tool_choice: ToolChoice,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    providers: Arc<ProviderRegistry>,
    tools: Arc<ToolRegistry>,
    executor: Arc<ToolExecutor>,
    observer: Arc<dyn Observer>,
}

/// Fluent constructor for [`Agent`], so callers don't have to assemble the
/// struct by hand.
pub struct AgentBuilder {
    model_ref: String,
    system_prompt: Option<String>,
    max_iterations: u32,
    tool_choice: ToolChoice,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    providers: Option<Arc<ProviderRegistry>>,
    tools: Option<Arc<ToolRegistry>>,
    executor: Option<Arc<ToolExecutor>>,
    observer: Option<Arc<dyn Observer>>,
}

impl AgentBuilder {
    pub fn new(model_ref: impl Into<String>) -> Self {
        Self {
            model_ref: model_ref.into(),
            system_prompt: None,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            tool_choice: ToolChoice::Auto,
            temperature: None,
            max_tokens: None,
            providers: None,
            tools: None,
            executor: None,
            observer: None,
        }
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn max_iterations(mut self, n: u32) -> Self {
        self.max_iterations = n;
        self
    }

    pub fn tool_choice(mut self, choice: ToolChoice) -> Self {
        self.tool_choice = choice;
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = Some(t);
        self
    }

    pub fn max_tokens(mut self, n: u32) -> Self {
        self.max_tokens = Some(n);
        self
    }

    pub fn providers(mut self, providers: Arc<ProviderRegistry>) -> Self {
        self.providers = Some(providers);
        self
    }

    pub fn tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn executor(mut self, executor: Arc<ToolExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn build(self) -> Result<Agent, CoreError> {
        let providers = self
            .providers
            .ok_or_else(|| CoreError::UnknownTool("AgentBuilder requires a provider registry".into()))?;
        let tools = self.tools.unwrap_or_default();
        let executor = self
            .executor
            .unwrap_or_else(|| Arc::new(ToolExecutor::new(tools.clone())));
        Ok(Agent {
            model_ref: self.model_ref,
            system_prompt: self.system_prompt,
            max_iterations: self.max_iterations,
            tool_choice: self.tool_choice,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            providers,
            tools,
            executor,
            observer: self.observer.unwrap_or_else(|| Arc::new(NoopObserver)),
        })
    }
}

impl Agent {
    fn settings(&self, model: String) -> Settings {
        let mut settings = Settings::new(model);
        settings.tool_choice = self.tool_choice.clone();
        settings.temperature = self.temperature;
        settings.max_tokens = self.max_tokens;
        settings
    }

    fn seed_context(&self, mut context: Context, session_id: &str) -> Context {
        if let Some(prompt) = &self.system_prompt {
            if !context.messages.iter().any(|m| m.role == agent_core::message::Role::System) {
                context.messages.insert(0, Message::system(prompt.clone()));
            }
        }
        self.observer.notify(TelemetryEvent::RunStart {
            session_id: session_id.to_string(),
        });
        context
    }

    /// Drives the Prepare → AwaitModel → Dispatch → Loop state machine
    /// to completion, cancellation, or failure.
    #[instrument(skip(self, context, cancellation), fields(session_id = %session_id))]
    pub async fn run(&self, context: Context, session_id: &str, cancellation: CancellationToken) -> RunOutcome {
        let mut context = self.seed_context(context, session_id);
        let mut iterations: u32 = 0;
        let mut usage = Usage::default();
        let mut consecutive_tool_choice_violations: u32 = 0;

        loop {
            if cancellation.is_cancelled() {
                return self.cancelled(context, session_id, usage, iterations);
            }
            if iterations >= self.max_iterations {
                let error = CoreError::MaxIterationsReached {
                    max_iterations: self.max_iterations,
                };
                return self.fail(context, session_id, error, usage, iterations);
            }
            iterations += 1;

            let (provider, model) = match self.providers.resolve(&self.model_ref) {
                Ok(pair) => pair,
                Err(e) => return self.fail(context, session_id, e, usage, iterations),
            };
            let settings = self.settings(model.clone());

            let (response, call_usage) = match self
                .call_with_retry(provider.as_ref(), &context, &settings, session_id, &cancellation)
                .await
            {
                Ok(pair) => pair,
                Err(CallError::Cancelled) => return self.cancelled(context, session_id, usage, iterations),
                Err(CallError::Core(e)) => return self.fail(context, session_id, e, usage, iterations),
            };
            usage.accumulate(&call_usage);

            context.messages.push(response.clone());
            let tool_calls = response.tool_calls();

            if tool_calls.is_empty() {
                if matches!(self.tool_choice, ToolChoice::Any | ToolChoice::Tool(_)) {
                    consecutive_tool_choice_violations += 1;
                    log::warn!(
                        "model ignored tool_choice={:?} on turn {iterations} (violation #{consecutive_tool_choice_violations})",
                        self.tool_choice
                    );
                    if consecutive_tool_choice_violations >= 2 {
                        return self.fail(context, session_id, CoreError::ToolChoiceViolation, usage, iterations);
                    }
                    continue;
                }
                self.observer.notify(TelemetryEvent::RunEnd {
                    session_id: session_id.to_string(),
                    outcome: "done".into(),
                });
                let output = final_output(&context);
                return RunOutcome::Done {
                    context,
                    output,
                    meta: RunMeta { usage, iterations, stopped_reason: "stop".into() },
                };
            }
            consecutive_tool_choice_violations = 0;

            let dispatched: Vec<_> = tool_calls
                .into_iter()
                .map(|tc| {
                    let executor = self.executor.clone();
                    let tc = tc.clone();
                    let run_ctx = RunContext::new(context.deps.clone())
                        .with_session(session_id.to_string())
                        .with_cancellation(cancellation.clone());
                    tokio::spawn(async move { executor.execute(&tc, run_ctx).await })
                })
                .collect();

            // ContextUpdate ordering across concurrently dispatched calls
            // follows each task's completion order, not call order, since
            // the calls ran concurrently with no ordering guarantee between
            // them. A call still in flight when cancellation fires is awaited
            // so its task isn't orphaned, but its result is discarded rather
            // than folded into the context or usage total.
            for handle in dispatched {
                match handle.await {
                    Ok((message, updates, call_usage)) => {
                        if cancellation.is_cancelled() {
                            log::warn!(
                                "discarding tool result for session {session_id}: run was cancelled mid-dispatch"
                            );
                            continue;
                        }
                        usage.accumulate(&call_usage);
                        context.messages.push(message);
                        for update in updates {
                            if let Err(e) = context.apply(update) {
                                log::warn!("dropping context update for session {session_id}: {e}");
                            }
                        }
                    }
                    Err(join_err) => {
                        if cancellation.is_cancelled() {
                            log::warn!("tool dispatch task for session {session_id} panicked during cancellation: {join_err}");
                            continue;
                        }
                        log::warn!("tool dispatch task for session {session_id} panicked: {join_err}");
                        context
                            .messages
                            .push(Message::tool_result("unknown", "tool task panicked", true));
                    }
                }
            }

            if cancellation.is_cancelled() {
                return self.cancelled(context, session_id, usage, iterations);
            }
        }
    }

    /// Same state machine as [`Agent::run`], but forwards every normalized
    /// [`StreamEvent`] to the caller as it arrives instead of waiting for a
    /// complete turn. Runs on its own task so the caller can start
    /// consuming the returned stream immediately; the final
    /// [`AgentStreamEvent::Finished`] carries the same [`RunOutcome`] that
    /// `run` would have returned directly.
    pub fn run_stream(
        &self,
        context: Context,
        session_id: impl Into<String>,
        cancellation: CancellationToken,
    ) -> ReceiverStream<AgentStreamEvent> {
        let agent = self.clone();
        let session_id = session_id.into();
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            let outcome = agent.run_stream_inner(context, &session_id, cancellation, &tx).await;
            let _ = tx.send(AgentStreamEvent::Finished(outcome)).await;
        });
        ReceiverStream::new(rx)
    }

    #[instrument(skip(self, context, cancellation, tx), fields(session_id = %session_id))]
    async fn run_stream_inner(
        &self,
        context: Context,
        session_id: &str,
        cancellation: CancellationToken,
        tx: &mpsc::Sender<AgentStreamEvent>,
    ) -> RunOutcome {
        let mut context = self.seed_context(context, session_id);
        let mut iterations: u32 = 0;
        let mut usage = Usage::default();
        let mut consecutive_tool_choice_violations: u32 = 0;

        loop {
            if cancellation.is_cancelled() {
                return self.cancelled(context, session_id, usage, iterations);
            }
            if iterations >= self.max_iterations {
                let error = CoreError::MaxIterationsReached {
                    max_iterations: self.max_iterations,
                };
                return self.fail(context, session_id, error, usage, iterations);
            }
            iterations += 1;

            let (provider, model) = match self.providers.resolve(&self.model_ref) {
                Ok(pair) => pair,
                Err(e) => return self.fail(context, session_id, e, usage, iterations),
            };
            let settings = self.settings(model.clone());

            let (response, call_usage) = match self
                .call_stream_with_retry(provider.as_ref(), &context, &settings, session_id, &cancellation, tx)
                .await
            {
                Ok(pair) => pair,
                Err(CallError::Cancelled) => return self.cancelled(context, session_id, usage, iterations),
                Err(CallError::Core(e)) => return self.fail(context, session_id, e, usage, iterations),
            };
            usage.accumulate(&call_usage);

            context.messages.push(response.clone());
            let tool_calls = response.tool_calls();

            if tool_calls.is_empty() {
                if matches!(self.tool_choice, ToolChoice::Any | ToolChoice::Tool(_)) {
                    consecutive_tool_choice_violations += 1;
                    log::warn!(
                        "model ignored tool_choice={:?} on turn {iterations} (violation #{consecutive_tool_choice_violations})",
                        self.tool_choice
                    );
                    if consecutive_tool_choice_violations >= 2 {
                        return self.fail(context, session_id, CoreError::ToolChoiceViolation, usage, iterations);
                    }
                    continue;
                }
                self.observer.notify(TelemetryEvent::RunEnd {
                    session_id: session_id.to_string(),
                    outcome: "done".into(),
                });
                let output = final_output(&context);
                return RunOutcome::Done {
                    context,
                    output,
                    meta: RunMeta { usage, iterations, stopped_reason: "stop".into() },
                };
            }
            consecutive_tool_choice_violations = 0;

            let dispatched: Vec<_> = tool_calls
                .into_iter()
                .map(|tc| {
                    let executor = self.executor.clone();
                    let tc = tc.clone();
                    let run_ctx = RunContext::new(context.deps.clone())
                        .with_session(session_id.to_string())
                        .with_cancellation(cancellation.clone());
                    let _ = tx.try_send(AgentStreamEvent::ToolCall(tc.clone()));
                    tokio::spawn(async move { executor.execute(&tc, run_ctx).await })
                })
                .collect();

            for handle in dispatched {
                match handle.await {
                    Ok((message, updates, call_usage)) => {
                        if cancellation.is_cancelled() {
                            log::warn!(
                                "discarding tool result for session {session_id}: run was cancelled mid-dispatch"
                            );
                            continue;
                        }
                        if let Some(ContentPart::ToolResult { call_id, is_error, .. }) = message.content.first() {
                            let _ = tx
                                .send(AgentStreamEvent::ToolResult { call_id: call_id.clone(), is_error: *is_error })
                                .await;
                        }
                        usage.accumulate(&call_usage);
                        context.messages.push(message);
                        for update in updates {
                            if let Err(e) = context.apply(update) {
                                log::warn!("dropping context update for session {session_id}: {e}");
                            }
                        }
                    }
                    Err(join_err) => {
                        if cancellation.is_cancelled() {
                            log::warn!("tool dispatch task for session {session_id} panicked during cancellation: {join_err}");
                            continue;
                        }
                        log::warn!("tool dispatch task for session {session_id} panicked: {join_err}");
                        context
                            .messages
                            .push(Message::tool_result("unknown", "tool task panicked", true));
                    }
                }
            }

            if cancellation.is_cancelled() {
                return self.cancelled(context, session_id, usage, iterations);
            }
        }
    }

    fn fail(&self, context: Context, session_id: &str, error: CoreError, usage: Usage, iterations: u32) -> RunOutcome {
        self.observer.notify(TelemetryEvent::RunFailed {
            session_id: session_id.to_string(),
            error_kind: error.kind().to_string(),
            detail: Some(error.to_string()),
        });
        self.observer.notify(TelemetryEvent::RunEnd {
            session_id: session_id.to_string(),
            outcome: "failed".into(),
        });
        let stopped_reason = error.kind().to_string();
        RunOutcome::Failed { context, error, meta: RunMeta { usage, iterations, stopped_reason } }
    }

    fn cancelled(&self, context: Context, session_id: &str, usage: Usage, iterations: u32) -> RunOutcome {
        self.observer.notify(TelemetryEvent::RunEnd {
            session_id: session_id.to_string(),
            outcome: "cancelled".into(),
        });
        RunOutcome::Cancelled { context, meta: RunMeta { usage, iterations, stopped_reason: "cancelled".into() } }
    }

    async fn call_with_retry(
        &self,
        provider: &dyn Provider,
        context: &Context,
        settings: &Settings,
        session_id: &str,
        cancellation: &CancellationToken,
    ) -> Result<(Message, Usage), CallError> {
        let mut attempt = 0;
        loop {
            self.observer.notify(TelemetryEvent::ProviderRequestStart {
                session_id: session_id.to_string(),
                provider: provider.name().to_string(),
                model: settings.model.clone(),
                attempt,
            });

            match provider.request(&context.messages, &self.tools.schemas(), settings).await {
                Ok((message, mut call_usage)) => {
                    call_usage.requests = 1;
                    call_usage.retries = attempt;
                    self.observer.notify(TelemetryEvent::ProviderRequestEnd {
                        session_id: session_id.to_string(),
                        provider: provider.name().to_string(),
                        model: settings.model.clone(),
                        usage: Some(call_usage),
                        finish_reason: None,
                    });
                    return Ok((message, call_usage));
                }
                Err(e) if e.is_transient() && attempt + 1 < DEFAULT_PROVIDER_RETRY_ATTEMPTS => {
                    let wait = agent_core::backoff::next_delay(PROVIDER_RETRY_BASE, attempt, PROVIDER_RETRY_MAX);
                    log::warn!(
                        "provider '{}' call failed on attempt {attempt} ({e}), retrying in {wait:?}",
                        provider.name()
                    );
                    self.observer.notify(TelemetryEvent::ProviderRetry {
                        session_id: session_id.to_string(),
                        provider: provider.name().to_string(),
                        attempt,
                        wait_ms: wait.as_millis() as u64,
                        reason: e.to_string(),
                    });
                    if agent_core::backoff::wait_cancellable(wait, cancellation).await
                        == agent_core::backoff::WaitOutcome::Cancelled
                    {
                        return Err(CallError::Cancelled);
                    }
                    attempt += 1;
                }
                Err(e) => return Err(CallError::Core(CoreError::Provider(e))),
            }
        }
    }

    /// Streaming counterpart to `call_with_retry`. Retries are only safe
    /// before the first frame of an attempt has been forwarded downstream —
    /// once partial output has reached the caller there's no way to
    /// un-send it, so a normalizer error mid-stream ends this turn rather
    /// than starting a fresh attempt.
    async fn call_stream_with_retry(
        &self,
        provider: &dyn Provider,
        context: &Context,
        settings: &Settings,
        session_id: &str,
        cancellation: &CancellationToken,
        tx: &mpsc::Sender<AgentStreamEvent>,
    ) -> Result<(Message, Usage), CallError> {
        let mut attempt = 0;
        loop {
            self.observer.notify(TelemetryEvent::ProviderRequestStart {
                session_id: session_id.to_string(),
                provider: provider.name().to_string(),
                model: settings.model.clone(),
                attempt,
            });

            match provider.request_stream(&context.messages, &self.tools.schemas(), settings).await {
                Ok(mut raw) => {
                    let mut normalizer = StreamNormalizer::new();
                    let mut accum = StreamAccumulator::default();

                    while let Some(frame) = raw.next().await {
                        let chunk = match frame {
                            Ok(chunk) => chunk,
                            Err(e) => return Err(CallError::Core(CoreError::Provider(e))),
                        };
                        for event in normalizer.feed(&chunk) {
                            accum.apply(&event);
                            let is_fatal = matches!(event, StreamEvent::Error { .. });
                            let detail = match &event {
                                StreamEvent::Error { kind, detail } => Some(format!("{kind}: {detail}")),
                                _ => None,
                            };
                            let _ = tx.send(AgentStreamEvent::Frame(event)).await;
                            if is_fatal {
                                return Err(CallError::Core(CoreError::Provider(ProviderError::Parse(
                                    detail.unwrap_or_default(),
                                ))));
                            }
                        }
                    }
                    for event in normalizer.finish().map_err(|e| CallError::Core(CoreError::Provider(e)))? {
                        accum.apply(&event);
                        let _ = tx.send(AgentStreamEvent::Frame(event)).await;
                    }

                    let mut call_usage = accum.usage.unwrap_or_default();
                    call_usage.requests = 1;
                    call_usage.retries = attempt;
                    self.observer.notify(TelemetryEvent::ProviderRequestEnd {
                        session_id: session_id.to_string(),
                        provider: provider.name().to_string(),
                        model: settings.model.clone(),
                        usage: Some(call_usage),
                        finish_reason: accum.finish_reason.clone(),
                    });
                    return Ok((accum.into_message(), call_usage));
                }
                Err(e) if e.is_transient() && attempt + 1 < DEFAULT_PROVIDER_RETRY_ATTEMPTS => {
                    let wait = agent_core::backoff::next_delay(PROVIDER_RETRY_BASE, attempt, PROVIDER_RETRY_MAX);
                    log::warn!(
                        "provider '{}' stream call failed on attempt {attempt} ({e}), retrying in {wait:?}",
                        provider.name()
                    );
                    self.observer.notify(TelemetryEvent::ProviderRetry {
                        session_id: session_id.to_string(),
                        provider: provider.name().to_string(),
                        attempt,
                        wait_ms: wait.as_millis() as u64,
                        reason: e.to_string(),
                    });
                    if agent_core::backoff::wait_cancellable(wait, cancellation).await
                        == agent_core::backoff::WaitOutcome::Cancelled
                    {
                        return Err(CallError::Cancelled);
                    }
                    attempt += 1;
                }
                Err(e) => return Err(CallError::Core(CoreError::Provider(e))),
            }
        }
    }
}

enum CallError {
    Core(CoreError),
    Cancelled,
}

/// Builds one [`Message`] out of a turn's worth of [`StreamEvent`]s: text
/// deltas are concatenated into a single `Text` part, each completed tool
/// call becomes its own `ToolUse` part in the order it completed.
#[derive(Default)]
struct StreamAccumulator {
    text: String,
    tool_calls: Vec<ToolCall>,
    usage: Option<Usage>,
    finish_reason: Option<String>,
}

impl StreamAccumulator {
    fn apply(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::TextDelta { text } => self.text.push_str(text),
            StreamEvent::ToolCallComplete { tool_call, .. } => self.tool_calls.push(tool_call.clone()),
            StreamEvent::Usage { usage } => match &mut self.usage {
                Some(existing) => existing.accumulate(usage),
                None => self.usage = Some(usage.clone()),
            },
            StreamEvent::Done { finish_reason } => self.finish_reason = Some(format!("{finish_reason:?}")),
            StreamEvent::ToolCallStart { .. } | StreamEvent::ToolCallArgumentDelta { .. } => {}
        }
    }

    fn into_message(self) -> Message {
        let mut content = Vec::new();
        if !self.text.is_empty() {
            content.push(ContentPart::Text(self.text));
        }
        content.extend(self.tool_calls.into_iter().map(ContentPart::ToolUse));
        Message { role: Role::Assistant, content }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_core::context::Deps;
    use agent_core::message::ToolCall;
    use agent_core::provider::RawFrameStream;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct StubProvider {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Provider for StubProvider {
        fn name(&self) -> &str {
            "stub"
        }

        async fn request(
            &self,
            _messages: &[Message],
            _tools: &[agent_core::registry::ToolSchema],
            _settings: &Settings,
        ) -> Result<(Message, Usage), ProviderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Ok((Message::assistant_tool_calls(vec![ToolCall::new("c1", "echo", json!({"x": 1}))]), Usage::default()))
            } else {
                Ok((Message::assistant_text("done"), Usage::default()))
            }
        }

        async fn request_stream(
            &self,
            _messages: &[Message],
            _tools: &[agent_core::registry::ToolSchema],
            _settings: &Settings,
        ) -> Result<RawFrameStream, ProviderError> {
            unimplemented!("not exercised in these tests")
        }
    }

    struct EchoHandler;

    #[async_trait]
    impl agent_core::registry::ToolHandler for EchoHandler {
        async fn call(&self, arguments: serde_json::Value, _ctx: &RunContext) -> agent_core::registry::ToolOutcome {
            agent_core::registry::ToolOutcome::Success(arguments.to_string())
        }
    }

    fn build_agent() -> Agent {
        let mut providers = ProviderRegistry::new();
        providers.register("stub", Arc::new(StubProvider { calls: AtomicU32::new(0) }));

        let mut tools = ToolRegistry::new();
        tools.register(
            agent_core::registry::ToolDescriptor::new("echo", "echo", json!({"type": "object"})),
            Arc::new(EchoHandler),
        );
        let tools = Arc::new(tools);

        AgentBuilder::new("stub:test-model")
            .providers(Arc::new(providers))
            .tools(tools.clone())
            .executor(Arc::new(ToolExecutor::new(tools)))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn run_dispatches_tool_call_then_finishes_on_text_reply() {
        let agent = build_agent();
        let outcome = agent
            .run(Context::new(Deps::new()), "s1", CancellationToken::new())
            .await;
        match outcome {
            RunOutcome::Done { context, output, meta } => {
                assert!(context.messages.iter().any(|m| m.text() == "done"));
                assert!(context
                    .messages
                    .iter()
                    .any(|m| matches!(&m.content[0], agent_core::message::ContentPart::ToolResult { .. })));
                assert_eq!(output, "done");
                assert_eq!(meta.iterations, 2);
                assert_eq!(meta.usage.tool_calls, 1);
            }
            other => panic!("expected Done, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn run_returns_cancelled_immediately_when_token_is_pre_cancelled() {
        let agent = build_agent();
        let token = CancellationToken::new();
        token.cancel();
        let outcome = agent.run(Context::new(Deps::new()), "s1", token).await;
        assert!(matches!(outcome, RunOutcome::Cancelled { .. }));
    }

    #[tokio::test]
    async fn run_fails_with_max_iterations_reached_when_cap_is_one_and_tool_is_called() {
        let mut providers = ProviderRegistry::new();
        providers.register("stub", Arc::new(StubProvider { calls: AtomicU32::new(0) }));
        let mut tools = ToolRegistry::new();
        tools.register(
            agent_core::registry::ToolDescriptor::new("echo", "echo", json!({"type": "object"})),
            Arc::new(EchoHandler),
        );
        let tools = Arc::new(tools);
        let agent = AgentBuilder::new("stub:test-model")
            .providers(Arc::new(providers))
            .tools(tools.clone())
            .executor(Arc::new(ToolExecutor::new(tools)))
            .max_iterations(1)
            .build()
            .unwrap();

        let outcome = agent.run(Context::new(Deps::new()), "s1", CancellationToken::new()).await;
        match outcome {
            RunOutcome::Failed { error, .. } => assert!(matches!(error, CoreError::MaxIterationsReached { max_iterations: 1 })),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    struct StreamingStubProvider;

    #[async_trait]
    impl Provider for StreamingStubProvider {
        fn name(&self) -> &str {
            "streaming-stub"
        }

        async fn request(
            &self,
            _messages: &[Message],
            _tools: &[agent_core::registry::ToolSchema],
            _settings: &Settings,
        ) -> Result<(Message, Usage), ProviderError> {
            unimplemented!("not exercised by streaming tests")
        }

        async fn request_stream(
            &self,
            _messages: &[Message],
            _tools: &[agent_core::registry::ToolSchema],
            _settings: &Settings,
        ) -> Result<RawFrameStream, ProviderError> {
            let frames = vec![
                Ok(format!("data: {}\n\n", json!({"type": "text", "text": "hel"}))),
                Ok(format!("data: {}\n\n", json!({"type": "text", "text": "lo"}))),
                Ok(format!("data: {}\n\n", json!({"type": "done", "stop_reason": "stop"}))),
            ];
            Ok(Box::pin(futures::stream::iter(frames)))
        }
    }

    #[tokio::test]
    async fn run_stream_forwards_text_deltas_then_finishes_done() {
        let mut providers = ProviderRegistry::new();
        providers.register("streaming-stub", Arc::new(StreamingStubProvider));
        let agent = AgentBuilder::new("streaming-stub:test-model")
            .providers(Arc::new(providers))
            .build()
            .unwrap();

        let mut stream = agent.run_stream(Context::new(Deps::new()), "s1", CancellationToken::new());
        let mut text = String::new();
        let mut finished = None;
        while let Some(event) = stream.next().await {
            match event {
                AgentStreamEvent::Frame(StreamEvent::TextDelta { text: delta }) => text.push_str(&delta),
                AgentStreamEvent::Frame(_) => {}
                AgentStreamEvent::ToolCall(_) | AgentStreamEvent::ToolResult { .. } => {}
                AgentStreamEvent::Finished(outcome) => finished = Some(outcome),
            }
        }

        assert_eq!(text, "hello");
        match finished {
            Some(RunOutcome::Done { context, output, .. }) => {
                assert_eq!(context.messages.last().unwrap().text(), "hello");
                assert_eq!(output, "hello");
            }
            other => panic!("expected Done, got {other:?}"),
        }
    }
}
