use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use agent_core::context::{Context, Deps};
use agent_core::hitl::{ApprovalDecision, ApprovalRequest};
use agent_core::message::Message;
use agent_core::stream::StreamEvent;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::approval::BroadcastApprovalHandler;
use crate::error::RuntimeError;
use crate::runner::{final_output, Agent, AgentStreamEvent, RunOutcome};

/// Opaque identifier for one conversation. Wraps a UUID rather than an
/// incrementing counter so sessions can be created by any number of
/// concurrent callers without coordination.
#[derive(Debug, Clone, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Broadcast payload a session's subscribers receive. One variant per
/// stage of a run's lifecycle, so a UI can render a turn incrementally
/// instead of waiting for the whole thing to land at once.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    AgentStarted,
    AgentDelta(String),
    ToolCall { call_id: String, name: String, arguments: Value },
    ToolResult { call_id: String, is_error: bool },
    ApprovalRequired(ApprovalRequest),
    AgentComplete { output: String },
    AgentError(String),
    /// A run ended mid-flight. `partial_output` is whatever text the model
    /// had produced on its in-progress turn; `messages_so_far` is the
    /// context as it stood once the abandoned tool call's result (if any)
    /// was dropped.
    AgentCancelled {
        reason: String,
        partial_output: String,
        messages_so_far: Vec<Message>,
    },
}

/// Owns one conversation's state and exposes the operations a chat UI or
/// API actually calls: `send_message`, `cancel`, the three-way approval
/// decision, `subscribe`, `history`, and `clear`.
///
/// At most one run is active per session at a time — `send_message` holds
/// the context lock for the duration of the run, so a second call queues
/// behind the first rather than racing it.
pub struct SessionServer {
    id: SessionId,
    agent: Arc<Agent>,
    context: Mutex<Context>,
    run_cancellation: Mutex<CancellationToken>,
    run_active: AtomicBool,
    events: broadcast::Sender<SessionEvent>,
    approval: Arc<BroadcastApprovalHandler>,
    created_at: DateTime<Utc>,
    updated_at: Mutex<DateTime<Utc>>,
}

impl SessionServer {
    pub fn new(id: SessionId, agent: Arc<Agent>, approval: Arc<BroadcastApprovalHandler>) -> Self {
        let (events, _) = broadcast::channel(256);
        let now = Utc::now();
        let server = Self {
            id,
            agent,
            context: Mutex::new(Context::new(Deps::new())),
            run_cancellation: Mutex::new(CancellationToken::new()),
            run_active: AtomicBool::new(false),
            events,
            approval,
            created_at: now,
            updated_at: Mutex::new(now),
        };
        server.forward_approvals();
        server
    }

    /// Relays every approval request the session's [`BroadcastApprovalHandler`]
    /// publishes onto this session's own event stream, so a single
    /// `subscribe()` call is enough to see deltas, tool activity, and
    /// approval prompts together.
    fn forward_approvals(&self) {
        let mut requests = self.approval.subscribe();
        let events = self.events.clone();
        tokio::spawn(async move {
            while let Ok(request) = requests.recv().await {
                let _ = events.send(SessionEvent::ApprovalRequired(request));
            }
        });
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub async fn updated_at(&self) -> DateTime<Utc> {
        *self.updated_at.lock().await
    }

    /// Appends a user message and drives the agent loop to completion,
    /// cancellation, or failure, broadcasting every lifecycle event along
    /// the way: a start marker, a delta per text chunk, a pair per tool
    /// dispatch, then exactly one of complete/error/cancelled at the end.
    pub async fn send_message(&self, text: impl Into<String>) -> RunOutcome {
        let mut context = self.context.lock().await;
        let user_message = Message::user(text);
        context.messages.push(user_message);

        let token = CancellationToken::new();
        *self.run_cancellation.lock().await = token.clone();
        self.run_active.store(true, Ordering::SeqCst);
        let _ = self.events.send(SessionEvent::AgentStarted);

        let mut stream = self.agent.run_stream(context.clone(), self.id.as_str(), token);
        let mut outcome = None;
        while let Some(event) = stream.next().await {
            match event {
                AgentStreamEvent::Frame(StreamEvent::TextDelta { text }) => {
                    let _ = self.events.send(SessionEvent::AgentDelta(text));
                }
                AgentStreamEvent::Frame(_) => {}
                AgentStreamEvent::ToolCall(call) => {
                    let _ = self.events.send(SessionEvent::ToolCall {
                        call_id: call.id,
                        name: call.name,
                        arguments: call.arguments,
                    });
                }
                AgentStreamEvent::ToolResult { call_id, is_error } => {
                    let _ = self.events.send(SessionEvent::ToolResult { call_id, is_error });
                }
                AgentStreamEvent::Finished(o) => outcome = Some(o),
            }
        }
        let outcome = outcome.expect("run_stream always sends Finished before its channel closes");

        *context = outcome.context().clone();
        *self.updated_at.lock().await = Utc::now();
        self.run_active.store(false, Ordering::SeqCst);

        match &outcome {
            RunOutcome::Done { output, .. } => {
                let _ = self.events.send(SessionEvent::AgentComplete { output: output.clone() });
            }
            RunOutcome::Failed { error, .. } => {
                let _ = self.events.send(SessionEvent::AgentError(error.to_string()));
            }
            RunOutcome::Cancelled { context, .. } => {
                let _ = self.events.send(SessionEvent::AgentCancelled {
                    reason: "cancelled".to_string(),
                    partial_output: final_output(context),
                    messages_so_far: context.messages.clone(),
                });
            }
        }

        outcome
    }

    /// Signals cancellation to whatever run is currently in flight. A
    /// no-op if nothing is running.
    pub async fn cancel(&self) {
        self.run_cancellation.lock().await.cancel();
    }

    pub fn approve(&self, call_id: &str) -> bool {
        self.approval.resolve(call_id, ApprovalDecision::Approved)
    }

    pub fn reject(&self, call_id: &str, reason: impl Into<String>) -> bool {
        self.approval
            .resolve(call_id, ApprovalDecision::Rejected { reason: reason.into() })
    }

    pub fn edit(&self, call_id: &str, arguments: serde_json::Value) -> bool {
        self.approval.resolve(call_id, ApprovalDecision::Edited { arguments })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn history(&self) -> Vec<Message> {
        self.context.lock().await.messages.clone()
    }

    /// Resets the conversation to empty, discarding both message history
    /// and the structured dependency store. Rejected while a run is in
    /// flight rather than blocking until it finishes, since the run holds
    /// its own snapshot of the context and would otherwise silently clobber
    /// whatever that run appends on completion.
    pub async fn clear(&self) -> Result<(), RuntimeError> {
        if self.run_active.load(Ordering::SeqCst) {
            return Err(RuntimeError::RunActive(self.id.clone()));
        }
        *self.context.lock().await = Context::new(Deps::new());
        Ok(())
    }
}
