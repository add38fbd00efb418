//! Provider-agnostic vocabulary for driving an LLM reason-act loop.
//!
//! This crate is the coordination layer's shared language: canonical
//! messages and usage counters, the mutable per-run [`Context`], a tool
//! registry with JSON-schema argument validation, a timeout/retry/approval
//! aware tool executor, the [`Provider`] trait every backend must satisfy,
//! and a stream normalizer that turns provider SSE events into a canonical
//! sequence. It does not talk to any network itself and does not know
//! about any specific vendor's wire format — `crates/runtime` builds the
//! agent loop and session server on top of it, and a separate crate per
//! vendor would implement [`Provider`].

pub mod backoff;
pub mod context;
pub mod error;
pub mod executor;
pub mod hitl;
pub mod message;
pub mod provider;
pub mod registry;
pub mod stream;
pub mod telemetry;
pub mod usage;
pub mod validator;

pub use context::{Context, ContextUpdate, RunContext};
pub use error::CoreError;
pub use executor::ToolExecutor;
pub use hitl::{ApprovalDecision, ApprovalHandler, ApprovalRequest};
pub use message::{ContentPart, Message, Role, ToolCall};
pub use provider::{Provider, ProviderError, ProviderRegistry, Settings, ToolChoice, ToolSchema};
pub use registry::{ToolDescriptor, ToolHandler, ToolOutcome, ToolRegistry};
pub use stream::{FinishReason, StreamEvent, StreamNormalizer};
pub use telemetry::{NoopObserver, Observer, TelemetryEvent};
pub use usage::Usage;
pub use validator::ValidationError;
