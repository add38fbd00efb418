use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::RunContext;

/// The wire-rendering shape of a tool: what a `Provider` sends upstream so
/// the model knows the tool exists and how to call it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, schemars::JsonSchema)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// A JSON Schema object (`{"type": "object", "properties": {...},
    /// "required": [...]}`), kept as raw `Value` rather than a bespoke
    /// struct so a handler can hand-write `schemars::schema_for!` output
    /// directly, or build it by hand, into this field.
    pub parameters: Value,
}

/// A registered tool: its wire schema plus the registry-only metadata that
/// governs how the executor dispatches it.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub schema: ToolSchema,
    /// Whether a human must approve each call before it runs.
    pub requires_approval: bool,
    /// Per-tool timeout override; falls back to the executor's default
    /// when `None`.
    pub timeout_ms: Option<u64>,
    /// Number of retry attempts on a handler-raised exception, not
    /// counting the initial attempt.
    pub max_retries: u32,
    /// Whether the executor should validate `call.arguments` against
    /// `schema.parameters` before dispatch. Off for tools whose schema is
    /// too loose to validate usefully (e.g. a catch-all `Value`).
    pub validate_args: bool,
    /// Whether the handler reads `RunContext` beyond what `ToolHandler::call`
    /// already hands it — purely descriptive metadata a host can use to
    /// decide whether a tool is safe to run context-free (e.g. in a sandbox
    /// with no session state).
    pub takes_ctx: bool,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            schema: ToolSchema {
                name: name.into(),
                description: description.into(),
                parameters,
            },
            requires_approval: false,
            timeout_ms: None,
            max_retries: 0,
            validate_args: true,
            takes_ctx: false,
        }
    }

    pub fn requires_approval(mut self, yes: bool) -> Self {
        self.requires_approval = yes;
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn validate_args(mut self, yes: bool) -> Self {
        self.validate_args = yes;
        self
    }

    pub fn takes_ctx(mut self, yes: bool) -> Self {
        self.takes_ctx = yes;
        self
    }

    pub fn name(&self) -> &str {
        &self.schema.name
    }
}

/// The result of running a tool's handler, kept as an explicit sum type
/// rather than a raw `Result` so the executor never has to guess whether a
/// handler's `Err` means "the model should see this" or "the run should
/// abort" — handlers only ever get to say "this is what the model sees."
#[derive(Debug, Clone)]
pub enum ToolOutcome {
    Success(String),
    Error(String),
}

impl ToolOutcome {
    pub fn is_error(&self) -> bool {
        matches!(self, ToolOutcome::Error(_))
    }

    pub fn into_content(self) -> String {
        match self {
            ToolOutcome::Success(s) => s,
            ToolOutcome::Error(s) => s,
        }
    }
}

/// A tool's behavior. Implementors are looked up by name from an explicit
/// `(descriptor, handler)` pair registered up front — never discovered by
/// reflection or trait-object downcasting.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, arguments: Value, ctx: &RunContext) -> ToolOutcome;
}

/// Looks up tools by name for the Tool Executor and renders their schemas
/// for a `Provider` request. Registration is explicit: callers hand in a
/// descriptor and a handler together, there is no scanning or macro-driven
/// discovery.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, (ToolDescriptor, Arc<dyn ToolHandler>)>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: ToolDescriptor, handler: Arc<dyn ToolHandler>) {
        let name = descriptor.name().to_string();
        self.tools.insert(name, (descriptor, handler));
    }

    pub fn get(&self, name: &str) -> Option<(&ToolDescriptor, &Arc<dyn ToolHandler>)> {
        self.tools.get(name).map(|(d, h)| (d, h))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.tools.values().map(|(d, _)| d)
    }

    /// The schema list a `Provider::request` call attaches to an outbound
    /// call so the model knows what tools are on offer.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools.values().map(|(d, _)| d.schema.clone()).collect()
    }
}
