use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::CoreError;
use crate::message::Message;

/// Structured, JSON-valued key/value store carried alongside the message
/// history. Kept as plain `serde_json::Value` (not `Box<dyn Any>`) so every
/// mutation can be expressed as a [`ContextUpdate`] that serializes,
/// diffs, and replays the same way regardless of what put the data there.
///
/// Keys prefixed with `__` are reserved for core-managed state (the
/// runner's own bookkeeping); caller-registered dependencies should use an
/// unprefixed key.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct Deps(HashMap<String, Value>);

impl Deps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Typed accessor for a well-known dependency key
    /// that callers shouldn't have to hand-match on `Value`.
    pub fn dep<T: DeserializeOwned>(&self, key: &str) -> Option<Result<T, serde_json::Error>> {
        self.0.get(key).cloned().map(serde_json::from_value)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }
}

/// An atomic, typed mutation to a [`Context`]. Tool handlers never mutate
/// `Context` directly — they emit updates through [`RunContext::emit_update`]
/// and the Tool Executor applies them after the call completes, so every
/// state change has a uniform, inspectable shape.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ContextUpdate {
    AppendMessage(Message),
    SetDep { key: String, value: Value },
    /// Shallow-merges `value` into the existing dep if both are JSON
    /// objects; if the key is absent this behaves like `SetDep`.
    MergeDep { key: String, value: Value },
    /// Pushes `value` onto an array-valued dep; creates the array if the
    /// key is absent.
    AppendDep { key: String, value: Value },
    DeleteDep { key: String },
}

/// The mutable state threaded through one agent run: the conversation so
/// far and the structured dependency store tools read and write.
#[derive(Debug, Clone, Default)]
pub struct Context {
    pub messages: Vec<Message>,
    pub deps: Deps,
}

impl Context {
    pub fn new(deps: Deps) -> Self {
        Self {
            messages: Vec::new(),
            deps,
        }
    }

    pub fn with_messages(messages: Vec<Message>, deps: Deps) -> Self {
        Self { messages, deps }
    }

    /// Applies one update. `MergeDep`/`AppendDep` against a dep whose
    /// existing value is the wrong shape fail with
    /// `CoreError::ContextUpdateTypeError` rather than silently
    /// overwriting or panicking — this never aborts the run, only the
    /// single update.
    pub fn apply(&mut self, update: ContextUpdate) -> Result<(), CoreError> {
        match update {
            ContextUpdate::AppendMessage(m) => {
                self.messages.push(m);
                Ok(())
            }
            ContextUpdate::SetDep { key, value } => {
                self.deps.set(key, value);
                Ok(())
            }
            ContextUpdate::MergeDep { key, value } => {
                match self.deps.0.get_mut(&key) {
                    Some(Value::Object(existing)) => match value {
                        Value::Object(incoming) => {
                            existing.extend(incoming);
                            Ok(())
                        }
                        other => Err(CoreError::ContextUpdateTypeError(format!(
                            "cannot merge non-object {other} into dep '{key}'"
                        ))),
                    },
                    Some(other) => Err(CoreError::ContextUpdateTypeError(format!(
                        "dep '{key}' is {other}, not an object; cannot merge"
                    ))),
                    None => {
                        self.deps.set(key, value);
                        Ok(())
                    }
                }
            }
            ContextUpdate::AppendDep { key, value } => match self.deps.0.get_mut(&key) {
                Some(Value::Array(arr)) => {
                    arr.push(value);
                    Ok(())
                }
                Some(other) => Err(CoreError::ContextUpdateTypeError(format!(
                    "dep '{key}' is {other}, not an array; cannot append"
                ))),
                None => {
                    self.deps.set(key, Value::Array(vec![value]));
                    Ok(())
                }
            },
            ContextUpdate::DeleteDep { key } => {
                self.deps.0.remove(&key);
                Ok(())
            }
        }
    }
}

/// The read/write handle a tool handler actually sees. It snapshots `deps`
/// at call time (handlers never race each other over a live borrow of
/// `Context`) and collects any updates the handler wants applied once it
/// returns, plus a cooperative cancellation signal for long-running tools.
#[derive(Clone)]
pub struct RunContext {
    pub session_id: String,
    deps_snapshot: Deps,
    pending: Arc<Mutex<Vec<ContextUpdate>>>,
    cancellation: CancellationToken,
}

impl RunContext {
    pub fn new(deps_snapshot: Deps) -> Self {
        Self {
            session_id: String::new(),
            deps_snapshot,
            pending: Arc::new(Mutex::new(Vec::new())),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn dep<T: DeserializeOwned>(&self, key: &str) -> Option<Result<T, serde_json::Error>> {
        self.deps_snapshot.dep(key)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Queues a structured mutation to be applied by the Tool Executor
    /// after this handler call returns. Order of emission within one call
    /// is preserved; order across concurrently dispatched tool calls
    /// follows each call's completion order.
    pub fn emit_update(&self, update: ContextUpdate) {
        self.pending.lock().unwrap().push(update);
    }

    /// Drains queued updates. Called once by the executor after a
    /// handler's future resolves.
    pub fn take_updates(&self) -> Vec<ContextUpdate> {
        std::mem::take(&mut self.pending.lock().unwrap())
    }
}
