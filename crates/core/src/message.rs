use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Who produced a [`Message`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A request, made by the model, to invoke one registered tool.
///
/// `arguments` is already-parsed JSON, not the raw fragment string a
/// provider streams down the wire — assembling that string into a `Value`
/// is the Stream Normalizer's job (`stream::StreamNormalizer`), so by the
/// time a `ToolCall` reaches the registry or executor it's ready to
/// validate against a tool's argument schema directly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default = "default_arguments")]
    pub arguments: Value,
}

fn default_arguments() -> Value {
    Value::Object(Default::default())
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// One piece of a message's content. A single [`Message`] can carry more
/// than one part — an assistant turn that both narrates and calls tools
/// in parallel is `[Text(...), ToolUse(...), ToolUse(...)]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text(String),
    ToolUse(ToolCall),
    ToolResult {
        call_id: String,
        content: String,
        is_error: bool,
    },
}

/// A single turn in the conversation fed to and read back from a provider.
///
/// Invariant: every `ToolResult` part's `call_id` must correspond to a
/// `ToolUse` part emitted earlier in the same [`Context`] — the executor
/// is the only code path that manufactures `ToolResult` parts, and it does
/// so exactly once per dispatched call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentPart>,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: vec![ContentPart::Text(text.into())],
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentPart::Text(text.into())],
        }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![ContentPart::Text(text.into())],
        }
    }

    pub fn assistant_tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: calls.into_iter().map(ContentPart::ToolUse).collect(),
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        Self {
            role: Role::Tool,
            content: vec![ContentPart::ToolResult {
                call_id: call_id.into(),
                content: content.into(),
                is_error,
            }],
        }
    }

    /// Every `ToolUse` part in this message, in order.
    pub fn tool_calls(&self) -> Vec<&ToolCall> {
        self.content
            .iter()
            .filter_map(|p| match p {
                ContentPart::ToolUse(tc) => Some(tc),
                _ => None,
            })
            .collect()
    }

    /// Concatenation of this message's text parts, for logging and
    /// human-facing transcripts.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_calls_filters_non_tool_parts() {
        let m = Message {
            role: Role::Assistant,
            content: vec![
                ContentPart::Text("checking".into()),
                ContentPart::ToolUse(ToolCall::new("1", "search", Value::Null)),
            ],
        };
        assert_eq!(m.tool_calls().len(), 1);
        assert_eq!(m.tool_calls()[0].name, "search");
    }

    #[test]
    fn text_joins_only_text_parts() {
        let m = Message::assistant_tool_calls(vec![ToolCall::new("1", "search", Value::Null)]);
        assert_eq!(m.text(), "");
        assert_eq!(Message::user("hi").text(), "hi");
    }
}
