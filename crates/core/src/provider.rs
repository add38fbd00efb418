use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::message::Message;
pub use crate::registry::ToolSchema;
use crate::usage::Usage;

/// What the model is allowed to do about tools on a given turn.
/// Serializes the way most chat APIs expect on the wire: a bare
/// string for `auto`/`required`/`none`, or a `{"type": "function",
/// "function": {"name": ...}}` object to force one specific tool.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ToolChoice {
    #[default]
    Auto,
    Any,
    Tool(String),
    None,
}

impl Serialize for ToolChoice {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ToolChoice::Auto => serializer.serialize_str("auto"),
            ToolChoice::Any => serializer.serialize_str("required"),
            ToolChoice::None => serializer.serialize_str("none"),
            ToolChoice::Tool(name) => {
                use serde::ser::SerializeMap;
                let mut outer = serializer.serialize_map(Some(2))?;
                outer.serialize_entry("type", "function")?;
                let mut inner = HashMap::new();
                inner.insert("name", name.clone());
                outer.serialize_entry("function", &inner)?;
                outer.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for ToolChoice {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ToolChoiceVisitor;

        impl<'de> Visitor<'de> for ToolChoiceVisitor {
            type Value = ToolChoice;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a tool_choice string or function-forcing object")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                match v {
                    "auto" => Ok(ToolChoice::Auto),
                    "required" | "any" => Ok(ToolChoice::Any),
                    "none" => Ok(ToolChoice::None),
                    other => Err(de::Error::unknown_variant(other, &["auto", "required", "none"])),
                }
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: de::MapAccess<'de>,
            {
                let mut name = None;
                while let Some(key) = map.next_key::<String>()? {
                    if key == "function" {
                        let f: HashMap<String, String> = map.next_value()?;
                        name = f.get("name").cloned();
                    } else {
                        let _ignored: serde::de::IgnoredAny = map.next_value()?;
                    }
                }
                name.map(ToolChoice::Tool)
                    .ok_or_else(|| de::Error::missing_field("function.name"))
            }
        }

        deserializer.deserialize_any(ToolChoiceVisitor)
    }
}

/// Per-call knobs the Agent Runner passes down to a [`Provider`].
#[derive(Debug, Clone)]
pub struct Settings {
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub tool_choice: ToolChoice,
}

impl Settings {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: None,
            max_tokens: None,
            tool_choice: ToolChoice::Auto,
        }
    }
}

/// Why a call to a [`Provider`] failed, independent of which vendor it
/// was talking to.
#[derive(Debug, Error, Clone)]
pub enum ProviderError {
    #[error("rate limited{}", .retry_after_ms.map(|ms| format!(", retry after {ms}ms")).unwrap_or_default())]
    RateLimited { retry_after_ms: Option<u64> },
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("provider server error: {0}")]
    Server(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("provider call timed out")]
    Timeout,
    #[error("could not parse provider response: {0}")]
    Parse(String),
}

impl ProviderError {
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::RateLimited { .. } => "RateLimited",
            ProviderError::Auth(_) => "AuthError",
            ProviderError::BadRequest(_) => "BadRequest",
            ProviderError::Server(_) => "ServerError",
            ProviderError::Transport(_) => "TransportError",
            ProviderError::Timeout => "Timeout",
            ProviderError::Parse(_) => "ParseError",
        }
    }

    /// Whether a retry loop should treat this as worth retrying: rate
    /// limits and anything
    /// that looks like a transient network or server hiccup, never an
    /// auth failure or malformed request.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. }
                | ProviderError::Server(_)
                | ProviderError::Transport(_)
                | ProviderError::Timeout
        )
    }
}

pub type RawFrame = Result<String, ProviderError>;
pub type RawFrameStream = Pin<Box<dyn Stream<Item = RawFrame> + Send>>;

/// The boundary every vendor backend implements. Only two operations: a
/// blocking request/response call and a streaming one that yields raw
/// provider-specific frames (SSE lines, typically) for the Stream
/// Normalizer to reassemble into canonical [`crate::stream::StreamEvent`]s.
/// Implementors own all networking; this crate never issues an HTTP call
/// itself.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Returns the model's reply alongside the token accounting for this
    /// one call, so a caller can fold it into a running per-run [`Usage`]
    /// total without re-deriving it from the wire response itself.
    async fn request(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        settings: &Settings,
    ) -> Result<(Message, Usage), ProviderError>;

    async fn request_stream(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        settings: &Settings,
    ) -> Result<RawFrameStream, ProviderError>;
}

/// Resolves a `provider:model_name` identifier to the
/// `(provider_token, model_name)` pair, and looks up the registered
/// [`Provider`] for the token.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    backends: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, token: impl Into<String>, provider: Arc<dyn Provider>) {
        self.backends.insert(token.into().to_lowercase(), provider);
    }

    pub fn get(&self, token: &str) -> Option<Arc<dyn Provider>> {
        self.backends.get(&token.to_lowercase()).cloned()
    }

    /// Splits `"openai:gpt-4"` into `("openai", "gpt-4")`. A model
    /// identifier with no `:` is rejected rather than guessed at — the
    /// caller must qualify which provider it means.
    pub fn parse_model_ref(model_ref: &str) -> Result<(&str, &str), crate::error::CoreError> {
        model_ref
            .split_once(':')
            .filter(|(provider, model)| !provider.is_empty() && !model.is_empty())
            .ok_or_else(|| {
                crate::error::CoreError::UnknownTool(format!(
                    "model identifier '{model_ref}' is not in provider:model_name form"
                ))
            })
    }

    pub fn resolve(&self, model_ref: &str) -> Result<(Arc<dyn Provider>, String), crate::error::CoreError> {
        let (token, model) = Self::parse_model_ref(model_ref)?;
        let provider = self.get(token).ok_or_else(|| {
            crate::error::CoreError::UnknownTool(format!("no provider registered for '{token}'"))
        })?;
        Ok((provider, model.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_choice_round_trips_through_json() {
        for tc in [
            ToolChoice::Auto,
            ToolChoice::Any,
            ToolChoice::None,
            ToolChoice::Tool("search".into()),
        ] {
            let json = serde_json::to_value(&tc).unwrap();
            let back: ToolChoice = serde_json::from_value(json).unwrap();
            assert_eq!(tc, back);
        }
    }

    #[test]
    fn parse_model_ref_splits_on_first_colon() {
        let (provider, model) = ProviderRegistry::parse_model_ref("openai:gpt-4").unwrap();
        assert_eq!(provider, "openai");
        assert_eq!(model, "gpt-4");
    }

    #[test]
    fn parse_model_ref_rejects_unqualified_names() {
        assert!(ProviderRegistry::parse_model_ref("gpt-4").is_err());
    }

    #[test]
    fn provider_error_transience_matches_retry_policy() {
        assert!(ProviderError::RateLimited { retry_after_ms: None }.is_transient());
        assert!(ProviderError::Server("502".into()).is_transient());
        assert!(!ProviderError::Auth("bad key".into()).is_transient());
        assert!(!ProviderError::BadRequest("bad schema".into()).is_transient());
    }
}
