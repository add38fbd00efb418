use serde::{Deserialize, Serialize};

/// Token accounting for a single provider call, normalized across vendors.
///
/// Field names are the canonical ones; `serde(alias = ...)` absorbs the
/// handful of wire spellings providers actually use so a `Provider` impl
/// can deserialize a raw response body straight into this type.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, Eq, PartialEq)]
pub struct Usage {
    #[serde(
        alias = "prompt_tokens",
        alias = "input_tokens",
        alias = "prompt_eval_count",
        alias = "promptTokenCount"
    )]
    pub input_tokens: u32,
    #[serde(
        alias = "completion_tokens",
        alias = "output_tokens",
        alias = "eval_count",
        alias = "candidatesTokenCount"
    )]
    pub output_tokens: u32,
    /// Tool calls dispatched so far, accumulated across a whole run rather
    /// than reported by any vendor wire format.
    #[serde(default)]
    pub tool_calls: u32,
    /// Provider requests issued so far, including retried attempts.
    #[serde(default)]
    pub requests: u32,
    /// Retry attempts spent so far, across both provider calls and tool
    /// dispatch.
    #[serde(default)]
    pub retries: u32,
}

impl Usage {
    /// Token total only; `tool_calls`/`requests`/`retries` are call counts,
    /// not tokens, and stay out of this sum.
    pub fn total_tokens(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }

    /// Accumulates another call's usage into a running session total.
    pub fn accumulate(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.tool_calls += other.tool_calls;
        self.requests += other.requests;
        self.retries += other.retries;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulate_sums_all_fields() {
        let mut total = Usage::default();
        total.accumulate(&Usage { input_tokens: 10, output_tokens: 5, tool_calls: 1, requests: 1, retries: 0 });
        total.accumulate(&Usage { input_tokens: 3, output_tokens: 7, tool_calls: 2, requests: 1, retries: 1 });
        assert_eq!(
            total,
            Usage { input_tokens: 13, output_tokens: 12, tool_calls: 3, requests: 2, retries: 1 }
        );
        assert_eq!(total.total_tokens(), 25);
    }

    #[test]
    fn deserializes_anthropic_style_aliases() {
        let raw = r#"{"input_tokens": 42, "output_tokens": 8}"#;
        let u: Usage = serde_json::from_str(raw).unwrap();
        assert_eq!(u.input_tokens, 42);
        assert_eq!(u.output_tokens, 8);
    }

    #[test]
    fn deserializes_openai_style_aliases() {
        let raw = r#"{"prompt_tokens": 42, "completion_tokens": 8}"#;
        let u: Usage = serde_json::from_str(raw).unwrap();
        assert_eq!(u.input_tokens, 42);
        assert_eq!(u.output_tokens, 8);
    }
}
