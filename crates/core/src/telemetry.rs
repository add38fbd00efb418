use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::usage::Usage;

/// Canonical, stable event names a host can alert or graph on without
/// reading this crate's source. Carried as a tagged enum rather
/// than a free-form string + payload map so the field names for each kind
/// are checked at compile time; `Serialize` still gives a host the
/// `{"type": "tool_call_start", ...}` shape it can forward to any sink.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TelemetryEvent {
    RunStart {
        session_id: String,
    },
    RunEnd {
        session_id: String,
        outcome: String,
    },
    ProviderRequestStart {
        session_id: String,
        provider: String,
        model: String,
        attempt: u32,
    },
    ProviderRequestEnd {
        session_id: String,
        provider: String,
        model: String,
        usage: Option<Usage>,
        finish_reason: Option<String>,
    },
    ProviderRetry {
        session_id: String,
        provider: String,
        attempt: u32,
        wait_ms: u64,
        reason: String,
    },
    ToolCallStart {
        session_id: String,
        tool_name: String,
        call_id: String,
        attempt: u32,
    },
    ToolCallEnd {
        session_id: String,
        tool_name: String,
        call_id: String,
        is_error: bool,
        duration_ms: u64,
    },
    ApprovalRequested {
        session_id: String,
        tool_name: String,
        call_id: String,
    },
    ApprovalResolved {
        session_id: String,
        call_id: String,
        approved: bool,
    },
    ContextUpdateApplied {
        session_id: String,
        op: String,
        key: Option<String>,
    },
    RunFailed {
        session_id: String,
        error_kind: String,
        detail: Option<String>,
    },
    /// Escape hatch for a host-defined event the core doesn't know the
    /// shape of in advance.
    Custom {
        session_id: String,
        name: String,
        payload: Value,
    },
}

/// Observer interface every run notifies, in place of a global event bus:
/// an explicit observer, not ambient pub/sub. A host
/// that wants a `broadcast::Receiver`-backed subscription feed, the way
/// the Session Server exposes one, implements this and fans events out
/// itself.
pub trait Observer: Send + Sync {
    fn notify(&self, event: TelemetryEvent);
}

/// Default observer for callers that don't care about telemetry.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl Observer for NoopObserver {
    fn notify(&self, _event: TelemetryEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_stable_snake_case_tag() {
        let ev = TelemetryEvent::ToolCallStart {
            session_id: "s1".into(),
            tool_name: "search".into(),
            call_id: "c1".into(),
            attempt: 0,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "tool_call_start");
        assert_eq!(json["tool_name"], "search");
    }

    #[test]
    fn noop_observer_does_not_panic() {
        let obs = NoopObserver;
        obs.notify(TelemetryEvent::RunStart { session_id: "s1".into() });
    }
}
