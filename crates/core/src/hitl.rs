use async_trait::async_trait;
use serde_json::Value;

/// A tool call awaiting a human decision before the Tool Executor will run
/// it, surfaced to whatever UI or channel the host wires up.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalRequest {
    pub session_id: String,
    pub call_id: String,
    pub tool_name: String,
    pub arguments: Value,
}

/// What a human decided about an [`ApprovalRequest`]: approve, reject, or
/// approve with the arguments edited first.
#[derive(Debug, Clone, PartialEq)]
pub enum ApprovalDecision {
    Approved,
    Rejected { reason: String },
    /// Approved, but with the arguments replaced before dispatch.
    Edited { arguments: Value },
}

/// Gate the Tool Executor calls through for any tool whose
/// `ToolDescriptor::requires_approval` is set. The trait lives in this
/// crate so the executor can depend on it abstractly; a concrete
/// implementation (e.g. one that broadcasts the request to subscribers
/// and defaults to rejection on timeout) lives alongside the Session
/// Server that actually has subscribers to ask.
#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    async fn request_approval(&self, request: ApprovalRequest) -> ApprovalDecision;
}

/// Approves everything immediately. Useful as a default when no approval
/// gate is configured, and in tests that don't exercise HITL behavior.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoApprove;

#[async_trait]
impl ApprovalHandler for AutoApprove {
    async fn request_approval(&self, _request: ApprovalRequest) -> ApprovalDecision {
        ApprovalDecision::Approved
    }
}
