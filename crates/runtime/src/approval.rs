use std::collections::HashMap;
use std::sync::Mutex;

use agent_core::hitl::{ApprovalDecision, ApprovalHandler, ApprovalRequest};
use async_trait::async_trait;
use tokio::sync::{broadcast, oneshot};

/// Publishes [`ApprovalRequest`]s to whoever is subscribed (typically the
/// Session Server's own subscribers) and waits for one of them to call
/// [`resolve`] with a decision. The wait itself has no timeout here — the
/// Tool Executor wraps `request_approval` in its own timeout and treats an
/// elapsed wait as a rejection, so this handler only needs to know how to
/// wait, not how long.
///
/// [`resolve`]: BroadcastApprovalHandler::resolve
pub struct BroadcastApprovalHandler {
    requests: broadcast::Sender<ApprovalRequest>,
    pending: Mutex<HashMap<String, oneshot::Sender<ApprovalDecision>>>,
}

impl BroadcastApprovalHandler {
    pub fn new(capacity: usize) -> Self {
        let (requests, _) = broadcast::channel(capacity);
        Self {
            requests,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// A feed of every approval request raised while this subscription is
    /// alive, for a UI or CLI prompt to drive off of.
    pub fn subscribe(&self) -> broadcast::Receiver<ApprovalRequest> {
        self.requests.subscribe()
    }

    /// Delivers a human's decision for `call_id`. Returns `false` if no
    /// handler is currently waiting on that call (it already timed out, or
    /// the id was never requested).
    pub fn resolve(&self, call_id: &str, decision: ApprovalDecision) -> bool {
        let sender = self.pending.lock().unwrap().remove(call_id);
        match sender {
            Some(tx) => tx.send(decision).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl ApprovalHandler for BroadcastApprovalHandler {
    async fn request_approval(&self, request: ApprovalRequest) -> ApprovalDecision {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(request.call_id.clone(), tx);
        if self.requests.send(request).is_err() {
            log::debug!("no subscribers listening for approval requests");
        }
        rx.await.unwrap_or(ApprovalDecision::Rejected {
            reason: "approval channel closed before a decision arrived".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_delivers_decision_to_waiting_request() {
        let handler = BroadcastApprovalHandler::new(8);
        let mut requests = handler.subscribe();

        let request_future = handler.request_approval(ApprovalRequest {
            session_id: "s1".into(),
            call_id: "c1".into(),
            tool_name: "danger".into(),
            arguments: serde_json::Value::Null,
        });

        let resolved = tokio::spawn(async move {
            let seen = requests.recv().await.unwrap();
            assert_eq!(seen.call_id, "c1");
        });

        let (decision, _) = tokio::join!(request_future, resolved);
        let _ = decision;
    }

    #[tokio::test]
    async fn resolve_on_unknown_call_id_returns_false() {
        let handler = BroadcastApprovalHandler::new(8);
        assert!(!handler.resolve("missing", ApprovalDecision::Approved));
    }

    #[tokio::test]
    async fn decision_reaches_the_waiting_future() {
        let handler = std::sync::Arc::new(BroadcastApprovalHandler::new(8));
        let h2 = handler.clone();
        let waiter = tokio::spawn(async move {
            h2.request_approval(ApprovalRequest {
                session_id: "s1".into(),
                call_id: "c1".into(),
                tool_name: "danger".into(),
                arguments: serde_json::Value::Null,
            })
            .await
        });
        // give the spawned task a chance to register its pending sender
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(handler.resolve("c1", ApprovalDecision::Approved));
        let decision = waiter.await.unwrap();
        assert_eq!(decision, ApprovalDecision::Approved);
    }
}
