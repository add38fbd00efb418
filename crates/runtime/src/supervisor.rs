use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::approval::BroadcastApprovalHandler;
use crate::error::RuntimeError;
use crate::runner::{Agent, RunOutcome};
use crate::session::{SessionId, SessionServer};

/// Owns every active [`SessionServer`], and isolates a panicking run so it
/// takes down only that session's `send_message` call, not the process.
/// Crash isolation is done by running the agent loop on its own Tokio task
/// and inspecting the `JoinHandle`'s result, not `catch_unwind` across an
/// await point (which isn't sound for futures that hold non-unwind-safe
/// state).
#[derive(Default)]
pub struct Supervisor {
    sessions: Mutex<HashMap<SessionId, Arc<SessionServer>>>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new session bound to `agent` and returns a handle to it.
    pub async fn spawn_session(&self, agent: Arc<Agent>) -> Arc<SessionServer> {
        let id = SessionId::new();
        let approval = Arc::new(BroadcastApprovalHandler::new(64));
        let session = Arc::new(SessionServer::new(id.clone(), agent, approval));
        self.sessions.lock().await.insert(id, session.clone());
        session
    }

    pub async fn get(&self, id: &SessionId) -> Option<Arc<SessionServer>> {
        self.sessions.lock().await.get(id).cloned()
    }

    /// Sends a message on `id`'s session inside a dedicated task, so a
    /// panic inside the agent loop (a buggy tool handler, say) surfaces as
    /// a `Panicked` error instead of crashing whatever called this.
    pub async fn dispatch_send_message(
        &self,
        id: &SessionId,
        text: impl Into<String> + Send + 'static,
    ) -> Result<RunOutcome, RuntimeError> {
        let session = self
            .get(id)
            .await
            .ok_or_else(|| RuntimeError::SessionNotFound(id.clone()))?;

        let handle = tokio::spawn(async move { session.send_message(text).await });
        match handle.await {
            Ok(outcome) => Ok(outcome),
            Err(join_err) => {
                log::error!("session {id} panicked mid-run: {join_err}");
                Err(RuntimeError::Panicked {
                    session: id.clone(),
                    detail: join_err.to_string(),
                })
            }
        }
    }

    pub async fn shutdown_session(&self, id: &SessionId) {
        if let Some(session) = self.sessions.lock().await.remove(id) {
            session.cancel().await;
        }
    }

    pub async fn shutdown_all(&self) {
        let sessions = std::mem::take(&mut *self.sessions.lock().await);
        for (_, session) in sessions {
            session.cancel().await;
        }
    }
}
