use crate::session::SessionId;

/// Orchestration-level failures that sit above [`agent_core::CoreError`] —
/// session bookkeeping and supervision, rather than anything about a
/// single run. The enum stays concrete, rather than a boxed `dyn Error`,
/// so a host can match on `SessionNotFound` to return e.g. a 404 rather
/// than a 500.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("no session with id {0}")]
    SessionNotFound(SessionId),

    #[error("session {0} already exists")]
    AlreadyExists(SessionId),

    #[error("session {session} panicked mid-run: {detail}")]
    Panicked { session: SessionId, detail: String },

    #[error("session {0} has a run in progress")]
    RunActive(SessionId),

    #[error(transparent)]
    Core(#[from] agent_core::CoreError),
}
