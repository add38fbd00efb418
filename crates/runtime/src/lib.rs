//! The iterated reason-act loop, session server, and supervisor built on
//! top of `agent-core`'s provider-agnostic vocabulary.
//!
//! This crate has no opinion about which vendor backend or tool
//! implementations a host wires in — it only drives them: [`Agent`] runs
//! the Prepare/AwaitModel/Dispatch state machine for one conversation turn
//! at a time, [`SessionServer`] wraps that in the operations a chat UI or
//! API actually calls (send a message, cancel, approve a pending tool
//! call, subscribe to events, read history, clear), and [`Supervisor`]
//! owns the map of live sessions and isolates a panicking run from taking
//! down anything else.

pub mod approval;
pub mod error;
pub mod runner;
pub mod session;
pub mod supervisor;

pub use approval::BroadcastApprovalHandler;
pub use error::RuntimeError;
pub use runner::{Agent, AgentBuilder, AgentStreamEvent, RunOutcome};
pub use session::{SessionEvent, SessionId, SessionServer};
pub use supervisor::Supervisor;
