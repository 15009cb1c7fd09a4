//! Transport sessions
//!
//! A session owns one transport connection for one attempt. Sessions run
//! their I/O in their own tasks and report everything they observe as
//! [`SessionEvent`]s on a channel shared with the orchestrator:
//! - Stream sessions: socket strategies, settling delay, read loop
//! - Attribute sessions: service lookup, notification subscription,
//!   asynchronous write completions
//!
//! Closing a session is terminal; a closed session never emits again.

mod attribute;
mod event;
mod stream;

pub use attribute::AttributeSession;
pub use event::{SessionEvent, SessionId, SessionSignal};
pub use stream::{StreamSession, StreamTarget};
