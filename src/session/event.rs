use pillbox_shared::{DecodedMessage, LinkError, TransportKind};
use std::fmt;

/// Identity of one session instance; never reused within a manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The id following this one
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a session observed
#[derive(Debug, Clone, PartialEq)]
pub enum SessionSignal {
    /// Attribute session found the target characteristic
    ServicesResolved,
    /// Session reached its ready state
    Ready,
    /// Decoded inbound message
    Inbound(DecodedMessage),
    /// Completion of an asynchronous write
    Delivery(Result<(), LinkError>),
    /// Session is closed and will not emit again
    Failed(LinkError),
}

/// A signal tagged with its source session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    pub id: SessionId,
    pub transport: TransportKind,
    pub signal: SessionSignal,
}
