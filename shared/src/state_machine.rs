//! Link State Machine
//!
//! Decides how the connection orchestrator races the two transports,
//! binds a winner, and retries after failures. It owns the retry counter
//! and the application-visible connection state; the orchestrator feeds it
//! events and executes the returned actions in order.

use crate::error::LinkError;
use crate::events::{Advisory, ConnectionState, TransportKind};
use crate::retry::RetryPolicy;
use std::time::Duration;

/// Orchestrator phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    /// No attempt in progress
    Idle,
    /// Sessions racing; flags mark which ones are live
    Racing { attribute: bool, stream: bool },
    /// Exactly one session is active
    Bound(TransportKind),
    /// Waiting out the backoff before attempt `attempt + 1`
    BackingOff { attempt: u32 },
    /// Gave up after `attempts` consecutive failures
    Failed { attempts: u32 },
}

/// Inputs to the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Application asked for a fresh connection
    ConnectRequested,
    /// Fallback timer fired
    FallbackElapsed,
    /// A live session reached its ready state
    SessionReady(TransportKind),
    /// A live session terminated
    SessionFailed {
        transport: TransportKind,
        error: LinkError,
    },
    /// Backoff delay elapsed
    RetryElapsed,
    /// The bound session survived the stability window
    StableElapsed,
    /// Application asked to tear everything down
    DisconnectRequested,
}

/// Side effects for the orchestrator, executed in order
#[derive(Debug, Clone, PartialEq)]
pub enum LinkAction {
    StartSession(TransportKind),
    AbortSession(TransportKind),
    ArmFallback,
    ArmRetry(Duration),
    ArmStability,
    CancelTimers,
    EmitState(ConnectionState),
    Advise(Advisory),
}

/// The link state machine for one orchestrator
#[derive(Debug)]
pub struct LinkStateMachine {
    phase: LinkPhase,
    policy: RetryPolicy,
    retries: u32,
    visible: ConnectionState,
}

impl Default for LinkStateMachine {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl LinkStateMachine {
    /// Create a new state machine in Idle
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            phase: LinkPhase::Idle,
            policy,
            retries: 0,
            visible: ConnectionState::Disconnected,
        }
    }

    pub fn phase(&self) -> LinkPhase {
        self.phase
    }

    /// Consecutive failed attempts so far
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Last connection state reported to the application
    pub fn visible_state(&self) -> ConnectionState {
        self.visible
    }

    /// Transport of the bound session, if any
    pub fn bound(&self) -> Option<TransportKind> {
        match self.phase {
            LinkPhase::Bound(kind) => Some(kind),
            _ => None,
        }
    }

    /// Whether a session of this kind is expected to be running
    pub fn is_live(&self, kind: TransportKind) -> bool {
        match self.phase {
            LinkPhase::Racing { attribute, stream } => match kind {
                TransportKind::Attribute => attribute,
                TransportKind::Stream => stream,
            },
            LinkPhase::Bound(bound) => bound == kind,
            _ => false,
        }
    }

    /// Process an event and return the actions to perform
    pub fn process_event(&mut self, event: LinkEvent) -> Vec<LinkAction> {
        match event {
            LinkEvent::ConnectRequested => {
                let mut actions = self.teardown();
                self.retries = 0;
                actions.extend(self.start_race());
                actions
            }
            LinkEvent::FallbackElapsed => self.on_fallback(),
            LinkEvent::SessionReady(kind) => self.on_ready(kind),
            LinkEvent::SessionFailed { transport, error } => self.on_failed(transport, error),
            LinkEvent::RetryElapsed => match self.phase {
                LinkPhase::BackingOff { .. } => self.start_race(),
                _ => Vec::new(),
            },
            LinkEvent::StableElapsed => {
                if self.bound().is_some() {
                    self.retries = 0;
                }
                Vec::new()
            }
            LinkEvent::DisconnectRequested => {
                let mut actions = self.teardown();
                self.phase = LinkPhase::Idle;
                self.retries = 0;
                actions.extend(self.show(ConnectionState::Disconnected));
                actions
            }
        }
    }

    fn start_race(&mut self) -> Vec<LinkAction> {
        self.phase = LinkPhase::Racing {
            attribute: true,
            stream: false,
        };
        let mut actions = vec![
            LinkAction::StartSession(TransportKind::Attribute),
            LinkAction::ArmFallback,
        ];
        actions.extend(self.show(ConnectionState::Connecting));
        actions
    }

    fn on_fallback(&mut self) -> Vec<LinkAction> {
        let LinkPhase::Racing {
            attribute,
            stream: false,
        } = self.phase
        else {
            return Vec::new();
        };

        self.phase = LinkPhase::Racing {
            attribute,
            stream: true,
        };
        vec![
            LinkAction::Advise(Advisory::FallbackStarted),
            LinkAction::StartSession(TransportKind::Stream),
        ]
    }

    fn on_ready(&mut self, kind: TransportKind) -> Vec<LinkAction> {
        if !matches!(self.phase, LinkPhase::Racing { .. }) || !self.is_live(kind) {
            return Vec::new();
        }

        let mut actions = Vec::new();
        if self.is_live(kind.other()) {
            actions.push(LinkAction::AbortSession(kind.other()));
        }
        actions.push(LinkAction::CancelTimers);
        self.phase = LinkPhase::Bound(kind);
        actions.push(LinkAction::ArmStability);
        actions.extend(self.show(ConnectionState::Connected));
        actions
    }

    fn on_failed(&mut self, transport: TransportKind, error: LinkError) -> Vec<LinkAction> {
        match self.phase {
            LinkPhase::Racing { attribute, stream } => match transport {
                TransportKind::Attribute if attribute => {
                    let advisory = if error == LinkError::ServiceNotFound {
                        Advisory::ServiceNotFound
                    } else {
                        Advisory::TransportFailed { transport, error }
                    };
                    self.phase = LinkPhase::Racing {
                        attribute: false,
                        stream: true,
                    };
                    let mut actions = vec![LinkAction::Advise(advisory)];
                    if !stream {
                        actions.push(LinkAction::StartSession(TransportKind::Stream));
                    }
                    actions
                }
                TransportKind::Stream if stream => {
                    let mut actions = Vec::new();
                    if attribute {
                        actions.push(LinkAction::AbortSession(TransportKind::Attribute));
                    }
                    actions.extend(self.attempt_failed(error));
                    actions
                }
                _ => Vec::new(),
            },
            LinkPhase::Bound(bound) if bound == transport => self.attempt_failed(error),
            _ => Vec::new(),
        }
    }

    fn attempt_failed(&mut self, error: LinkError) -> Vec<LinkAction> {
        let attempt = self.retries + 1;
        let mut actions = vec![LinkAction::CancelTimers];

        if self.policy.should_retry(attempt) {
            self.retries = attempt;
            self.phase = LinkPhase::BackingOff { attempt };
            let delay = self.policy.backoff_delay(attempt);
            actions.extend(self.show(ConnectionState::Connecting));
            actions.push(LinkAction::Advise(Advisory::Retrying {
                attempt,
                max_retries: self.policy.max_retries,
                delay,
                error,
            }));
            actions.push(LinkAction::ArmRetry(delay));
        } else {
            self.retries = 0;
            self.phase = LinkPhase::Failed { attempts: attempt };
            actions.push(LinkAction::Advise(Advisory::MaxRetriesReached {
                attempts: attempt,
                error,
            }));
            actions.extend(self.show(ConnectionState::Disconnected));
        }
        actions
    }

    /// Abort whatever is live and stop all timers
    fn teardown(&mut self) -> Vec<LinkAction> {
        let mut actions = Vec::new();
        for kind in [TransportKind::Attribute, TransportKind::Stream] {
            if self.is_live(kind) {
                actions.push(LinkAction::AbortSession(kind));
            }
        }
        actions.push(LinkAction::CancelTimers);
        actions
    }

    fn show(&mut self, state: ConnectionState) -> Option<LinkAction> {
        if self.visible == state {
            return None;
        }
        self.visible = state;
        Some(LinkAction::EmitState(state))
    }
}
