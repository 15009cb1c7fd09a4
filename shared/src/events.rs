//! Application-facing event vocabulary

use crate::error::LinkError;
use crate::protocol::Period;
use std::fmt;
use std::time::Duration;

/// The two racing transports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Attribute-based low-energy transport (GATT)
    Attribute,
    /// Connection-oriented stream transport (RFCOMM serial port)
    Stream,
}

impl TransportKind {
    pub fn other(self) -> Self {
        match self {
            TransportKind::Attribute => TransportKind::Stream,
            TransportKind::Stream => TransportKind::Attribute,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Attribute => write!(f, "BLE"),
            TransportKind::Stream => write!(f, "Classic"),
        }
    }
}

/// Connection indicator shown by the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Not Connected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
        }
    }
}

/// Transient notices rendered as toast/log lines
#[derive(Debug, Clone, PartialEq)]
pub enum Advisory {
    /// Attribute transport exposes no usable service; stream takes over
    ServiceNotFound,
    /// Fallback timer fired before the attribute transport became ready
    FallbackStarted,
    /// A racing transport gave up while the other keeps trying
    TransportFailed {
        transport: TransportKind,
        error: LinkError,
    },
    /// An attempt failed and another one is scheduled
    Retrying {
        attempt: u32,
        max_retries: u32,
        delay: Duration,
        error: LinkError,
    },
    /// Retry budget exhausted; no further automatic attempts
    MaxRetriesReached { attempts: u32, error: LinkError },
    /// Outbound frame accepted by the peripheral
    DataSent { transport: TransportKind },
    /// Outbound frame failed; the session stays open
    SendFailed {
        transport: TransportKind,
        error: LinkError,
    },
    /// Peripheral confirmed a schedule entry
    ScheduleAcknowledged(Period),
    /// Precondition owned by an external collaborator is unmet
    PermissionDenied(String),
}

impl fmt::Display for Advisory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Advisory::ServiceNotFound => write!(f, "BLE Service not found"),
            Advisory::FallbackStarted => {
                write!(f, "BLE connection failed, trying Classic Bluetooth...")
            }
            Advisory::TransportFailed { transport, error } => {
                write!(f, "{} transport failed: {}", transport, error)
            }
            Advisory::Retrying {
                attempt,
                max_retries,
                error,
                ..
            } => write!(
                f,
                "{}. Retry attempt {} of {}",
                error, attempt, max_retries
            ),
            Advisory::MaxRetriesReached { error, .. } => write!(
                f,
                "{}. Max connection attempts reached. Please try manually connecting again.",
                error
            ),
            Advisory::DataSent { .. } => write!(f, "Data sent successfully"),
            Advisory::SendFailed { error, .. } => write!(f, "{}", error),
            Advisory::ScheduleAcknowledged(period) => {
                write!(f, "{} time set successfully", period)
            }
            Advisory::PermissionDenied(reason) => {
                write!(f, "Bluetooth permissions not granted: {}", reason)
            }
        }
    }
}
