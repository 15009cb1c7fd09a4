//! Pillbox Shared Protocol Types
//!
//! This crate provides the I/O-free pieces of the pillbox connectivity core:
//! the frame codec, the peripheral wire protocol, the retry policy, the link
//! state machine that drives the connection orchestrator, and the device
//! registry.

pub mod codec;
pub mod error;
pub mod events;
pub mod protocol;
pub mod registry;
pub mod retry;
pub mod state_machine;

pub use codec::DecodedMessage;
pub use error::{LinkError, ProtocolError};
pub use events::{Advisory, ConnectionState, TransportKind};
pub use protocol::{DoseSchedule, InboundKind, Period, ScheduleTime};
pub use registry::{DeviceIdentity, DeviceRegistry, DeviceSource};
pub use retry::RetryPolicy;
pub use uuid::Uuid;

/// Timing and sizing parameters for the link
pub mod link {
    /// Maximum consecutive failed attempts before giving up
    pub const MAX_RETRIES: u32 = 3;

    /// Linear backoff step between retries in milliseconds
    pub const BACKOFF_STEP_MS: u64 = 1000;

    /// Delay before the stream transport joins the race
    pub const FALLBACK_DELAY_MS: u64 = 5000;

    /// Settling delay before the stream socket connect call
    pub const SETTLE_DELAY_MS: u64 = 1000;

    /// A bound session older than this resets the retry counter
    pub const STABLE_AFTER_MS: u64 = 10_000;

    /// Attribute scan period
    pub const SCAN_PERIOD_MS: u64 = 10_000;

    /// Spacing between consecutive schedule frames
    pub const COMMAND_SPACING_MS: u64 = 500;

    /// Stream read buffer size
    pub const READ_BUFFER_SIZE: usize = 1024;

    /// Name fragment identifying the legacy dual-mode serial module
    pub const LEGACY_NAME_PATTERN: &str = "HC-05";

    /// RFCOMM channel used by the legacy socket path
    pub const LEGACY_RFCOMM_CHANNEL: u8 = 1;
}

/// Fixed well-known identifiers of the peripheral firmware
pub mod uuids {
    use uuid::Uuid;

    /// Serial port profile service record
    pub const SPP_SERVICE: Uuid = Uuid::from_u128(0x00001101_0000_1000_8000_00805F9B34FB);

    /// Attribute service exposed by the serial bridge
    pub const BRIDGE_SERVICE: Uuid = Uuid::from_u128(0x0000FFE0_0000_1000_8000_00805F9B34FB);

    /// Read/write/notify characteristic inside [`BRIDGE_SERVICE`]
    pub const BRIDGE_CHARACTERISTIC: Uuid =
        Uuid::from_u128(0x0000FFE1_0000_1000_8000_00805F9B34FB);
}

/// Service/characteristic pair addressed by the attribute transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicRef {
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl CharacteristicRef {
    pub const fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }
}

impl Default for CharacteristicRef {
    fn default() -> Self {
        Self::new(uuids::BRIDGE_SERVICE, uuids::BRIDGE_CHARACTERISTIC)
    }
}

impl std::fmt::Display for CharacteristicRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.service, self.characteristic)
    }
}
