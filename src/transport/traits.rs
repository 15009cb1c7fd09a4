//! Transport trait abstraction for pluggable Bluetooth backends
//!
//! Two seams: a stream connector producing byte streams (RFCOMM or its TCP
//! stand-in), and a GATT client whose links report host events through a
//! channel instead of callbacks.

use anyhow::Result;
use async_trait::async_trait;
use pillbox_shared::{link, CharacteristicRef, DeviceIdentity, Uuid};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

/// A transport stream that can read and write bytes
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Human-readable peer description for logs
    fn peer(&self) -> String;
}

/// How a stream socket is created, tried in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketStrategy {
    /// Direct socket on a fixed channel, for legacy serial modules
    LegacyChannel(u8),
    /// Service-record lookup with authentication
    SecureServiceRecord,
    /// Service-record lookup without authentication
    InsecureServiceRecord,
}

impl std::fmt::Display for SocketStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SocketStrategy::LegacyChannel(ch) => write!(f, "legacy channel {}", ch),
            SocketStrategy::SecureServiceRecord => write!(f, "secure service record"),
            SocketStrategy::InsecureServiceRecord => write!(f, "insecure service record"),
        }
    }
}

/// Ordered socket strategies for a device
pub fn connection_strategies(legacy: bool) -> Vec<SocketStrategy> {
    let mut strategies = Vec::with_capacity(3);
    if legacy {
        strategies.push(SocketStrategy::LegacyChannel(link::LEGACY_RFCOMM_CHANNEL));
    }
    strategies.push(SocketStrategy::SecureServiceRecord);
    strategies.push(SocketStrategy::InsecureServiceRecord);
    strategies
}

/// A created but not yet connected stream socket
#[async_trait]
pub trait PendingSocket: Send {
    /// Perform the (long-running) connect call
    async fn connect(self: Box<Self>) -> Result<Box<dyn TransportStream>>;
}

/// Factory for stream sockets
#[async_trait]
pub trait StreamConnector: Send + Sync + 'static {
    /// Create a socket for the device using one strategy
    async fn create_socket(
        &self,
        device: &DeviceIdentity,
        strategy: SocketStrategy,
    ) -> Result<Box<dyn PendingSocket>>;

    /// Stop any running discovery; discovery and connect share the radio
    async fn cancel_discovery(&self);

    /// Human-readable name for this transport
    fn name(&self) -> &'static str;
}

/// A GATT service as enumerated by the host stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

/// Host stack events for one GATT link, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattEvent {
    /// Radio link is up
    Connected,
    /// Radio link dropped
    Disconnected { reason: String },
    /// Service enumeration finished
    ServicesDiscovered(Vec<DiscoveredService>),
    /// Notification enable write acknowledged (or rejected)
    NotificationsEnabled(Result<(), String>),
    /// Characteristic value changed
    ValueChanged(Vec<u8>),
    /// Completion of an earlier write
    WriteCompleted(Result<(), String>),
}

/// Requests on an open GATT link. Each returns once the request is queued;
/// completion arrives as a [`GattEvent`].
pub trait GattLink: Send + Sync {
    fn discover_services(&self) -> Result<()>;

    fn enable_notifications(&self, target: CharacteristicRef) -> Result<()>;

    fn write(&self, target: CharacteristicRef, value: Vec<u8>) -> Result<()>;

    /// Release the link; idempotent
    fn close(&self);
}

/// Factory for GATT links
#[async_trait]
pub trait GattClient: Send + Sync + 'static {
    /// Open an auto-reconnecting link. Host events for the link are pushed
    /// into `events` until it is closed.
    async fn open(
        &self,
        device: &DeviceIdentity,
        events: mpsc::UnboundedSender<GattEvent>,
    ) -> Result<Box<dyn GattLink>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_strategy_order() {
        assert_eq!(
            connection_strategies(true),
            vec![
                SocketStrategy::LegacyChannel(1),
                SocketStrategy::SecureServiceRecord,
                SocketStrategy::InsecureServiceRecord,
            ]
        );
    }

    #[test]
    fn test_standard_strategy_order() {
        assert_eq!(
            connection_strategies(false),
            vec![
                SocketStrategy::SecureServiceRecord,
                SocketStrategy::InsecureServiceRecord,
            ]
        );
    }
}
