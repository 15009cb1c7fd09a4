//! Connection manager: configuration, application events and the handle
//! used to drive the orchestrator task

use super::orchestrator::Orchestrator;
use crate::permissions::{AlwaysGranted, BluezPermissions, PermissionGate};
use crate::transport::{
    BluerGattClient, BtDiscovery, GattClient, GattConfig, RfcommConnector, StreamConnector,
    TcpConnector, UnavailableGatt,
};
use anyhow::Result;
use pillbox_shared::{
    link, Advisory, CharacteristicRef, ConnectionState, DecodedMessage, DeviceIdentity,
    DoseSchedule, LinkError, RetryPolicy, TransportKind,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tracing::info;

/// Events delivered to the application, in order
#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    /// Connection indicator changed
    State(ConnectionState),
    /// Inbound message from the bound session
    Message(DecodedMessage),
    /// Transient notice
    Advisory(Advisory),
    /// Peripheral asked for a reminder notification
    ShowReminder { payload: String },
}

/// Bluetooth transport mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BluetoothMode {
    /// Use BlueZ for both transports
    #[default]
    Bluez,
    /// Stream transport over TCP, no attribute transport (for development)
    TcpSimulation,
}

/// Bluetooth configuration
#[derive(Debug, Clone)]
pub struct BluetoothConfig {
    /// Bluetooth transport mode
    pub mode: BluetoothMode,
    /// TCP simulation address (when mode is TcpSimulation)
    pub tcp_address: String,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            mode: BluetoothMode::Bluez,
            tcp_address: "127.0.0.1:9000".into(),
        }
    }
}

/// Configuration for connection manager
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Delay before the stream transport joins the race
    pub fallback_delay: Duration,
    /// Pause before the stream socket connect call
    pub settle_delay: Duration,
    /// Retry budget and backoff
    pub retry: RetryPolicy,
    /// Bound this long, a session resets the retry counter
    pub stable_after: Duration,
    /// Name fragment of legacy dual-mode modules (case-insensitive)
    pub legacy_name_pattern: String,
    /// Spacing between schedule frames
    pub command_spacing: Duration,
    /// Attribute service and characteristic carrying the byte stream
    pub target: CharacteristicRef,
    /// Bluetooth configuration
    pub bluetooth: BluetoothConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            fallback_delay: Duration::from_millis(link::FALLBACK_DELAY_MS),
            settle_delay: Duration::from_millis(link::SETTLE_DELAY_MS),
            retry: RetryPolicy::default(),
            stable_after: Duration::from_millis(link::STABLE_AFTER_MS),
            legacy_name_pattern: link::LEGACY_NAME_PATTERN.into(),
            command_spacing: Duration::from_millis(link::COMMAND_SPACING_MS),
            target: CharacteristicRef::default(),
            bluetooth: BluetoothConfig::default(),
        }
    }
}

/// Collaborators the orchestrator drives
#[derive(Clone)]
pub struct Transports {
    pub gatt: Arc<dyn GattClient>,
    pub stream: Arc<dyn StreamConnector>,
    pub permissions: Arc<dyn PermissionGate>,
}

impl Transports {
    /// Transports for the configured mode
    pub fn for_config(config: &BluetoothConfig, discovery: Arc<BtDiscovery>) -> Self {
        match config.mode {
            BluetoothMode::Bluez => Self {
                gatt: Arc::new(BluerGattClient::new(GattConfig::default())),
                stream: Arc::new(RfcommConnector::new(discovery)),
                permissions: Arc::new(BluezPermissions),
            },
            BluetoothMode::TcpSimulation => Self {
                gatt: Arc::new(UnavailableGatt),
                stream: Arc::new(TcpConnector::new(config.tcp_address.clone())),
                permissions: Arc::new(AlwaysGranted),
            },
        }
    }
}

pub(super) enum Command {
    Connect {
        device: DeviceIdentity,
        reply: oneshot::Sender<Result<(), LinkError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Send {
        text: String,
        reply: oneshot::Sender<Result<TransportKind, LinkError>>,
    },
}

/// Cloneable handle for issuing requests to the orchestrator
#[derive(Clone)]
pub struct ConnectionHandle {
    commands: mpsc::Sender<Command>,
    command_spacing: Duration,
}

impl ConnectionHandle {
    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, LinkError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| LinkError::Closed)?;
        rx.await.map_err(|_| LinkError::Closed)
    }

    /// Race both transports to the device, replacing any current session
    pub async fn request_connection(&self, device: DeviceIdentity) -> Result<(), LinkError> {
        self.call(|reply| Command::Connect { device, reply }).await?
    }

    /// Tear down whatever is active or racing
    pub async fn disconnect(&self) {
        let _ = self.call(|reply| Command::Disconnect { reply }).await;
    }

    /// Send text over the bound session. Returns the transport used; for
    /// the attribute transport the delivery outcome arrives as an advisory.
    pub async fn send(&self, text: impl Into<String>) -> Result<TransportKind, LinkError> {
        let text = text.into();
        self.call(|reply| Command::Send { text, reply }).await?
    }

    /// Send the morning, afternoon and night frames, spaced apart
    pub async fn send_schedule(&self, schedule: &DoseSchedule) -> Result<()> {
        let commands = schedule.commands()?;
        for (i, command) in commands.into_iter().enumerate() {
            if i > 0 {
                sleep(self.command_spacing).await;
            }
            self.send(command).await?;
        }
        info!("[LINK] Schedule sent");
        Ok(())
    }
}

/// Owns the orchestrator task and the application event stream
pub struct ConnectionManager {
    handle: ConnectionHandle,
    /// Channel to receive application events
    event_rx: mpsc::UnboundedReceiver<AppEvent>,
}

impl ConnectionManager {
    /// Create a new connection manager and start the orchestrator
    pub fn new(config: ConnectionConfig, transports: Transports) -> Self {
        let (command_tx, command_rx) = mpsc::channel::<Command>(100);
        let (event_tx, event_rx) = mpsc::unbounded_channel::<AppEvent>();

        let handle = ConnectionHandle {
            commands: command_tx,
            command_spacing: config.command_spacing,
        };

        let orchestrator = Orchestrator::new(config, transports, event_tx);
        tokio::spawn(orchestrator.run(command_rx));

        Self { handle, event_rx }
    }

    /// Receive the next application event
    pub async fn recv(&mut self) -> Option<AppEvent> {
        self.event_rx.recv().await
    }

    /// Get a clone of the request handle
    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    pub async fn request_connection(&self, device: DeviceIdentity) -> Result<(), LinkError> {
        self.handle.request_connection(device).await
    }

    pub async fn disconnect(&self) {
        self.handle.disconnect().await
    }

    pub async fn send(&self, text: impl Into<String>) -> Result<TransportKind, LinkError> {
        self.handle.send(text).await
    }
}
