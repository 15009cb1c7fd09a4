//! GATT client backed by BlueZ
//!
//! Each open link runs two tasks: a radio watcher that keeps the link
//! connected and reports up/down transitions, and an op worker that runs
//! queued requests in order and reports their completion.

use crate::transport::traits::{DiscoveredService, GattClient, GattEvent, GattLink};
use anyhow::{anyhow, Context as _, Result};
use async_trait::async_trait;
use bluer::gatt::remote::Characteristic;
use bluer::{Address, Device, DeviceEvent, DeviceProperty};
use futures::StreamExt;
use pillbox_shared::{CharacteristicRef, DeviceIdentity};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Upper bound on waiting for BlueZ to resolve services
const SERVICE_RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);
const SERVICE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// BlueZ GATT client configuration
#[derive(Debug, Clone)]
pub struct GattConfig {
    /// Pause between background connect attempts
    pub reconnect_interval: Duration,
}

impl Default for GattConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(2),
        }
    }
}

enum GattOp {
    DiscoverServices,
    EnableNotifications(CharacteristicRef),
    Write(CharacteristicRef, Vec<u8>),
}

type TaskList = Arc<Mutex<Vec<JoinHandle<()>>>>;

/// GATT client for BlueZ
pub struct BluerGattClient {
    config: GattConfig,
}

impl BluerGattClient {
    pub fn new(config: GattConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl GattClient for BluerGattClient {
    async fn open(
        &self,
        device: &DeviceIdentity,
        events: mpsc::UnboundedSender<GattEvent>,
    ) -> Result<Box<dyn GattLink>> {
        let address: Address = device
            .address()
            .parse()
            .with_context(|| format!("Invalid Bluetooth address '{}'", device.address()))?;

        let session = bluer::Session::new().await?;
        let adapter = session.default_adapter().await?;
        if !adapter.is_powered().await? {
            adapter.set_powered(true).await?;
        }
        let handle = adapter.device(address)?;

        // Trusted devices may reconnect without a prompt
        if let Err(e) = handle.set_trusted(true).await {
            debug!("[GATT] Could not mark {} trusted: {}", address, e);
        }

        info!("[GATT] Opening link to {}", device);

        let tasks: TaskList = Arc::new(Mutex::new(Vec::new()));
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();

        let radio = tokio::spawn(watch_radio(
            session,
            handle.clone(),
            events.clone(),
            self.config.reconnect_interval,
        ));
        let worker = tokio::spawn(run_ops(handle, ops_rx, events, tasks.clone()));
        if let Ok(mut list) = tasks.lock() {
            list.push(radio);
            list.push(worker);
        }

        Ok(Box::new(BluerGattLink {
            ops: ops_tx,
            address,
            tasks,
            closed: AtomicBool::new(false),
        }))
    }
}

/// Handle to one opened link. Holds no `Device`: disconnecting the device
/// would also drop an RFCOMM link to the same address.
struct BluerGattLink {
    ops: mpsc::UnboundedSender<GattOp>,
    address: Address,
    tasks: TaskList,
    closed: AtomicBool,
}

impl BluerGattLink {
    fn stop_tasks(&self) {
        if let Ok(mut list) = self.tasks.lock() {
            for task in list.drain(..) {
                task.abort();
            }
        }
    }

    fn queue(&self, op: GattOp) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(anyhow!("GATT link closed"));
        }
        self.ops
            .send(op)
            .map_err(|_| anyhow!("GATT worker stopped"))
    }
}

impl GattLink for BluerGattLink {
    fn discover_services(&self) -> Result<()> {
        self.queue(GattOp::DiscoverServices)
    }

    fn enable_notifications(&self, target: CharacteristicRef) -> Result<()> {
        self.queue(GattOp::EnableNotifications(target))
    }

    fn write(&self, target: CharacteristicRef, value: Vec<u8>) -> Result<()> {
        self.queue(GattOp::Write(target, value))
    }

    /// Stops the watcher, the op worker and any notification forwarder.
    /// Dropping the forwarder's stream ends the subscription.
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_tasks();
        info!("[GATT] Link to {} closed", self.address);
    }
}

impl Drop for BluerGattLink {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}

/// Keep the radio link up and report transitions
async fn watch_radio(
    _session: bluer::Session,
    device: Device,
    events: mpsc::UnboundedSender<GattEvent>,
    reconnect_interval: Duration,
) {
    let mut changes = match device.events().await {
        Ok(stream) => Box::pin(stream),
        Err(e) => {
            let _ = events.send(GattEvent::Disconnected {
                reason: format!("event stream unavailable: {}", e),
            });
            return;
        }
    };

    let mut connected = false;
    if device.is_connected().await.unwrap_or(false) {
        connected = true;
        if events.send(GattEvent::Connected).is_err() {
            return;
        }
    }

    loop {
        let change = if connected {
            changes.next().await
        } else {
            tokio::select! {
                result = device.connect() => {
                    match result {
                        Ok(()) => Some(DeviceEvent::PropertyChanged(DeviceProperty::Connected(true))),
                        Err(e) => {
                            debug!("[GATT] Connect attempt to {} failed: {}", device.address(), e);
                            sleep(reconnect_interval).await;
                            continue;
                        }
                    }
                }
                change = changes.next() => change,
            }
        };

        let property = match change {
            Some(DeviceEvent::PropertyChanged(property)) => property,
            #[allow(unreachable_patterns)]
            Some(_) => continue,
            None => {
                let _ = events.send(GattEvent::Disconnected {
                    reason: "device removed".into(),
                });
                return;
            }
        };

        if let DeviceProperty::Connected(up) = property {
            if up == connected {
                continue;
            }
            connected = up;
            let event = if up {
                info!("[GATT] {} connected", device.address());
                GattEvent::Connected
            } else {
                warn!("[GATT] {} disconnected", device.address());
                GattEvent::Disconnected {
                    reason: "link lost".into(),
                }
            };
            if events.send(event).is_err() {
                return;
            }
        }
    }
}

/// Run queued requests in order
async fn run_ops(
    device: Device,
    mut ops: mpsc::UnboundedReceiver<GattOp>,
    events: mpsc::UnboundedSender<GattEvent>,
    tasks: TaskList,
) {
    while let Some(op) = ops.recv().await {
        let event = match op {
            GattOp::DiscoverServices => match discover(&device).await {
                Ok(services) => GattEvent::ServicesDiscovered(services),
                Err(e) => {
                    warn!("[GATT] Service discovery failed: {}", e);
                    GattEvent::ServicesDiscovered(Vec::new())
                }
            },
            GattOp::EnableNotifications(target) => {
                match subscribe(&device, target, events.clone()).await {
                    Ok(forwarder) => {
                        if let Ok(mut list) = tasks.lock() {
                            list.push(forwarder);
                        }
                        GattEvent::NotificationsEnabled(Ok(()))
                    }
                    Err(e) => GattEvent::NotificationsEnabled(Err(e.to_string())),
                }
            }
            GattOp::Write(target, value) => {
                let result = match find_characteristic(&device, target).await {
                    Ok(ch) => ch.write(&value).await.map_err(|e| e.to_string()),
                    Err(e) => Err(e.to_string()),
                };
                GattEvent::WriteCompleted(result)
            }
        };

        if events.send(event).is_err() {
            break;
        }
    }
}

async fn discover(device: &Device) -> Result<Vec<DiscoveredService>> {
    timeout(SERVICE_RESOLVE_TIMEOUT, async {
        while !device.is_services_resolved().await.unwrap_or(false) {
            sleep(SERVICE_POLL_INTERVAL).await;
        }
    })
    .await
    .map_err(|_| anyhow!("services not resolved"))?;

    let mut services = Vec::new();
    for service in device.services().await? {
        let mut characteristics = Vec::new();
        for ch in service.characteristics().await? {
            characteristics.push(ch.uuid().await?);
        }
        services.push(DiscoveredService {
            uuid: service.uuid().await?,
            characteristics,
        });
    }
    debug!("[GATT] {} services on {}", services.len(), device.address());
    Ok(services)
}

async fn find_characteristic(device: &Device, target: CharacteristicRef) -> Result<Characteristic> {
    for service in device.services().await? {
        if service.uuid().await? != target.service {
            continue;
        }
        for ch in service.characteristics().await? {
            if ch.uuid().await? == target.characteristic {
                return Ok(ch);
            }
        }
    }
    Err(anyhow!("characteristic {} not found", target))
}

/// Subscribe and forward value changes until the link closes
async fn subscribe(
    device: &Device,
    target: CharacteristicRef,
    events: mpsc::UnboundedSender<GattEvent>,
) -> Result<JoinHandle<()>> {
    let ch = find_characteristic(device, target).await?;
    let notifications = ch.notify().await?;

    Ok(tokio::spawn(async move {
        let mut notifications = Box::pin(notifications);
        while let Some(value) = notifications.next().await {
            if events.send(GattEvent::ValueChanged(value)).is_err() {
                break;
            }
        }
    }))
}
