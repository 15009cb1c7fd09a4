//! Attribute transport session (GATT bridge characteristic)

use super::event::{SessionEvent, SessionId, SessionSignal};
use crate::transport::{DiscoveredService, GattClient, GattEvent, GattLink};
use pillbox_shared::{codec, CharacteristicRef, DeviceIdentity, LinkError, TransportKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Attribute session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeState {
    Created,
    Connecting,
    ServicesDiscovering,
    Ready,
    Closed,
}

struct Shared {
    id: SessionId,
    target: CharacteristicRef,
    state: watch::Sender<AttributeState>,
    link: Mutex<Option<Box<dyn GattLink>>>,
    closed: AtomicBool,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl Shared {
    fn state(&self) -> AttributeState {
        *self.state.borrow()
    }

    fn set(&self, state: AttributeState) {
        self.state.send_replace(state);
    }

    fn emit(&self, signal: SessionSignal) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.events.send(SessionEvent {
            id: self.id,
            transport: TransportKind::Attribute,
            signal,
        });
    }

    fn with_link<R>(&self, f: impl FnOnce(&dyn GattLink) -> R) -> Option<R> {
        let guard = self.link.lock().ok()?;
        guard.as_deref().map(f)
    }

    fn release(&self) {
        let link = self.link.lock().ok().and_then(|mut guard| guard.take());
        if let Some(link) = link {
            link.close();
        }
    }

    fn fail(&self, error: LinkError) {
        self.set(AttributeState::Closed);
        self.release();
        self.emit(SessionSignal::Failed(error));
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// One attribute transport connection attempt
pub struct AttributeSession {
    shared: Arc<Shared>,
    task: Option<JoinHandle<()>>,
}

impl AttributeSession {
    /// Open the link and drive it from host events
    pub fn start(
        id: SessionId,
        device: DeviceIdentity,
        target: CharacteristicRef,
        client: Arc<dyn GattClient>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let (state, _) = watch::channel(AttributeState::Created);
        let shared = Arc::new(Shared {
            id,
            target,
            state,
            link: Mutex::new(None),
            closed: AtomicBool::new(false),
            events,
        });

        let task = tokio::spawn(run(shared.clone(), device, client));

        Self {
            shared,
            task: Some(task),
        }
    }

    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    pub fn state(&self) -> AttributeState {
        self.shared.state()
    }

    /// Queue a write to the bridge characteristic. Returns once queued;
    /// the outcome arrives later as a delivery signal.
    pub fn write(&self, bytes: &[u8]) -> Result<(), LinkError> {
        if self.state() != AttributeState::Ready {
            return Err(LinkError::NotConnected);
        }
        self.shared
            .with_link(|link| link.write(self.shared.target, bytes.to_vec()))
            .ok_or(LinkError::NotConnected)?
            .map_err(|e| LinkError::WriteFailure(e.to_string()))
    }

    /// Release the link; idempotent
    pub fn close(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.shared.release();
        self.shared.set(AttributeState::Closed);
    }
}

impl Drop for AttributeSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn exposes(services: &[DiscoveredService], target: CharacteristicRef) -> bool {
    services
        .iter()
        .any(|s| s.uuid == target.service && s.characteristics.contains(&target.characteristic))
}

async fn run(shared: Arc<Shared>, device: DeviceIdentity, client: Arc<dyn GattClient>) {
    let (gatt_tx, mut gatt_rx) = mpsc::unbounded_channel();
    shared.set(AttributeState::Connecting);

    match client.open(&device, gatt_tx).await {
        Ok(link) => {
            if let Ok(mut guard) = shared.link.lock() {
                *guard = Some(link);
            }
        }
        Err(e) => {
            warn!("[GATT] Open {} failed: {}", device, e);
            shared.fail(LinkError::ConnectFailed(e.to_string()));
            return;
        }
    }

    while let Some(event) = gatt_rx.recv().await {
        match event {
            GattEvent::Connected => {
                if shared.state() != AttributeState::Connecting {
                    continue;
                }
                info!("[GATT] Connected to {}, discovering services", device);
                shared.set(AttributeState::ServicesDiscovering);
                if let Some(Err(e)) = shared.with_link(|link| link.discover_services()) {
                    shared.fail(LinkError::ConnectFailed(e.to_string()));
                    return;
                }
            }
            GattEvent::ServicesDiscovered(services) => {
                if shared.state() != AttributeState::ServicesDiscovering {
                    continue;
                }
                if !exposes(&services, shared.target) {
                    warn!("[GATT] {} does not expose {}", device, shared.target);
                    shared.fail(LinkError::ServiceNotFound);
                    return;
                }
                shared.emit(SessionSignal::ServicesResolved);
                if let Some(Err(e)) =
                    shared.with_link(|link| link.enable_notifications(shared.target))
                {
                    shared.fail(LinkError::ConnectFailed(e.to_string()));
                    return;
                }
            }
            GattEvent::NotificationsEnabled(Ok(())) => {
                if shared.state() == AttributeState::ServicesDiscovering {
                    info!("[GATT] Notifications enabled on {}", shared.target);
                    shared.set(AttributeState::Ready);
                    shared.emit(SessionSignal::Ready);
                }
            }
            GattEvent::NotificationsEnabled(Err(e)) => {
                shared.fail(LinkError::ConnectFailed(format!(
                    "notification subscribe failed: {}",
                    e
                )));
                return;
            }
            GattEvent::ValueChanged(value) => {
                if shared.state() == AttributeState::Ready {
                    shared.emit(SessionSignal::Inbound(codec::decode(&value)));
                } else {
                    debug!("[GATT] Dropping {} bytes before ready", value.len());
                }
            }
            GattEvent::WriteCompleted(result) => {
                shared.emit(SessionSignal::Delivery(
                    result.map_err(LinkError::WriteFailure),
                ));
            }
            GattEvent::Disconnected { reason } => {
                warn!("[GATT] {} disconnected: {}", device, reason);
                shared.fail(LinkError::Disconnected(reason));
                return;
            }
        }
    }

    shared.fail(LinkError::Disconnected("host event stream ended".into()));
}
