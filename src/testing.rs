//! In-memory transport fakes for session and orchestrator tests

use crate::transport::traits::{PendingSocket, SocketStrategy};
use crate::transport::{
    DiscoveredService, GattClient, GattEvent, GattLink, StreamConnector, TransportStream,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use pillbox_shared::{uuids, CharacteristicRef, DeviceIdentity};
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::mpsc;
use tokio::time::sleep;

pub fn hc05() -> DeviceIdentity {
    DeviceIdentity::new("98:D3:31:F5:12:AB", Some("HC-05-Unit".into()))
}

pub fn bridge_services() -> Vec<DiscoveredService> {
    vec![DiscoveredService {
        uuid: uuids::BRIDGE_SERVICE,
        characteristics: vec![uuids::BRIDGE_CHARACTERISTIC],
    }]
}

pub struct FakeStream(DuplexStream);

impl AsyncRead for FakeStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl AsyncWrite for FakeStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }
}

impl TransportStream for FakeStream {
    fn peer(&self) -> String {
        "fake-peer".into()
    }
}

struct FakeSocket {
    delay: Duration,
    fail: bool,
    peers: mpsc::UnboundedSender<DuplexStream>,
    connects: Arc<AtomicUsize>,
}

#[async_trait]
impl PendingSocket for FakeSocket {
    async fn connect(self: Box<Self>) -> Result<Box<dyn TransportStream>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        sleep(self.delay).await;
        if self.fail {
            return Err(anyhow!("connection refused"));
        }
        let (local, remote) = tokio::io::duplex(4096);
        let _ = self.peers.send(remote);
        Ok(Box::new(FakeStream(local)))
    }
}

/// Stream connector handing the far end of each connection to the test
pub struct FakeConnector {
    pub connect_delay: Duration,
    pub fail_connect: bool,
    pub refused: HashSet<SocketStrategy>,
    pub attempts: Mutex<Vec<SocketStrategy>>,
    pub connects: Arc<AtomicUsize>,
    pub discovery_cancels: AtomicUsize,
    peers: mpsc::UnboundedSender<DuplexStream>,
}

impl FakeConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DuplexStream>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let connector = Self {
            connect_delay: Duration::ZERO,
            fail_connect: false,
            refused: HashSet::new(),
            attempts: Mutex::new(Vec::new()),
            connects: Arc::new(AtomicUsize::new(0)),
            discovery_cancels: AtomicUsize::new(0),
            peers,
        };
        (connector, rx)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn attempts(&self) -> Vec<SocketStrategy> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl StreamConnector for FakeConnector {
    async fn create_socket(
        &self,
        _device: &DeviceIdentity,
        strategy: SocketStrategy,
    ) -> Result<Box<dyn PendingSocket>> {
        self.attempts.lock().unwrap().push(strategy);
        if self.refused.contains(&strategy) {
            return Err(anyhow!("{} unavailable", strategy));
        }
        Ok(Box::new(FakeSocket {
            delay: self.connect_delay,
            fail: self.fail_connect,
            peers: self.peers.clone(),
            connects: self.connects.clone(),
        }))
    }

    async fn cancel_discovery(&self) {
        self.discovery_cancels.fetch_add(1, Ordering::SeqCst);
    }

    fn name(&self) -> &'static str {
        "Fake"
    }
}

/// How a fake GATT peripheral behaves after open
#[derive(Debug, Clone)]
pub enum GattScript {
    /// Connects after the delay and answers every request
    Responsive {
        connect_after: Duration,
        services: Vec<DiscoveredService>,
    },
    /// Never reports a radio connection
    Silent,
    /// Opening the link fails
    Unavailable,
}

/// Test-side view of one opened fake link
#[derive(Clone)]
pub struct FakeGattHandle {
    pub events: mpsc::UnboundedSender<GattEvent>,
    pub writes: Arc<Mutex<Vec<Vec<u8>>>>,
    pub closed: Arc<AtomicBool>,
}

impl FakeGattHandle {
    pub fn notify(&self, value: &[u8]) {
        let _ = self.events.send(GattEvent::ValueChanged(value.to_vec()));
    }

    pub fn drop_link(&self) {
        let _ = self.events.send(GattEvent::Disconnected {
            reason: "out of range".into(),
        });
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }
}

struct FakeGattLink {
    handle: FakeGattHandle,
    services: Vec<DiscoveredService>,
    fail_writes: bool,
    ack_notifications: bool,
}

impl GattLink for FakeGattLink {
    fn discover_services(&self) -> Result<()> {
        let _ = self
            .handle
            .events
            .send(GattEvent::ServicesDiscovered(self.services.clone()));
        Ok(())
    }

    fn enable_notifications(&self, _target: CharacteristicRef) -> Result<()> {
        if self.ack_notifications {
            let _ = self.handle.events.send(GattEvent::NotificationsEnabled(Ok(())));
        }
        Ok(())
    }

    fn write(&self, _target: CharacteristicRef, value: Vec<u8>) -> Result<()> {
        self.handle.writes.lock().unwrap().push(value);
        let result = if self.fail_writes {
            Err("write rejected".to_string())
        } else {
            Ok(())
        };
        let _ = self.handle.events.send(GattEvent::WriteCompleted(result));
        Ok(())
    }

    fn close(&self) {
        self.handle.closed.store(true, Ordering::SeqCst);
    }
}

pub struct FakeGatt {
    pub script: GattScript,
    pub fail_writes: bool,
    /// When false the subscription is never acknowledged
    pub ack_notifications: bool,
    pub opens: AtomicUsize,
    links: mpsc::UnboundedSender<FakeGattHandle>,
}

impl FakeGatt {
    pub fn new(script: GattScript) -> (Self, mpsc::UnboundedReceiver<FakeGattHandle>) {
        let (links, rx) = mpsc::unbounded_channel();
        let gatt = Self {
            script,
            fail_writes: false,
            ack_notifications: true,
            opens: AtomicUsize::new(0),
            links,
        };
        (gatt, rx)
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GattClient for FakeGatt {
    async fn open(
        &self,
        _device: &DeviceIdentity,
        events: mpsc::UnboundedSender<GattEvent>,
    ) -> Result<Box<dyn GattLink>> {
        self.opens.fetch_add(1, Ordering::SeqCst);

        let services = match &self.script {
            GattScript::Unavailable => return Err(anyhow!("no LE radio")),
            GattScript::Silent => Vec::new(),
            GattScript::Responsive {
                connect_after,
                services,
            } => {
                let delay = *connect_after;
                let tx = events.clone();
                tokio::spawn(async move {
                    sleep(delay).await;
                    let _ = tx.send(GattEvent::Connected);
                });
                services.clone()
            }
        };

        let handle = FakeGattHandle {
            events,
            writes: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(AtomicBool::new(false)),
        };
        let _ = self.links.send(handle.clone());

        Ok(Box::new(FakeGattLink {
            handle,
            services,
            fail_writes: self.fail_writes,
            ack_notifications: self.ack_notifications,
        }))
    }
}
