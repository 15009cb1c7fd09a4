//! RFCOMM transport implementation for the serial-port stream transport

use crate::transport::bt_discovery::BtDiscovery;
use crate::transport::traits::{PendingSocket, SocketStrategy, StreamConnector, TransportStream};
use anyhow::{anyhow, Context as _, Result};
use async_trait::async_trait;
use bluer::rfcomm::{
    Profile, ProfileHandle, ReqError, Role, Security, SecurityLevel, Socket,
    SocketAddr as RfcommAddr, Stream as RfcommStream,
};
use bluer::{Address, Device};
use futures::StreamExt;
use pillbox_shared::{uuids, DeviceIdentity, Uuid};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// How long to wait for BlueZ to hand over a profile connection
pub const PROFILE_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// RFCOMM stream wrapper implementing TransportStream
pub struct RfcommTransportStream {
    inner: RfcommStream,
    peer_addr: Address,
}

impl RfcommTransportStream {
    /// Create a new RFCOMM transport stream
    pub fn new(stream: RfcommStream, peer_addr: Address) -> Self {
        Self {
            inner: stream,
            peer_addr,
        }
    }
}

impl AsyncRead for RfcommTransportStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for RfcommTransportStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl TransportStream for RfcommTransportStream {
    fn peer(&self) -> String {
        self.peer_addr.to_string()
    }
}

/// Socket on a fixed channel, bypassing the service record
struct ChannelSocket {
    socket: Socket,
    addr: RfcommAddr,
}

#[async_trait]
impl PendingSocket for ChannelSocket {
    async fn connect(self: Box<Self>) -> Result<Box<dyn TransportStream>> {
        let stream = self
            .socket
            .connect(self.addr)
            .await
            .map_err(|e| anyhow!("RFCOMM connect failed: {}", e))?;
        Ok(Box::new(RfcommTransportStream::new(stream, self.addr.addr)))
    }
}

/// Client profile registered for the serial-port service record
struct ProfileSocket {
    _session: bluer::Session,
    handle: ProfileHandle,
    device: Device,
    uuid: Uuid,
}

#[async_trait]
impl PendingSocket for ProfileSocket {
    async fn connect(self: Box<Self>) -> Result<Box<dyn TransportStream>> {
        let ProfileSocket {
            _session,
            mut handle,
            device,
            uuid,
        } = *self;
        let address = device.address();

        // BlueZ only completes ConnectProfile once our side took the request
        let connector = device.clone();
        let connect_task = tokio::spawn(async move { connector.connect_profile(&uuid).await });

        let request = timeout(PROFILE_CONNECT_TIMEOUT, async {
            while let Some(req) = handle.next().await {
                if req.device() == address {
                    return Some(req);
                }
                debug!("[RFCOMM] Rejecting profile connection from {}", req.device());
                req.reject(ReqError::Rejected);
            }
            None
        })
        .await;

        let request = match request {
            Ok(Some(req)) => req,
            Ok(None) => {
                connect_task.abort();
                return Err(anyhow!("Profile handle closed before {} connected", address));
            }
            Err(_) => {
                connect_task.abort();
                return Err(anyhow!("Timed out waiting for {} profile connection", address));
            }
        };

        let stream = request
            .accept()
            .map_err(|e| anyhow!("RFCOMM accept failed: {}", e))?;

        match connect_task.await {
            Ok(Err(e)) => warn!("[RFCOMM] ConnectProfile reported: {}", e),
            Err(e) => warn!("[RFCOMM] ConnectProfile task failed: {}", e),
            Ok(Ok(())) => {}
        }

        Ok(Box::new(RfcommTransportStream::new(stream, address)))
    }
}

/// RFCOMM connector for the peripheral's serial port
pub struct RfcommConnector {
    discovery: Arc<BtDiscovery>,
    service: Uuid,
}

impl RfcommConnector {
    /// Create a new RFCOMM connector for the serial-port service
    pub fn new(discovery: Arc<BtDiscovery>) -> Self {
        Self {
            discovery,
            service: uuids::SPP_SERVICE,
        }
    }

    fn parse_address(device: &DeviceIdentity) -> Result<Address> {
        device
            .address()
            .parse::<Address>()
            .with_context(|| format!("Invalid Bluetooth address '{}'", device.address()))
    }

    async fn register_profile(&self, address: Address, secure: bool) -> Result<ProfileSocket> {
        let session = bluer::Session::new().await?;
        let adapter = session.default_adapter().await?;
        let device = adapter.device(address)?;

        let profile = Profile {
            uuid: self.service,
            role: Some(Role::Client),
            require_authentication: Some(secure),
            require_authorization: Some(secure),
            auto_connect: Some(false),
            ..Default::default()
        };
        let handle = session.register_profile(profile).await?;

        Ok(ProfileSocket {
            _session: session,
            handle,
            device,
            uuid: self.service,
        })
    }
}

#[async_trait]
impl StreamConnector for RfcommConnector {
    async fn create_socket(
        &self,
        device: &DeviceIdentity,
        strategy: SocketStrategy,
    ) -> Result<Box<dyn PendingSocket>> {
        let address = Self::parse_address(device)?;

        match strategy {
            SocketStrategy::LegacyChannel(channel) => {
                let socket = Socket::new()?;
                socket.set_security(Security {
                    level: SecurityLevel::Low,
                    key_size: 0,
                })?;
                info!("[RFCOMM] Using {} for {}", strategy, device);
                Ok(Box::new(ChannelSocket {
                    socket,
                    addr: RfcommAddr::new(address, channel),
                }))
            }
            SocketStrategy::SecureServiceRecord => {
                let socket = self.register_profile(address, true).await?;
                info!("[RFCOMM] Using {} for {}", strategy, device);
                Ok(Box::new(socket))
            }
            SocketStrategy::InsecureServiceRecord => {
                let socket = self.register_profile(address, false).await?;
                info!("[RFCOMM] Using {} for {}", strategy, device);
                Ok(Box::new(socket))
            }
        }
    }

    async fn cancel_discovery(&self) {
        self.discovery.cancel().await;
    }

    fn name(&self) -> &'static str {
        "Bluetooth"
    }
}
