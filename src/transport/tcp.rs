//! TCP transport implementation for simulation mode

use crate::transport::traits::{
    GattClient, GattEvent, GattLink, PendingSocket, SocketStrategy, StreamConnector,
    TransportStream,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use pillbox_shared::DeviceIdentity;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

/// TCP stream wrapper implementing TransportStream
pub struct TcpTransportStream {
    inner: TcpStream,
    peer: String,
}

impl TcpTransportStream {
    pub fn new(stream: TcpStream, peer: String) -> Self {
        Self {
            inner: stream,
            peer,
        }
    }
}

impl AsyncRead for TcpTransportStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpTransportStream {
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

impl TransportStream for TcpTransportStream {
    fn peer(&self) -> String {
        self.peer.clone()
    }
}

struct PendingTcp {
    address: String,
}

#[async_trait]
impl PendingSocket for PendingTcp {
    async fn connect(self: Box<Self>) -> Result<Box<dyn TransportStream>> {
        let stream = TcpStream::connect(&self.address).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(TcpTransportStream::new(stream, self.address)))
    }
}

/// Stream connector that reaches a simulated peripheral over TCP.
/// Every socket strategy resolves to the same address.
pub struct TcpConnector {
    address: String,
}

impl TcpConnector {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl StreamConnector for TcpConnector {
    async fn create_socket(
        &self,
        device: &DeviceIdentity,
        strategy: SocketStrategy,
    ) -> Result<Box<dyn PendingSocket>> {
        debug!("[SIM] {} for {} via {}", strategy, device, self.address);
        Ok(Box::new(PendingTcp {
            address: self.address.clone(),
        }))
    }

    async fn cancel_discovery(&self) {}

    fn name(&self) -> &'static str {
        "TCP"
    }
}

/// GATT client for setups without a low-energy radio; every open fails
pub struct UnavailableGatt;

#[async_trait]
impl GattClient for UnavailableGatt {
    async fn open(
        &self,
        _device: &DeviceIdentity,
        _events: mpsc::UnboundedSender<GattEvent>,
    ) -> Result<Box<dyn GattLink>> {
        Err(anyhow!("attribute transport unavailable in simulation mode"))
    }
}
