//! Stream transport session (serial-port profile or its TCP stand-in)

use super::event::{SessionEvent, SessionId, SessionSignal};
use crate::transport::{connection_strategies, StreamConnector, TransportStream};
use anyhow::anyhow;
use bytes::Bytes;
use pillbox_shared::{codec, link, DeviceIdentity, LinkError, TransportKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Stream session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Created,
    Connecting,
    Connected,
    Closed,
}

type Writer = WriteHalf<Box<dyn TransportStream>>;
type Done = oneshot::Sender<Result<(), LinkError>>;

struct Outbound {
    bytes: Bytes,
    done: Done,
}

/// Ordered write queue of a stream session
#[derive(Clone)]
pub struct StreamWriter {
    queue: Arc<Mutex<Option<mpsc::UnboundedSender<Outbound>>>>,
}

impl StreamWriter {
    fn new() -> Self {
        Self {
            queue: Arc::new(Mutex::new(None)),
        }
    }

    /// Queue `bytes` behind earlier writes. The receiver resolves once the
    /// bytes are flushed and is dropped unanswered if the session closes first.
    pub fn queue(
        &self,
        bytes: Bytes,
    ) -> Result<oneshot::Receiver<Result<(), LinkError>>, LinkError> {
        let guard = self.queue.lock().map_err(|_| LinkError::NotConnected)?;
        let sender = guard.as_ref().ok_or(LinkError::NotConnected)?;
        let (done, rx) = oneshot::channel();
        sender
            .send(Outbound { bytes, done })
            .map_err(|_| LinkError::NotConnected)?;
        Ok(rx)
    }

    fn install(&self, sender: mpsc::UnboundedSender<Outbound>) {
        if let Ok(mut guard) = self.queue.lock() {
            *guard = Some(sender);
        }
    }

    fn release(&self) {
        if let Ok(mut guard) = self.queue.lock() {
            guard.take();
        }
    }
}

struct Shared {
    id: SessionId,
    state: watch::Sender<StreamState>,
    closed: AtomicBool,
    write_task: Mutex<Option<JoinHandle<()>>>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl Shared {
    fn emit(&self, signal: SessionSignal) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.events
            .send(SessionEvent {
                id: self.id,
                transport: TransportKind::Stream,
                signal,
            })
            .is_ok()
    }

    fn fail(&self, error: LinkError) {
        self.state.send_replace(StreamState::Closed);
        self.emit(SessionSignal::Failed(error));
        self.closed.store(true, Ordering::SeqCst);
    }

    fn set_write_task(&self, task: JoinHandle<()>) {
        if let Ok(mut slot) = self.write_task.lock() {
            *slot = Some(task);
        }
        // close() may have run while the task was being spawned
        if self.closed.load(Ordering::SeqCst) {
            self.stop_writes();
        }
    }

    /// Abort the writer, dropping any write still in flight
    fn stop_writes(&self) {
        if let Ok(mut slot) = self.write_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}

/// Connection parameters for one stream session
#[derive(Clone)]
pub struct StreamTarget {
    pub device: DeviceIdentity,
    /// Try the fixed legacy channel first
    pub legacy: bool,
    /// Pause between cancelling discovery and connecting
    pub settle_delay: Duration,
}

/// One stream transport connection attempt
pub struct StreamSession {
    shared: Arc<Shared>,
    writer: StreamWriter,
    task: Option<JoinHandle<()>>,
}

impl StreamSession {
    /// Spawn the session task; progress is reported on `events`
    pub fn start(
        id: SessionId,
        target: StreamTarget,
        connector: Arc<dyn StreamConnector>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let (state, _) = watch::channel(StreamState::Created);
        let shared = Arc::new(Shared {
            id,
            state,
            closed: AtomicBool::new(false),
            write_task: Mutex::new(None),
            events,
        });
        let writer = StreamWriter::new();

        let task = tokio::spawn(run(shared.clone(), target, connector, writer.clone()));

        Self {
            shared,
            writer,
            task: Some(task),
        }
    }

    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    pub fn state(&self) -> StreamState {
        *self.shared.state.borrow()
    }

    pub fn writer(&self) -> StreamWriter {
        self.writer.clone()
    }

    /// Close the socket and stop both loops; idempotent. Never waits on
    /// a pending write.
    pub fn close(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.shared.stop_writes();
        self.writer.release();
        self.shared.state.send_replace(StreamState::Closed);
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run(
    shared: Arc<Shared>,
    target: StreamTarget,
    connector: Arc<dyn StreamConnector>,
    writer: StreamWriter,
) {
    shared.state.send_replace(StreamState::Connecting);

    let stream = match connect(&target, connector.as_ref()).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("[LINK] Stream connect to {} failed: {}", target.device, e);
            shared.fail(LinkError::ConnectFailed(e.to_string()));
            return;
        }
    };
    info!(
        "[LINK] {} stream connected to {}",
        connector.name(),
        stream.peer()
    );

    let (mut reader, write_half) = tokio::io::split(stream);
    let (queue_tx, queue_rx) = mpsc::unbounded_channel();
    shared.set_write_task(tokio::spawn(write_loop(shared.clone(), write_half, queue_rx)));
    writer.install(queue_tx);
    shared.state.send_replace(StreamState::Connected);
    if !shared.emit(SessionSignal::Ready) {
        return;
    }

    let mut buf = vec![0u8; link::READ_BUFFER_SIZE];
    let error = loop {
        match reader.read(&mut buf).await {
            Ok(0) => break LinkError::ReadFailure("connection closed by peer".into()),
            Ok(n) => {
                if !shared.emit(SessionSignal::Inbound(codec::decode(&buf[..n]))) {
                    return;
                }
            }
            Err(e) => break LinkError::ReadFailure(e.to_string()),
        }
    };

    warn!("[LINK] Stream session {}: {}", shared.id, error);
    writer.release();
    shared.stop_writes();
    shared.fail(error);
}

/// Write queued buffers in order, one delivery signal per buffer
async fn write_loop(
    shared: Arc<Shared>,
    mut half: Writer,
    mut queue: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(Outbound { bytes, done }) = queue.recv().await {
        let result = write_flushed(&mut half, &bytes).await;
        shared.emit(SessionSignal::Delivery(result.clone()));
        let _ = done.send(result);
    }
    if let Err(e) = half.shutdown().await {
        debug!("[LINK] Stream session {} shutdown: {}", shared.id, e);
    }
}

async fn write_flushed(half: &mut Writer, bytes: &[u8]) -> Result<(), LinkError> {
    half.write_all(bytes)
        .await
        .map_err(|e| LinkError::WriteFailure(e.to_string()))?;
    half.flush()
        .await
        .map_err(|e| LinkError::WriteFailure(e.to_string()))
}

/// Try each socket strategy in order until one connects
async fn connect(
    target: &StreamTarget,
    connector: &dyn StreamConnector,
) -> anyhow::Result<Box<dyn TransportStream>> {
    let mut last_error = anyhow!("no socket strategy available");
    let mut settled = false;

    for strategy in connection_strategies(target.legacy) {
        let socket = match connector.create_socket(&target.device, strategy).await {
            Ok(socket) => socket,
            Err(e) => {
                debug!("[LINK] {} unavailable: {}", strategy, e);
                last_error = e;
                continue;
            }
        };

        // Discovery and connect share the radio
        if !settled {
            connector.cancel_discovery().await;
            sleep(target.settle_delay).await;
            settled = true;
        }

        match socket.connect().await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                warn!("[LINK] {} failed for {}: {}", strategy, target.device, e);
                last_error = e;
            }
        }
    }

    Err(last_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{hc05, FakeConnector};
    use crate::transport::traits::SocketStrategy;
    use pillbox_shared::DecodedMessage;
    use tokio::time::Instant;

    fn target(legacy: bool) -> StreamTarget {
        StreamTarget {
            device: hc05(),
            legacy,
            settle_delay: Duration::from_millis(1000),
        }
    }

    async fn next_signal(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionSignal {
        let event = rx.recv().await.expect("session event");
        assert_eq!(event.transport, TransportKind::Stream);
        event.signal
    }

    #[tokio::test(start_paused = true)]
    async fn test_connects_after_settling_and_reads() {
        let (connector, mut peers) = FakeConnector::new();
        let connector = Arc::new(connector);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let started = Instant::now();
        let session = StreamSession::start(SessionId::new(1), target(true), connector.clone(), tx);

        assert_eq!(next_signal(&mut rx).await, SessionSignal::Ready);
        assert!(started.elapsed() >= Duration::from_millis(1000));
        assert_eq!(session.state(), StreamState::Connected);
        assert_eq!(connector.discovery_cancels.load(Ordering::SeqCst), 1);
        assert_eq!(connector.attempts(), vec![SocketStrategy::LegacyChannel(1)]);

        let mut peer = peers.recv().await.unwrap();
        peer.write_all(b"Reminder: take medicine\n").await.unwrap();
        assert_eq!(
            next_signal(&mut rx).await,
            SessionSignal::Inbound(DecodedMessage::Text("Reminder: take medicine\n".into()))
        );

        let done = session
            .writer()
            .queue(Bytes::from_static(b"M:08:00\n"))
            .unwrap();
        let mut buf = [0u8; 8];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"M:08:00\n");
        assert_eq!(done.await.unwrap(), Ok(()));
        assert_eq!(next_signal(&mut rx).await, SessionSignal::Delivery(Ok(())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_through_socket_strategies() {
        let (mut connector, _peers) = FakeConnector::new();
        connector.refused.insert(SocketStrategy::LegacyChannel(1));
        connector.refused.insert(SocketStrategy::SecureServiceRecord);
        let connector = Arc::new(connector);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _session = StreamSession::start(SessionId::new(1), target(true), connector.clone(), tx);

        assert_eq!(next_signal(&mut rx).await, SessionSignal::Ready);
        assert_eq!(
            connector.attempts(),
            vec![
                SocketStrategy::LegacyChannel(1),
                SocketStrategy::SecureServiceRecord,
                SocketStrategy::InsecureServiceRecord,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_strategies_failing_is_connect_failed() {
        let (mut connector, _peers) = FakeConnector::new();
        connector.fail_connect = true;
        let connector = Arc::new(connector);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let session = StreamSession::start(SessionId::new(7), target(false), connector.clone(), tx);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.id, SessionId::new(7));
        assert!(matches!(
            event.signal,
            SessionSignal::Failed(LinkError::ConnectFailed(_))
        ));
        assert_eq!(connector.connects(), 2);
        assert_eq!(session.state(), StreamState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_close_is_read_failure() {
        let (connector, mut peers) = FakeConnector::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let session = StreamSession::start(SessionId::new(1), target(false), Arc::new(connector), tx);
        assert_eq!(next_signal(&mut rx).await, SessionSignal::Ready);

        drop(peers.recv().await.unwrap());
        assert_eq!(
            next_signal(&mut rx).await,
            SessionSignal::Failed(LinkError::ReadFailure("connection closed by peer".into()))
        );
        assert_eq!(session.state(), StreamState::Closed);
        assert!(matches!(
            session.writer().queue(Bytes::from_static(b"x")),
            Err(LinkError::NotConnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_suppresses_events() {
        let (connector, mut peers) = FakeConnector::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut session =
            StreamSession::start(SessionId::new(1), target(false), Arc::new(connector), tx);
        assert_eq!(next_signal(&mut rx).await, SessionSignal::Ready);
        let mut peer = peers.recv().await.unwrap();

        session.close();
        session.close();
        assert_eq!(session.state(), StreamState::Closed);

        let _ = peer.write_all(b"late\n").await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_keep_queue_order() {
        let (connector, mut peers) = FakeConnector::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let session = StreamSession::start(SessionId::new(1), target(false), Arc::new(connector), tx);
        assert_eq!(next_signal(&mut rx).await, SessionSignal::Ready);
        let mut peer = peers.recv().await.unwrap();

        let writer = session.writer();
        let pending: Vec<_> = ["M:08:00\n", "A:13:00\n", "N:21:00\n"]
            .into_iter()
            .map(|line| writer.queue(Bytes::from_static(line.as_bytes())).unwrap())
            .collect();

        let mut buf = vec![0u8; 24];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, b"M:08:00\nA:13:00\nN:21:00\n".to_vec());
        for done in pending {
            assert_eq!(done.await.unwrap(), Ok(()));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_does_not_wait_for_stalled_write() {
        let (connector, mut peers) = FakeConnector::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut session =
            StreamSession::start(SessionId::new(1), target(false), Arc::new(connector), tx);
        assert_eq!(next_signal(&mut rx).await, SessionSignal::Ready);
        // Held open but never read, so the write below cannot finish
        let _peer = peers.recv().await.unwrap();

        let done = session
            .writer()
            .queue(Bytes::from("x".repeat(10_000)))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        session.close();
        assert_eq!(session.state(), StreamState::Closed);
        let abandoned = tokio::time::timeout(Duration::from_secs(1), done)
            .await
            .expect("pending write dropped on close");
        assert!(abandoned.is_err());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_write_before_connect_is_not_connected() {
        let writer = StreamWriter::new();
        assert!(matches!(
            writer.queue(Bytes::from_static(b"A:12:00\n")),
            Err(LinkError::NotConnected)
        ));
    }
}
