//! Connection orchestrator task
//!
//! Owns the active sessions and the link state machine. Commands, session
//! events and timers are merged in one loop, so every application event
//! is emitted from a single place and in order.

use super::manager::{AppEvent, Command, ConnectionConfig, Transports};
use bytes::Bytes;
use crate::session::{
    AttributeSession, SessionEvent, SessionId, SessionSignal, StreamSession, StreamTarget,
};
use pillbox_shared::protocol::{self, InboundKind};
use pillbox_shared::state_machine::{LinkAction, LinkEvent, LinkStateMachine};
use pillbox_shared::{codec, Advisory, DecodedMessage, DeviceIdentity, LinkError, TransportKind};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

pub(super) struct Orchestrator {
    config: ConnectionConfig,
    transports: Transports,
    fsm: LinkStateMachine,
    device: Option<DeviceIdentity>,
    attribute: Option<AttributeSession>,
    stream: Option<StreamSession>,
    next_id: SessionId,
    fallback_at: Option<Instant>,
    retry_at: Option<Instant>,
    stable_at: Option<Instant>,
    session_tx: mpsc::UnboundedSender<SessionEvent>,
    session_rx: mpsc::UnboundedReceiver<SessionEvent>,
    app: mpsc::UnboundedSender<AppEvent>,
}

impl Orchestrator {
    pub(super) fn new(
        config: ConnectionConfig,
        transports: Transports,
        app: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        Self {
            fsm: LinkStateMachine::new(config.retry),
            config,
            transports,
            device: None,
            attribute: None,
            stream: None,
            next_id: SessionId::new(1),
            fallback_at: None,
            retry_at: None,
            stable_at: None,
            session_tx,
            session_rx,
            app,
        }
    }

    /// Main loop; ends when every handle is dropped
    pub(super) async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = self.session_rx.recv() => self.handle_session_event(event),
                _ = wait_until(self.fallback_at) => {
                    self.fallback_at = None;
                    self.apply(LinkEvent::FallbackElapsed);
                }
                _ = wait_until(self.retry_at) => {
                    self.retry_at = None;
                    self.apply(LinkEvent::RetryElapsed);
                }
                _ = wait_until(self.stable_at) => {
                    self.stable_at = None;
                    self.apply(LinkEvent::StableElapsed);
                }
            }
        }

        self.close_session(TransportKind::Attribute);
        self.close_session(TransportKind::Stream);
        info!("[LINK] Orchestrator stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { device, reply } => {
                let result = self.connect(device).await;
                let _ = reply.send(result);
            }
            Command::Disconnect { reply } => {
                info!("[LINK] Disconnect requested");
                self.apply(LinkEvent::DisconnectRequested);
                self.device = None;
                let _ = reply.send(());
            }
            Command::Send { text, reply } => self.send(text, reply),
        }
    }

    async fn connect(&mut self, device: DeviceIdentity) -> Result<(), LinkError> {
        if let Err(e) = self.transports.permissions.check().await {
            warn!("[LINK] Refusing to connect: {}", e);
            let reason = e.to_string();
            self.emit(AppEvent::Advisory(Advisory::PermissionDenied(reason.clone())));
            return Err(LinkError::PermissionDenied(reason));
        }

        info!(
            "[LINK] Connecting to {} (legacy: {})",
            device,
            self.is_legacy(&device)
        );
        self.device = Some(device);
        self.apply(LinkEvent::ConnectRequested);
        Ok(())
    }

    fn send(&mut self, text: String, reply: oneshot::Sender<Result<TransportKind, LinkError>>) {
        let bytes: Bytes = codec::encode(&text);

        match self.fsm.bound() {
            Some(TransportKind::Attribute) => {
                let result = match &self.attribute {
                    Some(session) => session.write(&bytes),
                    None => Err(LinkError::NotConnected),
                };
                if let Err(error) = &result {
                    self.emit(AppEvent::Advisory(Advisory::SendFailed {
                        transport: TransportKind::Attribute,
                        error: error.clone(),
                    }));
                }
                let _ = reply.send(result.map(|_| TransportKind::Attribute));
            }
            Some(TransportKind::Stream) => {
                let queued = match &self.stream {
                    Some(session) => session.writer().queue(bytes),
                    None => Err(LinkError::NotConnected),
                };
                match queued {
                    // The session reports delivery; the caller waits off the loop
                    Ok(done) => {
                        tokio::spawn(async move {
                            let result = done.await.unwrap_or_else(|_| {
                                Err(LinkError::WriteFailure("stream session closed".into()))
                            });
                            let _ = reply.send(result.map(|_| TransportKind::Stream));
                        });
                    }
                    Err(error) => {
                        self.emit(AppEvent::Advisory(Advisory::SendFailed {
                            transport: TransportKind::Stream,
                            error: error.clone(),
                        }));
                        let _ = reply.send(Err(error));
                    }
                }
            }
            None => {
                debug!("[LINK] Send with no bound session");
                let _ = reply.send(Err(LinkError::NotConnected));
            }
        }
    }

    fn handle_session_event(&mut self, event: SessionEvent) {
        if !self.is_current(event.id, event.transport) {
            debug!(
                "[LINK] Ignoring {:?} from stale {} session {}",
                event.signal, event.transport, event.id
            );
            return;
        }

        match event.signal {
            SessionSignal::ServicesResolved => {
                debug!("[LINK] Attribute session {} subscribing", event.id);
            }
            SessionSignal::Ready => {
                info!("[LINK] {} session {} ready", event.transport, event.id);
                self.apply(LinkEvent::SessionReady(event.transport));
            }
            SessionSignal::Inbound(message) => {
                if self.fsm.bound() == Some(event.transport) {
                    self.deliver(message);
                } else {
                    debug!("[LINK] Dropping inbound from unbound {}", event.transport);
                }
            }
            SessionSignal::Delivery(result) => {
                let advisory = match result {
                    Ok(()) => Advisory::DataSent {
                        transport: event.transport,
                    },
                    Err(error) => Advisory::SendFailed {
                        transport: event.transport,
                        error,
                    },
                };
                self.emit(AppEvent::Advisory(advisory));
            }
            SessionSignal::Failed(error) => {
                warn!("[LINK] {} session {} failed: {}", event.transport, event.id, error);
                self.close_session(event.transport);
                self.apply(LinkEvent::SessionFailed {
                    transport: event.transport,
                    error,
                });
            }
        }
    }

    fn deliver(&self, message: DecodedMessage) {
        let kind = message.as_text().map(protocol::classify);
        self.emit(AppEvent::Message(message));

        match kind {
            Some(InboundKind::Reminder(payload)) => {
                self.emit(AppEvent::ShowReminder { payload });
            }
            Some(InboundKind::Acknowledged(period)) => {
                self.emit(AppEvent::Advisory(Advisory::ScheduleAcknowledged(period)));
            }
            Some(InboundKind::Plain) | None => {}
        }
    }

    fn apply(&mut self, event: LinkEvent) {
        let actions = self.fsm.process_event(event);
        for action in actions {
            self.execute(action);
        }
    }

    fn execute(&mut self, action: LinkAction) {
        match action {
            LinkAction::StartSession(kind) => self.start_session(kind),
            LinkAction::AbortSession(kind) => {
                debug!("[LINK] Aborting {} session", kind);
                self.close_session(kind);
            }
            LinkAction::ArmFallback => {
                self.fallback_at = Some(Instant::now() + self.config.fallback_delay);
            }
            LinkAction::ArmRetry(delay) => {
                self.retry_at = Some(Instant::now() + delay);
            }
            LinkAction::ArmStability => {
                self.stable_at = Some(Instant::now() + self.config.stable_after);
            }
            LinkAction::CancelTimers => {
                self.fallback_at = None;
                self.retry_at = None;
                self.stable_at = None;
            }
            LinkAction::EmitState(state) => {
                info!("[LINK] State: {}", state);
                self.emit(AppEvent::State(state));
            }
            LinkAction::Advise(advisory) => {
                info!("[LINK] {}", advisory);
                self.emit(AppEvent::Advisory(advisory));
            }
        }
    }

    fn start_session(&mut self, kind: TransportKind) {
        // At most one session per transport
        self.close_session(kind);

        let Some(device) = self.device.clone() else {
            warn!("[LINK] No device to start a {} session for", kind);
            return;
        };
        let id = self.next_id;
        self.next_id = id.next();

        match kind {
            TransportKind::Attribute => {
                info!("[LINK] Starting attribute session {}", id);
                self.attribute = Some(AttributeSession::start(
                    id,
                    device,
                    self.config.target,
                    self.transports.gatt.clone(),
                    self.session_tx.clone(),
                ));
            }
            TransportKind::Stream => {
                info!("[LINK] Starting stream session {}", id);
                let target = StreamTarget {
                    legacy: self.is_legacy(&device),
                    device,
                    settle_delay: self.config.settle_delay,
                };
                self.stream = Some(StreamSession::start(
                    id,
                    target,
                    self.transports.stream.clone(),
                    self.session_tx.clone(),
                ));
            }
        }
    }

    fn close_session(&mut self, kind: TransportKind) {
        match kind {
            TransportKind::Attribute => {
                if let Some(mut session) = self.attribute.take() {
                    session.close();
                }
            }
            TransportKind::Stream => {
                if let Some(mut session) = self.stream.take() {
                    debug!("[LINK] Closing stream session {} ({:?})", session.id(), session.state());
                    session.close();
                }
            }
        }
    }

    fn is_current(&self, id: SessionId, kind: TransportKind) -> bool {
        match kind {
            TransportKind::Attribute => self.attribute.as_ref().map(|s| s.id()) == Some(id),
            TransportKind::Stream => self.stream.as_ref().map(|s| s.id()) == Some(id),
        }
    }

    fn is_legacy(&self, device: &DeviceIdentity) -> bool {
        device.name_matches(&self.config.legacy_name_pattern)
    }

    fn emit(&self, event: AppEvent) {
        let _ = self.app.send(event);
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::super::manager::{ConnectionManager, Transports};
    use super::*;
    use crate::permissions::{AlwaysGranted, PermissionGate};
    use crate::testing::{bridge_services, hc05, FakeConnector, FakeGatt, GattScript};
    use crate::transport::traits::SocketStrategy;
    use async_trait::async_trait;
    use pillbox_shared::{ConnectionState, DoseSchedule, Period};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::time::timeout;

    fn manager(gatt: FakeGatt, connector: Arc<FakeConnector>) -> ConnectionManager {
        ConnectionManager::new(
            ConnectionConfig::default(),
            Transports {
                gatt: Arc::new(gatt),
                stream: connector,
                permissions: Arc::new(AlwaysGranted),
            },
        )
    }

    fn responsive(after: u64) -> GattScript {
        GattScript::Responsive {
            connect_after: Duration::from_secs(after),
            services: bridge_services(),
        }
    }

    /// Collect events until nothing arrives for a minute of (paused) time
    async fn drain(manager: &mut ConnectionManager) -> Vec<AppEvent> {
        let mut events = Vec::new();
        while let Ok(Some(event)) = timeout(Duration::from_secs(60), manager.recv()).await {
            events.push(event);
        }
        events
    }

    fn states(events: &[AppEvent]) -> Vec<ConnectionState> {
        events
            .iter()
            .filter_map(|e| match e {
                AppEvent::State(s) => Some(*s),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_attribute_wins_before_fallback() {
        let (gatt, _links) = FakeGatt::new(responsive(2));
        let (connector, _peers) = FakeConnector::new();
        let connector = Arc::new(connector);
        let mut manager = manager(gatt, connector.clone());

        manager.request_connection(hc05()).await.unwrap();
        let events = drain(&mut manager).await;

        assert_eq!(
            states(&events),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
        assert!(!events.contains(&AppEvent::Advisory(Advisory::FallbackStarted)));
        assert!(connector.attempts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_attribute_aborts_stream() {
        let (gatt, mut links) = FakeGatt::new(responsive(6));
        let (mut connector, _peers) = FakeConnector::new();
        connector.connect_delay = Duration::from_secs(30);
        let connector = Arc::new(connector);
        let mut manager = manager(gatt, connector.clone());

        let started = Instant::now();
        manager.request_connection(hc05()).await.unwrap();

        assert_eq!(
            manager.recv().await,
            Some(AppEvent::State(ConnectionState::Connecting))
        );
        assert_eq!(
            manager.recv().await,
            Some(AppEvent::Advisory(Advisory::FallbackStarted))
        );
        assert_eq!(started.elapsed(), Duration::from_secs(5));
        assert_eq!(
            manager.recv().await,
            Some(AppEvent::State(ConnectionState::Connected))
        );
        assert_eq!(started.elapsed(), Duration::from_secs(6));

        let events = drain(&mut manager).await;
        assert!(states(&events).is_empty());
        assert!(!connector.attempts().is_empty());

        // Bound to the attribute transport
        let link = links.recv().await.unwrap();
        assert_eq!(manager.send("M:08:00\n").await, Ok(TransportKind::Attribute));
        assert_eq!(link.writes(), vec![b"M:08:00\n".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_service_falls_back_immediately() {
        let (gatt, _links) = FakeGatt::new(GattScript::Responsive {
            connect_after: Duration::from_millis(500),
            services: Vec::new(),
        });
        let (connector, _peers) = FakeConnector::new();
        let connector = Arc::new(connector);
        let mut manager = manager(gatt, connector.clone());

        let started = Instant::now();
        manager.request_connection(hc05()).await.unwrap();

        assert_eq!(
            manager.recv().await,
            Some(AppEvent::State(ConnectionState::Connecting))
        );
        assert_eq!(
            manager.recv().await,
            Some(AppEvent::Advisory(Advisory::ServiceNotFound))
        );
        assert_eq!(
            manager.recv().await,
            Some(AppEvent::State(ConnectionState::Connected))
        );
        // Half a second to connect plus the settling delay, well before the fallback timer
        assert_eq!(started.elapsed(), Duration::from_millis(1500));
        assert_eq!(manager.send("A:13:00\n").await, Ok(TransportKind::Stream));
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_read_failures_are_terminal() {
        let (gatt, _links) = FakeGatt::new(GattScript::Unavailable);
        let (connector, mut peers) = FakeConnector::new();
        let connector = Arc::new(connector);
        let mut manager = manager(gatt, connector.clone());

        manager.request_connection(hc05()).await.unwrap();
        for _ in 0..3 {
            drop(peers.recv().await.unwrap());
        }
        let events = drain(&mut manager).await;

        let retries: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                AppEvent::Advisory(Advisory::Retrying { attempt, delay, .. }) => {
                    assert_eq!(*delay, Duration::from_millis(1000 * *attempt as u64));
                    Some(*attempt)
                }
                _ => None,
            })
            .collect();
        assert_eq!(retries, vec![1, 2]);

        let terminal: Vec<&AppEvent> = events
            .iter()
            .filter(|e| matches!(e, AppEvent::Advisory(Advisory::MaxRetriesReached { .. })))
            .collect();
        assert_eq!(terminal.len(), 1);
        assert!(matches!(
            terminal[0],
            AppEvent::Advisory(Advisory::MaxRetriesReached {
                attempts: 3,
                error: LinkError::ReadFailure(_)
            })
        ));

        assert_eq!(states(&events).last(), Some(&ConnectionState::Disconnected));
        assert_eq!(connector.connects(), 3);
        assert!(peers.try_recv().is_err());

        // A fresh request starts over
        manager.request_connection(hc05()).await.unwrap();
        drop(peers.recv().await.unwrap());
        let events = drain(&mut manager).await;
        assert!(events.iter().any(|e| matches!(
            e,
            AppEvent::Advisory(Advisory::Retrying { attempt: 1, .. })
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_without_session() {
        let (gatt, _links) = FakeGatt::new(responsive(1));
        let (connector, _peers) = FakeConnector::new();
        let connector = Arc::new(connector);
        let gatt = Arc::new(gatt);
        let manager = ConnectionManager::new(
            ConnectionConfig::default(),
            Transports {
                gatt: gatt.clone(),
                stream: connector.clone(),
                permissions: Arc::new(AlwaysGranted),
            },
        );

        assert_eq!(manager.send("M:08:00\n").await, Err(LinkError::NotConnected));
        assert_eq!(gatt.opens(), 0);
        assert!(connector.attempts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reminder_signals_once() {
        let (gatt, mut links) = FakeGatt::new(responsive(1));
        let (connector, _peers) = FakeConnector::new();
        let mut manager = manager(gatt, Arc::new(connector));

        manager.request_connection(hc05()).await.unwrap();
        drain(&mut manager).await;

        links.recv().await.unwrap().notify(b"Reminder: take medicine");
        let events = drain(&mut manager).await;

        assert_eq!(
            events,
            vec![
                AppEvent::Message(DecodedMessage::Text("Reminder: take medicine".into())),
                AppEvent::ShowReminder {
                    payload: "Reminder: take medicine".into()
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_acknowledgement_advisory() {
        let (gatt, mut links) = FakeGatt::new(responsive(1));
        let (connector, _peers) = FakeConnector::new();
        let mut manager = manager(gatt, Arc::new(connector));

        manager.request_connection(hc05()).await.unwrap();
        drain(&mut manager).await;

        links
            .recv()
            .await
            .unwrap()
            .notify(b"Night time set successfully\r\n");
        let events = drain(&mut manager).await;
        assert_eq!(
            events.last(),
            Some(&AppEvent::Advisory(Advisory::ScheduleAcknowledged(
                Period::Night
            )))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_tears_down() {
        let (gatt, mut links) = FakeGatt::new(responsive(1));
        let (connector, _peers) = FakeConnector::new();
        let mut manager = manager(gatt, Arc::new(connector));

        manager.request_connection(hc05()).await.unwrap();
        drain(&mut manager).await;

        manager.disconnect().await;
        manager.disconnect().await;
        let events = drain(&mut manager).await;

        assert_eq!(states(&events), vec![ConnectionState::Disconnected]);
        assert!(links.recv().await.unwrap().is_closed());
        assert_eq!(manager.send("N:21:00\n").await, Err(LinkError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_link_events_are_ignored() {
        let (gatt, mut links) = FakeGatt::new(responsive(1));
        let (connector, _peers) = FakeConnector::new();
        let mut manager = manager(gatt, Arc::new(connector));

        manager.request_connection(hc05()).await.unwrap();
        drain(&mut manager).await;
        let first = links.recv().await.unwrap();

        // Reconnecting replaces the first session
        manager.request_connection(hc05()).await.unwrap();
        drain(&mut manager).await;
        assert!(first.is_closed());

        first.notify(b"Reminder: stale");
        first.drop_link();
        assert!(drain(&mut manager).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_schedule_and_delivery() {
        let (gatt, _links) = FakeGatt::new(GattScript::Unavailable);
        let (connector, mut peers) = FakeConnector::new();
        let mut manager = manager(gatt, Arc::new(connector));

        manager.request_connection(hc05()).await.unwrap();
        let mut peer = peers.recv().await.unwrap();
        drain(&mut manager).await;

        let mut schedule = DoseSchedule::default();
        schedule.set(Period::Morning, "08:00".parse().unwrap());
        schedule.set(Period::Afternoon, "13:00".parse().unwrap());
        schedule.set(Period::Night, "21:00".parse().unwrap());

        let started = Instant::now();
        manager.handle().send_schedule(&schedule).await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_millis(1000));

        let mut buf = vec![0u8; 24];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, b"M:08:00\nA:13:00\nN:21:00\n".to_vec());

        let events = drain(&mut manager).await;
        let sent = events
            .iter()
            .filter(|e| {
                **e == AppEvent::Advisory(Advisory::DataSent {
                    transport: TransportKind::Stream,
                })
            })
            .count();
        assert_eq!(sent, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_incomplete_schedule_sends_nothing() {
        let (gatt, _links) = FakeGatt::new(GattScript::Unavailable);
        let (connector, mut peers) = FakeConnector::new();
        let mut manager = manager(gatt, Arc::new(connector));

        manager.request_connection(hc05()).await.unwrap();
        let mut peer = peers.recv().await.unwrap();
        drain(&mut manager).await;

        let mut schedule = DoseSchedule::default();
        schedule.set(Period::Morning, "08:00".parse().unwrap());
        let err = manager.handle().send_schedule(&schedule).await.unwrap_err();
        assert!(err.to_string().starts_with("Please set all reminder times"));

        let mut buf = [0u8; 1];
        assert!(timeout(Duration::from_secs(1), peer.read(&mut buf))
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_subscription_still_falls_back() {
        let (mut gatt, _links) = FakeGatt::new(responsive(1));
        gatt.ack_notifications = false;
        let (connector, _peers) = FakeConnector::new();
        let connector = Arc::new(connector);
        let mut manager = manager(gatt, connector.clone());

        let started = Instant::now();
        manager.request_connection(hc05()).await.unwrap();

        assert_eq!(
            manager.recv().await,
            Some(AppEvent::State(ConnectionState::Connecting))
        );
        assert_eq!(
            manager.recv().await,
            Some(AppEvent::Advisory(Advisory::FallbackStarted))
        );
        assert_eq!(started.elapsed(), Duration::from_secs(5));
        assert_eq!(
            manager.recv().await,
            Some(AppEvent::State(ConnectionState::Connected))
        );
        assert_eq!(
            connector.attempts().first(),
            Some(&SocketStrategy::LegacyChannel(1))
        );
        assert_eq!(manager.send("M:08:00\n").await, Ok(TransportKind::Stream));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_with_stalled_write() {
        let (gatt, _links) = FakeGatt::new(GattScript::Unavailable);
        let (connector, mut peers) = FakeConnector::new();
        let mut manager = manager(gatt, Arc::new(connector));

        manager.request_connection(hc05()).await.unwrap();
        // Never read, so the socket buffer fills up
        let _peer = peers.recv().await.unwrap();
        drain(&mut manager).await;

        let handle = manager.handle();
        let pending = tokio::spawn(async move { handle.send("x".repeat(10_000)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        timeout(Duration::from_secs(5), manager.disconnect())
            .await
            .expect("disconnect returned");
        assert_eq!(
            pending.await.unwrap(),
            Err(LinkError::WriteFailure("stream session closed".into()))
        );

        // The loop still serves commands
        assert_eq!(manager.send("N:21:00\n").await, Err(LinkError::NotConnected));
        let events = drain(&mut manager).await;
        assert_eq!(states(&events), vec![ConnectionState::Disconnected]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_back_to_back_sends_arrive_in_order() {
        let (gatt, _links) = FakeGatt::new(GattScript::Unavailable);
        let (connector, mut peers) = FakeConnector::new();
        let config = ConnectionConfig {
            settle_delay: Duration::ZERO,
            ..Default::default()
        };
        let mut manager = ConnectionManager::new(
            config,
            Transports {
                gatt: Arc::new(gatt),
                stream: Arc::new(connector),
                permissions: Arc::new(AlwaysGranted),
            },
        );

        manager.request_connection(hc05()).await.unwrap();
        let mut peer = peers.recv().await.unwrap();
        while let Some(event) = manager.recv().await {
            if event == AppEvent::State(ConnectionState::Connected) {
                break;
            }
        }

        let lines: Vec<String> = (0..50).map(|i| format!("line {:02}\n", i)).collect();
        let handle = manager.handle();
        let sends = lines.iter().map(|line| handle.send(line.clone()));
        for result in futures::future::join_all(sends).await {
            assert_eq!(result, Ok(TransportKind::Stream));
        }

        let expected = lines.concat();
        let mut received = vec![0u8; expected.len()];
        peer.read_exact(&mut received).await.unwrap();
        assert_eq!(String::from_utf8(received).unwrap(), expected);
    }

    struct Denied;

    #[async_trait]
    impl PermissionGate for Denied {
        async fn check(&self) -> anyhow::Result<()> {
            anyhow::bail!("adapter is powered off")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_denied_starts_nothing() {
        let (gatt, _links) = FakeGatt::new(responsive(1));
        let gatt = Arc::new(gatt);
        let (connector, _peers) = FakeConnector::new();
        let mut manager = ConnectionManager::new(
            ConnectionConfig::default(),
            Transports {
                gatt: gatt.clone(),
                stream: Arc::new(connector),
                permissions: Arc::new(Denied),
            },
        );

        assert_eq!(
            manager.request_connection(hc05()).await,
            Err(LinkError::PermissionDenied("adapter is powered off".into()))
        );
        assert_eq!(
            drain(&mut manager).await,
            vec![AppEvent::Advisory(Advisory::PermissionDenied(
                "adapter is powered off".into()
            ))]
        );
        assert_eq!(gatt.opens(), 0);
    }
}
