//! Chat session management on top of a [`HubTransport`].
//!
//! [`ChatService`] turns the transport's lifecycle and inbound traffic into
//! one multicast stream of [`Message`]s. Failures never escape its public
//! operations: each start failure, send failure or unexpected close becomes
//! a log record plus exactly one `error`-kind message on the stream.
//!
//! Note the asymmetry in [`ChatService::send`]: a send attempted while not
//! connected is dropped with a warning log and *no* error message.

use std::sync::{Arc, Weak};

use futures::Stream;
use lchat_core::{HubTransport, Message, TransportEvent, TransportFactory, RECEIVE_METHOD, SEND_METHOD};
use lchat_settings::ChatSettings;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt as _;
use tracing::{debug, error, info, warn};

use crate::hub::{HubConfig, HubConnectionFactory};

/// Lifecycle of an initialized connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConnectionState {
    Disconnected,
    /// A `start()` is in flight; overlapping starts are ignored.
    Connecting,
    Connected,
    Reconnecting,
}

struct Session {
    transport: Arc<dyn HubTransport>,
    state: ConnectionState,
    pump: JoinHandle<()>,
}

enum Connection {
    /// No transport has been built yet.
    Uninitialized,
    Ready(Session),
    /// Released; every operation is a no-op from here on.
    Disposed,
}

impl Connection {
    fn state_name(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Ready(session) => match session.state {
                ConnectionState::Disconnected => "disconnected",
                ConnectionState::Connecting => "connecting",
                ConnectionState::Connected => "connected",
                ConnectionState::Reconnecting => "reconnecting",
            },
            Self::Disposed => "disposed",
        }
    }
}

/// Manages one logical connection to a chat hub.
pub struct ChatService {
    factory: Arc<dyn TransportFactory>,
    connection: Arc<Mutex<Connection>>,
    messages: broadcast::Sender<Message>,
}

impl ChatService {
    /// `event_capacity` bounds how far a slow subscriber may fall behind
    /// before it starts missing messages.
    pub fn new(factory: Arc<dyn TransportFactory>, event_capacity: usize) -> Self {
        let (messages, _) = broadcast::channel(event_capacity.max(1));
        Self {
            factory,
            connection: Arc::new(Mutex::new(Connection::Uninitialized)),
            messages,
        }
    }

    /// Service backed by a SignalR [`HubConnection`](crate::hub::HubConnection).
    /// Fails if the settings do not validate.
    pub fn from_settings(settings: &ChatSettings) -> lchat_settings::Result<Self> {
        settings.validate()?;
        let factory = HubConnectionFactory::new(HubConfig::from(settings));
        Ok(Self::new(Arc::new(factory), settings.event_capacity))
    }

    /// Connect to the hub if idle. Failures are reported on the message
    /// stream, never returned.
    pub async fn start(&self) {
        let transport = {
            let mut connection = self.connection.lock();
            let Some(session) = self.ensure_initialized(&mut connection) else {
                debug!("start ignored: chat service disposed");
                return;
            };
            if session.state != ConnectionState::Disconnected {
                debug!(state = ?session.state, "start ignored: connection not idle");
                return;
            }
            session.state = ConnectionState::Connecting;
            Arc::clone(&session.transport)
        };

        let result = transport.connect().await;

        // The pump may already have moved the state on (a close or drop
        // batched with the handshake); only an untouched `Connecting` is
        // promoted.
        let outcome = {
            let mut connection = self.connection.lock();
            let Connection::Ready(session) = &mut *connection else {
                debug!("chat service disposed while starting");
                return;
            };
            match result {
                Ok(()) if session.state == ConnectionState::Connecting => {
                    session.state = ConnectionState::Connected;
                    Ok(None)
                }
                Ok(()) => Ok(Some(session.state)),
                Err(e) => {
                    session.state = ConnectionState::Disconnected;
                    Err(e)
                }
            }
        };

        match outcome {
            Ok(None) => info!("Chat hub connection started"),
            Ok(Some(state)) => {
                debug!(?state, "connection changed state while starting");
            }
            Err(e) => {
                error!(error = %e, error_kind = e.error_kind(), "Error starting chat hub connection");
                self.emit(Message::error(format!("Failed to connect to chat hub: {e}")));
            }
        }
    }

    /// Send `content` as a `client` message.
    ///
    /// While not connected this only logs a warning; no error message is
    /// emitted. A transport failure after the connected check emits one
    /// `error` message.
    pub async fn send(&self, content: impl Into<String>) {
        let transport = {
            let connection = self.connection.lock();
            match &*connection {
                Connection::Ready(session) if session.state == ConnectionState::Connected => {
                    Arc::clone(&session.transport)
                }
                other => {
                    let state = other.state_name();
                    drop(connection);
                    warn!(state, "Cannot send message: chat hub is not connected");
                    return;
                }
            }
        };

        let message = Message::client(content);
        let result = match serde_json::to_value(&message) {
            Ok(payload) => transport.send(SEND_METHOD, vec![payload]).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        if let Err(e) = result {
            error!(error = %e, "Error sending chat message");
            self.emit(Message::error(format!("Failed to send message: {e}")));
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            &*self.connection.lock(),
            Connection::Ready(session) if session.state == ConnectionState::Connected
        )
    }

    /// Subscribe to messages emitted from now on. Drop the receiver to
    /// unsubscribe.
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.messages.subscribe()
    }

    /// [`subscribe`](Self::subscribe) as a stream. Messages a lagging
    /// subscriber missed are skipped with a warning.
    pub fn messages(&self) -> impl Stream<Item = Message> + Send + Unpin + 'static {
        BroadcastStream::new(self.subscribe()).filter_map(|item| match item {
            Ok(message) => Some(message),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "message subscriber lagged, dropped messages");
                None
            }
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.messages.receiver_count()
    }

    /// Release the transport. Idempotent; teardown errors are logged only.
    pub async fn dispose(&self) {
        let previous = std::mem::replace(&mut *self.connection.lock(), Connection::Disposed);
        let session = match previous {
            Connection::Ready(session) => session,
            Connection::Uninitialized => {
                debug!("chat service disposed before first use");
                return;
            }
            Connection::Disposed => {
                debug!("chat service already disposed");
                return;
            }
        };

        session.pump.abort();
        match session.transport.dispose().await {
            Ok(()) => info!("Chat service disposed"),
            Err(e) => error!(error = %e, "Error disposing chat service"),
        }
    }

    /// Lazily build the transport and its event pump on first access.
    fn ensure_initialized<'a>(&self, connection: &'a mut Connection) -> Option<&'a mut Session> {
        if matches!(connection, Connection::Uninitialized) {
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let transport = self.factory.create(events_tx);
            let pump = tokio::spawn(pump_events(
                Arc::downgrade(&self.connection),
                self.messages.clone(),
                events_rx,
            ));
            *connection = Connection::Ready(Session {
                transport,
                state: ConnectionState::Disconnected,
                pump,
            });
            debug!("chat hub connection initialized");
        }

        match connection {
            Connection::Ready(session) => Some(session),
            _ => None,
        }
    }

    fn emit(&self, message: Message) {
        emit(&self.messages, message);
    }

    #[cfg(test)]
    fn state(&self) -> Option<ConnectionState> {
        match &*self.connection.lock() {
            Connection::Ready(session) => Some(session.state),
            _ => None,
        }
    }
}

impl Drop for ChatService {
    fn drop(&mut self) {
        let previous = std::mem::replace(&mut *self.connection.lock(), Connection::Disposed);
        let Connection::Ready(session) = previous else {
            return;
        };

        session.pump.abort();
        let transport = session.transport;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = transport.dispose().await {
                        error!(error = %e, "Error disposing chat service");
                    }
                });
            }
            Err(_) => warn!("chat service dropped outside a runtime, transport not disposed"),
        }
    }
}

fn emit(messages: &broadcast::Sender<Message>, message: Message) {
    if messages.send(message).is_err() {
        debug!("message emitted with no subscribers");
    }
}

/// Forward transport events until the transport goes away or the service
/// is dropped.
async fn pump_events(
    connection: Weak<Mutex<Connection>>,
    messages: broadcast::Sender<Message>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(connection) = connection.upgrade() else {
            break;
        };
        debug!(event = event.event_type(), "transport event");
        if let Some(message) = handle_event(&connection, event) {
            emit(&messages, message);
        }
    }
}

fn handle_event(connection: &Mutex<Connection>, event: TransportEvent) -> Option<Message> {
    match event {
        TransportEvent::Invocation { target, arguments } => {
            if !target.eq_ignore_ascii_case(RECEIVE_METHOD) {
                debug!(target = %target, "no handler for hub method");
                return None;
            }
            let Some(payload) = arguments.into_iter().next() else {
                warn!("hub delivered a message without payload");
                return None;
            };
            match serde_json::from_value::<Message>(payload) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!(error = %e, "dropping malformed chat message");
                    None
                }
            }
        }
        TransportEvent::Reconnecting { error } => {
            transition(
                connection,
                &[ConnectionState::Connecting, ConnectionState::Connected],
                ConnectionState::Reconnecting,
            );
            warn!(
                error = error.as_deref().unwrap_or("unknown"),
                "Chat hub connection lost, attempting to reconnect..."
            );
            None
        }
        TransportEvent::Reconnected => {
            transition(connection, &[ConnectionState::Reconnecting], ConnectionState::Connected);
            info!("Reconnected to chat hub");
            None
        }
        TransportEvent::Closed { error } => {
            let was_live = {
                let mut connection = connection.lock();
                match &mut *connection {
                    Connection::Ready(session)
                        if matches!(
                            session.state,
                            ConnectionState::Connecting
                                | ConnectionState::Connected
                                | ConnectionState::Reconnecting
                        ) =>
                    {
                        session.state = ConnectionState::Disconnected;
                        true
                    }
                    _ => false,
                }
            };
            if !was_live {
                debug!(error = ?error, "ignoring close of an inactive connection");
                return None;
            }

            let reason = error.unwrap_or_else(|| "connection closed".to_string());
            error!(reason = %reason, "Chat hub connection closed");
            Some(Message::error(format!("Chat hub connection closed: {reason}")))
        }
    }
}

fn transition(connection: &Mutex<Connection>, from: &[ConnectionState], to: ConnectionState) {
    if let Connection::Ready(session) = &mut *connection.lock() {
        if from.contains(&session.state) {
            session.state = to;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use lchat_core::{MessageKind, TransportError};
    use tokio::sync::broadcast::error::TryRecvError;
    use tokio_stream::StreamExt;

    use super::*;
    use crate::mock::MockTransportFactory;

    const WAIT: Duration = Duration::from_secs(1);

    fn service(factory: &Arc<MockTransportFactory>) -> ChatService {
        ChatService::new(factory.clone(), 32)
    }

    async fn next(rx: &mut broadcast::Receiver<Message>) -> Message {
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("channel closed")
    }

    /// Let the pump drain pending events.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    fn hub_message(kind: MessageKind, content: &str, secs: i64) -> Message {
        Message::new(kind, content).with_timestamp(Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap())
    }

    fn receive(message: &Message) -> TransportEvent {
        TransportEvent::Invocation {
            target: RECEIVE_METHOD.into(),
            arguments: vec![serde_json::to_value(message).unwrap()],
        }
    }

    async fn connected(factory: &Arc<MockTransportFactory>) -> ChatService {
        let svc = service(factory);
        svc.start().await;
        assert!(svc.is_connected());
        svc
    }

    #[tokio::test]
    async fn construction_is_lazy() {
        let factory = Arc::new(MockTransportFactory::new());
        let svc = service(&factory);
        assert_eq!(factory.created(), 0);
        assert!(!svc.is_connected());
        assert_eq!(svc.state(), None);

        svc.start().await;
        assert_eq!(factory.created(), 1);
        svc.start().await;
        assert_eq!(factory.created(), 1);
    }

    #[tokio::test]
    async fn successful_start_is_silent() {
        let factory = Arc::new(MockTransportFactory::new());
        let svc = service(&factory);
        let mut rx = svc.subscribe();

        svc.start().await;
        settle().await;

        assert!(svc.is_connected());
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn start_when_connected_is_noop() {
        let factory = Arc::new(MockTransportFactory::new());
        let svc = connected(&factory).await;

        svc.start().await;
        svc.start().await;
        assert_eq!(factory.transport().unwrap().connect_calls(), 1);
    }

    #[tokio::test]
    async fn connect_failure_emits_one_error() {
        let factory = Arc::new(MockTransportFactory::new().with_connect_results(vec![Err(
            TransportError::WebSocket("network unreachable".into()),
        )]));
        let svc = service(&factory);
        let mut rx = svc.subscribe();

        svc.start().await;

        let msg = next(&mut rx).await;
        assert_eq!(msg.kind, MessageKind::Error);
        assert!(msg.content.contains("network unreachable"), "got: {}", msg.content);
        assert!(!svc.is_connected());
        settle().await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn failures_then_success_emit_one_error_each() {
        let factory = Arc::new(MockTransportFactory::new().with_connect_results(vec![
            Err(TransportError::WebSocket("refused".into())),
            Err(TransportError::Timeout(Duration::from_secs(15))),
            Ok(()),
        ]));
        let svc = service(&factory);
        let mut rx = svc.subscribe();

        for _ in 0..3 {
            svc.start().await;
        }
        settle().await;

        let mut errors = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            errors.push(msg);
        }
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(Message::is_error));
        assert!(svc.is_connected());
    }

    #[tokio::test]
    async fn overlapping_starts_connect_once() {
        let factory = Arc::new(MockTransportFactory::new().with_connect_delay(Duration::from_millis(100)));
        let svc = Arc::new(service(&factory));

        let a = tokio::spawn({
            let svc = Arc::clone(&svc);
            async move { svc.start().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(svc.state(), Some(ConnectionState::Connecting));
        svc.start().await;
        a.await.unwrap();

        assert!(svc.is_connected());
        assert_eq!(factory.transport().unwrap().connect_calls(), 1);
    }

    #[tokio::test]
    async fn send_while_disconnected_is_dropped_silently() {
        let factory = Arc::new(MockTransportFactory::new());
        let svc = service(&factory);
        let mut rx = svc.subscribe();

        svc.send("hi").await;
        settle().await;

        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(factory.created(), 0);
    }

    #[tokio::test]
    async fn send_after_failed_start_transmits_nothing() {
        let factory = Arc::new(MockTransportFactory::new().with_connect_results(vec![Err(
            TransportError::WebSocket("down".into()),
        )]));
        let svc = service(&factory);
        svc.start().await;
        let mut rx = svc.subscribe();

        svc.send("hi").await;
        settle().await;

        assert!(factory.transport().unwrap().sent().is_empty());
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn send_while_connected_transmits_client_message() {
        let factory = Arc::new(MockTransportFactory::new());
        let svc = connected(&factory).await;
        let mut rx = svc.subscribe();

        svc.send("hi").await;
        settle().await;

        let sent = factory.transport().unwrap().sent();
        assert_eq!(sent.len(), 1);
        let (method, arguments) = &sent[0];
        assert_eq!(method, SEND_METHOD);
        assert_eq!(arguments.len(), 1);
        let message: Message = serde_json::from_value(arguments[0].clone()).unwrap();
        assert_eq!(message.kind, MessageKind::Client);
        assert_eq!(message.content, "hi");
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn send_failure_emits_one_error() {
        let factory = Arc::new(MockTransportFactory::new().with_send_results(vec![Err(
            TransportError::ConnectionLost("broken pipe".into()),
        )]));
        let svc = connected(&factory).await;
        let mut rx = svc.subscribe();

        svc.send("hi").await;

        let msg = next(&mut rx).await;
        assert!(msg.is_error());
        assert!(msg.content.contains("broken pipe"));
        settle().await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn inbound_messages_delivered_in_order() {
        let factory = Arc::new(MockTransportFactory::new());
        let svc = connected(&factory).await;
        let mut rx = svc.subscribe();
        let transport = factory.transport().unwrap();

        let hello = hub_message(MessageKind::Llm, "hello", 0);
        let meta = hub_message(MessageKind::Meta, "typing", 1);
        let log = hub_message(MessageKind::Log, "done", 2);
        for m in [&hello, &meta, &log] {
            transport.inject(receive(m));
        }

        assert_eq!(next(&mut rx).await, hello);
        assert_eq!(next(&mut rx).await, meta);
        assert_eq!(next(&mut rx).await, log);
        settle().await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_message() {
        let factory = Arc::new(MockTransportFactory::new());
        let svc = connected(&factory).await;
        let mut a = svc.subscribe();
        let mut b = svc.subscribe();
        assert_eq!(svc.subscriber_count(), 2);

        let hello = hub_message(MessageKind::Llm, "hello", 0);
        factory.transport().unwrap().inject(receive(&hello));

        assert_eq!(next(&mut a).await, hello);
        assert_eq!(next(&mut b).await, hello);
    }

    #[tokio::test]
    async fn late_subscriber_gets_no_replay() {
        let factory = Arc::new(MockTransportFactory::new());
        let svc = connected(&factory).await;
        let mut early = svc.subscribe();
        let transport = factory.transport().unwrap();

        transport.inject(receive(&hub_message(MessageKind::Llm, "before", 0)));
        next(&mut early).await;

        let mut late = svc.subscribe();
        let after = hub_message(MessageKind::Llm, "after", 1);
        transport.inject(receive(&after));
        assert_eq!(next(&mut late).await, after);
    }

    #[tokio::test]
    async fn message_stream_yields_inbound() {
        let factory = Arc::new(MockTransportFactory::new());
        let svc = connected(&factory).await;
        let mut stream = svc.messages();

        let hello = hub_message(MessageKind::Llm, "hello", 0);
        factory.transport().unwrap().inject(receive(&hello));

        let got = tokio::time::timeout(WAIT, stream.next()).await.unwrap();
        assert_eq!(got, Some(hello));
    }

    #[tokio::test]
    async fn malformed_and_unknown_invocations_are_ignored() {
        let factory = Arc::new(MockTransportFactory::new());
        let svc = connected(&factory).await;
        let mut rx = svc.subscribe();
        let transport = factory.transport().unwrap();

        transport.inject(TransportEvent::Invocation {
            target: RECEIVE_METHOD.into(),
            arguments: vec![serde_json::json!({"content": 42})],
        });
        transport.inject(TransportEvent::Invocation {
            target: "Typing".into(),
            arguments: vec![],
        });
        transport.inject(TransportEvent::Invocation {
            target: RECEIVE_METHOD.into(),
            arguments: vec![],
        });
        settle().await;

        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert!(svc.is_connected());
    }

    #[tokio::test]
    async fn reconnect_cycle_emits_nothing() {
        let factory = Arc::new(MockTransportFactory::new());
        let svc = connected(&factory).await;
        let mut rx = svc.subscribe();
        let transport = factory.transport().unwrap();

        transport.inject(TransportEvent::Reconnecting {
            error: Some("connection reset".into()),
        });
        settle().await;
        assert!(!svc.is_connected());
        assert_eq!(svc.state(), Some(ConnectionState::Reconnecting));

        svc.send("while reconnecting").await;
        assert!(transport.sent().is_empty());

        transport.inject(TransportEvent::Reconnected);
        settle().await;
        assert!(svc.is_connected());
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn unexpected_close_emits_one_error_with_reason() {
        let factory = Arc::new(MockTransportFactory::new());
        let svc = connected(&factory).await;
        let mut rx = svc.subscribe();
        let transport = factory.transport().unwrap();

        transport.inject(TransportEvent::Closed {
            error: Some("server restart".into()),
        });
        let msg = next(&mut rx).await;
        assert!(msg.is_error());
        assert!(msg.content.contains("server restart"), "got: {}", msg.content);
        assert!(!svc.is_connected());

        // A second close for the same dead connection is not a new failure.
        transport.inject(TransportEvent::Closed {
            error: Some("server restart".into()),
        });
        settle().await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn close_while_reconnecting_emits_error() {
        let factory = Arc::new(MockTransportFactory::new());
        let svc = connected(&factory).await;
        let mut rx = svc.subscribe();
        let transport = factory.transport().unwrap();

        transport.inject(TransportEvent::Reconnecting { error: None });
        transport.inject(TransportEvent::Closed { error: None });

        let msg = next(&mut rx).await;
        assert!(msg.is_error());
        assert!(msg.content.contains("connection closed"));
        assert_eq!(svc.state(), Some(ConnectionState::Disconnected));
    }

    #[tokio::test]
    async fn close_during_start_emits_one_error() {
        let factory = Arc::new(MockTransportFactory::new().with_connect_delay(Duration::from_millis(100)));
        let svc = Arc::new(service(&factory));
        let mut rx = svc.subscribe();

        let start = tokio::spawn({
            let svc = Arc::clone(&svc);
            async move { svc.start().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        factory.transport().unwrap().inject(TransportEvent::Closed {
            error: Some("server restart".into()),
        });

        let msg = next(&mut rx).await;
        assert!(msg.is_error());
        assert!(msg.content.contains("server restart"), "got: {}", msg.content);

        start.await.unwrap();
        assert!(!svc.is_connected());
        assert_eq!(svc.state(), Some(ConnectionState::Disconnected));
        settle().await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn reconnecting_during_start_is_not_connected() {
        let factory = Arc::new(MockTransportFactory::new().with_connect_delay(Duration::from_millis(100)));
        let svc = Arc::new(service(&factory));
        let mut rx = svc.subscribe();

        let start = tokio::spawn({
            let svc = Arc::clone(&svc);
            async move { svc.start().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let transport = factory.transport().unwrap();
        transport.inject(TransportEvent::Reconnecting {
            error: Some("connection reset".into()),
        });
        start.await.unwrap();

        assert!(!svc.is_connected());
        assert_eq!(svc.state(), Some(ConnectionState::Reconnecting));

        transport.inject(TransportEvent::Reconnected);
        settle().await;
        assert!(svc.is_connected());
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn from_settings_rejects_invalid_settings() {
        let settings = ChatSettings {
            keep_alive_interval_ms: 0,
            ..Default::default()
        };
        assert!(ChatService::from_settings(&settings).is_err());
        assert!(ChatService::from_settings(&ChatSettings::default()).is_ok());
    }

    #[tokio::test]
    async fn start_after_close_reconnects() {
        let factory = Arc::new(MockTransportFactory::new());
        let svc = connected(&factory).await;
        let transport = factory.transport().unwrap();

        transport.inject(TransportEvent::Closed { error: None });
        settle().await;
        assert!(!svc.is_connected());

        svc.start().await;
        assert!(svc.is_connected());
        assert_eq!(transport.connect_calls(), 2);
        assert_eq!(factory.created(), 1);
    }

    #[tokio::test]
    async fn dispose_twice_releases_once() {
        let factory = Arc::new(MockTransportFactory::new());
        let svc = connected(&factory).await;
        let transport = factory.transport().unwrap();

        svc.dispose().await;
        svc.dispose().await;

        assert_eq!(transport.dispose_calls(), 1);
        assert!(!svc.is_connected());
    }

    #[tokio::test]
    async fn dispose_failure_is_swallowed() {
        let factory = Arc::new(
            MockTransportFactory::new().with_dispose_error(TransportError::Closed("already gone".into())),
        );
        let svc = connected(&factory).await;
        let mut rx = svc.subscribe();

        svc.dispose().await;
        settle().await;

        assert_eq!(factory.transport().unwrap().dispose_calls(), 1);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn dispose_before_start_then_start_is_noop() {
        let factory = Arc::new(MockTransportFactory::new());
        let svc = service(&factory);

        svc.dispose().await;
        svc.start().await;

        assert_eq!(factory.created(), 0);
        assert!(!svc.is_connected());
    }

    #[tokio::test]
    async fn dispose_during_start_releases_once() {
        let factory = Arc::new(MockTransportFactory::new().with_connect_delay(Duration::from_millis(100)));
        let svc = Arc::new(service(&factory));
        let mut rx = svc.subscribe();

        let start = tokio::spawn({
            let svc = Arc::clone(&svc);
            async move { svc.start().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        svc.dispose().await;
        start.await.unwrap();
        svc.dispose().await;

        assert_eq!(factory.transport().unwrap().dispose_calls(), 1);
        assert!(!svc.is_connected());
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn events_after_dispose_are_ignored() {
        let factory = Arc::new(MockTransportFactory::new());
        let svc = connected(&factory).await;
        let mut rx = svc.subscribe();
        let transport = factory.transport().unwrap();

        svc.dispose().await;
        transport.inject(TransportEvent::Closed {
            error: Some("late".into()),
        });
        settle().await;

        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn drop_disposes_transport() {
        let factory = Arc::new(MockTransportFactory::new());
        let svc = connected(&factory).await;
        let transport = factory.transport().unwrap();

        drop(svc);
        settle().await;

        assert_eq!(transport.dispose_calls(), 1);
    }
}
