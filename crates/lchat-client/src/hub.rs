//! WebSocket hub transport with automatic reconnection.
//!
//! One driver task owns the socket. Sends travel to it over a channel and
//! are acknowledged once written. When the socket drops unexpectedly the
//! driver walks the reconnect schedule, reporting progress as
//! [`TransportEvent`]s.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use lchat_core::{EventSender, HubTransport, TransportError, TransportEvent, TransportFactory};
use lchat_settings::ChatSettings;
use parking_lot::RwLock;
use reqwest::Url;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::negotiate;
use crate::protocol::{self, HubMessage, ProtocolError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Floor for the ping interval; a zero interval would spin.
const MIN_KEEP_ALIVE: Duration = Duration::from_millis(100);

/// Connection parameters for a [`HubConnection`].
#[derive(Clone, Debug)]
pub struct HubConfig {
    pub url: String,
    /// Delay before each reconnect attempt; recovery gives up when exhausted.
    pub reconnect_delays: Vec<Duration>,
    pub skip_negotiation: bool,
    pub handshake_timeout: Duration,
    pub keep_alive_interval: Duration,
    pub server_timeout: Duration,
    pub send_queue: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self::from(&ChatSettings::default())
    }
}

impl From<&ChatSettings> for HubConfig {
    fn from(settings: &ChatSettings) -> Self {
        Self {
            url: settings.hub_url.clone(),
            reconnect_delays: settings.reconnect_delays(),
            skip_negotiation: settings.skip_negotiation,
            handshake_timeout: settings.handshake_timeout(),
            keep_alive_interval: settings.keep_alive_interval(),
            server_timeout: settings.server_timeout(),
            send_queue: 64,
        }
    }
}

/// A queued outbound frame and the channel its write result goes to.
struct Outbound {
    frame: String,
    ack: oneshot::Sender<Result<(), TransportError>>,
}

/// How a single socket session ended.
#[derive(Debug, PartialEq)]
enum SessionEnd {
    /// `dispose()` was called.
    Stopped,
    /// The server closed the connection and does not want a reconnect.
    Closed(Option<String>),
    /// The socket dropped; worth reconnecting.
    Lost(String),
}

enum ReconnectFailure {
    Stopped,
    GaveUp(String),
}

/// State shared between the connection handle and its driver task.
struct Shared {
    config: HubConfig,
    http: reqwest::Client,
    events: EventSender,
    /// Sender into the live session, `None` while no socket is up.
    link: RwLock<Option<mpsc::Sender<Outbound>>>,
}

struct Running {
    cancel: CancellationToken,
    driver: JoinHandle<()>,
}

/// SignalR JSON hub connection over a WebSocket.
pub struct HubConnection {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl HubConnection {
    pub fn new(config: HubConfig, events: EventSender) -> Self {
        Self::with_client(config, reqwest::Client::new(), events)
    }

    pub fn with_client(config: HubConfig, http: reqwest::Client, events: EventSender) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                http,
                events,
                link: RwLock::new(None),
            }),
            running: Mutex::new(None),
        }
    }
}

#[async_trait]
impl HubTransport for HubConnection {
    async fn connect(&self) -> Result<(), TransportError> {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.driver.is_finished()) {
            return Ok(());
        }

        let (socket, leftover) = open_socket(&self.shared).await?;
        let rx = self.shared.open_link();
        let cancel = CancellationToken::new();
        let driver = tokio::spawn(drive(
            Arc::clone(&self.shared),
            socket,
            leftover,
            rx,
            cancel.clone(),
        ));
        *running = Some(Running { cancel, driver });

        tracing::info!(url = %self.shared.config.url, "hub connection established");
        Ok(())
    }

    async fn send(&self, method: &str, arguments: Vec<Value>) -> Result<(), TransportError> {
        let tx = self.shared.link.read().clone().ok_or(TransportError::NotConnected)?;
        let frame = protocol::encode(&HubMessage::invocation(method, arguments))?;

        let (ack, done) = oneshot::channel();
        tx.send(Outbound { frame, ack })
            .await
            .map_err(|_| TransportError::ConnectionLost("connection dropped before send".into()))?;
        done.await.map_err(|_| {
            TransportError::ConnectionLost("connection dropped before send completed".into())
        })?
    }

    async fn dispose(&self) -> Result<(), TransportError> {
        let running = self.running.lock().await.take();
        let Some(Running { cancel, driver }) = running else {
            return Ok(());
        };

        cancel.cancel();
        match driver.await {
            Ok(()) => Ok(()),
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(TransportError::Closed(format!("connection task failed: {e}"))),
        }
    }
}

impl Drop for HubConnection {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
        }
    }
}

impl Shared {
    fn emit(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("transport event dropped, no listener");
        }
    }

    fn open_link(&self) -> mpsc::Receiver<Outbound> {
        let (tx, rx) = mpsc::channel(self.config.send_queue.max(1));
        *self.link.write() = Some(tx);
        rx
    }

    /// Handle every record in a text frame. Returns how the session should
    /// end if the hub asked to close it.
    fn dispatch(&self, text: &str) -> Option<SessionEnd> {
        for message in protocol::decode(text) {
            match message {
                Ok(HubMessage::Invocation { target, arguments, .. }) => {
                    self.emit(TransportEvent::Invocation { target, arguments });
                }
                Ok(HubMessage::Ping) => tracing::trace!("received ping"),
                Ok(HubMessage::Close {
                    error,
                    allow_reconnect,
                }) => {
                    return Some(if allow_reconnect {
                        SessionEnd::Lost(error.unwrap_or_else(|| "server requested reconnect".into()))
                    } else {
                        SessionEnd::Closed(error)
                    });
                }
                Ok(HubMessage::Other(kind)) => tracing::debug!(kind, "ignoring hub message"),
                Err(e) => tracing::warn!(error = %e, "failed to decode hub message"),
            }
        }
        None
    }
}

/// Negotiate (unless skipped), open the socket and complete the handshake.
/// Returns the socket and any records that arrived with the handshake reply.
async fn open_socket(shared: &Shared) -> Result<(WsStream, String), TransportError> {
    let config = &shared.config;
    let url: Url = if config.skip_negotiation {
        negotiate::websocket_url(&config.url, None)?
    } else {
        negotiate::negotiate(&shared.http, &config.url).await?
    };

    let (mut socket, _) = timeout(config.handshake_timeout, connect_async(url.as_str()))
        .await
        .map_err(|_| TransportError::Timeout(config.handshake_timeout))?
        .map_err(|e| TransportError::WebSocket(e.to_string()))?;

    socket
        .send(WsMessage::Text(protocol::handshake_request().into()))
        .await
        .map_err(|e| TransportError::WebSocket(e.to_string()))?;

    let leftover = timeout(config.handshake_timeout, read_handshake(&mut socket))
        .await
        .map_err(|_| TransportError::Timeout(config.handshake_timeout))??;

    tracing::debug!(%url, "hub handshake complete");
    Ok((socket, leftover))
}

async fn read_handshake(socket: &mut WsStream) -> Result<String, TransportError> {
    let mut buffer = String::new();
    while let Some(msg) = socket.next().await {
        match msg.map_err(|e| TransportError::WebSocket(e.to_string()))? {
            WsMessage::Text(text) => {
                buffer.push_str(text.as_str());
                match protocol::parse_handshake_response(&buffer) {
                    Ok(rest) => return Ok(rest.to_string()),
                    Err(ProtocolError::Incomplete) => continue,
                    Err(e) => return Err(e.into()),
                }
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }
    Err(TransportError::Handshake("connection closed during handshake".into()))
}

/// Reports `Closed` if the driver task ends without emitting a final
/// event itself (a panic unwinding through it).
struct DriverGuard {
    shared: Arc<Shared>,
    armed: bool,
}

impl DriverGuard {
    fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for DriverGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        *self.shared.link.write() = None;
        tracing::error!("hub connection task ended unexpectedly");
        self.shared.emit(TransportEvent::Closed {
            error: Some("connection task ended unexpectedly".into()),
        });
    }
}

async fn drive(
    shared: Arc<Shared>,
    socket: WsStream,
    leftover: String,
    rx: mpsc::Receiver<Outbound>,
    cancel: CancellationToken,
) {
    let guard = DriverGuard::new(Arc::clone(&shared));
    drive_sessions(shared, socket, leftover, rx, cancel).await;
    guard.disarm();
}

/// Owns the connection for its whole life: runs sessions back to back,
/// reconnecting in between, until stopped or given up.
async fn drive_sessions(
    shared: Arc<Shared>,
    mut socket: WsStream,
    mut leftover: String,
    mut rx: mpsc::Receiver<Outbound>,
    cancel: CancellationToken,
) {
    loop {
        let end = run_session(&shared, socket, &leftover, rx, &cancel).await;
        *shared.link.write() = None;

        let error = match end {
            SessionEnd::Stopped => {
                tracing::debug!("hub connection stopped");
                shared.emit(TransportEvent::Closed { error: None });
                return;
            }
            SessionEnd::Closed(error) => {
                tracing::info!(error = ?error, "hub closed the connection");
                shared.emit(TransportEvent::Closed { error });
                return;
            }
            SessionEnd::Lost(error) => error,
        };

        if shared.config.reconnect_delays.is_empty() {
            tracing::warn!(error = %error, "hub connection lost, reconnect disabled");
            shared.emit(TransportEvent::Closed { error: Some(error) });
            return;
        }

        tracing::warn!(error = %error, "hub connection lost");
        shared.emit(TransportEvent::Reconnecting {
            error: Some(error),
        });

        match reconnect(&shared, &cancel).await {
            Ok((new_socket, new_leftover)) => {
                socket = new_socket;
                leftover = new_leftover;
                rx = shared.open_link();
                tracing::info!("hub connection recovered");
                shared.emit(TransportEvent::Reconnected);
            }
            Err(ReconnectFailure::Stopped) => {
                shared.emit(TransportEvent::Closed { error: None });
                return;
            }
            Err(ReconnectFailure::GaveUp(reason)) => {
                tracing::error!(reason = %reason, "giving up on hub connection");
                shared.emit(TransportEvent::Closed {
                    error: Some(reason),
                });
                return;
            }
        }
    }
}

async fn reconnect(
    shared: &Shared,
    cancel: &CancellationToken,
) -> Result<(WsStream, String), ReconnectFailure> {
    let mut last_error = String::new();

    for (attempt, delay) in shared.config.reconnect_delays.iter().enumerate() {
        tokio::select! {
            _ = cancel.cancelled() => return Err(ReconnectFailure::Stopped),
            _ = tokio::time::sleep(*delay) => {}
        }

        tracing::info!(attempt = attempt + 1, ?delay, "reconnecting to hub");

        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(ReconnectFailure::Stopped),
            result = open_socket(shared) => result,
        };

        match result {
            Ok(session) => return Ok(session),
            Err(e) if !e.is_retryable() => {
                return Err(ReconnectFailure::GaveUp(e.to_string()));
            }
            Err(e) => {
                tracing::warn!(
                    attempt = attempt + 1,
                    error = %e,
                    error_kind = e.error_kind(),
                    "reconnect attempt failed"
                );
                last_error = e.to_string();
            }
        }
    }

    Err(ReconnectFailure::GaveUp(format!(
        "reconnect attempts exhausted: {last_error}"
    )))
}

/// Pump one socket: write queued frames, keep the connection alive, watch
/// for server silence and dispatch inbound records.
async fn run_session(
    shared: &Shared,
    socket: WsStream,
    leftover: &str,
    mut rx: mpsc::Receiver<Outbound>,
    cancel: &CancellationToken,
) -> SessionEnd {
    if let Some(end) = shared.dispatch(leftover) {
        return end;
    }

    let config = &shared.config;
    let (mut ws_tx, mut ws_rx) = socket.split();
    let ping_frame = match protocol::encode(&HubMessage::Ping) {
        Ok(frame) => frame,
        Err(e) => return SessionEnd::Lost(e.to_string()),
    };

    let mut ping = tokio::time::interval(config.keep_alive_interval.max(MIN_KEEP_ALIVE));
    ping.tick().await; // consume first immediate tick
    let mut deadline = Instant::now() + config.server_timeout;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws_tx.send(WsMessage::Close(None)).await;
                return SessionEnd::Stopped;
            }
            outbound = rx.recv() => {
                let Some(Outbound { frame, ack }) = outbound else {
                    return SessionEnd::Stopped;
                };
                let result = ws_tx
                    .send(WsMessage::Text(frame.into()))
                    .await
                    .map_err(|e| TransportError::WebSocket(e.to_string()));
                let failure = result.as_ref().err().map(ToString::to_string);
                let _ = ack.send(result);
                if let Some(error) = failure {
                    return SessionEnd::Lost(error);
                }
                ping.reset();
            }
            _ = ping.tick() => {
                if let Err(e) = ws_tx.send(WsMessage::Text(ping_frame.clone().into())).await {
                    return SessionEnd::Lost(e.to_string());
                }
                tracing::trace!("sent keep-alive ping");
            }
            _ = tokio::time::sleep_until(deadline) => {
                return SessionEnd::Lost(format!(
                    "server timeout elapsed after {:?} without a message",
                    config.server_timeout
                ));
            }
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        deadline = Instant::now() + config.server_timeout;
                        if let Some(end) = shared.dispatch(text.as_str()) {
                            let _ = ws_tx.send(WsMessage::Close(None)).await;
                            return end;
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        let reason = frame
                            .map(|f| f.reason.as_str().to_owned())
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| "websocket closed by server".into());
                        return SessionEnd::Lost(reason);
                    }
                    Some(Ok(_)) => {
                        deadline = Instant::now() + config.server_timeout;
                    }
                    Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                    None => return SessionEnd::Lost("websocket stream ended".into()),
                }
            }
        }
    }
}

/// Builds [`HubConnection`]s sharing one HTTP client.
pub struct HubConnectionFactory {
    config: HubConfig,
    http: reqwest::Client,
}

impl HubConnectionFactory {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }
}

impl TransportFactory for HubConnectionFactory {
    fn create(&self, events: EventSender) -> Arc<dyn HubTransport> {
        Arc::new(HubConnection::with_client(
            self.config.clone(),
            self.http.clone(),
            events,
        ))
    }
}
