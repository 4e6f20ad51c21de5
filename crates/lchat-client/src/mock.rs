use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lchat_core::{EventSender, HubTransport, TransportError, TransportEvent, TransportFactory};
use parking_lot::Mutex;
use serde_json::Value;

/// Pre-programmed transport outcomes. Unscripted calls succeed.
#[derive(Default)]
struct Script {
    connect_results: VecDeque<Result<(), TransportError>>,
    send_results: VecDeque<Result<(), TransportError>>,
    dispose_error: Option<TransportError>,
    connect_delay: Option<Duration>,
}

/// In-memory transport for deterministic tests without a hub.
pub struct MockTransport {
    events: EventSender,
    script: Mutex<Script>,
    sent: Mutex<Vec<(String, Vec<Value>)>>,
    connect_calls: AtomicUsize,
    dispose_calls: AtomicUsize,
}

impl MockTransport {
    fn new(events: EventSender, script: Script) -> Self {
        Self {
            events,
            script: Mutex::new(script),
            sent: Mutex::new(Vec::new()),
            connect_calls: AtomicUsize::new(0),
            dispose_calls: AtomicUsize::new(0),
        }
    }

    /// Deliver an event as if it came from the hub.
    pub fn inject(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    /// Invocations that were sent successfully, oldest first.
    pub fn sent(&self) -> Vec<(String, Vec<Value>)> {
        self.sent.lock().clone()
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::Relaxed)
    }

    pub fn dispose_calls(&self) -> usize {
        self.dispose_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl HubTransport for MockTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.connect_calls.fetch_add(1, Ordering::Relaxed);
        let (delay, result) = {
            let mut script = self.script.lock();
            (script.connect_delay, script.connect_results.pop_front())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        result.unwrap_or(Ok(()))
    }

    async fn send(&self, method: &str, arguments: Vec<Value>) -> Result<(), TransportError> {
        let result = self.script.lock().send_results.pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            self.sent.lock().push((method.to_string(), arguments));
        }
        result
    }

    async fn dispose(&self) -> Result<(), TransportError> {
        self.dispose_calls.fetch_add(1, Ordering::Relaxed);
        match self.script.lock().dispose_error.clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Builds [`MockTransport`]s. The script is handed to the first transport
/// created; later ones start unscripted.
#[derive(Default)]
pub struct MockTransportFactory {
    script: Mutex<Option<Script>>,
    latest: Mutex<Option<Arc<MockTransport>>>,
    created: AtomicUsize,
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(Some(Script::default())),
            ..Default::default()
        }
    }

    pub fn with_connect_results(self, results: Vec<Result<(), TransportError>>) -> Self {
        self.edit(|s| s.connect_results = results.into())
    }

    pub fn with_send_results(self, results: Vec<Result<(), TransportError>>) -> Self {
        self.edit(|s| s.send_results = results.into())
    }

    pub fn with_dispose_error(self, error: TransportError) -> Self {
        self.edit(|s| s.dispose_error = Some(error))
    }

    /// Make every `connect()` wait before resolving.
    pub fn with_connect_delay(self, delay: Duration) -> Self {
        self.edit(|s| s.connect_delay = Some(delay))
    }

    /// The most recently created transport.
    pub fn transport(&self) -> Option<Arc<MockTransport>> {
        self.latest.lock().clone()
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    fn edit(self, f: impl FnOnce(&mut Script)) -> Self {
        if let Some(script) = self.script.lock().as_mut() {
            f(script);
        }
        self
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(&self, events: EventSender) -> Arc<dyn HubTransport> {
        self.created.fetch_add(1, Ordering::Relaxed);
        let script = self.script.lock().take().unwrap_or_default();
        let transport = Arc::new(MockTransport::new(events, script));
        *self.latest.lock() = Some(Arc::clone(&transport));
        transport
    }
}
