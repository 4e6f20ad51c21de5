use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::TransportError;

/// Hub method the client invokes to post a chat message.
pub const SEND_METHOD: &str = "SendChat";
/// Hub method the server invokes to deliver a chat message.
pub const RECEIVE_METHOD: &str = "Receive";

/// Inbound traffic and lifecycle notifications raised by a transport.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    /// The hub invoked a client method.
    Invocation {
        target: String,
        arguments: Vec<serde_json::Value>,
    },
    /// The connection dropped and automatic recovery has begun.
    Reconnecting { error: Option<String> },
    /// Automatic recovery succeeded.
    Reconnected,
    /// The connection is gone for good: reconnect attempts were exhausted,
    /// the server refused reconnection, or the transport was stopped.
    Closed { error: Option<String> },
}

impl TransportEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Invocation { .. } => "invocation",
            Self::Reconnecting { .. } => "reconnecting",
            Self::Reconnected => "reconnected",
            Self::Closed { .. } => "closed",
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// A bidirectional real-time connection to a chat hub.
///
/// Reconnection is the transport's job; it reports progress through
/// [`TransportEvent`]s on the channel it was created with.
#[async_trait]
pub trait HubTransport: Send + Sync {
    /// Establish the connection. Returns once the hub is ready for invocations.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Invoke a hub method without waiting for a result.
    async fn send(&self, method: &str, arguments: Vec<serde_json::Value>) -> Result<(), TransportError>;

    /// Stop the connection and release its resources.
    async fn dispose(&self) -> Result<(), TransportError>;
}

/// Builds transports. Handlers are bound once, at construction, by handing
/// the transport the sender it reports events on.
pub trait TransportFactory: Send + Sync {
    fn create(&self, events: EventSender) -> Arc<dyn HubTransport>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_strings() {
        assert_eq!(TransportEvent::Reconnected.event_type(), "reconnected");
        assert_eq!(
            TransportEvent::Closed { error: None }.event_type(),
            "closed"
        );
        assert_eq!(
            TransportEvent::Invocation {
                target: RECEIVE_METHOD.into(),
                arguments: vec![],
            }
            .event_type(),
            "invocation"
        );
    }

    struct NullTransport;

    #[async_trait]
    impl HubTransport for NullTransport {
        async fn connect(&self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn send(&self, _method: &str, _arguments: Vec<serde_json::Value>) -> Result<(), TransportError> {
            Err(TransportError::NotConnected)
        }

        async fn dispose(&self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    struct NullFactory;

    impl TransportFactory for NullFactory {
        fn create(&self, _events: EventSender) -> Arc<dyn HubTransport> {
            Arc::new(NullTransport)
        }
    }

    #[tokio::test]
    async fn factory_builds_usable_transport() {
        let factory: Box<dyn TransportFactory> = Box::new(NullFactory);
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = factory.create(tx);
        assert!(transport.connect().await.is_ok());
        assert!(matches!(
            transport.send(SEND_METHOD, vec![]).await,
            Err(TransportError::NotConnected)
        ));
    }
}
