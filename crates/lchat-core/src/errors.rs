use std::time::Duration;

/// Failures reported by a hub transport.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TransportError {
    #[error("negotiation failed: {0}")]
    Negotiate(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("websocket error: {0}")]
    WebSocket(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("not connected")]
    NotConnected,
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("connection closed: {0}")]
    Closed(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
}

impl TransportError {
    /// Errors that are worth another connection attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Negotiate(_) | Self::WebSocket(_) | Self::ConnectionLost(_) | Self::Timeout(_)
        )
    }

    /// Short classification string for structured log fields.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Negotiate(_) => "negotiate",
            Self::Handshake(_) => "handshake",
            Self::WebSocket(_) => "websocket",
            Self::Protocol(_) => "protocol",
            Self::NotConnected => "not_connected",
            Self::ConnectionLost(_) => "connection_lost",
            Self::Closed(_) => "closed",
            Self::Timeout(_) => "timeout",
        }
    }
}
