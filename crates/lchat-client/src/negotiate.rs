//! HTTP negotiation that precedes the WebSocket connection.

use lchat_core::TransportError;
use reqwest::Url;
use serde::Deserialize;

const MAX_REDIRECTS: usize = 100;
const NEGOTIATE_VERSION: &str = "1";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiateResponse {
    #[serde(default)]
    pub connection_id: Option<String>,
    #[serde(default)]
    pub connection_token: Option<String>,
    #[serde(default)]
    pub negotiate_version: u32,
    #[serde(default)]
    pub available_transports: Vec<AvailableTransport>,
    /// Redirect to another endpoint.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableTransport {
    pub transport: String,
    #[serde(default)]
    pub transfer_formats: Vec<String>,
}

impl NegotiateResponse {
    pub fn supports_websockets(&self) -> bool {
        self.available_transports.iter().any(|t| {
            t.transport == "WebSockets" && t.transfer_formats.iter().any(|f| f == "Text")
        })
    }

    /// Token identifying the connection in the WebSocket URL.
    pub fn connection_token(&self) -> Option<&str> {
        if self.negotiate_version >= 1 {
            self.connection_token.as_deref()
        } else {
            self.connection_id.as_deref()
        }
    }
}

/// Negotiate with the hub and return the WebSocket URL to connect to.
pub async fn negotiate(http: &reqwest::Client, hub_url: &str) -> Result<Url, TransportError> {
    let mut url = hub_url.to_string();

    for _ in 0..MAX_REDIRECTS {
        let endpoint = negotiate_url(&url)?;
        tracing::debug!(%endpoint, "negotiating");

        let response = http
            .post(endpoint)
            .send()
            .await
            .map_err(|e| TransportError::Negotiate(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Negotiate(format!("unexpected status {status}")));
        }
        let body: NegotiateResponse = response
            .json()
            .await
            .map_err(|e| TransportError::Negotiate(format!("invalid negotiate response: {e}")))?;

        if let Some(error) = body.error {
            return Err(TransportError::Negotiate(error));
        }
        if let Some(redirect) = body.url {
            tracing::debug!(redirect = %redirect, "negotiate redirected");
            url = redirect;
            continue;
        }
        if !body.supports_websockets() {
            return Err(TransportError::Negotiate(
                "hub does not offer the WebSockets text transport".into(),
            ));
        }
        return websocket_url(&url, body.connection_token());
    }

    Err(TransportError::Negotiate("too many negotiate redirects".into()))
}

/// `{hub}/negotiate?negotiateVersion=1`, keeping any existing query.
pub fn negotiate_url(hub_url: &str) -> Result<Url, TransportError> {
    let mut url = parse(hub_url)?;
    url.path_segments_mut()
        .map_err(|_| TransportError::Negotiate(format!("hub url cannot be a base: {hub_url}")))?
        .pop_if_empty()
        .push("negotiate");
    url.query_pairs_mut()
        .append_pair("negotiateVersion", NEGOTIATE_VERSION);
    Ok(url)
}

/// Swap the scheme to ws/wss and append the connection token as `id`.
pub fn websocket_url(hub_url: &str, connection_token: Option<&str>) -> Result<Url, TransportError> {
    let mut url = parse(hub_url)?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(TransportError::Negotiate(format!("unsupported scheme: {other}")));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| TransportError::Negotiate(format!("cannot use scheme {scheme} for {hub_url}")))?;
    if let Some(token) = connection_token {
        url.query_pairs_mut().append_pair("id", token);
    }
    Ok(url)
}

fn parse(raw: &str) -> Result<Url, TransportError> {
    Url::parse(raw).map_err(|e| TransportError::Negotiate(format!("invalid hub url {raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiate_url_appends_segment_and_version() {
        let url = negotiate_url("https://localhost:32768/Chat").unwrap();
        assert_eq!(url.as_str(), "https://localhost:32768/Chat/negotiate?negotiateVersion=1");

        let url = negotiate_url("http://host/Chat/").unwrap();
        assert_eq!(url.as_str(), "http://host/Chat/negotiate?negotiateVersion=1");
    }

    #[test]
    fn negotiate_url_keeps_query() {
        let url = negotiate_url("http://host/Chat?room=1").unwrap();
        assert_eq!(url.as_str(), "http://host/Chat/negotiate?room=1&negotiateVersion=1");
    }

    #[test]
    fn websocket_url_swaps_scheme() {
        let url = websocket_url("https://localhost:32768/Chat", Some("abc")).unwrap();
        assert_eq!(url.as_str(), "wss://localhost:32768/Chat?id=abc");

        let url = websocket_url("http://127.0.0.1:5000/Chat", None).unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:5000/Chat");
    }

    #[test]
    fn websocket_url_rejects_other_schemes() {
        let err = websocket_url("ftp://host/Chat", None).unwrap_err();
        assert!(matches!(err, TransportError::Negotiate(ref m) if m.contains("ftp")));
    }

    #[test]
    fn invalid_url_is_negotiate_error() {
        assert!(matches!(negotiate_url("not a url"), Err(TransportError::Negotiate(_))));
    }

    #[test]
    fn response_token_depends_on_version() {
        let v1: NegotiateResponse = serde_json::from_str(
            r#"{"connectionId":"cid","connectionToken":"tok","negotiateVersion":1,
                "availableTransports":[{"transport":"WebSockets","transferFormats":["Text","Binary"]}]}"#,
        )
        .unwrap();
        assert_eq!(v1.connection_token(), Some("tok"));
        assert!(v1.supports_websockets());

        let v0: NegotiateResponse = serde_json::from_str(
            r#"{"connectionId":"cid","availableTransports":[{"transport":"LongPolling","transferFormats":["Text"]}]}"#,
        )
        .unwrap();
        assert_eq!(v0.connection_token(), Some("cid"));
        assert!(!v0.supports_websockets());
    }
}
