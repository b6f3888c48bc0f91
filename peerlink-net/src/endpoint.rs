use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;

use crate::{Credential, Dialer, FrameSink, FrameSource, SocketError};

pub const DEFAULT_RELAY_DOMAIN: &str = "2gc.ru";
pub const RELAY_PATH: &str = "/v1/connect";

/// Where the relay lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEndpoint {
    url: String,
}

impl RelayEndpoint {
    /// `wss://relay.{region}.{domain}/v1/connect`
    pub fn for_region(region: &str, domain: &str) -> Self {
        Self {
            url: format!("wss://relay.{region}.{domain}{RELAY_PATH}"),
        }
    }

    pub fn from_url(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl std::fmt::Display for RelayEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.url)
    }
}

/// Dials the relay over a websocket, one JSON text message per frame.
pub struct WsDialer {
    endpoint: RelayEndpoint,
    credential: Credential,
    tls: Arc<rustls::ClientConfig>,
    connect_timeout: Duration,
}

impl WsDialer {
    pub fn new(
        endpoint: RelayEndpoint,
        credential: Credential,
        insecure_skip_verify: bool,
        connect_timeout: Duration,
    ) -> Result<Self, SocketError> {
        let tls = crate::tls::client_config(insecure_skip_verify)?;
        Ok(Self {
            endpoint,
            credential,
            tls: Arc::new(tls),
            connect_timeout,
        })
    }

    pub fn endpoint(&self) -> &RelayEndpoint {
        &self.endpoint
    }
}

#[async_trait::async_trait]
impl Dialer for WsDialer {
    #[tracing::instrument(skip(self), fields(url = %self.endpoint))]
    async fn dial(&self) -> Result<(FrameSink, FrameSource), SocketError> {
        let mut request = self.endpoint.url().into_client_request()?;
        let bearer = HeaderValue::from_str(&self.credential.bearer()).map_err(|e| {
            SocketError::Request {
                source: eyre::Error::from(e),
            }
        })?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let connector = tokio_tungstenite::Connector::Rustls(self.tls.clone());
        let (ws, _response) = tokio::time::timeout(
            self.connect_timeout,
            tokio_tungstenite::connect_async_tls_with_config(request, None, false, Some(connector)),
        )
        .await
        .map_err(|_| SocketError::Timeout {
            url: self.endpoint.to_string(),
        })??;

        tracing::info!("Connected to relay");

        let (sink, stream) = ws.split();

        let sink = sink.with(|text: String| {
            futures_util::future::ready(Ok::<_, SocketError>(Message::text(text)))
        });

        let source = stream.filter_map(|message| {
            futures_util::future::ready(match message {
                Ok(Message::Text(text)) => Some(Ok(text.to_string())),
                Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => Some(Ok(text)),
                    Err(_) => {
                        tracing::debug!("Ignoring non UTF-8 binary message from relay");
                        None
                    }
                },
                Ok(Message::Close(frame)) => {
                    tracing::debug!(?frame, "Relay sent close");
                    None
                }
                Ok(_) => None,
                Err(e) => Some(Err(SocketError::from(e))),
            })
        });

        Ok((Box::pin(sink), Box::pin(source)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_endpoint() {
        let endpoint = RelayEndpoint::for_region("eu-central", DEFAULT_RELAY_DOMAIN);
        assert_eq!(endpoint.url(), "wss://relay.eu-central.2gc.ru/v1/connect");
    }

    #[tokio::test]
    async fn test_dial_unreachable_relay_fails() {
        let dialer = WsDialer::new(
            RelayEndpoint::from_url("ws://127.0.0.1:1/v1/connect"),
            Credential::new("token").unwrap(),
            false,
            Duration::from_secs(2),
        )
        .unwrap();

        assert!(dialer.dial().await.is_err());
    }
}
