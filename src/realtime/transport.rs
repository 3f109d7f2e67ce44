use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

use super::credentials::Credentials;
use super::subscription::Subscription;
use crate::errors::{Result, TransportError};

/// The process-wide push-channel endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    url: Url,
}

impl Endpoint {
    pub fn parse(raw: &str) -> Result<Self> {
        Ok(Self { url: Url::parse(raw)? })
    }

    pub fn new(url: Url) -> Self {
        Self { url }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Connection URL bound to one subscription. The scope travels as
    /// connection metadata, not per message.
    pub fn for_subscription(&self, subscription: &Subscription) -> Url {
        let mut url = self.url.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("viewer", subscription.viewer_id().as_str());
            if let Some(store) = subscription.scope() {
                query.append_pair("store", store.as_str());
            }
        }
        url
    }
}

/// An established push-channel connection carrying text frames.
#[async_trait]
pub trait Transport: Send {
    async fn send_text(&mut self, text: String) -> std::result::Result<(), TransportError>;

    /// Next text frame; `None` once the peer has closed the stream.
    async fn recv_text(&mut self) -> Option<std::result::Result<String, TransportError>>;

    async fn close(&mut self);
}

/// Opens push-channel connections.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(
        &self,
        url: &Url,
        credentials: &Credentials,
    ) -> std::result::Result<Box<dyn Transport>, TransportError>;
}

/// WebSocket [`Connector`] with the bearer token in the handshake.
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(
        &self,
        url: &Url,
        credentials: &Credentials,
    ) -> std::result::Result<Box<dyn Transport>, TransportError> {
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let auth = HeaderValue::from_str(&credentials.authorization_header())
            .map_err(|_| TransportError::AuthFailed)?;
        request.headers_mut().insert(AUTHORIZATION, auth);

        match connect_async(request).await {
            Ok((stream, _response)) => Ok(Box::new(WsTransport { stream })),
            Err(WsError::Http(response)) if matches!(response.status().as_u16(), 401 | 403) => {
                Err(TransportError::AuthFailed)
            }
            Err(err) => Err(TransportError::Connect(err.to_string())),
        }
    }
}

struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send_text(&mut self, text: String) -> std::result::Result<(), TransportError> {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(stream_error)
    }

    async fn recv_text(&mut self) -> Option<std::result::Result<String, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_owned())),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => debug!(len = bytes.len(), "ignoring non-utf8 binary frame"),
                },
                Ok(Message::Close(_)) => return None,
                // ping/pong are answered by tungstenite itself
                Ok(_) => {}
                Err(err) => return Some(Err(stream_error(err))),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

/// Classify a failure on an established stream. Both kinds end the
/// connection; a protocol violation is logged differently from a drop.
fn stream_error(err: WsError) -> TransportError {
    match err {
        WsError::Protocol(violation) => TransportError::Protocol(violation.to_string()),
        other => TransportError::Closed(other.to_string()),
    }
}
