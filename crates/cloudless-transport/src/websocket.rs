//! WebSocket link over `tokio-tungstenite`.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use crate::link::{Connector, InboundFrame, Link};
use crate::{TransportError, TransportResult};

/// Opens `{ws_url}/api/ws/{room_id}?token=...` links.
#[derive(Clone)]
pub struct WsConnector {
    base: Url,
    token: String,
}

impl WsConnector {
    /// Create a connector for a server.
    ///
    /// `http`/`https` base URLs are mapped to `ws`/`wss`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidUrl`] if the URL does not parse or
    /// uses another scheme.
    pub fn new(server_url: &str, token: impl Into<String>) -> TransportResult<Self> {
        let mut base =
            Url::parse(server_url).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
        let scheme = match base.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => return Err(TransportError::InvalidUrl(format!("unsupported scheme {other}"))),
        };
        base.set_scheme(scheme)
            .map_err(|()| TransportError::InvalidUrl(server_url.to_string()))?;
        Ok(Self {
            base,
            token: token.into(),
        })
    }

    /// URL for a room's realtime endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidUrl`] if the base cannot carry a path.
    pub fn room_url(&self, room_id: &str) -> TransportResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| TransportError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(["api", "ws", room_id]);
        url.query_pairs_mut().clear().append_pair("token", &self.token);
        Ok(url)
    }
}

impl std::fmt::Debug for WsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConnector")
            .field("base", &self.base.as_str())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, room_id: &str) -> TransportResult<Box<dyn Link>> {
        let url = self.room_url(room_id)?;
        tracing::debug!(host = ?url.host_str(), room_id, "opening websocket");
        let (stream, response) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        tracing::trace!(status = %response.status(), "websocket upgraded");
        Ok(Box::new(WsLink { stream }))
    }
}

struct WsLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Link for WsLink {
    async fn send_text(&mut self, text: String) -> TransportResult<()> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::Link(e.to_string()))
    }

    async fn recv(&mut self) -> InboundFrame {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return InboundFrame::Text(text),
                Some(Ok(Message::Close(frame))) => {
                    return match frame {
                        Some(frame) => InboundFrame::Closed {
                            code: Some(u16::from(frame.code)),
                            reason: frame.reason.into_owned(),
                        },
                        None => InboundFrame::Closed {
                            code: None,
                            reason: String::new(),
                        },
                    };
                }
                // tungstenite answers pings itself; binary frames are not part of the protocol
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return InboundFrame::Closed {
                        code: None,
                        reason: e.to_string(),
                    };
                }
                None => {
                    return InboundFrame::Closed {
                        code: None,
                        reason: "stream ended".to_string(),
                    };
                }
            }
        }
    }

    async fn close(&mut self, code: u16, reason: &str) -> TransportResult<()> {
        self.stream
            .close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: reason.to_owned().into(),
            }))
            .await
            .map_err(|e| TransportError::Link(e.to_string()))
    }
}
