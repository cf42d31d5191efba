//! Hub socket abstraction
//!
//! The bridge talks to a [`BridgeSocket`] so the transport can be swapped
//! out in tests. The production implementation is a tokio-tungstenite
//! WebSocket carrying the bearer token in the connect handshake.

use anyhow::Context;
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// One live hub connection. Text frames carry the JSON protocol.
pub trait BridgeSocket: Send {
    fn send_text(&mut self, text: String) -> BoxFuture<'_, anyhow::Result<()>>;
    /// `None` means the peer closed cleanly.
    fn next_frame(&mut self) -> BoxFuture<'_, Option<anyhow::Result<String>>>;
    fn close(&mut self) -> BoxFuture<'_, ()>;
}

/// Dials the hub and yields a connected socket.
pub trait SocketConnector: Send + Sync {
    fn connect<'a>(
        &'a self,
        url: &'a str,
        token: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<Box<dyn BridgeSocket>>>;
}

/// Production connector: `ws(s)://` via tokio-tungstenite.
pub struct WsConnector;

struct WsSocket {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl SocketConnector for WsConnector {
    fn connect<'a>(
        &'a self,
        url: &'a str,
        token: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<Box<dyn BridgeSocket>>> {
        Box::pin(async move {
            let mut request = url
                .into_client_request()
                .context("building hub websocket request")?;
            let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
                .context("token is not a valid header value")?;
            request.headers_mut().insert(AUTHORIZATION, bearer);

            let (stream, _response) = tokio_tungstenite::connect_async(request)
                .await
                .context("connecting to hub")?;
            Ok(Box::new(WsSocket { inner: stream }) as Box<dyn BridgeSocket>)
        })
    }
}

impl BridgeSocket for WsSocket {
    fn send_text(&mut self, text: String) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.inner
                .send(Message::Text(text))
                .await
                .context("sending frame to hub")
        })
    }

    fn next_frame(&mut self) -> BoxFuture<'_, Option<anyhow::Result<String>>> {
        Box::pin(async move {
            loop {
                match self.inner.next().await {
                    None => return None,
                    Some(Ok(Message::Text(text))) => return Some(Ok(text)),
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => return Some(Ok(text)),
                        Err(_) => {
                            tracing::debug!("dropping non-utf8 binary frame from hub");
                        }
                    },
                    Some(Ok(Message::Close(_))) => return None,
                    // Control frames are handled by the library.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Some(Err(anyhow::anyhow!(e))),
                }
            }
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let _ = self.inner.close(None).await;
        })
    }
}
