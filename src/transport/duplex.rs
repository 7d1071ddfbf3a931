//! Native duplex binding over a WebSocket stream.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace};

use super::{BoxFuture, ControlTransport};
use crate::error::{LhsError, Result};

/// One control frame per WebSocket message.
#[derive(Debug)]
pub struct DuplexTransport<S> {
    stream: WebSocketStream<S>,
}

impl<S> DuplexTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an upgraded stream
    pub fn new(stream: WebSocketStream<S>) -> Self {
        Self { stream }
    }

    /// Hand the stream to the payload channel.
    pub fn into_inner(self) -> WebSocketStream<S> {
        self.stream
    }

    /// Borrow the stream
    pub fn get_ref(&self) -> &WebSocketStream<S> {
        &self.stream
    }
}

impl<S> ControlTransport for DuplexTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn send(&mut self, frame: Vec<u8>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let message = match String::from_utf8(frame) {
                Ok(text) => Message::Text(text),
                Err(e) => Message::Binary(e.into_bytes()),
            };
            trace!(len = message.len(), "duplex send");
            self.stream.send(message).await.map_err(LhsError::from)
        })
    }

    fn recv(&mut self) -> BoxFuture<'_, Result<Option<Vec<u8>>>> {
        Box::pin(async move {
            while let Some(message) = self.stream.next().await {
                match message? {
                    Message::Text(text) => return Ok(Some(text.into_bytes())),
                    Message::Binary(bytes) => return Ok(Some(bytes)),
                    Message::Close(frame) => {
                        debug!(?frame, "peer closed duplex channel");
                        return Ok(None);
                    },
                    Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {},
                }
            }
            Ok(None)
        })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            match self.stream.close(None).await {
                Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn name(&self) -> &'static str {
        "duplex"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn pair() -> (
        DuplexTransport<tokio::io::DuplexStream>,
        DuplexTransport<tokio::io::DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(b, Role::Client, None).await;
        (DuplexTransport::new(server), DuplexTransport::new(client))
    }

    #[tokio::test]
    async fn test_frames_in_order() {
        let (mut server, mut client) = pair().await;
        client.send(b"{\"a\":1}".to_vec()).await.unwrap();
        client.send(b"{\"b\":2}".to_vec()).await.unwrap();

        assert_eq!(server.recv().await.unwrap().unwrap(), b"{\"a\":1}");
        assert_eq!(server.recv().await.unwrap().unwrap(), b"{\"b\":2}");
        assert_eq!(server.name(), "duplex");
    }

    #[tokio::test]
    async fn test_close_yields_none() {
        let (mut server, mut client) = pair().await;
        client.close().await.unwrap();
        assert!(server.recv().await.unwrap().is_none());
    }
}
