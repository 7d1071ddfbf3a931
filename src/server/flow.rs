//! Echo payload channel used by `lhs serve`.

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info};

use crate::error::{LhsError, Result};
use crate::protocol::EstablishedSession;
use crate::transport::{BoxFuture, FlowHandler};

/// Echoes every Flow message back until the peer leaves or the Seal expires.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoFlow;

impl FlowHandler for EchoFlow {
    fn handle(
        &self,
        session: EstablishedSession,
        mut stream: WebSocketStream<TcpStream>,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let remaining = (session.expires_at() - Utc::now())
                .to_std()
                .unwrap_or_default();

            let echo = async {
                let mut echoed = 0u64;
                while let Some(message) = stream.next().await {
                    let message = message?;
                    if message.is_close() {
                        break;
                    }
                    if message.is_text() || message.is_binary() {
                        stream.send(message).await?;
                        echoed += 1;
                    }
                }
                Ok::<_, LhsError>(echoed)
            };
            let outcome = tokio::time::timeout(remaining, echo).await;

            match outcome {
                Ok(Ok(echoed)) => {
                    debug!(session_id = %session.session_id(), echoed, "flow ended");
                    Ok(())
                },
                Ok(Err(e)) => Err(e),
                Err(_) => {
                    info!(session_id = %session.session_id(), "session expired");
                    stream.close(None).await.or_else(|e| match e {
                        tokio_tungstenite::tungstenite::Error::ConnectionClosed
                        | tokio_tungstenite::tungstenite::Error::AlreadyClosed => Ok(()),
                        other => Err(LhsError::from(other)),
                    })
                },
            }
        })
    }
}
