//! Transport bindings for the handshake.
//!
//! Two bindings share one WebSocket stack:
//!
//! - **Duplex**: the socket is upgraded first, then each control frame
//!   travels as one Text message. After Seal every message is a Flow frame.
//! - **Upgrade**: the handshake rides on the HTTP upgrade itself. Hello and
//!   Bind are request headers; Mirror and Seal are headers on the
//!   `101 Switching Protocols` response, which is only sent once the Seal
//!   exists.
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │          Handshake (sans-IO)             │
//! └──────────────────┬───────────────────────┘
//!          ┌─────────┴─────────┐
//!          ▼                   ▼
//! ┌──────────────────┐ ┌──────────────────┐
//! │ DuplexTransport  │ │  upgrade headers │
//! │ (WS messages)    │ │  (HTTP 101)      │
//! └──────────────────┘ └──────────────────┘
//! ```

mod duplex;
pub mod upgrade;

pub use duplex::DuplexTransport;

use std::future::Future;
use std::pin::Pin;

use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::WebSocketStream;

use crate::error::Result;
use crate::protocol::EstablishedSession;

/// Boxed future returned by transport traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Which transport binding carries the handshake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Binding {
    /// One control frame per WebSocket message (default)
    #[default]
    Duplex,
    /// Control frames in HTTP upgrade headers
    Upgrade,
}

impl Binding {
    /// Get descriptive name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Duplex => "duplex",
            Self::Upgrade => "upgrade",
        }
    }
}

impl std::fmt::Display for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for Binding {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "duplex" | "ws" | "native" => Ok(Self::Duplex),
            "upgrade" | "header" | "headers" => Ok(Self::Upgrade),
            _ => Err(format!("Unknown binding: {s}")),
        }
    }
}

/// Message-oriented control channel.
pub trait ControlTransport: Send {
    /// Send one encoded control frame.
    fn send(&mut self, frame: Vec<u8>) -> BoxFuture<'_, Result<()>>;

    /// Receive the next control frame; `None` once the peer closed.
    fn recv(&mut self) -> BoxFuture<'_, Result<Option<Vec<u8>>>>;

    /// Close the channel.
    fn close(&mut self) -> BoxFuture<'_, Result<()>>;

    /// Get the transport name for logging.
    fn name(&self) -> &'static str;
}

/// Post-handshake payload channel.
///
/// Receives the frozen session and the live socket; runs until the peer
/// disconnects or the session ends.
pub trait FlowHandler: Send + Sync {
    /// Serve one established connection.
    fn handle(
        &self,
        session: EstablishedSession,
        stream: WebSocketStream<TcpStream>,
    ) -> BoxFuture<'_, Result<()>>;
}

/// WebSocket limits for a control frame cap.
///
/// Messages slightly above the cap still reach the codec, so the peer gets a
/// `frame_too_large` report instead of a dropped socket.
pub fn ws_config(frame_cap: u64) -> WebSocketConfig {
    let cap = usize::try_from(frame_cap).unwrap_or(usize::MAX);
    let max = cap.saturating_mul(2).max(64 * 1024);
    WebSocketConfig {
        max_message_size: Some(max),
        max_frame_size: Some(max),
        ..WebSocketConfig::default()
    }
}
