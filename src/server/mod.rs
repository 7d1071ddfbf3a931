//! LHS server: connection driver and status surface.
//!
//! [`HandshakeServer`] accepts TCP connections, runs one server-role
//! [`Handshake`] per connection over the configured binding, registers the
//! established session and hands the socket to a [`FlowHandler`].
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use lhs::protocol::{AllowAll, TrustSealer};
//! use lhs::server::{EchoFlow, HandshakeServer, ServerConfig};
//!
//! let server = HandshakeServer::new(
//!     ServerConfig::default().with_port(7400),
//!     TrustSealer::generate(),
//!     Arc::new(AllowAll),
//! );
//! Arc::new(server).run(Arc::new(EchoFlow)).await?;
//! ```

mod config;
mod flow;
mod handlers;
mod state;

pub use config::ServerConfig;
pub use flow::EchoFlow;
pub use handlers::{health_check, status_router};
pub use state::{ServerState, SessionRegistry, SessionSummary};

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout_at, Instant};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, info_span, Instrument};

use crate::connection::drive;
use crate::error::{LhsError, Result};
use crate::protocol::{
    EstablishedSession, FrameCodec, Handshake, IdentityProvider, ReplayGuard, TrustSealer,
};
use crate::transport::{upgrade, ws_config, Binding, DuplexTransport, FlowHandler};

/// Server-side connection driver
pub struct HandshakeServer {
    state: Arc<ServerState>,
}

impl HandshakeServer {
    /// Create a server with an in-memory nonce store
    pub fn new(
        config: ServerConfig,
        sealer: TrustSealer,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self {
            state: Arc::new(ServerState::new(config, sealer, identity)),
        }
    }

    /// Create a server around an existing nonce store
    pub fn with_replay(
        config: ServerConfig,
        sealer: TrustSealer,
        identity: Arc<dyn IdentityProvider>,
        replay: ReplayGuard,
    ) -> Self {
        Self {
            state: Arc::new(ServerState::with_replay(config, sealer, identity, replay)),
        }
    }

    /// Shared state, for the status router
    pub fn state(&self) -> Arc<ServerState> {
        Arc::clone(&self.state)
    }

    fn machine(&self) -> (Handshake, FrameCodec) {
        let machine = Handshake::server(
            Arc::clone(&self.state.context),
            self.state.config.timeouts,
        );
        let codec = FrameCodec::new(machine.frame_limit());
        (machine, codec)
    }

    /// Run the duplex binding on one accepted stream.
    ///
    /// The WebSocket upgrade and the Hello share the Hello deadline.
    pub async fn serve_duplex<S>(&self, stream: S) -> Result<(EstablishedSession, WebSocketStream<S>)>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (mut machine, mut codec) = self.machine();
        let accept = tokio_tungstenite::accept_async_with_config(
            stream,
            Some(ws_config(machine.frame_limit())),
        );

        let ws = match machine.deadline() {
            Some(deadline) => match timeout_at(Instant::from_std(deadline), accept).await {
                Ok(ws) => ws,
                Err(_) => return Err(machine.expire().error),
            },
            None => accept.await,
        };
        let ws = ws.map_err(|e| {
            machine.abort();
            LhsError::from(e)
        })?;

        let mut transport = DuplexTransport::new(ws);
        let session = drive(&mut machine, &mut transport, &mut codec).await?;
        Ok((session, transport.into_inner()))
    }

    /// Run the header-upgrade binding on one accepted stream.
    pub async fn serve_upgrade<S>(&self, stream: S) -> Result<(EstablishedSession, WebSocketStream<S>)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut machine, mut codec) = self.machine();
        upgrade::accept(stream, &mut machine, &mut codec).await
    }

    /// Handshake one TCP connection, then run `handler` for its Flow.
    ///
    /// The session is listed in the registry while the handler runs.
    pub async fn serve_connection(
        &self,
        stream: TcpStream,
        handler: &dyn FlowHandler,
    ) -> Result<()> {
        let (session, ws) = match self.state.config.binding {
            Binding::Duplex => self.serve_duplex(stream).await?,
            Binding::Upgrade => self.serve_upgrade(stream).await?,
        };

        let sessions = &self.state.sessions;
        sessions.insert(&session).await;
        let result = handler.handle(session.clone(), ws).await;
        sessions.remove(session.session_id()).await;
        result
    }

    /// Accept connections forever, one task each.
    pub async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        handler: Arc<dyn FlowHandler>,
    ) -> Result<()> {
        let binding = self.state.config.binding;
        loop {
            let (stream, peer) = listener.accept().await?;
            let server = Arc::clone(&self);
            let handler = Arc::clone(&handler);
            let span = info_span!("handshake", role = "server", %peer, %binding);

            tokio::spawn(
                async move {
                    match server.serve_connection(stream, handler.as_ref()).await {
                        Ok(()) => debug!("connection closed"),
                        Err(e) if e.is_transport_loss() => debug!(error = %e, "peer went away"),
                        // Protocol failures were already logged by the reporter
                        Err(e) => debug!(code = %e.code(), "connection failed"),
                    }
                }
                .instrument(span),
            );
        }
    }

    /// Bind the configured address and serve forever.
    pub async fn run(self: Arc<Self>, handler: Arc<dyn FlowHandler>) -> Result<()> {
        let addr: SocketAddr = self.state.config.addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| LhsError::Transport(format!("Failed to bind {addr}: {e}")))?;
        info!(
            %addr,
            binding = %self.state.config.binding,
            "LHS server listening"
        );
        self.accept_loop(listener, handler).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AllowAll, AuthDescriptor, Bind, HandshakeTimeouts, Hello, ThreadId};
    use tokio_tungstenite::tungstenite::protocol::Role;

    #[tokio::test]
    async fn test_serve_duplex_over_memory_stream() {
        let server = HandshakeServer::new(
            ServerConfig::default(),
            TrustSealer::generate(),
            Arc::new(AllowAll),
        );
        let verifier = Arc::new(server.state().context.sealer().verifier());
        let (a, b) = tokio::io::duplex(64 * 1024);

        let client = tokio::spawn(async move {
            let (ws, _) = tokio_tungstenite::client_async("ws://localhost/", b)
                .await
                .unwrap();
            let mut transport = DuplexTransport::new(ws);
            let bind = Bind::new(&ThreadId::generate(), AuthDescriptor::bearer("t"));
            let mut machine =
                Handshake::client(Hello::default(), bind, verifier, HandshakeTimeouts::default());
            let mut codec = FrameCodec::new(machine.frame_limit());
            drive(&mut machine, &mut transport, &mut codec).await.unwrap()
        });

        let (session, _ws) = server.serve_duplex(a).await.unwrap();
        let client_session = client.await.unwrap();
        assert_eq!(session.session_id(), client_session.session_id());
        assert_eq!(server.state().context.replay().live_count(), 1);
    }

    #[tokio::test]
    async fn test_duplex_accept_times_out() {
        let config = ServerConfig::default()
            .with_timeouts(HandshakeTimeouts::uniform(std::time::Duration::from_millis(20)));
        let server = HandshakeServer::new(config, TrustSealer::generate(), Arc::new(AllowAll));
        let (a, b) = tokio::io::duplex(1024);

        // Raw socket that never sends an upgrade request
        let _idle = WebSocketStream::from_raw_socket(b, Role::Client, None).await;
        let err = server.serve_duplex(a).await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Timeout);
    }
}
