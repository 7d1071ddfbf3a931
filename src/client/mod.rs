//! LHS client: connection driver with bounded Hello retry.
//!
//! A Hello is retried on a fresh connection only when the transport was lost
//! before any Mirror arrived. Once a Mirror has been seen, or the failure was
//! a protocol error, the attempt is final.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info_span, warn, Instrument};

use crate::config::Config;
use crate::connection::drive;
use crate::error::{LhsError, Result};
use crate::protocol::{
    Bind, EstablishedSession, FrameCodec, Handshake, HandshakeTimeouts, Hello, Step,
    TrustVerifier,
};
use crate::transport::{upgrade, ws_config, Binding, ControlTransport, DuplexTransport};

/// Hello retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total Hello attempts, including the first
    pub max_hello_attempts: u32,
    /// Delay before each retry
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_hello_attempts: 3,
            backoff: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retry
    pub fn none() -> Self {
        Self {
            max_hello_attempts: 1,
            backoff: Duration::ZERO,
        }
    }
}

/// Client-side connection driver
#[derive(Clone)]
pub struct HandshakeClient {
    hello: Hello,
    bind: Bind,
    verifier: Arc<TrustVerifier>,
    timeouts: HandshakeTimeouts,
    retry: RetryPolicy,
}

impl HandshakeClient {
    /// Create a client offering `hello` and binding with `bind`
    pub fn new(hello: Hello, bind: Bind, verifier: TrustVerifier) -> Self {
        Self {
            hello,
            bind,
            verifier: Arc::new(verifier),
            timeouts: HandshakeTimeouts::default(),
            retry: RetryPolicy::default(),
        }
    }

    /// Apply timeouts and retry settings from a loaded [`Config`]
    pub fn with_config(self, config: &Config) -> Self {
        self.with_timeouts(config.handshake_timeouts())
            .with_retry(RetryPolicy {
                max_hello_attempts: config.client.max_hello_attempts,
                backoff: Duration::from_millis(config.client.retry_backoff_ms),
            })
    }

    /// Set step deadlines
    pub fn with_timeouts(mut self, timeouts: HandshakeTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Set retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Hello sent on every attempt
    pub fn hello(&self) -> &Hello {
        &self.hello
    }

    /// Retry policy
    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }

    /// Fresh client machine for one attempt
    pub fn machine(&self) -> Handshake {
        Handshake::client(
            self.hello.clone(),
            self.bind.clone(),
            Arc::clone(&self.verifier),
            self.timeouts,
        )
    }

    /// Run the duplex binding over an already-open control channel.
    pub async fn handshake_duplex<T>(&self, transport: &mut T) -> Result<EstablishedSession>
    where
        T: ControlTransport + ?Sized,
    {
        let mut machine = self.machine();
        let mut codec = FrameCodec::new(machine.frame_limit());
        drive(&mut machine, transport, &mut codec).await
    }

    /// Run the header-upgrade binding over an already-open stream.
    pub async fn handshake_upgrade<S>(
        &self,
        stream: S,
        url: &str,
    ) -> Result<(EstablishedSession, WebSocketStream<S>)>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut machine = self.machine();
        let mut codec = FrameCodec::new(machine.frame_limit());
        upgrade::connect(stream, url, &mut machine, &mut codec).await
    }

    /// Dial `url` and complete the handshake, retrying lost Hellos.
    pub async fn connect(
        &self,
        url: &str,
        binding: Binding,
    ) -> Result<(EstablishedSession, WebSocketStream<TcpStream>)> {
        let span = info_span!("handshake", role = "client", %url, %binding);
        self.connect_with_retry(|_, machine| self.dial(url, binding, machine))
            .instrument(span)
            .await
    }

    /// Run attempts produced by `attempt` under the retry policy.
    ///
    /// Each call gets the 1-based attempt number and a fresh machine, and
    /// hands the machine back with its result so the retry decision can see
    /// whether a Mirror was received.
    pub async fn connect_with_retry<T, F, Fut>(&self, mut attempt: F) -> Result<T>
    where
        F: FnMut(u32, Handshake) -> Fut,
        Fut: Future<Output = (Handshake, Result<T>)>,
    {
        let max = self.retry.max_hello_attempts.max(1);
        let mut number = 1;
        loop {
            let (machine, result) = attempt(number, self.machine()).await;
            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transport_loss() && !machine.has_mirror() && number < max => {
                    warn!(attempt = number, max, error = %e, "transport lost before Mirror, retrying");
                    tokio::time::sleep(self.retry.backoff).await;
                    number += 1;
                },
                Err(e) => {
                    debug!(attempt = number, mirror_seen = machine.has_mirror(), "giving up");
                    return Err(e);
                },
            }
        }
    }

    async fn dial(
        &self,
        url: &str,
        binding: Binding,
        mut machine: Handshake,
    ) -> (Handshake, Result<(EstablishedSession, WebSocketStream<TcpStream>)>) {
        let result = self.dial_once(url, binding, &mut machine).await;
        (machine, result)
    }

    async fn dial_once(
        &self,
        url: &str,
        binding: Binding,
        machine: &mut Handshake,
    ) -> Result<(EstablishedSession, WebSocketStream<TcpStream>)> {
        let stream = open_tcp(url).await?;
        let mut codec = FrameCodec::new(machine.frame_limit());

        match binding {
            Binding::Upgrade => upgrade::connect(stream, url, machine, &mut codec).await,
            Binding::Duplex => {
                let config = Some(ws_config(machine.frame_limit()));
                let upgrade = tokio_tungstenite::client_async_with_config(url, stream, config);
                let ws = match tokio::time::timeout(self.timeouts.mirror, upgrade).await {
                    Ok(Ok((ws, _))) => ws,
                    Ok(Err(e)) => {
                        machine.abort();
                        return Err(e.into());
                    },
                    Err(_) => {
                        machine.abort();
                        return Err(LhsError::Timeout(Step::Mirror));
                    },
                };

                let mut transport = DuplexTransport::new(ws);
                let session = drive(machine, &mut transport, &mut codec).await?;
                Ok((session, transport.into_inner()))
            },
        }
    }
}

/// Open the TCP connection for a `ws://` URL.
async fn open_tcp(url: &str) -> Result<TcpStream> {
    let request = url.into_client_request()?;
    let uri = request.uri();
    match uri.scheme_str() {
        Some("ws") => {},
        Some(other) => {
            return Err(LhsError::Config(format!("unsupported URL scheme: {other}")));
        },
        None => return Err(LhsError::Config(format!("URL has no scheme: {url}"))),
    }
    let host = uri
        .host()
        .ok_or_else(|| LhsError::Config(format!("URL has no host: {url}")))?;
    let port = uri.port_u16().unwrap_or(80);

    let stream = TcpStream::connect((host, port)).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}
