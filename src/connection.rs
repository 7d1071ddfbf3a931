//! Async driver for the duplex binding.
//!
//! Pumps frames between a [`ControlTransport`] and a [`Handshake`] until the
//! machine reaches Flow or fails. The driver owns every await point, so it
//! enforces the machine's per-step deadline on each receive and send.
//!
//! Failure handling:
//!
//! - protocol failures are reported to the peer with an `error` frame;
//! - deadline expiry is reported as `lhs.timeout`;
//! - a closed or broken transport is only reported to the caller.

use std::future::Future;

use tokio::time::{timeout_at, Instant};

use crate::error::{LhsError, Result};
use crate::protocol::{Advance, ErrorReporter, EstablishedSession, Frame, FrameCodec, Handshake, Phase};
use crate::transport::ControlTransport;

/// Run `machine` over `transport` until Flow.
///
/// A client machine still in `Idle` sends its Hello first. The codec limit is
/// updated after every step. On return the machine is either Flowing or
/// Rejected; the transport has been closed if it failed.
pub async fn drive<T>(
    machine: &mut Handshake,
    transport: &mut T,
    codec: &mut FrameCodec,
) -> Result<EstablishedSession>
where
    T: ControlTransport + ?Sized,
{
    let reporter = ErrorReporter::new(machine.role());

    if machine.phase() == Phase::Idle {
        let hello = machine.start()?;
        send_frame(machine, transport, codec, &reporter, &hello).await?;
    }

    loop {
        let received = match bounded(machine, transport.recv()).await {
            Some(received) => received,
            None => return Err(expired(machine, transport, codec, &reporter).await),
        };

        let bytes = match received {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                machine.abort();
                return Err(LhsError::TransportClosed);
            },
            Err(e) => {
                machine.abort();
                return Err(e);
            },
        };

        let frame = match codec.decode(&bytes) {
            Ok(frame) => frame,
            Err(e) => {
                let rejection = machine.reject(e.into(), true);
                reporter.report(transport, codec, &rejection).await;
                return Err(rejection.error);
            },
        };

        match machine.advance(frame) {
            Advance::Reply(reply) => {
                send_frame(machine, transport, codec, &reporter, &reply).await?;
                codec.set_limit(machine.frame_limit());
                if machine.phase() == Phase::SentSeal {
                    return machine.enter_flow();
                }
            },
            Advance::Established(session) => return Ok(session),
            Advance::Rejected(rejection) => {
                reporter.report(transport, codec, &rejection).await;
                return Err(rejection.error);
            },
        }
    }
}

/// Await `fut` under the machine's current deadline; `None` on expiry.
async fn bounded<F: Future>(machine: &Handshake, fut: F) -> Option<F::Output> {
    match machine.deadline() {
        Some(deadline) => timeout_at(Instant::from_std(deadline), fut).await.ok(),
        None => Some(fut.await),
    }
}

async fn expired<T>(
    machine: &mut Handshake,
    transport: &mut T,
    codec: &FrameCodec,
    reporter: &ErrorReporter,
) -> LhsError
where
    T: ControlTransport + ?Sized,
{
    let rejection = machine.expire();
    reporter.report(transport, codec, &rejection).await;
    rejection.error
}

async fn send_frame<T>(
    machine: &mut Handshake,
    transport: &mut T,
    codec: &FrameCodec,
    reporter: &ErrorReporter,
    frame: &Frame,
) -> Result<()>
where
    T: ControlTransport + ?Sized,
{
    let bytes = match codec.encode(frame) {
        Ok(bytes) => bytes,
        Err(e) => {
            let rejection = machine.reject(e.into(), true);
            reporter.report(transport, codec, &rejection).await;
            return Err(rejection.error);
        },
    };

    match bounded(machine, transport.send(bytes)).await {
        Some(Ok(())) => Ok(()),
        Some(Err(e)) => {
            machine.abort();
            Err(e)
        },
        None => Err(expired(machine, transport, codec, reporter).await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Arc;

    use crate::error::ErrorCode;
    use crate::protocol::{
        AllowAll, AuthDescriptor, Bind, HandshakeTimeouts, Hello, ReplayGuard, ServerContext,
        ServerSupport, ThreadId, TrustSealer,
    };
    use crate::transport::BoxFuture;

    /// Scripted transport: yields queued inbound frames, records outbound ones.
    #[derive(Default)]
    struct Scripted {
        inbound: VecDeque<Vec<u8>>,
        outbound: Vec<Vec<u8>>,
        closed: bool,
        stall: bool,
    }

    impl ControlTransport for Scripted {
        fn send(&mut self, frame: Vec<u8>) -> BoxFuture<'_, Result<()>> {
            self.outbound.push(frame);
            Box::pin(async { Ok(()) })
        }

        fn recv(&mut self) -> BoxFuture<'_, Result<Option<Vec<u8>>>> {
            let next = self.inbound.pop_front();
            let stall = self.stall && next.is_none();
            Box::pin(async move {
                if stall {
                    std::future::pending::<()>().await;
                }
                Ok(next)
            })
        }

        fn close(&mut self) -> BoxFuture<'_, Result<()>> {
            self.closed = true;
            Box::pin(async { Ok(()) })
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    fn server(timeouts: HandshakeTimeouts) -> (Handshake, Arc<ServerContext>) {
        let ctx = Arc::new(ServerContext::new(
            ServerSupport::default(),
            TrustSealer::generate(),
            Arc::new(AllowAll),
            ReplayGuard::default(),
        ));
        (Handshake::server(Arc::clone(&ctx), timeouts), ctx)
    }

    fn decode_error(bytes: &[u8]) -> ErrorCode {
        match serde_json::from_slice::<Frame>(bytes).unwrap() {
            Frame::Error(e) => e.code,
            other => panic!("expected error frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_server_completes() {
        let (mut machine, _ctx) = server(HandshakeTimeouts::default());
        let mut codec = FrameCodec::new(machine.frame_limit());
        let mut transport = Scripted::default();
        transport
            .inbound
            .push_back(serde_json::to_vec(&Frame::Hello(Hello::default())).unwrap());
        let bind = Bind::new(&ThreadId::generate(), AuthDescriptor::bearer("t"));
        transport
            .inbound
            .push_back(serde_json::to_vec(&Frame::Bind(bind)).unwrap());

        let session = drive(&mut machine, &mut transport, &mut codec).await.unwrap();
        assert_eq!(transport.outbound.len(), 2);
        assert!(!transport.closed);
        assert_eq!(machine.phase(), Phase::Flowing);
        assert_eq!(codec.limit() as u64, session.max_frame_bytes());
    }

    #[tokio::test]
    async fn test_malformed_frame_reported() {
        let (mut machine, _ctx) = server(HandshakeTimeouts::default());
        let mut codec = FrameCodec::new(machine.frame_limit());
        let mut transport = Scripted::default();
        transport.inbound.push_back(b"not json".to_vec());

        let err = drive(&mut machine, &mut transport, &mut codec)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::MalformedFrame);
        assert_eq!(decode_error(&transport.outbound[0]), ErrorCode::MalformedFrame);
        assert!(transport.closed);
    }

    #[tokio::test]
    async fn test_oversized_frame_reported() {
        let (mut machine, _ctx) = server(HandshakeTimeouts::default());
        let mut codec = FrameCodec::new(32);
        let mut transport = Scripted::default();
        transport
            .inbound
            .push_back(serde_json::to_vec(&Frame::Hello(Hello::default())).unwrap());

        let err = drive(&mut machine, &mut transport, &mut codec)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::FrameTooLarge);
        assert_eq!(decode_error(&transport.outbound[0]), ErrorCode::FrameTooLarge);
    }

    #[tokio::test]
    async fn test_transport_loss_sends_nothing() {
        let (mut machine, ctx) = server(HandshakeTimeouts::default());
        let mut codec = FrameCodec::new(machine.frame_limit());
        let mut transport = Scripted::default();
        transport
            .inbound
            .push_back(serde_json::to_vec(&Frame::Hello(Hello::default())).unwrap());

        let err = drive(&mut machine, &mut transport, &mut codec)
            .await
            .unwrap_err();
        assert!(err.is_transport_loss());
        // Only the Mirror went out
        assert_eq!(transport.outbound.len(), 1);
        assert_eq!(ctx.replay().live_count(), 0);
    }

    #[tokio::test]
    async fn test_deadline_reported_as_timeout() {
        let timeouts = HandshakeTimeouts::uniform(std::time::Duration::from_millis(30));
        let (mut machine, ctx) = server(timeouts);
        let mut codec = FrameCodec::new(machine.frame_limit());
        let mut transport = Scripted {
            stall: true,
            ..Scripted::default()
        };
        transport
            .inbound
            .push_back(serde_json::to_vec(&Frame::Hello(Hello::default())).unwrap());

        let err = drive(&mut machine, &mut transport, &mut codec)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Timeout);
        // Mirror, then the timeout report; never a Seal
        assert_eq!(transport.outbound.len(), 2);
        assert_eq!(decode_error(&transport.outbound[1]), ErrorCode::Timeout);
        assert_eq!(ctx.replay().live_count(), 0);
    }
}
