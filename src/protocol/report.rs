//! ErrorReporter: terminal error frames.

use tracing::{debug, warn};

use super::codec::FrameCodec;
use super::frame::Frame;
use super::machine::Rejection;
use super::session::Role;
use crate::error::{ErrorCode, LhsError};
use crate::transport::ControlTransport;

/// Formats terminal failures for the peer and closes the channel.
#[derive(Debug, Clone, Copy)]
pub struct ErrorReporter {
    role: Role,
}

impl ErrorReporter {
    /// Reporter for one side of a connection
    pub fn new(role: Role) -> Self {
        Self { role }
    }

    /// Error frame describing `error`. Local faults get a generic detail.
    pub fn frame(error: &LhsError) -> Frame {
        let code = error.code();
        let detail = match code {
            ErrorCode::Internal => "internal error".to_string(),
            _ => error.to_string(),
        };
        Frame::error(code, detail)
    }

    /// Log the rejection, tell the peer if asked, then close.
    ///
    /// Write failures are logged and swallowed: the handshake has already
    /// failed and the caller reports the original error.
    pub async fn report<T>(&self, transport: &mut T, codec: &FrameCodec, rejection: &Rejection)
    where
        T: ControlTransport + ?Sized,
    {
        let code = rejection.error.code();
        warn!(
            role = %self.role,
            transport = transport.name(),
            code = %code,
            error = %rejection.error,
            "handshake failed"
        );

        if rejection.notify_peer {
            match codec.encode(&Self::frame(&rejection.error)) {
                Ok(bytes) => {
                    if let Err(e) = transport.send(bytes).await {
                        debug!(error = %e, "could not deliver error frame");
                    }
                },
                Err(e) => debug!(error = %e, "could not encode error frame"),
            }
        }

        if let Err(e) = transport.close().await {
            debug!(error = %e, "close after failure");
        }
    }
}
