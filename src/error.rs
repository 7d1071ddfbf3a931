//! LHS error types.
//!
//! Every failure during a handshake is terminal for that connection. Component
//! errors (`FrameError`, `NegotiationError`, `BindError`, `TrustError`,
//! `ReplayError`) live next to the component that raises them and are wrapped
//! by [`LhsError`] with `#[source]` preserved, so `anyhow` callers see the full
//! chain.
//!
//! # Wire codes
//!
//! Each error maps to exactly one [`ErrorCode`], the closed set carried in the
//! `code` field of an `error` frame:
//!
//! | Code                              | Raised by                            |
//! |-----------------------------------|--------------------------------------|
//! | `lhs.version_mismatch`            | unsupported major version            |
//! | `lhs.encoding_negotiation_failed` | no shared encoding, inconsistent Mirror |
//! | `lhs.invalid_bind`                | bad thread id or rejected credential |
//! | `lhs.trust_failed`                | signature/nonce/algorithm mismatch   |
//! | `lhs.timeout`                     | step deadline elapsed                |
//! | `lhs.frame_too_large`             | frame over the size limit            |
//! | `lhs.malformed_frame`             | undecodable or invalid frame         |
//! | `lhs.out_of_order`                | frame for the wrong step             |
//! | `lhs.internal`                    | local resource failure               |

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::{BindError, FrameError, NegotiationError, ReplayError, Step, TrustError};

/// Machine-readable error code carried by `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Client offered a major version the server does not speak.
    #[serde(rename = "lhs.version_mismatch")]
    VersionMismatch,
    /// No encoding in common.
    #[serde(rename = "lhs.encoding_negotiation_failed")]
    EncodingNegotiationFailed,
    /// Thread id malformed/missing or credential rejected.
    #[serde(rename = "lhs.invalid_bind")]
    InvalidBind,
    /// Seal signature or nonce did not verify.
    #[serde(rename = "lhs.trust_failed")]
    TrustFailed,
    /// Expected frame did not arrive before the step deadline.
    #[serde(rename = "lhs.timeout")]
    Timeout,
    /// Frame exceeded the active size limit.
    #[serde(rename = "lhs.frame_too_large")]
    FrameTooLarge,
    /// Frame could not be decoded or failed field validation.
    #[serde(rename = "lhs.malformed_frame")]
    MalformedFrame,
    /// Frame step did not match the next expected step.
    #[serde(rename = "lhs.out_of_order")]
    OutOfOrder,
    /// Local failure unrelated to the peer's input.
    #[serde(rename = "lhs.internal")]
    Internal,
}

impl ErrorCode {
    /// All codes, in declaration order.
    pub const ALL: [ErrorCode; 9] = [
        ErrorCode::VersionMismatch,
        ErrorCode::EncodingNegotiationFailed,
        ErrorCode::InvalidBind,
        ErrorCode::TrustFailed,
        ErrorCode::Timeout,
        ErrorCode::FrameTooLarge,
        ErrorCode::MalformedFrame,
        ErrorCode::OutOfOrder,
        ErrorCode::Internal,
    ];

    /// Wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VersionMismatch => "lhs.version_mismatch",
            Self::EncodingNegotiationFailed => "lhs.encoding_negotiation_failed",
            Self::InvalidBind => "lhs.invalid_bind",
            Self::TrustFailed => "lhs.trust_failed",
            Self::Timeout => "lhs.timeout",
            Self::FrameTooLarge => "lhs.frame_too_large",
            Self::MalformedFrame => "lhs.malformed_frame",
            Self::OutOfOrder => "lhs.out_of_order",
            Self::Internal => "lhs.internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|code| code.as_str() == s)
            .ok_or_else(|| format!("Unknown error code: {s}"))
    }
}

/// LHS errors.
#[derive(Error, Debug)]
pub enum LhsError {
    /// Frame failed to decode or validate.
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// Capability negotiation failed.
    #[error("Negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),

    /// Bind payload rejected.
    #[error("Bind rejected: {0}")]
    Bind(#[from] BindError),

    /// Trust commitment did not verify or could not be produced.
    #[error("Trust failed: {0}")]
    Trust(#[from] TrustError),

    /// Nonce store could not issue a nonce.
    #[error("Replay guard: {0}")]
    Replay(#[from] ReplayError),

    /// Frame arrived for a step other than the next expected one.
    #[error("Out-of-order frame: received {got}, expected {}", step_name(.expected))]
    OutOfOrder {
        /// Step the state machine was waiting for.
        expected: Option<Step>,
        /// Step that actually arrived.
        got: Step,
    },

    /// Deadline elapsed while waiting for a step.
    #[error("Timed out waiting for {0}")]
    Timeout(Step),

    /// Peer sent an `error` frame.
    #[error("Peer rejected handshake: {code}: {detail}")]
    PeerRejected {
        /// Code reported by the peer.
        code: ErrorCode,
        /// Peer-supplied detail.
        detail: String,
    },

    /// State machine already reached its terminal state.
    #[error("Handshake already terminated")]
    Terminated,

    /// Flow data requested before the handshake completed.
    #[error("Session not established")]
    NotEstablished,

    /// Transport closed by the peer or the host.
    #[error("Transport closed")]
    TransportClosed,

    /// Transport-level failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn step_name(step: &Option<Step>) -> &'static str {
    step.map_or("nothing", |s| s.as_str())
}

/// Result type alias for LHS operations
pub type Result<T> = std::result::Result<T, LhsError>;

impl LhsError {
    /// Wire code reported to the peer for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Frame(err) => err.code(),
            Self::Negotiation(err) => err.code(),
            Self::Bind(_) => ErrorCode::InvalidBind,
            Self::Trust(_) => ErrorCode::TrustFailed,
            Self::OutOfOrder { .. } => ErrorCode::OutOfOrder,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::PeerRejected { code, .. } => *code,
            Self::Json(_) => ErrorCode::MalformedFrame,
            Self::Replay(_)
            | Self::Terminated
            | Self::NotEstablished
            | Self::TransportClosed
            | Self::Transport(_)
            | Self::Config(_)
            | Self::Io(_) => ErrorCode::Internal,
        }
    }

    /// True when the failure is a lost or broken transport rather than a
    /// protocol decision. Only these failures permit a Hello retry on a new
    /// connection.
    pub fn is_transport_loss(&self) -> bool {
        matches!(
            self,
            Self::TransportClosed | Self::Transport(_) | Self::Io(_)
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for LhsError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;

        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => LhsError::TransportClosed,
            WsError::Io(io) => LhsError::Io(io),
            other => LhsError::Transport(other.to_string()),
        }
    }
}

impl From<toml::de::Error> for LhsError {
    fn from(err: toml::de::Error) -> Self {
        LhsError::Config(err.to_string())
    }
}
