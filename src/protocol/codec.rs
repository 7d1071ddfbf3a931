//! FrameCodec: size-bounded decoding and field validation.
//!
//! The size limit is checked against the raw byte length before any parsing
//! happens. A frame that parses but violates a field rule is malformed; that is
//! distinct from a well-formed frame arriving at the wrong step, which the
//! state machine reports as out-of-order.
//!
//! The header-upgrade binding carries each frame as URL-safe base64 (no
//! padding) of the same JSON; see [`FrameCodec::encode_header`].

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use thiserror::Error;

use super::frame::Frame;
use crate::error::ErrorCode;

/// Frame decode and validation errors.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Frame exceeds the active size limit
    #[error("frame of {size} bytes exceeds limit of {limit}")]
    TooLarge {
        /// Observed size
        size: usize,
        /// Active limit
        limit: usize,
    },

    /// Frame is not a valid control frame
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// Required field empty or absent
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// List field repeats a value
    #[error("duplicate {field}: {value}")]
    Duplicate {
        /// Field name
        field: &'static str,
        /// Repeated value
        value: String,
    },

    /// Field value out of range
    #[error("invalid {field}: {reason}")]
    InvalidValue {
        /// Field name
        field: &'static str,
        /// Reason
        reason: String,
    },

    /// Header value is not valid base64
    #[error("invalid header encoding: {0}")]
    Header(String),
}

impl FrameError {
    /// Wire code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::TooLarge { .. } => ErrorCode::FrameTooLarge,
            _ => ErrorCode::MalformedFrame,
        }
    }
}

/// Encodes and decodes control frames under a size limit.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    limit: usize,
}

impl FrameCodec {
    /// Create a codec with the given byte limit
    pub fn new(limit: u64) -> Self {
        Self {
            limit: clamp_limit(limit),
        }
    }

    /// Active limit
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Replace the limit (after Mirror fixes the effective frame size)
    pub fn set_limit(&mut self, limit: u64) {
        self.limit = clamp_limit(limit);
    }

    /// Serialize a frame
    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>, FrameError> {
        serde_json::to_vec(frame).map_err(|e| FrameError::Malformed(e.to_string()))
    }

    /// Serialize a frame to text
    pub fn encode_text(&self, frame: &Frame) -> Result<String, FrameError> {
        serde_json::to_string(frame).map_err(|e| FrameError::Malformed(e.to_string()))
    }

    /// Parse and validate a frame
    pub fn decode(&self, bytes: &[u8]) -> Result<Frame, FrameError> {
        if bytes.len() > self.limit {
            return Err(FrameError::TooLarge {
                size: bytes.len(),
                limit: self.limit,
            });
        }

        let frame: Frame =
            serde_json::from_slice(bytes).map_err(|e| FrameError::Malformed(e.to_string()))?;
        validate(&frame)?;
        Ok(frame)
    }

    /// Encode a frame as a header value
    pub fn encode_header(&self, frame: &Frame) -> Result<String, FrameError> {
        Ok(URL_SAFE_NO_PAD.encode(self.encode(frame)?))
    }

    /// Decode a header value
    pub fn decode_header(&self, value: &str) -> Result<Frame, FrameError> {
        // base64 expands 3 bytes to 4 chars
        let max_encoded = self.limit.div_ceil(3).saturating_mul(4);
        if value.len() > max_encoded {
            return Err(FrameError::TooLarge {
                size: value.len() / 4 * 3,
                limit: self.limit,
            });
        }

        let bytes = URL_SAFE_NO_PAD
            .decode(value.trim())
            .map_err(|e| FrameError::Header(e.to_string()))?;
        self.decode(&bytes)
    }
}

fn clamp_limit(limit: u64) -> usize {
    usize::try_from(limit).unwrap_or(usize::MAX)
}

/// Field rules the type system does not express.
pub fn validate(frame: &Frame) -> Result<(), FrameError> {
    match frame {
        Frame::Hello(hello) => {
            if hello.lri_version.trim().is_empty() {
                return Err(FrameError::MissingField("lri_version"));
            }
            if hello.encodings.is_empty() {
                return Err(FrameError::MissingField("encodings"));
            }
            for (i, enc) in hello.encodings.iter().enumerate() {
                if hello.encodings[..i].contains(enc) {
                    return Err(FrameError::Duplicate {
                        field: "encodings",
                        value: enc.to_string(),
                    });
                }
            }
            if let Some(feature) = hello.features.first_duplicate() {
                return Err(FrameError::Duplicate {
                    field: "features",
                    value: feature.to_string(),
                });
            }
            if hello.max_frame_bytes == 0 {
                return Err(FrameError::InvalidValue {
                    field: "max_frame_bytes",
                    reason: "must be positive".to_string(),
                });
            }
        },
        Frame::Mirror(mirror) => {
            if mirror.lri_version.trim().is_empty() {
                return Err(FrameError::MissingField("lri_version"));
            }
            if mirror.nonce.is_empty() {
                return Err(FrameError::MissingField("nonce"));
            }
            if let Some(feature) = mirror.features.first_duplicate() {
                return Err(FrameError::Duplicate {
                    field: "features",
                    value: feature.to_string(),
                });
            }
            if mirror.max_frame_bytes == 0 {
                return Err(FrameError::InvalidValue {
                    field: "max_frame_bytes",
                    reason: "must be positive".to_string(),
                });
            }
        },
        Frame::Seal(seal) => {
            if seal.session_id.is_empty() {
                return Err(FrameError::MissingField("session_id"));
            }
            if seal.signature.is_empty() {
                return Err(FrameError::MissingField("signature"));
            }
        },
        Frame::Bind(_) | Frame::Error(_) => {},
    }
    Ok(())
}
