//! Liminal Handshake Sequence.
//!
//! # Message Flow
//!
//! ```text
//! Client                                         Server
//!   |                                              |
//!   |-------- HELLO (versions, encodings) -------->|
//!   |                                              |  negotiate, reserve nonce
//!   |<------- MIRROR (choice, nonce) --------------|
//!   |                                              |
//!   |-------- BIND (thread, credential) ---------->|
//!   |                                              |  authenticate, sign
//!   |<------- SEAL (session id, signature) --------|
//!   |                                              |
//!   |  verify                                      |
//!   |<============== FLOW (payload) =============>|
//! ```
//!
//! Any failure ends the handshake with an `error` frame (when the transport
//! is still writable) and a close. The only recovery is a fresh Hello on a
//! new connection, and only if no Mirror was seen.
//!
//! # Components
//!
//! | Module        | Role                                           |
//! |---------------|------------------------------------------------|
//! | `frame`       | typed control frames                           |
//! | `codec`       | size-bounded decoding and validation           |
//! | `negotiate`   | server capability choice, client Mirror check  |
//! | `replay`      | nonce issuance and tracking                    |
//! | `trust`       | canonical transcript, sealing, verification    |
//! | `identity`    | Bind credential validation                     |
//! | `machine`     | per-connection state machine                   |
//! | `report`      | terminal error frames                          |
//! | `session`     | frozen post-handshake configuration            |

mod codec;
mod frame;
mod identity;
mod machine;
mod negotiate;
mod replay;
mod report;
mod session;
mod trust;

pub use codec::{validate, FrameCodec, FrameError};
pub use frame::{
    AuthDescriptor, Bind, BindContext, Encoding, ErrorFrame, Feature, FeatureSet, Frame, Hello,
    LriVersion, Mirror, Seal, SessionHints, Step, ThreadId, TrustAttestation,
};
pub use identity::{AllowAll, BindError, IdentityProvider, StaticTokens};
pub use machine::{
    Advance, Handshake, HandshakeTimeouts, Phase, Rejection, ServerContext, RESERVE_GRACE,
};
pub use negotiate::{check_mirror, Negotiated, NegotiationError, ServerSupport};
pub use replay::{
    InMemoryNonceStore, NonceLease, NonceStore, ReplayError, ReplayGuard, ReplaySettings,
};
pub use report::ErrorReporter;
pub use session::{EstablishedSession, Role};
pub use trust::{
    canonical_bytes, KeyMaterial, TrustAlgorithm, TrustError, TrustSealer, TrustVerifier,
    CANONICAL_TAG, MIN_HMAC_KEY_BYTES, TRUST_FEATURE,
};
