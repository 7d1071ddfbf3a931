//! # Liminal Handshake Sequence
//!
//! Ordered, replay-safe session establishment between two LRI peers before
//! any payload flows.
//!
//! ## Protocol Overview
//!
//! A client and a server exchange exactly four control frames. The server
//! commits to the negotiated configuration with a signed Seal that covers
//! the Hello, the Mirror (including a fresh server nonce) and the Bind. The
//! client verifies the Seal before sending any Flow data.
//!
//! ### Architecture
//!
//! ```text
//! Client                                          Server
//!    |                                              |
//!    |------ HELLO (versions, encodings) ---------->|
//!    |<----- MIRROR (choice, nonce) ----------------|
//!    |------ BIND (thread, credential) ------------>|
//!    |<----- SEAL (session id, signature) ----------|
//!    |                                              |
//!    |<============== FLOW (payload) ==============>|
//! ```
//!
//! ### State Machine
//!
//! ```text
//!   Server:  [WaitHello] ──hello──> [SentMirror] ──bind──> [SentSeal] ──written──> [Flowing]
//!   Client:  [Idle] ──start──> [SentHello] ──mirror──> [SentBind] ──seal──> [Flowing]
//!
//!   any state ──error / timeout / bad frame──> [Rejected]
//! ```
//!
//! ### Bindings
//!
//! | Binding   | Hello / Bind              | Mirror / Seal                  |
//! |-----------|---------------------------|--------------------------------|
//! | `duplex`  | WebSocket Text messages   | WebSocket Text messages        |
//! | `upgrade` | `lhs-hello` / `lhs-bind`  | `lhs-mirror` / `lhs-seal` on 101 |
//!
//! ### Error Codes
//!
//! Every failure is terminal for its connection and maps to one code of the
//! closed `lhs.*` set; see [`error::ErrorCode`].
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use lhs::client::HandshakeClient;
//! use lhs::protocol::{AuthDescriptor, Bind, Hello, ThreadId, TrustVerifier};
//! use lhs::transport::Binding;
//!
//! let verifier = TrustVerifier::ed25519_from_hex(SERVER_PUBLIC_KEY)?;
//! let bind = Bind::new(&ThreadId::generate(), AuthDescriptor::bearer("token"));
//! let client = HandshakeClient::new(Hello::default(), bind, verifier);
//!
//! let (session, stream) = client.connect("ws://127.0.0.1:7400/", Binding::Duplex).await?;
//! println!("session {} encoding {}", session.session_id(), session.encoding());
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: frames, negotiation, trust sealing, replay guard, state machine
//! - [`connection`]: async driver pumping frames through a machine
//! - [`transport`]: duplex and header-upgrade bindings
//! - [`server`]: connection accept loop and status router (Axum-based)
//! - [`client`]: dialing and bounded Hello retry
//! - [`config`]: Configuration management
//! - [`error`]: Error types and result aliases

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod server;
pub mod transport;

// Re-exports for convenience
pub use client::{HandshakeClient, RetryPolicy};
pub use config::Config;
pub use error::{ErrorCode, LhsError, Result};
pub use protocol::{
    EstablishedSession, Frame, FrameCodec, Handshake, HandshakeTimeouts, LriVersion,
    ServerContext, ServerSupport, TrustSealer, TrustVerifier,
};
pub use server::{HandshakeServer, ServerConfig};
pub use transport::{Binding, ControlTransport, DuplexTransport, FlowHandler};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// LRI protocol version spoken by default
pub const LRI_VERSION: &str = "0.2";

/// [`LRI_VERSION`] as a typed value
pub const PROTOCOL_VERSION: LriVersion = LriVersion::new(0, 2);

/// Default control frame size limit offered in Hello
pub const DEFAULT_MAX_FRAME_BYTES: u64 = 64 * 1024;
