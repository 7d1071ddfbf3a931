//! Negotiated session handed to the payload channel.
//!
//! Once a handshake reaches Flow the negotiated configuration is frozen:
//! [`EstablishedSession`] exposes it read-only.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::frame::{Encoding, Feature, FeatureSet, Mirror, Seal};

/// Which side of the handshake a machine plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Sends Hello and Bind
    Client,
    /// Sends Mirror and Seal
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => f.write_str("client"),
            Self::Server => f.write_str("server"),
        }
    }
}

/// Immutable result of a completed handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EstablishedSession {
    session_id: String,
    role: Role,
    lri_version: String,
    encoding: Encoding,
    features: FeatureSet,
    max_frame_bytes: u64,
    thread: String,
    nonce: String,
    expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    server_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_id: Option<String>,
}

impl EstablishedSession {
    pub(crate) fn new(
        role: Role,
        mirror: &Mirror,
        seal: &Seal,
        thread: &str,
        client_id: Option<String>,
    ) -> Self {
        Self {
            session_id: seal.session_id.clone(),
            role,
            lri_version: mirror.lri_version.clone(),
            encoding: mirror.encoding,
            features: mirror.features.clone(),
            max_frame_bytes: mirror.max_frame_bytes,
            thread: thread.to_string(),
            nonce: mirror.nonce.clone(),
            expires_at: seal.expires_at,
            server_id: mirror.server_id.clone(),
            client_id,
        }
    }

    /// Server-assigned session id
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Local role
    pub fn role(&self) -> Role {
        self.role
    }

    /// Negotiated version
    pub fn lri_version(&self) -> &str {
        &self.lri_version
    }

    /// Payload encoding
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Enabled features
    pub fn features(&self) -> &FeatureSet {
        &self.features
    }

    /// Check if a feature is enabled
    pub fn has_feature(&self, feature: Feature) -> bool {
        self.features.contains(feature)
    }

    /// Effective frame limit for payload frames
    pub fn max_frame_bytes(&self) -> u64 {
        self.max_frame_bytes
    }

    /// Bound thread id
    pub fn thread(&self) -> &str {
        &self.thread
    }

    /// Sealed server nonce
    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    /// Seal expiry
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Check the Seal expiry against `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Server identifier from Mirror
    pub fn server_id(&self) -> Option<&str> {
        self.server_id.as_deref()
    }

    /// Client identifier from Hello
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }
}
