//! Trust sealing and verification.
//!
//! The Seal signature commits to the whole negotiation transcript. It is
//! computed over canonical bytes built from the decoded Hello, Mirror and
//! Bind plus the server nonce, never over raw transport bytes, so both
//! bindings produce identical commitments.
//!
//! # Canonical layout (`lhs-seal-v1`)
//!
//! ```text
//! "lhs-seal-v1" 0x00
//! hello:  field(lri_version) count(encodings) field(e)* count(features) field(f)*
//!         u64be(max_frame_bytes) opt(session.kind) opt(session.locale) opt(client_id)
//! mirror: field(lri_version) field(encoding) count(features) field(f)*
//!         u64be(max_frame_bytes) field(nonce) opt(server_id)
//! bind:   field(thread) field(auth.scheme) field(auth.token)
//!         opt(context.intent) opt(json(context.affect))
//! field(nonce)
//!
//! field(x) = u32be(len) || x    count(n) = u32be(n)
//! opt(None) = 0x00              opt(Some(x)) = 0x01 || field(x)
//! ```
//!
//! The tag is bound to the `ltp` feature; any layout change needs a new tag.
//!
//! # Algorithms
//!
//! | Name          | Key                  | Use                              |
//! |---------------|----------------------|----------------------------------|
//! | `ed25519`     | server signing key   | default; clients hold public key |
//! | `hmac-sha256` | shared master secret | same-owner deployments           |

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroize;

use super::frame::{Bind, Feature, Hello, Mirror, Seal, TrustAttestation};

type HmacSha256 = Hmac<Sha256>;

/// Domain-separation tag of the canonical layout
pub const CANONICAL_TAG: &str = "lhs-seal-v1";

/// Feature under which the Seal attestation is published
pub const TRUST_FEATURE: Feature = Feature::Ltp;

/// Minimum shared secret length for `hmac-sha256`
pub const MIN_HMAC_KEY_BYTES: usize = 16;

/// Trust failures, all reported as `lhs.trust_failed`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TrustError {
    /// Seal lacks the trust feature attestation
    #[error("seal carries no {0} attestation")]
    MissingAttestation(Feature),

    /// Attested algorithm unknown or not accepted
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Attested nonce differs from the Mirror nonce
    #[error("attested nonce does not match mirror nonce")]
    NonceMismatch,

    /// Signature not decodable
    #[error("signature encoding: {0}")]
    SignatureEncoding(String),

    /// Signature does not verify
    #[error("signature verification failed")]
    BadSignature,

    /// Key material unusable
    #[error("invalid key: {0}")]
    Key(String),

    /// Trust feature absent from the negotiated set
    #[error("trust feature {0} not negotiated")]
    NotNegotiated(Feature),
}

/// Signature algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TrustAlgorithm {
    /// Ed25519 signatures
    #[default]
    #[serde(rename = "ed25519")]
    Ed25519,
    /// HMAC-SHA256 tags
    #[serde(rename = "hmac-sha256")]
    HmacSha256,
}

impl TrustAlgorithm {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ed25519 => "ed25519",
            Self::HmacSha256 => "hmac-sha256",
        }
    }
}

impl fmt::Display for TrustAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrustAlgorithm {
    type Err = TrustError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ed25519" => Ok(Self::Ed25519),
            "hmac-sha256" => Ok(Self::HmacSha256),
            other => Err(TrustError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// Secret bytes; redacted in `Debug` and zeroed on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    bytes: Vec<u8>,
}

impl KeyMaterial {
    /// Wrap raw bytes
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Parse a hex string
    pub fn from_hex(hex_str: &str) -> Result<Self, TrustError> {
        hex::decode(hex_str.trim())
            .map(Self::new)
            .map_err(|e| TrustError::Key(e.to_string()))
    }

    /// Fresh random secret
    pub fn generate(len: usize) -> Self {
        let mut bytes = vec![0u8; len];
        OsRng.fill_bytes(&mut bytes);
        Self::new(bytes)
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyMaterial([REDACTED, {} bytes])", self.bytes.len())
    }
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

/// Build the canonical transcript bytes.
pub fn canonical_bytes(hello: &Hello, mirror: &Mirror, bind: &Bind, nonce: &str) -> Vec<u8> {
    let mut out = CanonicalWriter::default();
    out.raw(CANONICAL_TAG.as_bytes());
    out.raw(&[0]);

    out.field(&hello.lri_version);
    out.count(hello.encodings.len());
    for encoding in &hello.encodings {
        out.field(encoding.as_str());
    }
    out.count(hello.features.len());
    for feature in hello.features.iter() {
        out.field(feature.as_str());
    }
    out.u64(hello.max_frame_bytes);
    let session = hello.session.as_ref();
    out.opt(session.and_then(|s| s.kind.as_deref()));
    out.opt(session.and_then(|s| s.locale.as_deref()));
    out.opt(hello.client_id.as_deref());

    out.field(&mirror.lri_version);
    out.field(mirror.encoding.as_str());
    out.count(mirror.features.len());
    for feature in mirror.features.iter() {
        out.field(feature.as_str());
    }
    out.u64(mirror.max_frame_bytes);
    out.field(&mirror.nonce);
    out.opt(mirror.server_id.as_deref());

    out.field(&bind.thread);
    let auth = bind.auth.as_ref();
    out.field(auth.map_or("", |a| a.scheme.as_str()));
    out.field(auth.map_or("", |a| a.token.as_str()));
    let context = bind.context.as_ref();
    out.opt(context.and_then(|c| c.intent.as_deref()));
    // serde_json maps are BTreeMap-backed, so keys serialize sorted. Floats
    // survive the wire bit-for-bit under the `float_roundtrip` feature.
    let affect = context
        .and_then(|c| c.affect.as_ref())
        .map(ToString::to_string);
    out.opt(affect.as_deref());

    out.field(nonce);
    out.finish()
}

#[derive(Default)]
struct CanonicalWriter {
    buf: Vec<u8>,
}

impl CanonicalWriter {
    fn raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn count(&mut self, n: usize) {
        // Lengths are bounded by the frame limit, far below u32::MAX.
        let n = u32::try_from(n).unwrap_or(u32::MAX);
        self.raw(&n.to_be_bytes());
    }

    fn field(&mut self, value: &str) {
        self.count(value.len());
        self.raw(value.as_bytes());
    }

    fn u64(&mut self, n: u64) {
        self.raw(&n.to_be_bytes());
    }

    fn opt(&mut self, value: Option<&str>) {
        match value {
            Some(v) => {
                self.raw(&[1]);
                self.field(v);
            },
            None => self.raw(&[0]),
        }
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

enum SealerKey {
    Ed25519(SigningKey),
    Hmac(KeyMaterial),
}

/// Produces Seal frames on the server.
pub struct TrustSealer {
    key: SealerKey,
}

impl TrustSealer {
    /// Sign with an Ed25519 key
    pub fn ed25519(key: SigningKey) -> Self {
        Self {
            key: SealerKey::Ed25519(key),
        }
    }

    /// Sign with an Ed25519 key derived from a 32-byte hex seed
    pub fn ed25519_from_hex(seed_hex: &str) -> Result<Self, TrustError> {
        let seed = KeyMaterial::from_hex(seed_hex)?;
        let seed: [u8; 32] = seed
            .as_bytes()
            .try_into()
            .map_err(|_| TrustError::Key(format!("ed25519 seed must be 32 bytes, got {}", seed.len())))?;
        Ok(Self::ed25519(SigningKey::from_bytes(&seed)))
    }

    /// Fresh random Ed25519 key
    pub fn generate() -> Self {
        Self::ed25519(SigningKey::generate(&mut OsRng))
    }

    /// Tag with a shared HMAC secret
    pub fn hmac(key: KeyMaterial) -> Result<Self, TrustError> {
        if key.len() < MIN_HMAC_KEY_BYTES {
            return Err(TrustError::Key(format!(
                "hmac key too short: {} bytes (minimum {MIN_HMAC_KEY_BYTES})",
                key.len()
            )));
        }
        Ok(Self {
            key: SealerKey::Hmac(key),
        })
    }

    /// Algorithm in use
    pub fn algorithm(&self) -> TrustAlgorithm {
        match self.key {
            SealerKey::Ed25519(_) => TrustAlgorithm::Ed25519,
            SealerKey::Hmac(_) => TrustAlgorithm::HmacSha256,
        }
    }

    /// Hex public key, for Ed25519 sealers
    pub fn public_key_hex(&self) -> Option<String> {
        match &self.key {
            SealerKey::Ed25519(key) => Some(hex::encode(key.verifying_key().to_bytes())),
            SealerKey::Hmac(_) => None,
        }
    }

    /// Verifier matching this sealer
    pub fn verifier(&self) -> TrustVerifier {
        match &self.key {
            SealerKey::Ed25519(key) => TrustVerifier::ed25519(key.verifying_key()),
            SealerKey::Hmac(key) => TrustVerifier::new().with_hmac(key.clone()),
        }
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, TrustError> {
        match &self.key {
            SealerKey::Ed25519(key) => Ok(key.sign(message).to_bytes().to_vec()),
            SealerKey::Hmac(key) => {
                let mut mac = HmacSha256::new_from_slice(key.as_bytes())
                    .map_err(|e| TrustError::Key(e.to_string()))?;
                mac.update(message);
                Ok(mac.finalize().into_bytes().to_vec())
            },
        }
    }

    /// Commit to a transcript.
    pub fn seal(
        &self,
        hello: &Hello,
        mirror: &Mirror,
        bind: &Bind,
        session_id: String,
        expires_at: DateTime<Utc>,
    ) -> Result<Seal, TrustError> {
        let message = canonical_bytes(hello, mirror, bind, &mirror.nonce);
        let signature = STANDARD.encode(self.sign(&message)?);

        let mut features = BTreeMap::new();
        features.insert(
            TRUST_FEATURE.as_str().to_string(),
            TrustAttestation {
                alg: self.algorithm().as_str().to_string(),
                nonce: mirror.nonce.clone(),
            },
        );

        Ok(Seal {
            session_id,
            expires_at,
            signature,
            features,
        })
    }
}

impl fmt::Debug for TrustSealer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustSealer")
            .field("algorithm", &self.algorithm())
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

#[derive(Clone)]
enum VerifierKey {
    Ed25519(VerifyingKey),
    Hmac(KeyMaterial),
}

/// Checks Seal frames on the client.
#[derive(Clone, Default)]
pub struct TrustVerifier {
    keys: HashMap<TrustAlgorithm, VerifierKey>,
}

impl TrustVerifier {
    /// Verifier accepting nothing
    pub fn new() -> Self {
        Self::default()
    }

    /// Verifier accepting one Ed25519 key
    pub fn ed25519(key: VerifyingKey) -> Self {
        Self::new().with_ed25519(key)
    }

    /// Verifier for a hex-encoded Ed25519 public key
    pub fn ed25519_from_hex(public_hex: &str) -> Result<Self, TrustError> {
        let bytes = hex::decode(public_hex.trim()).map_err(|e| TrustError::Key(e.to_string()))?;
        let bytes: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| TrustError::Key(format!("ed25519 public key must be 32 bytes, got {}", bytes.len())))?;
        let key = VerifyingKey::from_bytes(&bytes).map_err(|e| TrustError::Key(e.to_string()))?;
        Ok(Self::ed25519(key))
    }

    /// Accept an Ed25519 key
    pub fn with_ed25519(mut self, key: VerifyingKey) -> Self {
        self.keys
            .insert(TrustAlgorithm::Ed25519, VerifierKey::Ed25519(key));
        self
    }

    /// Accept an HMAC shared secret
    pub fn with_hmac(mut self, key: KeyMaterial) -> Self {
        self.keys
            .insert(TrustAlgorithm::HmacSha256, VerifierKey::Hmac(key));
        self
    }

    /// Check whether an algorithm is accepted
    pub fn accepts(&self, algorithm: TrustAlgorithm) -> bool {
        self.keys.contains_key(&algorithm)
    }

    /// Verify a Seal against the transcript this side saw.
    pub fn verify(
        &self,
        hello: &Hello,
        mirror: &Mirror,
        bind: &Bind,
        seal: &Seal,
    ) -> Result<(), TrustError> {
        let attestation = seal
            .features
            .get(TRUST_FEATURE.as_str())
            .ok_or(TrustError::MissingAttestation(TRUST_FEATURE))?;

        let algorithm: TrustAlgorithm = attestation.alg.parse()?;
        let key = self
            .keys
            .get(&algorithm)
            .ok_or_else(|| TrustError::UnsupportedAlgorithm(attestation.alg.clone()))?;

        if attestation.nonce != mirror.nonce {
            return Err(TrustError::NonceMismatch);
        }

        let signature = STANDARD
            .decode(seal.signature.trim())
            .map_err(|e| TrustError::SignatureEncoding(e.to_string()))?;
        let message = canonical_bytes(hello, mirror, bind, &attestation.nonce);

        match key {
            VerifierKey::Ed25519(key) => {
                let signature = Signature::from_slice(&signature)
                    .map_err(|e| TrustError::SignatureEncoding(e.to_string()))?;
                key.verify_strict(&message, &signature)
                    .map_err(|_| TrustError::BadSignature)
            },
            VerifierKey::Hmac(key) => {
                let mut mac = HmacSha256::new_from_slice(key.as_bytes())
                    .map_err(|e| TrustError::Key(e.to_string()))?;
                mac.update(&message);
                mac.verify_slice(&signature)
                    .map_err(|_| TrustError::BadSignature)
            },
        }
    }
}

impl fmt::Debug for TrustVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustVerifier")
            .field("algorithms", &self.keys.keys().collect::<Vec<_>>())
            .finish()
    }
}
