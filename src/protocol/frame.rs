//! Typed LHS control frames.
//!
//! Every control frame is a JSON object tagged by its `step`:
//!
//! ```json
//! {"step":"hello","lri_version":"0.2","encodings":["json","cbor"],"features":["ltp","lss"],"max_frame_bytes":65536}
//! {"step":"mirror","lri_version":"0.2","encoding":"json","features":["ltp"],"max_frame_bytes":65536,"nonce":"..."}
//! {"step":"bind","thread":"01J...","auth":{"scheme":"bearer","token":"..."}}
//! {"step":"seal","session_id":"...","expires_at":"...","signature":"...","features":{"ltp":{"alg":"ed25519","nonce":"..."}}}
//! {"step":"error","code":"lhs.trust_failed","detail":"..."}
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::identity::BindError;
use crate::error::ErrorCode;

lazy_static! {
    /// Crockford base32 ULID, either case: 26 chars, first char bounds the
    /// 48-bit timestamp.
    static ref ULID_PATTERN: Regex = Regex::new(r"(?i)^[0-7][0-9A-HJKMNP-TV-Z]{25}$").unwrap();
}

/// Handshake step, in protocol order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    /// Client opens with its offer
    Hello,
    /// Server answers with the authoritative choice
    Mirror,
    /// Client binds thread and credentials
    Bind,
    /// Server commits to the transcript
    Seal,
    /// Terminal error report
    Error,
}

impl Step {
    /// Wire name of the step.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hello => "hello",
            Self::Mirror => "mirror",
            Self::Bind => "bind",
            Self::Seal => "seal",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol version `major.minor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LriVersion {
    /// Major version; peers must agree on it
    pub major: u32,
    /// Minor version; the lower of the two peers wins
    pub minor: u32,
}

impl LriVersion {
    /// Create a version
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for LriVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for LriVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = s
            .split_once('.')
            .ok_or_else(|| format!("Invalid LRI version: {s}"))?;
        let major = major
            .parse()
            .map_err(|_| format!("Invalid LRI major version: {s}"))?;
        let minor = minor
            .parse()
            .map_err(|_| format!("Invalid LRI minor version: {s}"))?;
        Ok(Self { major, minor })
    }
}

impl Serialize for LriVersion {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for LriVersion {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Payload encoding used after the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// JSON text frames
    Json,
    /// CBOR binary frames
    Cbor,
}

impl Encoding {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Cbor => "cbor",
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Encoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "cbor" => Ok(Self::Cbor),
            _ => Err(format!("Unknown encoding: {s}")),
        }
    }
}

/// Optional protocol feature.
///
/// The vocabulary is closed and versioned with the protocol major; a name
/// outside it makes the carrying frame malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feature {
    /// Liminal trust protocol: the Seal signature
    Ltp,
    /// Liminal session state carried by the payload channel
    Lss,
}

impl Feature {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ltp => "ltp",
            Self::Lss => "lss",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Feature {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ltp" => Ok(Self::Ltp),
            "lss" => Ok(Self::Lss),
            _ => Err(format!("Unknown feature: {s}")),
        }
    }
}

/// Ordered feature list as declared by its sender.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureSet(Vec<Feature>);

impl FeatureSet {
    /// Empty set
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Check membership
    pub fn contains(&self, feature: Feature) -> bool {
        self.0.contains(&feature)
    }

    /// Features present in both sets, in `self` order.
    pub fn intersect(&self, other: &FeatureSet) -> FeatureSet {
        self.0
            .iter()
            .copied()
            .filter(|f| other.contains(*f))
            .collect()
    }

    /// True when every feature here is also in `other`.
    pub fn is_subset_of(&self, other: &FeatureSet) -> bool {
        self.0.iter().all(|f| other.contains(*f))
    }

    /// First feature listed more than once, if any.
    pub fn first_duplicate(&self) -> Option<Feature> {
        self.0
            .iter()
            .enumerate()
            .find(|(i, f)| self.0[..*i].contains(f))
            .map(|(_, f)| *f)
    }

    /// Iterate in declared order
    pub fn iter(&self) -> impl Iterator<Item = Feature> + '_ {
        self.0.iter().copied()
    }

    /// Number of features
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Feature> for FeatureSet {
    fn from_iter<I: IntoIterator<Item = Feature>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<Vec<Feature>> for FeatureSet {
    fn from(features: Vec<Feature>) -> Self {
        Self(features)
    }
}

/// Validated conversation thread identifier (UUID or ULID).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ThreadId(String);

impl ThreadId {
    /// Validate a raw thread id.
    pub fn parse(raw: &str) -> Result<Self, BindError> {
        if raw.is_empty() {
            return Err(BindError::MissingThread);
        }
        if Uuid::try_parse(raw).is_ok() || ULID_PATTERN.is_match(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(BindError::InvalidThread(raw.to_string()))
        }
    }

    /// Fresh random thread id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the id as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Session hints; opaque to the handshake core.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHints {
    /// Session kind (e.g. "chat")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Preferred locale
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
}

/// Step 1: client offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    /// Protocol version string as sent
    pub lri_version: String,
    /// Encodings in preference order
    pub encodings: Vec<Encoding>,
    /// Requested features
    #[serde(default)]
    pub features: FeatureSet,
    /// Largest frame the client is willing to handle
    pub max_frame_bytes: u64,
    /// Optional session hints
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionHints>,
    /// Informational client identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl Hello {
    /// Create a Hello with the crate's protocol version
    pub fn new(encodings: Vec<Encoding>, features: FeatureSet, max_frame_bytes: u64) -> Self {
        Self {
            lri_version: crate::LRI_VERSION.to_string(),
            encodings,
            features,
            max_frame_bytes,
            session: None,
            client_id: None,
        }
    }

    /// Override the advertised version
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.lri_version = version.into();
        self
    }

    /// Attach session hints
    pub fn with_session(mut self, session: SessionHints) -> Self {
        self.session = Some(session);
        self
    }

    /// Attach a client identifier
    pub fn with_client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = Some(id.into());
        self
    }
}

impl Default for Hello {
    fn default() -> Self {
        Self::new(
            vec![Encoding::Json, Encoding::Cbor],
            FeatureSet::from(vec![Feature::Ltp, Feature::Lss]),
            crate::DEFAULT_MAX_FRAME_BYTES,
        )
    }
}

/// Step 2: server's authoritative answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mirror {
    /// Chosen version
    pub lri_version: String,
    /// Chosen encoding
    pub encoding: Encoding,
    /// Enabled features
    #[serde(default)]
    pub features: FeatureSet,
    /// Effective frame limit
    pub max_frame_bytes: u64,
    /// Server nonce the Seal must attest
    pub nonce: String,
    /// Informational server identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
}

/// Credential presented at Bind.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthDescriptor {
    /// Credential scheme (e.g. "bearer")
    pub scheme: String,
    /// Credential value
    pub token: String,
}

impl AuthDescriptor {
    /// Create a descriptor
    pub fn new(scheme: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            token: token.into(),
        }
    }

    /// Bearer token descriptor
    pub fn bearer(token: impl Into<String>) -> Self {
        Self::new("bearer", token)
    }
}

impl fmt::Debug for AuthDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthDescriptor")
            .field("scheme", &self.scheme)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

/// Opaque context seed carried by Bind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BindContext {
    /// Free-form intent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    /// Arbitrary affect payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affect: Option<serde_json::Value>,
}

/// Step 3: thread binding.
///
/// `thread` and `auth` are lenient on the wire; their absence is a bind
/// failure rather than a malformed frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bind {
    /// Raw thread identifier
    #[serde(default)]
    pub thread: String,
    /// Credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthDescriptor>,
    /// Optional context seed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<BindContext>,
}

impl Bind {
    /// Create a Bind for a thread and credential
    pub fn new(thread: &ThreadId, auth: AuthDescriptor) -> Self {
        Self {
            thread: thread.as_str().to_string(),
            auth: Some(auth),
            context: None,
        }
    }

    /// Attach a context seed
    pub fn with_context(mut self, context: BindContext) -> Self {
        self.context = Some(context);
        self
    }
}

/// Algorithm and nonce attested by a Seal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustAttestation {
    /// Signature algorithm name
    pub alg: String,
    /// Nonce the signature covers
    pub nonce: String,
}

/// Step 4: trust commitment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seal {
    /// Server-assigned session id
    pub session_id: String,
    /// Commitment expiry
    pub expires_at: DateTime<Utc>,
    /// Base64 signature over the canonical transcript
    pub signature: String,
    /// Attestations keyed by trust feature name
    #[serde(default)]
    pub features: BTreeMap<String, TrustAttestation>,
}

/// Terminal error report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
    /// Machine-readable code
    pub code: ErrorCode,
    /// Human-readable detail
    #[serde(default)]
    pub detail: String,
}

/// Any control frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "lowercase")]
pub enum Frame {
    /// Step 1
    Hello(Hello),
    /// Step 2
    Mirror(Mirror),
    /// Step 3
    Bind(Bind),
    /// Step 4
    Seal(Seal),
    /// Terminal error
    Error(ErrorFrame),
}

impl Frame {
    /// Step tag of this frame
    pub fn step(&self) -> Step {
        match self {
            Self::Hello(_) => Step::Hello,
            Self::Mirror(_) => Step::Mirror,
            Self::Bind(_) => Step::Bind,
            Self::Seal(_) => Step::Seal,
            Self::Error(_) => Step::Error,
        }
    }

    /// Build an error frame
    pub fn error(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self::Error(ErrorFrame {
            code,
            detail: detail.into(),
        })
    }
}
