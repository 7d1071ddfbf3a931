//! Capability negotiation.
//!
//! The server is authoritative. Given a Hello and its [`ServerSupport`] table
//! it picks:
//!
//! | Field             | Rule                                                 |
//! |-------------------|------------------------------------------------------|
//! | `lri_version`     | same major, `min(hello, server)` minor               |
//! | `encoding`        | first client-preferred encoding the server supports  |
//! | `features`        | `hello ∩ server`, in the client's declared order     |
//! | `max_frame_bytes` | `min(hello, server hard cap)`                        |
//!
//! The client runs [`check_mirror`] to confirm the server's answer stays
//! within what it offered.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::frame::{Encoding, Feature, FeatureSet, Hello, LriVersion, Mirror};
use crate::error::ErrorCode;

/// Negotiation failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    /// No supported version shares the offered major
    #[error("version {offered} not supported (server speaks {supported})")]
    VersionMismatch {
        /// Version string offered
        offered: String,
        /// Versions the server speaks
        supported: String,
    },

    /// No offered encoding is supported
    #[error("no common encoding among [{offered}]")]
    NoCommonEncoding {
        /// Encodings offered
        offered: String,
    },

    /// Mirror strays outside the Hello offer
    #[error("inconsistent mirror: {0}")]
    InconsistentMirror(String),
}

impl NegotiationError {
    /// Wire code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::VersionMismatch { .. } => ErrorCode::VersionMismatch,
            Self::NoCommonEncoding { .. } | Self::InconsistentMirror(_) => {
                ErrorCode::EncodingNegotiationFailed
            },
        }
    }
}

/// What the server is willing to speak.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSupport {
    /// Highest supported version per major
    pub versions: Vec<LriVersion>,
    /// Supported encodings
    pub encodings: Vec<Encoding>,
    /// Supported features
    pub features: FeatureSet,
    /// Hard frame size cap
    pub max_frame_cap: u64,
    /// Identifier echoed in Mirror
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
}

impl Default for ServerSupport {
    fn default() -> Self {
        Self {
            versions: vec![crate::PROTOCOL_VERSION],
            encodings: vec![Encoding::Json, Encoding::Cbor],
            features: FeatureSet::from(vec![Feature::Ltp, Feature::Lss]),
            max_frame_cap: crate::DEFAULT_MAX_FRAME_BYTES * 4,
            server_id: None,
        }
    }
}

impl ServerSupport {
    /// Restrict supported encodings
    pub fn with_encodings(mut self, encodings: Vec<Encoding>) -> Self {
        self.encodings = encodings;
        self
    }

    /// Restrict supported features
    pub fn with_features(mut self, features: FeatureSet) -> Self {
        self.features = features;
        self
    }

    /// Set supported versions
    pub fn with_versions(mut self, versions: Vec<LriVersion>) -> Self {
        self.versions = versions;
        self
    }

    /// Set the hard frame cap
    pub fn with_max_frame_cap(mut self, cap: u64) -> Self {
        self.max_frame_cap = cap;
        self
    }

    /// Set the identifier echoed in Mirror
    pub fn with_server_id(mut self, id: impl Into<String>) -> Self {
        self.server_id = Some(id.into());
        self
    }

    /// Check if an encoding is supported
    pub fn supports_encoding(&self, encoding: Encoding) -> bool {
        self.encodings.contains(&encoding)
    }

    fn versions_display(&self) -> String {
        self.versions
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Compute the authoritative choice for a Hello.
    pub fn negotiate(&self, hello: &Hello) -> Result<Negotiated, NegotiationError> {
        let mismatch = || NegotiationError::VersionMismatch {
            offered: hello.lri_version.clone(),
            supported: self.versions_display(),
        };

        let offered: LriVersion = hello.lri_version.parse().map_err(|_| mismatch())?;
        let ours = self
            .versions
            .iter()
            .find(|v| v.major == offered.major)
            .ok_or_else(mismatch)?;
        let version = offered.min(*ours);

        let encoding = hello
            .encodings
            .iter()
            .copied()
            .find(|e| self.supports_encoding(*e))
            .ok_or_else(|| NegotiationError::NoCommonEncoding {
                offered: hello
                    .encodings
                    .iter()
                    .map(Encoding::as_str)
                    .collect::<Vec<_>>()
                    .join(", "),
            })?;

        Ok(Negotiated {
            version,
            encoding,
            features: hello.features.intersect(&self.features),
            max_frame_bytes: hello.max_frame_bytes.min(self.max_frame_cap),
        })
    }
}

/// Result of a successful negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    /// Chosen version
    pub version: LriVersion,
    /// Chosen encoding
    pub encoding: Encoding,
    /// Enabled features
    pub features: FeatureSet,
    /// Effective frame limit
    pub max_frame_bytes: u64,
}

impl Negotiated {
    /// Build the Mirror announcing this choice.
    pub fn into_mirror(self, nonce: String, server_id: Option<String>) -> Mirror {
        Mirror {
            lri_version: self.version.to_string(),
            encoding: self.encoding,
            features: self.features,
            max_frame_bytes: self.max_frame_bytes,
            nonce,
            server_id,
        }
    }
}

/// Client-side check that a Mirror answers the Hello that was sent.
pub fn check_mirror(hello: &Hello, mirror: &Mirror) -> Result<(), NegotiationError> {
    let mismatch = || NegotiationError::VersionMismatch {
        offered: hello.lri_version.clone(),
        supported: mirror.lri_version.clone(),
    };

    let offered: LriVersion = hello.lri_version.parse().map_err(|_| mismatch())?;
    let chosen: LriVersion = mirror.lri_version.parse().map_err(|_| mismatch())?;
    if chosen.major != offered.major {
        return Err(mismatch());
    }
    if chosen > offered {
        return Err(NegotiationError::InconsistentMirror(format!(
            "version {chosen} above offered {offered}"
        )));
    }
    if !hello.encodings.contains(&mirror.encoding) {
        return Err(NegotiationError::InconsistentMirror(format!(
            "encoding {} was not offered",
            mirror.encoding
        )));
    }
    if !mirror.features.is_subset_of(&hello.features) {
        return Err(NegotiationError::InconsistentMirror(
            "features exceed the requested set".to_string(),
        ));
    }
    if mirror.max_frame_bytes > hello.max_frame_bytes {
        return Err(NegotiationError::InconsistentMirror(format!(
            "max_frame_bytes {} above offered {}",
            mirror.max_frame_bytes, hello.max_frame_bytes
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn scenario_a_support() -> ServerSupport {
        ServerSupport::default()
            .with_encodings(vec![Encoding::Json])
            .with_features(FeatureSet::from(vec![Feature::Ltp]))
            .with_max_frame_cap(1 << 20)
    }

    #[test]
    fn test_scenario_a() {
        let hello = Hello::new(
            vec![Encoding::Json, Encoding::Cbor],
            FeatureSet::from(vec![Feature::Ltp, Feature::Lss]),
            65536,
        )
        .with_version("0.1");

        let negotiated = scenario_a_support().negotiate(&hello).unwrap();
        assert_eq!(negotiated.version, LriVersion::new(0, 1));
        assert_eq!(negotiated.encoding, Encoding::Json);
        assert_eq!(negotiated.features, FeatureSet::from(vec![Feature::Ltp]));
        assert_eq!(negotiated.max_frame_bytes, 65536);

        let capped = scenario_a_support().with_max_frame_cap(4096);
        assert_eq!(capped.negotiate(&hello).unwrap().max_frame_bytes, 4096);
    }

    #[test]
    fn test_scenario_b_version_mismatch() {
        let hello = Hello::default().with_version("9.0");
        let err = ServerSupport::default().negotiate(&hello).unwrap_err();
        assert_eq!(err.code(), ErrorCode::VersionMismatch);

        let garbage = Hello::default().with_version("latest");
        let err = ServerSupport::default().negotiate(&garbage).unwrap_err();
        assert_eq!(err.code(), ErrorCode::VersionMismatch);
    }

    #[test]
    fn test_minor_clamped_to_server() {
        let hello = Hello::default().with_version("0.7");
        let negotiated = ServerSupport::default().negotiate(&hello).unwrap();
        assert_eq!(negotiated.version, crate::PROTOCOL_VERSION);
    }

    #[test]
    fn test_no_common_encoding() {
        let hello = Hello::new(vec![Encoding::Cbor], FeatureSet::new(), 1024);
        let support = ServerSupport::default().with_encodings(vec![Encoding::Json]);
        let err = support.negotiate(&hello).unwrap_err();
        assert_eq!(err.code(), ErrorCode::EncodingNegotiationFailed);
    }

    #[test]
    fn test_client_preference_wins() {
        let hello = Hello::new(vec![Encoding::Cbor, Encoding::Json], FeatureSet::new(), 1024);
        let negotiated = ServerSupport::default().negotiate(&hello).unwrap();
        assert_eq!(negotiated.encoding, Encoding::Cbor);
    }

    #[test]
    fn test_check_mirror() {
        let hello = Hello::default();
        let good = ServerSupport::default()
            .negotiate(&hello)
            .unwrap()
            .into_mirror("n".to_string(), None);
        assert!(check_mirror(&hello, &good).is_ok());

        let mut wrong_major = good.clone();
        wrong_major.lri_version = "1.0".to_string();
        assert_eq!(
            check_mirror(&hello, &wrong_major).unwrap_err().code(),
            ErrorCode::VersionMismatch
        );

        let narrow = Hello::new(vec![Encoding::Json], FeatureSet::new(), 1024);
        let mut extra_feature = good.clone();
        extra_feature.encoding = Encoding::Json;
        extra_feature.max_frame_bytes = 1024;
        assert!(matches!(
            check_mirror(&narrow, &extra_feature),
            Err(NegotiationError::InconsistentMirror(_))
        ));

        let mut bigger = good;
        bigger.max_frame_bytes = hello.max_frame_bytes + 1;
        assert!(check_mirror(&hello, &bigger).is_err());
    }

    fn encodings() -> impl Strategy<Value = Vec<Encoding>> {
        prop_oneof![
            Just(vec![Encoding::Json]),
            Just(vec![Encoding::Cbor]),
            Just(vec![Encoding::Json, Encoding::Cbor]),
            Just(vec![Encoding::Cbor, Encoding::Json]),
        ]
    }

    fn features() -> impl Strategy<Value = FeatureSet> {
        prop_oneof![
            Just(FeatureSet::new()),
            Just(FeatureSet::from(vec![Feature::Ltp])),
            Just(FeatureSet::from(vec![Feature::Lss])),
            Just(FeatureSet::from(vec![Feature::Ltp, Feature::Lss])),
            Just(FeatureSet::from(vec![Feature::Lss, Feature::Ltp])),
        ]
    }

    proptest! {
        #[test]
        fn prop_mirror_within_offer(
            client_enc in encodings(),
            server_enc in encodings(),
            client_feat in features(),
            server_feat in features(),
            client_max in 1u64..1_000_000,
            cap in 1u64..1_000_000,
        ) {
            let hello = Hello::new(client_enc, client_feat, client_max);
            let support = ServerSupport::default()
                .with_encodings(server_enc)
                .with_features(server_feat.clone())
                .with_max_frame_cap(cap);

            let negotiated = match support.negotiate(&hello) {
                Ok(n) => n,
                Err(err) => {
                    prop_assert_eq!(err.code(), ErrorCode::EncodingNegotiationFailed);
                    prop_assert!(hello.encodings.iter().all(|e| !support.supports_encoding(*e)));
                    return Ok(());
                },
            };
            prop_assert!(hello.encodings.contains(&negotiated.encoding));
            prop_assert!(support.supports_encoding(negotiated.encoding));
            prop_assert!(negotiated.features.is_subset_of(&hello.features));
            prop_assert!(negotiated.features.is_subset_of(&server_feat));
            prop_assert!(negotiated.max_frame_bytes <= cap);
            prop_assert!(negotiated.max_frame_bytes <= client_max);

            let mirror = negotiated.into_mirror("n".to_string(), None);
            prop_assert!(check_mirror(&hello, &mirror).is_ok());
        }
    }
}
