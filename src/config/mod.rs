//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files
//! - Environment variables (`LHS_` prefix)
//! - CLI arguments (for `lhs serve` / `lhs connect`)

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LhsError, Result};
use crate::protocol::{
    Encoding, Feature, FeatureSet, HandshakeTimeouts, LriVersion, ReplaySettings, ServerSupport,
    TRUST_FEATURE,
};
use crate::transport::Binding;

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: HostConfig,

    /// Per-step deadlines
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Nonce tracking
    #[serde(default)]
    pub replay: ReplayConfig,

    /// Client retry behaviour
    #[serde(default)]
    pub client: ClientConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| LhsError::Config(format!("Failed to read config file: {e}")))?;

        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Default config file location (`~/.config/lhs/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("lhs").join("config.toml"))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    /// Override fields from `LHS_*` environment variables.
    ///
    /// Unparseable values are ignored.
    pub fn with_env(mut self) -> Self {
        fn var<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|v| v.parse().ok())
        }

        if let Some(listen) = var("LHS_LISTEN") {
            self.server.listen = listen;
        }
        if let Some(binding) = var("LHS_BINDING") {
            self.server.binding = binding;
        }
        if let Some(cap) = var("LHS_MAX_FRAME_CAP") {
            self.server.max_frame_cap = cap;
        }
        if let Some(ttl) = var("LHS_SEAL_TTL_SECS") {
            self.server.seal_ttl_secs = ttl;
        }
        if let Ok(id) = std::env::var("LHS_SERVER_ID") {
            self.server.server_id = Some(id);
        }
        if let Ok(encodings) = std::env::var("LHS_ENCODINGS") {
            let parsed: Vec<Encoding> = encodings
                .split(',')
                .filter_map(|e| e.trim().parse().ok())
                .collect();
            if !parsed.is_empty() {
                self.server.encodings = parsed;
            }
        }

        // Timeouts
        if let Some(ms) = var::<u64>("LHS_STEP_TIMEOUT_MS") {
            self.timeouts = TimeoutConfig {
                hello_ms: ms,
                mirror_ms: ms,
                bind_ms: ms,
                seal_ms: ms,
            };
        }

        // Replay
        if let Some(window) = var("LHS_REPLAY_WINDOW_SECS") {
            self.replay.window_secs = window;
        }
        if let Some(capacity) = var("LHS_REPLAY_CAPACITY") {
            self.replay.capacity = capacity;
        }

        // Client
        if let Some(attempts) = var("LHS_MAX_HELLO_ATTEMPTS") {
            self.client.max_hello_attempts = attempts;
        }

        self
    }

    /// Reject inconsistent settings.
    pub fn validate(&self) -> Result<()> {
        let server = &self.server;
        if server.encodings.is_empty() {
            return Err(LhsError::Config("server.encodings must not be empty".into()));
        }
        if server.versions.is_empty() {
            return Err(LhsError::Config("server.versions must not be empty".into()));
        }
        if server.max_frame_cap == 0 {
            return Err(LhsError::Config("server.max_frame_cap must be positive".into()));
        }
        if server.seal_ttl_secs == 0 {
            return Err(LhsError::Config("server.seal_ttl_secs must be positive".into()));
        }
        if let Some(dup) = FeatureSet::from(server.features.clone()).first_duplicate() {
            return Err(LhsError::Config(format!("server.features lists {dup} twice")));
        }
        if !server.features.contains(&TRUST_FEATURE) {
            return Err(LhsError::Config(format!(
                "server.features must include {TRUST_FEATURE}"
            )));
        }

        let t = &self.timeouts;
        if [t.hello_ms, t.mirror_ms, t.bind_ms, t.seal_ms].contains(&0) {
            return Err(LhsError::Config("timeouts must be positive".into()));
        }

        let replay = &self.replay;
        if replay.window_secs < server.seal_ttl_secs {
            return Err(LhsError::Config(format!(
                "replay.window_secs ({}) is shorter than server.seal_ttl_secs ({})",
                replay.window_secs, server.seal_ttl_secs
            )));
        }
        if replay.capacity == 0 {
            return Err(LhsError::Config("replay.capacity must be positive".into()));
        }
        if replay.nonce_bytes < 8 {
            return Err(LhsError::Config("replay.nonce_bytes must be at least 8".into()));
        }
        if replay.max_reserve_attempts == 0 {
            return Err(LhsError::Config(
                "replay.max_reserve_attempts must be positive".into(),
            ));
        }

        if self.client.max_hello_attempts == 0 {
            return Err(LhsError::Config("client.max_hello_attempts must be positive".into()));
        }
        Ok(())
    }

    /// Capability table for the negotiator
    pub fn support(&self) -> ServerSupport {
        ServerSupport {
            versions: self.server.versions.clone(),
            encodings: self.server.encodings.clone(),
            features: FeatureSet::from(self.server.features.clone()),
            max_frame_cap: self.server.max_frame_cap,
            server_id: self.server.server_id.clone(),
        }
    }

    /// Step deadlines
    pub fn handshake_timeouts(&self) -> HandshakeTimeouts {
        HandshakeTimeouts {
            hello: Duration::from_millis(self.timeouts.hello_ms),
            mirror: Duration::from_millis(self.timeouts.mirror_ms),
            bind: Duration::from_millis(self.timeouts.bind_ms),
            seal: Duration::from_millis(self.timeouts.seal_ms),
        }
    }

    /// Nonce store settings
    pub fn replay_settings(&self) -> ReplaySettings {
        ReplaySettings {
            window: Duration::from_secs(self.replay.window_secs),
            capacity: self.replay.capacity,
            nonce_bytes: self.replay.nonce_bytes,
            max_attempts: self.replay.max_reserve_attempts,
        }
    }

    /// Seal lifetime
    pub fn seal_ttl(&self) -> Duration {
        Duration::from_secs(self.server.seal_ttl_secs)
    }
}

/// Server listener and capability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Address to listen on
    pub listen: SocketAddr,

    /// Transport binding
    pub binding: Binding,

    /// Highest supported version per major
    pub versions: Vec<LriVersion>,

    /// Supported encodings, in preference order
    pub encodings: Vec<Encoding>,

    /// Supported features
    pub features: Vec<Feature>,

    /// Hard cap on control frame size in bytes
    pub max_frame_cap: u64,

    /// Seal lifetime in seconds
    pub seal_ttl_secs: u64,

    /// Identifier echoed in Mirror
    pub server_id: Option<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        let support = ServerSupport::default();
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 7400)),
            binding: Binding::default(),
            versions: support.versions,
            encodings: support.encodings,
            features: support.features.iter().collect(),
            max_frame_cap: support.max_frame_cap,
            seal_ttl_secs: 300,
            server_id: None,
        }
    }
}

/// Per-step deadlines in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Server: connection open to Hello
    pub hello_ms: u64,
    /// Client: Hello sent to Mirror
    pub mirror_ms: u64,
    /// Server: Mirror sent to Bind
    pub bind_ms: u64,
    /// Client: Bind sent to Seal
    pub seal_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            hello_ms: 10_000,
            mirror_ms: 10_000,
            bind_ms: 10_000,
            seal_ms: 10_000,
        }
    }
}

/// Nonce tracking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Upper bound on how long a nonce is remembered
    pub window_secs: u64,
    /// Maximum tracked nonces
    pub capacity: usize,
    /// Random bytes per nonce
    pub nonce_bytes: usize,
    /// Generation attempts on collision
    pub max_reserve_attempts: u32,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        let settings = ReplaySettings::default();
        Self {
            window_secs: settings.window.as_secs(),
            capacity: settings.capacity,
            nonce_bytes: settings.nonce_bytes,
            max_reserve_attempts: settings.max_attempts,
        }
    }
}

/// Client retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Hello attempts before giving up
    pub max_hello_attempts: u32,
    /// Delay between attempts in milliseconds
    pub retry_backoff_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_hello_attempts: 3,
            retry_backoff_ms: 250,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.listen.port(), 7400);
        assert_eq!(config.server.binding, Binding::Duplex);
        assert!(config.server.features.contains(&Feature::Ltp));
        config.validate().unwrap();
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
            [server]
            listen = "0.0.0.0:9000"
            binding = "upgrade"
            versions = ["0.2"]
            encodings = ["cbor"]
            features = ["ltp"]
            seal_ttl_secs = 60

            [timeouts]
            bind_ms = 250

            [replay]
            window_secs = 120
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.listen.port(), 9000);
        assert_eq!(config.server.binding, Binding::Upgrade);
        assert_eq!(config.server.encodings, vec![Encoding::Cbor]);
        assert_eq!(config.timeouts.bind_ms, 250);
        assert_eq!(config.timeouts.hello_ms, 10_000);
        assert_eq!(config.handshake_timeouts().bind, Duration::from_millis(250));
        assert_eq!(config.replay_settings().window, Duration::from_secs(120));
        config.validate().unwrap();
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[client]\nmax_hello_attempts = 5").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.client.max_hello_attempts, 5);
        assert_eq!(config.client.retry_backoff_ms, 250);
    }

    #[test]
    fn test_from_file_rejects_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nseal_ttl_secs = 900\n[replay]\nwindow_secs = 60").unwrap();

        let err = Config::from_file(file.path()).unwrap_err();
        assert!(matches!(err, LhsError::Config(_)));
    }

    #[test]
    fn test_from_file_bad_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server\nlisten = 3").unwrap();
        assert!(matches!(
            Config::from_file(file.path()).unwrap_err(),
            LhsError::Config(_)
        ));
    }

    #[test]
    fn test_validate_rejects() {
        let mut config = Config::default();
        config.server.encodings.clear();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.server.max_frame_cap = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.server.features = vec![Feature::Lss];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.server.features = vec![Feature::Ltp, Feature::Ltp];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.timeouts.seal_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_support_conversion() {
        let mut config = Config::default();
        config.server.server_id = Some("edge-1".into());
        let support = config.support();
        assert_eq!(support.server_id.as_deref(), Some("edge-1"));
        assert!(support.features.contains(Feature::Ltp));
        assert_eq!(support.max_frame_cap, config.server.max_frame_cap);
    }
}
