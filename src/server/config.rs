//! Server configuration.

use std::net::SocketAddr;
use std::time::Duration;

use crate::config::Config;
use crate::protocol::{HandshakeTimeouts, ReplaySettings, ServerContext, ServerSupport};
use crate::transport::Binding;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address
    pub addr: SocketAddr,
    /// Transport binding
    pub binding: Binding,
    /// Capability table
    pub support: ServerSupport,
    /// Per-step deadlines
    pub timeouts: HandshakeTimeouts,
    /// Seal lifetime
    pub seal_ttl: Duration,
    /// Nonce store settings
    pub replay: ReplaySettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 7400)),
            binding: Binding::default(),
            support: ServerSupport::default(),
            timeouts: HandshakeTimeouts::default(),
            seal_ttl: ServerContext::DEFAULT_SEAL_TTL,
            replay: ReplaySettings::default(),
        }
    }
}

impl ServerConfig {
    /// Build from a loaded [`Config`]
    pub fn from_config(config: &Config) -> Self {
        Self {
            addr: config.server.listen,
            binding: config.server.binding,
            support: config.support(),
            timeouts: config.handshake_timeouts(),
            seal_ttl: config.seal_ttl(),
            replay: config.replay_settings(),
        }
    }

    /// Create with custom port
    pub fn with_port(mut self, port: u16) -> Self {
        self.addr.set_port(port);
        self
    }

    /// Set address directly
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Set transport binding
    pub fn with_binding(mut self, binding: Binding) -> Self {
        self.binding = binding;
        self
    }

    /// Set capability table
    pub fn with_support(mut self, support: ServerSupport) -> Self {
        self.support = support;
        self
    }

    /// Set step deadlines
    pub fn with_timeouts(mut self, timeouts: HandshakeTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Set Seal lifetime
    pub fn with_seal_ttl(mut self, ttl: Duration) -> Self {
        self.seal_ttl = ttl;
        self
    }

    /// Set nonce store settings
    pub fn with_replay(mut self, replay: ReplaySettings) -> Self {
        self.replay = replay;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config() {
        let mut config = Config::default();
        config.server.binding = Binding::Upgrade;
        config.server.seal_ttl_secs = 42;
        config.timeouts.bind_ms = 15;

        let server = ServerConfig::from_config(&config);
        assert_eq!(server.binding, Binding::Upgrade);
        assert_eq!(server.seal_ttl, Duration::from_secs(42));
        assert_eq!(server.timeouts.bind, Duration::from_millis(15));
        assert_eq!(server.addr, config.server.listen);
    }

    #[test]
    fn test_builders() {
        let config = ServerConfig::default()
            .with_port(9100)
            .with_binding(Binding::Upgrade);
        assert_eq!(config.addr.port(), 9100);
        assert_eq!(config.binding, Binding::Upgrade);
    }
}
