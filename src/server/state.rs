//! Server state and session registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use super::config::ServerConfig;
use crate::protocol::{
    Encoding, EstablishedSession, Feature, IdentityProvider, ReplayGuard, ServerContext,
    TrustSealer,
};

/// State shared by the connection driver and the status router
pub struct ServerState {
    /// Server configuration
    pub config: ServerConfig,
    /// Handshake context handed to every machine
    pub context: Arc<ServerContext>,
    /// Established sessions
    pub sessions: SessionRegistry,
    /// Server start time
    pub start_time: Instant,
}

impl ServerState {
    /// Create state with an in-memory nonce store
    pub fn new(
        config: ServerConfig,
        sealer: TrustSealer,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        let replay = ReplayGuard::in_memory(config.replay);
        Self::with_replay(config, sealer, identity, replay)
    }

    /// Create state around an existing nonce store
    pub fn with_replay(
        config: ServerConfig,
        sealer: TrustSealer,
        identity: Arc<dyn IdentityProvider>,
        replay: ReplayGuard,
    ) -> Self {
        let context = ServerContext::new(config.support.clone(), sealer, identity, replay)
            .with_seal_ttl(config.seal_ttl);
        Self {
            config,
            context: Arc::new(context),
            sessions: SessionRegistry::new(),
            start_time: Instant::now(),
        }
    }

    /// Get server uptime
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }
}

/// Status view of one established session
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    /// Session identifier
    pub session_id: String,
    /// Bound thread
    pub thread: String,
    /// Agreed version
    pub lri_version: String,
    /// Agreed encoding
    pub encoding: Encoding,
    /// Agreed features
    pub features: Vec<Feature>,
    /// Client identifier from Hello
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// When the handshake completed
    pub established_at: DateTime<Utc>,
    /// Seal expiry
    pub expires_at: DateTime<Utc>,
}

impl From<&EstablishedSession> for SessionSummary {
    fn from(session: &EstablishedSession) -> Self {
        Self {
            session_id: session.session_id().to_string(),
            thread: session.thread().to_string(),
            lri_version: session.lri_version().to_string(),
            encoding: session.encoding(),
            features: session.features().iter().collect(),
            client_id: session.client_id().map(str::to_string),
            established_at: Utc::now(),
            expires_at: session.expires_at(),
        }
    }
}

/// Tracks sessions between Seal and the end of Flow
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, SessionSummary>>>,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an established session
    pub async fn insert(&self, session: &EstablishedSession) {
        let summary = SessionSummary::from(session);
        self.sessions
            .write()
            .await
            .insert(summary.session_id.clone(), summary);
    }

    /// Get session by ID
    pub async fn get(&self, id: &str) -> Option<SessionSummary> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Remove session
    pub async fn remove(&self, id: &str) -> Option<SessionSummary> {
        self.sessions.write().await.remove(id)
    }

    /// Get session count
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Snapshot of all sessions
    pub async fn list(&self) -> Vec<SessionSummary> {
        let mut sessions: Vec<_> = self.sessions.read().await.values().cloned().collect();
        sessions.sort_by(|a, b| a.established_at.cmp(&b.established_at));
        sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        Advance, AllowAll, AuthDescriptor, Bind, Frame, Handshake, HandshakeTimeouts, Hello,
        ThreadId,
    };

    fn established(state: &ServerState) -> EstablishedSession {
        let mut machine = Handshake::server(Arc::clone(&state.context), HandshakeTimeouts::default());
        assert!(matches!(
            machine.advance(Frame::Hello(Hello::default())),
            Advance::Reply(_)
        ));
        let bind = Bind::new(&ThreadId::generate(), AuthDescriptor::bearer("t"));
        assert!(matches!(machine.advance(Frame::Bind(bind)), Advance::Reply(_)));
        machine.enter_flow().unwrap()
    }

    fn state() -> ServerState {
        ServerState::new(
            ServerConfig::default(),
            TrustSealer::generate(),
            Arc::new(AllowAll),
        )
    }

    #[tokio::test]
    async fn test_registry_insert_and_remove() {
        let state = state();
        let session = established(&state);

        state.sessions.insert(&session).await;
        assert_eq!(state.sessions.count().await, 1);

        let summary = state.sessions.get(session.session_id()).await.unwrap();
        assert_eq!(summary.thread, session.thread());
        assert!(summary.features.contains(&Feature::Ltp));

        assert!(state.sessions.remove(session.session_id()).await.is_some());
        assert_eq!(state.sessions.count().await, 0);
    }

    #[tokio::test]
    async fn test_registry_list() {
        let state = state();
        for _ in 0..3 {
            let session = established(&state);
            state.sessions.insert(&session).await;
        }
        assert_eq!(state.sessions.list().await.len(), 3);
    }

    #[test]
    fn test_context_carries_seal_ttl() {
        let config = ServerConfig::default().with_seal_ttl(Duration::from_secs(7));
        let state = ServerState::new(config, TrustSealer::generate(), Arc::new(AllowAll));
        assert_eq!(state.context.seal_ttl(), Duration::from_secs(7));
    }
}
