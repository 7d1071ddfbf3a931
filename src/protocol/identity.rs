//! Bind credential validation.
//!
//! The state machine validates the thread id format first, then hands the
//! credential to an [`IdentityProvider`]. Providers are synchronous; one that
//! must reach a remote service can wrap its call in
//! `tokio::task::block_in_place`.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use super::frame::{AuthDescriptor, ThreadId};

/// Bind rejections, all reported as `lhs.invalid_bind`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BindError {
    /// Bind carried no thread id
    #[error("missing thread id")]
    MissingThread,

    /// Thread id is neither a UUID nor a ULID
    #[error("invalid thread id: {0}")]
    InvalidThread(String),

    /// Bind carried no credential
    #[error("missing credential")]
    MissingCredential,

    /// Provider refused the credential
    #[error("credential rejected for scheme {scheme}")]
    CredentialRejected {
        /// Scheme of the refused credential
        scheme: String,
    },
}

/// Validates Bind credentials.
pub trait IdentityProvider: Send + Sync {
    /// Accept or refuse a credential for a thread.
    fn authenticate(&self, thread: &ThreadId, auth: &AuthDescriptor) -> Result<(), BindError>;

    /// Provider name for logging
    fn name(&self) -> &'static str;
}

/// Accepts any credential. Development only.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl IdentityProvider for AllowAll {
    fn authenticate(&self, _thread: &ThreadId, _auth: &AuthDescriptor) -> Result<(), BindError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "allow-all"
    }
}

/// Fixed table of accepted `(scheme, token)` pairs.
#[derive(Default, Clone)]
pub struct StaticTokens {
    tokens: HashMap<String, HashSet<String>>,
}

impl StaticTokens {
    /// Empty table; refuses everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `token` under `scheme`
    pub fn with_token(mut self, scheme: impl Into<String>, token: impl Into<String>) -> Self {
        self.insert(scheme, token);
        self
    }

    /// Accept `token` under `scheme`
    pub fn insert(&mut self, scheme: impl Into<String>, token: impl Into<String>) {
        self.tokens
            .entry(scheme.into().to_lowercase())
            .or_default()
            .insert(token.into());
    }

    /// Number of accepted tokens
    pub fn len(&self) -> usize {
        self.tokens.values().map(HashSet::len).sum()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for StaticTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokens")
            .field("schemes", &self.tokens.keys().collect::<Vec<_>>())
            .field("tokens", &self.len())
            .finish()
    }
}

impl IdentityProvider for StaticTokens {
    fn authenticate(&self, _thread: &ThreadId, auth: &AuthDescriptor) -> Result<(), BindError> {
        let accepted = self
            .tokens
            .get(&auth.scheme.to_lowercase())
            .is_some_and(|tokens| tokens.contains(&auth.token));

        if accepted {
            Ok(())
        } else {
            Err(BindError::CredentialRejected {
                scheme: auth.scheme.clone(),
            })
        }
    }

    fn name(&self) -> &'static str {
        "static-tokens"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_tokens() {
        let provider = StaticTokens::new().with_token("Bearer", "t-1");
        let thread = ThreadId::generate();

        assert!(provider
            .authenticate(&thread, &AuthDescriptor::bearer("t-1"))
            .is_ok());
        assert_eq!(
            provider.authenticate(&thread, &AuthDescriptor::bearer("t-2")),
            Err(BindError::CredentialRejected {
                scheme: "bearer".to_string()
            })
        );
        assert!(provider
            .authenticate(&thread, &AuthDescriptor::new("basic", "t-1"))
            .is_err());
    }

    #[test]
    fn test_static_tokens_debug_hides_tokens() {
        let provider = StaticTokens::new().with_token("bearer", "hunter2");
        assert!(!format!("{provider:?}").contains("hunter2"));
        assert_eq!(provider.len(), 1);
    }

    #[test]
    fn test_allow_all() {
        assert!(AllowAll
            .authenticate(&ThreadId::generate(), &AuthDescriptor::bearer(""))
            .is_ok());
    }
}
