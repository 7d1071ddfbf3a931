//! ReplayGuard: server nonce issuance and tracking.
//!
//! Every Mirror carries a nonce the Seal must attest. The guard guarantees
//! that no two live sessions of one server instance share a nonce:
//!
//! ```text
//!   reserve(ttl) ──► Reserved ──commit(ttl)──► Sealed ──expiry──► pruned
//!                       │
//!                       └──release / drop──► removed
//! ```
//!
//! Reserved entries expire after the pre-Seal deadlines they were reserved
//! for, sealed entries when the Seal does, capped by the replay window.
//! Expired entries are pruned lazily, oldest first, from an expiry index.
//! The store sits behind [`NonceStore`] so a shared cache can replace the
//! in-process map.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

/// Nonce issuance failures, reported as `lhs.internal`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReplayError {
    /// Every generated candidate collided
    #[error("nonce generation exhausted after {attempts} attempts")]
    Exhausted {
        /// Attempts made
        attempts: u32,
    },

    /// Store already tracks its maximum number of nonces
    #[error("nonce store full ({capacity} live entries)")]
    CapacityExceeded {
        /// Configured capacity
        capacity: usize,
    },
}

/// Storage backend for issued nonces. Implementations must be safe under
/// concurrent mutation; `reserve` must never hand the same value to two
/// callers while either entry is live.
pub trait NonceStore: Send + Sync {
    /// Generate and track a fresh nonce for `ttl`.
    fn reserve(&self, ttl: Duration) -> Result<String, ReplayError>;

    /// Mark a reserved nonce as sealed, keeping it for `ttl`. Returns false if
    /// the nonce was not tracked.
    fn commit(&self, nonce: &str, ttl: Duration) -> bool;

    /// Forget a nonce that was never sealed. Sealed nonces are kept.
    fn release(&self, nonce: &str);

    /// Check whether a nonce is live
    fn contains(&self, nonce: &str) -> bool;

    /// Number of live nonces
    fn live_count(&self) -> usize;
}

/// Settings for [`InMemoryNonceStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplaySettings {
    /// Upper bound on a sealed entry's lifetime
    pub window: Duration,
    /// Maximum live entries
    pub capacity: usize,
    /// Random bytes per nonce
    pub nonce_bytes: usize,
    /// Generation attempts before giving up
    pub max_attempts: u32,
}

impl Default for ReplaySettings {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(600),
            capacity: 100_000,
            nonce_bytes: 16,
            max_attempts: 8,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    expires: Instant,
    sealed: bool,
}

/// Live nonces plus an index ordered by expiry, so pruning only touches
/// entries that have actually lapsed.
#[derive(Default)]
struct Entries {
    live: HashMap<String, Entry>,
    by_expiry: BTreeSet<(Instant, String)>,
}

impl Entries {
    fn prune(&mut self, now: Instant) {
        while self
            .by_expiry
            .first()
            .is_some_and(|(expires, _)| *expires <= now)
        {
            if let Some((_, nonce)) = self.by_expiry.pop_first() {
                self.live.remove(&nonce);
            }
        }
    }

    fn insert(&mut self, nonce: String, entry: Entry) {
        self.by_expiry.insert((entry.expires, nonce.clone()));
        self.live.insert(nonce, entry);
    }

    fn remove(&mut self, nonce: &str) -> Option<Entry> {
        let entry = self.live.remove(nonce)?;
        self.by_expiry.remove(&(entry.expires, nonce.to_string()));
        Some(entry)
    }
}

type Generator = Box<dyn Fn() -> String + Send + Sync>;

/// Process-local nonce store.
pub struct InMemoryNonceStore {
    entries: Mutex<Entries>,
    settings: ReplaySettings,
    generate: Generator,
}

impl InMemoryNonceStore {
    /// Create a store drawing nonces from the OS RNG
    pub fn new(settings: ReplaySettings) -> Self {
        let len = settings.nonce_bytes.max(1);
        Self::with_generator(settings, move || {
            let mut bytes = vec![0u8; len];
            OsRng.fill_bytes(&mut bytes);
            URL_SAFE_NO_PAD.encode(bytes)
        })
    }

    /// Create a store with a custom nonce generator
    pub fn with_generator<F>(settings: ReplaySettings, generate: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        Self {
            entries: Mutex::new(Entries::default()),
            settings,
            generate: Box::new(generate),
        }
    }

    /// Active settings
    pub fn settings(&self) -> &ReplaySettings {
        &self.settings
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Entries> {
        // Entries are plain data; a panic elsewhere cannot leave them torn.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for InMemoryNonceStore {
    fn default() -> Self {
        Self::new(ReplaySettings::default())
    }
}

impl fmt::Debug for InMemoryNonceStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryNonceStore")
            .field("settings", &self.settings)
            .field("live", &self.live_count())
            .finish_non_exhaustive()
    }
}

impl NonceStore for InMemoryNonceStore {
    fn reserve(&self, ttl: Duration) -> Result<String, ReplayError> {
        let now = Instant::now();
        let mut entries = self.lock();

        entries.prune(now);
        if entries.live.len() >= self.settings.capacity {
            return Err(ReplayError::CapacityExceeded {
                capacity: self.settings.capacity,
            });
        }

        // Generation happens under the lock so the check-and-insert is atomic.
        for _ in 0..self.settings.max_attempts {
            let candidate = (self.generate)();
            if !entries.live.contains_key(&candidate) {
                entries.insert(
                    candidate.clone(),
                    Entry {
                        expires: now + ttl,
                        sealed: false,
                    },
                );
                return Ok(candidate);
            }
        }

        Err(ReplayError::Exhausted {
            attempts: self.settings.max_attempts,
        })
    }

    fn commit(&self, nonce: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut entries = self.lock();
        match entries.remove(nonce) {
            Some(entry) if entry.expires > now => {
                entries.insert(
                    nonce.to_string(),
                    Entry {
                        expires: now + ttl.min(self.settings.window),
                        sealed: true,
                    },
                );
                true
            },
            _ => false,
        }
    }

    fn release(&self, nonce: &str) {
        let mut entries = self.lock();
        if entries.live.get(nonce).is_some_and(|entry| !entry.sealed) {
            entries.remove(nonce);
        }
    }

    fn contains(&self, nonce: &str) -> bool {
        let now = Instant::now();
        self.lock()
            .live
            .get(nonce)
            .is_some_and(|entry| entry.expires > now)
    }

    fn live_count(&self) -> usize {
        let mut entries = self.lock();
        entries.prune(Instant::now());
        entries.live.len()
    }
}

/// Shared handle to the process-wide nonce store.
#[derive(Clone)]
pub struct ReplayGuard {
    store: Arc<dyn NonceStore>,
}

impl ReplayGuard {
    /// Wrap a store
    pub fn new(store: Arc<dyn NonceStore>) -> Self {
        Self { store }
    }

    /// Guard backed by an [`InMemoryNonceStore`]
    pub fn in_memory(settings: ReplaySettings) -> Self {
        Self::new(Arc::new(InMemoryNonceStore::new(settings)))
    }

    /// Reserve a nonce. The lease releases it on drop unless committed.
    pub fn reserve(&self, ttl: Duration) -> Result<NonceLease, ReplayError> {
        let nonce = self.store.reserve(ttl)?;
        Ok(NonceLease {
            nonce,
            store: Arc::clone(&self.store),
            committed: false,
        })
    }

    /// Check whether a nonce is live
    pub fn contains(&self, nonce: &str) -> bool {
        self.store.contains(nonce)
    }

    /// Number of live nonces
    pub fn live_count(&self) -> usize {
        self.store.live_count()
    }
}

impl Default for ReplayGuard {
    fn default() -> Self {
        Self::in_memory(ReplaySettings::default())
    }
}

impl fmt::Debug for ReplayGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplayGuard")
            .field("live", &self.store.live_count())
            .finish()
    }
}

/// A reserved nonce owned by one handshake.
pub struct NonceLease {
    nonce: String,
    store: Arc<dyn NonceStore>,
    committed: bool,
}

impl NonceLease {
    /// The reserved nonce
    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    /// Seal the nonce for `ttl`; it will no longer be released on drop.
    pub fn commit(&mut self, ttl: Duration) -> bool {
        self.committed = self.store.commit(&self.nonce, ttl);
        self.committed
    }

    /// Check whether the lease has been sealed
    pub fn is_committed(&self) -> bool {
        self.committed
    }
}

impl Drop for NonceLease {
    fn drop(&mut self) {
        if !self.committed {
            self.store.release(&self.nonce);
        }
    }
}

impl fmt::Debug for NonceLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NonceLease")
            .field("nonce", &self.nonce)
            .field("committed", &self.committed)
            .finish()
    }
}
