//! Credential validation.
//!
//! Bearer tokens are resolved to a [`CallerIdentity`] through a narrow
//! [`CredentialStore`]. Resolved identities are cached by key digest for a
//! short TTL so the steady-state path never touches the store.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use crate::auth::keys::key_digest;
use crate::auth::{CallerIdentity, users};
use crate::db::Database;
use crate::error::{AppError, StoreError};

/// Lookup side of the credential store.
pub trait CredentialStore: Send + Sync {
    /// The caller owning the key with this SHA-256 digest, if any.
    fn lookup_caller_identity(&self, digest: &str) -> Result<Option<CallerIdentity>, StoreError>;
}

impl CredentialStore for Database {
    fn lookup_caller_identity(&self, digest: &str) -> Result<Option<CallerIdentity>, StoreError> {
        users::lookup_identity(self, digest)
    }
}

#[derive(Debug, Clone)]
struct CachedIdentity {
    identity: CallerIdentity,
    expires_at: Instant,
}

pub struct CredentialValidator {
    store: Arc<dyn CredentialStore>,
    cache: RwLock<HashMap<String, CachedIdentity>>,
    ttl: Duration,
}

impl std::fmt::Debug for CredentialValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialValidator")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl CredentialValidator {
    /// A zero `ttl` disables caching.
    pub fn new(store: Arc<dyn CredentialStore>, ttl: Duration) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Resolve a bearer token. Unknown tokens are `Unauthorized`.
    pub async fn authenticate(&self, token: &str) -> Result<CallerIdentity, AppError> {
        if token.is_empty() {
            return Err(AppError::Unauthorized("Empty Bearer token".to_string()));
        }
        let digest = key_digest(token);

        if let Some(identity) = self.cached(&digest) {
            return Ok(identity);
        }

        // Argon2 verification is CPU bound; keep it off the async workers.
        let store = Arc::clone(&self.store);
        let lookup_digest = digest.clone();
        let found = tokio::task::spawn_blocking(move || store.lookup_caller_identity(&lookup_digest))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))??;

        let identity =
            found.ok_or_else(|| AppError::Unauthorized("Invalid API key".to_string()))?;

        if !self.ttl.is_zero() {
            let now = Instant::now();
            let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
            cache.retain(|_, entry| entry.expires_at > now);
            cache.insert(
                digest,
                CachedIdentity {
                    identity: identity.clone(),
                    expires_at: now + self.ttl,
                },
            );
        }
        Ok(identity)
    }

    /// Drop the cached identity for a revoked key.
    pub fn invalidate(&self, digest: &str) {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(digest);
    }

    fn cached(&self, digest: &str) -> Option<CallerIdentity> {
        let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        cache
            .get(digest)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.identity.clone())
    }
}
