//! The external secret-service contract and an in-process implementation.
//!
//! A [`SecretStore`] is the single operation the credential cache consumes
//! from the secret-management service: fetch the current version of a named
//! secret. Retries, caching and stale fallback all live above this trait.

pub mod file;

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use crate::error::{SecretsError, SecretsResult};
use crate::secret::SecretValue;

pub use file::FileSecretStore;

/// Fetches named secrets from an external secret-management service.
///
/// Implementations must be cheap to call concurrently; the credential cache
/// guarantees at most one in-flight fetch per name but may fetch different
/// names in parallel.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch the current version of `name`.
    ///
    /// # Errors
    ///
    /// - [`SecretsError::NotFound`] if the secret does not exist
    /// - [`SecretsError::AccessDenied`] if the caller may not read it
    /// - [`SecretsError::Unavailable`] for transient service failures
    /// - [`SecretsError::Malformed`] if the stored payload cannot be decoded
    async fn fetch_secret(&self, name: &str) -> SecretsResult<SecretValue>;
}

/// In-process secret store.
///
/// Publishing a new value with [`insert`](Self::insert) behaves like a
/// rotation in a real secret service. Failures can be injected with
/// [`fail_with`](Self::fail_with) to simulate an outage.
#[derive(Default)]
pub struct MemorySecretStore {
    secrets: Mutex<HashMap<String, SecretValue>>,
    outage: Mutex<Option<String>>,
    fetches: AtomicU64,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish (or rotate) a secret.
    pub fn insert(&self, name: impl Into<String>, value: SecretValue) {
        if let Ok(mut secrets) = self.secrets.lock() {
            secrets.insert(name.into(), value);
        }
    }

    pub fn remove(&self, name: &str) -> Option<SecretValue> {
        self.secrets.lock().ok().and_then(|mut s| s.remove(name))
    }

    /// Make every subsequent fetch fail with [`SecretsError::Unavailable`]
    /// until [`recover`](Self::recover) is called.
    pub fn fail_with(&self, message: impl Into<String>) {
        if let Ok(mut outage) = self.outage.lock() {
            *outage = Some(message.into());
        }
    }

    pub fn recover(&self) {
        if let Ok(mut outage) = self.outage.lock() {
            *outage = None;
        }
    }

    /// Number of `fetch_secret` calls served (including failed ones).
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn fetch_secret(&self, name: &str) -> SecretsResult<SecretValue> {
        self.fetches.fetch_add(1, Ordering::Relaxed);

        if let Some(message) = self.outage.lock().ok().and_then(|o| o.clone()) {
            return Err(SecretsError::unavailable(name, message));
        }

        let secrets = self
            .secrets
            .lock()
            .map_err(|_| SecretsError::unavailable(name, "secret store lock poisoned"))?;
        secrets
            .get(name)
            .cloned()
            .ok_or_else(|| SecretsError::not_found(name))
    }
}

impl std::fmt::Debug for MemorySecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .secrets
            .lock()
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("MemorySecretStore")
            .field("names", &names)
            .field("fetches", &self.fetch_count())
            .finish_non_exhaustive()
    }
}
