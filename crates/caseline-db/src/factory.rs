//! Connection factory: credential lookup plus connect, with one rotation retry.
//!
//! ```text
//! create(signal)
//!   → observed = signal.generation()
//!   → open(): cache.get(secret, ttl) (stale copy on secret-service failure) → connector.connect()
//!     → Ok                       → session tagged with `observed`
//!     → Err(Authentication)      → signal.credentials_rejected(observed) → open() once more
//!     → Err(anything else)       → propagate
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use caseline_secrets::CredentialCache;

use crate::config::CredentialSource;
use crate::connection::{ConnectTarget, Connector, Credentials, Session};
use crate::error::{DbError, DbResult};

/// Receiver of credential-rejection events, implemented by the pool.
///
/// The generation is a counter the receiver bumps every time it retires
/// the connections opened under the previous credential.
#[async_trait]
pub trait RotationSignal: Send + Sync {
    fn generation(&self) -> u64;

    /// The database rejected a credential while the receiver was at
    /// generation `observed`. Returns once recovery (if still needed) has
    /// run its synchronous phase.
    async fn credentials_rejected(&self, observed: u64);
}

/// A new session and the generation it belongs to.
pub struct Opened {
    pub session: Box<dyn Session>,
    pub generation: u64,
}

impl std::fmt::Debug for Opened {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Opened")
            .field("generation", &self.generation)
            .field("session", &self.session)
            .finish()
    }
}

/// Opens database sessions using the credential held in the secret service.
pub struct ConnectionFactory {
    connector: Arc<dyn Connector>,
    cache: Arc<CredentialCache>,
    target: ConnectTarget,
    source: CredentialSource,
}

impl ConnectionFactory {
    pub fn new(
        connector: Arc<dyn Connector>,
        cache: Arc<CredentialCache>,
        target: ConnectTarget,
        source: CredentialSource,
    ) -> Self {
        Self {
            connector,
            cache,
            target,
            source,
        }
    }

    pub fn cache(&self) -> &Arc<CredentialCache> {
        &self.cache
    }

    pub fn source(&self) -> &CredentialSource {
        &self.source
    }

    pub fn target(&self) -> &ConnectTarget {
        &self.target
    }

    /// Current username and password.
    ///
    /// If the secret service fails and a previously fetched copy exists, the
    /// stale copy is used and a warning logged.
    pub async fn credentials(&self) -> DbResult<Credentials> {
        let name = self.source.secret_name.as_str();
        let secret = match self.cache.get(name, self.source.ttl).await {
            Ok(secret) => secret,
            Err(e) => match self.cache.peek_stale(name).await {
                Some((stale, age)) => {
                    tracing::warn!(
                        secret = %name,
                        age_secs = age.as_secs(),
                        error = %e,
                        "secret service unavailable, using stale credential"
                    );
                    stale
                }
                None => return Err(e.into()),
            },
        };

        let username = secret.require_str(name, &self.source.username_key)?;
        let password = secret.require_str(name, &self.source.password_key)?;
        Ok(Credentials::new(username, password))
    }

    /// One connect attempt. Never triggers rotation recovery.
    pub async fn open(&self) -> DbResult<Box<dyn Session>> {
        let credentials = self.credentials().await?;
        let session = self.connector.connect(&self.target, &credentials).await?;
        Ok(session)
    }

    /// Open a session, recovering once from a rejected credential.
    pub async fn create(&self, signal: &dyn RotationSignal) -> DbResult<Opened> {
        let observed = signal.generation();
        match self.open().await {
            Ok(session) => Ok(Opened {
                session,
                generation: observed,
            }),
            Err(DbError::Connect(e)) if e.is_authentication() => {
                tracing::warn!(
                    db = %self.target,
                    secret = %self.source.secret_name,
                    generation = observed,
                    error = %e,
                    "database rejected credential, treating as rotation"
                );
                signal.credentials_rejected(observed).await;

                let generation = signal.generation();
                let session = self.open().await.inspect_err(|e| {
                    tracing::error!(
                        db = %self.target,
                        error = %e,
                        "connect failed again after credential refresh"
                    );
                })?;
                Ok(Opened {
                    session,
                    generation,
                })
            }
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for ConnectionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionFactory")
            .field("target", &self.target)
            .field("secret", &self.source.secret_name)
            .finish_non_exhaustive()
    }
}
