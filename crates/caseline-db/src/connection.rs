//! Database session contract and the pooled connection handle.
//!
//! The pool never speaks a wire protocol itself. A [`Connector`] opens
//! sessions and a [`Session`] exposes the handful of operations the pool
//! needs (liveness probe, rollback, close) plus `execute` for callers.
//! [`mysql`] provides the production implementation; tests inject mocks.

pub mod mysql;

use std::fmt;

use async_trait::async_trait;
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::Instant;

use crate::error::ConnectError;

/// An open database session.
#[async_trait]
pub trait Session: Send + fmt::Debug {
    /// False once the session has been closed or its transport has failed.
    fn is_open(&self) -> bool;

    /// Liveness probe.
    async fn ping(&mut self) -> Result<(), ConnectError>;

    /// Run a statement, discarding any result rows. Returns affected rows
    /// (or the number of rows returned for a query).
    async fn execute(&mut self, sql: &str) -> Result<u64, ConnectError>;

    /// Roll back any open transaction.
    async fn rollback(&mut self) -> Result<(), ConnectError>;

    async fn close(&mut self) -> Result<(), ConnectError>;
}

/// Opens sessions against a database server.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a session with auto-commit disabled and a UTF-8 multibyte
    /// character set.
    async fn connect(
        &self,
        target: &ConnectTarget,
        credentials: &Credentials,
    ) -> Result<Box<dyn Session>, ConnectError>;
}

/// Static connection target. Never taken from the secret.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
    pub database: String,
}

impl ConnectTarget {
    pub fn new(host: impl Into<String>, port: u16, database: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            database: database.into(),
        }
    }
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.port, self.database)
    }
}

/// Username and password pulled from the credential secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Creation and last-use times of a tracked connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionMetadata {
    pub created_at: Instant,
    pub last_used_at: Instant,
}

impl ConnectionMetadata {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            created_at: now,
            last_used_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_used_at = Instant::now();
    }
}

impl Default for ConnectionMetadata {
    fn default() -> Self {
        Self::new()
    }
}

/// A database connection owned by the pool or by exactly one caller.
///
/// Holds one capacity slot for its whole life. Dropping a connection without
/// returning it frees the slot and closes the transport, but skips the
/// rollback and the metadata cleanup that
/// [`ConnectionPool::release`](crate::ConnectionPool::release) performs.
pub struct Connection {
    id: u64,
    generation: u64,
    session: Box<dyn Session>,
    _slot: OwnedSemaphorePermit,
}

impl Connection {
    pub(crate) fn new(
        id: u64,
        generation: u64,
        session: Box<dyn Session>,
        slot: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            id,
            generation,
            session,
            _slot: slot,
        }
    }

    /// Identity used to key metadata. Carries no business meaning.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Credential generation this connection was opened under.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn session(&mut self) -> &mut dyn Session {
        self.session.as_mut()
    }

    pub fn is_open(&self) -> bool {
        self.session.is_open()
    }

    pub async fn execute(&mut self, sql: &str) -> Result<u64, ConnectError> {
        self.session.execute(sql).await
    }

    pub async fn ping(&mut self) -> Result<(), ConnectError> {
        self.session.ping().await
    }

    /// Liveness probe bounded by `limit`. A probe that times out counts as
    /// a failure.
    pub(crate) async fn validate(&mut self, limit: std::time::Duration) -> Result<(), ConnectError> {
        match tokio::time::timeout(limit, self.session.ping()).await {
            Ok(result) => result,
            Err(_) => Err(ConnectError::Timeout(limit)),
        }
    }

    pub(crate) fn into_parts(self) -> (u64, Box<dyn Session>, OwnedSemaphorePermit) {
        (self.id, self.session, self._slot)
    }

    /// Close the session, logging rather than returning failures.
    pub(crate) async fn close_quietly(mut self, reason: &str) {
        if let Err(e) = self.session.close().await {
            tracing::debug!(connection = self.id, reason, error = %e, "error closing connection");
        } else {
            tracing::debug!(connection = self.id, reason, "closed connection");
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("session", &self.session)
            .finish()
    }
}
