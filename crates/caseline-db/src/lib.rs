//! caseline-db — bounded database connection pool that survives credential
//! rotation.
//!
//! Business code sees two calls: [`Database::get_connection`] and
//! [`Database::close_connection`]. Everything else runs behind them.
//!
//! # Architecture
//!
//! ```text
//! Database
//!   ├── ConnectionPool (idle connections + metadata under one mutex,
//!   │   │               capacity semaphore, credential generation)
//!   │   └── ConnectionFactory
//!   │       ├── CredentialCache (caseline-secrets) → username/password
//!   │       └── Connector (MysqlConnector) → Session
//!   ├── Rotation recovery: invalidate → drain → background rewarm
//!   ├── Reaper (lifetime / idle / liveness eviction, degraded-mode aware)
//!   ├── Prewarmer
//!   └── Maintenance (periodic reaper + prewarm)
//! ```
//!
//! # Rotation
//!
//! When the database rejects a credential, the factory treats it as a
//! rotation: the cached secret is invalidated, every pooled connection is
//! closed and the pool's generation advances, then the failed connect is
//! retried once with a fresh credential. A background worker refills the
//! pool to half its size. Connections opened under an older generation are
//! closed when returned and never handed out again.

pub mod config;
pub mod connection;
pub mod database;
pub mod error;
pub mod factory;
pub mod maintenance;
pub mod pool;
pub mod prewarm;
pub mod reaper;
pub mod recovery;
pub mod stats;

#[cfg(test)]
mod testing;

pub use config::{CredentialSource, MaintenanceConfig, PoolConfig};
pub use connection::mysql::MysqlConnector;
pub use connection::{ConnectTarget, Connection, ConnectionMetadata, Connector, Credentials, Session};
pub use database::{Database, DatabaseConfig};
pub use error::{ConnectError, DbError, DbResult};
pub use factory::{ConnectionFactory, Opened, RotationSignal};
pub use maintenance::Maintenance;
pub use pool::ConnectionPool;
pub use prewarm::{PrewarmReport, Prewarmer};
pub use reaper::{Reaper, SweepReport};
pub use recovery::RewarmReport;
pub use stats::{DurationSummary, PoolStats};
