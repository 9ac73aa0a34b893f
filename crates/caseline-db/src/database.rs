//! Process-wide database handle: the two business entry points plus the
//! administrative triggers and lifecycle.

use std::sync::Arc;

use caseline_secrets::{CacheStats, CredentialCache};
use tokio::sync::watch;

use crate::config::{CredentialSource, MaintenanceConfig, PoolConfig};
use crate::connection::{ConnectTarget, Connection, Connector};
use crate::error::DbResult;
use crate::factory::ConnectionFactory;
use crate::maintenance::Maintenance;
use crate::pool::ConnectionPool;
use crate::prewarm::{PrewarmReport, Prewarmer};
use crate::reaper::{Reaper, SweepReport};
use crate::recovery::RewarmReport;
use crate::stats::PoolStats;

/// Everything [`Database::init`] needs besides its collaborators.
#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub target: ConnectTarget,
    pub credentials: CredentialSource,
    pub pool: PoolConfig,
    pub maintenance: MaintenanceConfig,
}

/// Cloneable handle shared by request handlers and admin tooling.
#[derive(Clone, Debug)]
pub struct Database {
    pool: ConnectionPool,
    cache: Arc<CredentialCache>,
    maintenance: MaintenanceConfig,
}

impl Database {
    /// Build the pool. No connection is opened until the first
    /// `get_connection` or prewarm.
    pub fn init(
        config: DatabaseConfig,
        cache: Arc<CredentialCache>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let factory = ConnectionFactory::new(connector, cache.clone(), config.target, config.credentials);
        Self {
            pool: ConnectionPool::new(config.pool, factory),
            cache,
            maintenance: config.maintenance,
        }
    }

    /// Check out a connection, waiting up to the configured acquire timeout.
    pub async fn get_connection(&self) -> DbResult<Connection> {
        self.pool.acquire(self.pool.config().acquire_timeout).await
    }

    /// Return a connection. Never fails.
    pub async fn close_connection(&self, conn: Connection) {
        self.pool.release(conn).await;
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn cache(&self) -> &Arc<CredentialCache> {
        &self.cache
    }

    pub async fn stats(&self) -> PoolStats {
        self.pool.stats().await
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    /// Drop one cached secret, or all of them. Returns how many were removed.
    pub async fn clear_cache(&self, name: Option<&str>) -> usize {
        self.cache.clear(name).await
    }

    /// Prewarm to `target`, or to the configured prewarm target.
    pub async fn prewarm(&self, target: Option<usize>) -> PrewarmReport {
        self.prewarmer()
            .prewarm(target.unwrap_or(self.maintenance.prewarm_target))
            .await
    }

    pub async fn sweep(&self) -> SweepReport {
        self.reaper().sweep().await
    }

    pub fn reaper(&self) -> Reaper {
        Reaper::new(self.pool.clone())
    }

    pub fn prewarmer(&self) -> Prewarmer {
        Prewarmer::new(self.pool.clone())
    }

    pub fn maintenance(&self) -> Maintenance {
        Maintenance::new(self.reaper(), self.prewarmer(), self.maintenance.clone())
    }

    pub fn rewarm_reports(&self) -> watch::Receiver<Option<RewarmReport>> {
        self.pool.rewarm_reports()
    }

    /// Refuse further checkouts and close every pooled connection.
    pub async fn shutdown(&self) {
        let closed = self.pool.shutdown().await;
        tracing::info!(closed, "database shut down");
    }
}
