//! Pool, credential and maintenance settings.
//!
//! All values are read once at startup and never change for the life of
//! the pool.

use std::time::Duration;

/// Sizing and timing for a [`ConnectionPool`](crate::ConnectionPool).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Steady-state number of connections (default: 5).
    pub pool_size: usize,
    /// Extra connections allowed above `pool_size` under load (default: 10).
    pub max_overflow: usize,
    /// Longest `acquire` waits for a connection or free slot (default: 5s).
    pub acquire_timeout: Duration,
    /// Idle connections older than this are reaped (default: 300s).
    pub max_idle_time: Duration,
    /// Connections older than this are reaped regardless of use (default: 3600s).
    pub max_lifetime: Duration,
    /// Bound on each liveness probe (default: 2s).
    pub validation_timeout: Duration,
}

impl PoolConfig {
    /// Upper bound on live connections.
    pub fn capacity(&self) -> usize {
        self.pool_size + self.max_overflow
    }

    /// Depth restored by the background rewarm after a drain.
    pub fn rewarm_target(&self) -> usize {
        self.pool_size / 2
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 5,
            max_overflow: 10,
            acquire_timeout: Duration::from_secs(5),
            max_idle_time: Duration::from_secs(300),
            max_lifetime: Duration::from_secs(3600),
            validation_timeout: Duration::from_secs(2),
        }
    }
}

/// Where the database username and password come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CredentialSource {
    /// Secret name (or ARN) in the secret service.
    pub secret_name: String,
    /// Cache TTL for the credential. Long, since rotation is infrequent.
    pub ttl: Duration,
    pub username_key: String,
    pub password_key: String,
}

impl CredentialSource {
    pub fn new(secret_name: impl Into<String>) -> Self {
        Self {
            secret_name: secret_name.into(),
            ..Self::default()
        }
    }
}

impl Default for CredentialSource {
    fn default() -> Self {
        Self {
            secret_name: String::new(),
            ttl: Duration::from_secs(6 * 3600),
            username_key: "username".to_string(),
            password_key: "password".to_string(),
        }
    }
}

/// Timers for the periodic reaper and prewarmer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MaintenanceConfig {
    pub reaper_interval: Duration,
    pub prewarm_interval: Duration,
    /// Depth the periodic prewarm tops the pool up to.
    pub prewarm_target: usize,
}

impl MaintenanceConfig {
    /// Defaults with the prewarm target set to `pool_size`.
    pub fn for_pool(pool: &PoolConfig) -> Self {
        Self {
            prewarm_target: pool.pool_size,
            ..Self::default()
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            reaper_interval: Duration::from_secs(3600),
            prewarm_interval: Duration::from_secs(300),
            prewarm_target: PoolConfig::default().pool_size,
        }
    }
}
