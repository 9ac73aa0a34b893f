//! Mock database and pool builders shared by unit tests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use caseline_secrets::{CredentialCache, MemorySecretStore, SecretValue};

use crate::config::{CredentialSource, PoolConfig};
use crate::connection::{ConnectTarget, Connector, Credentials, Session};
use crate::error::ConnectError;
use crate::factory::ConnectionFactory;
use crate::pool::ConnectionPool;

pub(crate) const SECRET: &str = "prod/caseline/db";

/// Shared state of a fake database server.
#[derive(Debug)]
pub(crate) struct MockDb {
    password: Mutex<String>,
    connect_delay: Mutex<Duration>,
    ping_delay: Mutex<Duration>,
    /// Highest number of sessions open at once.
    pub peak_open: AtomicU64,
    pub connects: AtomicU64,
    pub auth_failures: AtomicU64,
    pub closed: AtomicU64,
    pub rollbacks: AtomicU64,
    pub network_down: AtomicBool,
    pub pings_fail: AtomicBool,
    pub rollbacks_fail: AtomicBool,
}

impl MockDb {
    pub fn new(password: &str) -> Arc<Self> {
        Arc::new(Self {
            password: Mutex::new(password.to_string()),
            connect_delay: Mutex::new(Duration::ZERO),
            ping_delay: Mutex::new(Duration::ZERO),
            peak_open: AtomicU64::new(0),
            connects: AtomicU64::new(0),
            auth_failures: AtomicU64::new(0),
            closed: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
            network_down: AtomicBool::new(false),
            pings_fail: AtomicBool::new(false),
            rollbacks_fail: AtomicBool::new(false),
        })
    }

    /// Change the password the server accepts. Open sessions keep working.
    pub fn rotate(&self, password: &str) {
        *self.password.lock().unwrap() = password.to_string();
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock().unwrap() = delay;
    }

    /// Make every ping take `delay` before answering.
    pub fn set_ping_delay(&self, delay: Duration) {
        *self.ping_delay.lock().unwrap() = delay;
    }

    pub fn peak_open(&self) -> u64 {
        self.peak_open.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn auth_failures(&self) -> u64 {
        self.auth_failures.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> u64 {
        self.closed.load(Ordering::SeqCst)
    }
}

pub(crate) struct MockConnector {
    pub db: Arc<MockDb>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        _target: &ConnectTarget,
        credentials: &Credentials,
    ) -> Result<Box<dyn Session>, ConnectError> {
        let delay = *self.db.connect_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.db.network_down.load(Ordering::SeqCst) {
            return Err(ConnectError::Network("connection refused".into()));
        }
        if credentials.password != *self.db.password.lock().unwrap() {
            self.db.auth_failures.fetch_add(1, Ordering::SeqCst);
            return Err(ConnectError::Authentication {
                code: 1045,
                message: format!("Access denied for user '{}'", credentials.username),
            });
        }
        let connects = self.db.connects.fetch_add(1, Ordering::SeqCst) + 1;
        let open = connects.saturating_sub(self.db.closed());
        self.db.peak_open.fetch_max(open, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            db: self.db.clone(),
            open: true,
        }))
    }
}

#[derive(Debug)]
pub(crate) struct MockSession {
    db: Arc<MockDb>,
    open: bool,
}

#[async_trait]
impl Session for MockSession {
    fn is_open(&self) -> bool {
        self.open
    }

    async fn ping(&mut self) -> Result<(), ConnectError> {
        let delay = *self.db.ping_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if !self.open || self.db.pings_fail.load(Ordering::SeqCst) {
            return Err(ConnectError::Network("broken pipe".into()));
        }
        Ok(())
    }

    async fn execute(&mut self, _sql: &str) -> Result<u64, ConnectError> {
        Ok(0)
    }

    async fn rollback(&mut self) -> Result<(), ConnectError> {
        self.db.rollbacks.fetch_add(1, Ordering::SeqCst);
        if self.db.rollbacks_fail.load(Ordering::SeqCst) {
            return Err(ConnectError::Network("connection reset".into()));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ConnectError> {
        if self.open {
            self.open = false;
            self.db.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Everything a pool test needs to poke at.
pub(crate) struct Harness {
    pub store: Arc<MemorySecretStore>,
    pub cache: Arc<CredentialCache>,
    pub db: Arc<MockDb>,
    pub pool: ConnectionPool,
}

impl Harness {
    pub fn new(config: PoolConfig) -> Self {
        let store = Arc::new(MemorySecretStore::new());
        store.insert(SECRET, credential("one"));
        let cache = Arc::new(CredentialCache::new(store.clone()));
        let db = MockDb::new("one");
        let factory = factory(&cache, &db);
        let pool = ConnectionPool::new(config, factory);
        Self {
            store,
            cache,
            db,
            pool,
        }
    }

    /// Rotate the password in both the secret service and the database.
    pub fn rotate(&self, password: &str) {
        self.store.insert(SECRET, credential(password));
        self.db.rotate(password);
    }
}

pub(crate) fn credential(password: &str) -> SecretValue {
    SecretValue::from_pairs([("username", "app"), ("password", password)])
}

pub(crate) fn factory(cache: &Arc<CredentialCache>, db: &Arc<MockDb>) -> ConnectionFactory {
    ConnectionFactory::new(
        Arc::new(MockConnector { db: db.clone() }),
        cache.clone(),
        ConnectTarget::new("db.test", 3306, "caseline"),
        CredentialSource::new(SECRET),
    )
}

pub(crate) fn small_config(pool_size: usize, max_overflow: usize) -> PoolConfig {
    PoolConfig {
        pool_size,
        max_overflow,
        acquire_timeout: Duration::from_secs(1),
        ..PoolConfig::default()
    }
}
