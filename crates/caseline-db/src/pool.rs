//! Bounded connection pool.
//!
//! # Architecture
//!
//! ```text
//! acquire(timeout)
//!   → idle connection?      → ping (validation_timeout) → ok: touch metadata, return
//!                                                       → failed: close, reuse its slot to create
//!   → free capacity slot?   → factory.create() → admit (generation check) → return
//!   → neither               → wait for a returned connection or a freed slot, up to timeout
//! ```
//!
//! Every step, creation included, is bounded by the caller's deadline; on
//! expiry the capacity slot is released and nothing is left half-registered.
//!
//! Live connections are bounded by a semaphore of `pool_size + max_overflow`
//! permits. Each [`Connection`] owns one permit for its whole life, so a
//! connection that is dropped instead of released still frees its slot.
//!
//! At most `pool_size` connections are kept idle; overflow connections
//! opened under load are closed when released into a full pool.
//!
//! Idle connections and the metadata map sit behind one mutex. Connection
//! creation and liveness probes never happen while it is held.
//!
//! Every drain increments the pool's credential generation. A connection is
//! only ever placed in the pool or handed to a caller if its generation is
//! current, so nothing opened with a pre-rotation credential survives a drain.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;

use crate::config::PoolConfig;
use crate::connection::{Connection, ConnectionMetadata, Session};
use crate::error::{DbError, DbResult};
use crate::factory::{ConnectionFactory, Opened};
use crate::recovery::Rewarm;
use crate::stats::{DurationSummary, PoolStats};

/// Structural pool state, guarded by a single mutex.
pub(crate) struct PoolState {
    /// Ready connections, most recently returned last.
    pub(crate) idle: Vec<Connection>,
    /// Metadata of every tracked connection, idle or checked out.
    pub(crate) metadata: HashMap<u64, ConnectionMetadata>,
    pub(crate) counters: PoolCounters,
}

#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub(crate) drains: u64,
    pub(crate) validation_failures: u64,
    pub(crate) created: u64,
    pub(crate) closed: u64,
}

pub(crate) struct PoolShared {
    pub(crate) config: PoolConfig,
    pub(crate) factory: ConnectionFactory,
    pub(crate) state: Mutex<PoolState>,
    /// Capacity slots; one permit per live connection.
    pub(crate) slots: Arc<Semaphore>,
    /// Signalled whenever a connection is placed in the pool.
    pub(crate) returned: Notify,
    /// Written only while `state` is locked.
    generation: AtomicU64,
    next_id: AtomicU64,
    /// Outside `state` so a timed-out acquire never waits for the lock.
    timeouts: AtomicU64,
    pub(crate) rewarm: Rewarm,
}

/// Process-wide pool of database connections.
///
/// Cheap to clone; all clones share the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    pub(crate) shared: Arc<PoolShared>,
}

impl ConnectionPool {
    /// Create an empty pool. Connections are opened on demand or by a
    /// prewarm.
    pub fn new(config: PoolConfig, factory: ConnectionFactory) -> Self {
        let capacity = config.capacity();
        tracing::info!(
            pool_size = config.pool_size,
            max_overflow = config.max_overflow,
            capacity,
            db = %factory.target(),
            "connection pool created"
        );
        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    idle: Vec::with_capacity(capacity),
                    metadata: HashMap::new(),
                    counters: PoolCounters::default(),
                }),
                slots: Arc::new(Semaphore::new(capacity)),
                returned: Notify::new(),
                generation: AtomicU64::new(0),
                next_id: AtomicU64::new(1),
                timeouts: AtomicU64::new(0),
                rewarm: Rewarm::new(),
                config,
                factory,
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn factory(&self) -> &ConnectionFactory {
        &self.shared.factory
    }

    /// Current credential generation.
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.slots.is_closed()
    }

    /// Number of connections ready in the pool.
    pub async fn depth(&self) -> usize {
        self.shared.state.lock().await.idle.len()
    }

    /// Check out a connection, waiting at most `timeout` for one.
    ///
    /// Pooled connections are validated first; one that fails its liveness
    /// probe is closed and replaced by a new connection without further
    /// waiting. When the pool is empty a new connection is opened if
    /// capacity allows.
    ///
    /// # Errors
    ///
    /// - [`DbError::PoolTimeout`] if no usable connection was obtained
    ///   within `timeout`, including a creation that did not finish in time
    /// - [`DbError::Closed`] after [`shutdown`](Self::shutdown)
    /// - any error from opening a new connection
    pub async fn acquire(&self, timeout: Duration) -> DbResult<Connection> {
        let deadline = Instant::now() + timeout;

        loop {
            let returned = self.shared.returned.notified();
            tokio::pin!(returned);
            // Register before looking at the pool so a release between the
            // check and the wait is not missed.
            returned.as_mut().enable();

            if self.is_closed() {
                return Err(DbError::Closed);
            }

            let popped = match tokio::time::timeout_at(deadline, self.shared.state.lock()).await {
                Ok(mut state) => state.idle.pop(),
                Err(_) => return Err(self.timed_out(timeout)),
            };
            let slot = match popped {
                Some(mut conn) => {
                    let limit = self
                        .shared
                        .config
                        .validation_timeout
                        .min(deadline.saturating_duration_since(Instant::now()));
                    match conn.validate(limit).await {
                        Ok(()) => {
                            let mut state = self.shared.state.lock().await;
                            // A drain may have run while the probe was in flight.
                            if conn.generation() == self.generation() {
                                state.metadata.entry(conn.id()).or_default().touch();
                                tracing::debug!(connection = conn.id(), "reused pooled connection");
                                return Ok(conn);
                            }
                            drop(state);
                            self.retire(conn, "credential generation retired").await;
                            continue;
                        }
                        Err(e) => {
                            tracing::warn!(
                                connection = conn.id(),
                                error = %e,
                                "pooled connection failed validation, replacing"
                            );
                            self.retire_for_slot(conn, "failed validation").await
                        }
                    }
                }
                None => match self.shared.slots.clone().try_acquire_owned() {
                    Ok(slot) => slot,
                    Err(TryAcquireError::Closed) => return Err(DbError::Closed),
                    Err(TryAcquireError::NoPermits) => {
                        tokio::select! {
                            _ = &mut returned => continue,
                            slot = self.shared.slots.clone().acquire_owned() => {
                                slot.map_err(|_| DbError::Closed)?
                            }
                            _ = tokio::time::sleep_until(deadline) => {
                                return Err(self.timed_out(timeout));
                            }
                        }
                    }
                },
            };

            // An early return releases `slot`.
            let opened = match tokio::time::timeout_at(deadline, self.shared.factory.create(self)).await {
                Ok(opened) => opened?,
                Err(_) => return Err(self.timed_out(timeout)),
            };
            if let Some(conn) = self.admit(opened, slot).await {
                tracing::debug!(connection = conn.id(), "opened new connection");
                return Ok(conn);
            }
            if Instant::now() >= deadline {
                return Err(self.timed_out(timeout));
            }
        }
    }

    /// Return a connection to the pool.
    ///
    /// Rolls back any open transaction and puts the connection back if it is
    /// still usable, current and there is room; otherwise closes it. Never
    /// fails: rollback and close errors are logged.
    pub async fn release(&self, mut conn: Connection) {
        let reason = if self.is_closed() {
            Some("pool closed")
        } else if conn.generation() != self.generation() {
            Some("credential generation retired")
        } else if !conn.is_open() {
            Some("session closed")
        } else {
            match conn.session().rollback().await {
                Ok(()) => None,
                Err(e) => {
                    tracing::warn!(connection = conn.id(), error = %e, "rollback on release failed");
                    Some("rollback failed")
                }
            }
        };
        if let Some(reason) = reason {
            self.retire(conn, reason).await;
            return;
        }

        let mut state = self.shared.state.lock().await;
        let reason = if conn.generation() != self.generation() {
            Some("credential generation retired")
        } else if state.idle.len() >= self.shared.config.pool_size {
            Some("pool full")
        } else {
            None
        };
        match reason {
            None => {
                state.metadata.entry(conn.id()).or_default().touch();
                tracing::debug!(
                    connection = conn.id(),
                    depth = state.idle.len() + 1,
                    "returned connection to pool"
                );
                state.idle.push(conn);
                drop(state);
                self.shared.returned.notify_one();
            }
            Some(reason) => {
                drop(state);
                self.retire(conn, reason).await;
            }
        }
    }

    /// Close every pooled connection and retire the current credential
    /// generation. Checked-out connections are closed when released.
    ///
    /// Returns the number of pooled connections closed.
    pub async fn drain_all(&self) -> usize {
        let drained = {
            let mut state = self.shared.state.lock().await;
            self.drain_locked(&mut state)
        };
        let count = drained.len();
        for conn in drained {
            conn.close_quietly("drained").await;
        }
        count
    }

    /// Drain with the state lock already held. The caller closes the
    /// returned connections after unlocking.
    pub(crate) fn drain_locked(&self, state: &mut PoolState) -> Vec<Connection> {
        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let drained = std::mem::take(&mut state.idle);
        let tracked = state.metadata.len();
        state.metadata.clear();
        state.counters.drains += 1;
        state.counters.closed += drained.len() as u64;
        tracing::info!(
            generation,
            drained = drained.len(),
            checked_out = tracked.saturating_sub(drained.len()),
            "drained connection pool"
        );
        drained
    }

    /// Stop handing out connections and close everything pooled.
    ///
    /// Pending and future `acquire` calls fail with [`DbError::Closed`];
    /// connections released afterwards are closed.
    pub async fn shutdown(&self) -> usize {
        self.shared.slots.close();
        let closed = self.drain_all().await;
        tracing::info!(closed, "connection pool shut down");
        closed
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock().await;
        let now = Instant::now();
        let config = &self.shared.config;
        let capacity = config.capacity();
        let live = capacity.saturating_sub(self.shared.slots.available_permits());
        let depth = state.idle.len();

        PoolStats {
            depth,
            checked_out: live.saturating_sub(depth),
            live,
            capacity,
            pool_size: config.pool_size,
            max_overflow: config.max_overflow,
            generation: self.generation(),
            age: DurationSummary::from_durations(
                state
                    .metadata
                    .values()
                    .map(|m| now.saturating_duration_since(m.created_at)),
            ),
            idle: DurationSummary::from_durations(
                state
                    .metadata
                    .values()
                    .map(|m| now.saturating_duration_since(m.last_used_at)),
            ),
            timeouts: self.shared.timeouts.load(Ordering::Relaxed),
            drains: state.counters.drains,
            validation_failures: state.counters.validation_failures,
            created: state.counters.created,
            closed: state.counters.closed,
        }
    }

    /// Log pool statistics at `tracing::info` level.
    pub async fn log_stats(&self) {
        let stats = self.stats().await;
        tracing::info!(
            depth = stats.depth,
            checked_out = stats.checked_out,
            capacity = stats.capacity,
            generation = stats.generation,
            max_age_secs = stats.age.max_secs,
            max_idle_secs = stats.idle.max_secs,
            timeouts = stats.timeouts,
            drains = stats.drains,
            "pool statistics"
        );
    }

    // ── Internal ──────────────────────────────────────────────────────

    /// Wake acquirers waiting for a pooled connection.
    pub(crate) fn notify_returned(&self) {
        self.shared.returned.notify_waiters();
    }

    /// Track a freshly opened session and hand it to the caller, or `None`
    /// if its generation was drained while it was being opened.
    pub(crate) async fn admit(&self, opened: Opened, slot: OwnedSemaphorePermit) -> Option<Connection> {
        let generation = opened.generation;
        let (stale, slot) = {
            let mut state = self.shared.state.lock().await;
            match self.register_locked(&mut state, opened, slot) {
                Ok(conn) => return Some(conn),
                Err(rejected) => rejected,
            }
        };
        self.discard(stale, generation, "opened across a drain").await;
        drop(slot);
        None
    }

    /// Like [`admit`](Self::admit) but places the connection in the pool.
    /// Returns false if it was stale or the pool already holds `pool_size`.
    pub(crate) async fn park(&self, opened: Opened, slot: OwnedSemaphorePermit) -> bool {
        let generation = opened.generation;
        let (session, slot, reason) = {
            let mut state = self.shared.state.lock().await;
            if state.idle.len() >= self.shared.config.pool_size {
                (opened.session, slot, "pool full")
            } else {
                match self.register_locked(&mut state, opened, slot) {
                    Ok(conn) => {
                        state.idle.push(conn);
                        drop(state);
                        self.shared.returned.notify_one();
                        return true;
                    }
                    Err((session, slot)) => (session, slot, "opened across a drain"),
                }
            }
        };
        self.discard(session, generation, reason).await;
        drop(slot);
        false
    }

    fn register_locked(
        &self,
        state: &mut PoolState,
        opened: Opened,
        slot: OwnedSemaphorePermit,
    ) -> Result<Connection, (Box<dyn Session>, OwnedSemaphorePermit)> {
        let Opened {
            session,
            generation,
        } = opened;
        if generation != self.generation() {
            return Err((session, slot));
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        state.metadata.insert(id, ConnectionMetadata::new());
        state.counters.created += 1;
        Ok(Connection::new(id, generation, session, slot))
    }

    /// Close a session that never made it into the pool. The caller holds
    /// its slot until this returns.
    async fn discard(&self, mut session: Box<dyn Session>, generation: u64, reason: &'static str) {
        tracing::debug!(
            generation,
            current = self.generation(),
            reason,
            "discarding new connection"
        );
        if let Err(e) = session.close().await {
            tracing::debug!(error = %e, "error closing discarded connection");
        }
    }

    /// Forget a connection's metadata and close it.
    pub(crate) async fn retire(&self, conn: Connection, reason: &'static str) {
        {
            let mut state = self.shared.state.lock().await;
            state.metadata.remove(&conn.id());
            state.counters.closed += 1;
        }
        conn.close_quietly(reason).await;
    }

    /// Like [`retire`](Self::retire) after a failed validation, but keeps the
    /// capacity slot for a replacement.
    async fn retire_for_slot(&self, conn: Connection, reason: &'static str) -> OwnedSemaphorePermit {
        {
            let mut state = self.shared.state.lock().await;
            state.metadata.remove(&conn.id());
            state.counters.closed += 1;
            state.counters.validation_failures += 1;
        }
        let (id, mut session, slot) = conn.into_parts();
        if let Err(e) = session.close().await {
            tracing::debug!(connection = id, reason, error = %e, "error closing connection");
        }
        slot
    }

    fn timed_out(&self, timeout: Duration) -> DbError {
        let timeouts = self.shared.timeouts.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::warn!(
            timeout = ?timeout,
            capacity = self.shared.config.capacity(),
            timeouts,
            "connection pool exhausted"
        );
        DbError::PoolTimeout(timeout)
    }
}

// ── Debug impl (cannot auto-derive due to dyn trait) ────────────────

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.shared.config)
            .field("generation", &self.generation())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
