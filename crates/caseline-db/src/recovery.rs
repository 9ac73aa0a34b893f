//! Rotation recovery: invalidate, drain, rewarm in the background.
//!
//! ```text
//! credentials_rejected(observed)          (called by the factory on an auth failure)
//!   → generation moved past `observed`?   → someone already recovered, return
//!   → cache.invalidate(secret)
//!   → lock pool, drain, generation += 1, unlock
//!   → close drained sessions
//!   → submit rewarm (queue of one; extra submissions dropped)
//!
//! rewarm worker (one per pool, started on first submission)
//!   → fetch credential (warms the cache)
//!   → open up to pool_size / 2 connections into the pool
//!   → publish RewarmReport on the watch channel
//! ```
//!
//! The synchronous phase runs on the caller's task so its retry sees an
//! empty pool and a cold cache entry. The rewarm never blocks a caller and
//! its failures are logged and reported, not propagated.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};

use crate::factory::RotationSignal;
use crate::pool::{ConnectionPool, PoolShared};
use crate::prewarm::Creation;

/// Outcome of one background rewarm.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RewarmReport {
    /// 1 for the first rewarm of this pool, incremented per run.
    pub sequence: u64,
    pub created: usize,
    /// Pool depth when the rewarm finished.
    pub depth: usize,
    pub error: Option<String>,
}

/// Rewarm worker handle and report channel, owned by the pool.
pub(crate) struct Rewarm {
    queue: OnceLock<mpsc::Sender<()>>,
    reports: watch::Sender<Option<RewarmReport>>,
    sequence: AtomicU64,
}

impl Rewarm {
    pub(crate) fn new() -> Self {
        let (reports, _) = watch::channel(None);
        Self {
            queue: OnceLock::new(),
            reports,
            sequence: AtomicU64::new(0),
        }
    }
}

impl ConnectionPool {
    /// Invalidate the credential, drain the pool and schedule a rewarm.
    ///
    /// Safe to call concurrently; each call drains whatever is pooled at the
    /// time. Must be called from within a tokio runtime.
    pub async fn recover(&self) {
        self.recover_from(None).await;
    }

    /// Subscribe to rewarm outcomes. The current value is the last report,
    /// or `None` if no rewarm has finished yet.
    pub fn rewarm_reports(&self) -> watch::Receiver<Option<RewarmReport>> {
        self.shared.rewarm.reports.subscribe()
    }

    /// Recovery on behalf of a caller that saw a rejection at generation
    /// `observed`. Skipped if a drain has happened since. Returns whether
    /// this call drained the pool.
    async fn recover_from(&self, observed: Option<u64>) -> bool {
        let already_recovered = |pool: &Self| observed.is_some_and(|o| pool.generation() != o);
        if already_recovered(self) {
            tracing::debug!(
                observed = ?observed,
                generation = self.generation(),
                "rotation already handled"
            );
            return false;
        }

        let secret = self.shared.factory.source().secret_name.as_str();
        self.shared.factory.cache().invalidate(secret).await;

        let drained = {
            let mut state = self.shared.state.lock().await;
            if already_recovered(self) {
                return false;
            }
            self.drain_locked(&mut state)
        };
        let count = drained.len();
        for conn in drained {
            conn.close_quietly("credential rotated").await;
        }

        tracing::warn!(
            secret = %secret,
            generation = self.generation(),
            drained = count,
            "credential rotation recovery: cache invalidated, pool drained"
        );
        self.schedule_rewarm();
        true
    }

    fn schedule_rewarm(&self) {
        let queue = self.shared.rewarm.queue.get_or_init(|| {
            let (tx, rx) = mpsc::channel(1);
            tokio::spawn(rewarm_worker(Arc::downgrade(&self.shared), rx));
            tx
        });
        match queue.try_send(()) {
            Ok(()) => tracing::debug!("rewarm scheduled"),
            Err(TrySendError::Full(())) => tracing::debug!("rewarm already pending"),
            Err(TrySendError::Closed(())) => tracing::error!("rewarm worker has stopped"),
        }
    }

    async fn rewarm(&self) -> RewarmReport {
        let sequence = self.shared.rewarm.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let target = self.shared.config.rewarm_target();

        let (created, error) = match self.shared.factory.credentials().await {
            Ok(_) => {
                let report = self.fill(target, Creation::Open).await;
                (report.created, report.error)
            }
            Err(e) => (0, Some(e.to_string())),
        };
        let depth = self.depth().await;

        match &error {
            None => tracing::info!(sequence, target, created, depth, "pool rewarmed"),
            Some(error) => tracing::error!(
                sequence,
                target,
                created,
                depth,
                error = %error,
                "pool rewarm incomplete"
            ),
        }

        let report = RewarmReport {
            sequence,
            created,
            depth,
            error,
        };
        self.shared.rewarm.reports.send_replace(Some(report.clone()));
        report
    }
}

/// Runs queued rewarms until the pool is dropped.
async fn rewarm_worker(shared: Weak<PoolShared>, mut queue: mpsc::Receiver<()>) {
    while queue.recv().await.is_some() {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        ConnectionPool { shared }.rewarm().await;
    }
    tracing::debug!("rewarm worker stopped");
}

#[async_trait]
impl RotationSignal for ConnectionPool {
    fn generation(&self) -> u64 {
        ConnectionPool::generation(self)
    }

    async fn credentials_rejected(&self, observed: u64) {
        self.recover_from(Some(observed)).await;
    }
}
