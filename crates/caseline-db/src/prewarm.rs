//! Top the pool up to a target depth ahead of demand.

use serde::Serialize;
use tokio::sync::TryAcquireError;

use crate::error::DbResult;
use crate::factory::Opened;
use crate::pool::ConnectionPool;

/// How [`ConnectionPool::fill`] opens connections.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Creation {
    /// Through the factory's rotation-aware path.
    WithRecovery,
    /// Single attempt; used by the rewarm so it never recurses into recovery.
    Open,
}

/// Outcome of one prewarm.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PrewarmReport {
    pub target: usize,
    pub created: usize,
    /// Pool depth when the prewarm finished.
    pub depth: usize,
    /// First creation failure, which ended the prewarm early.
    pub error: Option<String>,
}

impl ConnectionPool {
    /// Open connections into the pool until it holds `target`. Stops when
    /// no capacity slot is free or the idle stack is full, on a stale
    /// generation, or at the first failure.
    pub(crate) async fn fill(&self, target: usize, creation: Creation) -> PrewarmReport {
        let shortfall = target.saturating_sub(self.depth().await);
        let mut created = 0;
        let mut error = None;

        for _ in 0..shortfall {
            let slot = match self.shared.slots.clone().try_acquire_owned() {
                Ok(slot) => slot,
                Err(TryAcquireError::NoPermits) => {
                    tracing::debug!(created, "prewarm stopped at capacity");
                    break;
                }
                Err(TryAcquireError::Closed) => break,
            };

            let opened = match self.open_for_fill(creation).await {
                Ok(opened) => opened,
                Err(e) => {
                    tracing::warn!(created, error = %e, "prewarm connection failed");
                    error = Some(e.to_string());
                    break;
                }
            };
            if !self.park(opened, slot).await {
                break;
            }
            created += 1;
        }

        PrewarmReport {
            target,
            created,
            depth: self.depth().await,
            error,
        }
    }

    async fn open_for_fill(&self, creation: Creation) -> DbResult<Opened> {
        match creation {
            Creation::WithRecovery => self.shared.factory.create(self).await,
            Creation::Open => {
                let generation = self.generation();
                let session = self.shared.factory.open().await?;
                Ok(Opened {
                    session,
                    generation,
                })
            }
        }
    }
}

/// Keeps the pool at a target depth.
#[derive(Clone, Debug)]
pub struct Prewarmer {
    pool: ConnectionPool,
}

impl Prewarmer {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// Create up to `target - depth` connections. Never waits for capacity.
    pub async fn prewarm(&self, target: usize) -> PrewarmReport {
        let report = self.pool.fill(target, Creation::WithRecovery).await;
        tracing::info!(
            target = report.target,
            created = report.created,
            depth = report.depth,
            failed = report.error.is_some(),
            "prewarm complete"
        );
        report
    }
}
