//! Periodic eviction of old, idle or dead pooled connections.
//!
//! Only pooled connections are examined; checked-out connections are never
//! touched. When the secret service has not returned a successful fetch
//! within the degradation window, both thresholds are doubled for the
//! sweep: if new connections may not be creatable, the authenticated ones
//! already open are kept longer.
//!
//! Liveness probes run with the pool lock released. Candidates are taken
//! out of the pool first, the way `acquire` pops a connection, so a slow
//! ping never stalls other pool operations.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::connection::Connection;
use crate::pool::ConnectionPool;
use crate::stats::as_secs;

/// Threshold multiplier applied while degraded.
const DEGRADED_FACTOR: u32 = 2;

/// Outcome of one sweep.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub cleaned: usize,
    pub remaining: usize,
    pub degraded: bool,
    #[serde(serialize_with = "as_secs")]
    pub idle_threshold: Duration,
    #[serde(serialize_with = "as_secs")]
    pub lifetime_threshold: Duration,
}

#[derive(Clone, Debug)]
pub struct Reaper {
    pool: ConnectionPool,
}

impl Reaper {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// Evict every pooled connection past `max_lifetime` or `max_idle_time`,
    /// or failing its liveness probe.
    pub async fn sweep(&self) -> SweepReport {
        let config = self.pool.config();
        let cache = self.pool.factory().cache();
        let health = cache.health().await;
        let degraded = health.is_degraded(cache.degradation_window());
        let factor = if degraded { DEGRADED_FACTOR } else { 1 };
        let idle_threshold = config.max_idle_time * factor;
        let lifetime_threshold = config.max_lifetime * factor;
        if degraded {
            tracing::warn!(
                consecutive_failures = health.consecutive_failures,
                idle_threshold = ?idle_threshold,
                lifetime_threshold = ?lifetime_threshold,
                "secret service degraded, extending connection thresholds"
            );
        }

        let (mut evicted, candidates) = {
            let mut state = self.pool.shared.state.lock().await;
            let now = Instant::now();
            let mut evicted: Vec<(Connection, &'static str)> = Vec::new();
            let mut candidates = Vec::with_capacity(state.idle.len());

            for conn in std::mem::take(&mut state.idle) {
                let reason = match state.metadata.get(&conn.id()) {
                    None => Some("untracked"),
                    Some(meta) if now.saturating_duration_since(meta.created_at) > lifetime_threshold => {
                        Some("max lifetime exceeded")
                    }
                    Some(meta) if now.saturating_duration_since(meta.last_used_at) > idle_threshold => {
                        Some("max idle time exceeded")
                    }
                    Some(_) => None,
                };
                match reason {
                    Some(reason) => evicted.push((conn, reason)),
                    None => candidates.push(conn),
                }
            }
            (evicted, candidates)
        };

        let mut survivors = Vec::with_capacity(candidates.len());
        let mut failed = 0;
        for mut conn in candidates {
            match conn.validate(config.validation_timeout).await {
                Ok(()) => survivors.push(conn),
                Err(e) => {
                    tracing::warn!(connection = conn.id(), error = %e, "pooled connection failed validation");
                    failed += 1;
                    evicted.push((conn, "failed validation"));
                }
            }
        }

        let remaining = {
            let mut state = self.pool.shared.state.lock().await;
            let generation = self.pool.generation();
            let closed = self.pool.is_closed();
            let mut returned = Vec::with_capacity(survivors.len());
            for conn in survivors {
                // A drain or shutdown during the probes retired these.
                if closed || conn.generation() != generation {
                    evicted.push((conn, "credential generation retired"));
                } else {
                    returned.push(conn);
                }
            }
            let excess = returned
                .len()
                .saturating_sub(config.pool_size.saturating_sub(state.idle.len()));
            evicted.extend(returned.drain(..excess).map(|conn| (conn, "pool full")));
            // Connections returned during the sweep are more recently used.
            returned.append(&mut state.idle);
            state.idle = returned;

            for (conn, _) in &evicted {
                state.metadata.remove(&conn.id());
            }
            state.counters.validation_failures += failed;
            state.counters.closed += evicted.len() as u64;
            state.idle.len()
        };
        if remaining > 0 {
            self.pool.notify_returned();
        }

        let cleaned = evicted.len();
        for (conn, reason) in evicted {
            conn.close_quietly(reason).await;
        }

        tracing::info!(cleaned, remaining, degraded, "reaper sweep complete");
        SweepReport {
            cleaned,
            remaining,
            degraded,
            idle_threshold,
            lifetime_threshold,
        }
    }
}
