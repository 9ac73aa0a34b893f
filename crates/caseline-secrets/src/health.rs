//! Process-wide secret-service reachability.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// Summary of recent secret-service fetch outcomes.
///
/// Not per secret: one instance is shared by every lookup made through a
/// [`CredentialCache`](crate::CredentialCache). The reaper reads it to decide
/// whether to preserve already-authenticated connections.
#[derive(Clone, Debug, Default)]
pub struct SecretsHealth {
    pub last_success: Option<Instant>,
    pub last_failure: Option<Instant>,
    pub consecutive_failures: u32,
    pub total_fetches: u64,
    pub total_failures: u64,
}

impl SecretsHealth {
    pub fn record_success(&mut self) {
        self.last_success = Some(Instant::now());
        self.consecutive_failures = 0;
        self.total_fetches += 1;
    }

    pub fn record_failure(&mut self) {
        self.last_failure = Some(Instant::now());
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.total_fetches += 1;
        self.total_failures += 1;
    }

    /// Time since the last successful fetch.
    pub fn since_last_success(&self) -> Option<Duration> {
        self.last_success.map(|t| t.elapsed())
    }

    /// Whether the secret service should be treated as degraded.
    ///
    /// True when the last success is older than `window`, or when no fetch
    /// has ever succeeded and at least one has failed. A process that has
    /// not fetched anything yet is not degraded.
    pub fn is_degraded(&self, window: Duration) -> bool {
        match self.last_success {
            Some(at) => at.elapsed() > window,
            None => self.total_failures > 0,
        }
    }

    pub fn snapshot(&self, window: Duration) -> HealthSummary {
        HealthSummary {
            degraded: self.is_degraded(window),
            secs_since_success: self.since_last_success().map(|d| d.as_secs()),
            consecutive_failures: self.consecutive_failures,
            total_fetches: self.total_fetches,
            total_failures: self.total_failures,
        }
    }
}

/// Serializable view of [`SecretsHealth`] for operational tooling.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthSummary {
    pub degraded: bool,
    pub secs_since_success: Option<u64>,
    pub consecutive_failures: u32,
    pub total_fetches: u64,
    pub total_failures: u64,
}
