//! Read-only pool statistics for operational tooling.

use std::time::Duration;

use serde::{Serialize, Serializer};

/// Count, mean and maximum of a set of durations, in seconds.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DurationSummary {
    pub count: usize,
    pub avg_secs: f64,
    pub max_secs: f64,
}

impl DurationSummary {
    pub fn from_durations(durations: impl IntoIterator<Item = Duration>) -> Self {
        let mut count = 0usize;
        let mut total = Duration::ZERO;
        let mut max = Duration::ZERO;
        for d in durations {
            count += 1;
            total += d;
            max = max.max(d);
        }
        if count == 0 {
            return Self::default();
        }
        Self {
            count,
            avg_secs: total.as_secs_f64() / count as f64,
            max_secs: max.as_secs_f64(),
        }
    }
}

/// Snapshot returned by [`ConnectionPool::stats`](crate::ConnectionPool::stats).
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PoolStats {
    /// Connections ready in the pool.
    pub depth: usize,
    /// Capacity slots held outside the pool (checked out or being opened).
    pub checked_out: usize,
    /// `depth + checked_out`. Never exceeds `capacity`.
    pub live: usize,
    pub capacity: usize,
    pub pool_size: usize,
    pub max_overflow: usize,
    /// Credential generation; bumped by every drain.
    pub generation: u64,
    /// Time since creation of every tracked connection.
    pub age: DurationSummary,
    /// Time since last use of every tracked connection.
    pub idle: DurationSummary,
    pub timeouts: u64,
    pub drains: u64,
    pub validation_failures: u64,
    pub created: u64,
    pub closed: u64,
}

/// Serialize a [`Duration`] as whole seconds.
pub(crate) fn as_secs<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_summary_is_zero() {
        assert_eq!(
            DurationSummary::from_durations(std::iter::empty()),
            DurationSummary::default()
        );
    }

    #[test]
    fn summary_averages_and_maxes() {
        let summary = DurationSummary::from_durations([
            Duration::from_secs(10),
            Duration::from_secs(20),
            Duration::from_secs(60),
        ]);
        assert_eq!(summary.count, 3);
        assert_eq!(summary.avg_secs, 30.0);
        assert_eq!(summary.max_secs, 60.0);
    }
}
