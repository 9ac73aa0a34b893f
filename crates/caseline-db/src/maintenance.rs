//! Background driver for the reaper and the periodic prewarm.

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::info;

use crate::config::MaintenanceConfig;
use crate::prewarm::Prewarmer;
use crate::reaper::Reaper;

pub struct Maintenance {
    reaper: Reaper,
    prewarmer: Prewarmer,
    config: MaintenanceConfig,
}

impl Maintenance {
    pub fn new(reaper: Reaper, prewarmer: Prewarmer, config: MaintenanceConfig) -> Self {
        Self {
            reaper,
            prewarmer,
            config,
        }
    }

    /// Sweep and prewarm on their intervals until `shutdown` changes.
    ///
    /// The first run of each happens one full interval after start.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            reaper_interval_secs = self.config.reaper_interval.as_secs(),
            prewarm_interval_secs = self.config.prewarm_interval.as_secs(),
            prewarm_target = self.config.prewarm_target,
            "pool maintenance started"
        );

        let mut reap = tokio::time::interval_at(
            Instant::now() + self.config.reaper_interval,
            self.config.reaper_interval,
        );
        reap.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut prewarm = tokio::time::interval_at(
            Instant::now() + self.config.prewarm_interval,
            self.config.prewarm_interval,
        );
        prewarm.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = reap.tick() => {
                    self.reaper.sweep().await;
                }
                _ = prewarm.tick() => {
                    let report = self.prewarmer.prewarm(self.config.prewarm_target).await;
                    if let Some(error) = report.error {
                        tracing::error!(
                            created = report.created,
                            depth = report.depth,
                            error = %error,
                            "periodic prewarm failed"
                        );
                    }
                }
                _ = shutdown.changed() => {
                    info!("pool maintenance shutting down");
                    break;
                }
            }
        }
    }
}

impl std::fmt::Debug for Maintenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Maintenance")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, small_config};
    use std::time::Duration;

    fn maintenance(h: &Harness, config: MaintenanceConfig) -> Maintenance {
        Maintenance::new(
            Reaper::new(h.pool.clone()),
            Prewarmer::new(h.pool.clone()),
            config,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn prewarms_on_interval_and_stops_on_shutdown() {
        let h = Harness::new(small_config(3, 0));
        let config = MaintenanceConfig {
            prewarm_interval: Duration::from_secs(60),
            prewarm_target: 3,
            ..MaintenanceConfig::default()
        };
        let (tx, rx) = watch::channel(false);
        let task = {
            let m = maintenance(&h, config);
            tokio::spawn(async move { m.run(rx).await })
        };

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.pool.depth().await, 0);

        tokio::time::sleep(Duration::from_secs(40)).await;
        assert_eq!(h.pool.depth().await, 3);

        tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn reaps_on_interval() {
        let h = Harness::new(small_config(2, 0));
        Prewarmer::new(h.pool.clone()).prewarm(2).await;
        let config = MaintenanceConfig {
            reaper_interval: Duration::from_secs(600),
            prewarm_interval: Duration::from_secs(24 * 3600),
            prewarm_target: 0,
        };
        let (tx, rx) = watch::channel(false);
        let task = {
            let m = maintenance(&h, config);
            tokio::spawn(async move { m.run(rx).await })
        };

        tokio::time::sleep(Duration::from_secs(601)).await;
        assert_eq!(h.pool.depth().await, 0);
        assert_eq!(h.db.closed(), 2);

        tx.send(true).unwrap();
        task.await.unwrap();
    }
}
