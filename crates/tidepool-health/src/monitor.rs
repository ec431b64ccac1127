//! Health monitor — background task that probes idle connections.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use tidepool_core::HealthSettings;
use tidepool_pool::Pool;

use crate::checker::{ProbeReport, ProbeResult, rescore};

/// Probes a pool's idle connections and recycles the ones that go bad.
pub struct HealthMonitor {
    pool: Arc<Pool>,
    settings: HealthSettings,
}

impl HealthMonitor {
    pub fn new(pool: Arc<Pool>) -> Self {
        let settings = pool.settings().health.clone();
        Self { pool, settings }
    }

    /// Run one probe sweep.
    ///
    /// Connections are checked out one at a time, each hidden from
    /// `acquire()` only while its own probe runs. One taken by a caller
    /// in the meantime is skipped.
    pub async fn check_once(&self) -> ProbeReport {
        let mut report = ProbeReport::default();
        if self.pool.is_shutting_down() {
            return report;
        }

        for id in self.pool.probe_candidates().await {
            let Some(target) = self.pool.begin_probe(id).await else {
                continue;
            };
            let result = ProbeResult::from(target.run(&self.settings.probe_statement).await);
            report.probed += 1;
            match result {
                ProbeResult::Passed => report.passed += 1,
                ProbeResult::Failed => report.failed += 1,
            }

            let needs_recycle = self
                .pool
                .finish_probe(target.id, result == ProbeResult::Passed, |score| {
                    rescore(score, result, &self.settings)
                })
                .await;

            if needs_recycle {
                warn!(
                    pool = %self.pool.name(),
                    connection_id = %target.id,
                    threshold = self.pool.settings().health_threshold,
                    "connection failed health threshold, recycling"
                );
                if let Err(e) = self.pool.recycle(target.id).await {
                    error!(
                        pool = %self.pool.name(),
                        connection_id = %target.id,
                        error = %e,
                        "failed to replace recycled connection"
                    );
                }
                report.recycled.push(target.id);
            }
        }

        report.replenished = self.pool.ensure_min_size().await;
        if report.replenished > 0 {
            info!(
                pool = %self.pool.name(),
                opened = report.replenished,
                "restored pool to minimum size"
            );
        }

        debug!(
            pool = %self.pool.name(),
            probed = report.probed,
            failed = report.failed,
            recycled = report.recycled.len(),
            "health sweep complete"
        );
        report
    }

    /// Run the probe loop until `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.settings.interval();
        info!(
            pool = %self.pool.name(),
            interval_ms = interval.as_millis() as u64,
            "health monitor started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if self.pool.is_shutting_down() {
                        break;
                    }
                    self.check_once().await;
                }
                _ = shutdown.changed() => {
                    debug!(pool = %self.pool.name(), "health monitor shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tidepool_core::{AcquireHint, ConnectionState, PoolSettings};
    use tidepool_metrics::MetricsCollector;
    use tidepool_pool::testing::{DriverControls, MemoryFactory};

    async fn make_pool(settings: PoolSettings) -> (Arc<Pool>, Arc<DriverControls>) {
        let factory = Arc::new(MemoryFactory::new());
        let controls = factory.controls();
        let metrics = Arc::new(MetricsCollector::new("health-test"));
        let pool = Pool::initialize(settings, factory, metrics, &[]).await.unwrap();
        (Arc::new(pool), controls)
    }

    fn settings(threshold: u8, penalty: u8) -> PoolSettings {
        let mut s = PoolSettings {
            host: "db.local".into(),
            database: "app".into(),
            min_connections: 2,
            max_connections: 4,
            health_threshold: threshold,
            ..PoolSettings::default()
        };
        s.health.penalty_step = penalty;
        s
    }

    #[tokio::test]
    async fn healthy_sweep_recycles_nothing() {
        let (pool, controls) = make_pool(settings(50, 25)).await;
        let monitor = HealthMonitor::new(Arc::clone(&pool));

        let report = monitor.check_once().await;
        assert_eq!(report.probed, 2);
        assert_eq!(report.passed, 2);
        assert!(report.recycled.is_empty());
        assert_eq!(controls.statements(), vec!["SELECT 1", "SELECT 1"]);
    }

    #[tokio::test]
    async fn failing_probe_recycles_and_restores_size() {
        let (pool, controls) = make_pool(settings(70, 35)).await;
        let monitor = HealthMonitor::new(Arc::clone(&pool));
        let before: Vec<_> = pool.connections().await.iter().map(|c| c.id).collect();

        controls.set_healthy(false);
        let report = monitor.check_once().await;

        // 100 - 35 = 65 <= 70.
        assert_eq!(report.failed, 2);
        assert_eq!(report.recycled, before);
        assert_eq!(pool.size().await, 2);
        let after = pool.connections().await;
        assert!(after.iter().all(|c| !before.contains(&c.id)));
        assert!(after.iter().all(|c| c.health_score == 100));
    }

    #[tokio::test]
    async fn score_above_threshold_survives_failure() {
        let (pool, controls) = make_pool(settings(50, 25)).await;
        let monitor = HealthMonitor::new(Arc::clone(&pool));

        controls.set_healthy(false);
        let report = monitor.check_once().await;
        assert!(report.recycled.is_empty());
        for conn in pool.connections().await {
            assert_eq!(conn.health_score, 75);
            assert_eq!(conn.error_count, 1);
            assert_eq!(conn.state, ConnectionState::Idle);
        }

        controls.set_healthy(true);
        monitor.check_once().await;
        assert!(pool.connections().await.iter().all(|c| c.health_score == 85));
    }

    #[tokio::test]
    async fn active_connections_are_not_probed() {
        let (pool, controls) = make_pool(settings(50, 25)).await;
        let monitor = HealthMonitor::new(Arc::clone(&pool));
        let held = pool
            .acquire(Duration::from_millis(50), AcquireHint::any())
            .await
            .unwrap();

        controls.set_healthy(false);
        let report = monitor.check_once().await;
        assert_eq!(report.probed, 1);
        let info = pool.connection_info(held).await.unwrap();
        assert_eq!(info.health_score, 100);
        assert_eq!(info.state, ConnectionState::Active);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_probe_leaves_other_connections_available() {
        let mut s = settings(50, 25);
        s.max_connections = 2;
        let (pool, controls) = make_pool(s).await;
        controls.set_ping_delay(Duration::from_millis(150));
        let monitor = HealthMonitor::new(Arc::clone(&pool));

        let sweep = tokio::spawn(async move { monitor.check_once().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let held = pool
            .acquire(Duration::from_millis(100), AcquireHint::any())
            .await
            .unwrap();

        let report = sweep.await.unwrap();
        assert_eq!(report.probed, 1);
        assert_eq!(pool.connection_info(held).await.unwrap().state, ConnectionState::Active);
        pool.release(held).await.unwrap();
    }

    #[tokio::test]
    async fn sweep_replenishes_after_failed_replacement() {
        let (pool, controls) = make_pool(settings(70, 35)).await;
        let monitor = HealthMonitor::new(Arc::clone(&pool));

        controls.set_healthy(false);
        controls.set_refuse_connects(true);
        monitor.check_once().await;
        assert_eq!(pool.size().await, 0);

        controls.set_healthy(true);
        controls.set_refuse_connects(false);
        let report = monitor.check_once().await;
        assert_eq!(report.replenished, 2);
        assert_eq!(pool.size().await, 2);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_signal() {
        let mut s = settings(50, 25);
        s.health.interval_ms = 10;
        let (pool, _) = make_pool(s).await;
        let monitor = HealthMonitor::new(pool);
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(async move { monitor.run(rx).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
