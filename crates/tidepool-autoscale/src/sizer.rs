//! Adaptive sizer — grows the pool under contention, shrinks it when idle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info};

use tidepool_core::SizerSettings;
use tidepool_pool::{Pool, UtilizationSample};

/// A sizing decision for one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeDecision {
    /// Open this many connections.
    Grow(usize),
    /// Close one idle connection.
    Shrink,
    NoChange,
}

/// Pure decision logic with cooldown and shrink-window tracking.
#[derive(Debug, Clone)]
pub struct ResizePolicy {
    settings: SizerSettings,
    /// Last time the pool was resized.
    last_resize: Option<Instant>,
    /// Start of the current run of low-utilization samples.
    low_since: Option<Instant>,
}

impl ResizePolicy {
    pub fn new(settings: SizerSettings) -> Self {
        Self {
            settings,
            last_resize: None,
            low_since: None,
        }
    }

    /// Decide what to do with `sample` observed at `now`.
    pub fn evaluate(&mut self, sample: &UtilizationSample, now: Instant) -> SizeDecision {
        let utilization = sample.utilization();

        if utilization < self.settings.shrink_utilization {
            self.low_since.get_or_insert(now);
        } else {
            self.low_since = None;
        }

        if let Some(last) = self.last_resize
            && now.saturating_duration_since(last) < self.settings.cooldown()
        {
            return SizeDecision::NoChange;
        }

        if utilization > self.settings.grow_utilization
            && sample.average_wait > self.settings.wait_threshold()
            && sample.total < sample.max_size
        {
            let step = self
                .settings
                .grow_step
                .max(1)
                .min(sample.max_size - sample.total);
            self.last_resize = Some(now);
            self.low_since = None;
            debug!(
                utilization,
                average_wait_ms = sample.average_wait.as_millis() as u64,
                from = sample.total,
                to = sample.total + step,
                "growing pool"
            );
            return SizeDecision::Grow(step);
        }

        if let Some(since) = self.low_since
            && now.saturating_duration_since(since) >= self.settings.shrink_window()
            && sample.total > sample.min_size
        {
            self.last_resize = Some(now);
            // Another full window of low utilization is needed for the next shrink.
            self.low_since = Some(now);
            debug!(utilization, from = sample.total, "shrinking pool");
            return SizeDecision::Shrink;
        }

        SizeDecision::NoChange
    }
}

/// Drives a [`ResizePolicy`] against a live pool.
pub struct AdaptiveSizer {
    pool: Arc<Pool>,
    policy: ResizePolicy,
    interval: Duration,
}

impl AdaptiveSizer {
    pub fn new(pool: Arc<Pool>) -> Self {
        let settings = pool.settings().sizer.clone();
        let interval = settings.interval();
        Self {
            pool,
            policy: ResizePolicy::new(settings),
            interval,
        }
    }

    /// Sample the pool, decide, and apply the decision.
    pub async fn tick(&mut self) -> SizeDecision {
        let sample = self.pool.utilization_sample().await;
        let decision = self.policy.evaluate(&sample, Instant::now());

        match decision {
            SizeDecision::Grow(n) => {
                let opened = self.pool.grow(n).await;
                let size = self.pool.size().await;
                info!(
                    pool = %self.pool.name(),
                    requested = n,
                    opened,
                    size,
                    "pool grown"
                );
            }
            SizeDecision::Shrink => {
                if let Some(id) = self.pool.shrink_one().await {
                    let size = self.pool.size().await;
                    info!(
                        pool = %self.pool.name(),
                        connection_id = %id,
                        size,
                        "pool shrunk"
                    );
                }
            }
            SizeDecision::NoChange => {}
        }
        decision
    }

    /// Run the sizing loop until `shutdown` flips.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            pool = %self.pool.name(),
            interval_ms = self.interval.as_millis() as u64,
            "adaptive sizer started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    if self.pool.is_shutting_down() {
                        break;
                    }
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    info!(pool = %self.pool.name(), "adaptive sizer shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tidepool_core::{AcquireHint, PoolSettings};
    use tidepool_metrics::MetricsCollector;
    use tidepool_pool::testing::MemoryFactory;

    fn test_settings() -> SizerSettings {
        SizerSettings {
            grow_utilization: 0.8,
            shrink_utilization: 0.3,
            wait_threshold_ms: 100,
            grow_step: 2,
            cooldown_ms: 1_000,
            shrink_window_ms: 5_000,
            ..SizerSettings::default()
        }
    }

    fn sample(total: usize, active: usize, wait_ms: u64) -> UtilizationSample {
        UtilizationSample {
            total,
            active,
            idle: total - active,
            waiting: 0,
            average_wait: Duration::from_millis(wait_ms),
            min_size: 2,
            max_size: 10,
        }
    }

    #[test]
    fn grows_on_high_utilization_and_wait() {
        let mut policy = ResizePolicy::new(test_settings());
        let now = Instant::now();
        assert_eq!(policy.evaluate(&sample(4, 4, 250), now), SizeDecision::Grow(2));
    }

    #[test]
    fn no_growth_without_wait_pressure() {
        let mut policy = ResizePolicy::new(test_settings());
        assert_eq!(
            policy.evaluate(&sample(4, 4, 10), Instant::now()),
            SizeDecision::NoChange
        );
    }

    #[test]
    fn growth_capped_at_max() {
        let mut policy = ResizePolicy::new(test_settings());
        assert_eq!(
            policy.evaluate(&sample(9, 9, 500), Instant::now()),
            SizeDecision::Grow(1)
        );
        let mut policy = ResizePolicy::new(test_settings());
        assert_eq!(
            policy.evaluate(&sample(10, 10, 500), Instant::now()),
            SizeDecision::NoChange
        );
    }

    #[test]
    fn cooldown_blocks_consecutive_resizes() {
        let mut policy = ResizePolicy::new(test_settings());
        let t0 = Instant::now();
        assert_eq!(policy.evaluate(&sample(4, 4, 500), t0), SizeDecision::Grow(2));
        assert_eq!(
            policy.evaluate(&sample(6, 6, 500), t0 + Duration::from_millis(500)),
            SizeDecision::NoChange
        );
        assert_eq!(
            policy.evaluate(&sample(6, 6, 500), t0 + Duration::from_millis(1_500)),
            SizeDecision::Grow(2)
        );
    }

    #[test]
    fn shrink_requires_sustained_low_utilization() {
        let mut policy = ResizePolicy::new(test_settings());
        let t0 = Instant::now();
        assert_eq!(policy.evaluate(&sample(6, 1, 0), t0), SizeDecision::NoChange);
        assert_eq!(
            policy.evaluate(&sample(6, 1, 0), t0 + Duration::from_secs(3)),
            SizeDecision::NoChange
        );
        assert_eq!(
            policy.evaluate(&sample(6, 1, 0), t0 + Duration::from_secs(5)),
            SizeDecision::Shrink
        );
    }

    #[test]
    fn busy_sample_resets_shrink_window() {
        let mut policy = ResizePolicy::new(test_settings());
        let t0 = Instant::now();
        policy.evaluate(&sample(6, 1, 0), t0);
        policy.evaluate(&sample(6, 3, 0), t0 + Duration::from_secs(3));
        assert_eq!(
            policy.evaluate(&sample(6, 1, 0), t0 + Duration::from_secs(5)),
            SizeDecision::NoChange
        );
    }

    #[test]
    fn never_shrinks_below_min() {
        let mut policy = ResizePolicy::new(test_settings());
        let t0 = Instant::now();
        policy.evaluate(&sample(2, 0, 0), t0);
        assert_eq!(
            policy.evaluate(&sample(2, 0, 0), t0 + Duration::from_secs(10)),
            SizeDecision::NoChange
        );
    }

    async fn make_pool(min: usize, max: usize) -> Arc<Pool> {
        let mut settings = PoolSettings {
            host: "db.local".into(),
            database: "app".into(),
            min_connections: min,
            max_connections: max,
            ..PoolSettings::default()
        };
        settings.sizer = SizerSettings {
            wait_threshold_ms: 0,
            cooldown_ms: 0,
            shrink_window_ms: 0,
            ..test_settings()
        };
        let factory = Arc::new(MemoryFactory::new());
        let metrics = Arc::new(MetricsCollector::new("sizer-test"));
        Arc::new(Pool::initialize(settings, factory, metrics, &[]).await.unwrap())
    }

    #[tokio::test]
    async fn tick_grows_when_acquires_wait_for_new_connections() {
        let pool = make_pool(2, 6).await;
        let mut held = Vec::new();
        for _ in 0..3 {
            held.push(pool.acquire(Duration::from_millis(50), AcquireHint::any()).await.unwrap());
        }

        let mut sizer = AdaptiveSizer::new(Arc::clone(&pool));
        assert_eq!(sizer.tick().await, SizeDecision::Grow(2));
        assert_eq!(pool.size().await, 5);
    }

    #[tokio::test]
    async fn tick_never_grows_past_max() {
        let pool = make_pool(2, 3).await;
        let mut held = Vec::new();
        for _ in 0..3 {
            held.push(pool.acquire(Duration::from_millis(50), AcquireHint::any()).await.unwrap());
        }

        let mut sizer = AdaptiveSizer::new(Arc::clone(&pool));
        assert_eq!(sizer.tick().await, SizeDecision::NoChange);
        assert_eq!(pool.size().await, 3);
    }

    #[tokio::test]
    async fn tick_shrinks_idle_pool_to_min() {
        let pool = make_pool(2, 6).await;
        pool.grow(3).await;
        assert_eq!(pool.size().await, 5);

        let mut sizer = AdaptiveSizer::new(Arc::clone(&pool));
        for _ in 0..10 {
            sizer.tick().await;
        }
        assert_eq!(pool.size().await, 2);
    }

    /// Checked at compile time: the loop is spawned onto the runtime.
    #[allow(dead_code)]
    fn sizer_futures_are_send(mut sizer: AdaptiveSizer, rx: watch::Receiver<bool>) {
        fn require_send<T: Send>(_: T) {}
        require_send(sizer.tick());
        require_send(sizer.run(rx));
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_signal() {
        let pool = make_pool(2, 4).await;
        let mut sizer = AdaptiveSizer::new(pool);
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(async move { sizer.run(rx).await });
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
