//! tidepool — an adaptive, self-healing database connection pool with
//! query routing.
//!
//! [`Tidepool`] assembles the subsystems around one [`Pool`]:
//! - connection supervisor (`tidepool-pool`)
//! - health monitor (`tidepool-health`)
//! - adaptive sizer (`tidepool-autoscale`)
//! - query router and pattern learner (`tidepool-router`)
//! - metrics collector (`tidepool-metrics`)
//!
//! [`service::Service`] exposes the JSON operation surface on top of it.
//!
//! # Usage
//!
//! ```ignore
//! let settings = PoolSettings::from_toml_file(Path::new("tidepool.toml"))?;
//! let tidepool = Tidepool::start(settings, factory).await?;
//! let routed = tidepool.route("SELECT * FROM t", &json!(null), None).await?;
//! tidepool.shutdown(Duration::from_secs(5)).await;
//! ```

pub mod service;

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use tidepool_autoscale::AdaptiveSizer;
use tidepool_health::HealthMonitor;
use tidepool_metrics::{MetricsCollector, MetricsSnapshot};
use tidepool_router::{FingerprintStats, PatternLearner, QueryRouter, RoutedResult};

pub use tidepool_core::{
    AcquireHint, ConnectionId, FetchMode, PoolError, PoolResult, PoolSettings, QueryCategory,
    QueryOutput, RouteHint,
};
pub use tidepool_pool::{ConnectionFactory, DriverConnection, Pool, QueryContext};

/// A running pool with its background loops.
pub struct Tidepool {
    pool: Arc<Pool>,
    router: Arc<QueryRouter>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Tidepool {
    /// Start with a cold pattern cache.
    pub async fn start(
        settings: PoolSettings,
        factory: Arc<dyn ConnectionFactory>,
    ) -> PoolResult<Self> {
        Self::start_with_patterns(settings, factory, Vec::new()).await
    }

    /// Start from settings in a TOML file.
    pub async fn from_config_file(
        path: &Path,
        factory: Arc<dyn ConnectionFactory>,
    ) -> anyhow::Result<Self> {
        let settings = PoolSettings::from_toml_file(path)?;
        info!(path = %path.display(), "loaded pool settings");
        Ok(Self::start(settings, factory).await?)
    }

    /// Start with the pattern cache seeded from a previous export.
    ///
    /// With `pre_warm` on, the hottest learned categories each open one
    /// extra connection during initialization.
    pub async fn start_with_patterns(
        settings: PoolSettings,
        factory: Arc<dyn ConnectionFactory>,
        patterns: Vec<FingerprintStats>,
    ) -> PoolResult<Self> {
        settings.validate()?;

        let learner = PatternLearner::new(settings.cache_size)
            .map_err(|e| PoolError::Configuration(format!("fingerprint rules: {e}")))?;
        if !patterns.is_empty() {
            learner.import(patterns);
        }
        let warmup = learner.top_categories(settings.pre_warm_top_n);

        let metrics = Arc::new(MetricsCollector::new(&settings.pool_name));
        let adaptive = settings.adaptive_sizing;
        let pool = Arc::new(Pool::initialize(settings, factory, metrics, &warmup).await?);
        let router = Arc::new(QueryRouter::new(Arc::clone(&pool), Arc::new(learner)));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        let monitor = HealthMonitor::new(Arc::clone(&pool));
        let health_shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            monitor.run(health_shutdown).await;
        }));

        if adaptive {
            let mut sizer = AdaptiveSizer::new(Arc::clone(&pool));
            let sizer_shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                sizer.run(sizer_shutdown).await;
            }));
        }

        let sweeper = Arc::clone(&router);
        tasks.push(tokio::spawn(async move {
            sweeper.run_sweeper(shutdown_rx).await;
        }));

        info!(
            pool = %pool.name(),
            background_tasks = tasks.len(),
            "tidepool started"
        );
        Ok(Self {
            pool,
            router,
            shutdown_tx,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub fn router(&self) -> &Arc<QueryRouter> {
        &self.router
    }

    pub fn learner(&self) -> &Arc<PatternLearner> {
        self.router.learner()
    }

    /// Check out a connection using the configured acquire timeout.
    pub async fn acquire(&self, hint: AcquireHint) -> PoolResult<ConnectionId> {
        self.pool.acquire(self.pool.settings().acquire_timeout(), hint).await
    }

    /// Execute on a connection the caller holds.
    ///
    /// The statement still goes through the classifier so per-category
    /// metrics and the pattern cache stay accurate.
    pub async fn execute(
        &self,
        id: ConnectionId,
        sql: &str,
        params: &serde_json::Value,
    ) -> PoolResult<QueryOutput> {
        let learned = self.router.classify(sql, params);
        let ctx = QueryContext::classified(learned.classification.category, &learned.fingerprint);
        self.pool.execute(id, sql, params, &ctx).await
    }

    pub async fn release(&self, id: ConnectionId) -> PoolResult<()> {
        self.pool.release(id).await
    }

    /// Classify, route and execute a statement for an optional session.
    pub async fn route(
        &self,
        sql: &str,
        params: &serde_json::Value,
        session: Option<&str>,
    ) -> PoolResult<RoutedResult> {
        self.router.route(sql, params, session).await
    }

    pub async fn stats(&self) -> MetricsSnapshot {
        self.pool.stats().await
    }

    /// Snapshot of the pattern cache, for persisting across restarts.
    pub fn export_patterns(&self) -> Vec<FingerprintStats> {
        self.router.learner().export()
    }

    /// Refuse new work, stop the background loops, roll back open
    /// sessions, and shut the pool down. Returns the number of
    /// force-closed connections.
    pub async fn shutdown(&self, grace_period: Duration) -> usize {
        self.pool.begin_shutdown().await;
        let _ = self.shutdown_tx.send(true);

        let rolled_back = self.router.close_sessions().await;
        if rolled_back > 0 {
            info!(pool = %self.pool.name(), rolled_back, "rolled back open sessions");
        }
        let force_closed = self.pool.shutdown(grace_period).await;

        let tasks = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            let _ = task.await;
        }
        debug!(pool = %self.pool.name(), "background tasks stopped");
        force_closed
    }
}

impl std::fmt::Debug for Tidepool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tidepool")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl Drop for Tidepool {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}
