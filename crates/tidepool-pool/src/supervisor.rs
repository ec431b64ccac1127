//! Connection supervisor — the pool itself.
//!
//! Connections are kept in creation order and handed out one caller at a
//! time. When the pool is at capacity callers queue in FIFO order and are
//! woken by `release()`, by a timeout, or by cancellation.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify, oneshot};
use tracing::{debug, info, warn};

use tidepool_core::{
    AcquireHint, ConnectionId, ConnectionRole, ConnectionState, Endpoint, HealthScore,
    PoolError, PoolResult, PoolSettings, QueryCategory, QueryOutput, RouteHint, WarmupHint,
};
use tidepool_metrics::{CurrentState, MetricsCollector, MetricsSnapshot};

use crate::connection::{ConnectionInfo, Lease, PooledConnection, SharedHandle};
use crate::driver::{ConnectionFactory, Credentials};

/// Longest prefix of raw SQL kept as error/log context.
const RAW_CONTEXT_LEN: usize = 80;

/// Context attached to an executed statement for metrics and error reports.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueryContext {
    pub category: Option<QueryCategory>,
    /// Normalized query shape (or a truncated statement for raw execution).
    pub fingerprint: String,
}

impl QueryContext {
    /// Context for a statement that has not been classified.
    pub fn raw(sql: &str) -> Self {
        let collapsed = sql.split_whitespace().collect::<Vec<_>>().join(" ");
        let fingerprint = collapsed.chars().take(RAW_CONTEXT_LEN).collect();
        Self {
            category: None,
            fingerprint,
        }
    }

    pub fn classified(category: QueryCategory, fingerprint: &str) -> Self {
        Self {
            category: Some(category),
            fingerprint: fingerprint.to_string(),
        }
    }
}

/// Utilization observed by the adaptive sizer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UtilizationSample {
    pub total: usize,
    pub active: usize,
    pub idle: usize,
    pub waiting: usize,
    /// Mean time callers spent queued since the previous sample,
    /// including callers still queued.
    pub average_wait: Duration,
    pub min_size: usize,
    pub max_size: usize,
}

impl UtilizationSample {
    /// Fraction of connections checked out (0.0–1.0).
    pub fn utilization(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.active as f64 / self.total as f64
        }
    }
}

/// What a queued caller is handed.
enum Grant {
    /// A connection already checked out for the caller.
    Ready(Lease),
    /// A reserved slot; the caller opens a connection of this role into it.
    Open(ConnectionRole),
}

/// An idle connection checked out for a health probe.
pub struct ProbeTarget {
    pub id: ConnectionId,
    handle: SharedHandle,
}

impl ProbeTarget {
    /// Ping the connection and run the probe statement. Returns `true` on success.
    pub async fn run(&self, statement: &str) -> bool {
        let mut backend = self.handle.lock().await;
        if !backend.ping() {
            return false;
        }
        match backend.execute(statement, &serde_json::Value::Null) {
            Ok(_) => true,
            Err(e) => {
                debug!(connection_id = %self.id, error = %e, "probe statement failed");
                false
            }
        }
    }
}

/// A caller suspended in `acquire()`.
struct Waiter {
    id: u64,
    hint: AcquireHint,
    enqueued_at: Instant,
    tx: oneshot::Sender<Grant>,
}

/// Structural state guarded by the pool-wide mutex.
struct PoolInner {
    /// Keyed by monotonically allocated id, so iteration is creation order.
    connections: BTreeMap<ConnectionId, PooledConnection>,
    wait_queue: VecDeque<Waiter>,
    /// Connections being opened outside the lock. They count toward size.
    opening: usize,
    /// Accumulated queue time since the last utilization sample.
    wait_total: Duration,
    wait_samples: u32,
    /// Consecutive failed connection attempts.
    connect_failures: u32,
}

impl PoolInner {
    fn size(&self) -> usize {
        self.connections.len() + self.opening
    }

    fn count(&self, state: ConnectionState) -> usize {
        self.connections.values().filter(|c| c.state == state).count()
    }

    fn available(&self) -> usize {
        self.connections.values().filter(|c| c.is_available()).count()
    }

    /// Pick an available connection for `hint`, never the avoided one.
    ///
    /// Replica-eligible requests prefer replicas; among equals the most
    /// recently used connection wins so hot connections stay hot.
    fn pick_idle(&self, hint: AcquireHint) -> Option<ConnectionId> {
        let candidates = || {
            self.connections.values().filter(move |c| {
                c.is_available() && hint.route.accepts(c.role) && Some(c.id) != hint.avoid
            })
        };
        let preferred = if hint.route == RouteHint::ReplicaEligible {
            candidates()
                .filter(|c| c.role == ConnectionRole::Replica)
                .max_by_key(|c| c.last_used_at)
        } else {
            None
        };
        preferred
            .or_else(|| candidates().max_by_key(|c| c.last_used_at))
            .map(|c| c.id)
    }

    fn checkout(&mut self, id: ConnectionId) -> Option<Lease> {
        self.connections.get_mut(&id).map(PooledConnection::check_out)
    }

    fn remove_waiter(&mut self, waiter_id: u64) -> Option<Waiter> {
        let pos = self.wait_queue.iter().position(|w| w.id == waiter_id)?;
        self.wait_queue.remove(pos)
    }

    fn record_wait(&mut self, waited: Duration) {
        self.wait_total += waited;
        self.wait_samples += 1;
    }
}

/// The connection supervisor.
///
/// Bounded between `min_connections` and `max_connections`. Statements run
/// on a per-connection lock, so the pool lock is only held for bookkeeping.
pub struct Pool {
    name: String,
    settings: PoolSettings,
    credentials: Credentials,
    factory: Arc<dyn ConnectionFactory>,
    metrics: Arc<MetricsCollector>,
    inner: Mutex<PoolInner>,
    /// When true, new `acquire()` calls are rejected.
    shutting_down: AtomicBool,
    next_id: AtomicU64,
    next_waiter: AtomicU64,
    replica_cursor: AtomicUsize,
    /// Signalled on every release so shutdown can stop waiting early.
    released: Notify,
}

impl Pool {
    /// Validate settings, open `min_connections`, and pre-warm if enabled.
    ///
    /// Fails with `Configuration` on invalid bounds or if the database is
    /// unreachable while opening the minimum set.
    pub async fn initialize(
        settings: PoolSettings,
        factory: Arc<dyn ConnectionFactory>,
        metrics: Arc<MetricsCollector>,
        warmup: &[WarmupHint],
    ) -> PoolResult<Self> {
        settings.validate()?;

        let pool = Self {
            name: settings.pool_name.clone(),
            credentials: Credentials {
                database: settings.database.clone(),
                user: settings.user.clone(),
                password: settings.password.clone(),
            },
            settings,
            factory,
            metrics,
            inner: Mutex::new(PoolInner {
                connections: BTreeMap::new(),
                wait_queue: VecDeque::new(),
                opening: 0,
                wait_total: Duration::ZERO,
                wait_samples: 0,
                connect_failures: 0,
            }),
            shutting_down: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            next_waiter: AtomicU64::new(1),
            replica_cursor: AtomicUsize::new(0),
            released: Notify::new(),
        };

        for _ in 0..pool.settings.min_connections {
            pool.inner.lock().await.opening += 1;
            if let Err(e) = pool.finish_open(ConnectionRole::Primary, false).await {
                pool.close_all().await;
                return Err(PoolError::Configuration(format!(
                    "database unreachable at {}: {e}",
                    pool.settings.primary_endpoint()
                )));
            }
        }

        if pool.settings.pre_warm {
            pool.pre_warm(warmup).await;
        }

        let size = pool.size().await;
        info!(
            pool = %pool.name,
            endpoint = %pool.settings.primary_endpoint(),
            replicas = pool.settings.replicas.len(),
            min = pool.settings.min_connections,
            max = pool.settings.max_connections,
            size,
            "connection pool initialized"
        );
        Ok(pool)
    }

    /// Open one extra connection per learned hot category, up to `max_connections`.
    async fn pre_warm(&self, warmup: &[WarmupHint]) {
        for hint in warmup.iter().take(self.settings.pre_warm_top_n) {
            let role = if hint.category.is_read() {
                self.role_for(RouteHint::ReplicaEligible)
            } else {
                ConnectionRole::Primary
            };
            {
                let mut inner = self.inner.lock().await;
                if inner.size() >= self.settings.max_connections {
                    break;
                }
                inner.opening += 1;
            }
            match self.finish_open(role, false).await {
                Ok(lease) => debug!(
                    pool = %self.name,
                    connection_id = %lease.id,
                    category = %hint.category,
                    hits = hint.hit_count,
                    "pre-warmed connection"
                ),
                Err(e) => warn!(pool = %self.name, error = %e, "pre-warm connection failed"),
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Whether replacement connections have failed `max_replacement_failures` times in a row.
    pub async fn is_degraded(&self) -> bool {
        self.inner.lock().await.connect_failures >= self.settings.max_replacement_failures
    }

    fn role_for(&self, route: RouteHint) -> ConnectionRole {
        if route == RouteHint::ReplicaEligible && !self.settings.replicas.is_empty() {
            ConnectionRole::Replica
        } else {
            ConnectionRole::Primary
        }
    }

    fn endpoint_for(&self, role: ConnectionRole) -> Endpoint {
        match role {
            ConnectionRole::Replica if !self.settings.replicas.is_empty() => {
                let i = self.replica_cursor.fetch_add(1, Ordering::Relaxed);
                self.settings.replicas[i % self.settings.replicas.len()].clone()
            }
            _ => self.settings.primary_endpoint(),
        }
    }

    /// Open a connection for a slot already reserved via `opening += 1`.
    ///
    /// With `activate` the new connection is checked out to the caller;
    /// otherwise it joins the pool `Idle` and is offered to waiters, and the
    /// returned lease (generation 0) matches no checkout.
    async fn finish_open(&self, role: ConnectionRole, activate: bool) -> PoolResult<Lease> {
        let endpoint = self.endpoint_for(role);
        let result = self.factory.connect(&endpoint, &self.credentials);

        let mut inner = self.inner.lock().await;
        inner.opening = inner.opening.saturating_sub(1);

        let backend = match result {
            Ok(backend) => backend,
            Err(e) => {
                inner.connect_failures += 1;
                self.metrics.record_connect_failure();
                warn!(
                    pool = %self.name,
                    %endpoint,
                    %role,
                    consecutive_failures = inner.connect_failures,
                    error = %e,
                    "failed to open connection"
                );
                return Err(PoolError::PoolExhausted(format!(
                    "could not open connection to {endpoint}: {}",
                    e.message
                )));
            }
        };

        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut conn = PooledConnection::new(id, role, endpoint, backend);
        inner.connect_failures = 0;
        self.metrics.record_connection_created();

        if self.is_shutting_down() {
            conn.close();
            self.metrics.record_connection_closed();
            return Err(PoolError::ShuttingDown);
        }

        debug!(
            pool = %self.name,
            connection_id = %id,
            endpoint = %conn.endpoint,
            %role,
            "created new connection"
        );

        let lease = if activate {
            conn.check_out()
        } else {
            Lease { id, generation: 0 }
        };
        inner.connections.insert(id, conn);
        if !activate {
            self.grant_waiters(&mut inner);
        }
        Ok(lease)
    }

    /// Hand available connections to queued callers, oldest compatible caller first.
    fn grant_waiters(&self, inner: &mut PoolInner) {
        if self.is_shutting_down() {
            return;
        }
        inner.wait_queue.retain(|w| !w.tx.is_closed());

        let mut i = 0;
        while i < inner.wait_queue.len() {
            let route = inner.wait_queue[i].hint.route;
            let Some(id) = inner.pick_idle(AcquireHint::route(route)) else {
                i += 1;
                continue;
            };
            let Some(waiter) = inner.wait_queue.remove(i) else {
                break;
            };
            let Some(lease) = inner.checkout(id) else {
                break;
            };
            if waiter.tx.send(Grant::Ready(lease)).is_err() {
                // Caller went away between the retain and now.
                if let Some(conn) = inner.connections.get_mut(&id) {
                    conn.state = ConnectionState::Idle;
                }
                continue;
            }
            let waited = waiter.enqueued_at.elapsed();
            inner.record_wait(waited);
            self.metrics.record_acquire(true);
            debug!(
                pool = %self.name,
                connection_id = %id,
                waited_ms = waited.as_millis() as u64,
                "granted connection to queued caller"
            );
        }

        // What is still idle suits none of the queued callers: trade one
        // such connection for a slot the oldest caller can open into.
        let Some(route) = inner.wait_queue.front().map(|w| w.hint.route) else {
            return;
        };
        let victim = inner
            .connections
            .values()
            .find(|c| c.is_available() && !route.accepts(c.role))
            .map(|c| c.id);
        let Some(mut conn) = victim.and_then(|id| inner.connections.remove(&id)) else {
            return;
        };
        conn.close();
        self.metrics.record_connection_closed();
        inner.opening += 1;
        debug!(pool = %self.name, connection_id = %conn.id, %route, "closed incompatible idle connection for queued caller");

        if let Some(waiter) = inner.wait_queue.pop_front() {
            let waited = waiter.enqueued_at.elapsed();
            if waiter.tx.send(Grant::Open(self.role_for(route))).is_ok() {
                inner.record_wait(waited);
            } else {
                inner.opening = inner.opening.saturating_sub(1);
            }
        }
    }

    /// Acquire a connection, waiting up to `timeout` if the pool is at capacity.
    pub async fn acquire(&self, timeout: Duration, hint: AcquireHint) -> PoolResult<ConnectionId> {
        self.acquire_lease(timeout, hint).await.map(|lease| lease.id)
    }

    /// Like [`Pool::acquire`], returning the [`Lease`] for use with
    /// [`Pool::execute_leased`] and [`Pool::release_leased`].
    pub async fn acquire_lease(&self, timeout: Duration, hint: AcquireHint) -> PoolResult<Lease> {
        self.checkout_with_cancel(timeout, hint, std::future::pending::<()>())
            .await
    }

    /// Like [`Pool::acquire`], but gives up with `Cancelled` as soon as
    /// `cancel` resolves.
    pub async fn acquire_with_cancel<F>(
        &self,
        timeout: Duration,
        hint: AcquireHint,
        cancel: F,
    ) -> PoolResult<ConnectionId>
    where
        F: Future<Output = ()>,
    {
        self.checkout_with_cancel(timeout, hint, cancel)
            .await
            .map(|lease| lease.id)
    }

    async fn checkout_with_cancel<F>(
        &self,
        timeout: Duration,
        hint: AcquireHint,
        cancel: F,
    ) -> PoolResult<Lease>
    where
        F: Future<Output = ()>,
    {
        if self.is_shutting_down() {
            return Err(PoolError::ShuttingDown);
        }
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + timeout;
        let mut open_failed = false;

        let (waiter_id, mut rx) = loop {
            let mut inner = self.inner.lock().await;
            if self.is_shutting_down() {
                return Err(PoolError::ShuttingDown);
            }

            if let Some(id) = inner.pick_idle(hint)
                && let Some(lease) = inner.checkout(id)
            {
                self.metrics.record_acquire(false);
                debug!(pool = %self.name, connection_id = %id, %hint.route, "reused idle connection");
                return Ok(lease);
            }

            if inner.size() < self.settings.max_connections && !open_failed {
                inner.opening += 1;
                drop(inner);
                match self.finish_open(self.role_for(hint.route), true).await {
                    Ok(lease) => {
                        // Opening on demand is time the caller spent waiting.
                        self.inner.lock().await.record_wait(started.elapsed());
                        self.metrics.record_acquire(false);
                        return Ok(lease);
                    }
                    Err(PoolError::ShuttingDown) => return Err(PoolError::ShuttingDown),
                    Err(e) => {
                        let inner = self.inner.lock().await;
                        if inner.connect_failures >= self.settings.max_replacement_failures
                            || inner.connections.is_empty()
                        {
                            return Err(e);
                        }
                        // Other connections exist; fall back to waiting for one.
                        open_failed = true;
                        continue;
                    }
                }
            }

            // The avoided connection is better than waiting.
            if let Some(avoided) = hint.avoid
                && inner.pick_idle(AcquireHint::route(hint.route)) == Some(avoided)
                && let Some(lease) = inner.checkout(avoided)
            {
                self.metrics.record_acquire(false);
                return Ok(lease);
            }

            // At capacity with only incompatible idle connections: swap one out.
            if !open_failed
                && let Some(victim) = inner
                    .connections
                    .values()
                    .find(|c| c.is_available() && !hint.route.accepts(c.role))
                    .map(|c| c.id)
                && let Some(mut conn) = inner.connections.remove(&victim)
            {
                conn.close();
                self.metrics.record_connection_closed();
                debug!(pool = %self.name, connection_id = %victim, "closed incompatible idle connection to make room");
                inner.opening += 1;
                drop(inner);
                match self.finish_open(self.role_for(hint.route), true).await {
                    Ok(lease) => {
                        self.metrics.record_acquire(false);
                        return Ok(lease);
                    }
                    Err(PoolError::ShuttingDown) => return Err(PoolError::ShuttingDown),
                    Err(_) => {
                        open_failed = true;
                        continue;
                    }
                }
            }

            let (tx, rx) = oneshot::channel();
            let waiter_id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
            inner.wait_queue.push_back(Waiter {
                id: waiter_id,
                hint,
                enqueued_at: Instant::now(),
                tx,
            });
            debug!(
                pool = %self.name,
                waiting = inner.wait_queue.len(),
                %hint.route,
                "pool at capacity, caller queued"
            );
            break (waiter_id, rx);
        };

        let cancel = std::pin::pin!(cancel);
        let failure = tokio::select! {
            granted = &mut rx => {
                return match granted {
                    Ok(Grant::Ready(lease)) => Ok(lease),
                    Ok(Grant::Open(role)) => {
                        let lease = self.finish_open(role, true).await?;
                        self.metrics.record_acquire(true);
                        Ok(lease)
                    }
                    // Sender dropped: the queue was cancelled by shutdown.
                    Err(_) => Err(PoolError::ShuttingDown),
                };
            }
            _ = tokio::time::sleep_until(deadline) => PoolError::AcquireTimeout(timeout),
            _ = cancel => PoolError::Cancelled,
        };

        let mut inner = self.inner.lock().await;
        match inner.remove_waiter(waiter_id) {
            Some(waiter) => {
                let waited = waiter.enqueued_at.elapsed();
                inner.record_wait(waited);
            }
            None => {
                // Granted between wake-up and re-lock; give it back.
                match rx.try_recv() {
                    Ok(Grant::Ready(lease)) => {
                        if let Some(conn) = inner.connections.get_mut(&lease.id) {
                            conn.state = ConnectionState::Idle;
                        }
                        self.grant_waiters(&mut inner);
                    }
                    Ok(Grant::Open(_)) => inner.opening = inner.opening.saturating_sub(1),
                    Err(_) => {}
                }
                if self.is_shutting_down() {
                    return Err(PoolError::ShuttingDown);
                }
            }
        }

        if matches!(failure, PoolError::AcquireTimeout(_)) {
            self.metrics.record_acquire_timeout();
            debug!(pool = %self.name, timeout_ms = timeout.as_millis() as u64, "acquire timed out");
        } else {
            debug!(pool = %self.name, "acquire cancelled");
        }
        Err(failure)
    }

    /// Execute a statement on a connection the caller holds.
    ///
    /// Connection-level failures count against the connection's health and
    /// are applied when it is released.
    pub async fn execute(
        &self,
        id: ConnectionId,
        sql: &str,
        params: &serde_json::Value,
        ctx: &QueryContext,
    ) -> PoolResult<QueryOutput> {
        self.execute_on(id, None, sql, params, ctx).await
    }

    /// Like [`Pool::execute`], but fails with `UnknownConnection` unless
    /// `lease` is still the connection's current checkout.
    pub async fn execute_leased(
        &self,
        lease: Lease,
        sql: &str,
        params: &serde_json::Value,
        ctx: &QueryContext,
    ) -> PoolResult<QueryOutput> {
        self.execute_on(lease.id, Some(lease.generation), sql, params, ctx)
            .await
    }

    async fn execute_on(
        &self,
        id: ConnectionId,
        generation: Option<u64>,
        sql: &str,
        params: &serde_json::Value,
        ctx: &QueryContext,
    ) -> PoolResult<QueryOutput> {
        let handle = {
            let inner = self.inner.lock().await;
            match inner.connections.get(&id) {
                Some(conn) if conn.is_leased_by(generation) => Arc::clone(&conn.handle),
                _ => return Err(PoolError::UnknownConnection(id)),
            }
        };

        let started = Instant::now();
        let result = {
            let mut backend = handle.lock().await;
            // The checkout may have ended while this statement queued on the handle.
            let still_held = self
                .inner
                .lock()
                .await
                .connections
                .get(&id)
                .is_some_and(|c| c.is_leased_by(generation));
            if !still_held {
                debug!(pool = %self.name, connection_id = %id, "statement dropped, checkout ended");
                return Err(PoolError::UnknownConnection(id));
            }
            backend.execute(sql, params)
        };
        let latency = started.elapsed();

        {
            let mut inner = self.inner.lock().await;
            if let Some(conn) = inner.connections.get_mut(&id) {
                conn.query_count += 1;
                conn.last_used_at = Instant::now();
                if let Err(e) = &result
                    && e.kind == tidepool_core::FailureKind::Connection
                {
                    conn.error_count += 1;
                    conn.lease_errors += 1;
                }
            }
        }
        self.metrics
            .record_query(ctx.category, latency, result.is_err());

        match result {
            Ok(output) => {
                debug!(
                    pool = %self.name,
                    connection_id = %id,
                    fingerprint = %ctx.fingerprint,
                    rowcount = output.rowcount,
                    latency_us = latency.as_micros() as u64,
                    "statement executed"
                );
                Ok(output)
            }
            Err(e) => {
                warn!(
                    pool = %self.name,
                    connection_id = %id,
                    fingerprint = %ctx.fingerprint,
                    kind = ?e.kind,
                    error = %e.message,
                    "statement failed"
                );
                Err(PoolError::query(id, &ctx.fingerprint, e))
            }
        }
    }

    /// Return a connection to the pool. Releasing an idle or unknown
    /// connection is a no-op.
    pub async fn release(&self, id: ConnectionId) -> PoolResult<()> {
        self.release_on(id, None).await
    }

    /// Like [`Pool::release`], but a no-op unless `lease` is still the
    /// connection's current checkout.
    pub async fn release_leased(&self, lease: Lease) -> PoolResult<()> {
        self.release_on(lease.id, Some(lease.generation)).await
    }

    async fn release_on(&self, id: ConnectionId, generation: Option<u64>) -> PoolResult<()> {
        let mut inner = self.inner.lock().await;
        let threshold = self.settings.health_threshold;
        let penalty = self.settings.health.penalty_step;

        let Some(conn) = inner.connections.get_mut(&id) else {
            debug!(pool = %self.name, connection_id = %id, "release of unknown connection ignored");
            return Ok(());
        };
        if !conn.is_leased_by(generation) {
            debug!(pool = %self.name, connection_id = %id, state = %conn.state, "release of connection not held by caller ignored");
            return Ok(());
        }

        conn.last_used_at = Instant::now();
        conn.lease_count += 1;
        for _ in 0..conn.lease_errors {
            conn.health_score = conn.health_score.penalize(penalty);
        }
        conn.lease_errors = 0;
        self.metrics.record_release();
        self.released.notify_one();

        if conn.health_score.at_or_below(threshold) && !self.is_shutting_down() {
            conn.state = ConnectionState::Unhealthy;
            warn!(
                pool = %self.name,
                connection_id = %id,
                health = %conn.health_score,
                threshold,
                "connection unhealthy on release, recycling"
            );
            let replacement = self.recycle_locked(&mut inner, id);
            drop(inner);
            if let Some(role) = replacement
                && let Err(e) = self.finish_open(role, false).await
            {
                warn!(pool = %self.name, error = %e, "replacement after release failed");
            }
            return Ok(());
        }

        conn.state = ConnectionState::Idle;
        debug!(pool = %self.name, connection_id = %id, "returned connection to pool");
        self.grant_waiters(&mut inner);
        Ok(())
    }

    /// Close a connection and drop it from the pool.
    ///
    /// If the pool falls below `min_connections` (or callers are queued and
    /// there is room) a replacement is opened before returning, unless the
    /// pool is shutting down.
    pub async fn recycle(&self, id: ConnectionId) -> PoolResult<()> {
        let replacement = {
            let mut inner = self.inner.lock().await;
            if !inner.connections.contains_key(&id) {
                return Ok(());
            }
            self.recycle_locked(&mut inner, id)
        };
        if let Some(role) = replacement {
            self.finish_open(role, false).await?;
        }
        Ok(())
    }

    /// Remove and close `id`. Returns the role of a replacement slot that
    /// has been reserved, if one is needed.
    fn recycle_locked(&self, inner: &mut PoolInner, id: ConnectionId) -> Option<ConnectionRole> {
        let mut conn = inner.connections.remove(&id)?;
        let role = conn.role;
        conn.close();
        self.metrics.record_connection_recycled();
        self.metrics.record_connection_closed();
        info!(
            pool = %self.name,
            connection_id = %id,
            health = %conn.health_score,
            errors = conn.error_count,
            "recycled connection"
        );

        if self.is_shutting_down() {
            return None;
        }
        let below_min = inner.size() < self.settings.min_connections;
        let starved = !inner.wait_queue.is_empty() && inner.size() < self.settings.max_connections;
        if below_min || starved {
            inner.opening += 1;
            let role = inner
                .wait_queue
                .front()
                .map(|w| self.role_for(w.hint.route))
                .unwrap_or(role);
            Some(role)
        } else {
            None
        }
    }

    /// Ids of the connections currently available for probing.
    pub async fn probe_candidates(&self) -> Vec<ConnectionId> {
        self.inner
            .lock()
            .await
            .connections
            .values()
            .filter(|c| c.is_available())
            .map(|c| c.id)
            .collect()
    }

    /// Hide `id` from `acquire()` for a probe, if it is still available.
    ///
    /// Active connections are never probed.
    pub async fn begin_probe(&self, id: ConnectionId) -> Option<ProbeTarget> {
        let mut inner = self.inner.lock().await;
        let conn = inner.connections.get_mut(&id).filter(|c| c.is_available())?;
        conn.probing = true;
        Some(ProbeTarget {
            id,
            handle: Arc::clone(&conn.handle),
        })
    }

    /// Record a probe outcome. `rescore` maps the old score to the new one.
    ///
    /// Returns `true` if the connection is now at or below the health
    /// threshold and must be recycled.
    pub async fn finish_probe<F>(&self, id: ConnectionId, passed: bool, rescore: F) -> bool
    where
        F: FnOnce(HealthScore) -> HealthScore,
    {
        let mut inner = self.inner.lock().await;
        let Some(conn) = inner.connections.get_mut(&id) else {
            return false;
        };
        conn.probing = false;
        conn.health_score = rescore(conn.health_score);
        if !passed {
            conn.error_count += 1;
        }
        if conn.state == ConnectionState::Idle
            && conn.health_score.at_or_below(self.settings.health_threshold)
        {
            conn.state = ConnectionState::Unhealthy;
            return true;
        }
        self.grant_waiters(&mut inner);
        false
    }

    /// Open connections until the pool holds at least `min_connections`.
    ///
    /// Returns how many were opened.
    pub async fn ensure_min_size(&self) -> usize {
        if self.is_shutting_down() {
            return 0;
        }
        let missing = {
            let mut inner = self.inner.lock().await;
            let missing = self.settings.min_connections.saturating_sub(inner.size());
            inner.opening += missing;
            missing
        };
        let mut opened = 0;
        for _ in 0..missing {
            if self.finish_open(ConnectionRole::Primary, false).await.is_ok() {
                opened += 1;
            }
        }
        opened
    }

    /// Open up to `n` connections, never exceeding `max_connections`.
    pub async fn grow(&self, n: usize) -> usize {
        if self.is_shutting_down() {
            return 0;
        }
        let roles: Vec<ConnectionRole> = {
            let mut inner = self.inner.lock().await;
            let room = self.settings.max_connections.saturating_sub(inner.size());
            let n = n.min(room);
            inner.opening += n;
            (0..n)
                .map(|i| {
                    inner
                        .wait_queue
                        .get(i)
                        .map(|w| self.role_for(w.hint.route))
                        .unwrap_or(ConnectionRole::Primary)
                })
                .collect()
        };
        let mut opened = 0;
        for role in roles {
            if self.finish_open(role, false).await.is_ok() {
                opened += 1;
            }
        }
        opened
    }

    /// Close the least recently used idle connection if above `min_connections`.
    pub async fn shrink_one(&self) -> Option<ConnectionId> {
        let mut inner = self.inner.lock().await;
        if inner.size() <= self.settings.min_connections {
            return None;
        }
        let victim = inner
            .connections
            .values()
            .filter(|c| c.is_available())
            .min_by_key(|c| c.last_used_at)
            .map(|c| c.id)?;
        let mut conn = inner.connections.remove(&victim)?;
        conn.close();
        self.metrics.record_connection_closed();
        info!(pool = %self.name, connection_id = %victim, size = inner.size(), "shrank pool");
        Some(victim)
    }

    /// Sample utilization and reset the wait-time accumulator.
    pub async fn utilization_sample(&self) -> UtilizationSample {
        let mut inner = self.inner.lock().await;
        let queued: Duration = inner.wait_queue.iter().map(|w| w.enqueued_at.elapsed()).sum();
        let samples = inner.wait_samples + inner.wait_queue.len() as u32;
        let average_wait = if samples > 0 {
            (inner.wait_total + queued) / samples
        } else {
            Duration::ZERO
        };
        inner.wait_total = Duration::ZERO;
        inner.wait_samples = 0;

        UtilizationSample {
            total: inner.size(),
            active: inner.count(ConnectionState::Active),
            idle: inner.available(),
            waiting: inner.wait_queue.len(),
            average_wait,
            min_size: self.settings.min_connections,
            max_size: self.settings.max_connections,
        }
    }

    /// Stop accepting acquires and cancel queued callers.
    ///
    /// Returns `false` if shutdown had already begun.
    pub async fn begin_shutdown(&self) -> bool {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!(pool = %self.name, "connection pool shutting down");

        let mut inner = self.inner.lock().await;
        let cancelled = inner.wait_queue.len();
        // Dropping the senders wakes every waiter with `ShuttingDown`.
        inner.wait_queue.clear();
        if cancelled > 0 {
            debug!(pool = %self.name, cancelled, "cancelled queued acquires");
        }
        true
    }

    /// Stop accepting acquires, wait up to `grace_period` for active
    /// connections to be released, then close everything.
    ///
    /// Returns the number of connections that were still active and had to
    /// be force-closed.
    pub async fn shutdown(&self, grace_period: Duration) -> usize {
        self.begin_shutdown().await;
        debug!(
            pool = %self.name,
            grace_ms = grace_period.as_millis() as u64,
            "waiting for active connections"
        );

        let deadline = tokio::time::Instant::now() + grace_period;
        loop {
            let active = self.inner.lock().await.count(ConnectionState::Active);
            if active == 0 {
                info!(pool = %self.name, "all active connections released");
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    pool = %self.name,
                    remaining = active,
                    "grace period expired, force-closing active connections"
                );
                break;
            }
            let _ = tokio::time::timeout_at(deadline, self.released.notified()).await;
        }

        let force_closed = self.close_all().await;
        info!(pool = %self.name, force_closed, "connection pool shut down");
        force_closed
    }

    /// Close every connection. Returns how many were active.
    async fn close_all(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let mut force_closed = 0;
        let connections = std::mem::take(&mut inner.connections);
        for (id, mut conn) in connections {
            if conn.state == ConnectionState::Active {
                force_closed += 1;
                debug!(pool = %self.name, connection_id = %id, "force-closing active connection");
            }
            conn.close();
            self.metrics.record_connection_closed();
        }
        force_closed
    }

    /// Point-in-time statistics.
    pub async fn stats(&self) -> MetricsSnapshot {
        let current = {
            let inner = self.inner.lock().await;
            CurrentState {
                active_connections: inner.count(ConnectionState::Active),
                available_connections: inner.available(),
                total_connections: inner.connections.len(),
                waiting: inner.wait_queue.len(),
                health_scores: inner
                    .connections
                    .values()
                    .map(|c| (c.id.0, c.health_score.value()))
                    .collect(),
            }
        };
        self.metrics.snapshot(current)
    }

    /// Number of open connections (including ones being opened).
    pub async fn size(&self) -> usize {
        self.inner.lock().await.size()
    }

    pub async fn waiting(&self) -> usize {
        self.inner.lock().await.wait_queue.len()
    }

    pub async fn connection_info(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.inner.lock().await.connections.get(&id).map(|c| c.info())
    }

    /// All connections in creation order.
    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        self.inner
            .lock()
            .await
            .connections
            .values()
            .map(|c| c.info())
            .collect()
    }
}

// ── Debug impl (cannot auto-derive due to dyn trait) ────────────────

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.name)
            .field("min", &self.settings.min_connections)
            .field("max", &self.settings.max_connections)
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tidepool_core::{DriverError, FailureKind};

    use crate::driver::DriverConnection;

    // ── Mock backend and factory ─────────────────────────────────────

    #[derive(Debug)]
    struct MockBackend {
        healthy: Arc<AtomicBool>,
        fail_queries: Arc<AtomicBool>,
        closed: Arc<AtomicU32>,
    }

    impl DriverConnection for MockBackend {
        fn execute(
            &mut self,
            sql: &str,
            _params: &serde_json::Value,
        ) -> Result<QueryOutput, DriverError> {
            if self.fail_queries.load(Ordering::Relaxed) {
                return Err(DriverError::connection("server closed the connection"));
            }
            if sql.contains("syntax error") {
                return Err(DriverError::statement("syntax error at or near"));
            }
            Ok(QueryOutput::rows(vec![serde_json::json!({"sql": sql})]))
        }

        fn ping(&mut self) -> bool {
            self.healthy.load(Ordering::Relaxed)
        }

        fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::Relaxed);
        }
    }

    struct MockFactory {
        connect_count: AtomicU64,
        should_fail: AtomicBool,
        healthy: Arc<AtomicBool>,
        fail_queries: Arc<AtomicBool>,
        closed: Arc<AtomicU32>,
        replica_connects: AtomicU64,
    }

    impl MockFactory {
        fn new() -> Self {
            Self {
                connect_count: AtomicU64::new(0),
                should_fail: AtomicBool::new(false),
                healthy: Arc::new(AtomicBool::new(true)),
                fail_queries: Arc::new(AtomicBool::new(false)),
                closed: Arc::new(AtomicU32::new(0)),
                replica_connects: AtomicU64::new(0),
            }
        }

        fn connects(&self) -> u64 {
            self.connect_count.load(Ordering::Relaxed)
        }
    }

    impl ConnectionFactory for MockFactory {
        fn connect(
            &self,
            endpoint: &Endpoint,
            _credentials: &Credentials,
        ) -> Result<Box<dyn DriverConnection>, DriverError> {
            if self.should_fail.load(Ordering::Relaxed) {
                return Err(DriverError::connection("connection refused"));
            }
            self.connect_count.fetch_add(1, Ordering::Relaxed);
            if endpoint.host.starts_with("replica") {
                self.replica_connects.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Box::new(MockBackend {
                healthy: Arc::clone(&self.healthy),
                fail_queries: Arc::clone(&self.fail_queries),
                closed: Arc::clone(&self.closed),
            }))
        }
    }

    fn test_settings(min: usize, max: usize) -> PoolSettings {
        PoolSettings {
            host: "db.tidepool.local".into(),
            database: "app".into(),
            min_connections: min,
            max_connections: max,
            health_threshold: 50,
            ..PoolSettings::default()
        }
    }

    async fn make_pool(settings: PoolSettings) -> (Pool, Arc<MockFactory>) {
        let factory = Arc::new(MockFactory::new());
        let metrics = Arc::new(MetricsCollector::new("test"));
        let pool = Pool::initialize(settings, factory.clone(), metrics, &[])
            .await
            .unwrap();
        (pool, factory)
    }

    const T: Duration = Duration::from_millis(50);

    // ── Initialize ──────────────────────────────────────────────────

    #[tokio::test]
    async fn initialize_opens_min_connections() {
        let (pool, factory) = make_pool(test_settings(2, 5)).await;
        assert_eq!(pool.size().await, 2);
        assert_eq!(factory.connects(), 2);
        let conns = pool.connections().await;
        assert!(conns.iter().all(|c| c.state == ConnectionState::Idle));
        assert!(conns[0].id < conns[1].id);
    }

    #[tokio::test]
    async fn initialize_rejects_inverted_bounds() {
        let factory = Arc::new(MockFactory::new());
        let metrics = Arc::new(MetricsCollector::new("test"));
        let err = Pool::initialize(test_settings(5, 2), factory, metrics, &[])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ConfigurationError");
    }

    #[tokio::test]
    async fn initialize_unreachable_database_is_configuration_error() {
        let factory = Arc::new(MockFactory::new());
        factory.should_fail.store(true, Ordering::Relaxed);
        let metrics = Arc::new(MetricsCollector::new("test"));
        let err = Pool::initialize(test_settings(2, 5), factory, metrics, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Configuration(ref m) if m.contains("unreachable")));
    }

    #[tokio::test]
    async fn pre_warm_opens_extra_connections_up_to_max() {
        let factory = Arc::new(MockFactory::new());
        let metrics = Arc::new(MetricsCollector::new("test"));
        let settings = PoolSettings {
            pre_warm: true,
            ..test_settings(2, 3)
        };
        let hints = [
            WarmupHint { category: QueryCategory::ReadSimple, hit_count: 90 },
            WarmupHint { category: QueryCategory::WriteSimple, hit_count: 40 },
        ];
        let pool = Pool::initialize(settings, factory, metrics, &hints).await.unwrap();
        assert_eq!(pool.size().await, 3);
    }

    #[tokio::test]
    async fn pre_warm_disabled_ignores_hints() {
        let factory = Arc::new(MockFactory::new());
        let metrics = Arc::new(MetricsCollector::new("test"));
        let hints = [WarmupHint { category: QueryCategory::ReadSimple, hit_count: 90 }];
        let pool = Pool::initialize(test_settings(2, 5), factory, metrics, &hints)
            .await
            .unwrap();
        assert_eq!(pool.size().await, 2);
    }

    // ── Acquire / release ───────────────────────────────────────────

    #[tokio::test]
    async fn acquire_reuses_idle_before_creating() {
        let (pool, factory) = make_pool(test_settings(1, 3)).await;
        let id = pool.acquire(T, AcquireHint::any()).await.unwrap();
        assert_eq!(factory.connects(), 1);
        pool.release(id).await.unwrap();
        let again = pool.acquire(T, AcquireHint::any()).await.unwrap();
        assert_eq!(id, again);
        assert_eq!(factory.connects(), 1);
    }

    #[tokio::test]
    async fn acquire_grows_to_max_then_times_out() {
        let (pool, _) = make_pool(test_settings(2, 5)).await;
        let mut held = Vec::new();
        for _ in 0..5 {
            held.push(pool.acquire(T, AcquireHint::any()).await.unwrap());
        }
        assert_eq!(pool.size().await, 5);

        let started = Instant::now();
        let err = pool.acquire(T, AcquireHint::any()).await.unwrap_err();
        assert!(matches!(err, PoolError::AcquireTimeout(_)));
        assert!(started.elapsed() >= T);
        assert_eq!(pool.waiting().await, 0);
        assert_eq!(pool.stats().await.acquires.timeouts, 1);
    }

    #[tokio::test]
    async fn release_wakes_queued_caller() {
        let (pool, _) = make_pool(test_settings(1, 1)).await;
        let pool = Arc::new(pool);
        let held = pool.acquire(T, AcquireHint::any()).await.unwrap();

        let p = Arc::clone(&pool);
        let waiter = tokio::spawn(async move {
            p.acquire(Duration::from_secs(2), AcquireHint::any()).await
        });
        while pool.waiting().await == 0 {
            tokio::task::yield_now().await;
        }
        pool.release(held).await.unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), held);
    }

    #[tokio::test]
    async fn waiters_granted_in_fifo_order() {
        let (pool, _) = make_pool(test_settings(1, 1)).await;
        let pool = Arc::new(pool);
        let held = pool.acquire(T, AcquireHint::any()).await.unwrap();

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut tasks = Vec::new();
        for n in 0..3 {
            let p = Arc::clone(&pool);
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let id = p.acquire(Duration::from_secs(2), AcquireHint::any()).await.unwrap();
                order.lock().unwrap().push(n);
                p.release(id).await.unwrap();
            }));
            // Make arrival order deterministic.
            while pool.waiting().await < n + 1 {
                tokio::task::yield_now().await;
            }
        }

        pool.release(held).await.unwrap();
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let (pool, _) = make_pool(test_settings(1, 2)).await;
        let id = pool.acquire(T, AcquireHint::any()).await.unwrap();
        pool.release(id).await.unwrap();
        pool.release(id).await.unwrap();

        let info = pool.connection_info(id).await.unwrap();
        assert_eq!(info.state, ConnectionState::Idle);
        assert_eq!(info.lease_count, 1);
        assert_eq!(pool.stats().await.acquires.releases, 1);
    }

    #[tokio::test]
    async fn release_unknown_connection_is_noop() {
        let (pool, _) = make_pool(test_settings(1, 2)).await;
        assert!(pool.release(ConnectionId(999)).await.is_ok());
    }

    #[tokio::test]
    async fn cancel_removes_waiter() {
        let (pool, _) = make_pool(test_settings(1, 1)).await;
        let _held = pool.acquire(T, AcquireHint::any()).await.unwrap();

        let err = pool
            .acquire_with_cancel(Duration::from_secs(5), AcquireHint::any(), async {
                tokio::time::sleep(Duration::from_millis(10)).await;
            })
            .await
            .unwrap_err();
        assert_eq!(err, PoolError::Cancelled);
        assert_eq!(pool.waiting().await, 0);
    }

    #[tokio::test]
    async fn dropped_waiter_is_skipped() {
        let (pool, _) = make_pool(test_settings(1, 1)).await;
        let pool = Arc::new(pool);
        let held = pool.acquire(T, AcquireHint::any()).await.unwrap();

        let p = Arc::clone(&pool);
        let abandoned = tokio::spawn(async move {
            p.acquire(Duration::from_secs(5), AcquireHint::any()).await
        });
        while pool.waiting().await == 0 {
            tokio::task::yield_now().await;
        }
        abandoned.abort();
        let _ = abandoned.await;

        pool.release(held).await.unwrap();
        let info = pool.connection_info(held).await.unwrap();
        assert_eq!(info.state, ConnectionState::Idle);
    }

    // ── Read/write roles ────────────────────────────────────────────

    fn replica_settings(min: usize, max: usize) -> PoolSettings {
        PoolSettings {
            replicas: vec![Endpoint::new("replica-1.local", 5432)],
            ..test_settings(min, max)
        }
    }

    #[tokio::test]
    async fn replica_eligible_opens_replica() {
        let (pool, factory) = make_pool(replica_settings(1, 3)).await;
        let _primary = pool.acquire(T, RouteHint::PrimaryOnly.into()).await.unwrap();
        let replica = pool.acquire(T, RouteHint::ReplicaEligible.into()).await.unwrap();
        assert_eq!(factory.replica_connects.load(Ordering::Relaxed), 1);
        let info = pool.connection_info(replica).await.unwrap();
        assert_eq!(info.role, ConnectionRole::Replica);
    }

    #[tokio::test]
    async fn primary_only_never_gets_replica() {
        let (pool, _) = make_pool(replica_settings(1, 2)).await;
        let primary = pool.acquire(T, RouteHint::PrimaryOnly.into()).await.unwrap();
        let replica = pool.acquire(T, RouteHint::ReplicaEligible.into()).await.unwrap();
        pool.release(replica).await.unwrap();
        pool.release(primary).await.unwrap();

        let _p = pool.acquire(T, RouteHint::PrimaryOnly.into()).await.unwrap();
        // Pool full: one primary active, one replica idle. The replica is swapped out.
        let id = pool.acquire(T, RouteHint::PrimaryOnly.into()).await.unwrap();
        let info = pool.connection_info(id).await.unwrap();
        assert_eq!(info.role, ConnectionRole::Primary);
        assert_eq!(pool.size().await, 2);
    }

    #[tokio::test]
    async fn queued_primary_caller_is_served_when_only_a_replica_returns() {
        let (pool, _) = make_pool(replica_settings(1, 2)).await;
        let pool = Arc::new(pool);
        let primary = pool.acquire(T, RouteHint::PrimaryOnly.into()).await.unwrap();
        let replica = pool.acquire(T, RouteHint::ReplicaEligible.into()).await.unwrap();
        assert_eq!(pool.connection_info(replica).await.unwrap().role, ConnectionRole::Replica);

        let p = Arc::clone(&pool);
        let waiter = tokio::spawn(async move {
            p.acquire(Duration::from_secs(5), RouteHint::PrimaryOnly.into()).await
        });
        while pool.waiting().await == 0 {
            tokio::task::yield_now().await;
        }

        pool.release(replica).await.unwrap();
        let id = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let info = pool.connection_info(id).await.unwrap();
        assert_eq!(info.role, ConnectionRole::Primary);
        assert_eq!(info.state, ConnectionState::Active);
        assert!(pool.connection_info(replica).await.is_none());
        assert_eq!(pool.size().await, 2);
        assert_eq!(pool.waiting().await, 0);
        pool.release(primary).await.unwrap();
    }

    #[tokio::test]
    async fn avoid_prefers_other_connection() {
        let (pool, _) = make_pool(test_settings(2, 2)).await;
        let first = pool.connections().await[0].id;
        let id = pool
            .acquire(T, AcquireHint::any().avoiding(first))
            .await
            .unwrap();
        assert_ne!(id, first);
    }

    // ── Execute ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn execute_requires_active_connection() {
        let (pool, _) = make_pool(test_settings(1, 2)).await;
        let idle = pool.connections().await[0].id;
        let err = pool
            .execute(idle, "SELECT 1", &serde_json::Value::Null, &QueryContext::raw("SELECT 1"))
            .await
            .unwrap_err();
        assert_eq!(err, PoolError::UnknownConnection(idle));
    }

    #[tokio::test]
    async fn stale_lease_cannot_execute_or_release() {
        let (pool, _) = make_pool(test_settings(1, 1)).await;
        let ctx = QueryContext::raw("SELECT 1");
        let first = pool.acquire_lease(T, AcquireHint::any()).await.unwrap();
        pool.release_leased(first).await.unwrap();

        let second = pool.acquire_lease(T, AcquireHint::any()).await.unwrap();
        assert_eq!(second.id, first.id);
        assert_ne!(second.generation, first.generation);

        let err = pool
            .execute_leased(first, "SELECT 1", &serde_json::Value::Null, &ctx)
            .await
            .unwrap_err();
        assert_eq!(err, PoolError::UnknownConnection(first.id));
        pool.release_leased(first).await.unwrap();
        let info = pool.connection_info(second.id).await.unwrap();
        assert_eq!(info.state, ConnectionState::Active);
        assert_eq!(info.query_count, 0);

        pool.execute_leased(second, "SELECT 1", &serde_json::Value::Null, &ctx)
            .await
            .unwrap();
        pool.release_leased(second).await.unwrap();
        let info = pool.connection_info(second.id).await.unwrap();
        assert_eq!(info.state, ConnectionState::Idle);
        assert_eq!(info.lease_count, 2);
    }

    #[tokio::test]
    async fn execute_counts_queries() {
        let (pool, _) = make_pool(test_settings(1, 2)).await;
        let id = pool.acquire(T, AcquireHint::any()).await.unwrap();
        let out = pool
            .execute(id, "SELECT 1", &serde_json::Value::Null, &QueryContext::raw("SELECT 1"))
            .await
            .unwrap();
        assert_eq!(out.rowcount, 1);
        assert_eq!(pool.connection_info(id).await.unwrap().query_count, 1);
        assert_eq!(pool.stats().await.queries.executed, 1);
    }

    #[tokio::test]
    async fn statement_errors_do_not_hurt_health() {
        let (pool, _) = make_pool(test_settings(1, 2)).await;
        let id = pool.acquire(T, AcquireHint::any()).await.unwrap();
        let sql = "SELEC syntax error";
        let err = pool
            .execute(id, sql, &serde_json::Value::Null, &QueryContext::raw(sql))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::QueryExecution { kind: FailureKind::Statement, .. }));
        pool.release(id).await.unwrap();
        let info = pool.connection_info(id).await.unwrap();
        assert_eq!(info.health_score, 100);
        assert_eq!(info.error_count, 0);
    }

    #[tokio::test]
    async fn connection_errors_penalize_on_release_and_recycle() {
        let settings = PoolSettings {
            health_threshold: 70,
            ..test_settings(1, 2)
        };
        let (pool, factory) = make_pool(settings).await;
        let id = pool.acquire(T, AcquireHint::any()).await.unwrap();
        factory.fail_queries.store(true, Ordering::Relaxed);
        for _ in 0..2 {
            let err = pool
                .execute(id, "SELECT 1", &serde_json::Value::Null, &QueryContext::raw("SELECT 1"))
                .await
                .unwrap_err();
            assert!(err.is_transient());
        }
        factory.fail_queries.store(false, Ordering::Relaxed);
        // 100 - 2 * 25 = 50 <= 70: recycled and replaced to stay at min.
        pool.release(id).await.unwrap();
        assert!(pool.connection_info(id).await.is_none());
        assert_eq!(pool.size().await, 1);
        assert_eq!(pool.stats().await.connections.recycled, 1);
    }

    // ── Recycle ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn recycle_replaces_below_min() {
        let (pool, factory) = make_pool(test_settings(2, 4)).await;
        let victim = pool.connections().await[0].id;
        pool.recycle(victim).await.unwrap();
        assert_eq!(pool.size().await, 2);
        assert_eq!(factory.connects(), 3);
        assert_eq!(factory.closed.load(Ordering::Relaxed), 1);
        assert!(pool.connection_info(victim).await.is_none());
    }

    #[tokio::test]
    async fn recycle_above_min_does_not_replace() {
        let (pool, factory) = make_pool(test_settings(1, 4)).await;
        pool.grow(1).await;
        let victim = pool.connections().await[0].id;
        pool.recycle(victim).await.unwrap();
        assert_eq!(pool.size().await, 1);
        assert_eq!(factory.connects(), 2);
    }

    #[tokio::test]
    async fn replacement_failures_surface_pool_exhausted() {
        let settings = PoolSettings {
            max_replacement_failures: 2,
            ..test_settings(1, 2)
        };
        let (pool, factory) = make_pool(settings).await;
        let only = pool.connections().await[0].id;
        factory.should_fail.store(true, Ordering::Relaxed);

        assert!(matches!(pool.recycle(only).await, Err(PoolError::PoolExhausted(_))));
        let err = pool.acquire(T, AcquireHint::any()).await.unwrap_err();
        assert!(matches!(err, PoolError::PoolExhausted(_)));
        assert!(pool.is_degraded().await);

        factory.should_fail.store(false, Ordering::Relaxed);
        assert_eq!(pool.ensure_min_size().await, 1);
        assert!(!pool.is_degraded().await);
    }

    // ── Probes ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn probing_hides_connection_from_acquire() {
        let (pool, factory) = make_pool(test_settings(1, 2)).await;
        let candidates = pool.probe_candidates().await;
        assert_eq!(candidates.len(), 1);
        let target = pool.begin_probe(candidates[0]).await.unwrap();
        assert!(pool.begin_probe(candidates[0]).await.is_none());
        let id = pool.acquire(T, AcquireHint::any()).await.unwrap();
        assert_ne!(id, target.id);
        assert_eq!(factory.connects(), 2);

        assert!(target.run("SELECT 1").await);
        assert!(!pool.finish_probe(target.id, true, |s| s.recover(10)).await);
    }

    #[tokio::test]
    async fn connections_awaiting_probe_stay_available() {
        let (pool, factory) = make_pool(test_settings(2, 2)).await;
        let candidates = pool.probe_candidates().await;
        assert_eq!(candidates.len(), 2);
        let target = pool.begin_probe(candidates[0]).await.unwrap();

        let id = pool.acquire(T, AcquireHint::any()).await.unwrap();
        assert_eq!(id, candidates[1]);
        assert_eq!(factory.connects(), 2);
        // Checked out by now, so its probe is skipped.
        assert!(pool.begin_probe(candidates[1]).await.is_none());
        assert!(!pool.finish_probe(target.id, true, |s| s).await);
    }

    #[tokio::test]
    async fn failed_probe_below_threshold_requests_recycle() {
        let settings = PoolSettings {
            health_threshold: 70,
            ..test_settings(1, 2)
        };
        let (pool, factory) = make_pool(settings).await;
        factory.healthy.store(false, Ordering::Relaxed);
        let id = pool.probe_candidates().await[0];
        let target = pool.begin_probe(id).await.unwrap();
        assert!(!target.run("SELECT 1").await);
        let recycle = pool.finish_probe(id, false, |s| s.penalize(35)).await;
        assert!(recycle);
        let info = pool.connection_info(id).await.unwrap();
        assert_eq!(info.state, ConnectionState::Unhealthy);
        assert_eq!(info.health_score, 65);
    }

    // ── Sizing ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn grow_and_shrink_respect_bounds() {
        let (pool, _) = make_pool(test_settings(2, 4)).await;
        assert_eq!(pool.grow(10).await, 2);
        assert_eq!(pool.size().await, 4);
        assert!(pool.shrink_one().await.is_some());
        assert!(pool.shrink_one().await.is_some());
        assert!(pool.shrink_one().await.is_none());
        assert_eq!(pool.size().await, 2);
    }

    #[tokio::test]
    async fn utilization_sample_reports_active_share() {
        let (pool, _) = make_pool(test_settings(2, 4)).await;
        let _a = pool.acquire(T, AcquireHint::any()).await.unwrap();
        let sample = pool.utilization_sample().await;
        assert_eq!(sample.total, 2);
        assert_eq!(sample.active, 1);
        assert!((sample.utilization() - 0.5).abs() < f64::EPSILON);
        assert_eq!(sample.average_wait, Duration::ZERO);
    }

    // ── Shutdown ────────────────────────────────────────────────────

    #[tokio::test]
    async fn shutdown_rejects_new_acquires() {
        let (pool, _) = make_pool(test_settings(1, 2)).await;
        pool.shutdown(Duration::from_millis(10)).await;
        let err = pool.acquire(T, AcquireHint::any()).await.unwrap_err();
        assert_eq!(err, PoolError::ShuttingDown);
        assert_eq!(pool.size().await, 0);
    }

    #[tokio::test]
    async fn begin_shutdown_rejects_acquires_before_the_grace_wait() {
        let (pool, _) = make_pool(test_settings(1, 2)).await;
        let held = pool.acquire(T, AcquireHint::any()).await.unwrap();
        assert!(pool.begin_shutdown().await);
        assert!(!pool.begin_shutdown().await);
        let err = pool.acquire(T, AcquireHint::any()).await.unwrap_err();
        assert_eq!(err, PoolError::ShuttingDown);

        // The holder can still finish its work.
        pool.execute(held, "SELECT 1", &serde_json::Value::Null, &QueryContext::raw("SELECT 1"))
            .await
            .unwrap();
        pool.release(held).await.unwrap();
        assert_eq!(pool.shutdown(Duration::from_secs(1)).await, 0);
        assert_eq!(pool.size().await, 0);
    }

    #[tokio::test]
    async fn shutdown_cancels_waiters() {
        let (pool, _) = make_pool(test_settings(1, 1)).await;
        let pool = Arc::new(pool);
        let _held = pool.acquire(T, AcquireHint::any()).await.unwrap();

        let p = Arc::clone(&pool);
        let waiter = tokio::spawn(async move {
            p.acquire(Duration::from_secs(5), AcquireHint::any()).await
        });
        while pool.waiting().await == 0 {
            tokio::task::yield_now().await;
        }
        let forced = pool.shutdown(Duration::from_millis(20)).await;
        assert_eq!(forced, 1);
        assert_eq!(waiter.await.unwrap().unwrap_err(), PoolError::ShuttingDown);
    }

    #[tokio::test]
    async fn shutdown_returns_early_when_released() {
        let (pool, factory) = make_pool(test_settings(1, 1)).await;
        let pool = Arc::new(pool);
        let held = pool.acquire(T, AcquireHint::any()).await.unwrap();

        let p = Arc::clone(&pool);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            p.release(held).await.unwrap();
        });
        let started = Instant::now();
        let forced = pool.shutdown(Duration::from_secs(5)).await;
        assert_eq!(forced, 0);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(factory.closed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn raw_context_truncates_and_collapses() {
        let ctx = QueryContext::raw("SELECT   *\n FROM t");
        assert_eq!(ctx.fingerprint, "SELECT * FROM t");
        assert_eq!(ctx.category, None);
        let long = "x".repeat(200);
        assert_eq!(QueryContext::raw(&long).fingerprint.len(), RAW_CONTEXT_LEN);
    }
}
