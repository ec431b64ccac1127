//! Metrics collector — pool, connection, and query counters.
//!
//! Uses a lock-free design with atomics for counters and a mutex-protected
//! sample window for latency percentiles.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::debug;

use tidepool_core::QueryCategory;

/// Maximum latency samples retained for percentile computation.
const LATENCY_WINDOW: usize = 4096;

/// Collects counters for a single pool.
#[derive(Debug)]
pub struct MetricsCollector {
    pool_name: String,
    connections_created: AtomicU64,
    connections_closed: AtomicU64,
    connections_recycled: AtomicU64,
    connect_failures: AtomicU64,
    queries_executed: AtomicU64,
    query_errors: AtomicU64,
    by_category: [AtomicU64; 6],
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    read_retries: AtomicU64,
    acquires: AtomicU64,
    acquire_waits: AtomicU64,
    acquire_timeouts: AtomicU64,
    releases: AtomicU64,
    /// Query latency samples in microseconds, oldest first.
    latencies: Mutex<VecDeque<u64>>,
}

impl MetricsCollector {
    pub fn new(pool_name: &str) -> Self {
        Self {
            pool_name: pool_name.to_string(),
            connections_created: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            connections_recycled: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            queries_executed: AtomicU64::new(0),
            query_errors: AtomicU64::new(0),
            by_category: Default::default(),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            read_retries: AtomicU64::new(0),
            acquires: AtomicU64::new(0),
            acquire_waits: AtomicU64::new(0),
            acquire_timeouts: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            latencies: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW)),
        }
    }

    pub fn pool_name(&self) -> &str {
        &self.pool_name
    }

    pub fn record_connection_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_recycled(&self) {
        self.connections_recycled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect_failure(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a granted acquire; `waited` is true if it sat in the wait queue.
    pub fn record_acquire(&self, waited: bool) {
        self.acquires.fetch_add(1, Ordering::Relaxed);
        if waited {
            self.acquire_waits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_acquire_timeout(&self) {
        self.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_release(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an executed statement.
    pub fn record_query(&self, category: Option<QueryCategory>, latency: Duration, is_error: bool) {
        self.queries_executed.fetch_add(1, Ordering::Relaxed);
        if is_error {
            self.query_errors.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(c) = category {
            self.by_category[c.index()].fetch_add(1, Ordering::Relaxed);
        }

        let mut window = self.latencies.lock().unwrap_or_else(PoisonError::into_inner);
        if window.len() == LATENCY_WINDOW {
            window.pop_front();
        }
        window.push_back(latency.as_micros() as u64);
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_read_retry(&self) {
        self.read_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn queries_executed(&self) -> u64 {
        self.queries_executed.load(Ordering::Relaxed)
    }

    pub fn releases(&self) -> u64 {
        self.releases.load(Ordering::Relaxed)
    }

    /// Build an immutable snapshot combining counters with the pool's current state.
    pub fn snapshot(&self, current: CurrentState) -> MetricsSnapshot {
        let executed = self.queries_executed.load(Ordering::Relaxed);
        let errors = self.query_errors.load(Ordering::Relaxed);
        let error_rate = if executed > 0 {
            errors as f64 / executed as f64
        } else {
            0.0
        };

        let (p50, p99) = {
            let window = self.latencies.lock().unwrap_or_else(PoisonError::into_inner);
            let samples: Vec<u64> = window.iter().copied().collect();
            compute_percentiles(&samples)
        };

        let by_category = QueryCategory::ALL
            .iter()
            .map(|c| {
                (
                    c.as_str().to_string(),
                    self.by_category[c.index()].load(Ordering::Relaxed),
                )
            })
            .collect();

        let snapshot = MetricsSnapshot {
            pool_name: self.pool_name.clone(),
            taken_at_ms: epoch_millis(),
            connections: ConnectionCounts {
                created: self.connections_created.load(Ordering::Relaxed),
                closed: self.connections_closed.load(Ordering::Relaxed),
                recycled: self.connections_recycled.load(Ordering::Relaxed),
                connect_failures: self.connect_failures.load(Ordering::Relaxed),
                active: current.active_connections,
                idle: current.available_connections,
            },
            queries: QueryCounts {
                executed,
                errors,
                error_rate,
                by_category,
                cache_hits: self.cache_hits.load(Ordering::Relaxed),
                cache_misses: self.cache_misses.load(Ordering::Relaxed),
                read_retries: self.read_retries.load(Ordering::Relaxed),
                latency_p50_ms: p50,
                latency_p99_ms: p99,
            },
            acquires: AcquireCounts {
                granted: self.acquires.load(Ordering::Relaxed),
                waited: self.acquire_waits.load(Ordering::Relaxed),
                timeouts: self.acquire_timeouts.load(Ordering::Relaxed),
                releases: self.releases.load(Ordering::Relaxed),
            },
            current_state: current,
        };

        debug!(
            pool = %snapshot.pool_name,
            executed,
            errors,
            active = snapshot.current_state.active_connections,
            "metrics snapshot taken"
        );
        snapshot
    }
}

/// Live pool state captured under the pool lock for a snapshot.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CurrentState {
    pub active_connections: usize,
    pub available_connections: usize,
    pub total_connections: usize,
    pub waiting: usize,
    /// Connection id → health score.
    pub health_scores: BTreeMap<u64, u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionCounts {
    pub created: u64,
    pub closed: u64,
    pub recycled: u64,
    pub connect_failures: u64,
    pub active: usize,
    pub idle: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryCounts {
    pub executed: u64,
    pub errors: u64,
    /// Errors / executed (0.0–1.0).
    pub error_rate: f64,
    pub by_category: BTreeMap<String, u64>,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub read_retries: u64,
    pub latency_p50_ms: f64,
    pub latency_p99_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquireCounts {
    pub granted: u64,
    pub waited: u64,
    pub timeouts: u64,
    pub releases: u64,
}

/// Point-in-time, read-only copy of pool statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub pool_name: String,
    pub taken_at_ms: u64,
    pub connections: ConnectionCounts,
    pub queries: QueryCounts,
    pub acquires: AcquireCounts,
    pub current_state: CurrentState,
}

/// Compute P50 and P99 latency from latency samples in microseconds.
///
/// Returns (p50_ms, p99_ms). If empty, returns (0.0, 0.0).
fn compute_percentiles(latencies: &[u64]) -> (f64, f64) {
    if latencies.is_empty() {
        return (0.0, 0.0);
    }

    let mut sorted = latencies.to_vec();
    sorted.sort_unstable();

    let p50_idx = (sorted.len() as f64 * 0.50) as usize;
    let p99_idx = (sorted.len() as f64 * 0.99) as usize;

    let p50 = sorted[p50_idx.min(sorted.len() - 1)] as f64 / 1000.0;
    let p99 = sorted[p99_idx.min(sorted.len() - 1)] as f64 / 1000.0;

    (p50, p99)
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
