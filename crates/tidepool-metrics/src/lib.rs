//! tidepool-metrics — observability for a tidepool pool.
//!
//! Counters are plain atomics so the acquire/execute/release hot path never
//! takes a lock for bookkeeping. Latency samples live in a small bounded
//! window behind a mutex.
//!
//! # Architecture
//!
//! ```text
//! MetricsCollector
//!   ├── record_*() ← called by the pool and router
//!   └── snapshot(CurrentState) → MetricsSnapshot (immutable)
//!
//! Prometheus exposition
//!   └── render_prometheus() → text/plain
//! ```

pub mod collector;
pub mod prometheus;

pub use collector::{
    AcquireCounts, ConnectionCounts, CurrentState, MetricsCollector, MetricsSnapshot,
    QueryCounts,
};
pub use prometheus::render_prometheus;
