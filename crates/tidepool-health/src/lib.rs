//! tidepool-health — health monitoring and self-healing for pooled connections.
//!
//! A background loop probes every idle connection on a fixed interval and
//! rescores it. Connections that fall to or below the pool's health
//! threshold are recycled and replaced.
//!
//! # Architecture
//!
//! ```text
//! HealthMonitor (one per pool)
//!   ├── Pool::probe_candidates() → idle connection ids
//!   ├── Pool::begin_probe(id) → one connection at a time, hidden from acquire
//!   ├── ProbeTarget::run(probe_statement) → ProbeResult
//!   ├── rescore() → recover / penalize
//!   ├── Pool::finish_probe() → back to IDLE or UNHEALTHY
//!   └── Pool::recycle() for UNHEALTHY, then top up to min_size
//! ```
//!
//! Active connections are never probed; the pool applies their
//! connection-level failures when they are released.

pub mod checker;
pub mod monitor;

pub use checker::{ProbeReport, ProbeResult, rescore};
pub use monitor::HealthMonitor;
