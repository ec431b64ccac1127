//! tidepool-core — types shared by every tidepool subsystem.
//!
//! Holds the connection/query vocabulary (`ConnectionId`, `QueryCategory`,
//! `RouteHint`, `HealthScore`), the caller-facing error taxonomy
//! (`PoolError`), and the pool configuration (`PoolSettings`).

pub mod config;
pub mod error;
pub mod types;

pub use config::{HealthSettings, PoolSettings, RouterSettings, SizerSettings};
pub use error::{DriverError, FailureKind, PoolError, PoolResult};
pub use types::*;
