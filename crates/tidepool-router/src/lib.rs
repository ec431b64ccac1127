//! tidepool-router — query classification and routing.
//!
//! Every statement is classified (through the fingerprint cache when
//! routing is enabled), then sent to a connection chosen by its category
//! and by the session's transaction state.
//!
//! # Routing
//!
//! ```text
//! QueryRouter::route(sql, params, session)
//!   → PatternLearner: fingerprint → cached Classification, or classify()
//!   → BEGIN              → acquire primary, pin session → IN_TRANSACTION
//!   → session pinned     → run on the pinned connection
//!   → COMMIT / ROLLBACK  → run on the pinned connection, unpin, release
//!   → read,  split on    → acquire(replica-eligible)
//!   → write, split on    → acquire(primary-only)
//!   → split off          → acquire(any)
//! ```
//!
//! Session pins live in [`SessionAffinity`], which has its own lock so
//! routing does not contend with the pool lock. Pins idle past the session
//! TTL are rolled back and released.

pub mod affinity;
pub mod classifier;
pub mod fingerprint;
pub mod learner;
pub mod router;

pub use affinity::{SessionAffinity, SessionLookup};
pub use classifier::{Classification, classify};
pub use fingerprint::Fingerprinter;
pub use learner::{FingerprintStats, Learned, PatternLearner};
pub use router::{QueryRouter, RoutedResult};
