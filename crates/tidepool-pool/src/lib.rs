//! tidepool-pool — the connection supervisor.
//!
//! Owns every physical driver connection, hands them out one caller at a
//! time, and replaces the ones that go bad.
//!
//! # Architecture
//!
//! ```text
//! caller → Pool::acquire(timeout, hint)
//!   → idle connection matching hint → ACTIVE, return id (or a Lease)
//!   → below max_size              → open via ConnectionFactory → ACTIVE
//!   → at capacity                 → join FIFO wait queue until release/timeout
//! caller → Pool::execute(id, sql, params) → DriverConnection::execute
//! caller → Pool::release(id)
//!   → lease errors lower the health score
//!   → at/below threshold → recycle (close + replace up to min_size)
//!   → otherwise IDLE, handed to the first compatible waiter
//! ```
//!
//! A [`Lease`] names one checkout. Leased `execute`/`release` calls are
//! rejected once that checkout has ended, so a late statement never runs
//! for the connection's next owner.
//!
//! Structural state (the connection map and wait queue) lives behind one
//! pool-wide mutex. Each raw driver handle has its own lock so statements
//! run without holding the pool lock.

pub mod connection;
pub mod driver;
pub mod supervisor;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use connection::{ConnectionInfo, Lease, PooledConnection};
pub use driver::{ConnectionFactory, Credentials, DriverConnection};
pub use supervisor::{Pool, ProbeTarget, QueryContext, UtilizationSample};
