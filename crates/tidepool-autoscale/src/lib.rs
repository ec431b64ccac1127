//! tidepool-autoscale — utilization-driven pool sizing.
//!
//! Samples the pool on a fixed interval and grows or shrinks it between
//! `min_connections` and `max_connections`.
//!
//! # Sizing Algorithm
//!
//! ```text
//! utilization = active / total
//!
//! if utilization > grow_utilization
//!    and average_wait > wait_threshold
//!    and total < max:
//!     Grow(min(grow_step, max - total))
//!
//! if utilization < shrink_utilization for shrink_window
//!    and total > min:
//!     Shrink  // close the least recently used idle connection
//! ```
//!
//! After any resize no further resize happens until `cooldown` elapses.

pub mod sizer;

pub use sizer::{AdaptiveSizer, ResizePolicy, SizeDecision};
