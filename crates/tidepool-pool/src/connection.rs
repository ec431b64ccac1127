//! A pooled connection and its health/usage state machine.
//!
//! ```text
//!            acquire            release (healthy)
//!   IDLE ───────────────► ACTIVE ────────────────► IDLE
//!    │                      │
//!    │ probe ≤ threshold    │ release ≤ threshold
//!    ▼                      ▼
//!  UNHEALTHY ──── recycle ──► CLOSED
//! ```

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::Mutex;

use tidepool_core::{ConnectionId, ConnectionRole, ConnectionState, Endpoint, HealthScore};

use crate::driver::DriverConnection;

/// Lock-guarded raw driver handle.
pub(crate) type SharedHandle = Arc<Mutex<Box<dyn DriverConnection>>>;

/// One checkout of a connection.
///
/// `generation` changes on every checkout, so a lease held past its
/// release no longer matches the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Lease {
    pub id: ConnectionId,
    pub generation: u64,
}

/// A physical connection with tracking metadata.
#[derive(Debug)]
pub struct PooledConnection {
    pub id: ConnectionId,
    pub role: ConnectionRole,
    pub endpoint: Endpoint,
    pub state: ConnectionState,
    pub health_score: HealthScore,
    pub created_at: Instant,
    pub last_used_at: Instant,
    /// Statements executed on this connection.
    pub query_count: u64,
    /// Connection-level failures (probe or execute).
    pub error_count: u64,
    /// Completed checkouts.
    pub lease_count: u64,
    /// Bumped on every checkout.
    pub(crate) generation: u64,
    /// Connection-level failures during the current lease, applied on release.
    pub(crate) lease_errors: u32,
    /// Set while the health monitor is probing this idle connection.
    pub(crate) probing: bool,
    pub(crate) handle: SharedHandle,
}

impl PooledConnection {
    pub(crate) fn new(
        id: ConnectionId,
        role: ConnectionRole,
        endpoint: Endpoint,
        backend: Box<dyn DriverConnection>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            role,
            endpoint,
            state: ConnectionState::Idle,
            health_score: HealthScore::MAX,
            created_at: now,
            last_used_at: now,
            query_count: 0,
            error_count: 0,
            lease_count: 0,
            generation: 0,
            lease_errors: 0,
            probing: false,
            handle: Arc::new(Mutex::new(backend)),
        }
    }

    /// Idle and not being probed.
    pub fn is_available(&self) -> bool {
        self.state == ConnectionState::Idle && !self.probing
    }

    /// Mark the connection `Active` for a new owner.
    pub(crate) fn check_out(&mut self) -> Lease {
        self.state = ConnectionState::Active;
        self.last_used_at = Instant::now();
        self.generation += 1;
        Lease {
            id: self.id,
            generation: self.generation,
        }
    }

    /// Whether `generation` is the current checkout (any checkout if `None`).
    pub(crate) fn is_leased_by(&self, generation: Option<u64>) -> bool {
        self.state == ConnectionState::Active && generation.is_none_or(|g| g == self.generation)
    }

    /// Close the driver handle and mark the connection `Closed`.
    ///
    /// If a statement is still running on the handle the close is deferred
    /// to a task that waits for it to finish.
    pub(crate) fn close(&mut self) {
        self.state = ConnectionState::Closed;
        match self.handle.try_lock() {
            Ok(mut backend) => backend.close(),
            Err(_) => {
                let handle = Arc::clone(&self.handle);
                tokio::spawn(async move {
                    handle.lock().await.close();
                });
            }
        }
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            role: self.role,
            endpoint: self.endpoint.to_string(),
            state: self.state,
            health_score: self.health_score.value(),
            age_ms: self.created_at.elapsed().as_millis() as u64,
            idle_ms: self.last_used_at.elapsed().as_millis() as u64,
            query_count: self.query_count,
            error_count: self.error_count,
            lease_count: self.lease_count,
        }
    }
}

/// Read-only view of a connection for stats and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub role: ConnectionRole,
    pub endpoint: String,
    pub state: ConnectionState,
    pub health_score: u8,
    pub age_ms: u64,
    pub idle_ms: u64,
    pub query_count: u64,
    pub error_count: u64,
    pub lease_count: u64,
}
