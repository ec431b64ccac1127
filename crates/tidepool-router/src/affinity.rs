//! Session affinity: which connection a session's open transaction is pinned to.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tidepool_core::ConnectionId;
use tidepool_pool::Lease;

/// State of a session as seen by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionLookup {
    /// No open transaction.
    NoTransaction,
    /// Open transaction pinned to this checkout.
    InTransaction(Lease),
    /// The pin outlived the TTL and has been removed; the caller must roll
    /// back and release the connection.
    Expired(Lease),
}

#[derive(Debug, Clone, Copy)]
struct Pin {
    lease: Lease,
    expires_at: Instant,
}

/// `session_id → (lease, expires_at)`.
///
/// Has its own lock, separate from the pool's.
#[derive(Debug)]
pub struct SessionAffinity {
    ttl: Duration,
    pins: Mutex<HashMap<String, Pin>>,
}

impl SessionAffinity {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            pins: Mutex::new(HashMap::new()),
        }
    }

    /// Pin `session` to the checkout `lease`.
    ///
    /// Fails with the existing connection if the session is already pinned.
    pub fn pin(&self, session: &str, lease: Lease) -> Result<(), ConnectionId> {
        let mut pins = self.lock();
        if let Some(existing) = pins.get(session) {
            return Err(existing.lease.id);
        }
        pins.insert(
            session.to_string(),
            Pin {
                lease,
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(())
    }

    /// Look up `session`, removing the pin if it has expired.
    pub fn lookup(&self, session: &str) -> SessionLookup {
        self.lookup_at(session, Instant::now())
    }

    fn lookup_at(&self, session: &str, now: Instant) -> SessionLookup {
        let mut pins = self.lock();
        match pins.get(session).copied() {
            None => SessionLookup::NoTransaction,
            Some(pin) if pin.expires_at <= now => {
                pins.remove(session);
                SessionLookup::Expired(pin.lease)
            }
            Some(pin) => SessionLookup::InTransaction(pin.lease),
        }
    }

    /// Extend the pin's TTL after activity.
    pub fn touch(&self, session: &str) {
        if let Some(pin) = self.lock().get_mut(session) {
            pin.expires_at = Instant::now() + self.ttl;
        }
    }

    /// Remove the pin, returning the checkout it pointed to.
    pub fn unpin(&self, session: &str) -> Option<Lease> {
        self.lock().remove(session).map(|p| p.lease)
    }

    /// Remove the pin only if it still points at `lease`.
    pub fn unpin_lease(&self, session: &str, lease: Lease) -> bool {
        let mut pins = self.lock();
        if pins.get(session).is_some_and(|p| p.lease == lease) {
            pins.remove(session);
            true
        } else {
            false
        }
    }

    /// Remove and return every pin that has expired by `now`.
    pub fn take_expired(&self, now: Instant) -> Vec<(String, Lease)> {
        let mut pins = self.lock();
        let expired: Vec<String> = pins
            .iter()
            .filter(|(_, p)| p.expires_at <= now)
            .map(|(s, _)| s.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|s| pins.remove(&s).map(|p| (s, p.lease)))
            .collect()
    }

    /// Remove every pin (used on shutdown).
    pub fn drain(&self) -> Vec<(String, Lease)> {
        self.lock().drain().map(|(s, p)| (s, p.lease)).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Pin>> {
        self.pins.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
