//! Query router: per-session transaction state machine plus read/write split.
//!
//! ```text
//!                 BEGIN (acquire + pin)
//!  NO_TRANSACTION ─────────────────────► IN_TRANSACTION(conn)
//!        ▲                                   │  any statement → conn
//!        └──── COMMIT / ROLLBACK / TTL ──────┘  (unpin + release)
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use tidepool_core::{
    AcquireHint, ConnectionId, FailureKind, PoolError, PoolResult, QueryCategory, QueryOutput,
    RouteHint, TransactionControl,
};
use tidepool_pool::{Lease, Pool, QueryContext};

use crate::affinity::{SessionAffinity, SessionLookup};
use crate::classifier::{Classification, classify};
use crate::learner::{Learned, PatternLearner};

/// Outcome of a routed statement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutedResult {
    pub connection_id: ConnectionId,
    pub hint: RouteHint,
    pub category: QueryCategory,
    pub fingerprint: String,
    pub cache_hit: bool,
    /// True if a failed read was retried on another connection.
    pub retried: bool,
    #[serde(skip)]
    pub output: QueryOutput,
}

/// Routes statements to pool connections.
pub struct QueryRouter {
    pool: Arc<Pool>,
    learner: Arc<PatternLearner>,
    sessions: SessionAffinity,
    /// Use the fingerprint cache and category-based hints.
    routing: bool,
    split: bool,
    retry_reads: bool,
    acquire_timeout: Duration,
    sweep_interval: Duration,
}

impl QueryRouter {
    pub fn new(pool: Arc<Pool>, learner: Arc<PatternLearner>) -> Self {
        let settings = pool.settings();
        let sessions = SessionAffinity::new(settings.router.session_ttl());
        Self {
            routing: settings.enable_query_routing,
            split: settings.enable_read_write_split,
            retry_reads: settings.router.retry_reads,
            acquire_timeout: settings.acquire_timeout(),
            sweep_interval: settings.router.sweep_interval(),
            sessions,
            learner,
            pool,
        }
    }

    pub fn learner(&self) -> &Arc<PatternLearner> {
        &self.learner
    }

    pub fn sessions(&self) -> &SessionAffinity {
        &self.sessions
    }

    /// Classify a statement, through the fingerprint cache when routing is on.
    pub fn classify(&self, sql: &str, params: &serde_json::Value) -> Learned {
        if self.routing {
            let learned = self.learner.classify(sql, params);
            self.pool.metrics().record_cache_lookup(learned.cache_hit);
            learned
        } else {
            Learned {
                fingerprint: self.learner.fingerprint(sql),
                classification: classify(sql, params),
                cache_hit: false,
            }
        }
    }

    /// Hint used for a statement outside any transaction.
    pub fn hint_for(&self, category: QueryCategory) -> RouteHint {
        if self.routing && self.split {
            category.split_hint()
        } else {
            RouteHint::Any
        }
    }

    /// Execute a statement, honoring the session's transaction state.
    pub async fn route(
        &self,
        sql: &str,
        params: &serde_json::Value,
        session: Option<&str>,
    ) -> PoolResult<RoutedResult> {
        let learned = self.classify(sql, params);
        let Classification { category, transaction } = learned.classification;

        let pinned = match session {
            Some(s) => self.current_pin(s).await,
            None => None,
        };

        match (transaction, session, pinned) {
            (Some(_), None, _) => Err(PoolError::TransactionAbort(
                "transaction statements require a session".to_string(),
            )),
            (Some(TransactionControl::Begin), Some(s), Some(lease)) => {
                Err(PoolError::TransactionAbort(format!(
                    "session {s} already has an open transaction on {}",
                    lease.id
                )))
            }
            (Some(TransactionControl::Begin), Some(_), None) if self.pool.is_shutting_down() => {
                Err(PoolError::ShuttingDown)
            }
            (Some(TransactionControl::Begin), Some(s), None) => {
                self.begin(s, sql, params, learned).await
            }
            (Some(_), Some(s), None) => Err(PoolError::TransactionAbort(format!(
                "no open transaction for session {s}"
            ))),
            (Some(control), Some(s), Some(lease)) if control.ends_transaction() => {
                self.finish(s, lease, sql, params, learned).await
            }
            (_, Some(s), Some(lease)) => self.run_pinned(s, lease, sql, params, learned).await,
            (None, _, _) => self.run_routed(category, sql, params, learned).await,
        }
    }

    /// The session's live pin, rolling back an expired one first.
    async fn current_pin(&self, session: &str) -> Option<Lease> {
        match self.sessions.lookup(session) {
            SessionLookup::NoTransaction => None,
            SessionLookup::InTransaction(lease) => Some(lease),
            SessionLookup::Expired(lease) => {
                self.abandon(session, lease).await;
                None
            }
        }
    }

    async fn begin(
        &self,
        session: &str,
        sql: &str,
        params: &serde_json::Value,
        learned: Learned,
    ) -> PoolResult<RoutedResult> {
        let hint = self.hint_for(QueryCategory::TransactionStatement);
        let lease = self.pool.acquire_lease(self.acquire_timeout, hint.into()).await?;
        let ctx = context(&learned);

        let output = match self.pool.execute_leased(lease, sql, params, &ctx).await {
            Ok(output) => output,
            Err(e) => {
                self.pool.release_leased(lease).await?;
                return Err(e);
            }
        };
        if let Err(existing) = self.sessions.pin(session, lease) {
            // Lost a race with a concurrent BEGIN on the same session.
            self.rollback_quietly(session, lease).await;
            self.pool.release_leased(lease).await?;
            return Err(PoolError::TransactionAbort(format!(
                "session {session} already has an open transaction on {existing}"
            )));
        }
        // Shutdown may have drained the sessions between acquire and pin.
        if self.pool.is_shutting_down() {
            if self.sessions.unpin_lease(session, lease) {
                self.abandon(session, lease).await;
            }
            return Err(PoolError::ShuttingDown);
        }
        info!(session, connection_id = %lease.id, "transaction started");
        Ok(result(lease.id, hint, learned, output, false))
    }

    async fn finish(
        &self,
        session: &str,
        lease: Lease,
        sql: &str,
        params: &serde_json::Value,
        learned: Learned,
    ) -> PoolResult<RoutedResult> {
        let ctx = context(&learned);
        let outcome = self.pool.execute_leased(lease, sql, params, &ctx).await;
        self.sessions.unpin_lease(session, lease);
        self.pool.release_leased(lease).await?;
        info!(session, connection_id = %lease.id, ok = outcome.is_ok(), "transaction finished");
        let output = outcome.map_err(|e| transaction_ended(session, e))?;
        let hint = self.hint_for(QueryCategory::TransactionStatement);
        Ok(result(lease.id, hint, learned, output, false))
    }

    async fn run_pinned(
        &self,
        session: &str,
        lease: Lease,
        sql: &str,
        params: &serde_json::Value,
        learned: Learned,
    ) -> PoolResult<RoutedResult> {
        let ctx = context(&learned);
        let output = self
            .pool
            .execute_leased(lease, sql, params, &ctx)
            .await
            .map_err(|e| transaction_ended(session, e))?;
        self.sessions.touch(session);
        debug!(session, connection_id = %lease.id, fingerprint = %learned.fingerprint, "pinned statement");
        // Pinned statements inherit the transaction's hint.
        let hint = self.hint_for(QueryCategory::TransactionStatement);
        Ok(result(lease.id, hint, learned, output, false))
    }

    async fn run_routed(
        &self,
        category: QueryCategory,
        sql: &str,
        params: &serde_json::Value,
        learned: Learned,
    ) -> PoolResult<RoutedResult> {
        let hint = self.hint_for(category);
        let ctx = context(&learned);

        let lease = self.pool.acquire_lease(self.acquire_timeout, hint.into()).await?;
        let id = lease.id;
        let outcome = self.pool.execute_leased(lease, sql, params, &ctx).await;
        self.pool.release_leased(lease).await?;

        match outcome {
            Ok(output) => Ok(result(id, hint, learned, output, false)),
            Err(PoolError::QueryExecution {
                kind: FailureKind::Connection,
                ..
            }) if self.retry_reads && category.is_read() => {
                self.pool.metrics().record_read_retry();
                warn!(
                    connection_id = %id,
                    fingerprint = %learned.fingerprint,
                    "read failed on connection, retrying once elsewhere"
                );
                let retry = self
                    .pool
                    .acquire_lease(self.acquire_timeout, AcquireHint::route(hint).avoiding(id))
                    .await?;
                let outcome = self.pool.execute_leased(retry, sql, params, &ctx).await;
                self.pool.release_leased(retry).await?;
                Ok(result(retry.id, hint, learned, outcome?, true))
            }
            Err(e) => Err(e),
        }
    }

    /// Roll back and release a transaction whose session went quiet.
    async fn abandon(&self, session: &str, lease: Lease) {
        warn!(session, connection_id = %lease.id, "abandoning open transaction, rolling back");
        self.rollback_quietly(session, lease).await;
        if let Err(e) = self.pool.release_leased(lease).await {
            warn!(session, connection_id = %lease.id, error = %e, "release after rollback failed");
        }
    }

    async fn rollback_quietly(&self, session: &str, lease: Lease) {
        let ctx = QueryContext::classified(QueryCategory::TransactionStatement, "rollback");
        if let Err(e) = self
            .pool
            .execute_leased(lease, "ROLLBACK", &serde_json::Value::Null, &ctx)
            .await
        {
            warn!(session, connection_id = %lease.id, error = %e, "rollback failed");
        }
    }

    /// Expire every session idle past the TTL. Returns how many were expired.
    pub async fn sweep_expired(&self) -> usize {
        let expired = self.sessions.take_expired(Instant::now());
        for (session, lease) in &expired {
            self.abandon(session, *lease).await;
        }
        expired.len()
    }

    /// Roll back and release every open transaction.
    pub async fn close_sessions(&self) -> usize {
        let open = self.sessions.drain();
        for (session, lease) in &open {
            self.abandon(session, *lease).await;
        }
        open.len()
    }

    /// Run the session sweep loop until `shutdown` flips.
    pub async fn run_sweeper(&self, mut shutdown: watch::Receiver<bool>) {
        debug!(interval_ms = self.sweep_interval.as_millis() as u64, "session sweeper started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.sweep_interval) => {
                    let expired = self.sweep_expired().await;
                    if expired > 0 {
                        info!(expired, "expired abandoned sessions");
                    }
                }
                _ = shutdown.changed() => {
                    debug!("session sweeper shutting down");
                    break;
                }
            }
        }
    }
}

/// A pinned statement whose checkout ended first belongs to no transaction.
fn transaction_ended(session: &str, err: PoolError) -> PoolError {
    match err {
        PoolError::UnknownConnection(id) => PoolError::TransactionAbort(format!(
            "transaction for session {session} on {id} ended before the statement ran"
        )),
        other => other,
    }
}

fn context(learned: &Learned) -> QueryContext {
    QueryContext::classified(learned.classification.category, &learned.fingerprint)
}

fn result(
    connection_id: ConnectionId,
    hint: RouteHint,
    learned: Learned,
    output: QueryOutput,
    retried: bool,
) -> RoutedResult {
    RoutedResult {
        connection_id,
        hint,
        category: learned.classification.category,
        fingerprint: learned.fingerprint,
        cache_hit: learned.cache_hit,
        retried,
        output,
    }
}
