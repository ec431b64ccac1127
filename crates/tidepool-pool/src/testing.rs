//! In-memory driver for tests and demos.
//!
//! Every connection made by a [`MemoryFactory`] shares one
//! [`DriverControls`], so a test can flip a switch and make the whole
//! "database" start failing probes, queries, or new connections.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tidepool_core::{DriverError, Endpoint, ParamShape, QueryOutput};

use crate::driver::{ConnectionFactory, Credentials, DriverConnection};

/// Statements containing this marker fail with a statement-level error.
pub const SYNTAX_ERROR_MARKER: &str = "syntax error";

/// Shared fault switches and counters.
#[derive(Debug)]
pub struct DriverControls {
    /// When false, `ping()` fails.
    pub healthy: AtomicBool,
    /// When true, every statement fails with a connection-level error.
    pub fail_queries: AtomicBool,
    /// When true, `connect()` is refused.
    pub refuse_connects: AtomicBool,
    /// Milliseconds `ping()` blocks its thread for. Tests that set it need
    /// a multi-thread runtime.
    pub ping_delay_ms: AtomicU64,
    /// Milliseconds every statement blocks its thread for.
    pub statement_delay_ms: AtomicU64,
    pub connects: AtomicU64,
    pub replica_connects: AtomicU64,
    pub closes: AtomicU64,
    statements: Mutex<Vec<String>>,
}

impl Default for DriverControls {
    fn default() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            fail_queries: AtomicBool::new(false),
            refuse_connects: AtomicBool::new(false),
            ping_delay_ms: AtomicU64::new(0),
            statement_delay_ms: AtomicU64::new(0),
            connects: AtomicU64::new(0),
            replica_connects: AtomicU64::new(0),
            closes: AtomicU64::new(0),
            statements: Mutex::new(Vec::new()),
        }
    }
}

impl DriverControls {
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    pub fn set_fail_queries(&self, fail: bool) {
        self.fail_queries.store(fail, Ordering::Relaxed);
    }

    pub fn set_refuse_connects(&self, refuse: bool) {
        self.refuse_connects.store(refuse, Ordering::Relaxed);
    }

    pub fn set_ping_delay(&self, delay: Duration) {
        self.ping_delay_ms.store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn set_statement_delay(&self, delay: Duration) {
        self.statement_delay_ms.store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    pub fn closes(&self) -> u64 {
        self.closes.load(Ordering::Relaxed)
    }

    /// Every statement executed so far, in order.
    pub fn statements(&self) -> Vec<String> {
        self.statements
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[derive(Debug)]
pub struct MemoryConnection {
    endpoint: Endpoint,
    controls: Arc<DriverControls>,
}

impl DriverConnection for MemoryConnection {
    fn execute(&mut self, sql: &str, params: &serde_json::Value) -> Result<QueryOutput, DriverError> {
        block_for(&self.controls.statement_delay_ms);
        self.controls
            .statements
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sql.to_string());

        if self.controls.fail_queries.load(Ordering::Relaxed) {
            return Err(DriverError::connection("server closed the connection unexpectedly"));
        }
        if sql.contains(SYNTAX_ERROR_MARKER) {
            return Err(DriverError::statement(format!("{SYNTAX_ERROR_MARKER} at or near \"{sql}\"")));
        }

        let verb = sql.trim_start().split_whitespace().next().unwrap_or("").to_ascii_uppercase();
        if matches!(verb.as_str(), "SELECT" | "WITH" | "SHOW" | "VALUES") {
            Ok(QueryOutput::rows(vec![serde_json::json!({
                "host": self.endpoint.host,
                "sql": sql,
            })]))
        } else {
            Ok(QueryOutput::affected(ParamShape::of(params).rows().max(1) as u64))
        }
    }

    fn ping(&mut self) -> bool {
        block_for(&self.controls.ping_delay_ms);
        self.controls.healthy.load(Ordering::Relaxed)
    }

    fn close(&mut self) {
        self.controls.closes.fetch_add(1, Ordering::Relaxed);
    }
}

fn block_for(delay_ms: &AtomicU64) {
    let ms = delay_ms.load(Ordering::Relaxed);
    if ms > 0 {
        std::thread::sleep(Duration::from_millis(ms));
    }
}

/// Factory producing [`MemoryConnection`]s.
#[derive(Debug, Default)]
pub struct MemoryFactory {
    controls: Arc<DriverControls>,
}

impl MemoryFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn controls(&self) -> Arc<DriverControls> {
        Arc::clone(&self.controls)
    }
}

impl ConnectionFactory for MemoryFactory {
    fn connect(
        &self,
        endpoint: &Endpoint,
        _credentials: &Credentials,
    ) -> Result<Box<dyn DriverConnection>, DriverError> {
        if self.controls.refuse_connects.load(Ordering::Relaxed) {
            return Err(DriverError::connection(format!("connection refused: {endpoint}")));
        }
        self.controls.connects.fetch_add(1, Ordering::Relaxed);
        if endpoint.host.starts_with("replica") {
            self.controls.replica_connects.fetch_add(1, Ordering::Relaxed);
        }
        Ok(Box::new(MemoryConnection {
            endpoint: endpoint.clone(),
            controls: Arc::clone(&self.controls),
        }))
    }
}
