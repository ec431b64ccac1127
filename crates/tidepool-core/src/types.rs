//! Shared types used across tidepool crates.

use std::fmt;

use serde::{Deserialize, Serialize};

// ── Connections ───────────────────────────────────────────────────

/// Opaque, stable identifier of a pooled connection.
///
/// Ids are allocated monotonically per pool, so ordering by id is
/// ordering by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Lifecycle state of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// Available for checkout.
    Idle,
    /// Checked out by exactly one caller.
    Active,
    /// Scored at or below the health threshold, awaiting recycle.
    Unhealthy,
    /// Underlying handle closed. Never handed out again.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Idle => "IDLE",
            ConnectionState::Active => "ACTIVE",
            ConnectionState::Unhealthy => "UNHEALTHY",
            ConnectionState::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

/// Which endpoint a physical connection talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionRole {
    #[default]
    Primary,
    Replica,
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionRole::Primary => write!(f, "primary"),
            ConnectionRole::Replica => write!(f, "replica"),
        }
    }
}

/// A database endpoint (`host:port`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// ── Health ────────────────────────────────────────────────────────

/// 0–100 reputation of a connection. Every mutation clamps to the range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HealthScore(u8);

impl HealthScore {
    pub const MAX: HealthScore = HealthScore(100);
    pub const MIN: HealthScore = HealthScore(0);

    pub fn new(value: u32) -> Self {
        HealthScore(value.min(100) as u8)
    }

    pub fn value(self) -> u8 {
        self.0
    }

    /// Raise the score by `step`, saturating at 100.
    pub fn recover(self, step: u8) -> Self {
        HealthScore::new(self.0 as u32 + step as u32)
    }

    /// Lower the score by `step`, saturating at 0.
    pub fn penalize(self, step: u8) -> Self {
        HealthScore(self.0.saturating_sub(step))
    }

    /// Whether the connection should be recycled under `threshold`.
    pub fn at_or_below(self, threshold: u8) -> bool {
        self.0 <= threshold
    }
}

impl Default for HealthScore {
    fn default() -> Self {
        HealthScore::MAX
    }
}

impl fmt::Display for HealthScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Queries ───────────────────────────────────────────────────────

/// Routing category assigned by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryCategory {
    /// Single-table SELECT without joins, subqueries, or aggregation.
    ReadSimple,
    /// SELECT with joins, subqueries, set operations, or aggregation.
    ReadComplex,
    /// Single-row INSERT/UPDATE/DELETE.
    WriteSimple,
    /// Multi-row INSERT/UPDATE/DELETE.
    WriteBulk,
    /// CREATE/ALTER/DROP/TRUNCATE.
    Ddl,
    /// BEGIN/COMMIT/ROLLBACK/SAVEPOINT.
    TransactionStatement,
}

impl QueryCategory {
    pub const ALL: [QueryCategory; 6] = [
        QueryCategory::ReadSimple,
        QueryCategory::ReadComplex,
        QueryCategory::WriteSimple,
        QueryCategory::WriteBulk,
        QueryCategory::Ddl,
        QueryCategory::TransactionStatement,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            QueryCategory::ReadSimple => "READ_SIMPLE",
            QueryCategory::ReadComplex => "READ_COMPLEX",
            QueryCategory::WriteSimple => "WRITE_SIMPLE",
            QueryCategory::WriteBulk => "WRITE_BULK",
            QueryCategory::Ddl => "DDL",
            QueryCategory::TransactionStatement => "TRANSACTION_STATEMENT",
        }
    }

    /// Index into `ALL`, used for per-category counter arrays.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn is_read(self) -> bool {
        matches!(self, QueryCategory::ReadSimple | QueryCategory::ReadComplex)
    }

    /// Routing hint for this category when read/write splitting is on.
    ///
    /// Anything that is not a read, transaction statements included,
    /// is `PrimaryOnly`.
    pub fn split_hint(self) -> RouteHint {
        if self.is_read() {
            RouteHint::ReplicaEligible
        } else {
            RouteHint::PrimaryOnly
        }
    }
}

impl fmt::Display for QueryCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which transaction boundary a `TransactionStatement` represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionControl {
    Begin,
    Commit,
    Rollback,
    Savepoint,
    ReleaseSavepoint,
    /// `ROLLBACK TO [SAVEPOINT] name`; the transaction stays open.
    RollbackToSavepoint,
}

impl TransactionControl {
    /// Whether this statement ends the transaction.
    pub fn ends_transaction(self) -> bool {
        matches!(self, TransactionControl::Commit | TransactionControl::Rollback)
    }
}

/// Where an acquired connection may come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RouteHint {
    /// No preference.
    #[default]
    Any,
    /// A replica is preferred, the primary is acceptable.
    ReplicaEligible,
    /// Only a primary connection may serve the request.
    PrimaryOnly,
}

impl RouteHint {
    /// Whether a connection with `role` satisfies this hint.
    pub fn accepts(self, role: ConnectionRole) -> bool {
        match self {
            RouteHint::Any | RouteHint::ReplicaEligible => true,
            RouteHint::PrimaryOnly => role == ConnectionRole::Primary,
        }
    }
}

impl fmt::Display for RouteHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteHint::Any => write!(f, "any"),
            RouteHint::ReplicaEligible => write!(f, "replica-eligible"),
            RouteHint::PrimaryOnly => write!(f, "primary-only"),
        }
    }
}

/// Preference passed to `acquire()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AcquireHint {
    pub route: RouteHint,
    /// Skip this connection if another one satisfies the request.
    pub avoid: Option<ConnectionId>,
}

impl AcquireHint {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn route(route: RouteHint) -> Self {
        Self { route, avoid: None }
    }

    pub fn avoiding(mut self, id: ConnectionId) -> Self {
        self.avoid = Some(id);
        self
    }
}

impl From<RouteHint> for AcquireHint {
    fn from(route: RouteHint) -> Self {
        AcquireHint::route(route)
    }
}

/// Structural shape of the bound parameters, as seen by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParamShape {
    #[default]
    None,
    /// One positional row of `n` values.
    Positional(usize),
    /// One named row of `n` values.
    Named(usize),
    /// `n` rows of parameters (executemany-style).
    Batch(usize),
}

impl ParamShape {
    /// Derive the shape of a JSON parameter payload.
    ///
    /// An array whose elements are all arrays or objects is a batch;
    /// any other array is one positional row.
    pub fn of(params: &serde_json::Value) -> Self {
        use serde_json::Value;
        match params {
            Value::Null => ParamShape::None,
            Value::Object(map) => ParamShape::Named(map.len()),
            Value::Array(items) if items.is_empty() => ParamShape::None,
            Value::Array(items)
                if items
                    .iter()
                    .all(|v| matches!(v, Value::Array(_) | Value::Object(_))) =>
            {
                ParamShape::Batch(items.len())
            }
            Value::Array(items) => ParamShape::Positional(items.len()),
            _ => ParamShape::Positional(1),
        }
    }

    /// Number of parameter rows the statement will be executed with.
    pub fn rows(self) -> usize {
        match self {
            ParamShape::None => 0,
            ParamShape::Positional(_) | ParamShape::Named(_) => 1,
            ParamShape::Batch(n) => n,
        }
    }
}

/// How many rows `execute` returns to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchMode {
    One,
    #[default]
    All,
    Many,
}

/// Default number of rows returned by `FetchMode::Many` without a fetch size.
pub const DEFAULT_FETCH_SIZE: usize = 100;

/// Raw result of executing a statement on a driver connection.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryOutput {
    /// Result rows, one JSON value per row.
    pub rows: Vec<serde_json::Value>,
    /// Rows returned or affected, as reported by the driver.
    pub rowcount: u64,
}

impl QueryOutput {
    pub fn affected(rowcount: u64) -> Self {
        Self {
            rows: Vec::new(),
            rowcount,
        }
    }

    pub fn rows(rows: Vec<serde_json::Value>) -> Self {
        let rowcount = rows.len() as u64;
        Self { rows, rowcount }
    }

    /// Shape the rows for the caller according to `mode`.
    ///
    /// `One` yields the first row or `null`, `All` yields every row,
    /// `Many` yields at most `fetch_size` rows.
    pub fn shape(&self, mode: FetchMode, fetch_size: Option<usize>) -> serde_json::Value {
        use serde_json::Value;
        match mode {
            FetchMode::One => self.rows.first().cloned().unwrap_or(Value::Null),
            FetchMode::All => Value::Array(self.rows.clone()),
            FetchMode::Many => {
                let n = fetch_size.unwrap_or(DEFAULT_FETCH_SIZE);
                Value::Array(self.rows.iter().take(n).cloned().collect())
            }
        }
    }
}

/// A learned hot category used to pre-warm the pool at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarmupHint {
    pub category: QueryCategory,
    pub hit_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn health_score_clamps() {
        assert_eq!(HealthScore::new(250).value(), 100);
        assert_eq!(HealthScore::MAX.recover(10), HealthScore::MAX);
        assert_eq!(HealthScore::new(5).penalize(20), HealthScore::MIN);
        assert_eq!(HealthScore::new(95).recover(10).value(), 100);
    }

    #[test]
    fn health_score_threshold() {
        assert!(HealthScore::new(65).at_or_below(70));
        assert!(HealthScore::new(70).at_or_below(70));
        assert!(!HealthScore::new(71).at_or_below(70));
    }

    #[test]
    fn route_hint_acceptance() {
        assert!(RouteHint::PrimaryOnly.accepts(ConnectionRole::Primary));
        assert!(!RouteHint::PrimaryOnly.accepts(ConnectionRole::Replica));
        assert!(RouteHint::ReplicaEligible.accepts(ConnectionRole::Primary));
        assert!(RouteHint::Any.accepts(ConnectionRole::Replica));
    }

    #[test]
    fn split_hints_by_category() {
        assert_eq!(QueryCategory::ReadSimple.split_hint(), RouteHint::ReplicaEligible);
        assert_eq!(QueryCategory::ReadComplex.split_hint(), RouteHint::ReplicaEligible);
        assert_eq!(QueryCategory::WriteBulk.split_hint(), RouteHint::PrimaryOnly);
        assert_eq!(QueryCategory::Ddl.split_hint(), RouteHint::PrimaryOnly);
    }

    #[test]
    fn category_index_matches_all() {
        for (i, c) in QueryCategory::ALL.iter().enumerate() {
            assert_eq!(c.index(), i);
        }
    }

    #[test]
    fn param_shapes() {
        assert_eq!(ParamShape::of(&json!(null)), ParamShape::None);
        assert_eq!(ParamShape::of(&json!([])), ParamShape::None);
        assert_eq!(ParamShape::of(&json!([1, "a"])), ParamShape::Positional(2));
        assert_eq!(ParamShape::of(&json!({"id": 1})), ParamShape::Named(1));
        assert_eq!(ParamShape::of(&json!([[1], [2], [3]])), ParamShape::Batch(3));
        assert_eq!(ParamShape::of(&json!([{"a": 1}])).rows(), 1);
    }

    #[test]
    fn fetch_mode_shapes_rows() {
        let out = QueryOutput::rows(vec![json!({"id": 1}), json!({"id": 2}), json!({"id": 3})]);
        assert_eq!(out.shape(FetchMode::One, None), json!({"id": 1}));
        assert_eq!(out.shape(FetchMode::All, None).as_array().unwrap().len(), 3);
        assert_eq!(out.shape(FetchMode::Many, Some(2)).as_array().unwrap().len(), 2);
        assert_eq!(QueryOutput::default().shape(FetchMode::One, None), json!(null));
    }

    #[test]
    fn serde_names() {
        assert_eq!(
            serde_json::to_string(&QueryCategory::WriteBulk).unwrap(),
            "\"WRITE_BULK\""
        );
        assert_eq!(
            serde_json::to_string(&RouteHint::ReplicaEligible).unwrap(),
            "\"replica-eligible\""
        );
        assert_eq!(serde_json::to_string(&ConnectionId(7)).unwrap(), "7");
    }
}
