//! JSON operation surface.
//!
//! Requests are objects tagged by `"operation"`:
//!
//! ```text
//! {"operation": "initialize", "host": "db", "database": "app", ...}
//! {"operation": "acquire"}                          → {"connection_id": 1}
//! {"operation": "execute", "connection_id": 1,
//!  "query": "SELECT ...", "params": [..],
//!  "fetch_mode": "all"}                             → {"data": [..], "rowcount": 3}
//! {"operation": "route", "query": "...", "session_id": "s1"}
//! {"operation": "release", "connection_id": 1}
//! {"operation": "stats"}
//! {"operation": "shutdown", "grace_period_seconds": 5}
//! ```
//!
//! Failures answer `{"error": {"kind": "...", "message": "..."}}` where
//! `kind` is one of the stable [`PoolError::kind`] strings.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use tidepool_core::{
    AcquireHint, ConnectionId, FetchMode, PoolError, PoolResult, PoolSettings, RouteHint,
};
use tidepool_metrics::MetricsSnapshot;
use tidepool_pool::ConnectionFactory;
use tidepool_router::RoutedResult;

use crate::Tidepool;

/// Kind reported for requests that cannot be parsed.
pub const INVALID_REQUEST: &str = "InvalidRequest";

/// One operation request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum Request {
    Initialize(PoolSettings),
    Acquire {
        #[serde(default)]
        timeout_ms: Option<u64>,
        #[serde(default)]
        route: Option<RouteHint>,
    },
    Execute {
        #[serde(default)]
        connection_id: Option<ConnectionId>,
        #[serde(default)]
        session_id: Option<String>,
        query: String,
        #[serde(default)]
        params: serde_json::Value,
        #[serde(default)]
        fetch_mode: FetchMode,
        #[serde(default)]
        fetch_size: Option<usize>,
    },
    Route {
        query: String,
        #[serde(default)]
        params: serde_json::Value,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        fetch_mode: FetchMode,
        #[serde(default)]
        fetch_size: Option<usize>,
    },
    Release {
        connection_id: ConnectionId,
    },
    Stats,
    Shutdown {
        #[serde(default)]
        grace_period_seconds: f64,
    },
}

/// Error payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

impl From<&PoolError> for ErrorBody {
    fn from(err: &PoolError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// One operation response. Serializes to the bare JSON object.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Response {
    Initialized {
        pool_name: String,
        size: usize,
    },
    Acquired {
        connection_id: ConnectionId,
    },
    Executed {
        data: serde_json::Value,
        rowcount: u64,
    },
    Routed {
        data: serde_json::Value,
        rowcount: u64,
        #[serde(flatten)]
        routed: RoutedResult,
    },
    Released {
        released: ConnectionId,
    },
    Stats(MetricsSnapshot),
    ShutDown {
        force_closed: usize,
    },
    Error {
        error: ErrorBody,
    },
}

impl Response {
    pub fn error(err: &PoolError) -> Self {
        Response::Error { error: err.into() }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error { .. })
    }
}

/// Dispatches operation requests to a [`Tidepool`].
///
/// The pool does not exist until an `initialize` request succeeds. After
/// `shutdown` it stays in place so later requests see `PoolShuttingDown`.
pub struct Service {
    factory: Arc<dyn ConnectionFactory>,
    tidepool: RwLock<Option<Arc<Tidepool>>>,
}

impl Service {
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            factory,
            tidepool: RwLock::new(None),
        }
    }

    /// Handle a raw JSON request.
    pub async fn handle_json(&self, request: serde_json::Value) -> serde_json::Value {
        let initialize = request.get("operation").and_then(|op| op.as_str()) == Some("initialize");
        let response = match serde_json::from_value::<Request>(request) {
            Ok(request) => self.handle(request).await,
            // Bad initialize payloads are bad startup parameters.
            Err(e) if initialize => Response::error(&PoolError::Configuration(e.to_string())),
            Err(e) => {
                debug!(error = %e, "rejected malformed request");
                invalid_request(&e.to_string())
            }
        };
        serde_json::to_value(&response).unwrap_or_else(|e| {
            serde_json::json!({"error": {"kind": INVALID_REQUEST, "message": e.to_string()}})
        })
    }

    /// Handle a typed request.
    pub async fn handle(&self, request: Request) -> Response {
        let outcome = match request {
            Request::Initialize(settings) => self.initialize(settings).await,
            other => match self.current().await {
                Ok(tidepool) => dispatch(&tidepool, other).await,
                Err(e) => Err(e),
            },
        };
        outcome.unwrap_or_else(|e| {
            if e.is_transient() {
                debug!(kind = e.kind(), error = %e, "operation failed");
            } else {
                warn!(kind = e.kind(), error = %e, "operation failed");
            }
            Response::error(&e)
        })
    }

    /// The running pool, if initialized.
    pub async fn tidepool(&self) -> Option<Arc<Tidepool>> {
        self.tidepool.read().await.clone()
    }

    async fn initialize(&self, settings: PoolSettings) -> PoolResult<Response> {
        let mut slot = self.tidepool.write().await;
        if slot.is_some() {
            return Err(PoolError::Configuration("pool already initialized".to_string()));
        }
        let tidepool = Tidepool::start(settings, Arc::clone(&self.factory)).await?;
        let response = Response::Initialized {
            pool_name: tidepool.pool().name().to_string(),
            size: tidepool.pool().size().await,
        };
        *slot = Some(Arc::new(tidepool));
        Ok(response)
    }

    async fn current(&self) -> PoolResult<Arc<Tidepool>> {
        self.tidepool()
            .await
            .ok_or_else(|| PoolError::Configuration("pool not initialized".to_string()))
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service").finish_non_exhaustive()
    }
}

async fn dispatch(tidepool: &Tidepool, request: Request) -> PoolResult<Response> {
    match request {
        Request::Initialize(_) => Err(PoolError::Configuration(
            "pool already initialized".to_string(),
        )),
        Request::Acquire { timeout_ms, route } => {
            let hint = route.map(AcquireHint::route).unwrap_or_else(AcquireHint::any);
            let connection_id = match timeout_ms {
                Some(ms) => tidepool.pool().acquire(Duration::from_millis(ms), hint).await?,
                None => tidepool.acquire(hint).await?,
            };
            Ok(Response::Acquired { connection_id })
        }
        Request::Execute {
            connection_id,
            session_id,
            query,
            params,
            fetch_mode,
            fetch_size,
        } => match (session_id, connection_id) {
            (Some(session), _) => {
                let routed = tidepool.route(&query, &params, Some(&session)).await?;
                Ok(routed_response(routed, fetch_mode, fetch_size))
            }
            (None, Some(id)) => {
                let output = tidepool.execute(id, &query, &params).await?;
                Ok(Response::Executed {
                    data: output.shape(fetch_mode, fetch_size),
                    rowcount: output.rowcount,
                })
            }
            (None, None) => Ok(invalid_request(
                "execute needs a connection_id or a session_id",
            )),
        },
        Request::Route {
            query,
            params,
            session_id,
            fetch_mode,
            fetch_size,
        } => {
            let routed = tidepool.route(&query, &params, session_id.as_deref()).await?;
            Ok(routed_response(routed, fetch_mode, fetch_size))
        }
        Request::Release { connection_id } => {
            tidepool.release(connection_id).await?;
            Ok(Response::Released {
                released: connection_id,
            })
        }
        Request::Stats => Ok(Response::Stats(tidepool.stats().await)),
        Request::Shutdown {
            grace_period_seconds,
        } => {
            let grace = Duration::try_from_secs_f64(grace_period_seconds).unwrap_or_default();
            let force_closed = tidepool.shutdown(grace).await;
            Ok(Response::ShutDown { force_closed })
        }
    }
}

fn invalid_request(message: &str) -> Response {
    Response::Error {
        error: ErrorBody {
            kind: INVALID_REQUEST.to_string(),
            message: message.to_string(),
        },
    }
}

fn routed_response(routed: RoutedResult, mode: FetchMode, fetch_size: Option<usize>) -> Response {
    Response::Routed {
        data: routed.output.shape(mode, fetch_size),
        rowcount: routed.output.rowcount,
        routed,
    }
}
