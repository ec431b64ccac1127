//! Driver seam — the raw "execute SQL, get rows" interface the pool consumes.

use tidepool_core::{DriverError, Endpoint, QueryOutput};

/// One physical database session.
///
/// Implementations wrap a real client (Postgres, MySQL, ...). The pool
/// guarantees at most one task calls into a given connection at a time.
pub trait DriverConnection: Send + std::fmt::Debug {
    /// Execute a statement with bound parameters.
    fn execute(&mut self, sql: &str, params: &serde_json::Value) -> Result<QueryOutput, DriverError>;
    /// Liveness check without running a statement. Returns `true` if alive.
    fn ping(&mut self) -> bool;
    /// Close the underlying transport.
    fn close(&mut self);
}

/// Login details passed to the factory.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub database: String,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Opens new driver connections.
pub trait ConnectionFactory: Send + Sync {
    /// Establish a new connection to the given endpoint.
    fn connect(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> Result<Box<dyn DriverConnection>, DriverError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_debug_hides_password() {
        let creds = Credentials {
            database: "app".into(),
            user: Some("svc".into()),
            password: Some("hunter2".into()),
        };
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("***"));
    }
}
