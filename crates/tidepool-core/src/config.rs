//! Pool configuration.
//!
//! Settings arrive either as the JSON `initialize` payload or as a TOML
//! file. Unknown keys are ignored; every tuning knob has a default.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PoolError, PoolResult};
use crate::types::Endpoint;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Name reported in stats and log fields.
    pub pool_name: String,
    /// `postgresql`, `mysql`, `sqlite`, ... (selects the default port).
    pub database_type: String,
    pub host: String,
    pub port: Option<u16>,
    pub database: String,
    pub user: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub min_connections: usize,
    pub max_connections: usize,
    /// Connections scoring at or below this are recycled.
    pub health_threshold: u8,
    pub pre_warm: bool,
    pub adaptive_sizing: bool,
    pub enable_query_routing: bool,
    pub enable_read_write_split: bool,
    /// Capacity of the query fingerprint cache.
    pub cache_size: usize,
    /// Read replicas. Empty means every connection goes to the primary.
    pub replicas: Vec<Endpoint>,
    /// Default acquire timeout.
    pub acquire_timeout_ms: u64,
    /// How many learned hot categories may open an extra connection at startup.
    pub pre_warm_top_n: usize,
    /// Consecutive connect failures before the pool reports exhaustion.
    pub max_replacement_failures: u32,
    pub health: HealthSettings,
    pub sizer: SizerSettings,
    pub router: RouterSettings,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            pool_name: "default".to_string(),
            database_type: "postgresql".to_string(),
            host: String::new(),
            port: None,
            database: String::new(),
            user: None,
            password: None,
            min_connections: 2,
            max_connections: 10,
            health_threshold: 50,
            pre_warm: false,
            adaptive_sizing: true,
            enable_query_routing: true,
            enable_read_write_split: false,
            cache_size: 1000,
            replicas: Vec::new(),
            acquire_timeout_ms: 5_000,
            pre_warm_top_n: 3,
            max_replacement_failures: 3,
            health: HealthSettings::default(),
            sizer: SizerSettings::default(),
            router: RouterSettings::default(),
        }
    }
}

/// Health probe tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub interval_ms: u64,
    /// Lightweight statement issued against idle connections.
    pub probe_statement: String,
    /// Score gained per successful probe.
    pub recovery_step: u8,
    /// Score lost per failed probe or connection-level query error.
    pub penalty_step: u8,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            probe_statement: "SELECT 1".to_string(),
            recovery_step: 10,
            penalty_step: 25,
        }
    }
}

impl HealthSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Adaptive sizing tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SizerSettings {
    pub interval_ms: u64,
    /// Utilization (0.0–1.0) above which the pool may grow.
    pub grow_utilization: f64,
    /// Utilization (0.0–1.0) below which the pool may shrink.
    pub shrink_utilization: f64,
    /// Average wait above which the pool may grow.
    pub wait_threshold_ms: u64,
    /// Connections added per grow decision.
    pub grow_step: usize,
    /// Minimum time between two resizes.
    pub cooldown_ms: u64,
    /// How long utilization must stay low before shrinking.
    pub shrink_window_ms: u64,
}

impl Default for SizerSettings {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            grow_utilization: 0.8,
            shrink_utilization: 0.3,
            wait_threshold_ms: 100,
            grow_step: 2,
            cooldown_ms: 30_000,
            shrink_window_ms: 60_000,
        }
    }
}

impl SizerSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn wait_threshold(&self) -> Duration {
        Duration::from_millis(self.wait_threshold_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn shrink_window(&self) -> Duration {
        Duration::from_millis(self.shrink_window_ms)
    }
}

/// Query router tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterSettings {
    /// Inactivity after which an open transaction is rolled back.
    pub session_ttl_ms: u64,
    /// Retry a failed read once on a different connection.
    pub retry_reads: bool,
    /// How often abandoned sessions are swept.
    pub sweep_interval_ms: u64,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            session_ttl_ms: 300_000,
            retry_reads: false,
            sweep_interval_ms: 10_000,
        }
    }
}

impl RouterSettings {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_millis(self.session_ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl PoolSettings {
    /// Parse and validate an `initialize` payload.
    pub fn from_json(value: &serde_json::Value) -> PoolResult<Self> {
        let settings: PoolSettings = serde_json::from_value(value.clone())
            .map_err(|e| PoolError::Configuration(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml_str(content: &str) -> PoolResult<Self> {
        let settings: PoolSettings =
            toml::from_str(content).map_err(|e| PoolError::Configuration(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::from_toml_str(&content)?)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check required keys and bounds.
    pub fn validate(&self) -> PoolResult<()> {
        if self.host.trim().is_empty() {
            return Err(PoolError::Configuration("missing required key `host`".into()));
        }
        if self.database.trim().is_empty() {
            return Err(PoolError::Configuration(
                "missing required key `database`".into(),
            ));
        }
        if self.min_connections == 0 || self.max_connections == 0 {
            return Err(PoolError::Configuration(format!(
                "pool bounds must be positive (min={}, max={})",
                self.min_connections, self.max_connections
            )));
        }
        if self.min_connections > self.max_connections {
            return Err(PoolError::Configuration(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        // A fresh connection scores 100, so a threshold of 100 recycles everything.
        if self.health_threshold >= 100 {
            return Err(PoolError::Configuration(format!(
                "health_threshold must be within 0..100, got {}",
                self.health_threshold
            )));
        }
        if self.cache_size == 0 {
            return Err(PoolError::Configuration("cache_size must be positive".into()));
        }
        let s = &self.sizer;
        if !(0.0..=1.0).contains(&s.grow_utilization)
            || !(0.0..=1.0).contains(&s.shrink_utilization)
            || s.shrink_utilization >= s.grow_utilization
        {
            return Err(PoolError::Configuration(format!(
                "sizer thresholds must satisfy 0 <= shrink ({}) < grow ({}) <= 1",
                s.shrink_utilization, s.grow_utilization
            )));
        }
        Ok(())
    }

    /// Port to use when none is configured.
    pub fn default_port(&self) -> u16 {
        match self.database_type.to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => 3306,
            "sqlite" => 0,
            _ => 5432,
        }
    }

    pub fn primary_endpoint(&self) -> Endpoint {
        Endpoint::new(&self.host, self.port.unwrap_or_else(|| self.default_port()))
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}
