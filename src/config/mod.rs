//! # Configuration
//!
//! Explicit, validated configuration for the messaging core. Every tunable
//! the background loops depend on (polling intervals, heartbeat staleness,
//! retention) lives here rather than in hardcoded constants, and loads from
//! an optional YAML file with `COURIER_`-prefixed environment overrides.
//!
//! Intervals are plain numeric fields (`*_ms`, `*_seconds`) with `Duration`
//! accessors so config files stay readable and overrides stay simple.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CourierError, Result};

/// Root configuration for a courier node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourierConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub durability: DurabilityConfig,
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub tenancy: TenancyConfig,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            durability: DurabilityConfig::default(),
            listener: ListenerConfig::default(),
            tenancy: TenancyConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Postgres connection string. Falls back to `DATABASE_URL` when empty.
    #[serde(default)]
    pub url: String,
    /// Schema/namespace all courier tables live under, so multiple logical
    /// applications can share one database.
    #[serde(default = "default_schema")]
    pub schema: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    /// When false, a missing or drifted schema is fatal at startup instead
    /// of triggering automatic create-or-update.
    #[serde(default = "default_true")]
    pub auto_provision: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            schema: default_schema(),
            pool_size: default_pool_size(),
            auto_provision: true,
        }
    }
}

impl DatabaseConfig {
    pub fn resolved_url(&self) -> Result<String> {
        if !self.url.is_empty() {
            return Ok(self.url.clone());
        }
        std::env::var("DATABASE_URL").map_err(|_| {
            CourierError::configuration("no database.url configured and DATABASE_URL is unset")
        })
    }
}

/// Tunables for the durability agent's background loops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurabilityConfig {
    /// Scheduled-message promotion interval.
    #[serde(default = "default_promotion_interval_ms")]
    pub promotion_interval_ms: u64,
    /// Batch size per promotion transaction.
    #[serde(default = "default_promotion_batch_size")]
    pub promotion_batch_size: i64,
    /// Dead-node sweep / ownership reassignment interval.
    #[serde(default = "default_reassignment_interval_ms")]
    pub reassignment_interval_ms: u64,
    /// Dead-letter replay sweep interval.
    #[serde(default = "default_replay_interval_ms")]
    pub replay_interval_ms: u64,
    /// Expiration / garbage collection interval.
    #[serde(default = "default_expiration_interval_ms")]
    pub expiration_interval_ms: u64,
    /// Initial delay before the first poll of each loop, spreading out
    /// cluster-wide restarts.
    #[serde(default = "default_first_poll_delay_ms")]
    pub first_poll_delay_ms: u64,
    /// Node heartbeat publication interval.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// How stale a node's heartbeat must be before peers treat it as dead.
    /// Must exceed the heartbeat interval.
    #[serde(default = "default_node_staleness_ms")]
    pub node_staleness_ms: u64,
    /// How long Handled envelopes are retained before hard deletion.
    #[serde(default = "default_retention_seconds")]
    pub handled_retention_seconds: u64,
    /// How long a node record is kept after its last heartbeat before hard
    /// deletion. Must cover the staleness window; reassignment only needs a
    /// node to drop out of the live set, so this is purely janitorial.
    #[serde(default = "default_node_record_retention_seconds")]
    pub node_record_retention_seconds: u64,
}

impl Default for DurabilityConfig {
    fn default() -> Self {
        Self {
            promotion_interval_ms: default_promotion_interval_ms(),
            promotion_batch_size: default_promotion_batch_size(),
            reassignment_interval_ms: default_reassignment_interval_ms(),
            replay_interval_ms: default_replay_interval_ms(),
            expiration_interval_ms: default_expiration_interval_ms(),
            first_poll_delay_ms: default_first_poll_delay_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            node_staleness_ms: default_node_staleness_ms(),
            handled_retention_seconds: default_retention_seconds(),
            node_record_retention_seconds: default_node_record_retention_seconds(),
        }
    }
}

impl DurabilityConfig {
    pub fn promotion_interval(&self) -> Duration {
        Duration::from_millis(self.promotion_interval_ms)
    }

    pub fn reassignment_interval(&self) -> Duration {
        Duration::from_millis(self.reassignment_interval_ms)
    }

    pub fn replay_interval(&self) -> Duration {
        Duration::from_millis(self.replay_interval_ms)
    }

    pub fn expiration_interval(&self) -> Duration {
        Duration::from_millis(self.expiration_interval_ms)
    }

    pub fn first_poll_delay(&self) -> Duration {
        Duration::from_millis(self.first_poll_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn node_staleness(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.node_staleness_ms as i64)
    }

    pub fn handled_retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.handled_retention_seconds as i64)
    }

    pub fn node_record_retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.node_record_retention_seconds as i64)
    }
}

/// Queue listener tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Upper bound on simultaneously open leases per listener; sized onto a
    /// counting semaphore, so the next lease attempt blocks rather than
    /// queueing unboundedly.
    #[serde(default = "default_max_concurrent_messages")]
    pub max_concurrent_messages: usize,
    /// Fallback poll interval when no NOTIFY wakeup arrives.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_messages: default_max_concurrent_messages(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl ListenerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Multi-tenant routing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenancyConfig {
    /// Tenant id used when a caller presents an unknown tenant (unless
    /// `strict` is set).
    #[serde(default = "default_tenant_id")]
    pub default_tenant: String,
    /// When true, an unknown tenant is a configuration error instead of
    /// falling back to the default tenant.
    #[serde(default)]
    pub strict: bool,
    /// Refresh interval for dynamic tenant mappings.
    #[serde(default = "default_tenant_refresh_ms")]
    pub refresh_interval_ms: u64,
}

impl Default for TenancyConfig {
    fn default() -> Self {
        Self {
            default_tenant: default_tenant_id(),
            strict: false,
            refresh_interval_ms: default_tenant_refresh_ms(),
        }
    }
}

impl TenancyConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }
}

impl CourierConfig {
    /// Load configuration from an optional YAML file plus `COURIER_`
    /// environment overrides (`COURIER_DATABASE__SCHEMA=app1` overrides
    /// `database.schema`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let loaded: CourierConfig = builder
            .add_source(
                config::Environment::with_prefix("COURIER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| CourierError::configuration(format!("failed to read config: {e}")))?
            .try_deserialize()
            .map_err(|e| CourierError::configuration(format!("invalid config: {e}")))?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.pool_size == 0 {
            return Err(CourierError::configuration("database.pool_size must be > 0"));
        }
        if !is_valid_schema_name(&self.database.schema) {
            return Err(CourierError::configuration(format!(
                "database.schema {:?} is not a valid identifier",
                self.database.schema
            )));
        }
        if self.durability.node_staleness_ms <= self.durability.heartbeat_interval_ms {
            return Err(CourierError::configuration(
                "durability.node_staleness_ms must exceed durability.heartbeat_interval_ms",
            ));
        }
        if self.durability.node_record_retention_seconds * 1_000 < self.durability.node_staleness_ms
        {
            return Err(CourierError::configuration(
                "durability.node_record_retention_seconds must cover durability.node_staleness_ms",
            ));
        }
        if self.listener.max_concurrent_messages == 0 {
            return Err(CourierError::configuration(
                "listener.max_concurrent_messages must be > 0",
            ));
        }
        Ok(())
    }
}

/// Schema names are interpolated into DDL, so they are restricted to plain
/// identifiers rather than quoted arbitrary strings.
pub(crate) fn is_valid_schema_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .next()
            .map(|c| c.is_ascii_lowercase() || c == '_')
            .unwrap_or(false)
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn default_schema() -> String {
    "courier".to_string()
}

fn default_pool_size() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

fn default_promotion_interval_ms() -> u64 {
    1_000
}

fn default_promotion_batch_size() -> i64 {
    500
}

fn default_reassignment_interval_ms() -> u64 {
    5_000
}

fn default_replay_interval_ms() -> u64 {
    5_000
}

fn default_expiration_interval_ms() -> u64 {
    60_000
}

fn default_first_poll_delay_ms() -> u64 {
    3_000
}

fn default_heartbeat_interval_ms() -> u64 {
    5_000
}

fn default_node_staleness_ms() -> u64 {
    30_000
}

fn default_retention_seconds() -> u64 {
    5 * 60
}

fn default_node_record_retention_seconds() -> u64 {
    5 * 60
}

fn default_max_concurrent_messages() -> usize {
    10
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_tenant_id() -> String {
    "default".to_string()
}

fn default_tenant_refresh_ms() -> u64 {
    30_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = CourierConfig::default();
        config.validate().unwrap();
        assert_eq!(config.database.schema, "courier");
        assert_eq!(config.listener.max_concurrent_messages, 10);
        assert!(config.durability.node_staleness_ms > config.durability.heartbeat_interval_ms);
    }

    #[test]
    fn staleness_must_exceed_heartbeat() {
        let mut config = CourierConfig::default();
        config.durability.node_staleness_ms = config.durability.heartbeat_interval_ms;
        assert!(config.validate().is_err());
    }

    #[test]
    fn schema_identifier_rules() {
        assert!(is_valid_schema_name("courier"));
        assert!(is_valid_schema_name("app_1"));
        assert!(!is_valid_schema_name(""));
        assert!(!is_valid_schema_name("1app"));
        assert!(!is_valid_schema_name("app;drop table"));
        assert!(!is_valid_schema_name("App"));
    }

    #[test]
    fn zero_concurrency_rejected() {
        let mut config = CourierConfig::default();
        config.listener.max_concurrent_messages = 0;
        assert!(config.validate().is_err());
    }
}
