use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string
    pub redis_url: String,

    /// Address the API server binds to
    pub api_bind_addr: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Secret used to verify client identity tokens (HS256)
    pub jwt_secret: String,

    /// JWT token expiry in hours (used when minting tokens for tooling and tests)
    pub jwt_expiry_hours: u64,

    /// Shared key upstream producers present in `X-Producer-Key`
    pub producer_api_key: Option<String>,

    /// Resend API key for email delivery
    pub resend_api_key: Option<String>,

    /// Email sender address
    pub email_from: Option<String>,

    /// Push gateway base URL (mobile/web push relay)
    pub push_gateway_url: Option<String>,

    /// Bearer key for the push gateway
    pub push_gateway_key: Option<String>,

    pub delivery: DeliveryConfig,

    pub realtime: RealtimeConfig,
}

/// What the dispatch orchestrator does when a queue partition is saturated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackpressureMode {
    /// Reject immediately with `QueueSaturated`.
    FailFast,
    /// Wait (bounded) for the partition to drain, then reject.
    Block,
}

impl FromStr for BackpressureMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fail-fast" | "fail_fast" => Ok(BackpressureMode::FailFast),
            "block" => Ok(BackpressureMode::Block),
            other => Err(format!("unknown backpressure mode '{}'", other)),
        }
    }
}

/// Delivery queue, retry and worker tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Attempts before a transiently failing job becomes permanent (default: 5)
    pub max_attempts: u32,
    /// Upper bound for a single backoff delay in seconds (default: 300)
    pub backoff_cap_secs: u64,
    /// Lease length granted to a worker on claim (default: 60)
    pub lease_secs: u64,
    /// Timeout applied to every channel adapter call (default: 10000)
    pub adapter_timeout_ms: u64,
    /// Maximum outstanding (pending + in-flight) jobs per channel partition
    pub partition_max_in_flight: i64,
    /// Concurrent deliveries per worker partition (default: 8)
    pub worker_concurrency: usize,
    /// Idle poll interval for workers when no job is claimable (default: 500)
    pub poll_interval_ms: u64,
    /// Maintenance sweep cadence (default: 30)
    pub sweep_interval_secs: u64,
    /// Days finished jobs are retained for deduplication (default: 7)
    pub retention_days: u32,
    pub backpressure_mode: BackpressureMode,
    /// Bound on how long `Block` mode waits (default: 2000)
    pub backpressure_block_timeout_ms: u64,
}

impl DeliveryConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_millis(self.adapter_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_cap_secs: 300,
            lease_secs: 60,
            adapter_timeout_ms: 10_000,
            partition_max_in_flight: 10_000,
            worker_concurrency: 8,
            poll_interval_ms: 500,
            sweep_interval_secs: 30,
            retention_days: 7,
            backpressure_mode: BackpressureMode::FailFast,
            backpressure_block_timeout_ms: 2_000,
        }
    }
}

/// Realtime connection manager tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct RealtimeConfig {
    /// Number of registry shards (default: 32)
    pub registry_shards: usize,
    /// Close a connection after this long without a client frame (default: 90)
    pub idle_timeout_secs: u64,
    /// Per-connection outbound buffer; a full buffer closes the connection (default: 64)
    pub outbound_buffer: usize,
}

impl RealtimeConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            registry_shards: 32,
            idle_timeout_secs: 90,
            outbound_buffer: 64,
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let delivery_defaults = DeliveryConfig::default();
        let realtime_defaults = RealtimeConfig::default();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            api_bind_addr: std::env::var("API_BIND_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            db_max_connections: parse_var("DB_MAX_CONNECTIONS", 20)?,
            jwt_secret: std::env::var("JWT_SECRET")
                .map_err(|_| anyhow::anyhow!("JWT_SECRET environment variable is required"))?,
            jwt_expiry_hours: parse_var("JWT_EXPIRY_HOURS", 24)?,
            producer_api_key: optional_var("PRODUCER_API_KEY"),
            resend_api_key: optional_var("RESEND_API_KEY"),
            email_from: optional_var("EMAIL_FROM"),
            push_gateway_url: optional_var("PUSH_GATEWAY_URL"),
            push_gateway_key: optional_var("PUSH_GATEWAY_KEY"),
            delivery: DeliveryConfig {
                max_attempts: parse_var("DELIVERY_MAX_ATTEMPTS", delivery_defaults.max_attempts)?,
                backoff_cap_secs: parse_var(
                    "DELIVERY_BACKOFF_CAP_SECS",
                    delivery_defaults.backoff_cap_secs,
                )?,
                lease_secs: parse_var("DELIVERY_LEASE_SECS", delivery_defaults.lease_secs)?,
                adapter_timeout_ms: parse_var(
                    "DELIVERY_ADAPTER_TIMEOUT_MS",
                    delivery_defaults.adapter_timeout_ms,
                )?,
                partition_max_in_flight: parse_var(
                    "DELIVERY_PARTITION_MAX_IN_FLIGHT",
                    delivery_defaults.partition_max_in_flight,
                )?,
                worker_concurrency: parse_var(
                    "DELIVERY_WORKER_CONCURRENCY",
                    delivery_defaults.worker_concurrency,
                )?,
                poll_interval_ms: parse_var(
                    "DELIVERY_POLL_INTERVAL_MS",
                    delivery_defaults.poll_interval_ms,
                )?,
                sweep_interval_secs: parse_var(
                    "DELIVERY_SWEEP_INTERVAL_SECS",
                    delivery_defaults.sweep_interval_secs,
                )?,
                retention_days: parse_var(
                    "DELIVERY_RETENTION_DAYS",
                    delivery_defaults.retention_days,
                )?,
                backpressure_mode: parse_var(
                    "BACKPRESSURE_MODE",
                    delivery_defaults.backpressure_mode,
                )?,
                backpressure_block_timeout_ms: parse_var(
                    "BACKPRESSURE_BLOCK_TIMEOUT_MS",
                    delivery_defaults.backpressure_block_timeout_ms,
                )?,
            },
            realtime: RealtimeConfig {
                registry_shards: parse_var(
                    "REALTIME_REGISTRY_SHARDS",
                    realtime_defaults.registry_shards,
                )?,
                idle_timeout_secs: parse_var(
                    "REALTIME_IDLE_TIMEOUT_SECS",
                    realtime_defaults.idle_timeout_secs,
                )?,
                outbound_buffer: parse_var(
                    "REALTIME_OUTBOUND_BUFFER",
                    realtime_defaults.outbound_buffer,
                )?,
            },
        })
    }
}

fn optional_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Parse an environment variable, falling back to `default` when unset.
fn parse_var<T: FromStr>(key: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} has an invalid value '{}'", key, raw)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backpressure_mode_parse() {
        assert_eq!(
            "fail-fast".parse::<BackpressureMode>().unwrap(),
            BackpressureMode::FailFast
        );
        assert_eq!(
            "block".parse::<BackpressureMode>().unwrap(),
            BackpressureMode::Block
        );
        assert!("sometimes".parse::<BackpressureMode>().is_err());
    }

    #[test]
    fn test_delivery_defaults() {
        let config = DeliveryConfig::default();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.backoff_cap_secs, 300);
        assert_eq!(config.backpressure_mode, BackpressureMode::FailFast);
    }

    #[test]
    fn test_parse_var_uses_default_when_unset() {
        let value: u32 = parse_var("COURIER_TEST_SURELY_UNSET_VARIABLE", 7).unwrap();
        assert_eq!(value, 7);
    }
}
