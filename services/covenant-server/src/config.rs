//! Server Configuration
//!
//! Layered configuration for the Covenant settlement service: `config/default`,
//! `config/local`, an optional explicit file, then `COVENANT__*` environment
//! variables (`__` separates nesting levels).

use std::net::SocketAddr;
use std::time::Duration;

use covenant_commission::CommissionConfig;
use covenant_escrow::EscrowConfig;
use covenant_fx::FxConfig;
use covenant_idempotency::IdempotencyConfig;
use covenant_reconciler::ReconcilerConfig;
use covenant_risk::RiskConfig;
use serde::{Deserialize, Serialize};

/// Service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Commission tier table
    #[serde(default)]
    pub commission: CommissionConfig,

    /// Base currency, buffer profiles and rate staleness
    #[serde(default)]
    pub fx: FxConfig,

    /// Fraud rules and score ceiling
    #[serde(default)]
    pub risk: RiskConfig,

    /// Escrow limits, proof tiers and dispute windows
    #[serde(default)]
    pub escrow: EscrowConfig,

    #[serde(default)]
    pub idempotency: IdempotencyConfig,

    /// Sweep worker
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
}

/// Server binding settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Grace period for in-flight requests on shutdown
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Run the sweep worker in this process
    #[serde(default = "default_true")]
    pub run_sweeper: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            run_sweeper: true,
        }
    }
}

impl ServerSettings {
    /// Socket address to bind to
    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        let addr = format!("{}:{}", self.host, self.port);
        addr.parse()
            .map_err(|e| anyhow::anyhow!("invalid bind address {addr}: {e}"))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or `EnvFilter` directive
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// =============================================================================
// Default Functions
// =============================================================================

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8420
}

fn default_request_timeout() -> u64 {
    30
}

fn default_shutdown_timeout() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_true() -> bool {
    true
}

// =============================================================================
// Configuration Loading
// =============================================================================

impl ServerConfig {
    /// Load configuration from files and the environment
    ///
    /// A malformed or invalid configuration is an error, never a fallback to
    /// defaults.
    pub fn load(config_path: Option<&str>) -> anyhow::Result<Self> {
        // Load .env file if present
        let _ = dotenvy::dotenv();

        let mut builder = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false));

        // An explicit file wins over the default locations
        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("COVENANT")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: ServerConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints the per-crate configs cannot see
    pub fn validate(&self) -> anyhow::Result<()> {
        self.server.socket_addr()?;
        covenant_commission::validate_tiers(&self.commission.tiers)?;
        covenant_risk::validate_rules(&self.risk.rules)?;
        self.escrow.validate()?;
        if self.reconciler.interval_secs == 0 {
            anyhow::bail!("reconciler.interval_secs must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.server.port, 8420);
        assert_eq!(config.logging.format, "pretty");
        assert_eq!(config.commission.tiers.len(), 4);
    }

    #[test]
    fn test_partial_file_keeps_section_defaults() {
        let raw = r#"
            [server]
            port = 9000

            [reconciler]
            interval_secs = 5
        "#;
        let config: ServerConfig = config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.reconciler.interval_secs, 5);
        assert_eq!(config.escrow.disputes.max_disputes_per_escrow, 2);
    }

    #[test]
    fn test_shipped_defaults_parse() {
        let raw = include_str!("../../../config/default.toml");
        let config: ServerConfig = config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        config.validate().unwrap();

        assert_eq!(config.commission.tiers.len(), 4);
        assert_eq!(config.risk.rules.len(), 4);
        assert_eq!(config.fx.buffer_for("volatile"), Some(rust_decimal::Decimal::new(5, 2)));
    }

    #[test]
    fn test_zero_sweep_interval_rejected() {
        let mut config = ServerConfig::default();
        config.reconciler.interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_bind_address_rejected() {
        let mut config = ServerConfig::default();
        config.server.host = "not an address".to_string();
        assert!(config.validate().is_err());
    }
}
