use config::{Config, ConfigError, Environment, File};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 3000;
const CONFIG_DIR: &str = "config";
const DEFAULT_TAX_RATE: f64 = 19.0;
const DEFAULT_CURRENCY: &str = "COP";
const DEFAULT_USD_TO_COP_RATE: u32 = 4000;
const DEFAULT_GATEWAY_BASE_URL: &str = "https://api-sandbox.co.uat.wompi.dev/v1";
const DEFAULT_GATEWAY_TIMEOUT_SECS: u64 = 10;

/// Which payment gateway implementation the service talks to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayMode {
    /// Signed HTTP integration with the external processor.
    #[default]
    Live,
    /// Local parity-based approval double. Never allowed in production.
    Simulated,
}

/// Payment processor settings
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// Processor REST API base URL (no trailing slash)
    #[serde(default = "default_gateway_base_url")]
    #[validate(length(min = 1))]
    pub base_url: String,

    /// Merchant public key, used for acceptance tokens, tokenization and charges
    #[serde(default)]
    pub public_key: String,

    /// Merchant private key, used for transaction status lookups
    #[serde(default)]
    pub private_key: String,

    /// Pre-shared secret for integrity signatures and webhook verification
    #[serde(default)]
    pub integrity_secret: String,

    /// Per-request timeout in seconds applied to every processor call
    #[serde(default = "default_gateway_timeout_secs")]
    #[validate(range(min = 1, max = 120))]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub mode: GatewayMode,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_gateway_base_url(),
            public_key: String::new(),
            private_key: String::new(),
            integrity_secret: String::new(),
            request_timeout_secs: default_gateway_timeout_secs(),
            mode: GatewayMode::default(),
        }
    }
}

impl GatewayConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn is_simulated(&self) -> bool {
        self.mode == GatewayMode::Simulated
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// CORS: comma-separated list of allowed origins
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB connect timeout (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,

    /// DB idle timeout (seconds)
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,

    /// DB acquire timeout (seconds)
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Tax rate applied when a checkout does not carry one (percentage)
    #[serde(default = "default_tax_rate")]
    #[validate(range(min = 0.0, max = 100.0))]
    pub default_tax_rate: f64,

    /// Currency used when a checkout does not specify one
    #[serde(default = "default_currency")]
    #[validate(length(equal = 3), custom = "validate_currency_code")]
    pub default_currency: String,

    /// Conversion rate applied when a USD checkout is charged in COP
    #[serde(default = "default_usd_to_cop_rate")]
    #[validate(range(min = 1))]
    pub usd_to_cop_rate: u32,

    /// Payment processor settings
    #[serde(default)]
    #[validate]
    pub gateway: GatewayConfig,
}

impl AppConfig {
    /// Creates a new AppConfig with required fields and defaults for the rest
    pub fn new(database_url: String, host: String, port: u16, environment: String) -> Self {
        Self {
            database_url,
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            cors_allowed_origins: None,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            default_tax_rate: default_tax_rate(),
            default_currency: default_currency(),
            usd_to_cop_rate: default_usd_to_cop_rate(),
            gateway: GatewayConfig::default(),
        }
    }

    /// Checks if running in production environment
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Checks if running in development environment
    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    /// Gets log level reference
    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    /// Default tax rate as an exact decimal percentage
    pub fn default_tax_rate(&self) -> Decimal {
        Decimal::from_f64(self.default_tax_rate)
            .map(|rate| rate.round_dp(2))
            .unwrap_or_else(|| Decimal::from(19))
    }

    /// Cross-field rules that the derive cannot express
    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if self.gateway.is_simulated() && self.is_production() {
            let mut err = ValidationError::new("simulated_gateway_in_production");
            err.message = Some(
                "The simulated payment gateway cannot be used in production. Set APP__GATEWAY__MODE=live."
                    .into(),
            );
            errors.add("gateway", err);
        }

        if !self.gateway.is_simulated() {
            let missing = [
                ("gateway_public_key", self.gateway.public_key.trim().is_empty()),
                ("gateway_private_key", self.gateway.private_key.trim().is_empty()),
                (
                    "gateway_integrity_secret",
                    self.gateway.integrity_secret.trim().is_empty(),
                ),
            ];
            for (field, is_missing) in missing {
                if is_missing {
                    let mut err = ValidationError::new("required");
                    err.message =
                        Some(format!("{} is required when the gateway runs in live mode", field).into());
                    errors.add(field, err);
                }
            }
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Default value functions
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_min_connections() -> u32 {
    1
}

fn default_db_connect_timeout_secs() -> u64 {
    30
}

fn default_db_idle_timeout_secs() -> u64 {
    600
}

fn default_db_acquire_timeout_secs() -> u64 {
    8
}

fn default_tax_rate() -> f64 {
    DEFAULT_TAX_RATE
}

fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}

fn default_usd_to_cop_rate() -> u32 {
    DEFAULT_USD_TO_COP_RATE
}

fn default_gateway_base_url() -> String {
    DEFAULT_GATEWAY_BASE_URL.to_string()
}

fn default_gateway_timeout_secs() -> u64 {
    DEFAULT_GATEWAY_TIMEOUT_SECS
}

fn validate_currency_code(code: &str) -> Result<(), ValidationError> {
    if code.chars().all(|c| c.is_ascii_uppercase()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("currency_code");
        err.message = Some("Currency must be an upper-case ISO 4217 code".into());
        Err(err)
    }
}

/// Installs the global tracing subscriber
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::fmt;

    let default_directive = format!("checkout_payments={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt().with_env_filter(filter_directive).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter_directive).try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables prefixed with APP__ (e.g. APP__GATEWAY__PUBLIC_KEY)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    // Gateway keys have no defaults; they must come from a config file or the environment.
    let config = Config::builder()
        .set_default("database_url", "sqlite://checkout.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT as i64)?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .set_default("gateway.base_url", DEFAULT_GATEWAY_BASE_URL)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!(
        gateway_mode = ?app_config.gateway.mode,
        "Configuration loaded successfully"
    );
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".into(),
            "127.0.0.1".into(),
            3000,
            "production".into(),
        );
        cfg.gateway.public_key = "pub_test_key".into();
        cfg.gateway.private_key = "prv_test_key".into();
        cfg.gateway.integrity_secret = "test_integrity_secret".into();
        cfg
    }

    #[test]
    fn live_gateway_with_keys_passes() {
        let cfg = base_config();
        assert!(cfg.validate().is_ok());
        assert!(cfg.validate_additional_constraints().is_ok());
    }

    #[test]
    fn live_gateway_requires_keys() {
        let mut cfg = base_config();
        cfg.gateway.integrity_secret = "  ".into();
        let errors = cfg
            .validate_additional_constraints()
            .expect_err("missing secret must be rejected");
        assert!(errors.errors().contains_key("gateway_integrity_secret"));
    }

    #[test]
    fn simulated_gateway_rejected_in_production() {
        let mut cfg = base_config();
        cfg.gateway.mode = GatewayMode::Simulated;
        assert!(cfg.validate_additional_constraints().is_err());
    }

    #[test]
    fn simulated_gateway_allowed_outside_production_without_keys() {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".into(),
            "127.0.0.1".into(),
            3000,
            "test".into(),
        );
        cfg.gateway.mode = GatewayMode::Simulated;
        assert!(cfg.validate_additional_constraints().is_ok());
    }

    #[test]
    fn tax_rate_out_of_range_fails_validation() {
        let mut cfg = base_config();
        cfg.default_tax_rate = 140.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn lower_case_currency_fails_validation() {
        let mut cfg = base_config();
        cfg.default_currency = "cop".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn default_tax_rate_is_exact_decimal() {
        let cfg = base_config();
        assert_eq!(cfg.default_tax_rate(), Decimal::from(19));
    }
}
