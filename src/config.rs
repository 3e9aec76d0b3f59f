use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use tracing::info;
use validator::Validate;

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const CONFIG_DIR: &str = "config";

/// Cache configuration
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Backend to use: "in-memory" or "redis"
    #[serde(default = "default_cache_backend")]
    pub backend: String,

    /// Redis connection URL, used when backend = "redis"
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Default TTL for cached entries in seconds
    #[serde(default = "default_cache_ttl_secs")]
    pub default_ttl_secs: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: default_cache_backend(),
            redis_url: default_redis_url(),
            default_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

/// Pricing policy knobs. Fixed policy constants in the source deployment,
/// configurable per deployment here.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct PricingConfig {
    /// Orders at or above this subtotal ship free
    #[serde(default = "default_free_shipping_threshold")]
    pub free_shipping_threshold: f64,

    /// Flat charge below the free-shipping threshold
    #[serde(default = "default_base_shipping_charge")]
    pub base_shipping_charge: f64,

    /// Surcharge per whole kilogram above the included weight
    #[serde(default = "default_per_kg_surcharge")]
    pub per_kg_surcharge: f64,

    /// Weight covered by the base charge
    #[serde(default = "default_included_weight_kg")]
    pub included_weight_kg: f64,

    /// Tax rate applied to the subtotal
    #[validate(range(min = 0.0, max = 100.0))]
    #[serde(default = "default_tax_rate_percent")]
    pub tax_rate_percent: f64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            free_shipping_threshold: default_free_shipping_threshold(),
            base_shipping_charge: default_base_shipping_charge(),
            per_kg_surcharge: default_per_kg_surcharge(),
            included_weight_kg: default_included_weight_kg(),
            tax_rate_percent: default_tax_rate_percent(),
        }
    }
}

/// Order-engine behavior knobs
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct OrdersConfig {
    /// Days added to the ship date for the delivery estimate
    #[validate(range(min = 1, max = 60))]
    #[serde(default = "default_delivery_estimate_days")]
    pub delivery_estimate_days: i64,

    /// Random-suffix attempts before the generator falls back to a
    /// timestamp-derived order number
    #[validate(range(min = 1, max = 100))]
    #[serde(default = "default_order_number_attempts")]
    pub order_number_attempts: u32,
}

impl Default for OrdersConfig {
    fn default() -> Self {
        Self {
            delivery_estimate_days: default_delivery_estimate_days(),
            order_number_attempts: default_order_number_attempts(),
        }
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Application environment
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Cache configuration
    #[serde(default)]
    #[validate]
    pub cache: CacheConfig,

    /// Pricing policy
    #[serde(default)]
    #[validate]
    pub pricing: PricingConfig,

    /// Order-engine knobs
    #[serde(default)]
    #[validate]
    pub orders: OrdersConfig,
}

fn default_cache_backend() -> String {
    "in-memory".to_string()
}
fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}
fn default_cache_ttl_secs() -> Option<u64> {
    Some(300)
}
fn default_free_shipping_threshold() -> f64 {
    1000.0
}
fn default_base_shipping_charge() -> f64 {
    50.0
}
fn default_per_kg_surcharge() -> f64 {
    10.0
}
fn default_included_weight_kg() -> f64 {
    5.0
}
fn default_tax_rate_percent() -> f64 {
    10.0
}
fn default_delivery_estimate_days() -> i64 {
    5
}
fn default_order_number_attempts() -> u32 {
    10
}
fn default_environment() -> String {
    DEFAULT_ENV.to_string()
}
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
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

impl AppConfig {
    /// Loads configuration from `config/default`, `config/{APP_ENV}` and
    /// `APP__`-prefixed environment variables, later sources overriding
    /// earlier ones.
    pub fn load() -> Result<Self, ConfigError> {
        let run_env = env::var("APP_ENV").unwrap_or_else(|_| DEFAULT_ENV.to_string());

        let cfg: AppConfig = Config::builder()
            .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
            .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
            .add_source(Environment::with_prefix("APP").separator("__"))
            .build()?
            .try_deserialize()?;

        cfg.validate()
            .map_err(|e| ConfigError::Message(e.to_string()))?;

        info!(environment = %cfg.environment, "Configuration loaded");
        Ok(cfg)
    }

    /// Minimal configuration pointed at the given database, for embedding
    /// and tests.
    pub fn with_database_url(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            environment: default_environment(),
            log_level: default_log_level(),
            log_json: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            cache: CacheConfig::default(),
            pricing: PricingConfig::default(),
            orders: OrdersConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_storefront_policy() {
        let cfg = AppConfig::with_database_url("sqlite::memory:");
        assert_eq!(cfg.pricing.free_shipping_threshold, 1000.0);
        assert_eq!(cfg.pricing.base_shipping_charge, 50.0);
        assert_eq!(cfg.pricing.per_kg_surcharge, 10.0);
        assert_eq!(cfg.pricing.included_weight_kg, 5.0);
        assert_eq!(cfg.pricing.tax_rate_percent, 10.0);
        assert_eq!(cfg.orders.delivery_estimate_days, 5);
        assert_eq!(cfg.orders.order_number_attempts, 10);
    }

    #[test]
    fn tax_rate_out_of_range_fails_validation() {
        let mut cfg = AppConfig::with_database_url("sqlite::memory:");
        cfg.pricing.tax_rate_percent = 130.0;
        assert!(cfg.validate().is_err());
    }
}
