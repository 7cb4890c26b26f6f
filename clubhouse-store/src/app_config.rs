use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub redis: Option<RedisConfig>,
    pub auth: AuthConfig,
    pub processor: ProcessorConfig,
    pub business_rules: BusinessRules,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    pub statements: StatementsConfig,
    #[serde(default)]
    pub payouts: PayoutsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BusinessRules {
    /// Flat fee charged to a partner on every cancellation, minor units.
    pub management_fee: i64,
    pub default_commission_bps: u32,
    #[serde(default = "default_reason_len")]
    pub cancellation_reason_min_len: usize,
    #[serde(default = "default_days_ahead")]
    pub reminder_days_ahead: u32,
}

fn default_reason_len() -> usize { 10 }
fn default_days_ahead() -> u32 { 3 }

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub jwt_expiration_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 { 5 }

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    pub url: String,
    #[serde(default = "default_rate_limit")]
    pub requests_per_minute: i64,
}

fn default_rate_limit() -> i64 { 120 }

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProcessorProvider {
    Mock,
    Stripe,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProcessorConfig {
    pub provider: ProcessorProvider,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_processor_url")]
    pub base_url: String,
    #[serde(default = "default_processor_timeout")]
    pub timeout_secs: u64,
    pub currency: String,
}

fn default_processor_url() -> String { "https://api.stripe.com".to_string() }
fn default_processor_timeout() -> u64 { 15 }

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            multiplier: 2.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub payout_interval_secs: u64,
    pub reminder_interval_secs: u64,
    pub reconciliation_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            payout_interval_secs: 86_400,
            reminder_interval_secs: 86_400,
            reconciliation_interval_secs: 900,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StatementsConfig {
    pub public_base_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PayoutsConfig {
    pub transfer_concurrency: usize,
    pub reconciliation_batch_size: i64,
}

impl Default for PayoutsConfig {
    fn default() -> Self {
        Self {
            transfer_concurrency: 4,
            reconciliation_batch_size: 50,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            // Per-environment overrides, optional
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Developer overrides, never checked in
            .add_source(config::File::with_name("config/local").required(false))
            // CLUBHOUSE__PROCESSOR__API_KEY=sk_live_... sets processor.api_key
            .add_source(config::Environment::with_prefix("CLUBHOUSE").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}
