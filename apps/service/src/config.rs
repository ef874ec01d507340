use std::env;
use std::net::SocketAddr;

use thiserror::Error;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";
const DEFAULT_LOG_FILTER: &str = "info";
const DEFAULT_LOG_FORMAT: &str = "text";
const DEFAULT_ENVIRONMENT: &str = "development";
const DEFAULT_RATE_LIMIT_MAX_REQUESTS: u32 = 100;
const DEFAULT_RATE_LIMIT_WINDOW_SECONDS: u64 = 60;
const DEFAULT_IDEMPOTENCY_TTL_SECONDS: u64 = 300;
const DEFAULT_PAYMENT_PROVIDER: &str = "mock";
const DEFAULT_PROVIDER_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_L402_TOKEN_TTL_SECONDS: u64 = 3_600;
const DEFAULT_INVOICE_TTL_SECONDS: u64 = 3_600;
const DEFAULT_RECONCILE_INTERVAL_SECONDS: u64 = 60;
const DEFAULT_RECONCILE_PENDING_AGE_SECONDS: u64 = 900;
const DEFAULT_RECONCILE_BATCH_LIMIT: u32 = 100;
const DEFAULT_ENTITLEMENT_SWEEP_INTERVAL_SECONDS: u64 = 60;
const DEFAULT_PAYOUT_INTERVAL_SECONDS: u64 = 300;
const DEFAULT_PAYOUT_MIN_BALANCE_SATS: i64 = 1_000;
const DEFAULT_PAYOUT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_PAYOUT_RETRY_BACKOFF_MS: u64 = 2_000;
const DEFAULT_WEBHOOK_INTERVAL_SECONDS: u64 = 5;
const DEFAULT_WEBHOOK_MAX_ATTEMPTS: u32 = 8;
const DEFAULT_WEBHOOK_BACKOFF_BASE_MS: u64 = 500;
const DEFAULT_WEBHOOK_BACKOFF_CAP_MS: u64 = 300_000;
const DEFAULT_WEBHOOK_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_REVENUE_PLATFORM_FEE_BPS: u32 = 1_000;
const DEFAULT_REVENUE_SETTLEMENT_WINDOW_SECONDS: u64 = 3_600;
const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 30;

/// Deployment environment. A mock payment provider is rejected in
/// `Production`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub log_filter: String,
    pub log_json: bool,
    pub environment: Environment,
    pub database_url: Option<String>,
    pub migrate_on_start: bool,
    pub rate_limit_max_requests: u32,
    pub rate_limit_window_seconds: u64,
    pub idempotency_ttl_seconds: u64,
    pub request_timeout_seconds: u64,
    pub payment_provider: String,
    pub provider_timeout_ms: u64,
    pub lnd_rest_url: Option<String>,
    pub lnd_macaroon_hex: Option<String>,
    pub payment_webhook_secret: Option<String>,
    pub l402_signing_key: String,
    pub l402_token_ttl_seconds: u64,
    pub invoice_ttl_seconds: u64,
    pub reconcile_enabled: bool,
    pub reconcile_interval_seconds: u64,
    pub reconcile_pending_age_seconds: u64,
    pub reconcile_batch_limit: u32,
    pub entitlement_sweep_enabled: bool,
    pub entitlement_sweep_interval_seconds: u64,
    pub payout_enabled: bool,
    pub payout_interval_seconds: u64,
    pub payout_min_balance_sats: i64,
    pub payout_max_attempts: u32,
    pub payout_retry_backoff_ms: u64,
    pub webhook_delivery_enabled: bool,
    pub webhook_interval_seconds: u64,
    pub webhook_max_attempts: u32,
    pub webhook_backoff_base_ms: u64,
    pub webhook_backoff_cap_ms: u64,
    pub webhook_timeout_ms: u64,
    pub revenue_platform_fee_bps: u32,
    pub revenue_settlement_window_seconds: u64,
    pub dev_bootstrap_enabled: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid WC_BIND_ADDR value '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("invalid WC_ENVIRONMENT value '{0}' (expected development or production)")]
    InvalidEnvironment(String),
    #[error("WC_L402_SIGNING_KEY must be set in production")]
    MissingSigningKey,
    #[error("payment provider 'mock' is not allowed in production")]
    MockProviderInProduction,
    #[error("invalid WC_REVENUE_PLATFORM_FEE_BPS value {0} (must be <= 10000)")]
    InvalidPlatformFeeBps(u32),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_addr_raw = string_var("WC_BIND_ADDR", DEFAULT_BIND_ADDR);
        let bind_addr = bind_addr_raw
            .parse()
            .map_err(|source| ConfigError::InvalidBindAddr {
                value: bind_addr_raw,
                source,
            })?;

        let environment = match string_var("WC_ENVIRONMENT", DEFAULT_ENVIRONMENT)
            .trim()
            .to_lowercase()
            .as_str()
        {
            "development" | "dev" => Environment::Development,
            "production" | "prod" => Environment::Production,
            other => return Err(ConfigError::InvalidEnvironment(other.to_string())),
        };

        let l402_signing_key = optional_var("WC_L402_SIGNING_KEY");
        let payment_provider = string_var("WC_PAYMENT_PROVIDER", DEFAULT_PAYMENT_PROVIDER)
            .trim()
            .to_lowercase();

        if environment == Environment::Production {
            if l402_signing_key.is_none() {
                return Err(ConfigError::MissingSigningKey);
            }
            if payment_provider == "mock" {
                return Err(ConfigError::MockProviderInProduction);
            }
        }

        let revenue_platform_fee_bps =
            u32_var("WC_REVENUE_PLATFORM_FEE_BPS", DEFAULT_REVENUE_PLATFORM_FEE_BPS);
        if revenue_platform_fee_bps > 10_000 {
            return Err(ConfigError::InvalidPlatformFeeBps(revenue_platform_fee_bps));
        }

        Ok(Self {
            bind_addr,
            log_filter: string_var("WC_LOG_FILTER", DEFAULT_LOG_FILTER),
            log_json: string_var("WC_LOG_FORMAT", DEFAULT_LOG_FORMAT)
                .trim()
                .eq_ignore_ascii_case("json"),
            environment,
            database_url: optional_var("WC_DATABASE_URL"),
            migrate_on_start: bool_var("WC_MIGRATE_ON_START", false),
            rate_limit_max_requests: u32_var(
                "WC_RATE_LIMIT_MAX_REQUESTS",
                DEFAULT_RATE_LIMIT_MAX_REQUESTS,
            ),
            rate_limit_window_seconds: u64_var(
                "WC_RATE_LIMIT_WINDOW_SECONDS",
                DEFAULT_RATE_LIMIT_WINDOW_SECONDS,
            ),
            idempotency_ttl_seconds: u64_var(
                "WC_IDEMPOTENCY_TTL_SECONDS",
                DEFAULT_IDEMPOTENCY_TTL_SECONDS,
            ),
            request_timeout_seconds: u64_var(
                "WC_REQUEST_TIMEOUT_SECONDS",
                DEFAULT_REQUEST_TIMEOUT_SECONDS,
            ),
            payment_provider,
            provider_timeout_ms: u64_var("WC_PROVIDER_TIMEOUT_MS", DEFAULT_PROVIDER_TIMEOUT_MS),
            lnd_rest_url: optional_var("WC_LND_REST_URL"),
            lnd_macaroon_hex: optional_var("WC_LND_MACAROON_HEX"),
            payment_webhook_secret: optional_var("WC_PAYMENT_WEBHOOK_SECRET"),
            l402_signing_key: l402_signing_key
                .unwrap_or_else(|| "wordclaw-dev-l402-signing-key".to_string()),
            l402_token_ttl_seconds: u64_var(
                "WC_L402_TOKEN_TTL_SECONDS",
                DEFAULT_L402_TOKEN_TTL_SECONDS,
            ),
            invoice_ttl_seconds: u64_var("WC_INVOICE_TTL_SECONDS", DEFAULT_INVOICE_TTL_SECONDS),
            reconcile_enabled: bool_var("WC_RECONCILE_ENABLED", true),
            reconcile_interval_seconds: u64_var(
                "WC_RECONCILE_INTERVAL_SECONDS",
                DEFAULT_RECONCILE_INTERVAL_SECONDS,
            ),
            reconcile_pending_age_seconds: u64_var(
                "WC_RECONCILE_PENDING_AGE_SECONDS",
                DEFAULT_RECONCILE_PENDING_AGE_SECONDS,
            ),
            reconcile_batch_limit: u32_var(
                "WC_RECONCILE_BATCH_LIMIT",
                DEFAULT_RECONCILE_BATCH_LIMIT,
            ),
            entitlement_sweep_enabled: bool_var("WC_ENTITLEMENT_SWEEP_ENABLED", true),
            entitlement_sweep_interval_seconds: u64_var(
                "WC_ENTITLEMENT_SWEEP_INTERVAL_SECONDS",
                DEFAULT_ENTITLEMENT_SWEEP_INTERVAL_SECONDS,
            ),
            payout_enabled: bool_var("WC_PAYOUT_ENABLED", true),
            payout_interval_seconds: u64_var(
                "WC_PAYOUT_INTERVAL_SECONDS",
                DEFAULT_PAYOUT_INTERVAL_SECONDS,
            ),
            payout_min_balance_sats: i64_var(
                "WC_PAYOUT_MIN_BALANCE_SATS",
                DEFAULT_PAYOUT_MIN_BALANCE_SATS,
            ),
            payout_max_attempts: u32_var("WC_PAYOUT_MAX_ATTEMPTS", DEFAULT_PAYOUT_MAX_ATTEMPTS),
            payout_retry_backoff_ms: u64_var(
                "WC_PAYOUT_RETRY_BACKOFF_MS",
                DEFAULT_PAYOUT_RETRY_BACKOFF_MS,
            ),
            webhook_delivery_enabled: bool_var("WC_WEBHOOK_DELIVERY_ENABLED", true),
            webhook_interval_seconds: u64_var(
                "WC_WEBHOOK_INTERVAL_SECONDS",
                DEFAULT_WEBHOOK_INTERVAL_SECONDS,
            ),
            webhook_max_attempts: u32_var("WC_WEBHOOK_MAX_ATTEMPTS", DEFAULT_WEBHOOK_MAX_ATTEMPTS),
            webhook_backoff_base_ms: u64_var(
                "WC_WEBHOOK_BACKOFF_BASE_MS",
                DEFAULT_WEBHOOK_BACKOFF_BASE_MS,
            ),
            webhook_backoff_cap_ms: u64_var(
                "WC_WEBHOOK_BACKOFF_CAP_MS",
                DEFAULT_WEBHOOK_BACKOFF_CAP_MS,
            ),
            webhook_timeout_ms: u64_var("WC_WEBHOOK_TIMEOUT_MS", DEFAULT_WEBHOOK_TIMEOUT_MS),
            revenue_platform_fee_bps,
            revenue_settlement_window_seconds: u64_var(
                "WC_REVENUE_SETTLEMENT_WINDOW_SECONDS",
                DEFAULT_REVENUE_SETTLEMENT_WINDOW_SECONDS,
            ),
            dev_bootstrap_enabled: bool_var("WC_DEV_BOOTSTRAP_ENABLED", true),
        })
    }

    /// Deterministic configuration for router-level tests: memory stores,
    /// mock provider, workers disabled, no settlement window.
    pub fn for_tests() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            log_filter: "debug".to_string(),
            log_json: false,
            environment: Environment::Development,
            database_url: None,
            migrate_on_start: false,
            rate_limit_max_requests: 1_000,
            rate_limit_window_seconds: 60,
            idempotency_ttl_seconds: 300,
            request_timeout_seconds: 30,
            payment_provider: "mock".to_string(),
            provider_timeout_ms: 1_000,
            lnd_rest_url: None,
            lnd_macaroon_hex: None,
            payment_webhook_secret: Some("webhook-test-secret".to_string()),
            l402_signing_key: "l402-test-signing-key".to_string(),
            l402_token_ttl_seconds: 3_600,
            invoice_ttl_seconds: 3_600,
            reconcile_enabled: false,
            reconcile_interval_seconds: 60,
            reconcile_pending_age_seconds: 900,
            reconcile_batch_limit: 100,
            entitlement_sweep_enabled: false,
            entitlement_sweep_interval_seconds: 60,
            payout_enabled: false,
            payout_interval_seconds: 300,
            payout_min_balance_sats: 1,
            payout_max_attempts: 3,
            payout_retry_backoff_ms: 1,
            webhook_delivery_enabled: false,
            webhook_interval_seconds: 1,
            webhook_max_attempts: 3,
            webhook_backoff_base_ms: 1,
            webhook_backoff_cap_ms: 10,
            webhook_timeout_ms: 1_000,
            revenue_platform_fee_bps: 1_000,
            revenue_settlement_window_seconds: 0,
            dev_bootstrap_enabled: false,
        }
    }
}

fn string_var(name: &str, default: &str) -> String {
    env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn optional_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn bool_var(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .map(|value| matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

fn u32_var(name: &str, default: u32) -> u32 {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

fn u64_var(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

fn i64_var(name: &str, default: i64) -> i64 {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}
