//! # Gateway Settings
//!
//! Process configuration read from the environment exactly once at startup
//! into an immutable value that is threaded through component constructors.
//! Nothing in the request path consults the environment.

use std::path::PathBuf;
use std::time::Duration;

/// Shared-store connection settings
#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
}

impl StoreSettings {
    /// Render a redis connection URL
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

/// Immutable gateway configuration resolved from the environment at startup
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// Listen port for the gateway server
    pub port: u16,

    /// Log level filter (feeds the tracing subscriber)
    pub log_level: String,

    /// Secret for verifying `Bearer` JWTs; unset means JWT auth always denies
    pub jwt_secret: Option<String>,

    /// Expected JWT issuer; validated when set
    pub jwt_issuer: Option<String>,

    /// API key for the `ApiKey` scheme; unset means API-key auth always denies
    pub api_key: Option<String>,

    /// Shared store connection
    pub store: StoreSettings,

    /// Breaker defaults for routes that enable a breaker without tuning it
    pub default_failure_threshold: u32,
    pub default_reset_timeout_ms: u64,

    /// Rate-limit defaults
    pub default_rate_limit: u64,
    pub default_rate_window_secs: u64,

    /// IP filtering lists (comma-separated in the environment)
    pub ip_blacklist: Vec<String>,
    pub ip_whitelist: Vec<String>,

    /// Directory holding routes.json
    pub config_dir: PathBuf,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            port: 8080,
            log_level: "info".to_string(),
            jwt_secret: None,
            jwt_issuer: None,
            api_key: None,
            store: StoreSettings {
                host: "127.0.0.1".to_string(),
                port: 6379,
                password: None,
                db: 0,
            },
            default_failure_threshold: 5,
            default_reset_timeout_ms: 30_000,
            default_rate_limit: 100,
            default_rate_window_secs: 60,
            ip_blacklist: Vec::new(),
            ip_whitelist: Vec::new(),
            config_dir: PathBuf::from("config"),
        }
    }
}

impl GatewaySettings {
    /// Load settings from the process environment, falling back to defaults
    /// for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env_parse("PORT", defaults.port),
            log_level: env_string("LOG_LEVEL").unwrap_or(defaults.log_level),
            jwt_secret: env_string("JWT_SECRET"),
            jwt_issuer: env_string("JWT_ISSUER"),
            api_key: env_string("API_KEY"),
            store: StoreSettings {
                host: env_string("REDIS_HOST").unwrap_or(defaults.store.host),
                port: env_parse("REDIS_PORT", defaults.store.port),
                password: env_string("REDIS_PASSWORD"),
                db: env_parse("REDIS_DB", defaults.store.db),
            },
            default_failure_threshold: env_parse(
                "DEFAULT_FAILURE_THRESHOLD",
                defaults.default_failure_threshold,
            ),
            default_reset_timeout_ms: env_parse(
                "DEFAULT_RESET_TIMEOUT",
                defaults.default_reset_timeout_ms,
            ),
            default_rate_limit: env_parse("DEFAULT_RATE_LIMIT", defaults.default_rate_limit),
            default_rate_window_secs: env_parse(
                "DEFAULT_RATE_WINDOW",
                defaults.default_rate_window_secs,
            ),
            ip_blacklist: env_list("IP_BLACKLIST"),
            ip_whitelist: env_list("IP_WHITELIST"),
            config_dir: env_string("CONFIG_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.config_dir),
        }
    }

    /// Default rate-limit window as a Duration
    pub fn default_rate_window(&self) -> Duration {
        Duration::from_secs(self.default_rate_window_secs)
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env_string(name)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_list(name: &str) -> Vec<String> {
    env_string(name)
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}
