//! Application configuration module
//! Handles environment variable loading, configuration validation, and application settings

use crate::cache::CacheConfig;
use crate::payments::types::ProviderName;
use crate::services::payment_orchestrator::OrchestratorConfig;
use ipnet::IpNet;
use std::collections::HashMap;
use std::env;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    /// `None` runs on the in-memory ledger (development mode)
    pub database: Option<DatabaseConfig>,
    /// `None` keeps idempotency keys in process memory
    pub cache: Option<CacheConfig>,
    pub logging: LoggingConfig,
    pub orchestrator: OrchestratorConfig,
    pub reconciliation: ReconciliationConfig,
    pub webhook: WebhookConfig,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout: u64,   // seconds
    pub idle_timeout: Option<u64>, // seconds
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Plain,
}

/// Reconciliation worker timings
#[derive(Debug, Clone)]
pub struct ReconciliationConfig {
    pub interval_secs: u64,
    /// Non-terminal records untouched for this long get polled
    pub stale_after_secs: u64,
    /// Records still pending after this long are failed for review
    pub timeout_secs: u64,
    pub batch_size: usize,
    pub per_provider_concurrency: usize,
}

/// Inbound webhook checks
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub replay_window_secs: u64,
    /// Empty or missing entry allows every source address
    pub allowed_ips: HashMap<ProviderName, Vec<IpNet>>,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenv::dotenv().ok();

        Ok(AppConfig {
            server: ServerConfig::from_env()?,
            database: DatabaseConfig::from_env_optional()?,
            cache: CacheConfig::from_env(),
            logging: LoggingConfig::from_env()?,
            orchestrator: OrchestratorConfig::from_env(),
            reconciliation: ReconciliationConfig::from_env()?,
            webhook: WebhookConfig::from_env()?,
        })
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        if let Some(database) = &self.database {
            database.validate()?;
        }
        if let Some(cache) = &self.cache {
            if !cache.redis_url.starts_with("redis://") && !cache.redis_url.starts_with("rediss://")
            {
                return Err(ConfigError::InvalidValue(
                    "REDIS_URL must start with redis:// or rediss://".to_string(),
                ));
            }
        }
        self.logging.validate()?;
        validate_orchestrator(&self.orchestrator)?;
        self.reconciliation.validate()?;
        self.webhook.validate()?;

        Ok(())
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(ServerConfig {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("SERVER_PORT")
                .unwrap_or_else(|_| "8000".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("SERVER_PORT".to_string()))?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue(
                "SERVER_PORT cannot be 0".to_string(),
            ));
        }

        if self.host.is_empty() {
            return Err(ConfigError::InvalidValue(
                "SERVER_HOST cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(DatabaseConfig {
            url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::MissingVariable("DATABASE_URL".to_string()))?,
            max_connections: env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("DB_MAX_CONNECTIONS".to_string()))?,
            min_connections: env::var("DB_MIN_CONNECTIONS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("DB_MIN_CONNECTIONS".to_string()))?,
            connection_timeout: env::var("DB_CONNECTION_TIMEOUT")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("DB_CONNECTION_TIMEOUT".to_string()))?,
            idle_timeout: env::var("DB_IDLE_TIMEOUT")
                .ok()
                .and_then(|val| val.parse().ok()),
        })
    }

    /// `None` when `DATABASE_URL` is unset.
    pub fn from_env_optional() -> Result<Option<Self>, ConfigError> {
        match env::var("DATABASE_URL") {
            Ok(url) if !url.trim().is_empty() => Self::from_env().map(Some),
            _ => Ok(None),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::InvalidValue("DATABASE_URL".to_string()));
        }

        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue("DB_MAX_CONNECTIONS".to_string()));
        }

        if self.min_connections > self.max_connections {
            return Err(ConfigError::InvalidValue(
                "DB_MIN_CONNECTIONS must be <= DB_MAX_CONNECTIONS".to_string(),
            ));
        }

        Ok(())
    }
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(LoggingConfig {
            level: env::var("RUST_LOG")
                .or_else(|_| env::var("LOG_LEVEL"))
                .unwrap_or_else(|_| "info".to_string()),
            format: LogFormat::from_str(
                &env::var("LOG_FORMAT").unwrap_or_else(|_| "plain".to_string()),
            )?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.level.trim().is_empty() {
            return Err(ConfigError::InvalidValue("LOG_LEVEL".to_string()));
        }
        Ok(())
    }
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "plain" | "pretty" | "text" => Ok(LogFormat::Plain),
            other => Err(ConfigError::InvalidValue(format!("LOG_FORMAT={}", other))),
        }
    }
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            interval_secs: 180,
            stale_after_secs: 300,
            timeout_secs: 86400,
            batch_size: 200,
            per_provider_concurrency: 4,
        }
    }
}

impl ReconciliationConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(ReconciliationConfig {
            interval_secs: parse_or("RECONCILIATION_INTERVAL_SECS", defaults.interval_secs)?,
            stale_after_secs: parse_or(
                "RECONCILIATION_STALE_AFTER_SECS",
                defaults.stale_after_secs,
            )?,
            timeout_secs: parse_or("RECONCILIATION_TIMEOUT_SECS", defaults.timeout_secs)?,
            batch_size: parse_or("RECONCILIATION_BATCH_SIZE", defaults.batch_size)?,
            per_provider_concurrency: parse_or(
                "RECONCILIATION_PER_PROVIDER_CONCURRENCY",
                defaults.per_provider_concurrency,
            )?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "RECONCILIATION_INTERVAL_SECS".to_string(),
            ));
        }
        if self.timeout_secs <= self.stale_after_secs {
            return Err(ConfigError::ValidationFailed(
                "RECONCILIATION_TIMEOUT_SECS must exceed RECONCILIATION_STALE_AFTER_SECS"
                    .to_string(),
            ));
        }
        if self.batch_size == 0 || self.per_provider_concurrency == 0 {
            return Err(ConfigError::InvalidValue(
                "reconciliation batch size and concurrency must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_after_secs as i64)
    }

    pub fn timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.timeout_secs as i64)
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            replay_window_secs: 300,
            allowed_ips: HashMap::new(),
        }
    }
}

impl WebhookConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut allowed_ips = HashMap::new();
        for provider in ProviderName::ALL {
            let variable = format!("{}_WEBHOOK_ALLOWED_IPS", provider.env_prefix());
            if let Ok(raw) = env::var(&variable) {
                let nets = parse_allowlist(&raw)
                    .map_err(|entry| ConfigError::InvalidValue(format!("{}: {}", variable, entry)))?;
                if !nets.is_empty() {
                    allowed_ips.insert(provider, nets);
                }
            }
        }

        Ok(WebhookConfig {
            replay_window_secs: parse_or("WEBHOOK_REPLAY_WINDOW_SECS", 300)?,
            allowed_ips,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.replay_window_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "WEBHOOK_REPLAY_WINDOW_SECS".to_string(),
            ));
        }
        Ok(())
    }

    pub fn replay_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.replay_window_secs as i64)
    }

    /// An unknown peer address only passes when no allowlist is configured.
    pub fn is_ip_allowed(&self, provider: ProviderName, peer: Option<IpAddr>) -> bool {
        match self.allowed_ips.get(&provider) {
            None => true,
            Some(nets) if nets.is_empty() => true,
            Some(nets) => peer
                .map(|ip| nets.iter().any(|net| net.contains(&ip)))
                .unwrap_or(false),
        }
    }
}

/// Comma-separated IPs or CIDR blocks. Returns the first bad entry on error.
pub fn parse_allowlist(raw: &str) -> Result<Vec<IpNet>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry
                .parse::<IpNet>()
                .or_else(|_| entry.parse::<IpAddr>().map(IpNet::from))
                .map_err(|_| entry.to_string())
        })
        .collect()
}

fn validate_orchestrator(config: &OrchestratorConfig) -> Result<(), ConfigError> {
    if config.supported_currencies.is_empty() {
        return Err(ConfigError::InvalidValue("SUPPORTED_CURRENCIES".to_string()));
    }
    if config.max_retry_attempts == 0 {
        return Err(ConfigError::InvalidValue("MAX_RETRY_ATTEMPTS".to_string()));
    }
    if config.min_amount <= 0 {
        return Err(ConfigError::InvalidValue("MIN_AMOUNT".to_string()));
    }
    if let Some(max) = config.max_amount {
        if max < config.min_amount {
            return Err(ConfigError::ValidationFailed(
                "MAX_AMOUNT must be >= MIN_AMOUNT".to_string(),
            ));
        }
    }
    Ok(())
}

fn parse_or<T: FromStr>(variable: &str, default: T) -> Result<T, ConfigError> {
    match env::var(variable) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(variable.to_string())),
        Err(_) => Ok(default),
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),

    #[error("Invalid value for configuration: {0}")]
    InvalidValue(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_validation() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8000,
        };

        assert!(config.validate().is_ok());
        assert_eq!(config.bind_address(), "127.0.0.1:8000");
    }

    #[test]
    fn test_invalid_port_validation() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_host_validation() {
        let config = ServerConfig {
            host: "".to_string(),
            port: 8000,
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn allowlist_accepts_addresses_and_blocks() {
        let nets = parse_allowlist("203.0.113.7, 198.51.100.0/24").unwrap();
        assert_eq!(nets.len(), 2);
        assert!(parse_allowlist("not-an-ip").is_err());
        assert!(parse_allowlist("").unwrap().is_empty());
    }

    #[test]
    fn ip_allowlist_is_per_provider() {
        let mut config = WebhookConfig::default();
        config.allowed_ips.insert(
            ProviderName::KbzPay,
            parse_allowlist("198.51.100.0/24").unwrap(),
        );

        let inside: IpAddr = "198.51.100.20".parse().unwrap();
        let outside: IpAddr = "192.0.2.1".parse().unwrap();
        assert!(config.is_ip_allowed(ProviderName::KbzPay, Some(inside)));
        assert!(!config.is_ip_allowed(ProviderName::KbzPay, Some(outside)));
        assert!(!config.is_ip_allowed(ProviderName::KbzPay, None));
        assert!(config.is_ip_allowed(ProviderName::WavePay, Some(outside)));
    }

    #[test]
    fn reconciliation_timeout_must_exceed_staleness() {
        let mut config = ReconciliationConfig::default();
        assert!(config.validate().is_ok());
        config.timeout_secs = config.stale_after_secs;
        assert!(config.validate().is_err());
    }

    #[test]
    fn log_format_parsing() {
        assert_eq!(LogFormat::from_str("JSON").unwrap(), LogFormat::Json);
        assert_eq!(LogFormat::from_str("plain").unwrap(), LogFormat::Plain);
        assert!(LogFormat::from_str("xml").is_err());
    }
}
