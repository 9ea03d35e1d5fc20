use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::core::infrastructure::caching::CacheConfig;
use crate::core::infrastructure::retry::RetryConfig;
use crate::core::observability::health_checks::HealthCheckConfig;
use crate::core::resources::connection_pools::PoolConfig;
use crate::core::resources::memory::MemoryConfig;
use crate::error::{AppError, Result};
use crate::utils::{get_env_or_default, parse_env_or};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "compact" => Ok(LogFormat::Compact),
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(AppError::ConfigError(format!("Unknown log format: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

/// Construction-time settings for every manager behind the façade.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub retry: RetryConfig,
    pub cache: CacheConfig,
    pub connection_pool: PoolConfig,
    pub memory: MemoryConfig,
    pub health: HealthCheckConfig,
    pub logging: LoggingConfig,
}

impl ResilienceConfig {
    /// Parse YAML; missing sections and fields take their defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: ResilienceConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `RESILIENCE_*` variables (a `.env` file is honoured).
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let mut config = ResilienceConfig::default();

        let retry = &mut config.retry;
        retry.max_attempts = parse_env_or("RESILIENCE_RETRY_MAX_ATTEMPTS", retry.max_attempts)?;
        retry.base_delay = env_millis("RESILIENCE_RETRY_BASE_DELAY_MS", retry.base_delay)?;
        retry.max_delay = env_millis("RESILIENCE_RETRY_MAX_DELAY_MS", retry.max_delay)?;
        retry.backoff_multiplier =
            parse_env_or("RESILIENCE_RETRY_BACKOFF_MULTIPLIER", retry.backoff_multiplier)?;
        retry.jitter = parse_env_or("RESILIENCE_RETRY_JITTER", retry.jitter)?;

        let cache = &mut config.cache;
        cache.default_ttl = env_millis("RESILIENCE_CACHE_DEFAULT_TTL_MS", cache.default_ttl)?;
        cache.max_cache_size = parse_env_or("RESILIENCE_CACHE_MAX_SIZE", cache.max_cache_size)?;
        cache.cleanup_interval =
            env_millis("RESILIENCE_CACHE_CLEANUP_INTERVAL_MS", cache.cleanup_interval)?;

        let pool = &mut config.connection_pool;
        pool.max_connections = parse_env_or("RESILIENCE_POOL_MAX_CONNECTIONS", pool.max_connections)?;
        pool.max_queue_size = parse_env_or("RESILIENCE_POOL_MAX_QUEUE_SIZE", pool.max_queue_size)?;
        pool.connection_timeout =
            env_millis("RESILIENCE_POOL_CONNECTION_TIMEOUT_MS", pool.connection_timeout)?;

        let memory = &mut config.memory;
        memory.max_file_size = parse_env_or("RESILIENCE_MEMORY_MAX_FILE_SIZE", memory.max_file_size)?;
        memory.max_total_memory =
            parse_env_or("RESILIENCE_MEMORY_MAX_TOTAL", memory.max_total_memory)?;
        memory.cleanup_threshold =
            parse_env_or("RESILIENCE_MEMORY_CLEANUP_THRESHOLD", memory.cleanup_threshold)?;

        let health = &mut config.health;
        health.check_interval =
            env_millis("RESILIENCE_HEALTH_CHECK_INTERVAL_MS", health.check_interval)?;
        health.default_timeout =
            env_millis("RESILIENCE_HEALTH_DEFAULT_TIMEOUT_MS", health.default_timeout)?;
        health.enable_scheduler =
            parse_env_or("RESILIENCE_HEALTH_ENABLE_SCHEDULER", health.enable_scheduler)?;

        config.logging.level = get_env_or_default("RESILIENCE_LOG_LEVEL", &config.logging.level);
        config.logging.format = parse_env_or("RESILIENCE_LOG_FORMAT", config.logging.format)?;

        config.validate()?;
        debug!("Loaded resilience configuration from environment");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(AppError::ConfigError(msg.to_string()));

        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1");
        }
        if self.retry.backoff_multiplier < 1.0 {
            return invalid("retry.backoff_multiplier must be >= 1.0");
        }
        if self.retry.base_delay > self.retry.max_delay {
            return invalid("retry.base_delay must not exceed retry.max_delay");
        }
        if self.cache.max_cache_size == 0 {
            return invalid("cache.max_cache_size must be at least 1");
        }
        if self.cache.cleanup_interval.is_zero() {
            return invalid("cache.cleanup_interval must be non-zero");
        }
        if self.connection_pool.max_connections == 0 {
            return invalid("connection_pool.max_connections must be at least 1");
        }
        if self.connection_pool.connection_timeout.is_zero() {
            return invalid("connection_pool.connection_timeout must be non-zero");
        }
        if self.memory.max_file_size > self.memory.max_total_memory {
            return invalid("memory.max_file_size must not exceed memory.max_total_memory");
        }
        if !(self.memory.cleanup_threshold > 0.0 && self.memory.cleanup_threshold <= 1.0) {
            return invalid("memory.cleanup_threshold must be within (0, 1]");
        }
        if self.memory.cleanup_interval.is_zero() {
            return invalid("memory.cleanup_interval must be non-zero");
        }
        if self.health.check_interval.is_zero() {
            return invalid("health.check_interval must be non-zero");
        }
        if self.health.default_timeout.is_zero() {
            return invalid("health.default_timeout must be non-zero");
        }
        Ok(())
    }
}

fn env_millis(key: &str, current: Duration) -> Result<Duration> {
    let millis = parse_env_or(key, current.as_millis() as u64)?;
    Ok(Duration::from_millis(millis))
}
