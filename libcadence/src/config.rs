//! Configuration management for Cadence

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::content::Tone;
use crate::error::{ConfigError, Result};
use crate::types::Platform;

pub const CONFIG_ENV: &str = "CADENCE_CONFIG";
pub const DB_PATH_ENV: &str = "CADENCE_DB_PATH";

/// Upper bound on the folder-watch publishing delay (one week).
const MAX_WATCH_DELAY_SECS: u64 = 168 * 3600;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub automation: AutomationConfig,
    #[serde(default)]
    pub content: ContentConfig,
    pub watch: Option<WatchConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "~/.local/share/cadence/cadence.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between scheduler ticks
    pub poll_interval_secs: u64,
    /// Maximum number of jobs executing at once
    pub pool_size: usize,
    /// Hard limit for a single driver call
    pub driver_timeout_secs: u64,
    /// Ceiling for a whole execution (authenticate, publish, teardown)
    pub execution_timeout_secs: u64,
    /// Added to the execution ceiling to form the account lease TTL
    pub lease_margin_secs: u64,
    /// How long shutdown waits for in-flight executions
    pub shutdown_grace_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            pool_size: 2,
            driver_timeout_secs: 120,
            execution_timeout_secs: 600,
            lease_margin_secs: 60,
            shutdown_grace_secs: 30,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn driver_timeout(&self) -> Duration {
        Duration::from_secs(self.driver_timeout_secs)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs + self.lease_margin_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_secs: u64,
    pub multiplier: f64,
    pub max_delay_secs: u64,
    pub challenge_cooldown_secs: u64,
    /// Unclassified failures get fewer attempts than transient ones
    pub unknown_max_attempts: u32,
    /// Cooldown applied to rate-limit errors that carry no retry hint,
    /// keyed by platform name
    pub rate_limit_cooldown_secs: HashMap<String, u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_secs: 60,
            multiplier: 2.0,
            max_delay_secs: 3600,
            challenge_cooldown_secs: 7200,
            unknown_max_attempts: 2,
            rate_limit_cooldown_secs: HashMap::new(),
        }
    }
}

impl RetryConfig {
    pub fn rate_limit_cooldown(&self, platform: Platform) -> Option<Duration> {
        self.rate_limit_cooldown_secs
            .get(platform.as_str())
            .map(|secs| Duration::from_secs(*secs))
    }
}

/// External browser-automation helper driven by the `CommandBackend`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomationConfig {
    pub command: Option<String>,
    pub args: Vec<String>,
    pub headless: bool,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            headless: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentConfig {
    /// Base URL of an OpenAI-compatible API
    pub endpoint: String,
    pub model: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout_secs: u64,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://openrouter.ai/api/v1".to_string(),
            model: "anthropic/claude-3.5-sonnet".to_string(),
            api_key_env: "OPENROUTER_API_KEY".to_string(),
            max_tokens: 2048,
            temperature: 0.7,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    pub path: String,
    pub account_id: i64,
    #[serde(default)]
    pub auto_generate: bool,
    #[serde(default = "default_watch_delay")]
    pub default_delay_secs: u64,
    #[serde(default = "default_watch_poll")]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub tone: Tone,
}

fn default_watch_delay() -> u64 {
    3600
}

fn default_watch_poll() -> u64 {
    30
}

impl WatchConfig {
    pub fn expanded_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).to_string())
    }

    pub fn default_delay(&self) -> Duration {
        Duration::from_secs(self.default_delay_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl Config {
    /// Load configuration from `CADENCE_CONFIG` or the default location.
    ///
    /// A missing file at the default location yields the default
    /// configuration; a missing file named explicitly is an error.
    pub fn load() -> Result<Self> {
        let explicit = std::env::var(CONFIG_ENV).is_ok();
        let config_path = resolve_config_path()?;

        let mut config = if !explicit && !config_path.exists() {
            tracing::debug!(
                "no config at {}, using defaults",
                config_path.display()
            );
            Self::default_config()
        } else {
            Self::load_from_path(&config_path)?
        };

        if let Ok(db_path) = std::env::var(DB_PATH_ENV) {
            config.database.path = db_path;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config = toml::from_str(&content).map_err(ConfigError::ParseError)?;
        Ok(config)
    }

    pub fn default_config() -> Self {
        Self::default()
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        fn invalid(field: &str, reason: &str) -> ConfigError {
            ConfigError::InvalidValue {
                field: field.to_string(),
                reason: reason.to_string(),
            }
        }

        if self.database.path.trim().is_empty() {
            return Err(ConfigError::MissingField("database.path".to_string()).into());
        }
        if self.scheduler.pool_size == 0 {
            return Err(invalid("scheduler.pool_size", "must be at least 1").into());
        }
        if self.scheduler.poll_interval_secs == 0 {
            return Err(invalid("scheduler.poll_interval_secs", "must be at least 1").into());
        }
        if self.scheduler.driver_timeout_secs == 0 {
            return Err(invalid("scheduler.driver_timeout_secs", "must be at least 1").into());
        }
        if self.scheduler.execution_timeout_secs < self.scheduler.driver_timeout_secs {
            return Err(invalid(
                "scheduler.execution_timeout_secs",
                "must not be shorter than driver_timeout_secs",
            )
            .into());
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1").into());
        }
        if self.retry.multiplier < 1.0 {
            return Err(invalid("retry.multiplier", "must be >= 1.0").into());
        }
        for name in self.retry.rate_limit_cooldown_secs.keys() {
            if name.parse::<Platform>().is_err() {
                return Err(invalid("retry.rate_limit_cooldown_secs", &format!(
                    "unknown platform '{}'",
                    name
                ))
                .into());
            }
        }
        if let Some(watch) = &self.watch {
            if watch.path.trim().is_empty() {
                return Err(ConfigError::MissingField("watch.path".to_string()).into());
            }
            if watch.default_delay_secs > MAX_WATCH_DELAY_SECS {
                return Err(invalid("watch.default_delay_secs", "must be at most one week").into());
            }
            if watch.poll_interval_secs == 0 {
                return Err(invalid("watch.poll_interval_secs", "must be at least 1").into());
            }
        }
        Ok(())
    }
}

/// Resolve the configuration file path using XDG base directories
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("cadence").join("config.toml"))
}
