//! Application configuration management

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::error_handling::RetryPolicy;
use crate::core::fetcher::FetcherConfig;

/// Main application configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Engine settings, handed to `SyncCoordinator::new`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    pub max_concurrent_fetches: usize,
    /// Total transfer attempts per item per pass
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub commit_retry_attempts: u32,
    pub fetch_timeout_seconds: u64,
    pub progress_interval_ms: u64,
    pub progress_byte_delta: u64,
    pub cache_root: PathBuf,
    pub user_agent: String,
}

/// Where the catalog comes from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CatalogConfig {
    pub url: Option<String>,
    pub file: Option<PathBuf>,
    pub poll_interval_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String, // "error", "warn", "info", "debug", "trace"
}

impl Default for SyncConfig {
    fn default() -> Self {
        let cache_root = AppConfig::get_data_dir()
            .map(|dir| dir.join("cache"))
            .unwrap_or_else(|_| std::env::temp_dir().join("lobby-sync").join("cache"));

        Self {
            max_concurrent_fetches: 3,
            retry_attempts: 3,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 30_000,
            commit_retry_attempts: 3,
            fetch_timeout_seconds: 300,
            progress_interval_ms: 250,
            progress_byte_delta: 256 * 1024,
            cache_root,
            user_agent: format!("lobby-sync/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            url: None,
            file: None,
            poll_interval_seconds: 300,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            sync: SyncConfig::default(),
            catalog: CatalogConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Settings for tests: cache under `root`, no retry delays
    pub fn for_cache_root(root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: root.into(),
            retry_base_delay_ms: 0,
            retry_max_delay_ms: 0,
            ..Default::default()
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts.max(1),
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            ..Default::default()
        }
    }

    pub fn fetcher_config(&self) -> FetcherConfig {
        FetcherConfig {
            fetch_timeout: Duration::from_secs(self.fetch_timeout_seconds),
            progress_interval: Duration::from_millis(self.progress_interval_ms),
            progress_byte_delta: self.progress_byte_delta,
        }
    }
}

impl CatalogConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }
}

impl AppConfig {
    /// Load configuration from file, creating default if not exists
    pub fn load() -> Result<Self> {
        let config_path = Self::get_config_path()?;

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Self::default();
            config.save_to(&config_path)?;
            tracing::info!("Created default configuration at: {:?}", config_path);
            Ok(config)
        }
    }

    /// Load and validate a configuration file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: AppConfig =
            serde_json::from_str(&content).with_context(|| "Failed to parse config file")?;

        config
            .validate()
            .with_context(|| format!("Invalid configuration in {:?}", path))?;

        tracing::info!("Loaded configuration from: {:?}", path);
        Ok(config)
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::get_config_path()?)
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = self.export()?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        tracing::info!("Saved configuration to: {:?}", config_path);
        Ok(())
    }

    /// Get the path to the configuration file
    pub fn get_config_path() -> Result<PathBuf> {
        let project_dirs = ProjectDirs::from("com", "lobby", "sync")
            .with_context(|| "Failed to get project directories")?;

        Ok(project_dirs.config_dir().join("config.json"))
    }

    /// Get the application data directory
    pub fn get_data_dir() -> Result<PathBuf> {
        let project_dirs = ProjectDirs::from("com", "lobby", "sync")
            .with_context(|| "Failed to get project directories")?;

        Ok(project_dirs.data_dir().to_path_buf())
    }

    /// Export configuration as JSON string
    pub fn export(&self) -> Result<String> {
        serde_json::to_string_pretty(self).with_context(|| "Failed to export configuration")
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let sync = &self.sync;

        if !(1..=32).contains(&sync.max_concurrent_fetches) {
            anyhow::bail!("Concurrent fetches should be between 1 and 32");
        }

        if !(1..=10).contains(&sync.retry_attempts) {
            anyhow::bail!("Retry attempts should be between 1 and 10");
        }

        if sync.commit_retry_attempts == 0 || sync.commit_retry_attempts > 10 {
            anyhow::bail!("Commit retry attempts should be between 1 and 10");
        }

        if sync.retry_base_delay_ms > sync.retry_max_delay_ms {
            anyhow::bail!("Retry base delay must not exceed the maximum delay");
        }

        if sync.fetch_timeout_seconds == 0 || sync.fetch_timeout_seconds > 3600 {
            anyhow::bail!("Fetch timeout should be between 1 and 3600 seconds");
        }

        if sync.user_agent.trim().is_empty() {
            anyhow::bail!("User agent must not be empty");
        }

        if self.catalog.url.is_some() && self.catalog.file.is_some() {
            anyhow::bail!("Configure either a catalog url or a catalog file, not both");
        }

        if let Some(ref url) = self.catalog.url {
            url::Url::parse(url).with_context(|| format!("Invalid catalog url: {}", url))?;
        }

        if self.catalog.poll_interval_seconds < 10 {
            anyhow::bail!("Catalog poll interval should be at least 10 seconds");
        }

        if !["error", "warn", "info", "debug", "trace"].contains(&self.logging.level.as_str()) {
            anyhow::bail!(
                "Invalid log level: must be 'error', 'warn', 'info', 'debug', or 'trace'"
            );
        }

        Ok(())
    }
}
