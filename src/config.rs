//! Configuration management for Chapter Fetcher
//!
//! This module provides unified configuration management with automatic
//! first-run initialization, multi-source loading, and zero-config defaults.
//!
//! Lookup order: an explicit `--config` path, `./chapter-fetcher.toml`, then
//! `<config dir>/chapter-fetcher/config.toml`. Environment variables
//! (`CHAPTER_FETCHER_STORAGE_ROOT`, `CHAPTER_FETCHER_SOURCE_URL`) override the
//! file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use humantime_serde::re::humantime::format_duration;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::app::client::ClientConfig;
use crate::app::manager::ManagerConfig;
use crate::app::models::DownloadQuality;
use crate::app::orchestrator::OrchestratorConfig;
use crate::app::queue::QueueConfig;
use crate::app::storage::StorageConfig;
use crate::constants::{config as files, downloads, env, http, queue, storage, tokens};
use crate::errors::{ConfigError, ConfigResult};

/// Unified application configuration for TOML serialization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Transfer settings
    pub downloads: DownloadsConfigToml,
    /// Local storage and quota
    pub storage: StorageConfigToml,
    /// Token derivation
    pub tokens: TokensConfigToml,
    /// Content source
    pub source: SourceConfigToml,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// TOML-friendly download settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadsConfigToml {
    /// Chapters downloaded at the same time (1-5)
    pub max_concurrent_downloads: usize,
    /// `original` or `compressed`
    pub quality: DownloadQuality,
    /// Pages fetched concurrently within one chapter
    pub page_concurrency: usize,
    /// Attempts per page
    pub max_page_attempts: u32,
    /// Timeout for one page in seconds
    pub page_timeout_secs: u64,
    /// Base retry delay in milliseconds
    pub retry_base_delay_ms: u64,
}

impl Default for DownloadsConfigToml {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: queue::DEFAULT_CONCURRENT,
            quality: DownloadQuality::Original,
            page_concurrency: downloads::PAGE_CONCURRENCY,
            max_page_attempts: downloads::MAX_PAGE_ATTEMPTS,
            page_timeout_secs: downloads::PAGE_TIMEOUT.as_secs(),
            retry_base_delay_ms: downloads::RETRY_BASE_DELAY.as_millis() as u64,
        }
    }
}

/// TOML-friendly storage settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfigToml {
    /// Storage directory (system data directory when unset)
    pub storage_root: Option<PathBuf>,
    /// Quota in bytes
    pub max_storage_size: u64,
    /// Usage percentage that triggers a warning
    pub storage_warning_threshold: u8,
    /// Reject writes above the quota instead of only warning
    pub enforce_hard_quota: bool,
    pub auto_cleanup_enabled: bool,
    /// One of 7, 14, 30, 60, 90
    pub auto_cleanup_days: u32,
}

impl Default for StorageConfigToml {
    fn default() -> Self {
        Self {
            storage_root: None,
            max_storage_size: storage::DEFAULT_MAX_STORAGE_SIZE,
            storage_warning_threshold: storage::DEFAULT_WARNING_THRESHOLD,
            enforce_hard_quota: false,
            auto_cleanup_enabled: false,
            auto_cleanup_days: storage::DEFAULT_AUTO_CLEANUP_DAYS,
        }
    }
}

/// TOML-friendly token settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokensConfigToml {
    /// Hard timeout of one derivation
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Retries after a failed derivation
    pub max_retries: u32,
    /// Lifetime of a cached token
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
    pub cache_capacity: usize,
    /// Identical polls before a token counts as stable
    pub stable_polls: u32,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for TokensConfigToml {
    fn default() -> Self {
        Self {
            timeout: tokens::DERIVATION_TIMEOUT,
            max_retries: tokens::MAX_RETRIES,
            cache_ttl: tokens::CACHE_TTL,
            cache_capacity: tokens::CACHE_CAPACITY,
            stable_polls: tokens::STABLE_POLLS,
            poll_interval: tokens::POLL_INTERVAL,
        }
    }
}

/// TOML-friendly source settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfigToml {
    /// Root of the chapter API
    pub base_url: String,
    /// Rate limit (requests per second)
    pub rate_limit_rps: u32,
    /// Request timeout in seconds
    pub request_timeout_secs: u64,
    /// Connect timeout in seconds
    pub connect_timeout_secs: u64,
}

impl Default for SourceConfigToml {
    fn default() -> Self {
        Self {
            base_url: http::DEFAULT_SOURCE_URL.to_string(),
            rate_limit_rps: http::DEFAULT_RATE_LIMIT_RPS,
            request_timeout_secs: http::DEFAULT_TIMEOUT.as_secs(),
            connect_timeout_secs: http::CONNECT_TIMEOUT.as_secs(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default log level for the application
    pub level: String,
    /// Enable colored output
    pub colored_output: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            colored_output: true,
        }
    }
}

impl AppConfig {
    /// Load configuration with multi-source precedence:
    /// 1. Default values
    /// 2. Config file (if exists)
    /// 3. Environment variables
    ///
    /// # Errors
    ///
    /// `ConfigError::NotFound` if an explicit path does not exist, parse
    /// errors for malformed files and `ConfigError::ValidationFailed` for
    /// out-of-range values.
    pub async fn load(config_file_override: Option<PathBuf>) -> ConfigResult<Self> {
        let mut config = Self::default();

        let config_path = match &config_file_override {
            Some(path) if !path.exists() => {
                return Err(ConfigError::NotFound { path: path.clone() });
            }
            Some(path) => Some(path.clone()),
            None => Self::find_config_file(),
        };

        if let Some(path) = config_path {
            debug!("Loading config from: {}", path.display());
            config = Self::load_from_file(&path).await?;
        }

        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Create the default config file on first run
    ///
    /// Returns the path of the file, or `None` if no config directory exists
    /// on this platform.
    pub async fn initialize_first_run() -> ConfigResult<Option<PathBuf>> {
        let Some(config_path) = Self::default_config_path() else {
            return Ok(None);
        };
        if config_path.exists() {
            return Ok(Some(config_path));
        }

        info!("Creating default configuration file...");
        if let Some(parent) = config_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ConfigError::InvalidValue {
                    field: "config directory".to_string(),
                    value: parent.display().to_string(),
                    reason: e.to_string(),
                })?;
        }
        tokio::fs::write(&config_path, Self::generate_default_config_content())
            .await
            .map_err(|e| ConfigError::InvalidValue {
                field: "config file".to_string(),
                value: config_path.display().to_string(),
                reason: e.to_string(),
            })?;

        println!("📁 Created default configuration file:");
        println!("   {}", config_path.display());
        println!("   You can customize settings by editing this file.");
        println!();

        Ok(Some(config_path))
    }

    /// Find configuration file in standard locations
    fn find_config_file() -> Option<PathBuf> {
        let mut search_paths = vec![PathBuf::from(format!("./{}", files::LOCAL_CONFIG_FILE))];
        search_paths.extend(Self::default_config_path());

        let found = search_paths.into_iter().find(|path| path.exists());
        match &found {
            Some(path) => debug!("Found config file: {}", path.display()),
            None => debug!("No config file found in standard locations"),
        }
        found
    }

    /// Per-user config file path
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(files::APP_DIR).join(files::CONFIG_FILE))
    }

    async fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|_| ConfigError::NotFound {
                path: path.to_path_buf(),
            })?;
        let config: AppConfig = toml::from_str(&content)?;
        info!("Loaded configuration from: {}", path.display());
        Ok(config)
    }

    /// Apply `CHAPTER_FETCHER_*` overrides read through `lookup`
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup(env::STORAGE_ROOT).filter(|v| !v.is_empty()) {
            debug!("Storage root overridden by {}", env::STORAGE_ROOT);
            self.storage.storage_root = Some(PathBuf::from(root));
        }
        if let Some(url) = lookup(env::SOURCE_URL).filter(|v| !v.is_empty()) {
            debug!("Source URL overridden by {}", env::SOURCE_URL);
            self.source.base_url = url;
        }
    }

    /// Check every value and report all problems at once
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();

        let concurrent = self.downloads.max_concurrent_downloads;
        if !(queue::MIN_CONCURRENT..=queue::MAX_CONCURRENT).contains(&concurrent) {
            errors.push(format!(
                "downloads.max_concurrent_downloads must be between {} and {}, got {}",
                queue::MIN_CONCURRENT,
                queue::MAX_CONCURRENT,
                concurrent
            ));
        }
        if self.downloads.page_concurrency == 0 {
            errors.push("downloads.page_concurrency must be greater than 0".to_string());
        }
        if self.downloads.max_page_attempts == 0 {
            errors.push("downloads.max_page_attempts must be greater than 0".to_string());
        }

        let threshold = self.storage.storage_warning_threshold;
        if !(1..=100).contains(&threshold) {
            errors.push(format!(
                "storage.storage_warning_threshold must be between 1 and 100, got {}",
                threshold
            ));
        }
        if !storage::AUTO_CLEANUP_DAYS.contains(&self.storage.auto_cleanup_days) {
            errors.push(format!(
                "storage.auto_cleanup_days must be one of {:?}, got {}",
                storage::AUTO_CLEANUP_DAYS,
                self.storage.auto_cleanup_days
            ));
        }

        if self.tokens.timeout.is_zero() {
            errors.push("tokens.timeout must be greater than 0".to_string());
        }
        if self.tokens.cache_capacity == 0 || self.tokens.cache_ttl.is_zero() {
            errors.push("tokens.cache_capacity and tokens.cache_ttl must be non-zero".to_string());
        }

        if self.source.rate_limit_rps == 0 {
            errors.push("source.rate_limit_rps must be greater than 0".to_string());
        }
        if url::Url::parse(&self.source.base_url).is_err() {
            errors.push(format!("source.base_url is not a URL: {}", self.source.base_url));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::ValidationFailed { errors })
        }
    }

    pub fn storage_config(&self) -> StorageConfig {
        StorageConfig {
            storage_root: self.storage.storage_root.clone(),
            max_storage_size: self.storage.max_storage_size,
            warning_threshold: self.storage.storage_warning_threshold,
            enforce_hard_quota: self.storage.enforce_hard_quota,
            auto_cleanup_enabled: self.storage.auto_cleanup_enabled,
            auto_cleanup_days: self.storage.auto_cleanup_days,
        }
    }

    /// Queue configuration with its backlog next to the stored chapters
    pub fn queue_config(&self, storage_root: &Path) -> QueueConfig {
        QueueConfig::default()
            .with_max_concurrent(self.downloads.max_concurrent_downloads)
            .with_backlog_path(storage_root.join(queue::BACKLOG_FILE))
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig::default()
            .with_page_concurrency(self.downloads.page_concurrency)
            .with_max_page_attempts(self.downloads.max_page_attempts)
            .with_page_timeout(Duration::from_secs(self.downloads.page_timeout_secs))
            .with_retry_delays(
                Duration::from_millis(self.downloads.retry_base_delay_ms),
                downloads::RETRY_MAX_DELAY,
            )
            .with_quality(self.downloads.quality)
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig::default()
            .with_max_token_retries(self.tokens.max_retries)
            .with_token_cache(self.tokens.cache_capacity, self.tokens.cache_ttl)
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            base_url: self.source.base_url.clone(),
            request_timeout: Duration::from_secs(self.source.request_timeout_secs),
            connect_timeout: Duration::from_secs(self.source.connect_timeout_secs),
            rate_limit_rps: self.source.rate_limit_rps,
            ..ClientConfig::default()
        }
    }

    /// Generate default configuration content with helpful comments
    pub fn generate_default_config_content() -> String {
        let default_storage_path = dirs::data_dir()
            .map(|dir| dir.join(files::APP_DIR))
            .unwrap_or_else(|| PathBuf::from("./chapters"));

        format!(
            r#"# Chapter Fetcher Configuration
# This file was automatically generated on first run.
# You can customize any of these settings to suit your needs.

[downloads]
# Chapters downloaded at the same time (1-5)
max_concurrent_downloads = {concurrent}
# Image quality: "original" or "compressed"
quality = "original"
page_concurrency = {pages}
max_page_attempts = {attempts}
page_timeout_secs = {page_timeout}
retry_base_delay_ms = {retry_delay}

[storage]
# Storage directory (leave unset to use {storage_path})
# storage_root = "/path/to/chapters"

# Quota in bytes; a warning is shown above the threshold (percent)
max_storage_size = {max_size}
storage_warning_threshold = {threshold}
# Reject downloads above the quota instead of only warning
enforce_hard_quota = false

# Delete chapters older than auto_cleanup_days (7, 14, 30, 60 or 90)
auto_cleanup_enabled = false
auto_cleanup_days = {cleanup_days}

[tokens]
timeout = "{token_timeout}"
max_retries = {token_retries}
cache_ttl = "{cache_ttl}"
cache_capacity = {cache_capacity}
stable_polls = {stable_polls}
poll_interval = "{poll_interval}"

[source]
base_url = "{base_url}"
rate_limit_rps = {rps}
request_timeout_secs = {request_timeout}
connect_timeout_secs = {connect_timeout}

[logging]
level = "info"  # error, warn, info, debug, trace
colored_output = true
"#,
            concurrent = queue::DEFAULT_CONCURRENT,
            pages = downloads::PAGE_CONCURRENCY,
            attempts = downloads::MAX_PAGE_ATTEMPTS,
            page_timeout = downloads::PAGE_TIMEOUT.as_secs(),
            retry_delay = downloads::RETRY_BASE_DELAY.as_millis(),
            storage_path = default_storage_path.display(),
            max_size = storage::DEFAULT_MAX_STORAGE_SIZE,
            threshold = storage::DEFAULT_WARNING_THRESHOLD,
            cleanup_days = storage::DEFAULT_AUTO_CLEANUP_DAYS,
            token_timeout = format_duration(tokens::DERIVATION_TIMEOUT),
            token_retries = tokens::MAX_RETRIES,
            cache_ttl = format_duration(tokens::CACHE_TTL),
            cache_capacity = tokens::CACHE_CAPACITY,
            stable_polls = tokens::STABLE_POLLS,
            poll_interval = format_duration(tokens::POLL_INTERVAL),
            base_url = http::DEFAULT_SOURCE_URL,
            rps = http::DEFAULT_RATE_LIMIT_RPS,
            request_timeout = http::DEFAULT_TIMEOUT.as_secs(),
            connect_timeout = http::CONNECT_TIMEOUT.as_secs(),
        )
    }
}
