//! Download manager configuration
//!
//! Tunables for a single chapter transfer: page fan-out, per-page retry
//! policy, timeouts and how often progress is published.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::app::models::DownloadQuality;
use crate::constants::downloads;
use crate::errors::{DownloadError, DownloadResult};

/// Configuration for the download manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Pages fetched concurrently within one chapter
    pub page_concurrency: usize,
    /// Fetch attempts per page before the page counts as failed
    pub max_page_attempts: u32,
    /// Base delay between page retries (exponential backoff)
    pub retry_base_delay: Duration,
    /// Maximum retry delay (backoff cap)
    pub retry_max_delay: Duration,
    /// Jitter percentage for retry delays
    pub retry_jitter: f64,
    /// Timeout for a single page fetch
    pub page_timeout: Duration,
    /// Minimum interval between progress events of one transfer
    pub progress_interval: Duration,
    /// Smoothing factor for the speed moving average
    pub speed_alpha: f64,
    /// Image quality requested from the source
    pub quality: DownloadQuality,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            page_concurrency: downloads::PAGE_CONCURRENCY,
            max_page_attempts: downloads::MAX_PAGE_ATTEMPTS,
            retry_base_delay: downloads::RETRY_BASE_DELAY,
            retry_max_delay: downloads::RETRY_MAX_DELAY,
            retry_jitter: downloads::RETRY_JITTER,
            page_timeout: downloads::PAGE_TIMEOUT,
            progress_interval: downloads::PROGRESS_EMIT_INTERVAL,
            speed_alpha: downloads::SPEED_EWMA_ALPHA,
            quality: DownloadQuality::default(),
        }
    }
}

impl ManagerConfig {
    pub fn with_page_concurrency(mut self, concurrency: usize) -> Self {
        self.page_concurrency = concurrency;
        self
    }

    pub fn with_max_page_attempts(mut self, attempts: u32) -> Self {
        self.max_page_attempts = attempts;
        self
    }

    /// Set the retry backoff range
    pub fn with_retry_delays(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base_delay = base;
        self.retry_max_delay = max;
        self
    }

    pub fn with_page_timeout(mut self, timeout: Duration) -> Self {
        self.page_timeout = timeout;
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn with_quality(mut self, quality: DownloadQuality) -> Self {
        self.quality = quality;
        self
    }

    /// Validate configuration values and return errors for invalid settings
    pub fn validate(&self) -> DownloadResult<()> {
        if self.page_concurrency == 0 {
            return Err(DownloadError::ConfigurationError(
                "Page concurrency cannot be zero".to_string(),
            ));
        }

        if self.max_page_attempts == 0 {
            return Err(DownloadError::ConfigurationError(
                "Page attempts must be at least one".to_string(),
            ));
        }

        if self.retry_base_delay > self.retry_max_delay {
            return Err(DownloadError::ConfigurationError(
                "Retry base delay must not exceed max delay".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.retry_jitter) {
            return Err(DownloadError::ConfigurationError(
                "Retry jitter must be between 0.0 and 1.0".to_string(),
            ));
        }

        if !(self.speed_alpha > 0.0 && self.speed_alpha <= 1.0) {
            return Err(DownloadError::ConfigurationError(
                "Speed smoothing factor must be in (0.0, 1.0]".to_string(),
            ));
        }

        if self.page_timeout.is_zero() {
            return Err(DownloadError::ConfigurationError(
                "Page timeout cannot be zero".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ManagerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(ManagerConfig::default()
            .with_page_concurrency(0)
            .validate()
            .is_err());
        assert!(ManagerConfig::default()
            .with_max_page_attempts(0)
            .validate()
            .is_err());
        assert!(ManagerConfig::default()
            .with_retry_delays(Duration::from_secs(10), Duration::from_secs(1))
            .validate()
            .is_err());

        let mut config = ManagerConfig::default();
        config.speed_alpha = 0.0;
        assert!(config.validate().is_err());
    }
}
