//! Batch orchestrator configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{queue, tokens};
use crate::errors::{DownloadError, DownloadResult};

/// Configuration for batch sessions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Token retries after the first failed attempt of a chapter
    pub max_token_retries: u32,
    /// Maximum number of cached tokens
    pub token_cache_capacity: usize,
    /// How long a cached token stays usable
    pub token_cache_ttl: Duration,
    /// Queue priority of batch chapters
    pub chapter_priority: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_token_retries: tokens::MAX_RETRIES,
            token_cache_capacity: tokens::CACHE_CAPACITY,
            token_cache_ttl: tokens::CACHE_TTL,
            chapter_priority: queue::DEFAULT_PRIORITY,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_max_token_retries(mut self, retries: u32) -> Self {
        self.max_token_retries = retries;
        self
    }

    pub fn with_token_cache(mut self, capacity: usize, ttl: Duration) -> Self {
        self.token_cache_capacity = capacity;
        self.token_cache_ttl = ttl;
        self
    }

    /// Token attempts per chapter and run
    pub fn token_attempts(&self) -> u32 {
        1 + self.max_token_retries
    }

    pub fn validate(&self) -> DownloadResult<()> {
        if self.token_cache_capacity == 0 {
            return Err(DownloadError::ConfigurationError(
                "Token cache capacity must be greater than 0".to_string(),
            ));
        }
        if self.token_cache_ttl.is_zero() {
            return Err(DownloadError::ConfigurationError(
                "Token cache TTL must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
