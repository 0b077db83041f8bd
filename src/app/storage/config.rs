//! Storage configuration types and defaults

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::constants::storage;

/// Configuration for the chapter storage service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for stored chapters (OS data dir if None)
    pub storage_root: Option<PathBuf>,
    /// Quota in bytes used for warnings and, optionally, enforcement
    pub max_storage_size: u64,
    /// Usage percentage at which a warning is raised
    pub warning_threshold: u8,
    /// Reject page writes that would take usage past the quota
    pub enforce_hard_quota: bool,
    /// Run the scheduled age-based cleanup
    pub auto_cleanup_enabled: bool,
    /// Age in days after which chapters are evicted by auto cleanup
    pub auto_cleanup_days: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_root: None,
            max_storage_size: storage::DEFAULT_MAX_STORAGE_SIZE,
            warning_threshold: storage::DEFAULT_WARNING_THRESHOLD,
            enforce_hard_quota: false,
            auto_cleanup_enabled: false,
            auto_cleanup_days: storage::DEFAULT_AUTO_CLEANUP_DAYS,
        }
    }
}

impl StorageConfig {
    /// Create a configuration rooted at `storage_root`
    pub fn with_storage_root(storage_root: PathBuf) -> Self {
        Self {
            storage_root: Some(storage_root),
            ..Default::default()
        }
    }

    pub fn with_max_storage_size(mut self, bytes: u64) -> Self {
        self.max_storage_size = bytes;
        self
    }

    pub fn with_warning_threshold(mut self, percent: u8) -> Self {
        self.warning_threshold = percent;
        self
    }

    pub fn with_hard_quota(mut self, enforce: bool) -> Self {
        self.enforce_hard_quota = enforce;
        self
    }

    pub fn with_auto_cleanup(mut self, enabled: bool, days: u32) -> Self {
        self.auto_cleanup_enabled = enabled;
        self.auto_cleanup_days = days;
        self
    }
}
