//! Download queue configuration

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::constants::queue;
use crate::errors::{QueueError, QueueResult};

/// Configuration for the download queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Transfers admitted at the same time (1..=5)
    pub max_concurrent: usize,
    /// Default priority for items enqueued without one
    pub default_priority: u32,
    /// Where the backlog is persisted; in-memory only when None
    pub backlog_path: Option<PathBuf>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: queue::DEFAULT_CONCURRENT,
            default_priority: queue::DEFAULT_PRIORITY,
            backlog_path: None,
        }
    }
}

impl QueueConfig {
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_backlog_path(mut self, path: PathBuf) -> Self {
        self.backlog_path = Some(path);
        self
    }

    /// Check that the concurrency limit is within the supported range
    pub fn validate(&self) -> QueueResult<()> {
        validate_concurrency(self.max_concurrent)
    }
}

pub(crate) fn validate_concurrency(value: usize) -> QueueResult<()> {
    if !(queue::MIN_CONCURRENT..=queue::MAX_CONCURRENT).contains(&value) {
        return Err(QueueError::InvalidConcurrency {
            value,
            min: queue::MIN_CONCURRENT,
            max: queue::MAX_CONCURRENT,
        });
    }
    Ok(())
}
