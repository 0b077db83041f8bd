//! Storage statistics and quota classification
//!
//! Everything here is derived from the record set on demand; nothing is
//! persisted.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::app::models::{ChapterKey, ChapterRecord};

/// Aggregate view over all stored chapters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageStats {
    pub total_size_bytes: u64,
    pub chapter_count: usize,
    pub distinct_content_count: usize,
    /// `max_storage_size - total_size_bytes`, floored at zero
    pub available_space_bytes: u64,
    pub oldest_download_at: Option<DateTime<Utc>>,
    pub max_storage_size: u64,
    pub warning_threshold: u8,
}

impl StorageStats {
    /// Compute stats from a set of records and the configured quota
    pub fn from_records<'a, I>(records: I, max_storage_size: u64, warning_threshold: u8) -> Self
    where
        I: IntoIterator<Item = &'a ChapterRecord>,
    {
        let mut total_size_bytes = 0u64;
        let mut chapter_count = 0usize;
        let mut contents = HashSet::new();
        let mut oldest_download_at: Option<DateTime<Utc>> = None;

        for record in records {
            total_size_bytes = total_size_bytes.saturating_add(record.total_size_bytes);
            chapter_count += 1;
            contents.insert(record.content_id.as_str());
            oldest_download_at = Some(match oldest_download_at {
                Some(current) => current.min(record.downloaded_at),
                None => record.downloaded_at,
            });
        }

        Self {
            total_size_bytes,
            chapter_count,
            distinct_content_count: contents.len(),
            available_space_bytes: max_storage_size.saturating_sub(total_size_bytes),
            oldest_download_at,
            max_storage_size,
            warning_threshold,
        }
    }

    /// `total / max * 100`; zero when no quota is configured
    pub fn usage_percentage(&self) -> f64 {
        if self.max_storage_size == 0 {
            return 0.0;
        }
        self.total_size_bytes as f64 * 100.0 / self.max_storage_size as f64
    }

    /// Quota level derived from the stats alone
    pub fn quota_status(&self) -> QuotaStatus {
        let percent = self.usage_percentage();
        if self.max_storage_size > 0 && self.total_size_bytes >= self.max_storage_size {
            QuotaStatus::Exceeded { percent }
        } else if percent >= self.warning_threshold as f64 {
            QuotaStatus::Warning { percent }
        } else {
            QuotaStatus::Ok { percent }
        }
    }

    pub fn format_total_size(&self) -> String {
        format_bytes(self.total_size_bytes)
    }

    pub fn format_available_space(&self) -> String {
        format_bytes(self.available_space_bytes)
    }
}

/// Quota classification
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QuotaStatus {
    Ok { percent: f64 },
    /// At or above the warning threshold
    Warning { percent: f64 },
    /// At or above the quota
    Exceeded { percent: f64 },
}

impl QuotaStatus {
    pub fn is_warning(&self) -> bool {
        !matches!(self, QuotaStatus::Ok { .. })
    }

    pub fn percent(&self) -> f64 {
        match *self {
            QuotaStatus::Ok { percent }
            | QuotaStatus::Warning { percent }
            | QuotaStatus::Exceeded { percent } => percent,
        }
    }
}

impl fmt::Display for QuotaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaStatus::Ok { percent } => write!(f, "ok ({:.1}% used)", percent),
            QuotaStatus::Warning { percent } => {
                write!(f, "warning: storage {:.1}% full", percent)
            }
            QuotaStatus::Exceeded { percent } => {
                write!(f, "storage limit exceeded ({:.1}% used)", percent)
            }
        }
    }
}

/// Outcome of an age-based cleanup
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanupResult {
    /// Deleted chapters, oldest first
    pub deleted_chapters: Vec<ChapterKey>,
    /// Sum of `total_size_bytes` of the deleted records
    pub freed_space_bytes: u64,
    /// Stopped early on request
    pub interrupted: bool,
}

/// Format bytes in human-readable format
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    const THRESHOLD: f64 = 1024.0;

    let mut size = bytes as f64;
    let mut unit_index = 0;
    while size >= THRESHOLD && unit_index < UNITS.len() - 1 {
        size /= THRESHOLD;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}
