//! Data models for chapters, work items and page assets
//!
//! These types are shared by the queue, the download manager, storage and the
//! orchestrator. Everything that is persisted derives serde traits.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::app::hash::Md5Hash;
use crate::constants::{queue, storage};

/// Identity of one chapter: `(contentId, chapterNumber)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChapterKey {
    pub content_id: String,
    pub chapter: String,
}

impl ChapterKey {
    pub fn new(content_id: impl Into<String>, chapter: impl Into<String>) -> Self {
        Self {
            content_id: content_id.into(),
            chapter: chapter.into(),
        }
    }

    /// Work item id derived from the key
    pub fn work_id(&self) -> String {
        format!("{}::{}", self.content_id, self.chapter)
    }

    /// Case-insensitive identity used for token caching
    pub fn normalized(&self) -> String {
        format!(
            "{}::{}",
            self.content_id.trim().to_lowercase(),
            self.chapter.trim().to_lowercase()
        )
    }
}

impl fmt::Display for ChapterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} #{}", self.content_id, self.chapter)
    }
}

/// Numeric value of a chapter label, ignoring non-numeric suffixes
///
/// `"12"` -> 12.0, `"12.5"` -> 12.5, `"12a"` -> 12.0, `"extra"` -> None.
pub fn chapter_value(label: &str) -> Option<f64> {
    let trimmed = label.trim();
    let mut end = 0;
    let mut seen_dot = false;
    for (i, c) in trimmed.char_indices() {
        if c.is_ascii_digit() {
            end = i + 1;
        } else if c == '.' && !seen_dot && end == i && i > 0 {
            seen_dot = true;
        } else {
            break;
        }
    }
    if end == 0 {
        return None;
    }
    trimmed[..end].parse::<f64>().ok()
}

/// Ascending chapter order; labels without a numeric value sort last
pub fn compare_chapters(a: &str, b: &str) -> Ordering {
    match (chapter_value(a), chapter_value(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal).then_with(|| a.cmp(b)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

/// Image quality requested from the source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadQuality {
    #[default]
    Original,
    Compressed,
}

impl fmt::Display for DownloadQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadQuality::Original => write!(f, "original"),
            DownloadQuality::Compressed => write!(f, "compressed"),
        }
    }
}

/// Queue entry describing one chapter transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub content_id: String,
    pub title: String,
    pub chapter: String,
    pub source_url: String,
    /// Lower runs sooner
    pub priority: u32,
    pub added_at: DateTime<Utc>,
    /// Authorization value obtained by the orchestrator, if the source needs one
    #[serde(default)]
    pub access_token: Option<String>,
}

impl WorkItem {
    pub fn new(
        content_id: impl Into<String>,
        title: impl Into<String>,
        chapter: impl Into<String>,
        source_url: impl Into<String>,
    ) -> Self {
        let key = ChapterKey::new(content_id, chapter);
        Self {
            id: key.work_id(),
            content_id: key.content_id,
            title: title.into(),
            chapter: key.chapter,
            source_url: source_url.into(),
            priority: queue::DEFAULT_PRIORITY,
            added_at: Utc::now(),
            access_token: None,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.access_token = token;
        self
    }

    pub fn key(&self) -> ChapterKey {
        ChapterKey::new(self.content_id.clone(), self.chapter.clone())
    }
}

/// Lifecycle of a work item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Queued,
    Downloading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadStatus {
    /// `Completed` and `Cancelled` never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadStatus::Completed | DownloadStatus::Cancelled)
    }

    /// Statuses that block a second enqueue of the same id
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Queued | DownloadStatus::Downloading | DownloadStatus::Paused
        )
    }

    /// Whether the lifecycle permits moving from `self` to `next`
    pub fn can_transition_to(&self, next: DownloadStatus) -> bool {
        use DownloadStatus::*;
        match (self, next) {
            (Queued, Downloading) | (Queued, Cancelled) => true,
            (Downloading, Completed)
            | (Downloading, Failed)
            | (Downloading, Cancelled)
            | (Downloading, Paused) => true,
            // resume goes back through admission
            (Paused, Queued) | (Paused, Cancelled) => true,
            (Failed, Queued) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Queued => "queued",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Paused => "paused",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Failed => "failed",
            DownloadStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of one active transfer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub total_pages: usize,
    pub completed_pages: usize,
    pub failed_pages: usize,
    /// `completed_pages / total_pages * 100`, rounded down
    pub percent: u8,
    pub bytes_total: u64,
    pub bytes_downloaded: u64,
    pub speed_bytes_per_sec: f64,
    pub eta_seconds: Option<u64>,
}

impl Progress {
    pub fn new(total_pages: usize) -> Self {
        Self {
            total_pages,
            ..Default::default()
        }
    }

    /// Recompute `percent` from page counts
    pub fn update_percent(&mut self) {
        self.percent = percent_of(self.completed_pages, self.total_pages);
    }

    pub fn is_complete(&self) -> bool {
        self.total_pages > 0 && self.completed_pages == self.total_pages
    }
}

/// Integer percentage rounded down; an empty total counts as 0%
pub fn percent_of(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    ((done.min(total) * 100) / total) as u8
}

/// State of one page inside a chapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
}

/// One page image of a chapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageAsset {
    /// 1-based, order-significant
    pub page_number: u32,
    pub source_url: String,
    pub local_path: Option<String>,
    pub status: PageStatus,
    pub size_bytes: u64,
    /// Content address of the stored bytes
    #[serde(default)]
    pub content_hash: Option<Md5Hash>,
}

impl PageAsset {
    pub fn pending(page_number: u32, source_url: impl Into<String>) -> Self {
        Self {
            page_number,
            source_url: source_url.into(),
            local_path: None,
            status: PageStatus::Pending,
            size_bytes: 0,
            content_hash: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == PageStatus::Completed
    }
}

/// Raw page bytes handed to storage
#[derive(Debug, Clone)]
pub struct PageImage {
    pub page_number: u32,
    pub source_url: String,
    pub bytes: Vec<u8>,
}

/// Storage metadata for one fully downloaded chapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterRecord {
    pub content_id: String,
    pub chapter: String,
    pub title: Option<String>,
    pub downloaded_at: DateTime<Utc>,
    pub page_count: usize,
    pub total_size_bytes: u64,
    pub format_version: u32,
    pub integrity_score: Option<u8>,
    pub last_validated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub validation_errors: Vec<String>,
    pub pages: Vec<PageAsset>,
}

impl ChapterRecord {
    pub fn new(key: &ChapterKey, title: Option<String>, pages: Vec<PageAsset>) -> Self {
        let total_size_bytes = pages.iter().map(|p| p.size_bytes).sum();
        Self {
            content_id: key.content_id.clone(),
            chapter: key.chapter.clone(),
            title,
            downloaded_at: Utc::now(),
            page_count: pages.len(),
            total_size_bytes,
            format_version: storage::FORMAT_VERSION,
            integrity_score: None,
            last_validated_at: None,
            validation_errors: Vec::new(),
            pages,
        }
    }

    pub fn key(&self) -> ChapterKey {
        ChapterKey::new(self.content_id.clone(), self.chapter.clone())
    }

    pub fn all_pages_completed(&self) -> bool {
        !self.pages.is_empty() && self.pages.iter().all(PageAsset::is_completed)
    }

    /// Recompute the size total after a page changed
    pub fn refresh_totals(&mut self) {
        self.page_count = self.pages.len();
        self.total_size_bytes = self.pages.iter().map(|p| p.size_bytes).sum();
    }
}
