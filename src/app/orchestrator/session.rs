//! Batch session entity
//!
//! One session per content item. It owns the planned chapter list, the
//! per-chapter phase, token retry counts and the flags that drive the
//! session state machine:
//!
//! ```text
//! Idle --plan--> Preparing --first admission--> Downloading --all settled--> Idle
//!                    \___________________cancel_____________________________/
//! ```
//!
//! The public view is derived from the entity on every change and never
//! stored.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::app::classifier::ErrorType;
use crate::app::sources::ChapterListing;

use super::selection::ChapterSelection;

/// Session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Preparing,
    Downloading,
}

/// Where one planned chapter stands
#[derive(Debug, Clone, PartialEq)]
pub enum ChapterPhase {
    /// Waiting for the planner
    Planned,
    /// Token derivation in progress
    AwaitingToken,
    /// Handed to the download queue
    Queued,
    /// Transfer running, with its last reported percent
    Downloading(u8),
    /// Transfer paused; resumes through the queue
    Paused,
    Completed,
    Failed {
        message: String,
        error_type: ErrorType,
    },
    Cancelled,
}

impl ChapterPhase {
    /// No further events are expected for this chapter
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            ChapterPhase::Completed | ChapterPhase::Failed { .. } | ChapterPhase::Cancelled
        )
    }

    fn percent(&self) -> u8 {
        match self {
            ChapterPhase::Downloading(percent) => *percent,
            ChapterPhase::Completed | ChapterPhase::Failed { .. } | ChapterPhase::Cancelled => 100,
            _ => 0,
        }
    }
}

/// One planned chapter of a session
#[derive(Debug, Clone)]
pub struct SessionChapter {
    pub listing: ChapterListing,
    pub phase: ChapterPhase,
}

/// Orchestrator-owned state of one batch run
#[derive(Debug, Clone)]
pub struct BatchSession {
    pub session_id: String,
    pub content_id: String,
    pub title: String,
    pub selection: ChapterSelection,
    pub status: SessionStatus,
    /// Planned chapters in download order
    pub chapters: Vec<SessionChapter>,
    /// Chapter awaiting a token for this session, at most one
    pub active_token_request: Option<String>,
    /// Token attempts per chapter in the current run
    pub retry_counts: HashMap<String, u32>,
    pub started_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub cancelling: bool,
    /// Planner task for the current run has finished
    pub planning_done: bool,
    pub storage_full: bool,
}

impl BatchSession {
    pub fn new(
        content_id: impl Into<String>,
        title: impl Into<String>,
        selection: ChapterSelection,
        chapters: Vec<ChapterListing>,
    ) -> Self {
        let content_id = content_id.into();
        let now = Utc::now();
        Self {
            session_id: format!("{}-{}", content_id, now.timestamp_millis()),
            content_id,
            title: title.into(),
            selection,
            status: SessionStatus::Preparing,
            chapters: chapters
                .into_iter()
                .map(|listing| SessionChapter {
                    listing,
                    phase: ChapterPhase::Planned,
                })
                .collect(),
            active_token_request: None,
            retry_counts: HashMap::new(),
            started_at: now,
            last_updated_at: now,
            cancelling: false,
            planning_done: false,
            storage_full: false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status != SessionStatus::Idle
    }

    pub fn chapter_mut(&mut self, chapter: &str) -> Option<&mut SessionChapter> {
        self.chapters
            .iter_mut()
            .find(|c| c.listing.chapter == chapter)
    }

    pub fn phase(&self, chapter: &str) -> Option<&ChapterPhase> {
        self.chapters
            .iter()
            .find(|c| c.listing.chapter == chapter)
            .map(|c| &c.phase)
    }

    /// Set a chapter's phase; settled chapters only leave via [`reset_failed`]
    ///
    /// Returns whether anything changed.
    ///
    /// [`reset_failed`]: Self::reset_failed
    pub fn set_phase(&mut self, chapter: &str, phase: ChapterPhase) -> bool {
        let Some(slot) = self.chapter_mut(chapter) else {
            return false;
        };
        if slot.phase.is_settled() || slot.phase == phase {
            return false;
        }
        if let ChapterPhase::Failed {
            error_type: ErrorType::StorageFull,
            ..
        } = phase
        {
            self.storage_full = true;
        }
        if let Some(slot) = self.chapter_mut(chapter) {
            slot.phase = phase;
        }
        self.touch();
        true
    }

    pub fn touch(&mut self) {
        self.last_updated_at = Utc::now();
    }

    /// Chapters that reached the queue and could still produce events
    pub fn queued_chapters(&self) -> Vec<String> {
        self.chapters
            .iter()
            .filter(|c| {
                matches!(
                    c.phase,
                    ChapterPhase::Queued | ChapterPhase::Downloading(_) | ChapterPhase::Paused
                )
            })
            .map(|c| c.listing.chapter.clone())
            .collect()
    }

    pub fn completed_count(&self) -> usize {
        self.chapters
            .iter()
            .filter(|c| c.phase == ChapterPhase::Completed)
            .count()
    }

    pub fn failed_chapters(&self) -> Vec<String> {
        self.chapters
            .iter()
            .filter(|c| matches!(c.phase, ChapterPhase::Failed { .. }))
            .map(|c| c.listing.chapter.clone())
            .collect()
    }

    pub fn cancelled_count(&self) -> usize {
        self.chapters
            .iter()
            .filter(|c| c.phase == ChapterPhase::Cancelled)
            .count()
    }

    /// Mean chapter progress, settled chapters counting as done
    pub fn progress_percent(&self) -> u8 {
        if self.chapters.is_empty() {
            return 0;
        }
        let sum: u64 = self.chapters.iter().map(|c| c.phase.percent() as u64).sum();
        (sum / self.chapters.len() as u64) as u8
    }

    /// Return to `Idle` once planning is over and every chapter is settled
    ///
    /// Returns true on the transition.
    pub fn settle_if_done(&mut self) -> bool {
        if self.status == SessionStatus::Idle || !self.planning_done {
            return false;
        }
        if self.chapters.iter().all(|c| c.phase.is_settled()) {
            self.status = SessionStatus::Idle;
            self.active_token_request = None;
            self.touch();
            return true;
        }
        false
    }

    /// Put failed chapters back to `Planned` for a new run
    ///
    /// Token attempt counts start over. Returns the chapters reset.
    pub fn reset_failed(&mut self) -> Vec<ChapterListing> {
        let mut reset = Vec::new();
        for slot in &mut self.chapters {
            if matches!(slot.phase, ChapterPhase::Failed { .. }) {
                slot.phase = ChapterPhase::Planned;
                reset.push(slot.listing.clone());
            }
        }
        for listing in &reset {
            self.retry_counts.remove(&listing.chapter);
        }
        self.status = SessionStatus::Preparing;
        self.cancelling = false;
        self.planning_done = false;
        self.storage_full = false;
        self.touch();
        reset
    }

    pub fn view(&self) -> BatchSessionView {
        BatchSessionView {
            session_id: Some(self.session_id.clone()),
            content_id: self.content_id.clone(),
            title: self.title.clone(),
            status: self.status,
            planned_chapters: self
                .chapters
                .iter()
                .map(|c| c.listing.chapter.clone())
                .collect(),
            completed_chapters: self.completed_count(),
            failed_chapters: self.failed_chapters(),
            progress_percent: self.progress_percent(),
            active_token_request: self.active_token_request.clone(),
            storage_full: self.storage_full,
            cancelling: self.cancelling,
            message: self.message(),
            started_at: Some(self.started_at),
            last_updated_at: Some(self.last_updated_at),
        }
    }

    fn message(&self) -> String {
        let total = self.chapters.len();
        let completed = self.completed_count();
        let failed = self.failed_chapters().len();

        if self.storage_full {
            return "Storage is full. Free up space or lower the download quality, then retry"
                .to_string();
        }

        match self.status {
            SessionStatus::Preparing => match &self.active_token_request {
                Some(chapter) => format!("Preparing chapter {}", chapter),
                None => format!("Preparing {} chapters", total),
            },
            SessionStatus::Downloading if self.cancelling => "Cancelling downloads".to_string(),
            SessionStatus::Downloading => {
                format!("Downloading: {} of {} chapters complete", completed, total)
            }
            SessionStatus::Idle if self.cancelled_count() > 0 => format!(
                "Download cancelled: {} of {} chapters downloaded",
                completed, total
            ),
            SessionStatus::Idle if failed == 0 => {
                format!("Downloaded {} chapters", completed)
            }
            SessionStatus::Idle => format!(
                "Downloaded {} of {} chapters, {} failed. Retry to download the failed chapters",
                completed, total, failed
            ),
        }
    }
}

/// Read-only snapshot handed to subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSessionView {
    pub session_id: Option<String>,
    pub content_id: String,
    pub title: String,
    pub status: SessionStatus,
    pub planned_chapters: Vec<String>,
    pub completed_chapters: usize,
    pub failed_chapters: Vec<String>,
    pub progress_percent: u8,
    pub active_token_request: Option<String>,
    /// A transfer hit the storage limit; shown instead of the generic summary
    pub storage_full: bool,
    pub cancelling: bool,
    pub message: String,
    pub started_at: Option<DateTime<Utc>>,
    pub last_updated_at: Option<DateTime<Utc>>,
}

impl BatchSessionView {
    /// View of a content item with no session
    pub fn idle(content_id: impl Into<String>) -> Self {
        Self {
            session_id: None,
            content_id: content_id.into(),
            title: String::new(),
            status: SessionStatus::Idle,
            planned_chapters: Vec::new(),
            completed_chapters: 0,
            failed_chapters: Vec::new(),
            progress_percent: 0,
            active_token_request: None,
            storage_full: false,
            cancelling: false,
            message: "No downloads".to_string(),
            started_at: None,
            last_updated_at: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status != SessionStatus::Idle
    }

    /// Finished with at least one chapter and no failures
    pub fn is_success(&self) -> bool {
        !self.is_running()
            && self.session_id.is_some()
            && self.failed_chapters.is_empty()
            && !self.storage_full
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(labels: &[&str]) -> BatchSession {
        let chapters = labels
            .iter()
            .map(|label| ChapterListing {
                chapter: label.to_string(),
                title: None,
                source_url: format!("https://reader.test/{}", label),
                requires_token: true,
            })
            .collect();
        BatchSession::new("c", "Title", ChapterSelection::All, chapters)
    }

    fn failed(error_type: ErrorType) -> ChapterPhase {
        ChapterPhase::Failed {
            message: "boom".to_string(),
            error_type,
        }
    }

    #[test]
    fn test_settles_only_after_planning() {
        let mut s = session(&["1", "2"]);
        s.set_phase("1", ChapterPhase::Completed);
        s.set_phase("2", failed(ErrorType::Network));
        assert!(!s.settle_if_done());

        s.planning_done = true;
        assert!(s.settle_if_done());
        assert_eq!(s.status, SessionStatus::Idle);

        let view = s.view();
        assert_eq!(view.completed_chapters, 1);
        assert_eq!(view.failed_chapters, vec!["2".to_string()]);
        assert!(view.message.contains("1 failed"));
        assert!(!view.is_success());
    }

    #[test]
    fn test_settled_phase_is_sticky() {
        let mut s = session(&["1"]);
        assert!(s.set_phase("1", ChapterPhase::Completed));
        assert!(!s.set_phase("1", ChapterPhase::Downloading(40)));
        assert_eq!(s.phase("1"), Some(&ChapterPhase::Completed));
    }

    #[test]
    fn test_progress_percent() {
        let mut s = session(&["1", "2", "3", "4"]);
        s.set_phase("1", ChapterPhase::Completed);
        s.set_phase("2", ChapterPhase::Downloading(50));
        assert_eq!(s.progress_percent(), 37);
    }

    #[test]
    fn test_storage_full_message_is_distinct() {
        let mut s = session(&["1", "2"]);
        s.status = SessionStatus::Downloading;
        s.set_phase("1", failed(ErrorType::StorageFull));

        let view = s.view();
        assert!(view.storage_full);
        assert!(view.message.starts_with("Storage is full"));
    }

    #[test]
    fn test_reset_failed_starts_new_run() {
        let mut s = session(&["1", "2", "3"]);
        s.set_phase("1", ChapterPhase::Completed);
        s.set_phase("2", failed(ErrorType::Network));
        s.set_phase("3", ChapterPhase::Completed);
        s.retry_counts.insert("2".to_string(), 3);
        s.planning_done = true;
        s.settle_if_done();

        let reset = s.reset_failed();
        assert_eq!(reset.len(), 1);
        assert_eq!(reset[0].chapter, "2");
        assert_eq!(s.status, SessionStatus::Preparing);
        assert!(s.retry_counts.is_empty());
        assert_eq!(s.phase("2"), Some(&ChapterPhase::Planned));
        assert_eq!(s.completed_count(), 2);
    }
}
