//! Internal state of the download queue
//!
//! Plain data with no locking or I/O: the queue core wraps it in a mutex and
//! persists a snapshot after every mutation.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::app::models::{DownloadStatus, WorkItem};
use crate::errors::{QueueError, QueueResult};

/// One queue entry and its lifecycle status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub item: WorkItem,
    pub status: DownloadStatus,
    /// Insertion order, the last tie-breaker after priority and `added_at`
    pub seq: u64,
    /// Number of times the item was admitted
    pub attempts: u32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Admission order: priority, then `added_at`, then insertion order
type PendingKey = (u32, DateTime<Utc>, u64, String);

fn pending_key(entry: &QueueEntry) -> PendingKey {
    (
        entry.item.priority,
        entry.item.added_at,
        entry.seq,
        entry.item.id.clone(),
    )
}

/// Snapshot of queue counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub total_items: usize,
    pub active_count: usize,
    pub queued_count: usize,
    pub paused_count: usize,
    pub failed_count: usize,
    pub completed_count: usize,
    pub is_paused: bool,
}

#[derive(Debug, Default)]
pub struct QueueState {
    entries: HashMap<String, QueueEntry>,
    pending: BTreeSet<PendingKey>,
    next_seq: u64,
    paused: bool,
}

impl QueueState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild state from persisted entries
    ///
    /// Entries left `Downloading` by a previous process have no live owner
    /// and go back to `Queued`.
    pub fn restore(entries: Vec<QueueEntry>) -> (Self, usize) {
        let mut state = Self::new();
        let mut recovered = 0;
        for mut entry in entries {
            if entry.status == DownloadStatus::Downloading {
                entry.status = DownloadStatus::Queued;
                entry.updated_at = Utc::now();
                recovered += 1;
            }
            state.next_seq = state.next_seq.max(entry.seq + 1);
            if entry.status == DownloadStatus::Queued {
                state.pending.insert(pending_key(&entry));
            }
            state.entries.insert(entry.item.id.clone(), entry);
        }
        (state, recovered)
    }

    /// Add an item; fails if an entry with the same id is still live
    pub fn insert(&mut self, item: WorkItem) -> QueueResult<()> {
        if let Some(existing) = self.entries.get(&item.id) {
            if existing.status.is_live() {
                return Err(QueueError::DuplicateItem { id: item.id });
            }
        }

        let entry = QueueEntry {
            seq: self.next_seq,
            status: DownloadStatus::Queued,
            attempts: 0,
            last_error: None,
            updated_at: Utc::now(),
            item,
        };
        self.next_seq += 1;
        self.pending.insert(pending_key(&entry));
        debug!("Queued {} (priority {})", entry.item.id, entry.item.priority);
        self.entries.insert(entry.item.id.clone(), entry);
        Ok(())
    }

    /// Admit the next pending item if the queue is running and below `limit`
    pub fn admit_next(&mut self, limit: usize) -> Option<WorkItem> {
        if self.paused || self.active_count() >= limit {
            return None;
        }
        let key = self.pending.pop_first()?;
        let entry = self.entries.get_mut(&key.3)?;
        entry.status = DownloadStatus::Downloading;
        entry.attempts += 1;
        entry.updated_at = Utc::now();
        Some(entry.item.clone())
    }

    /// Move an entry to `next`, enforcing the lifecycle
    pub fn transition(&mut self, id: &str, next: DownloadStatus) -> QueueResult<&QueueEntry> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| QueueError::WorkNotFound { id: id.to_string() })?;

        if !entry.status.can_transition_to(next) {
            return Err(QueueError::InvalidStateTransition {
                id: id.to_string(),
                from: entry.status.to_string(),
                to: next.to_string(),
            });
        }

        let key = pending_key(entry);
        if entry.status == DownloadStatus::Queued {
            self.pending.remove(&key);
        }
        if next == DownloadStatus::Queued {
            self.pending.insert(key);
            entry.last_error = None;
        }
        entry.status = next;
        entry.updated_at = Utc::now();
        Ok(entry)
    }

    pub fn set_error(&mut self, id: &str, error: String) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.last_error = Some(error);
        }
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn get(&self, id: &str) -> Option<&QueueEntry> {
        self.entries.get(id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.values()
    }

    pub fn active_count(&self) -> usize {
        self.count(DownloadStatus::Downloading)
    }

    fn count(&self, status: DownloadStatus) -> usize {
        self.entries.values().filter(|e| e.status == status).count()
    }

    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            total_items: self.entries.len(),
            active_count: self.active_count(),
            queued_count: self.pending.len(),
            paused_count: self.count(DownloadStatus::Paused),
            failed_count: self.count(DownloadStatus::Failed),
            completed_count: self.count(DownloadStatus::Completed),
            is_paused: self.paused,
        }
    }

    /// Entries worth keeping across restarts: everything not terminal
    pub fn persistable(&self) -> Vec<QueueEntry> {
        let mut entries: Vec<QueueEntry> = self
            .entries
            .values()
            .filter(|e| !e.status.is_terminal())
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.seq);
        entries
    }
}
