//! Core download queue implementation
//!
//! The queue is the single admission point for transfers: nothing starts a
//! chapter download except through [`DownloadQueue::dequeue_next`].

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::app::events::{DownloadEventKind, EventEmitter};
use crate::app::models::{DownloadStatus, WorkItem};
use crate::errors::QueueResult;

use super::config::{validate_concurrency, QueueConfig};
use super::state::{QueueEntry, QueueState, QueueStatus};
use super::store::QueueStore;

/// Persistent, priority-ordered backlog with a concurrency gate
#[derive(Debug)]
pub struct DownloadQueue {
    state: Mutex<QueueState>,
    max_concurrent: AtomicUsize,
    store: Option<QueueStore>,
    emitter: EventEmitter,
    /// Signalled whenever an item may have become admissible
    wakeup: Notify,
}

impl DownloadQueue {
    /// Create an in-memory queue, or open the persisted backlog named in `config`
    pub async fn open(config: QueueConfig, emitter: EventEmitter) -> QueueResult<Self> {
        config.validate()?;

        let store = config.backlog_path.clone().map(QueueStore::new);
        let state = match &store {
            Some(store) => {
                let (state, recovered) = QueueState::restore(store.load().await?);
                if recovered > 0 {
                    warn!(
                        "Requeued {} transfers interrupted by the previous run",
                        recovered
                    );
                }
                state
            }
            None => QueueState::new(),
        };

        let queue = Self {
            state: Mutex::new(state),
            max_concurrent: AtomicUsize::new(config.max_concurrent),
            store,
            emitter,
            wakeup: Notify::new(),
        };
        {
            let state = queue.state.lock().await;
            queue.persist(&state).await?;
            info!(
                "Download queue ready: {} queued, limit {}",
                state.status().queued_count,
                config.max_concurrent
            );
        }
        Ok(queue)
    }

    async fn persist(&self, state: &QueueState) -> QueueResult<()> {
        if let Some(store) = &self.store {
            store.save(state.persistable()).await?;
        }
        Ok(())
    }

    /// Add an item to the backlog
    ///
    /// # Errors
    ///
    /// `QueueError::DuplicateItem` if an entry with the same id is queued,
    /// active or paused.
    pub async fn enqueue(&self, item: WorkItem) -> QueueResult<()> {
        {
            let mut state = self.state.lock().await;
            state.insert(item)?;
            self.persist(&state).await?;
        }
        self.wakeup.notify_one();
        Ok(())
    }

    /// Admit the next item in priority order, if a slot is free
    ///
    /// The admitted item is marked `Downloading` and a `download_started`
    /// event is published.
    pub async fn dequeue_next(&self) -> QueueResult<Option<WorkItem>> {
        let admitted = {
            let mut state = self.state.lock().await;
            let limit = self.max_concurrent.load(Ordering::SeqCst);
            match state.admit_next(limit) {
                Some(item) => {
                    self.persist(&state).await?;
                    Some(item)
                }
                None => None,
            }
        };

        if let Some(item) = &admitted {
            debug!("Admitted {}", item.id);
            self.emitter.emit(&item.key(), DownloadEventKind::Started);
        }
        Ok(admitted)
    }

    async fn transition(&self, id: &str, next: DownloadStatus) -> QueueResult<()> {
        {
            let mut state = self.state.lock().await;
            state.transition(id, next)?;
            self.persist(&state).await?;
        }
        // a freed slot or a requeued item may allow another admission
        self.wakeup.notify_one();
        Ok(())
    }

    pub async fn mark_completed(&self, id: &str) -> QueueResult<()> {
        self.transition(id, DownloadStatus::Completed).await
    }

    pub async fn mark_failed(&self, id: &str, error: &str) -> QueueResult<()> {
        {
            let mut state = self.state.lock().await;
            state.transition(id, DownloadStatus::Failed)?;
            state.set_error(id, error.to_string());
            self.persist(&state).await?;
        }
        self.wakeup.notify_one();
        Ok(())
    }

    /// Cancel a queued, active or paused item
    pub async fn mark_cancelled(&self, id: &str) -> QueueResult<()> {
        self.transition(id, DownloadStatus::Cancelled).await
    }

    pub async fn mark_paused(&self, id: &str) -> QueueResult<()> {
        self.transition(id, DownloadStatus::Paused).await
    }

    /// Put a paused item back in line for admission
    pub async fn resume_item(&self, id: &str) -> QueueResult<()> {
        self.transition(id, DownloadStatus::Queued).await
    }

    /// Put every paused item back in line; returns how many were resumed
    pub async fn resume_paused(&self) -> QueueResult<usize> {
        let resumed = {
            let mut state = self.state.lock().await;
            let paused: Vec<String> = state
                .entries()
                .filter(|e| e.status == DownloadStatus::Paused)
                .map(|e| e.item.id.clone())
                .collect();
            for id in &paused {
                state.transition(id, DownloadStatus::Queued)?;
            }
            if !paused.is_empty() {
                self.persist(&state).await?;
            }
            paused.len()
        };
        if resumed > 0 {
            info!("Resumed {} paused transfers", resumed);
            self.wakeup.notify_one();
        }
        Ok(resumed)
    }

    /// Requeue a failed item
    pub async fn retry(&self, id: &str) -> QueueResult<()> {
        self.transition(id, DownloadStatus::Queued).await
    }

    /// Stop admitting new items; the backlog is kept
    pub async fn pause(&self) {
        self.state.lock().await.set_paused(true);
        info!("Download queue paused");
    }

    pub async fn resume(&self) {
        self.state.lock().await.set_paused(false);
        info!("Download queue resumed");
        self.wakeup.notify_one();
    }

    pub async fn status(&self) -> QueueStatus {
        self.state.lock().await.status()
    }

    pub async fn get(&self, id: &str) -> Option<QueueEntry> {
        self.state.lock().await.get(id).cloned()
    }

    /// Every entry, in insertion order
    pub async fn entries(&self) -> Vec<QueueEntry> {
        let state = self.state.lock().await;
        let mut entries: Vec<QueueEntry> = state.entries().cloned().collect();
        entries.sort_by_key(|e| e.seq);
        entries
    }

    /// All entries of one content item, in insertion order
    pub async fn entries_for_content(&self, content_id: &str) -> Vec<QueueEntry> {
        let state = self.state.lock().await;
        let mut entries: Vec<QueueEntry> = state
            .entries()
            .filter(|e| e.item.content_id == content_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.seq);
        entries
    }

    /// Change the concurrency limit; already running transfers are not stopped
    pub fn set_max_concurrent(&self, max_concurrent: usize) -> QueueResult<()> {
        validate_concurrency(max_concurrent)?;
        self.max_concurrent.store(max_concurrent, Ordering::SeqCst);
        self.wakeup.notify_one();
        Ok(())
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }

    /// Wait until something may have become admissible
    pub async fn wait_for_work(&self) {
        self.wakeup.notified().await;
    }

    /// Wake a dispatcher blocked in [`wait_for_work`](Self::wait_for_work)
    pub fn wake(&self) {
        self.wakeup.notify_one();
    }
}
