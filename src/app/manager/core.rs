//! Core download manager implementation
//!
//! Executes one admitted work item at a time per task: resolves the page
//! list, streams every missing page into storage with bounded fan-out,
//! publishes throttled progress and settles the item's queue status.
//! Finalization is a barrier: the chapter record only appears once every page
//! is staged, whatever order pages arrive in.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::app::classifier::{classify, error_type_of, ErrorContext, ErrorType};
use crate::app::events::{DownloadEventKind, DownloadFailure, EventEmitter};
use crate::app::models::{ChapterKey, ChapterRecord, DownloadStatus, PageImage, Progress, WorkItem};
use crate::app::queue::DownloadQueue;
use crate::app::sources::{PageFetcher, PageListResolver, ResolvedChapter};
use crate::app::storage::ChapterStorage;
use crate::errors::{DownloadError, DownloadResult, QueueError, TokenError};

use super::config::ManagerConfig;
use super::control::{TransferControl, TransferSignal};
use super::page::PageDownloader;
use super::progress::ProgressTracker;

/// How a transfer ended
#[derive(Debug)]
pub enum TransferOutcome {
    Completed(ChapterRecord),
    Failed(DownloadError),
    Cancelled,
    Paused,
}

impl TransferOutcome {
    pub fn status(&self) -> DownloadStatus {
        match self {
            TransferOutcome::Completed(_) => DownloadStatus::Completed,
            TransferOutcome::Failed(_) => DownloadStatus::Failed,
            TransferOutcome::Cancelled => DownloadStatus::Cancelled,
            TransferOutcome::Paused => DownloadStatus::Paused,
        }
    }
}

/// Handle to a running transfer
#[derive(Debug)]
pub struct TransferHandle {
    id: String,
    join: JoinHandle<TransferOutcome>,
}

impl TransferHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the transfer to end
    pub async fn wait(self) -> TransferOutcome {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(e) => TransferOutcome::Failed(DownloadError::Other(format!(
                "transfer task failed: {}",
                e
            ))),
        }
    }
}

/// Result of one page task
enum PageOutcome {
    Saved(u64),
    Failed(DownloadError),
    Skipped,
}

/// Executes chapter transfers admitted by the queue
pub struct DownloadManager {
    config: ManagerConfig,
    queue: Arc<DownloadQueue>,
    storage: Arc<ChapterStorage>,
    resolver: Arc<dyn PageListResolver>,
    downloader: PageDownloader,
    emitter: EventEmitter,
    /// Controls of transfers currently running
    active: Mutex<HashMap<String, Arc<TransferControl>>>,
    /// Last known progress per item, kept across pauses
    progress: RwLock<HashMap<String, Progress>>,
}

impl std::fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DownloadManager {
    /// Create a manager over the shared queue and storage
    ///
    /// # Errors
    ///
    /// `DownloadError::ConfigurationError` if `config` is invalid.
    pub fn new(
        config: ManagerConfig,
        queue: Arc<DownloadQueue>,
        storage: Arc<ChapterStorage>,
        resolver: Arc<dyn PageListResolver>,
        fetcher: Arc<dyn PageFetcher>,
        emitter: EventEmitter,
    ) -> DownloadResult<Self> {
        config.validate()?;
        Ok(Self {
            downloader: PageDownloader::new(fetcher, config.clone()),
            config,
            queue,
            storage,
            resolver,
            emitter,
            active: Mutex::new(HashMap::new()),
            progress: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<DownloadQueue> {
        &self.queue
    }

    pub fn storage(&self) -> &Arc<ChapterStorage> {
        &self.storage
    }

    /// Page fetching policy shared with chapter repair
    pub fn page_downloader(&self) -> &PageDownloader {
        &self.downloader
    }

    /// Start executing an item obtained from [`DownloadQueue::dequeue_next`]
    ///
    /// # Errors
    ///
    /// `DownloadError::AlreadyActive` if a transfer with the same id runs,
    /// `DownloadError::NotAdmitted` if the item was cancelled or paused after
    /// admission.
    pub async fn start(self: &Arc<Self>, item: WorkItem) -> DownloadResult<TransferHandle> {
        let control = {
            let mut active = self.active.lock().await;
            if active.contains_key(&item.id) {
                return Err(DownloadError::AlreadyActive { id: item.id });
            }
            // checked under the same lock `cancel` holds while marking
            match self.queue.get(&item.id).await.map(|entry| entry.status) {
                Some(DownloadStatus::Downloading) => {}
                status => {
                    let status = status.map_or_else(|| "missing".to_string(), |s| s.to_string());
                    debug!("Not starting {}: {}", item.id, status);
                    return Err(DownloadError::NotAdmitted { id: item.id, status });
                }
            }
            let control = Arc::new(TransferControl::new());
            active.insert(item.id.clone(), Arc::clone(&control));
            control
        };

        let id = item.id.clone();
        let manager = Arc::clone(self);
        let join = tokio::spawn(async move { manager.execute(item, control).await });
        Ok(TransferHandle { id, join })
    }

    /// Ids of transfers currently running
    pub async fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Ask a running transfer to pause after its current pages
    ///
    /// Returns false if no transfer with this id is running.
    pub async fn pause(&self, id: &str) -> bool {
        match self.active.lock().await.get(id) {
            Some(control) => control.request_pause(),
            None => false,
        }
    }

    /// Pause every running transfer
    pub async fn pause_all(&self) -> usize {
        self.active
            .lock()
            .await
            .values()
            .filter(|control| control.request_pause())
            .count()
    }

    /// Requeue a paused item; it resumes from the pages already stored
    pub async fn resume(&self, id: &str) -> DownloadResult<()> {
        self.queue.resume_item(id).await?;
        info!("Resuming {}", id);
        Ok(())
    }

    /// Cancel a transfer and discard its partial pages
    ///
    /// A running transfer stops cooperatively; a queued or paused item is
    /// cancelled immediately.
    pub async fn cancel(&self, id: &str) -> DownloadResult<()> {
        let entry = {
            let active = self.active.lock().await;
            if let Some(control) = active.get(id) {
                control.request_cancel();
                debug!("Cancellation requested for {}", id);
                return Ok(());
            }

            // still holding `active`, so `start` cannot slip in between
            let entry = self
                .queue
                .get(id)
                .await
                .ok_or_else(|| QueueError::WorkNotFound { id: id.to_string() })?;
            self.queue.mark_cancelled(id).await?;
            entry
        };
        let key = entry.item.key();
        self.storage.discard_partial(&key).await?;
        self.progress.write().await.remove(id);
        self.emitter.emit(&key, DownloadEventKind::Cancelled);
        info!("Cancelled {}", id);
        Ok(())
    }

    /// Latest progress of a running or paused transfer
    pub async fn progress(&self, id: &str) -> Option<Progress> {
        self.progress.read().await.get(id).cloned()
    }

    async fn execute(self: Arc<Self>, item: WorkItem, control: Arc<TransferControl>) -> TransferOutcome {
        let outcome = match self.run_transfer(&item, &control).await {
            Ok(outcome) => outcome,
            Err(DownloadError::Cancelled) if control.is_cancelled() => self.settle_cancelled(&item).await,
            Err(DownloadError::Cancelled) => self.settle_paused(&item, None).await,
            Err(e) => self.settle_failed(&item, e).await,
        };
        self.active.lock().await.remove(&item.id);
        outcome
    }

    async fn run_transfer(
        &self,
        item: &WorkItem,
        control: &TransferControl,
    ) -> DownloadResult<TransferOutcome> {
        let key = item.key();

        if let Some(record) = self.storage.get_record(&key).await {
            if record.all_pages_completed() {
                debug!(content_id = %key.content_id, chapter = %key.chapter, "Already stored");
                return Ok(self.settle_completed(item, record).await);
            }
        }

        let resolved: ResolvedChapter = self
            .downloader
            .with_retry(&item.source_url, control, || {
                self.resolver.resolve_pages(&key, item.access_token.as_deref())
            })
            .await?;
        if resolved.page_urls.is_empty() {
            return Err(DownloadError::Parsing {
                reason: format!("no pages listed for {}", key),
            });
        }

        let total = resolved.page_urls.len();
        let title = resolved.title.clone().or_else(|| Some(item.title.clone()));
        let already = self
            .storage
            .begin_chapter(&key, title, resolved.page_urls.clone())
            .await?;

        let previous = self.progress.read().await.get(&item.id).cloned();
        let mut tracker = ProgressTracker::resume(
            previous.unwrap_or_else(|| Progress::new(total)),
            total,
            already.len(),
            self.config.speed_alpha,
            self.config.progress_interval,
        );
        self.publish_progress(item, &key, &mut tracker).await;

        let pending: Vec<(u32, String)> = resolved
            .page_urls
            .into_iter()
            .enumerate()
            .map(|(i, url)| (i as u32 + 1, url))
            .filter(|(page, _)| !already.contains(page))
            .collect();
        info!(
            content_id = %key.content_id,
            chapter = %key.chapter,
            "Fetching {} of {} pages",
            pending.len(),
            total
        );

        let abort = AtomicBool::new(false);
        let mut storage_full: Option<DownloadError> = None;
        let mut last_error: Option<DownloadError> = None;

        let mut pages = stream::iter(pending)
            .map(|(page, url)| self.fetch_and_store(&key, page, url, control, &abort))
            .buffer_unordered(self.config.page_concurrency);

        while let Some(outcome) = pages.next().await {
            match outcome {
                PageOutcome::Saved(bytes) => {
                    tracker.record_page(bytes);
                    self.publish_progress(item, &key, &mut tracker).await;
                }
                PageOutcome::Failed(e) if error_type_of(&e) == ErrorType::StorageFull => {
                    abort.store(true, Ordering::SeqCst);
                    storage_full.get_or_insert(e);
                }
                PageOutcome::Failed(e) => {
                    tracker.record_failure();
                    last_error = Some(e);
                }
                PageOutcome::Skipped => {}
            }
        }
        drop(pages);

        self.progress
            .write()
            .await
            .insert(item.id.clone(), tracker.snapshot());

        if control.is_cancelled() {
            return Ok(self.settle_cancelled(item).await);
        }
        if let Some(e) = storage_full {
            return Err(e);
        }
        if tracker.is_complete() {
            let record = self.storage.finalize_chapter(&key).await?;
            return Ok(self.settle_completed(item, record).await);
        }
        if control.signal() == TransferSignal::Pause {
            return Ok(self.settle_paused(item, Some(tracker.snapshot())).await);
        }

        let failed = tracker.failed_pages();
        match last_error {
            // nothing at all could be stored
            Some(e) if tracker.completed_pages() == 0 => Err(e),
            _ => Err(DownloadError::IncompletePages { failed, total }),
        }
    }

    async fn fetch_and_store(
        &self,
        key: &ChapterKey,
        page_number: u32,
        url: String,
        control: &TransferControl,
        abort: &AtomicBool,
    ) -> PageOutcome {
        if control.should_stop() || abort.load(Ordering::SeqCst) {
            return PageOutcome::Skipped;
        }

        let bytes = match self.downloader.fetch(&url, control).await {
            Ok(bytes) => bytes,
            Err(DownloadError::Cancelled) => return PageOutcome::Skipped,
            Err(e) => {
                warn!(
                    content_id = %key.content_id,
                    chapter = %key.chapter,
                    page = page_number,
                    "Page failed: {}",
                    e
                );
                return PageOutcome::Failed(e);
            }
        };

        let image = PageImage {
            page_number,
            source_url: url,
            bytes,
        };
        match self.storage.save_page(key, image).await {
            Ok(asset) => PageOutcome::Saved(asset.size_bytes),
            // discarded by a concurrent cancel
            Err(_) if control.is_cancelled() => PageOutcome::Skipped,
            Err(e) => PageOutcome::Failed(e.into()),
        }
    }

    async fn publish_progress(&self, item: &WorkItem, key: &ChapterKey, tracker: &mut ProgressTracker) {
        if !tracker.should_emit() {
            return;
        }
        let snapshot = tracker.snapshot();
        self.progress
            .write()
            .await
            .insert(item.id.clone(), snapshot.clone());
        self.emitter.emit(key, DownloadEventKind::Progress(snapshot));
    }

    async fn settle_completed(&self, item: &WorkItem, record: ChapterRecord) -> TransferOutcome {
        if let Err(e) = self.queue.mark_completed(&item.id).await {
            warn!("Could not mark {} completed: {}", item.id, e);
        }
        self.progress.write().await.remove(&item.id);
        self.emitter.emit(&item.key(), DownloadEventKind::Completed);
        info!(
            content_id = %item.content_id,
            chapter = %item.chapter,
            "Download completed"
        );
        TransferOutcome::Completed(record)
    }

    async fn settle_paused(&self, item: &WorkItem, progress: Option<Progress>) -> TransferOutcome {
        if let Some(progress) = progress {
            self.progress.write().await.insert(item.id.clone(), progress);
        }
        if let Err(e) = self.queue.mark_paused(&item.id).await {
            warn!("Could not mark {} paused: {}", item.id, e);
        }
        self.emitter.emit(&item.key(), DownloadEventKind::Paused);
        info!(content_id = %item.content_id, chapter = %item.chapter, "Download paused");
        TransferOutcome::Paused
    }

    async fn settle_cancelled(&self, item: &WorkItem) -> TransferOutcome {
        let key = item.key();
        if let Err(e) = self.storage.discard_partial(&key).await {
            warn!("Could not discard partial pages of {}: {}", key, e);
        }
        if let Err(e) = self.queue.mark_cancelled(&item.id).await {
            warn!("Could not mark {} cancelled: {}", item.id, e);
        }
        self.progress.write().await.remove(&item.id);
        self.emitter.emit(&key, DownloadEventKind::Cancelled);
        info!(content_id = %key.content_id, chapter = %key.chapter, "Download cancelled");
        TransferOutcome::Cancelled
    }

    async fn settle_failed(&self, item: &WorkItem, error: DownloadError) -> TransferOutcome {
        let classification = classify(&error, &ErrorContext::default());
        warn!(
            content_id = %item.content_id,
            chapter = %item.chapter,
            error_type = %classification.error_type,
            "Download failed: {}",
            error
        );

        if let Err(e) = self.queue.mark_failed(&item.id, &error.to_string()).await {
            warn!("Could not mark {} failed: {}", item.id, e);
        }
        self.emitter.emit(
            &item.key(),
            DownloadEventKind::Failed(DownloadFailure {
                error_type: classification.error_type,
                content_id: item.content_id.clone(),
                chapter: item.chapter.clone(),
                message: error.to_string(),
                retryable: classification.retryable,
                token_rejected: matches!(error, DownloadError::Token(TokenError::Rejected { .. })),
            }),
        );
        TransferOutcome::Failed(error)
    }
}
