//! Core chapter storage with atomic operations
//!
//! Pages of a chapter in progress are written into a staging directory, one
//! atomically renamed file per page, in any order. Once every expected page
//! is present the staging directory is promoted with a single rename and
//! only then is the [`ChapterRecord`] added to the index. A reader can
//! therefore never observe a record whose pages are incomplete.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::app::hash::Md5Hash;
use crate::app::models::{
    compare_chapters, ChapterKey, ChapterRecord, PageAsset, PageImage, PageStatus,
};
use crate::constants::config as app_dirs;
use crate::errors::{StorageError, StorageResult};

use super::config::StorageConfig;
use super::index::{self, RecordMap};
use super::path::{page_file_name, parse_page_file_name, write_atomic, StorageLayout};
use super::stats::{CleanupResult, QuotaStatus, StorageStats};

/// Chapter being assembled in the staging area
#[derive(Debug)]
struct PartialChapter {
    title: Option<String>,
    page_urls: Vec<String>,
    completed: BTreeMap<u32, PageAsset>,
    finalized: bool,
    discarded: bool,
}

impl PartialChapter {
    fn staged_bytes(&self) -> u64 {
        self.completed.values().map(|p| p.size_bytes).sum()
    }

    fn is_live(&self) -> bool {
        !self.finalized && !self.discarded
    }
}

/// Durable store for chapter pages and records
#[derive(Debug)]
pub struct ChapterStorage {
    config: StorageConfig,
    layout: StorageLayout,
    /// Finalized chapters; the only durable shared state
    records: RwLock<RecordMap>,
    /// One entry per chapter in progress, each behind its own lock
    partials: Mutex<HashMap<ChapterKey, Arc<Mutex<PartialChapter>>>>,
    staged_bytes: AtomicU64,
    cleanup_interrupt: AtomicBool,
}

impl ChapterStorage {
    /// Open (or create) the storage root and load the record index
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the root cannot be created or the index
    /// cannot be read.
    pub async fn open(config: StorageConfig) -> StorageResult<Self> {
        let root = match &config.storage_root {
            Some(path) => path.clone(),
            None => Self::default_storage_dir()?,
        };
        let layout = StorageLayout::new(root);

        for dir in [
            layout.root().to_path_buf(),
            layout.chapters_dir(),
            layout.staging_dir(),
        ] {
            Self::ensure_directory_exists(&dir).await?;
        }

        let index_path = layout.index_path();
        let records = index::load_or_recover(&index_path).await?;
        index::log_summary(&index_path, &records);

        Ok(Self {
            config,
            layout,
            records: RwLock::new(records),
            partials: Mutex::new(HashMap::new()),
            staged_bytes: AtomicU64::new(0),
            cleanup_interrupt: AtomicBool::new(false),
        })
    }

    /// Default storage directory under the OS data dir
    fn default_storage_dir() -> StorageResult<PathBuf> {
        let dir = dirs::data_dir()
            .ok_or_else(|| StorageError::DirectoryNotAccessible {
                path: PathBuf::from("system data directory"),
            })?
            .join(app_dirs::APP_DIR)
            .join("storage");
        Ok(dir)
    }

    async fn ensure_directory_exists(path: &Path) -> StorageResult<()> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            fs::create_dir_all(path).await.map_err(|e| {
                error!("Failed to create storage directory: {}", e);
                StorageError::DirectoryNotAccessible {
                    path: path.to_path_buf(),
                }
            })?;
            debug!("Created storage directory: {}", path.display());
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        self.layout.root()
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Bytes staged across all chapters in progress
    pub fn staged_bytes(&self) -> u64 {
        self.staged_bytes.load(Ordering::SeqCst)
    }

    // ---- chapter assembly ----

    /// Start or resume assembling a chapter
    ///
    /// Returns the page numbers already staged, including pages left over
    /// from an earlier run, so the caller can skip them.
    pub async fn begin_chapter(
        &self,
        key: &ChapterKey,
        title: Option<String>,
        page_urls: Vec<String>,
    ) -> StorageResult<Vec<u32>> {
        let mut partials = self.partials.lock().await;

        if let Some(existing) = partials.get(key).cloned() {
            let mut partial = existing.lock().await;
            if partial.is_live() && partial.page_urls.len() == page_urls.len() {
                partial.page_urls = page_urls;
                if title.is_some() {
                    partial.title = title;
                }
                return Ok(partial.completed.keys().copied().collect());
            }
            if partial.is_live() {
                warn!(
                    content_id = %key.content_id,
                    chapter = %key.chapter,
                    "Page list changed from {} to {} pages, restarting chapter",
                    partial.page_urls.len(),
                    page_urls.len()
                );
                partial.discarded = true;
                self.staged_bytes
                    .fetch_sub(partial.staged_bytes(), Ordering::SeqCst);
                drop(partial);
                Self::remove_dir_if_exists(&self.layout.staging_chapter_dir(key)).await?;
            }
            partials.remove(key);
        }

        let completed = self.scan_staging(key, &page_urls).await?;
        let resumed: Vec<u32> = completed.keys().copied().collect();
        let partial = PartialChapter {
            title,
            page_urls,
            completed,
            finalized: false,
            discarded: false,
        };
        self.staged_bytes
            .fetch_add(partial.staged_bytes(), Ordering::SeqCst);
        partials.insert(key.clone(), Arc::new(Mutex::new(partial)));

        debug!(
            content_id = %key.content_id,
            chapter = %key.chapter,
            "Chapter staged with {} pages already present",
            resumed.len()
        );
        Ok(resumed)
    }

    /// Pick up page files written by a previous run
    async fn scan_staging(
        &self,
        key: &ChapterKey,
        page_urls: &[String],
    ) -> StorageResult<BTreeMap<u32, PageAsset>> {
        let dir = self.layout.staging_chapter_dir(key);
        let mut completed = BTreeMap::new();

        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                fs::create_dir_all(&dir).await?;
                return Ok(completed);
            }
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            let parsed = parse_page_file_name(&name)
                .filter(|(page, _)| *page >= 1 && (*page as usize) <= page_urls.len())
                .filter(|(page, _)| !completed.contains_key(page));

            let Some((page_number, hash)) = parsed else {
                // leftovers from interrupted writes or a different page list
                let _ = fs::remove_file(&path).await;
                continue;
            };

            let size_bytes = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
            if size_bytes == 0 {
                let _ = fs::remove_file(&path).await;
                continue;
            }

            completed.insert(
                page_number,
                PageAsset {
                    page_number,
                    source_url: page_urls[page_number as usize - 1].clone(),
                    local_path: Some(path_string(&path)),
                    status: PageStatus::Completed,
                    size_bytes,
                    content_hash: Some(hash),
                },
            );
        }

        Ok(completed)
    }

    async fn partial(&self, key: &ChapterKey) -> StorageResult<Arc<Mutex<PartialChapter>>> {
        self.partials
            .lock()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::ChapterNotStarted {
                content_id: key.content_id.clone(),
                chapter: key.chapter.clone(),
            })
    }

    /// Page numbers already staged for a chapter in progress
    pub async fn completed_pages(&self, key: &ChapterKey) -> Vec<u32> {
        match self.partial(key).await {
            Ok(partial) => partial.lock().await.completed.keys().copied().collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Stage one page of a chapter started with [`begin_chapter`](Self::begin_chapter)
    ///
    /// Pages may arrive in any order. Saving the same page twice replaces the
    /// earlier file.
    pub async fn save_page(&self, key: &ChapterKey, page: PageImage) -> StorageResult<PageAsset> {
        let partial = self.partial(key).await?;
        {
            let guard = partial.lock().await;
            if !guard.is_live() {
                return Err(StorageError::ChapterNotStarted {
                    content_id: key.content_id.clone(),
                    chapter: key.chapter.clone(),
                });
            }
            let total = guard.page_urls.len();
            if page.page_number == 0 || page.page_number as usize > total {
                return Err(StorageError::PageOutOfRange {
                    page: page.page_number,
                    total,
                });
            }
        }

        let size_bytes = page.bytes.len() as u64;
        if self.config.enforce_hard_quota {
            self.check_quota(size_bytes).await?;
        }

        let hash = Md5Hash::compute(&page.bytes);
        let path = self
            .layout
            .staging_chapter_dir(key)
            .join(page_file_name(page.page_number, &hash, &page.bytes));
        write_atomic(&path, page.bytes).await?;

        let asset = PageAsset {
            page_number: page.page_number,
            source_url: page.source_url,
            local_path: Some(path_string(&path)),
            status: PageStatus::Completed,
            size_bytes,
            content_hash: Some(hash),
        };

        let mut guard = partial.lock().await;
        if !guard.is_live() {
            // discarded while the write was in flight
            let _ = fs::remove_file(&path).await;
            return Err(StorageError::ChapterNotStarted {
                content_id: key.content_id.clone(),
                chapter: key.chapter.clone(),
            });
        }
        if let Some(previous) = guard.completed.insert(asset.page_number, asset.clone()) {
            self.staged_bytes
                .fetch_sub(previous.size_bytes, Ordering::SeqCst);
            if previous.local_path != asset.local_path {
                if let Some(old) = previous.local_path {
                    let _ = fs::remove_file(old).await;
                }
            }
        }
        self.staged_bytes.fetch_add(size_bytes, Ordering::SeqCst);

        debug!(
            content_id = %key.content_id,
            chapter = %key.chapter,
            page = asset.page_number,
            "Staged page ({} bytes)",
            size_bytes
        );
        Ok(asset)
    }

    async fn check_quota(&self, incoming: u64) -> StorageResult<()> {
        let stored: u64 = self
            .records
            .read()
            .await
            .values()
            .map(|r| r.total_size_bytes)
            .sum();
        let used = stored + self.staged_bytes.load(Ordering::SeqCst);
        let limit = self.config.max_storage_size;
        if used.saturating_add(incoming) > limit {
            warn!("Rejecting page write: {} + {} bytes exceeds {}", used, incoming, limit);
            return Err(StorageError::QuotaExceeded { used, limit });
        }
        Ok(())
    }

    /// Promote a fully staged chapter and publish its record
    ///
    /// Runs exactly once per chapter: a second call returns the stored
    /// record. Fails with `IncompleteChapter` while pages are missing.
    pub async fn finalize_chapter(&self, key: &ChapterKey) -> StorageResult<ChapterRecord> {
        let partial = match self.partial(key).await {
            Ok(partial) => partial,
            Err(e) => return self.get_record(key).await.ok_or(e),
        };

        let mut guard = partial.lock().await;
        if guard.finalized {
            drop(guard);
            return self
                .get_record(key)
                .await
                .ok_or_else(|| StorageError::ChapterNotFound {
                    content_id: key.content_id.clone(),
                    chapter: key.chapter.clone(),
                });
        }
        if guard.discarded {
            return Err(StorageError::ChapterNotStarted {
                content_id: key.content_id.clone(),
                chapter: key.chapter.clone(),
            });
        }

        let expected = guard.page_urls.len();
        if expected == 0 || guard.completed.len() != expected {
            return Err(StorageError::IncompleteChapter {
                content_id: key.content_id.clone(),
                chapter: key.chapter.clone(),
                present: guard.completed.len(),
                expected,
            });
        }

        let staging_dir = self.layout.staging_chapter_dir(key);
        let final_dir = self.layout.chapter_dir(key);
        Self::remove_dir_if_exists(&final_dir).await?;
        if let Some(parent) = final_dir.parent() {
            Self::ensure_directory_exists(parent).await?;
        }
        fs::rename(&staging_dir, &final_dir).await.map_err(|e| {
            error!("Failed to promote staged chapter: {}", e);
            StorageError::AtomicOperationFailed {
                temp_path: staging_dir.clone(),
                final_path: final_dir.clone(),
            }
        })?;

        let pages: Vec<PageAsset> = guard
            .completed
            .values()
            .map(|page| {
                let mut page = page.clone();
                page.local_path = page
                    .local_path
                    .as_deref()
                    .and_then(|p| Path::new(p).file_name())
                    .map(|name| path_string(&final_dir.join(name)));
                page
            })
            .collect();
        let record = ChapterRecord::new(key, guard.title.clone(), pages);

        {
            let mut records = self.records.write().await;
            let previous = records.insert(key.clone(), record.clone());
            if let Err(e) = index::save_index(&self.layout.index_path(), &records).await {
                match previous {
                    Some(previous) => records.insert(key.clone(), previous),
                    None => records.remove(key),
                };
                let _ = fs::rename(&final_dir, &staging_dir).await;
                return Err(e);
            }
        }

        guard.finalized = true;
        self.staged_bytes
            .fetch_sub(guard.staged_bytes(), Ordering::SeqCst);
        drop(guard);

        self.partials.lock().await.remove(key);
        Self::prune_empty_parent(&staging_dir).await;

        info!(
            content_id = %key.content_id,
            chapter = %key.chapter,
            "Stored chapter: {} pages, {} bytes",
            record.page_count,
            record.total_size_bytes
        );
        Ok(record)
    }

    /// Drop a chapter in progress and its staged pages
    ///
    /// No record is ever created for a discarded chapter.
    pub async fn discard_partial(&self, key: &ChapterKey) -> StorageResult<()> {
        let removed = self.partials.lock().await.remove(key);
        if let Some(partial) = removed {
            let mut guard = partial.lock().await;
            if guard.finalized {
                // completion won the race
                return Ok(());
            }
            if !guard.discarded {
                guard.discarded = true;
                self.staged_bytes
                    .fetch_sub(guard.staged_bytes(), Ordering::SeqCst);
            }
        }

        let staging_dir = self.layout.staging_chapter_dir(key);
        Self::remove_dir_if_exists(&staging_dir).await?;
        Self::prune_empty_parent(&staging_dir).await;
        debug!(
            content_id = %key.content_id,
            chapter = %key.chapter,
            "Discarded partial chapter"
        );
        Ok(())
    }

    /// Store a complete chapter in one call
    ///
    /// Idempotent: re-saving a chapter that is already complete changes
    /// nothing, including its size and `downloaded_at`.
    pub async fn save_chapter_images(
        &self,
        key: &ChapterKey,
        title: Option<String>,
        mut images: Vec<PageImage>,
    ) -> StorageResult<ChapterRecord> {
        if let Some(record) = self.get_record(key).await {
            if record.all_pages_completed() {
                debug!(
                    content_id = %key.content_id,
                    chapter = %key.chapter,
                    "Chapter already stored, skipping save"
                );
                return Ok(record);
            }
        }

        images.sort_by_key(|image| image.page_number);
        let urls = images.iter().map(|i| i.source_url.clone()).collect();
        let already = self.begin_chapter(key, title, urls).await?;

        for image in images {
            if already.contains(&image.page_number) {
                continue;
            }
            self.save_page(key, image).await?;
        }

        self.finalize_chapter(key).await
    }

    // ---- read path ----

    pub async fn get_record(&self, key: &ChapterKey) -> Option<ChapterRecord> {
        self.records.read().await.get(key).cloned()
    }

    /// Pages of a stored chapter, `None` if it is not stored
    pub async fn get_chapter_images(&self, key: &ChapterKey) -> Option<Vec<PageAsset>> {
        self.records.read().await.get(key).map(|r| r.pages.clone())
    }

    /// True iff a record exists and every page of it is `Completed`
    pub async fn is_chapter_downloaded(&self, key: &ChapterKey) -> bool {
        self.records
            .read()
            .await
            .get(key)
            .map(ChapterRecord::all_pages_completed)
            .unwrap_or(false)
    }

    /// All records, grouped by content and in chapter order
    pub async fn list_records(&self) -> Vec<ChapterRecord> {
        let mut records: Vec<ChapterRecord> = self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| {
            a.content_id
                .cmp(&b.content_id)
                .then_with(|| compare_chapters(&a.chapter, &b.chapter))
        });
        records
    }

    pub async fn get_storage_stats(&self) -> StorageStats {
        let records = self.records.read().await;
        StorageStats::from_records(
            records.values(),
            self.config.max_storage_size,
            self.config.warning_threshold,
        )
    }

    pub async fn quota_status(&self) -> QuotaStatus {
        self.get_storage_stats().await.quota_status()
    }

    // ---- mutation of stored chapters ----

    /// Remove a stored chapter; absent chapters are not an error
    ///
    /// The record leaves the index before its files are removed.
    pub async fn delete_chapter(&self, key: &ChapterKey) -> StorageResult<Option<ChapterRecord>> {
        let removed = {
            let mut records = self.records.write().await;
            match records.remove(key) {
                Some(record) => {
                    if let Err(e) = index::save_index(&self.layout.index_path(), &records).await {
                        records.insert(key.clone(), record);
                        return Err(e);
                    }
                    Some(record)
                }
                None => None,
            }
        };

        let chapter_dir = self.layout.chapter_dir(key);
        Self::remove_dir_if_exists(&chapter_dir).await?;
        Self::prune_empty_parent(&chapter_dir).await;

        if removed.is_some() {
            info!(content_id = %key.content_id, chapter = %key.chapter, "Deleted chapter");
        }
        Ok(removed)
    }

    /// Delete chapters downloaded more than `older_than_days` ago, oldest first
    pub async fn cleanup_old_downloads(&self, older_than_days: u32) -> StorageResult<CleanupResult> {
        self.cleanup_interrupt.store(false, Ordering::SeqCst);
        let cutoff = Utc::now() - chrono::Duration::days(older_than_days as i64);

        let mut candidates: Vec<_> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.downloaded_at < cutoff)
            .map(|r| (r.downloaded_at, r.key()))
            .collect();
        candidates.sort();

        let mut result = CleanupResult::default();
        for (_, key) in candidates {
            if self.cleanup_interrupt.load(Ordering::SeqCst) {
                info!(
                    "Cleanup interrupted after {} chapters",
                    result.deleted_chapters.len()
                );
                result.interrupted = true;
                break;
            }
            if let Some(record) = self.delete_chapter(&key).await? {
                result.freed_space_bytes += record.total_size_bytes;
                result.deleted_chapters.push(key);
            }
        }
        self.cleanup_interrupt.store(false, Ordering::SeqCst);

        info!(
            "Cleanup removed {} chapters older than {} days, freed {} bytes",
            result.deleted_chapters.len(),
            older_than_days,
            result.freed_space_bytes
        );
        Ok(result)
    }

    /// Ask a running cleanup to stop before its next deletion
    pub fn interrupt_cleanup(&self) {
        self.cleanup_interrupt.store(true, Ordering::SeqCst);
    }

    /// Write validation results onto a stored record
    pub async fn record_validation(
        &self,
        key: &ChapterKey,
        integrity_score: u8,
        errors: Vec<String>,
    ) -> StorageResult<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(key)
            .ok_or_else(|| StorageError::ChapterNotFound {
                content_id: key.content_id.clone(),
                chapter: key.chapter.clone(),
            })?;
        record.integrity_score = Some(integrity_score.min(100));
        record.last_validated_at = Some(Utc::now());
        record.validation_errors = errors;
        index::save_index(&self.layout.index_path(), &records).await
    }

    /// Overwrite one page of a stored chapter, used by repair
    pub async fn replace_page(&self, key: &ChapterKey, page: PageImage) -> StorageResult<PageAsset> {
        let total = self
            .get_record(key)
            .await
            .map(|r| r.pages.len())
            .ok_or_else(|| StorageError::ChapterNotFound {
                content_id: key.content_id.clone(),
                chapter: key.chapter.clone(),
            })?;
        if page.page_number == 0 || page.page_number as usize > total {
            return Err(StorageError::PageOutOfRange {
                page: page.page_number,
                total,
            });
        }

        let size_bytes = page.bytes.len() as u64;
        let hash = Md5Hash::compute(&page.bytes);
        let path = self
            .layout
            .chapter_dir(key)
            .join(page_file_name(page.page_number, &hash, &page.bytes));
        write_atomic(&path, page.bytes).await?;

        let asset = PageAsset {
            page_number: page.page_number,
            source_url: page.source_url,
            local_path: Some(path_string(&path)),
            status: PageStatus::Completed,
            size_bytes,
            content_hash: Some(hash),
        };

        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(key) else {
            // deleted while the page was being written
            let _ = fs::remove_file(&path).await;
            return Err(StorageError::ChapterNotFound {
                content_id: key.content_id.clone(),
                chapter: key.chapter.clone(),
            });
        };
        let slot = asset.page_number as usize - 1;
        let previous = std::mem::replace(&mut record.pages[slot], asset.clone());
        record.refresh_totals();

        if let Err(e) = index::save_index(&self.layout.index_path(), &records).await {
            if let Some(record) = records.get_mut(key) {
                record.pages[slot] = previous;
                record.refresh_totals();
            }
            return Err(e);
        }
        drop(records);

        if previous.local_path != asset.local_path {
            if let Some(old) = previous.local_path {
                let _ = fs::remove_file(old).await;
            }
        }
        debug!(
            content_id = %key.content_id,
            chapter = %key.chapter,
            page = asset.page_number,
            "Replaced page"
        );
        Ok(asset)
    }

    async fn remove_dir_if_exists(path: &Path) -> StorageResult<()> {
        match fs::remove_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the per-content directory once its last chapter is gone
    async fn prune_empty_parent(chapter_dir: &Path) {
        if let Some(parent) = chapter_dir.parent() {
            // fails harmlessly while other chapters remain
            let _ = fs::remove_dir(parent).await;
        }
    }
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
