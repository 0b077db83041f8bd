//! Batch orchestrator tests against in-memory collaborators

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use super::*;
use crate::app::events::EventEmitter;
use crate::app::manager::{DownloadManager, DownloadPool, ManagerConfig};
use crate::app::models::{ChapterKey, DownloadQuality, PageImage};
use crate::app::queue::{DownloadQueue, QueueConfig};
use crate::app::sources::{
    ChapterListing, PageFetcher, PageListResolver, ResolvedChapter, TokenSandbox,
};
use crate::app::storage::{ChapterStorage, StorageConfig};
use crate::errors::{DownloadError, DownloadResult, OrchestratorError, TokenError, TokenResult};

const PAGES: usize = 2;

fn jpeg() -> Vec<u8> {
    let mut bytes = vec![0xFF, 0xD8, 0xFF, 0xE0];
    bytes.extend(std::iter::repeat(1u8).take(80));
    bytes
}

struct Source {
    chapters: Vec<&'static str>,
    requires_token: bool,
    /// Chapters whose pages always fail
    broken: StdMutex<HashSet<String>>,
    /// Chapters whose tokens the source refuses
    refusing: StdMutex<HashSet<String>>,
    resolved: StdMutex<Vec<(String, Option<String>)>>,
}

impl Source {
    fn new(chapters: Vec<&'static str>, requires_token: bool) -> Self {
        Self {
            chapters,
            requires_token,
            broken: StdMutex::new(HashSet::new()),
            refusing: StdMutex::new(HashSet::new()),
            resolved: StdMutex::new(Vec::new()),
        }
    }

    fn resolved_chapters(&self) -> Vec<String> {
        self.resolved.lock().unwrap().iter().map(|(c, _)| c.clone()).collect()
    }
}

#[async_trait]
impl PageListResolver for Source {
    async fn list_chapters(&self, content_id: &str) -> DownloadResult<(String, Vec<ChapterListing>)> {
        let listings = self
            .chapters
            .iter()
            .map(|chapter| ChapterListing {
                chapter: chapter.to_string(),
                title: None,
                source_url: format!("https://reader.test/{}/{}", content_id, chapter),
                requires_token: self.requires_token,
            })
            .collect();
        Ok((format!("Title of {}", content_id), listings))
    }

    async fn resolve_pages(&self, key: &ChapterKey, token: Option<&str>) -> DownloadResult<ResolvedChapter> {
        self.resolved
            .lock()
            .unwrap()
            .push((key.chapter.clone(), token.map(str::to_string)));
        if token.is_some() && self.refusing.lock().unwrap().contains(&key.chapter) {
            return Err(TokenError::Rejected { status: 403 }.into());
        }
        Ok(ResolvedChapter {
            title: None,
            page_urls: (1..=PAGES)
                .map(|n| format!("https://img.test/{}/{}/{}", key.content_id, key.chapter, n))
                .collect(),
        })
    }
}

#[async_trait]
impl PageFetcher for Source {
    async fn fetch_page(&self, url: &str, _quality: DownloadQuality) -> DownloadResult<Vec<u8>> {
        let chapter = url.rsplit('/').nth(1).unwrap_or_default().to_string();
        if self.broken.lock().unwrap().contains(&chapter) {
            return Err(DownloadError::Network {
                message: "connection reset".to_string(),
            });
        }
        Ok(jpeg())
    }
}

#[derive(Default)]
struct Sandbox {
    calls: AtomicUsize,
    /// Targets that never produce a token
    failing: StdMutex<HashSet<String>>,
}

#[async_trait]
impl TokenSandbox for Sandbox {
    async fn derive_token(&self, target: &str) -> TokenResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().unwrap().contains(target) {
            return Err(TokenError::Sandbox {
                reason: "challenge not solved".to_string(),
            });
        }
        Ok(format!("tok:{}", target))
    }
}

struct Harness {
    _temp_dir: TempDir,
    storage: Arc<ChapterStorage>,
    source: Arc<Source>,
    sandbox: Arc<Sandbox>,
    orchestrator: Arc<BatchOrchestrator>,
    _pool: DownloadPool,
}

async fn harness(source: Source) -> Harness {
    let temp_dir = TempDir::new().unwrap();
    let emitter = EventEmitter::new();
    let storage = Arc::new(
        ChapterStorage::open(StorageConfig::with_storage_root(temp_dir.path().to_path_buf()))
            .await
            .unwrap(),
    );
    let queue = Arc::new(DownloadQueue::open(QueueConfig::default(), emitter.clone()).await.unwrap());
    let source = Arc::new(source);
    let config = ManagerConfig::default()
        .with_max_page_attempts(2)
        .with_retry_delays(Duration::from_millis(1), Duration::from_millis(2))
        .with_progress_interval(Duration::ZERO);
    let manager = Arc::new(
        DownloadManager::new(
            config,
            queue,
            Arc::clone(&storage),
            source.clone(),
            source.clone(),
            emitter.clone(),
        )
        .unwrap(),
    );

    let sandbox = Arc::new(Sandbox::default());
    let (broker, _drain) = TokenBroker::spawn(sandbox.clone(), Duration::from_secs(5));
    let orchestrator = Arc::new(
        BatchOrchestrator::new(
            OrchestratorConfig::default(),
            Arc::clone(&manager),
            source.clone(),
            broker,
            &emitter,
        )
        .unwrap(),
    );
    let mut pool = DownloadPool::new(manager);
    pool.start().unwrap();

    Harness {
        _temp_dir: temp_dir,
        storage,
        source,
        sandbox,
        orchestrator,
        _pool: pool,
    }
}

async fn finish(h: &Harness, content_id: &str) -> BatchSessionView {
    tokio::time::timeout(Duration::from_secs(10), h.orchestrator.wait_for_idle(content_id))
        .await
        .expect("session did not finish")
}

#[tokio::test]
async fn test_batch_downloads_selection_with_tokens() {
    let h = harness(Source::new(vec!["1", "2", "3", "4"], true)).await;

    let planned = h
        .orchestrator
        .start_batch_download("c", ChapterSelection::UpTo(3.0))
        .await
        .unwrap();
    assert_eq!(planned.planned_chapters, vec!["1", "2", "3"]);
    assert!(planned.is_running());

    let done = finish(&h, "c").await;
    assert!(done.is_success());
    assert_eq!(done.completed_chapters, 3);
    assert_eq!(done.progress_percent, 100);
    assert_eq!(h.sandbox.calls.load(Ordering::SeqCst), 3);

    for chapter in ["1", "2", "3"] {
        assert!(h.storage.is_chapter_downloaded(&ChapterKey::new("c", chapter)).await);
    }
    assert!(!h.storage.is_chapter_downloaded(&ChapterKey::new("c", "4")).await);

    let tokens: Vec<Option<String>> = h.source.resolved.lock().unwrap().iter().map(|(_, t)| t.clone()).collect();
    assert!(tokens.iter().all(|t| t.as_deref().is_some_and(|t| t.starts_with("tok:"))));
}

#[tokio::test]
async fn test_token_failure_exhausts_attempts_and_isolates_chapter() {
    let h = harness(Source::new(vec!["1", "2"], true)).await;
    h.sandbox
        .failing
        .lock()
        .unwrap()
        .insert("https://reader.test/c/1".to_string());

    h.orchestrator
        .start_batch_download("c", ChapterSelection::All)
        .await
        .unwrap();
    let done = finish(&h, "c").await;

    assert_eq!(done.failed_chapters, vec!["1"]);
    assert_eq!(done.completed_chapters, 1);
    // three attempts for chapter 1, one for chapter 2
    assert_eq!(h.sandbox.calls.load(Ordering::SeqCst), 4);
    assert!(h.source.resolved_chapters().iter().all(|c| c == "2"));
}

#[tokio::test]
async fn test_cached_tokens_are_reused_on_retry() {
    let h = harness(Source::new(vec!["1", "2"], true)).await;
    h.source.broken.lock().unwrap().insert("2".to_string());

    h.orchestrator
        .start_batch_download("c", ChapterSelection::All)
        .await
        .unwrap();
    let first = finish(&h, "c").await;
    assert_eq!(first.failed_chapters, vec!["2"]);
    assert_eq!(h.sandbox.calls.load(Ordering::SeqCst), 2);

    h.source.broken.lock().unwrap().clear();
    let retry = h.orchestrator.retry_failed_chapters("c").await.unwrap();
    assert!(retry.failed_chapters.is_empty());

    let second = finish(&h, "c").await;
    assert!(second.is_success());
    assert_eq!(second.completed_chapters, 2);
    // chapter 2's token was still cached
    assert_eq!(h.sandbox.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_rejected_token_is_derived_again_on_retry() {
    let h = harness(Source::new(vec!["1", "2"], true)).await;
    h.source.refusing.lock().unwrap().insert("2".to_string());

    h.orchestrator
        .start_batch_download("c", ChapterSelection::All)
        .await
        .unwrap();
    let first = finish(&h, "c").await;
    assert_eq!(first.failed_chapters, vec!["2"]);
    assert_eq!(h.sandbox.calls.load(Ordering::SeqCst), 2);
    // refused once, not retried with the same token
    assert_eq!(
        h.source.resolved_chapters().iter().filter(|c| *c == "2").count(),
        1
    );

    h.source.refusing.lock().unwrap().clear();
    h.orchestrator.retry_failed_chapters("c").await.unwrap();
    let second = finish(&h, "c").await;

    assert!(second.is_success());
    assert_eq!(second.completed_chapters, 2);
    assert_eq!(h.sandbox.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_already_downloaded_chapters_are_skipped() {
    let h = harness(Source::new(vec!["1", "2"], false)).await;
    let key = ChapterKey::new("c", "1");
    h.storage
        .save_chapter_images(
            &key,
            None,
            vec![PageImage {
                page_number: 1,
                source_url: "https://img.test/c/1/1".to_string(),
                bytes: jpeg(),
            }],
        )
        .await
        .unwrap();

    h.orchestrator
        .start_batch_download("c", ChapterSelection::All)
        .await
        .unwrap();
    let done = finish(&h, "c").await;

    assert_eq!(done.completed_chapters, 2);
    assert_eq!(h.source.resolved_chapters(), vec!["2"]);
    assert_eq!(h.sandbox.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_session_guards() {
    let h = harness(Source::new(vec!["1", "2"], false)).await;

    assert!(matches!(
        h.orchestrator.start_batch_download("c", ChapterSelection::UpTo(0.5)).await,
        Err(OrchestratorError::EmptySelection { .. })
    ));
    assert!(matches!(
        h.orchestrator.cancel_batch_download("c").await,
        Err(OrchestratorError::SessionNotFound { .. })
    ));
    assert!(matches!(
        h.orchestrator.retry_failed_chapters("c").await,
        Err(OrchestratorError::SessionNotFound { .. })
    ));

    h.orchestrator
        .start_batch_download("c", ChapterSelection::All)
        .await
        .unwrap();
    finish(&h, "c").await;

    assert!(matches!(
        h.orchestrator.retry_failed_chapters("c").await,
        Err(OrchestratorError::NothingToRetry { .. })
    ));
    assert!(h.orchestrator.cancel_batch_download("c").await.is_ok());
}

#[tokio::test]
async fn test_state_subscribers_see_every_phase() {
    let h = harness(Source::new(vec!["1"], true)).await;
    let seen = Arc::new(StdMutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let subscription = h.orchestrator.subscribe_state("c", move |view| {
        sink.lock().unwrap().push(view.status);
    });

    h.orchestrator
        .start_batch_download("c", ChapterSelection::All)
        .await
        .unwrap();
    finish(&h, "c").await;

    let statuses = seen.lock().unwrap().clone();
    assert_eq!(statuses.first(), Some(&SessionStatus::Preparing));
    assert!(statuses.contains(&SessionStatus::Downloading));
    assert_eq!(statuses.last(), Some(&SessionStatus::Idle));

    subscription.unsubscribe();
    let before = seen.lock().unwrap().len();
    h.orchestrator
        .start_batch_download("c", ChapterSelection::All)
        .await
        .unwrap();
    finish(&h, "c").await;
    assert_eq!(seen.lock().unwrap().len(), before);
}

#[tokio::test]
async fn test_unknown_content_has_idle_view() {
    let h = harness(Source::new(vec![], false)).await;
    let view = h.orchestrator.get_state("nothing");
    assert_eq!(view.status, SessionStatus::Idle);
    assert!(view.session_id.is_none());
}
