//! In-memory collaborators and an engine harness for batch scenarios

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use chapter_fetcher::app::events::EventEmitter;
use chapter_fetcher::app::manager::{DownloadManager, DownloadPool, ManagerConfig};
use chapter_fetcher::app::models::{ChapterKey, DownloadQuality};
use chapter_fetcher::app::orchestrator::{
    BatchOrchestrator, BatchSessionView, OrchestratorConfig, TokenBroker,
};
use chapter_fetcher::app::queue::{DownloadQueue, QueueConfig};
use chapter_fetcher::app::sources::{
    ChapterListing, PageFetcher, PageListResolver, ResolvedChapter, TokenSandbox,
};
use chapter_fetcher::app::storage::{ChapterStorage, StorageConfig};
use chapter_fetcher::errors::{DownloadError, DownloadResult, TokenResult};

const PAGES_PER_CHAPTER: usize = 3;

pub fn jpeg() -> Vec<u8> {
    let mut bytes = vec![0xFF, 0xD8, 0xFF, 0xE0];
    bytes.extend(std::iter::repeat(7u8).take(96));
    bytes
}

/// Source serving fixed chapter lists with generated pages
pub struct FakeSource {
    catalog: HashMap<String, Vec<String>>,
    requires_token: bool,
    page_delay: Duration,
    /// `content/chapter` pairs whose pages always fail
    broken: Mutex<HashSet<String>>,
    resolved: Mutex<Vec<ChapterKey>>,
    tokens_seen: Mutex<Vec<Option<String>>>,
    in_flight: Mutex<HashMap<String, usize>>,
    max_active_chapters: AtomicUsize,
}

impl FakeSource {
    pub fn new(requires_token: bool) -> Self {
        Self {
            catalog: HashMap::new(),
            requires_token,
            page_delay: Duration::ZERO,
            broken: Mutex::new(HashSet::new()),
            resolved: Mutex::new(Vec::new()),
            tokens_seen: Mutex::new(Vec::new()),
            in_flight: Mutex::new(HashMap::new()),
            max_active_chapters: AtomicUsize::new(0),
        }
    }

    pub fn with_content(mut self, content_id: &str, chapters: &[&str]) -> Self {
        self.catalog.insert(
            content_id.to_string(),
            chapters.iter().map(|c| c.to_string()).collect(),
        );
        self
    }

    pub fn with_page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = delay;
        self
    }

    pub fn break_chapter(&self, content_id: &str, chapter: &str) {
        self.broken
            .lock()
            .unwrap()
            .insert(format!("{}/{}", content_id, chapter));
    }

    pub fn repair_all(&self) {
        self.broken.lock().unwrap().clear();
    }

    /// Chapters resolved so far, in order
    pub fn resolved(&self) -> Vec<String> {
        self.resolved
            .lock()
            .unwrap()
            .iter()
            .map(|k| k.chapter.clone())
            .collect()
    }

    pub fn tokens_seen(&self) -> Vec<Option<String>> {
        self.tokens_seen.lock().unwrap().clone()
    }

    pub fn max_active_chapters(&self) -> usize {
        self.max_active_chapters.load(Ordering::SeqCst)
    }

    fn enter(&self, chapter: &str) {
        let mut in_flight = self.in_flight.lock().unwrap();
        *in_flight.entry(chapter.to_string()).or_default() += 1;
        let active = in_flight.values().filter(|n| **n > 0).count();
        self.max_active_chapters.fetch_max(active, Ordering::SeqCst);
    }

    fn leave(&self, chapter: &str) {
        let mut in_flight = self.in_flight.lock().unwrap();
        if let Some(n) = in_flight.get_mut(chapter) {
            *n -= 1;
        }
    }
}

#[async_trait]
impl PageListResolver for FakeSource {
    async fn list_chapters(
        &self,
        content_id: &str,
    ) -> DownloadResult<(String, Vec<ChapterListing>)> {
        let chapters = self
            .catalog
            .get(content_id)
            .ok_or_else(|| DownloadError::Parsing {
                reason: format!("unknown content {}", content_id),
            })?;
        let listings = chapters
            .iter()
            .map(|chapter| ChapterListing {
                chapter: chapter.clone(),
                title: None,
                source_url: format!("https://reader.test/{}/{}", content_id, chapter),
                requires_token: self.requires_token,
            })
            .collect();
        Ok((content_id.to_uppercase(), listings))
    }

    async fn resolve_pages(
        &self,
        key: &ChapterKey,
        token: Option<&str>,
    ) -> DownloadResult<ResolvedChapter> {
        self.resolved.lock().unwrap().push(key.clone());
        self.tokens_seen
            .lock()
            .unwrap()
            .push(token.map(str::to_string));
        Ok(ResolvedChapter {
            title: None,
            page_urls: (1..=PAGES_PER_CHAPTER)
                .map(|n| format!("https://img.test/{}/{}/{}", key.content_id, key.chapter, n))
                .collect(),
        })
    }
}

#[async_trait]
impl PageFetcher for FakeSource {
    async fn fetch_page(&self, url: &str, _quality: DownloadQuality) -> DownloadResult<Vec<u8>> {
        let parts: Vec<&str> = url.trim_start_matches("https://img.test/").split('/').collect();
        let chapter = format!("{}/{}", parts[0], parts[1]);

        self.enter(&chapter);
        if !self.page_delay.is_zero() {
            tokio::time::sleep(self.page_delay).await;
        }
        self.leave(&chapter);

        if self.broken.lock().unwrap().contains(&chapter) {
            return Err(DownloadError::Network {
                message: "connection reset".to_string(),
            });
        }
        Ok(jpeg())
    }
}

/// Sandbox that records how many derivations overlap
#[derive(Default)]
pub struct FakeSandbox {
    pub calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    delay: Duration,
}

impl FakeSandbox {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }
}

#[async_trait]
impl TokenSandbox for FakeSandbox {
    async fn derive_token(&self, target: &str) -> TokenResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(format!("token-for-{}", target))
    }
}

/// Fully wired engine over the fakes
pub struct Harness {
    _temp_dir: TempDir,
    pub storage: Arc<ChapterStorage>,
    pub source: Arc<FakeSource>,
    pub sandbox: Arc<FakeSandbox>,
    pub orchestrator: Arc<BatchOrchestrator>,
    pub manager: Arc<DownloadManager>,
    _pool: DownloadPool,
}

pub struct HarnessBuilder {
    source: FakeSource,
    sandbox: FakeSandbox,
    max_concurrent: usize,
    max_storage_size: Option<u64>,
    root: Option<PathBuf>,
}

impl HarnessBuilder {
    pub fn new(source: FakeSource) -> Self {
        Self {
            source,
            sandbox: FakeSandbox::default(),
            max_concurrent: 2,
            max_storage_size: None,
            root: None,
        }
    }

    pub fn sandbox(mut self, sandbox: FakeSandbox) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    /// Keep storage and backlog under `root` so a later harness can reopen them
    pub fn root(mut self, root: &Path) -> Self {
        self.root = Some(root.to_path_buf());
        self
    }

    pub fn hard_quota(mut self, bytes: u64) -> Self {
        self.max_storage_size = Some(bytes);
        self
    }

    pub async fn build(self) -> Harness {
        let temp_dir = TempDir::new().unwrap();
        let root = self.root.unwrap_or_else(|| temp_dir.path().to_path_buf());
        let emitter = EventEmitter::new();

        let mut storage_config = StorageConfig::with_storage_root(root.join("storage"));
        if let Some(bytes) = self.max_storage_size {
            storage_config = storage_config
                .with_max_storage_size(bytes)
                .with_hard_quota(true);
        }
        let storage = Arc::new(ChapterStorage::open(storage_config).await.unwrap());

        let queue_config = QueueConfig::default()
            .with_max_concurrent(self.max_concurrent)
            .with_backlog_path(root.join("backlog.json"));
        let queue = Arc::new(DownloadQueue::open(queue_config, emitter.clone()).await.unwrap());

        let source = Arc::new(self.source);
        let manager_config = ManagerConfig::default()
            .with_max_page_attempts(2)
            .with_retry_delays(Duration::from_millis(1), Duration::from_millis(2))
            .with_progress_interval(Duration::ZERO);
        let manager = Arc::new(
            DownloadManager::new(
                manager_config,
                queue,
                Arc::clone(&storage),
                source.clone(),
                source.clone(),
                emitter.clone(),
            )
            .unwrap(),
        );

        let sandbox = Arc::new(self.sandbox);
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

        let mut pool = DownloadPool::new(Arc::clone(&manager));
        pool.start().unwrap();

        Harness {
            _temp_dir: temp_dir,
            storage,
            source,
            sandbox,
            orchestrator,
            manager,
            _pool: pool,
        }
    }
}

impl Harness {
    pub async fn finish(&self, content_id: &str) -> BatchSessionView {
        tokio::time::timeout(
            Duration::from_secs(15),
            self.orchestrator.wait_for_idle(content_id),
        )
        .await
        .expect("session did not finish")
    }

    pub async fn is_stored(&self, content_id: &str, chapter: &str) -> bool {
        self.storage
            .is_chapter_downloaded(&ChapterKey::new(content_id, chapter))
            .await
    }
}
