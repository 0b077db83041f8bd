//! Startup checks and engine assembly for Chapter Fetcher
//!
//! This module opens storage and the persisted queue, reports what a previous
//! run left behind, and wires the full download engine (manager, pool, token
//! broker, orchestrator, validation and maintenance) from an [`AppConfig`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::app::client::SourceClient;
use crate::app::events::EventEmitter;
use crate::app::maintenance::MaintenanceTasks;
use crate::app::manager::{DownloadManager, DownloadPool};
use crate::app::orchestrator::{BatchOrchestrator, TokenBroker};
use crate::app::queue::{DownloadQueue, QueueStatus};
use crate::app::sources::{NetworkMonitor, PollingSandbox};
use crate::app::storage::{ChapterStorage, QuotaStatus};
use crate::app::validation::ValidationService;
use crate::config::AppConfig;
use crate::constants::storage::AUTO_CLEANUP_INTERVAL;
use crate::errors::{AppError, Result};

/// Results of startup checks
#[derive(Debug, Clone)]
pub struct StartupStatus {
    /// Resolved storage directory
    pub storage_root: PathBuf,
    /// Quota level at startup
    pub quota: QuotaStatus,
    /// Whether new writes are allowed under the configured quota policy
    pub accepts_writes: bool,
    /// Queue counts after crash recovery
    pub queue: QueueStatus,
}

impl StartupStatus {
    /// Check if downloads can start
    pub fn is_ready(&self) -> bool {
        self.accepts_writes
    }

    /// Number of items a previous run left unfinished
    pub fn recovered_items(&self) -> usize {
        self.queue.queued_count + self.queue.paused_count
    }

    /// Get a summary message for display
    pub fn summary(&self) -> String {
        if !self.is_ready() {
            return format!("⚠️  Storage full: {}", self.quota);
        }
        match self.recovered_items() {
            0 => "✅ System ready for downloads".to_string(),
            n => format!("✅ System ready, {} unfinished downloads resumed", n),
        }
    }
}

/// Open chapter storage with the configured root
pub async fn open_storage(config: &AppConfig) -> Result<Arc<ChapterStorage>> {
    let storage = ChapterStorage::open(config.storage_config()).await?;
    debug!("Storage opened at {}", storage.root().display());
    Ok(Arc::new(storage))
}

/// Open the persisted queue next to `storage_root`
pub async fn open_queue(
    config: &AppConfig,
    storage_root: &Path,
    emitter: EventEmitter,
) -> Result<Arc<DownloadQueue>> {
    let queue = DownloadQueue::open(config.queue_config(storage_root), emitter).await?;
    Ok(Arc::new(queue))
}

/// Check storage and queue before downloading
pub async fn validate_startup(storage: &ChapterStorage, queue: &DownloadQueue) -> StartupStatus {
    let quota = storage.quota_status().await;
    let accepts_writes =
        !(storage.config().enforce_hard_quota && matches!(quota, QuotaStatus::Exceeded { .. }));
    let status = StartupStatus {
        storage_root: storage.root().to_path_buf(),
        quota,
        accepts_writes,
        queue: queue.status().await,
    };

    if status.quota.is_warning() {
        warn!("Storage quota {}", status.quota);
    }
    if status.recovered_items() > 0 {
        info!(
            "Recovered {} unfinished items from the previous run",
            status.recovered_items()
        );
    }
    status
}

/// Show startup status and recommendations
pub fn show_startup_status(status: &StartupStatus) {
    println!();
    println!("🚀 Chapter Fetcher Startup Status");
    println!("================================");
    println!("📁 Storage: {}", status.storage_root.display());
    println!("💾 Quota: {}", status.quota);
    if status.quota.is_warning() {
        println!("   Run: chapter_fetcher storage cleanup --days 30");
    }
    println!(
        "📋 Queue: {} queued, {} paused, {} failed",
        status.queue.queued_count, status.queue.paused_count, status.queue.failed_count
    );
    println!();
    println!("Overall: {}", status.summary());
    println!();
}

/// The assembled download engine
pub struct Engine {
    pub config: AppConfig,
    pub emitter: EventEmitter,
    pub storage: Arc<ChapterStorage>,
    pub manager: Arc<DownloadManager>,
    pub orchestrator: Arc<BatchOrchestrator>,
    pub validation: ValidationService,
    pub status: StartupStatus,
    pool: DownloadPool,
    maintenance: MaintenanceTasks,
    broker_task: JoinHandle<()>,
}

impl Engine {
    /// Build every component and start the pool and maintenance tasks
    pub async fn start(config: AppConfig) -> Result<Self> {
        let emitter = EventEmitter::new();
        let storage = open_storage(&config).await?;
        let queue = open_queue(&config, storage.root(), emitter.clone()).await?;
        // transfers paused by the previous shutdown continue in this run
        queue.resume_paused().await?;
        let status = validate_startup(&storage, &queue).await;

        let client = Arc::new(SourceClient::new(&config.client_config())?);
        info!("Using source {}", client.base_url());

        let manager = Arc::new(DownloadManager::new(
            config.manager_config(),
            queue,
            Arc::clone(&storage),
            client.clone(),
            client.clone(),
            emitter.clone(),
        )?);

        let sandbox = PollingSandbox::new(Arc::clone(&client))
            .with_stable_polls(config.tokens.stable_polls)
            .with_poll_interval(config.tokens.poll_interval);
        let (broker, broker_task) = TokenBroker::spawn(Arc::new(sandbox), config.tokens.timeout);

        let orchestrator = Arc::new(BatchOrchestrator::new(
            config.orchestrator_config(),
            Arc::clone(&manager),
            client,
            broker,
            &emitter,
        )?);

        let validation = ValidationService::new(
            Arc::clone(&storage),
            manager.page_downloader().clone(),
            Arc::new(NetworkMonitor::default()),
        );

        let mut pool = DownloadPool::new(Arc::clone(&manager));
        pool.start()?;

        let mut maintenance = MaintenanceTasks::new();
        if maintenance.start_auto_cleanup(Arc::clone(&storage), AUTO_CLEANUP_INTERVAL) {
            info!(
                "Auto cleanup enabled for chapters older than {} days",
                config.storage.auto_cleanup_days
            );
        }

        Ok(Self {
            config,
            emitter,
            storage,
            manager,
            orchestrator,
            validation,
            status,
            pool,
            maintenance,
            broker_task,
        })
    }

    /// Stop background work, pausing transfers that are still running
    pub async fn shutdown(self) -> Result<()> {
        self.maintenance.shutdown().await;
        let pool_result = self.pool.pause_and_shutdown().await;
        self.broker_task.abort();
        pool_result.map_err(AppError::from)
    }
}
