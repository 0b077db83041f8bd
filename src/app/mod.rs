//! Core application logic for Chapter Fetcher
//!
//! This module contains the download engine: the persistent queue, the
//! download manager and its worker pool, chapter storage, validation and
//! repair, the batch orchestrator, and the HTTP client for real sources.
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chapter_fetcher::app::{
//!     ChapterStorage, DownloadManager, DownloadPool, DownloadQueue, EventEmitter,
//!     ManagerConfig, QueueConfig, SourceClient, StorageConfig, ClientConfig, WorkItem,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let emitter = EventEmitter::new();
//! let storage = Arc::new(ChapterStorage::open(StorageConfig::default()).await?);
//! let queue = Arc::new(DownloadQueue::open(QueueConfig::default(), emitter.clone()).await?);
//! let client = Arc::new(SourceClient::new(&ClientConfig::default())?);
//!
//! let manager = Arc::new(DownloadManager::new(
//!     ManagerConfig::default(),
//!     queue,
//!     storage,
//!     client.clone(),
//!     client,
//!     emitter,
//! )?);
//! let mut pool = DownloadPool::new(Arc::clone(&manager));
//! pool.start()?;
//!
//! manager
//!     .queue()
//!     .enqueue(WorkItem::new("berserk", "Berserk", "1", "https://reader.test/berserk/1"))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod classifier;
pub mod client;
pub mod events;
pub mod hash;
pub mod maintenance;
pub mod manager;
pub mod models;
pub mod orchestrator;
pub mod queue;
pub mod sources;
pub mod storage;
pub mod validation;

// Re-export main public API
pub use classifier::{classify, Classification, ErrorContext, ErrorType, SuggestedAction};
pub use client::{ClientConfig, SourceClient};
pub use events::{DownloadEvent, DownloadEventKind, DownloadFailure, EventEmitter, Subscription};
pub use hash::Md5Hash;
pub use maintenance::{run_auto_cleanup, MaintenanceTasks};
pub use manager::{DownloadManager, DownloadPool, ManagerConfig, PageDownloader, PoolState};
pub use models::{
    ChapterKey, ChapterRecord, DownloadQuality, DownloadStatus, PageAsset, PageImage, Progress,
    WorkItem,
};
pub use orchestrator::{
    BatchOrchestrator, BatchSessionView, ChapterSelection, OrchestratorConfig, SessionStatus,
    TokenBroker,
};
pub use queue::{DownloadQueue, QueueConfig, QueueStatus};
pub use sources::{
    ChapterListing, Connectivity, NetworkMonitor, PageFetcher, PageListResolver, PollingSandbox,
    TokenObserver, TokenSandbox,
};
pub use storage::{ChapterStorage, CleanupResult, QuotaStatus, StorageConfig, StorageStats};
pub use validation::{RecommendedAction, ValidationOptions, ValidationReport, ValidationService};
