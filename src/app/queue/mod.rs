//! Download queue
//!
//! Persisted, priority-ordered backlog of chapter transfers and the single
//! admission point for the download manager.
//!
//! # Features
//!
//! - **Priority order**: lower priority values run sooner, ties broken by
//!   `added_at` and then insertion order
//! - **Concurrency gate**: at most `max_concurrent` (1..=5) items are
//!   `Downloading` at once
//! - **Pause/resume**: admission stops without discarding the backlog
//! - **Persistence**: the backlog is rewritten atomically after every change
//!   and items left `Downloading` by a crash are requeued on open
//! - **Events**: admission publishes `download_started`
//!
//! # Basic Usage
//!
//! ```rust,no_run
//! use chapter_fetcher::app::events::EventEmitter;
//! use chapter_fetcher::app::models::WorkItem;
//! use chapter_fetcher::app::queue::{DownloadQueue, QueueConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let queue = DownloadQueue::open(QueueConfig::default(), EventEmitter::new()).await?;
//! queue
//!     .enqueue(WorkItem::new("berserk", "Berserk", "1", "https://example.com/berserk/1"))
//!     .await?;
//!
//! while let Some(item) = queue.dequeue_next().await? {
//!     // hand the item to a download manager...
//!     queue.mark_completed(&item.id).await?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Module Organization
//!
//! - [`config`] - Queue configuration and validation
//! - [`state`] - Lock-free internal state and counters
//! - [`store`] - JSON backlog persistence
//! - [`core`] - The [`DownloadQueue`] itself

pub mod config;
pub mod core;
pub mod state;
pub mod store;

pub use config::QueueConfig;
pub use core::DownloadQueue;
pub use state::{QueueEntry, QueueState, QueueStatus};
pub use store::QueueStore;
