//! Download manager
//!
//! Executes chapter transfers admitted by the [`DownloadQueue`]: resolves the
//! page list through a [`PageListResolver`], fetches pages through a
//! [`PageFetcher`] with classifier-driven retry, stages them in
//! [`ChapterStorage`] and publishes `download_progress`, `download_completed`,
//! `download_failed`, `download_paused` and `download_cancelled` events.
//!
//! # Key Features
//!
//! - **Resumable**: pausing keeps staged pages and progress; resuming only
//!   fetches what is missing and byte counters never go backwards
//! - **Cancellable**: cancellation is cooperative between page operations and
//!   discards staged pages, so no partial chapter record ever appears
//! - **Page-level failures**: a page that cannot be fetched is counted in
//!   `failed_pages`; the chapter only fails once its pages are settled
//! - **Storage full**: aborts the transfer immediately with a dedicated error
//! - **Throttled progress**: events are rate limited and the speed is an
//!   exponentially weighted average
//!
//! # Module Organization
//!
//! - [`config`] - Manager tunables and validation
//! - [`control`] - Cooperative pause/cancel flag
//! - [`progress`] - Progress, speed and ETA tracking
//! - [`page`] - Page fetching with timeout and retry
//! - [`core`] - The [`DownloadManager`]
//! - [`pool`] - Dispatcher draining queue admissions into transfers
//!
//! [`DownloadQueue`]: crate::app::queue::DownloadQueue
//! [`PageListResolver`]: crate::app::sources::PageListResolver
//! [`PageFetcher`]: crate::app::sources::PageFetcher
//! [`ChapterStorage`]: crate::app::storage::ChapterStorage

pub mod config;
pub mod control;
pub mod core;
pub mod page;
pub mod pool;
pub mod progress;


pub use config::ManagerConfig;
pub use control::{TransferControl, TransferSignal};
pub use core::{DownloadManager, TransferHandle, TransferOutcome};
pub use page::{check_page_body, PageDownloader};
pub use pool::{DownloadPool, PoolState};
pub use progress::{ProgressTracker, SpeedCalculator};
