//! Chapter storage service
//!
//! Durable, content-addressed storage of per-chapter page images plus the
//! chapter record index, quota accounting and age-based eviction.
//!
//! # Key Features
//!
//! - **Atomic writes**: every page and the index go through temp file + rename
//! - **Finalization barrier**: pages are staged in any order; a chapter record
//!   appears only once all pages are present
//! - **Resumable**: staged pages survive pause, failure and process restart
//! - **Soft quota**: usage is classified against a warning threshold; a hard
//!   pre-write check can be switched on
//! - **Eviction**: oldest-first cleanup by age, interruptible
//!
//! # Module Organization
//!
//! - [`config`] - Configuration types and defaults
//! - [`path`] - On-disk layout, image sniffing and atomic writes
//! - [`index`] - Persisted chapter record index
//! - [`stats`] - Derived statistics and quota classification
//! - [`manager`] - The [`ChapterStorage`] service
//!
//! # Examples
//!
//! ```rust,no_run
//! use chapter_fetcher::app::models::ChapterKey;
//! use chapter_fetcher::app::storage::{ChapterStorage, StorageConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = ChapterStorage::open(StorageConfig::default()).await?;
//! let key = ChapterKey::new("berserk", "1");
//!
//! if storage.is_chapter_downloaded(&key).await {
//!     let pages = storage.get_chapter_images(&key).await;
//!     println!("{:?}", pages);
//! }
//! println!("{}", storage.quota_status().await);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod index;
pub mod manager;
pub mod path;
pub mod stats;

pub use config::StorageConfig;
pub use manager::ChapterStorage;
pub use path::{write_atomic, ImageFormat, StorageLayout};
pub use stats::{format_bytes, CleanupResult, QuotaStatus, StorageStats};
