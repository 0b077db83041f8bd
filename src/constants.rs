//! Application constants for Chapter Fetcher
//!
//! This module centralizes the constants used throughout the engine,
//! organized by functional domain.

use std::time::Duration;

/// Environment variable names
pub mod env {
    /// Overrides the storage root directory
    pub const STORAGE_ROOT: &str = "CHAPTER_FETCHER_STORAGE_ROOT";

    /// Overrides the content source base URL
    pub const SOURCE_URL: &str = "CHAPTER_FETCHER_SOURCE_URL";
}

/// HTTP client configuration constants
pub mod http {
    use super::Duration;

    /// Default user agent for all HTTP requests
    pub const USER_AGENT: &str = "Chapter-Fetcher/0.1.0 (Offline Reader)";

    /// Default HTTP request timeout
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

    /// Connection establishment timeout
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Default rate limit for source requests (requests per second)
    pub const DEFAULT_RATE_LIMIT_RPS: u32 = 8;

    /// Jitter added when waiting on the rate limiter
    pub const RATE_LIMIT_JITTER: Duration = Duration::from_millis(100);

    /// Maximum idle connections kept per host
    pub const POOL_MAX_PER_HOST: usize = 8;

    /// Idle connection lifetime
    pub const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

    /// Source API used when none is configured
    pub const DEFAULT_SOURCE_URL: &str = "http://localhost:8080/api/";
}

/// Download queue constants
pub mod queue {
    /// Smallest allowed concurrency limit
    pub const MIN_CONCURRENT: usize = 1;

    /// Largest allowed concurrency limit
    pub const MAX_CONCURRENT: usize = 5;

    /// Default concurrency limit
    pub const DEFAULT_CONCURRENT: usize = 2;

    /// Default priority for work items (lower runs sooner)
    pub const DEFAULT_PRIORITY: u32 = 100;

    /// Backlog file name inside the storage root
    pub const BACKLOG_FILE: &str = "backlog.json";
}

/// Download manager constants
pub mod downloads {
    use super::Duration;

    /// Maximum fetch attempts per page
    pub const MAX_PAGE_ATTEMPTS: u32 = 3;

    /// Base delay for page retry backoff
    pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

    /// Maximum retry delay (backoff cap)
    pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(30);

    /// Pages fetched concurrently within a single chapter
    pub const PAGE_CONCURRENCY: usize = 3;

    /// Minimum interval between progress events for one transfer
    pub const PROGRESS_EMIT_INTERVAL: Duration = Duration::from_millis(250);

    /// Smoothing factor for the speed moving average
    pub const SPEED_EWMA_ALPHA: f64 = 0.3;

    /// Timeout for a single page fetch
    pub const PAGE_TIMEOUT: Duration = Duration::from_secs(45);

    /// Jitter applied to retry delays (fraction of the delay)
    pub const RETRY_JITTER: f64 = 0.1;

    /// Growth factor between consecutive retry delays
    pub const BACKOFF_MULTIPLIER: u32 = 2;

    /// Attempt cap for failures that could not be classified
    pub const UNKNOWN_MAX_ATTEMPTS: u32 = 2;

    /// Pause of the dispatcher after a queue error
    pub const DISPATCH_ERROR_SLEEP: Duration = Duration::from_secs(1);
}

/// Storage constants
pub mod storage {
    /// Current on-disk chapter format version
    pub const FORMAT_VERSION: u32 = 1;

    /// Chapter record index file name
    pub const INDEX_FILE: &str = "records.json";

    /// Directory for finalized chapters
    pub const CHAPTERS_DIR: &str = "chapters";

    /// Directory for chapters still being assembled
    pub const STAGING_DIR: &str = "staging";

    /// Suffix for temporary files before atomic rename
    pub const TEMP_FILE_SUFFIX: &str = ".part";

    /// Default maximum storage size (2 GiB)
    pub const DEFAULT_MAX_STORAGE_SIZE: u64 = 2 * 1024 * 1024 * 1024;

    /// Default warning threshold in percent
    pub const DEFAULT_WARNING_THRESHOLD: u8 = 85;

    /// Allowed auto cleanup ages in days
    pub const AUTO_CLEANUP_DAYS: [u32; 5] = [7, 14, 30, 60, 90];

    /// Default auto cleanup age in days
    pub const DEFAULT_AUTO_CLEANUP_DAYS: u32 = 30;

    /// How often the auto cleanup task runs
    pub const AUTO_CLEANUP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(6 * 3600);
}

/// Token derivation constants
pub mod tokens {
    use super::Duration;

    /// Hard timeout for a single derivation session
    pub const DERIVATION_TIMEOUT: Duration = Duration::from_secs(25);

    /// Retries after the first failed attempt for one chapter
    pub const MAX_RETRIES: u32 = 2;

    /// How long a derived token stays usable
    pub const CACHE_TTL: Duration = Duration::from_secs(10 * 60);

    /// Maximum cached tokens per session
    pub const CACHE_CAPACITY: usize = 64;

    /// Consecutive identical polls before a token counts as stable
    pub const STABLE_POLLS: u32 = 2;

    /// Interval between sandbox polls
    pub const POLL_INTERVAL: Duration = Duration::from_millis(500);
}

/// Validation scoring constants
pub mod validation {
    /// Score deducted for each missing page
    pub const MISSING_PAGE_WEIGHT: u32 = 10;

    /// Score deducted for each page failing a sanity check
    pub const CORRUPT_PAGE_WEIGHT: u32 = 5;

    /// Smallest plausible image size in bytes
    pub const MIN_PAGE_BYTES: u64 = 64;

    /// Fraction of damaged pages above which a full redownload is advised
    pub const REDOWNLOAD_RATIO: f64 = 0.5;
}

/// Event emitter constants
pub mod events {
    /// Event name for admission into the queue
    pub const DOWNLOAD_STARTED: &str = "download_started";

    /// Event name for progress samples
    pub const DOWNLOAD_PROGRESS: &str = "download_progress";

    /// Event name for successful completion
    pub const DOWNLOAD_COMPLETED: &str = "download_completed";

    /// Event name for failures
    pub const DOWNLOAD_FAILED: &str = "download_failed";

    /// Event name for cancellation
    pub const DOWNLOAD_CANCELLED: &str = "download_cancelled";

    /// Event name for pauses
    pub const DOWNLOAD_PAUSED: &str = "download_paused";
}

/// Configuration file locations
pub mod config {
    /// Application directory name under the OS config dir
    pub const APP_DIR: &str = "chapter-fetcher";

    /// Project-local config file
    pub const LOCAL_CONFIG_FILE: &str = "chapter-fetcher.toml";

    /// Config file name inside the app dir
    pub const CONFIG_FILE: &str = "config.toml";
}
