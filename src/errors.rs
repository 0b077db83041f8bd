//! Error types for Chapter Fetcher
//!
//! This module defines the error types for every component of the download
//! engine. Errors are designed to be actionable: the classifier in
//! [`crate::app::classifier`] maps them onto a retry policy, and the CLI maps
//! them onto user-facing messages.

use std::path::PathBuf;
use thiserror::Error;

/// Chapter storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// Storage root not found or inaccessible
    #[error("Storage directory not accessible: {path}")]
    DirectoryNotAccessible { path: PathBuf },

    /// Chapter record index could not be read or written
    #[error("Chapter index corrupted: {reason}")]
    IndexCorrupted { reason: String },

    /// Hard quota rejected a write
    #[error("Storage quota exceeded. Used: {used} bytes, limit: {limit} bytes")]
    QuotaExceeded { used: u64, limit: u64 },

    /// Page write attempted for a chapter that was never started
    #[error("No transfer in progress for {content_id} chapter {chapter}")]
    ChapterNotStarted { content_id: String, chapter: String },

    /// No stored record for the chapter
    #[error("No stored chapter {chapter} for {content_id}")]
    ChapterNotFound { content_id: String, chapter: String },

    /// Finalization attempted before every page was present
    #[error("Chapter {chapter} of {content_id} is incomplete: {present}/{expected} pages")]
    IncompleteChapter {
        content_id: String,
        chapter: String,
        present: usize,
        expected: usize,
    },

    /// Malformed content hash
    #[error("Invalid content hash: {hash}. Expected MD5 hex string")]
    InvalidHash { hash: String },

    /// Page number outside the declared range
    #[error("Page {page} is out of range (chapter has {total} pages)")]
    PageOutOfRange { page: u32, total: usize },

    /// Atomic file operation failed
    #[error("Atomic file operation failed: could not move {temp_path} to {final_path}")]
    AtomicOperationFailed {
        temp_path: PathBuf,
        final_path: PathBuf,
    },

    /// Index serialization error
    #[error("Index serialization failed")]
    Serialization(#[from] serde_json::Error),

    /// I/O error during storage operations
    #[error("Storage I/O error")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Whether this error means the device or quota is out of room
    pub fn is_storage_full(&self) -> bool {
        match self {
            StorageError::QuotaExceeded { .. } => true,
            StorageError::Io(e) => e.kind() == std::io::ErrorKind::StorageFull,
            _ => false,
        }
    }
}

/// Token derivation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// The sandbox did not produce a stable token in time
    #[error("Token derivation timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    /// The sandbox reported a failure
    #[error("Token sandbox error: {reason}")]
    Sandbox { reason: String },

    /// The broker's drain task is gone
    #[error("Token broker is not running")]
    BrokerClosed,

    /// All attempts for a chapter were used up
    #[error("Token derivation failed after {attempts} attempts: {last_error}")]
    AttemptsExhausted { attempts: u32, last_error: String },

    /// The source refused the token it was handed
    #[error("Source rejected the access token (HTTP {status})")]
    Rejected { status: u16 },
}

impl TokenError {
    /// Timeouts and sandbox errors are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, TokenError::Timeout { .. } | TokenError::Sandbox { .. })
    }
}

/// Download and transfer errors
#[derive(Error, Debug)]
pub enum DownloadError {
    /// HTTP request error
    #[error("HTTP request failed")]
    Http(#[from] reqwest::Error),

    /// Connection-level failure reported by a collaborator
    #[error("Network error: {message}")]
    Network { message: String },

    /// Download timeout
    #[error("Download timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    /// Server returned error status
    #[error("Server error: HTTP {status}")]
    ServerError { status: u16 },

    /// Rate limit exceeded
    #[error("Rate limit exceeded. Server responded with HTTP 429")]
    RateLimitExceeded,

    /// Invalid URL provided
    #[error("Invalid URL: {url} - {error}")]
    InvalidUrl { url: String, error: String },

    /// Page list or page body could not be understood
    #[error("Malformed content: {reason}")]
    Parsing { reason: String },

    /// Storage has no room left
    #[error("Storage full. Used: {used} bytes, limit: {limit} bytes")]
    StorageFull { used: u64, limit: u64 },

    /// Some pages of the chapter could not be fetched
    #[error("{failed} of {total} pages failed to download")]
    IncompletePages { failed: usize, total: usize },

    /// Transfer was cancelled
    #[error("Download cancelled")]
    Cancelled,

    /// Token acquisition failed
    #[error(transparent)]
    Token(#[from] TokenError),

    /// Storage layer failure
    #[error(transparent)]
    Storage(StorageError),

    /// Repair needs the network
    #[error("Repair unavailable: {reason}")]
    RepairUnavailable { reason: String },

    /// A transfer with the same id is already running
    #[error("Transfer {id} is already active")]
    AlreadyActive { id: String },

    /// The queue no longer holds the item as admitted
    #[error("Transfer {id} is not admitted (status {status})")]
    NotAdmitted { id: String, status: String },

    /// Queue bookkeeping failed
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Maximum retries exceeded
    #[error("Maximum retry attempts ({max_retries}) exceeded for download")]
    MaxRetriesExceeded { max_retries: u32 },

    /// Invalid worker or manager configuration
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Generic error for other issues
    #[error("{0}")]
    Other(String),
}

impl From<StorageError> for DownloadError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::QuotaExceeded { used, limit } => DownloadError::StorageFull { used, limit },
            StorageError::Io(e) if e.kind() == std::io::ErrorKind::StorageFull => {
                DownloadError::StorageFull { used: 0, limit: 0 }
            }
            other => DownloadError::Storage(other),
        }
    }
}

/// Work queue errors
#[derive(Error, Debug)]
pub enum QueueError {
    /// Item with the same id is already queued or active
    #[error("Duplicate work item: {id} is already queued or active")]
    DuplicateItem { id: String },

    /// Work item not found in queue
    #[error("Work item not found: {id}")]
    WorkNotFound { id: String },

    /// Invalid status transition
    #[error("Invalid status transition for {id} from {from} to {to}")]
    InvalidStateTransition { id: String, from: String, to: String },

    /// Backlog persistence failure
    #[error("Queue backlog could not be persisted: {reason}")]
    Persistence { reason: String },

    /// Concurrency limit outside supported range
    #[error("Concurrency limit {value} outside supported range {min}..={max}")]
    InvalidConcurrency { value: usize, min: usize, max: usize },
}

/// Validation service errors
#[derive(Error, Debug)]
pub enum ValidationError {
    /// Chapter has no record to validate
    #[error("Chapter {chapter} of {content_id} is not downloaded")]
    NotDownloaded { content_id: String, chapter: String },

    /// Repair requested while the device is offline
    #[error("Repair unavailable: {reason}")]
    RepairUnavailable { reason: String },

    /// Storage failure while validating
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Page fetch failure during repair
    #[error(transparent)]
    Download(#[from] DownloadError),
}

/// Batch orchestration errors
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// A session for this content is already running
    #[error("A batch session for {content_id} is already active")]
    SessionActive { content_id: String },

    /// No session known for this content
    #[error("No batch session for {content_id}")]
    SessionNotFound { content_id: String },

    /// Nothing to retry
    #[error("Session for {content_id} has no failed chapters")]
    NothingToRetry { content_id: String },

    /// Selection produced no chapters
    #[error("Selection matched no chapters for {content_id}")]
    EmptySelection { content_id: String },

    /// Chapter list could not be resolved
    #[error(transparent)]
    Download(#[from] DownloadError),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    NotFound { path: PathBuf },

    /// Invalid configuration format
    #[error("Invalid configuration format")]
    InvalidFormat(#[from] toml::de::Error),

    /// Configuration could not be serialized
    #[error("Configuration serialization failed")]
    Serialize(#[from] toml::ser::Error),

    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {value}. {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    /// Configuration validation failed
    #[error("Configuration validation failed: {errors:?}")]
    ValidationFailed { errors: Vec<String> },
}

/// Top-level application error that can represent any error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Storage error
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Download error
    #[error(transparent)]
    Download(#[from] DownloadError),

    /// Queue error
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Token error
    #[error(transparent)]
    Token(#[from] TokenError),

    /// Validation error
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Orchestrator error
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Generic I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Generic application error with context
    #[error("Application error: {message}")]
    Generic { message: String },
}

impl AppError {
    /// Create a generic application error with a message
    pub fn generic(message: impl Into<String>) -> Self {
        Self::Generic {
            message: message.into(),
        }
    }

    /// Check if the error is recoverable (transient)
    pub fn is_recoverable(&self) -> bool {
        match self {
            AppError::Download(DownloadError::Timeout { .. })
            | AppError::Download(DownloadError::RateLimitExceeded)
            | AppError::Download(DownloadError::Network { .. })
            | AppError::Download(DownloadError::Http(_))
            | AppError::Download(DownloadError::IncompletePages { .. }) => true,
            AppError::Token(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            AppError::Storage(_) => "storage",
            AppError::Download(_) => "download",
            AppError::Queue(_) => "queue",
            AppError::Token(_) => "token",
            AppError::Validation(_) => "validation",
            AppError::Orchestrator(_) => "orchestrator",
            AppError::Config(_) => "config",
            AppError::Io(_) => "io",
            AppError::Generic { .. } => "generic",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, AppError>;

/// Storage result type alias
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Download result type alias
pub type DownloadResult<T> = std::result::Result<T, DownloadError>;

/// Queue result type alias
pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// Token result type alias
pub type TokenResult<T> = std::result::Result<T, TokenError>;

/// Validation result type alias
pub type ValidationResult<T> = std::result::Result<T, ValidationError>;

/// Orchestrator result type alias
pub type OrchestratorResult<T> = std::result::Result<T, OrchestratorError>;

/// Configuration result type alias
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
