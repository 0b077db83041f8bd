//! Chapter Fetcher Library
//!
//! Offline download and storage engine for chaptered, paginated image content.
//! Provides a persistent download queue with bounded concurrency, resumable
//! page transfers, content-addressed storage with quota management, integrity
//! validation with repair, and batch orchestration with single-flight token
//! derivation.

pub mod app;
pub mod cli;
pub mod config;
pub mod constants;
pub mod errors;

// Re-export commonly used types for convenience
pub use errors::{AppError, Result};
