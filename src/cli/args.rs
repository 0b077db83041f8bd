//! Command-line argument parsing for Chapter Fetcher
//!
//! This module defines the CLI structure using clap derive macros, providing
//! batch downloads with chapter selection, storage management, chapter
//! validation with repair, and queue inspection.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::app::models::DownloadQuality;
use crate::app::orchestrator::ChapterSelection;
use crate::constants::{queue, storage};

/// Chapter Fetcher - download chaptered image content for offline reading
#[derive(Parser, Debug)]
#[command(
    name = "chapter_fetcher",
    version,
    about = "Download chapters for offline reading",
    long_about = "Downloads chaptered, paginated image content into local storage.
Features a persistent download queue, resumable transfers, storage quotas and integrity checks."
)]
pub struct Cli {
    /// Global options
    #[command(flatten)]
    pub global: GlobalArgs,

    /// Subcommands
    #[command(subcommand)]
    pub command: Commands,
}

/// Global arguments available to all subcommands
#[derive(Args, Debug)]
pub struct GlobalArgs {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Very verbose logging (debug level)
    #[arg(long, global = true)]
    pub very_verbose: bool,

    /// Quiet mode - suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Configuration file path
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Storage directory path
    #[arg(long, global = true, value_name = "DIR")]
    pub storage_dir: Option<PathBuf>,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Download chapters of a content item
    Download(DownloadArgs),

    /// Inspect and manage local storage
    Storage(StorageArgs),

    /// Check a downloaded chapter and optionally repair it
    Validate(ValidateArgs),

    /// Inspect the persisted download queue
    Queue(QueueArgs),
}

/// Arguments for the download command
#[derive(Args, Debug, Clone)]
pub struct DownloadArgs {
    /// Content identifier at the source
    #[arg(value_name = "CONTENT")]
    pub content_id: String,

    /// Download every chapter up to and including N
    #[arg(long, value_name = "N", conflicts_with = "range")]
    pub up_to: Option<f64>,

    /// Download chapters A through B inclusive
    #[arg(long, num_args = 2, value_names = ["A", "B"])]
    pub range: Option<Vec<f64>>,

    /// Fetch compressed page images
    #[arg(long)]
    pub compressed: bool,

    /// Chapters downloaded at the same time (1-5)
    #[arg(short = 'j', long, value_name = "N")]
    pub concurrent: Option<usize>,
}

/// Arguments for storage management
#[derive(Args, Debug)]
pub struct StorageArgs {
    #[command(subcommand)]
    pub action: StorageAction,
}

/// Storage management actions
#[derive(Subcommand, Debug)]
pub enum StorageAction {
    /// Show usage and quota
    Stats,

    /// List stored chapters
    List {
        /// Only chapters of this content item
        #[arg(value_name = "CONTENT")]
        content_id: Option<String>,
    },

    /// Delete chapters downloaded more than D days ago
    Cleanup {
        /// Age in days: 7, 14, 30, 60 or 90
        #[arg(long, value_name = "D")]
        days: u32,
    },

    /// Delete one stored chapter
    Delete {
        #[arg(value_name = "CONTENT")]
        content_id: String,
        #[arg(value_name = "CHAPTER")]
        chapter: String,
    },
}

/// Arguments for the validate command
#[derive(Args, Debug, Clone)]
pub struct ValidateArgs {
    #[arg(value_name = "CONTENT")]
    pub content_id: String,

    #[arg(value_name = "CHAPTER")]
    pub chapter: String,

    /// Refetch damaged pages
    #[arg(long)]
    pub repair: bool,
}

/// Arguments for queue inspection
#[derive(Args, Debug)]
pub struct QueueArgs {
    #[command(subcommand)]
    pub action: QueueAction,
}

/// Queue actions
#[derive(Subcommand, Debug)]
pub enum QueueAction {
    /// Show queue counts and unfinished items
    Status,
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Log level forced by flags, if any
    pub fn log_level(&self) -> Option<tracing::Level> {
        if self.global.quiet {
            Some(tracing::Level::ERROR)
        } else if self.global.very_verbose {
            Some(tracing::Level::DEBUG)
        } else if self.global.verbose {
            Some(tracing::Level::INFO)
        } else {
            None
        }
    }

    /// Filter directive for this crate, falling back to the configured level
    pub fn log_directive(&self, configured: &str) -> String {
        let level = self
            .log_level()
            .map(|level| level.to_string().to_lowercase())
            .unwrap_or_else(|| configured.to_lowercase());
        format!("chapter_fetcher={}", level)
    }
}

impl DownloadArgs {
    /// Check argument combinations clap cannot express
    pub fn validate(&self) -> Result<(), String> {
        if let Some(n) = self.up_to {
            if !n.is_finite() || n < 0.0 {
                return Err(format!("--up-to must be a non-negative number, got {}", n));
            }
        }

        if let Some(range) = &self.range {
            if range.iter().any(|v| !v.is_finite()) {
                return Err("--range bounds must be numbers".to_string());
            }
        }

        if let Some(concurrent) = self.concurrent {
            if !(queue::MIN_CONCURRENT..=queue::MAX_CONCURRENT).contains(&concurrent) {
                return Err(format!(
                    "--concurrent must be between {} and {}",
                    queue::MIN_CONCURRENT,
                    queue::MAX_CONCURRENT
                ));
            }
        }

        Ok(())
    }

    /// Chapter selection described by the flags
    pub fn selection(&self) -> ChapterSelection {
        match (self.up_to, self.range.as_deref()) {
            (Some(n), _) => ChapterSelection::UpTo(n),
            (None, Some([start, end])) => ChapterSelection::range(*start, *end),
            _ => ChapterSelection::All,
        }
    }

    /// Quality override, if any
    pub fn quality(&self) -> Option<DownloadQuality> {
        self.compressed.then_some(DownloadQuality::Compressed)
    }
}

/// Check a cleanup age against the allowed values
pub fn validate_cleanup_days(days: u32) -> Result<u32, String> {
    if storage::AUTO_CLEANUP_DAYS.contains(&days) {
        Ok(days)
    } else {
        Err(format!(
            "--days must be one of {:?}, got {}",
            storage::AUTO_CLEANUP_DAYS,
            days
        ))
    }
}
