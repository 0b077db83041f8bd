//! Command-line interface components
//!
//! This module contains CLI-specific code for the Chapter Fetcher application,
//! including argument parsing, engine startup, progress display, and the
//! command handlers.

pub mod args;
pub mod commands;
pub mod progress;
pub mod startup;

pub use args::{
    Cli, Commands, DownloadArgs, GlobalArgs, QueueAction, QueueArgs, StorageAction, StorageArgs,
    ValidateArgs,
};
pub use commands::{handle_download, handle_queue, handle_storage, handle_validate};
pub use progress::{ProgressConfig, ProgressDisplay, ProgressEvent};
pub use startup::{show_startup_status, validate_startup, Engine, StartupStatus};
