//! Batch download orchestrator
//!
//! Drives one batch session per content item: chapter selection, token
//! acquisition through the shared sandbox, queueing, and a session view that
//! subscribers receive on every change.
//!
//! # Key Features
//!
//! - **Deterministic selection**: all, up to a chapter, or an inclusive range,
//!   sorted by chapter number with duplicates removed
//! - **Single-flight tokens**: one derivation runs at a time across every
//!   session, bounded by a hard timeout and retried a fixed number of times
//! - **Token cache**: bounded, case-insensitive and expiring
//! - **Failure isolation**: a failed chapter lands in `failed_chapters`
//!   without stopping the rest of the batch, and can be retried on its own
//! - **Storage full**: reported with its own message as soon as it happens
//!
//! # Module Organization
//!
//! - [`config`] - Orchestrator tunables
//! - [`selection`] - Chapter selection predicates
//! - [`broker`] - Token broker and token cache
//! - [`session`] - Session entity, state machine and view
//! - [`core`] - The [`BatchOrchestrator`]
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chapter_fetcher::app::orchestrator::{BatchOrchestrator, ChapterSelection};
//!
//! # async fn example(orchestrator: Arc<BatchOrchestrator>) -> Result<(), Box<dyn std::error::Error>> {
//! let _watch = orchestrator.subscribe_state("berserk", |view| {
//!     println!("{}: {}%", view.message, view.progress_percent);
//! });
//! orchestrator
//!     .start_batch_download("berserk", ChapterSelection::range(1.0, 10.0))
//!     .await?;
//! let done = orchestrator.wait_for_idle("berserk").await;
//! println!("{}", done.message);
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod core;
pub mod selection;
pub mod session;

#[cfg(test)]
mod tests;

pub use broker::{TokenBroker, TokenCache};
pub use config::OrchestratorConfig;
pub use core::{BatchOrchestrator, StateSubscription};
pub use selection::ChapterSelection;
pub use session::{BatchSession, BatchSessionView, ChapterPhase, SessionStatus};
