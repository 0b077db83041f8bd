//! Real-time progress display for batch downloads
//!
//! This module renders orchestrator session views and per-chapter transfer
//! events with indicatif. Session and event callbacks run synchronously inside
//! the engine, so they only push a [`ProgressEvent`] into a channel; a
//! background task owns the bars and applies the events in order.
//!
//! # Key Features
//!
//! - **Multi-bar Display**: one bar for the batch, one per active chapter
//! - **Text Fallback**: plain status lines when stderr is not a terminal
//! - **Session Messages**: the orchestrator's message (token waits, storage
//!   full, summary) follows the batch bar
//!
//! # Examples
//!
//! ```rust,no_run
//! use chapter_fetcher::app::orchestrator::BatchSessionView;
//! use chapter_fetcher::cli::{ProgressConfig, ProgressDisplay, ProgressEvent};
//!
//! # async fn example(view: BatchSessionView) -> Result<(), Box<dyn std::error::Error>> {
//! let mut display = ProgressDisplay::new(ProgressConfig::default());
//! display.start(&view).await?;
//!
//! display.update(ProgressEvent::Session(view.clone()))?;
//!
//! display.finish(&view).await?;
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::app::events::{DownloadEvent, DownloadEventKind};
use crate::app::orchestrator::BatchSessionView;
use crate::errors::{DownloadError, DownloadResult};

/// Configuration for progress display
#[derive(Debug, Clone)]
pub struct ProgressConfig {
    /// Enable visual progress bars
    pub enable_progress_bars: bool,
    /// Show a bar for each active chapter
    pub show_chapter_details: bool,
    /// Maximum width for chapter labels in the display
    pub max_label_width: usize,
    /// Spinner tick interval
    pub tick_interval: Duration,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            enable_progress_bars: true,
            show_chapter_details: true,
            max_label_width: 32,
            tick_interval: Duration::from_millis(120),
        }
    }
}

/// Events that can update the progress display
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// New snapshot of the batch session
    Session(BatchSessionView),
    /// Transfer event of one chapter
    Chapter(DownloadEvent),
}

/// What the display has seen so far
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DisplayState {
    pub total_chapters: usize,
    pub completed: HashSet<String>,
    pub failed: HashSet<String>,
    /// Page percent of chapters still transferring
    pub active: HashMap<String, u8>,
    pub message: String,
}

impl DisplayState {
    /// Apply one event and return the line text mode should print, if any
    pub fn apply(&mut self, event: &ProgressEvent) -> Option<String> {
        match event {
            ProgressEvent::Session(view) => {
                self.total_chapters = view.planned_chapters.len();
                if view.message != self.message {
                    self.message = view.message.clone();
                    return Some(view.message.clone());
                }
                None
            }
            ProgressEvent::Chapter(event) => {
                let chapter = event.key.chapter.clone();
                match &event.kind {
                    DownloadEventKind::Started => {
                        self.active.insert(chapter.clone(), 0);
                        Some(format!("Chapter {} started", chapter))
                    }
                    DownloadEventKind::Progress(progress) => {
                        self.active.insert(chapter, progress.percent);
                        None
                    }
                    DownloadEventKind::Completed => {
                        self.active.remove(&chapter);
                        self.failed.remove(&chapter);
                        self.completed.insert(chapter.clone());
                        Some(format!("Chapter {} completed", chapter))
                    }
                    DownloadEventKind::Failed(failure) => {
                        self.active.remove(&chapter);
                        self.failed.insert(chapter.clone());
                        Some(format!("Chapter {} failed: {}", chapter, failure.message))
                    }
                    DownloadEventKind::Cancelled => {
                        self.active.remove(&chapter);
                        Some(format!("Chapter {} cancelled", chapter))
                    }
                    DownloadEventKind::Paused => {
                        self.active.remove(&chapter);
                        Some(format!("Chapter {} paused", chapter))
                    }
                }
            }
        }
    }
}

/// Shorten a label to `width` characters, keeping its end
pub fn truncate_label(label: &str, width: usize) -> String {
    let count = label.chars().count();
    if count <= width || width <= 3 {
        return label.to_string();
    }
    let tail: String = label.chars().skip(count - (width - 3)).collect();
    format!("...{}", tail)
}

/// Lines of the final summary for a finished session
pub fn summary_lines(view: &BatchSessionView) -> Vec<String> {
    let mut lines = vec![
        format!("  Content: {} ({})", view.title, view.content_id),
        format!("  Planned: {}", view.planned_chapters.len()),
        format!("  Completed: {}", view.completed_chapters),
        format!("  Failed: {}", view.failed_chapters.len()),
    ];
    if !view.failed_chapters.is_empty() {
        lines.push(format!("  Failed chapters: {}", view.failed_chapters.join(", ")));
    }
    if let (Some(start), Some(end)) = (view.started_at, view.last_updated_at) {
        let secs = (end - start).num_milliseconds().max(0) as f64 / 1000.0;
        lines.push(format!("  Duration: {:.1}s", secs));
    }
    lines
}

/// Main progress display manager
pub struct ProgressDisplay {
    config: ProgressConfig,
    multi_progress: Option<MultiProgress>,
    main_progress: Option<ProgressBar>,
    state: Arc<RwLock<DisplayState>>,
    update_task: Option<JoinHandle<()>>,
    event_tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    is_terminal: bool,
}

impl ProgressDisplay {
    /// Create a new progress display with the given configuration
    pub fn new(config: ProgressConfig) -> Self {
        let is_terminal = atty::is(atty::Stream::Stderr);

        Self {
            config,
            multi_progress: None,
            main_progress: None,
            state: Arc::new(RwLock::new(DisplayState::default())),
            update_task: None,
            event_tx: None,
            shutdown_tx: None,
            is_terminal,
        }
    }

    fn uses_bars(&self) -> bool {
        self.config.enable_progress_bars && self.is_terminal
    }

    /// Start the display for a freshly started session
    ///
    /// # Errors
    ///
    /// Returns `DownloadError` if a bar template is invalid
    pub async fn start(&mut self, view: &BatchSessionView) -> DownloadResult<()> {
        {
            let mut state = self.state.write().await;
            state.total_chapters = view.planned_chapters.len();
            state.message = view.message.clone();
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        if self.uses_bars() {
            let multi = MultiProgress::new();
            let main_pb = multi.add(ProgressBar::new(view.planned_chapters.len() as u64));
            main_pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                    .map_err(|e| DownloadError::Other(format!("Progress bar template error: {}", e)))?
                    .progress_chars("##-"),
            );
            main_pb.set_message(view.message.clone());
            main_pb.enable_steady_tick(self.config.tick_interval);

            self.multi_progress = Some(multi.clone());
            self.main_progress = Some(main_pb.clone());
            self.update_task = Some(self.spawn_bar_task(multi, main_pb, event_rx, shutdown_rx)?);
        } else {
            eprintln!(
                "Starting download of {} chapters of {}...",
                view.planned_chapters.len(),
                view.content_id
            );
            self.update_task = Some(self.spawn_text_task(event_rx, shutdown_rx));
        }

        self.event_tx = Some(event_tx);
        self.shutdown_tx = Some(shutdown_tx);
        debug!(
            "Progress display started for {} chapters",
            view.planned_chapters.len()
        );
        Ok(())
    }

    /// Sender usable from synchronous callbacks
    pub fn sender(&self) -> Option<mpsc::UnboundedSender<ProgressEvent>> {
        self.event_tx.clone()
    }

    /// Update the progress display with an event
    pub fn update(&self, event: ProgressEvent) -> DownloadResult<()> {
        if let Some(tx) = &self.event_tx {
            tx.send(event).map_err(|e| {
                DownloadError::Other(format!("Failed to send progress event: {}", e))
            })?;
        }
        Ok(())
    }

    /// Snapshot of what has been displayed
    pub async fn state(&self) -> DisplayState {
        self.state.read().await.clone()
    }

    /// Finish the progress display and print the summary
    pub async fn finish(&mut self, view: &BatchSessionView) -> DownloadResult<()> {
        debug!("Finishing progress display");

        // Drain whatever the callbacks already queued
        self.event_tx = None;
        if let Some(task) = self.update_task.take() {
            let drained = tokio::time::timeout(Duration::from_secs(2), task).await;
            if drained.is_err() {
                if let Some(tx) = &self.shutdown_tx {
                    let _ = tx.send(());
                }
            }
        }

        if let Some(main_pb) = self.main_progress.take() {
            main_pb.set_position(view.completed_chapters as u64);
            main_pb.finish_with_message(view.message.clone());
        }
        self.multi_progress = None;

        eprintln!("\n📊 Download Summary:");
        for line in summary_lines(view) {
            eprintln!("{}", line);
        }
        if view.storage_full {
            eprintln!("⚠️  {}", view.message);
        } else if !view.failed_chapters.is_empty() {
            eprintln!("⚠️  Some chapters failed to download. Run the command again to retry them.");
        }

        Ok(())
    }

    fn spawn_bar_task(
        &self,
        multi: MultiProgress,
        main_pb: ProgressBar,
        mut event_rx: mpsc::UnboundedReceiver<ProgressEvent>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> DownloadResult<JoinHandle<()>> {
        let chapter_style = ProgressStyle::default_bar()
            .template("  Chapter {prefix}: [{bar:30.blue}] {pos}%")
            .map_err(|e| DownloadError::Other(format!("Chapter progress template error: {}", e)))?
            .progress_chars("=>-");
        let state = Arc::clone(&self.state);
        let show_chapters = self.config.show_chapter_details;
        let label_width = self.config.max_label_width;

        Ok(tokio::spawn(async move {
            let mut chapter_bars: HashMap<String, ProgressBar> = HashMap::new();
            loop {
                tokio::select! {
                    event = event_rx.recv() => {
                        let Some(event) = event else {
                            debug!("Progress event channel closed");
                            break;
                        };
                        let mut state = state.write().await;
                        state.apply(&event);

                        match &event {
                            ProgressEvent::Session(view) => {
                                main_pb.set_length(view.planned_chapters.len() as u64);
                                main_pb.set_message(view.message.clone());
                            }
                            ProgressEvent::Chapter(event) if show_chapters => {
                                let chapter = &event.key.chapter;
                                match &event.kind {
                                    DownloadEventKind::Started | DownloadEventKind::Progress(_) => {
                                        let bar = chapter_bars.entry(chapter.clone()).or_insert_with(|| {
                                            let bar = multi.add(ProgressBar::new(100));
                                            bar.set_style(chapter_style.clone());
                                            bar.set_prefix(truncate_label(chapter, label_width));
                                            bar
                                        });
                                        if let DownloadEventKind::Progress(progress) = &event.kind {
                                            bar.set_position(progress.percent as u64);
                                        }
                                    }
                                    _ => {
                                        if let Some(bar) = chapter_bars.remove(chapter) {
                                            bar.finish_and_clear();
                                            multi.remove(&bar);
                                        }
                                    }
                                }
                            }
                            ProgressEvent::Chapter(_) => {}
                        }
                        main_pb.set_position((state.completed.len() + state.failed.len()) as u64);
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Progress display received shutdown signal");
                        break;
                    }
                }
            }
            for bar in chapter_bars.into_values() {
                bar.finish_and_clear();
            }
        }))
    }

    fn spawn_text_task(
        &self,
        mut event_rx: mpsc::UnboundedReceiver<ProgressEvent>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let state = Arc::clone(&self.state);
        let print = self.config.enable_progress_bars;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = event_rx.recv() => {
                        let Some(event) = event else { break };
                        let line = state.write().await.apply(&event);
                        if let (true, Some(line)) = (print, line) {
                            eprintln!("{}", line);
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::events::DownloadFailure;
    use crate::app::classifier::ErrorType;
    use crate::app::models::{ChapterKey, Progress};
    use crate::app::orchestrator::SessionStatus;

    fn create_test_config() -> ProgressConfig {
        ProgressConfig {
            enable_progress_bars: false, // Disable for testing
            show_chapter_details: true,
            max_label_width: 10,
            tick_interval: Duration::from_millis(10),
        }
    }

    fn view(message: &str) -> BatchSessionView {
        BatchSessionView {
            title: "Berserk".to_string(),
            status: SessionStatus::Downloading,
            planned_chapters: vec!["1".to_string(), "2".to_string()],
            message: message.to_string(),
            ..BatchSessionView::idle("berserk")
        }
    }

    fn chapter_event(chapter: &str, kind: DownloadEventKind) -> ProgressEvent {
        ProgressEvent::Chapter(DownloadEvent::new(ChapterKey::new("berserk", chapter), kind))
    }

    #[test]
    fn test_state_tracks_chapters() {
        let mut state = DisplayState::default();

        assert!(state.apply(&ProgressEvent::Session(view("Downloading"))).is_some());
        assert!(state.apply(&ProgressEvent::Session(view("Downloading"))).is_none());
        assert_eq!(state.total_chapters, 2);

        state.apply(&chapter_event("1", DownloadEventKind::Started));
        let mut progress = Progress::new(4);
        progress.completed_pages = 2;
        progress.update_percent();
        assert!(state
            .apply(&chapter_event("1", DownloadEventKind::Progress(progress)))
            .is_none());
        assert_eq!(state.active.get("1"), Some(&50));

        state.apply(&chapter_event("1", DownloadEventKind::Completed));
        let line = state.apply(&chapter_event(
            "2",
            DownloadEventKind::Failed(DownloadFailure {
                error_type: ErrorType::Network,
                content_id: "berserk".to_string(),
                chapter: "2".to_string(),
                message: "connection reset".to_string(),
                retryable: true,
                token_rejected: false,
            }),
        ));

        assert_eq!(line.as_deref(), Some("Chapter 2 failed: connection reset"));
        assert!(state.active.is_empty());
        assert!(state.completed.contains("1"));
        assert!(state.failed.contains("2"));
    }

    #[test]
    fn test_label_truncation() {
        assert_eq!(truncate_label("12", 10), "12");
        assert_eq!(truncate_label("a-very-long-chapter-label", 10), "...r-label");
    }

    #[test]
    fn test_summary_lists_failures() {
        let mut finished = view("1 of 2 chapters downloaded");
        finished.completed_chapters = 1;
        finished.failed_chapters = vec!["2".to_string()];

        let lines = summary_lines(&finished);
        assert!(lines.iter().any(|l| l == "  Failed: 1"));
        assert!(lines.iter().any(|l| l == "  Failed chapters: 2"));
    }

    #[tokio::test]
    async fn test_text_mode_applies_events() {
        let mut display = ProgressDisplay::new(create_test_config());
        let session = view("Preparing");

        display.start(&session).await.unwrap();
        let sender = display.sender().unwrap();
        sender
            .send(chapter_event("1", DownloadEventKind::Completed))
            .unwrap();
        display.update(ProgressEvent::Session(view("Downloading"))).unwrap();
        drop(sender);

        display.finish(&session).await.unwrap();
        let state = display.state().await;
        assert!(state.completed.contains("1"));
        assert_eq!(state.message, "Downloading");
    }
}
