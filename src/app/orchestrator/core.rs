//! Batch download orchestrator
//!
//! Plans a chapter selection for one content item, acquires a token for each
//! chapter through the single-flight [`TokenBroker`], hands chapters to the
//! download queue without waiting for them, and keeps the session view in
//! step with the transfer events the manager publishes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::app::classifier::{error_type_of, ErrorType};
use crate::app::events::{lock, DownloadEvent, DownloadEventKind, EventEmitter, ListenerSet, Subscription};
use crate::app::manager::DownloadManager;
use crate::app::models::{ChapterKey, DownloadStatus, WorkItem};
use crate::app::sources::{ChapterListing, PageListResolver};
use crate::errors::{
    DownloadError, OrchestratorError, OrchestratorResult, QueueError, QueueResult, TokenError,
    TokenResult,
};

use super::broker::{TokenBroker, TokenCache};
use super::config::OrchestratorConfig;
use super::selection::ChapterSelection;
use super::session::{BatchSession, BatchSessionView, ChapterPhase, SessionStatus};

/// State shared with the event listener
struct Shared {
    sessions: Mutex<HashMap<String, BatchSession>>,
    watchers: Mutex<HashMap<String, Arc<ListenerSet<BatchSessionView>>>>,
    tokens: Mutex<TokenCache>,
    changed: Notify,
}

impl Shared {
    fn broadcast(&self, view: BatchSessionView) {
        let watchers = lock(&self.watchers).get(&view.content_id).cloned();
        if let Some(watchers) = watchers {
            watchers.notify(&view);
        }
        self.changed.notify_waiters();
    }

    /// Apply `update` to a session and broadcast the new view
    fn update<F>(&self, content_id: &str, update: F) -> Option<BatchSessionView>
    where
        F: FnOnce(&mut BatchSession),
    {
        let view = {
            let mut sessions = lock(&self.sessions);
            let session = sessions.get_mut(content_id)?;
            update(session);
            session.settle_if_done();
            session.view()
        };
        self.broadcast(view.clone());
        Some(view)
    }

    fn on_event(&self, event: &DownloadEvent) {
        let key = &event.key;
        if let DownloadEventKind::Failed(failure) = &event.kind {
            if failure.token_rejected {
                // a retry must derive a fresh token
                lock(&self.tokens).invalidate(key);
                debug!(content_id = %key.content_id, chapter = %key.chapter, "Dropped rejected token");
            }
        }
        let view = {
            let mut sessions = lock(&self.sessions);
            let Some(session) = sessions.get_mut(&key.content_id) else {
                return;
            };
            // only chapters this session handed to the queue
            if !matches!(
                session.phase(&key.chapter),
                Some(ChapterPhase::Queued | ChapterPhase::Downloading(_) | ChapterPhase::Paused)
            ) {
                return;
            }

            let next = match &event.kind {
                DownloadEventKind::Started => ChapterPhase::Downloading(0),
                DownloadEventKind::Progress(progress) => ChapterPhase::Downloading(progress.percent),
                DownloadEventKind::Completed => ChapterPhase::Completed,
                DownloadEventKind::Failed(failure) => ChapterPhase::Failed {
                    message: failure.message.clone(),
                    error_type: failure.error_type,
                },
                DownloadEventKind::Cancelled => ChapterPhase::Cancelled,
                DownloadEventKind::Paused => ChapterPhase::Paused,
            };

            let changed = session.set_phase(&key.chapter, next);
            let settled = session.settle_if_done();
            if !changed && !settled {
                return;
            }
            if settled {
                info!(
                    content_id = %key.content_id,
                    "Batch session finished: {}",
                    session.view().message
                );
            }
            session.view()
        };
        self.broadcast(view);
    }
}

/// Handle returned by [`BatchOrchestrator::subscribe_state`]
#[must_use = "dropping the handle keeps the listener registered; call unsubscribe to remove it"]
pub struct StateSubscription {
    shared: Weak<Shared>,
    content_id: String,
    id: u64,
}

impl StateSubscription {
    pub fn unsubscribe(self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut watchers = lock(&shared.watchers);
        if let Some(set) = watchers.get(&self.content_id) {
            set.remove(self.id);
            if set.is_empty() {
                watchers.remove(&self.content_id);
            }
        }
    }
}

/// Per-content batch sessions over the queue and manager
pub struct BatchOrchestrator {
    config: OrchestratorConfig,
    manager: Arc<DownloadManager>,
    resolver: Arc<dyn PageListResolver>,
    broker: TokenBroker,
    shared: Arc<Shared>,
    events: Option<Subscription>,
}

impl std::fmt::Debug for BatchOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sessions = lock(&self.shared.sessions).len();
        f.debug_struct("BatchOrchestrator")
            .field("config", &self.config)
            .field("sessions", &sessions)
            .finish_non_exhaustive()
    }
}

impl Drop for BatchOrchestrator {
    fn drop(&mut self) {
        if let Some(events) = self.events.take() {
            events.unsubscribe();
        }
    }
}

impl BatchOrchestrator {
    /// Create an orchestrator listening to `emitter`
    ///
    /// # Errors
    ///
    /// `DownloadError::ConfigurationError` if `config` is invalid.
    pub fn new(
        config: OrchestratorConfig,
        manager: Arc<DownloadManager>,
        resolver: Arc<dyn PageListResolver>,
        broker: TokenBroker,
        emitter: &EventEmitter,
    ) -> OrchestratorResult<Self> {
        config.validate()?;
        let shared = Arc::new(Shared {
            sessions: Mutex::new(HashMap::new()),
            watchers: Mutex::new(HashMap::new()),
            tokens: Mutex::new(TokenCache::new(
                config.token_cache_capacity,
                config.token_cache_ttl,
            )),
            changed: Notify::new(),
        });

        let listener = Arc::downgrade(&shared);
        let events = emitter.subscribe_all(move |event| {
            if let Some(shared) = listener.upgrade() {
                shared.on_event(event);
            }
        });

        Ok(Self {
            config,
            manager,
            resolver,
            broker,
            shared,
            events: Some(events),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Plan a selection and start acquiring tokens and queueing chapters
    ///
    /// Returns as soon as the session is planned; chapters are processed in
    /// the background.
    ///
    /// # Errors
    ///
    /// `OrchestratorError::SessionActive` if a session for the content is
    /// still running, `OrchestratorError::EmptySelection` if nothing
    /// matched, and the resolver's error if the chapter list is unavailable.
    pub async fn start_batch_download(
        self: &Arc<Self>,
        content_id: &str,
        selection: ChapterSelection,
    ) -> OrchestratorResult<BatchSessionView> {
        self.ensure_not_running(content_id)?;

        let (title, listings) = self.resolver.list_chapters(content_id).await?;
        let chapters = selection.select(&listings);
        if chapters.is_empty() {
            return Err(OrchestratorError::EmptySelection {
                content_id: content_id.to_string(),
            });
        }

        let view = {
            let mut sessions = lock(&self.shared.sessions);
            if sessions.get(content_id).is_some_and(|s| s.is_running()) {
                return Err(OrchestratorError::SessionActive {
                    content_id: content_id.to_string(),
                });
            }
            let session = BatchSession::new(content_id, title, selection, chapters.clone());
            let view = session.view();
            sessions.insert(content_id.to_string(), session);
            view
        };
        info!(
            content_id,
            "Batch session planned: {} ({} chapters)",
            selection,
            chapters.len()
        );
        self.shared.broadcast(view.clone());

        self.spawn_planner(content_id, chapters);
        Ok(view)
    }

    /// Stop admitting chapters and cancel the ones already queued
    ///
    /// Running transfers stop after their current pages. Cancelling an idle
    /// session does nothing.
    ///
    /// # Errors
    ///
    /// `OrchestratorError::SessionNotFound` if the content never had a
    /// session.
    pub async fn cancel_batch_download(&self, content_id: &str) -> OrchestratorResult<()> {
        let queued = {
            let mut sessions = lock(&self.shared.sessions);
            let session = sessions
                .get_mut(content_id)
                .ok_or_else(|| OrchestratorError::SessionNotFound {
                    content_id: content_id.to_string(),
                })?;
            if !session.is_running() {
                return Ok(());
            }
            session.cancelling = true;
            for slot in &mut session.chapters {
                if slot.phase == ChapterPhase::Planned {
                    slot.phase = ChapterPhase::Cancelled;
                }
            }
            session.touch();
            session.queued_chapters()
        };
        info!(content_id, "Cancelling batch session ({} queued)", queued.len());
        self.shared.update(content_id, |_| {});

        for chapter in queued {
            self.cancel_chapter(content_id, &chapter).await;
        }
        Ok(())
    }

    /// Start a new run over the chapters that failed
    ///
    /// Each chapter gets a fresh token attempt count. Completed chapters are
    /// left alone.
    ///
    /// # Errors
    ///
    /// `OrchestratorError::SessionNotFound`, `OrchestratorError::SessionActive`
    /// while the session is still running, `OrchestratorError::NothingToRetry`
    /// if no chapter failed.
    pub async fn retry_failed_chapters(
        self: &Arc<Self>,
        content_id: &str,
    ) -> OrchestratorResult<BatchSessionView> {
        let (chapters, view) = {
            let mut sessions = lock(&self.shared.sessions);
            let session = sessions
                .get_mut(content_id)
                .ok_or_else(|| OrchestratorError::SessionNotFound {
                    content_id: content_id.to_string(),
                })?;
            if session.is_running() {
                return Err(OrchestratorError::SessionActive {
                    content_id: content_id.to_string(),
                });
            }
            if session.failed_chapters().is_empty() {
                return Err(OrchestratorError::NothingToRetry {
                    content_id: content_id.to_string(),
                });
            }
            let chapters = session.reset_failed();
            (chapters, session.view())
        };
        info!(content_id, "Retrying {} failed chapters", chapters.len());
        self.shared.broadcast(view.clone());

        self.spawn_planner(content_id, chapters);
        Ok(view)
    }

    /// Current view of a content item's session
    pub fn get_state(&self, content_id: &str) -> BatchSessionView {
        lock(&self.shared.sessions)
            .get(content_id)
            .map(BatchSession::view)
            .unwrap_or_else(|| BatchSessionView::idle(content_id))
    }

    /// Views of every known session
    pub fn sessions(&self) -> Vec<BatchSessionView> {
        let mut views: Vec<BatchSessionView> = lock(&self.shared.sessions)
            .values()
            .map(BatchSession::view)
            .collect();
        views.sort_by(|a, b| a.content_id.cmp(&b.content_id));
        views
    }

    /// Receive every change of a content item's session view
    pub fn subscribe_state<F>(&self, content_id: &str, listener: F) -> StateSubscription
    where
        F: Fn(&BatchSessionView) + Send + Sync + 'static,
    {
        let id = lock(&self.shared.watchers)
            .entry(content_id.to_string())
            .or_default()
            .add(listener);
        StateSubscription {
            shared: Arc::downgrade(&self.shared),
            content_id: content_id.to_string(),
            id,
        }
    }

    /// Wait until the content item's session is idle
    pub async fn wait_for_idle(&self, content_id: &str) -> BatchSessionView {
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let view = self.get_state(content_id);
            if !view.is_running() {
                return view;
            }
            notified.await;
        }
    }

    fn ensure_not_running(&self, content_id: &str) -> OrchestratorResult<()> {
        let sessions = lock(&self.shared.sessions);
        if sessions.get(content_id).is_some_and(|s| s.is_running()) {
            return Err(OrchestratorError::SessionActive {
                content_id: content_id.to_string(),
            });
        }
        Ok(())
    }

    fn is_cancelling(&self, content_id: &str) -> bool {
        lock(&self.shared.sessions)
            .get(content_id)
            .map_or(true, |s| s.cancelling)
    }

    fn spawn_planner(self: &Arc<Self>, content_id: &str, chapters: Vec<ChapterListing>) {
        let orchestrator = Arc::clone(self);
        let content_id = content_id.to_string();
        tokio::spawn(async move { orchestrator.plan(content_id, chapters).await });
    }

    async fn plan(self: Arc<Self>, content_id: String, chapters: Vec<ChapterListing>) {
        let title = self.get_state(&content_id).title;

        for listing in &chapters {
            if self.is_cancelling(&content_id) {
                break;
            }
            self.plan_chapter(&content_id, &title, listing).await;
        }

        self.shared.update(&content_id, |session| {
            if session.cancelling {
                for slot in &mut session.chapters {
                    if matches!(slot.phase, ChapterPhase::Planned | ChapterPhase::AwaitingToken) {
                        slot.phase = ChapterPhase::Cancelled;
                    }
                }
            }
            session.planning_done = true;
            session.active_token_request = None;
        });
        debug!(content_id, "Planner finished");
    }

    async fn plan_chapter(&self, content_id: &str, title: &str, listing: &ChapterListing) {
        let key = ChapterKey::new(content_id, listing.chapter.clone());

        if self.manager.storage().is_chapter_downloaded(&key).await {
            debug!(content_id, chapter = %key.chapter, "Already downloaded");
            self.set_phase(&key, ChapterPhase::Completed);
            return;
        }

        let token = if listing.requires_token {
            match self.acquire_token(&key, listing).await {
                Ok(token) => Some(token),
                Err(_) if self.is_cancelling(content_id) => {
                    self.set_phase(&key, ChapterPhase::Cancelled);
                    return;
                }
                Err(e) => {
                    let error = DownloadError::Token(e);
                    warn!(content_id, chapter = %key.chapter, "No token: {}", error);
                    self.set_phase(
                        &key,
                        ChapterPhase::Failed {
                            message: error.to_string(),
                            error_type: error_type_of(&error),
                        },
                    );
                    return;
                }
            }
        } else {
            None
        };

        if self.is_cancelling(content_id) {
            self.set_phase(&key, ChapterPhase::Cancelled);
            return;
        }

        // marked before enqueueing so no transfer event can be missed
        self.shared.update(content_id, |session| {
            session.set_phase(&key.chapter, ChapterPhase::Queued);
            if session.status == SessionStatus::Preparing {
                session.status = SessionStatus::Downloading;
            }
        });

        let item = WorkItem::new(content_id, title, key.chapter.clone(), listing.source_url.clone())
            .with_priority(self.config.chapter_priority)
            .with_token(token);
        let id = item.id.clone();
        match self.manager.queue().enqueue(item).await {
            Ok(()) => {}
            Err(QueueError::DuplicateItem { .. }) => {
                if let Err(e) = self.adopt_existing(&id).await {
                    warn!(content_id, chapter = %key.chapter, "Could not resume: {}", e);
                    let error = DownloadError::Queue(e);
                    self.set_phase(
                        &key,
                        ChapterPhase::Failed {
                            message: error.to_string(),
                            error_type: ErrorType::Unknown,
                        },
                    );
                    return;
                }
            }
            Err(e) => {
                warn!(content_id, chapter = %key.chapter, "Could not queue: {}", e);
                let error = DownloadError::Queue(e);
                self.set_phase(
                    &key,
                    ChapterPhase::Failed {
                        message: error.to_string(),
                        error_type: ErrorType::Unknown,
                    },
                );
                return;
            }
        }

        // a cancel that raced the enqueue found nothing to cancel
        if self.is_cancelling(content_id) {
            self.cancel_chapter(content_id, &key.chapter).await;
        }
        debug!(content_id, chapter = %key.chapter, "Queued {}", id);
    }

    /// Take over a live queue entry for the same chapter
    ///
    /// Queued or running entries report through the emitter on their own; a
    /// paused one (left by an interrupted run) has to be put back in line.
    async fn adopt_existing(&self, id: &str) -> QueueResult<()> {
        let queue = self.manager.queue();
        match queue.get(id).await.map(|entry| entry.status) {
            Some(DownloadStatus::Paused) => {
                queue.resume_item(id).await?;
                info!("Resumed paused {}", id);
            }
            _ => debug!("Already queued elsewhere: {}", id),
        }
        Ok(())
    }

    /// Cached token, or a new one from the broker with bounded retries
    async fn acquire_token(&self, key: &ChapterKey, listing: &ChapterListing) -> TokenResult<String> {
        if let Some(token) = lock(&self.shared.tokens).get(key) {
            debug!(content_id = %key.content_id, chapter = %key.chapter, "Using cached token");
            return Ok(token);
        }

        let attempts = self.config.token_attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.shared.update(&key.content_id, |session| {
                session.retry_counts.insert(key.chapter.clone(), attempt);
                session.active_token_request = Some(key.chapter.clone());
                session.set_phase(&key.chapter, ChapterPhase::AwaitingToken);
            });

            let result = self.broker.derive(&listing.source_url).await;
            self.shared.update(&key.content_id, |session| {
                session.active_token_request = None;
            });

            match result {
                Ok(token) => {
                    lock(&self.shared.tokens).insert(key, token.clone());
                    return Ok(token);
                }
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!(
                        content_id = %key.content_id,
                        chapter = %key.chapter,
                        "Token attempt {}/{} failed: {}",
                        attempt,
                        attempts,
                        e
                    );
                    if self.is_cancelling(&key.content_id) {
                        return Err(e);
                    }
                }
                Err(e) if e.is_retryable() => {
                    return Err(TokenError::AttemptsExhausted {
                        attempts,
                        last_error: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn set_phase(&self, key: &ChapterKey, phase: ChapterPhase) {
        self.shared.update(&key.content_id, |session| {
            session.set_phase(&key.chapter, phase);
        });
    }

    async fn cancel_chapter(&self, content_id: &str, chapter: &str) {
        let id = ChapterKey::new(content_id, chapter).work_id();
        if let Err(e) = self.manager.cancel(&id).await {
            // already settled or never reached the queue
            debug!(content_id, chapter, "Nothing to cancel: {}", e);
        }
    }
}
