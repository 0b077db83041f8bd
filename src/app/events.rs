//! Download event emitter
//!
//! In-process publish/subscribe fan-out of transfer status changes. Observers
//! subscribe to one chapter, to every chapter of one content item, or to
//! everything. Delivery is synchronous on the publishing task and a listener
//! that panics is logged and skipped; the publisher never sees the failure.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::app::classifier::ErrorType;
use crate::app::models::{ChapterKey, Progress};
use crate::constants::events;

/// Failure details carried by a `download_failed` event
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadFailure {
    pub error_type: ErrorType,
    pub content_id: String,
    pub chapter: String,
    pub message: String,
    pub retryable: bool,
    /// The source refused the chapter's access token
    pub token_rejected: bool,
}

/// What happened to a transfer
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEventKind {
    Started,
    Progress(Progress),
    Completed,
    Failed(DownloadFailure),
    Cancelled,
    Paused,
}

/// One status change of one chapter transfer
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadEvent {
    pub key: ChapterKey,
    pub kind: DownloadEventKind,
    pub at: DateTime<Utc>,
}

impl DownloadEvent {
    pub fn new(key: ChapterKey, kind: DownloadEventKind) -> Self {
        Self {
            key,
            kind,
            at: Utc::now(),
        }
    }

    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self.kind {
            DownloadEventKind::Started => events::DOWNLOAD_STARTED,
            DownloadEventKind::Progress(_) => events::DOWNLOAD_PROGRESS,
            DownloadEventKind::Completed => events::DOWNLOAD_COMPLETED,
            DownloadEventKind::Failed(_) => events::DOWNLOAD_FAILED,
            DownloadEventKind::Cancelled => events::DOWNLOAD_CANCELLED,
            DownloadEventKind::Paused => events::DOWNLOAD_PAUSED,
        }
    }
}

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Ordered set of listeners with stable ids
///
/// Listeners are snapshotted before delivery, so a listener may subscribe or
/// unsubscribe from inside its own callback without deadlocking.
pub struct ListenerSet<E> {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(u64, Listener<E>)>>,
}

impl<E> Default for ListenerSet<E> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(Vec::new()),
        }
    }
}

impl<E> ListenerSet<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener and return its id
    pub fn add<F>(&self, listener: F) -> u64
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.listeners).push((id, Arc::new(listener)));
        id
    }

    /// Remove one listener; other listeners are untouched
    pub fn remove(&self, id: u64) -> bool {
        let mut listeners = lock(&self.listeners);
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        lock(&self.listeners).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every listener, returning how many returned normally
    pub fn notify(&self, event: &E) -> usize {
        let snapshot: Vec<Listener<E>> = lock(&self.listeners)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();

        let mut delivered = 0;
        for listener in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    warn!("Event listener panicked: {}", reason);
                }
            }
        }
        delivered
    }
}

/// Subscription scope
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Topic {
    Chapter(ChapterKey),
    Content(String),
    All,
}

#[derive(Default)]
struct EmitterInner {
    topics: Mutex<HashMap<Topic, Arc<ListenerSet<DownloadEvent>>>>,
}

/// Handle returned by every subscribe call
#[must_use = "dropping the handle keeps the listener registered; call unsubscribe to remove it"]
pub struct Subscription {
    inner: Weak<EmitterInner>,
    topic: Topic,
    id: u64,
}

impl Subscription {
    /// Remove this listener; idempotent with respect to other listeners
    pub fn unsubscribe(self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut topics = lock(&inner.topics);
        if let Some(set) = topics.get(&self.topic) {
            set.remove(self.id);
            if set.is_empty() {
                topics.remove(&self.topic);
            }
        }
    }
}

/// Fan-out of [`DownloadEvent`]s keyed by `(contentId, chapter)`
#[derive(Clone, Default)]
pub struct EventEmitter {
    inner: Arc<EmitterInner>,
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let topics = lock(&self.inner.topics).len();
        f.debug_struct("EventEmitter")
            .field("topics", &topics)
            .finish()
    }
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    fn register<F>(&self, topic: Topic, listener: F) -> Subscription
    where
        F: Fn(&DownloadEvent) + Send + Sync + 'static,
    {
        // added under the topic lock so a concurrent unsubscribe cannot drop the set
        let id = {
            let mut topics = lock(&self.inner.topics);
            topics.entry(topic.clone()).or_default().add(listener)
        };
        Subscription {
            inner: Arc::downgrade(&self.inner),
            topic,
            id,
        }
    }

    /// Listen to one chapter
    pub fn subscribe<F>(&self, content_id: &str, chapter: &str, listener: F) -> Subscription
    where
        F: Fn(&DownloadEvent) + Send + Sync + 'static,
    {
        self.register(Topic::Chapter(ChapterKey::new(content_id, chapter)), listener)
    }

    /// Listen to every chapter of one content item
    pub fn subscribe_content<F>(&self, content_id: &str, listener: F) -> Subscription
    where
        F: Fn(&DownloadEvent) + Send + Sync + 'static,
    {
        self.register(Topic::Content(content_id.to_string()), listener)
    }

    /// Listen to every event
    pub fn subscribe_all<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&DownloadEvent) + Send + Sync + 'static,
    {
        self.register(Topic::All, listener)
    }

    /// Deliver an event to chapter, content and global listeners
    pub fn publish(&self, event: DownloadEvent) {
        let sets: Vec<Arc<ListenerSet<DownloadEvent>>> = {
            let topics = lock(&self.inner.topics);
            [
                Topic::Chapter(event.key.clone()),
                Topic::Content(event.key.content_id.clone()),
                Topic::All,
            ]
            .iter()
            .filter_map(|t| topics.get(t).cloned())
            .collect()
        };

        let delivered: usize = sets.iter().map(|set| set.notify(&event)).sum();
        debug!(
            content_id = %event.key.content_id,
            chapter = %event.key.chapter,
            "{} delivered to {} listeners",
            event.name(),
            delivered
        );
    }

    /// Shorthand for `publish(DownloadEvent::new(key, kind))`
    pub fn emit(&self, key: &ChapterKey, kind: DownloadEventKind) {
        self.publish(DownloadEvent::new(key.clone(), kind));
    }

    /// Number of listeners that would receive an event for `key`
    pub fn listener_count(&self, key: &ChapterKey) -> usize {
        let topics = lock(&self.inner.topics);
        [
            Topic::Chapter(key.clone()),
            Topic::Content(key.content_id.clone()),
            Topic::All,
        ]
        .iter()
        .filter_map(|t| topics.get(t))
        .map(|set| set.len())
        .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&DownloadEvent) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        (count, move |_: &DownloadEvent| {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_routing_by_key() {
        let emitter = EventEmitter::new();
        let (chapter_hits, chapter_listener) = counter();
        let (content_hits, content_listener) = counter();
        let (all_hits, all_listener) = counter();

        let _a = emitter.subscribe("berserk", "1", chapter_listener);
        let _b = emitter.subscribe_content("berserk", content_listener);
        let _c = emitter.subscribe_all(all_listener);

        emitter.emit(&ChapterKey::new("berserk", "1"), DownloadEventKind::Started);
        emitter.emit(&ChapterKey::new("berserk", "2"), DownloadEventKind::Started);
        emitter.emit(&ChapterKey::new("vagabond", "1"), DownloadEventKind::Started);

        assert_eq!(chapter_hits.load(Ordering::SeqCst), 1);
        assert_eq!(content_hits.load(Ordering::SeqCst), 2);
        assert_eq!(all_hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_unsubscribe_leaves_other_listeners() {
        let emitter = EventEmitter::new();
        let key = ChapterKey::new("c", "1");
        let (first_hits, first) = counter();
        let (second_hits, second) = counter();

        let sub_first = emitter.subscribe("c", "1", first);
        let _sub_second = emitter.subscribe("c", "1", second);
        assert_eq!(emitter.listener_count(&key), 2);

        sub_first.unsubscribe();
        emitter.emit(&key, DownloadEventKind::Completed);

        assert_eq!(first_hits.load(Ordering::SeqCst), 0);
        assert_eq!(second_hits.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.listener_count(&key), 1);
    }

    #[test]
    fn test_panicking_listener_is_contained() {
        let emitter = EventEmitter::new();
        let (hits, listener) = counter();

        let _bad = emitter.subscribe("c", "1", |_| panic!("observer bug"));
        let _good = emitter.subscribe("c", "1", listener);

        emitter.emit(&ChapterKey::new("c", "1"), DownloadEventKind::Paused);
        emitter.emit(&ChapterKey::new("c", "1"), DownloadEventKind::Paused);

        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_event_names() {
        let key = ChapterKey::new("c", "1");
        let event = DownloadEvent::new(key, DownloadEventKind::Progress(Progress::new(4)));
        assert_eq!(event.name(), "download_progress");
    }
}
