//! External collaborators of the download engine
//!
//! The engine never talks to a content source directly. It goes through the
//! traits below, which the HTTP client in [`crate::app::client`] implements
//! for real sources and which tests implement with in-memory fakes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::app::models::{ChapterKey, DownloadQuality};
use crate::constants::tokens;
use crate::errors::{DownloadResult, TokenResult};

/// One chapter as advertised by the source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterListing {
    pub chapter: String,
    #[serde(default)]
    pub title: Option<String>,
    /// Reader URL of the chapter, also the token derivation target
    pub source_url: String,
    /// Whether page URLs can only be resolved with a derived token
    #[serde(default)]
    pub requires_token: bool,
}

/// Ordered page URLs of one chapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedChapter {
    #[serde(default)]
    pub title: Option<String>,
    pub page_urls: Vec<String>,
}

/// Lists chapters and resolves a chapter to its page URLs
#[async_trait]
pub trait PageListResolver: Send + Sync {
    /// Title of the content item and every chapter it has
    async fn list_chapters(&self, content_id: &str) -> DownloadResult<(String, Vec<ChapterListing>)>;

    /// Page URLs of one chapter, in reading order
    async fn resolve_pages(
        &self,
        key: &ChapterKey,
        token: Option<&str>,
    ) -> DownloadResult<ResolvedChapter>;
}

/// Fetches the bytes of one page image
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, url: &str, quality: DownloadQuality) -> DownloadResult<Vec<u8>>;
}

/// Produces the access token for a chapter
///
/// Implementations are treated as a single shared instance: the
/// orchestrator never issues two derivations at once.
#[async_trait]
pub trait TokenSandbox: Send + Sync {
    async fn derive_token(&self, target: &str) -> TokenResult<String>;
}

/// One observation of the token a rendered page currently exposes
#[async_trait]
pub trait TokenObserver: Send + Sync {
    /// `None` while the page has not produced a token yet
    async fn observe(&self, target: &str) -> TokenResult<Option<String>>;
}

#[async_trait]
impl<T: TokenObserver + ?Sized> TokenObserver for Arc<T> {
    async fn observe(&self, target: &str) -> TokenResult<Option<String>> {
        (**self).observe(target).await
    }
}

/// Online/offline signal
pub trait Connectivity: Send + Sync {
    fn is_online(&self) -> bool;
}

/// Connectivity flag flipped by whoever watches the network
#[derive(Debug)]
pub struct NetworkMonitor {
    online: AtomicBool,
}

impl NetworkMonitor {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Connectivity for NetworkMonitor {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

/// Sandbox that polls a [`TokenObserver`] until the token stops changing
///
/// A token counts as derived once the same value is observed in
/// `stable_polls` consecutive polls. The caller bounds the total time.
pub struct PollingSandbox<P> {
    observer: P,
    stable_polls: u32,
    poll_interval: Duration,
}

impl<P: TokenObserver> PollingSandbox<P> {
    pub fn new(observer: P) -> Self {
        Self {
            observer,
            stable_polls: tokens::STABLE_POLLS,
            poll_interval: tokens::POLL_INTERVAL,
        }
    }

    pub fn with_stable_polls(mut self, polls: u32) -> Self {
        self.stable_polls = polls.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[async_trait]
impl<P: TokenObserver> TokenSandbox for PollingSandbox<P> {
    async fn derive_token(&self, target: &str) -> TokenResult<String> {
        let mut last: Option<String> = None;
        let mut streak = 0u32;
        let mut polls = 0u32;

        loop {
            polls += 1;
            let observed = self.observer.observe(target).await?;
            match observed {
                Some(value) if last.as_deref() == Some(value.as_str()) => streak += 1,
                Some(value) => {
                    last = Some(value);
                    streak = 1;
                }
                None => {
                    last = None;
                    streak = 0;
                }
            }

            if streak >= self.stable_polls {
                if let Some(token) = last {
                    debug!("Token stabilised after {} polls", polls);
                    return Ok(token);
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::errors::TokenError;

    struct ScriptedObserver {
        values: Mutex<Vec<Option<&'static str>>>,
    }

    impl ScriptedObserver {
        fn new(mut values: Vec<Option<&'static str>>) -> Self {
            values.reverse();
            Self {
                values: Mutex::new(values),
            }
        }
    }

    #[async_trait]
    impl TokenObserver for ScriptedObserver {
        async fn observe(&self, _target: &str) -> TokenResult<Option<String>> {
            let next = self.values.lock().unwrap().pop();
            match next {
                Some(value) => Ok(value.map(str::to_string)),
                None => Err(TokenError::Sandbox {
                    reason: "script exhausted".into(),
                }),
            }
        }
    }

    fn sandbox(values: Vec<Option<&'static str>>) -> PollingSandbox<ScriptedObserver> {
        PollingSandbox::new(ScriptedObserver::new(values))
            .with_stable_polls(2)
            .with_poll_interval(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_waits_for_stable_value() {
        let sb = sandbox(vec![None, Some("a"), Some("b"), Some("b")]);
        assert_eq!(sb.derive_token("ch-1").await.unwrap(), "b");
    }

    #[tokio::test]
    async fn test_reset_when_value_disappears() {
        let sb = sandbox(vec![Some("a"), None, Some("a"), Some("a")]);
        assert_eq!(sb.derive_token("ch-1").await.unwrap(), "a");
    }

    #[tokio::test]
    async fn test_observer_error_propagates() {
        let sb = sandbox(vec![Some("a"), Some("b")]);
        assert!(matches!(
            sb.derive_token("ch-1").await,
            Err(TokenError::Sandbox { .. })
        ));
    }

    #[test]
    fn test_network_monitor() {
        let monitor = NetworkMonitor::default();
        assert!(monitor.is_online());
        monitor.set_online(false);
        assert!(!monitor.is_online());
    }
}
