//! Token broker and token cache
//!
//! The token sandbox is one shared instance, so derivations are funnelled
//! through a single-slot channel that one drain task consumes. Callers queue
//! on the channel; the drain task runs exactly one derivation at a time,
//! bounded by a hard timeout, and answers through a oneshot reply.
//!
//! Derived tokens are cached per chapter under a case-insensitive key, with
//! a time-to-live and a size bound that evicts the oldest entry first.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::app::models::ChapterKey;
use crate::app::sources::TokenSandbox;
use crate::errors::{TokenError, TokenResult};

struct TokenRequest {
    id: u64,
    target: String,
    reply: oneshot::Sender<TokenResult<String>>,
}

/// Single-flight front of the token sandbox
#[derive(Clone)]
pub struct TokenBroker {
    requests: mpsc::Sender<TokenRequest>,
    next_id: Arc<AtomicU64>,
    busy: Arc<AtomicBool>,
    timeout: Duration,
}

impl std::fmt::Debug for TokenBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBroker")
            .field("timeout", &self.timeout)
            .field("busy", &self.is_busy())
            .finish()
    }
}

impl TokenBroker {
    /// Start the drain task for `sandbox`
    ///
    /// The task ends once every clone of the broker is dropped.
    pub fn spawn(sandbox: Arc<dyn TokenSandbox>, timeout: Duration) -> (Self, JoinHandle<()>) {
        let (requests, receiver) = mpsc::channel(1);
        let busy = Arc::new(AtomicBool::new(false));
        let drain = tokio::spawn(drain(sandbox, receiver, Arc::clone(&busy), timeout));
        let broker = Self {
            requests,
            next_id: Arc::new(AtomicU64::new(1)),
            busy,
            timeout,
        };
        (broker, drain)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether a derivation is running right now
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Derive a token for `target`, waiting behind any other request
    ///
    /// # Errors
    ///
    /// `TokenError::Timeout` or `TokenError::Sandbox` from the derivation,
    /// `TokenError::BrokerClosed` if the drain task is gone.
    pub async fn derive(&self, target: &str) -> TokenResult<String> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, response) = oneshot::channel();
        let request = TokenRequest {
            id,
            target: target.to_string(),
            reply,
        };

        self.requests
            .send(request)
            .await
            .map_err(|_| TokenError::BrokerClosed)?;
        debug!("Token request {} queued for {}", id, target);
        response.await.map_err(|_| TokenError::BrokerClosed)?
    }
}

async fn drain(
    sandbox: Arc<dyn TokenSandbox>,
    mut receiver: mpsc::Receiver<TokenRequest>,
    busy: Arc<AtomicBool>,
    timeout: Duration,
) {
    while let Some(request) = receiver.recv().await {
        if request.reply.is_closed() {
            debug!("Token request {} abandoned before it ran", request.id);
            continue;
        }

        busy.store(true, Ordering::SeqCst);
        let started = Instant::now();
        let result = match tokio::time::timeout(timeout, sandbox.derive_token(&request.target)).await
        {
            Ok(result) => result,
            Err(_) => Err(TokenError::Timeout {
                seconds: timeout.as_secs(),
            }),
        };
        busy.store(false, Ordering::SeqCst);

        match &result {
            Ok(_) => debug!(
                "Token request {} derived in {:?}",
                request.id,
                started.elapsed()
            ),
            Err(e) => warn!("Token request {} failed: {}", request.id, e),
        }
        // requester may have gone away meanwhile
        let _ = request.reply.send(result);
    }
    debug!("Token broker stopped");
}

struct CachedToken {
    token: String,
    stored_at: Instant,
}

/// Bounded token cache with expiry
pub struct TokenCache {
    entries: HashMap<String, CachedToken>,
    order: VecDeque<String>,
    capacity: usize,
    ttl: Duration,
}

impl TokenCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Unexpired token for the chapter, if any
    pub fn get(&mut self, key: &ChapterKey) -> Option<String> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&mut self, key: &ChapterKey, now: Instant) -> Option<String> {
        let normalized = key.normalized();
        let expired = match self.entries.get(&normalized) {
            Some(cached) => now.saturating_duration_since(cached.stored_at) >= self.ttl,
            None => return None,
        };
        if expired {
            self.remove(&normalized);
            return None;
        }
        self.entries.get(&normalized).map(|c| c.token.clone())
    }

    pub fn insert(&mut self, key: &ChapterKey, token: String) {
        self.insert_at(key, token, Instant::now());
    }

    pub fn insert_at(&mut self, key: &ChapterKey, token: String, now: Instant) {
        let normalized = key.normalized();
        self.remove(&normalized);

        while self.entries.len() >= self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }

        self.order.push_back(normalized.clone());
        self.entries.insert(
            normalized,
            CachedToken {
                token,
                stored_at: now,
            },
        );
    }

    /// Forget a chapter's token, e.g. after the source rejected it
    pub fn invalidate(&mut self, key: &ChapterKey) {
        self.remove(&key.normalized());
    }

    fn remove(&mut self, normalized: &str) {
        if self.entries.remove(normalized).is_some() {
            self.order.retain(|k| k != normalized);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    struct CountingSandbox {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Duration,
    }

    impl CountingSandbox {
        fn new(delay: Duration) -> Self {
            Self {
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                delay,
            }
        }
    }

    #[async_trait]
    impl TokenSandbox for CountingSandbox {
        async fn derive_token(&self, target: &str) -> TokenResult<String> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if target == "broken" {
                return Err(TokenError::Sandbox {
                    reason: "script error".to_string(),
                });
            }
            Ok(format!("token-{}", target))
        }
    }

    #[tokio::test]
    async fn test_broker_is_single_flight() {
        let sandbox = Arc::new(CountingSandbox::new(Duration::from_millis(10)));
        let (broker, _drain) = TokenBroker::spawn(sandbox.clone(), Duration::from_secs(5));

        let requests = (0..6).map(|i| {
            let broker = broker.clone();
            tokio::spawn(async move { broker.derive(&format!("t{}", i)).await })
        });
        for (i, request) in requests.collect::<Vec<_>>().into_iter().enumerate() {
            assert_eq!(request.await.unwrap().unwrap(), format!("token-t{}", i));
        }
        assert_eq!(sandbox.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_broker_times_out_slow_derivation() {
        let sandbox = Arc::new(CountingSandbox::new(Duration::from_millis(200)));
        let (broker, _drain) = TokenBroker::spawn(sandbox, Duration::from_millis(20));

        assert!(matches!(
            broker.derive("slow").await,
            Err(TokenError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_broker_reports_sandbox_errors() {
        let sandbox = Arc::new(CountingSandbox::new(Duration::ZERO));
        let (broker, _drain) = TokenBroker::spawn(sandbox, Duration::from_secs(1));

        let err = broker.derive("broken").await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(broker.derive("ok").await.unwrap(), "token-ok");
    }

    #[tokio::test]
    async fn test_broker_closed_after_drain_stops() {
        let sandbox = Arc::new(CountingSandbox::new(Duration::ZERO));
        let (broker, drain) = TokenBroker::spawn(sandbox, Duration::from_secs(1));
        drain.abort();
        let _ = drain.await;

        assert_eq!(broker.derive("x").await, Err(TokenError::BrokerClosed));
    }

    #[test]
    fn test_cache_key_is_case_insensitive() {
        let mut cache = TokenCache::new(4, Duration::from_secs(60));
        cache.insert(&ChapterKey::new("Berserk", "1A"), "tok".to_string());
        assert_eq!(
            cache.get(&ChapterKey::new("berserk ", "1a")),
            Some("tok".to_string())
        );
    }

    #[test]
    fn test_cache_expiry() {
        let mut cache = TokenCache::new(4, Duration::from_secs(60));
        let key = ChapterKey::new("c", "1");
        let start = Instant::now();
        cache.insert_at(&key, "tok".to_string(), start);

        assert!(cache.get_at(&key, start + Duration::from_secs(59)).is_some());
        assert!(cache.get_at(&key, start + Duration::from_secs(60)).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_evicts_oldest() {
        let mut cache = TokenCache::new(2, Duration::from_secs(60));
        let keys: Vec<ChapterKey> = (1..=3).map(|n| ChapterKey::new("c", n.to_string())).collect();
        for key in &keys {
            cache.insert(key, format!("tok-{}", key.chapter));
        }

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&keys[0]).is_none());
        assert_eq!(cache.get(&keys[2]), Some("tok-3".to_string()));
    }
}
