//! Page fetching with retry
//!
//! Wraps a [`PageFetcher`] with a per-attempt timeout, a sanity check on the
//! body and the classifier's retry policy. Used by transfers and by chapter
//! repair.

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::app::classifier::{classify, BackoffCalculator, ErrorContext};
use crate::app::models::DownloadQuality;
use crate::app::sources::PageFetcher;
use crate::errors::{DownloadError, DownloadResult};

use super::config::ManagerConfig;
use super::control::TransferControl;

/// Fetches pages through a collaborator, retrying transient failures
#[derive(Clone)]
pub struct PageDownloader {
    fetcher: Arc<dyn PageFetcher>,
    config: ManagerConfig,
}

impl std::fmt::Debug for PageDownloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageDownloader")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PageDownloader {
    pub fn new(fetcher: Arc<dyn PageFetcher>, config: ManagerConfig) -> Self {
        Self { fetcher, config }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn quality(&self) -> DownloadQuality {
        self.config.quality
    }

    /// Fetch one page, retrying while the classifier allows it
    ///
    /// Returns `DownloadError::Cancelled` as soon as `control` asks the
    /// transfer to stop. On exhaustion the last underlying error is returned.
    pub async fn fetch(&self, url: &str, control: &TransferControl) -> DownloadResult<Vec<u8>> {
        let timeout = self.config.page_timeout;
        let quality = self.config.quality;
        self.with_retry(url, control, || async move {
            let bytes = tokio::time::timeout(timeout, self.fetcher.fetch_page(url, quality))
                .await
                .map_err(|_| DownloadError::Timeout {
                    seconds: timeout.as_secs(),
                })??;
            check_page_body(&bytes)?;
            Ok::<_, DownloadError>(bytes)
        })
        .await
    }

    /// Run `operation` under the page retry policy
    pub async fn with_retry<T, F, Fut>(
        &self,
        label: &str,
        control: &TransferControl,
        mut operation: F,
    ) -> DownloadResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DownloadResult<T>>,
    {
        let mut attempt = 1;
        loop {
            if control.should_stop() {
                return Err(DownloadError::Cancelled);
            }

            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            let context = ErrorContext::attempt(attempt)
                .with_max_attempts(self.config.max_page_attempts)
                .with_delays(self.config.retry_base_delay, self.config.retry_max_delay);
            let classification = classify(&error, &context);
            if !classification.retryable {
                if attempt > 1 {
                    warn!(
                        "Giving up on {} after {} attempts: {}",
                        label, attempt, error
                    );
                }
                return Err(error);
            }

            let delay =
                BackoffCalculator::with_jitter(classification.suggested_delay(), self.config.retry_jitter);
            debug!(
                "Attempt {} for {} failed ({}), retrying in {:?}",
                attempt, label, classification.error_type, delay
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Reject bodies that cannot be page images
pub fn check_page_body(bytes: &[u8]) -> DownloadResult<()> {
    if bytes.is_empty() {
        return Err(DownloadError::Parsing {
            reason: "empty page body".to_string(),
        });
    }
    let first = bytes.iter().find(|b| !b.is_ascii_whitespace());
    if matches!(first, Some(b'<') | Some(b'{')) {
        return Err(DownloadError::Parsing {
            reason: "page body is a document, not an image".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    /// Fails the first `failures` calls with a network error
    struct FlakyFetcher {
        failures: u32,
        calls: AtomicU32,
        body: Vec<u8>,
    }

    #[async_trait]
    impl PageFetcher for FlakyFetcher {
        async fn fetch_page(&self, _url: &str, _quality: DownloadQuality) -> DownloadResult<Vec<u8>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(DownloadError::Network {
                    message: "connection reset".to_string(),
                });
            }
            Ok(self.body.clone())
        }
    }

    fn downloader(failures: u32, body: &[u8]) -> (PageDownloader, Arc<FlakyFetcher>) {
        let fetcher = Arc::new(FlakyFetcher {
            failures,
            calls: AtomicU32::new(0),
            body: body.to_vec(),
        });
        let config = ManagerConfig::default()
            .with_max_page_attempts(3)
            .with_retry_delays(Duration::from_millis(1), Duration::from_millis(5));
        (PageDownloader::new(fetcher.clone(), config), fetcher)
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let (downloader, fetcher) = downloader(2, b"\xFF\xD8\xFFimage");
        let bytes = downloader
            .fetch("https://example.com/p1", &TransferControl::new())
            .await
            .unwrap();
        assert_eq!(bytes, b"\xFF\xD8\xFFimage");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempts_are_capped() {
        let (downloader, fetcher) = downloader(10, b"\xFF\xD8\xFF");
        let result = downloader
            .fetch("https://example.com/p1", &TransferControl::new())
            .await;
        assert!(matches!(result, Err(DownloadError::Network { .. })));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_markup_body_is_parsing_error_without_retry() {
        let (downloader, fetcher) = downloader(0, b"  <html>blocked</html>");
        let result = downloader
            .fetch("https://example.com/p1", &TransferControl::new())
            .await;
        assert!(matches!(result, Err(DownloadError::Parsing { .. })));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stopped_control_short_circuits() {
        let (downloader, fetcher) = downloader(0, b"\xFF\xD8\xFF");
        let control = TransferControl::new();
        control.request_cancel();
        let result = downloader.fetch("https://example.com/p1", &control).await;
        assert!(matches!(result, Err(DownloadError::Cancelled)));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_check_page_body() {
        assert!(check_page_body(b"").is_err());
        assert!(check_page_body(b"{\"error\":1}").is_err());
        assert!(check_page_body(b"\x89PNG\r\n").is_ok());
    }
}
