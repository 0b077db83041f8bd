//! HTTP content source
//!
//! A rate-limited reqwest client for sources that expose a JSON chapter API:
//!
//! - `GET {base}/content/{id}/chapters` returns the content title and its
//!   [`ChapterListing`]s
//! - `GET {base}/content/{id}/chapters/{chapter}/pages[?token=..]` returns a
//!   [`ResolvedChapter`]
//! - page images are fetched from the URLs in the page list, with
//!   `?quality=compressed` appended when compressed images are requested
//! - the chapter reader URL answers `{"token": ...}` once its script has
//!   produced an access token, which is what [`TokenObserver`] observes
//!
//! Retries are not done here. The download manager retries through the error
//! classifier, so every request maps its failure onto a [`DownloadError`]
//! the classifier understands.

use std::num::NonZeroU32;
use std::time::Duration;

use async_trait::async_trait;
use governor::{clock::DefaultClock, state::InMemoryState, Jitter, Quota, RateLimiter};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::app::models::{ChapterKey, DownloadQuality};
use crate::app::sources::{
    ChapterListing, PageFetcher, PageListResolver, ResolvedChapter, TokenObserver,
};
use crate::constants::http;
use crate::errors::{DownloadError, DownloadResult, TokenError, TokenResult};

/// Configuration for the HTTP source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Root of the chapter API
    pub base_url: String,
    /// Request timeout
    pub request_timeout: Duration,
    /// Connect timeout
    pub connect_timeout: Duration,
    /// Rate limit (requests per second)
    pub rate_limit_rps: u32,
    /// Maximum number of idle connections per host
    pub pool_max_per_host: usize,
    /// TCP nodelay (disable Nagle's algorithm)
    pub tcp_nodelay: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: http::DEFAULT_SOURCE_URL.to_string(),
            request_timeout: http::DEFAULT_TIMEOUT,
            connect_timeout: http::CONNECT_TIMEOUT,
            rate_limit_rps: http::DEFAULT_RATE_LIMIT_RPS,
            pool_max_per_host: http::POOL_MAX_PER_HOST,
            tcp_nodelay: true,
        }
    }
}

impl ClientConfig {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_rate_limit(mut self, rate_limit_rps: u32) -> Self {
        self.rate_limit_rps = rate_limit_rps;
        self
    }

    /// Builds the reqwest client
    pub fn build_http_client(&self) -> DownloadResult<Client> {
        Client::builder()
            .cookie_store(true)
            .timeout(self.request_timeout)
            .connect_timeout(self.connect_timeout)
            .user_agent(http::USER_AGENT)
            .tcp_nodelay(self.tcp_nodelay)
            .pool_max_idle_per_host(self.pool_max_per_host)
            .pool_idle_timeout(Some(http::POOL_IDLE_TIMEOUT))
            .build()
            .map_err(DownloadError::Http)
    }
}

#[derive(Debug, Deserialize)]
struct ChapterListResponse {
    title: String,
    chapters: Vec<ChapterListing>,
}

#[derive(Debug, Deserialize)]
struct TokenStateResponse {
    #[serde(default)]
    token: Option<String>,
}

type DirectLimiter = RateLimiter<governor::state::NotKeyed, InMemoryState, DefaultClock>;

/// HTTP implementation of the source traits
#[derive(Debug)]
pub struct SourceClient {
    client: Client,
    rate_limiter: DirectLimiter,
    base_url: Url,
}

impl SourceClient {
    /// Creates a client from the given configuration
    ///
    /// # Errors
    ///
    /// `DownloadError::InvalidUrl` for a bad base URL, and
    /// `DownloadError::ConfigurationError` for a zero rate limit.
    pub fn new(config: &ClientConfig) -> DownloadResult<Self> {
        let mut base_url = parse_url(&config.base_url)?;
        // keep the last path segment when joining
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self {
            client: config.build_http_client()?,
            rate_limiter: build_rate_limiter(config.rate_limit_rps)?,
            base_url,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn chapters_url(&self, content_id: &str) -> DownloadResult<Url> {
        self.join(&format!("content/{}/chapters", encode_segment(content_id)))
    }

    fn pages_url(&self, key: &ChapterKey, token: Option<&str>) -> DownloadResult<Url> {
        let mut url = self.join(&format!(
            "content/{}/chapters/{}/pages",
            encode_segment(&key.content_id),
            encode_segment(&key.chapter)
        ))?;
        if let Some(token) = token {
            url.query_pairs_mut().append_pair("token", token);
        }
        Ok(url)
    }

    fn join(&self, path: &str) -> DownloadResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| DownloadError::InvalidUrl {
                url: path.to_string(),
                error: e.to_string(),
            })
    }

    /// Rate-limited GET with the status mapped onto a download error
    async fn get(&self, url: &Url) -> DownloadResult<reqwest::Response> {
        self.rate_limiter
            .until_ready_with_jitter(Jitter::up_to(http::RATE_LIMIT_JITTER))
            .await;

        let response = self.client.get(url.as_str()).send().await?;
        check_status(response.status())?;
        debug!("Fetched {}", url);
        Ok(response)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &Url) -> DownloadResult<T> {
        let body = self.get(url).await?.text().await?;
        serde_json::from_str(&body).map_err(|e| DownloadError::Parsing {
            reason: format!("unexpected response from {}: {}", url, e),
        })
    }
}

fn build_rate_limiter(rate_limit_rps: u32) -> DownloadResult<DirectLimiter> {
    let rps = NonZeroU32::new(rate_limit_rps).ok_or_else(|| {
        DownloadError::ConfigurationError("Rate limit must be non-zero".to_string())
    })?;
    Ok(RateLimiter::direct(Quota::per_second(rps)))
}

fn parse_url(raw: &str) -> DownloadResult<Url> {
    Url::parse(raw).map_err(|e| DownloadError::InvalidUrl {
        url: raw.to_string(),
        error: e.to_string(),
    })
}

/// Percent-encode one path segment
fn encode_segment(raw: &str) -> String {
    url::form_urlencoded::byte_serialize(raw.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

/// Map a non-success status onto the error the classifier expects
fn check_status(status: StatusCode) -> DownloadResult<()> {
    if status.is_success() {
        Ok(())
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        Err(DownloadError::RateLimitExceeded)
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        Err(TokenError::Rejected {
            status: status.as_u16(),
        }
        .into())
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        Err(DownloadError::ServerError {
            status: status.as_u16(),
        })
    } else {
        Err(DownloadError::Parsing {
            reason: format!("source answered HTTP {}", status.as_u16()),
        })
    }
}

/// Page URL for the requested quality
fn page_url(url: &str, quality: DownloadQuality) -> DownloadResult<Url> {
    let mut url = parse_url(url)?;
    if quality == DownloadQuality::Compressed {
        url.query_pairs_mut().append_pair("quality", "compressed");
    }
    Ok(url)
}

#[async_trait]
impl PageListResolver for SourceClient {
    async fn list_chapters(
        &self,
        content_id: &str,
    ) -> DownloadResult<(String, Vec<ChapterListing>)> {
        let url = self.chapters_url(content_id)?;
        let listing: ChapterListResponse = self.get_json(&url).await?;
        debug!(
            content_id,
            "Source lists {} chapters",
            listing.chapters.len()
        );
        Ok((listing.title, listing.chapters))
    }

    async fn resolve_pages(
        &self,
        key: &ChapterKey,
        token: Option<&str>,
    ) -> DownloadResult<ResolvedChapter> {
        let url = self.pages_url(key, token)?;
        self.get_json(&url).await
    }
}

#[async_trait]
impl PageFetcher for SourceClient {
    async fn fetch_page(&self, url: &str, quality: DownloadQuality) -> DownloadResult<Vec<u8>> {
        let url = page_url(url, quality)?;
        let bytes = self.get(&url).await?.bytes().await?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl TokenObserver for SourceClient {
    async fn observe(&self, target: &str) -> TokenResult<Option<String>> {
        let url = parse_url(target).map_err(|e| TokenError::Sandbox {
            reason: e.to_string(),
        })?;
        let response: TokenStateResponse =
            self.get_json(&url).await.map_err(|e| TokenError::Sandbox {
                reason: e.to_string(),
            })?;
        Ok(response.token.filter(|token| !token.is_empty()))
    }
}
