//! Error classification and retry policy
//!
//! Maps raised failures onto a small taxonomy and a retry decision. The
//! download manager consults it between page attempts, the orchestrator
//! between token attempts, and the CLI for user-facing advice.
//!
//! Policy:
//! - `Network`: retryable with exponential backoff (doubling, capped)
//! - `StorageFull`: never retried, needs the user to act
//! - `Parsing`: never retried; fails the page, not the chapter
//! - `Cancelled`: not an error, reported as the terminal status
//! - `Unknown`: retryable up to a conservative cap

use std::fmt;
use std::time::Duration;

use crate::constants::downloads;
use crate::errors::{DownloadError, TokenError};

/// Failure taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorType {
    Network,
    StorageFull,
    Parsing,
    Cancelled,
    Unknown,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Network => "network",
            ErrorType::StorageFull => "storage_full",
            ErrorType::Parsing => "parsing",
            ErrorType::Cancelled => "cancelled",
            ErrorType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remedy offered to the user alongside a classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuggestedAction {
    RetryLater,
    CheckConnection,
    FreeSpace,
    LowerQuality,
    RaiseQuota,
    RepairChapter,
    ReportIssue,
}

impl fmt::Display for SuggestedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SuggestedAction::RetryLater => "retry later",
            SuggestedAction::CheckConnection => "check the network connection",
            SuggestedAction::FreeSpace => "free up storage space",
            SuggestedAction::LowerQuality => "switch to compressed download quality",
            SuggestedAction::RaiseQuota => "raise the storage limit",
            SuggestedAction::RepairChapter => "repair the chapter",
            SuggestedAction::ReportIssue => "report the problem",
        };
        f.write_str(text)
    }
}

/// Attempt bookkeeping supplied by the caller
#[derive(Debug, Clone, Copy)]
pub struct ErrorContext {
    /// 1-based number of the attempt that just failed
    pub attempt: u32,
    /// Attempts allowed for retryable failures
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl ErrorContext {
    pub fn attempt(attempt: u32) -> Self {
        Self {
            attempt,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_delays(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self {
            attempt: 1,
            max_attempts: downloads::MAX_PAGE_ATTEMPTS,
            base_delay: downloads::RETRY_BASE_DELAY,
            max_delay: downloads::RETRY_MAX_DELAY,
        }
    }
}

/// Outcome of [`classify`]
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub error_type: ErrorType,
    pub retryable: bool,
    pub suggested_delay_ms: u64,
    pub requires_user_action: bool,
    pub suggested_actions: Vec<SuggestedAction>,
}

impl Classification {
    /// Whether the failure should be shown to the user as an error
    pub fn is_error(&self) -> bool {
        self.error_type != ErrorType::Cancelled
    }

    pub fn suggested_delay(&self) -> Duration {
        Duration::from_millis(self.suggested_delay_ms)
    }
}

/// Bucket an error without looking at attempt counts
pub fn error_type_of(error: &DownloadError) -> ErrorType {
    match error {
        DownloadError::Http(e) => {
            if e.is_decode() {
                return ErrorType::Parsing;
            }
            match e.status() {
                Some(status) if status.is_server_error() => ErrorType::Network,
                Some(status) if status.as_u16() == 408 || status.as_u16() == 429 => {
                    ErrorType::Network
                }
                Some(_) => ErrorType::Unknown,
                None => ErrorType::Network,
            }
        }
        DownloadError::Network { .. }
        | DownloadError::Timeout { .. }
        | DownloadError::ServerError { .. }
        | DownloadError::RateLimitExceeded
        | DownloadError::IncompletePages { .. }
        | DownloadError::RepairUnavailable { .. }
        | DownloadError::MaxRetriesExceeded { .. } => ErrorType::Network,
        DownloadError::Token(token) => match token {
            TokenError::BrokerClosed => ErrorType::Unknown,
            _ => ErrorType::Network,
        },
        DownloadError::InvalidUrl { .. } | DownloadError::Parsing { .. } => ErrorType::Parsing,
        DownloadError::StorageFull { .. } => ErrorType::StorageFull,
        DownloadError::Storage(e) if e.is_storage_full() => ErrorType::StorageFull,
        DownloadError::Cancelled => ErrorType::Cancelled,
        DownloadError::Storage(_)
        | DownloadError::Queue(_)
        | DownloadError::AlreadyActive { .. }
        | DownloadError::NotAdmitted { .. }
        | DownloadError::ConfigurationError(_)
        | DownloadError::Other(_) => ErrorType::Unknown,
    }
}

/// Classify an error given the attempt that produced it
pub fn classify(error: &DownloadError, context: &ErrorContext) -> Classification {
    let error_type = error_type_of(error);

    // a few errors already encode that retrying is pointless
    let exhausted = matches!(
        error,
        DownloadError::MaxRetriesExceeded { .. }
            | DownloadError::RepairUnavailable { .. }
            | DownloadError::Token(TokenError::AttemptsExhausted { .. })
            | DownloadError::Token(TokenError::Rejected { .. })
    );

    match error_type {
        ErrorType::Network => {
            let retryable = !exhausted && context.attempt < context.max_attempts;
            let suggested_delay_ms = if retryable {
                retry_delay_ms(context, context.attempt.saturating_sub(1))
            } else {
                0
            };
            let mut suggested_actions = vec![SuggestedAction::CheckConnection];
            if !retryable {
                suggested_actions.push(SuggestedAction::RetryLater);
            }
            Classification {
                error_type,
                retryable,
                suggested_delay_ms,
                requires_user_action: !retryable,
                suggested_actions,
            }
        }
        ErrorType::StorageFull => Classification {
            error_type,
            retryable: false,
            suggested_delay_ms: 0,
            requires_user_action: true,
            suggested_actions: vec![
                SuggestedAction::FreeSpace,
                SuggestedAction::LowerQuality,
                SuggestedAction::RaiseQuota,
            ],
        },
        ErrorType::Parsing => Classification {
            error_type,
            retryable: false,
            suggested_delay_ms: 0,
            requires_user_action: false,
            suggested_actions: vec![SuggestedAction::RepairChapter],
        },
        ErrorType::Cancelled => Classification {
            error_type,
            retryable: false,
            suggested_delay_ms: 0,
            requires_user_action: false,
            suggested_actions: Vec::new(),
        },
        ErrorType::Unknown => {
            let cap = context.max_attempts.min(downloads::UNKNOWN_MAX_ATTEMPTS);
            let retryable = !exhausted && context.attempt < cap;
            Classification {
                error_type,
                retryable,
                // one step further along the curve than a network error
                suggested_delay_ms: if retryable {
                    retry_delay_ms(context, context.attempt)
                } else {
                    0
                },
                requires_user_action: false,
                suggested_actions: if retryable {
                    vec![SuggestedAction::RetryLater]
                } else {
                    vec![SuggestedAction::ReportIssue]
                },
            }
        }
    }
}

fn retry_delay_ms(context: &ErrorContext, step: u32) -> u64 {
    BackoffCalculator::calculate_retry_delay(
        step,
        context.base_delay,
        context.max_delay,
        downloads::BACKOFF_MULTIPLIER,
    )
    .as_millis() as u64
}

/// Backoff calculation utilities
pub struct BackoffCalculator;

impl BackoffCalculator {
    /// Exponential delay `base * multiplier^retry_count`, capped at `max_delay`
    pub fn calculate_retry_delay(
        retry_count: u32,
        base_delay: Duration,
        max_delay: Duration,
        multiplier: u32,
    ) -> Duration {
        let delay_millis = base_delay.as_millis() as u64;
        let factor = (multiplier as u64).saturating_pow(retry_count);
        let multiplied = delay_millis.saturating_mul(factor);
        Duration::from_millis(multiplied.min(max_delay.as_millis() as u64))
    }

    /// Spread a delay by up to `jitter_percentage` either way
    pub fn with_jitter(delay: Duration, jitter_percentage: f64) -> Duration {
        let millis = delay.as_millis() as u64;
        let jitter_range = (millis as f64 * jitter_percentage) as u64;
        if jitter_range == 0 {
            return delay;
        }
        let offset = fastrand::u64(0..=jitter_range * 2);
        Duration::from_millis((millis + offset).saturating_sub(jitter_range))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StorageError;

    fn ctx(attempt: u32) -> ErrorContext {
        ErrorContext::attempt(attempt)
            .with_max_attempts(5)
            .with_delays(Duration::from_millis(100), Duration::from_millis(1000))
    }

    #[test]
    fn test_network_backoff_doubles_and_caps() {
        let err = DownloadError::Network {
            message: "connection reset".into(),
        };
        let delays: Vec<u64> = (1..5).map(|a| classify(&err, &ctx(a)).suggested_delay_ms).collect();
        assert_eq!(delays, vec![100, 200, 400, 800]);

        let capped = ErrorContext::attempt(4)
            .with_max_attempts(10)
            .with_delays(Duration::from_millis(300), Duration::from_millis(1000));
        assert_eq!(classify(&err, &capped).suggested_delay_ms, 1000);
    }

    #[test]
    fn test_network_stops_at_attempt_cap() {
        let err = DownloadError::Timeout { seconds: 45 };
        assert!(classify(&err, &ctx(4)).retryable);
        let last = classify(&err, &ctx(5));
        assert!(!last.retryable);
        assert!(last.requires_user_action);
    }

    #[test]
    fn test_storage_full_requires_user_action() {
        let err: DownloadError = StorageError::QuotaExceeded {
            used: 10,
            limit: 5,
        }
        .into();
        let c = classify(&err, &ctx(1));
        assert_eq!(c.error_type, ErrorType::StorageFull);
        assert!(!c.retryable);
        assert!(c.requires_user_action);
        assert!(c.suggested_actions.contains(&SuggestedAction::FreeSpace));
        assert!(c.suggested_actions.contains(&SuggestedAction::LowerQuality));
    }

    #[test]
    fn test_parsing_and_cancelled() {
        let parsing = classify(
            &DownloadError::Parsing {
                reason: "not an image".into(),
            },
            &ctx(1),
        );
        assert_eq!(parsing.error_type, ErrorType::Parsing);
        assert!(!parsing.retryable);

        let cancelled = classify(&DownloadError::Cancelled, &ctx(1));
        assert_eq!(cancelled.error_type, ErrorType::Cancelled);
        assert!(!cancelled.is_error());
    }

    #[test]
    fn test_unknown_uses_conservative_cap() {
        let err = DownloadError::Other("weird".into());
        let first = classify(&err, &ctx(1));
        assert_eq!(first.error_type, ErrorType::Unknown);
        assert!(first.retryable);
        assert_eq!(first.suggested_delay_ms, 200);
        assert!(!classify(&err, &ctx(downloads::UNKNOWN_MAX_ATTEMPTS)).retryable);
    }

    #[test]
    fn test_token_errors() {
        let timeout = DownloadError::Token(TokenError::Timeout { seconds: 25 });
        assert!(classify(&timeout, &ctx(1)).retryable);

        let exhausted = DownloadError::Token(TokenError::AttemptsExhausted {
            attempts: 3,
            last_error: "timeout".into(),
        });
        assert!(!classify(&exhausted, &ctx(1)).retryable);

        // the same token would be refused again
        let rejected = DownloadError::Token(TokenError::Rejected { status: 403 });
        assert_eq!(error_type_of(&rejected), ErrorType::Network);
        assert!(!classify(&rejected, &ctx(1)).retryable);
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let base = Duration::from_millis(1000);
        for _ in 0..50 {
            let d = BackoffCalculator::with_jitter(base, 0.1).as_millis();
            assert!((900..=1100).contains(&d));
        }
        assert_eq!(BackoffCalculator::with_jitter(base, 0.0), base);
    }
}
