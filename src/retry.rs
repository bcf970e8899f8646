//! Backoff and error classification
//!
//! Shared by the chain reader (reconnect backoff) and the dispatch engine
//! (per-record retry schedule).

use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{RelayError, RelayResult};

/// Exponential backoff configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Failed dispatch attempts allowed before a record is abandoned
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Reader reconnect schedule: base 1s, cap 30s
    pub fn reconnect(initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: u32::MAX,
            initial_backoff,
            max_backoff,
            backoff_multiplier: 2.0,
        }
    }

    /// Un-jittered delay before retry number `attempt` (0-indexed)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let growth = self.backoff_multiplier.powi(attempt.min(64) as i32);
        let secs = (self.initial_backoff.as_secs_f64() * growth).min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    /// Full jitter: uniform in `[0, backoff_for_attempt(attempt)]`
    pub fn jittered_backoff(&self, attempt: u32) -> Duration {
        let ceiling = self.backoff_for_attempt(attempt);
        if ceiling.is_zero() {
            return ceiling;
        }
        let millis = rand::thread_rng().gen_range(0..=ceiling.as_millis() as u64);
        Duration::from_millis(millis)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Calculate the next retry time for a record that has failed `attempt` times
    pub fn next_retry_after(&self, attempt: u32) -> DateTime<Utc> {
        let backoff = self.backoff_for_attempt(attempt.saturating_sub(1));
        Utc::now() + chrono::Duration::from_std(backoff).unwrap_or(chrono::Duration::seconds(60))
    }
}

/// Coarse class of a raw submission error message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// RPC or transport trouble
    Transient,
    /// Fee or account-nonce race; the next attempt refills both
    Replaceable,
    /// The gateway already consumed this mint nonce. The next pass finds the
    /// earlier mint through `lookup`.
    AlreadyMinted,
    /// Can never succeed for this payload
    Permanent,
    Unknown,
}

const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "connection",
    "network",
    "rate limit",
    "too many requests",
    "502",
    "503",
    "temporarily unavailable",
];

const REPLACEABLE_MARKERS: &[&str] = &[
    "underpriced",
    "replacement transaction",
    "gas price too low",
    "max fee per gas less than",
    "nonce too low",
    "nonce too high",
    "already known",
];

const ALREADY_MINTED_MARKERS: &[&str] = &["nonce already used", "nonce used", "already minted"];

const PERMANENT_MARKERS: &[&str] = &[
    "invalid signature",
    "untrusted signer",
    "invalid address",
    "invalid amount",
    "unsupported asset",
];

pub fn classify_error(error: &str) -> ErrorClass {
    let lower = error.to_lowercase();
    let any = |markers: &[&str]| markers.iter().any(|m| lower.contains(m));

    // Checked before the fee/nonce markers, which overlap on "nonce"
    if any(ALREADY_MINTED_MARKERS) {
        ErrorClass::AlreadyMinted
    } else if any(TRANSIENT_MARKERS) {
        ErrorClass::Transient
    } else if any(REPLACEABLE_MARKERS) {
        ErrorClass::Replaceable
    } else if any(PERMANENT_MARKERS) {
        ErrorClass::Permanent
    } else {
        ErrorClass::Unknown
    }
}

/// Map a raw submission error message onto the relay error taxonomy
pub fn dispatch_error(message: impl Into<String>) -> RelayError {
    let message = message.into();
    match classify_error(&message) {
        ErrorClass::Permanent => RelayError::PermanentDispatch(message),
        _ => RelayError::TransientDispatch(message),
    }
}

/// Sleep for `duration` unless shutdown is requested first
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> RelayResult<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(RelayError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_backoff_doubles_up_to_cap() {
        let config = RetryConfig::default();
        let delays: Vec<u64> = (0..7).map(|a| config.backoff_for_attempt(a).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 32, 60, 60]);
        assert_eq!(config.backoff_for_attempt(200), Duration::from_secs(60));
    }

    #[test]
    fn test_reconnect_jitter_stays_under_cap() {
        let config = RetryConfig::reconnect(Duration::from_secs(1), Duration::from_secs(30));
        for attempt in 0..20 {
            let delay = config.jittered_backoff(attempt);
            assert!(delay <= config.backoff_for_attempt(attempt));
            assert!(delay <= Duration::from_secs(30));
        }
    }

    #[test]
    fn test_should_retry() {
        let config = RetryConfig {
            max_attempts: 3,
            ..Default::default()
        };
        assert!(config.should_retry(0));
        assert!(config.should_retry(2));
        assert!(!config.should_retry(3));
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(classify_error("connection refused"), ErrorClass::Transient);
        assert_eq!(
            classify_error("replacement transaction underpriced"),
            ErrorClass::Replaceable
        );
        assert_eq!(classify_error("nonce too low"), ErrorClass::Replaceable);
        assert_eq!(
            classify_error("execution reverted: Nonce already used"),
            ErrorClass::AlreadyMinted
        );
        assert_eq!(
            classify_error("execution reverted: untrusted signer"),
            ErrorClass::Permanent
        );
        assert_eq!(classify_error("something odd"), ErrorClass::Unknown);
    }

    #[tokio::test]
    async fn test_sleep_or_cancel() {
        let cancel = CancellationToken::new();
        assert!(sleep_or_cancel(Duration::from_millis(1), &cancel).await.is_ok());
        cancel.cancel();
        let result = sleep_or_cancel(Duration::from_secs(3600), &cancel).await;
        assert!(matches!(result, Err(RelayError::Cancelled)));
    }

    #[test]
    fn test_dispatch_error_mapping() {
        assert!(matches!(
            dispatch_error("request timed out"),
            RelayError::TransientDispatch(_)
        ));
        assert!(matches!(
            dispatch_error("invalid address: 0x12"),
            RelayError::PermanentDispatch(_)
        ));
    }
}
