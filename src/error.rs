//! Relay error taxonomy
//!
//! Every failure inside the pipeline is one of these classes. The class,
//! not the message, decides what happens to the record: retry in place,
//! move to `Retrying`, abandon, or freeze.

use thiserror::Error;

use crate::types::{DedupKey, RelayState};

pub type RelayResult<T> = Result<T, RelayError>;

#[derive(Debug, Error)]
pub enum RelayError {
    /// Connection-level failure talking to a chain; retry with backoff, no state change
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// A chain returned something that cannot be decoded
    #[error("malformed chain response: {0}")]
    MalformedResponse(String),

    /// Event's block is no longer canonical; it never happened for the relay
    #[error("reorg discard for {key}: block {block_number} hash {observed} is no longer canonical ({canonical})")]
    ReorgDiscard {
        key: DedupKey,
        block_number: u64,
        observed: String,
        canonical: String,
    },

    /// Destination action failed in a way that may succeed later
    #[error("transient dispatch error: {0}")]
    TransientDispatch(String),

    /// Destination action can never succeed (bad payload, unsupported asset)
    #[error("permanent dispatch error: {0}")]
    PermanentDispatch(String),

    /// Local invariant violation on one record; the record is frozen
    #[error("store corruption on {key}: {reason}")]
    StoreCorruption { key: DedupKey, reason: String },

    /// Event store I/O failure; nothing was written
    #[error("event store error: {0}")]
    Store(String),

    /// Shutdown was requested while waiting
    #[error("cancelled")]
    Cancelled,
}

impl RelayError {
    /// Errors that are retried in place without touching the record
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RelayError::TransientNetwork(_) | RelayError::Store(_) | RelayError::TransientDispatch(_)
        )
    }

    /// Errors an operator has to look at
    pub fn is_operator_alert(&self) -> bool {
        matches!(
            self,
            RelayError::StoreCorruption { .. } | RelayError::PermanentDispatch(_)
        )
    }

    pub fn conflict(key: &DedupKey, expected: RelayState, found: Option<RelayState>) -> Self {
        let reason = match found {
            Some(state) => format!(
                "compare-and-swap expected state {} but found {}",
                expected, state
            ),
            None => format!(
                "compare-and-swap expected state {} but record does not exist",
                expected
            ),
        };
        RelayError::StoreCorruption {
            key: key.clone(),
            reason,
        }
    }
}

impl From<sqlx::Error> for RelayError {
    fn from(e: sqlx::Error) -> Self {
        RelayError::Store(e.to_string())
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            RelayError::MalformedResponse(e.to_string())
        } else {
            RelayError::TransientNetwork(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classes() {
        assert!(RelayError::TransientNetwork("timeout".into()).is_transient());
        assert!(RelayError::Store("pool closed".into()).is_transient());
        assert!(!RelayError::PermanentDispatch("bad".into()).is_transient());
        assert!(!RelayError::MalformedResponse("garbage".into()).is_transient());
    }

    #[test]
    fn test_conflict_message() {
        let key = DedupKey::new("chainA", "0xa1", 0);
        let err = RelayError::conflict(&key, RelayState::Finalized, Some(RelayState::Confirmed));
        assert!(err.is_operator_alert());
        assert_eq!(
            err.to_string(),
            "store corruption on chainA:0xa1:0: compare-and-swap expected state finalized but found confirmed"
        );
    }
}
