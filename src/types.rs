//! Core relay types
//!
//! `SourceEvent` is what a chain reader emits, `RelayRecord` is what the
//! event store persists for every admitted event, and `RelayState` is the
//! per-record state machine driven by the dispatch engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Decoded lock payload carried by a source event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockPayload {
    /// Account credited on the destination chain
    pub beneficiary: String,
    /// Amount in base units, decimal string (validated at dispatch time)
    pub amount: String,
    /// Asset identifier on the source chain
    pub asset_id: String,
    /// Opaque extra fields from the source log
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// A lock event observed on the source chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEvent {
    pub source_chain_id: String,
    pub contract_address: String,
    pub block_hash: String,
    pub block_number: u64,
    pub tx_hash: String,
    pub log_index: u64,
    pub payload: LockPayload,
}

impl SourceEvent {
    /// The canonical dedup key `(source_chain_id, tx_hash, log_index)`
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey::new(&self.source_chain_id, &self.tx_hash, self.log_index)
    }

    /// Position used to order events of one chain
    pub fn position(&self) -> (u64, u64) {
        (self.block_number, self.log_index)
    }
}

/// Unique identity of a source event across retries and restarts.
///
/// Rendered as `chain:tx_hash:log_index` with the hash lower-cased so that
/// differently-cased hex from two RPC providers maps to one key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupKey(String);

impl DedupKey {
    pub fn new(source_chain_id: &str, tx_hash: &str, log_index: u64) -> Self {
        Self(format!(
            "{}:{}:{}",
            source_chain_id,
            tx_hash.to_lowercase(),
            log_index
        ))
    }

    /// Wrap an already-rendered key (as read back from storage)
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Processing state of a relay record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayState {
    Observed,
    Finalized,
    Submitted,
    Confirmed,
    Retrying,
    Abandoned,
}

impl RelayState {
    /// Every state that still needs work from the dispatch engine
    pub const NON_TERMINAL: [RelayState; 4] = [
        RelayState::Observed,
        RelayState::Finalized,
        RelayState::Submitted,
        RelayState::Retrying,
    ];

    /// Get the state as a lowercase string
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayState::Observed => "observed",
            RelayState::Finalized => "finalized",
            RelayState::Submitted => "submitted",
            RelayState::Confirmed => "confirmed",
            RelayState::Retrying => "retrying",
            RelayState::Abandoned => "abandoned",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RelayState::Confirmed | RelayState::Abandoned)
    }

    /// States in which `destination_tx_hash` must be present
    pub fn carries_destination_tx(&self) -> bool {
        matches!(self, RelayState::Submitted | RelayState::Confirmed)
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: RelayState) -> bool {
        use RelayState::*;
        match (self, next) {
            (Observed, Finalized) => true,
            (Finalized, Submitted) => true,
            (Submitted, Confirmed) | (Submitted, Retrying) => true,
            (Retrying, Finalized) => true,
            (from, Abandoned) => !from.is_terminal(),
            // Dispatch attempts that fail before a tx hash exists
            (Finalized, Retrying) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RelayState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "observed" => Ok(RelayState::Observed),
            "finalized" => Ok(RelayState::Finalized),
            "submitted" => Ok(RelayState::Submitted),
            "confirmed" => Ok(RelayState::Confirmed),
            "retrying" => Ok(RelayState::Retrying),
            "abandoned" => Ok(RelayState::Abandoned),
            other => Err(format!("unknown relay state: {}", other)),
        }
    }
}

/// Persisted processing record, one per admitted source event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayRecord {
    pub dedup_key: DedupKey,
    pub event: SourceEvent,
    pub state: RelayState,
    pub destination_tx_hash: Option<String>,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    /// Earliest time a `Retrying` record may be dispatched again
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Set when the store detected an invariant violation on this record
    pub frozen: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RelayRecord {
    /// Fresh record for an event that just passed the finality gate
    pub fn admitted(event: SourceEvent) -> Self {
        let now = Utc::now();
        Self {
            dedup_key: event.dedup_key(),
            event,
            state: RelayState::Finalized,
            destination_tx_hash: None,
            attempt_count: 0,
            last_error: None,
            next_retry_at: None,
            frozen: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check the `destination_tx_hash` invariant for the current state
    pub fn is_consistent(&self) -> bool {
        self.state.carries_destination_tx() == self.destination_tx_hash.is_some()
    }

    /// Whether a `Retrying` record's backoff has elapsed
    pub fn retry_ready(&self, now: DateTime<Utc>) -> bool {
        self.next_retry_at.map_or(true, |at| now >= at)
    }
}

/// Highest fully scanned height of a source chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainCheckpoint {
    pub height: u64,
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_key_format() {
        let key = DedupKey::new("chainA", "0xABCDEF", 3);
        assert_eq!(key.as_str(), "chainA:0xabcdef:3");
    }

    #[test]
    fn test_dedup_key_ignores_block_hash() {
        let mut a = fixtures::event("0xA1", 1000, 0, "100");
        let mut b = a.clone();
        a.block_hash = "0x01".to_string();
        b.block_hash = "0x02".to_string();
        assert_eq!(a.dedup_key(), b.dedup_key());
    }

    #[test]
    fn test_state_as_str_roundtrip() {
        for state in [
            RelayState::Observed,
            RelayState::Finalized,
            RelayState::Submitted,
            RelayState::Confirmed,
            RelayState::Retrying,
            RelayState::Abandoned,
        ] {
            assert_eq!(state.as_str().parse::<RelayState>().unwrap(), state);
        }
        assert!("pending".parse::<RelayState>().is_err());
    }

    #[test]
    fn test_transitions() {
        use RelayState::*;
        assert!(Observed.can_transition_to(Finalized));
        assert!(Finalized.can_transition_to(Submitted));
        assert!(Submitted.can_transition_to(Confirmed));
        assert!(Submitted.can_transition_to(Retrying));
        assert!(Retrying.can_transition_to(Finalized));
        assert!(Retrying.can_transition_to(Abandoned));
        assert!(Finalized.can_transition_to(Abandoned));

        assert!(!Confirmed.can_transition_to(Abandoned));
        assert!(!Abandoned.can_transition_to(Finalized));
        assert!(!Confirmed.can_transition_to(Submitted));
        assert!(!Submitted.can_transition_to(Finalized));
    }

    #[test]
    fn test_admitted_record_is_consistent() {
        let record = RelayRecord::admitted(fixtures::event("0xA1", 1000, 0, "100"));
        assert_eq!(record.state, RelayState::Finalized);
        assert_eq!(record.attempt_count, 0);
        assert!(record.is_consistent());
        assert!(record.retry_ready(Utc::now()));
    }
}
