//! Durable event store
//!
//! The store is the single owner of relay state. Callers never keep their
//! own maps of pending events: they read a record, compute the next state
//! and write it back with a compare-and-swap on the state they read.

use async_trait::async_trait;

use crate::error::{RelayError, RelayResult};
use crate::types::{ChainCheckpoint, DedupKey, RelayRecord, RelayState};

pub mod memory;
pub mod postgres;

pub use memory::MemoryEventStore;
pub use postgres::PgEventStore;

/// Result of an atomic create-if-absent
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    Created,
    AlreadyPresent(Box<RelayRecord>),
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert `record` unless its dedup key already exists
    async fn create_if_absent(&self, record: &RelayRecord) -> RelayResult<CreateOutcome>;

    async fn get(&self, key: &DedupKey) -> RelayResult<Option<RelayRecord>>;

    /// Replace the stored record only if it is currently in `expected` state
    /// and not frozen. Fails with `StoreCorruption` otherwise.
    async fn compare_and_swap(&self, expected: RelayState, record: &RelayRecord)
        -> RelayResult<()>;

    /// All records whose state is one of `states`, oldest first
    async fn scan_by_state(&self, states: &[RelayState]) -> RelayResult<Vec<RelayRecord>>;

    /// Mark a record frozen so no automatic process touches it again
    async fn freeze(&self, key: &DedupKey, reason: &str) -> RelayResult<()>;

    /// Every frozen record regardless of state, oldest first
    async fn scan_frozen(&self) -> RelayResult<Vec<RelayRecord>>;

    async fn checkpoint(&self, chain_id: &str) -> RelayResult<Option<ChainCheckpoint>>;

    /// Raise the checkpoint to `height`; a lower value leaves it unchanged.
    /// Returns the stored checkpoint after the call.
    async fn advance_checkpoint(&self, chain_id: &str, height: u64)
        -> RelayResult<ChainCheckpoint>;
}

/// Write-side invariants every backend checks before a compare-and-swap
pub(crate) fn validate_update(
    current: &RelayRecord,
    expected: RelayState,
    next: &RelayRecord,
) -> RelayResult<()> {
    let key = &next.dedup_key;
    if current.frozen {
        return Err(RelayError::StoreCorruption {
            key: key.clone(),
            reason: "record is frozen".to_string(),
        });
    }
    if current.state != expected {
        return Err(RelayError::conflict(key, expected, Some(current.state)));
    }
    if expected != next.state && !expected.can_transition_to(next.state) {
        return Err(RelayError::StoreCorruption {
            key: key.clone(),
            reason: format!("illegal transition {} -> {}", expected, next.state),
        });
    }
    if !next.is_consistent() {
        return Err(RelayError::StoreCorruption {
            key: key.clone(),
            reason: format!(
                "destination tx hash presence does not match state {}",
                next.state
            ),
        });
    }
    if next.attempt_count < current.attempt_count {
        return Err(RelayError::StoreCorruption {
            key: key.clone(),
            reason: format!(
                "attempt count would decrease from {} to {}",
                current.attempt_count, next.attempt_count
            ),
        });
    }
    Ok(())
}
