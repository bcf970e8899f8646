//! In-memory event store
//!
//! Same contract as the Postgres store, held in process memory. Used by the
//! test suites and for dry runs; an `Arc` of it outlives a coordinator, which
//! is how restart tests model durable state.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{validate_update, CreateOutcome, EventStore};
use crate::error::{RelayError, RelayResult};
use crate::types::{ChainCheckpoint, DedupKey, RelayRecord, RelayState};

#[derive(Debug, Default)]
pub struct MemoryEventStore {
    records: RwLock<HashMap<DedupKey, RelayRecord>>,
    checkpoints: RwLock<HashMap<String, u64>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records in any state
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn create_if_absent(&self, record: &RelayRecord) -> RelayResult<CreateOutcome> {
        let mut records = self.records.write().await;
        if let Some(existing) = records.get(&record.dedup_key) {
            return Ok(CreateOutcome::AlreadyPresent(Box::new(existing.clone())));
        }
        records.insert(record.dedup_key.clone(), record.clone());
        Ok(CreateOutcome::Created)
    }

    async fn get(&self, key: &DedupKey) -> RelayResult<Option<RelayRecord>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn compare_and_swap(
        &self,
        expected: RelayState,
        record: &RelayRecord,
    ) -> RelayResult<()> {
        let mut records = self.records.write().await;
        let current = records
            .get_mut(&record.dedup_key)
            .ok_or_else(|| RelayError::conflict(&record.dedup_key, expected, None))?;

        validate_update(current, expected, record)?;

        let mut next = record.clone();
        next.created_at = current.created_at;
        next.updated_at = Utc::now();
        *current = next;
        Ok(())
    }

    async fn scan_by_state(&self, states: &[RelayState]) -> RelayResult<Vec<RelayRecord>> {
        let records = self.records.read().await;
        let mut matching: Vec<RelayRecord> = records
            .values()
            .filter(|r| states.contains(&r.state))
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.event.position().cmp(&b.event.position()))
        });
        Ok(matching)
    }

    async fn freeze(&self, key: &DedupKey, reason: &str) -> RelayResult<()> {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(key) {
            record.frozen = true;
            record.last_error = Some(reason.to_string());
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn scan_frozen(&self) -> RelayResult<Vec<RelayRecord>> {
        let records = self.records.read().await;
        let mut frozen: Vec<RelayRecord> = records.values().filter(|r| r.frozen).cloned().collect();
        frozen.sort_by_key(|r| r.created_at);
        Ok(frozen)
    }

    async fn checkpoint(&self, chain_id: &str) -> RelayResult<Option<ChainCheckpoint>> {
        Ok(self
            .checkpoints
            .read()
            .await
            .get(chain_id)
            .map(|&height| ChainCheckpoint { height }))
    }

    async fn advance_checkpoint(
        &self,
        chain_id: &str,
        height: u64,
    ) -> RelayResult<ChainCheckpoint> {
        let mut checkpoints = self.checkpoints.write().await;
        let stored = checkpoints.entry(chain_id.to_string()).or_insert(height);
        *stored = (*stored).max(height);
        Ok(ChainCheckpoint { height: *stored })
    }
}
