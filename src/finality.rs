//! Finality gate
//!
//! Releases a source event only once its block is deep enough and still
//! canonical, and is the only place a [`RelayRecord`] is created.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{RelayError, RelayResult};
use crate::metrics;
use crate::reader::ChainClient;
use crate::retry::sleep_or_cancel;
use crate::store::{CreateOutcome, EventStore};
use crate::types::{RelayRecord, SourceEvent};

pub struct FinalityGate {
    client: Arc<dyn ChainClient>,
    store: Arc<dyn EventStore>,
    required_confirmations: u64,
    poll_interval: Duration,
}

impl FinalityGate {
    pub fn new(
        client: Arc<dyn ChainClient>,
        store: Arc<dyn EventStore>,
        required_confirmations: u64,
        poll_interval: Duration,
    ) -> Self {
        Self {
            client,
            store,
            required_confirmations,
            poll_interval,
        }
    }

    pub fn required_confirmations(&self) -> u64 {
        self.required_confirmations
    }

    /// Try to admit `event`.
    ///
    /// Returns `Ok(false)` while the event is not yet deep enough and
    /// `Ok(true)` once a record exists for it (created now or earlier).
    /// A block hash that is no longer canonical yields
    /// [`RelayError::ReorgDiscard`] and no record.
    pub async fn admit(&self, event: &SourceEvent) -> RelayResult<bool> {
        let finalized = self.client.finalized_height().await?;
        let Some(final_at) = event.block_number.checked_add(self.required_confirmations) else {
            return Ok(false);
        };
        if final_at > finalized {
            debug!(
                dedup_key = %event.dedup_key(),
                block_number = event.block_number,
                finalized,
                required = self.required_confirmations,
                "Event not yet final"
            );
            return Ok(false);
        }

        let canonical = self
            .client
            .canonical_block_hash(event.block_number)
            .await?
            .ok_or_else(|| {
                RelayError::TransientNetwork(format!(
                    "no block at height {} despite finalized height {}",
                    event.block_number, finalized
                ))
            })?;

        if !canonical.eq_ignore_ascii_case(&event.block_hash) {
            let key = event.dedup_key();
            metrics::record_reorg_discard(&event.source_chain_id);
            warn!(
                dedup_key = %key,
                block_number = event.block_number,
                observed = %event.block_hash,
                canonical = %canonical,
                "Reorg discard: event block is no longer canonical"
            );
            return Err(RelayError::ReorgDiscard {
                key,
                block_number: event.block_number,
                observed: event.block_hash.clone(),
                canonical,
            });
        }

        let record = RelayRecord::admitted(event.clone());
        match self.store.create_if_absent(&record).await? {
            CreateOutcome::Created => {
                metrics::record_event_admitted(&event.source_chain_id);
                info!(
                    dedup_key = %record.dedup_key,
                    block_number = event.block_number,
                    beneficiary = %event.payload.beneficiary,
                    amount = %event.payload.amount,
                    "Event admitted"
                );
                Ok(true)
            }
            CreateOutcome::AlreadyPresent(existing) => {
                if same_lock(&existing.event, event) {
                    debug!(dedup_key = %record.dedup_key, state = %existing.state, "Event already admitted");
                    return Ok(true);
                }
                let reason = "dedup key re-observed with a different payload".to_string();
                self.store.freeze(&record.dedup_key, &reason).await?;
                metrics::record_store_corruption(&event.source_chain_id);
                error!(
                    dedup_key = %record.dedup_key,
                    stored_amount = %existing.event.payload.amount,
                    observed_amount = %event.payload.amount,
                    "Store corruption: record frozen"
                );
                Err(RelayError::StoreCorruption {
                    key: record.dedup_key,
                    reason,
                })
            }
        }
    }

    /// Poll until `event` is final, then admit it
    pub async fn admit_when_final(
        &self,
        event: &SourceEvent,
        cancel: &CancellationToken,
    ) -> RelayResult<()> {
        loop {
            if self.admit(event).await? {
                return Ok(());
            }
            sleep_or_cancel(self.poll_interval, cancel).await?;
        }
    }
}

/// Whether two observations describe the same lock. The block may differ
/// when a transaction was re-included after a shallow reorg.
fn same_lock(a: &SourceEvent, b: &SourceEvent) -> bool {
    a.source_chain_id == b.source_chain_id
        && a.contract_address.eq_ignore_ascii_case(&b.contract_address)
        && a.payload == b.payload
}
