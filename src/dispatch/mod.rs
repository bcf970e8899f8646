//! Dispatch engine
//!
//! Drives one relay record at a time through
//! `Finalized -> Submitted -> Confirmed`, with `Retrying` and `Abandoned` on
//! failure. Every transition is a compare-and-swap on the state the engine
//! read, and nothing is considered done until that write succeeded.

use alloy::primitives::U256;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{RelayError, RelayResult};
use crate::metrics;
use crate::retry::{sleep_or_cancel, RetryConfig};
use crate::store::EventStore;
use crate::types::{DedupKey, LockPayload, RelayRecord, RelayState};

pub mod evm;
pub mod submitter;

pub use evm::{EvmMintSubmitter, LocalKeySigner, MintLookupConfig};
pub use submitter::{ActionSubmitter, KeySigner, TxStatus};

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub retry: RetryConfig,
    /// Depth a destination tx needs before the record is Confirmed
    pub destination_confirmations: u64,
    /// How long a submitted tx may stay pending or unknown
    pub confirmation_timeout: Duration,
    pub poll_interval: Duration,
    pub supported_assets: HashSet<String>,
}

/// What happened to a record after one call to [`DispatchEngine::process`]
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Confirmed,
    Abandoned,
    /// Waiting in `Retrying` until the given time
    Deferred(Option<DateTime<Utc>>),
    /// Another worker holds the record
    Busy,
    /// Nothing to do (missing, frozen or already terminal)
    Skipped,
}

type ClaimSet = Arc<Mutex<HashSet<DedupKey>>>;

/// Exclusive claim on a dedup key, released on drop
struct Claim {
    set: ClaimSet,
    key: DedupKey,
}

impl Claim {
    fn try_acquire(set: &ClaimSet, key: &DedupKey) -> Option<Self> {
        let mut guard = set.lock().unwrap_or_else(|e| e.into_inner());
        if !guard.insert(key.clone()) {
            return None;
        }
        metrics::set_in_flight(guard.len());
        Some(Self {
            set: set.clone(),
            key: key.clone(),
        })
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        let mut guard = self.set.lock().unwrap_or_else(|e| e.into_inner());
        guard.remove(&self.key);
        metrics::set_in_flight(guard.len());
    }
}

/// Check a payload before any destination call. `Err` carries the reason the
/// record can never be relayed.
pub fn validate_payload(payload: &LockPayload, supported_assets: &HashSet<String>) -> Result<(), String> {
    if payload.beneficiary.trim().is_empty() {
        return Err("invalid parameters: empty beneficiary".to_string());
    }
    let amount = U256::from_str_radix(&payload.amount, 10)
        .map_err(|e| format!("invalid amount {:?}: {}", payload.amount, e))?;
    if amount.is_zero() {
        return Err("invalid amount: zero".to_string());
    }
    if !supported_assets.contains(&payload.asset_id) {
        return Err(format!("unsupported asset {}", payload.asset_id));
    }
    Ok(())
}

pub struct DispatchEngine {
    store: Arc<dyn EventStore>,
    submitter: Arc<dyn ActionSubmitter>,
    config: DispatchConfig,
    in_flight: ClaimSet,
}

impl DispatchEngine {
    pub fn new(
        store: Arc<dyn EventStore>,
        submitter: Arc<dyn ActionSubmitter>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            submitter,
            config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn is_in_flight(&self, key: &DedupKey) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Drive the record for `key` as far as it can go now.
    ///
    /// Returns once the record is terminal, waiting out a retry backoff, or
    /// held by another worker. Store corruption freezes the record.
    pub async fn process(
        &self,
        key: &DedupKey,
        cancel: &CancellationToken,
    ) -> RelayResult<DispatchOutcome> {
        let Some(_claim) = Claim::try_acquire(&self.in_flight, key) else {
            debug!(dedup_key = %key, "Record already in flight");
            return Ok(DispatchOutcome::Busy);
        };

        match self.drive(key, cancel).await {
            Err(RelayError::StoreCorruption { key, reason }) => {
                self.freeze(&key, &reason).await;
                Err(RelayError::StoreCorruption { key, reason })
            }
            other => other,
        }
    }

    async fn drive(
        &self,
        key: &DedupKey,
        cancel: &CancellationToken,
    ) -> RelayResult<DispatchOutcome> {
        loop {
            let Some(record) = self.store.get(key).await? else {
                warn!(dedup_key = %key, "Dispatch requested for unknown record");
                return Ok(DispatchOutcome::Skipped);
            };
            if record.frozen {
                debug!(dedup_key = %key, "Record is frozen, skipping");
                return Ok(DispatchOutcome::Skipped);
            }

            match record.state {
                RelayState::Confirmed | RelayState::Abandoned => {
                    return Ok(DispatchOutcome::Skipped)
                }
                RelayState::Observed => {
                    let mut next = record.clone();
                    next.state = RelayState::Finalized;
                    self.transition(RelayState::Observed, &next).await?;
                }
                RelayState::Finalized => self.dispatch(record).await?,
                RelayState::Submitted => {
                    if self.track(record, cancel).await? {
                        return Ok(DispatchOutcome::Confirmed);
                    }
                }
                RelayState::Retrying => {
                    if !self.config.retry.should_retry(record.attempt_count) {
                        let reason = format!(
                            "retry budget exhausted after {} attempts: {}",
                            record.attempt_count,
                            record.last_error.as_deref().unwrap_or("unknown error")
                        );
                        self.abandon(record, RelayState::Retrying, &reason, "exhausted")
                            .await?;
                        return Ok(DispatchOutcome::Abandoned);
                    }
                    if !record.retry_ready(Utc::now()) {
                        return Ok(DispatchOutcome::Deferred(record.next_retry_at));
                    }
                    let mut next = record.clone();
                    next.state = RelayState::Finalized;
                    next.next_retry_at = None;
                    self.transition(RelayState::Retrying, &next).await?;
                }
            }

            if cancel.is_cancelled() {
                return Err(RelayError::Cancelled);
            }
        }
    }

    /// One dispatch attempt from `Finalized`
    async fn dispatch(&self, record: RelayRecord) -> RelayResult<()> {
        if let Err(reason) = validate_payload(&record.event.payload, &self.config.supported_assets) {
            return self
                .abandon(record, RelayState::Finalized, &reason, "invalid_payload")
                .await;
        }

        // Submitting blind could double-mint, so a failed lookup uses up an
        // attempt like a failed send
        match self.submitter.lookup(&record.dedup_key).await {
            Ok(Some(tx_hash)) => {
                info!(
                    dedup_key = %record.dedup_key,
                    tx_hash = %tx_hash,
                    "Destination already has this action, tracking existing tx"
                );
                metrics::record_dispatch_attempt("recovered");
                return self.mark_submitted(record, tx_hash).await;
            }
            Ok(None) => {}
            Err(RelayError::Cancelled) => return Err(RelayError::Cancelled),
            Err(e) => {
                metrics::record_dispatch_attempt("lookup_failed");
                let reason = format!("idempotency lookup failed: {}", e);
                return self.retry_later(record, RelayState::Finalized, &reason).await;
            }
        }

        let payload = &record.event.payload;
        let result = self
            .submitter
            .submit(
                &record.dedup_key,
                &payload.beneficiary,
                &payload.amount,
                &payload.asset_id,
            )
            .await;

        match result {
            Ok(tx_hash) => {
                metrics::record_dispatch_attempt("submitted");
                self.mark_submitted(record, tx_hash).await
            }
            Err(RelayError::PermanentDispatch(reason)) => {
                metrics::record_dispatch_attempt("permanent");
                self.abandon(record, RelayState::Finalized, &reason, "permanent")
                    .await
            }
            Err(RelayError::Cancelled) => Err(RelayError::Cancelled),
            Err(e) => {
                metrics::record_dispatch_attempt("transient");
                self.retry_later(record, RelayState::Finalized, &e.to_string())
                    .await
            }
        }
    }

    /// Poll the destination until the tx is deep enough. Returns `false` when
    /// the record was moved to `Retrying` instead.
    async fn track(&self, record: RelayRecord, cancel: &CancellationToken) -> RelayResult<bool> {
        let Some(tx_hash) = record.destination_tx_hash.clone() else {
            return Err(RelayError::StoreCorruption {
                key: record.dedup_key,
                reason: "submitted record without destination tx hash".to_string(),
            });
        };
        let timeout = chrono::Duration::from_std(self.config.confirmation_timeout)
            .unwrap_or(chrono::Duration::seconds(600));
        let deadline = record.updated_at + timeout;

        loop {
            match self.submitter.status(&tx_hash).await {
                Ok(TxStatus::Confirmed(depth)) if depth >= self.config.destination_confirmations => {
                    let mut next = record.clone();
                    next.state = RelayState::Confirmed;
                    next.last_error = None;
                    self.transition(RelayState::Submitted, &next).await?;

                    let latency = (Utc::now() - record.created_at).num_milliseconds() as f64 / 1000.0;
                    metrics::record_confirmed(&record.event.source_chain_id, latency);
                    info!(
                        dedup_key = %record.dedup_key,
                        tx_hash = %tx_hash,
                        depth,
                        attempts = record.attempt_count,
                        "Relay confirmed"
                    );
                    return Ok(true);
                }
                Ok(TxStatus::Confirmed(depth)) => {
                    debug!(dedup_key = %record.dedup_key, depth, "Waiting for destination confirmations");
                }
                Ok(TxStatus::Failed) => {
                    self.retry_later(record, RelayState::Submitted, "destination tx reverted")
                        .await?;
                    return Ok(false);
                }
                Ok(status @ (TxStatus::Pending | TxStatus::Unknown)) => {
                    if Utc::now() >= deadline {
                        let reason = format!(
                            "destination tx {} not confirmed within {:?} ({:?})",
                            tx_hash, self.config.confirmation_timeout, status
                        );
                        self.retry_later(record, RelayState::Submitted, &reason)
                            .await?;
                        return Ok(false);
                    }
                    debug!(dedup_key = %record.dedup_key, tx_hash = %tx_hash, ?status, "Destination tx not yet mined");
                }
                Err(RelayError::Cancelled) => return Err(RelayError::Cancelled),
                Err(e) => {
                    warn!(dedup_key = %record.dedup_key, tx_hash = %tx_hash, error = %e, "Status check failed");
                }
            }

            sleep_or_cancel(self.config.poll_interval, cancel).await?;
        }
    }

    async fn mark_submitted(&self, record: RelayRecord, tx_hash: String) -> RelayResult<()> {
        let mut next = record;
        next.state = RelayState::Submitted;
        next.destination_tx_hash = Some(tx_hash);
        next.next_retry_at = None;
        self.transition(RelayState::Finalized, &next).await
    }

    async fn retry_later(
        &self,
        record: RelayRecord,
        from: RelayState,
        reason: &str,
    ) -> RelayResult<()> {
        let mut next = record;
        next.state = RelayState::Retrying;
        next.attempt_count += 1;
        next.destination_tx_hash = None;
        next.last_error = Some(reason.to_string());
        next.next_retry_at = Some(self.config.retry.next_retry_after(next.attempt_count));
        warn!(
            dedup_key = %next.dedup_key,
            attempt = next.attempt_count,
            max_attempts = self.config.retry.max_attempts,
            retry_at = ?next.next_retry_at,
            error = %reason,
            "Dispatch attempt failed"
        );
        self.transition(from, &next).await
    }

    async fn abandon(
        &self,
        record: RelayRecord,
        from: RelayState,
        reason: &str,
        metric_reason: &str,
    ) -> RelayResult<()> {
        let mut next = record;
        next.state = RelayState::Abandoned;
        next.destination_tx_hash = None;
        next.next_retry_at = None;
        next.last_error = Some(reason.to_string());
        self.transition(from, &next).await?;

        metrics::record_abandoned(&next.event.source_chain_id, metric_reason);
        error!(
            dedup_key = %next.dedup_key,
            attempts = next.attempt_count,
            beneficiary = %next.event.payload.beneficiary,
            amount = %next.event.payload.amount,
            error = %reason,
            "Relay abandoned, operator intervention required"
        );
        Ok(())
    }

    async fn transition(&self, expected: RelayState, next: &RelayRecord) -> RelayResult<()> {
        self.store.compare_and_swap(expected, next).await?;
        info!(
            dedup_key = %next.dedup_key,
            from = %expected,
            to = %next.state,
            attempt = next.attempt_count,
            "State transition"
        );
        Ok(())
    }

    async fn freeze(&self, key: &DedupKey, reason: &str) {
        let chain = key.as_str().split(':').next().unwrap_or_default().to_string();
        metrics::record_store_corruption(&chain);
        error!(dedup_key = %key, reason = %reason, "Store corruption: freezing record");
        if let Err(e) = self.store.freeze(key, reason).await {
            error!(dedup_key = %key, error = %e, "Failed to freeze record");
        }
    }
}
