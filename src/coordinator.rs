//! Relay coordinator
//!
//! Wires one source chain to the dispatch engine and owns every task of the
//! pipeline:
//!
//! 1. **Recovery**: every non-terminal, non-frozen record in the store is
//!    queued for dispatch before the reader starts.
//! 2. **Ingestion**: a single task reads the chain in order, admits events
//!    through the finality gate, queues their dedup keys and advances the
//!    checkpoint after each fully admitted range.
//! 3. **Dispatch workers**: a fixed pool pulling dedup keys off a bounded
//!    queue. A full queue pauses ingestion.
//! 4. **Sweeper**: periodically re-queues `Retrying` records whose backoff has
//!    elapsed and any non-terminal record that is neither queued nor in flight.
//!
//! Cancelling the shutdown token stops the reader, lets in-flight dispatch
//! attempts finish or fail, and `run` returns once every task has exited.

use futures::StreamExt;
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatch::{DispatchEngine, DispatchOutcome};
use crate::error::{RelayError, RelayResult};
use crate::finality::FinalityGate;
use crate::metrics;
use crate::reader::{ChainReader, ReaderItem};
use crate::retry::{sleep_or_cancel, RetryConfig};
use crate::store::EventStore;
use crate::types::{DedupKey, RelayState};

/// Counters shared between the pipeline and the HTTP server
#[derive(Debug, Default, Clone, Serialize)]
pub struct RelayStats {
    pub source_chain_id: String,
    pub recovery_complete: bool,
    pub reader_running: bool,
    pub recovered_records: u64,
    pub last_scanned_height: Option<u64>,
    pub events_observed: u64,
    pub events_admitted: u64,
    pub reorg_discards: u64,
    pub confirmed: u64,
    pub abandoned: u64,
    pub frozen: u64,
}

impl RelayStats {
    pub fn is_ready(&self) -> bool {
        self.recovery_complete && self.reader_running
    }
}

pub type SharedStats = Arc<RwLock<RelayStats>>;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// First height scanned when the store has no checkpoint
    pub start_block: u64,
    pub dispatch_workers: usize,
    pub queue_capacity: usize,
    pub sweep_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Backoff for store and chain errors that must not skip work
    pub backoff: RetryConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            start_block: 0,
            dispatch_workers: 4,
            queue_capacity: 256,
            sweep_interval: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(60),
            backoff: RetryConfig::reconnect(Duration::from_secs(1), Duration::from_secs(30)),
        }
    }
}

/// Bounded queue of dedup keys that never holds the same key twice
#[derive(Clone)]
struct DispatchQueue {
    tx: mpsc::Sender<DedupKey>,
    queued: Arc<Mutex<HashSet<DedupKey>>>,
}

impl DispatchQueue {
    fn new(capacity: usize) -> (Self, mpsc::Receiver<DedupKey>) {
        let (tx, rx) = mpsc::channel(capacity);
        let queue = Self {
            tx,
            queued: Arc::new(Mutex::new(HashSet::new())),
        };
        (queue, rx)
    }

    fn mark(&self, key: &DedupKey) -> bool {
        self.queued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone())
    }

    /// Called by a worker once it took `key` off the queue
    fn taken(&self, key: &DedupKey) {
        self.queued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        metrics::set_queue_depth(self.depth());
    }

    fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Queue `key`, waiting for room. Already-queued keys are a no-op.
    async fn push(&self, key: DedupKey, cancel: &CancellationToken) -> RelayResult<()> {
        if !self.mark(&key) {
            return Ok(());
        }
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(RelayError::Cancelled),
            sent = self.tx.send(key.clone()) => sent.map_err(|_| RelayError::Cancelled),
        };
        if result.is_err() {
            self.taken(&key);
        } else {
            metrics::set_queue_depth(self.depth());
        }
        result
    }

    /// Queue `key` without waiting. Returns `false` if the queue is full.
    fn try_push(&self, key: DedupKey) -> bool {
        if !self.mark(&key) {
            return true;
        }
        match self.tx.try_send(key.clone()) {
            Ok(()) => {
                metrics::set_queue_depth(self.depth());
                true
            }
            Err(_) => {
                self.taken(&key);
                false
            }
        }
    }
}

pub struct RelayCoordinator {
    store: Arc<dyn EventStore>,
    reader: ChainReader,
    gate: Arc<FinalityGate>,
    engine: Arc<DispatchEngine>,
    config: CoordinatorConfig,
    stats: SharedStats,
}

impl RelayCoordinator {
    pub fn new(
        store: Arc<dyn EventStore>,
        reader: ChainReader,
        gate: FinalityGate,
        engine: DispatchEngine,
        config: CoordinatorConfig,
    ) -> Self {
        let stats = RelayStats {
            source_chain_id: reader.chain_id().to_string(),
            ..Default::default()
        };
        Self {
            store,
            reader,
            gate: Arc::new(gate),
            engine: Arc::new(engine),
            config,
            stats: Arc::new(RwLock::new(stats)),
        }
    }

    /// Handle for the HTTP server
    pub fn stats(&self) -> SharedStats {
        self.stats.clone()
    }

    /// Run the pipeline until `shutdown` is cancelled and every task exits
    pub async fn run(self, shutdown: CancellationToken) -> RelayResult<()> {
        let chain_id = self.reader.chain_id().to_string();
        let (queue, rx) = DispatchQueue::new(self.config.queue_capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let mut tasks = JoinSet::new();

        for worker_id in 0..self.config.dispatch_workers.max(1) {
            tasks.spawn(dispatch_worker(
                worker_id,
                rx.clone(),
                queue.clone(),
                self.engine.clone(),
                self.stats.clone(),
                shutdown.clone(),
            ));
        }

        let recovery = self.recover(&queue, &shutdown).await;
        let resume_height = match recovery {
            Ok(height) => Some(height),
            Err(RelayError::Cancelled) => None,
            Err(e) => {
                error!(chain = %chain_id, error = %e, "Recovery failed, shutting down");
                shutdown.cancel();
                drain(&mut tasks).await;
                return Err(e);
            }
        };

        if let Some(from_height) = resume_height {
            info!(chain = %chain_id, from_height, "Starting chain reader");
            tasks.spawn(ingest(
                self.reader.clone(),
                from_height,
                self.gate.clone(),
                self.store.clone(),
                queue.clone(),
                self.stats.clone(),
                self.config.backoff.clone(),
                shutdown.clone(),
            ));
            tasks.spawn(sweep(
                self.store.clone(),
                self.engine.clone(),
                queue.clone(),
                self.config.clone(),
                shutdown.clone(),
            ));
        }
        drop(queue);

        shutdown.cancelled().await;
        info!(chain = %chain_id, "Shutdown requested, waiting for pipeline tasks");
        drain(&mut tasks).await;
        info!(chain = %chain_id, "Relay pipeline stopped");
        Ok(())
    }

    /// Queue every unfinished record and return the height the reader
    /// resumes from
    async fn recover(&self, queue: &DispatchQueue, cancel: &CancellationToken) -> RelayResult<u64> {
        let chain_id = self.reader.chain_id().to_string();
        let backoff = &self.config.backoff;

        let pending = with_backoff("recovery scan", cancel, backoff, || {
            self.store.scan_by_state(&RelayState::NON_TERMINAL)
        })
        .await?;

        let mut recovered = 0u64;
        for record in pending.into_iter().filter(|r| !r.frozen) {
            debug!(dedup_key = %record.dedup_key, state = %record.state, "Recovering record");
            queue.push(record.dedup_key, cancel).await?;
            recovered += 1;
        }

        let checkpoint = with_backoff("checkpoint read", cancel, backoff, || {
            self.store.checkpoint(&chain_id)
        })
        .await?;
        let from_height = checkpoint
            .map(|c| c.height + 1)
            .unwrap_or(self.config.start_block);

        {
            let mut stats = self.stats.write().await;
            stats.recovered_records = recovered;
            stats.recovery_complete = true;
            stats.last_scanned_height = checkpoint.map(|c| c.height);
        }
        info!(
            chain = %chain_id,
            recovered,
            checkpoint = ?checkpoint.map(|c| c.height),
            "Recovery complete"
        );
        Ok(from_height)
    }
}

async fn drain(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "Pipeline task failed");
        }
    }
}

/// Retry `op` on errors that must not be skipped
async fn with_backoff<T, F, Fut>(
    what: &str,
    cancel: &CancellationToken,
    backoff: &RetryConfig,
    mut op: F,
) -> RelayResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = RelayResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() || matches!(e, RelayError::MalformedResponse(_)) => {
                let delay = backoff.jittered_backoff(attempt);
                warn!(
                    operation = what,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Operation failed, retrying"
                );
                sleep_or_cancel(delay, cancel).await?;
                attempt = attempt.saturating_add(1);
            }
            Err(e) => return Err(e),
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn ingest(
    reader: ChainReader,
    from_height: u64,
    gate: Arc<FinalityGate>,
    store: Arc<dyn EventStore>,
    queue: DispatchQueue,
    stats: SharedStats,
    backoff: RetryConfig,
    cancel: CancellationToken,
) {
    let chain_id = reader.chain_id().to_string();
    stats.write().await.reader_running = true;
    let mut stream = Box::pin(reader.watch(from_height, cancel.clone()));

    while let Some(item) = stream.next().await {
        match item {
            ReaderItem::Event(event) => {
                metrics::record_event_observed(&chain_id);
                stats.write().await.events_observed += 1;
                let key = event.dedup_key();

                let admitted = with_backoff("admission", &cancel, &backoff, || {
                    gate.admit_when_final(&event, &cancel)
                })
                .await;

                match admitted {
                    Ok(()) => {
                        stats.write().await.events_admitted += 1;
                        if queue.push(key, &cancel).await.is_err() {
                            break;
                        }
                    }
                    Err(RelayError::ReorgDiscard { .. }) => {
                        stats.write().await.reorg_discards += 1;
                    }
                    Err(RelayError::StoreCorruption { .. }) => {
                        stats.write().await.frozen += 1;
                    }
                    Err(RelayError::Cancelled) => break,
                    Err(e) => {
                        error!(dedup_key = %key, error = %e, "Admission failed, stopping ingestion");
                        break;
                    }
                }
            }
            ReaderItem::Scanned(height) => {
                let advanced = with_backoff("checkpoint advance", &cancel, &backoff, || {
                    store.advance_checkpoint(&chain_id, height)
                })
                .await;
                match advanced {
                    Ok(checkpoint) => {
                        metrics::set_checkpoint(&chain_id, checkpoint.height);
                        stats.write().await.last_scanned_height = Some(checkpoint.height);
                        debug!(chain = %chain_id, height = checkpoint.height, "Checkpoint advanced");
                    }
                    Err(_) => break,
                }
            }
        }
    }

    stats.write().await.reader_running = false;
    info!(chain = %chain_id, "Chain reader stopped");
}

async fn dispatch_worker(
    worker_id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<DedupKey>>>,
    queue: DispatchQueue,
    engine: Arc<DispatchEngine>,
    stats: SharedStats,
    cancel: CancellationToken,
) {
    debug!(worker_id, "Dispatch worker started");
    loop {
        let next = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => None,
                key = rx.recv() => key,
            }
        };
        let Some(key) = next else { break };
        queue.taken(&key);

        match engine.process(&key, &cancel).await {
            Ok(DispatchOutcome::Confirmed) => stats.write().await.confirmed += 1,
            Ok(DispatchOutcome::Abandoned) => stats.write().await.abandoned += 1,
            Ok(outcome) => debug!(worker_id, dedup_key = %key, ?outcome, "Dispatch pass finished"),
            Err(RelayError::Cancelled) => break,
            Err(e @ RelayError::StoreCorruption { .. }) => {
                stats.write().await.frozen += 1;
                error!(worker_id, dedup_key = %key, error = %e, "Record frozen");
            }
            Err(e) => {
                warn!(worker_id, dedup_key = %key, error = %e, "Dispatch pass failed, record left for the sweeper");
            }
        }
    }
    debug!(worker_id, "Dispatch worker stopped");
}

async fn sweep(
    store: Arc<dyn EventStore>,
    engine: Arc<DispatchEngine>,
    queue: DispatchQueue,
    config: CoordinatorConfig,
    cancel: CancellationToken,
) {
    let mut sweep_tick = tokio::time::interval(config.sweep_interval);
    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = heartbeat.tick() => {
                info!(
                    queue_depth = queue.depth(),
                    in_flight = engine.in_flight_count(),
                    "Relay heartbeat"
                );
            }
            _ = sweep_tick.tick() => {
                let records = match store.scan_by_state(&RelayState::NON_TERMINAL).await {
                    Ok(records) => records,
                    Err(e) => {
                        warn!(error = %e, "Sweep scan failed");
                        continue;
                    }
                };

                let now = chrono::Utc::now();
                let max_attempts = engine.config().retry.max_attempts;
                let mut requeued = 0usize;
                for record in records {
                    if record.frozen || engine.is_in_flight(&record.dedup_key) {
                        continue;
                    }
                    if record.state == RelayState::Retrying
                        && record.attempt_count < max_attempts
                        && !record.retry_ready(now)
                    {
                        continue;
                    }
                    if !queue.try_push(record.dedup_key) {
                        break;
                    }
                    requeued += 1;
                }
                if requeued > 0 {
                    debug!(requeued, "Sweep re-queued records");
                }
            }
        }
    }
}
