//! Source chain reader
//!
//! Turns a [`ChainClient`] into a lazy, ordered, cancellable stream of
//! [`ReaderItem`]s. The reader is stateless: everything it needs to resume is
//! the height passed to [`ChainReader::watch`].

use async_trait::async_trait;
use futures::stream::{self, Stream};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{RelayError, RelayResult};
use crate::metrics;
use crate::retry::{sleep_or_cancel, RetryConfig};
use crate::types::SourceEvent;

pub mod evm;

pub use evm::EvmChainClient;

/// Inclusive block range of one log query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogFilter {
    pub from_block: u64,
    pub to_block: u64,
}

/// Narrow RPC surface of a source chain
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Identifier used in dedup keys and checkpoints
    fn chain_id(&self) -> &str;

    /// Lock events of the watched contract within `filter`
    async fn fetch_logs(&self, filter: &LogFilter) -> RelayResult<Vec<SourceEvent>>;

    async fn finalized_height(&self) -> RelayResult<u64>;

    /// Hash of the canonical block at `height`, `None` if the chain has no
    /// block there yet
    async fn canonical_block_hash(&self, height: u64) -> RelayResult<Option<String>>;
}

/// Item yielded by [`ChainReader::watch`]
#[derive(Debug, Clone, PartialEq)]
pub enum ReaderItem {
    Event(SourceEvent),
    /// Every event up to and including this height has been yielded
    Scanned(u64),
}

#[derive(Debug, Clone)]
pub struct ReaderConfig {
    pub max_block_range: u64,
    /// Blocks below the finalized height left unscanned, so a shallow reorg
    /// is seen before its range is passed
    pub scan_lag: u64,
    pub poll_interval: Duration,
    pub reconnect: RetryConfig,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            max_block_range: 2000,
            scan_lag: 0,
            poll_interval: Duration::from_secs(2),
            reconnect: RetryConfig::reconnect(Duration::from_secs(1), Duration::from_secs(30)),
        }
    }
}

#[derive(Clone)]
pub struct ChainReader {
    client: Arc<dyn ChainClient>,
    config: ReaderConfig,
}

impl ChainReader {
    pub fn new(client: Arc<dyn ChainClient>, config: ReaderConfig) -> Self {
        Self { client, config }
    }

    pub fn chain_id(&self) -> &str {
        self.client.chain_id()
    }

    pub async fn current_finalized_height(&self) -> RelayResult<u64> {
        self.client.finalized_height().await
    }

    /// Stream events from `from_height` onward in `(block_number, log_index)`
    /// order. Ends only when `cancel` fires.
    pub fn watch(
        &self,
        from_height: u64,
        cancel: CancellationToken,
    ) -> impl Stream<Item = ReaderItem> + Send + 'static {
        let cursor = ScanCursor {
            client: self.client.clone(),
            config: self.config.clone(),
            next_height: from_height,
            pending: VecDeque::new(),
            failures: 0,
            cancel,
        };
        stream::unfold(cursor, |mut cursor| async move {
            let item = cursor.next_item().await?;
            Some((item, cursor))
        })
    }
}

struct ScanCursor {
    client: Arc<dyn ChainClient>,
    config: ReaderConfig,
    /// First height not yet fully emitted
    next_height: u64,
    pending: VecDeque<ReaderItem>,
    failures: u32,
    cancel: CancellationToken,
}

impl ScanCursor {
    async fn next_item(&mut self) -> Option<ReaderItem> {
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            if let Some(item) = self.pending.pop_front() {
                return Some(item);
            }

            match self.scan_next_range().await {
                Ok(true) => self.failures = 0,
                Ok(false) => {
                    self.failures = 0;
                    if sleep_or_cancel(self.config.poll_interval, &self.cancel)
                        .await
                        .is_err()
                    {
                        return None;
                    }
                }
                Err(RelayError::Cancelled) => return None,
                Err(e) => {
                    let delay = self.config.reconnect.jittered_backoff(self.failures);
                    self.failures = self.failures.saturating_add(1);
                    metrics::record_reader_error(self.client.chain_id());
                    warn!(
                        chain = %self.client.chain_id(),
                        next_height = self.next_height,
                        attempt = self.failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Chain read failed, reconnecting"
                    );
                    if sleep_or_cancel(delay, &self.cancel).await.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    /// Fetch one chunk. Returns `false` when the cursor is already at the
    /// finalized head. Nothing is queued unless the whole chunk was fetched.
    async fn scan_next_range(&mut self) -> RelayResult<bool> {
        let finalized = self
            .client
            .finalized_height()
            .await?
            .saturating_sub(self.config.scan_lag);
        if finalized < self.next_height {
            return Ok(false);
        }

        let range = self.config.max_block_range.max(1);
        let to_block = finalized.min(self.next_height.saturating_add(range - 1));
        let filter = LogFilter {
            from_block: self.next_height,
            to_block,
        };

        let mut events = self.client.fetch_logs(&filter).await?;
        events.retain(|e| e.block_number >= filter.from_block && e.block_number <= filter.to_block);
        events.sort_by_key(|e| e.position());
        events.dedup_by_key(|e| e.position());

        debug!(
            chain = %self.client.chain_id(),
            from = filter.from_block,
            to = filter.to_block,
            events = events.len(),
            "Scanned block range"
        );

        self.pending.extend(events.into_iter().map(ReaderItem::Event));
        self.pending.push_back(ReaderItem::Scanned(to_block));
        self.next_height = to_block + 1;
        Ok(true)
    }
}
