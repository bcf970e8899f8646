//! Shared fakes for the relay pipeline integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lockmint_relayer::coordinator::{CoordinatorConfig, RelayCoordinator};
use lockmint_relayer::dispatch::{ActionSubmitter, DispatchConfig, DispatchEngine, TxStatus};
use lockmint_relayer::error::{RelayError, RelayResult};
use lockmint_relayer::finality::FinalityGate;
use lockmint_relayer::reader::{ChainClient, ChainReader, LogFilter, ReaderConfig};
use lockmint_relayer::retry::RetryConfig;
use lockmint_relayer::store::{EventStore, MemoryEventStore};
use lockmint_relayer::types::{DedupKey, LockPayload, SourceEvent};

pub const CHAIN: &str = "chainA";
pub const BENEFICIARY: &str = "0x00000000000000000000000000000000000000b0";

pub fn lock_event(tx_hash: &str, block_number: u64, log_index: u64, amount: &str) -> SourceEvent {
    SourceEvent {
        source_chain_id: CHAIN.to_string(),
        contract_address: "0x00000000000000000000000000000000000000a1".to_string(),
        block_hash: canonical_hash(block_number),
        block_number,
        tx_hash: tx_hash.to_string(),
        log_index,
        payload: LockPayload {
            beneficiary: BENEFICIARY.to_string(),
            amount: amount.to_string(),
            asset_id: "TKA".to_string(),
            metadata: serde_json::json!({}),
        },
    }
}

pub fn canonical_hash(height: u64) -> String {
    format!("0xblock{}", height)
}

/// Source chain whose head, logs and canonical hashes are set by the test
pub struct FakeChain {
    finalized: AtomicU64,
    events: Mutex<Vec<SourceEvent>>,
    /// Overrides for `canonical_block_hash`
    reorged: Mutex<HashMap<u64, String>>,
    fail_fetches: AtomicU32,
    queries: Mutex<Vec<LogFilter>>,
}

impl FakeChain {
    pub fn new(finalized: u64, events: Vec<SourceEvent>) -> Arc<Self> {
        Arc::new(Self {
            finalized: AtomicU64::new(finalized),
            events: Mutex::new(events),
            reorged: Mutex::new(HashMap::new()),
            fail_fetches: AtomicU32::new(0),
            queries: Mutex::new(Vec::new()),
        })
    }

    pub fn set_finalized(&self, height: u64) {
        self.finalized.store(height, Ordering::SeqCst);
    }

    pub fn push_event(&self, event: SourceEvent) {
        self.events.lock().unwrap().push(event);
    }

    pub fn reorg(&self, height: u64, new_hash: &str) {
        self.reorged.lock().unwrap().insert(height, new_hash.to_string());
    }

    pub fn fail_next_fetches(&self, count: u32) {
        self.fail_fetches.store(count, Ordering::SeqCst);
    }

    pub fn queries(&self) -> Vec<LogFilter> {
        self.queries.lock().unwrap().clone()
    }

    pub fn clear_queries(&self) {
        self.queries.lock().unwrap().clear();
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    fn chain_id(&self) -> &str {
        CHAIN
    }

    async fn fetch_logs(&self, filter: &LogFilter) -> RelayResult<Vec<SourceEvent>> {
        if self.fail_fetches.load(Ordering::SeqCst) > 0 {
            self.fail_fetches.fetch_sub(1, Ordering::SeqCst);
            return Err(RelayError::TransientNetwork("connection refused".into()));
        }
        self.queries.lock().unwrap().push(*filter);
        Ok(self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.block_number >= filter.from_block && e.block_number <= filter.to_block)
            .cloned()
            .collect())
    }

    async fn finalized_height(&self) -> RelayResult<u64> {
        Ok(self.finalized.load(Ordering::SeqCst))
    }

    async fn canonical_block_hash(&self, height: u64) -> RelayResult<Option<String>> {
        if height > self.finalized.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(Some(
            self.reorged
                .lock()
                .unwrap()
                .get(&height)
                .cloned()
                .unwrap_or_else(|| canonical_hash(height)),
        ))
    }
}

/// Destination chain that records every mint it is asked for
pub struct FakeSubmitter {
    submitted: Mutex<Vec<DedupKey>>,
    /// Results handed out by `submit` before falling back to success
    submit_script: Mutex<VecDeque<RelayResult<()>>>,
    statuses: Mutex<HashMap<String, TxStatus>>,
    default_status: Mutex<TxStatus>,
    /// Mints the destination already knows about, as seen by `lookup`
    landed: Mutex<HashMap<DedupKey, String>>,
    /// Whether a submitted mint becomes visible to `lookup`
    land_on_submit: Mutex<bool>,
    next_tx: AtomicU32,
}

impl FakeSubmitter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            submitted: Mutex::new(Vec::new()),
            submit_script: Mutex::new(VecDeque::new()),
            statuses: Mutex::new(HashMap::new()),
            default_status: Mutex::new(TxStatus::Confirmed(100)),
            landed: Mutex::new(HashMap::new()),
            land_on_submit: Mutex::new(false),
            next_tx: AtomicU32::new(1),
        })
    }

    pub fn script_submit(&self, result: RelayResult<()>) {
        self.submit_script.lock().unwrap().push_back(result);
    }

    pub fn set_status(&self, tx_hash: &str, status: TxStatus) {
        self.statuses.lock().unwrap().insert(tx_hash.to_string(), status);
    }

    pub fn set_default_status(&self, status: TxStatus) {
        *self.default_status.lock().unwrap() = status;
    }

    pub fn land_on_submit(&self, enabled: bool) {
        *self.land_on_submit.lock().unwrap() = enabled;
    }

    pub fn submitted(&self) -> Vec<DedupKey> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn submit_count(&self) -> usize {
        self.submitted.lock().unwrap().len()
    }

    /// Keys submitted more than once
    pub fn duplicates(&self) -> Vec<DedupKey> {
        let mut seen = HashSet::new();
        self.submitted()
            .into_iter()
            .filter(|k| !seen.insert(k.clone()))
            .collect()
    }
}

#[async_trait]
impl ActionSubmitter for FakeSubmitter {
    async fn submit(
        &self,
        key: &DedupKey,
        _beneficiary: &str,
        _amount: &str,
        _asset_id: &str,
    ) -> RelayResult<String> {
        self.submitted.lock().unwrap().push(key.clone());
        let tx_hash = format!("0xtx{}", self.next_tx.fetch_add(1, Ordering::SeqCst));
        if *self.land_on_submit.lock().unwrap() {
            self.landed.lock().unwrap().insert(key.clone(), tx_hash.clone());
        }
        // A scripted error after landing models a send whose response was lost
        if let Some(scripted) = self.submit_script.lock().unwrap().pop_front() {
            scripted?;
        }
        Ok(tx_hash)
    }

    async fn status(&self, tx_hash: &str) -> RelayResult<TxStatus> {
        let status = self.statuses.lock().unwrap().get(tx_hash).copied();
        Ok(status.unwrap_or(*self.default_status.lock().unwrap()))
    }

    async fn lookup(&self, key: &DedupKey) -> RelayResult<Option<String>> {
        Ok(self.landed.lock().unwrap().get(key).cloned())
    }
}

pub fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        backoff_multiplier: 2.0,
    }
}

/// Knobs for one pipeline instance
#[derive(Clone)]
pub struct Harness {
    pub required_confirmations: u64,
    pub scan_lag: u64,
    pub max_block_range: u64,
    pub max_attempts: u32,
    pub destination_confirmations: u64,
    pub confirmation_timeout: Duration,
    pub dispatch_workers: usize,
}

impl Default for Harness {
    fn default() -> Self {
        Self {
            required_confirmations: 6,
            scan_lag: 6,
            max_block_range: 100,
            max_attempts: 5,
            destination_confirmations: 3,
            confirmation_timeout: Duration::from_secs(30),
            dispatch_workers: 1,
        }
    }
}

impl Harness {
    pub fn coordinator(
        &self,
        chain: Arc<FakeChain>,
        store: Arc<MemoryEventStore>,
        submitter: Arc<FakeSubmitter>,
    ) -> RelayCoordinator {
        let poll = Duration::from_millis(5);
        let store: Arc<dyn EventStore> = store;
        let reader = ChainReader::new(
            chain.clone(),
            ReaderConfig {
                max_block_range: self.max_block_range,
                scan_lag: self.scan_lag,
                poll_interval: poll,
                reconnect: RetryConfig::reconnect(Duration::from_millis(1), Duration::from_millis(5)),
            },
        );
        let gate = FinalityGate::new(chain, store.clone(), self.required_confirmations, poll);
        let engine = DispatchEngine::new(
            store.clone(),
            submitter,
            DispatchConfig {
                retry: fast_retry(self.max_attempts),
                destination_confirmations: self.destination_confirmations,
                confirmation_timeout: self.confirmation_timeout,
                poll_interval: poll,
                supported_assets: ["TKA".to_string()].into_iter().collect(),
            },
        );
        RelayCoordinator::new(
            store,
            reader,
            gate,
            engine,
            CoordinatorConfig {
                start_block: 0,
                dispatch_workers: self.dispatch_workers,
                queue_capacity: 8,
                sweep_interval: Duration::from_millis(10),
                heartbeat_interval: Duration::from_secs(60),
                backoff: RetryConfig::reconnect(Duration::from_millis(1), Duration::from_millis(5)),
            },
        )
    }
}

/// Poll `check` until it holds or five seconds pass
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}
