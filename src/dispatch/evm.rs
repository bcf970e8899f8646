//! EVM mint submitter
//!
//! Calls `mint(address user, uint256 amount, uint256 nonce, bytes signature)`
//! on the destination gateway. The nonce is derived from the dedup key, so the
//! gateway's nonce replay check turns a duplicate submission into a revert
//! and `Minted` logs answer the idempotency lookup.
//!
//! The lookup scans the gateway's `Minted` logs in `max_block_range` windows.
//! Blocks at least `settle_depth` below head are folded into an in-memory
//! nonce index once, so later lookups only scan new blocks.
//!
//! Transactions are built with `ProviderBuilder::with_recommended_fillers()`
//! so nonce, gas limit and fees are filled by the provider.

use alloy::network::EthereumWallet;
use alloy::primitives::{keccak256, Address, Bytes, B256, U256};
use alloy::providers::ProviderBuilder;
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use alloy::sol;
use alloy::sol_types::SolEvent;
use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use std::collections::HashMap;
use std::str::FromStr;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::submitter::{ActionSubmitter, KeySigner, TxStatus};
use crate::error::{RelayError, RelayResult};
use crate::retry::dispatch_error;
use crate::rpc::{parse_hex_u64, JsonRpcClient, RpcLog};
use crate::types::DedupKey;

sol! {
    /// Destination gateway interface
    #[sol(rpc)]
    contract MintGateway {
        /// Emitted once per accepted nonce. Only the signature hash is used to
        /// filter logs, so gateways that leave `nonce` unindexed are read too.
        event Minted(address indexed user, uint256 amount, uint256 indexed nonce);

        /// Mint `amount` to `user`; reverts if `nonce` was already used or
        /// `signature` is not from a trusted relayer
        function mint(address user, uint256 amount, uint256 nonce, bytes signature) external;
    }
}

/// uint256 idempotency nonce for a dedup key
pub fn mint_nonce(key: &DedupKey) -> U256 {
    U256::from_be_bytes(keccak256(key.as_str().as_bytes()).0)
}

/// Nonce carried by a `Minted` log: the second indexed topic when the gateway
/// indexes it, otherwise the last data word
fn minted_nonce(log: &RpcLog) -> Option<U256> {
    let word = match log.topics.get(2) {
        Some(topic) => topic.trim_start_matches("0x"),
        None => {
            let data = log.data.trim_start_matches("0x");
            data.get(data.len().checked_sub(64)?..)?
        }
    };
    let bytes = hex::decode(word).ok()?;
    (bytes.len() == 32).then(|| U256::from_be_slice(&bytes))
}

/// keccak256(abi.encodePacked(user, amount, nonce, gateway))
pub fn mint_digest(user: Address, amount: U256, nonce: U256, gateway: Address) -> B256 {
    let mut packed = Vec::with_capacity(20 + 32 + 32 + 20);
    packed.extend_from_slice(user.as_slice());
    packed.extend_from_slice(&amount.to_be_bytes::<32>());
    packed.extend_from_slice(&nonce.to_be_bytes::<32>());
    packed.extend_from_slice(gateway.as_slice());
    keccak256(&packed)
}

/// Local private key signer (EIP-191 personal messages)
#[derive(Clone)]
pub struct LocalKeySigner {
    inner: PrivateKeySigner,
}

impl LocalKeySigner {
    pub fn from_private_key(private_key: &str) -> Result<Self> {
        let inner: PrivateKeySigner = private_key.parse().wrap_err("Invalid private key")?;
        Ok(Self { inner })
    }

    pub fn wallet(&self) -> EthereumWallet {
        EthereumWallet::from(self.inner.clone())
    }
}

impl std::fmt::Debug for LocalKeySigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalKeySigner")
            .field("address", &self.inner.address())
            .field("private_key", &"<redacted>")
            .finish()
    }
}

impl KeySigner for LocalKeySigner {
    fn address(&self) -> String {
        format!("{:?}", self.inner.address())
    }

    fn sign(&self, message: &[u8]) -> RelayResult<Vec<u8>> {
        let signature = self
            .inner
            .sign_message_sync(message)
            .map_err(|e| RelayError::PermanentDispatch(format!("signing failed: {}", e)))?;
        Ok(signature.as_bytes().to_vec())
    }
}

/// Where the idempotency lookup searches for earlier mints
#[derive(Debug, Clone)]
pub struct MintLookupConfig {
    /// First block searched
    pub from_block: u64,
    /// Widest eth_getLogs window per request
    pub max_block_range: u64,
    /// Blocks this far below head are cached as final
    pub settle_depth: u64,
}

impl Default for MintLookupConfig {
    fn default() -> Self {
        Self {
            from_block: 0,
            max_block_range: 2000,
            settle_depth: 12,
        }
    }
}

/// Nonces minted in `from_block..next_block`
struct MintIndex {
    next_block: u64,
    minted: HashMap<U256, String>,
}

pub struct EvmMintSubmitter {
    send_url: String,
    rpc: JsonRpcClient,
    gateway: Address,
    signer: LocalKeySigner,
    chain_id: u64,
    lookup: MintLookupConfig,
    index: Mutex<MintIndex>,
}

impl EvmMintSubmitter {
    pub fn new(
        rpc: JsonRpcClient,
        gateway: Address,
        signer: LocalKeySigner,
        chain_id: u64,
        lookup: MintLookupConfig,
    ) -> Result<Self> {
        let send_url = rpc
            .urls()
            .first()
            .cloned()
            .ok_or_else(|| eyre::eyre!("At least one destination RPC URL is required"))?;

        info!(
            relayer_address = %signer.address(),
            gateway = %gateway,
            chain_id,
            "EVM mint submitter initialized"
        );

        let index = MintIndex {
            next_block: lookup.from_block,
            minted: HashMap::new(),
        };
        Ok(Self {
            send_url,
            rpc,
            gateway,
            signer,
            chain_id,
            lookup,
            index: Mutex::new(index),
        })
    }

    /// Fail unless every destination URL serves the configured chain.
    ///
    /// An unreachable fallback URL is only logged; the send URL must answer.
    pub async fn verify_chain_id(&self) -> Result<()> {
        for (url_index, reported) in self.rpc.chain_ids().await.into_iter().enumerate() {
            match reported {
                Ok(id) if id == self.chain_id => {}
                Ok(id) => {
                    return Err(eyre!(
                        "Destination RPC URL #{} reports chain id {}, expected DEST_CHAIN_ID {}",
                        url_index,
                        id,
                        self.chain_id
                    ));
                }
                Err(e) if url_index == 0 => {
                    return Err(eyre!(
                        "Could not read chain id from destination RPC URL #0: {}",
                        e
                    ));
                }
                Err(e) => {
                    warn!(url_index, error = %e, "Could not read chain id from fallback destination RPC URL");
                }
            }
        }

        info!(chain_id = self.chain_id, "Destination chain id verified");
        Ok(())
    }

    /// `(nonce, tx hash)` of every live `Minted` log in `from..=to`, chunked
    async fn minted_between(&self, from: u64, to: u64) -> RelayResult<Vec<(U256, String)>> {
        let gateway = format!("{:?}", self.gateway);
        let topics = serde_json::json!([format!("{:?}", MintGateway::Minted::SIGNATURE_HASH)]);
        let range = self.lookup.max_block_range.max(1);

        let mut minted = Vec::new();
        let mut chunk_start = from;
        while chunk_start <= to {
            let chunk_end = chunk_start.saturating_add(range - 1).min(to);
            let logs = self
                .rpc
                .logs(&gateway, topics.clone(), chunk_start, chunk_end)
                .await?;
            for log in logs.into_iter().filter(|log| !log.removed) {
                let Some(tx_hash) = log.transaction_hash.clone() else {
                    continue;
                };
                match minted_nonce(&log) {
                    Some(nonce) => minted.push((nonce, tx_hash)),
                    None => warn!(tx_hash = %tx_hash, "Skipping Minted log without a readable nonce"),
                }
            }
            chunk_start = chunk_end + 1;
        }
        Ok(minted)
    }

    /// Extend the index up to `settled`, one window at a time so progress
    /// survives a failed request
    async fn catch_up(&self, index: &mut MintIndex, settled: u64) -> RelayResult<()> {
        let range = self.lookup.max_block_range.max(1);
        while index.next_block <= settled {
            let chunk_end = index.next_block.saturating_add(range - 1).min(settled);
            for (nonce, tx_hash) in self.minted_between(index.next_block, chunk_end).await? {
                index.minted.entry(nonce).or_insert(tx_hash);
            }
            index.next_block = chunk_end + 1;
        }
        Ok(())
    }
}

#[async_trait]
impl ActionSubmitter for EvmMintSubmitter {
    async fn submit(
        &self,
        key: &DedupKey,
        beneficiary: &str,
        amount: &str,
        _asset_id: &str,
    ) -> RelayResult<String> {
        let user = Address::from_str(beneficiary).map_err(|e| {
            RelayError::PermanentDispatch(format!("invalid address {}: {}", beneficiary, e))
        })?;
        let amount = U256::from_str_radix(amount, 10).map_err(|e| {
            RelayError::PermanentDispatch(format!("invalid amount {}: {}", amount, e))
        })?;
        let nonce = mint_nonce(key);
        let digest = mint_digest(user, amount, nonce, self.gateway);
        let signature = self.signer.sign(digest.as_slice())?;

        let url = self
            .send_url
            .parse()
            .map_err(|e| RelayError::PermanentDispatch(format!("invalid RPC URL: {}", e)))?;
        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(self.signer.wallet())
            .on_http(url);
        let contract = MintGateway::new(self.gateway, &provider);

        debug!(dedup_key = %key, nonce = %nonce, user = %user, amount = %amount, "Submitting mint");

        let pending_tx = contract
            .mint(user, amount, nonce, Bytes::from(signature))
            .send()
            .await
            .map_err(|e| dispatch_error(format!("Failed to send mint tx: {}", e)))?;

        let tx_hash = format!("{:?}", pending_tx.tx_hash());
        info!(dedup_key = %key, tx_hash = %tx_hash, "Mint transaction sent");
        Ok(tx_hash)
    }

    async fn status(&self, tx_hash: &str) -> RelayResult<TxStatus> {
        let Some(receipt) = self.rpc.transaction_receipt(tx_hash).await? else {
            return Ok(if self.rpc.transaction_known(tx_hash).await? {
                TxStatus::Pending
            } else {
                TxStatus::Unknown
            });
        };

        if receipt.status.as_deref() == Some("0x0") {
            return Ok(TxStatus::Failed);
        }
        let Some(block) = receipt.block_number.as_deref() else {
            return Ok(TxStatus::Pending);
        };

        let tx_block = parse_hex_u64(block)?;
        let current_block = self.rpc.block_number().await?;
        Ok(TxStatus::Confirmed(current_block.saturating_sub(tx_block)))
    }

    async fn lookup(&self, key: &DedupKey) -> RelayResult<Option<String>> {
        let nonce = mint_nonce(key);
        let head = self.rpc.block_number().await?;

        let tail_start = {
            let mut index = self.index.lock().await;
            if let Some(settled) = head.checked_sub(self.lookup.settle_depth) {
                self.catch_up(&mut index, settled).await?;
            }
            if let Some(tx_hash) = index.minted.get(&nonce) {
                return Ok(Some(tx_hash.clone()));
            }
            index.next_block
        };

        // Unsettled blocks can still reorg, so they are scanned but not cached
        if tail_start > head {
            return Ok(None);
        }
        Ok(self
            .minted_between(tail_start, head)
            .await?
            .into_iter()
            .find(|(minted, _)| *minted == nonce)
            .map(|(_, tx_hash)| tx_hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    // Anvil's first default account
    const TEST_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const CHAIN_ID: u64 = 31338;
    const NODE_MAX_RANGE: u64 = 10_000;

    /// JSON-RPC node that rejects eth_getLogs windows wider than NODE_MAX_RANGE
    struct RangeLimitedNode {
        head: Arc<AtomicU64>,
        logs: Vec<(u64, Value)>,
    }

    impl Respond for RangeLimitedNode {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            let body: Value = serde_json::from_slice(&request.body).unwrap();
            let result = match body["method"].as_str().unwrap() {
                "eth_chainId" => json!(format!("0x{:x}", CHAIN_ID)),
                "eth_blockNumber" => json!(format!("0x{:x}", self.head.load(Ordering::SeqCst))),
                "eth_getLogs" => {
                    let (from, to) = log_window(&body);
                    if to - from + 1 > NODE_MAX_RANGE {
                        return ResponseTemplate::new(200).set_body_json(json!({
                            "jsonrpc": "2.0",
                            "id": 1,
                            "error": {
                                "code": -32005,
                                "message": "query exceeds max block range 10000"
                            }
                        }));
                    }
                    let logs: Vec<Value> = self
                        .logs
                        .iter()
                        .filter(|(block, _)| (from..=to).contains(block))
                        .map(|(_, log)| log.clone())
                        .collect();
                    json!(logs)
                }
                other => panic!("unexpected RPC method {}", other),
            };
            ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "result": result
            }))
        }
    }

    fn log_window(body: &Value) -> (u64, u64) {
        let filter = &body["params"][0];
        (
            parse_hex_u64(filter["fromBlock"].as_str().unwrap()).unwrap(),
            parse_hex_u64(filter["toBlock"].as_str().unwrap()).unwrap(),
        )
    }

    fn minted_log(block: u64, key: &DedupKey, tx_hash: &str, nonce_indexed: bool) -> (u64, Value) {
        let user = format!("0x{}{}", "0".repeat(24), "11".repeat(20));
        let amount = hex::encode(U256::from(100u64).to_be_bytes::<32>());
        let nonce = hex::encode(mint_nonce(key).to_be_bytes::<32>());
        let signature = format!("{:?}", MintGateway::Minted::SIGNATURE_HASH);
        let (topics, data) = if nonce_indexed {
            (json!([signature, user, format!("0x{}", nonce)]), format!("0x{}", amount))
        } else {
            (json!([signature, user]), format!("0x{}{}", amount, nonce))
        };
        let log = json!({
            "address": format!("{:?}", Address::repeat_byte(0x22)),
            "topics": topics,
            "data": data,
            "blockNumber": format!("0x{:x}", block),
            "blockHash": format!("0x{}", "ab".repeat(32)),
            "transactionHash": tx_hash,
            "logIndex": "0x0",
            "removed": false
        });
        (block, log)
    }

    async fn start_node(head: Arc<AtomicU64>, logs: Vec<(u64, Value)>) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(RangeLimitedNode { head, logs })
            .mount(&server)
            .await;
        server
    }

    fn submitter(urls: Vec<String>, chain_id: u64, lookup: MintLookupConfig) -> EvmMintSubmitter {
        let rpc = JsonRpcClient::new(urls).unwrap();
        let signer = LocalKeySigner::from_private_key(TEST_KEY).unwrap();
        EvmMintSubmitter::new(rpc, Address::repeat_byte(0x22), signer, chain_id, lookup).unwrap()
    }

    async fn log_windows(server: &MockServer) -> Vec<(u64, u64)> {
        server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .map(|request| serde_json::from_slice::<Value>(&request.body).unwrap())
            .filter(|body| body["method"] == "eth_getLogs")
            .map(|body| log_window(&body))
            .collect()
    }

    #[test]
    fn test_mint_nonce_is_stable_per_key() {
        let a = DedupKey::new("chainA", "0xA1", 0);
        let b = DedupKey::new("chainA", "0xa1", 0);
        let c = DedupKey::new("chainA", "0xa1", 1);
        assert_eq!(mint_nonce(&a), mint_nonce(&b));
        assert_ne!(mint_nonce(&a), mint_nonce(&c));
    }

    #[test]
    fn test_mint_digest_layout() {
        let user = Address::repeat_byte(0x11);
        let gateway = Address::repeat_byte(0x22);
        let amount = U256::from(100u64);
        let nonce = U256::from(7u64);

        let mut expected = Vec::new();
        expected.extend_from_slice(&[0x11; 20]);
        expected.extend_from_slice(&amount.to_be_bytes::<32>());
        expected.extend_from_slice(&nonce.to_be_bytes::<32>());
        expected.extend_from_slice(&[0x22; 20]);
        assert_eq!(mint_digest(user, amount, nonce, gateway), keccak256(&expected));
    }

    #[test]
    fn test_local_signer_signs_and_redacts() {
        let signer = LocalKeySigner::from_private_key(TEST_KEY).unwrap();
        assert_eq!(
            signer.address().to_lowercase(),
            "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"
        );
        let signature = signer.sign(b"hello").unwrap();
        assert_eq!(signature.len(), 65);
        assert!(!format!("{:?}", signer).contains("ac0974"));
    }

    #[test]
    fn test_invalid_key_rejected() {
        assert!(LocalKeySigner::from_private_key("not-a-key").is_err());
    }

    #[test]
    fn test_minted_nonce_from_either_layout() {
        let key = DedupKey::new("chainA", "0xa1", 0);
        for nonce_indexed in [true, false] {
            let (_, value) = minted_log(10, &key, "0xmint", nonce_indexed);
            let log: RpcLog = serde_json::from_value(value).unwrap();
            assert_eq!(minted_nonce(&log), Some(mint_nonce(&key)));
        }

        let (_, mut value) = minted_log(10, &key, "0xmint", false);
        value["data"] = json!("0x01");
        let log: RpcLog = serde_json::from_value(value).unwrap();
        assert_eq!(minted_nonce(&log), None);
    }

    #[tokio::test]
    async fn test_lookup_finds_old_mint_in_bounded_windows() {
        let key = DedupKey::new("chainA", "0xa1", 0);
        let head = Arc::new(AtomicU64::new(25_000));
        let server = start_node(head, vec![minted_log(24_000, &key, "0xmint", true)]).await;
        let lookup = MintLookupConfig {
            from_block: 0,
            max_block_range: 2000,
            settle_depth: 12,
        };
        let submitter = submitter(vec![server.uri()], CHAIN_ID, lookup);

        let found = submitter.lookup(&key).await.unwrap();
        assert_eq!(found.as_deref(), Some("0xmint"));

        let windows = log_windows(&server).await;
        assert_eq!(windows.first().map(|w| w.0), Some(0));
        for (from, to) in &windows {
            assert!(to - from + 1 <= 2000, "window {}..={} too wide", from, to);
        }
        for pair in windows.windows(2) {
            assert_eq!(pair[1].0, pair[0].1 + 1, "windows must be contiguous");
        }
    }

    #[tokio::test]
    async fn test_lookup_wider_than_node_limit_fails() {
        let key = DedupKey::new("chainA", "0xa1", 0);
        let server = start_node(Arc::new(AtomicU64::new(25_000)), Vec::new()).await;
        let lookup = MintLookupConfig {
            from_block: 0,
            max_block_range: 50_000,
            settle_depth: 12,
        };
        let submitter = submitter(vec![server.uri()], CHAIN_ID, lookup);

        let err = submitter.lookup(&key).await.unwrap_err();
        assert!(err.to_string().contains("max block range"));
    }

    #[tokio::test]
    async fn test_repeat_lookup_scans_only_new_blocks() {
        let key = DedupKey::new("chainA", "0xa1", 0);
        let other = DedupKey::new("chainA", "0xa2", 0);
        let head = Arc::new(AtomicU64::new(5_000));
        let server = start_node(head.clone(), vec![minted_log(5_500, &key, "0xlater", true)]).await;
        let lookup = MintLookupConfig {
            from_block: 0,
            max_block_range: 2000,
            settle_depth: 10,
        };
        let submitter = submitter(vec![server.uri()], CHAIN_ID, lookup);

        assert_eq!(submitter.lookup(&other).await.unwrap(), None);
        let scanned = log_windows(&server).await.len();

        head.store(6_000, Ordering::SeqCst);
        let found = submitter.lookup(&key).await.unwrap();
        assert_eq!(found.as_deref(), Some("0xlater"));

        let windows = log_windows(&server).await;
        assert!(windows.len() > scanned);
        for (from, _) in &windows[scanned..] {
            assert!(*from >= 4_991, "block {} was already indexed", from);
        }
    }

    #[tokio::test]
    async fn test_lookup_reads_unsettled_mint_with_unindexed_nonce() {
        let key = DedupKey::new("chainA", "0xa1", 0);
        let server = start_node(
            Arc::new(AtomicU64::new(200)),
            vec![minted_log(195, &key, "0xfresh", false)],
        )
        .await;
        let lookup = MintLookupConfig {
            from_block: 100,
            max_block_range: 2000,
            settle_depth: 12,
        };
        let submitter = submitter(vec![server.uri()], CHAIN_ID, lookup);

        let found = submitter.lookup(&key).await.unwrap();
        assert_eq!(found.as_deref(), Some("0xfresh"));
        let other = DedupKey::new("chainA", "0xa2", 0);
        assert_eq!(submitter.lookup(&other).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_verify_chain_id() {
        let server = start_node(Arc::new(AtomicU64::new(1)), Vec::new()).await;

        let matching = submitter(vec![server.uri()], CHAIN_ID, MintLookupConfig::default());
        assert!(matching.verify_chain_id().await.is_ok());

        let wrong = submitter(vec![server.uri()], 1, MintLookupConfig::default());
        let err = wrong.verify_chain_id().await.unwrap_err();
        assert!(err.to_string().contains("reports chain id 31338"));

        // Unreachable fallback is tolerated, unreachable send URL is not
        let dead = "http://127.0.0.1:1".to_string();
        let with_dead_fallback = submitter(
            vec![server.uri(), dead.clone()],
            CHAIN_ID,
            MintLookupConfig::default(),
        );
        assert!(with_dead_fallback.verify_chain_id().await.is_ok());
        let with_dead_primary = submitter(vec![dead, server.uri()], CHAIN_ID, MintLookupConfig::default());
        assert!(with_dead_primary.verify_chain_id().await.is_err());
    }

    #[test]
    fn test_minted_signature() {
        assert_eq!(
            MintGateway::Minted::SIGNATURE_HASH,
            keccak256(b"Minted(address,uint256,uint256)")
        );
    }
}
