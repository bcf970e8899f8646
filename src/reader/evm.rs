//! EVM implementation of [`ChainClient`] for the lock gateway
//!
//! Decodes `Locked(address indexed user, uint256 amount, uint256 timestamp,
//! uint256 nonce)` logs into [`SourceEvent`]s.

use alloy::primitives::{keccak256, Address, B256, U256};
use async_trait::async_trait;
use std::str::FromStr;
use tracing::error;

use super::{ChainClient, LogFilter};
use crate::error::{RelayError, RelayResult};
use crate::rpc::{parse_hex_u64, JsonRpcClient, RpcLog};
use crate::types::{LockPayload, SourceEvent};

/// Which block the client reports as finalized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalityTag {
    /// Chain head; depth comes entirely from the confirmation count
    Latest,
    Safe,
    Finalized,
}

impl FinalityTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinalityTag::Latest => "latest",
            FinalityTag::Safe => "safe",
            FinalityTag::Finalized => "finalized",
        }
    }
}

impl FromStr for FinalityTag {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "latest" => Ok(FinalityTag::Latest),
            "safe" => Ok(FinalityTag::Safe),
            "finalized" => Ok(FinalityTag::Finalized),
            other => Err(eyre::eyre!(
                "Unknown finality tag {:?} (expected latest, safe or finalized)",
                other
            )),
        }
    }
}

pub struct EvmChainClient {
    chain_id: String,
    rpc: JsonRpcClient,
    contract_address: Address,
    asset_id: String,
    finality: FinalityTag,
}

impl EvmChainClient {
    pub fn new(
        chain_id: String,
        rpc: JsonRpcClient,
        contract_address: Address,
        asset_id: String,
        finality: FinalityTag,
    ) -> Self {
        Self {
            chain_id,
            rpc,
            contract_address,
            asset_id,
            finality,
        }
    }

    /// keccak256("Locked(address,uint256,uint256,uint256)")
    pub fn locked_signature() -> B256 {
        keccak256(b"Locked(address,uint256,uint256,uint256)")
    }

    /// Decode one `Locked` log
    fn parse_locked_log(&self, log: &RpcLog) -> RelayResult<SourceEvent> {
        // topics[0] = event signature
        // topics[1] = user (indexed address)
        // data = amount | timestamp | nonce
        let malformed = |what: &str| RelayError::MalformedResponse(format!("Locked log: {}", what));

        let user_topic = log.topics.get(1).ok_or_else(|| malformed("missing user topic"))?;
        let user_word = decode_hex(user_topic).map_err(|_| malformed("user topic is not hex"))?;
        if user_word.len() != 32 {
            return Err(malformed("user topic is not 32 bytes"));
        }
        let user = Address::from_slice(&user_word[12..32]);

        let data = decode_hex(&log.data).map_err(|_| malformed("data is not hex"))?;
        if data.len() < 96 {
            return Err(malformed("data shorter than 3 words"));
        }
        let amount = U256::from_be_slice(&data[0..32]);
        let timestamp = U256::from_be_slice(&data[32..64]);
        let nonce = U256::from_be_slice(&data[64..96]);

        let tx_hash = log
            .transaction_hash
            .clone()
            .ok_or_else(|| malformed("missing transaction hash"))?;
        let block_hash = log
            .block_hash
            .clone()
            .ok_or_else(|| malformed("missing block hash"))?;
        let block_number = parse_hex_u64(
            log.block_number
                .as_deref()
                .ok_or_else(|| malformed("missing block number"))?,
        )?;
        let log_index = parse_hex_u64(
            log.log_index
                .as_deref()
                .ok_or_else(|| malformed("missing log index"))?,
        )?;

        Ok(SourceEvent {
            source_chain_id: self.chain_id.clone(),
            contract_address: format!("{:?}", self.contract_address),
            block_hash: block_hash.to_lowercase(),
            block_number,
            tx_hash: tx_hash.to_lowercase(),
            log_index,
            payload: LockPayload {
                beneficiary: format!("{:?}", user),
                amount: amount.to_string(),
                asset_id: self.asset_id.clone(),
                metadata: serde_json::json!({
                    "timestamp": timestamp.to_string(),
                    "source_nonce": nonce.to_string(),
                }),
            },
        })
    }
}

fn decode_hex(value: &str) -> Result<Vec<u8>, hex::FromHexError> {
    hex::decode(value.trim_start_matches("0x"))
}

#[async_trait]
impl ChainClient for EvmChainClient {
    fn chain_id(&self) -> &str {
        &self.chain_id
    }

    async fn fetch_logs(&self, filter: &LogFilter) -> RelayResult<Vec<SourceEvent>> {
        let topics = serde_json::json!([format!("{:?}", Self::locked_signature())]);
        let logs = self
            .rpc
            .logs(
                &format!("{:?}", self.contract_address),
                topics,
                filter.from_block,
                filter.to_block,
            )
            .await?;

        let mut events = Vec::with_capacity(logs.len());
        for log in logs.iter().filter(|l| !l.removed) {
            match self.parse_locked_log(log) {
                Ok(event) => events.push(event),
                Err(e) => {
                    // Undecodable logs can never become valid; skip rather than stall the range
                    error!(
                        chain = %self.chain_id,
                        tx_hash = ?log.transaction_hash,
                        log_index = ?log.log_index,
                        error = %e,
                        "Failed to parse Locked log"
                    );
                }
            }
        }
        Ok(events)
    }

    async fn finalized_height(&self) -> RelayResult<u64> {
        match self.finality {
            FinalityTag::Latest => self.rpc.block_number().await,
            tag => {
                let block = self.rpc.block(tag.as_str()).await?.ok_or_else(|| {
                    RelayError::MalformedResponse(format!("no {} block returned", tag.as_str()))
                })?;
                parse_hex_u64(&block.number)
            }
        }
    }

    async fn canonical_block_hash(&self, height: u64) -> RelayResult<Option<String>> {
        Ok(self
            .rpc
            .block_at(height)
            .await?
            .map(|block| block.hash.to_lowercase()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> EvmChainClient {
        EvmChainClient::new(
            "chainA".to_string(),
            JsonRpcClient::new(vec!["http://localhost:8545".to_string()]).unwrap(),
            Address::from_str("0x00000000000000000000000000000000000000a1").unwrap(),
            "TKA".to_string(),
            FinalityTag::Latest,
        )
    }

    fn word(value: u64) -> String {
        format!("{:064x}", value)
    }

    fn locked_log() -> RpcLog {
        RpcLog {
            address: "0x00000000000000000000000000000000000000a1".to_string(),
            topics: vec![
                format!("{:?}", EvmChainClient::locked_signature()),
                format!("0x{}{}", "0".repeat(24), "00000000000000000000000000000000000000b0"),
            ],
            data: format!("0x{}{}{}", word(100), word(1_700_000_000), word(7)),
            block_number: Some("0x3e8".to_string()),
            block_hash: Some("0xABCD".to_string()),
            transaction_hash: Some("0xDEAD".to_string()),
            log_index: Some("0x2".to_string()),
            removed: false,
        }
    }

    #[test]
    fn test_parse_locked_log() {
        let event = client().parse_locked_log(&locked_log()).unwrap();
        assert_eq!(event.block_number, 1000);
        assert_eq!(event.log_index, 2);
        assert_eq!(event.tx_hash, "0xdead");
        assert_eq!(event.block_hash, "0xabcd");
        assert_eq!(event.payload.amount, "100");
        assert_eq!(event.payload.asset_id, "TKA");
        assert_eq!(
            event.payload.beneficiary,
            "0x00000000000000000000000000000000000000b0"
        );
        assert_eq!(event.payload.metadata["source_nonce"], "7");
        assert_eq!(event.dedup_key().as_str(), "chainA:0xdead:2");
    }

    #[test]
    fn test_parse_rejects_short_data() {
        let mut log = locked_log();
        log.data = format!("0x{}", word(100));
        assert!(matches!(
            client().parse_locked_log(&log),
            Err(RelayError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_parse_rejects_missing_topic() {
        let mut log = locked_log();
        log.topics.truncate(1);
        assert!(client().parse_locked_log(&log).is_err());
    }

    #[test]
    fn test_finality_tag_parse() {
        assert_eq!("finalized".parse::<FinalityTag>().unwrap(), FinalityTag::Finalized);
        assert_eq!(" Latest ".parse::<FinalityTag>().unwrap(), FinalityTag::Latest);
        assert!("pending".parse::<FinalityTag>().is_err());
    }
}
