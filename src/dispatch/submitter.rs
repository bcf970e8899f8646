//! Destination-side collaborator traits

use async_trait::async_trait;

use crate::error::RelayResult;
use crate::types::DedupKey;

/// Destination transaction status as seen by [`ActionSubmitter::status`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// Known to the node but not mined
    Pending,
    /// Mined successfully, with the given number of confirmations
    Confirmed(u64),
    /// Mined and reverted
    Failed,
    /// The node has never heard of it (dropped or not yet propagated)
    Unknown,
}

/// Submits and tracks the mint action on the destination chain.
///
/// `submit` must use `key` as the idempotency key so that a duplicate
/// submission is rejected or recognized by the destination, and `lookup`
/// must find an action previously submitted under `key`.
#[async_trait]
pub trait ActionSubmitter: Send + Sync {
    async fn submit(
        &self,
        key: &DedupKey,
        beneficiary: &str,
        amount: &str,
        asset_id: &str,
    ) -> RelayResult<String>;

    async fn status(&self, tx_hash: &str) -> RelayResult<TxStatus>;

    /// Transaction hash of an action already recorded under `key`, if any
    async fn lookup(&self, key: &DedupKey) -> RelayResult<Option<String>>;
}

/// Opaque signing capability held by a submitter
pub trait KeySigner: Send + Sync {
    /// Hex address of the signing key
    fn address(&self) -> String;

    /// Sign `message` and return the 65-byte signature
    fn sign(&self, message: &[u8]) -> RelayResult<Vec<u8>>;
}
