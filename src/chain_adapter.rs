//! Chain-facing capability surface. Each chain client exposes the same small
//! set of operations: submit a signed transaction, read fee data, subscribe
//! to pending transactions and blocks, simulate, query an account. The two
//! wire families (EVM JSON-RPC, Solana JSON-RPC) are a closed variant set;
//! callers match on the variant, not on a trait object.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BotResult;
use crate::evm_client::EvmClient;
use crate::solana_client::SolanaClient;
use crate::types::ChainId;

/// A pending transaction as seen in the mempool feed, before decoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingTx {
    pub chain: ChainId,
    /// Tx hash (EVM) or signature (Solana).
    pub hash: String,
    pub from: String,
    /// Call target (EVM router) or first program id touched (Solana).
    pub to: Option<String>,
    /// Calldata (EVM). Empty for Solana; Solana intents decode from `raw`.
    pub input: Vec<u8>,
    /// Native value attached, wei/lamports.
    pub value: u128,
    /// Priority fee offered (wei per gas / microlamports per CU).
    pub priority_fee: u128,
    /// Raw signed bytes when the node exposes them; required for carrying a
    /// victim transaction inside a sandwich bundle.
    pub raw: Option<Vec<u8>>,
    pub observed_at: DateTime<Utc>,
}

/// New canonical head.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockHeader {
    pub chain: ChainId,
    pub number: u64,
    pub hash: String,
    pub parent_hash: String,
    pub base_fee_per_gas: Option<u128>,
}

/// Events a chain subscription delivers to the pipeline.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    PendingTx(PendingTx),
    NewBlock(BlockHeader),
    /// Canonical history changed below the tip; consumers must re-check
    /// anything they derived from blocks in the range.
    Reorg { from_height: u64, to_height: u64 },
    /// Subscription was re-established after a disconnect; `height` is the
    /// checkpoint to resync pool state from.
    Resync { height: u64 },
}

/// Current fee conditions on a chain.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeeData {
    pub chain: ChainId,
    /// Base fee per gas (EVM) or flat signature fee in lamports (Solana).
    pub base_fee: u128,
    /// Priority fee per gas (EVM) or microlamports per compute unit (Solana).
    pub priority_fee: u128,
    pub observed_at: DateTime<Utc>,
}

/// Account snapshot used for balance/nonce checks before building bundles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountInfo {
    pub address: String,
    pub balance: u128,
    /// Next nonce (EVM); None on Solana.
    pub nonce: Option<u64>,
}

/// Result of a pre-submission simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationOutcome {
    pub success: bool,
    pub gas_used: Option<u64>,
    pub return_data: Option<String>,
    pub error: Option<String>,
}

/// Closed set of chain clients. EVM chains share a client parameterized by
/// `ChainId`; Solana has its own wire format and the slot notion of height.
pub enum ChainAdapter {
    Evm(EvmClient),
    Solana(SolanaClient),
}

impl ChainAdapter {
    pub fn chain(&self) -> ChainId {
        match self {
            ChainAdapter::Evm(c) => c.chain(),
            ChainAdapter::Solana(_) => ChainId::Solana,
        }
    }

    /// Submit raw signed bytes; returns the tx hash / signature.
    pub async fn submit_signed_tx(&self, raw: &[u8]) -> BotResult<String> {
        match self {
            ChainAdapter::Evm(c) => c.send_raw_transaction(raw).await,
            ChainAdapter::Solana(c) => c.send_transaction(raw).await,
        }
    }

    pub async fn get_fee_data(&self) -> BotResult<FeeData> {
        match self {
            ChainAdapter::Evm(c) => c.fee_data().await,
            ChainAdapter::Solana(c) => c.fee_data().await,
        }
    }

    pub async fn simulate_tx(&self, raw: &[u8]) -> BotResult<SimulationOutcome> {
        match self {
            ChainAdapter::Evm(c) => c.simulate(raw).await,
            ChainAdapter::Solana(c) => c.simulate(raw).await,
        }
    }

    pub async fn query_account(&self, address: &str) -> BotResult<AccountInfo> {
        match self {
            ChainAdapter::Evm(c) => c.account_info(address).await,
            ChainAdapter::Solana(c) => c.account_info(address).await,
        }
    }

    /// Current head height (block number or slot).
    pub async fn current_height(&self) -> BotResult<u64> {
        match self {
            ChainAdapter::Evm(c) => c.block_number().await,
            ChainAdapter::Solana(c) => c.current_slot().await,
        }
    }

    /// Tx hashes / signatures contained in a canonical block or slot, for
    /// inclusion monitoring.
    pub async fn block_tx_hashes(&self, height: u64) -> BotResult<Vec<String>> {
        match self {
            ChainAdapter::Evm(c) => c.block_tx_hashes(height).await,
            ChainAdapter::Solana(c) => c.slot_signatures(height).await,
        }
    }

    /// Spawn the websocket subscription task. Events flow into `events`;
    /// the task reconnects with jittered exponential backoff forever, or
    /// until the receiver side is dropped.
    pub fn spawn_subscriptions(
        &self,
        events: tokio::sync::mpsc::Sender<AdapterEvent>,
    ) -> tokio::task::JoinHandle<()> {
        match self {
            ChainAdapter::Evm(c) => c.spawn_subscriptions(events),
            ChainAdapter::Solana(c) => c.spawn_subscriptions(events),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fee_data_roundtrips_serde() {
        let fee = FeeData {
            chain: ChainId::Ethereum,
            base_fee: 22_000_000_000,
            priority_fee: 1_500_000_000,
            observed_at: Utc::now(),
        };
        let json = serde_json::to_string(&fee).unwrap();
        let back: FeeData = serde_json::from_str(&json).unwrap();
        assert_eq!(back.base_fee, fee.base_fee);
        assert_eq!(back.priority_fee, fee.priority_fee);
    }
}
