//! EVM chain client: JSON-RPC 2.0 over HTTPS for calls, websocket
//! subscriptions for heads and pending transactions. Ethereum and BSC share
//! this client; only the chain id and endpoints differ.

use alloy::consensus::transaction::SignerRecoverable;
use alloy::consensus::{Transaction as _, TxEnvelope};
use alloy::eips::eip2718::Decodable2718;
use alloy::primitives::U256;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::chain_adapter::{
    AccountInfo, AdapterEvent, BlockHeader, FeeData, PendingTx, SimulationOutcome,
};
use crate::constants::{duration_from_ms, RPC_TIMEOUT_MS};
use crate::error::{BotError, BotResult};
use crate::retry::{CircuitBreakers, RetryPolicy};
use crate::types::ChainId;

/// Parse a JSON-RPC quantity ("0x1b4") into u128.
pub fn parse_quantity(value: &Value) -> BotResult<u128> {
    let s = value
        .as_str()
        .ok_or_else(|| BotError::Protocol(format!("quantity not a string: {value}")))?;
    let trimmed = s.strip_prefix("0x").unwrap_or(s);
    u128::from_str_radix(trimmed, 16)
        .map_err(|e| BotError::Protocol(format!("bad quantity {s}: {e}")))
}

pub fn parse_quantity_u64(value: &Value) -> BotResult<u64> {
    Ok(parse_quantity(value)? as u64)
}

/// One refresher observation of a v2 pair.
#[derive(Debug, Clone)]
pub struct V2PoolObservation {
    pub token0: String,
    pub token1: String,
    pub reserve0: U256,
    pub reserve1: U256,
    pub block: u64,
}

pub struct EvmClient {
    chain: ChainId,
    http: reqwest::Client,
    rpc_url: String,
    ws_url: String,
    request_id: AtomicU64,
    breakers: CircuitBreakers,
    retry: RetryPolicy,
}

impl EvmClient {
    pub fn new(chain: ChainId, rpc_url: &str, ws_url: &str) -> BotResult<Self> {
        if !chain.is_evm() {
            return Err(BotError::Config(format!("{chain} is not an EVM chain")));
        }
        let http = reqwest::Client::builder()
            .timeout(duration_from_ms(RPC_TIMEOUT_MS))
            .gzip(true)
            .build()
            .map_err(|e| BotError::Config(format!("http client: {e}")))?;
        Ok(Self {
            chain,
            http,
            rpc_url: rpc_url.to_string(),
            ws_url: ws_url.to_string(),
            request_id: AtomicU64::new(1),
            breakers: CircuitBreakers::default(),
            retry: RetryPolicy::default(),
        })
    }

    pub fn chain(&self) -> ChainId {
        self.chain
    }

    /// Single JSON-RPC call with deadline, breaker accounting and taxonomy
    /// classification. Transport failures are transient; JSON-RPC error
    /// objects are protocol errors.
    pub async fn rpc_call(&self, method: &str, params: Value) -> BotResult<Value> {
        if !self.breakers.allows(&self.rpc_url).await {
            return Err(BotError::TransientNetwork(format!(
                "{}: circuit open",
                self.rpc_url
            )));
        }
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let result = async {
            let response = self.http.post(&self.rpc_url).json(&body).send().await?;
            if response.status().is_server_error() {
                return Err(BotError::TransientNetwork(format!(
                    "{method}: http {}",
                    response.status()
                )));
            }
            let payload: Value = response
                .json()
                .await
                .map_err(|e| BotError::Protocol(format!("{method}: bad json: {e}")))?;
            if let Some(err) = payload.get("error").filter(|e| !e.is_null()) {
                return Err(BotError::Protocol(format!("{method}: rpc error {err}")));
            }
            payload
                .get("result")
                .cloned()
                .ok_or_else(|| BotError::Protocol(format!("{method}: missing result")))
        }
        .await;

        match &result {
            Ok(_) => self.breakers.record_success(&self.rpc_url).await,
            Err(e) if e.is_transient() => self.breakers.record_failure(&self.rpc_url).await,
            Err(_) => {}
        }
        result
    }

    /// Same call wrapped in the retry policy for idempotent reads.
    async fn rpc_read(&self, method: &str, params: Value) -> BotResult<Value> {
        self.retry
            .run(method, duration_from_ms(RPC_TIMEOUT_MS * 3), || {
                self.rpc_call(method, params.clone())
            })
            .await
    }

    pub async fn block_number(&self) -> BotResult<u64> {
        let result = self.rpc_read("eth_blockNumber", json!([])).await?;
        parse_quantity_u64(&result)
    }

    /// EIP-1559 fee data from feeHistory: latest base fee plus the median
    /// rewarded priority fee over the last 5 blocks.
    pub async fn fee_data(&self) -> BotResult<FeeData> {
        let result = self
            .rpc_read("eth_feeHistory", json!(["0x5", "latest", [50]]))
            .await?;
        let base_fees = result
            .get("baseFeePerGas")
            .and_then(|v| v.as_array())
            .ok_or_else(|| BotError::Protocol("feeHistory missing baseFeePerGas".into()))?;
        let base_fee = base_fees
            .last()
            .map(parse_quantity)
            .transpose()?
            .unwrap_or_default();
        let mut rewards: Vec<u128> = Vec::new();
        if let Some(reward_rows) = result.get("reward").and_then(|v| v.as_array()) {
            for row in reward_rows {
                if let Some(cell) = row.as_array().and_then(|r| r.first()) {
                    rewards.push(parse_quantity(cell)?);
                }
            }
        }
        rewards.sort_unstable();
        let priority_fee = rewards
            .get(rewards.len() / 2)
            .copied()
            .unwrap_or(1_000_000_000);
        Ok(FeeData {
            chain: self.chain,
            base_fee,
            priority_fee,
            observed_at: Utc::now(),
        })
    }

    pub async fn send_raw_transaction(&self, raw: &[u8]) -> BotResult<String> {
        let hex_tx = format!("0x{}", hex::encode(raw));
        let result = self
            .rpc_call("eth_sendRawTransaction", json!([hex_tx]))
            .await
            .map_err(|e| match e {
                BotError::Protocol(msg) => BotError::Submission(msg),
                other => other,
            })?;
        result
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| BotError::Protocol("sendRawTransaction: non-string hash".into()))
    }

    /// Simulate a signed transaction by decoding the envelope and running
    /// `eth_call` as the recovered signer at latest.
    pub async fn simulate(&self, raw: &[u8]) -> BotResult<SimulationOutcome> {
        let envelope = TxEnvelope::decode_2718(&mut &raw[..])
            .map_err(|e| BotError::Decode(format!("cannot decode signed tx: {e}")))?;
        let from = envelope
            .recover_signer()
            .map_err(|e| BotError::Decode(format!("cannot recover signer: {e}")))?;
        let call = json!({
            "from": format!("{from:#x}"),
            "to": envelope.to().map(|a| format!("{a:#x}")),
            "data": format!("0x{}", hex::encode(envelope.input())),
            "value": format!("0x{:x}", envelope.value()),
        });
        match self.rpc_call("eth_call", json!([call, "latest"])).await {
            Ok(result) => Ok(SimulationOutcome {
                success: true,
                gas_used: None,
                return_data: result.as_str().map(|s| s.to_string()),
                error: None,
            }),
            Err(BotError::Protocol(msg)) => Ok(SimulationOutcome {
                success: false,
                gas_used: None,
                return_data: None,
                error: Some(msg),
            }),
            Err(other) => Err(other),
        }
    }

    pub async fn account_info(&self, address: &str) -> BotResult<AccountInfo> {
        let balance = self
            .rpc_read("eth_getBalance", json!([address, "latest"]))
            .await?;
        let nonce = self
            .rpc_read("eth_getTransactionCount", json!([address, "pending"]))
            .await?;
        Ok(AccountInfo {
            address: address.to_string(),
            balance: parse_quantity(&balance)?,
            nonce: Some(parse_quantity_u64(&nonce)?),
        })
    }

    pub async fn block_tx_hashes(&self, number: u64) -> BotResult<Vec<String>> {
        let result = self
            .rpc_read(
                "eth_getBlockByNumber",
                json!([format!("0x{number:x}"), false]),
            )
            .await?;
        if result.is_null() {
            return Ok(Vec::new());
        }
        let hashes = result
            .get("transactions")
            .and_then(|v| v.as_array())
            .map(|txs| {
                txs.iter()
                    .filter_map(|t| t.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default();
        Ok(hashes)
    }

    /// Fetch full pending-tx fields (and raw bytes when the node offers
    /// them) for a hash seen on the subscription.
    pub async fn pending_tx_by_hash(&self, hash: &str) -> BotResult<Option<PendingTx>> {
        let tx = self
            .rpc_call("eth_getTransactionByHash", json!([hash]))
            .await?;
        if tx.is_null() {
            return Ok(None);
        }
        let input_hex = tx.get("input").and_then(|v| v.as_str()).unwrap_or("0x");
        let input = hex::decode(input_hex.strip_prefix("0x").unwrap_or(input_hex))
            .map_err(|e| BotError::Decode(format!("bad calldata: {e}")))?;
        let priority_fee = tx
            .get("maxPriorityFeePerGas")
            .or_else(|| tx.get("gasPrice"))
            .map(parse_quantity)
            .transpose()?
            .unwrap_or_default();
        let value = tx
            .get("value")
            .map(parse_quantity)
            .transpose()?
            .unwrap_or_default();
        // Optional; many nodes expose it, the sandwich path needs it.
        let raw = match self
            .rpc_call("eth_getRawTransactionByHash", json!([hash]))
            .await
        {
            Ok(Value::String(raw_hex)) => {
                hex::decode(raw_hex.strip_prefix("0x").unwrap_or(&raw_hex)).ok()
            }
            _ => None,
        };
        Ok(Some(PendingTx {
            chain: self.chain,
            hash: hash.to_string(),
            from: tx
                .get("from")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_ascii_lowercase(),
            to: tx
                .get("to")
                .and_then(|v| v.as_str())
                .map(|s| s.to_ascii_lowercase()),
            input,
            value,
            priority_fee,
            raw,
            observed_at: Utc::now(),
        }))
    }

    /// Read a v2 pair's tokens and reserves: token0()/token1()/getReserves()
    /// through eth_call. Used by the scheduled pool refresher.
    pub async fn v2_pool_state(&self, pool: &str) -> BotResult<V2PoolObservation> {
        let call = |selector: &str| {
            json!([{"to": pool, "data": selector}, "latest"])
        };
        let token0 = self.rpc_read("eth_call", call("0x0dfe1681")).await?;
        let token1 = self.rpc_read("eth_call", call("0xd21220a7")).await?;
        let reserves = self.rpc_read("eth_call", call("0x0902f1ac")).await?;
        let block = self.block_number().await?;

        let word_address = |value: &Value| -> BotResult<String> {
            let s = value
                .as_str()
                .ok_or_else(|| BotError::Protocol("eth_call: non-string".into()))?;
            let bytes = hex::decode(s.strip_prefix("0x").unwrap_or(s))
                .map_err(|e| BotError::Protocol(format!("eth_call hex: {e}")))?;
            if bytes.len() < 32 {
                return Err(BotError::Protocol("eth_call: short word".into()));
            }
            Ok(format!("0x{}", hex::encode(&bytes[12..32])))
        };
        let reserves_hex = reserves
            .as_str()
            .ok_or_else(|| BotError::Protocol("getReserves: non-string".into()))?;
        let bytes = hex::decode(reserves_hex.strip_prefix("0x").unwrap_or(reserves_hex))
            .map_err(|e| BotError::Protocol(format!("getReserves hex: {e}")))?;
        if bytes.len() < 64 {
            return Err(BotError::Protocol("getReserves: short response".into()));
        }
        Ok(V2PoolObservation {
            token0: word_address(&token0)?,
            token1: word_address(&token1)?,
            reserve0: U256::from_be_slice(&bytes[0..32]),
            reserve1: U256::from_be_slice(&bytes[32..64]),
            block,
        })
    }

    /// ERC-20 decimals() for a freshly discovered token; defaults to 18 on
    /// tokens that do not answer.
    pub async fn erc20_decimals(&self, token: &str) -> u8 {
        let result = self
            .rpc_call("eth_call", json!([{"to": token, "data": "0x313ce567"}, "latest"]))
            .await;
        match result {
            Ok(value) => match parse_quantity(&value) {
                Ok(decimals) if decimals <= 36 => decimals as u8,
                _ => 18,
            },
            Err(_) => 18,
        }
    }

    /// Websocket loop: newHeads + newPendingTransactions, reorg detection on
    /// heads, jittered reconnect with a resync checkpoint after each drop.
    pub fn spawn_subscriptions(
        &self,
        events: mpsc::Sender<AdapterEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let chain = self.chain;
        let ws_url = self.ws_url.clone();
        let client = self.clone_for_task();
        tokio::spawn(async move {
            let reconnect = RetryPolicy::reconnect();
            let mut attempt = 0u32;
            let mut last_head: Option<BlockHeader> = None;
            loop {
                match run_subscription_session(chain, &ws_url, &client, &events, &mut last_head)
                    .await
                {
                    Ok(()) => {
                        // Receiver dropped; shut down quietly.
                        return;
                    }
                    Err(e) => {
                        let delay = reconnect.delay_for_attempt(attempt.min(10));
                        warn!("🔌 {chain} ws dropped: {e}; reconnecting in {delay:?}");
                        attempt = attempt.saturating_add(1);
                        tokio::time::sleep(delay).await;
                        if let Ok(height) = client.block_number().await {
                            if events
                                .send(AdapterEvent::Resync { height })
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                    }
                }
            }
        })
    }

    /// Cheap handle for the subscription task; connections are per-request.
    fn clone_for_task(&self) -> Arc<EvmClient> {
        Arc::new(EvmClient {
            chain: self.chain,
            http: self.http.clone(),
            rpc_url: self.rpc_url.clone(),
            ws_url: self.ws_url.clone(),
            request_id: AtomicU64::new(1_000_000),
            breakers: self.breakers.clone(),
            retry: self.retry.clone(),
        })
    }
}

/// One websocket session: subscribe, pump notifications until the socket or
/// the receiver dies. Ok(()) means the receiver is gone (shutdown).
async fn run_subscription_session(
    chain: ChainId,
    ws_url: &str,
    client: &Arc<EvmClient>,
    events: &mpsc::Sender<AdapterEvent>,
    last_head: &mut Option<BlockHeader>,
) -> BotResult<()> {
    let (ws, _) = connect_async(ws_url)
        .await
        .map_err(|e| BotError::TransientNetwork(format!("ws connect: {e}")))?;
    let (mut sink, mut stream) = ws.split();
    info!("🔌 {chain} websocket connected");

    sink.send(Message::Text(
        json!({"jsonrpc": "2.0", "id": 1, "method": "eth_subscribe", "params": ["newHeads"]})
            .to_string(),
    ))
    .await
    .map_err(|e| BotError::TransientNetwork(format!("subscribe heads: {e}")))?;
    sink.send(Message::Text(
        json!({"jsonrpc": "2.0", "id": 2, "method": "eth_subscribe", "params": ["newPendingTransactions"]})
            .to_string(),
    ))
    .await
    .map_err(|e| BotError::TransientNetwork(format!("subscribe pending: {e}")))?;

    while let Some(frame) = stream.next().await {
        let frame = frame.map_err(|e| BotError::TransientNetwork(format!("ws read: {e}")))?;
        let text = match frame {
            Message::Text(t) => t,
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => {
                return Err(BotError::TransientNetwork("ws closed by peer".into()))
            }
            _ => continue,
        };
        let payload: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(_) => continue,
        };
        let Some(result) = payload
            .get("params")
            .and_then(|p| p.get("result"))
            .cloned()
        else {
            continue;
        };

        if let Some(hash) = result.as_str() {
            // Pending transaction hash; hydrate in a detached task so a slow
            // node never stalls the subscription read loop.
            let client = client.clone();
            let events = events.clone();
            let hash = hash.to_string();
            tokio::spawn(async move {
                match client.pending_tx_by_hash(&hash).await {
                    Ok(Some(tx)) => {
                        let _ = events.send(AdapterEvent::PendingTx(tx)).await;
                    }
                    Ok(None) => {}
                    Err(e) => debug!("pending tx {hash} hydrate failed: {e}"),
                }
            });
            continue;
        }

        if result.get("parentHash").is_some() {
            let header = BlockHeader {
                chain,
                number: result
                    .get("number")
                    .map(parse_quantity_u64)
                    .transpose()?
                    .unwrap_or_default(),
                hash: result
                    .get("hash")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                parent_hash: result
                    .get("parentHash")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                base_fee_per_gas: result
                    .get("baseFeePerGas")
                    .map(parse_quantity)
                    .transpose()
                    .ok()
                    .flatten(),
            };
            if let Some(prev) = last_head.as_ref() {
                let extends_tip = header.parent_hash == prev.hash;
                if !extends_tip && header.number <= prev.number {
                    let from = header.number.min(prev.number);
                    if events
                        .send(AdapterEvent::Reorg {
                            from_height: from,
                            to_height: prev.number,
                        })
                        .await
                        .is_err()
                    {
                        return Ok(());
                    }
                }
            }
            *last_head = Some(header.clone());
            if events.send(AdapterEvent::NewBlock(header)).await.is_err() {
                return Ok(());
            }
        }
    }
    Err(BotError::TransientNetwork("ws stream ended".into()))
}

/// Convert a U256 wei value into u128, erroring on amounts that cannot fit.
pub fn u256_to_u128(value: U256) -> BotResult<u128> {
    u128::try_from(value).map_err(|_| BotError::Fatal("amount exceeds u128".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity(&json!("0x0")).unwrap(), 0);
        assert_eq!(parse_quantity(&json!("0x1b4")).unwrap(), 436);
        assert_eq!(parse_quantity(&json!("ff")).unwrap(), 255);
        assert!(parse_quantity(&json!(12)).is_err());
        assert!(parse_quantity(&json!("0xzz")).is_err());
    }

    #[test]
    fn test_rejects_non_evm_chain() {
        assert!(EvmClient::new(ChainId::Solana, "http://x", "ws://x").is_err());
        assert!(EvmClient::new(ChainId::Ethereum, "http://x", "ws://x").is_ok());
    }

    #[test]
    fn test_u256_to_u128_bounds() {
        assert_eq!(u256_to_u128(U256::from(42u64)).unwrap(), 42);
        assert!(u256_to_u128(U256::MAX).is_err());
    }
}
