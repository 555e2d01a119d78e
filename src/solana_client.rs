//! Solana chain client: JSON-RPC over HTTPS plus websocket subscriptions.
//! Slots stand in for blocks; the pending-transaction feed uses the
//! `transactionSubscribe` method offered by enhanced RPC providers, with
//! program-id filters so only DEX traffic crosses the wire.

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use solana_sdk::message::VersionedMessage;
use solana_sdk::transaction::VersionedTransaction;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::chain_adapter::{
    AccountInfo, AdapterEvent, BlockHeader, FeeData, PendingTx, SimulationOutcome,
};
use crate::constants::{
    duration_from_ms, ORCA_WHIRLPOOLS_PROGRAM_ID, PUMPSWAP_PROGRAM_ID, RAYDIUM_AMM_V4_PROGRAM_ID,
    RAYDIUM_CLMM_PROGRAM_ID, RPC_TIMEOUT_MS,
};
use crate::error::{BotError, BotResult};
use crate::retry::{CircuitBreakers, RetryPolicy};
use crate::types::ChainId;

/// Flat per-signature fee in lamports.
const SIGNATURE_FEE_LAMPORTS: u128 = 5_000;

const COMPUTE_BUDGET_PROGRAM: &str = "ComputeBudget111111111111111111111111111111";

pub struct SolanaClient {
    http: reqwest::Client,
    rpc_url: String,
    ws_url: String,
    request_id: AtomicU64,
    breakers: CircuitBreakers,
    retry: RetryPolicy,
}

impl SolanaClient {
    pub fn new(rpc_url: &str, ws_url: &str) -> BotResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(duration_from_ms(RPC_TIMEOUT_MS))
            .gzip(true)
            .build()
            .map_err(|e| BotError::Config(format!("http client: {e}")))?;
        Ok(Self {
            http,
            rpc_url: rpc_url.to_string(),
            ws_url: ws_url.to_string(),
            request_id: AtomicU64::new(1),
            breakers: CircuitBreakers::default(),
            retry: RetryPolicy::default(),
        })
    }

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

    async fn rpc_read(&self, method: &str, params: Value) -> BotResult<Value> {
        self.retry
            .run(method, duration_from_ms(RPC_TIMEOUT_MS * 3), || {
                self.rpc_call(method, params.clone())
            })
            .await
    }

    pub async fn current_slot(&self) -> BotResult<u64> {
        let result = self.rpc_read("getSlot", json!([])).await?;
        result
            .as_u64()
            .ok_or_else(|| BotError::Protocol("getSlot: non-numeric".into()))
    }

    pub async fn latest_blockhash(&self) -> BotResult<String> {
        let result = self
            .rpc_read("getLatestBlockhash", json!([{"commitment": "confirmed"}]))
            .await?;
        result
            .pointer("/value/blockhash")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| BotError::Protocol("getLatestBlockhash: missing blockhash".into()))
    }

    /// Priority fee data: flat signature fee plus the median of recent
    /// prioritization fees (microlamports per compute unit).
    pub async fn fee_data(&self) -> BotResult<FeeData> {
        let result = self
            .rpc_read("getRecentPrioritizationFees", json!([[]]))
            .await?;
        let mut fees: Vec<u128> = result
            .as_array()
            .map(|rows| {
                rows.iter()
                    .filter_map(|r| r.get("prioritizationFee").and_then(|v| v.as_u64()))
                    .map(|v| v as u128)
                    .collect()
            })
            .unwrap_or_default();
        fees.sort_unstable();
        let priority_fee = fees.get(fees.len() / 2).copied().unwrap_or(0);
        Ok(FeeData {
            chain: ChainId::Solana,
            base_fee: SIGNATURE_FEE_LAMPORTS,
            priority_fee,
            observed_at: Utc::now(),
        })
    }

    pub async fn send_transaction(&self, raw: &[u8]) -> BotResult<String> {
        let encoded = base64::encode(raw);
        let result = self
            .rpc_call(
                "sendTransaction",
                json!([encoded, {"encoding": "base64", "skipPreflight": true}]),
            )
            .await
            .map_err(|e| match e {
                BotError::Protocol(msg) => BotError::Submission(msg),
                other => other,
            })?;
        result
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| BotError::Protocol("sendTransaction: non-string signature".into()))
    }

    pub async fn simulate(&self, raw: &[u8]) -> BotResult<SimulationOutcome> {
        let encoded = base64::encode(raw);
        let result = self
            .rpc_read(
                "simulateTransaction",
                json!([encoded, {"encoding": "base64", "commitment": "processed"}]),
            )
            .await?;
        let err = result.pointer("/value/err").filter(|v| !v.is_null());
        let units = result
            .pointer("/value/unitsConsumed")
            .and_then(|v| v.as_u64());
        Ok(SimulationOutcome {
            success: err.is_none(),
            gas_used: units,
            return_data: None,
            error: err.map(|e| e.to_string()),
        })
    }

    pub async fn account_info(&self, address: &str) -> BotResult<AccountInfo> {
        let result = self
            .rpc_read("getBalance", json!([address, {"commitment": "confirmed"}]))
            .await?;
        let balance = result
            .pointer("/value")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| BotError::Protocol("getBalance: missing value".into()))?;
        Ok(AccountInfo {
            address: address.to_string(),
            balance: balance as u128,
            nonce: None,
        })
    }

    /// Signatures contained in a confirmed slot, for inclusion monitoring.
    pub async fn slot_signatures(&self, slot: u64) -> BotResult<Vec<String>> {
        let result = self
            .rpc_read(
                "getBlock",
                json!([slot, {
                    "transactionDetails": "signatures",
                    "rewards": false,
                    "maxSupportedTransactionVersion": 0
                }]),
            )
            .await;
        match result {
            Ok(block) => Ok(block
                .get("signatures")
                .and_then(|v| v.as_array())
                .map(|sigs| {
                    sigs.iter()
                        .filter_map(|s| s.as_str().map(|x| x.to_string()))
                        .collect()
                })
                .unwrap_or_default()),
            // Skipped slots are normal; report them as empty.
            Err(BotError::Protocol(msg)) if msg.contains("-32007") || msg.contains("-32009") => {
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Websocket loop: slot updates plus a program-filtered transaction feed.
    pub fn spawn_subscriptions(
        &self,
        events: mpsc::Sender<AdapterEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let ws_url = self.ws_url.clone();
        let client = self.clone_for_task();
        tokio::spawn(async move {
            let reconnect = RetryPolicy::reconnect();
            let mut attempt = 0u32;
            loop {
                match run_subscription_session(&ws_url, &events).await {
                    Ok(()) => return,
                    Err(e) => {
                        let delay = reconnect.delay_for_attempt(attempt.min(10));
                        warn!("🔌 solana ws dropped: {e}; reconnecting in {delay:?}");
                        attempt = attempt.saturating_add(1);
                        tokio::time::sleep(delay).await;
                        if let Ok(slot) = client.current_slot().await {
                            if events
                                .send(AdapterEvent::Resync { height: slot })
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

    fn clone_for_task(&self) -> Arc<SolanaClient> {
        Arc::new(SolanaClient {
            http: self.http.clone(),
            rpc_url: self.rpc_url.clone(),
            ws_url: self.ws_url.clone(),
            request_id: AtomicU64::new(1_000_000),
            breakers: self.breakers.clone(),
            retry: self.retry.clone(),
        })
    }
}

async fn run_subscription_session(
    ws_url: &str,
    events: &mpsc::Sender<AdapterEvent>,
) -> BotResult<()> {
    let (ws, _) = connect_async(ws_url)
        .await
        .map_err(|e| BotError::TransientNetwork(format!("ws connect: {e}")))?;
    let (mut sink, mut stream) = ws.split();
    info!("🔌 solana websocket connected");

    sink.send(Message::Text(
        json!({"jsonrpc": "2.0", "id": 1, "method": "slotSubscribe", "params": []}).to_string(),
    ))
    .await
    .map_err(|e| BotError::TransientNetwork(format!("slotSubscribe: {e}")))?;

    // Enhanced-endpoint feed of not-yet-confirmed transactions touching the
    // DEX programs we trade against. Plain endpoints reject the method; the
    // session then degrades to slot updates only.
    let programs = [
        RAYDIUM_AMM_V4_PROGRAM_ID,
        RAYDIUM_CLMM_PROGRAM_ID,
        ORCA_WHIRLPOOLS_PROGRAM_ID,
        PUMPSWAP_PROGRAM_ID,
    ];
    sink.send(Message::Text(
        json!({
            "jsonrpc": "2.0",
            "id": 2,
            "method": "transactionSubscribe",
            "params": [
                {"vote": false, "failed": false, "accountInclude": programs},
                {"commitment": "processed", "encoding": "base64",
                 "transactionDetails": "full", "maxSupportedTransactionVersion": 0}
            ]
        })
        .to_string(),
    ))
    .await
    .map_err(|e| BotError::TransientNetwork(format!("transactionSubscribe: {e}")))?;

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
        if let Some(err) = payload.get("error") {
            debug!("solana subscription error response: {err}");
            continue;
        }
        let method = payload.get("method").and_then(|m| m.as_str());
        let Some(result) = payload.get("params").and_then(|p| p.get("result")) else {
            continue;
        };

        match method {
            Some("slotNotification") => {
                let slot = result.get("slot").and_then(|v| v.as_u64()).unwrap_or(0);
                let parent = result.get("parent").and_then(|v| v.as_u64()).unwrap_or(0);
                let root = result.get("root").and_then(|v| v.as_u64()).unwrap_or(0);
                // A parent behind the previous slot by more than one means the
                // fork choice moved; surface the affected range.
                if parent + 1 < slot && root < parent {
                    if events
                        .send(AdapterEvent::Reorg {
                            from_height: parent + 1,
                            to_height: slot.saturating_sub(1),
                        })
                        .await
                        .is_err()
                    {
                        return Ok(());
                    }
                }
                let header = BlockHeader {
                    chain: ChainId::Solana,
                    number: slot,
                    hash: slot.to_string(),
                    parent_hash: parent.to_string(),
                    base_fee_per_gas: None,
                };
                if events.send(AdapterEvent::NewBlock(header)).await.is_err() {
                    return Ok(());
                }
            }
            Some("transactionNotification") => {
                if let Some(tx) = parse_transaction_notification(result) {
                    if events.send(AdapterEvent::PendingTx(tx)).await.is_err() {
                        return Ok(());
                    }
                }
            }
            _ => {}
        }
    }
    Err(BotError::TransientNetwork("ws stream ended".into()))
}

/// Map a transactionNotification payload into a PendingTx carrying the raw
/// wire bytes. Malformed payloads are dropped, never panicked on.
fn parse_transaction_notification(result: &Value) -> Option<PendingTx> {
    let signature = result.get("signature")?.as_str()?.to_string();
    let encoded = result.pointer("/transaction/transaction/0")?.as_str()?;
    let raw = base64::decode(encoded).ok()?;
    let tx: VersionedTransaction = bincode::deserialize(&raw).ok()?;
    let (fee_payer, first_program) = match &tx.message {
        VersionedMessage::Legacy(msg) => (
            msg.account_keys.first().map(|k| k.to_string()),
            msg.instructions
                .first()
                .and_then(|ix| msg.account_keys.get(ix.program_id_index as usize))
                .map(|k| k.to_string()),
        ),
        VersionedMessage::V0(msg) => (
            msg.account_keys.first().map(|k| k.to_string()),
            msg.instructions
                .first()
                .and_then(|ix| msg.account_keys.get(ix.program_id_index as usize))
                .map(|k| k.to_string()),
        ),
    };
    let priority_fee = extract_priority_fee(&tx);
    Some(PendingTx {
        chain: ChainId::Solana,
        hash: signature,
        from: fee_payer.unwrap_or_default(),
        to: first_program,
        input: Vec::new(),
        value: 0,
        priority_fee,
        raw: Some(raw),
        observed_at: Utc::now(),
    })
}

/// Pull the SetComputeUnitPrice value out of a transaction's compute-budget
/// instructions, for priority ordering in the mempool queue.
pub fn extract_priority_fee(tx: &VersionedTransaction) -> u128 {
    let (instructions, account_keys) = match &tx.message {
        VersionedMessage::Legacy(msg) => (&msg.instructions, &msg.account_keys),
        VersionedMessage::V0(msg) => (&msg.instructions, &msg.account_keys),
    };
    for ix in instructions {
        let Some(program) = account_keys.get(ix.program_id_index as usize) else {
            continue;
        };
        if program.to_string() != COMPUTE_BUDGET_PROGRAM {
            continue;
        }
        // SetComputeUnitPrice: tag 3 then u64 microlamports.
        if ix.data.len() >= 9 && ix.data[0] == 3 {
            if let Ok(bytes) = <[u8; 8]>::try_from(&ix.data[1..9]) {
                return u64::from_le_bytes(bytes) as u128;
            }
        }
    }
    0
}
