//! Relay clients: one wire format per privileged relay, matched on the
//! `RelayKind` variant. Flashbots-style bundles sign the payload with
//! EIP-191 in the auth header; Jito takes base58 transactions and enforces
//! a bundle-per-second rate limit; BloxRoute/NodeReal speak their own
//! JSON-RPC methods over authenticated HTTPS.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::constants::{duration_from_ms, JITO_RATE_LIMIT_MS, JITO_TIP_FLOOR_URL, RPC_TIMEOUT_MS};
use crate::error::{BotError, BotResult};
use crate::types::{Bundle, ChainId, RelayKind, StrategyKind};
use crate::wallet::WalletManager;

/// Jito tip floor percentiles, cached between refreshes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TipFloorResponse {
    #[serde(rename = "landed_tips_25th_percentile")]
    pub landed_tips_25th: f64,
    #[serde(rename = "landed_tips_50th_percentile")]
    pub landed_tips_50th: f64,
    #[serde(rename = "landed_tips_75th_percentile")]
    pub landed_tips_75th: f64,
    #[serde(rename = "landed_tips_95th_percentile")]
    pub landed_tips_95th: f64,
    #[serde(rename = "landed_tips_99th_percentile")]
    pub landed_tips_99th: f64,
}

#[derive(Debug, Clone)]
struct CachedTipFloor {
    data: TipFloorResponse,
    fetched_at: Instant,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RelayClientStats {
    pub submissions: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub rate_limited_waits: u64,
}

pub struct RelayClient {
    http: reqwest::Client,
    endpoints: HashMap<RelayKind, String>,
    wallet: Arc<WalletManager>,
    last_jito_submission: Mutex<Option<Instant>>,
    tip_floor: Mutex<Option<CachedTipFloor>>,
    stats: Mutex<RelayClientStats>,
}

impl RelayClient {
    pub fn new(endpoints: HashMap<RelayKind, String>, wallet: Arc<WalletManager>) -> BotResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(duration_from_ms(RPC_TIMEOUT_MS))
            .build()
            .map_err(|e| BotError::Config(format!("relay http client: {e}")))?;
        Ok(Self {
            http,
            endpoints,
            wallet,
            last_jito_submission: Mutex::new(None),
            tip_floor: Mutex::new(None),
            stats: Mutex::new(RelayClientStats::default()),
        })
    }

    pub fn endpoint(&self, relay: RelayKind) -> BotResult<&str> {
        self.endpoints
            .get(&relay)
            .map(|s| s.as_str())
            .ok_or_else(|| BotError::Config(format!("no endpoint for relay {}", relay.as_str())))
    }

    /// Submit a private-relay bundle. Returns the relay's bundle handle.
    /// Public-mempool submission goes through the chain adapter instead.
    pub async fn submit_bundle(&self, bundle: &Bundle) -> BotResult<String> {
        self.stats.lock().submissions += 1;
        let result = match bundle.relay {
            RelayKind::Flashbots => self.submit_flashbots(bundle).await,
            RelayKind::Jito => self.submit_jito(bundle).await,
            RelayKind::Bloxroute | RelayKind::Nodereal => self.submit_bsc_relay(bundle).await,
            RelayKind::PublicMempool => Err(BotError::Submission(
                "public mempool submission is adapter-side".into(),
            )),
        };
        match &result {
            Ok(handle) => {
                self.stats.lock().accepted += 1;
                info!(
                    "🚀 {} accepted bundle {} as {handle}",
                    bundle.relay.as_str(),
                    bundle.id
                );
            }
            Err(e) => {
                self.stats.lock().rejected += 1;
                warn!("{} rejected bundle {}: {e}", bundle.relay.as_str(), bundle.id);
            }
        }
        result
    }

    /// Flashbots-style eth_sendBundle with the EIP-191 auth header.
    async fn submit_flashbots(&self, bundle: &Bundle) -> BotResult<String> {
        let endpoint = self.endpoint(RelayKind::Flashbots)?.to_string();
        let txs = evm_wire_txs(bundle)?;
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_sendBundle",
            "params": [{
                "txs": txs,
                "blockNumber": format!("0x{:x}", bundle.target_block_or_slot),
            }]
        })
        .to_string();
        let signature = self.wallet.flashbots_signature(bundle.chain, &body)?;
        let response: Value = self
            .http
            .post(&endpoint)
            .header("Content-Type", "application/json")
            .header("X-Flashbots-Signature", signature)
            .body(body)
            .send()
            .await?
            .json()
            .await
            .map_err(|e| BotError::Protocol(format!("flashbots response: {e}")))?;
        if let Some(err) = response.get("error").filter(|e| !e.is_null()) {
            return Err(BotError::Submission(format!("flashbots: {err}")));
        }
        response
            .pointer("/result/bundleHash")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| BotError::Protocol("flashbots: missing bundleHash".into()))
    }

    /// Jito block-engine sendBundle: base58 transactions, one bundle per
    /// rate-limit window, tip transfer already inside the closing leg.
    async fn submit_jito(&self, bundle: &Bundle) -> BotResult<String> {
        self.honor_jito_rate_limit().await;
        let endpoint = format!(
            "{}/api/v1/bundles",
            self.endpoint(RelayKind::Jito)?.trim_end_matches('/')
        );
        let txs: Vec<String> = bundle
            .transactions
            .iter()
            .map(|tx| {
                base64::decode(&tx.raw_base64)
                    .map(|raw| bs58::encode(raw).into_string())
                    .map_err(|e| BotError::Fatal(format!("bundle raw decode: {e}")))
            })
            .collect::<BotResult<_>>()?;
        let body = json!({
            "jsonrpc": "2.0",
            "id": "1",
            "method": "sendBundle",
            "params": [txs],
        });
        let response: Value = self
            .http
            .post(&endpoint)
            .json(&body)
            .send()
            .await?
            .json()
            .await
            .map_err(|e| BotError::Protocol(format!("jito response: {e}")))?;
        if let Some(err) = response.get("error").filter(|e| !e.is_null()) {
            return Err(BotError::Submission(format!("jito: {err}")));
        }
        response
            .get("result")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| BotError::Protocol("jito: missing bundle id".into()))
    }

    /// BloxRoute / NodeReal BSC bundle endpoints share the blxr submit
    /// shape; auth rides the configured endpoint URL.
    async fn submit_bsc_relay(&self, bundle: &Bundle) -> BotResult<String> {
        let endpoint = self.endpoint(bundle.relay)?.to_string();
        let txs = evm_wire_txs(bundle)?;
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "blxr_submit_bundle",
            "params": {
                "transaction": txs,
                "block_number": format!("0x{:x}", bundle.target_block_or_slot),
            }
        });
        let response: Value = self
            .http
            .post(&endpoint)
            .json(&body)
            .send()
            .await?
            .json()
            .await
            .map_err(|e| BotError::Protocol(format!("{} response: {e}", bundle.relay.as_str())))?;
        if let Some(err) = response.get("error").filter(|e| !e.is_null()) {
            return Err(BotError::Submission(format!(
                "{}: {err}",
                bundle.relay.as_str()
            )));
        }
        response
            .pointer("/result/bundleHash")
            .or_else(|| response.get("result"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| BotError::Protocol("bsc relay: missing bundle handle".into()))
    }

    /// Flashbots eth_callBundle simulation; other relays skip simulation at
    /// the relay level (the chain adapter covers per-tx simulation).
    pub async fn simulate_bundle(&self, bundle: &Bundle) -> BotResult<Option<i128>> {
        if bundle.relay != RelayKind::Flashbots {
            return Ok(None);
        }
        let endpoint = self.endpoint(RelayKind::Flashbots)?.to_string();
        let txs = evm_wire_txs(bundle)?;
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_callBundle",
            "params": [{
                "txs": txs,
                "blockNumber": format!("0x{:x}", bundle.target_block_or_slot),
                "stateBlockNumber": "latest",
            }]
        })
        .to_string();
        let signature = self.wallet.flashbots_signature(bundle.chain, &body)?;
        let response: Value = self
            .http
            .post(&endpoint)
            .header("Content-Type", "application/json")
            .header("X-Flashbots-Signature", signature)
            .body(body)
            .send()
            .await?
            .json()
            .await
            .map_err(|e| BotError::Protocol(format!("callBundle response: {e}")))?;
        if let Some(err) = response.get("error").filter(|e| !e.is_null()) {
            return Err(BotError::Simulation(format!("callBundle: {err}")));
        }
        // Any reverting tx in the simulation kills the bundle.
        if let Some(results) = response.pointer("/result/results").and_then(|v| v.as_array()) {
            for tx_result in results {
                if tx_result.get("error").is_some() || tx_result.get("revert").is_some() {
                    return Err(BotError::Simulation(format!(
                        "bundle leg reverts: {tx_result}"
                    )));
                }
            }
        }
        let coinbase_diff = response
            .pointer("/result/coinbaseDiff")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<i128>().ok());
        Ok(coinbase_diff)
    }

    /// Current Jito tip floor (lamports at the chosen percentile), cached
    /// for the refresh window. Used as the lower bound for Solana tips.
    pub async fn jito_tip_floor(&self) -> Option<u64> {
        {
            let cached = self.tip_floor.lock();
            if let Some(entry) = cached.as_ref() {
                if entry.fetched_at.elapsed()
                    < Duration::from_secs(crate::constants::JITO_TIP_REFRESH_MINUTES * 60)
                {
                    return Some(entry.data.landed_tips_75th as u64);
                }
            }
        }
        match self.http.get(JITO_TIP_FLOOR_URL).send().await {
            Ok(response) => match response.json::<Vec<TipFloorResponse>>().await {
                Ok(rows) => {
                    let data = rows.into_iter().next()?;
                    let floor = data.landed_tips_75th as u64;
                    *self.tip_floor.lock() = Some(CachedTipFloor {
                        data,
                        fetched_at: Instant::now(),
                    });
                    Some(floor)
                }
                Err(e) => {
                    debug!("tip floor parse failed: {e}");
                    None
                }
            },
            Err(e) => {
                debug!("tip floor fetch failed: {e}");
                None
            }
        }
    }

    /// Jito allows roughly one bundle per 1.1s per key; sleep off any
    /// remainder before submitting.
    async fn honor_jito_rate_limit(&self) {
        let wait = {
            let last = self.last_jito_submission.lock();
            last.and_then(|at| {
                Duration::from_millis(JITO_RATE_LIMIT_MS).checked_sub(at.elapsed())
            })
        };
        if let Some(wait) = wait {
            self.stats.lock().rate_limited_waits += 1;
            tokio::time::sleep(wait).await;
        }
        *self.last_jito_submission.lock() = Some(Instant::now());
    }

    pub fn stats(&self) -> RelayClientStats {
        self.stats.lock().clone()
    }
}

/// EVM relay wire order: our legs with the victim's raw transaction spliced
/// between front and back for a sandwich.
fn evm_wire_txs(bundle: &Bundle) -> BotResult<Vec<String>> {
    let mut txs = Vec::with_capacity(bundle.transactions.len() + 1);
    let hex_of = |b64: &str| -> BotResult<String> {
        base64::decode(b64)
            .map(|raw| format!("0x{}", hex::encode(raw)))
            .map_err(|e| BotError::Fatal(format!("bundle raw decode: {e}")))
    };
    if bundle.strategy == StrategyKind::Sandwich {
        let victim = bundle
            .victim_raw_base64
            .as_deref()
            .ok_or_else(|| BotError::Submission("sandwich bundle without victim".into()))?;
        txs.push(hex_of(&bundle.transactions[0].raw_base64)?);
        txs.push(hex_of(victim)?);
        for tx in &bundle.transactions[1..] {
            txs.push(hex_of(&tx.raw_base64)?);
        }
    } else {
        for tx in &bundle.transactions {
            txs.push(hex_of(&tx.raw_base64)?);
        }
    }
    Ok(txs)
}

/// Which relay handles a chain when MEV protection is on.
pub fn default_relay_for(chain: ChainId) -> RelayKind {
    match chain {
        ChainId::Ethereum => RelayKind::Flashbots,
        ChainId::Bsc => RelayKind::Bloxroute,
        ChainId::Solana => RelayKind::Jito,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BundleStatus, SignedBundleTx};
    use alloy::primitives::U256;
    use chrono::Utc;
    use uuid::Uuid;

    fn bundle(strategy: StrategyKind, victim: Option<&[u8]>) -> Bundle {
        Bundle {
            id: Uuid::new_v4(),
            opportunity_id: Uuid::new_v4(),
            strategy,
            chain: ChainId::Ethereum,
            relay: RelayKind::Flashbots,
            transactions: vec![
                SignedBundleTx {
                    hash: "0xaa".into(),
                    raw_base64: base64::encode([0x02, 0x01]),
                    signer: "0xsigner".into(),
                    nonce: Some(1),
                },
                SignedBundleTx {
                    hash: "0xbb".into(),
                    raw_base64: base64::encode([0x02, 0x02]),
                    signer: "0xsigner".into(),
                    nonce: Some(2),
                },
            ],
            victim_raw_base64: victim.map(base64::encode),
            target_block_or_slot: 100,
            tip_native: U256::from(1u64),
            status: BundleStatus::Signed,
            simulated_profit_native: None,
            actual_profit_native: None,
            submission_attempts: 0,
            landing_tx_hashes: vec![],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_sandwich_wire_order_brackets_victim() {
        let bundle = bundle(StrategyKind::Sandwich, Some(&[0x02, 0xff]));
        let txs = evm_wire_txs(&bundle).unwrap();
        assert_eq!(txs, vec!["0x0201", "0x02ff", "0x0202"]);
    }

    #[test]
    fn test_sandwich_without_victim_fails_closed() {
        let bundle = bundle(StrategyKind::Sandwich, None);
        assert!(matches!(
            evm_wire_txs(&bundle),
            Err(BotError::Submission(_))
        ));
    }

    #[test]
    fn test_arbitrage_wire_order_is_leg_order() {
        let bundle = bundle(StrategyKind::Arbitrage, None);
        let txs = evm_wire_txs(&bundle).unwrap();
        assert_eq!(txs, vec!["0x0201", "0x0202"]);
    }

    #[test]
    fn test_default_relay_per_chain() {
        assert_eq!(default_relay_for(ChainId::Ethereum), RelayKind::Flashbots);
        assert_eq!(default_relay_for(ChainId::Bsc), RelayKind::Bloxroute);
        assert_eq!(default_relay_for(ChainId::Solana), RelayKind::Jito);
    }
}
