//! Relay submitter: drives one bundle through
//! Built -> Signed -> Submitted -> Included/Expired/Failed. The Risk
//! Governor gates the Built->Submitted edge; transient submission errors
//! retry with backoff inside the block deadline; inclusion is confirmed by
//! comparing our transaction hashes against canonical block/slot contents
//! for the chain's monitoring window.

use alloy::primitives::U256;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::chain_adapter::ChainAdapter;
use crate::error::{BotError, BotResult};
use crate::relay_client::RelayClient;
use crate::retry::RetryPolicy;
use crate::risk_governor::{RiskDecision, RiskGovernor};
use crate::types::{Bundle, BundleStatus, RelayKind, StrategyKind};

/// Terminal result of one submission pass.
#[derive(Debug, Clone, Serialize)]
pub enum SubmitOutcome {
    Included {
        height: u64,
        landing_tx_hashes: Vec<String>,
    },
    /// Target passed without inclusion; the opportunity may be re-evaluated
    /// and re-bid once if the tip headroom still leaves a profit.
    Expired,
    Failed {
        reason: String,
    },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SubmitterStats {
    pub submitted: u64,
    pub included: u64,
    pub expired: u64,
    pub failed: u64,
    pub risk_blocked: u64,
    pub simulation_drops: u64,
}

pub struct RelaySubmitter {
    client: Arc<RelayClient>,
    governor: Arc<RiskGovernor>,
    stats: Mutex<SubmitterStats>,
}

impl RelaySubmitter {
    pub fn new(client: Arc<RelayClient>, governor: Arc<RiskGovernor>) -> Self {
        Self {
            client,
            governor,
            stats: Mutex::new(SubmitterStats::default()),
        }
    }

    /// Drive a built bundle to a terminal state. `notional` and
    /// `entry_token` feed the risk checks and exposure accounting.
    pub async fn execute(
        &self,
        bundle: &mut Bundle,
        notional: U256,
        entry_token: &str,
        adapter: &ChainAdapter,
    ) -> BotResult<SubmitOutcome> {
        // Risk gate before anything leaves Built.
        if let RiskDecision::Blocked(reason) =
            self.governor
                .approve_bundle(bundle.chain, bundle.strategy, notional)
        {
            self.transition(bundle, BundleStatus::Failed)?;
            self.stats.lock().risk_blocked += 1;
            self.stats.lock().failed += 1;
            return Err(BotError::RiskBlocked(reason));
        }

        // Built -> Signed: signatures were attached at build time; the edge
        // asserts they are present and consistent.
        if bundle.transactions.is_empty()
            || bundle.transactions.iter().any(|tx| tx.raw_base64.is_empty())
        {
            self.transition(bundle, BundleStatus::Failed)?;
            return Err(BotError::Fatal("bundle missing signed payloads".into()));
        }
        bundle
            .check_integrity()
            .map_err(BotError::Fatal)?;
        self.transition(bundle, BundleStatus::Signed)?;

        // Pre-submission simulation: relay-level where the relay offers it,
        // first-leg simulation through the chain adapter otherwise. A revert
        // or negative simulated profit drops the bundle.
        match self.simulate(bundle, adapter).await {
            Ok(simulated_profit) => {
                bundle.simulated_profit_native = simulated_profit;
                if let Some(profit) = simulated_profit {
                    if profit < 0 {
                        self.transition(bundle, BundleStatus::Failed)?;
                        self.stats.lock().simulation_drops += 1;
                        self.stats.lock().failed += 1;
                        return Err(BotError::Simulation(format!(
                            "negative simulated profit: {profit}"
                        )));
                    }
                }
            }
            Err(BotError::Simulation(reason)) => {
                self.transition(bundle, BundleStatus::Failed)?;
                self.stats.lock().simulation_drops += 1;
                self.stats.lock().failed += 1;
                return Err(BotError::Simulation(reason));
            }
            // Transient simulation transport trouble is not a verdict on the
            // bundle; proceed on the engine's own numbers.
            Err(e) => debug!("simulation unavailable for {}: {e}", bundle.id),
        }

        // Signed -> Submitted with bounded retries inside the block window.
        let deadline = Duration::from_millis(bundle.chain.block_time_ms() * 2);
        let policy = RetryPolicy::submission();
        let submit_result = policy
            .run("bundle_submit", deadline, || async {
                bundle_submit_once(&self.client, adapter, bundle).await
            })
            .await;
        match submit_result {
            Ok(_handle) => {
                bundle.submission_attempts += 1;
                self.transition(bundle, BundleStatus::Submitted)?;
                self.governor
                    .record_submission(bundle.chain, entry_token, notional);
                self.stats.lock().submitted += 1;
            }
            Err(e) => {
                self.transition(bundle, BundleStatus::Failed)?;
                self.stats.lock().failed += 1;
                return Err(BotError::Submission(format!("submit failed: {e}")));
            }
        }

        // Inclusion monitoring over the chain's window.
        let outcome = self.monitor_inclusion(bundle, adapter).await?;
        match &outcome {
            SubmitOutcome::Included {
                height,
                landing_tx_hashes,
            } => {
                bundle.landing_tx_hashes = landing_tx_hashes.clone();
                self.transition(bundle, BundleStatus::Included)?;
                self.stats.lock().included += 1;
                info!(
                    "✅ bundle {} included at {height} with {} txs",
                    bundle.id,
                    landing_tx_hashes.len()
                );
            }
            SubmitOutcome::Expired => {
                self.transition(bundle, BundleStatus::Expired)?;
                self.stats.lock().expired += 1;
                info!("⌛ bundle {} missed target {}", bundle.id, bundle.target_block_or_slot);
            }
            SubmitOutcome::Failed { reason } => {
                self.transition(bundle, BundleStatus::Failed)?;
                self.stats.lock().failed += 1;
                warn!("bundle {} failed: {reason}", bundle.id);
            }
        }
        Ok(outcome)
    }

    /// One re-bid after a miss: same legs, escalated tip, next target block.
    /// Allowed only once and only while the new tip still leaves profit.
    pub fn rebid_viable(
        &self,
        bundle: &Bundle,
        expected_profit: U256,
        escalated_tip: U256,
    ) -> bool {
        bundle.status == BundleStatus::Expired
            && bundle.submission_attempts <= 1
            && escalated_tip < expected_profit
    }

    async fn simulate(
        &self,
        bundle: &Bundle,
        adapter: &ChainAdapter,
    ) -> BotResult<Option<i128>> {
        if bundle.relay == RelayKind::Flashbots {
            return self.client.simulate_bundle(bundle).await;
        }
        // First-leg standalone simulation; later legs depend on earlier
        // state and cannot be judged in isolation.
        let Some(first) = bundle.transactions.first() else {
            return Ok(None);
        };
        let raw = base64::decode(&first.raw_base64)
            .map_err(|e| BotError::Fatal(format!("bundle raw decode: {e}")))?;
        let outcome = adapter.simulate_tx(&raw).await?;
        if !outcome.success {
            return Err(BotError::Simulation(
                outcome.error.unwrap_or_else(|| "leg reverts".into()),
            ));
        }
        Ok(None)
    }

    async fn monitor_inclusion(
        &self,
        bundle: &Bundle,
        adapter: &ChainAdapter,
    ) -> BotResult<SubmitOutcome> {
        let window = bundle.chain.inclusion_window();
        let last_height = bundle.target_block_or_slot + window;
        let poll_interval = Duration::from_millis(bundle.chain.block_time_ms() / 2).max(
            Duration::from_millis(100),
        );
        let wanted: Vec<&str> = bundle
            .transactions
            .iter()
            .map(|tx| tx.hash.as_str())
            .collect();

        let mut next_to_check = bundle.target_block_or_slot;
        loop {
            let head = adapter.current_height().await?;
            while next_to_check <= head.min(last_height) {
                let hashes = adapter.block_tx_hashes(next_to_check).await?;
                let all_present = wanted.iter().all(|w| hashes.iter().any(|h| h == w));
                if all_present {
                    return Ok(SubmitOutcome::Included {
                        height: next_to_check,
                        landing_tx_hashes: wanted.iter().map(|s| s.to_string()).collect(),
                    });
                }
                // Partial landing of a private bundle should not happen; it
                // means relay atomicity broke. Surface it loudly.
                let any_present = wanted.iter().any(|w| hashes.iter().any(|h| h == w));
                if any_present && bundle.relay.is_private() {
                    return Ok(SubmitOutcome::Failed {
                        reason: format!(
                            "partial bundle landing at {next_to_check}: relay atomicity violated"
                        ),
                    });
                }
                next_to_check += 1;
            }
            if head > last_height {
                return Ok(SubmitOutcome::Expired);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Forward-only status transition; an illegal edge is a broken invariant.
    fn transition(&self, bundle: &mut Bundle, to: BundleStatus) -> BotResult<()> {
        if !bundle.status.can_transition(to) {
            return Err(BotError::Fatal(format!(
                "illegal bundle transition {:?} -> {to:?} for {}",
                bundle.status, bundle.id
            )));
        }
        debug!("bundle {}: {:?} -> {to:?}", bundle.id, bundle.status);
        bundle.status = to;
        Ok(())
    }

    pub fn stats(&self) -> SubmitterStats {
        self.stats.lock().clone()
    }
}

/// Submit once: private relays through the relay client, the public mempool
/// through the chain adapter leg by leg (nonce order preserved).
async fn bundle_submit_once(
    client: &RelayClient,
    adapter: &ChainAdapter,
    bundle: &Bundle,
) -> BotResult<String> {
    if bundle.relay == RelayKind::PublicMempool {
        let mut last_hash = String::new();
        for tx in &bundle.transactions {
            let raw = base64::decode(&tx.raw_base64)
                .map_err(|e| BotError::Fatal(format!("bundle raw decode: {e}")))?;
            last_hash = adapter.submit_signed_tx(&raw).await?;
        }
        Ok(last_hash)
    } else {
        client.submit_bundle(bundle).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evm_client::EvmClient;
    use crate::risk_governor::RiskLimits;
    use crate::types::{ChainId, RiskScope, SignedBundleTx};
    use crate::wallet::WalletManager;
    use chrono::Utc;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn test_bundle(strategy: StrategyKind) -> Bundle {
        Bundle {
            id: Uuid::new_v4(),
            opportunity_id: Uuid::new_v4(),
            strategy,
            chain: ChainId::Ethereum,
            relay: RelayKind::Flashbots,
            transactions: vec![SignedBundleTx {
                hash: "0xaa".into(),
                raw_base64: base64::encode([2u8, 1]),
                signer: "0xsigner".into(),
                nonce: Some(1),
            }],
            victim_raw_base64: None,
            target_block_or_slot: 100,
            tip_native: U256::from(10u64),
            status: BundleStatus::Built,
            simulated_profit_native: None,
            actual_profit_native: None,
            submission_attempts: 0,
            landing_tx_hashes: vec![],
            created_at: Utc::now(),
        }
    }

    fn submitter_with_kill(kill: Option<RiskScope>) -> RelaySubmitter {
        std::env::set_var(
            "TRIDENT_SUBMITTER_EVM_KEY",
            "0x4c0883a69102937d6231471b5dbb6204fe51296170827936ea5cce4b76994b0f",
        );
        let sources = HashMap::from([(
            ChainId::Ethereum,
            crate::config::PrivateKeySource::Env {
                var: "TRIDENT_SUBMITTER_EVM_KEY".into(),
            },
        )]);
        let wallet = Arc::new(WalletManager::from_sources(&sources).unwrap());
        let client = Arc::new(
            RelayClient::new(
                HashMap::from([(RelayKind::Flashbots, "http://127.0.0.1:1".to_string())]),
                wallet,
            )
            .unwrap(),
        );
        let governor = Arc::new(RiskGovernor::new(RiskLimits::with_defaults(
            HashMap::from([(ChainId::Ethereum, U256::from(u64::MAX))]),
            HashMap::from([(ChainId::Ethereum, U256::from(u64::MAX))]),
            8,
        )));
        if let Some(scope) = kill {
            governor.restore_kill(&scope);
        }
        RelaySubmitter::new(client, governor)
    }

    fn adapter() -> ChainAdapter {
        ChainAdapter::Evm(
            EvmClient::new(ChainId::Ethereum, "http://127.0.0.1:1", "ws://127.0.0.1:1").unwrap(),
        )
    }

    /// Risk kill honored: a killed scope fails the bundle out of Built with
    /// no submission attempt (S6 / property 6).
    #[tokio::test]
    async fn test_global_kill_blocks_built_to_submitted() {
        let submitter = submitter_with_kill(Some(RiskScope::Global));
        let mut bundle = test_bundle(StrategyKind::Arbitrage);
        let result = submitter
            .execute(&mut bundle, U256::from(1u64), "weth", &adapter())
            .await;
        assert!(matches!(result, Err(BotError::RiskBlocked(_))));
        assert_eq!(bundle.status, BundleStatus::Failed);
        assert_eq!(bundle.submission_attempts, 0);
        assert_eq!(submitter.stats().risk_blocked, 1);
    }

    /// Strategy-scope kill blocks only that strategy (S6).
    #[tokio::test]
    async fn test_strategy_kill_is_scoped() {
        let submitter =
            submitter_with_kill(Some(RiskScope::Strategy(StrategyKind::Sandwich)));
        let mut sandwich = test_bundle(StrategyKind::Sandwich);
        let result = submitter
            .execute(&mut sandwich, U256::from(1u64), "weth", &adapter())
            .await;
        assert!(matches!(result, Err(BotError::RiskBlocked(_))));
        assert_eq!(sandwich.status, BundleStatus::Failed);

        // Arbitrage passes the risk gate; it then dies on the unreachable
        // test endpoints, which is fine: it got past Built.
        let mut arb = test_bundle(StrategyKind::Arbitrage);
        let result = submitter
            .execute(&mut arb, U256::from(1u64), "weth", &adapter())
            .await;
        assert!(!matches!(result, Err(BotError::RiskBlocked(_))));
    }

    #[test]
    fn test_illegal_transition_is_fatal() {
        let submitter = submitter_with_kill(None);
        let mut bundle = test_bundle(StrategyKind::Arbitrage);
        bundle.status = BundleStatus::Included;
        assert!(matches!(
            submitter.transition(&mut bundle, BundleStatus::Submitted),
            Err(BotError::Fatal(_))
        ));
    }

    #[test]
    fn test_rebid_policy() {
        let submitter = submitter_with_kill(None);
        let mut bundle = test_bundle(StrategyKind::Arbitrage);
        bundle.status = BundleStatus::Expired;
        bundle.submission_attempts = 1;
        // Escalated tip below profit: viable exactly once.
        assert!(submitter.rebid_viable(&bundle, U256::from(100u64), U256::from(60u64)));
        bundle.submission_attempts = 2;
        assert!(!submitter.rebid_viable(&bundle, U256::from(100u64), U256::from(60u64)));
        bundle.submission_attempts = 1;
        // Tip that eats the whole profit: not viable.
        assert!(!submitter.rebid_viable(&bundle, U256::from(50u64), U256::from(60u64)));
    }
}
