//! Copy-trading engine: mirrors swaps from a configured set of target
//! wallets at a percentage of their size, capped by the per-position limit.
//! Expected profit on a copy is advisory only; what gates execution is
//! validation and the risk caps.

use alloy::primitives::U256;
use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};
use uuid::Uuid;

use crate::constants::COPY_TTL_MS;
use crate::error::BotResult;
use crate::opportunity_core::derive_confidence;
use crate::pool_registry::PoolSnapshot;
use crate::price_oracle::PriceQuote;
use crate::sandwich_engine::resolve_intent_pool;
use crate::slippage_validator::SlippageValidator;
use crate::types::{
    opportunity_fingerprint, Opportunity, OpportunityStatus, Route, RouteHop, StrategyKind,
    TradeIntent,
};

#[derive(Debug, Clone)]
pub struct CopyEngineConfig {
    /// Canonical addresses of wallets we mirror.
    pub target_wallets: HashSet<String>,
    /// Mirror percentage in bps of the target's input (1000 = 10%).
    pub mirror_bps: u32,
    pub max_position: U256,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CopyEngineStats {
    pub target_trades_seen: u64,
    pub mirrored: u64,
    pub skipped_validation: u64,
    pub skipped_no_pool: u64,
}

pub struct CopyEngine {
    config: CopyEngineConfig,
    stats: parking_lot::Mutex<CopyEngineStats>,
}

impl CopyEngine {
    pub fn new(config: CopyEngineConfig) -> Self {
        Self {
            config,
            stats: parking_lot::Mutex::new(CopyEngineStats::default()),
        }
    }

    pub fn is_target(&self, sender: &str) -> bool {
        self.config.target_wallets.contains(sender)
    }

    /// Mirror a target wallet's decoded swap. The sized trade is
    /// `min(mirror_bps * target_amount, max_position)`.
    pub fn mirror_intent(
        &self,
        intent: &TradeIntent,
        snapshot: &PoolSnapshot,
        validator: &SlippageValidator,
        oracle: &HashMap<String, PriceQuote>,
        token_decimals: &HashMap<String, u8>,
    ) -> BotResult<Option<Opportunity>> {
        if !self.is_target(&intent.sender) {
            return Ok(None);
        }
        self.stats.lock().target_trades_seen += 1;

        let sized = (intent.amount_in * U256::from(self.config.mirror_bps as u64)
            / U256::from(10_000u64))
        .min(self.config.max_position);
        if sized.is_zero() {
            return Ok(None);
        }

        let Some(pool) = resolve_intent_pool(intent, snapshot) else {
            self.stats.lock().skipped_no_pool += 1;
            debug!("📋 no pool for target trade {}", intent.source_tx_hash);
            return Ok(None);
        };

        // Validate our sized leg, not the target's. The mirrored trade keeps
        // the target's direction with no declared minimum; the validator's
        // impact gate bounds the damage instead.
        let mut mirrored = intent.clone();
        mirrored.amount_in = sized;
        mirrored.amount_out_min = U256::ZERO;
        let validation =
            validator.validate_intent_on_pool(&mirrored, &pool, oracle, token_decimals);
        if !validation.passed {
            self.stats.lock().skipped_validation += 1;
            debug!(
                "📋 mirrored trade rejected: {:?}",
                validation.rejection.map(|r| r.as_str())
            );
            return Ok(None);
        }

        let a_to_b = intent
            .token_in()
            .map(|t| pool.token_a.address == t)
            .unwrap_or(true);
        let (token_in, token_out) = if a_to_b {
            (pool.token_a.address.clone(), pool.token_b.address.clone())
        } else {
            (pool.token_b.address.clone(), pool.token_a.address.clone())
        };
        let route = Route {
            chain: intent.chain,
            hops: vec![RouteHop {
                pool: pool.key.clone(),
                token_in,
                token_out,
                fee_bps: pool.fee_bps,
            }],
            estimated_gas_units: if intent.chain.is_evm() { 180_000 } else { 70_000 },
            estimated_profit_bps: 0,
            reliability: 0.9,
            amount_scale_band: (U256::ZERO, U256::MAX),
            oldest_pool_block: pool.last_observed_block,
        };
        let fingerprint = opportunity_fingerprint(
            StrategyKind::Copy,
            intent.chain,
            &[&pool.key],
            Some(&intent.source_tx_hash),
            sized,
        );
        let confidence = derive_confidence(
            0,
            intent.chain.stale_threshold_blocks(),
            &validation,
            oracle
                .get(&pool.token_a.address)
                .map(|q| q.confidence)
                .unwrap_or(0.5),
        );

        let opportunity = Opportunity {
            id: Uuid::new_v4(),
            strategy: StrategyKind::Copy,
            status: OpportunityStatus::Pending,
            created_at: Utc::now(),
            fingerprint,
            chain: intent.chain,
            // Advisory: a copy trade's edge is the target's alpha, which we
            // do not price.
            expected_profit_native: U256::ZERO,
            expected_profit_usd: 0.0,
            confidence,
            required_capital: sized,
            route,
            leg_inputs: Vec::new(),
            linked_intent: Some(mirrored),
            ttl_ms: COPY_TTL_MS,
            bundle_id: None,
        };
        self.stats.lock().mirrored += 1;
        info!(
            "📋 mirroring {} of target {}'s {} trade on {}",
            sized, intent.sender, intent.amount_in, intent.chain
        );
        Ok(Some(opportunity))
    }

    pub fn stats(&self) -> CopyEngineStats {
        self.stats.lock().clone()
    }
}
