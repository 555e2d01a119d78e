//! Arbitrage engine: sizes and prices closed cycles surfaced by the route
//! engine's fast path. Expected profit is cycle output minus input, minus
//! gas at current fees, minus the tip reserve (and minus bridge cost for a
//! cross-chain pairing).

use alloy::primitives::U256;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

use crate::amm_math::v2_optimal_cycle_input;
use crate::chain_adapter::FeeData;
use crate::constants::ARBITRAGE_TTL_MS;
use crate::error::BotResult;
use crate::opportunity_core::derive_confidence;
use crate::pool_registry::PoolSnapshot;
use crate::price_oracle::PriceQuote;
use crate::sandwich_engine::gas_cost_native;
use crate::slippage_validator::SlippageValidator;
use crate::types::{
    opportunity_fingerprint, Opportunity, OpportunityStatus, PoolKey, PoolState, Route,
    StrategyKind,
};

#[derive(Debug, Clone)]
pub struct ArbitrageConfig {
    pub max_position: U256,
    pub max_tip_pct_of_profit: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ArbitrageStats {
    pub cycles_evaluated: u64,
    pub opportunities_built: u64,
    pub skipped_unprofitable: u64,
    pub skipped_invalid: u64,
}

pub struct ArbitrageEngine {
    config: ArbitrageConfig,
    stats: parking_lot::Mutex<ArbitrageStats>,
}

impl ArbitrageEngine {
    pub fn new(config: ArbitrageConfig) -> Self {
        Self {
            config,
            stats: parking_lot::Mutex::new(ArbitrageStats::default()),
        }
    }

    /// Evaluate one cycle route. `bridge_cost` is zero for same-chain cycles
    /// and the quoted bridging fee for a cross-chain pairing.
    #[allow(clippy::too_many_arguments)]
    pub fn evaluate_cycle(
        &self,
        route: &Route,
        snapshot: &PoolSnapshot,
        validator: &SlippageValidator,
        oracle: &HashMap<String, PriceQuote>,
        token_decimals: &HashMap<String, u8>,
        fee: &FeeData,
        native_usd: f64,
        bridge_cost: U256,
        head_height: u64,
    ) -> BotResult<Option<Opportunity>> {
        self.stats.lock().cycles_evaluated += 1;

        let amount_in = self.size_cycle(route, snapshot);
        if amount_in.is_zero() || !route.accepts_amount(amount_in) {
            self.stats.lock().skipped_invalid += 1;
            return Ok(None);
        }

        // The validator walks the exact hop math and enforces every gate;
        // the minimum out for a cycle is the input itself.
        let validation = validator.validate_route(
            route,
            amount_in,
            Some(amount_in),
            snapshot,
            oracle,
            token_decimals,
        );
        if !validation.passed {
            debug!(
                "💱 cycle rejected: {:?}",
                validation.rejection.map(|r| r.as_str())
            );
            self.stats.lock().skipped_invalid += 1;
            return Ok(None);
        }

        let gas_cost = U256::from(gas_cost_native(
            route.chain,
            fee,
            route.estimated_gas_units,
        ));
        let gross = validation.expected_amount_out - amount_in;
        let costs = gas_cost + bridge_cost;
        if gross <= costs {
            self.stats.lock().skipped_unprofitable += 1;
            return Ok(None);
        }
        let net_before_tip = gross - costs;
        let tip_reserve = net_before_tip
            * U256::from((self.config.max_tip_pct_of_profit * 10_000.0) as u64)
            / U256::from(10_000u64);
        if net_before_tip <= tip_reserve {
            self.stats.lock().skipped_unprofitable += 1;
            return Ok(None);
        }
        let expected_profit = net_before_tip - tip_reserve;

        let pools: Vec<&PoolKey> = route.pool_keys().collect();
        let fingerprint = opportunity_fingerprint(
            StrategyKind::Arbitrage,
            route.chain,
            &pools,
            None,
            amount_in,
        );
        let route_age = head_height.saturating_sub(route.oldest_pool_block);
        let oracle_confidence = pools
            .iter()
            .filter_map(|k| snapshot.get(*k))
            .flat_map(|p| [p.token_a.address.clone(), p.token_b.address.clone()])
            .filter_map(|t| oracle.get(&t).map(|q| q.confidence))
            .fold(1.0f64, f64::min);
        let confidence = derive_confidence(
            route_age,
            route.chain.stale_threshold_blocks(),
            &validation,
            oracle_confidence,
        );

        // Per-leg inputs: the entry amount, then each hop's expected output
        // with a small haircut so later legs survive minor drift.
        let mut leg_inputs = vec![amount_in];
        for out in validation.hop_amounts.iter().take(route.hop_count().saturating_sub(1)) {
            leg_inputs.push(*out * U256::from(9_980u64) / U256::from(10_000u64));
        }

        let opportunity = Opportunity {
            id: Uuid::new_v4(),
            strategy: StrategyKind::Arbitrage,
            status: OpportunityStatus::Pending,
            created_at: Utc::now(),
            fingerprint,
            chain: route.chain,
            expected_profit_native: expected_profit,
            expected_profit_usd: native_to_usd_f64(expected_profit, route.chain, native_usd),
            confidence,
            required_capital: amount_in,
            route: route.clone(),
            leg_inputs,
            linked_intent: None,
            ttl_ms: ARBITRAGE_TTL_MS,
            bundle_id: None,
        };
        self.stats.lock().opportunities_built += 1;
        info!(
            "💱 arbitrage cycle on {}: in {amount_in}, expected profit {expected_profit} native ({} hops)",
            route.chain,
            route.hop_count()
        );
        Ok(Some(opportunity))
    }

    /// Input sizing: the closed-form optimum for a 2-hop constant-product
    /// cycle, the scale-band midpoint otherwise. Always clamped to the
    /// position cap and the route's validity band.
    fn size_cycle(&self, route: &Route, snapshot: &PoolSnapshot) -> U256 {
        let sized = if route.hop_count() == 2 {
            self.two_hop_optimum(route, snapshot)
        } else {
            None
        };
        let fallback = (route.amount_scale_band.0 + route.amount_scale_band.1) / U256::from(2u64);
        let amount = sized.unwrap_or(fallback);
        amount
            .min(self.config.max_position)
            .min(route.amount_scale_band.1)
            .max(route.amount_scale_band.0)
    }

    fn two_hop_optimum(&self, route: &Route, snapshot: &PoolSnapshot) -> Option<U256> {
        let first = snapshot.get(&route.hops[0].pool)?;
        let second = snapshot.get(&route.hops[1].pool)?;
        let oriented = |pool: &crate::types::Pool, token_in: &str| -> Option<(U256, U256)> {
            match &pool.state {
                PoolState::V2 {
                    reserve_a,
                    reserve_b,
                } => {
                    if pool.token_a.address == token_in {
                        Some((*reserve_a, *reserve_b))
                    } else {
                        Some((*reserve_b, *reserve_a))
                    }
                }
                _ => None,
            }
        };
        let (a_in, a_out) = oriented(&first, &route.hops[0].token_in)?;
        let (b_in, b_out) = oriented(&second, &route.hops[1].token_in)?;
        v2_optimal_cycle_input(a_in, a_out, b_in, b_out, first.fee_bps, second.fee_bps).ok()
    }

    pub fn stats(&self) -> ArbitrageStats {
        self.stats.lock().clone()
    }
}

fn native_to_usd_f64(amount: U256, chain: crate::types::ChainId, native_usd: f64) -> f64 {
    let decimals = crate::config::native_decimals(chain);
    let scaled = amount.saturating_to::<u128>() as f64 / 10f64.powi(decimals as i32);
    scaled * native_usd
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool_registry::PoolRegistry;
    use crate::route_engine::RouteEngine;
    use crate::slippage_validator::{SlippageValidator, ValidatorConfig};
    use crate::types::{ChainId, Pool, PoolState, Protocol, TokenRef};
    use std::sync::Arc;

    const WETH: &str = "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2";
    const USDC: &str = "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48";
    const POOL_A: &str = "0xaaa0000000000000000000000000000000000001";
    const POOL_B: &str = "0xbbb0000000000000000000000000000000000002";
    const E18: u128 = 1_000_000_000_000_000_000;
    const E6: u128 = 1_000_000;

    fn v2_pool(address: &str, reserve_weth: u128, reserve_usdc: u128) -> Pool {
        Pool {
            key: PoolKey::new(ChainId::Ethereum, Protocol::UniswapV2, address).unwrap(),
            token_a: TokenRef::new(ChainId::Ethereum, WETH, 18).unwrap(),
            token_b: TokenRef::new(ChainId::Ethereum, USDC, 6).unwrap(),
            fee_bps: 30,
            state: PoolState::V2 {
                reserve_a: U256::from(reserve_weth),
                reserve_b: U256::from(reserve_usdc),
            },
            last_observed_block: 100,
            stale: false,
        }
    }

    fn oracle() -> HashMap<String, PriceQuote> {
        let mut map = HashMap::new();
        for (token, price) in [(WETH, 2_050.0), (USDC, 1.0)] {
            map.insert(
                token.to_string(),
                PriceQuote {
                    token: token.to_string(),
                    price_usd: price,
                    confidence: 0.95,
                    age_ms: 5,
                    sources: vec!["a".into(), "b".into()],
                    stale: false,
                },
            );
        }
        map
    }

    fn fee() -> FeeData {
        FeeData {
            chain: ChainId::Ethereum,
            base_fee: 20_000_000_000,
            priority_fee: 1_000_000_000,
            observed_at: Utc::now(),
        }
    }

    /// Two pools 5% apart: the engine should size, validate and price the
    /// cycle at a healthy profit.
    #[test]
    fn test_profitable_cycle_builds_opportunity() {
        let registry = Arc::new(PoolRegistry::new());
        registry.upsert(v2_pool(POOL_A, 1_000 * E18, 2_100_000 * E6));
        registry.upsert(v2_pool(POOL_B, 1_000 * E18, 2_000_000 * E6));
        registry.on_new_head(ChainId::Ethereum, 101);

        let mut priority = HashMap::new();
        priority.insert(ChainId::Ethereum, vec![WETH.to_string()]);
        let route_engine = RouteEngine::new(registry.clone(), priority);
        route_engine.precompute();
        let cycles = route_engine.precomputed_cycles(ChainId::Ethereum, WETH);
        assert!(!cycles.is_empty());

        let engine = ArbitrageEngine::new(ArbitrageConfig {
            max_position: U256::from(50 * E18),
            max_tip_pct_of_profit: 0.45,
        });
        // Wide oracle band: this test exercises profit math, not the gate.
        let validator = SlippageValidator::new(ValidatorConfig {
            max_price_impact_bps: 1_000,
            oracle_deviation_band_bps: 600,
            min_pool_depth: U256::from(E18),
        });
        let decimals = HashMap::from([(WETH.to_string(), 18u8), (USDC.to_string(), 6u8)]);
        let opportunity = engine
            .evaluate_cycle(
                &cycles[0],
                &registry.snapshot(),
                &validator,
                &oracle(),
                &decimals,
                &fee(),
                2_050.0,
                U256::ZERO,
                101,
            )
            .unwrap()
            .expect("cycle should be profitable");

        assert_eq!(opportunity.strategy, StrategyKind::Arbitrage);
        assert!(opportunity.expected_profit_native > U256::ZERO);
        assert!(opportunity.expected_profit_usd > 0.0);
        assert!(opportunity.confidence > 0.3);
        assert!(opportunity.required_capital <= U256::from(50 * E18));
    }

    /// Gas dominating a thin cycle must kill it.
    #[test]
    fn test_gas_eats_thin_cycle() {
        let registry = Arc::new(PoolRegistry::new());
        // 0.35% price gap: cycle closes at ~ +10 bps on a small probe.
        registry.upsert(v2_pool(POOL_A, 1_000 * E18, 2_007_000 * E6));
        registry.upsert(v2_pool(POOL_B, 1_000 * E18, 2_000_000 * E6));
        registry.on_new_head(ChainId::Ethereum, 101);

        let mut priority = HashMap::new();
        priority.insert(ChainId::Ethereum, vec![WETH.to_string()]);
        let route_engine = RouteEngine::new(registry.clone(), priority);
        route_engine.precompute();
        let cycles = route_engine.precomputed_cycles(ChainId::Ethereum, WETH);
        if cycles.is_empty() {
            return; // fee-dominated before the engine even sees it
        }

        let engine = ArbitrageEngine::new(ArbitrageConfig {
            max_position: U256::from(E18 / 100), // 0.01 WETH cap
            max_tip_pct_of_profit: 0.45,
        });
        let validator = SlippageValidator::new(ValidatorConfig {
            max_price_impact_bps: 1_000,
            oracle_deviation_band_bps: 600,
            min_pool_depth: U256::from(E18),
        });
        // Exorbitant gas: 2000 gwei base.
        let expensive = FeeData {
            chain: ChainId::Ethereum,
            base_fee: 2_000_000_000_000,
            priority_fee: 100_000_000_000,
            observed_at: Utc::now(),
        };
        let decimals = HashMap::from([(WETH.to_string(), 18u8), (USDC.to_string(), 6u8)]);
        let result = engine
            .evaluate_cycle(
                &cycles[0],
                &registry.snapshot(),
                &validator,
                &oracle(),
                &decimals,
                &expensive,
                2_050.0,
                U256::ZERO,
                101,
            )
            .unwrap();
        assert!(result.is_none(), "gas should dominate: {result:?}");
    }
}
