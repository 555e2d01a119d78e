//! Slippage and sanity validation for intended trades.
//!
//! Validation is a pure function of (trade, pool snapshot, oracle quotes):
//! the same inputs always produce the same `ValidationResult`, which is what
//! lets the opportunity core re-validate idempotently. Amount math runs on
//! the exact AMM formulas; only the oracle-deviation gate works in floats,
//! since USD quotes arrive that way.

use alloy::primitives::U256;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::amm_math::{execution_impact_bps, input_side_depth, pool_amount_out};
use crate::error::{BotError, BotResult};
use crate::pool_registry::PoolSnapshot;
use crate::price_oracle::PriceQuote;
use crate::types::{Pool, PoolKey, Route, TradeIntent};

#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    pub max_price_impact_bps: u32,
    pub oracle_deviation_band_bps: u32,
    /// Minimum input-side depth of every pool on the path, in raw units of
    /// that pool's input token.
    pub min_pool_depth: U256,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_price_impact_bps: crate::constants::DEFAULT_MAX_SLIPPAGE_BPS,
            oracle_deviation_band_bps: crate::constants::DEFAULT_ORACLE_DEVIATION_BAND_BPS,
            min_pool_depth: U256::from(1u64),
        }
    }
}

/// Why a trade failed validation. Carried verbatim into the opportunity's
/// rejection reason and the durable store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    PriceImpactTooHigh,
    AmountOutBelowMinimum,
    LiquidityBelowFloor,
    OracleDeviation,
    StalePoolState,
    MissingPool,
    MathFailure,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::PriceImpactTooHigh => "price_impact_too_high",
            RejectReason::AmountOutBelowMinimum => "amount_out_below_minimum",
            RejectReason::LiquidityBelowFloor => "liquidity_below_floor",
            RejectReason::OracleDeviation => "oracle_deviation",
            RejectReason::StalePoolState => "stale_pool_state",
            RejectReason::MissingPool => "missing_pool",
            RejectReason::MathFailure => "math_failure",
        }
    }
}

/// Numeric rationale for the pass/reject decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub passed: bool,
    pub expected_amount_out: U256,
    /// Cumulative execution impact across hops against each pool's mid.
    pub price_impact_bps: u32,
    /// Input amount over first-hop depth.
    pub liquidity_utilization_bps: u32,
    /// Worst pool-vs-oracle deviation seen, when oracle data was available.
    pub oracle_deviation_bps: Option<u32>,
    /// Output amount after each hop, in hop order.
    pub hop_amounts: Vec<U256>,
    pub rejection: Option<RejectReason>,
}

impl ValidationResult {
    fn rejected(reason: RejectReason) -> Self {
        Self {
            passed: false,
            expected_amount_out: U256::ZERO,
            price_impact_bps: 0,
            liquidity_utilization_bps: 0,
            oracle_deviation_bps: None,
            hop_amounts: Vec::new(),
            rejection: Some(reason),
        }
    }
}

pub struct SlippageValidator {
    config: ValidatorConfig,
}

impl SlippageValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    /// Validate a route for a proposed input, enforcing every gate. The
    /// `oracle` map is keyed by canonical token address, values in USD.
    pub fn validate_route(
        &self,
        route: &Route,
        amount_in: U256,
        amount_out_min: Option<U256>,
        snapshot: &PoolSnapshot,
        oracle: &HashMap<String, PriceQuote>,
        token_decimals: &HashMap<String, u8>,
    ) -> ValidationResult {
        let mut amount = amount_in;
        let mut total_impact_bps = 0u32;
        let mut worst_deviation: Option<u32> = None;
        let mut first_hop_utilization = 0u32;
        let mut hop_amounts = Vec::with_capacity(route.hops.len());

        for (hop_index, hop) in route.hops.iter().enumerate() {
            let Some(pool) = snapshot.get(&hop.pool) else {
                return ValidationResult::rejected(RejectReason::MissingPool);
            };
            if pool.stale {
                return ValidationResult::rejected(RejectReason::StalePoolState);
            }
            let a_to_b = pool.token_a.address == hop.token_in;

            let depth = input_side_depth(&pool.state, a_to_b);
            if depth < self.config.min_pool_depth {
                return ValidationResult::rejected(RejectReason::LiquidityBelowFloor);
            }
            if hop_index == 0 {
                first_hop_utilization = ratio_bps(amount, depth);
            }

            let Ok(out) = pool_amount_out(&pool.state, pool.fee_bps, a_to_b, amount) else {
                return ValidationResult::rejected(RejectReason::MathFailure);
            };
            if out.is_zero() {
                return ValidationResult::rejected(RejectReason::MathFailure);
            }

            if let Ok(impact) = hop_impact_bps(&pool, a_to_b, amount, out) {
                total_impact_bps = total_impact_bps.saturating_add(impact);
            }

            if let Some(deviation) =
                oracle_deviation_bps(&pool, oracle, token_decimals)
            {
                worst_deviation = Some(worst_deviation.map_or(deviation, |w| w.max(deviation)));
            }

            hop_amounts.push(out);
            amount = out;
        }

        let mut rejection = None;
        if total_impact_bps > self.config.max_price_impact_bps {
            rejection = Some(RejectReason::PriceImpactTooHigh);
        } else if let Some(min_out) = amount_out_min {
            if amount < min_out {
                rejection = Some(RejectReason::AmountOutBelowMinimum);
            }
        }
        if rejection.is_none() {
            if let Some(deviation) = worst_deviation {
                if deviation > self.config.oracle_deviation_band_bps {
                    rejection = Some(RejectReason::OracleDeviation);
                }
            }
        }

        ValidationResult {
            passed: rejection.is_none(),
            expected_amount_out: amount,
            price_impact_bps: total_impact_bps,
            liquidity_utilization_bps: first_hop_utilization,
            oracle_deviation_bps: worst_deviation,
            hop_amounts,
            rejection,
        }
    }

    /// Validate a decoded victim/copy intent against a single pool. Used by
    /// the sandwich and copy engines where there is no multi-hop route yet.
    pub fn validate_intent_on_pool(
        &self,
        intent: &TradeIntent,
        pool: &Pool,
        oracle: &HashMap<String, PriceQuote>,
        token_decimals: &HashMap<String, u8>,
    ) -> ValidationResult {
        let a_to_b = intent
            .token_in()
            .map(|t| pool.token_a.address == t)
            .unwrap_or(true);
        let depth = input_side_depth(&pool.state, a_to_b);
        if pool.stale {
            return ValidationResult::rejected(RejectReason::StalePoolState);
        }
        if depth < self.config.min_pool_depth {
            return ValidationResult::rejected(RejectReason::LiquidityBelowFloor);
        }
        let Ok(out) = pool_amount_out(&pool.state, pool.fee_bps, a_to_b, intent.amount_in) else {
            return ValidationResult::rejected(RejectReason::MathFailure);
        };
        let impact = hop_impact_bps(pool, a_to_b, intent.amount_in, out).unwrap_or(u32::MAX);
        let deviation = oracle_deviation_bps(pool, oracle, token_decimals);

        let mut rejection = None;
        if impact > self.config.max_price_impact_bps {
            rejection = Some(RejectReason::PriceImpactTooHigh);
        } else if !intent.amount_out_min.is_zero() && out < intent.amount_out_min {
            rejection = Some(RejectReason::AmountOutBelowMinimum);
        } else if let Some(dev) = deviation {
            if dev > self.config.oracle_deviation_band_bps {
                rejection = Some(RejectReason::OracleDeviation);
            }
        }

        ValidationResult {
            passed: rejection.is_none(),
            expected_amount_out: out,
            price_impact_bps: impact,
            liquidity_utilization_bps: ratio_bps(intent.amount_in, depth),
            oracle_deviation_bps: deviation,
            hop_amounts: vec![out],
            rejection,
        }
    }
}

fn ratio_bps(numerator: U256, denominator: U256) -> u32 {
    if denominator.is_zero() {
        return u32::MAX;
    }
    (numerator.saturating_mul(U256::from(10_000u64)) / denominator).saturating_to::<u32>()
}

/// Execution impact of one hop against the pool's pre-trade mid.
fn hop_impact_bps(pool: &Pool, a_to_b: bool, amount_in: U256, amount_out: U256) -> BotResult<u32> {
    match &pool.state {
        crate::types::PoolState::V2 {
            reserve_a,
            reserve_b,
        } => {
            let (r_in, r_out) = if a_to_b {
                (*reserve_a, *reserve_b)
            } else {
                (*reserve_b, *reserve_a)
            };
            execution_impact_bps(amount_in, amount_out, r_in, r_out)
        }
        // Concentrated/stable shapes: approximate with utilization of the
        // active depth; the protocol fee already dominates small trades.
        _ => {
            let depth = input_side_depth(&pool.state, a_to_b);
            Ok(ratio_bps(amount_in, depth).min(10_000))
        }
    }
}

/// Pool mid-price vs oracle cross-rate, in bps. None when either token has
/// no oracle quote.
fn oracle_deviation_bps(
    pool: &Pool,
    oracle: &HashMap<String, PriceQuote>,
    token_decimals: &HashMap<String, u8>,
) -> Option<u32> {
    let quote_a = oracle.get(&pool.token_a.address)?;
    let quote_b = oracle.get(&pool.token_b.address)?;
    if quote_a.price_usd <= 0.0 || quote_b.price_usd <= 0.0 {
        return None;
    }
    let mid_e18 = pool.mid_price_e18()?;
    // Raw-unit pool price of b per a; oracle cross-rate adjusted for
    // decimals gives the expected raw ratio.
    let dec_a = token_decimals
        .get(&pool.token_a.address)
        .copied()
        .unwrap_or(pool.token_a.decimals);
    let dec_b = token_decimals
        .get(&pool.token_b.address)
        .copied()
        .unwrap_or(pool.token_b.decimals);
    let pool_price = mid_e18.saturating_to::<u128>() as f64 / 1e18;
    let oracle_price =
        (quote_a.price_usd / quote_b.price_usd) * 10f64.powi(dec_b as i32 - dec_a as i32);
    if !oracle_price.is_finite() || oracle_price <= 0.0 {
        return None;
    }
    let deviation = ((pool_price - oracle_price).abs() / oracle_price) * 10_000.0;
    Some(deviation.min(u32::MAX as f64) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool_registry::PoolRegistry;
    use crate::types::{ChainId, PoolState, Protocol, Route, RouteHop, TokenRef};
    use std::sync::Arc;

    const WETH: &str = "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2";
    const USDC: &str = "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48";
    const POOL: &str = "0xb4e16d0168e52d35cacd2c6185b44281ec28c9dc";
    const E18: u128 = 1_000_000_000_000_000_000;
    const E6: u128 = 1_000_000;

    fn weth_usdc_pool(reserve_weth: u128, reserve_usdc: u128) -> Pool {
        Pool {
            key: PoolKey::new(ChainId::Ethereum, Protocol::UniswapV2, POOL).unwrap(),
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

    fn snapshot_with(pool: Pool) -> PoolSnapshot {
        let registry = Arc::new(PoolRegistry::new());
        registry.upsert(pool);
        registry.snapshot()
    }

    fn route_over_pool() -> Route {
        Route {
            chain: ChainId::Ethereum,
            hops: vec![RouteHop {
                pool: PoolKey::new(ChainId::Ethereum, Protocol::UniswapV2, POOL).unwrap(),
                token_in: WETH.to_string(),
                token_out: USDC.to_string(),
                fee_bps: 30,
            }],
            estimated_gas_units: 110_000,
            estimated_profit_bps: 0,
            reliability: 0.95,
            amount_scale_band: (U256::from(E18 / 10), U256::from(10 * E18)),
            oldest_pool_block: 100,
        }
    }

    fn oracle(weth_usd: f64, usdc_usd: f64) -> HashMap<String, PriceQuote> {
        let mut map = HashMap::new();
        for (token, price) in [(WETH, weth_usd), (USDC, usdc_usd)] {
            map.insert(
                token.to_string(),
                PriceQuote {
                    token: token.to_string(),
                    price_usd: price,
                    confidence: 0.95,
                    age_ms: 10,
                    sources: vec!["test".into()],
                    stale: false,
                },
            );
        }
        map
    }

    fn decimals() -> HashMap<String, u8> {
        HashMap::from([(WETH.to_string(), 18u8), (USDC.to_string(), 6u8)])
    }

    fn validator() -> SlippageValidator {
        SlippageValidator::new(ValidatorConfig {
            max_price_impact_bps: 300,
            oracle_deviation_band_bps: 200,
            min_pool_depth: U256::from(E18),
        })
    }

    #[test]
    fn test_small_trade_passes_all_gates() {
        let snapshot = snapshot_with(weth_usdc_pool(1_000 * E18, 2_000_000 * E6));
        let result = validator().validate_route(
            &route_over_pool(),
            U256::from(E18),
            Some(U256::from(1_980 * E6)),
            &snapshot,
            &oracle(2_000.0, 1.0),
            &decimals(),
        );
        assert!(result.passed, "rejected: {:?}", result.rejection);
        assert!(result.expected_amount_out > U256::from(1_990 * E6));
        assert!(result.price_impact_bps < 50);
        assert_eq!(result.liquidity_utilization_bps, 10);
    }

    #[test]
    fn test_oversized_trade_rejected_on_impact() {
        let snapshot = snapshot_with(weth_usdc_pool(1_000 * E18, 2_000_000 * E6));
        let result = validator().validate_route(
            &route_over_pool(),
            U256::from(100 * E18),
            None,
            &snapshot,
            &oracle(2_000.0, 1.0),
            &decimals(),
        );
        assert!(!result.passed);
        assert_eq!(result.rejection, Some(RejectReason::PriceImpactTooHigh));
    }

    #[test]
    fn test_min_out_gate() {
        let snapshot = snapshot_with(weth_usdc_pool(1_000 * E18, 2_000_000 * E6));
        let result = validator().validate_route(
            &route_over_pool(),
            U256::from(E18),
            Some(U256::from(2_100 * E6)), // demands more than spot
            &snapshot,
            &oracle(2_000.0, 1.0),
            &decimals(),
        );
        assert_eq!(result.rejection, Some(RejectReason::AmountOutBelowMinimum));
    }

    #[test]
    fn test_oracle_deviation_gate() {
        // Pool prices WETH at 2000 USDC but the oracle says 2150: 750 bps
        // apart, beyond the 200 bps band.
        let snapshot = snapshot_with(weth_usdc_pool(1_000 * E18, 2_000_000 * E6));
        let result = validator().validate_route(
            &route_over_pool(),
            U256::from(E18),
            None,
            &snapshot,
            &oracle(2_150.0, 1.0),
            &decimals(),
        );
        assert_eq!(result.rejection, Some(RejectReason::OracleDeviation));
        assert!(result.oracle_deviation_bps.unwrap() > 600);
    }

    #[test]
    fn test_liquidity_floor_gate() {
        let snapshot = snapshot_with(weth_usdc_pool(E18 / 2, 1_000 * E6));
        let result = validator().validate_route(
            &route_over_pool(),
            U256::from(E18 / 100),
            None,
            &snapshot,
            &oracle(2_000.0, 1.0),
            &decimals(),
        );
        assert_eq!(result.rejection, Some(RejectReason::LiquidityBelowFloor));
    }

    #[test]
    fn test_stale_pool_rejected() {
        let mut pool = weth_usdc_pool(1_000 * E18, 2_000_000 * E6);
        pool.stale = true;
        let snapshot = snapshot_with(pool);
        let result = validator().validate_route(
            &route_over_pool(),
            U256::from(E18),
            None,
            &snapshot,
            &oracle(2_000.0, 1.0),
            &decimals(),
        );
        assert_eq!(result.rejection, Some(RejectReason::StalePoolState));
    }

    #[test]
    fn test_validation_is_idempotent() {
        let snapshot = snapshot_with(weth_usdc_pool(1_000 * E18, 2_000_000 * E6));
        let quotes = oracle(2_000.0, 1.0);
        let decs = decimals();
        let v = validator();
        let route = route_over_pool();
        let first = v.validate_route(
            &route,
            U256::from(E18),
            Some(U256::from(1_980 * E6)),
            &snapshot,
            &quotes,
            &decs,
        );
        let second = v.validate_route(
            &route,
            U256::from(E18),
            Some(U256::from(1_980 * E6)),
            &snapshot,
            &quotes,
            &decs,
        );
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }
}
