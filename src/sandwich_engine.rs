//! Sandwich engine: turns decoded victim intents into bracketing
//! opportunities. Front-run sizing comes from a solver over the exact
//! constant-product curves: the largest front leg that still leaves the
//! victim at or above their declared minimum out, so the victim transaction
//! cannot revert out from under the bundle.

use alloy::primitives::U256;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

use crate::amm_math::v2_amount_out;
use crate::chain_adapter::FeeData;
use crate::constants::SANDWICH_TTL_MS;
use crate::error::BotResult;
use crate::opportunity_core::derive_confidence;
use crate::pool_registry::PoolSnapshot;
use crate::price_oracle::PriceQuote;
use crate::slippage_validator::{RejectReason, SlippageValidator};
use crate::types::{
    opportunity_fingerprint, ChainId, Opportunity, OpportunityStatus, Pool, PoolState, Route,
    RouteHop, StrategyKind, TradeIntent,
};

/// Gas units for the two legs of a sandwich, per chain family.
fn sandwich_gas_units(chain: ChainId) -> u64 {
    if chain.is_evm() {
        2 * 150_000
    } else {
        2 * 60_000
    }
}

/// Native cost of `units` at the given fee levels.
pub fn gas_cost_native(chain: ChainId, fee: &FeeData, units: u64) -> u128 {
    if chain.is_evm() {
        (fee.base_fee + fee.priority_fee) * units as u128
    } else {
        // Signature fees plus compute-unit price (microlamports per CU).
        2 * fee.base_fee + (fee.priority_fee * units as u128) / 1_000_000
    }
}

#[derive(Debug, Clone)]
pub struct SandwichConfig {
    pub max_position: U256,
    pub max_tip_pct_of_profit: f64,
    /// Victims below this input size are not worth bracketing.
    pub min_victim_amount: U256,
    /// Assumed tolerance when the victim set no minimum out (bps).
    pub default_victim_tolerance_bps: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SandwichStats {
    pub victims_analyzed: u64,
    pub opportunities_built: u64,
    pub skipped_small: u64,
    pub skipped_unprofitable: u64,
    pub skipped_no_pool: u64,
}

/// Everything the bundle builder needs to assemble front/victim/back legs.
#[derive(Debug, Clone)]
pub struct SandwichPlan {
    pub front_amount_in: U256,
    pub front_amount_out: U256,
    pub back_amount_out: U256,
    pub victim_tx_hash: String,
    pub pool: Pool,
    pub gross_profit: U256,
}

pub struct SandwichEngine {
    config: SandwichConfig,
    stats: parking_lot::Mutex<SandwichStats>,
}

impl SandwichEngine {
    pub fn new(config: SandwichConfig) -> Self {
        Self {
            config,
            stats: parking_lot::Mutex::new(SandwichStats::default()),
        }
    }

    /// Analyze a victim intent. Returns the opportunity plus the execution
    /// plan when the sandwich clears profit after gas and tip.
    pub fn analyze_intent(
        &self,
        intent: &TradeIntent,
        snapshot: &PoolSnapshot,
        validator: &SlippageValidator,
        oracle: &HashMap<String, PriceQuote>,
        token_decimals: &HashMap<String, u8>,
        fee: &FeeData,
        native_usd: f64,
    ) -> BotResult<Option<(Opportunity, SandwichPlan)>> {
        self.stats.lock().victims_analyzed += 1;

        if intent.amount_in < self.config.min_victim_amount {
            self.stats.lock().skipped_small += 1;
            return Ok(None);
        }

        let Some(pool) = resolve_intent_pool(intent, snapshot) else {
            self.stats.lock().skipped_no_pool += 1;
            debug!("🥪 no pool resolved for victim {}", intent.source_tx_hash);
            return Ok(None);
        };

        // The exact solver needs constant-product reserves; concentrated and
        // stable shapes are not bracketed.
        let PoolState::V2 {
            reserve_a,
            reserve_b,
        } = &pool.state
        else {
            self.stats.lock().skipped_no_pool += 1;
            return Ok(None);
        };
        let a_to_b = intent
            .token_in()
            .map(|t| pool.token_a.address == t)
            .unwrap_or(true);
        let (reserve_in, reserve_out) = if a_to_b {
            (*reserve_a, *reserve_b)
        } else {
            (*reserve_b, *reserve_a)
        };

        // Oracle/staleness/liquidity gates on the victim's pool before any
        // sizing work. The victim's own price impact and minimum-out gates
        // do not apply: their slippage exposure is exactly the opportunity.
        let victim_validation =
            validator.validate_intent_on_pool(intent, &pool, oracle, token_decimals);
        match victim_validation.rejection {
            None
            | Some(RejectReason::PriceImpactTooHigh)
            | Some(RejectReason::AmountOutBelowMinimum) => {}
            Some(rejection) => {
                debug!(
                    "🥪 victim {} rejected pre-sizing: {}",
                    intent.source_tx_hash,
                    rejection.as_str()
                );
                return Ok(None);
            }
        }

        let victim_min_out = if intent.amount_out_min.is_zero() {
            // No declared minimum: assume the default tolerance below quote.
            let quote = v2_amount_out(intent.amount_in, reserve_in, reserve_out, pool.fee_bps)?;
            quote * U256::from(10_000 - self.config.default_victim_tolerance_bps as u64)
                / U256::from(10_000u64)
        } else {
            intent.amount_out_min
        };

        let cap = self.config.max_position.min(reserve_in / U256::from(10u64));
        let front = optimal_front_run(
            reserve_in,
            reserve_out,
            pool.fee_bps,
            intent.amount_in,
            victim_min_out,
            cap,
        )?;
        if front.is_zero() {
            self.stats.lock().skipped_unprofitable += 1;
            return Ok(None);
        }

        let sim = simulate_sandwich(
            reserve_in,
            reserve_out,
            pool.fee_bps,
            front,
            intent.amount_in,
        )?;
        let gas_cost = U256::from(gas_cost_native(
            intent.chain,
            fee,
            sandwich_gas_units(intent.chain),
        ));
        if sim.back_out <= front + gas_cost {
            self.stats.lock().skipped_unprofitable += 1;
            return Ok(None);
        }
        let gross = sim.back_out - front;
        let net_before_tip = gross - gas_cost;
        // Tip is carved from profit later by the bundle builder; discount it
        // here so thin sandwiches do not get admitted and then die at tip
        // time.
        let tip_reserve = mul_pct(net_before_tip, self.config.max_tip_pct_of_profit);
        if net_before_tip <= tip_reserve {
            self.stats.lock().skipped_unprofitable += 1;
            return Ok(None);
        }
        let expected_profit = net_before_tip - tip_reserve;

        let route = sandwich_route(&pool, intent, a_to_b);
        let fingerprint = opportunity_fingerprint(
            StrategyKind::Sandwich,
            intent.chain,
            &[&pool.key],
            Some(&intent.source_tx_hash),
            intent.amount_in,
        );
        let confidence = derive_confidence(
            0,
            intent.chain.stale_threshold_blocks(),
            &victim_validation,
            oracle_confidence_for(&pool, oracle),
        );
        let opportunity = Opportunity {
            id: Uuid::new_v4(),
            strategy: StrategyKind::Sandwich,
            status: OpportunityStatus::Pending,
            created_at: Utc::now(),
            fingerprint,
            chain: intent.chain,
            expected_profit_native: expected_profit,
            expected_profit_usd: native_to_usd(expected_profit, intent.chain, native_usd),
            confidence,
            required_capital: front,
            route,
            leg_inputs: Vec::new(),
            linked_intent: Some(intent.clone()),
            ttl_ms: SANDWICH_TTL_MS,
            bundle_id: None,
        };
        let plan = SandwichPlan {
            front_amount_in: front,
            front_amount_out: sim.front_out,
            back_amount_out: sim.back_out,
            victim_tx_hash: intent.source_tx_hash.clone(),
            pool,
            gross_profit: gross,
        };
        self.stats.lock().opportunities_built += 1;
        info!(
            "🥪 sandwich sized on {}: front {} -> expected profit {} native",
            intent.chain, front, expected_profit
        );
        Ok(Some((opportunity, plan)))
    }

    pub fn stats(&self) -> SandwichStats {
        self.stats.lock().clone()
    }
}

/// Post-front, post-victim, post-back amounts for a candidate front size.
#[derive(Debug, Clone, Copy)]
pub struct SandwichSim {
    pub front_out: U256,
    pub victim_out: U256,
    pub back_out: U256,
}

/// Walk the constant-product curve through front, victim, back.
pub fn simulate_sandwich(
    reserve_in: U256,
    reserve_out: U256,
    fee_bps: u32,
    front_in: U256,
    victim_in: U256,
) -> BotResult<SandwichSim> {
    let front_out = v2_amount_out(front_in, reserve_in, reserve_out, fee_bps)?;
    let x1 = reserve_in + front_in;
    let y1 = reserve_out - front_out;
    let victim_out = v2_amount_out(victim_in, x1, y1, fee_bps)?;
    let x2 = x1 + victim_in;
    let y2 = y1 - victim_out;
    // Back leg sells our tokens into the post-victim pool.
    let back_out = v2_amount_out(front_out, y2, x2, fee_bps)?;
    Ok(SandwichSim {
        front_out,
        victim_out,
        back_out,
    })
}

/// Largest front-run size that keeps the victim at or above their minimum
/// out. Victim output is monotonically decreasing in the front size, so a
/// binary search over [0, cap] converges to the boundary.
pub fn optimal_front_run(
    reserve_in: U256,
    reserve_out: U256,
    fee_bps: u32,
    victim_in: U256,
    victim_min_out: U256,
    cap: U256,
) -> BotResult<U256> {
    if cap.is_zero() {
        return Ok(U256::ZERO);
    }
    // Victim already underwater with no front-run: nothing to do.
    let untouched = simulate_sandwich(reserve_in, reserve_out, fee_bps, U256::from(1u64), victim_in)?;
    if untouched.victim_out < victim_min_out {
        return Ok(U256::ZERO);
    }

    let mut lo = U256::ZERO;
    let mut hi = cap;
    for _ in 0..64 {
        if hi <= lo + U256::from(1u64) {
            break;
        }
        let mid = (lo + hi) / U256::from(2u64);
        let sim = simulate_sandwich(reserve_in, reserve_out, fee_bps, mid, victim_in)?;
        if sim.victim_out >= victim_min_out {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    Ok(lo)
}

/// Route snapshot for the two bracketing legs over the victim's pool.
fn sandwich_route(pool: &Pool, intent: &TradeIntent, a_to_b: bool) -> Route {
    let (token_in, token_out) = if a_to_b {
        (pool.token_a.address.clone(), pool.token_b.address.clone())
    } else {
        (pool.token_b.address.clone(), pool.token_a.address.clone())
    };
    Route {
        chain: intent.chain,
        hops: vec![
            RouteHop {
                pool: pool.key.clone(),
                token_in: token_in.clone(),
                token_out: token_out.clone(),
                fee_bps: pool.fee_bps,
            },
            RouteHop {
                pool: pool.key.clone(),
                token_in: token_out,
                token_out: token_in,
                fee_bps: pool.fee_bps,
            },
        ],
        estimated_gas_units: sandwich_gas_units(intent.chain),
        estimated_profit_bps: 0,
        reliability: 0.85,
        amount_scale_band: (U256::ZERO, U256::MAX),
        oldest_pool_block: pool.last_observed_block,
    }
}

/// Find the pool an intent trades against: the decoder's pool hint when
/// present, else the deepest fresh pool covering the first path pair.
pub fn resolve_intent_pool(intent: &TradeIntent, snapshot: &PoolSnapshot) -> Option<Pool> {
    if let Some(hint) = &intent.pool {
        if let Some(pool) = snapshot
            .values()
            .find(|p| p.key.chain == intent.chain && &p.key.address == hint)
        {
            return Some(pool.clone());
        }
    }
    let token_in = intent.token_in()?;
    let token_out = if intent.path.len() >= 2 {
        intent.path.get(1)?.as_str()
    } else {
        return None;
    };
    snapshot
        .values()
        .filter(|p| {
            p.key.chain == intent.chain
                && !p.stale
                && ((p.token_a.address == token_in && p.token_b.address == token_out)
                    || (p.token_b.address == token_in && p.token_a.address == token_out))
        })
        .max_by_key(|p| match &p.state {
            PoolState::V2 { reserve_a, .. } => *reserve_a,
            PoolState::V3 { liquidity, .. } => *liquidity,
            PoolState::Stable { reserves, .. } => {
                reserves.first().copied().unwrap_or(U256::ZERO)
            }
        })
        .cloned()
}

fn mul_pct(value: U256, pct: f64) -> U256 {
    let bps = (pct * 10_000.0).clamp(0.0, 10_000.0) as u64;
    value * U256::from(bps) / U256::from(10_000u64)
}

fn oracle_confidence_for(pool: &Pool, oracle: &HashMap<String, PriceQuote>) -> f64 {
    let a = oracle
        .get(&pool.token_a.address)
        .map(|q| q.confidence)
        .unwrap_or(0.5);
    let b = oracle
        .get(&pool.token_b.address)
        .map(|q| q.confidence)
        .unwrap_or(0.5);
    a.min(b)
}

fn native_to_usd(amount: U256, chain: ChainId, native_usd: f64) -> f64 {
    let decimals = crate::config::native_decimals(chain);
    let scaled = amount.saturating_to::<u128>() as f64 / 10f64.powi(decimals as i32);
    scaled * native_usd
}

#[cfg(test)]
mod tests {
    use super::*;

    const E18: u128 = 1_000_000_000_000_000_000;

    fn u(v: u128) -> U256 {
        U256::from(v)
    }

    /// S2 shape: 50 ETH victim into a (200 ETH, 400,000 X) pool at 1%
    /// tolerance.
    #[test]
    fn test_solver_respects_victim_minimum() {
        let reserve_in = u(200 * E18);
        let reserve_out = u(400_000 * E18);
        let victim_in = u(50 * E18);
        let quote = v2_amount_out(victim_in, reserve_in, reserve_out, 30).unwrap();
        let victim_min = quote * u(9_900) / u(10_000);

        let front = optimal_front_run(
            reserve_in,
            reserve_out,
            30,
            victim_in,
            victim_min,
            u(100 * E18),
        )
        .unwrap();
        assert!(front > U256::ZERO, "1% tolerance must admit a front leg");

        // At the solved size the victim still clears their minimum.
        let sim = simulate_sandwich(reserve_in, reserve_out, 30, front, victim_in).unwrap();
        assert!(sim.victim_out >= victim_min);

        // One more wei of front-run breaks the constraint.
        let over =
            simulate_sandwich(reserve_in, reserve_out, 30, front + u(E18 / 100), victim_in)
                .unwrap();
        assert!(over.victim_out < victim_min);
    }

    #[test]
    fn test_sandwich_is_profitable_before_costs() {
        let reserve_in = u(200 * E18);
        let reserve_out = u(400_000 * E18);
        let victim_in = u(50 * E18);
        let quote = v2_amount_out(victim_in, reserve_in, reserve_out, 30).unwrap();
        let victim_min = quote * u(9_900) / u(10_000);
        let front = optimal_front_run(
            reserve_in,
            reserve_out,
            30,
            victim_in,
            victim_min,
            u(100 * E18),
        )
        .unwrap();
        let sim = simulate_sandwich(reserve_in, reserve_out, 30, front, victim_in).unwrap();
        assert!(
            sim.back_out > front,
            "gross profit expected: back {} vs front {front}",
            sim.back_out
        );
    }

    #[test]
    fn test_zero_tolerance_victim_yields_no_front() {
        let reserve_in = u(200 * E18);
        let reserve_out = u(400_000 * E18);
        let victim_in = u(50 * E18);
        // Victim demands the exact untouched quote: any front-run breaks it.
        let quote = v2_amount_out(victim_in, reserve_in, reserve_out, 30).unwrap();
        let front =
            optimal_front_run(reserve_in, reserve_out, 30, victim_in, quote, u(100 * E18))
                .unwrap();
        // The boundary search can only return a dust-sized front leg.
        assert!(front < u(E18 / 1_000));
    }

    #[test]
    fn test_tighter_tolerance_means_smaller_front() {
        let reserve_in = u(200 * E18);
        let reserve_out = u(400_000 * E18);
        let victim_in = u(50 * E18);
        let quote = v2_amount_out(victim_in, reserve_in, reserve_out, 30).unwrap();
        let loose_min = quote * u(9_800) / u(10_000); // 2%
        let tight_min = quote * u(9_950) / u(10_000); // 0.5%
        let loose = optimal_front_run(
            reserve_in, reserve_out, 30, victim_in, loose_min, u(100 * E18),
        )
        .unwrap();
        let tight = optimal_front_run(
            reserve_in, reserve_out, 30, victim_in, tight_min, u(100 * E18),
        )
        .unwrap();
        assert!(loose > tight);
    }
}
