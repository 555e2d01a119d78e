//! Strategy-agnostic opportunity bookkeeping: admission (thresholds +
//! fingerprint dedupe inside a sliding TTL window), the id-keyed arena that
//! owns every `Opportunity`, and serialized lifecycle transitions. Engines
//! propose; this module decides and records.

use chrono::Utc;
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use crate::constants::OPPORTUNITY_DEDUPE_WINDOW;
use crate::error::{BotError, BotResult};
use crate::slippage_validator::ValidationResult;
use crate::types::{Opportunity, OpportunityStatus, StrategyKind};

/// Why an engine's proposal was not admitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum AdmitOutcome {
    Admitted,
    DuplicateFingerprint,
    BelowProfitThreshold,
    BelowConfidenceThreshold,
}

#[derive(Debug, Clone)]
pub struct OpportunityThresholds {
    /// Minimum expected profit in bps of required capital, per strategy.
    pub min_profit_bps: i64,
    pub min_confidence: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OpportunityCoreStats {
    pub proposed: u64,
    pub admitted: u64,
    pub duplicates: u64,
    pub below_threshold: u64,
    pub transitions: u64,
    pub expired: u64,
}

pub struct OpportunityCore {
    thresholds: HashMap<StrategyKind, OpportunityThresholds>,
    dedupe: Mutex<LruCache<String, Instant>>,
    dedupe_ttl: Duration,
    arena: Mutex<HashMap<Uuid, Opportunity>>,
    stats: Mutex<OpportunityCoreStats>,
}

impl OpportunityCore {
    pub fn new(
        thresholds: HashMap<StrategyKind, OpportunityThresholds>,
        dedupe_ttl: Duration,
    ) -> Self {
        Self {
            thresholds,
            dedupe: Mutex::new(LruCache::new(
                NonZeroUsize::new(OPPORTUNITY_DEDUPE_WINDOW).expect("nonzero window"),
            )),
            dedupe_ttl,
            arena: Mutex::new(HashMap::new()),
            stats: Mutex::new(OpportunityCoreStats::default()),
        }
    }

    /// Admit or reject a proposed opportunity. Admission inserts it into the
    /// arena in `Pending` and claims its fingerprint for the dedupe window.
    pub fn admit(&self, opportunity: Opportunity) -> (AdmitOutcome, Option<Uuid>) {
        self.stats.lock().proposed += 1;

        let thresholds = self.thresholds.get(&opportunity.strategy);
        if let Some(t) = thresholds {
            // Copy-trade profit is advisory, never gating.
            if opportunity.strategy != StrategyKind::Copy {
                let profit_bps = profit_bps_of(&opportunity);
                if profit_bps < t.min_profit_bps {
                    debug!(
                        "💤 {} opportunity below profit threshold: {profit_bps} bps",
                        opportunity.strategy
                    );
                    self.stats.lock().below_threshold += 1;
                    return (AdmitOutcome::BelowProfitThreshold, None);
                }
            }
            if opportunity.confidence < t.min_confidence {
                self.stats.lock().below_threshold += 1;
                return (AdmitOutcome::BelowConfidenceThreshold, None);
            }
        }

        {
            let mut dedupe = self.dedupe.lock();
            if let Some(seen_at) = dedupe.get(&opportunity.fingerprint) {
                if seen_at.elapsed() <= self.dedupe_ttl {
                    self.stats.lock().duplicates += 1;
                    return (AdmitOutcome::DuplicateFingerprint, None);
                }
            }
            dedupe.put(opportunity.fingerprint.clone(), Instant::now());
        }

        let id = opportunity.id;
        info!(
            "🎯 {} opportunity admitted on {}: ~{} native profit (conf {:.2})",
            opportunity.strategy,
            opportunity.chain,
            opportunity.expected_profit_native,
            opportunity.confidence
        );
        self.arena.lock().insert(id, opportunity);
        self.stats.lock().admitted += 1;
        (AdmitOutcome::Admitted, Some(id))
    }

    /// Serialized forward-only lifecycle transition.
    pub fn transition(&self, id: Uuid, to: OpportunityStatus) -> BotResult<()> {
        let mut arena = self.arena.lock();
        let opportunity = arena
            .get_mut(&id)
            .ok_or_else(|| BotError::Fatal(format!("unknown opportunity {id}")))?;
        if !opportunity.status.can_transition(to) {
            return Err(BotError::Fatal(format!(
                "illegal opportunity transition {:?} -> {to:?} for {id}",
                opportunity.status
            )));
        }
        debug!(
            "opportunity {id}: {:?} -> {to:?}",
            opportunity.status
        );
        opportunity.status = to;
        self.stats.lock().transitions += 1;
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Option<Opportunity> {
        self.arena.lock().get(&id).cloned()
    }

    /// Attach the bundle id once the builder commits to the opportunity.
    pub fn link_bundle(&self, id: Uuid, bundle_id: Uuid) -> BotResult<()> {
        let mut arena = self.arena.lock();
        let opportunity = arena
            .get_mut(&id)
            .ok_or_else(|| BotError::Fatal(format!("unknown opportunity {id}")))?;
        opportunity.bundle_id = Some(bundle_id);
        Ok(())
    }

    /// Sweep TTL-expired, still-live opportunities into `Expired`. Returns
    /// the ids swept so the store can record them.
    pub fn expire_sweep(&self) -> Vec<Uuid> {
        let now = Utc::now();
        let mut swept = Vec::new();
        let mut arena = self.arena.lock();
        for (id, opportunity) in arena.iter_mut() {
            if !opportunity.status.is_terminal()
                && opportunity.status != OpportunityStatus::Executing
                && opportunity.is_expired(now)
            {
                opportunity.status = OpportunityStatus::Expired;
                swept.push(*id);
            }
        }
        if !swept.is_empty() {
            let mut stats = self.stats.lock();
            stats.expired += swept.len() as u64;
        }
        swept
    }

    /// Drop terminal records older than the retention bound to keep the
    /// arena from growing without bound; the durable store keeps history.
    pub fn prune_terminal(&self, older_than: Duration) {
        let now = Utc::now();
        self.arena.lock().retain(|_, o| {
            !(o.status.is_terminal()
                && now.signed_duration_since(o.created_at).num_milliseconds() as u128
                    > older_than.as_millis())
        });
    }

    pub fn stats(&self) -> OpportunityCoreStats {
        self.stats.lock().clone()
    }
}

/// Expected profit in bps of required capital.
fn profit_bps_of(opportunity: &Opportunity) -> i64 {
    if opportunity.required_capital.is_zero() {
        return 0;
    }
    (opportunity.expected_profit_native * alloy::primitives::U256::from(10_000u64)
        / opportunity.required_capital)
        .saturating_to::<i64>()
}

/// Confidence for a fresh opportunity, derived from route age, liquidity
/// depth utilization, and oracle agreement, per the validation output.
pub fn derive_confidence(
    route_age_blocks: u64,
    stale_threshold_blocks: u64,
    validation: &ValidationResult,
    oracle_confidence: f64,
) -> f64 {
    let age_factor = if stale_threshold_blocks == 0 {
        1.0
    } else {
        (1.0 - route_age_blocks as f64 / (stale_threshold_blocks as f64 + 1.0)).clamp(0.0, 1.0)
    };
    // Deep liquidity (low utilization) scores high; 10%+ utilization is
    // heavily discounted.
    let depth_factor = (1.0 - validation.liquidity_utilization_bps as f64 / 1_000.0).clamp(0.2, 1.0);
    let oracle_factor = match validation.oracle_deviation_bps {
        Some(dev) => (1.0 - dev as f64 / 1_000.0).clamp(0.0, 1.0) * oracle_confidence,
        None => 0.6 * oracle_confidence,
    };
    (age_factor * 0.35 + depth_factor * 0.30 + oracle_factor * 0.35).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        opportunity_fingerprint, ChainId, PoolKey, Protocol, Route, RouteHop, StrategyKind,
    };
    use alloy::primitives::U256;

    fn thresholds() -> HashMap<StrategyKind, OpportunityThresholds> {
        let mut map = HashMap::new();
        for strategy in [
            StrategyKind::Arbitrage,
            StrategyKind::Sandwich,
            StrategyKind::Copy,
        ] {
            map.insert(
                strategy,
                OpportunityThresholds {
                    min_profit_bps: 5,
                    min_confidence: 0.3,
                },
            );
        }
        map
    }

    fn test_route() -> Route {
        let pool =
            PoolKey::new(ChainId::Ethereum, Protocol::UniswapV2, "0xaaa0000000000000000000000000000000000001")
                .unwrap();
        Route {
            chain: ChainId::Ethereum,
            hops: vec![RouteHop {
                pool,
                token_in: "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2".into(),
                token_out: "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48".into(),
                fee_bps: 30,
            }],
            estimated_gas_units: 110_000,
            estimated_profit_bps: 20,
            reliability: 0.95,
            amount_scale_band: (U256::from(1u64), U256::from(u64::MAX)),
            oldest_pool_block: 100,
        }
    }

    fn opportunity(strategy: StrategyKind, profit: u64, capital: u64, conf: f64) -> Opportunity {
        let route = test_route();
        let pools: Vec<&PoolKey> = route.hops.iter().map(|h| &h.pool).collect();
        Opportunity {
            id: Uuid::new_v4(),
            strategy,
            status: OpportunityStatus::Pending,
            created_at: Utc::now(),
            fingerprint: opportunity_fingerprint(
                strategy,
                ChainId::Ethereum,
                &pools,
                None,
                U256::from(capital),
            ),
            chain: ChainId::Ethereum,
            expected_profit_native: U256::from(profit),
            expected_profit_usd: 0.0,
            confidence: conf,
            required_capital: U256::from(capital),
            route,
            leg_inputs: Vec::new(),
            linked_intent: None,
            ttl_ms: 1_500,
            bundle_id: None,
        }
    }

    #[test]
    fn test_admit_and_dedupe_window() {
        let core = OpportunityCore::new(thresholds(), Duration::from_secs(5));
        let first = opportunity(StrategyKind::Arbitrage, 1_000, 100_000, 0.8);
        let duplicate = opportunity(StrategyKind::Arbitrage, 1_000, 100_000, 0.8);
        assert_eq!(core.admit(first).0, AdmitOutcome::Admitted);
        // Same pools, same band -> same fingerprint -> duplicate.
        assert_eq!(
            core.admit(duplicate).0,
            AdmitOutcome::DuplicateFingerprint
        );
        assert_eq!(core.stats().duplicates, 1);
    }

    #[test]
    fn test_thresholds_gate_admission() {
        let core = OpportunityCore::new(thresholds(), Duration::from_secs(5));
        // 1 bps profit on capital: below the 5 bps floor.
        let thin = opportunity(StrategyKind::Arbitrage, 10, 100_000, 0.8);
        assert_eq!(core.admit(thin).0, AdmitOutcome::BelowProfitThreshold);
        let unsure = opportunity(StrategyKind::Sandwich, 1_000, 100_000, 0.1);
        assert_eq!(
            core.admit(unsure).0,
            AdmitOutcome::BelowConfidenceThreshold
        );
    }

    #[test]
    fn test_copy_profit_is_advisory() {
        let core = OpportunityCore::new(thresholds(), Duration::from_secs(5));
        // Zero expected profit must not gate a copy trade.
        let copy = opportunity(StrategyKind::Copy, 0, 100_000, 0.8);
        assert_eq!(core.admit(copy).0, AdmitOutcome::Admitted);
    }

    #[test]
    fn test_lifecycle_forward_only() {
        let core = OpportunityCore::new(thresholds(), Duration::from_secs(5));
        let (_, id) = core.admit(opportunity(StrategyKind::Arbitrage, 1_000, 100_000, 0.8));
        let id = id.unwrap();
        core.transition(id, OpportunityStatus::Validated).unwrap();
        core.transition(id, OpportunityStatus::Executing).unwrap();
        core.transition(id, OpportunityStatus::Landed).unwrap();
        // Backward and out-of-terminal transitions must fail.
        assert!(core.transition(id, OpportunityStatus::Pending).is_err());
        assert!(core.transition(id, OpportunityStatus::Executing).is_err());
    }

    #[test]
    fn test_expire_sweep_skips_executing() {
        let core = OpportunityCore::new(thresholds(), Duration::from_secs(5));
        let mut fast_dying = opportunity(StrategyKind::Arbitrage, 1_000, 100_000, 0.8);
        fast_dying.ttl_ms = 0;
        let (_, id1) = core.admit(fast_dying);
        let mut executing = opportunity(StrategyKind::Sandwich, 2_000, 100_000, 0.8);
        executing.ttl_ms = 0;
        let (_, id2) = core.admit(executing);
        let id2 = id2.unwrap();
        core.transition(id2, OpportunityStatus::Validated).unwrap();
        core.transition(id2, OpportunityStatus::Executing).unwrap();

        std::thread::sleep(Duration::from_millis(5));
        let swept = core.expire_sweep();
        assert!(swept.contains(&id1.unwrap()));
        assert!(!swept.contains(&id2));
        assert_eq!(
            core.get(id2).unwrap().status,
            OpportunityStatus::Executing
        );
    }

    #[test]
    fn test_derive_confidence_orders_sensibly() {
        use crate::slippage_validator::ValidationResult;
        let clean = ValidationResult {
            passed: true,
            expected_amount_out: U256::from(1u64),
            price_impact_bps: 10,
            liquidity_utilization_bps: 10,
            oracle_deviation_bps: Some(5),
            hop_amounts: vec![U256::from(1u64)],
            rejection: None,
        };
        let murky = ValidationResult {
            passed: true,
            expected_amount_out: U256::from(1u64),
            price_impact_bps: 200,
            liquidity_utilization_bps: 900,
            oracle_deviation_bps: Some(600),
            hop_amounts: vec![U256::from(1u64)],
            rejection: None,
        };
        let fresh_clean = derive_confidence(0, 3, &clean, 0.95);
        let old_murky = derive_confidence(3, 3, &murky, 0.5);
        assert!(fresh_clean > old_murky);
        assert!((0.0..=1.0).contains(&fresh_clean));
    }
}
