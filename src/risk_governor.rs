//! Risk governor: the single authority for kill-switch decisions. Tracks
//! realized PnL, consecutive failures, daily loss and open exposure, and
//! gates every bundle before submission. Kill events are durable (the
//! coordinator persists everything surfaced by `take_events`) and recovery
//! is an explicit operator action, also recorded.

use alloy::primitives::U256;
use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::{error, info, warn};

use crate::constants::{CONSECUTIVE_FAILURE_ALERT, CONSECUTIVE_FAILURE_KILL};
use crate::types::{ChainId, RiskEvent, RiskScope, RiskSeverity, StrategyKind};

#[derive(Debug, Clone)]
pub struct RiskLimits {
    /// Per-chain notional cap for a single bundle, native smallest units.
    pub max_position_size: HashMap<ChainId, U256>,
    /// Per-chain daily realized-loss cap.
    pub max_daily_loss: HashMap<ChainId, U256>,
    pub max_concurrent_bundles: usize,
    pub alert_after_failures: u32,
    pub kill_after_failures: u32,
}

impl RiskLimits {
    pub fn with_defaults(
        max_position_size: HashMap<ChainId, U256>,
        max_daily_loss: HashMap<ChainId, U256>,
        max_concurrent_bundles: usize,
    ) -> Self {
        Self {
            max_position_size,
            max_daily_loss,
            max_concurrent_bundles,
            alert_after_failures: CONSECUTIVE_FAILURE_ALERT,
            kill_after_failures: CONSECUTIVE_FAILURE_KILL,
        }
    }
}

/// Outcome of a pre-submission risk check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RiskDecision {
    Approved,
    Blocked(String),
}

impl RiskDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, RiskDecision::Approved)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RiskGovernorStats {
    pub approvals: u64,
    pub blocks: u64,
    pub kills_emitted: u64,
    pub resets: u64,
}

#[derive(Default)]
struct RiskState {
    halted_global: bool,
    halted_strategies: HashSet<StrategyKind>,
    halted_chains: HashSet<ChainId>,
    consecutive_failures: HashMap<StrategyKind, u32>,
    realized_pnl: HashMap<StrategyKind, i128>,
    daily_loss: HashMap<ChainId, U256>,
    day: Option<NaiveDate>,
    open_exposure: HashMap<(ChainId, String), U256>,
    inflight_bundles: usize,
    pending_events: Vec<RiskEvent>,
}

pub struct RiskGovernor {
    limits: RiskLimits,
    state: Mutex<RiskState>,
    stats: Mutex<RiskGovernorStats>,
}

impl RiskGovernor {
    pub fn new(limits: RiskLimits) -> Self {
        Self {
            limits,
            state: Mutex::new(RiskState::default()),
            stats: Mutex::new(RiskGovernorStats::default()),
        }
    }

    /// Gate a bundle before it is allowed to leave Built. Checks the kill
    /// switches, the per-trade notional cap and the concurrency cap.
    pub fn approve_bundle(
        &self,
        chain: ChainId,
        strategy: StrategyKind,
        notional: U256,
    ) -> RiskDecision {
        let mut state = self.state.lock();
        self.roll_day(&mut state);

        let blocked = if state.halted_global {
            Some("global kill active".to_string())
        } else if state.halted_strategies.contains(&strategy) {
            Some(format!("strategy {strategy} killed"))
        } else if state.halted_chains.contains(&chain) {
            Some(format!("chain {chain} killed"))
        } else if let Some(cap) = self.limits.max_position_size.get(&chain) {
            if notional > *cap {
                Some(format!("notional {notional} exceeds cap {cap}"))
            } else {
                None
            }
        } else {
            None
        };
        let blocked = blocked.or_else(|| {
            if state.inflight_bundles >= self.limits.max_concurrent_bundles {
                Some(format!(
                    "{} bundles already in flight",
                    state.inflight_bundles
                ))
            } else {
                None
            }
        });

        match blocked {
            Some(reason) => {
                self.stats.lock().blocks += 1;
                warn!("🛑 risk blocked {strategy} bundle on {chain}: {reason}");
                RiskDecision::Blocked(reason)
            }
            None => {
                self.stats.lock().approvals += 1;
                RiskDecision::Approved
            }
        }
    }

    /// Record that an approved bundle left for a relay.
    pub fn record_submission(
        &self,
        chain: ChainId,
        token: &str,
        notional: U256,
    ) {
        let mut state = self.state.lock();
        state.inflight_bundles += 1;
        let exposure = state
            .open_exposure
            .entry((chain, token.to_string()))
            .or_insert(U256::ZERO);
        *exposure = exposure.saturating_add(notional);
    }

    /// Record a settled bundle: realized PnL (negative = loss), success
    /// flag, and exposure release. Emits Alert/Kill events per policy.
    pub fn record_outcome(
        &self,
        chain: ChainId,
        strategy: StrategyKind,
        token: &str,
        notional: U256,
        realized_native: i128,
        success: bool,
    ) {
        let mut state = self.state.lock();
        self.roll_day(&mut state);

        state.inflight_bundles = state.inflight_bundles.saturating_sub(1);
        if let Some(exposure) = state.open_exposure.get_mut(&(chain, token.to_string())) {
            *exposure = exposure.saturating_sub(notional);
        }
        *state.realized_pnl.entry(strategy).or_insert(0) += realized_native;

        if realized_native < 0 {
            let loss = U256::from(realized_native.unsigned_abs());
            let daily_val = {
                let daily = state.daily_loss.entry(chain).or_insert(U256::ZERO);
                *daily = daily.saturating_add(loss);
                *daily
            };
            if let Some(cap) = self.limits.max_daily_loss.get(&chain) {
                if daily_val > *cap && !state.halted_global {
                    state.halted_global = true;
                    let event = RiskEvent::new(
                        RiskSeverity::Kill,
                        RiskScope::Global,
                        format!("daily loss {daily_val} breached cap {cap} on {chain}"),
                    );
                    error!("💀 {}", event.reason);
                    state.pending_events.push(event);
                    self.stats.lock().kills_emitted += 1;
                }
            }
        }

        if success {
            state.consecutive_failures.insert(strategy, 0);
        } else {
            let failures = state.consecutive_failures.entry(strategy).or_insert(0);
            *failures += 1;
            let failures = *failures;
            if failures == self.limits.alert_after_failures {
                let event = RiskEvent::new(
                    RiskSeverity::Alert,
                    RiskScope::Strategy(strategy),
                    format!("{failures} consecutive {strategy} failures"),
                );
                warn!("⚠️ {}", event.reason);
                state.pending_events.push(event);
            } else if failures >= self.limits.kill_after_failures
                && !state.halted_strategies.contains(&strategy)
            {
                state.halted_strategies.insert(strategy);
                let event = RiskEvent::new(
                    RiskSeverity::Kill,
                    RiskScope::Strategy(strategy),
                    format!("{failures} consecutive {strategy} failures"),
                );
                error!("💀 {}", event.reason);
                state.pending_events.push(event);
                self.stats.lock().kills_emitted += 1;
            }
        }
    }

    /// Emit a Kill directly (fatal invariant path).
    pub fn emergency_kill(&self, scope: RiskScope, reason: &str) -> RiskEvent {
        let mut state = self.state.lock();
        match &scope {
            RiskScope::Global => state.halted_global = true,
            RiskScope::Strategy(s) => {
                state.halted_strategies.insert(*s);
            }
            RiskScope::Chain(c) => {
                state.halted_chains.insert(*c);
            }
            RiskScope::Token(_) => {}
        }
        let event = RiskEvent::new(RiskSeverity::Kill, scope, reason);
        state.pending_events.push(event.clone());
        self.stats.lock().kills_emitted += 1;
        event
    }

    /// Operator-initiated recovery. Clears the kill for the scope and
    /// records the action as a durable Info event.
    pub fn operator_reset(&self, scope: RiskScope, operator: &str) -> RiskEvent {
        let mut state = self.state.lock();
        match &scope {
            RiskScope::Global => {
                state.halted_global = false;
                state.daily_loss.clear();
            }
            RiskScope::Strategy(s) => {
                state.halted_strategies.remove(s);
                state.consecutive_failures.insert(*s, 0);
            }
            RiskScope::Chain(c) => {
                state.halted_chains.remove(c);
            }
            RiskScope::Token(_) => {}
        }
        let event = RiskEvent::new(
            RiskSeverity::Info,
            scope,
            format!("operator {operator} reset kill switch"),
        );
        info!("🔓 {}", event.reason);
        state.pending_events.push(event.clone());
        self.stats.lock().resets += 1;
        event
    }

    /// Re-apply a persisted kill on startup (durable kill semantics).
    pub fn restore_kill(&self, scope: &RiskScope) {
        let mut state = self.state.lock();
        match scope {
            RiskScope::Global => state.halted_global = true,
            RiskScope::Strategy(s) => {
                state.halted_strategies.insert(*s);
            }
            RiskScope::Chain(c) => {
                state.halted_chains.insert(*c);
            }
            RiskScope::Token(_) => {}
        }
    }

    /// Drain events for persistence. The store writes these before any
    /// further submission proceeds.
    pub fn take_events(&self) -> Vec<RiskEvent> {
        std::mem::take(&mut self.state.lock().pending_events)
    }

    pub fn is_halted(&self) -> bool {
        self.state.lock().halted_global
    }

    pub fn realized_pnl(&self, strategy: StrategyKind) -> i128 {
        self.state
            .lock()
            .realized_pnl
            .get(&strategy)
            .copied()
            .unwrap_or(0)
    }

    pub fn open_exposure(&self, chain: ChainId, token: &str) -> U256 {
        self.state
            .lock()
            .open_exposure
            .get(&(chain, token.to_string()))
            .copied()
            .unwrap_or(U256::ZERO)
    }

    pub fn stats(&self) -> RiskGovernorStats {
        self.stats.lock().clone()
    }

    /// Reset daily counters at UTC midnight.
    fn roll_day(&self, state: &mut RiskState) {
        let today = Utc::now().date_naive();
        if state.day != Some(today) {
            state.day = Some(today);
            state.daily_loss.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const E18: u128 = 1_000_000_000_000_000_000;

    fn limits() -> RiskLimits {
        RiskLimits {
            max_position_size: HashMap::from([(ChainId::Ethereum, U256::from(5 * E18))]),
            max_daily_loss: HashMap::from([(ChainId::Ethereum, U256::from(2 * E18))]),
            max_concurrent_bundles: 2,
            alert_after_failures: 2,
            kill_after_failures: 3,
        }
    }

    #[test]
    fn test_per_trade_cap() {
        let governor = RiskGovernor::new(limits());
        assert!(governor
            .approve_bundle(ChainId::Ethereum, StrategyKind::Arbitrage, U256::from(E18))
            .is_approved());
        assert!(matches!(
            governor.approve_bundle(
                ChainId::Ethereum,
                StrategyKind::Arbitrage,
                U256::from(6 * E18)
            ),
            RiskDecision::Blocked(_)
        ));
    }

    #[test]
    fn test_daily_loss_cap_triggers_global_kill() {
        let governor = RiskGovernor::new(limits());
        // Two 1.5 ETH losses breach the 2 ETH daily cap.
        for _ in 0..2 {
            governor.record_submission(ChainId::Ethereum, "weth", U256::from(E18));
            governor.record_outcome(
                ChainId::Ethereum,
                StrategyKind::Arbitrage,
                "weth",
                U256::from(E18),
                -((15 * E18 / 10) as i128),
                false,
            );
        }
        assert!(governor.is_halted());
        let events = governor.take_events();
        assert!(events
            .iter()
            .any(|e| e.severity == RiskSeverity::Kill && e.scope == RiskScope::Global));
        // Property: nothing is approved until an operator reset.
        assert!(matches!(
            governor.approve_bundle(ChainId::Ethereum, StrategyKind::Copy, U256::from(1u64)),
            RiskDecision::Blocked(_)
        ));
        governor.operator_reset(RiskScope::Global, "ops");
        assert!(governor
            .approve_bundle(ChainId::Ethereum, StrategyKind::Copy, U256::from(1u64))
            .is_approved());
    }

    #[test]
    fn test_consecutive_failures_alert_then_strategy_kill() {
        let governor = RiskGovernor::new(limits());
        for _ in 0..3 {
            governor.record_submission(ChainId::Ethereum, "weth", U256::from(1u64));
            governor.record_outcome(
                ChainId::Ethereum,
                StrategyKind::Sandwich,
                "weth",
                U256::from(1u64),
                0,
                false,
            );
        }
        let events = governor.take_events();
        assert!(events.iter().any(|e| e.severity == RiskSeverity::Alert));
        assert!(events.iter().any(
            |e| e.severity == RiskSeverity::Kill
                && e.scope == RiskScope::Strategy(StrategyKind::Sandwich)
        ));
        // Sandwich blocked; arbitrage still flows (S6).
        assert!(matches!(
            governor.approve_bundle(ChainId::Ethereum, StrategyKind::Sandwich, U256::from(1u64)),
            RiskDecision::Blocked(_)
        ));
        assert!(governor
            .approve_bundle(ChainId::Ethereum, StrategyKind::Arbitrage, U256::from(1u64))
            .is_approved());
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let governor = RiskGovernor::new(limits());
        for success in [false, true, false, false] {
            governor.record_submission(ChainId::Ethereum, "weth", U256::from(1u64));
            governor.record_outcome(
                ChainId::Ethereum,
                StrategyKind::Sandwich,
                "weth",
                U256::from(1u64),
                0,
                success,
            );
        }
        // Streak is 2, not 4: alert fired, no kill.
        let events = governor.take_events();
        assert!(events.iter().all(|e| e.severity != RiskSeverity::Kill));
    }

    #[test]
    fn test_concurrency_cap_and_exposure_tracking() {
        let governor = RiskGovernor::new(limits());
        governor.record_submission(ChainId::Ethereum, "weth", U256::from(E18));
        governor.record_submission(ChainId::Ethereum, "weth", U256::from(E18));
        assert_eq!(
            governor.open_exposure(ChainId::Ethereum, "weth"),
            U256::from(2 * E18)
        );
        assert!(matches!(
            governor.approve_bundle(ChainId::Ethereum, StrategyKind::Arbitrage, U256::from(1u64)),
            RiskDecision::Blocked(_)
        ));
        governor.record_outcome(
            ChainId::Ethereum,
            StrategyKind::Arbitrage,
            "weth",
            U256::from(E18),
            1_000,
            true,
        );
        assert_eq!(
            governor.open_exposure(ChainId::Ethereum, "weth"),
            U256::from(E18)
        );
        assert!(governor
            .approve_bundle(ChainId::Ethereum, StrategyKind::Arbitrage, U256::from(1u64))
            .is_approved());
    }

    #[test]
    fn test_restore_kill_on_startup() {
        let governor = RiskGovernor::new(limits());
        governor.restore_kill(&RiskScope::Strategy(StrategyKind::Sandwich));
        assert!(matches!(
            governor.approve_bundle(ChainId::Ethereum, StrategyKind::Sandwich, U256::from(1u64)),
            RiskDecision::Blocked(_)
        ));
    }
}
