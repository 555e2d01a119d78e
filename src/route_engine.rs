//! Route engine: a weighted directed multigraph over the pool registry.
//!
//! Two paths produce routes: a precomputed matrix of profitable 2- and
//! 3-hop cycles for configured priority tokens (the sub-millisecond fast
//! path, favoring short cycles for gas efficiency), and an on-demand
//! bounded best-first search with a wall-clock deadline. The engine is the
//! sole owner of its graph; readers get copy-on-write snapshots of the
//! precomputed matrix.

use alloy::primitives::U256;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BinaryHeap, HashMap};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::amm_math::{input_side_depth, pool_amount_out};
use crate::constants::{MAX_ROUTE_HOPS, ROUTE_SEARCH_DEADLINE_MS};
use crate::error::{BotError, BotResult};
use crate::pool_registry::{PoolRegistry, PoolSnapshot};
use crate::types::{amount_band, ChainId, Pool, Protocol, Route, RouteHop};

/// Per-protocol gas cost of one swap hop, in native gas units / CU.
fn hop_gas_units(protocol: Protocol) -> u64 {
    match protocol {
        Protocol::UniswapV2 => 110_000,
        Protocol::UniswapV3 => 140_000,
        Protocol::StableSwap => 180_000,
        Protocol::RaydiumAmmV4 | Protocol::PumpSwap => 60_000,
        Protocol::RaydiumClmm | Protocol::OrcaWhirlpool => 85_000,
    }
}

/// Base reliability by protocol family; concentrated pools revert more often
/// when the price moves a tick between observation and landing.
fn protocol_reliability(protocol: Protocol) -> f64 {
    match protocol {
        Protocol::UniswapV2 => 0.95,
        Protocol::StableSwap => 0.93,
        Protocol::UniswapV3 => 0.90,
        Protocol::RaydiumAmmV4 => 0.90,
        Protocol::RaydiumClmm | Protocol::OrcaWhirlpool => 0.85,
        Protocol::PumpSwap => 0.80,
    }
}

#[derive(Debug, Clone)]
struct Edge {
    pool: Pool,
    a_to_b: bool,
}

impl Edge {
    fn token_in(&self) -> &str {
        if self.a_to_b {
            &self.pool.token_a.address
        } else {
            &self.pool.token_b.address
        }
    }

    fn token_out(&self) -> &str {
        if self.a_to_b {
            &self.pool.token_b.address
        } else {
            &self.pool.token_a.address
        }
    }

    fn quote(&self, amount_in: U256) -> BotResult<U256> {
        pool_amount_out(&self.pool.state, self.pool.fee_bps, self.a_to_b, amount_in)
    }

    fn to_hop(&self) -> RouteHop {
        RouteHop {
            pool: self.pool.key.clone(),
            token_in: self.token_in().to_string(),
            token_out: self.token_out().to_string(),
            fee_bps: self.pool.fee_bps,
        }
    }
}

/// Token-indexed adjacency built from a registry snapshot. Stale pools are
/// excluded at build time, which is what keeps the fast path honest.
struct Adjacency {
    edges: HashMap<String, Vec<Edge>>,
}

impl Adjacency {
    fn build(snapshot: &PoolSnapshot, chain: ChainId) -> Self {
        let mut edges: HashMap<String, Vec<Edge>> = HashMap::new();
        for pool in snapshot.values() {
            if pool.key.chain != chain || pool.stale {
                continue;
            }
            edges
                .entry(pool.token_a.address.clone())
                .or_default()
                .push(Edge {
                    pool: pool.clone(),
                    a_to_b: true,
                });
            edges
                .entry(pool.token_b.address.clone())
                .or_default()
                .push(Edge {
                    pool: pool.clone(),
                    a_to_b: false,
                });
        }
        Self { edges }
    }

    fn from(&self, token: &str) -> &[Edge] {
        self.edges.get(token).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RouteEngineStats {
    pub precompute_runs: u64,
    pub precomputed_routes: usize,
    pub fast_path_hits: u64,
    pub searches: u64,
    pub search_deadline_exhausted: u64,
    pub cache_hits: u64,
}

pub struct RouteEngine {
    registry: Arc<PoolRegistry>,
    /// Priority tokens per chain: cycles are precomputed from these bases.
    priority_tokens: HashMap<ChainId, Vec<String>>,
    precomputed: RwLock<Arc<Vec<Route>>>,
    search_cache: Mutex<LruCache<String, (Instant, Vec<Route>)>>,
    search_cache_ttl: Duration,
    stats: RwLock<RouteEngineStats>,
}

impl RouteEngine {
    pub fn new(registry: Arc<PoolRegistry>, priority_tokens: HashMap<ChainId, Vec<String>>) -> Self {
        Self {
            registry,
            priority_tokens,
            precomputed: RwLock::new(Arc::new(Vec::new())),
            search_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(2_048).expect("nonzero cache size"),
            )),
            search_cache_ttl: Duration::from_millis(500),
            stats: RwLock::new(RouteEngineStats::default()),
        }
    }

    /// Recompute the opportunity matrix. Runs on a timer and whenever a pool
    /// moves past the reserve-delta threshold.
    pub fn precompute(&self) {
        let started = Instant::now();
        let snapshot = self.registry.snapshot();
        let mut routes = Vec::new();
        for (chain, bases) in &self.priority_tokens {
            let adjacency = Adjacency::build(&snapshot, *chain);
            for base in bases {
                self.collect_cycles(&adjacency, *chain, base, &mut routes);
            }
        }
        routes.sort_by(|a, b| b.estimated_profit_bps.cmp(&a.estimated_profit_bps));
        let count = routes.len();
        *self.precomputed.write() = Arc::new(routes);
        let mut stats = self.stats.write();
        stats.precompute_runs += 1;
        stats.precomputed_routes = count;
        debug!(
            "🧭 route precompute: {count} profitable cycles in {:?}",
            started.elapsed()
        );
    }

    /// Fast path: precomputed cycles for a base token, freshest first. Routes
    /// whose pools have gone stale since the matrix was built are filtered
    /// out here, so callers never act on a dead route.
    pub fn precomputed_cycles(&self, chain: ChainId, base_token: &str) -> Vec<Route> {
        let snapshot = self.registry.snapshot();
        let matrix = self.precomputed.read().clone();
        self.stats.write().fast_path_hits += 1;
        matrix
            .iter()
            .filter(|r| {
                r.chain == chain
                    && r.hops.first().map(|h| h.token_in.as_str()) == Some(base_token)
                    && self.route_is_fresh(r, &snapshot)
            })
            .cloned()
            .collect()
    }

    /// Staleness gate shared by both paths.
    fn route_is_fresh(&self, route: &Route, snapshot: &PoolSnapshot) -> bool {
        let threshold = route.chain.stale_threshold_blocks();
        let head = self.registry.head_height(route.chain).unwrap_or(0);
        route.pool_keys().all(|key| {
            snapshot.get(key).is_some_and(|pool| {
                !pool.stale && head.saturating_sub(pool.last_observed_block) <= threshold
            })
        })
    }

    /// On-demand bounded best-first search. Scoring is
    /// `profit_bps - gas_in_bps - reliability_penalty`; ties break toward
    /// fewer hops, then deeper liquidity, then higher reliability. Hard cap
    /// of 4 hops, wall-clock deadline on the whole search.
    pub fn find_routes(
        &self,
        chain: ChainId,
        token_in: &str,
        token_out: &str,
        amount_in: U256,
        gas_price_per_unit: u128,
    ) -> Vec<Route> {
        let cache_key = format!(
            "{chain}:{token_in}:{token_out}:{}",
            amount_band(amount_in)
        );
        if let Some((at, routes)) = self.search_cache.lock().get(&cache_key) {
            if at.elapsed() <= self.search_cache_ttl {
                self.stats.write().cache_hits += 1;
                return routes.clone();
            }
        }
        self.stats.write().searches += 1;
        let deadline = Instant::now() + Duration::from_millis(ROUTE_SEARCH_DEADLINE_MS);
        let snapshot = self.registry.snapshot();
        let adjacency = Adjacency::build(&snapshot, chain);
        let routes =
            best_first_search(&adjacency, chain, token_in, token_out, amount_in, deadline);
        if Instant::now() >= deadline {
            self.stats.write().search_deadline_exhausted += 1;
        }
        let mut scored: Vec<(f64, Route)> = routes
            .into_iter()
            .map(|r| (score_route(&r, amount_in, gas_price_per_unit), r))
            .collect();
        scored.sort_by(|(sa, a), (sb, b)| {
            sb.total_cmp(sa)
                .then_with(|| a.hop_count().cmp(&b.hop_count()))
                .then_with(|| b.reliability.total_cmp(&a.reliability))
        });
        let result: Vec<Route> = scored.into_iter().map(|(_, r)| r).take(8).collect();
        self.search_cache
            .lock()
            .put(cache_key, (Instant::now(), result.clone()));
        result
    }

    /// Validate that a previously issued route still holds for an amount.
    pub fn route_still_valid(&self, route: &Route, amount: U256) -> bool {
        route.accepts_amount(amount) && self.route_is_fresh(route, &self.registry.snapshot())
    }

    pub fn stats(&self) -> RouteEngineStats {
        self.stats.read().clone()
    }

    /// Enumerate profitable 2- and 3-hop cycles from `base`, pushing winners
    /// into `out`.
    fn collect_cycles(
        &self,
        adjacency: &Adjacency,
        chain: ChainId,
        base: &str,
        out: &mut Vec<Route>,
    ) {
        for first in adjacency.from(base) {
            let mid = first.token_out();
            // 2-hop: base -> mid -> base through a different pool.
            for second in adjacency.from(mid) {
                if second.token_out() == base && second.pool.key != first.pool.key {
                    if let Some(route) = self.cycle_route(chain, &[first, second]) {
                        out.push(route);
                    }
                }
                // 3-hop: base -> mid -> third -> base.
                let third_token = second.token_out();
                if third_token != base && third_token != mid {
                    for third in adjacency.from(third_token) {
                        if third.token_out() == base
                            && third.pool.key != first.pool.key
                            && third.pool.key != second.pool.key
                        {
                            if let Some(route) = self.cycle_route(chain, &[first, second, third]) {
                                out.push(route);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Probe a cycle and keep it when it closes at a profit.
    fn cycle_route(&self, chain: ChainId, edges: &[&Edge]) -> Option<Route> {
        let first = edges.first()?;
        let depth = input_side_depth(&first.pool.state, first.a_to_b);
        // Probe with 0.1% of the entry side; the band spans 4x around it.
        let probe = depth / U256::from(1_000u64);
        if probe.is_zero() {
            return None;
        }
        let mut amount = probe;
        let mut gas_units = 0u64;
        let mut reliability = 1.0f64;
        let mut oldest_block = u64::MAX;
        let mut hops = Vec::with_capacity(edges.len());
        for edge in edges {
            amount = edge.quote(amount).ok()?;
            if amount.is_zero() {
                return None;
            }
            gas_units += hop_gas_units(edge.pool.key.protocol);
            reliability *= protocol_reliability(edge.pool.key.protocol);
            oldest_block = oldest_block.min(edge.pool.last_observed_block);
            hops.push(edge.to_hop());
        }
        if amount <= probe {
            return None;
        }
        let profit_bps = ((amount - probe) * U256::from(10_000u64) / probe).saturating_to::<i64>();
        Some(Route {
            chain,
            hops,
            estimated_gas_units: gas_units,
            estimated_profit_bps: profit_bps,
            reliability,
            amount_scale_band: (probe / U256::from(4u64), probe * U256::from(4u64)),
            oldest_pool_block: oldest_block,
        })
    }
}

/// Composite score in bps-space. Gas converts to bps against the input
/// amount; an approximation that holds when amounts are quoted in the
/// chain's base token, which is how priority cycles are set up.
fn score_route(route: &Route, amount_in: U256, gas_price_per_unit: u128) -> f64 {
    let gas_native = route.estimated_gas_units as u128 * gas_price_per_unit;
    let gas_in_bps = if amount_in.is_zero() {
        0.0
    } else {
        let bps = U256::from(gas_native) * U256::from(10_000u64) / amount_in;
        bps.saturating_to::<u64>() as f64
    };
    let reliability_penalty = (1.0 - route.reliability) * 100.0;
    route.estimated_profit_bps as f64 - gas_in_bps - reliability_penalty
}

#[derive(Clone)]
struct SearchNode {
    token: String,
    amount: U256,
    hops: Vec<RouteHop>,
    gas_units: u64,
    reliability: f64,
    oldest_block: u64,
}

impl PartialEq for SearchNode {
    fn eq(&self, other: &Self) -> bool {
        self.amount == other.amount
    }
}
impl Eq for SearchNode {}
impl PartialOrd for SearchNode {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for SearchNode {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap on current amount: best-first expansion.
        self.amount.cmp(&other.amount)
    }
}

/// Best-first search from token_in to token_out, depth-capped, deadline
/// bounded. Returns complete routes, unscored.
fn best_first_search(
    adjacency: &Adjacency,
    chain: ChainId,
    token_in: &str,
    token_out: &str,
    amount_in: U256,
    deadline: Instant,
) -> Vec<Route> {
    let mut heap = BinaryHeap::new();
    let mut found = Vec::new();
    heap.push(SearchNode {
        token: token_in.to_string(),
        amount: amount_in,
        hops: Vec::new(),
        gas_units: 0,
        reliability: 1.0,
        oldest_block: u64::MAX,
    });

    while let Some(node) = heap.pop() {
        if Instant::now() >= deadline {
            debug!("route search deadline hit with {} found", found.len());
            break;
        }
        if node.hops.len() >= MAX_ROUTE_HOPS {
            continue;
        }
        for edge in adjacency.from(&node.token) {
            // No pool reuse along a path.
            if node.hops.iter().any(|h| h.pool == edge.pool.key) {
                continue;
            }
            let Ok(out_amount) = edge.quote(node.amount) else {
                continue;
            };
            if out_amount.is_zero() {
                continue;
            }
            let mut hops = node.hops.clone();
            hops.push(edge.to_hop());
            let gas_units = node.gas_units + hop_gas_units(edge.pool.key.protocol);
            let reliability = node.reliability * protocol_reliability(edge.pool.key.protocol);
            let oldest_block = node.oldest_block.min(edge.pool.last_observed_block);
            if edge.token_out() == token_out {
                found.push(Route {
                    chain,
                    hops,
                    estimated_gas_units: gas_units,
                    estimated_profit_bps: 0,
                    reliability,
                    amount_scale_band: (
                        amount_in / U256::from(4u64),
                        amount_in * U256::from(4u64),
                    ),
                    oldest_pool_block: oldest_block,
                });
                if found.len() >= 16 {
                    return found;
                }
            } else {
                heap.push(SearchNode {
                    token: edge.token_out().to_string(),
                    amount: out_amount,
                    hops,
                    gas_units,
                    reliability,
                    oldest_block,
                });
            }
        }
    }
    found
}

/// Log a one-line summary after startup so operators see the graph size.
pub fn log_engine_ready(engine: &RouteEngine) {
    let stats = engine.stats();
    info!(
        "🧭 route engine ready: {} precomputed cycles",
        stats.precomputed_routes
    );
}
