//! Authoritative registry of observed pools. The decoder (on fresh
//! observations) and the scheduled refresher are the only writers; every
//! other component reads copy-on-write snapshots, so route scoring and
//! validation never contend on a lock.

use alloy::primitives::U256;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::types::{ChainId, Pool, PoolKey, PoolState};

/// Immutable view shared with readers. Cloning is an Arc bump.
pub type PoolSnapshot = Arc<HashMap<PoolKey, Pool>>;

#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolRegistryStats {
    pub pools_tracked: usize,
    pub updates: u64,
    pub stale_marked: u64,
}

pub struct PoolRegistry {
    inner: RwLock<PoolSnapshot>,
    head_heights: RwLock<HashMap<ChainId, u64>>,
    stats: RwLock<PoolRegistryStats>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Arc::new(HashMap::new())),
            head_heights: RwLock::new(HashMap::new()),
            stats: RwLock::new(PoolRegistryStats::default()),
        }
    }

    /// Lock-free-for-readers snapshot of the whole registry.
    pub fn snapshot(&self) -> PoolSnapshot {
        self.inner.read().clone()
    }

    pub fn get(&self, key: &PoolKey) -> Option<Pool> {
        self.inner.read().get(key).cloned()
    }

    /// Insert or refresh a pool. Returns the reserve movement in bps against
    /// the previous observation so callers can trigger an off-cycle route
    /// precompute on large moves.
    pub fn upsert(&self, pool: Pool) -> u32 {
        let mut guard = self.inner.write();
        let mut map = (**guard).clone();
        let delta_bps = map
            .get(&pool.key)
            .map(|prev| reserve_delta_bps(&prev.state, &pool.state))
            .unwrap_or(u32::MAX);
        map.insert(pool.key.clone(), pool);
        *guard = Arc::new(map);
        let mut stats = self.stats.write();
        stats.updates += 1;
        stats.pools_tracked = guard.len();
        delta_bps
    }

    /// Refresh reserves for a known pool from a scheduled scan.
    pub fn update_state(&self, key: &PoolKey, state: PoolState, observed_block: u64) -> u32 {
        let mut guard = self.inner.write();
        let Some(existing) = guard.get(key) else {
            return 0;
        };
        let mut updated = existing.clone();
        let delta_bps = reserve_delta_bps(&updated.state, &state);
        updated.state = state;
        updated.last_observed_block = observed_block;
        updated.stale = false;
        let mut map = (**guard).clone();
        map.insert(key.clone(), updated);
        *guard = Arc::new(map);
        self.stats.write().updates += 1;
        delta_bps
    }

    /// Record the new chain head and mark pools whose observation lags beyond
    /// the chain's staleness threshold.
    pub fn on_new_head(&self, chain: ChainId, height: u64) {
        self.head_heights.write().insert(chain, height);
        let threshold = chain.stale_threshold_blocks();
        let mut guard = self.inner.write();
        let needs_update = guard.values().any(|p| {
            p.key.chain == chain
                && !p.stale
                && height.saturating_sub(p.last_observed_block) > threshold
        });
        if !needs_update {
            return;
        }
        let mut map = (**guard).clone();
        let mut marked = 0u64;
        for pool in map.values_mut() {
            if pool.key.chain == chain
                && !pool.stale
                && height.saturating_sub(pool.last_observed_block) > threshold
            {
                pool.stale = true;
                marked += 1;
            }
        }
        *guard = Arc::new(map);
        if marked > 0 {
            debug!("🕸️ {chain}: marked {marked} pools stale at height {height}");
            self.stats.write().stale_marked += marked;
        }
    }

    pub fn head_height(&self, chain: ChainId) -> Option<u64> {
        self.head_heights.read().get(&chain).copied()
    }

    pub fn stats(&self) -> PoolRegistryStats {
        self.stats.read().clone()
    }
}

impl Default for PoolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Uniswap V2 factory and pair init-code hash (Ethereum mainnet).
const UNISWAP_V2_FACTORY: &str = "0x5c69bee701ef814a2b6a3edd4b1652cb9cc5aa6f";
const UNISWAP_V2_INIT_CODE_HASH: &str =
    "96e8ac4277198ff8b6f785478aa9a39f403cb768dd02cbe8eeec2c8ef1a315fc";
/// PancakeSwap V2 factory and init-code hash (BSC).
const PANCAKE_V2_FACTORY: &str = "0xca143ce32fe78f1f7019d7d551a6402fc5350c73";
const PANCAKE_V2_INIT_CODE_HASH: &str =
    "00fb7f630766e6a796048ea87d01acd3068e8ff67d078148a3fa3f4a84f69bd5";

/// Deterministic CREATE2 pair address for a v2-style factory, which is how
/// pools are discovered on first reference: no RPC needed, the refresher
/// fills in reserves afterwards.
pub fn v2_pair_address(chain: ChainId, token_a: &str, token_b: &str) -> Result<String, String> {
    use alloy::primitives::keccak256;
    let (factory, init_hash) = match chain {
        ChainId::Ethereum => (UNISWAP_V2_FACTORY, UNISWAP_V2_INIT_CODE_HASH),
        ChainId::Bsc => (PANCAKE_V2_FACTORY, PANCAKE_V2_INIT_CODE_HASH),
        ChainId::Solana => return Err("no CREATE2 pairs on solana".into()),
    };
    let decode = |addr: &str| -> Result<Vec<u8>, String> {
        hex::decode(addr.strip_prefix("0x").unwrap_or(addr))
            .map_err(|e| format!("bad address {addr}: {e}"))
    };
    let mut a = decode(token_a)?;
    let mut b = decode(token_b)?;
    if a.len() != 20 || b.len() != 20 {
        return Err("token address must be 20 bytes".into());
    }
    if a > b {
        std::mem::swap(&mut a, &mut b);
    }
    let mut salt_input = a;
    salt_input.extend_from_slice(&b);
    let salt = keccak256(&salt_input);

    let mut preimage = vec![0xffu8];
    preimage.extend_from_slice(&decode(factory)?);
    preimage.extend_from_slice(salt.as_slice());
    preimage.extend_from_slice(&decode(init_hash)?);
    let digest = keccak256(&preimage);
    Ok(format!("0x{}", hex::encode(&digest[12..])))
}

/// Largest per-side reserve movement between two observations, in bps.
fn reserve_delta_bps(old: &PoolState, new: &PoolState) -> u32 {
    fn delta(old: U256, new: U256) -> u32 {
        if old.is_zero() {
            return u32::MAX;
        }
        let diff = old.abs_diff(new);
        let bps = diff.saturating_mul(U256::from(10_000u64)) / old;
        bps.saturating_to::<u32>()
    }
    match (old, new) {
        (
            PoolState::V2 {
                reserve_a: oa,
                reserve_b: ob,
            },
            PoolState::V2 {
                reserve_a: na,
                reserve_b: nb,
            },
        ) => delta(*oa, *na).max(delta(*ob, *nb)),
        (
            PoolState::V3 {
                sqrt_price_x96: op, ..
            },
            PoolState::V3 {
                sqrt_price_x96: np, ..
            },
        ) => delta(*op, *np),
        (PoolState::Stable { reserves: or, .. }, PoolState::Stable { reserves: nr, .. }) => or
            .iter()
            .zip(nr.iter())
            .map(|(o, n)| delta(*o, *n))
            .max()
            .unwrap_or(u32::MAX),
        // Shape change means a full refresh.
        _ => u32::MAX,
    }
}
