use alloy::primitives::U256;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Chains the bot trades on. Closed set; adding a chain means extending every
/// `match` on this enum, which is intentional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChainId {
    Ethereum,
    Bsc,
    Solana,
}

impl ChainId {
    /// EVM numeric chain id; None for non-EVM chains.
    pub fn evm_chain_id(&self) -> Option<u64> {
        match self {
            ChainId::Ethereum => Some(1),
            ChainId::Bsc => Some(56),
            ChainId::Solana => None,
        }
    }

    pub fn is_evm(&self) -> bool {
        !matches!(self, ChainId::Solana)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ChainId::Ethereum => "ethereum",
            ChainId::Bsc => "bsc",
            ChainId::Solana => "solana",
        }
    }

    /// Approximate block/slot cadence, used for target-block math and
    /// inclusion-monitor windows.
    pub fn block_time_ms(&self) -> u64 {
        match self {
            ChainId::Ethereum => 12_000,
            ChainId::Bsc => 3_000,
            ChainId::Solana => 400,
        }
    }

    /// How many blocks behind chain head a pool observation may lag before the
    /// pool is considered stale.
    pub fn stale_threshold_blocks(&self) -> u64 {
        match self {
            ChainId::Ethereum => 3,
            ChainId::Bsc => 8,
            ChainId::Solana => 25,
        }
    }

    /// Blocks/slots the inclusion monitor scans past the target before giving
    /// up on a submitted bundle.
    pub fn inclusion_window(&self) -> u64 {
        match self {
            ChainId::Ethereum => 2,
            ChainId::Bsc => 4,
            ChainId::Solana => 3,
        }
    }
}

impl std::str::FromStr for ChainId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ethereum" | "eth" => Ok(ChainId::Ethereum),
            "bsc" | "bnb" => Ok(ChainId::Bsc),
            "solana" | "sol" => Ok(ChainId::Solana),
            other => Err(format!("unknown chain: {other}")),
        }
    }
}

impl std::fmt::Display for ChainId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Canonical token reference. Identity is (chain, address); the address is the
/// bit-exact canonical form (lowercase 0x-hex for EVM, base58 for Solana).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRef {
    pub chain: ChainId,
    pub address: String,
    pub decimals: u8,
    pub symbol: Option<String>,
    pub verified: bool,
}

impl TokenRef {
    pub fn new(chain: ChainId, address: &str, decimals: u8) -> Result<Self, String> {
        if decimals > 36 {
            return Err(format!("decimals {decimals} out of range (0-36)"));
        }
        let address = canonical_address(chain, address)?;
        Ok(Self {
            chain,
            address,
            decimals,
            symbol: None,
            verified: false,
        })
    }

    pub fn with_symbol(mut self, symbol: &str) -> Self {
        self.symbol = Some(symbol.to_string());
        self
    }

    pub fn verified(mut self) -> Self {
        self.verified = true;
        self
    }
}

impl PartialEq for TokenRef {
    fn eq(&self, other: &Self) -> bool {
        self.chain == other.chain && self.address == other.address
    }
}

impl Eq for TokenRef {}

impl std::hash::Hash for TokenRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.chain.hash(state);
        self.address.hash(state);
    }
}

/// Normalize an address to its canonical on-chain form.
pub fn canonical_address(chain: ChainId, address: &str) -> Result<String, String> {
    if chain.is_evm() {
        let trimmed = address.strip_prefix("0x").unwrap_or(address);
        if trimmed.len() != 40 || !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!("invalid EVM address: {address}"));
        }
        Ok(format!("0x{}", trimmed.to_ascii_lowercase()))
    } else {
        let bytes = bs58::decode(address)
            .into_vec()
            .map_err(|e| format!("invalid base58 address {address}: {e}"))?;
        if bytes.len() != 32 {
            return Err(format!("invalid Solana address length: {address}"));
        }
        Ok(address.to_string())
    }
}

/// Protocols the decoder and route engine understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    UniswapV2,
    UniswapV3,
    StableSwap,
    RaydiumAmmV4,
    RaydiumClmm,
    OrcaWhirlpool,
    PumpSwap,
}

impl Protocol {
    pub fn name(&self) -> &'static str {
        match self {
            Protocol::UniswapV2 => "uniswap_v2",
            Protocol::UniswapV3 => "uniswap_v3",
            Protocol::StableSwap => "stable_swap",
            Protocol::RaydiumAmmV4 => "raydium_amm_v4",
            Protocol::RaydiumClmm => "raydium_clmm",
            Protocol::OrcaWhirlpool => "orca_whirlpool",
            Protocol::PumpSwap => "pump_swap",
        }
    }

    /// Constant-product style pools share the v2 math path.
    pub fn is_constant_product(&self) -> bool {
        matches!(
            self,
            Protocol::UniswapV2 | Protocol::RaydiumAmmV4 | Protocol::PumpSwap
        )
    }

    pub fn is_concentrated(&self) -> bool {
        matches!(
            self,
            Protocol::UniswapV3 | Protocol::RaydiumClmm | Protocol::OrcaWhirlpool
        )
    }
}

/// Protocol-specific pool identity: the pool's own canonical address on its
/// chain. Two pools may share a token pair; they never share a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolKey {
    pub chain: ChainId,
    pub protocol: Protocol,
    pub address: String,
}

impl PoolKey {
    pub fn new(chain: ChainId, protocol: Protocol, address: &str) -> Result<Self, String> {
        Ok(Self {
            chain,
            protocol,
            address: canonical_address(chain, address)?,
        })
    }
}

impl std::fmt::Display for PoolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.chain, self.protocol.name(), self.address)
    }
}

/// Reserve state, protocol-shaped. All amounts are unbounded integers; Solana
/// vault balances are widened into the V2 form on ingest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PoolState {
    /// Constant-product reserves, token_a then token_b.
    V2 { reserve_a: U256, reserve_b: U256 },
    /// Concentrated liquidity around the current price.
    V3 {
        sqrt_price_x96: U256,
        liquidity: U256,
    },
    /// Stable-swap reserves with the amplification coefficient.
    Stable { reserves: Vec<U256>, amp: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pool {
    pub key: PoolKey,
    pub token_a: TokenRef,
    pub token_b: TokenRef,
    pub fee_bps: u32,
    pub state: PoolState,
    pub last_observed_block: u64,
    pub stale: bool,
}

impl Pool {
    /// Mid-price of token_b per token_a scaled to 1e18, for oracle-deviation
    /// checks. None when the pool shape has no simple mid-price.
    pub fn mid_price_e18(&self) -> Option<U256> {
        const E18: u128 = 1_000_000_000_000_000_000;
        match &self.state {
            PoolState::V2 {
                reserve_a,
                reserve_b,
            } => {
                if reserve_a.is_zero() {
                    return None;
                }
                reserve_b
                    .checked_mul(U256::from(E18))
                    .map(|n| n / reserve_a)
            }
            PoolState::V3 { sqrt_price_x96, .. } => {
                // price = (sqrt_price_x96 / 2^96)^2, scaled to 1e18
                let sq = sqrt_price_x96.checked_mul(*sqrt_price_x96)?;
                let shifted = sq >> 96usize;
                shifted.checked_mul(U256::from(E18)).map(|n| n >> 96usize)
            }
            PoolState::Stable { .. } => Some(U256::from(E18)),
        }
    }
}

/// Router method the decoder recognized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwapMethod {
    V2SwapExactTokensForTokens,
    V2SwapTokensForExactTokens,
    V2SwapExactEthForTokens,
    V2SwapExactTokensForEth,
    V3ExactInputSingle,
    V3ExactInput,
    StableExchange,
    SolanaProgramSwap,
}

/// Canonical decoded trade intent. Immutable once emitted by the decoder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeIntent {
    pub source_tx_hash: String,
    pub chain: ChainId,
    pub protocol: Protocol,
    pub router: String,
    pub method: SwapMethod,
    /// Token addresses along the requested path, in canonical form.
    pub path: Vec<String>,
    /// Per-hop pool fee in bps, aligned with path windows (v3 paths carry
    /// these explicitly; v2 hops use the protocol default).
    pub hop_fees_bps: Vec<u32>,
    pub amount_in: U256,
    pub amount_out_min: U256,
    /// Pool account the swap touches, when the wire format names it directly
    /// (Solana program swaps). EVM router swaps derive pools from the path.
    pub pool: Option<String>,
    pub deadline: Option<u64>,
    pub sender: String,
    pub observed_at: DateTime<Utc>,
    /// Priority fee the sender attached (wei per gas on EVM, microlamports
    /// per CU on Solana). Used for mempool backpressure ordering.
    pub priority_fee: u128,
    /// Raw signed bytes of the source transaction when the feed delivered
    /// them; a sandwich bundle carries these between its legs.
    pub source_raw: Option<Vec<u8>>,
}

impl TradeIntent {
    pub fn token_in(&self) -> Option<&str> {
        self.path.first().map(|s| s.as_str())
    }

    pub fn token_out(&self) -> Option<&str> {
        self.path.last().map(|s| s.as_str())
    }

    /// Victim slippage tolerance implied by amount_out_min against a quoted
    /// amount out, in bps. None when the intent carries no minimum.
    pub fn implied_slippage_bps(&self, quoted_out: U256) -> Option<u32> {
        if quoted_out.is_zero() || self.amount_out_min.is_zero() {
            return None;
        }
        if self.amount_out_min >= quoted_out {
            return Some(0);
        }
        let diff = quoted_out - self.amount_out_min;
        let bps = diff.checked_mul(U256::from(10_000u64))? / quoted_out;
        Some(bps.saturating_to::<u32>())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StrategyKind {
    Arbitrage,
    Sandwich,
    Copy,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Arbitrage => "arbitrage",
            StrategyKind::Sandwich => "sandwich",
            StrategyKind::Copy => "copy",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opportunity lifecycle. Transitions only move forward or to a terminal
/// state; `can_transition` is the single source of truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpportunityStatus {
    Pending,
    Validated,
    Executing,
    Landed,
    Expired,
    Rejected,
}

impl OpportunityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpportunityStatus::Pending => "pending",
            OpportunityStatus::Validated => "validated",
            OpportunityStatus::Executing => "executing",
            OpportunityStatus::Landed => "landed",
            OpportunityStatus::Expired => "expired",
            OpportunityStatus::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OpportunityStatus::Landed | OpportunityStatus::Expired | OpportunityStatus::Rejected
        )
    }

    pub fn can_transition(&self, to: OpportunityStatus) -> bool {
        use OpportunityStatus::*;
        match (self, to) {
            (Pending, Validated) | (Pending, Rejected) | (Pending, Expired) => true,
            (Validated, Executing) | (Validated, Rejected) | (Validated, Expired) => true,
            (Executing, Landed) | (Executing, Expired) | (Executing, Rejected) => true,
            _ => false,
        }
    }
}

/// A hop in a route: which pool, which direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteHop {
    pub pool: PoolKey,
    pub token_in: String,
    pub token_out: String,
    pub fee_bps: u32,
}

/// Route produced by the route engine. `amount_scale_band` bounds the input
/// sizes the profit estimate was computed for; scaling outside it invalidates
/// the route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub chain: ChainId,
    pub hops: Vec<RouteHop>,
    pub estimated_gas_units: u64,
    pub estimated_profit_bps: i64,
    pub reliability: f64,
    pub amount_scale_band: (U256, U256),
    /// Lowest `last_observed_block` across constituent pools at build time.
    pub oldest_pool_block: u64,
}

impl Route {
    pub fn pool_keys(&self) -> impl Iterator<Item = &PoolKey> {
        self.hops.iter().map(|h| &h.pool)
    }

    pub fn hop_count(&self) -> usize {
        self.hops.len()
    }

    pub fn accepts_amount(&self, amount: U256) -> bool {
        amount >= self.amount_scale_band.0 && amount <= self.amount_scale_band.1
    }
}

/// An opportunity owned by the Opportunity Core. Cross-references to bundles
/// are by id only (arena-plus-index model).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: Uuid,
    pub strategy: StrategyKind,
    pub status: OpportunityStatus,
    pub created_at: DateTime<Utc>,
    pub fingerprint: String,
    pub chain: ChainId,
    /// Expected profit in the chain's native smallest unit (wei / lamports).
    pub expected_profit_native: U256,
    pub expected_profit_usd: f64,
    pub confidence: f64,
    pub required_capital: U256,
    pub route: Route,
    /// Exact input for each route hop, filled when the strategy pre-walked
    /// the hop amounts (arbitrage legs). Empty when the builder derives
    /// amounts from the plan instead.
    pub leg_inputs: Vec<U256>,
    pub linked_intent: Option<TradeIntent>,
    pub ttl_ms: u64,
    pub bundle_id: Option<Uuid>,
}

impl Opportunity {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.created_at)
            .num_milliseconds() as u64
            > self.ttl_ms
    }
}

/// Amount band used in fingerprints: trades within the same power-of-two-ish
/// band dedupe together.
pub fn amount_band(amount: U256) -> u32 {
    if amount.is_zero() {
        0
    } else {
        256 - amount.leading_zeros() as u32
    }
}

/// Structural fingerprint keying an opportunity within the dedupe window.
pub fn opportunity_fingerprint(
    strategy: StrategyKind,
    chain: ChainId,
    pool_keys: &[&PoolKey],
    victim_tx: Option<&str>,
    amount: U256,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(strategy.as_str().as_bytes());
    hasher.update(chain.name().as_bytes());
    let mut pools: Vec<String> = pool_keys.iter().map(|k| k.to_string()).collect();
    pools.sort();
    for p in &pools {
        hasher.update(p.as_bytes());
    }
    if let Some(tx) = victim_tx {
        hasher.update(tx.as_bytes());
    }
    hasher.update(amount_band(amount).to_le_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

/// Relays a bundle can be submitted through. Closed set; per-relay wire
/// formats live in `relay_client`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelayKind {
    Flashbots,
    Jito,
    Bloxroute,
    Nodereal,
    PublicMempool,
}

impl RelayKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayKind::Flashbots => "flashbots",
            RelayKind::Jito => "jito",
            RelayKind::Bloxroute => "bloxroute",
            RelayKind::Nodereal => "nodereal",
            RelayKind::PublicMempool => "public_mempool",
        }
    }

    pub fn is_private(&self) -> bool {
        !matches!(self, RelayKind::PublicMempool)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BundleStatus {
    Built,
    Signed,
    Submitted,
    Included,
    Replaced,
    Expired,
    Failed,
}

impl BundleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BundleStatus::Built => "built",
            BundleStatus::Signed => "signed",
            BundleStatus::Submitted => "submitted",
            BundleStatus::Included => "included",
            BundleStatus::Replaced => "replaced",
            BundleStatus::Expired => "expired",
            BundleStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BundleStatus::Included | BundleStatus::Expired | BundleStatus::Failed
        )
    }

    pub fn can_transition(&self, to: BundleStatus) -> bool {
        use BundleStatus::*;
        // Risk-governor kill may fail a bundle from any non-terminal state.
        if to == Failed && !self.is_terminal() {
            return true;
        }
        match (self, to) {
            (Built, Signed) => true,
            (Signed, Submitted) => true,
            (Submitted, Included) | (Submitted, Expired) | (Submitted, Replaced) => true,
            (Replaced, Submitted) => true,
            _ => false,
        }
    }
}

/// One signed transaction inside a bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedBundleTx {
    /// Transaction hash (EVM) or signature (Solana), canonical string form.
    pub hash: String,
    /// Raw signed bytes, base64.
    pub raw_base64: String,
    pub signer: String,
    /// EVM nonce; None on Solana.
    pub nonce: Option<u64>,
}

/// Ordered atomic bundle. Ordering is strategy-defined: sandwich is
/// front / victim placeholder / back, arbitrage is buy / sell, copy is
/// approval / swap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bundle {
    pub id: Uuid,
    pub opportunity_id: Uuid,
    pub strategy: StrategyKind,
    pub chain: ChainId,
    pub relay: RelayKind,
    pub transactions: Vec<SignedBundleTx>,
    /// Victim transaction carried between our legs (sandwich only); raw bytes
    /// come from the mempool observation, we never re-sign them.
    pub victim_raw_base64: Option<String>,
    pub target_block_or_slot: u64,
    pub tip_native: U256,
    pub status: BundleStatus,
    pub simulated_profit_native: Option<i128>,
    pub actual_profit_native: Option<i128>,
    pub submission_attempts: u32,
    pub landing_tx_hashes: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Bundle {
    /// Integrity check: same signer throughout, nonces strictly increasing.
    pub fn check_integrity(&self) -> Result<(), String> {
        let mut signer: Option<&str> = None;
        let mut last_nonce: Option<u64> = None;
        for tx in &self.transactions {
            match signer {
                None => signer = Some(&tx.signer),
                Some(s) if s != tx.signer => {
                    return Err(format!("mixed signers in bundle: {s} vs {}", tx.signer))
                }
                _ => {}
            }
            if let Some(nonce) = tx.nonce {
                if let Some(prev) = last_nonce {
                    if nonce <= prev {
                        return Err(format!("non-monotonic nonce {nonce} after {prev}"));
                    }
                }
                last_nonce = Some(nonce);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RiskSeverity {
    Info,
    Warn,
    Alert,
    Kill,
}

impl RiskSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskSeverity::Info => "info",
            RiskSeverity::Warn => "warn",
            RiskSeverity::Alert => "alert",
            RiskSeverity::Kill => "kill",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RiskScope {
    Global,
    Strategy(StrategyKind),
    Chain(ChainId),
    Token(String),
}

impl RiskScope {
    pub fn as_str(&self) -> String {
        match self {
            RiskScope::Global => "global".to_string(),
            RiskScope::Strategy(s) => format!("strategy:{s}"),
            RiskScope::Chain(c) => format!("chain:{c}"),
            RiskScope::Token(t) => format!("token:{t}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskEvent {
    pub severity: RiskSeverity,
    pub scope: RiskScope,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl RiskEvent {
    pub fn new(severity: RiskSeverity, scope: RiskScope, reason: impl Into<String>) -> Self {
        Self {
            severity,
            scope,
            reason: reason.into(),
            created_at: Utc::now(),
        }
    }
}

/// Speed targets for fee optimization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpeedTarget {
    Slow,
    Standard,
    Fast,
    Urgent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_evm_address_lowercases() {
        let addr = canonical_address(
            ChainId::Ethereum,
            "0xC02AAA39B223FE8D0A0E5C4F27EAD9083C756CC2",
        )
        .unwrap();
        assert_eq!(addr, "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2");
    }

    #[test]
    fn test_canonical_solana_address_roundtrips() {
        let addr = canonical_address(
            ChainId::Solana,
            "So11111111111111111111111111111111111111112",
        )
        .unwrap();
        assert_eq!(addr, "So11111111111111111111111111111111111111112");
        assert!(canonical_address(ChainId::Solana, "not-base58!").is_err());
    }

    #[test]
    fn test_token_ref_identity_ignores_metadata() {
        let a = TokenRef::new(ChainId::Ethereum, "0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2", 18)
            .unwrap()
            .with_symbol("WETH");
        let b =
            TokenRef::new(ChainId::Ethereum, "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2", 18)
                .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_token_decimals_bound() {
        assert!(TokenRef::new(ChainId::Ethereum, "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2", 37)
            .is_err());
    }

    #[test]
    fn test_opportunity_status_forward_only() {
        use OpportunityStatus::*;
        assert!(Pending.can_transition(Validated));
        assert!(Validated.can_transition(Executing));
        assert!(Executing.can_transition(Landed));
        assert!(!Validated.can_transition(Pending));
        assert!(!Landed.can_transition(Executing));
        assert!(!Rejected.can_transition(Validated));
    }

    #[test]
    fn test_bundle_status_kill_from_any_live_state() {
        use BundleStatus::*;
        for from in [Built, Signed, Submitted, Replaced] {
            assert!(from.can_transition(Failed), "{from:?} should allow Failed");
        }
        assert!(!Included.can_transition(Failed));
        assert!(!Submitted.can_transition(Built));
    }

    #[test]
    fn test_fingerprint_stable_under_pool_order() {
        let p1 = PoolKey::new(
            ChainId::Ethereum,
            Protocol::UniswapV2,
            "0xb4e16d0168e52d35cacd2c6185b44281ec28c9dc",
        )
        .unwrap();
        let p2 = PoolKey::new(
            ChainId::Ethereum,
            Protocol::UniswapV3,
            "0x8ad599c3a0ff1de082011efddc58f1908eb6e6d8",
        )
        .unwrap();
        let amount = U256::from(1_000_000_000_000_000_000u128);
        let a = opportunity_fingerprint(
            StrategyKind::Arbitrage,
            ChainId::Ethereum,
            &[&p1, &p2],
            None,
            amount,
        );
        let b = opportunity_fingerprint(
            StrategyKind::Arbitrage,
            ChainId::Ethereum,
            &[&p2, &p1],
            None,
            amount,
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_fingerprint_band_groups_similar_amounts() {
        let p = PoolKey::new(
            ChainId::Ethereum,
            Protocol::UniswapV2,
            "0xb4e16d0168e52d35cacd2c6185b44281ec28c9dc",
        )
        .unwrap();
        let fp = |amt: u128| {
            opportunity_fingerprint(
                StrategyKind::Sandwich,
                ChainId::Ethereum,
                &[&p],
                Some("0xdead"),
                U256::from(amt),
            )
        };
        // Same power-of-two band dedupes; a 4x amount does not.
        assert_eq!(fp(1_000_000), fp(1_000_500));
        assert_ne!(fp(1_000_000), fp(4_000_000));
    }

    #[test]
    fn test_bundle_integrity_nonces() {
        let tx = |nonce| SignedBundleTx {
            hash: format!("0x{nonce:064x}"),
            raw_base64: String::new(),
            signer: "0xabc".to_string(),
            nonce: Some(nonce),
        };
        let mut bundle = Bundle {
            id: Uuid::new_v4(),
            opportunity_id: Uuid::new_v4(),
            strategy: StrategyKind::Arbitrage,
            chain: ChainId::Ethereum,
            relay: RelayKind::Flashbots,
            transactions: vec![tx(5), tx(6)],
            victim_raw_base64: None,
            target_block_or_slot: 100,
            tip_native: U256::ZERO,
            status: BundleStatus::Built,
            simulated_profit_native: None,
            actual_profit_native: None,
            submission_attempts: 0,
            landing_tx_hashes: vec![],
            created_at: Utc::now(),
        };
        assert!(bundle.check_integrity().is_ok());
        bundle.transactions = vec![tx(6), tx(5)];
        assert!(bundle.check_integrity().is_err());
    }

    #[test]
    fn test_implied_slippage() {
        let intent = TradeIntent {
            source_tx_hash: "0x01".into(),
            chain: ChainId::Ethereum,
            protocol: Protocol::UniswapV2,
            router: "0x7a250d5630b4cf539739df2c5dacb4c659f2488d".into(),
            method: SwapMethod::V2SwapExactTokensForTokens,
            path: vec!["0xaa".into(), "0xbb".into()],
            hop_fees_bps: vec![30],
            amount_in: U256::from(100u64),
            amount_out_min: U256::from(990u64),
            pool: None,
            deadline: None,
            sender: "0xcc".into(),
            observed_at: Utc::now(),
            priority_fee: 0,
            source_raw: None,
        };
        // Quoted 1000, min 990 -> 1% tolerance.
        assert_eq!(intent.implied_slippage_bps(U256::from(1000u64)), Some(100));
    }
}
