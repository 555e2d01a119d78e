//! Startup configuration: a TOML document merged with environment overrides,
//! validated before anything connects. Unknown keys are rejected so a typoed
//! option fails loudly instead of silently using a default.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use alloy::primitives::U256;

use crate::constants::{
    DEFAULT_GAS_PREDICT_HORIZON_MS, DEFAULT_LATENCY_BUDGET_MS, DEFAULT_MAX_SLIPPAGE_BPS,
    DEFAULT_MAX_TIP_PCT_OF_PROFIT, DEFAULT_MIN_CONFIDENCE, DEFAULT_MIN_PROFIT_BPS,
    DEFAULT_ORACLE_DEVIATION_BAND_BPS, DEFAULT_PRECOMPUTE_INTERVAL_MS, DEFAULT_PRICE_CACHE_TTL_MS,
};
use crate::error::{BotError, BotResult};
use crate::types::ChainId;

/// Where a signing key comes from. Plaintext keys never touch the durable
/// store; the keystore variant points at an AES-GCM encrypted file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case", tag = "kind")]
pub enum PrivateKeySource {
    Env { var: String },
    Keystore { path: String, entry: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChainsConfig {
    pub enabled_chains: Vec<String>,
    /// Per chain name: HTTPS JSON-RPC endpoint.
    pub rpc_endpoints: HashMap<String, String>,
    /// Per chain name: websocket endpoint for subscriptions.
    pub ws_endpoints: HashMap<String, String>,
    /// Per chain name: signer source.
    pub private_key_source: HashMap<String, PrivateKeySource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StrategyToggle {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CopyConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub target_wallets: Vec<String>,
    /// Fraction of the target's trade we mirror, in percent.
    #[serde(default = "default_mirror_pct")]
    pub mirror_pct: f64,
}

fn default_mirror_pct() -> f64 {
    10.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RiskConfig {
    /// Decimal native units (e.g. "5.0" ETH/SOL); parsed exactly, no floats.
    pub max_position_size: String,
    pub max_daily_loss: String,
    #[serde(default = "default_max_concurrent_bundles")]
    pub max_concurrent_bundles: usize,
}

fn default_max_concurrent_bundles() -> usize {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TradingConfig {
    #[serde(default = "default_min_profit_bps")]
    pub min_profit_bps: i64,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_max_slippage_bps")]
    pub max_slippage_bps: u32,
    #[serde(default = "default_oracle_band_bps")]
    pub oracle_deviation_band_bps: u32,
    #[serde(default = "default_max_tip_pct")]
    pub max_tip_pct_of_profit: f64,
}

fn default_min_profit_bps() -> i64 {
    DEFAULT_MIN_PROFIT_BPS
}
fn default_min_confidence() -> f64 {
    DEFAULT_MIN_CONFIDENCE
}
fn default_max_slippage_bps() -> u32 {
    DEFAULT_MAX_SLIPPAGE_BPS
}
fn default_oracle_band_bps() -> u32 {
    DEFAULT_ORACLE_DEVIATION_BAND_BPS
}
fn default_max_tip_pct() -> f64 {
    DEFAULT_MAX_TIP_PCT_OF_PROFIT
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RelaysConfig {
    #[serde(default)]
    pub flashbots_endpoint: Option<String>,
    #[serde(default)]
    pub jito_block_engine: Option<String>,
    #[serde(default)]
    pub bloxroute_endpoint: Option<String>,
    #[serde(default)]
    pub nodereal_endpoint: Option<String>,
    /// Allow the public mempool for copy trades / MEV-protection-off mode.
    #[serde(default)]
    pub public_fallback: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PerformanceConfig {
    #[serde(default = "default_precompute_interval_ms")]
    pub precompute_interval_ms: u64,
    #[serde(default = "default_price_cache_ttl_ms")]
    pub price_cache_ttl_ms: u64,
    #[serde(default = "default_gas_predict_horizon_ms")]
    pub gas_predict_horizon_ms: u64,
    #[serde(default = "default_latency_budget_ms")]
    pub latency_budget_ms: u64,
}

fn default_precompute_interval_ms() -> u64 {
    DEFAULT_PRECOMPUTE_INTERVAL_MS
}
fn default_price_cache_ttl_ms() -> u64 {
    DEFAULT_PRICE_CACHE_TTL_MS
}
fn default_gas_predict_horizon_ms() -> u64 {
    DEFAULT_GAS_PREDICT_HORIZON_MS
}
fn default_latency_budget_ms() -> u64 {
    DEFAULT_LATENCY_BUDGET_MS
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            precompute_interval_ms: default_precompute_interval_ms(),
            price_cache_ttl_ms: default_price_cache_ttl_ms(),
            gas_predict_horizon_ms: default_gas_predict_horizon_ms(),
            latency_budget_ms: default_latency_budget_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PersistenceConfig {
    pub db_path: String,
    #[serde(default)]
    pub backup_dir: Option<String>,
    #[serde(default)]
    pub encryption_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PriceProviderConfig {
    pub name: String,
    pub url: String,
    /// Source priority weight for the aggregation (higher wins ties).
    #[serde(default = "default_provider_weight")]
    pub weight: f64,
    #[serde(default = "default_provider_rps")]
    pub rate_limit_per_sec: u32,
}

fn default_provider_weight() -> f64 {
    1.0
}
fn default_provider_rps() -> u32 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PriceConfig {
    #[serde(default)]
    pub providers: Vec<PriceProviderConfig>,
    /// Drop quotes deviating more than this from the weighted median (bps).
    #[serde(default = "default_outlier_band_bps")]
    pub outlier_band_bps: u32,
}

fn default_outlier_band_bps() -> u32 {
    500
}

/// Top-level configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BotConfig {
    pub chains: ChainsConfig,
    #[serde(default)]
    pub arbitrage: StrategyToggle,
    #[serde(default)]
    pub sandwich: StrategyToggle,
    #[serde(default)]
    pub copy: CopyConfig,
    pub risk: RiskConfig,
    #[serde(default)]
    pub trading: TradingConfig,
    #[serde(default)]
    pub relays: RelaysConfig,
    #[serde(default)]
    pub performance: PerformanceConfig,
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub price: PriceConfig,
}

impl Default for StrategyToggle {
    fn default() -> Self {
        Self { enabled: false }
    }
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            target_wallets: Vec::new(),
            mirror_pct: default_mirror_pct(),
        }
    }
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            min_profit_bps: default_min_profit_bps(),
            min_confidence: default_min_confidence(),
            max_slippage_bps: default_max_slippage_bps(),
            oracle_deviation_band_bps: default_oracle_band_bps(),
            max_tip_pct_of_profit: default_max_tip_pct(),
        }
    }
}

impl BotConfig {
    /// Load from a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> BotResult<Self> {
        dotenvy::dotenv().ok();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| BotError::Config(format!("cannot read {}: {e}", path.display())))?;
        let mut config: BotConfig = toml::from_str(&raw)
            .map_err(|e| BotError::Config(format!("malformed config: {e}")))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse from a string (tests and embedded defaults).
    pub fn from_toml(raw: &str) -> BotResult<Self> {
        let mut config: BotConfig =
            toml::from_str(raw).map_err(|e| BotError::Config(format!("malformed config: {e}")))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// A small closed set of environment overrides for operational knobs.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TRIDENT_DB_PATH") {
            self.persistence.db_path = v;
        }
        if let Ok(v) = std::env::var("TRIDENT_BACKUP_DIR") {
            self.persistence.backup_dir = Some(v);
        }
        if let Ok(v) = std::env::var("TRIDENT_MIN_PROFIT_BPS") {
            if let Ok(parsed) = v.parse() {
                self.trading.min_profit_bps = parsed;
            }
        }
        if let Ok(v) = std::env::var("TRIDENT_PUBLIC_FALLBACK") {
            self.relays.public_fallback = v == "1" || v.eq_ignore_ascii_case("true");
        }
    }

    pub fn enabled_chains(&self) -> BotResult<Vec<ChainId>> {
        self.chains
            .enabled_chains
            .iter()
            .map(|name| {
                name.parse::<ChainId>()
                    .map_err(|e| BotError::Config(e))
            })
            .collect()
    }

    pub fn rpc_endpoint(&self, chain: ChainId) -> BotResult<&str> {
        self.chains
            .rpc_endpoints
            .get(chain.name())
            .map(|s| s.as_str())
            .ok_or_else(|| BotError::Config(format!("no rpc endpoint for {chain}")))
    }

    pub fn ws_endpoint(&self, chain: ChainId) -> BotResult<&str> {
        self.chains
            .ws_endpoints
            .get(chain.name())
            .map(|s| s.as_str())
            .ok_or_else(|| BotError::Config(format!("no ws endpoint for {chain}")))
    }

    pub fn key_source(&self, chain: ChainId) -> BotResult<&PrivateKeySource> {
        self.chains
            .private_key_source
            .get(chain.name())
            .ok_or_else(|| BotError::Config(format!("no private_key_source for {chain}")))
    }

    pub fn max_position_size_wei(&self, chain: ChainId) -> BotResult<U256> {
        parse_native_amount(&self.risk.max_position_size, native_decimals(chain))
    }

    pub fn max_daily_loss_wei(&self, chain: ChainId) -> BotResult<U256> {
        parse_native_amount(&self.risk.max_daily_loss, native_decimals(chain))
    }

    fn validate(&self) -> BotResult<()> {
        let chains = self.enabled_chains()?;
        if chains.is_empty() {
            return Err(BotError::Config("enabled_chains is empty".into()));
        }
        for chain in &chains {
            self.rpc_endpoint(*chain)?;
            self.ws_endpoint(*chain)?;
            self.key_source(*chain)?;
        }
        for (chain, _) in &self.chains.private_key_source {
            chain
                .parse::<ChainId>()
                .map_err(|e| BotError::Config(format!("private_key_source: {e}")))?;
        }
        if !(0.0..=1.0).contains(&self.trading.min_confidence) {
            return Err(BotError::Config(format!(
                "min_confidence {} outside [0,1]",
                self.trading.min_confidence
            )));
        }
        if self.trading.max_tip_pct_of_profit <= 0.0 || self.trading.max_tip_pct_of_profit > 1.0 {
            return Err(BotError::Config(
                "max_tip_pct_of_profit must be in (0,1]".into(),
            ));
        }
        if self.copy.enabled && self.copy.target_wallets.is_empty() {
            return Err(BotError::Config(
                "copy trading enabled with no target_wallets".into(),
            ));
        }
        if self.copy.enabled && !(0.0 < self.copy.mirror_pct && self.copy.mirror_pct <= 100.0) {
            return Err(BotError::Config(format!(
                "copy.mirror_pct {} outside (0,100]",
                self.copy.mirror_pct
            )));
        }
        // Parse the risk amounts once so a bad string fails at startup.
        for chain in &chains {
            self.max_position_size_wei(*chain)?;
            self.max_daily_loss_wei(*chain)?;
        }
        if self.persistence.db_path.is_empty() {
            return Err(BotError::Config("persistence.db_path is empty".into()));
        }
        Ok(())
    }
}

/// Native decimals for a chain's gas token.
pub fn native_decimals(chain: ChainId) -> u8 {
    match chain {
        ChainId::Ethereum | ChainId::Bsc => 18,
        ChainId::Solana => 9,
    }
}

/// Parse a decimal string like "5.25" into the chain's smallest unit exactly,
/// without routing through floating point.
pub fn parse_native_amount(s: &str, decimals: u8) -> BotResult<U256> {
    let s = s.trim();
    if s.is_empty() || s.starts_with('-') {
        return Err(BotError::Config(format!("invalid amount: {s:?}")));
    }
    let (int_part, frac_part) = match s.split_once('.') {
        Some((i, f)) => (i, f),
        None => (s, ""),
    };
    if frac_part.len() > decimals as usize {
        return Err(BotError::Config(format!(
            "amount {s} has more than {decimals} fractional digits"
        )));
    }
    if !int_part.chars().all(|c| c.is_ascii_digit())
        || !frac_part.chars().all(|c| c.is_ascii_digit())
        || int_part.is_empty()
    {
        return Err(BotError::Config(format!("invalid amount: {s:?}")));
    }
    let scale = U256::from(10u64).pow(U256::from(decimals as u64));
    let int_value = U256::from_str_radix(int_part, 10)
        .map_err(|e| BotError::Config(format!("invalid amount {s}: {e}")))?;
    let mut result = int_value
        .checked_mul(scale)
        .ok_or_else(|| BotError::Config(format!("amount {s} overflows")))?;
    if !frac_part.is_empty() {
        let frac_scale = U256::from(10u64).pow(U256::from((decimals as usize - frac_part.len()) as u64));
        let frac_value = U256::from_str_radix(frac_part, 10)
            .map_err(|e| BotError::Config(format!("invalid amount {s}: {e}")))?;
        result = result
            .checked_add(frac_value * frac_scale)
            .ok_or_else(|| BotError::Config(format!("amount {s} overflows")))?;
    }
    Ok(result)
}

#[cfg(test)]
pub(crate) fn test_config() -> BotConfig {
    BotConfig::from_toml(EXAMPLE_CONFIG).expect("example config must parse")
}

#[cfg(test)]
pub(crate) const EXAMPLE_CONFIG: &str = r#"
[chains]
enabled_chains = ["ethereum", "solana"]

[chains.rpc_endpoints]
ethereum = "https://eth.example/rpc"
solana = "https://sol.example/rpc"

[chains.ws_endpoints]
ethereum = "wss://eth.example/ws"
solana = "wss://sol.example/ws"

[chains.private_key_source.ethereum]
kind = "env"
var = "ETH_PRIVATE_KEY"

[chains.private_key_source.solana]
kind = "keystore"
path = "keys/solana.store"
entry = "trading"

[arbitrage]
enabled = true

[sandwich]
enabled = true

[copy]
enabled = true
target_wallets = ["0x1111111111111111111111111111111111111111"]
mirror_pct = 10.0

[risk]
max_position_size = "5.0"
max_daily_loss = "2.5"
max_concurrent_bundles = 4

[trading]
min_profit_bps = 3
min_confidence = 0.4
max_slippage_bps = 250
oracle_deviation_band_bps = 200

[relays]
flashbots_endpoint = "https://relay.flashbots.net"
jito_block_engine = "https://mainnet.block-engine.jito.wtf"
public_fallback = true

[persistence]
db_path = "data/trident.db"
backup_dir = "data/backups"
encryption_enabled = false

[[price.providers]]
name = "coingecko"
url = "https://api.coingecko.com/api/v3/simple/price"
weight = 1.0
rate_limit_per_sec = 5

[[price.providers]]
name = "dexscreener"
url = "https://api.dexscreener.com/latest/dex/tokens"
weight = 0.8
rate_limit_per_sec = 3
"#;
