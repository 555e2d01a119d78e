/// Global constants for the Trident trading core.
///
/// This module centralizes chain constants, router/program identifiers and
/// default thresholds so the rest of the codebase never carries inline magic
/// numbers.
use std::time::Duration;

// ============================================================================
// NATIVE UNIT CONSTANTS
// ============================================================================

/// 1 ETH/BNB = 1e18 wei
pub const WEI_PER_NATIVE: u128 = 1_000_000_000_000_000_000;

/// 1 SOL = 1 billion lamports
pub const LAMPORTS_PER_SOL: u64 = 1_000_000_000;

/// Convert lamports to SOL (floating point, logging/scoring only)
pub const fn lamports_to_sol(lamports: u64) -> f64 {
    lamports as f64 / LAMPORTS_PER_SOL as f64
}

/// Convert wei to native units (floating point, logging/scoring only)
pub fn wei_to_native(wei: u128) -> f64 {
    wei as f64 / WEI_PER_NATIVE as f64
}

// ============================================================================
// EVM ROUTER ADDRESSES AND SELECTORS
// ============================================================================

/// Uniswap V2 router (Ethereum)
pub const UNISWAP_V2_ROUTER: &str = "0x7a250d5630b4cf539739df2c5dacb4c659f2488d";

/// Uniswap V3 router (Ethereum)
pub const UNISWAP_V3_ROUTER: &str = "0xe592427a0aece92de3edee1f18e0157c05861564";

/// PancakeSwap V2 router (BSC)
pub const PANCAKE_V2_ROUTER: &str = "0x10ed43c718714eb63d5aa57b78b54704e256024e";

/// Curve 3pool (Ethereum), the stable-swap reference pool
pub const CURVE_3POOL: &str = "0xbebc44782c7db0a1a60cb6fe97d0b483032ff1c7";

/// 4-byte selectors for the router methods the decoder understands.
pub const SEL_V2_SWAP_EXACT_TOKENS: [u8; 4] = [0x38, 0xed, 0x17, 0x39];
pub const SEL_V2_SWAP_TOKENS_EXACT: [u8; 4] = [0x88, 0x03, 0xdb, 0xee];
pub const SEL_V2_SWAP_EXACT_ETH: [u8; 4] = [0x7f, 0xf3, 0x6a, 0xb5];
pub const SEL_V2_SWAP_EXACT_TOKENS_ETH: [u8; 4] = [0x18, 0xcb, 0xaf, 0xe5];
pub const SEL_V3_EXACT_INPUT_SINGLE: [u8; 4] = [0x41, 0x4b, 0xf3, 0x89];
pub const SEL_V3_EXACT_INPUT: [u8; 4] = [0xc0, 0x4b, 0x8d, 0x59];
pub const SEL_STABLE_EXCHANGE: [u8; 4] = [0x3d, 0xf0, 0x21, 0x24];

// ============================================================================
// SOLANA PROGRAM IDS
// ============================================================================

/// Raydium AMM V4 program ID
pub const RAYDIUM_AMM_V4_PROGRAM_ID: &str = "675kPX9MHTjS2zt1qfr1NYHuzeLXfQM9H24wFSUt1Mp8";

/// Raydium CLMM program ID
pub const RAYDIUM_CLMM_PROGRAM_ID: &str = "CAMMCzo5YL8w4VFF8KVHrK22GGUsp5VTaW7grrKgrWqK";

/// Orca Whirlpools program ID
pub const ORCA_WHIRLPOOLS_PROGRAM_ID: &str = "whirLbMiicVdio4qvUfM5KAg6Ct8VwpYzGff3uctyCc";

/// PumpSwap program ID
pub const PUMPSWAP_PROGRAM_ID: &str = "GMk6j2defJhS7F194toqmJNFNhAkbDXhYJo5oR3Rpump";

/// Wrapped SOL mint
pub const WSOL_MINT: &str = "So11111111111111111111111111111111111111112";

/// Raydium AMM V4 swap instruction discriminator (single byte)
pub const RAYDIUM_V4_SWAP_DISCRIMINATOR: u8 = 9;

/// Anchor-style 8-byte swap discriminators
pub const RAYDIUM_CLMM_SWAP_DISCRIMINATOR: [u8; 8] = [143, 190, 90, 218, 196, 30, 51, 222];
pub const ORCA_WHIRLPOOL_SWAP_DISCRIMINATOR: [u8; 8] = [248, 198, 158, 145, 225, 117, 135, 200];
pub const PUMPSWAP_SWAP_DISCRIMINATOR: [u8; 8] = [102, 6, 61, 18, 1, 218, 235, 234];

// ============================================================================
// RELAY CONSTANTS
// ============================================================================

/// Default Flashbots bundle endpoint
pub const FLASHBOTS_DEFAULT_ENDPOINT: &str = "https://relay.flashbots.net";

/// Default Jito block engine
pub const JITO_DEFAULT_BLOCK_ENGINE: &str = "https://mainnet.block-engine.jito.wtf";

/// Jito tip floor API
pub const JITO_TIP_FLOOR_URL: &str = "https://bundles.jito.wtf/api/v1/bundles/tip_floor";

/// Official Jito tip accounts for mainnet-beta
pub const JITO_TIP_ACCOUNTS: [&str; 8] = [
    "96gYZGLnJYVFmbjzopPSU6QiEV5fGqZNyN9nmNhvrZU5",
    "HFqU5x63VTqvQss8hp11i4wVV8bD44PvwucfZ2bU7gRe",
    "Cw8CFyM9FkoMi7K7Crf6HNQqf4uEMzpKw6QNghXLvLkY",
    "ADaUMid9yfUytqMBgopwjb2DTLSokTSzL1zt6iGPaS49",
    "DfXygSm4jCyNCybVYYK6DwvWqjKee8pbDmJGcLWNDXjh",
    "ADuUkR4vqLUMWXxW9gh6D6L8pMSawimctcNZ5pGwDcEt",
    "DttWaMuVvTiduZRnguLF7jNxTgiMBZ1hyAumKUiL2KRL",
    "3AVi9Tg9Uo68tJfuvoKvqKNWKkC5wPdSSdeBnizKZ6jT",
];

/// Default BloxRoute BSC MEV endpoint
pub const BLOXROUTE_DEFAULT_ENDPOINT: &str = "https://mev.api.blxrbdn.com";

/// Jito bundle rate limit (1 bundle per 1.1 seconds)
pub const JITO_RATE_LIMIT_MS: u64 = 1100;

/// Maximum bundle size (transactions)
pub const MAX_BUNDLE_SIZE: usize = 5;

/// Jito tip floor refresh interval
pub const JITO_TIP_REFRESH_MINUTES: u64 = 10;

// ============================================================================
// TRADING DEFAULTS (overridable via config)
// ============================================================================

/// Minimum cycle profit worth surfacing (bps)
pub const DEFAULT_MIN_PROFIT_BPS: i64 = 2;

/// Minimum opportunity confidence
pub const DEFAULT_MIN_CONFIDENCE: f64 = 0.35;

/// Maximum tolerated price impact (bps)
pub const DEFAULT_MAX_SLIPPAGE_BPS: u32 = 300;

/// Maximum pool-vs-oracle deviation before rejecting (bps)
pub const DEFAULT_ORACLE_DEVIATION_BAND_BPS: u32 = 200;

/// Tip bounds as a share of expected profit
pub const MIN_TIP_PCT_OF_PROFIT: f64 = 0.01;
pub const DEFAULT_MAX_TIP_PCT_OF_PROFIT: f64 = 0.45;

/// Opportunity TTL defaults per strategy (ms)
pub const ARBITRAGE_TTL_MS: u64 = 1_500;
pub const SANDWICH_TTL_MS: u64 = 400;
pub const COPY_TTL_MS: u64 = 5_000;

/// Sliding dedupe window sizes
pub const INTENT_DEDUPE_WINDOW: usize = 8_192;
pub const OPPORTUNITY_DEDUPE_WINDOW: usize = 4_096;

/// Maximum hops in any route
pub const MAX_ROUTE_HOPS: usize = 4;

/// Route precompute cadence
pub const DEFAULT_PRECOMPUTE_INTERVAL_MS: u64 = 500;

/// Reserve delta (bps) that forces an off-cycle precompute refresh
pub const PRECOMPUTE_RESERVE_DELTA_BPS: u32 = 20;

// ============================================================================
// LATENCY AND DEADLINE CONSTANTS
// ============================================================================

/// End-to-end latency budget for the arbitrage path
pub const DEFAULT_LATENCY_BUDGET_MS: u64 = 50;

/// RPC request timeout
pub const RPC_TIMEOUT_MS: u64 = 5_000;

/// Price provider request timeout
pub const PRICE_FETCH_TIMEOUT_MS: u64 = 2_000;

/// On-demand route search wall-clock deadline
pub const ROUTE_SEARCH_DEADLINE_MS: u64 = 8;

/// Price cache TTL
pub const DEFAULT_PRICE_CACHE_TTL_MS: u64 = 3_000;

/// Gas prediction horizon
pub const DEFAULT_GAS_PREDICT_HORIZON_MS: u64 = 12_000;

/// Gas ring buffer capacity per chain
pub const GAS_RING_CAPACITY: usize = 128;

// ============================================================================
// RETRY & BACKOFF CONSTANTS
// ============================================================================

/// Maximum retry attempts for failed operations
pub const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Base delay for exponential backoff (milliseconds)
pub const BASE_RETRY_DELAY_MS: u64 = 100;

/// Maximum retry delay (milliseconds)
pub const MAX_RETRY_DELAY_MS: u64 = 30_000;

/// Backoff multiplier
pub const BACKOFF_MULTIPLIER: f64 = 2.0;

/// Jitter factor for retry delays
pub const RETRY_JITTER_FACTOR: f64 = 0.1;

/// Websocket reconnect ceiling
pub const WS_RECONNECT_CEILING_MS: u64 = 20_000;

// ============================================================================
// RISK DEFAULTS
// ============================================================================

/// Consecutive failures before an Alert event
pub const CONSECUTIVE_FAILURE_ALERT: u32 = 3;

/// Consecutive failures before a strategy-scope Kill
pub const CONSECUTIVE_FAILURE_KILL: u32 = 6;

/// Telemetry retention bound
pub const TELEMETRY_RETENTION_HOURS: i64 = 72;

// ============================================================================
// SECURITY CONSTANTS
// ============================================================================

/// PBKDF2 iteration count for key derivation
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// AES-256 key size (bytes)
pub const AES_KEY_SIZE: usize = 32;

/// AES-GCM nonce size (bytes)
pub const AES_NONCE_SIZE: usize = 12;

/// Salt size for key derivation (bytes)
pub const SALT_SIZE: usize = 32;

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

/// Create a Duration from milliseconds
pub const fn duration_from_ms(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

/// Basis points to a unit fraction
pub const fn bps_to_fraction(bps: u32) -> f64 {
    bps as f64 / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_conversions() {
        assert_eq!(lamports_to_sol(LAMPORTS_PER_SOL), 1.0);
        assert_eq!(lamports_to_sol(500_000_000), 0.5);
        assert_eq!(wei_to_native(WEI_PER_NATIVE), 1.0);
        assert!((bps_to_fraction(30) - 0.003).abs() < 1e-12);
    }

    #[test]
    fn test_selector_bytes() {
        // swapExactTokensForTokens(uint256,uint256,address[],address,uint256)
        assert_eq!(hex::encode(SEL_V2_SWAP_EXACT_TOKENS), "38ed1739");
        // exactInputSingle((address,address,uint24,address,uint256,uint256,uint256,uint160))
        assert_eq!(hex::encode(SEL_V3_EXACT_INPUT_SINGLE), "414bf389");
    }

    #[test]
    fn test_tip_accounts_parse() {
        for acct in JITO_TIP_ACCOUNTS {
            assert!(acct.parse::<solana_sdk::pubkey::Pubkey>().is_ok());
        }
    }
}
