//! Protocol-specific transaction decoding into canonical `TradeIntent`s.
//!
//! EVM router calldata is decoded by 4-byte selector (AMM v2 exact-in/out,
//! v3 exact-input single and path form, stable-pool exchange); Solana
//! program instructions are matched by program id and discriminator. Unknown
//! methods are `Ignored`; malformed data is `Undecodable` with the raw bytes
//! retained for diagnostics. Decoding never panics and is deterministic for
//! a given input.

use alloy::primitives::U256;
use once_cell::sync::Lazy;
use solana_sdk::message::VersionedMessage;
use solana_sdk::transaction::VersionedTransaction;
use std::collections::HashMap;

use crate::chain_adapter::PendingTx;
use crate::constants::{
    CURVE_3POOL, ORCA_WHIRLPOOLS_PROGRAM_ID, ORCA_WHIRLPOOL_SWAP_DISCRIMINATOR, PANCAKE_V2_ROUTER,
    PUMPSWAP_PROGRAM_ID, PUMPSWAP_SWAP_DISCRIMINATOR, RAYDIUM_AMM_V4_PROGRAM_ID,
    RAYDIUM_CLMM_PROGRAM_ID, RAYDIUM_CLMM_SWAP_DISCRIMINATOR, RAYDIUM_V4_SWAP_DISCRIMINATOR,
    SEL_STABLE_EXCHANGE, SEL_V2_SWAP_EXACT_ETH, SEL_V2_SWAP_EXACT_TOKENS,
    SEL_V2_SWAP_EXACT_TOKENS_ETH, SEL_V2_SWAP_TOKENS_EXACT, SEL_V3_EXACT_INPUT,
    SEL_V3_EXACT_INPUT_SINGLE, UNISWAP_V2_ROUTER, UNISWAP_V3_ROUTER,
};
use crate::types::{ChainId, Protocol, SwapMethod, TradeIntent};

/// Curve 3pool coin order (DAI, USDC, USDT); exchange() names coins by index.
const CURVE_3POOL_COINS: [&str; 3] = [
    "0x6b175474e89094c44da98b954eedeac495271d0f",
    "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48",
    "0xdac17f958d2ee523a2206206994597c13d831ec7",
];

/// Decoding result. `Undecodable` keeps the raw calldata so operators can
/// replay a failed parse offline.
#[derive(Debug, Clone)]
pub enum DecodeOutcome {
    Decoded(TradeIntent),
    Ignored,
    Undecodable { reason: String, raw: Vec<u8> },
}

impl DecodeOutcome {
    pub fn intent(self) -> Option<TradeIntent> {
        match self {
            DecodeOutcome::Decoded(intent) => Some(intent),
            _ => None,
        }
    }
}

static EVM_ROUTERS: Lazy<HashMap<&'static str, Protocol>> = Lazy::new(|| {
    HashMap::from([
        (UNISWAP_V2_ROUTER, Protocol::UniswapV2),
        (PANCAKE_V2_ROUTER, Protocol::UniswapV2),
        (UNISWAP_V3_ROUTER, Protocol::UniswapV3),
        (CURVE_3POOL, Protocol::StableSwap),
    ])
});

/// Stateless decoder; a shared instance serves the whole worker pool.
pub struct TxDecoder;

impl TxDecoder {
    pub fn new() -> Self {
        Self
    }

    /// Router allowlist check used by the mempool filter before decoding.
    pub fn is_known_router(&self, chain: ChainId, to: &str) -> bool {
        match chain {
            ChainId::Ethereum | ChainId::Bsc => EVM_ROUTERS.contains_key(to),
            ChainId::Solana => matches!(
                to,
                RAYDIUM_AMM_V4_PROGRAM_ID
                    | RAYDIUM_CLMM_PROGRAM_ID
                    | ORCA_WHIRLPOOLS_PROGRAM_ID
                    | PUMPSWAP_PROGRAM_ID
            ),
        }
    }

    pub fn decode(&self, tx: &PendingTx) -> DecodeOutcome {
        match tx.chain {
            ChainId::Ethereum | ChainId::Bsc => self.decode_evm(tx),
            ChainId::Solana => self.decode_solana(tx),
        }
    }

    fn decode_evm(&self, tx: &PendingTx) -> DecodeOutcome {
        let Some(router) = tx.to.as_deref() else {
            return DecodeOutcome::Ignored;
        };
        let Some(protocol) = EVM_ROUTERS.get(router).copied() else {
            return DecodeOutcome::Ignored;
        };
        if tx.input.len() < 4 {
            return DecodeOutcome::Ignored;
        }
        let selector: [u8; 4] = match tx.input[..4].try_into() {
            Ok(sel) => sel,
            Err(_) => return DecodeOutcome::Ignored,
        };
        let args = &tx.input[4..];

        let parsed = match selector {
            SEL_V2_SWAP_EXACT_TOKENS => {
                decode_v2_path_swap(args, SwapMethod::V2SwapExactTokensForTokens, tx)
            }
            SEL_V2_SWAP_TOKENS_EXACT => {
                decode_v2_path_swap(args, SwapMethod::V2SwapTokensForExactTokens, tx)
            }
            SEL_V2_SWAP_EXACT_ETH => decode_v2_eth_in_swap(args, tx),
            SEL_V2_SWAP_EXACT_TOKENS_ETH => {
                decode_v2_path_swap(args, SwapMethod::V2SwapExactTokensForEth, tx)
            }
            SEL_V3_EXACT_INPUT_SINGLE => decode_v3_exact_input_single(args, tx),
            SEL_V3_EXACT_INPUT => decode_v3_exact_input_path(args, tx),
            SEL_STABLE_EXCHANGE => decode_stable_exchange(args, tx),
            _ => return DecodeOutcome::Ignored,
        };

        match parsed {
            Ok(mut intent) => {
                intent.protocol = protocol;
                intent.router = router.to_string();
                DecodeOutcome::Decoded(intent)
            }
            Err(reason) => DecodeOutcome::Undecodable {
                reason,
                raw: tx.input.clone(),
            },
        }
    }

    fn decode_solana(&self, tx: &PendingTx) -> DecodeOutcome {
        let Some(raw) = tx.raw.as_deref() else {
            return DecodeOutcome::Undecodable {
                reason: "solana pending tx without raw bytes".into(),
                raw: Vec::new(),
            };
        };
        let versioned: VersionedTransaction = match bincode::deserialize(raw) {
            Ok(v) => v,
            Err(e) => {
                return DecodeOutcome::Undecodable {
                    reason: format!("bincode: {e}"),
                    raw: raw.to_vec(),
                }
            }
        };
        let (instructions, account_keys) = match &versioned.message {
            VersionedMessage::Legacy(msg) => (&msg.instructions, &msg.account_keys),
            VersionedMessage::V0(msg) => (&msg.instructions, &msg.account_keys),
        };

        for ix in instructions {
            let Some(program) = account_keys.get(ix.program_id_index as usize) else {
                continue;
            };
            let program_str = program.to_string();
            let decoded = match program_str.as_str() {
                RAYDIUM_AMM_V4_PROGRAM_ID => decode_raydium_v4(ix, account_keys, tx),
                RAYDIUM_CLMM_PROGRAM_ID => decode_anchor_swap(
                    ix,
                    account_keys,
                    tx,
                    Protocol::RaydiumClmm,
                    &RAYDIUM_CLMM_SWAP_DISCRIMINATOR,
                ),
                ORCA_WHIRLPOOLS_PROGRAM_ID => decode_anchor_swap(
                    ix,
                    account_keys,
                    tx,
                    Protocol::OrcaWhirlpool,
                    &ORCA_WHIRLPOOL_SWAP_DISCRIMINATOR,
                ),
                PUMPSWAP_PROGRAM_ID => decode_anchor_swap(
                    ix,
                    account_keys,
                    tx,
                    Protocol::PumpSwap,
                    &PUMPSWAP_SWAP_DISCRIMINATOR,
                ),
                _ => continue,
            };
            match decoded {
                Some(Ok(intent)) => return DecodeOutcome::Decoded(intent),
                Some(Err(reason)) => {
                    return DecodeOutcome::Undecodable {
                        reason,
                        raw: raw.to_vec(),
                    }
                }
                // Known program, unknown discriminator: keep scanning.
                None => continue,
            }
        }
        DecodeOutcome::Ignored
    }
}

impl Default for TxDecoder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// EVM ABI helpers. Offsets are validated; a short buffer is a parse error,
// never a panic.
// ---------------------------------------------------------------------------

fn word(args: &[u8], index: usize) -> Result<&[u8], String> {
    let start = index
        .checked_mul(32)
        .ok_or_else(|| "word index overflow".to_string())?;
    let end = start + 32;
    args.get(start..end)
        .ok_or_else(|| format!("calldata truncated at word {index}"))
}

fn u256_at(args: &[u8], index: usize) -> Result<U256, String> {
    Ok(U256::from_be_slice(word(args, index)?))
}

fn u64_at(args: &[u8], index: usize) -> Result<u64, String> {
    let value = u256_at(args, index)?;
    u64::try_from(value).map_err(|_| format!("word {index} exceeds u64"))
}

fn address_at(args: &[u8], index: usize) -> Result<String, String> {
    let w = word(args, index)?;
    if w[..12].iter().any(|&b| b != 0) {
        return Err(format!("word {index} is not a clean address"));
    }
    Ok(format!("0x{}", hex::encode(&w[12..32])))
}

fn address_array_at(args: &[u8], offset_word: usize) -> Result<Vec<String>, String> {
    let offset = u64_at(args, offset_word)? as usize;
    if offset % 32 != 0 {
        return Err(format!("misaligned array offset {offset}"));
    }
    let len_index = offset / 32;
    let len = u64_at(args, len_index)? as usize;
    if len == 0 || len > 8 {
        return Err(format!("path length {len} out of range"));
    }
    let mut out = Vec::with_capacity(len);
    for i in 0..len {
        out.push(address_at(args, len_index + 1 + i)?);
    }
    Ok(out)
}

fn base_intent(tx: &PendingTx, method: SwapMethod) -> TradeIntent {
    TradeIntent {
        source_tx_hash: tx.hash.clone(),
        chain: tx.chain,
        protocol: Protocol::UniswapV2, // caller overwrites
        router: String::new(),
        method,
        path: Vec::new(),
        hop_fees_bps: Vec::new(),
        amount_in: U256::ZERO,
        amount_out_min: U256::ZERO,
        pool: None,
        deadline: None,
        sender: tx.from.clone(),
        observed_at: tx.observed_at,
        priority_fee: tx.priority_fee,
        source_raw: tx.raw.clone(),
    }
}

/// swapExactTokensForTokens / swapTokensForExactTokens / swapExactTokensForETH:
/// (amountA, amountB, address[] path, address to, uint deadline).
fn decode_v2_path_swap(
    args: &[u8],
    method: SwapMethod,
    tx: &PendingTx,
) -> Result<TradeIntent, String> {
    let amount_0 = u256_at(args, 0)?;
    let amount_1 = u256_at(args, 1)?;
    let path = address_array_at(args, 2)?;
    let deadline = u64_at(args, 4).ok();
    let mut intent = base_intent(tx, method);
    // Exact-out swaps carry (amountOut, amountInMax); exact-in the reverse.
    if method == SwapMethod::V2SwapTokensForExactTokens {
        intent.amount_in = amount_1;
        intent.amount_out_min = amount_0;
    } else {
        intent.amount_in = amount_0;
        intent.amount_out_min = amount_1;
    }
    intent.hop_fees_bps = vec![30; path.len().saturating_sub(1)];
    intent.path = path;
    intent.deadline = deadline;
    Ok(intent)
}

/// swapExactETHForTokens(amountOutMin, address[] path, address to, deadline);
/// amount in rides on msg.value.
fn decode_v2_eth_in_swap(args: &[u8], tx: &PendingTx) -> Result<TradeIntent, String> {
    let amount_out_min = u256_at(args, 0)?;
    let path = address_array_at(args, 1)?;
    let deadline = u64_at(args, 3).ok();
    let mut intent = base_intent(tx, SwapMethod::V2SwapExactEthForTokens);
    intent.amount_in = U256::from(tx.value);
    intent.amount_out_min = amount_out_min;
    intent.hop_fees_bps = vec![30; path.len().saturating_sub(1)];
    intent.path = path;
    intent.deadline = deadline;
    Ok(intent)
}

/// exactInputSingle((tokenIn, tokenOut, fee, recipient, deadline, amountIn,
/// amountOutMinimum, sqrtPriceLimitX96)), a static tuple of 8 words.
fn decode_v3_exact_input_single(args: &[u8], tx: &PendingTx) -> Result<TradeIntent, String> {
    let token_in = address_at(args, 0)?;
    let token_out = address_at(args, 1)?;
    let fee_hundredths_bps = u64_at(args, 2)?;
    let deadline = u64_at(args, 4).ok();
    let amount_in = u256_at(args, 5)?;
    let amount_out_min = u256_at(args, 6)?;
    let mut intent = base_intent(tx, SwapMethod::V3ExactInputSingle);
    intent.path = vec![token_in, token_out];
    // v3 fee units are hundredths of a bip (3000 = 30 bps).
    intent.hop_fees_bps = vec![(fee_hundredths_bps / 100) as u32];
    intent.amount_in = amount_in;
    intent.amount_out_min = amount_out_min;
    intent.deadline = deadline;
    Ok(intent)
}

/// exactInput((bytes path, address recipient, uint deadline, uint amountIn,
/// uint amountOutMinimum)); path is packed (token, fee, token, fee, token...).
fn decode_v3_exact_input_path(args: &[u8], tx: &PendingTx) -> Result<TradeIntent, String> {
    let tuple_offset = u64_at(args, 0)? as usize;
    if tuple_offset % 32 != 0 {
        return Err(format!("misaligned tuple offset {tuple_offset}"));
    }
    let tuple = args
        .get(tuple_offset..)
        .ok_or_else(|| "tuple offset beyond calldata".to_string())?;
    let path_offset = u64_at(tuple, 0)? as usize;
    let deadline = u64_at(tuple, 2).ok();
    let amount_in = u256_at(tuple, 3)?;
    let amount_out_min = u256_at(tuple, 4)?;
    let path_area = tuple
        .get(path_offset..)
        .ok_or_else(|| "path offset beyond calldata".to_string())?;
    let path_len = u64_at(path_area, 0)? as usize;
    let path_bytes = path_area
        .get(32..32 + path_len)
        .ok_or_else(|| "path bytes truncated".to_string())?;

    // Packed hops: 20-byte token, then repeating (3-byte fee, 20-byte token).
    if path_bytes.len() < 43 || (path_bytes.len() - 20) % 23 != 0 {
        return Err(format!("bad v3 path length {}", path_bytes.len()));
    }
    let mut tokens = vec![format!("0x{}", hex::encode(&path_bytes[..20]))];
    let mut fees = Vec::new();
    let mut cursor = 20;
    while cursor + 23 <= path_bytes.len() {
        let fee = u32::from_be_bytes([
            0,
            path_bytes[cursor],
            path_bytes[cursor + 1],
            path_bytes[cursor + 2],
        ]);
        fees.push(fee / 100);
        tokens.push(format!(
            "0x{}",
            hex::encode(&path_bytes[cursor + 3..cursor + 23])
        ));
        cursor += 23;
    }

    let mut intent = base_intent(tx, SwapMethod::V3ExactInput);
    intent.path = tokens;
    intent.hop_fees_bps = fees;
    intent.amount_in = amount_in;
    intent.amount_out_min = amount_out_min;
    intent.deadline = deadline;
    Ok(intent)
}

/// Curve exchange(int128 i, int128 j, uint256 dx, uint256 min_dy).
fn decode_stable_exchange(args: &[u8], tx: &PendingTx) -> Result<TradeIntent, String> {
    let i = u64_at(args, 0)? as usize;
    let j = u64_at(args, 1)? as usize;
    let dx = u256_at(args, 2)?;
    let min_dy = u256_at(args, 3)?;
    let token_in = CURVE_3POOL_COINS
        .get(i)
        .ok_or_else(|| format!("coin index {i} out of range"))?;
    let token_out = CURVE_3POOL_COINS
        .get(j)
        .ok_or_else(|| format!("coin index {j} out of range"))?;
    let mut intent = base_intent(tx, SwapMethod::StableExchange);
    intent.path = vec![token_in.to_string(), token_out.to_string()];
    intent.hop_fees_bps = vec![4];
    intent.amount_in = dx;
    intent.amount_out_min = min_dy;
    intent.pool = Some(CURVE_3POOL.to_string());
    Ok(intent)
}

// ---------------------------------------------------------------------------
// Solana instruction decoders
// ---------------------------------------------------------------------------

type SolanaDecode = Option<Result<TradeIntent, String>>;

/// Raydium AMM v4: single-byte discriminator 9, then amount_in and
/// minimum_amount_out as u64 LE. The AMM account sits at index 1.
fn decode_raydium_v4(
    ix: &solana_sdk::instruction::CompiledInstruction,
    account_keys: &[solana_sdk::pubkey::Pubkey],
    tx: &PendingTx,
) -> SolanaDecode {
    if ix.data.first() != Some(&RAYDIUM_V4_SWAP_DISCRIMINATOR) {
        return None;
    }
    if ix.data.len() < 17 {
        return Some(Err(format!(
            "raydium v4 swap data too short: {}",
            ix.data.len()
        )));
    }
    let amount_in = u64::from_le_bytes(ix.data[1..9].try_into().ok()?);
    let min_out = u64::from_le_bytes(ix.data[9..17].try_into().ok()?);
    Some(build_solana_intent(
        ix,
        account_keys,
        tx,
        Protocol::RaydiumAmmV4,
        amount_in,
        min_out,
        25,
    ))
}

/// Anchor-style swaps (Raydium CLMM, Orca Whirlpools, PumpSwap): 8-byte
/// discriminator, then amount and other_amount_threshold as u64 LE.
fn decode_anchor_swap(
    ix: &solana_sdk::instruction::CompiledInstruction,
    account_keys: &[solana_sdk::pubkey::Pubkey],
    tx: &PendingTx,
    protocol: Protocol,
    discriminator: &[u8; 8],
) -> SolanaDecode {
    if ix.data.len() < 8 || &ix.data[..8] != discriminator {
        return None;
    }
    if ix.data.len() < 24 {
        return Some(Err(format!(
            "{} swap data too short: {}",
            protocol.name(),
            ix.data.len()
        )));
    }
    let amount_in = u64::from_le_bytes(ix.data[8..16].try_into().ok()?);
    let min_out = u64::from_le_bytes(ix.data[16..24].try_into().ok()?);
    let fee_bps = match protocol {
        Protocol::OrcaWhirlpool | Protocol::RaydiumClmm => 30,
        _ => 25,
    };
    Some(build_solana_intent(
        ix,
        account_keys,
        tx,
        protocol,
        amount_in,
        min_out,
        fee_bps,
    ))
}

fn build_solana_intent(
    ix: &solana_sdk::instruction::CompiledInstruction,
    account_keys: &[solana_sdk::pubkey::Pubkey],
    tx: &PendingTx,
    protocol: Protocol,
    amount_in: u64,
    min_out: u64,
    fee_bps: u32,
) -> Result<TradeIntent, String> {
    if amount_in == 0 {
        return Err("zero amount_in".into());
    }
    // Pool account convention: first writable non-signer account of the swap
    // instruction, which all four programs place at index 1.
    let pool = ix
        .accounts
        .get(1)
        .and_then(|&idx| account_keys.get(idx as usize))
        .map(|k| k.to_string());
    let mut intent = base_intent(tx, SwapMethod::SolanaProgramSwap);
    intent.protocol = protocol;
    intent.router = account_keys
        .get(ix.program_id_index as usize)
        .map(|k| k.to_string())
        .unwrap_or_default();
    intent.amount_in = U256::from(amount_in);
    intent.amount_out_min = U256::from(min_out);
    intent.hop_fees_bps = vec![fee_bps];
    intent.pool = pool;
    Ok(intent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use solana_sdk::hash::Hash;
    use solana_sdk::instruction::{AccountMeta, Instruction};
    use solana_sdk::pubkey::Pubkey;
    use solana_sdk::signature::{Keypair, Signer};
    use solana_sdk::transaction::Transaction;

    const WETH: &str = "c02aaa39b223fe8d0a0e5c4f27ead9083c756cc2";
    const USDC: &str = "a0b86991c6218b36c1d19d4a2e9eb0ce3606eb48";

    fn push_word_u256(buf: &mut Vec<u8>, value: U256) {
        buf.extend_from_slice(&value.to_be_bytes::<32>());
    }

    fn push_word_u64(buf: &mut Vec<u8>, value: u64) {
        push_word_u256(buf, U256::from(value));
    }

    fn push_word_addr(buf: &mut Vec<u8>, addr_hex: &str) {
        let mut w = [0u8; 32];
        let bytes = hex::decode(addr_hex).unwrap();
        w[12..].copy_from_slice(&bytes);
        buf.extend_from_slice(&w);
    }

    fn evm_tx(to: &str, input: Vec<u8>, value: u128) -> PendingTx {
        PendingTx {
            chain: ChainId::Ethereum,
            hash: "0xfeed".into(),
            from: "0x1111111111111111111111111111111111111111".into(),
            to: Some(to.to_string()),
            input,
            value,
            priority_fee: 2_000_000_000,
            raw: None,
            observed_at: Utc::now(),
        }
    }

    fn v2_exact_in_calldata(amount_in: u64, amount_out_min: u64) -> Vec<u8> {
        let mut data = SEL_V2_SWAP_EXACT_TOKENS.to_vec();
        push_word_u64(&mut data, amount_in);
        push_word_u64(&mut data, amount_out_min);
        push_word_u64(&mut data, 0xa0); // path offset: 5 head words * 32
        push_word_addr(&mut data, "2222222222222222222222222222222222222222"); // to
        push_word_u64(&mut data, 1_700_000_000); // deadline
        push_word_u64(&mut data, 2); // path length
        push_word_addr(&mut data, WETH);
        push_word_addr(&mut data, USDC);
        data
    }

    #[test]
    fn test_decode_v2_exact_in() {
        let decoder = TxDecoder::new();
        let tx = evm_tx(UNISWAP_V2_ROUTER, v2_exact_in_calldata(1_000_000, 990_000), 0);
        let intent = decoder.decode(&tx).intent().expect("should decode");
        assert_eq!(intent.method, SwapMethod::V2SwapExactTokensForTokens);
        assert_eq!(intent.protocol, Protocol::UniswapV2);
        assert_eq!(intent.amount_in, U256::from(1_000_000u64));
        assert_eq!(intent.amount_out_min, U256::from(990_000u64));
        assert_eq!(intent.path, vec![format!("0x{WETH}"), format!("0x{USDC}")]);
        assert_eq!(intent.deadline, Some(1_700_000_000));
        assert_eq!(intent.hop_fees_bps, vec![30]);
    }

    #[test]
    fn test_decoder_determinism() {
        let decoder = TxDecoder::new();
        let tx = evm_tx(UNISWAP_V2_ROUTER, v2_exact_in_calldata(5, 4), 0);
        let a = format!("{:?}", decoder.decode(&tx));
        let b = format!("{:?}", decoder.decode(&tx));
        assert_eq!(a, b);
    }

    #[test]
    fn test_truncated_calldata_is_undecodable_and_keeps_raw() {
        let decoder = TxDecoder::new();
        let mut data = v2_exact_in_calldata(1_000_000, 990_000);
        data.truncate(40);
        let tx = evm_tx(UNISWAP_V2_ROUTER, data.clone(), 0);
        match decoder.decode(&tx) {
            DecodeOutcome::Undecodable { raw, .. } => assert_eq!(raw, data),
            other => panic!("expected undecodable, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_selector_ignored() {
        let decoder = TxDecoder::new();
        let tx = evm_tx(UNISWAP_V2_ROUTER, vec![0xde, 0xad, 0xbe, 0xef, 0x00], 0);
        assert!(matches!(decoder.decode(&tx), DecodeOutcome::Ignored));
    }

    #[test]
    fn test_unknown_router_ignored() {
        let decoder = TxDecoder::new();
        let tx = evm_tx(
            "0x9999999999999999999999999999999999999999",
            v2_exact_in_calldata(1, 1),
            0,
        );
        assert!(matches!(decoder.decode(&tx), DecodeOutcome::Ignored));
    }

    #[test]
    fn test_decode_eth_in_uses_msg_value() {
        let decoder = TxDecoder::new();
        let mut data = SEL_V2_SWAP_EXACT_ETH.to_vec();
        push_word_u64(&mut data, 123_000); // amountOutMin
        push_word_u64(&mut data, 0x80); // path offset: 4 head words
        push_word_addr(&mut data, "2222222222222222222222222222222222222222");
        push_word_u64(&mut data, 1_700_000_000);
        push_word_u64(&mut data, 2);
        push_word_addr(&mut data, WETH);
        push_word_addr(&mut data, USDC);
        let tx = evm_tx(UNISWAP_V2_ROUTER, data, 5_000_000_000_000_000_000);
        let intent = decoder.decode(&tx).intent().unwrap();
        assert_eq!(intent.amount_in, U256::from(5_000_000_000_000_000_000u128));
        assert_eq!(intent.amount_out_min, U256::from(123_000u64));
    }

    #[test]
    fn test_decode_v3_exact_input_single() {
        let decoder = TxDecoder::new();
        let mut data = SEL_V3_EXACT_INPUT_SINGLE.to_vec();
        push_word_addr(&mut data, WETH);
        push_word_addr(&mut data, USDC);
        push_word_u64(&mut data, 3000); // fee, hundredths of bps
        push_word_addr(&mut data, "2222222222222222222222222222222222222222");
        push_word_u64(&mut data, 1_700_000_000);
        push_word_u64(&mut data, 7_000_000);
        push_word_u64(&mut data, 6_900_000);
        push_word_u64(&mut data, 0); // sqrtPriceLimit
        let tx = evm_tx(UNISWAP_V3_ROUTER, data, 0);
        let intent = decoder.decode(&tx).intent().unwrap();
        assert_eq!(intent.method, SwapMethod::V3ExactInputSingle);
        assert_eq!(intent.hop_fees_bps, vec![30]);
        assert_eq!(intent.amount_in, U256::from(7_000_000u64));
    }

    #[test]
    fn test_decode_v3_exact_input_path() {
        let decoder = TxDecoder::new();
        // Packed path WETH -(3000)- USDC.
        let mut path_bytes = hex::decode(WETH).unwrap();
        path_bytes.extend_from_slice(&[0x00, 0x0b, 0xb8]); // 3000
        path_bytes.extend_from_slice(&hex::decode(USDC).unwrap());

        let mut data = SEL_V3_EXACT_INPUT.to_vec();
        push_word_u64(&mut data, 0x20); // offset to tuple
        // tuple head: path offset (5 words = 0xa0), recipient, deadline,
        // amountIn, amountOutMinimum
        push_word_u64(&mut data, 0xa0);
        push_word_addr(&mut data, "2222222222222222222222222222222222222222");
        push_word_u64(&mut data, 1_700_000_000);
        push_word_u64(&mut data, 42_000_000);
        push_word_u64(&mut data, 41_000_000);
        push_word_u64(&mut data, path_bytes.len() as u64);
        let mut padded = path_bytes.clone();
        padded.resize(64, 0);
        data.extend_from_slice(&padded);

        let tx = evm_tx(UNISWAP_V3_ROUTER, data, 0);
        let intent = decoder.decode(&tx).intent().unwrap();
        assert_eq!(intent.method, SwapMethod::V3ExactInput);
        assert_eq!(intent.path.len(), 2);
        assert_eq!(intent.hop_fees_bps, vec![30]);
        assert_eq!(intent.amount_in, U256::from(42_000_000u64));
    }

    #[test]
    fn test_decode_stable_exchange() {
        let decoder = TxDecoder::new();
        let mut data = SEL_STABLE_EXCHANGE.to_vec();
        push_word_u64(&mut data, 1); // i = USDC
        push_word_u64(&mut data, 2); // j = USDT
        push_word_u64(&mut data, 1_000_000_000);
        push_word_u64(&mut data, 999_000_000);
        let tx = evm_tx(CURVE_3POOL, data, 0);
        let intent = decoder.decode(&tx).intent().unwrap();
        assert_eq!(intent.method, SwapMethod::StableExchange);
        assert_eq!(intent.protocol, Protocol::StableSwap);
        assert_eq!(intent.path[0], CURVE_3POOL_COINS[1]);
        assert_eq!(intent.path[1], CURVE_3POOL_COINS[2]);
    }

    fn solana_tx_with_instruction(ix: Instruction) -> PendingTx {
        let payer = Keypair::new();
        let tx = Transaction::new_signed_with_payer(
            &[ix],
            Some(&payer.pubkey()),
            &[&payer],
            Hash::default(),
        );
        let versioned = VersionedTransaction::from(tx);
        let raw = bincode::serialize(&versioned).unwrap();
        PendingTx {
            chain: ChainId::Solana,
            hash: versioned.signatures[0].to_string(),
            from: payer.pubkey().to_string(),
            to: None,
            input: Vec::new(),
            value: 0,
            priority_fee: 0,
            raw: Some(raw),
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn test_decode_raydium_v4_swap() {
        let program: Pubkey = RAYDIUM_AMM_V4_PROGRAM_ID.parse().unwrap();
        let pool = Pubkey::new_unique();
        let mut data = vec![RAYDIUM_V4_SWAP_DISCRIMINATOR];
        data.extend_from_slice(&500_000_000u64.to_le_bytes());
        data.extend_from_slice(&490_000_000u64.to_le_bytes());
        let ix = Instruction {
            program_id: program,
            accounts: vec![
                AccountMeta::new_readonly(Pubkey::new_unique(), false),
                AccountMeta::new(pool, false),
            ],
            data,
        };
        let tx = solana_tx_with_instruction(ix);
        let decoder = TxDecoder::new();
        let intent = decoder.decode(&tx).intent().expect("should decode");
        assert_eq!(intent.protocol, Protocol::RaydiumAmmV4);
        assert_eq!(intent.amount_in, U256::from(500_000_000u64));
        assert_eq!(intent.amount_out_min, U256::from(490_000_000u64));
        assert_eq!(intent.pool, Some(pool.to_string()));
    }

    #[test]
    fn test_decode_orca_swap_and_ignore_unknown_program() {
        let program: Pubkey = ORCA_WHIRLPOOLS_PROGRAM_ID.parse().unwrap();
        let mut data = ORCA_WHIRLPOOL_SWAP_DISCRIMINATOR.to_vec();
        data.extend_from_slice(&1_000u64.to_le_bytes());
        data.extend_from_slice(&900u64.to_le_bytes());
        data.extend_from_slice(&[0u8; 17]); // sqrt limit + flags
        let ix = Instruction {
            program_id: program,
            accounts: vec![
                AccountMeta::new_readonly(Pubkey::new_unique(), false),
                AccountMeta::new(Pubkey::new_unique(), false),
            ],
            data,
        };
        let decoder = TxDecoder::new();
        let intent = decoder
            .decode(&solana_tx_with_instruction(ix))
            .intent()
            .unwrap();
        assert_eq!(intent.protocol, Protocol::OrcaWhirlpool);

        // A random program decodes to Ignored.
        let other = Instruction {
            program_id: Pubkey::new_unique(),
            accounts: vec![],
            data: vec![1, 2, 3],
        };
        assert!(matches!(
            decoder.decode(&solana_tx_with_instruction(other)),
            DecodeOutcome::Ignored
        ));
    }

    #[test]
    fn test_garbage_solana_bytes_undecodable() {
        let decoder = TxDecoder::new();
        let tx = PendingTx {
            chain: ChainId::Solana,
            hash: "sig".into(),
            from: String::new(),
            to: None,
            input: Vec::new(),
            value: 0,
            priority_fee: 0,
            raw: Some(vec![0xff; 12]),
            observed_at: Utc::now(),
        };
        assert!(matches!(
            decoder.decode(&tx),
            DecodeOutcome::Undecodable { .. }
        ));
    }
}
