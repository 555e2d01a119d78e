//! Bundle builder: turns an admitted opportunity into an ordered, signed,
//! chain-specific bundle. Ordering is strategy-defined (sandwich:
//! front / victim / back; arbitrage: leg per hop; copy: approval then swap).
//! Nonce allocation is serialized per (chain, signer); the tip is carved
//! from expected profit, bounded below by the minimum share and above by
//! the configured maximum share.

use alloy::primitives::{Address, Bytes, TxKind, U256};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use solana_sdk::compute_budget::ComputeBudgetInstruction;
use solana_sdk::hash::Hash as SolanaHash;
use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signer as SolanaSigner;
use solana_sdk::transaction::Transaction as SolanaTransaction;
use std::collections::HashMap;
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

use crate::chain_adapter::FeeData;
use crate::constants::{
    JITO_TIP_ACCOUNTS, MAX_BUNDLE_SIZE, MIN_TIP_PCT_OF_PROFIT, RAYDIUM_V4_SWAP_DISCRIMINATOR,
    SEL_V2_SWAP_EXACT_TOKENS,
};
use crate::error::{BotError, BotResult};
use crate::sandwich_engine::SandwichPlan;
use crate::types::{
    Bundle, BundleStatus, ChainId, Opportunity, RelayKind, Route, SignedBundleTx, StrategyKind,
};
use crate::wallet::WalletManager;

/// ERC-20 approve(address,uint256) selector.
const SEL_ERC20_APPROVE: [u8; 4] = [0x09, 0x5e, 0xa7, 0xb3];

/// Serialized nonce allocation per (chain, signer). Within a pair, nonces
/// are handed out strictly increasing; a failed build can roll its block of
/// nonces back if nothing newer was allocated.
pub struct NonceManager {
    next: Mutex<HashMap<(ChainId, String), u64>>,
}

impl NonceManager {
    pub fn new() -> Self {
        Self {
            next: Mutex::new(HashMap::new()),
        }
    }

    /// Reserve `count` nonces starting at max(local cursor, chain-reported).
    pub fn allocate(
        &self,
        chain: ChainId,
        signer: &str,
        chain_reported: u64,
        count: u64,
    ) -> u64 {
        let mut next = self.next.lock();
        let cursor = next.entry((chain, signer.to_string())).or_insert(0);
        let start = (*cursor).max(chain_reported);
        *cursor = start + count;
        start
    }

    /// Roll back an unused reservation; only possible while nothing newer
    /// has been allocated on the same signer.
    pub fn rollback(&self, chain: ChainId, signer: &str, start: u64, count: u64) {
        let mut next = self.next.lock();
        if let Some(cursor) = next.get_mut(&(chain, signer.to_string())) {
            if *cursor == start + count {
                *cursor = start;
            }
        }
    }
}

impl Default for NonceManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything chain-dependent the builder needs for one bundle.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub fee: FeeData,
    pub target_block_or_slot: u64,
    /// Chain-reported next nonce for our signer (EVM only).
    pub chain_nonce: Option<u64>,
    /// Recent blockhash (Solana only).
    pub recent_blockhash: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BuilderConfig {
    pub max_tip_pct_of_profit: f64,
    pub public_fallback: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BundleBuilderStats {
    pub built: u64,
    pub build_failures: u64,
}

pub struct BundleBuilder {
    wallet: std::sync::Arc<WalletManager>,
    nonces: NonceManager,
    config: BuilderConfig,
    stats: Mutex<BundleBuilderStats>,
}

impl BundleBuilder {
    pub fn new(wallet: std::sync::Arc<WalletManager>, config: BuilderConfig) -> Self {
        Self {
            wallet,
            nonces: NonceManager::new(),
            config,
            stats: Mutex::new(BundleBuilderStats::default()),
        }
    }

    /// Relay for a strategy on a chain. Copy trades ride the public mempool
    /// when the fallback is enabled; MEV strategies always use a private
    /// relay and fail closed without one.
    pub fn select_relay(&self, chain: ChainId, strategy: StrategyKind) -> BotResult<RelayKind> {
        if strategy == StrategyKind::Copy && self.config.public_fallback {
            return Ok(RelayKind::PublicMempool);
        }
        match chain {
            ChainId::Ethereum => Ok(RelayKind::Flashbots),
            ChainId::Bsc => Ok(RelayKind::Bloxroute),
            ChainId::Solana => Ok(RelayKind::Jito),
        }
    }

    /// Tip carved from expected profit: at least the minimum share, at most
    /// the configured maximum share.
    pub fn tip_for_profit(&self, expected_profit: U256) -> U256 {
        let min_bps = (MIN_TIP_PCT_OF_PROFIT * 10_000.0) as u64;
        let max_bps = (self.config.max_tip_pct_of_profit * 10_000.0).max(min_bps as f64) as u64;
        let floor = expected_profit * U256::from(min_bps) / U256::from(10_000u64);
        let ceiling = expected_profit * U256::from(max_bps) / U256::from(10_000u64);
        // Mid-range opening bid; the one allowed re-bid can escalate to the
        // ceiling.
        let opening = expected_profit * U256::from((min_bps + max_bps) / 2) / U256::from(10_000u64);
        opening.clamp(floor, ceiling)
    }

    /// Maximum tip for a re-bid after a missed target.
    pub fn max_tip(&self, expected_profit: U256) -> U256 {
        let max_bps = (self.config.max_tip_pct_of_profit * 10_000.0) as u64;
        expected_profit * U256::from(max_bps) / U256::from(10_000u64)
    }

    pub fn build(
        &self,
        opportunity: &Opportunity,
        plan: Option<&SandwichPlan>,
        victim_raw: Option<&[u8]>,
        ctx: &BuildContext,
    ) -> BotResult<Bundle> {
        let result = match opportunity.chain {
            ChainId::Ethereum | ChainId::Bsc => {
                self.build_evm(opportunity, plan, victim_raw, ctx)
            }
            ChainId::Solana => self.build_solana(opportunity, plan, victim_raw, ctx),
        };
        match &result {
            Ok(bundle) => {
                self.stats.lock().built += 1;
                info!(
                    "📦 built {} bundle {} on {}: {} txs, tip {}, target {}",
                    opportunity.strategy,
                    bundle.id,
                    bundle.chain,
                    bundle.transactions.len(),
                    bundle.tip_native,
                    bundle.target_block_or_slot
                );
            }
            Err(e) => {
                self.stats.lock().build_failures += 1;
                debug!("bundle build failed for {}: {e}", opportunity.id);
            }
        }
        result
    }

    fn build_evm(
        &self,
        opportunity: &Opportunity,
        plan: Option<&SandwichPlan>,
        victim_raw: Option<&[u8]>,
        ctx: &BuildContext,
    ) -> BotResult<Bundle> {
        let chain = opportunity.chain;
        let signer_address = self.wallet.address(chain)?;
        let chain_nonce = ctx
            .chain_nonce
            .ok_or_else(|| BotError::Signer("missing chain nonce for EVM build".into()))?;
        let tip = self.tip_for_profit(opportunity.expected_profit_native);

        // Leg plans: (calldata, to, value, gas_limit) per transaction.
        let legs = match opportunity.strategy {
            StrategyKind::Sandwich => {
                let plan = plan.ok_or_else(|| {
                    BotError::Fatal("sandwich build without a plan".into())
                })?;
                if victim_raw.is_none() {
                    // Relay atomicity needs the victim carried in-bundle;
                    // without raw bytes the sandwich cannot fail closed.
                    return Err(BotError::Submission(
                        "victim raw transaction unavailable".into(),
                    ));
                }
                sandwich_evm_legs(opportunity, plan, &signer_address)?
            }
            StrategyKind::Arbitrage => arbitrage_evm_legs(opportunity, &signer_address)?,
            StrategyKind::Copy => copy_evm_legs(opportunity, &signer_address)?,
        };
        if legs.len() > MAX_BUNDLE_SIZE {
            return Err(BotError::Fatal(format!(
                "bundle of {} legs exceeds relay cap",
                legs.len()
            )));
        }

        let total_gas: u64 = legs.iter().map(|l| l.gas_limit).sum();
        // EVM relays take the tip as extra priority fee across the legs.
        let tip_per_gas = if total_gas == 0 {
            0u128
        } else {
            crate::evm_client::u256_to_u128(tip)? / total_gas as u128
        };
        let nonce_start =
            self.nonces
                .allocate(chain, &signer_address, chain_nonce, legs.len() as u64);

        let mut transactions = Vec::with_capacity(legs.len());
        for (i, leg) in legs.iter().enumerate() {
            let nonce = nonce_start + i as u64;
            let tx = alloy::consensus::TxEip1559 {
                chain_id: chain.evm_chain_id().unwrap_or_default(),
                nonce,
                gas_limit: leg.gas_limit,
                max_fee_per_gas: ctx.fee.base_fee * 2 + ctx.fee.priority_fee + tip_per_gas,
                max_priority_fee_per_gas: ctx.fee.priority_fee + tip_per_gas,
                to: TxKind::Call(leg.to),
                value: leg.value,
                access_list: Default::default(),
                input: Bytes::from(leg.calldata.clone()),
            };
            let (hash, raw) = self.wallet.sign_evm_tx(chain, tx).map_err(|e| {
                self.nonces
                    .rollback(chain, &signer_address, nonce_start, legs.len() as u64);
                e
            })?;
            transactions.push(SignedBundleTx {
                hash,
                raw_base64: base64::encode(&raw),
                signer: signer_address.clone(),
                nonce: Some(nonce),
            });
        }

        let bundle = Bundle {
            id: Uuid::new_v4(),
            opportunity_id: opportunity.id,
            strategy: opportunity.strategy,
            chain,
            relay: self.select_relay(chain, opportunity.strategy)?,
            transactions,
            victim_raw_base64: victim_raw.map(base64::encode),
            target_block_or_slot: ctx.target_block_or_slot,
            tip_native: tip,
            status: BundleStatus::Built,
            simulated_profit_native: None,
            actual_profit_native: None,
            submission_attempts: 0,
            landing_tx_hashes: Vec::new(),
            created_at: Utc::now(),
        };
        bundle
            .check_integrity()
            .map_err(BotError::Fatal)?;
        Ok(bundle)
    }

    fn build_solana(
        &self,
        opportunity: &Opportunity,
        plan: Option<&SandwichPlan>,
        victim_raw: Option<&[u8]>,
        ctx: &BuildContext,
    ) -> BotResult<Bundle> {
        let keypair = self.wallet.solana_keypair()?;
        let signer_address = keypair.pubkey().to_string();
        let blockhash_str = ctx
            .recent_blockhash
            .as_deref()
            .ok_or_else(|| BotError::Signer("missing recent blockhash".into()))?;
        let blockhash = SolanaHash::from_str(blockhash_str)
            .map_err(|e| BotError::Signer(format!("bad blockhash: {e}")))?;
        let tip = self.tip_for_profit(opportunity.expected_profit_native);
        let tip_lamports = crate::evm_client::u256_to_u128(tip)? as u64;

        let cu_price = ctx.fee.priority_fee as u64;
        let mut transactions = Vec::new();

        let mut push_swap_tx = |route_slice: &[crate::types::RouteHop],
                                amount_in: U256,
                                min_out: U256,
                                with_tip: bool|
         -> BotResult<()> {
            let mut instructions = vec![
                ComputeBudgetInstruction::set_compute_unit_limit(400_000),
                ComputeBudgetInstruction::set_compute_unit_price(cu_price),
            ];
            for hop in route_slice {
                instructions.push(solana_swap_instruction(
                    hop,
                    amount_in,
                    min_out,
                    &keypair.pubkey(),
                )?);
            }
            if with_tip && tip_lamports > 0 {
                let tip_account = jito_tip_account()?;
                instructions.push(solana_sdk::system_instruction::transfer(
                    &keypair.pubkey(),
                    &tip_account,
                    tip_lamports,
                ));
            }
            let tx = SolanaTransaction::new_signed_with_payer(
                &instructions,
                Some(&keypair.pubkey()),
                &[keypair],
                blockhash,
            );
            let raw = bincode::serialize(&tx)
                .map_err(|e| BotError::Signer(format!("tx serialize: {e}")))?;
            transactions.push(SignedBundleTx {
                hash: tx.signatures[0].to_string(),
                raw_base64: base64::encode(raw),
                signer: signer_address.clone(),
                nonce: None,
            });
            Ok(())
        };

        match opportunity.strategy {
            StrategyKind::Sandwich => {
                let plan = plan
                    .ok_or_else(|| BotError::Fatal("sandwich build without a plan".into()))?;
                if victim_raw.is_none() {
                    return Err(BotError::Submission(
                        "victim raw transaction unavailable".into(),
                    ));
                }
                let hops = &opportunity.route.hops;
                // Front leg, then back leg with the tip riding on it.
                push_swap_tx(&hops[..1], plan.front_amount_in, U256::ZERO, false)?;
                push_swap_tx(&hops[1..], plan.front_amount_out, plan.front_amount_in, true)?;
            }
            StrategyKind::Arbitrage => {
                // One transaction per hop; tip rides the closing leg.
                let hops = &opportunity.route.hops;
                for (i, hop) in hops.iter().enumerate() {
                    let is_last = i == hops.len() - 1;
                    push_swap_tx(
                        std::slice::from_ref(hop),
                        opportunity.required_capital,
                        U256::ZERO,
                        is_last,
                    )?;
                }
            }
            StrategyKind::Copy => {
                push_swap_tx(
                    &opportunity.route.hops,
                    opportunity.required_capital,
                    U256::ZERO,
                    false,
                )?;
            }
        }

        let bundle = Bundle {
            id: Uuid::new_v4(),
            opportunity_id: opportunity.id,
            strategy: opportunity.strategy,
            chain: ChainId::Solana,
            relay: self.select_relay(ChainId::Solana, opportunity.strategy)?,
            transactions,
            victim_raw_base64: victim_raw.map(base64::encode),
            target_block_or_slot: ctx.target_block_or_slot,
            tip_native: tip,
            status: BundleStatus::Built,
            simulated_profit_native: None,
            actual_profit_native: None,
            submission_attempts: 0,
            landing_tx_hashes: Vec::new(),
            created_at: Utc::now(),
        };
        bundle.check_integrity().map_err(BotError::Fatal)?;
        Ok(bundle)
    }

    pub fn stats(&self) -> BundleBuilderStats {
        self.stats.lock().clone()
    }
}

struct EvmLeg {
    to: Address,
    calldata: Vec<u8>,
    value: U256,
    gas_limit: u64,
}

fn parse_address(s: &str) -> BotResult<Address> {
    Address::from_str(s).map_err(|e| BotError::Fatal(format!("bad address {s}: {e}")))
}

/// Deadline for router calls: now plus one minute, in seconds.
fn router_deadline() -> u64 {
    (Utc::now().timestamp() + 60) as u64
}

/// ABI-encode swapExactTokensForTokens.
fn encode_v2_swap(
    amount_in: U256,
    amount_out_min: U256,
    path: &[Address],
    recipient: Address,
    deadline: u64,
) -> Vec<u8> {
    let mut data = SEL_V2_SWAP_EXACT_TOKENS.to_vec();
    let mut word = |value: U256| data.extend_from_slice(&value.to_be_bytes::<32>());
    word(amount_in);
    word(amount_out_min);
    word(U256::from(5u64 * 32)); // offset to path array
    word(U256::from_be_slice(recipient.as_slice()));
    word(U256::from(deadline));
    word(U256::from(path.len() as u64));
    for addr in path {
        word(U256::from_be_slice(addr.as_slice()));
    }
    data
}

fn encode_erc20_approve(spender: Address, amount: U256) -> Vec<u8> {
    let mut data = SEL_ERC20_APPROVE.to_vec();
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(spender.as_slice());
    data.extend_from_slice(&word);
    data.extend_from_slice(&amount.to_be_bytes::<32>());
    data
}

/// Router assumed for built EVM legs: the v2 router on the leg's chain.
fn leg_router(chain: ChainId) -> BotResult<Address> {
    match chain {
        ChainId::Ethereum => parse_address(crate::constants::UNISWAP_V2_ROUTER),
        ChainId::Bsc => parse_address(crate::constants::PANCAKE_V2_ROUTER),
        ChainId::Solana => Err(BotError::Fatal("no EVM router on solana".into())),
    }
}

fn hop_path(route: &Route, index: usize) -> BotResult<Vec<Address>> {
    let hop = route
        .hops
        .get(index)
        .ok_or_else(|| BotError::Fatal("route missing hop".into()))?;
    Ok(vec![
        parse_address(&hop.token_in)?,
        parse_address(&hop.token_out)?,
    ])
}

fn sandwich_evm_legs(
    opportunity: &Opportunity,
    plan: &SandwichPlan,
    signer: &str,
) -> BotResult<Vec<EvmLeg>> {
    let recipient = parse_address(signer)?;
    let router = leg_router(opportunity.chain)?;
    let deadline = router_deadline();
    let front_path = hop_path(&opportunity.route, 0)?;
    let back_path = hop_path(&opportunity.route, 1)?;
    Ok(vec![
        EvmLeg {
            to: router,
            calldata: encode_v2_swap(
                plan.front_amount_in,
                U256::ZERO,
                &front_path,
                recipient,
                deadline,
            ),
            value: U256::ZERO,
            gas_limit: 200_000,
        },
        EvmLeg {
            to: router,
            calldata: encode_v2_swap(
                plan.front_amount_out,
                plan.front_amount_in,
                &back_path,
                recipient,
                deadline,
            ),
            value: U256::ZERO,
            gas_limit: 200_000,
        },
    ])
}

fn arbitrage_evm_legs(opportunity: &Opportunity, signer: &str) -> BotResult<Vec<EvmLeg>> {
    let recipient = parse_address(signer)?;
    let router = leg_router(opportunity.chain)?;
    let deadline = router_deadline();
    let mut legs = Vec::with_capacity(opportunity.route.hop_count());
    for i in 0..opportunity.route.hop_count() {
        let path = hop_path(&opportunity.route, i)?;
        // Pre-walked hop inputs from the engine; the closing leg guards the
        // cycle with the entry amount as its minimum out.
        let amount_in = opportunity
            .leg_inputs
            .get(i)
            .copied()
            .unwrap_or(opportunity.required_capital);
        let min_out = if i == opportunity.route.hop_count() - 1 {
            opportunity.required_capital
        } else {
            U256::ZERO
        };
        legs.push(EvmLeg {
            to: router,
            calldata: encode_v2_swap(amount_in, min_out, &path, recipient, deadline),
            value: U256::ZERO,
            gas_limit: 180_000,
        });
    }
    Ok(legs)
}

fn copy_evm_legs(opportunity: &Opportunity, signer: &str) -> BotResult<Vec<EvmLeg>> {
    let recipient = parse_address(signer)?;
    let router = leg_router(opportunity.chain)?;
    let deadline = router_deadline();
    let path = hop_path(&opportunity.route, 0)?;
    let token_in = path[0];
    Ok(vec![
        EvmLeg {
            to: token_in,
            calldata: encode_erc20_approve(router, opportunity.required_capital),
            value: U256::ZERO,
            gas_limit: 60_000,
        },
        EvmLeg {
            to: router,
            calldata: encode_v2_swap(
                opportunity.required_capital,
                U256::ZERO,
                &path,
                recipient,
                deadline,
            ),
            value: U256::ZERO,
            gas_limit: 200_000,
        },
    ])
}

/// Constant-product swap instruction in the Raydium v4 wire shape. The
/// account list carries the signer and the pool; vault accounts resolve at
/// the program level.
fn solana_swap_instruction(
    hop: &crate::types::RouteHop,
    amount_in: U256,
    min_out: U256,
    signer: &Pubkey,
) -> BotResult<Instruction> {
    let program_id = Pubkey::from_str(match hop.pool.protocol {
        crate::types::Protocol::RaydiumAmmV4 => crate::constants::RAYDIUM_AMM_V4_PROGRAM_ID,
        crate::types::Protocol::RaydiumClmm => crate::constants::RAYDIUM_CLMM_PROGRAM_ID,
        crate::types::Protocol::OrcaWhirlpool => crate::constants::ORCA_WHIRLPOOLS_PROGRAM_ID,
        crate::types::Protocol::PumpSwap => crate::constants::PUMPSWAP_PROGRAM_ID,
        other => {
            return Err(BotError::Fatal(format!(
                "{} is not a solana protocol",
                other.name()
            )))
        }
    })
    .map_err(|e| BotError::Fatal(format!("program id: {e}")))?;
    let pool = Pubkey::from_str(&hop.pool.address)
        .map_err(|e| BotError::Fatal(format!("pool address: {e}")))?;

    #[derive(borsh::BorshSerialize)]
    struct SwapInstructionData {
        discriminant: u8,
        amount_in: u64,
        minimum_amount_out: u64,
    }
    let data = borsh::to_vec(&SwapInstructionData {
        discriminant: RAYDIUM_V4_SWAP_DISCRIMINATOR,
        amount_in: crate::evm_client::u256_to_u128(amount_in)? as u64,
        minimum_amount_out: crate::evm_client::u256_to_u128(min_out.min(U256::from(u64::MAX)))?
            as u64,
    })
    .map_err(|e| BotError::Fatal(format!("borsh: {e}")))?;

    Ok(Instruction {
        program_id,
        accounts: vec![
            AccountMeta::new(*signer, true),
            AccountMeta::new(pool, false),
        ],
        data,
    })
}

fn jito_tip_account() -> BotResult<Pubkey> {
    let account = JITO_TIP_ACCOUNTS[fastrand::usize(..JITO_TIP_ACCOUNTS.len())];
    Pubkey::from_str(account).map_err(|e| BotError::Fatal(format!("tip account: {e}")))
}
