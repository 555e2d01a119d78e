//! Protocol AMM math on arbitrary-precision integers.
//!
//! All path-critical arithmetic runs on `U256` with `U512` intermediates so a
//! computed amount matches the on-chain formula to the wei. Floating point is
//! allowed only in derived scores (impact bps as f64 for logging callers).

use alloy::primitives::{U256, U512};

use crate::error::{BotError, BotResult};
use crate::types::PoolState;

const BPS_DENOM: u64 = 10_000;
const Q96_SHIFT: usize = 96;

fn u512_to_u256(v: U512) -> BotResult<U256> {
    let limbs = v.as_limbs();
    if limbs[4..].iter().any(|&l| l != 0) {
        return Err(BotError::Fatal("U512 -> U256 overflow".into()));
    }
    Ok(U256::from_limbs([limbs[0], limbs[1], limbs[2], limbs[3]]))
}

fn wide(v: U256) -> U512 {
    U512::from(v)
}

/// Integer square root (Newton's method) over U512.
fn isqrt(value: U512) -> U512 {
    if value.is_zero() {
        return U512::ZERO;
    }
    let mut x = value;
    let mut y = (x + U512::from(1u64)) >> 1;
    while y < x {
        x = y;
        y = (x + value / x) >> 1;
    }
    x
}

/// Exact Uniswap-v2 style output: `(in * (10000-fee) * r_out) /
/// (r_in * 10000 + in * (10000-fee))`, floor division as on chain.
pub fn v2_amount_out(
    amount_in: U256,
    reserve_in: U256,
    reserve_out: U256,
    fee_bps: u32,
) -> BotResult<U256> {
    if amount_in.is_zero() {
        return Err(BotError::Validation("zero input amount".into()));
    }
    if reserve_in.is_zero() || reserve_out.is_zero() {
        return Err(BotError::Validation("empty reserves".into()));
    }
    if fee_bps as u64 >= BPS_DENOM {
        return Err(BotError::Validation(format!("fee {fee_bps} bps >= 100%")));
    }
    let fee_factor = U512::from(BPS_DENOM - fee_bps as u64);
    let amount_with_fee = wide(amount_in) * fee_factor;
    let numerator = amount_with_fee * wide(reserve_out);
    let denominator = wide(reserve_in) * U512::from(BPS_DENOM) + amount_with_fee;
    u512_to_u256(numerator / denominator)
}

/// Exact v2 input required for a desired output (rounded up).
pub fn v2_amount_in(
    amount_out: U256,
    reserve_in: U256,
    reserve_out: U256,
    fee_bps: u32,
) -> BotResult<U256> {
    if amount_out.is_zero() {
        return Err(BotError::Validation("zero output amount".into()));
    }
    if amount_out >= reserve_out {
        return Err(BotError::Validation(
            "output exceeds pool reserves".into(),
        ));
    }
    let numerator = wide(reserve_in) * wide(amount_out) * U512::from(BPS_DENOM);
    let denominator =
        (wide(reserve_out) - wide(amount_out)) * U512::from(BPS_DENOM - fee_bps as u64);
    u512_to_u256(numerator / denominator + U512::from(1u64))
}

/// Optimal input for a two-pool cycle: trade through pool `a` then pool `b`
/// back to the starting token. Closed form from setting the profit derivative
/// to zero on the composed constant-product curves:
/// `x* = (sqrt(k1 * k2) - k2) / k3` with
/// `k1 = na*nb*ra_out*rb_out`, `k2 = ra_in*rb_in*1e8`,
/// `k3 = na*1e4*rb_in + na*nb*ra_out` (fees as `1e4 - fee_bps`).
/// Returns zero when no input is profitable.
pub fn v2_optimal_cycle_input(
    a_reserve_in: U256,
    a_reserve_out: U256,
    b_reserve_in: U256,
    b_reserve_out: U256,
    a_fee_bps: u32,
    b_fee_bps: u32,
) -> BotResult<U256> {
    let na = U512::from(BPS_DENOM - a_fee_bps as u64);
    let nb = U512::from(BPS_DENOM - b_fee_bps as u64);
    let denom = U512::from(BPS_DENOM);

    let k1 = na * nb * wide(a_reserve_out) * wide(b_reserve_out);
    let k2 = wide(a_reserve_in) * wide(b_reserve_in) * denom * denom;
    let k3 = na * denom * wide(b_reserve_in) + na * nb * wide(a_reserve_out);
    if k3.is_zero() {
        return Ok(U256::ZERO);
    }

    let root = isqrt(k1.checked_mul(k2).ok_or_else(|| {
        BotError::Fatal("cycle radicand overflow".into())
    })?);
    if root <= k2 {
        return Ok(U256::ZERO);
    }
    let optimal = (root - k2) / k3;
    // Cap at 10% of the shallower side so the estimate stays inside the
    // route's validity band.
    let cap = wide(a_reserve_in.min(b_reserve_out)) / U512::from(10u64);
    u512_to_u256(optimal.min(cap))
}

/// Price impact of a v2-style trade in bps against the pre-trade mid-price.
/// Computed fee-free so it reflects curvature, not the fee schedule.
pub fn v2_price_impact_bps(
    amount_in: U256,
    reserve_in: U256,
    reserve_out: U256,
) -> BotResult<u32> {
    let out = v2_amount_out(amount_in, reserve_in, reserve_out, 0)?;
    execution_impact_bps(amount_in, out, reserve_in, reserve_out)
}

/// Impact of an (in, out) execution against reserves-implied mid-price, bps.
pub fn execution_impact_bps(
    amount_in: U256,
    amount_out: U256,
    reserve_in: U256,
    reserve_out: U256,
) -> BotResult<u32> {
    if amount_in.is_zero() || reserve_in.is_zero() || reserve_out.is_zero() {
        return Err(BotError::Validation("impact on empty amounts".into()));
    }
    // realized/mid = (out/in) / (r_out/r_in); impact = 1 - that, in bps
    let realized = wide(amount_out) * wide(reserve_in) * U512::from(BPS_DENOM);
    let mid = wide(amount_in) * wide(reserve_out);
    if mid.is_zero() {
        return Err(BotError::Validation("zero mid price".into()));
    }
    let ratio_bps = u512_to_u256(realized / mid)?;
    let ratio = ratio_bps.saturating_to::<u64>().min(BPS_DENOM);
    Ok((BPS_DENOM - ratio) as u32)
}

/// Uniswap-v3 exact-input within the current tick range. `zero_for_one` sells
/// token0. Ignores tick crossings; callers treat the result as an
/// approximation valid inside the route's amount band.
pub fn v3_amount_out(
    amount_in: U256,
    sqrt_price_x96: U256,
    liquidity: U256,
    fee_bps: u32,
    zero_for_one: bool,
) -> BotResult<U256> {
    if amount_in.is_zero() {
        return Err(BotError::Validation("zero input amount".into()));
    }
    if sqrt_price_x96.is_zero() || liquidity.is_zero() {
        return Err(BotError::Validation("uninitialized v3 pool".into()));
    }
    let amount_after_fee = wide(amount_in) * U512::from(BPS_DENOM - fee_bps as u64)
        / U512::from(BPS_DENOM);
    let l = wide(liquidity);
    let sqrt_p = wide(sqrt_price_x96);

    if zero_for_one {
        // sqrtP' = L * sqrtP * Q96 / (L * Q96 + dx * sqrtP)
        let numerator = l * sqrt_p;
        let denominator = (l << Q96_SHIFT) + amount_after_fee * sqrt_p;
        if denominator.is_zero() {
            return Err(BotError::Validation("v3 denominator underflow".into()));
        }
        let sqrt_p_next = (numerator << Q96_SHIFT) / denominator;
        // dy = L * (sqrtP - sqrtP') / Q96
        let delta = sqrt_p
            .checked_sub(sqrt_p_next)
            .ok_or_else(|| BotError::Fatal("v3 price moved up on a sell".into()))?;
        u512_to_u256((l * delta) >> Q96_SHIFT)
    } else {
        // sqrtP' = sqrtP + dy * Q96 / L
        let sqrt_p_next = sqrt_p + ((amount_after_fee << Q96_SHIFT) / l);
        // dx = L * Q96 * (sqrtP' - sqrtP) / (sqrtP' * sqrtP)
        let delta = sqrt_p_next - sqrt_p;
        let numerator = (l * delta) << Q96_SHIFT;
        let denominator = sqrt_p_next * sqrt_p;
        if denominator.is_zero() {
            return Err(BotError::Validation("v3 denominator underflow".into()));
        }
        u512_to_u256(numerator / denominator)
    }
}

/// Quote any supported pool shape. `a_to_b` orients the trade from token_a
/// into token_b of the pool's stored ordering.
pub fn pool_amount_out(
    state: &PoolState,
    fee_bps: u32,
    a_to_b: bool,
    amount_in: U256,
) -> BotResult<U256> {
    match state {
        PoolState::V2 {
            reserve_a,
            reserve_b,
        } => {
            let (r_in, r_out) = if a_to_b {
                (*reserve_a, *reserve_b)
            } else {
                (*reserve_b, *reserve_a)
            };
            v2_amount_out(amount_in, r_in, r_out, fee_bps)
        }
        PoolState::V3 {
            sqrt_price_x96,
            liquidity,
        } => v3_amount_out(amount_in, *sqrt_price_x96, *liquidity, fee_bps, a_to_b),
        PoolState::Stable { reserves, amp } => {
            let (r_in, r_out) = if a_to_b {
                (reserves.first(), reserves.get(1))
            } else {
                (reserves.get(1), reserves.first())
            };
            match (r_in, r_out) {
                (Some(r_in), Some(r_out)) => {
                    stable_amount_out(amount_in, *r_in, *r_out, *amp, fee_bps)
                }
                _ => Err(BotError::Validation("stable pool missing reserves".into())),
            }
        }
    }
}

/// Reserve depth of the input side, used for liquidity floors and probe
/// sizing. V3 approximates depth with the active liquidity figure.
pub fn input_side_depth(state: &PoolState, a_to_b: bool) -> U256 {
    match state {
        PoolState::V2 {
            reserve_a,
            reserve_b,
        } => {
            if a_to_b {
                *reserve_a
            } else {
                *reserve_b
            }
        }
        PoolState::V3 { liquidity, .. } => *liquidity,
        PoolState::Stable { reserves, .. } => {
            let idx = usize::from(!a_to_b);
            reserves.get(idx).copied().unwrap_or(U256::ZERO)
        }
    }
}

/// Curve-style stable swap for a two-coin pool. Computes D by Newton
/// iteration, then the post-trade balance of the output coin, fee on output.
pub fn stable_amount_out(
    amount_in: U256,
    reserve_in: U256,
    reserve_out: U256,
    amp: u64,
    fee_bps: u32,
) -> BotResult<U256> {
    if amount_in.is_zero() {
        return Err(BotError::Validation("zero input amount".into()));
    }
    if reserve_in.is_zero() || reserve_out.is_zero() {
        return Err(BotError::Validation("empty reserves".into()));
    }
    let d = stable_d(reserve_in, reserve_out, amp)?;
    let x = wide(reserve_in) + wide(amount_in);
    let y = stable_y(x, d, amp)?;
    let dy = wide(reserve_out)
        .checked_sub(y)
        .ok_or_else(|| BotError::Validation("stable output underflow".into()))?;
    // Curve subtracts 1 to guard rounding, then takes the fee from dy.
    let dy = dy.saturating_sub(U512::from(1u64));
    let dy_after_fee = dy * U512::from(BPS_DENOM - fee_bps as u64) / U512::from(BPS_DENOM);
    u512_to_u256(dy_after_fee)
}

/// Stable invariant D for two coins: iterate
/// `D = (Ann*S + 2*D_P) * D / ((Ann-1)*D + 3*D_P)`.
fn stable_d(x0: U256, x1: U256, amp: u64) -> BotResult<U512> {
    const N: u64 = 2;
    let s = wide(x0) + wide(x1);
    if s.is_zero() {
        return Ok(U512::ZERO);
    }
    let ann = U512::from(amp * N * N);
    let mut d = s;
    for _ in 0..255 {
        // D_P = D^3 / (4 * x0 * x1)
        let mut d_p = d;
        d_p = d_p * d / (wide(x0) * U512::from(N));
        d_p = d_p * d / (wide(x1) * U512::from(N));
        let d_prev = d;
        d = (ann * s + d_p * U512::from(N)) * d
            / ((ann - U512::from(1u64)) * d + U512::from(N + 1) * d_p);
        if d.abs_diff(d_prev) <= U512::from(1u64) {
            return Ok(d);
        }
    }
    Err(BotError::Validation("stable invariant did not converge".into()))
}

/// Solve for the output-coin balance `y` given the input balance `x` and
/// invariant `d`: `y^2 + y*(b - d) = c`.
fn stable_y(x: U512, d: U512, amp: u64) -> BotResult<U512> {
    const N: u64 = 2;
    let ann = U512::from(amp * N * N);
    // c = D^3 / (4 * x * Ann), b = x + D/Ann
    let mut c = d * d / (x * U512::from(N));
    c = c * d / (ann * U512::from(N));
    let b = x + d / ann;
    let mut y = d;
    for _ in 0..255 {
        let y_prev = y;
        let denom = U512::from(2u64) * y + b - d;
        if denom.is_zero() {
            return Err(BotError::Validation("stable y denominator zero".into()));
        }
        y = (y * y + c) / denom;
        if y.abs_diff(y_prev) <= U512::from(1u64) {
            return Ok(y);
        }
    }
    Err(BotError::Validation("stable y did not converge".into()))
}
