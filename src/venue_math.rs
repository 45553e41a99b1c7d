//! Venue swap math with exact integer calculations.
//!
//! Constant-product quotes preserve full precision in u128; concentrated
//! pools are quoted against their in-range virtual reserves. Detector code is
//! written against `ReserveState`, never a concrete venue type.

use crate::error::PipelineError;
use crate::events::ReserveState;

const BPS_DENOM: u128 = 10_000;
const Q64: f64 = 18446744073709551616.0; // 2^64

/// Exact x*y=k output for a constant-product pool.
pub fn quote_constant_product(
    amount_in: u64,
    reserve_in: u64,
    reserve_out: u64,
    fee_bps: u32,
) -> Result<u64, PipelineError> {
    if amount_in == 0 {
        return Ok(0);
    }
    if reserve_in == 0 || reserve_out == 0 {
        return Err(PipelineError::Decode("pool has empty reserves".into()));
    }
    let amount_in = amount_in as u128;
    let reserve_in = reserve_in as u128;
    let reserve_out = reserve_out as u128;

    let in_after_fee = amount_in * (BPS_DENOM - fee_bps as u128) / BPS_DENOM;
    let numerator = in_after_fee * reserve_out;
    let denominator = reserve_in + in_after_fee;
    Ok((numerator / denominator) as u64)
}

/// In-range virtual reserves of a concentrated pool, (token_a, token_b).
///
/// Single-range approximation: quotes are only valid while the swap stays
/// inside the active tick range.
pub fn virtual_reserves(liquidity: u128, sqrt_price_x64: u128) -> (f64, f64) {
    let sqrt_price = sqrt_price_x64 as f64 / Q64;
    if sqrt_price <= 0.0 {
        return (0.0, 0.0);
    }
    let liquidity = liquidity as f64;
    (liquidity / sqrt_price, liquidity * sqrt_price)
}

fn oriented(reserves: &ReserveState, a_to_b: bool) -> Result<(u64, u64), PipelineError> {
    let (ra, rb) = match *reserves {
        ReserveState::ConstantProduct { reserve_a, reserve_b } => (reserve_a, reserve_b),
        ReserveState::Concentrated {
            liquidity,
            sqrt_price_x64,
            ..
        } => {
            let (va, vb) = virtual_reserves(liquidity, sqrt_price_x64);
            (va as u64, vb as u64)
        }
    };
    if a_to_b {
        Ok((ra, rb))
    } else {
        Ok((rb, ra))
    }
}

/// Output amount for a swap through any supported pool shape.
pub fn quote(
    reserves: &ReserveState,
    a_to_b: bool,
    amount_in: u64,
    fee_bps: u32,
) -> Result<u64, PipelineError> {
    let (reserve_in, reserve_out) = oriented(reserves, a_to_b)?;
    quote_constant_product(amount_in, reserve_in, reserve_out, fee_bps)
}

/// Marginal price (output token per input token) at zero size.
pub fn spot_price(reserves: &ReserveState, a_to_b: bool) -> Result<f64, PipelineError> {
    let (reserve_in, reserve_out) = oriented(reserves, a_to_b)?;
    if reserve_in == 0 {
        return Err(PipelineError::Decode("pool has empty reserves".into()));
    }
    Ok(reserve_out as f64 / reserve_in as f64)
}

/// Execution-vs-spot deviation in basis points, fees included.
pub fn slippage_bps(
    reserves: &ReserveState,
    a_to_b: bool,
    amount_in: u64,
    fee_bps: u32,
) -> Result<u32, PipelineError> {
    if amount_in == 0 {
        return Ok(0);
    }
    let ideal = spot_price(reserves, a_to_b)? * amount_in as f64;
    if ideal <= 0.0 {
        return Ok(u32::MAX);
    }
    let actual = quote(reserves, a_to_b, amount_in, fee_bps)? as f64;
    let deviation = ((ideal - actual) / ideal).max(0.0);
    Ok((deviation * BPS_DENOM as f64).round() as u32)
}

/// Mutate reserves as if the swap executed, returning the output amount.
pub fn apply_swap(
    reserves: &mut ReserveState,
    a_to_b: bool,
    amount_in: u64,
    fee_bps: u32,
) -> Result<u64, PipelineError> {
    let amount_out = quote(reserves, a_to_b, amount_in, fee_bps)?;
    match reserves {
        ReserveState::ConstantProduct { reserve_a, reserve_b } => {
            if a_to_b {
                *reserve_a = reserve_a.saturating_add(amount_in);
                *reserve_b = reserve_b.saturating_sub(amount_out);
            } else {
                *reserve_b = reserve_b.saturating_add(amount_in);
                *reserve_a = reserve_a.saturating_sub(amount_out);
            }
        }
        ReserveState::Concentrated { sqrt_price_x64, liquidity, .. } => {
            let (va, vb) = virtual_reserves(*liquidity, *sqrt_price_x64);
            let (new_a, new_b) = if a_to_b {
                (va + amount_in as f64, vb - amount_out as f64)
            } else {
                (va - amount_out as f64, vb + amount_in as f64)
            };
            if new_a > 0.0 && new_b > 0.0 {
                *sqrt_price_x64 = ((new_b / new_a).sqrt() * Q64) as u128;
            }
        }
    }
    Ok(amount_out)
}

/// One hop of an arbitrage cycle.
#[derive(Debug, Clone, Copy)]
pub struct CycleHop {
    pub reserves: ReserveState,
    pub a_to_b: bool,
    pub fee_bps: u32,
}

/// Chain an input amount through every hop of a cycle.
pub fn cycle_output(hops: &[CycleHop], amount_in: u64) -> Result<u64, PipelineError> {
    let mut amount = amount_in;
    for hop in hops {
        amount = quote(&hop.reserves, hop.a_to_b, amount, hop.fee_bps)?;
        if amount == 0 {
            return Ok(0);
        }
    }
    Ok(amount)
}

/// Largest input worth sweeping: a tenth of the first hop's input-side depth.
pub fn depth_limit(hops: &[CycleHop]) -> u64 {
    hops.first()
        .and_then(|hop| oriented(&hop.reserves, hop.a_to_b).ok())
        .map(|(reserve_in, _)| reserve_in / 10)
        .unwrap_or(0)
}

/// Input size that maximizes `cycle_output(x) - x`, found by bisecting the
/// sign of the marginal profit over the pool-depth constraint.
pub fn optimal_cycle_input(hops: &[CycleHop]) -> Result<u64, PipelineError> {
    let max_in = depth_limit(hops);
    if max_in < 2 {
        return Ok(0);
    }

    let profit = |x: u64| -> i128 {
        match cycle_output(hops, x) {
            Ok(out) => out as i128 - x as i128,
            Err(_) => i128::MIN,
        }
    };

    // Profit is concave in x for chained constant-product hops, so the
    // marginal profit crosses zero at most once.
    let step = (max_in / 1024).max(1);
    let mut lo = 1u64;
    let mut hi = max_in;
    while lo + step < hi {
        let mid = lo + (hi - lo) / 2;
        if profit(mid + step) > profit(mid) {
            lo = mid;
        } else {
            hi = mid;
        }
    }

    let best = if profit(hi) > profit(lo) { hi } else { lo };
    if profit(best) <= 0 {
        return Ok(0);
    }
    Ok(best)
}
