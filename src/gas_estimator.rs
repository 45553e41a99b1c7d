//! Compute-unit and fee point estimates for candidate opportunities.
//!
//! Pure functions: (opportunity shape, network context) -> estimate. The
//! composer pads the point estimate with the configured safety margin before
//! attaching a compute-budget instruction.

use crate::constants::MAX_TX_COMPUTE_UNITS;
use crate::opportunity::OpportunityKind;

/// Signature fee per transaction.
const BASE_FEE_LAMPORTS: u64 = 5_000;

/// Compute units for one AMM swap leg.
const CU_PER_SWAP: u64 = 65_000;

/// Compute units for a lending repay-and-seize pair.
const CU_LIQUIDATION: u64 = 210_000;

/// Fixed overhead per transaction (account loading, budget instruction).
const CU_TX_OVERHEAD: u64 = 15_000;

/// Network-wide context sampled at estimation time.
#[derive(Debug, Clone, Copy)]
pub struct NetworkContext {
    /// Recent market rate for prioritization, micro-lamports per compute unit.
    pub priority_fee_micro_lamports: u64,
    /// 0..1, fraction of recent blocks that were full.
    pub congestion: f64,
}

impl Default for NetworkContext {
    fn default() -> Self {
        Self {
            priority_fee_micro_lamports: 1_000,
            congestion: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasEstimate {
    pub compute_units: u64,
    pub lamports: u64,
}

/// Point estimate for the transactions an opportunity needs.
pub fn estimate(kind: &OpportunityKind, ctx: &NetworkContext) -> GasEstimate {
    let (tx_count, compute_units) = match kind {
        // One swap transaction per hop.
        OpportunityKind::Arbitrage { path, .. } => {
            let hops = path.len().max(1) as u64;
            (hops, hops * (CU_TX_OVERHEAD + CU_PER_SWAP))
        }
        OpportunityKind::Liquidation { .. } => (1, CU_TX_OVERHEAD + CU_LIQUIDATION),
        // Front-run and back-run are separate transactions.
        OpportunityKind::Sandwich { .. } => (2, 2 * (CU_TX_OVERHEAD + CU_PER_SWAP)),
    };

    // Congested slots pay a premium to stay competitive.
    let fee_rate = ctx.priority_fee_micro_lamports as f64 * (1.0 + ctx.congestion);
    let priority_lamports = (compute_units as f64 * fee_rate / 1_000_000.0).ceil() as u64;

    GasEstimate {
        compute_units,
        lamports: tx_count * BASE_FEE_LAMPORTS + priority_lamports,
    }
}

/// Compute-unit limit for the budget instruction: point estimate plus the
/// configured margin, never above the chain's per-transaction ceiling.
pub fn budget_with_margin(compute_units: u64, safety_margin_bps: u32) -> u32 {
    let padded = compute_units + compute_units * safety_margin_bps as u64 / 10_000;
    padded.min(MAX_TX_COMPUTE_UNITS as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_graph::PathHop;
    use solana_sdk::pubkey::Pubkey;

    fn arb_kind(hops: usize) -> OpportunityKind {
        let path = (0..hops)
            .map(|_| PathHop {
                pool: Pubkey::new_unique(),
                token_in: Pubkey::new_unique(),
                token_out: Pubkey::new_unique(),
            })
            .collect();
        OpportunityKind::Arbitrage {
            path,
            venue_ids: vec![],
            start_token: Pubkey::new_unique(),
            input_amount: 0,
            expected_output: 0,
        }
    }

    #[test]
    fn test_more_hops_cost_more() {
        let ctx = NetworkContext::default();
        let two = estimate(&arb_kind(2), &ctx);
        let four = estimate(&arb_kind(4), &ctx);
        assert!(four.compute_units > two.compute_units);
        assert!(four.lamports > two.lamports);
    }

    #[test]
    fn test_congestion_raises_fees() {
        let calm = NetworkContext {
            priority_fee_micro_lamports: 1_000,
            congestion: 0.0,
        };
        let busy = NetworkContext {
            priority_fee_micro_lamports: 1_000,
            congestion: 1.0,
        };
        assert!(estimate(&arb_kind(3), &busy).lamports > estimate(&arb_kind(3), &calm).lamports);
    }

    #[test]
    fn test_budget_margin_and_ceiling() {
        assert_eq!(budget_with_margin(100_000, 1_500), 115_000);
        assert_eq!(budget_with_margin(10_000_000, 1_500), MAX_TX_COMPUTE_UNITS);
    }
}
