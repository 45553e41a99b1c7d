//! Risk scoring for candidate opportunities.
//!
//! Pure function over the opportunity shape and current market context,
//! returning a 0..10 score the composer and strategy filter act on.

use crate::opportunity::OpportunityKind;

/// Inputs the assessor looks at beyond the opportunity itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct RiskContext {
    /// 0..1 estimate that a competitor lands the same extraction first.
    pub competition: f64,
    /// Worst per-hop slippage of the plan, basis points.
    pub worst_slippage_bps: u32,
    /// Slots since the freshest pool state backing the plan.
    pub state_age_slots: u64,
}

/// Score an opportunity, 0 (safe) to 10 (reckless).
pub fn assess(kind: &OpportunityKind, ctx: &RiskContext) -> f64 {
    let base = match kind {
        // Single atomic transaction against observed state.
        OpportunityKind::Arbitrage { path, .. } => 1.5 + 0.5 * path.len() as f64,
        // Oracle movement between detection and landing can void it.
        OpportunityKind::Liquidation { .. } => 3.0,
        // Adversarial by construction: the victim may reprice, or another
        // searcher may wrap the same target.
        OpportunityKind::Sandwich { .. } => 6.0,
    };

    let slippage_penalty = (ctx.worst_slippage_bps as f64 / 100.0).min(2.0);
    let staleness_penalty = (ctx.state_age_slots as f64 * 0.25).min(1.5);
    let competition_penalty = ctx.competition * 2.0;

    (base + slippage_penalty + staleness_penalty + competition_penalty).clamp(0.0, 10.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_sdk::pubkey::Pubkey;

    fn sandwich() -> OpportunityKind {
        OpportunityKind::Sandwich {
            victim_signature: "sig".into(),
            pool: Pubkey::new_unique(),
            token_in: Pubkey::new_unique(),
            token_out: Pubkey::new_unique(),
            front_amount: 1,
            back_amount: 1,
        }
    }

    fn liquidation() -> OpportunityKind {
        OpportunityKind::Liquidation {
            protocol: "lendx".into(),
            owner: Pubkey::new_unique(),
            debt_token: Pubkey::new_unique(),
            repay_amount: 1,
            collateral_token: Pubkey::new_unique(),
            collateral_seized: 1,
        }
    }

    #[test]
    fn test_sandwich_riskier_than_liquidation() {
        let ctx = RiskContext::default();
        assert!(assess(&sandwich(), &ctx) > assess(&liquidation(), &ctx));
    }

    #[test]
    fn test_competition_raises_score() {
        let calm = RiskContext::default();
        let contested = RiskContext {
            competition: 1.0,
            ..RiskContext::default()
        };
        assert!(assess(&liquidation(), &contested) > assess(&liquidation(), &calm));
    }

    #[test]
    fn test_score_clamped() {
        let extreme = RiskContext {
            competition: 1.0,
            worst_slippage_bps: 100_000,
            state_age_slots: 1_000,
        };
        assert!(assess(&sandwich(), &extreme) <= 10.0);
    }
}
