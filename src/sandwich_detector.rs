//! Sandwich candidate detection over the pending-swap stream.
//!
//! For each qualifying pending swap the detector sizes a front-run and
//! back-run pair that maximizes proceeds while keeping the victim inside its
//! own declared slippage tolerance; swaps without a knowable tolerance are
//! skipped. Ethical mode suppresses the detector entirely.

use parking_lot::Mutex;
use prometheus::IntCounter;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::PipelineError;
use crate::events::SwapEvent;
use crate::gas_estimator::{self, NetworkContext};
use crate::liquidation_scanner::PriceSource;
use crate::market_graph::MarketGraph;
use crate::opportunity::{AccountAccess, Opportunity, OpportunityKind};
use crate::risk_assessor::{self, RiskContext};
use crate::submission_client::tip_fraction;
use crate::success_model::SuccessModel;
use crate::venue_math;
use solana_sdk::pubkey::Pubkey;

#[derive(Debug, Clone)]
pub struct SandwichConfig {
    pub min_target_value_usd: f64,
    pub ethical_mode: bool,
    pub native_token: Pubkey,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SandwichStats {
    pub pending_swaps_seen: u64,
    pub below_value_floor: u64,
    pub unknown_tolerance: u64,
    pub opportunities_emitted: u64,
    pub unprofitable: u64,
}

pub struct SandwichDetector {
    graph: Arc<MarketGraph>,
    model: Arc<SuccessModel>,
    clock: Clock,
    config: SandwichConfig,
    network: Mutex<NetworkContext>,
    policy_blocked: IntCounter,
    last_detected_ns: AtomicU64,
    stats: Mutex<SandwichStats>,
}

impl SandwichDetector {
    pub fn new(
        graph: Arc<MarketGraph>,
        model: Arc<SuccessModel>,
        clock: Clock,
        config: SandwichConfig,
        policy_blocked: IntCounter,
    ) -> Self {
        Self {
            graph,
            model,
            clock,
            config,
            network: Mutex::new(NetworkContext::default()),
            policy_blocked,
            last_detected_ns: AtomicU64::new(0),
            stats: Mutex::new(SandwichStats::default()),
        }
    }

    pub fn stats(&self) -> SandwichStats {
        self.stats.lock().clone()
    }

    fn next_detected_ns(&self) -> u64 {
        let now = self.clock.now_ns();
        self.last_detected_ns
            .fetch_max(now, Ordering::Relaxed)
            .max(now)
    }

    /// Examine one pending swap. `Ok(None)` means it did not qualify;
    /// `Err(PolicyBlocked)` means ethical mode suppressed a qualifying one.
    pub fn on_pending_swap(
        &self,
        swap: &SwapEvent,
        prices: &dyn PriceSource,
    ) -> Result<Option<Opportunity>, PipelineError> {
        self.stats.lock().pending_swaps_seen += 1;

        let Some(in_price_usd) = prices.price_usd(&swap.token_in) else {
            return Ok(None);
        };
        let victim_value_usd = swap.amount_in as f64 * in_price_usd;
        if victim_value_usd < self.config.min_target_value_usd {
            self.stats.lock().below_value_floor += 1;
            return Ok(None);
        }

        if self.config.ethical_mode {
            self.policy_blocked.inc();
            warn!(
                "🚫 Ethical mode: suppressed sandwich on victim {} (${:.0})",
                swap.signature, victim_value_usd
            );
            return Err(PipelineError::PolicyBlocked(
                "sandwich detection disabled by ethical mode".into(),
            ));
        }

        // Without a declared tolerance the victim's worst case is unknowable.
        let Some(tolerance_bps) = swap.slippage_tolerance_bps else {
            self.stats.lock().unknown_tolerance += 1;
            debug!("Skipping pending swap {}: no tolerance", swap.signature);
            return Ok(None);
        };

        let Some(pool) = self.graph.pool(&swap.pool) else {
            return Ok(None);
        };
        let a_to_b = swap.token_in == pool.token_a;

        // The victim's floor: its declared minimum, or spot minus tolerance.
        let victim_min_out = if swap.min_amount_out > 0 {
            swap.min_amount_out
        } else {
            let spot = venue_math::spot_price(&pool.reserves, a_to_b).map_err(|_| {
                PipelineError::Decode("victim pool has empty reserves".into())
            })?;
            ((swap.amount_in as f64 * spot) * (1.0 - tolerance_bps as f64 / 10_000.0)) as u64
        };

        let Some((front, back, profit)) = self.size_sandwich(
            &pool.reserves,
            a_to_b,
            pool.fee_bps,
            swap.amount_in,
            victim_min_out,
        ) else {
            self.stats.lock().unprofitable += 1;
            return Ok(None);
        };

        let profit_usd = profit as f64 * in_price_usd;
        let Some(native_price) = prices.price_usd(&self.config.native_token) else {
            return Ok(None);
        };
        if native_price <= 0.0 {
            return Ok(None);
        }
        let gross_profit_lamports =
            (profit_usd / native_price * crate::constants::LAMPORTS_PER_SOL as f64) as u64;

        let venue_ids = vec![pool.venue_id.clone()];
        let competition = self.model.competition(&venue_ids);
        let kind = OpportunityKind::Sandwich {
            victim_signature: swap.signature.clone(),
            pool: swap.pool,
            token_in: swap.token_in,
            token_out: swap.token_out,
            front_amount: front,
            back_amount: back,
        };
        let gas = gas_estimator::estimate(&kind, &self.network.lock());
        let risk = risk_assessor::assess(
            &kind,
            &RiskContext {
                competition,
                worst_slippage_bps: 0,
                state_age_slots: 0,
            },
        );

        self.model.record_opportunity(&venue_ids);
        self.stats.lock().opportunities_emitted += 1;
        info!(
            "🥪 Sandwich candidate on {}: front={} back={} gross={} lamports",
            pool.venue_id, front, back, gross_profit_lamports
        );

        Ok(Some(Opportunity {
            id: Opportunity::new_id(),
            detected_at_ns: self.next_detected_ns(),
            gross_profit_lamports,
            estimated_gas_lamports: gas.lamports,
            estimated_tip_lamports: (gross_profit_lamports as f64 * tip_fraction(competition))
                as u64,
            risk_score: risk,
            confidence: (1.0 - competition).clamp(0.0, 1.0),
            accounts: AccountAccess {
                readable: vec![swap.token_in, swap.token_out, swap.owner],
                writable: vec![swap.pool],
            },
            kind,
        }))
    }

    /// Front size that maximizes back-run proceeds minus front cost, subject
    /// to the victim still receiving its minimum. Returns
    /// (front_in, back_in, net_profit_in_victim_input_token).
    fn size_sandwich(
        &self,
        reserves: &crate::events::ReserveState,
        a_to_b: bool,
        fee_bps: u32,
        victim_in: u64,
        victim_min_out: u64,
    ) -> Option<(u64, u64, u64)> {
        let evaluate = |front: u64| -> Option<(u64, i128)> {
            let mut state = *reserves;
            let front_out = venue_math::apply_swap(&mut state, a_to_b, front, fee_bps).ok()?;
            let victim_out =
                venue_math::apply_swap(&mut state, a_to_b, victim_in, fee_bps).ok()?;
            if victim_out < victim_min_out {
                return None;
            }
            let proceeds = venue_math::quote(&state, !a_to_b, front_out, fee_bps).ok()?;
            Some((front_out, proceeds as i128 - front as i128))
        };

        // Largest front size the victim's floor tolerates.
        let mut lo = 0u64;
        let mut hi = victim_in.saturating_mul(4).max(1);
        while evaluate(hi).is_some() {
            hi = hi.saturating_mul(2);
            if hi > u64::MAX / 4 {
                break;
            }
        }
        while lo + 1 < hi {
            let mid = lo + (hi - lo) / 2;
            if evaluate(mid).is_some() {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        let max_front = lo;
        if max_front == 0 {
            return None;
        }

        // Profit grows with the front size until fees overtake it; probe a
        // coarse grid and keep the best.
        let mut best: Option<(u64, u64, i128)> = None;
        for numerator in 1..=8u64 {
            let front = max_front * numerator / 8;
            if front == 0 {
                continue;
            }
            if let Some((front_out, profit)) = evaluate(front) {
                if best.map(|(_, _, p)| profit > p).unwrap_or(true) {
                    best = Some((front, front_out, profit));
                }
            }
        }

        let (front, back, profit) = best?;
        if profit <= 0 {
            return None;
        }
        Some((front, back, profit as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{PoolStateEvent, ReserveState, VenueKind};
    use crate::metrics::PipelineMetrics;
    use std::collections::HashMap;

    struct StaticPrices(HashMap<Pubkey, f64>);

    impl PriceSource for StaticPrices {
        fn price_usd(&self, token: &Pubkey) -> Option<f64> {
            self.0.get(token).copied()
        }
    }

    struct Setup {
        detector: SandwichDetector,
        metrics: PipelineMetrics,
        pool: Pubkey,
        sol: Pubkey,
        usdc: Pubkey,
    }

    fn setup(ethical_mode: bool) -> Setup {
        let clock = Clock::new();
        let graph = Arc::new(MarketGraph::new(clock));
        let metrics = PipelineMetrics::new().unwrap();
        let (sol, usdc) = (Pubkey::new_unique(), Pubkey::new_unique());
        let pool = Pubkey::new_unique();
        graph
            .apply(&PoolStateEvent {
                venue: VenueKind::AmmConstantProduct,
                venue_id: "ray".into(),
                address: pool,
                token_a: sol,
                token_b: usdc,
                fee_bps: 25,
                reserves: ReserveState::ConstantProduct {
                    reserve_a: 10_000_000,
                    reserve_b: 1_000_000_000,
                },
                slot: 1,
            })
            .unwrap();

        let detector = SandwichDetector::new(
            graph,
            Arc::new(SuccessModel::new()),
            clock,
            SandwichConfig {
                min_target_value_usd: 5_000.0,
                ethical_mode,
                native_token: sol,
            },
            metrics.policy_blocked_sandwich.clone(),
        );
        Setup {
            detector,
            metrics,
            pool,
            sol,
            usdc,
        }
    }

    fn prices(setup: &Setup) -> StaticPrices {
        let mut map = HashMap::new();
        map.insert(setup.sol, 100.0);
        map.insert(setup.usdc, 1.0);
        StaticPrices(map)
    }

    fn pending_swap(setup: &Setup, amount_in: u64, tolerance_bps: Option<u32>) -> SwapEvent {
        SwapEvent {
            signature: "victim-sig".into(),
            venue_id: "ray".into(),
            pool: setup.pool,
            owner: Pubkey::new_unique(),
            token_in: setup.usdc,
            token_out: setup.sol,
            amount_in,
            min_amount_out: 0,
            slippage_tolerance_bps: tolerance_bps,
            slot: 2,
            pending: true,
        }
    }

    #[test]
    fn test_qualifying_swap_emits_sized_opportunity() {
        let s = setup(false);
        let swap = pending_swap(&s, 10_000_000, Some(200));
        let opp = s
            .detector
            .on_pending_swap(&swap, &prices(&s))
            .unwrap()
            .expect("should qualify");

        match &opp.kind {
            OpportunityKind::Sandwich {
                front_amount,
                back_amount,
                ..
            } => {
                assert!(*front_amount > 0);
                assert!(*back_amount > 0);
            }
            other => panic!("wrong kind: {:?}", other),
        }
        assert!(opp.gross_profit_lamports > 0);
        assert!(opp.risk_score >= 6.0, "adversarial plans carry a risk boost");
    }

    #[test]
    fn test_victim_floor_respected() {
        let s = setup(false);
        let swap = pending_swap(&s, 10_000_000, Some(200));
        let feed = prices(&s);
        let opp = s.detector.on_pending_swap(&swap, &feed).unwrap().unwrap();

        let OpportunityKind::Sandwich { front_amount, .. } = &opp.kind else {
            panic!("wrong kind");
        };

        // Replay the sandwich against the same pool state: after the front
        // run, the victim must still clear its tolerance-implied minimum.
        let pool = s.detector.graph.pool(&s.pool).unwrap();
        let spot = venue_math::spot_price(&pool.reserves, false).unwrap();
        let min_out = ((swap.amount_in as f64 * spot) * (1.0 - 0.02)) as u64;

        let mut state = pool.reserves;
        venue_math::apply_swap(&mut state, false, *front_amount, pool.fee_bps).unwrap();
        let victim_out =
            venue_math::apply_swap(&mut state, false, swap.amount_in, pool.fee_bps).unwrap();
        assert!(victim_out >= min_out);
    }

    #[test]
    fn test_unknown_tolerance_skipped() {
        let s = setup(false);
        let swap = pending_swap(&s, 10_000_000, None);
        assert!(s
            .detector
            .on_pending_swap(&swap, &prices(&s))
            .unwrap()
            .is_none());
        assert_eq!(s.detector.stats().unknown_tolerance, 1);
    }

    #[test]
    fn test_value_floor_skips_small_fry() {
        let s = setup(false);
        // $1000 swap against a $5000 floor.
        let swap = pending_swap(&s, 1_000, Some(200));
        assert!(s
            .detector
            .on_pending_swap(&swap, &prices(&s))
            .unwrap()
            .is_none());
        assert_eq!(s.detector.stats().below_value_floor, 1);
    }

    #[test]
    fn test_ethical_mode_blocks_with_counter() {
        let s = setup(true);
        let swap = pending_swap(&s, 10_000_000, Some(200));
        let before = s.metrics.policy_blocked_sandwich.get();

        let result = s.detector.on_pending_swap(&swap, &prices(&s));
        assert!(matches!(result, Err(PipelineError::PolicyBlocked(_))));
        assert_eq!(s.metrics.policy_blocked_sandwich.get(), before + 1);
        assert_eq!(s.detector.stats().opportunities_emitted, 0);
    }
}
