//! Cross-venue arbitrage detection.
//!
//! On every pool update, cycles through the market graph that touch the
//! updated pool are enumerated from each watchlist start token, swept for
//! the profit-maximizing input size, and filtered on profit, per-hop
//! slippage and competition-adjusted tip cost.

use parking_lot::Mutex;
use serde::Serialize;
use solana_sdk::pubkey::Pubkey;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::clock::Clock;
use crate::events::PoolStateEvent;
use crate::gas_estimator::{self, NetworkContext};
use crate::market_graph::{MarketGraph, PathHop};
use crate::opportunity::{AccountAccess, Opportunity, OpportunityKind};
use crate::risk_assessor::{self, RiskContext};
use crate::submission_client::tip_fraction;
use crate::success_model::SuccessModel;
use crate::venue_math;

/// Cycles pulled from the lazy path iterator per pool update.
const MAX_CYCLES_PER_EVENT: usize = 512;

#[derive(Debug, Clone)]
pub struct ArbitrageConfig {
    pub min_profit_lamports: u64,
    pub max_slippage_bps: u32,
    pub max_hops: usize,
    pub watchlist: Vec<Pubkey>,
    pub native_token: Pubkey,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ArbitrageStats {
    pub pool_updates_processed: u64,
    pub cycles_evaluated: u64,
    pub opportunities_emitted: u64,
    pub rejected_unprofitable: u64,
    pub rejected_slippage: u64,
    pub rejected_competition: u64,
}

pub struct ArbitrageDetector {
    graph: Arc<MarketGraph>,
    model: Arc<SuccessModel>,
    clock: Clock,
    config: ArbitrageConfig,
    network: Mutex<NetworkContext>,
    last_detected_ns: AtomicU64,
    stats: Mutex<ArbitrageStats>,
}

struct Candidate {
    path: Vec<PathHop>,
    venue_ids: Vec<String>,
    start_token: Pubkey,
    input: u64,
    output: u64,
    profit_lamports: u64,
    worst_slippage_bps: u32,
    competition: f64,
}

impl ArbitrageDetector {
    pub fn new(
        graph: Arc<MarketGraph>,
        model: Arc<SuccessModel>,
        clock: Clock,
        config: ArbitrageConfig,
    ) -> Self {
        Self {
            graph,
            model,
            clock,
            config,
            network: Mutex::new(NetworkContext::default()),
            last_detected_ns: AtomicU64::new(0),
            stats: Mutex::new(ArbitrageStats::default()),
        }
    }

    pub fn set_network_context(&self, ctx: NetworkContext) {
        *self.network.lock() = ctx;
    }

    pub fn stats(&self) -> ArbitrageStats {
        self.stats.lock().clone()
    }

    /// Timestamps are monotonically non-decreasing per detector even if the
    /// clock reads identical nanoseconds twice.
    fn next_detected_ns(&self) -> u64 {
        let now = self.clock.now_ns();
        self.last_detected_ns
            .fetch_max(now, Ordering::Relaxed)
            .max(now)
    }

    /// Convert a profit denominated in `token` into lamports using any pool
    /// pairing it with the native token. None when no conversion exists.
    fn to_lamports(&self, token: &Pubkey, amount: u64) -> Option<u64> {
        if *token == self.config.native_token {
            return Some(amount);
        }
        for pool_addr in self.graph.pools_for_token(token) {
            let pool = self.graph.pool(&pool_addr)?;
            let other = if pool.token_a == *token {
                pool.token_b
            } else {
                pool.token_a
            };
            if other == self.config.native_token {
                let price =
                    venue_math::spot_price(&pool.reserves, pool.token_a == *token).ok()?;
                return Some((amount as f64 * price) as u64);
            }
        }
        None
    }

    /// React to one pool update; returns accepted opportunities sorted by
    /// descending profit.
    pub fn on_pool_update(&self, event: &PoolStateEvent) -> Vec<Opportunity> {
        self.stats.lock().pool_updates_processed += 1;

        let mut candidates: Vec<Candidate> = Vec::new();
        for start_token in &self.config.watchlist {
            let mut pulled = 0usize;
            for path in self.graph.find_paths(*start_token, self.config.max_hops) {
                pulled += 1;
                if pulled > MAX_CYCLES_PER_EVENT {
                    break;
                }
                if !path.iter().any(|hop| hop.pool == event.address) {
                    continue;
                }
                if let Some(candidate) = self.evaluate_cycle(*start_token, path) {
                    candidates.push(candidate);
                }
            }
        }

        if candidates.is_empty() {
            return Vec::new();
        }

        // Cycles over the same pool set are one opportunity seen from
        // different ends; keep the best reading of each.
        let mut by_pool_set: HashMap<Vec<Pubkey>, Candidate> = HashMap::new();
        for candidate in candidates {
            let mut key: Vec<Pubkey> = candidate.path.iter().map(|h| h.pool).collect();
            key.sort();
            match by_pool_set.get(&key) {
                Some(existing) if !candidate.beats(existing) => {}
                _ => {
                    by_pool_set.insert(key, candidate);
                }
            }
        }

        let mut accepted: Vec<Candidate> = by_pool_set.into_values().collect();
        accepted.sort_by(|a, b| b.profit_lamports.cmp(&a.profit_lamports));

        accepted
            .into_iter()
            .map(|c| self.into_opportunity(c))
            .collect()
    }

    fn evaluate_cycle(&self, start_token: Pubkey, path: Vec<PathHop>) -> Option<Candidate> {
        self.stats.lock().cycles_evaluated += 1;
        let hops = self.graph.cycle_hops(&path)?;

        let input = venue_math::optimal_cycle_input(&hops).ok()?;
        if input == 0 {
            self.stats.lock().rejected_unprofitable += 1;
            return None;
        }
        let output = venue_math::cycle_output(&hops, input).ok()?;
        if output <= input {
            self.stats.lock().rejected_unprofitable += 1;
            return None;
        }

        let profit_lamports = self.to_lamports(&start_token, output - input)?;
        if profit_lamports <= self.config.min_profit_lamports {
            self.stats.lock().rejected_unprofitable += 1;
            return None;
        }

        // Every hop must stay within the per-hop slippage bound at the
        // chosen input size.
        let mut worst_slippage = 0u32;
        let mut flowing = input;
        for hop in &hops {
            let slip = venue_math::slippage_bps(&hop.reserves, hop.a_to_b, flowing, hop.fee_bps)
                .ok()?;
            worst_slippage = worst_slippage.max(slip);
            if slip > self.config.max_slippage_bps {
                self.stats.lock().rejected_slippage += 1;
                return None;
            }
            flowing = venue_math::quote(&hop.reserves, hop.a_to_b, flowing, hop.fee_bps).ok()?;
        }

        let venue_ids = self.graph.venue_ids(&path);
        let competition = self.model.competition(&venue_ids);
        let expected_tip = (profit_lamports as f64 * tip_fraction(competition)) as u64;
        if competition * expected_tip as f64 >= profit_lamports as f64 {
            self.stats.lock().rejected_competition += 1;
            return None;
        }

        Some(Candidate {
            path,
            venue_ids,
            start_token,
            input,
            output,
            profit_lamports,
            worst_slippage_bps: worst_slippage,
            competition,
        })
    }

    fn into_opportunity(&self, candidate: Candidate) -> Opportunity {
        let kind = OpportunityKind::Arbitrage {
            path: candidate.path.clone(),
            venue_ids: candidate.venue_ids.clone(),
            start_token: candidate.start_token,
            input_amount: candidate.input,
            expected_output: candidate.output,
        };
        let gas = gas_estimator::estimate(&kind, &self.network.lock());
        let risk = risk_assessor::assess(
            &kind,
            &RiskContext {
                competition: candidate.competition,
                worst_slippage_bps: candidate.worst_slippage_bps,
                state_age_slots: 0,
            },
        );
        let tip = (candidate.profit_lamports as f64 * tip_fraction(candidate.competition)) as u64;

        let accounts = AccountAccess {
            readable: vec![candidate.start_token],
            writable: candidate.path.iter().map(|h| h.pool).collect(),
        };

        self.model.record_opportunity(&candidate.venue_ids);
        let mut stats = self.stats.lock();
        stats.opportunities_emitted += 1;
        drop(stats);

        info!(
            "💰 Arbitrage: {} hops via {:?}, {} lamports gross",
            candidate.path.len(),
            candidate.venue_ids,
            candidate.profit_lamports
        );

        Opportunity {
            id: Opportunity::new_id(),
            detected_at_ns: self.next_detected_ns(),
            gross_profit_lamports: candidate.profit_lamports,
            estimated_gas_lamports: gas.lamports,
            estimated_tip_lamports: tip,
            risk_score: risk,
            confidence: (1.0 - candidate.competition).clamp(0.0, 1.0),
            accounts,
            kind,
        }
    }
}

impl Candidate {
    /// Dedup tie-break: profit desc, then fewer hops, then lexicographic
    /// venue-id order.
    fn beats(&self, other: &Candidate) -> bool {
        self.profit_lamports
            .cmp(&other.profit_lamports)
            .then(other.path.len().cmp(&self.path.len()))
            .then(other.venue_ids.cmp(&self.venue_ids))
            .is_gt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ReserveState, VenueKind};

    fn pool_event(
        venue_id: &str,
        address: Pubkey,
        token_a: Pubkey,
        token_b: Pubkey,
        reserve_a: u64,
        reserve_b: u64,
        fee_bps: u32,
        slot: u64,
    ) -> PoolStateEvent {
        PoolStateEvent {
            venue: VenueKind::AmmConstantProduct,
            venue_id: venue_id.to_string(),
            address,
            token_a,
            token_b,
            fee_bps,
            reserves: ReserveState::ConstantProduct { reserve_a, reserve_b },
            slot,
        }
    }

    /// Two pools quoting the same pair 1.8% apart: exactly one opportunity,
    /// buying on the cheap venue and selling on the rich one.
    #[test]
    fn test_simple_two_pool_arbitrage() {
        let clock = Clock::new();
        let graph = Arc::new(MarketGraph::new(clock));
        let model = Arc::new(SuccessModel::new());
        let (sol, usdc) = (Pubkey::new_unique(), Pubkey::new_unique());
        let (ray_pool, orc_pool) = (Pubkey::new_unique(), Pubkey::new_unique());

        let ray = pool_event("ray", ray_pool, sol, usdc, 10_000_000, 1_002_000_000, 25, 1);
        let orc = pool_event("orc", orc_pool, sol, usdc, 10_000_000, 1_020_000_000, 30, 1);
        graph.apply(&ray).unwrap();
        graph.apply(&orc).unwrap();

        let detector = ArbitrageDetector::new(
            graph,
            model,
            clock,
            ArbitrageConfig {
                min_profit_lamports: 10,
                max_slippage_bps: 500,
                max_hops: 3,
                watchlist: vec![usdc],
                native_token: sol,
            },
        );

        let opportunities = detector.on_pool_update(&orc);
        assert_eq!(opportunities.len(), 1, "reversal must be deduplicated");

        let opp = &opportunities[0];
        match &opp.kind {
            OpportunityKind::Arbitrage {
                path,
                venue_ids,
                start_token,
                input_amount,
                expected_output,
            } => {
                assert_eq!(*start_token, usdc);
                assert_eq!(venue_ids, &vec!["ray".to_string(), "orc".to_string()]);
                assert_eq!(path[0].pool, ray_pool);
                assert_eq!(path[1].pool, orc_pool);
                assert!(expected_output > input_amount);
            }
            other => panic!("wrong kind: {:?}", other),
        }
        assert!(opp.gross_profit_lamports > 10);
        assert!(opp.confidence > 0.0 && opp.confidence <= 1.0);
    }

    #[test]
    fn test_balanced_pools_emit_nothing() {
        let clock = Clock::new();
        let graph = Arc::new(MarketGraph::new(clock));
        let model = Arc::new(SuccessModel::new());
        let (sol, usdc) = (Pubkey::new_unique(), Pubkey::new_unique());

        let a = pool_event("ray", Pubkey::new_unique(), sol, usdc, 10_000_000, 1_000_000_000, 30, 1);
        let b = pool_event("orc", Pubkey::new_unique(), sol, usdc, 10_000_000, 1_000_000_000, 30, 1);
        graph.apply(&a).unwrap();
        graph.apply(&b).unwrap();

        let detector = ArbitrageDetector::new(
            graph,
            model,
            clock,
            ArbitrageConfig {
                min_profit_lamports: 10,
                max_slippage_bps: 500,
                max_hops: 3,
                watchlist: vec![usdc, sol],
                native_token: sol,
            },
        );
        assert!(detector.on_pool_update(&b).is_empty());
    }

    #[test]
    fn test_slippage_bound_rejects_thin_pools() {
        let clock = Clock::new();
        let graph = Arc::new(MarketGraph::new(clock));
        let model = Arc::new(SuccessModel::new());
        let (sol, usdc) = (Pubkey::new_unique(), Pubkey::new_unique());

        // Wildly imbalanced thin pools: profitable but only at high impact.
        let a = pool_event("ray", Pubkey::new_unique(), sol, usdc, 1_000, 100_000, 25, 1);
        let b = pool_event("orc", Pubkey::new_unique(), sol, usdc, 1_000, 150_000, 30, 1);
        graph.apply(&a).unwrap();
        graph.apply(&b).unwrap();

        let detector = ArbitrageDetector::new(
            graph,
            model,
            clock,
            ArbitrageConfig {
                min_profit_lamports: 1,
                max_slippage_bps: 50,
                max_hops: 3,
                watchlist: vec![usdc],
                native_token: sol,
            },
        );
        assert!(detector.on_pool_update(&b).is_empty());
        assert!(detector.stats().rejected_slippage > 0);
    }

    #[test]
    fn test_detected_at_monotone() {
        let clock = Clock::new();
        let graph = Arc::new(MarketGraph::new(clock));
        let model = Arc::new(SuccessModel::new());
        let (sol, usdc) = (Pubkey::new_unique(), Pubkey::new_unique());
        let orc = pool_event("orc", Pubkey::new_unique(), sol, usdc, 10_000_000, 1_020_000_000, 30, 1);
        graph
            .apply(&pool_event("ray", Pubkey::new_unique(), sol, usdc, 10_000_000, 1_002_000_000, 25, 1))
            .unwrap();
        graph.apply(&orc).unwrap();

        let detector = ArbitrageDetector::new(
            graph,
            model,
            clock,
            ArbitrageConfig {
                min_profit_lamports: 10,
                max_slippage_bps: 500,
                max_hops: 3,
                watchlist: vec![usdc],
                native_token: sol,
            },
        );

        let mut last = 0u64;
        for _ in 0..3 {
            for opp in detector.on_pool_update(&orc) {
                assert!(opp.detected_at_ns >= last);
                last = opp.detected_at_ns;
            }
        }
        assert!(last > 0);
    }
}
