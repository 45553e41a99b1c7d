//! Authoritative in-process view of pool state across venues.
//!
//! Pool records are owned exclusively by the graph and updated under
//! per-pool locks, so readers stay concurrent while a single writer applies
//! events. Whole-graph mutation (eviction) takes the map lock one pool at a
//! time and never holds it across more than one record's worth of work.

use parking_lot::RwLock;
use solana_sdk::pubkey::Pubkey;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::clock::Clock;
use crate::error::PipelineError;
use crate::events::{PoolStateEvent, ReserveState, VenueKind};
use crate::venue_math::{self, CycleHop};

/// A pool as the graph stores it.
#[derive(Debug, Clone)]
pub struct Pool {
    pub venue: VenueKind,
    pub venue_id: String,
    pub address: Pubkey,
    pub token_a: Pubkey,
    pub token_b: Pubkey,
    pub fee_bps: u32,
    pub reserves: ReserveState,
    pub last_update_slot: u64,
    pub last_seen_ns: u64,
}

#[derive(Debug, Clone, Copy)]
struct Edge {
    pool: Pubkey,
    other: Pubkey,
}

#[derive(Default)]
struct GraphInner {
    pools: HashMap<Pubkey, Arc<RwLock<Pool>>>,
    /// token -> outgoing edges
    adjacency: HashMap<Pubkey, Vec<Edge>>,
    /// (venue_id, ordered pair) -> pool address
    pair_index: HashMap<(String, Pubkey, Pubkey), Pubkey>,
}

pub struct MarketGraph {
    clock: Clock,
    inner: RwLock<GraphInner>,
}

/// One hop of an enumerated path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PathHop {
    pub pool: Pubkey,
    pub token_in: Pubkey,
    pub token_out: Pubkey,
}

fn ordered_pair(a: Pubkey, b: Pubkey) -> (Pubkey, Pubkey) {
    if a.to_bytes() <= b.to_bytes() {
        (a, b)
    } else {
        (b, a)
    }
}

impl MarketGraph {
    pub fn new(clock: Clock) -> Self {
        Self {
            clock,
            inner: RwLock::new(GraphInner::default()),
        }
    }

    /// Upsert pool state. Events older than the stored slot are rejected so
    /// the stored slot is always the maximum observed for that pool.
    pub fn apply(&self, event: &PoolStateEvent) -> Result<(), PipelineError> {
        let now_ns = self.clock.now_ns();

        {
            let inner = self.inner.read();
            if let Some(pool) = inner.pools.get(&event.address) {
                let mut pool = pool.write();
                if event.slot < pool.last_update_slot {
                    return Err(PipelineError::StateConflict {
                        entity: event.address.to_string(),
                        event_slot: event.slot,
                        current_slot: pool.last_update_slot,
                    });
                }
                pool.reserves = event.reserves;
                pool.fee_bps = event.fee_bps;
                pool.last_update_slot = event.slot;
                pool.last_seen_ns = now_ns;
                return Ok(());
            }
        }

        let mut inner = self.inner.write();
        // Somebody may have inserted the pool between the locks.
        if let Some(pool) = inner.pools.get(&event.address) {
            let mut pool = pool.write();
            if event.slot < pool.last_update_slot {
                return Err(PipelineError::StateConflict {
                    entity: event.address.to_string(),
                    event_slot: event.slot,
                    current_slot: pool.last_update_slot,
                });
            }
            pool.reserves = event.reserves;
            pool.fee_bps = event.fee_bps;
            pool.last_update_slot = event.slot;
            pool.last_seen_ns = now_ns;
            return Ok(());
        }

        let pool = Pool {
            venue: event.venue,
            venue_id: event.venue_id.clone(),
            address: event.address,
            token_a: event.token_a,
            token_b: event.token_b,
            fee_bps: event.fee_bps,
            reserves: event.reserves,
            last_update_slot: event.slot,
            last_seen_ns: now_ns,
        };
        debug!("Tracking new pool {} on {}", event.address, event.venue_id);

        inner
            .adjacency
            .entry(event.token_a)
            .or_default()
            .push(Edge {
                pool: event.address,
                other: event.token_b,
            });
        inner
            .adjacency
            .entry(event.token_b)
            .or_default()
            .push(Edge {
                pool: event.address,
                other: event.token_a,
            });
        let pair = ordered_pair(event.token_a, event.token_b);
        inner
            .pair_index
            .insert((event.venue_id.clone(), pair.0, pair.1), event.address);
        inner
            .pools
            .insert(event.address, Arc::new(RwLock::new(pool)));
        Ok(())
    }

    /// Constant-time marginal price of `token_in -> token_out` on a venue.
    pub fn price_at(
        &self,
        venue_id: &str,
        token_in: Pubkey,
        token_out: Pubkey,
    ) -> Option<f64> {
        let inner = self.inner.read();
        let pair = ordered_pair(token_in, token_out);
        let address = inner
            .pair_index
            .get(&(venue_id.to_string(), pair.0, pair.1))?;
        let pool = inner.pools.get(address)?.read();
        venue_math::spot_price(&pool.reserves, token_in == pool.token_a).ok()
    }

    /// Whole-record snapshot of a pool, internally consistent.
    pub fn pool(&self, address: &Pubkey) -> Option<Pool> {
        let inner = self.inner.read();
        inner.pools.get(address).map(|p| p.read().clone())
    }

    /// Addresses of every pool with `token` on either side.
    pub fn pools_for_token(&self, token: &Pubkey) -> Vec<Pubkey> {
        let inner = self.inner.read();
        inner
            .adjacency
            .get(token)
            .map(|edges| edges.iter().map(|e| e.pool).collect())
            .unwrap_or_default()
    }

    pub fn pool_count(&self) -> usize {
        self.inner.read().pools.len()
    }

    /// Lazy enumeration of simple cycles starting and ending at
    /// `start_token` with at most `max_hops` edges.
    pub fn find_paths(&self, start_token: Pubkey, max_hops: usize) -> PathIter {
        let inner = self.inner.read();
        PathIter::new(inner.adjacency.clone(), start_token, max_hops)
    }

    /// Materialize a path into oriented hops the swap math can evaluate.
    pub fn cycle_hops(&self, path: &[PathHop]) -> Option<Vec<CycleHop>> {
        let inner = self.inner.read();
        let mut hops = Vec::with_capacity(path.len());
        for hop in path {
            let pool = inner.pools.get(&hop.pool)?.read();
            hops.push(CycleHop {
                reserves: pool.reserves,
                a_to_b: hop.token_in == pool.token_a,
                fee_bps: pool.fee_bps,
            });
        }
        Some(hops)
    }

    /// Venue ids along a path, for tie-breaking and logging.
    pub fn venue_ids(&self, path: &[PathHop]) -> Vec<String> {
        let inner = self.inner.read();
        path.iter()
            .filter_map(|hop| inner.pools.get(&hop.pool).map(|p| p.read().venue_id.clone()))
            .collect()
    }

    /// Remove pools not seen since `before_ns`. Returns how many went away.
    pub fn evict_stale(&self, before_ns: u64) -> usize {
        let stale: Vec<Pubkey> = {
            let inner = self.inner.read();
            inner
                .pools
                .iter()
                .filter(|(_, pool)| pool.read().last_seen_ns < before_ns)
                .map(|(address, _)| *address)
                .collect()
        };

        let mut evicted = 0;
        for address in stale {
            let mut inner = self.inner.write();
            let still_stale = inner
                .pools
                .get(&address)
                .map(|pool| pool.read().last_seen_ns < before_ns)
                .unwrap_or(false);
            if !still_stale {
                continue;
            }
            if let Some(pool) = inner.pools.remove(&address) {
                let pool = pool.read();
                for token in [pool.token_a, pool.token_b] {
                    if let Some(edges) = inner.adjacency.get_mut(&token) {
                        edges.retain(|edge| edge.pool != address);
                        if edges.is_empty() {
                            inner.adjacency.remove(&token);
                        }
                    }
                }
                let pair = ordered_pair(pool.token_a, pool.token_b);
                inner
                    .pair_index
                    .remove(&(pool.venue_id.clone(), pair.0, pair.1));
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!("Evicted {} stale pools", evicted);
        }
        evicted
    }
}

struct Frame {
    token: Pubkey,
    next_edge: usize,
}

/// Depth-first cycle iterator over an adjacency snapshot. Lazy: the caller
/// stops pulling when it has enough candidates.
pub struct PathIter {
    adjacency: HashMap<Pubkey, Vec<Edge>>,
    start: Pubkey,
    max_hops: usize,
    stack: Vec<Frame>,
    path: Vec<PathHop>,
}

impl PathIter {
    fn new(adjacency: HashMap<Pubkey, Vec<Edge>>, start: Pubkey, max_hops: usize) -> Self {
        Self {
            adjacency,
            start,
            max_hops,
            stack: vec![Frame {
                token: start,
                next_edge: 0,
            }],
            path: Vec::new(),
        }
    }

    fn pool_used(&self, pool: &Pubkey) -> bool {
        self.path.iter().any(|hop| hop.pool == *pool)
    }

    fn token_visited(&self, token: &Pubkey) -> bool {
        self.path.iter().any(|hop| hop.token_out == *token)
    }
}

impl Iterator for PathIter {
    type Item = Vec<PathHop>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let frame = self.stack.last_mut()?;
            let token = frame.token;
            let edge = match self.adjacency.get(&token).and_then(|e| e.get(frame.next_edge)) {
                Some(edge) => {
                    let edge = *edge;
                    frame.next_edge += 1;
                    edge
                }
                None => {
                    self.stack.pop();
                    self.path.pop();
                    continue;
                }
            };

            if self.pool_used(&edge.pool) {
                continue;
            }
            let hop = PathHop {
                pool: edge.pool,
                token_in: token,
                token_out: edge.other,
            };

            if edge.other == self.start {
                if self.path.len() + 1 >= 2 {
                    let mut cycle = self.path.clone();
                    cycle.push(hop);
                    return Some(cycle);
                }
                continue;
            }

            if self.path.len() + 1 < self.max_hops && !self.token_visited(&edge.other) {
                self.path.push(hop);
                self.stack.push(Frame {
                    token: edge.other,
                    next_edge: 0,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn test_apply_keeps_max_slot() {
        let graph = MarketGraph::new(Clock::new());
        let addr = Pubkey::new_unique();
        let (a, b) = (Pubkey::new_unique(), Pubkey::new_unique());

        graph.apply(&pool_event("ray", addr, a, b, 100, 200, 25, 10)).unwrap();
        graph.apply(&pool_event("ray", addr, a, b, 110, 190, 25, 12)).unwrap();
        let err = graph.apply(&pool_event("ray", addr, a, b, 90, 220, 25, 11));
        assert!(matches!(err, Err(PipelineError::StateConflict { .. })));
        assert_eq!(graph.pool(&addr).unwrap().last_update_slot, 12);
        match graph.pool(&addr).unwrap().reserves {
            ReserveState::ConstantProduct { reserve_a, .. } => assert_eq!(reserve_a, 110),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_price_at_orientation() {
        let graph = MarketGraph::new(Clock::new());
        let addr = Pubkey::new_unique();
        let (sol, usdc) = (Pubkey::new_unique(), Pubkey::new_unique());
        graph
            .apply(&pool_event("ray", addr, sol, usdc, 10_000, 1_000_000, 25, 1))
            .unwrap();

        let sol_price = graph.price_at("ray", sol, usdc).unwrap();
        let usdc_price = graph.price_at("ray", usdc, sol).unwrap();
        assert!((sol_price - 100.0).abs() < 1e-9);
        assert!((usdc_price - 0.01).abs() < 1e-9);
        assert!(graph.price_at("orc", sol, usdc).is_none());
    }

    #[test]
    fn test_find_paths_two_pool_cycle() {
        let graph = MarketGraph::new(Clock::new());
        let (sol, usdc) = (Pubkey::new_unique(), Pubkey::new_unique());
        let (p1, p2) = (Pubkey::new_unique(), Pubkey::new_unique());
        graph
            .apply(&pool_event("ray", p1, sol, usdc, 10_000, 1_002_000, 25, 1))
            .unwrap();
        graph
            .apply(&pool_event("orc", p2, sol, usdc, 10_000, 1_020_000, 30, 1))
            .unwrap();

        let cycles: Vec<_> = graph.find_paths(usdc, 3).collect();
        // Two orientations of the same two-pool loop.
        assert_eq!(cycles.len(), 2);
        for cycle in &cycles {
            assert_eq!(cycle.len(), 2);
            assert_eq!(cycle.first().unwrap().token_in, usdc);
            assert_eq!(cycle.last().unwrap().token_out, usdc);
            assert_ne!(cycle[0].pool, cycle[1].pool);
        }
    }

    #[test]
    fn test_find_paths_is_lazy_and_bounded() {
        let graph = MarketGraph::new(Clock::new());
        let tokens: Vec<Pubkey> = (0..6).map(|_| Pubkey::new_unique()).collect();
        for i in 0..tokens.len() {
            for j in (i + 1)..tokens.len() {
                graph
                    .apply(&pool_event(
                        "ray",
                        Pubkey::new_unique(),
                        tokens[i],
                        tokens[j],
                        1_000_000,
                        1_000_000,
                        30,
                        1,
                    ))
                    .unwrap();
            }
        }
        let mut iter = graph.find_paths(tokens[0], 4);
        for _ in 0..5 {
            let cycle = iter.next().unwrap();
            assert!(cycle.len() <= 4);
        }
    }

    #[test]
    fn test_evict_stale_spares_fresh_pools() {
        let clock = Clock::new();
        let graph = MarketGraph::new(clock);
        let addr_old = Pubkey::new_unique();
        let addr_new = Pubkey::new_unique();
        let (a, b, c) = (Pubkey::new_unique(), Pubkey::new_unique(), Pubkey::new_unique());

        graph.apply(&pool_event("ray", addr_old, a, b, 1, 1, 30, 1)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let cutoff = clock.now_ns();
        std::thread::sleep(std::time::Duration::from_millis(2));
        graph.apply(&pool_event("orc", addr_new, a, c, 1, 1, 30, 1)).unwrap();

        assert_eq!(graph.evict_stale(cutoff), 1);
        assert!(graph.pool(&addr_old).is_none());
        assert!(graph.pool(&addr_new).is_some());
        assert_eq!(graph.pools_for_token(&b).len(), 0);
        assert_eq!(graph.pools_for_token(&a).len(), 1);
    }
}
