//! Lending-position health tracking and liquidation detection.
//!
//! Positions are indexed by (protocol, owner) and re-priced on every event
//! and on debounced rescan rounds. A health factor crossing below 1.0 emits
//! immediately; positions that stay liquidatable re-emit once per rescan
//! interval, capped per round to avoid flooding the composer.

use parking_lot::Mutex;
use serde::Serialize;
use solana_sdk::pubkey::Pubkey;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::events::LendingPositionEvent;
use crate::gas_estimator::{self, NetworkContext};
use crate::market_graph::MarketGraph;
use crate::opportunity::{AccountAccess, Opportunity, OpportunityKind};
use crate::risk_assessor::{self, RiskContext};
use crate::venue_math;

/// Where the scanner reads token prices from.
pub trait PriceSource: Send + Sync {
    fn price_usd(&self, token: &Pubkey) -> Option<f64>;
}

/// Prices derived from the market graph: a token is worth its spot rate
/// against the configured USD stable on any venue that pairs them.
pub struct GraphPriceSource {
    graph: Arc<MarketGraph>,
    usd_token: Pubkey,
}

impl GraphPriceSource {
    pub fn new(graph: Arc<MarketGraph>, usd_token: Pubkey) -> Self {
        Self { graph, usd_token }
    }
}

impl PriceSource for GraphPriceSource {
    fn price_usd(&self, token: &Pubkey) -> Option<f64> {
        if *token == self.usd_token {
            return Some(1.0);
        }
        for pool_addr in self.graph.pools_for_token(token) {
            let pool = self.graph.pool(&pool_addr)?;
            let other = if pool.token_a == *token {
                pool.token_b
            } else {
                pool.token_a
            };
            if other == self.usd_token {
                return venue_math::spot_price(&pool.reserves, pool.token_a == *token).ok();
            }
        }
        None
    }
}

#[derive(Debug, Clone)]
pub struct LiquidationConfig {
    pub rescan_interval_ms: u64,
    pub max_liq_per_round: usize,
    pub native_token: Pubkey,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LiquidationStats {
    pub events_processed: u64,
    pub positions_tracked: u64,
    pub positions_removed: u64,
    pub opportunities_emitted: u64,
    pub rounds_scanned: u64,
}

#[derive(Debug, Clone)]
struct TrackedPosition {
    protocol: String,
    owner: Pubkey,
    collateral_token: Pubkey,
    collateral_amount: u64,
    debt_token: Pubkey,
    debt_amount: u64,
    liquidation_threshold_bps: u32,
    liquidation_bonus_bps: u32,
    close_factor_bps: u32,
    last_update_slot: u64,
    /// Health at the previous evaluation; None until first priced.
    last_health: Option<f64>,
    last_emitted_ns: Option<u64>,
}

impl TrackedPosition {
    /// (collateral x price x threshold) / (debt x price x 10000)
    fn health(&self, prices: &dyn PriceSource) -> Option<f64> {
        let collateral_price = prices.price_usd(&self.collateral_token)?;
        let debt_price = prices.price_usd(&self.debt_token)?;
        let debt_value = self.debt_amount as f64 * debt_price;
        if debt_value <= 0.0 {
            return Some(f64::INFINITY);
        }
        let weighted_collateral = self.collateral_amount as f64
            * collateral_price
            * (self.liquidation_threshold_bps as f64 / 10_000.0);
        Some(weighted_collateral / debt_value)
    }

    /// USD profit of liquidating now: repayable debt times the bonus.
    fn profit_usd(&self, prices: &dyn PriceSource) -> Option<f64> {
        let debt_price = prices.price_usd(&self.debt_token)?;
        let repay = self.debt_amount as f64 * (self.close_factor_bps as f64 / 10_000.0);
        Some(repay * debt_price * (self.liquidation_bonus_bps as f64 / 10_000.0))
    }
}

pub struct LiquidationScanner {
    clock: Clock,
    config: LiquidationConfig,
    positions: Mutex<HashMap<(String, Pubkey), TrackedPosition>>,
    network: Mutex<NetworkContext>,
    last_detected_ns: AtomicU64,
    stats: Mutex<LiquidationStats>,
}

impl LiquidationScanner {
    pub fn new(clock: Clock, config: LiquidationConfig) -> Self {
        Self {
            clock,
            config,
            positions: Mutex::new(HashMap::new()),
            network: Mutex::new(NetworkContext::default()),
            last_detected_ns: AtomicU64::new(0),
            stats: Mutex::new(LiquidationStats::default()),
        }
    }

    pub fn stats(&self) -> LiquidationStats {
        let mut stats = self.stats.lock().clone();
        stats.positions_tracked = self.positions.lock().len() as u64;
        stats
    }

    fn next_detected_ns(&self) -> u64 {
        let now = self.clock.now_ns();
        self.last_detected_ns
            .fetch_max(now, Ordering::Relaxed)
            .max(now)
    }

    /// Upsert a position from a chain event. Emits immediately when the
    /// update itself pushes health below 1.
    pub fn on_event(
        &self,
        event: &LendingPositionEvent,
        prices: &dyn PriceSource,
    ) -> Vec<Opportunity> {
        self.stats.lock().events_processed += 1;
        let key = (event.protocol.clone(), event.owner);

        // Fully repaid or zeroed-out positions leave the index.
        if event.debt_amount == 0 || event.owner == Pubkey::default() {
            if self.positions.lock().remove(&key).is_some() {
                self.stats.lock().positions_removed += 1;
                debug!("Position {}/{} closed", event.protocol, event.owner);
            }
            return Vec::new();
        }

        let mut positions = self.positions.lock();
        let position = positions.entry(key).or_insert_with(|| TrackedPosition {
            protocol: event.protocol.clone(),
            owner: event.owner,
            collateral_token: event.collateral_token,
            collateral_amount: 0,
            debt_token: event.debt_token,
            debt_amount: 0,
            liquidation_threshold_bps: 0,
            liquidation_bonus_bps: 0,
            close_factor_bps: 0,
            last_update_slot: 0,
            last_health: None,
            last_emitted_ns: None,
        });
        if event.slot < position.last_update_slot {
            return Vec::new();
        }
        position.collateral_token = event.collateral_token;
        position.collateral_amount = event.collateral_amount;
        position.debt_token = event.debt_token;
        position.debt_amount = event.debt_amount;
        position.liquidation_threshold_bps = event.liquidation_threshold_bps;
        position.liquidation_bonus_bps = event.liquidation_bonus_bps;
        position.close_factor_bps = event.close_factor_bps;
        position.last_update_slot = event.slot;

        let mut position = position.clone();
        drop(positions);

        let emitted = self.evaluate(&mut position, prices, true);
        self.store_back(position);
        emitted.into_iter().collect()
    }

    /// Debounced sweep over every tracked position. Emissions are ranked by
    /// estimated profit and capped per round.
    pub fn rescan_round(&self, prices: &dyn PriceSource) -> Vec<Opportunity> {
        self.stats.lock().rounds_scanned += 1;

        let snapshot: Vec<TrackedPosition> =
            self.positions.lock().values().cloned().collect();

        let mut candidates: Vec<(f64, TrackedPosition)> = Vec::new();
        for mut position in snapshot {
            let Some(health) = position.health(prices) else { continue };
            let crossed = position.last_health.map(|h| h >= 1.0).unwrap_or(true) && health < 1.0;
            let debounce_elapsed = position
                .last_emitted_ns
                .map(|t| self.clock.since_ns(t) >= self.config.rescan_interval_ms * 1_000_000)
                .unwrap_or(true);

            position.last_health = Some(health);
            if health < 1.0 && (crossed || debounce_elapsed) {
                let profit = position.profit_usd(prices).unwrap_or(0.0);
                candidates.push((profit, position));
            } else {
                self.store_back(position);
            }
        }

        // Highest estimated profit first, emission cap per round.
        candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        let mut emitted = Vec::new();
        for (index, (_, mut position)) in candidates.into_iter().enumerate() {
            if index < self.config.max_liq_per_round {
                if let Some(opp) = self.emit(&mut position, prices) {
                    emitted.push(opp);
                }
            }
            self.store_back(position);
        }
        emitted
    }

    /// Re-price one position; emit when it crossed below 1 (or, outside the
    /// debounce window, while it stays below).
    fn evaluate(
        &self,
        position: &mut TrackedPosition,
        prices: &dyn PriceSource,
        from_event: bool,
    ) -> Option<Opportunity> {
        let health = position.health(prices)?;
        let was_healthy = position.last_health.map(|h| h >= 1.0).unwrap_or(true);
        position.last_health = Some(health);

        if health >= 1.0 {
            return None;
        }
        let crossed = was_healthy;
        let debounce_elapsed = position
            .last_emitted_ns
            .map(|t| self.clock.since_ns(t) >= self.config.rescan_interval_ms * 1_000_000)
            .unwrap_or(true);
        if !crossed && !(from_event && debounce_elapsed) {
            return None;
        }
        self.emit(position, prices)
    }

    fn emit(
        &self,
        position: &mut TrackedPosition,
        prices: &dyn PriceSource,
    ) -> Option<Opportunity> {
        let profit_usd = position.profit_usd(prices)?;
        let native_price = prices.price_usd(&self.config.native_token)?;
        if native_price <= 0.0 {
            return None;
        }
        let gross_profit_lamports = (profit_usd / native_price
            * crate::constants::LAMPORTS_PER_SOL as f64) as u64;

        let repay_amount =
            (position.debt_amount as f64 * position.close_factor_bps as f64 / 10_000.0) as u64;
        let collateral_price = prices.price_usd(&position.collateral_token)?;
        let debt_price = prices.price_usd(&position.debt_token)?;
        let seized_value = repay_amount as f64
            * debt_price
            * (1.0 + position.liquidation_bonus_bps as f64 / 10_000.0);
        let collateral_seized = if collateral_price > 0.0 {
            (seized_value / collateral_price) as u64
        } else {
            return None;
        };

        let kind = OpportunityKind::Liquidation {
            protocol: position.protocol.clone(),
            owner: position.owner,
            debt_token: position.debt_token,
            repay_amount,
            collateral_token: position.collateral_token,
            collateral_seized,
        };
        let gas = gas_estimator::estimate(&kind, &self.network.lock());
        let risk = risk_assessor::assess(&kind, &RiskContext::default());

        position.last_emitted_ns = Some(self.clock.now_ns());
        self.stats.lock().opportunities_emitted += 1;

        info!(
            "💧 Liquidation: {}/{} health={:.3} profit≈{} lamports",
            position.protocol,
            position.owner,
            position.last_health.unwrap_or(0.0),
            gross_profit_lamports
        );

        Some(Opportunity {
            id: Opportunity::new_id(),
            detected_at_ns: self.next_detected_ns(),
            gross_profit_lamports,
            estimated_gas_lamports: gas.lamports,
            estimated_tip_lamports: gross_profit_lamports / 10,
            risk_score: risk,
            confidence: 0.8,
            accounts: AccountAccess {
                readable: vec![position.debt_token, position.collateral_token],
                writable: vec![position.owner],
            },
            kind,
        })
    }

    fn store_back(&self, position: TrackedPosition) {
        let key = (position.protocol.clone(), position.owner);
        let mut positions = self.positions.lock();
        // Never clobber a newer concurrent update.
        match positions.get(&key) {
            Some(existing) if existing.last_update_slot > position.last_update_slot => {}
            _ => {
                positions.insert(key, position);
            }
        }
    }
}
