use parking_lot::Mutex;
use serde::Serialize;
use solana_sdk::pubkey::Pubkey;
use std::collections::VecDeque;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::market_graph::PathHop;

/// Accounts a strategy's transactions will touch, split by access mode.
/// The composer's ordering step works off these sets.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AccountAccess {
    pub readable: Vec<Pubkey>,
    pub writable: Vec<Pubkey>,
}

impl AccountAccess {
    /// True when one side writes an account the other touches at all.
    pub fn conflicts_with(&self, other: &AccountAccess) -> bool {
        let touches = |access: &AccountAccess, account: &Pubkey| {
            access.readable.contains(account) || access.writable.contains(account)
        };
        self.writable.iter().any(|a| touches(other, a))
            || other.writable.iter().any(|a| touches(self, a))
    }
}

/// Strategy-specific payload of a detected opportunity.
#[derive(Debug, Clone, Serialize)]
pub enum OpportunityKind {
    Arbitrage {
        path: Vec<PathHop>,
        venue_ids: Vec<String>,
        start_token: Pubkey,
        input_amount: u64,
        expected_output: u64,
    },
    Liquidation {
        protocol: String,
        owner: Pubkey,
        debt_token: Pubkey,
        repay_amount: u64,
        collateral_token: Pubkey,
        collateral_seized: u64,
    },
    Sandwich {
        victim_signature: String,
        pool: Pubkey,
        token_in: Pubkey,
        token_out: Pubkey,
        front_amount: u64,
        back_amount: u64,
    },
}

/// A detected opportunity. Value record, cloned freely between components;
/// estimates are honest even when the opportunity is unprofitable.
#[derive(Debug, Clone, Serialize)]
pub struct Opportunity {
    pub id: String,
    pub detected_at_ns: u64,
    pub gross_profit_lamports: u64,
    pub estimated_gas_lamports: u64,
    pub estimated_tip_lamports: u64,
    /// 0..10
    pub risk_score: f64,
    /// 0..1
    pub confidence: f64,
    pub accounts: AccountAccess,
    pub kind: OpportunityKind,
}

impl Opportunity {
    pub fn new_id() -> String {
        Uuid::new_v4().to_string()
    }

    pub fn kind_label(&self) -> &'static str {
        match self.kind {
            OpportunityKind::Arbitrage { .. } => "arbitrage",
            OpportunityKind::Liquidation { .. } => "liquidation",
            OpportunityKind::Sandwich { .. } => "sandwich",
        }
    }

    /// Gross minus gas and tip estimates. May be negative.
    pub fn net_expected_profit(&self) -> i128 {
        self.gross_profit_lamports as i128
            - self.estimated_gas_lamports as i128
            - self.estimated_tip_lamports as i128
    }
}

/// Bounded detector -> composer queue.
///
/// When full, the lowest-profit *pending* opportunity is dropped (which may
/// be the incoming one) so a burst never displaces the best candidates.
pub struct OpportunityQueue {
    inner: Mutex<VecDeque<Opportunity>>,
    capacity: usize,
    notify: Notify,
}

impl OpportunityQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            notify: Notify::new(),
        }
    }

    /// Enqueue; returns true when a pending opportunity had to be dropped.
    pub fn push(&self, opportunity: Opportunity) -> bool {
        let mut dropped = false;
        {
            let mut queue = self.inner.lock();
            queue.push_back(opportunity);
            if queue.len() > self.capacity {
                let min_idx = queue
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, o)| o.net_expected_profit())
                    .map(|(i, _)| i)
                    .unwrap_or(0);
                queue.remove(min_idx);
                dropped = true;
            }
        }
        self.notify.notify_one();
        dropped
    }

    /// Drain everything currently pending without waiting.
    pub fn try_drain(&self) -> Vec<Opportunity> {
        self.inner.lock().drain(..).collect()
    }

    /// Wait until at least one opportunity is pending, then drain.
    pub async fn recv_batch(&self) -> Vec<Opportunity> {
        loop {
            {
                let mut queue = self.inner.lock();
                if !queue.is_empty() {
                    return queue.drain(..).collect();
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
