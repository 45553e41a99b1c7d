use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;

/// A token as the pipeline sees it: 32-byte mint plus display metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub mint: Pubkey,
    pub decimals: u8,
    pub symbol: String,
}

impl Token {
    pub fn new(mint: Pubkey, decimals: u8, symbol: impl Into<String>) -> Self {
        debug_assert!(decimals <= 18);
        Self {
            mint,
            decimals,
            symbol: symbol.into(),
        }
    }
}

/// Venue families the pipeline understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VenueKind {
    AmmConstantProduct,
    AmmConcentrated,
    Orderbook,
    LendingProtocol,
}

/// Liquidity shape of a pool as reported on-chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveState {
    ConstantProduct {
        reserve_a: u64,
        reserve_b: u64,
    },
    Concentrated {
        liquidity: u128,
        tick_lower: i32,
        tick_upper: i32,
        sqrt_price_x64: u128,
    },
}

/// Raw push-stream payload before decoding.
#[derive(Debug, Clone)]
pub struct RawNotification {
    pub program: Pubkey,
    pub account: Pubkey,
    pub slot: u64,
    pub data: Vec<u8>,
    pub kind: NotificationKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    AccountUpdate,
    PendingTransaction,
    BlockMeta,
}

/// Reconnection marker injected into the stream; downstream detectors treat
/// it as a cache-invalidation hint for affected accounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceGap {
    pub last_good_slot: u64,
    pub reconnected_at_slot: u64,
}

/// What the chain client hands to the normalizer.
#[derive(Debug, Clone)]
pub enum StreamItem {
    Notification(RawNotification),
    Gap(SequenceGap),
}

/// A swap observed on a venue. `pending` marks mempool swaps that have not
/// landed yet (the sandwich detector's input).
#[derive(Debug, Clone)]
pub struct SwapEvent {
    pub signature: String,
    pub venue_id: String,
    pub pool: Pubkey,
    pub owner: Pubkey,
    pub token_in: Pubkey,
    pub token_out: Pubkey,
    pub amount_in: u64,
    pub min_amount_out: u64,
    /// Victim-declared tolerance; None when the swap does not carry one.
    pub slippage_tolerance_bps: Option<u32>,
    pub slot: u64,
    pub pending: bool,
}

/// Pool reserves changed (or a pool was seen for the first time).
#[derive(Debug, Clone)]
pub struct PoolStateEvent {
    pub venue: VenueKind,
    pub venue_id: String,
    pub address: Pubkey,
    pub token_a: Pubkey,
    pub token_b: Pubkey,
    pub fee_bps: u32,
    pub reserves: ReserveState,
    pub slot: u64,
}

/// Lending obligation changed.
#[derive(Debug, Clone)]
pub struct LendingPositionEvent {
    pub protocol: String,
    pub owner: Pubkey,
    pub collateral_token: Pubkey,
    pub collateral_amount: u64,
    pub debt_token: Pubkey,
    pub debt_amount: u64,
    pub liquidation_threshold_bps: u32,
    pub liquidation_bonus_bps: u32,
    pub close_factor_bps: u32,
    pub slot: u64,
}

/// Block reward notification, used as a slot heartbeat and for the
/// success-rate model's time-of-slot feature.
#[derive(Debug, Clone)]
pub struct BlockRewardEvent {
    pub slot: u64,
    pub leader: Pubkey,
    pub reward_lamports: u64,
}

/// Typed domain event after normalization.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    Swap(SwapEvent),
    PoolState(PoolStateEvent),
    Lending(LendingPositionEvent),
    BlockReward(BlockRewardEvent),
    Gap(SequenceGap),
}

impl ChainEvent {
    pub fn slot(&self) -> u64 {
        match self {
            ChainEvent::Swap(e) => e.slot,
            ChainEvent::PoolState(e) => e.slot,
            ChainEvent::Lending(e) => e.slot,
            ChainEvent::BlockReward(e) => e.slot,
            ChainEvent::Gap(g) => g.reconnected_at_slot,
        }
    }
}
