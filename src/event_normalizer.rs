//! Decoders from raw chain notifications to typed domain events.
//!
//! One decoder per supported venue program id; decoders are pure functions
//! over the notification payload. Unknown programs and layouts are dropped
//! with a counter increment, never an error. Out-of-order deliveries
//! (decreasing slot for the same account) are dropped the same way.

use borsh::{BorshDeserialize, BorshSerialize};
use parking_lot::Mutex;
use prometheus::IntCounter;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use std::collections::HashMap;
use tracing::debug;

use crate::events::{
    BlockRewardEvent, ChainEvent, LendingPositionEvent, NotificationKind, PoolStateEvent,
    RawNotification, ReserveState, StreamItem, SwapEvent, VenueKind,
};

const TAG_CP_POOL: u8 = 1;
const TAG_CLMM_POOL: u8 = 2;
const TAG_OBLIGATION: u8 = 3;
const TAG_PENDING_SWAP: u8 = 4;
const TAG_BLOCK_META: u8 = 5;

/// Borsh account layout of a constant-product pool.
#[derive(BorshSerialize, BorshDeserialize, Debug, PartialEq)]
pub struct CpPoolLayout {
    pub tag: u8,
    pub token_a: [u8; 32],
    pub token_b: [u8; 32],
    pub reserve_a: u64,
    pub reserve_b: u64,
    pub fee_bps: u32,
}

/// Borsh account layout of a concentrated-liquidity pool.
#[derive(BorshSerialize, BorshDeserialize, Debug, PartialEq)]
pub struct ClmmPoolLayout {
    pub tag: u8,
    pub token_a: [u8; 32],
    pub token_b: [u8; 32],
    pub liquidity: u128,
    pub tick_lower: i32,
    pub tick_upper: i32,
    pub sqrt_price_x64: u128,
    pub fee_bps: u32,
}

/// Borsh account layout of a lending obligation.
#[derive(BorshSerialize, BorshDeserialize, Debug, PartialEq)]
pub struct ObligationLayout {
    pub tag: u8,
    pub owner: [u8; 32],
    pub collateral_mint: [u8; 32],
    pub collateral_amount: u64,
    pub debt_mint: [u8; 32],
    pub debt_amount: u64,
    pub liquidation_threshold_bps: u32,
    pub liquidation_bonus_bps: u32,
    pub close_factor_bps: u32,
}

/// Borsh payload of an observed pending swap instruction.
#[derive(BorshSerialize, BorshDeserialize, Debug, PartialEq)]
pub struct PendingSwapLayout {
    pub tag: u8,
    pub signature: [u8; 64],
    pub owner: [u8; 32],
    pub token_in: [u8; 32],
    pub token_out: [u8; 32],
    pub amount_in: u64,
    pub min_amount_out: u64,
    /// 0 means the swap declared no tolerance.
    pub slippage_bps: u32,
}

/// Borsh payload of a block-meta notification.
#[derive(BorshSerialize, BorshDeserialize, Debug, PartialEq)]
pub struct BlockMetaLayout {
    pub tag: u8,
    pub leader: [u8; 32],
    pub reward_lamports: u64,
}

/// What a registered program id decodes into.
#[derive(Debug, Clone)]
pub enum VenueDecoder {
    ConstantProduct { venue_id: String },
    Concentrated { venue_id: String },
    Lending { protocol: String },
    BlockMeta,
}

pub struct EventNormalizer {
    decoders: HashMap<Pubkey, VenueDecoder>,
    last_slot: Mutex<HashMap<Pubkey, u64>>,
    decode_dropped: IntCounter,
    state_conflicts: IntCounter,
}

impl EventNormalizer {
    pub fn new(
        decoders: HashMap<Pubkey, VenueDecoder>,
        decode_dropped: IntCounter,
        state_conflicts: IntCounter,
    ) -> Self {
        Self {
            decoders,
            last_slot: Mutex::new(HashMap::new()),
            decode_dropped,
            state_conflicts,
        }
    }

    /// Program ids the normalizer understands; the chain subscription
    /// filter is built from these.
    pub fn programs(&self) -> Vec<Pubkey> {
        self.decoders.keys().copied().collect()
    }

    /// Translate one stream item. `None` means dropped (counted).
    pub fn normalize(&self, item: StreamItem) -> Option<ChainEvent> {
        let raw = match item {
            StreamItem::Gap(gap) => {
                // A reconnect invalidates the per-account ordering watermarks.
                self.last_slot.lock().clear();
                return Some(ChainEvent::Gap(gap));
            }
            StreamItem::Notification(raw) => raw,
        };

        {
            let mut last = self.last_slot.lock();
            match last.get(&raw.account) {
                Some(&seen) if raw.slot < seen => {
                    self.state_conflicts.inc();
                    debug!(
                        "Out-of-order update for {} (slot {} < {})",
                        raw.account, raw.slot, seen
                    );
                    return None;
                }
                _ => {
                    last.insert(raw.account, raw.slot);
                }
            }
        }

        let Some(decoder) = self.decoders.get(&raw.program) else {
            self.decode_dropped.inc();
            return None;
        };

        let event = self.decode(decoder, &raw);
        if event.is_none() {
            self.decode_dropped.inc();
        }
        event
    }

    fn decode(&self, decoder: &VenueDecoder, raw: &RawNotification) -> Option<ChainEvent> {
        match (decoder, raw.kind) {
            (VenueDecoder::ConstantProduct { venue_id }, NotificationKind::AccountUpdate) => {
                let layout = CpPoolLayout::try_from_slice(&raw.data).ok()?;
                if layout.tag != TAG_CP_POOL {
                    return None;
                }
                Some(ChainEvent::PoolState(PoolStateEvent {
                    venue: VenueKind::AmmConstantProduct,
                    venue_id: venue_id.clone(),
                    address: raw.account,
                    token_a: Pubkey::new_from_array(layout.token_a),
                    token_b: Pubkey::new_from_array(layout.token_b),
                    fee_bps: layout.fee_bps,
                    reserves: ReserveState::ConstantProduct {
                        reserve_a: layout.reserve_a,
                        reserve_b: layout.reserve_b,
                    },
                    slot: raw.slot,
                }))
            }
            (VenueDecoder::Concentrated { venue_id }, NotificationKind::AccountUpdate) => {
                let layout = ClmmPoolLayout::try_from_slice(&raw.data).ok()?;
                if layout.tag != TAG_CLMM_POOL {
                    return None;
                }
                Some(ChainEvent::PoolState(PoolStateEvent {
                    venue: VenueKind::AmmConcentrated,
                    venue_id: venue_id.clone(),
                    address: raw.account,
                    token_a: Pubkey::new_from_array(layout.token_a),
                    token_b: Pubkey::new_from_array(layout.token_b),
                    fee_bps: layout.fee_bps,
                    reserves: ReserveState::Concentrated {
                        liquidity: layout.liquidity,
                        tick_lower: layout.tick_lower,
                        tick_upper: layout.tick_upper,
                        sqrt_price_x64: layout.sqrt_price_x64,
                    },
                    slot: raw.slot,
                }))
            }
            (VenueDecoder::Lending { protocol }, NotificationKind::AccountUpdate) => {
                let layout = ObligationLayout::try_from_slice(&raw.data).ok()?;
                if layout.tag != TAG_OBLIGATION {
                    return None;
                }
                Some(ChainEvent::Lending(LendingPositionEvent {
                    protocol: protocol.clone(),
                    owner: Pubkey::new_from_array(layout.owner),
                    collateral_token: Pubkey::new_from_array(layout.collateral_mint),
                    collateral_amount: layout.collateral_amount,
                    debt_token: Pubkey::new_from_array(layout.debt_mint),
                    debt_amount: layout.debt_amount,
                    liquidation_threshold_bps: layout.liquidation_threshold_bps,
                    liquidation_bonus_bps: layout.liquidation_bonus_bps,
                    close_factor_bps: layout.close_factor_bps,
                    slot: raw.slot,
                }))
            }
            (
                VenueDecoder::ConstantProduct { venue_id }
                | VenueDecoder::Concentrated { venue_id },
                NotificationKind::PendingTransaction,
            ) => {
                let layout = PendingSwapLayout::try_from_slice(&raw.data).ok()?;
                if layout.tag != TAG_PENDING_SWAP {
                    return None;
                }
                Some(ChainEvent::Swap(SwapEvent {
                    signature: Signature::from(layout.signature).to_string(),
                    venue_id: venue_id.clone(),
                    pool: raw.account,
                    owner: Pubkey::new_from_array(layout.owner),
                    token_in: Pubkey::new_from_array(layout.token_in),
                    token_out: Pubkey::new_from_array(layout.token_out),
                    amount_in: layout.amount_in,
                    min_amount_out: layout.min_amount_out,
                    slippage_tolerance_bps: (layout.slippage_bps > 0)
                        .then_some(layout.slippage_bps),
                    slot: raw.slot,
                    pending: true,
                }))
            }
            (VenueDecoder::BlockMeta, NotificationKind::BlockMeta) => {
                let layout = BlockMetaLayout::try_from_slice(&raw.data).ok()?;
                if layout.tag != TAG_BLOCK_META {
                    return None;
                }
                Some(ChainEvent::BlockReward(BlockRewardEvent {
                    slot: raw.slot,
                    leader: Pubkey::new_from_array(layout.leader),
                    reward_lamports: layout.reward_lamports,
                }))
            }
            _ => None,
        }
    }
}

/// Wire-encoding helpers for the supported layouts. The paper-mode feeder
/// and the test harness build notifications with these.
pub mod wire {
    use super::*;

    pub fn cp_pool(token_a: Pubkey, token_b: Pubkey, reserve_a: u64, reserve_b: u64, fee_bps: u32) -> Vec<u8> {
        CpPoolLayout {
            tag: TAG_CP_POOL,
            token_a: token_a.to_bytes(),
            token_b: token_b.to_bytes(),
            reserve_a,
            reserve_b,
            fee_bps,
        }
        .try_to_vec()
        .expect("borsh encode")
    }

    pub fn clmm_pool(
        token_a: Pubkey,
        token_b: Pubkey,
        liquidity: u128,
        tick_lower: i32,
        tick_upper: i32,
        sqrt_price_x64: u128,
        fee_bps: u32,
    ) -> Vec<u8> {
        ClmmPoolLayout {
            tag: TAG_CLMM_POOL,
            token_a: token_a.to_bytes(),
            token_b: token_b.to_bytes(),
            liquidity,
            tick_lower,
            tick_upper,
            sqrt_price_x64,
            fee_bps,
        }
        .try_to_vec()
        .expect("borsh encode")
    }

    pub fn obligation(
        owner: Pubkey,
        collateral_mint: Pubkey,
        collateral_amount: u64,
        debt_mint: Pubkey,
        debt_amount: u64,
        liquidation_threshold_bps: u32,
        liquidation_bonus_bps: u32,
        close_factor_bps: u32,
    ) -> Vec<u8> {
        ObligationLayout {
            tag: TAG_OBLIGATION,
            owner: owner.to_bytes(),
            collateral_mint: collateral_mint.to_bytes(),
            collateral_amount,
            debt_mint: debt_mint.to_bytes(),
            debt_amount,
            liquidation_threshold_bps,
            liquidation_bonus_bps,
            close_factor_bps,
        }
        .try_to_vec()
        .expect("borsh encode")
    }

    pub fn pending_swap(
        signature: [u8; 64],
        owner: Pubkey,
        token_in: Pubkey,
        token_out: Pubkey,
        amount_in: u64,
        min_amount_out: u64,
        slippage_bps: u32,
    ) -> Vec<u8> {
        PendingSwapLayout {
            tag: TAG_PENDING_SWAP,
            signature,
            owner: owner.to_bytes(),
            token_in: token_in.to_bytes(),
            token_out: token_out.to_bytes(),
            amount_in,
            min_amount_out,
            slippage_bps,
        }
        .try_to_vec()
        .expect("borsh encode")
    }

    pub fn block_meta(leader: Pubkey, reward_lamports: u64) -> Vec<u8> {
        BlockMetaLayout {
            tag: TAG_BLOCK_META,
            leader: leader.to_bytes(),
            reward_lamports,
        }
        .try_to_vec()
        .expect("borsh encode")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::PipelineMetrics;

    fn normalizer() -> (EventNormalizer, Pubkey, Pubkey, PipelineMetrics) {
        let metrics = PipelineMetrics::new().unwrap();
        let cp_program = Pubkey::new_unique();
        let lend_program = Pubkey::new_unique();
        let mut decoders = HashMap::new();
        decoders.insert(
            cp_program,
            VenueDecoder::ConstantProduct {
                venue_id: "ray".into(),
            },
        );
        decoders.insert(
            lend_program,
            VenueDecoder::Lending {
                protocol: "lendx".into(),
            },
        );
        let normalizer = EventNormalizer::new(
            decoders,
            metrics.decode_dropped.clone(),
            metrics.state_conflicts.clone(),
        );
        (normalizer, cp_program, lend_program, metrics)
    }

    fn notification(program: Pubkey, account: Pubkey, slot: u64, data: Vec<u8>, kind: NotificationKind) -> StreamItem {
        StreamItem::Notification(RawNotification {
            program,
            account,
            slot,
            data,
            kind,
        })
    }

    #[test]
    fn test_cp_pool_roundtrip() {
        let (normalizer, cp_program, _, _) = normalizer();
        let (token_a, token_b) = (Pubkey::new_unique(), Pubkey::new_unique());
        let account = Pubkey::new_unique();
        let data = wire::cp_pool(token_a, token_b, 10_000, 1_002_000, 25);

        let event = normalizer
            .normalize(notification(cp_program, account, 7, data, NotificationKind::AccountUpdate))
            .unwrap();
        match event {
            ChainEvent::PoolState(e) => {
                assert_eq!(e.address, account);
                assert_eq!(e.token_a, token_a);
                assert_eq!(e.token_b, token_b);
                assert_eq!(e.fee_bps, 25);
                assert_eq!(e.slot, 7);
                assert_eq!(
                    e.reserves,
                    ReserveState::ConstantProduct {
                        reserve_a: 10_000,
                        reserve_b: 1_002_000
                    }
                );
            }
            other => panic!("wrong event: {:?}", other),
        }
    }

    #[test]
    fn test_obligation_roundtrip() {
        let (normalizer, _, lend_program, _) = normalizer();
        let owner = Pubkey::new_unique();
        let data = wire::obligation(
            owner,
            Pubkey::new_unique(),
            100,
            Pubkey::new_unique(),
            8_200,
            8_000,
            500,
            5_000,
        );
        let event = normalizer
            .normalize(notification(
                lend_program,
                Pubkey::new_unique(),
                3,
                data,
                NotificationKind::AccountUpdate,
            ))
            .unwrap();
        match event {
            ChainEvent::Lending(e) => {
                assert_eq!(e.owner, owner);
                assert_eq!(e.debt_amount, 8_200);
                assert_eq!(e.liquidation_threshold_bps, 8_000);
            }
            other => panic!("wrong event: {:?}", other),
        }
    }

    #[test]
    fn test_clmm_pool_roundtrip() {
        let metrics = PipelineMetrics::new().unwrap();
        let clmm_program = Pubkey::new_unique();
        let mut decoders = HashMap::new();
        decoders.insert(
            clmm_program,
            VenueDecoder::Concentrated {
                venue_id: "orca".into(),
            },
        );
        let normalizer = EventNormalizer::new(
            decoders,
            metrics.decode_dropped.clone(),
            metrics.state_conflicts.clone(),
        );

        let (token_a, token_b) = (Pubkey::new_unique(), Pubkey::new_unique());
        let data = wire::clmm_pool(token_a, token_b, 5_000_000, -100, 100, 1u128 << 64, 30);
        let event = normalizer
            .normalize(notification(
                clmm_program,
                Pubkey::new_unique(),
                9,
                data,
                NotificationKind::AccountUpdate,
            ))
            .unwrap();
        match event {
            ChainEvent::PoolState(e) => {
                assert_eq!(e.venue, VenueKind::AmmConcentrated);
                assert_eq!(
                    e.reserves,
                    ReserveState::Concentrated {
                        liquidity: 5_000_000,
                        tick_lower: -100,
                        tick_upper: 100,
                        sqrt_price_x64: 1u128 << 64,
                    }
                );
            }
            other => panic!("wrong event: {:?}", other),
        }
    }

    #[test]
    fn test_block_meta_roundtrip() {
        let metrics = PipelineMetrics::new().unwrap();
        let vote_program = Pubkey::new_unique();
        let mut decoders = HashMap::new();
        decoders.insert(vote_program, VenueDecoder::BlockMeta);
        let normalizer = EventNormalizer::new(
            decoders,
            metrics.decode_dropped.clone(),
            metrics.state_conflicts.clone(),
        );

        let leader = Pubkey::new_unique();
        let data = wire::block_meta(leader, 12_345);
        let event = normalizer
            .normalize(notification(
                vote_program,
                Pubkey::new_unique(),
                77,
                data,
                NotificationKind::BlockMeta,
            ))
            .unwrap();
        match event {
            ChainEvent::BlockReward(e) => {
                assert_eq!(e.leader, leader);
                assert_eq!(e.reward_lamports, 12_345);
                assert_eq!(e.slot, 77);
            }
            other => panic!("wrong event: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_program_dropped_with_counter() {
        let (normalizer, _, _, metrics) = normalizer();
        let before = metrics.decode_dropped.get();
        let item = notification(
            Pubkey::new_unique(),
            Pubkey::new_unique(),
            1,
            vec![9, 9, 9],
            NotificationKind::AccountUpdate,
        );
        assert!(normalizer.normalize(item).is_none());
        assert_eq!(metrics.decode_dropped.get(), before + 1);
    }

    #[test]
    fn test_out_of_order_dropped() {
        let (normalizer, cp_program, _, metrics) = normalizer();
        let account = Pubkey::new_unique();
        let data = wire::cp_pool(Pubkey::new_unique(), Pubkey::new_unique(), 1, 1, 30);

        assert!(normalizer
            .normalize(notification(cp_program, account, 10, data.clone(), NotificationKind::AccountUpdate))
            .is_some());
        assert!(normalizer
            .normalize(notification(cp_program, account, 9, data.clone(), NotificationKind::AccountUpdate))
            .is_none());
        assert_eq!(metrics.state_conflicts.get(), 1);
        // Equal slot is allowed through.
        assert!(normalizer
            .normalize(notification(cp_program, account, 10, data, NotificationKind::AccountUpdate))
            .is_some());
    }

    #[test]
    fn test_gap_resets_watermarks() {
        let (normalizer, cp_program, _, _) = normalizer();
        let account = Pubkey::new_unique();
        let data = wire::cp_pool(Pubkey::new_unique(), Pubkey::new_unique(), 1, 1, 30);

        normalizer
            .normalize(notification(cp_program, account, 100, data.clone(), NotificationKind::AccountUpdate))
            .unwrap();
        let gap = normalizer
            .normalize(StreamItem::Gap(crate::events::SequenceGap {
                last_good_slot: 100,
                reconnected_at_slot: 50,
            }))
            .unwrap();
        assert!(matches!(gap, ChainEvent::Gap(_)));
        // After the gap, an older slot is acceptable again.
        assert!(normalizer
            .normalize(notification(cp_program, account, 50, data, NotificationKind::AccountUpdate))
            .is_some());
    }

    #[test]
    fn test_pending_swap_tolerance_zero_is_unknown() {
        let (normalizer, cp_program, _, _) = normalizer();
        let data = wire::pending_swap(
            [7u8; 64],
            Pubkey::new_unique(),
            Pubkey::new_unique(),
            Pubkey::new_unique(),
            1_000,
            990,
            0,
        );
        let event = normalizer
            .normalize(notification(
                cp_program,
                Pubkey::new_unique(),
                5,
                data,
                NotificationKind::PendingTransaction,
            ))
            .unwrap();
        match event {
            ChainEvent::Swap(e) => {
                assert!(e.pending);
                assert_eq!(e.slippage_tolerance_bps, None);
            }
            other => panic!("wrong event: {:?}", other),
        }
    }
}
