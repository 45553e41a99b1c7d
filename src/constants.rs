/// Global constants for the MEV pipeline
///
/// This module centralizes magic numbers and well-known addresses so the
/// rest of the codebase never hard-codes them inline.
use once_cell::sync::Lazy;
use solana_sdk::pubkey::Pubkey;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// CHAIN CONSTANTS
// ============================================================================

/// 1 SOL = 1 billion lamports
pub const LAMPORTS_PER_SOL: u64 = 1_000_000_000;

/// Convert lamports to SOL (floating point, display only)
pub const fn lamports_to_sol(lamports: u64) -> f64 {
    lamports as f64 / LAMPORTS_PER_SOL as f64
}

/// Convert SOL to lamports
pub const fn sol_to_lamports(sol: f64) -> u64 {
    (sol * LAMPORTS_PER_SOL as f64) as u64
}

/// Slot time (~400ms per slot)
pub const SLOT_TIME_MS: u64 = 400;

/// Per-transaction compute-unit ceiling enforced by the chain
pub const MAX_TX_COMPUTE_UNITS: u32 = 1_400_000;

/// Wrapped native mint (default watchlist entry)
pub static NATIVE_MINT: Lazy<Pubkey> =
    Lazy::new(|| Pubkey::from_str("So11111111111111111111111111111111111111112").unwrap());

/// USD stable mint (default watchlist entry)
pub static USDC_MINT: Lazy<Pubkey> =
    Lazy::new(|| Pubkey::from_str("EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v").unwrap());

/// Program the composer's opportunity transactions invoke
pub static EXECUTOR_PROGRAM: Lazy<Pubkey> =
    Lazy::new(|| Pubkey::new_from_array(*b"mev-pipeline-executor-program\0\0\0"));

// ============================================================================
// BUNDLE COMPOSITION
// ============================================================================

/// Maximum transactions per bundle, tip included
pub const DEFAULT_MAX_BUNDLE_TXS: usize = 5;

/// Aggregate compute-unit ceiling per bundle
pub const DEFAULT_MAX_BUNDLE_COMPUTE: u64 = 7_000_000;

/// Compute-budget padding on top of the gas estimator's point estimate
pub const DEFAULT_SAFETY_MARGIN_BPS: u32 = 1_500;

/// Rebuild attempts after a failed bundle simulation
pub const DEFAULT_MAX_COMPOSE_RETRIES: u32 = 3;

/// Deadline for a single composition pass
pub const COMPOSE_DEADLINE_MS: u64 = 250;

// ============================================================================
// DETECTION THRESHOLDS
// ============================================================================

/// Opportunity cutoff (lamports)
pub const DEFAULT_MIN_PROFIT_LAMPORTS: u64 = 1_000_000;

/// Per-hop slippage bound (basis points)
pub const DEFAULT_MAX_SLIPPAGE_BPS: u32 = 300;

/// Arbitrage cycle length cap
pub const DEFAULT_MAX_HOPS: usize = 4;

/// Liquidation re-emit debounce
pub const DEFAULT_RESCAN_INTERVAL_MS: u64 = 2_000;

/// Liquidation emission cap per scan round
pub const DEFAULT_MAX_LIQ_PER_ROUND: usize = 8;

/// Sandwich floor (USD value of the victim swap)
pub const DEFAULT_MIN_TARGET_VALUE_USD: f64 = 5_000.0;

/// Pool records not updated for this long are evicted
pub const POOL_TTL_MS: u64 = 60_000;

/// Eviction sweep cadence
pub const EVICTION_INTERVAL_MS: u64 = 10_000;

// ============================================================================
// TIP AUCTION
// ============================================================================

/// Tip clamp (lamports)
pub const DEFAULT_MIN_TIP_LAMPORTS: u64 = 10_000;
pub const DEFAULT_MAX_TIP_LAMPORTS: u64 = 5_000_000;

/// Piecewise-linear tip fraction endpoints over competition 0..1
pub const TIP_FRACTION_FLOOR: f64 = 0.05;
pub const TIP_FRACTION_CEIL: f64 = 0.25;

// ============================================================================
// SUBMISSION CLIENT
// ============================================================================

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
pub const DEFAULT_BUNDLE_TTL_SLOTS: u64 = 150;

/// Submission circuit breaker
pub const CIRCUIT_BREAKER_THRESHOLD: u32 = 5;
pub const CIRCUIT_BREAKER_COOLDOWN: Duration = Duration::from_secs(120);

// ============================================================================
// CHAIN CLIENT
// ============================================================================

pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 15_000;
pub const DEFAULT_RECONNECT_BACKOFF_INITIAL_MS: u64 = 250;
pub const DEFAULT_RECONNECT_BACKOFF_MAX_MS: u64 = 30_000;

/// Jitter applied to every backoff delay (±20%)
pub const RECONNECT_JITTER_FACTOR: f64 = 0.2;

/// Transient RPC errors are retried this many times before surfacing
pub const RPC_MAX_RETRIES: u32 = 4;

/// RPC request timeout
pub const RPC_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// QUEUES & LIFECYCLE
// ============================================================================

/// Depth of the detector -> composer opportunity queue
pub const DEFAULT_WORKER_QUEUE_DEPTH: usize = 512;

/// Per-subscriber outbound queue depth in the subscription hub
pub const SUBSCRIBER_QUEUE_DEPTH: usize = 256;

/// Drain grace on shutdown
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 3_000;
