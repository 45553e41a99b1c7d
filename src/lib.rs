//! Real-time MEV detection, bundle composition and submission pipeline
//!
//! This library provides:
//! - A reconnecting chain client with typed event normalization
//! - A market graph with cross-venue price and path queries
//! - Arbitrage, liquidation and sandwich opportunity detectors
//! - An ordering- and budget-aware bundle composer
//! - A block-engine submission client with an online success-rate model
//! - A topic-indexed subscription hub for push delivery to clients

pub mod arbitrage_detector;
pub mod bundle_composer;
pub mod chain_client;
pub mod clock;
pub mod config;
pub mod constants;
pub mod coordinator;
pub mod error;
pub mod event_normalizer;
pub mod events;
pub mod gas_estimator;
pub mod liquidation_scanner;
pub mod market_graph;
pub mod metrics;
pub mod opportunity;
pub mod outcome_ledger;
pub mod risk_assessor;
pub mod sandwich_detector;
pub mod submission_client;
pub mod subscription_hub;
pub mod success_model;
pub mod venue_math;

// Re-export main types for convenience
pub use arbitrage_detector::{ArbitrageConfig, ArbitrageDetector, ArbitrageStats};
pub use bundle_composer::{Bundle, BundleComposer, ComposerConfig, ComposerStats};
pub use chain_client::{
    ChainInterface, HealthSnapshot, SimulationResult, StaticSimClient, SubscriptionFilter,
    TxSimulation, WsChainClient,
};
pub use clock::Clock;
pub use config::{PipelineConfig, Strategy};
pub use coordinator::Core;
pub use error::{AbandonReason, PipelineError};
pub use event_normalizer::{EventNormalizer, VenueDecoder};
pub use events::{
    BlockRewardEvent, ChainEvent, LendingPositionEvent, NotificationKind, PoolStateEvent,
    RawNotification, ReserveState, SequenceGap, StreamItem, SwapEvent, Token, VenueKind,
};
pub use liquidation_scanner::{
    GraphPriceSource, LiquidationConfig, LiquidationScanner, LiquidationStats, PriceSource,
};
pub use market_graph::{MarketGraph, PathHop, Pool};
pub use metrics::PipelineMetrics;
pub use opportunity::{AccountAccess, Opportunity, OpportunityKind, OpportunityQueue};
pub use outcome_ledger::{LedgerReport, OutcomeLedger};
pub use sandwich_detector::{SandwichConfig, SandwichDetector, SandwichStats};
pub use submission_client::{
    compute_tip, tip_fraction, BundleState, SubmissionClient, SubmissionConfig, SubmissionRecord,
};
pub use subscription_hub::{
    ControlFrame, Envelope, SubscriptionHandle, SubscriptionHub, Topic, TopicFilter,
};
pub use success_model::{BundleFeatures, SuccessModel};
