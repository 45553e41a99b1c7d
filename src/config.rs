use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use tracing::info;

use crate::constants::*;

/// Active composition strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Strategy {
    MaximizeProfit,
    Balanced,
    MinimizeRisk,
}

impl Strategy {
    /// Risk ceiling applied when filtering composer candidates (0..10 scale).
    pub fn max_risk_score(&self) -> f64 {
        match self {
            Strategy::MaximizeProfit => 10.0,
            Strategy::Balanced => 7.0,
            Strategy::MinimizeRisk => 4.0,
        }
    }

    /// Minimum confidence required of a candidate.
    pub fn min_confidence(&self) -> f64 {
        match self {
            Strategy::MaximizeProfit => 0.0,
            Strategy::Balanced => 0.3,
            Strategy::MinimizeRisk => 0.6,
        }
    }
}

/// Typed configuration record for the whole pipeline.
///
/// Loaded from a JSON file; unknown keys are rejected at startup. A handful
/// of deployment-specific options may be overridden from the environment
/// after the file is parsed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct PipelineConfig {
    // Bundle composition
    #[serde(default = "d_max_bundle_txs")]
    pub max_bundle_txs: usize,
    #[serde(default = "d_max_bundle_compute")]
    pub max_bundle_compute: u64,
    #[serde(default = "d_safety_margin_bps")]
    pub safety_margin_bps: u32,
    #[serde(default = "d_max_compose_retries")]
    pub max_compose_retries: u32,

    // Opportunity cutoffs
    #[serde(default = "d_min_profit_lamports")]
    pub min_profit_lamports: u64,
    #[serde(default = "d_max_slippage_bps")]
    pub max_slippage_bps: u32,
    #[serde(default = "d_max_hops")]
    pub max_hops: usize,

    // Tip clamp
    #[serde(default = "d_min_tip")]
    pub min_tip: u64,
    #[serde(default = "d_max_tip")]
    pub max_tip: u64,

    // Liquidation scanner
    #[serde(default = "d_rescan_interval_ms")]
    pub rescan_interval_ms: u64,
    #[serde(default = "d_max_liq_per_round")]
    pub max_liq_per_round: usize,

    // Sandwich detector
    #[serde(default = "d_min_target_value_usd")]
    pub min_target_value_usd: f64,
    #[serde(default)]
    pub ethical_mode: bool,

    // Submission client
    #[serde(default = "d_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "d_bundle_ttl_slots")]
    pub bundle_ttl_slots: u64,

    // Chain client
    #[serde(default = "d_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "d_backoff_initial_ms")]
    pub reconnect_backoff_initial_ms: u64,
    #[serde(default = "d_backoff_max_ms")]
    pub reconnect_backoff_max_ms: u64,

    // Lifecycle
    #[serde(default = "d_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default = "d_strategy")]
    pub strategy: Strategy,

    // Endpoints & deployment
    #[serde(default = "d_block_engine_url")]
    pub block_engine_url: String,
    #[serde(default = "d_chain_ws_url")]
    pub chain_ws_url: String,
    #[serde(default = "d_chain_rpc_url")]
    pub chain_rpc_url: String,
    #[serde(default = "d_ledger_path")]
    pub ledger_path: String,
    #[serde(default = "d_hub_bind_addr")]
    pub hub_bind_addr: String,

    /// Tip accounts the terminal bundle transaction may pay (rotated per bundle)
    #[serde(default = "d_tip_accounts")]
    pub tip_accounts: Vec<String>,

    /// Start tokens the arbitrage detector enumerates cycles from
    #[serde(default = "d_watchlist")]
    pub watchlist: Vec<String>,

    #[serde(default = "d_worker_queue_depth")]
    pub worker_queue_depth: usize,
    #[serde(default)]
    pub paper_mode: bool,
}

fn d_max_bundle_txs() -> usize {
    DEFAULT_MAX_BUNDLE_TXS
}
fn d_max_bundle_compute() -> u64 {
    DEFAULT_MAX_BUNDLE_COMPUTE
}
fn d_safety_margin_bps() -> u32 {
    DEFAULT_SAFETY_MARGIN_BPS
}
fn d_max_compose_retries() -> u32 {
    DEFAULT_MAX_COMPOSE_RETRIES
}
fn d_min_profit_lamports() -> u64 {
    DEFAULT_MIN_PROFIT_LAMPORTS
}
fn d_max_slippage_bps() -> u32 {
    DEFAULT_MAX_SLIPPAGE_BPS
}
fn d_max_hops() -> usize {
    DEFAULT_MAX_HOPS
}
fn d_min_tip() -> u64 {
    DEFAULT_MIN_TIP_LAMPORTS
}
fn d_max_tip() -> u64 {
    DEFAULT_MAX_TIP_LAMPORTS
}
fn d_rescan_interval_ms() -> u64 {
    DEFAULT_RESCAN_INTERVAL_MS
}
fn d_max_liq_per_round() -> usize {
    DEFAULT_MAX_LIQ_PER_ROUND
}
fn d_min_target_value_usd() -> f64 {
    DEFAULT_MIN_TARGET_VALUE_USD
}
fn d_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}
fn d_bundle_ttl_slots() -> u64 {
    DEFAULT_BUNDLE_TTL_SLOTS
}
fn d_heartbeat_interval_ms() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_MS
}
fn d_backoff_initial_ms() -> u64 {
    DEFAULT_RECONNECT_BACKOFF_INITIAL_MS
}
fn d_backoff_max_ms() -> u64 {
    DEFAULT_RECONNECT_BACKOFF_MAX_MS
}
fn d_shutdown_grace_ms() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_MS
}
fn d_strategy() -> Strategy {
    Strategy::Balanced
}
fn d_block_engine_url() -> String {
    "https://mainnet.block-engine.example.net".to_string()
}
fn d_chain_ws_url() -> String {
    "wss://api.mainnet.example.net".to_string()
}
fn d_chain_rpc_url() -> String {
    "https://api.mainnet.example.net".to_string()
}
fn d_ledger_path() -> String {
    "data/outcomes.db".to_string()
}
fn d_hub_bind_addr() -> String {
    "127.0.0.1:8900".to_string()
}
fn d_tip_accounts() -> Vec<String> {
    vec![
        "96gYZGLnJYVFmbjzopPSU6QiEV5fGqZNyN9nmNhvrZU5".to_string(),
        "HFqU5x63VTqvQss8hp11i4wVV8bD44PvwucfZ2bU7gRe".to_string(),
        "Cw8CFyM9FkoMi7K7Crf6HNQqf4uEMzpKw6QNghXLvLkY".to_string(),
        "ADaUMid9yfUytqMBgopwjb2DTLSokTSzL1zt6iGPaS49".to_string(),
    ]
}
fn d_watchlist() -> Vec<String> {
    vec![
        NATIVE_MINT.to_string(),
        USDC_MINT.to_string(),
    ]
}
fn d_worker_queue_depth() -> usize {
    DEFAULT_WORKER_QUEUE_DEPTH
}

impl Default for PipelineConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults are total")
    }
}

impl PipelineConfig {
    /// Load configuration from a JSON file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: PipelineConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.apply_env_overrides();
        config.validate()?;
        info!("✅ Config loaded from {}", path.display());
        Ok(config)
    }

    /// Defaults plus environment overrides; used when no config file is given.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = env::var("BLOCK_ENGINE_URL") {
            self.block_engine_url = url;
        }
        if let Ok(url) = env::var("CHAIN_WS_URL") {
            self.chain_ws_url = url;
        }
        if let Ok(url) = env::var("CHAIN_RPC_URL") {
            self.chain_rpc_url = url;
        }
        if let Ok(path) = env::var("LEDGER_PATH") {
            self.ledger_path = path;
        }
        if let Ok(v) = env::var("ETHICAL_MODE") {
            self.ethical_mode = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = env::var("PAPER_MODE") {
            self.paper_mode = v == "1" || v.eq_ignore_ascii_case("true");
        }
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.max_bundle_txs >= 2, "MAX_BUNDLE_TXS must leave room for a tip");
        anyhow::ensure!(self.min_tip <= self.max_tip, "MIN_TIP must not exceed MAX_TIP");
        anyhow::ensure!(self.max_hops >= 2, "MAX_HOPS below 2 cannot form a cycle");
        anyhow::ensure!(!self.tip_accounts.is_empty(), "at least one tip account required");
        anyhow::ensure!(
            self.max_bundle_compute > 0,
            "MAX_BUNDLE_COMPUTE must be positive"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert_eq!(config.max_bundle_txs, 5);
        assert_eq!(config.max_bundle_compute, 7_000_000);
        assert_eq!(config.strategy, Strategy::Balanced);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_key_rejected() {
        let raw = r#"{"MAX_BUNDLE_TXS": 4, "TOTALLY_UNKNOWN": true}"#;
        let parsed: Result<PipelineConfig, _> = serde_json::from_str(raw);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let raw = r#"{"MIN_PROFIT_LAMPORTS": 42, "STRATEGY": "MINIMIZE_RISK"}"#;
        let config: PipelineConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.min_profit_lamports, 42);
        assert_eq!(config.strategy, Strategy::MinimizeRisk);
        assert_eq!(config.max_bundle_txs, 5);
    }

    #[test]
    fn test_tip_clamp_validation() {
        let raw = r#"{"MIN_TIP": 100, "MAX_TIP": 10}"#;
        let config: PipelineConfig = serde_json::from_str(raw).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_strategy_risk_ordering() {
        assert!(Strategy::MaximizeProfit.max_risk_score() > Strategy::Balanced.max_risk_score());
        assert!(Strategy::Balanced.max_risk_score() > Strategy::MinimizeRisk.max_risk_score());
    }
}
