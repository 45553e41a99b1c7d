//! Block-engine submission, status polling and tip policy.
//!
//! Bundles are submitted once (time-sensitive detections are not worth
//! retrying), tracked in an in-flight map owned by this client, and advanced
//! to exactly one terminal state by the poller. Terminal transitions feed
//! the success-rate model and the outcome ledger.

use base64::Engine as _;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::bundle_composer::Bundle;
use crate::chain_client::ChainInterface;
use crate::clock::Clock;
use crate::constants::{
    CIRCUIT_BREAKER_COOLDOWN, CIRCUIT_BREAKER_THRESHOLD, SLOT_TIME_MS, TIP_FRACTION_CEIL,
    TIP_FRACTION_FLOOR,
};
use crate::error::PipelineError;
use crate::outcome_ledger::OutcomeLedger;
use crate::success_model::{BundleFeatures, SuccessModel};

/// Advertised inclusion rate of the targeted block builder.
const BUILDER_INCLUSION_RATE: f64 = 0.85;

/// Piecewise-linear map from competition intensity to tip fraction.
/// Calm auctions bid the floor; contested ones approach the ceiling faster
/// than linearly.
pub fn tip_fraction(competition: f64) -> f64 {
    let c = competition.clamp(0.0, 1.0);
    let points: [(f64, f64); 4] = [
        (0.0, TIP_FRACTION_FLOOR),
        (0.5, 0.10),
        (0.8, 0.18),
        (1.0, TIP_FRACTION_CEIL),
    ];
    for window in points.windows(2) {
        let (x0, y0) = window[0];
        let (x1, y1) = window[1];
        if c <= x1 {
            return y0 + (y1 - y0) * (c - x0) / (x1 - x0);
        }
    }
    TIP_FRACTION_CEIL
}

/// Tip for a bundle: fraction of gross scaled by competition, clamped.
pub fn compute_tip(gross_profit: u64, competition: f64, min_tip: u64, max_tip: u64) -> u64 {
    ((gross_profit as f64 * tip_fraction(competition)) as u64).clamp(min_tip, max_tip)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BundleState {
    Pending,
    Landed,
    Failed,
    Expired,
    Rejected,
}

impl BundleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BundleState::Pending => "PENDING",
            BundleState::Landed => "LANDED",
            BundleState::Failed => "FAILED",
            BundleState::Expired => "EXPIRED",
            BundleState::Rejected => "REJECTED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BundleState::Pending)
    }
}

/// Lifecycle record of one submitted bundle. Inserted PENDING, advanced
/// exactly once, frozen thereafter.
#[derive(Debug, Clone, Serialize)]
pub struct SubmissionRecord {
    pub bundle_id: String,
    pub submitted_at_ns: u64,
    pub state: BundleState,
    pub landed_slot: Option<u64>,
    pub observed_latency_ns: Option<u64>,
    pub realized_profit_lamports: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
struct EngineRequest {
    jsonrpc: String,
    id: String,
    method: String,
    params: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
struct EngineResponse {
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<EngineError>,
}

#[derive(Debug, Clone, Deserialize)]
struct EngineError {
    code: i64,
    message: String,
}

struct InFlight {
    record: SubmissionRecord,
    bundle: Bundle,
    engine_id: String,
    submitted_slot: u64,
    features: BundleFeatures,
}

#[derive(Default)]
struct CircuitState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct SubmissionConfig {
    pub block_engine_url: String,
    pub poll_interval_ms: u64,
    pub bundle_ttl_slots: u64,
    pub paper_mode: bool,
}

pub struct SubmissionClient {
    http: reqwest::Client,
    chain: Arc<dyn ChainInterface>,
    model: Arc<SuccessModel>,
    ledger: Arc<OutcomeLedger>,
    clock: Clock,
    config: SubmissionConfig,
    in_flight: Mutex<HashMap<String, InFlight>>,
    completed: Mutex<HashMap<String, SubmissionRecord>>,
    circuit: Mutex<CircuitState>,
}

impl SubmissionClient {
    pub fn new(
        chain: Arc<dyn ChainInterface>,
        model: Arc<SuccessModel>,
        ledger: Arc<OutcomeLedger>,
        clock: Clock,
        config: SubmissionConfig,
    ) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("http client"),
            chain,
            model,
            ledger,
            clock,
            config,
            in_flight: Mutex::new(HashMap::new()),
            completed: Mutex::new(HashMap::new()),
            circuit: Mutex::new(CircuitState::default()),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms.max(1))
    }

    fn features_for(&self, bundle: &Bundle) -> BundleFeatures {
        let venue_rate = if bundle.venue_ids.is_empty() {
            0.5
        } else {
            bundle
                .venue_ids
                .iter()
                .map(|v| self.model.venue_landing_rate(v))
                .sum::<f64>()
                / bundle.venue_ids.len() as f64
        };
        let slot_ns = SLOT_TIME_MS * 1_000_000;
        BundleFeatures {
            bundle_size: bundle.transactions.len(),
            tip_profit_ratio: if bundle.gross_profit_lamports > 0 {
                bundle.tip_lamports as f64 / bundle.gross_profit_lamports as f64
            } else {
                1.0
            },
            venue_landing_rate: venue_rate,
            time_of_slot: (self.clock.now_ns() % slot_ns) as f64 / slot_ns as f64,
            builder_inclusion_rate: BUILDER_INCLUSION_RATE,
        }
    }

    fn circuit_open(&self) -> bool {
        let mut circuit = self.circuit.lock();
        match circuit.open_until {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                circuit.open_until = None;
                circuit.consecutive_failures = 0;
                false
            }
            None => false,
        }
    }

    fn note_outcome(&self, landed: bool) {
        let mut circuit = self.circuit.lock();
        if landed {
            circuit.consecutive_failures = 0;
            return;
        }
        circuit.consecutive_failures += 1;
        if circuit.consecutive_failures >= CIRCUIT_BREAKER_THRESHOLD {
            warn!(
                "🔴 Circuit breaker open after {} consecutive failures",
                circuit.consecutive_failures
            );
            circuit.open_until = Some(Instant::now() + CIRCUIT_BREAKER_COOLDOWN);
        }
    }

    /// Single network submission; records PENDING and returns immediately.
    /// A transport-level failure yields a REJECTED record instead.
    pub async fn submit(&self, bundle: Bundle) -> Result<SubmissionRecord, PipelineError> {
        if self.circuit_open() {
            return Err(PipelineError::SubmissionRejected(
                "submission paused by circuit breaker".into(),
            ));
        }

        let now_ns = self.clock.now_ns();
        let features = self.features_for(&bundle);
        let p_land = self.model.p_land(&features);
        debug!(
            "Submitting bundle {} (p_land={:.3}, tip={})",
            bundle.id, p_land, bundle.tip_lamports
        );

        let engine_id = if self.config.paper_mode {
            bundle.id.clone()
        } else {
            match self.send_bundle(&bundle).await {
                Ok(id) => id,
                Err(e) => {
                    warn!("❌ Bundle {} rejected at submission: {}", bundle.id, e);
                    let record = SubmissionRecord {
                        bundle_id: bundle.id.clone(),
                        submitted_at_ns: now_ns,
                        state: BundleState::Rejected,
                        landed_slot: None,
                        observed_latency_ns: Some(self.clock.since_ns(now_ns)),
                        realized_profit_lamports: None,
                    };
                    self.finalize(record.clone(), &bundle, &features);
                    return Ok(record);
                }
            }
        };

        let record = SubmissionRecord {
            bundle_id: bundle.id.clone(),
            submitted_at_ns: now_ns,
            state: BundleState::Pending,
            landed_slot: None,
            observed_latency_ns: None,
            realized_profit_lamports: None,
        };
        info!(
            "📦 Bundle {} submitted ({} txs, tip {} lamports)",
            bundle.id,
            bundle.transactions.len(),
            bundle.tip_lamports
        );

        self.in_flight.lock().insert(
            bundle.id.clone(),
            InFlight {
                record: record.clone(),
                submitted_slot: self.chain.current_slot(),
                engine_id,
                features,
                bundle,
            },
        );
        Ok(record)
    }

    /// Submit several bundles in parallel, preserving per-bundle outcomes.
    /// A submission refused before the network (circuit breaker open) still
    /// owes its caller a terminal record, so refusals fan out as individual
    /// REJECTED records rather than disappearing from the result.
    pub async fn batch(&self, bundles: Vec<Bundle>) -> Vec<SubmissionRecord> {
        let futures = bundles.into_iter().map(|bundle| async move {
            let fallback = bundle.clone();
            match self.submit(bundle).await {
                Ok(record) => record,
                Err(e) => {
                    warn!("❌ Bundle {} refused in batch: {}", fallback.id, e);
                    let now_ns = self.clock.now_ns();
                    let record = SubmissionRecord {
                        bundle_id: fallback.id.clone(),
                        submitted_at_ns: now_ns,
                        state: BundleState::Rejected,
                        landed_slot: None,
                        observed_latency_ns: Some(self.clock.since_ns(now_ns)),
                        realized_profit_lamports: None,
                    };
                    let features = self.features_for(&fallback);
                    self.finalize(record.clone(), &fallback, &features);
                    record
                }
            }
        });
        futures::future::join_all(futures).await
    }

    /// Latest known record for a bundle. Idempotent once terminal.
    pub fn poll_status(&self, bundle_id: &str) -> Option<SubmissionRecord> {
        if let Some(done) = self.completed.lock().get(bundle_id) {
            return Some(done.clone());
        }
        self.in_flight
            .lock()
            .get(bundle_id)
            .map(|f| f.record.clone())
    }

    /// One poller tick: advance every PENDING bundle that has a terminal
    /// answer (or has outlived its TTL). Returns the transitions.
    pub async fn poll_once(&self) -> Vec<SubmissionRecord> {
        let pending: Vec<(String, String, u64)> = self
            .in_flight
            .lock()
            .values()
            .map(|f| (f.record.bundle_id.clone(), f.engine_id.clone(), f.submitted_slot))
            .collect();
        if pending.is_empty() {
            return Vec::new();
        }

        let current_slot = self.chain.current_slot();
        let statuses = if self.config.paper_mode {
            // Paper bundles land at the first poll.
            pending
                .iter()
                .map(|(id, _, _)| (id.clone(), BundleState::Landed, Some(current_slot)))
                .collect()
        } else {
            self.fetch_statuses(&pending).await
        };

        let mut transitions = Vec::new();
        for (bundle_id, state, landed_slot) in statuses {
            let terminal = match state {
                BundleState::Pending => {
                    let submitted_slot = pending
                        .iter()
                        .find(|(id, _, _)| *id == bundle_id)
                        .map(|(_, _, s)| *s)
                        .unwrap_or(current_slot);
                    if current_slot.saturating_sub(submitted_slot) > self.config.bundle_ttl_slots {
                        BundleState::Expired
                    } else {
                        continue;
                    }
                }
                s => s,
            };

            let Some(mut flight) = self.in_flight.lock().remove(&bundle_id) else {
                continue;
            };
            flight.record.state = terminal;
            flight.record.landed_slot = landed_slot.filter(|_| terminal == BundleState::Landed);
            flight.record.observed_latency_ns =
                Some(self.clock.since_ns(flight.record.submitted_at_ns));
            if terminal == BundleState::Landed {
                flight.record.realized_profit_lamports =
                    Some(flight.bundle.expected_net_profit_lamports as i64);
            }

            info!(
                "{} Bundle {} -> {:?} ({} ms)",
                if terminal == BundleState::Landed { "✅" } else { "❌" },
                bundle_id,
                terminal,
                flight.record.observed_latency_ns.unwrap_or(0) / 1_000_000
            );

            self.finalize(flight.record.clone(), &flight.bundle, &flight.features);
            transitions.push(flight.record);
        }
        transitions
    }

    /// Record a terminal transition everywhere it matters: model, circuit
    /// breaker, ledger, frozen-record map.
    fn finalize(&self, record: SubmissionRecord, bundle: &Bundle, features: &BundleFeatures) {
        let landed = record.state == BundleState::Landed;
        self.model.record(
            features,
            &bundle.venue_ids,
            landed,
            record.observed_latency_ns,
        );
        self.note_outcome(landed);
        if let Err(e) = self.ledger.append(&record, bundle, features) {
            warn!("⚠️  Ledger append failed for {}: {}", record.bundle_id, e);
        }
        self.completed.lock().insert(record.bundle_id.clone(), record);
    }

    async fn send_bundle(&self, bundle: &Bundle) -> Result<String, PipelineError> {
        let encoded: Result<Vec<String>, PipelineError> = bundle
            .transactions
            .iter()
            .map(|tx| {
                let bytes = bincode::serialize(tx)
                    .map_err(|e| PipelineError::Decode(format!("tx serialization: {}", e)))?;
                Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
            })
            .collect();

        let request = EngineRequest {
            jsonrpc: "2.0".to_string(),
            id: bundle.id.clone(),
            method: "sendBundle".to_string(),
            params: serde_json::json!([encoded?]),
        };

        let response = self
            .http
            .post(format!("{}/api/v1/bundles", self.config.block_engine_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| PipelineError::SubmissionRejected(e.to_string()))?;
        if !response.status().is_success() {
            return Err(PipelineError::SubmissionRejected(format!(
                "http {}",
                response.status()
            )));
        }
        let body: EngineResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::SubmissionRejected(e.to_string()))?;
        if let Some(error) = body.error {
            return Err(PipelineError::SubmissionRejected(format!(
                "engine {}: {}",
                error.code, error.message
            )));
        }
        body.result
            .and_then(|r| r.as_str().map(String::from))
            .ok_or_else(|| PipelineError::SubmissionRejected("no bundle id returned".into()))
    }

    async fn fetch_statuses(
        &self,
        pending: &[(String, String, u64)],
    ) -> Vec<(String, BundleState, Option<u64>)> {
        let engine_ids: Vec<String> = pending.iter().map(|(_, e, _)| e.clone()).collect();
        let request = EngineRequest {
            jsonrpc: "2.0".to_string(),
            id: "status".to_string(),
            method: "getBundleStatuses".to_string(),
            params: serde_json::json!([engine_ids]),
        };

        let body: Option<serde_json::Value> = match self
            .http
            .post(format!("{}/api/v1/bundles", self.config.block_engine_url))
            .json(&request)
            .send()
            .await
        {
            Ok(response) => response.json().await.ok(),
            Err(e) => {
                debug!("Status poll failed: {}", e);
                None
            }
        };

        let entries = body
            .as_ref()
            .and_then(|b| b.get("result"))
            .and_then(|r| r.get("value"))
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        pending
            .iter()
            .map(|(bundle_id, engine_id, _)| {
                let entry = entries.iter().find(|e| {
                    e.get("bundle_id").and_then(|i| i.as_str()) == Some(engine_id.as_str())
                });
                let state = match entry
                    .and_then(|e| e.get("status"))
                    .and_then(|s| s.as_str())
                    .unwrap_or("Pending")
                {
                    "Landed" => BundleState::Landed,
                    "Failed" => BundleState::Failed,
                    "Rejected" | "Invalid" => BundleState::Rejected,
                    _ => BundleState::Pending,
                };
                let landed_slot = entry.and_then(|e| e.get("landed_slot")).and_then(|s| s.as_u64());
                (bundle_id.clone(), state, landed_slot)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle_composer::Bundle;
    use crate::chain_client::StaticSimClient;
    use crate::config::Strategy;
    use solana_sdk::pubkey::Pubkey;

    fn bundle(id: &str, gross: u64, tip: u64) -> Bundle {
        Bundle {
            id: id.to_string(),
            transactions: Vec::new(),
            opportunity_ids: vec!["opp-1".into()],
            venue_ids: vec!["ray".into()],
            strategy: Strategy::Balanced,
            gross_profit_lamports: gross,
            expected_net_profit_lamports: gross as i128 - tip as i128,
            gas_budget_lamports: 5_000,
            compute_budget_units: 200_000,
            aggregate_risk: 3.0,
            tip_lamports: tip,
            tip_account: Pubkey::new_unique(),
            composed_at_ns: 0,
        }
    }

    fn client(chain: Arc<StaticSimClient>, ttl_slots: u64) -> SubmissionClient {
        SubmissionClient::new(
            chain,
            Arc::new(SuccessModel::new()),
            Arc::new(OutcomeLedger::in_memory().unwrap()),
            Clock::new(),
            SubmissionConfig {
                block_engine_url: "http://unused.invalid".into(),
                poll_interval_ms: 10,
                bundle_ttl_slots: ttl_slots,
                paper_mode: true,
            },
        )
    }

    #[test]
    fn test_tip_fraction_piecewise() {
        assert!((tip_fraction(0.0) - 0.05).abs() < 1e-9);
        assert!((tip_fraction(0.5) - 0.10).abs() < 1e-9);
        assert!((tip_fraction(1.0) - 0.25).abs() < 1e-9);
        // Monotone between breakpoints.
        let mut last = 0.0;
        for i in 0..=100 {
            let f = tip_fraction(i as f64 / 100.0);
            assert!(f >= last);
            last = f;
        }
    }

    #[test]
    fn test_compute_tip_clamps() {
        assert_eq!(compute_tip(1_000_000, 0.0, 10_000, 100_000), 50_000);
        assert_eq!(compute_tip(10, 0.0, 10_000, 100_000), 10_000);
        assert_eq!(compute_tip(u64::MAX / 2, 1.0, 10_000, 100_000), 100_000);
    }

    #[tokio::test]
    async fn test_submit_then_land_on_first_poll() {
        let chain = Arc::new(StaticSimClient::new(100_000));
        chain.set_slot(50);
        let client = client(chain, 150);

        let record = client.submit(bundle("b-1", 1_000_000, 100_000)).await.unwrap();
        assert_eq!(record.state, BundleState::Pending);

        let transitions = client.poll_once().await;
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].state, BundleState::Landed);
        assert_eq!(transitions[0].landed_slot, Some(50));
        assert!(transitions[0].observed_latency_ns.is_some());

        // Idempotent after the terminal transition.
        let frozen = client.poll_status("b-1").unwrap();
        assert_eq!(frozen.state, BundleState::Landed);
        assert!(client.poll_once().await.is_empty());
        assert_eq!(client.poll_status("b-1").unwrap().state, BundleState::Landed);
    }

    #[tokio::test]
    async fn test_expiry_after_ttl() {
        let chain = Arc::new(StaticSimClient::new(100_000));
        chain.set_slot(100);
        let mut client = client(chain.clone(), 10);

        // Paper submit parks the bundle PENDING in the in-flight map.
        client.submit(bundle("b-ttl", 1_000_000, 100_000)).await.unwrap();
        // Polls now go to the (unreachable) engine: no terminal status.
        client.config.paper_mode = false;
        assert!(client.poll_once().await.is_empty());

        chain.set_slot(111);
        let transitions = client.poll_once().await;
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].state, BundleState::Expired);
        assert_eq!(transitions[0].landed_slot, None);
    }

    #[tokio::test]
    async fn test_batch_preserves_per_bundle_outcomes() {
        let chain = Arc::new(StaticSimClient::new(100_000));
        let client = client(chain, 150);
        let records = client
            .batch(vec![bundle("b-a", 1_000_000, 100_000), bundle("b-b", 2_000_000, 150_000)])
            .await;
        assert_eq!(records.len(), 2);
        let transitions = client.poll_once().await;
        assert_eq!(transitions.len(), 2);
        assert!(transitions.iter().all(|r| r.state == BundleState::Landed));
    }

    #[tokio::test]
    async fn test_circuit_breaker_opens_after_failures() {
        let chain = Arc::new(StaticSimClient::new(100_000));
        let mut client = client(chain, 150);
        // Unreachable engine: every submission comes back REJECTED.
        client.config.paper_mode = false;

        for i in 0..CIRCUIT_BREAKER_THRESHOLD {
            let record = client
                .submit(bundle(&format!("b-{}", i), 1_000_000, 100_000))
                .await
                .unwrap();
            assert_eq!(record.state, BundleState::Rejected);
        }

        let err = client.submit(bundle("b-blocked", 1_000_000, 100_000)).await;
        assert!(matches!(err, Err(PipelineError::SubmissionRejected(_))));
    }

    #[tokio::test]
    async fn test_batch_with_open_circuit_fans_out_rejected_records() {
        let chain = Arc::new(StaticSimClient::new(100_000));
        let mut client = client(chain, 150);
        // Unreachable engine: drive the circuit breaker open.
        client.config.paper_mode = false;
        for i in 0..CIRCUIT_BREAKER_THRESHOLD {
            client
                .submit(bundle(&format!("warm-{}", i), 1_000_000, 100_000))
                .await
                .unwrap();
        }

        // Circuit is open; every batch entry is refused before the network,
        // yet each bundle still gets exactly one terminal record.
        client.config.paper_mode = true;
        let records = client
            .batch(vec![
                bundle("batch-a", 1_000_000, 100_000),
                bundle("batch-b", 2_000_000, 150_000),
                bundle("batch-c", 3_000_000, 200_000),
            ])
            .await;
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.state == BundleState::Rejected));

        for id in ["batch-a", "batch-b", "batch-c"] {
            assert_eq!(client.poll_status(id).unwrap().state, BundleState::Rejected);
        }
        assert!(client.poll_once().await.is_empty());
    }
}
