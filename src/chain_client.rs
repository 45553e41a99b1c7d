//! Durable chain connectivity: a reconnecting push stream of raw
//! notifications plus an on-demand simulate/health interface.
//!
//! Consumers observe reconnection as a `SequenceGap` in the stream and treat
//! it as a cache-invalidation hint. Transient RPC faults are retried
//! internally; persistent ones surface as `ChainUnavailable`.

use async_trait::async_trait;
use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::transaction::Transaction;
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::constants::{RECONNECT_JITTER_FACTOR, RPC_MAX_RETRIES, RPC_TIMEOUT};
use crate::error::PipelineError;
use crate::events::{NotificationKind, RawNotification, SequenceGap, StreamItem};

/// Program ids and commitment the push subscription covers.
#[derive(Debug, Clone)]
pub struct SubscriptionFilter {
    pub programs: Vec<Pubkey>,
    pub commitment: String,
}

/// Per-transaction simulation outcome.
#[derive(Debug, Clone)]
pub struct TxSimulation {
    pub success: bool,
    pub logs: Vec<String>,
    pub compute_units: u64,
    pub balance_deltas: Vec<(Pubkey, i64)>,
    pub error: Option<String>,
}

/// Whole-bundle simulation outcome.
#[derive(Debug, Clone, Default)]
pub struct SimulationResult {
    pub transactions: Vec<TxSimulation>,
}

impl SimulationResult {
    /// Index and reason of the first failing position, if any.
    pub fn first_failure(&self) -> Option<(usize, String)> {
        self.transactions.iter().enumerate().find_map(|(i, tx)| {
            if tx.success {
                None
            } else {
                Some((i, tx.error.clone().unwrap_or_else(|| "unknown".into())))
            }
        })
    }

    pub fn total_compute_units(&self) -> u64 {
        self.transactions.iter().map(|t| t.compute_units).sum()
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct HealthSnapshot {
    pub connected: bool,
    pub last_slot: u64,
    pub reconnects: u64,
}

/// Read/simulate seam between the pipeline and the chain endpoint.
#[async_trait]
pub trait ChainInterface: Send + Sync {
    async fn simulate_bundle(
        &self,
        transactions: &[Transaction],
    ) -> Result<SimulationResult, PipelineError>;

    fn current_slot(&self) -> u64;

    fn health(&self) -> HealthSnapshot;
}

#[derive(Default)]
struct ConnectionState {
    connected: AtomicBool,
    last_slot: AtomicU64,
    reconnects: AtomicU64,
}

/// Production client: WebSocket push stream + HTTP JSON-RPC requests.
pub struct WsChainClient {
    ws_url: String,
    rpc_url: String,
    http: reqwest::Client,
    heartbeat_interval: Duration,
    backoff_initial: Duration,
    backoff_max: Duration,
    state: Arc<ConnectionState>,
}

#[derive(Debug, Deserialize)]
struct WireNotification {
    program: String,
    account: String,
    slot: u64,
    kind: String,
    #[serde(default)]
    data: String,
}

fn jittered(delay: Duration) -> Duration {
    let jitter = 1.0 + RECONNECT_JITTER_FACTOR * (fastrand::f64() * 2.0 - 1.0);
    Duration::from_millis((delay.as_millis() as f64 * jitter) as u64)
}

impl WsChainClient {
    pub fn new(
        ws_url: String,
        rpc_url: String,
        heartbeat_interval_ms: u64,
        backoff_initial_ms: u64,
        backoff_max_ms: u64,
    ) -> Self {
        Self {
            ws_url,
            rpc_url,
            http: reqwest::Client::builder()
                .timeout(RPC_TIMEOUT)
                .build()
                .expect("http client"),
            heartbeat_interval: Duration::from_millis(heartbeat_interval_ms.max(1)),
            backoff_initial: Duration::from_millis(backoff_initial_ms.max(1)),
            backoff_max: Duration::from_millis(backoff_max_ms.max(1)),
            state: Arc::new(ConnectionState::default()),
        }
    }

    /// Open the push stream. Lazy, infinite, restartable: the returned
    /// receiver survives reconnections, which show up as gap markers.
    pub fn subscribe(
        &self,
        filter: SubscriptionFilter,
        queue_depth: usize,
        mut shutdown: watch::Receiver<bool>,
    ) -> mpsc::Receiver<StreamItem> {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let ws_url = self.ws_url.clone();
        let heartbeat = self.heartbeat_interval;
        let backoff_initial = self.backoff_initial;
        let backoff_max = self.backoff_max;
        let state = self.state.clone();

        tokio::spawn(async move {
            let mut backoff = backoff_initial;
            let mut ever_connected = false;

            'reconnect: loop {
                if *shutdown.borrow() {
                    break;
                }

                let (ws, _) = match connect_async(ws_url.as_str()).await {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("⚠️  Push stream connect failed: {}", e);
                        state.connected.store(false, Ordering::Relaxed);
                        tokio::select! {
                            _ = tokio::time::sleep(jittered(backoff)) => {}
                            _ = shutdown.changed() => break,
                        }
                        backoff = (backoff * 2).min(backoff_max);
                        continue;
                    }
                };
                let (mut sink, mut stream) = ws.split();

                let subscribe_msg = serde_json::json!({
                    "op": "subscribe",
                    "programs": filter.programs.iter().map(|p| p.to_string()).collect::<Vec<_>>(),
                    "commitment": filter.commitment,
                });
                if sink.send(Message::Text(subscribe_msg.to_string())).await.is_err() {
                    continue;
                }

                info!("🔌 Push stream connected: {}", ws_url);
                state.connected.store(true, Ordering::Relaxed);
                backoff = backoff_initial;
                // A reconnect owes downstream exactly one gap marker, sent
                // once the new connection reveals where we resumed.
                let mut pending_gap = if ever_connected {
                    state.reconnects.fetch_add(1, Ordering::Relaxed);
                    Some(state.last_slot.load(Ordering::Relaxed))
                } else {
                    None
                };
                ever_connected = true;

                let mut heartbeat_timer = tokio::time::interval(heartbeat);
                heartbeat_timer.tick().await; // first tick is immediate

                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break 'reconnect,
                        _ = heartbeat_timer.tick() => {
                            if sink.send(Message::Ping(Vec::new())).await.is_err() {
                                break;
                            }
                        }
                        msg = stream.next() => {
                            let msg = match msg {
                                Some(Ok(m)) => m,
                                Some(Err(e)) => {
                                    warn!("⚠️  Push stream error: {}", e);
                                    break;
                                }
                                None => break,
                            };
                            match msg {
                                Message::Ping(payload) => {
                                    let _ = sink.send(Message::Pong(payload)).await;
                                }
                                Message::Text(text) => {
                                    let Some(raw) = parse_notification(&text) else {
                                        debug!("Unparseable push frame, skipping");
                                        continue;
                                    };
                                    state.last_slot.store(raw.slot, Ordering::Relaxed);
                                    if let Some(last_good_slot) = pending_gap.take() {
                                        let gap = StreamItem::Gap(SequenceGap {
                                            last_good_slot,
                                            reconnected_at_slot: raw.slot,
                                        });
                                        if tx.send(gap).await.is_err() {
                                            break 'reconnect;
                                        }
                                    }
                                    if tx.send(StreamItem::Notification(raw)).await.is_err() {
                                        break 'reconnect;
                                    }
                                }
                                Message::Close(_) => break,
                                _ => {}
                            }
                        }
                    }
                }

                state.connected.store(false, Ordering::Relaxed);
                warn!("🔌 Push stream disconnected, reconnecting");
                tokio::select! {
                    _ = tokio::time::sleep(jittered(backoff)) => {}
                    _ = shutdown.changed() => break,
                }
                backoff = (backoff * 2).min(backoff_max);
            }

            info!("Push stream task stopped");
        });

        rx
    }

    async fn rpc_request(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, PipelineError> {
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": fastrand::u64(..),
            "method": method,
            "params": params,
        });

        let mut last_error = String::new();
        for attempt in 0..RPC_MAX_RETRIES {
            match self.http.post(&self.rpc_url).json(&request).send().await {
                Ok(response) => match response.json::<serde_json::Value>().await {
                    Ok(body) => {
                        if let Some(error) = body.get("error") {
                            return Err(PipelineError::ChainUnavailable(format!(
                                "rpc {}: {}",
                                method, error
                            )));
                        }
                        return Ok(body.get("result").cloned().unwrap_or(serde_json::Value::Null));
                    }
                    Err(e) => last_error = e.to_string(),
                },
                Err(e) => last_error = e.to_string(),
            }
            tokio::time::sleep(Duration::from_millis(50 << attempt)).await;
        }
        Err(PipelineError::ChainUnavailable(format!(
            "rpc {} failed after {} attempts: {}",
            method, RPC_MAX_RETRIES, last_error
        )))
    }
}

fn parse_notification(text: &str) -> Option<RawNotification> {
    let wire: WireNotification = serde_json::from_str(text).ok()?;
    let kind = match wire.kind.as_str() {
        "account" => NotificationKind::AccountUpdate,
        "pending_tx" => NotificationKind::PendingTransaction,
        "block_meta" => NotificationKind::BlockMeta,
        _ => return None,
    };
    Some(RawNotification {
        program: Pubkey::from_str(&wire.program).ok()?,
        account: Pubkey::from_str(&wire.account).ok()?,
        slot: wire.slot,
        data: base64::engine::general_purpose::STANDARD
            .decode(wire.data.as_bytes())
            .ok()?,
        kind,
    })
}

#[async_trait]
impl ChainInterface for WsChainClient {
    async fn simulate_bundle(
        &self,
        transactions: &[Transaction],
    ) -> Result<SimulationResult, PipelineError> {
        let encoded: Result<Vec<String>, PipelineError> = transactions
            .iter()
            .map(|tx| {
                let bytes = bincode::serialize(tx)
                    .map_err(|e| PipelineError::Decode(format!("tx serialization: {}", e)))?;
                Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
            })
            .collect();

        let result = self
            .rpc_request("simulateBundle", serde_json::json!([encoded?]))
            .await?;

        let entries = result
            .get("value")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let transactions = entries
            .iter()
            .map(|entry| {
                let error = entry
                    .get("err")
                    .filter(|e| !e.is_null())
                    .map(|e| e.to_string());
                TxSimulation {
                    success: error.is_none(),
                    logs: entry
                        .get("logs")
                        .and_then(|l| l.as_array())
                        .map(|l| {
                            l.iter()
                                .filter_map(|v| v.as_str().map(String::from))
                                .collect()
                        })
                        .unwrap_or_default(),
                    compute_units: entry
                        .get("unitsConsumed")
                        .and_then(|u| u.as_u64())
                        .unwrap_or(0),
                    balance_deltas: Vec::new(),
                    error,
                }
            })
            .collect();

        Ok(SimulationResult { transactions })
    }

    fn current_slot(&self) -> u64 {
        self.state.last_slot.load(Ordering::Relaxed)
    }

    fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            connected: self.state.connected.load(Ordering::Relaxed),
            last_slot: self.state.last_slot.load(Ordering::Relaxed),
            reconnects: self.state.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Deterministic chain stand-in for paper runs and tests: simulations
/// succeed unless a failure was scripted, and the slot is driven manually.
pub struct StaticSimClient {
    slot: AtomicU64,
    planned_failures: Mutex<VecDeque<Option<(usize, String)>>>,
    default_compute_units: u64,
}

impl StaticSimClient {
    pub fn new(default_compute_units: u64) -> Self {
        Self {
            slot: AtomicU64::new(1),
            planned_failures: Mutex::new(VecDeque::new()),
            default_compute_units,
        }
    }

    /// The next simulate call reports a failure at `position`.
    pub fn plan_failure(&self, position: usize, reason: &str) {
        self.planned_failures
            .lock()
            .push_back(Some((position, reason.to_string())));
    }

    /// The next simulate call succeeds (useful between scripted failures).
    pub fn plan_success(&self) {
        self.planned_failures.lock().push_back(None);
    }

    pub fn set_slot(&self, slot: u64) {
        self.slot.store(slot, Ordering::Relaxed);
    }

    pub fn advance_slots(&self, delta: u64) {
        self.slot.fetch_add(delta, Ordering::Relaxed);
    }
}

#[async_trait]
impl ChainInterface for StaticSimClient {
    async fn simulate_bundle(
        &self,
        transactions: &[Transaction],
    ) -> Result<SimulationResult, PipelineError> {
        let plan = self.planned_failures.lock().pop_front().flatten();
        let transactions = transactions
            .iter()
            .enumerate()
            .map(|(i, _)| match &plan {
                Some((position, reason)) if *position == i => TxSimulation {
                    success: false,
                    logs: vec![format!("Program failed: {}", reason)],
                    compute_units: 0,
                    balance_deltas: Vec::new(),
                    error: Some(reason.clone()),
                },
                _ => TxSimulation {
                    success: true,
                    logs: Vec::new(),
                    compute_units: self.default_compute_units,
                    balance_deltas: Vec::new(),
                    error: None,
                },
            })
            .collect();
        Ok(SimulationResult { transactions })
    }

    fn current_slot(&self) -> u64 {
        self.slot.load(Ordering::Relaxed)
    }

    fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            connected: true,
            last_slot: self.slot.load(Ordering::Relaxed),
            reconnects: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_sdk::hash::Hash;
    use solana_sdk::signature::{Keypair, Signer};
    use solana_sdk::system_instruction;

    fn dummy_tx() -> Transaction {
        let payer = Keypair::new();
        let ix = system_instruction::transfer(&payer.pubkey(), &Pubkey::new_unique(), 1);
        Transaction::new_signed_with_payer(&[ix], Some(&payer.pubkey()), &[&payer], Hash::default())
    }

    #[test]
    fn test_parse_notification_roundtrip() {
        let program = Pubkey::new_unique();
        let account = Pubkey::new_unique();
        let payload = base64::engine::general_purpose::STANDARD.encode([1u8, 2, 3]);
        let text = serde_json::json!({
            "program": program.to_string(),
            "account": account.to_string(),
            "slot": 42,
            "kind": "account",
            "data": payload,
        })
        .to_string();

        let raw = parse_notification(&text).unwrap();
        assert_eq!(raw.program, program);
        assert_eq!(raw.account, account);
        assert_eq!(raw.slot, 42);
        assert_eq!(raw.data, vec![1, 2, 3]);
        assert_eq!(raw.kind, NotificationKind::AccountUpdate);
    }

    #[test]
    fn test_parse_notification_rejects_unknown_kind() {
        let text = serde_json::json!({
            "program": Pubkey::new_unique().to_string(),
            "account": Pubkey::new_unique().to_string(),
            "slot": 1,
            "kind": "mystery",
            "data": "",
        })
        .to_string();
        assert!(parse_notification(&text).is_none());
    }

    #[tokio::test]
    async fn test_static_sim_scripted_failure() {
        let client = StaticSimClient::new(100_000);
        client.plan_failure(1, "account in use");

        let txs = vec![dummy_tx(), dummy_tx(), dummy_tx()];
        let result = client.simulate_bundle(&txs).await.unwrap();
        assert_eq!(result.first_failure().unwrap().0, 1);

        // Script consumed; next call is clean.
        let result = client.simulate_bundle(&txs).await.unwrap();
        assert!(result.first_failure().is_none());
        assert_eq!(result.total_compute_units(), 300_000);
    }
}
