//! Topic-indexed fan-out to subscribers over persistent push channels.
//!
//! Seven fixed topics, no dynamic creation. Delivery per subscriber is
//! per-topic FIFO and at-most-once: a subscriber whose queue is full is
//! dropped from the offending topic with exactly one recoverable drop
//! marker, and other topics and subscribers are unaffected.

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use prometheus::IntCounter;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

pub const TOPIC_COUNT: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    OpportunitiesArbitrage,
    OpportunitiesLiquidation,
    OpportunitiesSandwich,
    BundlesSubmitted,
    BundlesStatus,
    MarketPoolUpdates,
    SystemHealth,
}

impl Topic {
    pub const ALL: [Topic; TOPIC_COUNT] = [
        Topic::OpportunitiesArbitrage,
        Topic::OpportunitiesLiquidation,
        Topic::OpportunitiesSandwich,
        Topic::BundlesSubmitted,
        Topic::BundlesStatus,
        Topic::MarketPoolUpdates,
        Topic::SystemHealth,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::OpportunitiesArbitrage => "opportunities.arbitrage",
            Topic::OpportunitiesLiquidation => "opportunities.liquidation",
            Topic::OpportunitiesSandwich => "opportunities.sandwich",
            Topic::BundlesSubmitted => "bundles.submitted",
            Topic::BundlesStatus => "bundles.status",
            Topic::MarketPoolUpdates => "market.pool_updates",
            Topic::SystemHealth => "system.health",
        }
    }

    pub fn parse(name: &str) -> Option<Topic> {
        Topic::ALL.iter().copied().find(|t| t.as_str() == name)
    }

    fn index(&self) -> usize {
        Topic::ALL.iter().position(|t| t == self).unwrap_or(0)
    }
}

/// Server-side filter a subscriber may attach per topic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopicFilter {
    #[serde(default)]
    pub min_profit_lamports: Option<u64>,
    #[serde(default)]
    pub venues: Option<Vec<String>>,
}

impl TopicFilter {
    fn matches(&self, payload: &serde_json::Value) -> bool {
        if let Some(min) = self.min_profit_lamports {
            let profit = payload
                .get("gross_profit_lamports")
                .and_then(|p| p.as_u64())
                .unwrap_or(u64::MAX);
            if profit < min {
                return false;
            }
        }
        if let Some(venues) = &self.venues {
            let mentioned: Vec<String> = payload
                .get("venue_ids")
                .and_then(|v| v.as_array())
                .map(|v| {
                    v.iter()
                        .filter_map(|s| s.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default();
            if !mentioned.is_empty() && !mentioned.iter().any(|m| venues.contains(m)) {
                return false;
            }
        }
        true
    }
}

/// Data frame pushed to subscribers. `seq` is monotonic per topic.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub topic: &'static str,
    pub ts: i64,
    pub seq: u64,
    pub payload: serde_json::Value,
}

/// Server-originated control frames.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlFrame {
    Drop { topic: &'static str, reason: String },
    Pong,
}

/// Client-originated control frames.
#[derive(Debug, Clone, Deserialize)]
struct ClientFrame {
    op: String,
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    filter: Option<TopicFilter>,
}

struct SubscriberEntry {
    name: String,
    topics: HashMap<Topic, TopicFilter>,
    data_tx: mpsc::Sender<Envelope>,
    control_tx: mpsc::UnboundedSender<ControlFrame>,
}

/// What a subscriber holds: its data queue and its control queue.
pub struct SubscriptionHandle {
    pub id: u64,
    pub data_rx: mpsc::Receiver<Envelope>,
    pub control_rx: mpsc::UnboundedReceiver<ControlFrame>,
}

pub struct SubscriptionHub {
    subscribers: Mutex<HashMap<u64, SubscriberEntry>>,
    next_id: AtomicU64,
    seq: [AtomicU64; TOPIC_COUNT],
    default_queue_depth: usize,
    topic_drops: IntCounter,
}

impl SubscriptionHub {
    pub fn new(default_queue_depth: usize, topic_drops: IntCounter) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            seq: Default::default(),
            default_queue_depth: default_queue_depth.max(1),
            topic_drops,
        }
    }

    /// Register a subscriber for a set of topics.
    pub fn subscribe(
        &self,
        name: &str,
        topics: &[(Topic, TopicFilter)],
    ) -> SubscriptionHandle {
        self.subscribe_with_depth(name, topics, self.default_queue_depth)
    }

    pub fn subscribe_with_depth(
        &self,
        name: &str,
        topics: &[(Topic, TopicFilter)],
        queue_depth: usize,
    ) -> SubscriptionHandle {
        let (data_tx, data_rx) = mpsc::channel(queue_depth.max(1));
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().insert(
            id,
            SubscriberEntry {
                name: name.to_string(),
                topics: topics.iter().cloned().collect(),
                data_tx,
                control_tx,
            },
        );
        debug!("Subscriber {} ({}) registered", id, name);
        SubscriptionHandle {
            id,
            data_rx,
            control_rx,
        }
    }

    /// Add topics to an existing subscriber (re-subscribing after a drop).
    pub fn add_topics(&self, id: u64, topics: &[(Topic, TopicFilter)]) {
        if let Some(entry) = self.subscribers.lock().get_mut(&id) {
            for (topic, filter) in topics {
                entry.topics.insert(*topic, filter.clone());
            }
        }
    }

    pub fn remove_topics(&self, id: u64, topics: &[Topic]) {
        if let Some(entry) = self.subscribers.lock().get_mut(&id) {
            for topic in topics {
                entry.topics.remove(topic);
            }
        }
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().remove(&id);
    }

    pub fn ping(&self, id: u64) {
        if let Some(entry) = self.subscribers.lock().get(&id) {
            let _ = entry.control_tx.send(ControlFrame::Pong);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Publish one payload to every subscriber of the topic. Never blocks:
    /// a full subscriber queue drops that subscriber from this topic with a
    /// single recoverable marker.
    pub fn publish(&self, topic: Topic, payload: serde_json::Value) {
        let seq = self.seq[topic.index()].fetch_add(1, Ordering::Relaxed) + 1;
        let envelope = Envelope {
            topic: topic.as_str(),
            ts: chrono::Utc::now().timestamp_millis(),
            seq,
            payload,
        };

        let mut subscribers = self.subscribers.lock();
        let mut defunct = Vec::new();
        for (id, entry) in subscribers.iter_mut() {
            let Some(filter) = entry.topics.get(&topic) else {
                continue;
            };
            if !filter.matches(&envelope.payload) {
                continue;
            }
            match entry.data_tx.try_send(envelope.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    entry.topics.remove(&topic);
                    self.topic_drops.inc();
                    warn!(
                        "🐌 Subscriber {} ({}) too slow, dropped from {}",
                        id,
                        entry.name,
                        topic.as_str()
                    );
                    let _ = entry.control_tx.send(ControlFrame::Drop {
                        topic: topic.as_str(),
                        reason: "slow_consumer".into(),
                    });
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    defunct.push(*id);
                }
            }
        }
        for id in defunct {
            subscribers.remove(&id);
            debug!("Subscriber {} disconnected, removed", id);
        }
    }

    /// WebSocket egress: accepts connections and glues each one to a
    /// subscriber registration driven by subscribe/unsubscribe/ping frames.
    pub async fn serve(
        self: Arc<Self>,
        bind_addr: String,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&bind_addr).await?;
        info!("📡 Subscription hub listening on {}", bind_addr);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => {
                    let Ok((stream, peer)) = accepted else { continue };
                    let hub = self.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = hub.handle_socket(stream, peer.to_string(), shutdown).await {
                            debug!("Subscriber {} connection ended: {}", peer, e);
                        }
                    });
                }
            }
        }
        Ok(())
    }

    async fn handle_socket(
        self: Arc<Self>,
        stream: tokio::net::TcpStream,
        peer: String,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let ws = accept_async(stream).await?;
        let (mut sink, mut source) = ws.split();
        let mut handle = self.subscribe(&peer, &[]);
        info!("📡 Subscriber connected: {}", peer);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                control = handle.control_rx.recv() => {
                    let Some(frame) = control else { break };
                    sink.send(Message::Text(serde_json::to_string(&frame)?)).await?;
                }
                envelope = handle.data_rx.recv() => {
                    let Some(envelope) = envelope else { break };
                    sink.send(Message::Text(serde_json::to_string(&envelope)?)).await?;
                }
                msg = source.next() => {
                    let msg = match msg {
                        Some(Ok(m)) => m,
                        _ => break,
                    };
                    match msg {
                        Message::Text(text) => self.apply_client_frame(handle.id, &text),
                        Message::Ping(payload) => {
                            sink.send(Message::Pong(payload)).await?;
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
            }
        }

        self.unsubscribe(handle.id);
        info!("📡 Subscriber disconnected: {}", peer);
        Ok(())
    }

    fn apply_client_frame(&self, id: u64, text: &str) {
        let Ok(frame) = serde_json::from_str::<ClientFrame>(text) else {
            debug!("Ignoring malformed client frame from {}", id);
            return;
        };
        let topics: Vec<Topic> = frame
            .topics
            .iter()
            .filter_map(|name| Topic::parse(name))
            .collect();
        match frame.op.as_str() {
            "subscribe" => {
                let filter = frame.filter.unwrap_or_default();
                let pairs: Vec<(Topic, TopicFilter)> =
                    topics.into_iter().map(|t| (t, filter.clone())).collect();
                self.add_topics(id, &pairs);
            }
            "unsubscribe" => self.remove_topics(id, &topics),
            "ping" => self.ping(id),
            other => debug!("Unknown client op {:?} from {}", other, id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::PipelineMetrics;

    fn hub(depth: usize) -> SubscriptionHub {
        let metrics = PipelineMetrics::new().unwrap();
        SubscriptionHub::new(depth, metrics.subscriber_topic_drops.clone())
    }

    fn payload(profit: u64) -> serde_json::Value {
        serde_json::json!({ "gross_profit_lamports": profit, "venue_ids": ["ray"] })
    }

    #[tokio::test]
    async fn test_per_topic_fifo_and_increasing_seq() {
        let hub = hub(64);
        let mut handle = hub.subscribe(
            "s1",
            &[(Topic::OpportunitiesArbitrage, TopicFilter::default())],
        );

        for profit in [1u64, 2, 3, 4, 5] {
            hub.publish(Topic::OpportunitiesArbitrage, payload(profit));
        }

        let mut last_seq = 0;
        for expected in [1u64, 2, 3, 4, 5] {
            let envelope = handle.data_rx.recv().await.unwrap();
            assert_eq!(envelope.topic, "opportunities.arbitrage");
            assert_eq!(
                envelope.payload.get("gross_profit_lamports").unwrap().as_u64(),
                Some(expected)
            );
            assert!(envelope.seq > last_seq);
            last_seq = envelope.seq;
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_dropped_with_single_marker() {
        let hub = hub(2048);
        // S1 is slow (tiny queue, never drained); S2 keeps up.
        let mut s1 = hub.subscribe_with_depth(
            "s1",
            &[(Topic::OpportunitiesArbitrage, TopicFilter::default())],
            4,
        );
        let mut s2 = hub.subscribe(
            "s2",
            &[(Topic::OpportunitiesArbitrage, TopicFilter::default())],
        );

        for profit in 0..1000u64 {
            hub.publish(Topic::OpportunitiesArbitrage, payload(profit));
        }

        // Exactly one drop marker for S1, nothing more afterwards.
        let frame = s1.control_rx.recv().await.unwrap();
        assert_eq!(
            frame,
            ControlFrame::Drop {
                topic: "opportunities.arbitrage",
                reason: "slow_consumer".into()
            }
        );
        assert!(s1.control_rx.try_recv().is_err());

        // S1 got at most its queue depth before the drop.
        let mut s1_received = 0;
        while s1.data_rx.try_recv().is_ok() {
            s1_received += 1;
        }
        assert!(s1_received <= 4);

        // S2's sequence is contiguous and complete.
        let mut expected_seq = 1u64;
        for _ in 0..1000 {
            let envelope = s2.data_rx.try_recv().unwrap();
            assert_eq!(envelope.seq, expected_seq);
            expected_seq += 1;
        }
    }

    #[tokio::test]
    async fn test_resubscribe_after_drop_resumes_delivery() {
        let hub = hub(2);
        let mut s1 = hub.subscribe_with_depth(
            "s1",
            &[(Topic::OpportunitiesArbitrage, TopicFilter::default())],
            2,
        );

        for profit in 0..10u64 {
            hub.publish(Topic::OpportunitiesArbitrage, payload(profit));
        }
        assert!(s1.control_rx.recv().await.is_some());

        // Drain the stale queue, then events published pre-resubscribe are
        // never delivered.
        while s1.data_rx.try_recv().is_ok() {}
        hub.publish(Topic::OpportunitiesArbitrage, payload(99));
        assert!(s1.data_rx.try_recv().is_err());

        hub.add_topics(
            s1.id,
            &[(Topic::OpportunitiesArbitrage, TopicFilter::default())],
        );
        hub.publish(Topic::OpportunitiesArbitrage, payload(100));
        let envelope = s1.data_rx.recv().await.unwrap();
        assert_eq!(
            envelope.payload.get("gross_profit_lamports").unwrap().as_u64(),
            Some(100)
        );
    }

    #[tokio::test]
    async fn test_no_cross_topic_interference() {
        let hub = hub(2);
        let mut s1 = hub.subscribe_with_depth(
            "s1",
            &[
                (Topic::OpportunitiesArbitrage, TopicFilter::default()),
                (Topic::SystemHealth, TopicFilter::default()),
            ],
            2,
        );

        // Overflow the arbitrage topic only.
        for profit in 0..10u64 {
            hub.publish(Topic::OpportunitiesArbitrage, payload(profit));
        }
        while s1.data_rx.try_recv().is_ok() {}

        // Health events still arrive after the arbitrage drop.
        hub.publish(Topic::SystemHealth, serde_json::json!({"connected": true}));
        let envelope = s1.data_rx.recv().await.unwrap();
        assert_eq!(envelope.topic, "system.health");
    }

    #[tokio::test]
    async fn test_filter_min_profit() {
        let hub = hub(64);
        let mut s1 = hub.subscribe(
            "s1",
            &[(
                Topic::OpportunitiesArbitrage,
                TopicFilter {
                    min_profit_lamports: Some(1_000),
                    venues: None,
                },
            )],
        );

        hub.publish(Topic::OpportunitiesArbitrage, payload(10));
        hub.publish(Topic::OpportunitiesArbitrage, payload(5_000));

        let envelope = s1.data_rx.recv().await.unwrap();
        assert_eq!(
            envelope.payload.get("gross_profit_lamports").unwrap().as_u64(),
            Some(5_000)
        );
        assert!(s1.data_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribed_topic_not_delivered() {
        let hub = hub(64);
        let mut s1 = hub.subscribe(
            "s1",
            &[(Topic::BundlesStatus, TopicFilter::default())],
        );
        hub.publish(Topic::OpportunitiesArbitrage, payload(1));
        hub.publish(Topic::BundlesStatus, serde_json::json!({"state": "LANDED"}));

        let envelope = s1.data_rx.recv().await.unwrap();
        assert_eq!(envelope.topic, "bundles.status");
        assert!(s1.data_rx.try_recv().is_err());
    }
}
