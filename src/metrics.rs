use anyhow::Result;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Process-wide counters and gauges for the pipeline.
///
/// Every "dropped with a counter increment" path in the ingest and fan-out
/// layers lands here. The registry is owned by the `Core` value and cloned
/// handles are passed into workers; there is no global registry.
#[derive(Clone)]
pub struct PipelineMetrics {
    registry: Registry,

    pub decode_dropped: IntCounter,
    pub state_conflicts: IntCounter,
    pub policy_blocked_sandwich: IntCounter,
    pub backpressure_dropped: IntCounter,
    pub subscriber_topic_drops: IntCounter,

    pub opportunities_detected: IntCounterVec,
    pub bundles_submitted: IntCounter,
    pub bundle_outcomes: IntCounterVec,

    pub chain_reconnects: IntCounter,
    pub pools_tracked: IntGauge,
    pub detection_latency: Histogram,
}

impl PipelineMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let decode_dropped = IntCounter::new(
            "mev_decode_dropped_total",
            "Notifications dropped because no decoder recognized them",
        )?;
        let state_conflicts = IntCounter::new(
            "mev_state_conflict_total",
            "Events dropped for arriving with a stale slot",
        )?;
        let policy_blocked_sandwich = IntCounter::new(
            "policy_blocked_sandwich",
            "Sandwich opportunities suppressed by ethical mode",
        )?;
        let backpressure_dropped = IntCounter::new(
            "mev_backpressure_dropped_total",
            "Pending opportunities dropped because the composer queue was full",
        )?;
        let subscriber_topic_drops = IntCounter::new(
            "mev_subscriber_topic_drops_total",
            "Subscribers dropped from a topic for falling behind",
        )?;
        let opportunities_detected = IntCounterVec::new(
            Opts::new(
                "mev_opportunities_detected_total",
                "Opportunities emitted per detector",
            ),
            &["kind"],
        )?;
        let bundles_submitted = IntCounter::new(
            "mev_bundles_submitted_total",
            "Bundles handed to the block engine",
        )?;
        let bundle_outcomes = IntCounterVec::new(
            Opts::new("mev_bundle_outcomes_total", "Terminal bundle states"),
            &["state"],
        )?;
        let chain_reconnects = IntCounter::new(
            "mev_chain_reconnects_total",
            "Push-stream reconnections",
        )?;
        let pools_tracked = IntGauge::new(
            "mev_pools_tracked",
            "Pool records currently held by the market graph",
        )?;
        let detection_latency = Histogram::with_opts(
            HistogramOpts::new(
                "mev_detection_latency_seconds",
                "Event observation to opportunity emission",
            )
            .buckets(vec![0.0005, 0.001, 0.0025, 0.005, 0.010, 0.025, 0.050, 0.100]),
        )?;

        registry.register(Box::new(decode_dropped.clone()))?;
        registry.register(Box::new(state_conflicts.clone()))?;
        registry.register(Box::new(policy_blocked_sandwich.clone()))?;
        registry.register(Box::new(backpressure_dropped.clone()))?;
        registry.register(Box::new(subscriber_topic_drops.clone()))?;
        registry.register(Box::new(opportunities_detected.clone()))?;
        registry.register(Box::new(bundles_submitted.clone()))?;
        registry.register(Box::new(bundle_outcomes.clone()))?;
        registry.register(Box::new(chain_reconnects.clone()))?;
        registry.register(Box::new(pools_tracked.clone()))?;
        registry.register(Box::new(detection_latency.clone()))?;

        Ok(Self {
            registry,
            decode_dropped,
            state_conflicts,
            policy_blocked_sandwich,
            backpressure_dropped,
            subscriber_topic_drops,
            opportunities_detected,
            bundles_submitted,
            bundle_outcomes,
            chain_reconnects,
            pools_tracked,
            detection_latency,
        })
    }

    /// Text exposition of the full registry.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if encoder
            .encode(&self.registry.gather(), &mut buffer)
            .is_err()
        {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_register_and_render() {
        let metrics = PipelineMetrics::new().unwrap();
        metrics.policy_blocked_sandwich.inc();
        metrics
            .opportunities_detected
            .with_label_values(&["arbitrage"])
            .inc();
        let text = metrics.render();
        assert!(text.contains("policy_blocked_sandwich"));
        assert!(text.contains("mev_opportunities_detected_total"));
    }
}
