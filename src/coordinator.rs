//! Core wiring: one value holding every subsystem, constructed at startup
//! and passed into workers. There is no other process-wide mutable state.
//!
//! Each major component runs on its own task and talks over bounded queues;
//! workers check the shutdown signal at every suspension point and drain
//! within the configured grace period.

use anyhow::{Context, Result};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Keypair;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::arbitrage_detector::{ArbitrageConfig, ArbitrageDetector};
use crate::bundle_composer::{BundleComposer, ComposerConfig};
use crate::chain_client::{ChainInterface, StaticSimClient, SubscriptionFilter, WsChainClient};
use crate::clock::Clock;
use crate::config::PipelineConfig;
use crate::constants::{COMPOSE_DEADLINE_MS, EVICTION_INTERVAL_MS, NATIVE_MINT, POOL_TTL_MS, USDC_MINT};
use crate::error::PipelineError;
use crate::event_normalizer::{EventNormalizer, VenueDecoder};
use crate::events::ChainEvent;
use crate::liquidation_scanner::{GraphPriceSource, LiquidationConfig, LiquidationScanner};
use crate::market_graph::MarketGraph;
use crate::metrics::PipelineMetrics;
use crate::opportunity::{Opportunity, OpportunityQueue};
use crate::outcome_ledger::OutcomeLedger;
use crate::sandwich_detector::{SandwichConfig, SandwichDetector};
use crate::submission_client::{SubmissionClient, SubmissionConfig};
use crate::subscription_hub::{SubscriptionHub, Topic};
use crate::success_model::SuccessModel;

/// Venue programs the pipeline ships decoders for.
fn builtin_decoders() -> HashMap<Pubkey, VenueDecoder> {
    let mut decoders = HashMap::new();
    decoders.insert(
        Pubkey::from_str("675kPX9MHTjS2zt1qfr1NYHuzeLXfQM9H24wFSUt1Mp8").unwrap(),
        VenueDecoder::ConstantProduct {
            venue_id: "raydium".into(),
        },
    );
    decoders.insert(
        Pubkey::from_str("whirLbMiicVdio4qvUfM5KAg6Ct8VwpYzGff3uctyCc").unwrap(),
        VenueDecoder::Concentrated {
            venue_id: "orca".into(),
        },
    );
    decoders.insert(
        Pubkey::from_str("So1endDq2YkqhipRh3WViPa8hdiSpxWy6z3Z6tMCpAo").unwrap(),
        VenueDecoder::Lending {
            protocol: "solend".into(),
        },
    );
    decoders.insert(
        Pubkey::from_str("KLend2g3cP87fffoy8q1mQqGKjrxjC8boSyAYavgmjD").unwrap(),
        VenueDecoder::Lending {
            protocol: "kamino".into(),
        },
    );
    decoders.insert(
        Pubkey::from_str("Vote111111111111111111111111111111111111111").unwrap(),
        VenueDecoder::BlockMeta,
    );
    decoders
}

pub struct Core {
    pub config: PipelineConfig,
    pub clock: Clock,
    pub metrics: PipelineMetrics,
    pub graph: Arc<MarketGraph>,
    pub model: Arc<SuccessModel>,
    pub hub: Arc<SubscriptionHub>,
    pub ledger: Arc<OutcomeLedger>,
    pub normalizer: Arc<EventNormalizer>,
    pub stream_client: Arc<WsChainClient>,
    pub chain: Arc<dyn ChainInterface>,
    pub arbitrage: Arc<ArbitrageDetector>,
    pub liquidation: Arc<LiquidationScanner>,
    pub sandwich: Arc<SandwichDetector>,
    pub composer: Arc<BundleComposer>,
    pub submission: Arc<SubmissionClient>,
    pub queue: Arc<OpportunityQueue>,
}

impl Core {
    pub fn new(config: PipelineConfig, keypair: Arc<Keypair>) -> Result<Self> {
        let clock = Clock::new();
        let metrics = PipelineMetrics::new().context("metrics registry")?;
        let graph = Arc::new(MarketGraph::new(clock));
        let model = Arc::new(SuccessModel::new());
        let hub = Arc::new(SubscriptionHub::new(
            crate::constants::SUBSCRIBER_QUEUE_DEPTH,
            metrics.subscriber_topic_drops.clone(),
        ));
        let ledger = if config.paper_mode {
            Arc::new(OutcomeLedger::in_memory().context("ledger")?)
        } else {
            Arc::new(OutcomeLedger::new(&config.ledger_path).context("ledger")?)
        };
        let normalizer = Arc::new(EventNormalizer::new(
            builtin_decoders(),
            metrics.decode_dropped.clone(),
            metrics.state_conflicts.clone(),
        ));

        let stream_client = Arc::new(WsChainClient::new(
            config.chain_ws_url.clone(),
            config.chain_rpc_url.clone(),
            config.heartbeat_interval_ms,
            config.reconnect_backoff_initial_ms,
            config.reconnect_backoff_max_ms,
        ));
        // Paper runs validate bundles against a deterministic simulator so
        // composition never depends on a live RPC.
        let chain: Arc<dyn ChainInterface> = if config.paper_mode {
            Arc::new(StaticSimClient::new(200_000))
        } else {
            stream_client.clone()
        };

        let watchlist: Vec<Pubkey> = config
            .watchlist
            .iter()
            .map(|s| Pubkey::from_str(s))
            .collect::<std::result::Result<_, _>>()
            .context("watchlist mints")?;
        let tip_accounts: Vec<Pubkey> = config
            .tip_accounts
            .iter()
            .map(|s| Pubkey::from_str(s))
            .collect::<std::result::Result<_, _>>()
            .context("tip accounts")?;

        let arbitrage = Arc::new(ArbitrageDetector::new(
            graph.clone(),
            model.clone(),
            clock,
            ArbitrageConfig {
                min_profit_lamports: config.min_profit_lamports,
                max_slippage_bps: config.max_slippage_bps,
                max_hops: config.max_hops,
                watchlist,
                native_token: *NATIVE_MINT,
            },
        ));
        let liquidation = Arc::new(LiquidationScanner::new(
            clock,
            LiquidationConfig {
                rescan_interval_ms: config.rescan_interval_ms,
                max_liq_per_round: config.max_liq_per_round,
                native_token: *NATIVE_MINT,
            },
        ));
        let sandwich = Arc::new(SandwichDetector::new(
            graph.clone(),
            model.clone(),
            clock,
            SandwichConfig {
                min_target_value_usd: config.min_target_value_usd,
                ethical_mode: config.ethical_mode,
                native_token: *NATIVE_MINT,
            },
            metrics.policy_blocked_sandwich.clone(),
        ));
        let composer = Arc::new(BundleComposer::new(
            chain.clone(),
            model.clone(),
            clock,
            keypair,
            ComposerConfig {
                max_bundle_txs: config.max_bundle_txs,
                max_bundle_compute: config.max_bundle_compute,
                safety_margin_bps: config.safety_margin_bps,
                max_compose_retries: config.max_compose_retries,
                strategy: config.strategy,
                min_tip: config.min_tip,
                max_tip: config.max_tip,
                tip_accounts,
                executor_program: *crate::constants::EXECUTOR_PROGRAM,
            },
        ));
        let submission = Arc::new(SubmissionClient::new(
            chain.clone(),
            model.clone(),
            ledger.clone(),
            clock,
            SubmissionConfig {
                block_engine_url: config.block_engine_url.clone(),
                poll_interval_ms: config.poll_interval_ms,
                bundle_ttl_slots: config.bundle_ttl_slots,
                paper_mode: config.paper_mode,
            },
        ));
        let queue = Arc::new(OpportunityQueue::new(config.worker_queue_depth));

        Ok(Self {
            config,
            clock,
            metrics,
            graph,
            model,
            hub,
            ledger,
            normalizer,
            stream_client,
            chain,
            arbitrage,
            liquidation,
            sandwich,
            composer,
            submission,
            queue,
        })
    }

    fn price_source(&self) -> GraphPriceSource {
        GraphPriceSource::new(self.graph.clone(), *USDC_MINT)
    }

    /// Push one opportunity toward the composer and the hub.
    fn dispatch_opportunity(&self, topic: Topic, opportunity: Opportunity) {
        self.metrics
            .opportunities_detected
            .with_label_values(&[opportunity.kind_label()])
            .inc();
        self.metrics
            .detection_latency
            .observe(self.clock.since_ns(opportunity.detected_at_ns) as f64 / 1e9);
        if let Ok(payload) = serde_json::to_value(&opportunity) {
            self.hub.publish(topic, payload);
        }
        if self.queue.push(opportunity) {
            self.metrics.backpressure_dropped.inc();
        }
    }

    /// Route one normalized event into the graph and the detectors. Public
    /// so replay tooling and scenario tests can drive the pipeline directly.
    pub fn handle_event(&self, event: ChainEvent) {
        match event {
            ChainEvent::PoolState(e) => {
                match self.graph.apply(&e) {
                    Ok(()) => {
                        self.metrics.pools_tracked.set(self.graph.pool_count() as i64);
                        self.hub.publish(
                            Topic::MarketPoolUpdates,
                            serde_json::json!({
                                "venue_id": e.venue_id,
                                "address": e.address.to_string(),
                                "slot": e.slot,
                            }),
                        );
                    }
                    Err(PipelineError::StateConflict { .. }) => {
                        self.metrics.state_conflicts.inc();
                        return;
                    }
                    Err(e) => {
                        debug!("Pool apply failed: {}", e);
                        return;
                    }
                }
                for opportunity in self.arbitrage.on_pool_update(&e) {
                    self.dispatch_opportunity(Topic::OpportunitiesArbitrage, opportunity);
                }
            }
            ChainEvent::Lending(e) => {
                let prices = self.price_source();
                for opportunity in self.liquidation.on_event(&e, &prices) {
                    self.dispatch_opportunity(Topic::OpportunitiesLiquidation, opportunity);
                }
            }
            ChainEvent::Swap(e) if e.pending => {
                let prices = self.price_source();
                match self.sandwich.on_pending_swap(&e, &prices) {
                    Ok(Some(opportunity)) => {
                        self.dispatch_opportunity(Topic::OpportunitiesSandwich, opportunity)
                    }
                    Ok(None) => {}
                    Err(PipelineError::PolicyBlocked(reason)) => {
                        debug!("Sandwich blocked: {}", reason)
                    }
                    Err(e) => debug!("Sandwich evaluation failed: {}", e),
                }
            }
            ChainEvent::Swap(_) => {}
            ChainEvent::BlockReward(e) => {
                debug!("Block {} by {} (+{} lamports)", e.slot, e.leader, e.reward_lamports);
            }
            ChainEvent::Gap(gap) => {
                self.metrics.chain_reconnects.inc();
                warn!(
                    "🕳️  Stream gap: slots {} -> {}",
                    gap.last_good_slot, gap.reconnected_at_slot
                );
            }
        }
    }

    /// Run every worker until the shutdown signal fires, then drain within
    /// the grace period and abort whatever is left.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut workers = JoinSet::new();

        // Subscriber egress.
        {
            let hub = self.hub.clone();
            let bind = self.config.hub_bind_addr.clone();
            let shutdown = shutdown.clone();
            workers.spawn(async move {
                if let Err(e) = hub.serve(bind, shutdown).await {
                    warn!("Hub server stopped: {}", e);
                }
            });
        }

        // Ingest: push stream -> normalizer -> graph & detectors.
        {
            let core = self.clone();
            let mut shutdown = shutdown.clone();
            let filter = SubscriptionFilter {
                programs: core.normalizer.programs(),
                commitment: "confirmed".into(),
            };
            let mut stream = core.stream_client.subscribe(
                filter,
                core.config.worker_queue_depth,
                shutdown.clone(),
            );
            workers.spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        item = stream.recv() => {
                            let Some(item) = item else { break };
                            if let Some(event) = core.normalizer.normalize(item) {
                                core.handle_event(event);
                            }
                        }
                    }
                }
                info!("Ingest worker drained");
            });
        }

        // Composer: opportunity batches -> bundles -> submission.
        {
            let core = self.clone();
            let mut shutdown = shutdown.clone();
            workers.spawn(async move {
                loop {
                    let batch = tokio::select! {
                        _ = shutdown.changed() => break,
                        batch = core.queue.recv_batch() => batch,
                    };
                    let deadline = Instant::now() + Duration::from_millis(COMPOSE_DEADLINE_MS);
                    match core.composer.compose(batch, deadline).await {
                        Ok(bundle) => {
                            self_publish_bundle(&core, &bundle);
                            match core.submission.submit(bundle).await {
                                Ok(record) => {
                                    // Rejection at submit time is already
                                    // terminal and never reaches the poller.
                                    if record.state.is_terminal() {
                                        core.metrics
                                            .bundle_outcomes
                                            .with_label_values(&[record.state.as_str()])
                                            .inc();
                                        if let Ok(payload) = serde_json::to_value(&record) {
                                            core.hub.publish(Topic::BundlesStatus, payload);
                                        }
                                    }
                                    debug!(
                                        "Bundle {} accepted as {:?}",
                                        record.bundle_id, record.state
                                    );
                                }
                                Err(e) => warn!("Submission refused: {}", e),
                            }
                        }
                        Err(PipelineError::CompositionAbandoned(reason)) => {
                            debug!("Composition abandoned: {}", reason)
                        }
                        Err(e) => warn!("Composition failed: {}", e),
                    }
                }
                info!("Composer worker drained");
            });
        }

        // Status poller.
        {
            let core = self.clone();
            let mut shutdown = shutdown.clone();
            workers.spawn(async move {
                let mut ticker = tokio::time::interval(core.submission.poll_interval());
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => {
                            for record in core.submission.poll_once().await {
                                core.metrics
                                    .bundle_outcomes
                                    .with_label_values(&[record.state.as_str()])
                                    .inc();
                                if let Ok(payload) = serde_json::to_value(&record) {
                                    core.hub.publish(Topic::BundlesStatus, payload);
                                }
                            }
                        }
                    }
                }
            });
        }

        // Liquidation rescan rounds.
        {
            let core = self.clone();
            let mut shutdown = shutdown.clone();
            workers.spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_millis(
                    core.config.rescan_interval_ms.max(100),
                ));
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => {
                            let prices = core.price_source();
                            for opportunity in core.liquidation.rescan_round(&prices) {
                                core.dispatch_opportunity(
                                    Topic::OpportunitiesLiquidation,
                                    opportunity,
                                );
                            }
                        }
                    }
                }
            });
        }

        // Pool eviction sweep.
        {
            let core = self.clone();
            let mut shutdown = shutdown.clone();
            workers.spawn(async move {
                let mut ticker =
                    tokio::time::interval(Duration::from_millis(EVICTION_INTERVAL_MS));
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => {
                            let cutoff = core.clock.now_ns().saturating_sub(POOL_TTL_MS * 1_000_000);
                            let evicted = core.graph.evict_stale(cutoff);
                            if evicted > 0 {
                                core.metrics.pools_tracked.set(core.graph.pool_count() as i64);
                            }
                        }
                    }
                }
            });
        }

        // Health heartbeat on the hub.
        {
            let core = self.clone();
            let mut shutdown = shutdown.clone();
            workers.spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(5));
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => {
                            let health = core.chain.health();
                            let report = core.ledger.report().unwrap_or_default();
                            core.hub.publish(
                                Topic::SystemHealth,
                                serde_json::json!({
                                    "chain": health,
                                    "pools": core.graph.pool_count(),
                                    "queue_depth": core.queue.len(),
                                    "subscribers": core.hub.subscriber_count(),
                                    "ledger": report,
                                }),
                            );
                        }
                    }
                }
            });
        }

        // Wait for the shutdown signal, then drain with grace.
        let mut shutdown_wait = shutdown.clone();
        let _ = shutdown_wait.changed().await;
        info!(
            "🛑 Shutdown: draining workers ({} ms grace)",
            self.config.shutdown_grace_ms
        );
        let grace = Duration::from_millis(self.config.shutdown_grace_ms);
        if tokio::time::timeout(grace, async {
            while workers.join_next().await.is_some() {}
        })
        .await
        .is_err()
        {
            warn!("Grace period elapsed, aborting remaining workers");
            workers.abort_all();
        }
        info!("✅ Core stopped");
        Ok(())
    }
}

fn self_publish_bundle(core: &Core, bundle: &crate::bundle_composer::Bundle) {
    core.metrics.bundles_submitted.inc();
    core.hub.publish(
        Topic::BundlesSubmitted,
        serde_json::json!({
            "bundle_id": bundle.id,
            "transactions": bundle.transactions.len(),
            "gross_profit_lamports": bundle.gross_profit_lamports,
            "expected_net_profit_lamports": bundle.expected_net_profit_lamports,
            "tip_lamports": bundle.tip_lamports,
            "strategy": format!("{:?}", bundle.strategy),
            "venue_ids": bundle.venue_ids,
        }),
    );
}
