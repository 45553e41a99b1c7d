//! Optimal bundle composition.
//!
//! Greedy profit-ordered selection under cardinality and compute ceilings,
//! dependency-aware topological ordering with a writer-precedence tiebreak,
//! per-transaction compute budgeting, a terminal tip transaction, and
//! simulate-validate with bounded rebuilds. Composition is best-effort:
//! abandonment is reported to the caller, never retried implicitly.

use parking_lot::Mutex;
use serde::Serialize;
use solana_sdk::compute_budget::ComputeBudgetInstruction;
use solana_sdk::hash::Hash;
use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signer};
use solana_sdk::system_instruction;
use solana_sdk::transaction::Transaction;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chain_client::ChainInterface;
use crate::clock::Clock;
use crate::config::Strategy;
use crate::error::{AbandonReason, PipelineError};
use crate::gas_estimator::{self, budget_with_margin, NetworkContext};
use crate::opportunity::{Opportunity, OpportunityKind};
use crate::submission_client::tip_fraction;
use crate::success_model::SuccessModel;

/// Compute units reserved for the terminal tip transaction.
const TIP_TX_COMPUTE_UNITS: u64 = 5_000;

/// An ordered, atomic group of transactions ready for the block engine.
/// Tip transaction is always last.
#[derive(Debug, Clone)]
pub struct Bundle {
    pub id: String,
    pub transactions: Vec<Transaction>,
    pub opportunity_ids: Vec<String>,
    pub venue_ids: Vec<String>,
    pub strategy: Strategy,
    pub gross_profit_lamports: u64,
    pub expected_net_profit_lamports: i128,
    pub gas_budget_lamports: u64,
    pub compute_budget_units: u64,
    pub aggregate_risk: f64,
    pub tip_lamports: u64,
    pub tip_account: Pubkey,
    pub composed_at_ns: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ComposerStats {
    pub bundles_composed: u64,
    pub candidates_seen: u64,
    pub candidates_admitted: u64,
    pub simulation_retries: u64,
    pub abandoned: u64,
}

#[derive(Debug, Clone)]
pub struct ComposerConfig {
    pub max_bundle_txs: usize,
    pub max_bundle_compute: u64,
    pub safety_margin_bps: u32,
    pub max_compose_retries: u32,
    pub strategy: Strategy,
    pub min_tip: u64,
    pub max_tip: u64,
    pub tip_accounts: Vec<Pubkey>,
    /// Program the opportunity transactions invoke.
    pub executor_program: Pubkey,
}

pub struct BundleComposer {
    chain: Arc<dyn ChainInterface>,
    model: Arc<SuccessModel>,
    clock: Clock,
    keypair: Arc<Keypair>,
    config: ComposerConfig,
    network: Mutex<NetworkContext>,
    recent_blockhash: Mutex<Hash>,
    stats: Mutex<ComposerStats>,
}

impl BundleComposer {
    pub fn new(
        chain: Arc<dyn ChainInterface>,
        model: Arc<SuccessModel>,
        clock: Clock,
        keypair: Arc<Keypair>,
        config: ComposerConfig,
    ) -> Self {
        Self {
            chain,
            model,
            clock,
            keypair,
            config,
            network: Mutex::new(NetworkContext::default()),
            recent_blockhash: Mutex::new(Hash::default()),
            stats: Mutex::new(ComposerStats::default()),
        }
    }

    pub fn set_recent_blockhash(&self, hash: Hash) {
        *self.recent_blockhash.lock() = hash;
    }

    pub fn set_network_context(&self, ctx: NetworkContext) {
        *self.network.lock() = ctx;
    }

    pub fn stats(&self) -> ComposerStats {
        self.stats.lock().clone()
    }

    /// Compose one bundle from the candidate set. Deterministic: identical
    /// candidates, market state and config yield an identical ordering.
    pub async fn compose(
        &self,
        candidates: Vec<Opportunity>,
        deadline: Instant,
    ) -> Result<Bundle, PipelineError> {
        self.stats.lock().candidates_seen += candidates.len() as u64;
        if candidates.is_empty() {
            self.stats.lock().abandoned += 1;
            return Err(PipelineError::CompositionAbandoned(AbandonReason::EmptyInput));
        }

        let mut admitted = self.select(candidates);
        if admitted.is_empty() {
            self.stats.lock().abandoned += 1;
            return Err(PipelineError::CompositionAbandoned(
                AbandonReason::NothingAdmissible,
            ));
        }
        self.stats.lock().candidates_admitted += admitted.len() as u64;

        for attempt in 0..=self.config.max_compose_retries {
            if Instant::now() >= deadline {
                return Err(PipelineError::Timeout("composition"));
            }
            if admitted.is_empty() {
                self.stats.lock().abandoned += 1;
                return Err(PipelineError::CompositionAbandoned(
                    AbandonReason::NothingAdmissible,
                ));
            }

            let ordered = order_acyclic(&mut admitted);
            let (transactions, positions) = self.build_transactions(&ordered)?;
            let bundle = self.attach_tip(&ordered, transactions)?;

            match self.chain.simulate_bundle(&bundle.transactions).await {
                Ok(result) => match result.first_failure() {
                    None => {
                        self.stats.lock().bundles_composed += 1;
                        info!(
                            "📦 Composed bundle {}: {} txs, net {} lamports, tip {}",
                            bundle.id,
                            bundle.transactions.len(),
                            bundle.expected_net_profit_lamports,
                            bundle.tip_lamports
                        );
                        return Ok(bundle);
                    }
                    Some((position, reason)) => {
                        self.stats.lock().simulation_retries += 1;
                        if attempt == self.config.max_compose_retries {
                            break;
                        }
                        // Drop the opportunity behind the failing position
                        // and rebuild from the ordering step.
                        match positions.get(position) {
                            Some(&opp_index) => {
                                let dropped = ordered[opp_index].id.clone();
                                warn!(
                                    "Simulation failed at position {} ({}), dropping {}",
                                    position, reason, dropped
                                );
                                admitted = ordered;
                                admitted.remove(opp_index);
                            }
                            None => {
                                // The tip transaction itself failed; nothing
                                // sensible left to drop.
                                warn!("Simulation failed at tip position: {}", reason);
                                break;
                            }
                        }
                    }
                },
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => {
                    return Err(PipelineError::SimulationFailed {
                        position: 0,
                        reason: e.to_string(),
                    })
                }
            }
        }

        self.stats.lock().abandoned += 1;
        Err(PipelineError::CompositionAbandoned(
            AbandonReason::RetriesExhausted,
        ))
    }

    /// Greedy admission in descending net-expected-profit order under the
    /// strategy filter and both bundle ceilings.
    fn select(&self, mut candidates: Vec<Opportunity>) -> Vec<Opportunity> {
        let strategy = self.config.strategy;
        candidates.retain(|opp| {
            opp.risk_score <= strategy.max_risk_score() && opp.confidence >= strategy.min_confidence()
        });
        // Deterministic: profit desc, id as the final tiebreak.
        candidates.sort_by(|a, b| {
            b.net_expected_profit()
                .cmp(&a.net_expected_profit())
                .then_with(|| a.id.cmp(&b.id))
        });

        let tx_budget = self.config.max_bundle_txs.saturating_sub(1); // tip slot
        let compute_ceiling = self
            .config
            .max_bundle_compute
            .saturating_sub(TIP_TX_COMPUTE_UNITS);

        let mut admitted = Vec::new();
        let mut tx_count = 0usize;
        let mut compute_total = 0u64;
        for opp in candidates {
            let txs = transactions_for(&opp.kind);
            let compute = self.budgeted_compute(&opp.kind);
            if tx_count + txs > tx_budget {
                continue;
            }
            if compute_total + compute > compute_ceiling {
                continue;
            }
            tx_count += txs;
            compute_total += compute;
            admitted.push(opp);
        }
        admitted
    }

    fn budgeted_compute(&self, kind: &OpportunityKind) -> u64 {
        let estimate = gas_estimator::estimate(kind, &self.network.lock());
        let per_tx = estimate.compute_units / transactions_for(kind) as u64;
        budget_with_margin(per_tx, self.config.safety_margin_bps) as u64
            * transactions_for(kind) as u64
    }

    /// Build the opportunity transactions in order. Returns the transactions
    /// plus a position -> opportunity-index map for failure attribution.
    fn build_transactions(
        &self,
        ordered: &[Opportunity],
    ) -> Result<(Vec<Transaction>, Vec<usize>), PipelineError> {
        let blockhash = *self.recent_blockhash.lock();
        let mut transactions = Vec::new();
        let mut positions = Vec::new();

        for (index, opp) in ordered.iter().enumerate() {
            let per_tx_units = {
                let estimate = gas_estimator::estimate(&opp.kind, &self.network.lock());
                budget_with_margin(
                    estimate.compute_units / transactions_for(&opp.kind) as u64,
                    self.config.safety_margin_bps,
                )
            };
            for stage in 0..transactions_for(&opp.kind) {
                let mut instructions =
                    vec![ComputeBudgetInstruction::set_compute_unit_limit(per_tx_units)];
                instructions.push(self.plan_instruction(opp, stage as u8)?);
                let tx = Transaction::new_signed_with_payer(
                    &instructions,
                    Some(&self.keypair.pubkey()),
                    &[self.keypair.as_ref()],
                    blockhash,
                );
                transactions.push(tx);
                positions.push(index);
            }
        }
        Ok((transactions, positions))
    }

    /// The executor-program instruction carrying an opportunity's inputs.
    fn plan_instruction(
        &self,
        opp: &Opportunity,
        stage: u8,
    ) -> Result<Instruction, PipelineError> {
        let mut data = vec![stage];
        let payload = serde_json::to_vec(&opp.kind)
            .map_err(|e| PipelineError::Decode(format!("plan encoding: {}", e)))?;
        data.extend_from_slice(&payload);

        let mut accounts: Vec<AccountMeta> = opp
            .accounts
            .writable
            .iter()
            .map(|a| AccountMeta::new(*a, false))
            .collect();
        accounts.extend(
            opp.accounts
                .readable
                .iter()
                .map(|a| AccountMeta::new_readonly(*a, false)),
        );

        Ok(Instruction {
            program_id: self.config.executor_program,
            accounts,
            data,
        })
    }

    /// Append the terminal tip transaction and assemble the bundle record.
    fn attach_tip(
        &self,
        ordered: &[Opportunity],
        mut transactions: Vec<Transaction>,
    ) -> Result<Bundle, PipelineError> {
        let gross: u64 = ordered.iter().map(|o| o.gross_profit_lamports).sum();
        let gas: u64 = ordered.iter().map(|o| o.estimated_gas_lamports).sum();
        let venue_ids: Vec<String> = ordered
            .iter()
            .flat_map(|o| match &o.kind {
                OpportunityKind::Arbitrage { venue_ids, .. } => venue_ids.clone(),
                OpportunityKind::Liquidation { protocol, .. } => vec![protocol.clone()],
                OpportunityKind::Sandwich { .. } => Vec::new(),
            })
            .collect();

        let competition = self.model.competition(&venue_ids);
        let tip = ((gross as f64 * tip_fraction(competition)) as u64)
            .clamp(self.config.min_tip, self.config.max_tip);

        let tip_account =
            self.config.tip_accounts[fastrand::usize(..self.config.tip_accounts.len())];
        let blockhash = *self.recent_blockhash.lock();
        let tip_instructions = [
            ComputeBudgetInstruction::set_compute_unit_price(50_000),
            system_instruction::transfer(&self.keypair.pubkey(), &tip_account, tip),
        ];
        let tip_tx = Transaction::new_signed_with_payer(
            &tip_instructions,
            Some(&self.keypair.pubkey()),
            &[self.keypair.as_ref()],
            blockhash,
        );
        transactions.push(tip_tx);

        debug_assert!(transactions.len() <= self.config.max_bundle_txs);

        let compute_budget_units: u64 = ordered
            .iter()
            .map(|o| self.budgeted_compute(&o.kind))
            .sum::<u64>()
            + TIP_TX_COMPUTE_UNITS;
        let aggregate_risk = ordered.iter().map(|o| o.risk_score).fold(0.0, f64::max);

        Ok(Bundle {
            id: Uuid::new_v4().to_string(),
            transactions,
            opportunity_ids: ordered.iter().map(|o| o.id.clone()).collect(),
            venue_ids,
            strategy: self.config.strategy,
            gross_profit_lamports: gross,
            expected_net_profit_lamports: gross as i128 - gas as i128 - tip as i128,
            gas_budget_lamports: gas,
            compute_budget_units,
            aggregate_risk,
            tip_lamports: tip,
            tip_account,
            composed_at_ns: self.clock.now_ns(),
        })
    }
}

fn transactions_for(kind: &OpportunityKind) -> usize {
    match kind {
        // One swap transaction per hop; bundle atomicity closes the cycle.
        OpportunityKind::Arbitrage { path, .. } => path.len().max(1),
        // Front-run and back-run.
        OpportunityKind::Sandwich { .. } => 2,
        OpportunityKind::Liquidation { .. } => 1,
    }
}

/// Dependency-aware ordering. A precedes B when A writes an account B reads
/// (writer precedence) or A reads an account B writes (write-after-read).
/// Ready-set ties break by descending gross profit; cycles evict their
/// lowest-profit participant until the graph is acyclic.
fn order_acyclic(admitted: &mut Vec<Opportunity>) -> Vec<Opportunity> {
    loop {
        let n = admitted.len();
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut indegree = vec![0usize; n];

        for i in 0..n {
            for j in 0..n {
                if i == j {
                    continue;
                }
                let a = &admitted[i].accounts;
                let b = &admitted[j].accounts;
                let writer_before_reader =
                    a.writable.iter().any(|acc| b.readable.contains(acc));
                let read_before_write = a.readable.iter().any(|acc| b.writable.contains(acc));
                if writer_before_reader || read_before_write {
                    successors[i].push(j);
                    indegree[j] += 1;
                }
            }
        }

        let mut order = Vec::with_capacity(n);
        let mut ready: Vec<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
        let mut placed = vec![false; n];
        while !ready.is_empty() {
            // Writer precedence: highest gross profit goes first, id breaks
            // exact ties deterministically.
            ready.sort_by(|&x, &y| {
                admitted[y]
                    .gross_profit_lamports
                    .cmp(&admitted[x].gross_profit_lamports)
                    .then_with(|| admitted[x].id.cmp(&admitted[y].id))
            });
            let next = ready.remove(0);
            placed[next] = true;
            order.push(next);
            for &succ in &successors[next] {
                indegree[succ] -= 1;
                if indegree[succ] == 0 && !placed[succ] {
                    ready.push(succ);
                }
            }
        }

        if order.len() == n {
            let mut by_index: Vec<Option<Opportunity>> =
                admitted.drain(..).map(Some).collect();
            return order
                .into_iter()
                .map(|i| by_index[i].take().expect("each index placed once"))
                .collect();
        }

        // Cycle: evict the lowest-profit unplaced participant and retry.
        let victim = (0..n)
            .filter(|&i| !placed[i])
            .min_by(|&x, &y| {
                admitted[x]
                    .gross_profit_lamports
                    .cmp(&admitted[y].gross_profit_lamports)
                    .then_with(|| admitted[y].id.cmp(&admitted[x].id))
            })
            .expect("cycle implies unplaced nodes");
        debug!(
            "Dependency cycle: evicting {} ({} lamports)",
            admitted[victim].id, admitted[victim].gross_profit_lamports
        );
        admitted.remove(victim);
    }
}
