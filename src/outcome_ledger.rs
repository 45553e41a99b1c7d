// Outcome ledger
// Append-only log of submitted bundles and their terminal outcomes,
// used for learning and reporting. Single writer behind a mutex.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;

use crate::bundle_composer::Bundle;
use crate::submission_client::SubmissionRecord;
use crate::success_model::BundleFeatures;

#[derive(Clone)]
pub struct OutcomeLedger {
    conn: Arc<Mutex<Connection>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LedgerReport {
    pub total_submitted: u64,
    pub landed: u64,
    pub failed: u64,
    pub rejected: u64,
    pub expired: u64,
    pub landed_rate: f64,
    pub total_realized_profit_lamports: i64,
    pub average_latency_ms: f64,
}

impl OutcomeLedger {
    /// Open (or create) the ledger database and apply the schema.
    pub fn new(db_path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(db_path).parent() {
            std::fs::create_dir_all(parent).context("Failed to create ledger directory")?;
        }
        let conn = Connection::open(db_path).context("Failed to open ledger database")?;
        conn.execute_batch(include_str!("../schema.sql"))
            .context("Failed to initialize ledger schema")?;
        info!("✅ Outcome ledger ready: {}", db_path);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Volatile ledger for paper runs and tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory ledger")?;
        conn.execute_batch(include_str!("../schema.sql"))
            .context("Failed to initialize ledger schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Append one terminal record. Records are never updated afterwards.
    pub fn append(
        &self,
        record: &SubmissionRecord,
        bundle: &Bundle,
        features: &BundleFeatures,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO bundle_outcomes (
                submitted_at_ns, bundle_id, terminal_state, landed_slot,
                realized_profit_lamports, latency_ns, strategy, tip_lamports, features_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.submitted_at_ns as i64,
                record.bundle_id,
                record.state.as_str(),
                record.landed_slot.map(|s| s as i64),
                record.realized_profit_lamports,
                record.observed_latency_ns.map(|l| l as i64),
                format!("{:?}", bundle.strategy),
                bundle.tip_lamports as i64,
                serde_json::to_string(features).unwrap_or_default(),
            ],
        )
        .context("Failed to append outcome record")?;
        Ok(())
    }

    /// Aggregate view over everything recorded so far.
    pub fn report(&self) -> Result<LedgerReport> {
        let conn = self.conn.lock().unwrap();
        let mut report = LedgerReport::default();

        let mut stmt = conn.prepare(
            "SELECT terminal_state, COUNT(*),
                    COALESCE(SUM(realized_profit_lamports), 0),
                    COALESCE(AVG(latency_ns), 0)
             FROM bundle_outcomes GROUP BY terminal_state",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, u64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, f64>(3)?,
            ))
        })?;

        let mut latency_weighted = 0.0;
        for row in rows {
            let (state, count, profit, avg_latency_ns) = row?;
            report.total_submitted += count;
            latency_weighted += avg_latency_ns * count as f64;
            match state.as_str() {
                "LANDED" => {
                    report.landed = count;
                    report.total_realized_profit_lamports += profit;
                }
                "FAILED" => report.failed = count,
                "REJECTED" => report.rejected = count,
                "EXPIRED" => report.expired = count,
                _ => {}
            }
        }
        if report.total_submitted > 0 {
            report.landed_rate = report.landed as f64 / report.total_submitted as f64;
            report.average_latency_ms =
                latency_weighted / report.total_submitted as f64 / 1_000_000.0;
        }
        Ok(report)
    }

    /// Number of records with the given terminal state.
    pub fn count_state(&self, state: &str) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM bundle_outcomes WHERE terminal_state = ?1",
            params![state],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Strategy;
    use crate::submission_client::BundleState;
    use solana_sdk::pubkey::Pubkey;

    fn record(id: &str, state: BundleState, profit: Option<i64>) -> SubmissionRecord {
        SubmissionRecord {
            bundle_id: id.to_string(),
            submitted_at_ns: 1_000,
            state,
            landed_slot: Some(42),
            observed_latency_ns: Some(2_000_000),
            realized_profit_lamports: profit,
        }
    }

    fn bundle(id: &str) -> Bundle {
        Bundle {
            id: id.to_string(),
            transactions: Vec::new(),
            opportunity_ids: Vec::new(),
            venue_ids: Vec::new(),
            strategy: Strategy::Balanced,
            gross_profit_lamports: 1_000_000,
            expected_net_profit_lamports: 900_000,
            gas_budget_lamports: 10_000,
            compute_budget_units: 200_000,
            aggregate_risk: 2.0,
            tip_lamports: 90_000,
            tip_account: Pubkey::new_unique(),
            composed_at_ns: 0,
        }
    }

    fn features() -> BundleFeatures {
        BundleFeatures {
            bundle_size: 2,
            tip_profit_ratio: 0.09,
            venue_landing_rate: 0.5,
            time_of_slot: 0.3,
            builder_inclusion_rate: 0.85,
        }
    }

    #[test]
    fn test_append_and_report() {
        let ledger = OutcomeLedger::in_memory().unwrap();
        ledger
            .append(&record("b-1", BundleState::Landed, Some(900_000)), &bundle("b-1"), &features())
            .unwrap();
        ledger
            .append(&record("b-2", BundleState::Failed, None), &bundle("b-2"), &features())
            .unwrap();
        ledger
            .append(&record("b-3", BundleState::Expired, None), &bundle("b-3"), &features())
            .unwrap();

        let report = ledger.report().unwrap();
        assert_eq!(report.total_submitted, 3);
        assert_eq!(report.landed, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.expired, 1);
        assert!((report.landed_rate - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(report.total_realized_profit_lamports, 900_000);
        assert!(report.average_latency_ms > 0.0);
    }

    #[test]
    fn test_append_is_idempotent_per_bundle() {
        let ledger = OutcomeLedger::in_memory().unwrap();
        let rec = record("b-1", BundleState::Landed, Some(1));
        ledger.append(&rec, &bundle("b-1"), &features()).unwrap();
        ledger.append(&rec, &bundle("b-1"), &features()).unwrap();
        assert_eq!(ledger.count_state("LANDED").unwrap(), 1);
    }
}
