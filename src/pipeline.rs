// 🔁 Pipeline - load → merge → apply → gate → backup
//
// One run = one run_timestamp = one SQLite transaction for the changeset.
// A failed gate leaves the changeset applied; the run is reported as failed
// and no backup is taken.

use anyhow::{Context, Result};
use chrono::{DateTime, SubsecRound, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::data_quality::{GateReport, QualityGate};
use crate::db::{self, Event};
use crate::error::ScdError;
use crate::merge::MergeEngine;
use crate::parser::SnapshotSource;
use crate::temporal::{EntityId, MergeStats, SnapshotRow};

/// Outcome of one successful pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: String,
    pub run_timestamp: DateTime<Utc>,
    pub stats: MergeStats,
    pub inserted: usize,
    pub closed: usize,
    pub flagged_missing: Vec<EntityId>,
    pub report: GateReport,
    pub backup_path: Option<PathBuf>,
}

impl PipelineRun {
    pub fn summary(&self) -> String {
        format!(
            "run {} @ {}: {} inserted, {} closed ({} new, {} changed, {} unchanged, {} missing)",
            self.run_id,
            self.run_timestamp.to_rfc3339(),
            self.inserted,
            self.closed,
            self.stats.new_entities,
            self.stats.changed_entities,
            self.stats.unchanged_entities,
            self.stats.missing_entities
        )
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    engine: MergeEngine,
    gate: QualityGate,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        let engine = MergeEngine::new(config.attributes.clone())
            .with_missing_policy(config.merge.on_missing);
        let gate = QualityGate::new(config.attributes.clone(), config.gate.clone());
        Pipeline {
            config,
            engine,
            gate,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn engine(&self) -> &MergeEngine {
        &self.engine
    }

    pub fn gate(&self) -> &QualityGate {
        &self.gate
    }

    pub fn run_source(
        &self,
        conn: &mut Connection,
        source: &dyn SnapshotSource,
        run_timestamp: DateTime<Utc>,
    ) -> Result<PipelineRun> {
        let snapshot = source
            .load()
            .with_context(|| format!("load snapshot from {}", source.source_name()))?;
        info!(
            source = %source.source_name(),
            loader = source.version(),
            rows = snapshot.len(),
            "snapshot ready"
        );
        self.run(conn, &snapshot, run_timestamp)
    }

    /// Merge `snapshot` into the store, apply, gate, back up.
    ///
    /// Gate failure surfaces as `ScdError::QualityGateFailure` inside the
    /// returned `anyhow::Error`. The run timestamp is cut to the store's
    /// microsecond precision before anything is derived from it.
    pub fn run(
        &self,
        conn: &mut Connection,
        snapshot: &[SnapshotRow],
        run_timestamp: DateTime<Utc>,
    ) -> Result<PipelineRun> {
        let run_timestamp = run_timestamp.trunc_subsecs(6);
        let run_id = uuid::Uuid::new_v4().to_string();
        info!(run_id = %run_id, dimension = %self.config.dimension, "pipeline run started");

        let current = db::load_current_versions(conn)?;
        let changeset = self.engine.merge(snapshot, &current, run_timestamp)?;
        let outcome = db::apply_changeset(conn, &changeset, &self.config.dimension, &run_id)?;

        if !changeset.flagged_missing.is_empty() {
            warn!(
                run_id = %run_id,
                count = changeset.flagged_missing.len(),
                "entities missing from snapshot were flagged, not closed"
            );
        }

        let report = self.evaluate_and_record(conn, run_timestamp, Some(&run_id))?;
        if !report.passed() {
            error!(run_id = %run_id, "{}", report.summary());
            return Err(ScdError::gate_failure(report).into());
        }

        let backup_path = match &self.config.storage.backup_dir {
            Some(dir) => Some(db::backup_database(
                conn,
                dir,
                &self.config.dimension,
                run_timestamp.date_naive(),
            )?),
            None => None,
        };

        let run = PipelineRun {
            run_id,
            run_timestamp,
            stats: changeset.stats,
            inserted: outcome.inserted,
            closed: outcome.closed,
            flagged_missing: changeset.flagged_missing,
            report,
            backup_path,
        };
        info!("{}", run.summary());
        Ok(run)
    }

    /// Gate the stored table as it is now, without merging.
    pub fn check(&self, conn: &Connection, now: DateTime<Utc>) -> Result<GateReport> {
        self.evaluate_and_record(conn, now, None)
    }

    fn evaluate_and_record(
        &self,
        conn: &Connection,
        now: DateTime<Utc>,
        run_id: Option<&str>,
    ) -> Result<GateReport> {
        let records = db::load_all_versions(conn)?;
        let report = self.gate.evaluate(&records, now);

        let event = Event::new(
            "quality_gate_evaluated",
            "dimension",
            &self.config.dimension,
            serde_json::json!({
                "run_id": run_id,
                "passed": report.passed(),
                "errors": report.error_count(),
                "warnings": report.warning_count(),
                "stats": report.stats,
                "findings": report.findings,
            }),
            "quality_gate",
        );
        db::insert_event(conn, &event)?;

        Ok(report)
    }
}
