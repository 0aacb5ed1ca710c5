// ✅ Quality Gate - invariant checks over the historized table
//
// Every check runs, even after an earlier one fails, so a single run surfaces
// the complete set of problems. The verdict is computed afterwards:
// fail iff any finding has severity Error. The gate never mutates data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{info, warn};

use crate::attributes::AttributeSet;
use crate::config::GateConfig;
use crate::error::{ScdError, ScdResult};
use crate::temporal::{EntityId, VersionRecord};

// ============================================================================
// FINDINGS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,   // Blocks publication
    Warning, // Reported, does not block
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckCode {
    EmptyTable,
    LowVolume,
    NoCurrentRecords,
    InvalidDomainValue,
    MissingRequiredField,
    DuplicateCurrentRecord,
    OpenHistoricalRecord,
    StaleData,
    ClosedCurrentRecord,
    InvertedValidity,
}

impl CheckCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckCode::EmptyTable => "EMPTY_TABLE",
            CheckCode::LowVolume => "LOW_VOLUME",
            CheckCode::NoCurrentRecords => "NO_CURRENT_RECORDS",
            CheckCode::InvalidDomainValue => "INVALID_DOMAIN_VALUE",
            CheckCode::MissingRequiredField => "MISSING_REQUIRED_FIELD",
            CheckCode::DuplicateCurrentRecord => "DUPLICATE_CURRENT_RECORD",
            CheckCode::OpenHistoricalRecord => "OPEN_HISTORICAL_RECORD",
            CheckCode::StaleData => "STALE_DATA",
            CheckCode::ClosedCurrentRecord => "CLOSED_CURRENT_RECORD",
            CheckCode::InvertedValidity => "INVERTED_VALIDITY",
        }
    }
}

impl fmt::Display for CheckCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    pub code: CheckCode,
    pub message: String,
    pub affected_count: usize,
}

impl Finding {
    pub fn error(code: CheckCode, affected_count: usize, message: impl Into<String>) -> Self {
        Finding {
            severity: Severity::Error,
            code,
            message: message.into(),
            affected_count,
        }
    }

    pub fn warning(code: CheckCode, affected_count: usize, message: impl Into<String>) -> Self {
        Finding {
            severity: Severity::Warning,
            code,
            message: message.into(),
            affected_count,
        }
    }

    pub fn is_blocking(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.severity {
            Severity::Error => "ERROR",
            Severity::Warning => "WARNING",
        };
        write!(
            f,
            "[{}] {}: {} (affected: {})",
            level, self.code, self.message, self.affected_count
        )
    }
}

// ============================================================================
// GATE REPORT
// ============================================================================

/// Row counts gathered while checking (check 3 is informational only)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStats {
    pub total_rows: usize,
    pub current_rows: usize,
    pub historical_rows: usize,
    pub latest_valid_from: Option<DateTime<Utc>>,
}

impl TableStats {
    fn collect(records: &[VersionRecord]) -> Self {
        let current_rows = records.iter().filter(|r| r.is_current).count();
        TableStats {
            total_rows: records.len(),
            current_rows,
            historical_rows: records.len() - current_rows,
            latest_valid_from: records.iter().filter_map(|r| r.valid_from).max(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateReport {
    pub evaluated_at: DateTime<Utc>,
    pub stats: TableStats,
    pub findings: Vec<Finding>,
}

impl GateReport {
    pub fn passed(&self) -> bool {
        !self.findings.iter().any(Finding::is_blocking)
    }

    pub fn errors(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.severity == Severity::Warning)
    }

    pub fn error_count(&self) -> usize {
        self.errors().count()
    }

    pub fn warning_count(&self) -> usize {
        self.warnings().count()
    }

    pub fn has_code(&self, code: CheckCode) -> bool {
        self.findings.iter().any(|f| f.code == code)
    }

    pub fn summary(&self) -> String {
        format!(
            "{}: {} rows ({} current, {} historical) | {} error(s), {} warning(s)",
            if self.passed() { "PASSED" } else { "FAILED" },
            self.stats.total_rows,
            self.stats.current_rows,
            self.stats.historical_rows,
            self.error_count(),
            self.warning_count()
        )
    }
}

// ============================================================================
// CHECKS
// ============================================================================

struct GateContext<'a> {
    records: &'a [VersionRecord],
    attributes: &'a AttributeSet,
    config: &'a GateConfig,
    stats: &'a TableStats,
    now: DateTime<Utc>,
}

type Check = fn(&GateContext<'_>) -> Option<Finding>;

/// The fixed battery, in reporting order. Each check sees the whole table and
/// nothing from the other checks.
const CHECKS: &[Check] = &[
    check_non_empty,
    check_low_volume,
    check_current_exists,
    check_domain_validity,
    check_required_fields,
    check_current_uniqueness,
    check_closed_completeness,
    check_freshness,
    check_current_not_closed,
    check_validity_order,
];

fn check_non_empty(ctx: &GateContext<'_>) -> Option<Finding> {
    (ctx.stats.total_rows == 0)
        .then(|| Finding::error(CheckCode::EmptyTable, 0, "no rows in dimension table"))
}

fn check_low_volume(ctx: &GateContext<'_>) -> Option<Finding> {
    let total = ctx.stats.total_rows;
    (total > 0 && total < ctx.config.min_row_floor).then(|| {
        Finding::warning(
            CheckCode::LowVolume,
            total,
            format!(
                "only {} rows in dimension (expected at least {})",
                total, ctx.config.min_row_floor
            ),
        )
    })
}

fn check_current_exists(ctx: &GateContext<'_>) -> Option<Finding> {
    (ctx.stats.current_rows == 0)
        .then(|| Finding::error(CheckCode::NoCurrentRecords, 0, "no current records found"))
}

fn check_domain_validity(ctx: &GateContext<'_>) -> Option<Finding> {
    let positive: Vec<&str> = ctx.attributes.positive().map(|d| d.name.as_str()).collect();
    if positive.is_empty() {
        return None;
    }

    let invalid = ctx
        .records
        .iter()
        .filter(|r| {
            positive
                .iter()
                .any(|name| ctx.attributes.positive_value(&r.attributes, name).is_none())
        })
        .count();

    (invalid > 0).then(|| {
        Finding::error(
            CheckCode::InvalidDomainValue,
            invalid,
            format!(
                "{} record(s) with {} absent or <= 0",
                invalid,
                positive.join("/")
            ),
        )
    })
}

fn check_required_fields(ctx: &GateContext<'_>) -> Option<Finding> {
    let required: Vec<&str> = ctx.attributes.required().map(|d| d.name.as_str()).collect();

    let incomplete = ctx
        .records
        .iter()
        .filter(|r| {
            r.entity_id.is_empty()
                || r.valid_from.is_none()
                || required
                    .iter()
                    .any(|name| ctx.attributes.is_missing(&r.attributes, name))
        })
        .count();

    (incomplete > 0).then(|| {
        Finding::error(
            CheckCode::MissingRequiredField,
            incomplete,
            format!(
                "{} record(s) missing entity_id, valid_from or a required attribute",
                incomplete
            ),
        )
    })
}

fn check_current_uniqueness(ctx: &GateContext<'_>) -> Option<Finding> {
    let mut current_per_entity: BTreeMap<&EntityId, usize> = BTreeMap::new();
    for record in ctx.records.iter().filter(|r| r.is_current) {
        *current_per_entity.entry(&record.entity_id).or_default() += 1;
    }

    let duplicated: Vec<&EntityId> = current_per_entity
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(id, _)| id)
        .collect();

    (!duplicated.is_empty()).then(|| {
        let sample: Vec<&str> = duplicated.iter().take(5).map(|id| id.as_str()).collect();
        Finding::error(
            CheckCode::DuplicateCurrentRecord,
            duplicated.len(),
            format!(
                "{} entities with multiple current records (e.g. {})",
                duplicated.len(),
                sample.join(", ")
            ),
        )
    })
}

fn check_closed_completeness(ctx: &GateContext<'_>) -> Option<Finding> {
    let open = ctx
        .records
        .iter()
        .filter(|r| !r.is_current && r.valid_to.is_none())
        .count();

    (open > 0).then(|| {
        Finding::error(
            CheckCode::OpenHistoricalRecord,
            open,
            format!("{} historical record(s) without valid_to", open),
        )
    })
}

fn check_freshness(ctx: &GateContext<'_>) -> Option<Finding> {
    let latest = ctx.stats.latest_valid_from?;
    let age = ctx.now - latest;

    (age > ctx.config.freshness_window()).then(|| {
        Finding::warning(
            CheckCode::StaleData,
            0,
            format!(
                "latest valid_from {} is older than {}h",
                latest.to_rfc3339(),
                ctx.config.freshness_window_hours
            ),
        )
    })
}

fn check_current_not_closed(ctx: &GateContext<'_>) -> Option<Finding> {
    let closed = ctx
        .records
        .iter()
        .filter(|r| r.is_current && r.valid_to.is_some())
        .count();

    (closed > 0).then(|| {
        Finding::error(
            CheckCode::ClosedCurrentRecord,
            closed,
            format!("{} current record(s) with a valid_to", closed),
        )
    })
}

fn check_validity_order(ctx: &GateContext<'_>) -> Option<Finding> {
    let inverted = ctx
        .records
        .iter()
        .filter(|r| matches!((r.valid_from, r.valid_to), (Some(from), Some(to)) if to < from))
        .count();

    (inverted > 0).then(|| {
        Finding::error(
            CheckCode::InvertedValidity,
            inverted,
            format!("{} record(s) with valid_to before valid_from", inverted),
        )
    })
}

// ============================================================================
// QUALITY GATE
// ============================================================================

#[derive(Debug, Clone)]
pub struct QualityGate {
    attributes: AttributeSet,
    config: GateConfig,
}

impl QualityGate {
    pub fn new(attributes: AttributeSet, config: GateConfig) -> Self {
        QualityGate { attributes, config }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Run every check and collect findings. Never fails.
    pub fn evaluate(&self, records: &[VersionRecord], now: DateTime<Utc>) -> GateReport {
        let stats = TableStats::collect(records);
        let ctx = GateContext {
            records,
            attributes: &self.attributes,
            config: &self.config,
            stats: &stats,
            now,
        };

        let findings: Vec<Finding> = CHECKS.iter().filter_map(|check| check(&ctx)).collect();

        for finding in &findings {
            match finding.severity {
                Severity::Error => warn!(
                    code = %finding.code,
                    affected = finding.affected_count,
                    "{}",
                    finding.message
                ),
                Severity::Warning => info!(
                    code = %finding.code,
                    affected = finding.affected_count,
                    "{}",
                    finding.message
                ),
            }
        }

        let report = GateReport {
            evaluated_at: now,
            stats,
            findings,
        };
        info!(
            passed = report.passed(),
            total = report.stats.total_rows,
            current = report.stats.current_rows,
            historical = report.stats.historical_rows,
            "quality gate evaluated"
        );
        report
    }

    /// Like [`evaluate`](Self::evaluate), but any error finding becomes
    /// `QualityGateFailure` carrying the full report.
    pub fn enforce(&self, records: &[VersionRecord], now: DateTime<Utc>) -> ScdResult<GateReport> {
        let report = self.evaluate(records, now);
        if report.passed() {
            Ok(report)
        } else {
            Err(ScdError::gate_failure(report))
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
