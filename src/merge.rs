// 🔀 SCD2 Merge Engine - snapshot vs current table → Changeset
//
// New entity        → insert first version
// Changed entity    → close current version, insert successor
// Unchanged entity  → no-op
// Vanished entity   → per MissingPolicy (default: leave it alone)
//
// Pure: no I/O, one run_timestamp per call, full result or an error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use crate::attributes::AttributeSet;
use crate::error::{ScdError, ScdResult};
use crate::temporal::{Changeset, EntityId, SnapshotRow, VersionRecord};

// ============================================================================
// MISSING POLICY
// ============================================================================

/// What to do with entities that have a current version but are absent from
/// the snapshot. A missing row may be a partial extract, so nothing is closed
/// unless asked for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingPolicy {
    #[default]
    Ignore,
    Close,
    Flag,
}

impl MissingPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MissingPolicy::Ignore => "ignore",
            MissingPolicy::Close => "close",
            MissingPolicy::Flag => "flag",
        }
    }
}

// ============================================================================
// MERGE ENGINE
// ============================================================================

#[derive(Debug, Clone)]
pub struct MergeEngine {
    attributes: AttributeSet,
    on_missing: MissingPolicy,
}

impl MergeEngine {
    pub fn new(attributes: AttributeSet) -> Self {
        MergeEngine {
            attributes,
            on_missing: MissingPolicy::default(),
        }
    }

    pub fn with_missing_policy(mut self, on_missing: MissingPolicy) -> Self {
        self.on_missing = on_missing;
        self
    }

    pub fn attributes(&self) -> &AttributeSet {
        &self.attributes
    }

    pub fn missing_policy(&self) -> MissingPolicy {
        self.on_missing
    }

    /// Compute the changeset for one snapshot.
    ///
    /// `current` may contain historical rows too; only current-flagged rows are
    /// considered.
    pub fn merge(
        &self,
        snapshot: &[SnapshotRow],
        current: &[VersionRecord],
        run_timestamp: DateTime<Utc>,
    ) -> ScdResult<Changeset> {
        self.validate_snapshot(snapshot)?;
        let current_by_id = index_current(current)?;

        let mut changeset = Changeset::empty(run_timestamp);
        let mut seen = BTreeSet::new();

        for row in snapshot {
            seen.insert(&row.entity_id);

            match current_by_id.get(&row.entity_id) {
                None => {
                    changeset.new_versions.push(VersionRecord::open(
                        row.entity_id.clone(),
                        row.attributes.clone(),
                        run_timestamp,
                    ));
                    changeset.stats.new_entities += 1;
                }
                Some(existing) => {
                    if self
                        .attributes
                        .tracked_equal(&existing.attributes, &row.attributes)
                    {
                        changeset.stats.unchanged_entities += 1;
                        continue;
                    }

                    ensure_closable(existing, run_timestamp)?;
                    debug!(
                        entity_id = %row.entity_id,
                        changed = ?self
                            .attributes
                            .changed_fields(&existing.attributes, &row.attributes),
                        "tracked attributes changed"
                    );

                    changeset
                        .closed_entity_ids
                        .insert(row.entity_id.clone(), run_timestamp);
                    changeset.new_versions.push(VersionRecord::open(
                        row.entity_id.clone(),
                        row.attributes.clone(),
                        run_timestamp,
                    ));
                    changeset.stats.changed_entities += 1;
                }
            }
        }

        for (entity_id, existing) in &current_by_id {
            if seen.contains(*entity_id) {
                continue;
            }
            changeset.stats.missing_entities += 1;

            match self.on_missing {
                MissingPolicy::Ignore => {}
                MissingPolicy::Close => {
                    ensure_closable(existing, run_timestamp)?;
                    changeset
                        .closed_entity_ids
                        .insert((*entity_id).clone(), run_timestamp);
                }
                MissingPolicy::Flag => changeset.flagged_missing.push((*entity_id).clone()),
            }
        }

        if changeset.stats.missing_entities > 0 {
            warn!(
                missing = changeset.stats.missing_entities,
                policy = self.on_missing.as_str(),
                "current entities absent from snapshot"
            );
        }

        info!(
            run_timestamp = %run_timestamp,
            snapshot_rows = snapshot.len(),
            inserted = changeset.new_versions.len(),
            closed = changeset.closed_entity_ids.len(),
            new = changeset.stats.new_entities,
            changed = changeset.stats.changed_entities,
            unchanged = changeset.stats.unchanged_entities,
            "merge computed"
        );

        Ok(changeset)
    }

    /// Reject the whole snapshot on the first malformed row
    fn validate_snapshot(&self, snapshot: &[SnapshotRow]) -> ScdResult<()> {
        let mut seen = BTreeSet::new();

        for (position, row) in snapshot.iter().enumerate() {
            if row.entity_id.is_empty() {
                return Err(ScdError::input(format!(
                    "snapshot row {} has an empty entity_id",
                    position + 1
                )));
            }

            if !seen.insert(&row.entity_id) {
                return Err(ScdError::input_for(
                    &row.entity_id,
                    "duplicate entity_id in snapshot",
                ));
            }

            let violations = self.attributes.validate(&row.attributes);
            if !violations.is_empty() {
                let details: Vec<String> = violations.iter().map(ToString::to_string).collect();
                return Err(ScdError::input_for(&row.entity_id, details.join("; ")));
            }
        }

        Ok(())
    }
}

/// Current rows keyed by entity; more than one current row is pre-existing
/// corruption and is never resolved by guessing.
fn index_current(current: &[VersionRecord]) -> ScdResult<BTreeMap<&EntityId, &VersionRecord>> {
    let mut by_id: BTreeMap<&EntityId, &VersionRecord> = BTreeMap::new();

    for record in current.iter().filter(|r| r.is_current) {
        if by_id.insert(&record.entity_id, record).is_some() {
            let count = current
                .iter()
                .filter(|r| r.is_current && r.entity_id == record.entity_id)
                .count();
            return Err(ScdError::invariant(
                &record.entity_id,
                format!("{} current versions in historized table", count),
            ));
        }
    }

    Ok(by_id)
}

/// Closing at `run_timestamp` requires valid_to > valid_from
fn ensure_closable(existing: &VersionRecord, run_timestamp: DateTime<Utc>) -> ScdResult<()> {
    match existing.valid_from {
        None => Err(ScdError::invariant(
            &existing.entity_id,
            "current version has no valid_from",
        )),
        Some(valid_from) if valid_from >= run_timestamp => Err(ScdError::input_for(
            &existing.entity_id,
            format!(
                "run timestamp {} does not follow valid_from {} of the current version",
                run_timestamp.to_rfc3339(),
                valid_from.to_rfc3339()
            ),
        )),
        Some(_) => Ok(()),
    }
}

// ============================================================================
// TESTS
// ============================================================================
