// ⏰ Temporal Model - Version records for an SCD Type-2 dimension
//
// Identity persists (entity_id), values change (one VersionRecord per value).
// Each record knows when it became true (valid_from) and when it stopped
// being true (valid_to, absent while current).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::attributes::{AttributeValue, Attributes};
use crate::error::{ScdError, ScdResult};

// ============================================================================
// ENTITY ID
// ============================================================================

/// Natural key of a tracked entity (e.g. a product_id)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        EntityId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        EntityId::new(value)
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        EntityId(value)
    }
}

impl From<i64> for EntityId {
    fn from(value: i64) -> Self {
        EntityId(value.to_string())
    }
}

// ============================================================================
// SNAPSHOT ROW
// ============================================================================

/// One row of "current truth" from a full snapshot extract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRow {
    pub entity_id: EntityId,
    pub attributes: Attributes,
}

impl SnapshotRow {
    pub fn new(entity_id: impl Into<EntityId>) -> Self {
        SnapshotRow {
            entity_id: entity_id.into(),
            attributes: Attributes::new(),
        }
    }

    /// Builder: set one attribute
    pub fn with(mut self, name: &str, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(name.to_string(), value.into());
        self
    }
}

// ============================================================================
// VERSION RECORD
// ============================================================================

/// One historized row.
///
/// `valid_from` is optional only so that rows read back from external storage can
/// be represented (and flagged by the quality gate); the merge engine always sets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub surrogate_version_id: String,
    pub entity_id: EntityId,
    pub attributes: Attributes,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_to: Option<DateTime<Utc>>,
    pub is_current: bool,
}

impl VersionRecord {
    /// New current version starting at `valid_from`
    pub fn open(entity_id: EntityId, attributes: Attributes, valid_from: DateTime<Utc>) -> Self {
        VersionRecord {
            surrogate_version_id: Self::surrogate_id_for(&entity_id, valid_from),
            entity_id,
            attributes,
            valid_from: Some(valid_from),
            valid_to: None,
            is_current: true,
        }
    }

    /// Deterministic version id: sha256(entity_id | valid_from)
    pub fn surrogate_id_for(entity_id: &EntityId, valid_from: DateTime<Utc>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("{}|{}", entity_id, valid_from.to_rfc3339()));
        format!("{:x}", hasher.finalize())
    }

    /// Supersede this version
    pub fn close(&mut self, at: DateTime<Utc>) {
        self.valid_to = Some(at);
        self.is_current = false;
    }

    /// Half-open interval [valid_from, valid_to)
    pub fn was_valid_at(&self, time: DateTime<Utc>) -> bool {
        let Some(valid_from) = self.valid_from else {
            return false;
        };
        valid_from <= time && self.valid_to.map_or(true, |until| until > time)
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }
}

// ============================================================================
// CHANGESET
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    pub new_entities: usize,
    pub changed_entities: usize,
    pub unchanged_entities: usize,
    pub missing_entities: usize,
}

/// Output of one merge run. Applied all-or-nothing by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Changeset {
    pub run_timestamp: DateTime<Utc>,
    pub new_versions: Vec<VersionRecord>,
    pub closed_entity_ids: BTreeMap<EntityId, DateTime<Utc>>,
    /// Entities absent from the snapshot under the `flag` policy (not closed)
    pub flagged_missing: Vec<EntityId>,
    pub stats: MergeStats,
}

impl Changeset {
    pub fn empty(run_timestamp: DateTime<Utc>) -> Self {
        Changeset {
            run_timestamp,
            new_versions: Vec::new(),
            closed_entity_ids: BTreeMap::new(),
            flagged_missing: Vec::new(),
            stats: MergeStats::default(),
        }
    }

    /// No inserts and no closes
    pub fn is_empty(&self) -> bool {
        self.new_versions.is_empty() && self.closed_entity_ids.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} new version(s), {} closed | {} new, {} changed, {} unchanged, {} missing",
            self.new_versions.len(),
            self.closed_entity_ids.len(),
            self.stats.new_entities,
            self.stats.changed_entities,
            self.stats.unchanged_entities,
            self.stats.missing_entities
        )
    }
}

// ============================================================================
// HISTORIZED TABLE (in-memory)
// ============================================================================

/// All versions of all entities, append-only except for closing.
///
/// In-memory counterpart of the SQLite store; used for tests, point-in-time
/// queries over loaded data, and anywhere a caller wants to apply changesets
/// without storage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistorizedTable {
    versions: Vec<VersionRecord>,
}

impl HistorizedTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(versions: Vec<VersionRecord>) -> Self {
        HistorizedTable { versions }
    }

    pub fn records(&self) -> &[VersionRecord] {
        &self.versions
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// Current-flagged rows
    pub fn current(&self) -> Vec<&VersionRecord> {
        self.versions.iter().filter(|v| v.is_current).collect()
    }

    pub fn current_version(&self, entity_id: &EntityId) -> Option<&VersionRecord> {
        self.versions
            .iter()
            .find(|v| v.is_current && &v.entity_id == entity_id)
    }

    /// Every version of one entity, oldest first
    pub fn history(&self, entity_id: &EntityId) -> Vec<&VersionRecord> {
        let mut versions: Vec<&VersionRecord> = self
            .versions
            .iter()
            .filter(|v| &v.entity_id == entity_id)
            .collect();
        versions.sort_by_key(|v| v.valid_from);
        versions
    }

    /// Versions alive at `time`
    pub fn as_of(&self, time: DateTime<Utc>) -> Vec<&VersionRecord> {
        self.versions.iter().filter(|v| v.was_valid_at(time)).collect()
    }

    /// Apply a changeset atomically: every close and insert is checked before
    /// anything is mutated.
    pub fn apply(&mut self, changeset: &Changeset) -> ScdResult<()> {
        let mut close_targets = Vec::with_capacity(changeset.closed_entity_ids.len());
        for (entity_id, closed_at) in &changeset.closed_entity_ids {
            let matches: Vec<usize> = self
                .versions
                .iter()
                .enumerate()
                .filter(|(_, v)| v.is_current && &v.entity_id == entity_id)
                .map(|(i, _)| i)
                .collect();
            if matches.len() != 1 {
                return Err(ScdError::invariant(
                    entity_id,
                    format!(
                        "expected exactly one current version to close, found {}",
                        matches.len()
                    ),
                ));
            }
            close_targets.push((matches[0], *closed_at));
        }

        let known_ids: BTreeSet<&str> = self
            .versions
            .iter()
            .map(|v| v.surrogate_version_id.as_str())
            .collect();
        let mut opened = BTreeSet::new();
        for version in &changeset.new_versions {
            if known_ids.contains(version.surrogate_version_id.as_str()) {
                return Err(ScdError::invariant(
                    &version.entity_id,
                    format!(
                        "surrogate_version_id {} already exists",
                        version.surrogate_version_id
                    ),
                ));
            }
            let still_current = self.current_version(&version.entity_id).is_some()
                && !changeset.closed_entity_ids.contains_key(&version.entity_id);
            if still_current || !opened.insert(&version.entity_id) {
                return Err(ScdError::invariant(
                    &version.entity_id,
                    "new version would leave more than one current version",
                ));
            }
        }

        for (index, closed_at) in close_targets {
            self.versions[index].close(closed_at);
        }
        self.versions.extend(changeset.new_versions.iter().cloned());

        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, day, 0, 0, 0).unwrap()
    }

    fn price(p: f64) -> Attributes {
        SnapshotRow::new("1").with("title", "Mug").with("price", p).attributes
    }

    #[test]
    fn test_open_version_is_current() {
        let v = VersionRecord::open(EntityId::new("1"), price(10.0), t(1));

        assert!(v.is_current);
        assert!(v.valid_to.is_none());
        assert_eq!(v.valid_from, Some(t(1)));
        assert_eq!(v.surrogate_version_id.len(), 64);
        assert_ne!(v.surrogate_version_id, "1");
    }

    #[test]
    fn test_surrogate_id_is_deterministic() {
        let a = VersionRecord::surrogate_id_for(&EntityId::new("1"), t(1));
        let b = VersionRecord::surrogate_id_for(&EntityId::new("1"), t(1));
        let c = VersionRecord::surrogate_id_for(&EntityId::new("1"), t(2));

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_validity_interval() {
        let mut v = VersionRecord::open(EntityId::new("1"), price(10.0), t(1));
        v.close(t(5));

        assert!(!v.was_valid_at(t(1) - chrono::Duration::seconds(1)));
        assert!(v.was_valid_at(t(1)));
        assert!(v.was_valid_at(t(4)));
        assert!(!v.was_valid_at(t(5)));
        assert!(!v.is_current);
    }

    #[test]
    fn test_apply_closes_and_appends() {
        let mut table = HistorizedTable::from_records(vec![VersionRecord::open(
            EntityId::new("1"),
            price(10.0),
            t(1),
        )]);

        let mut changeset = Changeset::empty(t(2));
        changeset.closed_entity_ids.insert(EntityId::new("1"), t(2));
        changeset
            .new_versions
            .push(VersionRecord::open(EntityId::new("1"), price(13.0), t(2)));

        table.apply(&changeset).unwrap();

        let history = table.history(&EntityId::new("1"));
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].valid_to, Some(t(2)));
        assert_eq!(history[0].attribute("price"), Some(&AttributeValue::Number(10.0)));
        assert_eq!(
            table.current_version(&EntityId::new("1")).unwrap().attribute("price"),
            Some(&AttributeValue::Number(13.0))
        );
    }

    #[test]
    fn test_apply_is_all_or_nothing() {
        let original = HistorizedTable::from_records(vec![VersionRecord::open(
            EntityId::new("1"),
            price(10.0),
            t(1),
        )]);
        let mut table = original.clone();

        let mut changeset = Changeset::empty(t(2));
        changeset.closed_entity_ids.insert(EntityId::new("1"), t(2));
        changeset.closed_entity_ids.insert(EntityId::new("2"), t(2));
        changeset
            .new_versions
            .push(VersionRecord::open(EntityId::new("1"), price(13.0), t(2)));

        let err = table.apply(&changeset).unwrap_err();

        assert_eq!(err.kind(), "InvariantViolationError");
        assert_eq!(err.entity_id(), Some(&EntityId::new("2")));
        assert_eq!(table, original);
    }

    #[test]
    fn test_apply_rejects_second_current_version() {
        let mut table = HistorizedTable::from_records(vec![VersionRecord::open(
            EntityId::new("1"),
            price(10.0),
            t(1),
        )]);

        let mut changeset = Changeset::empty(t(2));
        changeset
            .new_versions
            .push(VersionRecord::open(EntityId::new("1"), price(13.0), t(2)));

        assert!(table.apply(&changeset).is_err());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_as_of_returns_one_version_per_entity() {
        let mut table = HistorizedTable::new();
        let mut first = Changeset::empty(t(1));
        first
            .new_versions
            .push(VersionRecord::open(EntityId::new("1"), price(10.0), t(1)));
        table.apply(&first).unwrap();

        let mut second = Changeset::empty(t(3));
        second.closed_entity_ids.insert(EntityId::new("1"), t(3));
        second
            .new_versions
            .push(VersionRecord::open(EntityId::new("1"), price(12.0), t(3)));
        table.apply(&second).unwrap();

        let at_two = table.as_of(t(2));
        assert_eq!(at_two.len(), 1);
        assert_eq!(at_two[0].attribute("price"), Some(&AttributeValue::Number(10.0)));

        let at_four = table.as_of(t(4));
        assert_eq!(at_four.len(), 1);
        assert_eq!(at_four[0].attribute("price"), Some(&AttributeValue::Number(12.0)));
    }
}
