// 📥 Snapshot Loader - full-extract CSV → SnapshotRow
//
// One header row, one row per entity. The key column becomes the entity_id,
// every other column becomes an attribute. Empty cells are absent attributes.
// Declared number/boolean attributes are typed here; undeclared columns stay text.

use anyhow::{Context, Result};
use csv::ReaderBuilder;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::attributes::{AttributeSet, AttributeType, AttributeValue};
use crate::error::ScdError;
use crate::temporal::{EntityId, SnapshotRow};

// ============================================================================
// SOURCE TRAIT
// ============================================================================

/// Anything that can hand the pipeline one full snapshot.
///
/// The pipeline only needs rows; where they come from (CSV extract, another
/// store, a test fixture) is the implementor's business.
pub trait SnapshotSource: Send + Sync {
    fn load(&self) -> Result<Vec<SnapshotRow>>;

    /// Human-readable origin, for logs and the audit trail
    fn source_name(&self) -> String;

    /// Loader version (for provenance tracking)
    fn version(&self) -> &str {
        "1.0.0"
    }
}

/// In-memory rows, mostly for tests and embedding callers
pub struct StaticSnapshot {
    name: String,
    rows: Vec<SnapshotRow>,
}

impl StaticSnapshot {
    pub fn new(name: impl Into<String>, rows: Vec<SnapshotRow>) -> Self {
        StaticSnapshot {
            name: name.into(),
            rows,
        }
    }
}

impl SnapshotSource for StaticSnapshot {
    fn load(&self) -> Result<Vec<SnapshotRow>> {
        Ok(self.rows.clone())
    }

    fn source_name(&self) -> String {
        self.name.clone()
    }
}

// ============================================================================
// CSV SNAPSHOT
// ============================================================================

pub struct CsvSnapshot {
    path: PathBuf,
    key_column: String,
    attributes: AttributeSet,
}

impl CsvSnapshot {
    pub fn new(
        path: impl Into<PathBuf>,
        key_column: impl Into<String>,
        attributes: AttributeSet,
    ) -> Self {
        CsvSnapshot {
            path: path.into(),
            key_column: key_column.into(),
            attributes,
        }
    }
}

impl SnapshotSource for CsvSnapshot {
    fn load(&self) -> Result<Vec<SnapshotRow>> {
        load_snapshot_csv(&self.path, &self.key_column, &self.attributes)
    }

    fn source_name(&self) -> String {
        self.path.display().to_string()
    }
}

pub fn load_snapshot_csv(
    path: &Path,
    key_column: &str,
    attributes: &AttributeSet,
) -> Result<Vec<SnapshotRow>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open snapshot: {}", path.display()))?;
    let rows = parse_snapshot(file, key_column, attributes)
        .with_context(|| format!("Failed to load snapshot {}", path.display()))?;

    info!(path = %path.display(), rows = rows.len(), "snapshot loaded");
    Ok(rows)
}

/// Parse CSV snapshot data from any reader.
///
/// Duplicate keys are kept (and logged) so the merge engine can reject the
/// snapshot as a whole.
pub fn parse_snapshot<R: Read>(
    reader: R,
    key_column: &str,
    attributes: &AttributeSet,
) -> Result<Vec<SnapshotRow>> {
    let mut reader = ReaderBuilder::new().has_headers(true).from_reader(reader);

    let headers = reader.headers().context("Failed to read CSV header")?.clone();
    let headers: Vec<String> = headers.iter().map(|h| h.trim().to_string()).collect();
    let key_index = headers
        .iter()
        .position(|h| h == key_column)
        .ok_or_else(|| {
            ScdError::input(format!("key column '{}' not found in header", key_column))
        })?;

    let mut rows = Vec::new();
    for (line_num, result) in reader.records().enumerate() {
        // +2: 1-indexed plus header row
        let record = result.with_context(|| format!("Failed to parse CSV line {}", line_num + 2))?;

        let entity_id = EntityId::new(record.get(key_index).unwrap_or("").trim());
        let mut row = SnapshotRow::new(entity_id.clone());

        for (index, cell) in record.iter().enumerate() {
            let cell = cell.trim();
            if index == key_index || cell.is_empty() {
                continue;
            }
            let Some(name) = headers.get(index) else {
                continue;
            };
            let type_ = attributes
                .get(name)
                .map(|d| d.type_)
                .unwrap_or(AttributeType::Text);
            let value = parse_cell(cell, type_).map_err(|msg| {
                let line = line_num + 2;
                ScdError::input_for(&entity_id, format!("line {}: column '{}' {}", line, name, msg))
            })?;
            row.attributes.insert(name.clone(), value);
        }

        rows.push(row);
    }

    let duplicates = count_duplicates(&rows);
    if duplicates > 0 {
        warn!(duplicates, "snapshot contains repeated entity ids");
    }
    debug!(rows = rows.len(), columns = headers.len(), "snapshot parsed");

    Ok(rows)
}

fn parse_cell(cell: &str, type_: AttributeType) -> std::result::Result<AttributeValue, String> {
    match type_ {
        AttributeType::Text => Ok(AttributeValue::Text(cell.to_string())),
        AttributeType::Number => match cell.parse::<f64>() {
            Ok(n) if n.is_finite() => Ok(AttributeValue::Number(n)),
            Ok(_) => Err(format!("is not a finite number: '{}'", cell)),
            Err(_) => Err(format!("is not a number: '{}'", cell)),
        },
        AttributeType::Boolean => match cell.to_ascii_lowercase().as_str() {
            "true" => Ok(AttributeValue::Bool(true)),
            "false" => Ok(AttributeValue::Bool(false)),
            _ => Err(format!("is not a boolean: '{}'", cell)),
        },
    }
}

fn count_duplicates(rows: &[SnapshotRow]) -> usize {
    let mut counts: BTreeMap<&EntityId, usize> = BTreeMap::new();
    for row in rows {
        *counts.entry(&row.entity_id).or_default() += 1;
    }
    counts.values().filter(|c| **c > 1).map(|c| c - 1).sum()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SNAPSHOT: &str = "\
product_id,title,price,availability,scraped_at
1,Mug,10.5,in stock,2025-01-01
2,Teapot,25,,2025-01-01
";

    fn catalog() -> AttributeSet {
        AttributeSet::product_catalog()
    }

    #[test]
    fn test_parse_snapshot_types_and_absent_cells() {
        let rows = parse_snapshot(SNAPSHOT.as_bytes(), "product_id", &catalog()).unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].entity_id, EntityId::new("1"));
        assert_eq!(rows[0].attributes["price"], AttributeValue::Number(10.5));
        assert_eq!(rows[0].attributes["title"], AttributeValue::Text("Mug".to_string()));
        assert!(!rows[0].attributes.contains_key("product_id"));
        assert!(!rows[1].attributes.contains_key("availability"));
        assert_eq!(rows[1].attributes["price"], AttributeValue::Number(25.0));
    }

    #[test]
    fn test_missing_key_column_is_input_error() {
        let err = parse_snapshot(SNAPSHOT.as_bytes(), "sku_id", &catalog()).unwrap_err();

        let scd = err.downcast_ref::<ScdError>().unwrap();
        assert_eq!(scd.kind(), "InputIntegrityError");
    }

    #[test]
    fn test_unparseable_number_names_entity() {
        let data = "product_id,title,price\n7,Mug,cheap\n";

        let err = parse_snapshot(data.as_bytes(), "product_id", &catalog()).unwrap_err();

        let scd = err.downcast_ref::<ScdError>().unwrap();
        assert_eq!(scd.entity_id(), Some(&EntityId::new("7")));
        assert!(scd.to_string().contains("price"));
    }

    #[test]
    fn test_non_finite_number_rejected() {
        let data = "product_id,title,price\n7,Mug,NaN\n";

        assert!(parse_snapshot(data.as_bytes(), "product_id", &catalog()).is_err());
    }

    #[test]
    fn test_duplicates_are_kept_for_merge_to_reject() {
        let data = "product_id,title,price\n1,Mug,1\n1,Mug,2\n";

        let rows = parse_snapshot(data.as_bytes(), "product_id", &catalog()).unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(count_duplicates(&rows), 1);
    }

    #[test]
    fn test_csv_snapshot_source_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SNAPSHOT.as_bytes()).unwrap();

        let source = CsvSnapshot::new(file.path(), "product_id", AttributeSet::product_catalog());
        let rows = source.load().unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(source.version(), "1.0.0");
        let file_name = file.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(source.source_name().ends_with(&file_name));
    }
}
