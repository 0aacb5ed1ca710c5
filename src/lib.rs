// SCD Dimension - Core Library
// Historized dimension maintenance: SCD Type-2 merge, quality gate, SQLite store.
// Used by the CLI, the API server and the scenario tests.

pub mod attributes; // Attribute set: tracked fields + validation rules
pub mod config; // Pipeline configuration (JSON)
pub mod data_quality; // Quality gate
pub mod db; // SQLite store + audit trail
pub mod error; // ScdError
pub mod merge; // SCD2 merge engine
pub mod parser; // Snapshot loaders
pub mod pipeline; // load → merge → apply → gate → backup
pub mod temporal; // Version records, changesets, in-memory table

// Re-export commonly used types
pub use attributes::{
    AttributeDefinition, AttributeSet, AttributeType, AttributeValue, AttributeViolation,
    Attributes, ValidationRule, ViolationKind,
};
pub use config::{GateConfig, MergeConfig, PipelineConfig, StorageConfig};
pub use data_quality::{CheckCode, Finding, GateReport, QualityGate, Severity, TableStats};
pub use db::{
    apply_changeset, backup_database, count_current, get_events_for_entity, get_version,
    insert_event, load_all_versions, load_current_versions, load_entity_history,
    load_versions_as_of, open_database, setup_database, verify_count, ApplyOutcome, Event,
};
pub use error::{ScdError, ScdResult};
pub use merge::{MergeEngine, MissingPolicy};
pub use parser::{load_snapshot_csv, parse_snapshot, CsvSnapshot, SnapshotSource, StaticSnapshot};
pub use pipeline::{Pipeline, PipelineRun};
pub use temporal::{
    Changeset, EntityId, HistorizedTable, MergeStats, SnapshotRow, VersionRecord,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
