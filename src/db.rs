use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::attributes::Attributes;
use crate::error::ScdError;
use crate::temporal::{Changeset, EntityId, VersionRecord};

/// Event for audit trail (one per merge, one per gate evaluation)
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

/// Rows written by one `apply_changeset` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyOutcome {
    pub inserted: usize,
    pub closed: usize,
}

// Fixed width so TEXT comparison in SQL orders the same as time.
fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_optional_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| parse_ts(idx, &s)).transpose()
}

pub fn open_database(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("open dimension store {}", path.display()))?;
    setup_database(&conn)?;
    Ok(conn)
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // ==========================================================================
    // Dimension versions (one row per version, append-only except closing)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS dimension_versions (
            surrogate_version_id TEXT PRIMARY KEY,
            entity_id TEXT NOT NULL,
            attributes TEXT NOT NULL,
            valid_from TEXT,
            valid_to TEXT,
            is_current INTEGER NOT NULL,
            run_id TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Events Table (audit trail)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_versions_entity
         ON dimension_versions(entity_id, is_current)",
        [],
    )?;

    // At most one current version per entity, enforced by storage as well
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_versions_one_current
         ON dimension_versions(entity_id) WHERE is_current = 1",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp)",
        [],
    )?;

    Ok(())
}

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            format_ts(event.timestamp),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Get events for a specific entity, newest first
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY timestamp DESC, id DESC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            let timestamp_str: String = row.get(1)?;
            let data_json: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                timestamp: parse_ts(1, &timestamp_str)?,
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: serde_json::from_str(&data_json).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e))
                })?,
                actor: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}

// ============================================================================
// VERSION READS
// ============================================================================

const VERSION_COLUMNS: &str =
    "surrogate_version_id, entity_id, attributes, valid_from, valid_to, is_current";

fn version_from_row(row: &Row<'_>) -> rusqlite::Result<VersionRecord> {
    let entity_id: String = row.get(1)?;
    let attributes_json: String = row.get(2)?;
    let attributes: Attributes = serde_json::from_str(&attributes_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;

    Ok(VersionRecord {
        surrogate_version_id: row.get(0)?,
        entity_id: EntityId::new(entity_id),
        attributes,
        valid_from: parse_optional_ts(row, 3)?,
        valid_to: parse_optional_ts(row, 4)?,
        is_current: row.get(5)?,
    })
}

fn query_versions(
    conn: &Connection,
    filter: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<VersionRecord>> {
    let sql = format!(
        "SELECT {} FROM dimension_versions {} ORDER BY entity_id, valid_from",
        VERSION_COLUMNS, filter
    );
    let mut stmt = conn.prepare(&sql)?;
    let versions = stmt
        .query_map(params, version_from_row)?
        .collect::<Result<Vec<_>, _>>()
        .context("read dimension versions")?;
    Ok(versions)
}

/// Full historized table (input to the quality gate)
pub fn load_all_versions(conn: &Connection) -> Result<Vec<VersionRecord>> {
    query_versions(conn, "", [])
}

/// Current-flagged rows (input to the merge engine)
pub fn load_current_versions(conn: &Connection) -> Result<Vec<VersionRecord>> {
    query_versions(conn, "WHERE is_current = 1", [])
}

pub fn load_entity_history(conn: &Connection, entity_id: &EntityId) -> Result<Vec<VersionRecord>> {
    query_versions(conn, "WHERE entity_id = ?1", params![entity_id.as_str()])
}

/// Point-in-time view: versions with valid_from <= at < valid_to
pub fn load_versions_as_of(conn: &Connection, at: DateTime<Utc>) -> Result<Vec<VersionRecord>> {
    query_versions(
        conn,
        "WHERE valid_from <= ?1 AND (valid_to IS NULL OR valid_to > ?1)",
        params![format_ts(at)],
    )
}

pub fn get_version(conn: &Connection, surrogate_version_id: &str) -> Result<Option<VersionRecord>> {
    let sql = format!(
        "SELECT {} FROM dimension_versions WHERE surrogate_version_id = ?1",
        VERSION_COLUMNS
    );
    let version = conn
        .query_row(&sql, params![surrogate_version_id], version_from_row)
        .optional()?;
    Ok(version)
}

pub fn verify_count(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM dimension_versions", [], |row| {
        row.get(0)
    })?;
    Ok(count)
}

pub fn count_current(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM dimension_versions WHERE is_current = 1",
        [],
        |row| row.get(0),
    )?;
    Ok(count)
}

// ============================================================================
// VERSION WRITES
// ============================================================================

/// Apply a changeset in one transaction: closes first, then inserts, then a
/// `merge_applied` event. Any failure rolls the whole changeset back.
pub fn apply_changeset(
    conn: &mut Connection,
    changeset: &Changeset,
    dimension: &str,
    run_id: &str,
) -> Result<ApplyOutcome> {
    let tx = conn.transaction()?;
    let mut outcome = ApplyOutcome::default();

    for (entity_id, closed_at) in &changeset.closed_entity_ids {
        let updated = tx.execute(
            "UPDATE dimension_versions
             SET valid_to = ?1, is_current = 0
             WHERE entity_id = ?2 AND is_current = 1",
            params![format_ts(*closed_at), entity_id.as_str()],
        )?;
        if updated != 1 {
            return Err(ScdError::invariant(
                entity_id,
                format!("close matched {} current rows, expected exactly 1", updated),
            )
            .into());
        }
        outcome.closed += 1;
    }

    for version in &changeset.new_versions {
        let attributes_json = serde_json::to_string(&version.attributes)?;
        let result = tx.execute(
            "INSERT INTO dimension_versions (
                surrogate_version_id, entity_id, attributes,
                valid_from, valid_to, is_current, run_id
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                version.surrogate_version_id,
                version.entity_id.as_str(),
                attributes_json,
                version.valid_from.map(format_ts),
                version.valid_to.map(format_ts),
                version.is_current,
                run_id,
            ],
        );

        match result {
            Ok(_) => outcome.inserted += 1,
            Err(rusqlite::Error::SqliteFailure(err, msg))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(ScdError::invariant(
                    &version.entity_id,
                    format!(
                        "insert of {} rejected: {}",
                        version.surrogate_version_id,
                        msg.unwrap_or_else(|| "constraint violation".to_string())
                    ),
                )
                .into());
            }
            Err(e) => return Err(e.into()),
        }
    }

    let event = Event::new(
        "merge_applied",
        "dimension",
        dimension,
        serde_json::json!({
            "run_id": run_id,
            "run_timestamp": changeset.run_timestamp.to_rfc3339(),
            "inserted": outcome.inserted,
            "closed": outcome.closed,
            "flagged_missing": changeset.flagged_missing.len(),
            "stats": changeset.stats,
        }),
        "merge_engine",
    );
    insert_event(&tx, &event)?;

    tx.commit().context("commit changeset")?;

    info!(
        run_id,
        inserted = outcome.inserted,
        closed = outcome.closed,
        "changeset applied"
    );
    Ok(outcome)
}

/// Consistent copy of the store, named `<dimension>_backup_post_run_<YYYYMMDD>.db`.
/// A backup from earlier the same day is replaced.
pub fn backup_database(
    conn: &Connection,
    backup_dir: &Path,
    dimension: &str,
    date: NaiveDate,
) -> Result<PathBuf> {
    fs::create_dir_all(backup_dir)
        .with_context(|| format!("create backup dir {}", backup_dir.display()))?;

    let path = backup_dir.join(format!(
        "{}_backup_post_run_{}.db",
        dimension,
        date.format("%Y%m%d")
    ));
    if path.exists() {
        debug!(path = %path.display(), "replacing same-day backup");
        fs::remove_file(&path)
            .with_context(|| format!("remove old backup {}", path.display()))?;
    }

    conn.execute("VACUUM INTO ?1", params![path.to_string_lossy().into_owned()])
        .with_context(|| format!("write backup {}", path.display()))?;

    info!(path = %path.display(), "backup written");
    Ok(path)
}
