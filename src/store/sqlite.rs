// SQLite Catalog Store (WAL, one connection behind a Mutex)

use super::{CatalogStore, Event, ImportOutcome, MergeCommit};
use crate::error::{EngineError, Result};
use crate::record::{CatalogRecord, Category};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const RECORD_COLUMNS: &str = "id, name, description, category, unit, quantity, unit_price,
     total_value, supplier, tags, location, reorder_point, version, created_at, updated_at";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a database file and make sure the schema exists
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        setup_database(&conn)?;
        log::debug!("opened catalog database at {}", path.as_ref().display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        setup_database(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS catalog_records (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT UNIQUE NOT NULL,
            import_key TEXT UNIQUE,
            name TEXT NOT NULL,
            description TEXT,
            category TEXT NOT NULL,
            unit TEXT NOT NULL,
            quantity REAL NOT NULL,
            unit_price REAL NOT NULL,
            total_value REAL NOT NULL,
            supplier TEXT,
            tags TEXT NOT NULL DEFAULT '[]',
            location TEXT,
            reorder_point REAL NOT NULL DEFAULT 0,
            version INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    // Audit trail
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

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_records_category ON catalog_records(category)",
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

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn parse_time(idx: usize, text: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, format!("bad timestamp {text}: {e}")))
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<CatalogRecord> {
    let category: String = row.get(3)?;
    let tags_json: String = row.get(9)?;
    let created_at: String = row.get(13)?;
    let updated_at: String = row.get(14)?;

    Ok(CatalogRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        category: category
            .parse::<Category>()
            .map_err(|e| conversion_error(3, e.to_string()))?,
        unit: row.get(4)?,
        quantity: row.get(5)?,
        unit_price: row.get(6)?,
        total_value: row.get(7)?,
        supplier: row.get(8)?,
        tags: serde_json::from_str::<BTreeSet<String>>(&tags_json)
            .map_err(|e| conversion_error(9, e.to_string()))?,
        location: row.get(10)?,
        reorder_point: row.get(11)?,
        version: row.get(12)?,
        created_at: parse_time(13, &created_at)?,
        updated_at: parse_time(14, &updated_at)?,
    })
}

fn insert_record(conn: &Connection, record: &CatalogRecord, import_key: Option<&str>) -> Result<usize> {
    let tags_json = serde_json::to_string(&record.tags)?;
    let inserted = conn.execute(
        "INSERT INTO catalog_records (
            id, import_key, name, description, category, unit, quantity, unit_price,
            total_value, supplier, tags, location, reorder_point, version, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            record.id,
            import_key,
            record.name,
            record.description,
            record.category.as_str(),
            record.unit,
            record.quantity,
            record.unit_price,
            record.total_value,
            record.supplier,
            tags_json,
            record.location,
            record.reorder_point,
            record.version,
            record.created_at.to_rfc3339(),
            record.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(inserted)
}

/// Overwrite a row if its version still matches; returns rows changed (0 or 1)
fn update_record(conn: &Connection, record: &CatalogRecord, expected_version: i64) -> Result<usize> {
    let tags_json = serde_json::to_string(&record.tags)?;
    let updated = conn.execute(
        "UPDATE catalog_records
         SET name = ?2, description = ?3, category = ?4, unit = ?5, quantity = ?6,
             unit_price = ?7, total_value = ?8, supplier = ?9, tags = ?10, location = ?11,
             reorder_point = ?12, version = ?13, updated_at = ?14
         WHERE id = ?1 AND version = ?15",
        params![
            record.id,
            record.name,
            record.description,
            record.category.as_str(),
            record.unit,
            record.quantity,
            record.unit_price,
            record.total_value,
            record.supplier,
            tags_json,
            record.location,
            record.reorder_point,
            record.version,
            record.updated_at.to_rfc3339(),
            expected_version,
        ],
    )?;
    Ok(updated)
}

/// Explain why a version-guarded update touched no row
fn missed_update(conn: &Connection, id: &str, expected_version: i64) -> Result<EngineError> {
    let current: Option<i64> = conn
        .query_row(
            "SELECT version FROM catalog_records WHERE id = ?1",
            [id],
            |row| row.get(0),
        )
        .optional()?;

    Ok(match current {
        None => EngineError::NotFound(id.to_string()),
        Some(_) => EngineError::StaleVersion {
            id: id.to_string(),
            expected: expected_version,
        },
    })
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
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

impl CatalogStore for SqliteStore {
    fn snapshot(&self) -> Result<Vec<CatalogRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM catalog_records ORDER BY seq"
        ))?;

        let records = stmt
            .query_map([], row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(records)
    }

    fn get(&self, id: &str) -> Result<Option<CatalogRecord>> {
        let conn = self.conn();
        let record = conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM catalog_records WHERE id = ?1"),
                [id],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    fn insert(&self, record: &CatalogRecord) -> Result<()> {
        record.validate()?;
        match insert_record(&self.conn(), record, None) {
            Err(EngineError::Database(rusqlite::Error::SqliteFailure(err, _)))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(EngineError::validation(format!(
                    "record {} already exists",
                    record.id
                )))
            }
            other => other.map(|_| ()),
        }
    }

    fn insert_imported(&self, record: &CatalogRecord, import_key: &str) -> Result<ImportOutcome> {
        record.validate()?;
        let conn = self.conn();
        match insert_record(&conn, record, Some(import_key)) {
            Ok(_) => Ok(ImportOutcome::Inserted),
            Err(EngineError::Database(rusqlite::Error::SqliteFailure(err, _)))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                let seen: Option<i64> = conn
                    .query_row(
                        "SELECT seq FROM catalog_records WHERE import_key = ?1",
                        [import_key],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(match seen {
                    Some(_) => ImportOutcome::AlreadyImported,
                    None => ImportOutcome::IdTaken,
                })
            }
            Err(e) => Err(e),
        }
    }

    fn update(&self, record: &CatalogRecord, expected_version: i64) -> Result<()> {
        record.validate()?;
        let conn = self.conn();
        if update_record(&conn, record, expected_version)? == 1 {
            return Ok(());
        }
        Err(missed_update(&conn, &record.id, expected_version)?)
    }

    fn delete(&self, id: &str) -> Result<()> {
        let deleted = self
            .conn()
            .execute("DELETE FROM catalog_records WHERE id = ?1", [id])?;
        if deleted == 0 {
            return Err(EngineError::NotFound(id.to_string()));
        }
        Ok(())
    }

    fn commit_merge(&self, commit: &MergeCommit) -> Result<()> {
        commit.survivor.validate()?;
        let mut conn = self.conn();
        // Dropping `tx` without commit rolls everything back
        let tx = conn.transaction()?;

        if update_record(&tx, &commit.survivor, commit.expected_version)? != 1 {
            return Err(missed_update(&tx, &commit.survivor.id, commit.expected_version)?);
        }

        for (id, version) in &commit.deleted {
            let deleted = tx.execute(
                "DELETE FROM catalog_records WHERE id = ?1 AND version = ?2",
                params![id, version],
            )?;
            if deleted != 1 {
                return Err(missed_update(&tx, id, *version)?);
            }
        }

        insert_event(&tx, &commit.event)?;
        tx.commit()?;
        Ok(())
    }

    fn events_for(&self, entity_id: &str) -> Result<Vec<Event>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
             FROM events
             WHERE entity_type = 'catalog_record' AND entity_id = ?1
             ORDER BY id DESC",
        )?;

        let events = stmt
            .query_map([entity_id], |row| {
                let timestamp: String = row.get(1)?;
                let data_json: String = row.get(5)?;

                Ok(Event {
                    event_id: row.get(0)?,
                    timestamp: parse_time(1, &timestamp)?,
                    event_type: row.get(2)?,
                    entity_type: row.get(3)?,
                    entity_id: row.get(4)?,
                    data: serde_json::from_str(&data_json)
                        .map_err(|e| conversion_error(5, e.to_string()))?,
                    actor: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(events)
    }

    fn count(&self) -> Result<usize> {
        let count: i64 =
            self.conn()
                .query_row("SELECT COUNT(*) FROM catalog_records", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}
