// 🗄️ Catalog Store - the read source and write sink of the engine
//
// The engine never owns records. It reads a snapshot, and a merge hands the
// store one MergeCommit that must apply completely or not at all.

mod import;
mod memory;
mod sqlite;

pub use import::{import_csv, read_csv, ImportRow, ImportSummary};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::Result;
use crate::record::CatalogRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event for the audit trail. Every merge appends one.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
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
    pub const CATALOG_MERGED: &'static str = "catalog_merged";

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

    /// Event about a catalog record
    pub fn for_record(event_type: &str, record_id: &str, data: serde_json::Value, actor: &str) -> Self {
        Self::new(event_type, "catalog_record", record_id, data, actor)
    }
}

/// What happened to one imported row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportOutcome {
    Inserted,
    /// Same import key seen before
    AlreadyImported,
    /// New row whose explicit id belongs to another record
    IdTaken,
}

/// Everything a merge writes, applied in one store transaction
#[derive(Debug, Clone)]
pub struct MergeCommit {
    /// Representative after the merge (version already bumped)
    pub survivor: CatalogRecord,

    /// Version the representative had when it was loaded
    pub expected_version: i64,

    /// Selected members with the version each had when loaded. Each must
    /// still exist at that version, otherwise the commit is stale.
    pub deleted: Vec<(String, i64)>,

    pub event: Event,
}

impl MergeCommit {
    pub fn deleted_ids(&self) -> impl Iterator<Item = &str> {
        self.deleted.iter().map(|(id, _)| id.as_str())
    }
}

pub trait CatalogStore: Send + Sync {
    /// Every current record, in insertion order
    fn snapshot(&self) -> Result<Vec<CatalogRecord>>;

    fn get(&self, id: &str) -> Result<Option<CatalogRecord>>;

    /// Insert a new record; an existing id is a validation error
    fn insert(&self, record: &CatalogRecord) -> Result<()>;

    /// Insert unless `import_key` was seen before or the id is taken
    fn insert_imported(&self, record: &CatalogRecord, import_key: &str) -> Result<ImportOutcome>;

    /// Replace a record if its stored version still equals `expected_version`
    fn update(&self, record: &CatalogRecord, expected_version: i64) -> Result<()>;

    fn delete(&self, id: &str) -> Result<()>;

    /// Apply a merge atomically: update the survivor and delete every member,
    /// each under a version check, then append the audit event.
    fn commit_merge(&self, commit: &MergeCommit) -> Result<()>;

    /// Audit events for one record, newest first
    fn events_for(&self, entity_id: &str) -> Result<Vec<Event>>;

    fn count(&self) -> Result<usize> {
        Ok(self.snapshot()?.len())
    }
}
