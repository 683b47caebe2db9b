// In-memory Catalog Store
//
// One RwLock over the whole state, so a commit is checked and applied
// under a single write guard.

use super::{CatalogStore, Event, ImportOutcome, MergeCommit};
use crate::error::{EngineError, Result};
use crate::record::CatalogRecord;
use std::collections::HashSet;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Default)]
struct State {
    records: Vec<CatalogRecord>,
    events: Vec<Event>,
    import_keys: HashSet<String>,
}

impl State {
    fn position(&self, id: &str) -> Option<usize> {
        self.records.iter().position(|r| r.id == id)
    }

    fn check_version(&self, idx: usize, expected: i64) -> Result<()> {
        let record = &self.records[idx];
        if record.version != expected {
            return Err(EngineError::StaleVersion {
                id: record.id.clone(),
                expected,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-filled with `records` (ids must be unique)
    pub fn with_records(records: Vec<CatalogRecord>) -> Result<Self> {
        let store = Self::new();
        for record in &records {
            store.insert(record)?;
        }
        Ok(store)
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CatalogStore for MemoryStore {
    fn snapshot(&self) -> Result<Vec<CatalogRecord>> {
        Ok(self.read().records.clone())
    }

    fn get(&self, id: &str) -> Result<Option<CatalogRecord>> {
        Ok(self.read().records.iter().find(|r| r.id == id).cloned())
    }

    fn insert(&self, record: &CatalogRecord) -> Result<()> {
        record.validate()?;
        let mut state = self.write();
        if state.position(&record.id).is_some() {
            return Err(EngineError::validation(format!(
                "record {} already exists",
                record.id
            )));
        }
        state.records.push(record.clone());
        Ok(())
    }

    fn insert_imported(&self, record: &CatalogRecord, import_key: &str) -> Result<ImportOutcome> {
        record.validate()?;
        let mut state = self.write();
        if state.import_keys.contains(import_key) {
            return Ok(ImportOutcome::AlreadyImported);
        }
        if state.position(&record.id).is_some() {
            return Ok(ImportOutcome::IdTaken);
        }
        state.import_keys.insert(import_key.to_string());
        state.records.push(record.clone());
        Ok(ImportOutcome::Inserted)
    }

    fn update(&self, record: &CatalogRecord, expected_version: i64) -> Result<()> {
        record.validate()?;
        let mut state = self.write();
        let idx = state
            .position(&record.id)
            .ok_or_else(|| EngineError::NotFound(record.id.clone()))?;
        state.check_version(idx, expected_version)?;
        state.records[idx] = record.clone();
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<()> {
        let mut state = self.write();
        let idx = state
            .position(id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        state.records.remove(idx);
        Ok(())
    }

    fn commit_merge(&self, commit: &MergeCommit) -> Result<()> {
        commit.survivor.validate()?;
        let mut state = self.write();

        // Check everything before touching anything
        let survivor_idx = state
            .position(&commit.survivor.id)
            .ok_or_else(|| EngineError::NotFound(commit.survivor.id.clone()))?;
        state.check_version(survivor_idx, commit.expected_version)?;
        for (id, version) in &commit.deleted {
            let idx = state
                .position(id)
                .ok_or_else(|| EngineError::NotFound(id.clone()))?;
            state.check_version(idx, *version)?;
        }

        state.records[survivor_idx] = commit.survivor.clone();
        let deleted: HashSet<&str> = commit.deleted_ids().collect();
        state.records.retain(|r| !deleted.contains(r.id.as_str()));
        state.events.push(commit.event.clone());
        Ok(())
    }

    fn events_for(&self, entity_id: &str) -> Result<Vec<Event>> {
        let mut events: Vec<Event> = self
            .read()
            .events
            .iter()
            .filter(|e| e.entity_id == entity_id)
            .cloned()
            .collect();
        events.reverse();
        Ok(events)
    }
}
