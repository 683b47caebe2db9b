// ⚖️ Merge Calculator & Executor - collapse a confirmed group into one record
//
// Conservation rule (no overrides):
//   final_quantity = Σ quantity           over representative + selected
//   final_value    = Σ quantity × price   over representative + selected
//
// The executor claims every involved id, re-reads the live records, checks
// and computes, then hands the store a single MergeCommit.

use crate::cluster::DuplicateGroup;
use crate::error::{EngineError, Result};
use crate::lock::IdLockTable;
use crate::record::{CatalogRecord, Category};
use crate::store::{CatalogStore, Event, MergeCommit};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

// ============================================================================
// REQUEST
// ============================================================================

/// Descriptive fields the surviving record keeps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetainedFields {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub category: Category,
    pub unit: String,
    pub unit_price: f64,
    #[serde(default)]
    pub supplier: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub reorder_point: f64,
}

impl RetainedFields {
    pub fn from_record(record: &CatalogRecord) -> Self {
        RetainedFields {
            name: record.name.clone(),
            description: record.description.clone(),
            category: record.category,
            unit: record.unit.clone(),
            unit_price: record.unit_price,
            supplier: record.supplier.clone(),
            tags: record.tags.clone(),
            location: record.location.clone(),
            reorder_point: record.reorder_point,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(EngineError::validation("retained name is empty"));
        }
        if self.unit.trim().is_empty() {
            return Err(EngineError::validation("retained unit is empty"));
        }
        for (field, value) in [
            ("unit_price", self.unit_price),
            ("reorder_point", self.reorder_point),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(EngineError::validation(format!(
                    "retained {field} must be a non-negative number, got {value}"
                )));
            }
        }
        Ok(())
    }

    fn apply_to(&self, record: &mut CatalogRecord) {
        record.name = self.name.clone();
        record.description = self.description.clone();
        record.category = self.category;
        record.unit = self.unit.clone();
        record.unit_price = self.unit_price;
        record.supplier = self.supplier.clone();
        record.tags = self.tags.clone();
        record.location = self.location.clone();
        record.reorder_point = self.reorder_point;
    }
}

fn default_actor() -> String {
    "operator".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeRequest {
    pub representative_id: String,

    /// Operator-chosen subset of the group's other members
    pub selected_ids: Vec<String>,

    #[serde(default)]
    pub quantity_override: Option<f64>,

    #[serde(default)]
    pub value_override: Option<f64>,

    /// Defaults to the representative's own fields
    #[serde(default)]
    pub retained: Option<RetainedFields>,

    /// Who confirmed the merge (audit trail)
    #[serde(default = "default_actor")]
    pub actor: String,
}

impl MergeRequest {
    pub fn new<I, S>(representative_id: impl Into<String>, selected_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        MergeRequest {
            representative_id: representative_id.into(),
            selected_ids: selected_ids.into_iter().map(Into::into).collect(),
            quantity_override: None,
            value_override: None,
            retained: None,
            actor: default_actor(),
        }
    }

    /// Merge every member of a group into its representative
    pub fn whole_group(group: &DuplicateGroup) -> Self {
        Self::new(
            group.representative.id.clone(),
            group.members.iter().map(|m| m.id.clone()),
        )
    }

    pub fn with_quantity_override(mut self, quantity: f64) -> Self {
        self.quantity_override = Some(quantity);
        self
    }

    pub fn with_value_override(mut self, value: f64) -> Self {
        self.value_override = Some(value);
        self
    }

    pub fn with_retained(mut self, retained: RetainedFields) -> Self {
        self.retained = Some(retained);
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    /// Representative first, then the selected ids
    pub fn involved_ids(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.representative_id.as_str())
            .chain(self.selected_ids.iter().map(String::as_str))
    }

    /// Checks that need no store access
    pub fn validate_against(&self, group: &DuplicateGroup) -> Result<()> {
        if self.selected_ids.is_empty() {
            return Err(EngineError::validation("no members selected for merge"));
        }

        let mut seen = HashSet::new();
        for id in &self.selected_ids {
            if *id == self.representative_id {
                return Err(EngineError::validation(format!(
                    "representative {id} cannot also be a selected member"
                )));
            }
            if !seen.insert(id.as_str()) {
                return Err(EngineError::validation(format!("member {id} selected twice")));
            }
        }

        if let Some(outsider) = self.involved_ids().find(|id| !group.contains(id)) {
            return Err(EngineError::validation(format!(
                "record {outsider} is not part of the duplicate group"
            )));
        }

        for (field, value) in [
            ("quantity_override", self.quantity_override),
            ("value_override", self.value_override),
        ] {
            if let Some(v) = value {
                if !v.is_finite() || v < 0.0 {
                    return Err(EngineError::validation(format!(
                        "{field} must be a non-negative number, got {v}"
                    )));
                }
            }
        }

        if let Some(retained) = &self.retained {
            retained.validate()?;
        }
        Ok(())
    }
}

// ============================================================================
// PREVIEW
// ============================================================================

/// A descriptive field whose value differs among the records being merged
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldConflict {
    pub field: &'static str,

    /// Distinct values, in record order
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergePreview {
    pub representative: CatalogRecord,
    pub members: Vec<CatalogRecord>,

    pub computed_quantity: f64,
    pub computed_value: f64,
    pub final_quantity: f64,
    pub final_value: f64,

    /// The representative as it would look after the merge
    pub survivor: CatalogRecord,

    pub conflicts: Vec<FieldConflict>,
}

impl MergePreview {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }

    pub fn deleted_ids(&self) -> Vec<String> {
        self.members.iter().map(|m| m.id.clone()).collect()
    }

    /// Store write for this plan. Every involved record is pinned to the
    /// version it was planned from.
    pub fn to_commit(&self, event: Event) -> MergeCommit {
        MergeCommit {
            survivor: self.survivor.clone(),
            expected_version: self.representative.version,
            deleted: self
                .members
                .iter()
                .map(|m| (m.id.clone(), m.version))
                .collect(),
            event,
        }
    }
}

fn field_conflicts(records: &[&CatalogRecord]) -> Vec<FieldConflict> {
    let fields: [(&'static str, fn(&CatalogRecord) -> String); 5] = [
        ("unit", |r| r.unit.clone()),
        ("category", |r| r.category.to_string()),
        ("supplier", |r| r.supplier.clone().unwrap_or_default()),
        ("unit_price", |r| format!("{:.2}", r.unit_price)),
        ("location", |r| r.location.clone().unwrap_or_default()),
    ];

    fields
        .into_iter()
        .filter_map(|(field, get)| {
            let mut values: Vec<String> = Vec::new();
            for record in records {
                let value = get(record);
                if !values.contains(&value) {
                    values.push(value);
                }
            }
            (values.len() > 1).then_some(FieldConflict { field, values })
        })
        .collect()
}

// ============================================================================
// CALCULATOR
// ============================================================================

pub struct MergeCalculator;

impl MergeCalculator {
    /// Validate `request` against `group` and the `live` records, and compute
    /// the merge without writing anything.
    ///
    /// `live` is the current store content for the involved ids; an id
    /// missing from it is reported as not found.
    pub fn plan(
        request: &MergeRequest,
        group: &DuplicateGroup,
        live: &[CatalogRecord],
    ) -> Result<MergePreview> {
        request.validate_against(group)?;

        let lookup = |id: &str| -> Result<&CatalogRecord> {
            live.iter()
                .find(|r| r.id == id)
                .ok_or_else(|| EngineError::NotFound(id.to_string()))
        };

        let representative = lookup(request.representative_id.as_str())?;
        let members = request
            .selected_ids
            .iter()
            .map(|id| lookup(id.as_str()))
            .collect::<Result<Vec<_>>>()?;

        let involved: Vec<&CatalogRecord> = std::iter::once(representative)
            .chain(members.iter().copied())
            .collect();

        let computed_quantity: f64 = involved.iter().map(|r| r.quantity).sum();
        let computed_value: f64 = involved.iter().map(|r| r.derived_value()).sum();

        for (what, value) in [("quantity", computed_quantity), ("value", computed_value)] {
            if !value.is_finite() || value < 0.0 {
                return Err(EngineError::Arithmetic(format!(
                    "aggregate {what} is {value} for merge into {}",
                    representative.id
                )));
            }
        }

        let final_quantity = request.quantity_override.unwrap_or(computed_quantity);
        let final_value = request.value_override.unwrap_or(computed_value);

        let mut survivor = representative.next_version();
        if let Some(retained) = &request.retained {
            retained.apply_to(&mut survivor);
        }
        survivor.quantity = final_quantity;
        survivor.total_value = final_value;

        Ok(MergePreview {
            representative: representative.clone(),
            members: members.into_iter().cloned().collect(),
            computed_quantity,
            computed_value,
            final_quantity,
            final_value,
            survivor,
            conflicts: field_conflicts(&involved),
        })
    }
}

// ============================================================================
// EXECUTOR
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeResult {
    pub survivor: CatalogRecord,
    pub deleted_ids: Vec<String>,
    pub computed_quantity: f64,
    pub computed_value: f64,
    pub final_quantity: f64,
    pub final_value: f64,
    pub event_id: String,
}

impl MergeResult {
    pub fn summary(&self) -> String {
        format!(
            "Merged {} record(s) into {}: quantity {:.2}, value {:.2}",
            self.deleted_ids.len(),
            self.survivor.id,
            self.final_quantity,
            self.final_value
        )
    }
}

pub struct MergeExecutor<S: CatalogStore + ?Sized> {
    store: Arc<S>,
    locks: IdLockTable,
}

impl<S: CatalogStore + ?Sized> Clone for MergeExecutor<S> {
    fn clone(&self) -> Self {
        MergeExecutor {
            store: Arc::clone(&self.store),
            locks: self.locks.clone(),
        }
    }
}

impl<S: CatalogStore + ?Sized> MergeExecutor<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_locks(store, IdLockTable::new())
    }

    /// Share a lock table with other executors over the same store
    pub fn with_locks(store: Arc<S>, locks: IdLockTable) -> Self {
        MergeExecutor { store, locks }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn locks(&self) -> &IdLockTable {
        &self.locks
    }

    fn load_live(&self, request: &MergeRequest) -> Result<Vec<CatalogRecord>> {
        let mut live = Vec::new();
        for id in request.involved_ids() {
            if let Some(record) = self.store.get(id)? {
                live.push(record);
            }
        }
        Ok(live)
    }

    /// Compute the merge against the current store content; writes nothing
    pub fn preview(&self, request: &MergeRequest, group: &DuplicateGroup) -> Result<MergePreview> {
        request.validate_against(group)?;
        let live = self.load_live(request)?;
        MergeCalculator::plan(request, group, &live)
    }

    /// Apply the merge. All-or-nothing; never retried.
    pub fn merge(&self, request: &MergeRequest, group: &DuplicateGroup) -> Result<MergeResult> {
        request.validate_against(group)?;

        let _lease = self.locks.try_acquire(request.involved_ids()).map_err(|e| {
            log::warn!("merge into {} rejected: {}", request.representative_id, e);
            e
        })?;

        let live = self.load_live(request)?;
        let preview = MergeCalculator::plan(request, group, &live)?;
        let deleted_ids = preview.deleted_ids();

        let event = Event::for_record(
            Event::CATALOG_MERGED,
            &preview.survivor.id,
            serde_json::json!({
                "deleted_ids": deleted_ids,
                "deleted_records": preview.members,
                "computed_quantity": preview.computed_quantity,
                "computed_value": preview.computed_value,
                "final_quantity": preview.final_quantity,
                "final_value": preview.final_value,
                "quantity_overridden": request.quantity_override.is_some(),
                "value_overridden": request.value_override.is_some(),
                "group_confidence": group.confidence,
            }),
            &request.actor,
        );

        self.store.commit_merge(&preview.to_commit(event.clone()))?;

        let result = MergeResult {
            survivor: preview.survivor,
            deleted_ids,
            computed_quantity: preview.computed_quantity,
            computed_value: preview.computed_value,
            final_quantity: preview.final_quantity,
            final_value: preview.final_value,
            event_id: event.event_id,
        };
        log::info!("{} (by {})", result.summary(), request.actor);
        Ok(result)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{scan, ScanOptions};
    use crate::error::ErrorKind;
    use crate::store::MemoryStore;
    use std::sync::Barrier;

    fn flour(id: &str, name: &str, quantity: f64) -> CatalogRecord {
        CatalogRecord::new(name, Category::FoodGrade, "kg", quantity, 3.5)
            .with_id(id)
            .with_supplier("Farm A")
    }

    fn setup(records: Vec<CatalogRecord>) -> (MergeExecutor<MemoryStore>, DuplicateGroup) {
        let store = Arc::new(MemoryStore::with_records(records).unwrap());
        let snapshot = store.snapshot().unwrap();
        let group = scan(&snapshot, &ScanOptions::default())
            .unwrap()
            .into_iter()
            .next()
            .expect("one group");
        (MergeExecutor::new(store), group)
    }

    fn flour_pair() -> (MergeExecutor<MemoryStore>, DuplicateGroup) {
        setup(vec![
            flour("a", "Organic Flour", 25.0),
            flour("b", "Organic Flor", 10.0),
        ])
    }

    #[test]
    fn test_merge_conserves_quantity_and_value() {
        let (executor, group) = flour_pair();

        let result = executor
            .merge(&MergeRequest::whole_group(&group), &group)
            .unwrap();

        assert_eq!(result.final_quantity, 35.0);
        assert!((result.final_value - 122.50).abs() < 1e-9);
        assert_eq!(result.deleted_ids, vec!["b"]);

        let store = executor.store();
        assert!(store.get("b").unwrap().is_none());
        let survivor = store.get("a").unwrap().unwrap();
        assert_eq!(survivor.quantity, 35.0);
        assert_eq!(survivor.name, "Organic Flour");
        assert_eq!(survivor.version, 2);

        let events = store.events_for("a").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_id, result.event_id);
        assert_eq!(events[0].data["final_quantity"], 35.0);
        assert_eq!(executor.locks().locked_count(), 0);
    }

    #[test]
    fn test_overrides_replace_totals() {
        let (executor, group) = flour_pair();
        let request = MergeRequest::whole_group(&group)
            .with_quantity_override(30.0)
            .with_value_override(100.0)
            .with_actor("alice");

        let result = executor.merge(&request, &group).unwrap();

        assert_eq!(result.computed_quantity, 35.0);
        assert_eq!(result.final_quantity, 30.0);
        assert_eq!(result.final_value, 100.0);
        assert_eq!(executor.store().get("a").unwrap().unwrap().total_value, 100.0);
        assert_eq!(executor.store().events_for("a").unwrap()[0].actor, "alice");
    }

    #[test]
    fn test_retained_fields_and_member_representative() {
        let (executor, group) = flour_pair();
        let member = group.members[0].clone();
        let request = MergeRequest::new(member.id.clone(), [group.representative.id.clone()])
            .with_retained(RetainedFields::from_record(&member));

        let result = executor.merge(&request, &group).unwrap();

        assert_eq!(result.survivor.id, "b");
        assert_eq!(result.survivor.name, "Organic Flor");
        assert_eq!(result.final_quantity, 35.0);
        assert!(executor.store().get("a").unwrap().is_none());
    }

    #[test]
    fn test_partial_selection_leaves_others() {
        let (executor, group) = setup(vec![
            flour("a", "Rye Flour", 1.0),
            flour("b", "Rye Flour", 2.0),
            flour("c", "Rye Flour", 4.0),
        ]);
        assert_eq!(group.record_count(), 3);

        let result = executor
            .merge(&MergeRequest::new("a", ["c"]), &group)
            .unwrap();

        assert_eq!(result.final_quantity, 5.0);
        assert!(executor.store().get("b").unwrap().is_some());
        assert_eq!(executor.store().count().unwrap(), 2);
    }

    #[test]
    fn test_request_validation() {
        let (executor, group) = flour_pair();
        let cases = [
            MergeRequest::new("a", Vec::<String>::new()),
            MergeRequest::new("a", ["a"]),
            MergeRequest::new("a", ["b", "b"]),
            MergeRequest::new("a", ["zzz"]),
            MergeRequest::new("zzz", ["b"]),
            MergeRequest::new("a", ["b"]).with_quantity_override(-1.0),
            MergeRequest::new("a", ["b"]).with_value_override(f64::INFINITY),
            MergeRequest::new("a", ["b"]).with_retained(RetainedFields {
                name: "  ".into(),
                ..RetainedFields::from_record(&group.representative)
            }),
        ];

        for request in &cases {
            let err = executor.merge(request, &group).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation, "{request:?}");
        }
        assert_eq!(executor.store().count().unwrap(), 2);
    }

    #[test]
    fn test_member_grown_by_another_process_is_stale() {
        let (executor, group) = setup(vec![
            flour("a", "Rye Flour", 1.0),
            flour("b", "Rye Flour", 2.0),
            flour("c", "Rye Flour", 4.0),
        ]);
        let first = MergeRequest::new("a", ["b"]);
        let planned = executor.preview(&first, &group).unwrap();

        // a second process with its own lock table folds "c" into "b"
        let other = MergeExecutor::new(Arc::clone(executor.store()));
        other.merge(&MergeRequest::new("b", ["c"]), &group).unwrap();

        let event = Event::for_record(Event::CATALOG_MERGED, "a", serde_json::json!({}), "test");
        let err = executor.store().commit_merge(&planned.to_commit(event)).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(err.is_retryable_after_rescan());
        let total: f64 = executor
            .store()
            .snapshot()
            .unwrap()
            .iter()
            .map(|r| r.quantity)
            .sum();
        assert_eq!(total, 7.0);
    }

    #[test]
    fn test_member_deleted_concurrently_is_not_found() {
        let (executor, group) = setup(vec![
            flour("a", "Rye Flour", 1.0),
            flour("b", "Rye Flour", 2.0),
            flour("c", "Rye Flour", 4.0),
        ]);
        // another merge already consumed "c"
        executor.store().delete("c").unwrap();

        let err = executor
            .merge(&MergeRequest::whole_group(&group), &group)
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.is_retryable_after_rescan());
        let a = executor.store().get("a").unwrap().unwrap();
        assert_eq!(a.quantity, 1.0);
        assert!(executor.store().get("b").unwrap().is_some());
        assert!(executor.store().events_for("a").unwrap().is_empty());
    }

    #[test]
    fn test_second_merge_of_same_group_fails() {
        let (executor, group) = flour_pair();
        let request = MergeRequest::whole_group(&group);

        executor.merge(&request, &group).unwrap();
        let err = executor.merge(&request, &group).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_locked_id_is_conflict() {
        let (executor, group) = flour_pair();
        let _held = executor.locks().try_acquire(["b"]).unwrap();

        let err = executor
            .merge(&MergeRequest::whole_group(&group), &group)
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(executor.store().count().unwrap(), 2);
    }

    #[test]
    fn test_overlapping_concurrent_merges_one_wins() {
        let (executor, group) = setup(vec![
            flour("r", "Rye Flour", 1.0),
            flour("a", "Rye Flour", 2.0),
            flour("b", "Rye Flour", 4.0),
        ]);
        let first = MergeRequest::new("r", ["a"]);
        let second = MergeRequest::new("r", ["a", "b"]);
        let barrier = Barrier::new(2);

        let (r1, r2) = std::thread::scope(|s| {
            let h1 = s.spawn(|| {
                barrier.wait();
                executor.merge(&first, &group)
            });
            let h2 = s.spawn(|| {
                barrier.wait();
                executor.merge(&second, &group)
            });
            (h1.join().unwrap(), h2.join().unwrap())
        });

        let outcomes = [r1, r2];
        let successes = outcomes.iter().filter(|r| r.is_ok()).count();
        assert_eq!(successes, 1);
        for err in outcomes.iter().filter_map(|r| r.as_ref().err()) {
            assert!(matches!(err.kind(), ErrorKind::Conflict | ErrorKind::NotFound));
        }
        assert!(executor.store().get("a").unwrap().is_none());

        // value conservation across whichever merge won
        let total: f64 = executor
            .store()
            .snapshot()
            .unwrap()
            .iter()
            .map(|r| r.total_value)
            .sum();
        assert!((total - 7.0 * 3.5).abs() < 1e-9);
    }

    #[test]
    fn test_negative_aggregate_is_arithmetic_error() {
        let (_, group) = flour_pair();
        let mut broken = group.members[0].clone();
        broken.quantity = -100.0;
        let live = vec![group.representative.clone(), broken];

        let err =
            MergeCalculator::plan(&MergeRequest::whole_group(&group), &group, &live).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Arithmetic);
    }

    #[test]
    fn test_preview_reports_conflicts_without_writing() {
        let (executor, group) = setup(vec![
            flour("a", "Beeswax Block", 2.0).with_location("Shelf 1"),
            flour("b", "Beeswax Blocks", 3.0).with_location("Shelf 4"),
        ]);

        let preview = executor
            .preview(&MergeRequest::whole_group(&group), &group)
            .unwrap();

        assert_eq!(preview.final_quantity, 5.0);
        assert_eq!(preview.survivor.quantity, 5.0);
        assert!(preview.has_conflicts());
        assert_eq!(preview.conflicts.len(), 1);
        assert_eq!(preview.conflicts[0].field, "location");
        assert_eq!(preview.conflicts[0].values, vec!["Shelf 1", "Shelf 4"]);
        assert_eq!(executor.store().count().unwrap(), 2);
    }
}
