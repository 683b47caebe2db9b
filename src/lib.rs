// Catalog Resolution Engine - Core Library
// Exposes all modules for use in CLI, API server, and tests

pub mod cluster;     // Cluster Builder - duplicate groups from a snapshot
pub mod config;      // TOML engine configuration
pub mod error;
pub mod lock;        // Per-id merge locks
pub mod matcher;     // Candidate Matcher - composite confidence per pair
pub mod merge;       // Merge Calculator & Executor
pub mod normalize;   // Normalizer
pub mod record;      // Catalog record data model
pub mod similarity;  // Similarity Scorer
pub mod store;       // Catalog Store trait, SQLite and memory stores, CSV import

// Re-export commonly used types
pub use cluster::{scan, ClusterBuilder, DuplicateGroup, GroupingStrategy, RiskTier, ScanOptions};
pub use config::{EngineConfig, ScanParams};
pub use error::{EngineError, ErrorKind, Result};
pub use lock::{IdLease, IdLockTable};
pub use matcher::{CandidateMatcher, DuplicateCandidate, Explanation, MatchOptions, MatchSignal};
pub use merge::{
    FieldConflict, MergeCalculator, MergeExecutor, MergePreview, MergeRequest, MergeResult,
    RetainedFields,
};
pub use normalize::{normalize, NormalizedText};
pub use record::{CatalogRecord, Category};
pub use similarity::{levenshtein_distance, similarity, similarity_at_least};
pub use store::{
    import_csv, read_csv, CatalogStore, Event, ImportOutcome, ImportSummary, MemoryStore,
    MergeCommit, SqliteStore,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Locate the duplicate group containing both `representative_id` and every
/// id in `selected_ids` in a fresh scan of `records`.
///
/// Callers that only persist ids (CLI, HTTP) use this to rebuild the group a
/// merge request refers to. `options` must match the scan the operator saw,
/// see [`EngineConfig::scan_options_with`].
pub fn find_group(
    records: &[CatalogRecord],
    options: &ScanOptions,
    representative_id: &str,
    selected_ids: &[String],
) -> Result<DuplicateGroup> {
    let present = |id: &str| records.iter().any(|r| r.id == id);
    if let Some(missing) = std::iter::once(representative_id)
        .chain(selected_ids.iter().map(String::as_str))
        .find(|id| !present(*id))
    {
        return Err(EngineError::NotFound(missing.to_string()));
    }

    scan(records, options)?
        .into_iter()
        .find(|g| g.contains(representative_id) && selected_ids.iter().all(|id| g.contains(id)))
        .ok_or_else(|| {
            EngineError::validation(format!(
                "records {} and {} are not in one duplicate group",
                representative_id,
                selected_ids.join(", ")
            ))
        })
}
