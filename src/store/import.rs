// CSV → Catalog Store import
//
// Re-importing the same file is a no-op: every row gets an import key
// derived from the source name, its line and its content.

use super::{CatalogStore, ImportOutcome};
use crate::error::{EngineError, Result};
use crate::record::{CatalogRecord, Category};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// One CSV row as written by operators
#[derive(Debug, Deserialize)]
struct CsvRow {
    id: Option<String>,
    name: String,
    description: Option<String>,
    category: String,
    unit: String,
    quantity: f64,
    unit_price: f64,
    supplier: Option<String>,
    /// Semicolon-separated
    tags: Option<String>,
    location: Option<String>,
    reorder_point: Option<f64>,
}

impl CsvRow {
    fn into_record(self) -> Result<CatalogRecord> {
        let category: Category = self.category.parse()?;
        let mut record = CatalogRecord::new(self.name, category, self.unit, self.quantity, self.unit_price);

        if let Some(id) = non_blank(self.id) {
            record.id = id;
        }
        record.description = non_blank(self.description);
        record.supplier = non_blank(self.supplier);
        record.location = non_blank(self.location);
        record.reorder_point = self.reorder_point.unwrap_or(0.0);
        record.tags = self
            .tags
            .unwrap_or_default()
            .split(';')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();

        record.validate()?;
        Ok(record)
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Parsed row plus the key that makes its import idempotent
#[derive(Debug, Clone)]
pub struct ImportRow {
    pub line: u64,
    pub import_key: String,
    pub record: CatalogRecord,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub inserted: usize,
    /// Rows imported by an earlier run
    pub skipped: usize,
    /// Ids of new rows that collide with an existing record
    pub id_conflicts: Vec<String>,
}

fn import_key(source: &str, line: u64, record: &CatalogRecord) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}|{}|{}", source, line, record.fingerprint()));
    format!("{:x}", hasher.finalize())
}

/// Parse CSV from any reader. `source` names the input in import keys and errors.
pub fn read_csv<R: Read>(reader: R, source: &str) -> Result<Vec<ImportRow>> {
    let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let headers = rdr.headers()?.clone();
    let mut raw = csv::StringRecord::new();
    let mut rows = Vec::new();

    while rdr.read_record(&mut raw)? {
        // line the record starts on; quoted fields may span several
        let line = raw.position().map_or(0, |p| p.line());
        let row: CsvRow = raw.deserialize(Some(&headers))?;
        let record = row.into_record().map_err(|e| {
            EngineError::validation(format!("{source}, line {line}: {e}"))
        })?;

        rows.push(ImportRow {
            line,
            import_key: import_key(source, line, &record),
            record,
        });
    }

    Ok(rows)
}

/// Load a CSV file into `store`, skipping rows that were imported before
pub fn import_csv<S: CatalogStore + ?Sized>(store: &S, path: &Path) -> Result<ImportSummary> {
    let file = std::fs::File::open(path)?;
    let source = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    let rows = read_csv(file, &source)?;
    let mut summary = ImportSummary::default();

    for row in rows {
        match store.insert_imported(&row.record, &row.import_key)? {
            ImportOutcome::Inserted => summary.inserted += 1,
            ImportOutcome::AlreadyImported => summary.skipped += 1,
            ImportOutcome::IdTaken => {
                log::warn!(
                    "{}, line {}: id {} already belongs to another record",
                    source,
                    row.line,
                    row.record.id
                );
                summary.id_conflicts.push(row.record.id);
            }
        }
    }

    log::info!(
        "imported {}: {} inserted, {} skipped, {} id conflicts",
        source,
        summary.inserted,
        summary.skipped,
        summary.id_conflicts.len()
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, SqliteStore};
    use std::io::Write;

    const CSV: &str = "\
id,name,description,category,unit,quantity,unit_price,supplier,tags,location,reorder_point
flour-1,Organic Flour,,food_grade,kg,25,3.50,Farm A,organic;bulk,,5
,Organic Flor,stone ground,Food Grade,kg,10,3.50,Farm A,,Shelf 2,
";

    #[test]
    fn test_read_csv_parses_rows() {
        let rows = read_csv(CSV.as_bytes(), "stock.csv").unwrap();

        assert_eq!(rows.len(), 2);
        let first = &rows[0].record;
        assert_eq!(first.id, "flour-1");
        assert_eq!(first.description, None);
        assert_eq!(first.tags.len(), 2);
        assert_eq!(first.reorder_point, 5.0);
        assert_eq!(first.total_value, 87.5);

        let second = &rows[1].record;
        assert!(!second.id.is_empty());
        assert_eq!(second.category, Category::FoodGrade);
        assert_eq!(second.location.as_deref(), Some("Shelf 2"));
        assert_eq!(rows[1].line, 3);
        assert_ne!(rows[0].import_key, rows[1].import_key);
    }

    #[test]
    fn test_bad_category_reports_line() {
        let csv = "name,category,unit,quantity,unit_price\nChair,furniture,each,1,10\n";
        let err = read_csv(csv.as_bytes(), "bad.csv").unwrap_err();

        assert!(err.to_string().contains("bad.csv, line 2"));
    }

    #[test]
    fn test_negative_quantity_rejected() {
        let csv = "name,category,unit,quantity,unit_price\nJar,packaging,each,-1,10\n";
        assert!(read_csv(csv.as_bytes(), "neg.csv").is_err());
    }

    #[test]
    fn test_import_twice_inserts_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stock.csv");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(CSV.as_bytes())
            .unwrap();

        let store = SqliteStore::open_in_memory().unwrap();
        let first = import_csv(&store, &path).unwrap();
        let second = import_csv(&store, &path).unwrap();

        assert_eq!((first.inserted, first.skipped), (2, 0));
        assert_eq!((second.inserted, second.skipped), (0, 2));
        assert!(second.id_conflicts.is_empty());
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn test_identical_rows_on_different_lines_both_import() {
        let csv = "name,category,unit,quantity,unit_price\nJar,packaging,each,1,1\nJar,packaging,each,1,1\n";
        let store = MemoryStore::new();
        for row in read_csv(csv.as_bytes(), "dupes.csv").unwrap() {
            assert_eq!(
                store.insert_imported(&row.record, &row.import_key).unwrap(),
                ImportOutcome::Inserted
            );
        }
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn test_multiline_field_keeps_line_numbers() {
        let csv = "name,description,category,unit,quantity,unit_price\n\
                   Jar,\"tall\nglass\",packaging,each,1,1\n\
                   Lid,,furniture,each,1,1\n";

        let err = read_csv(csv.as_bytes(), "lids.csv").unwrap_err();
        assert!(err.to_string().contains("lids.csv, line 4"), "{err}");

        let rows = read_csv(csv.lines().take(3).collect::<Vec<_>>().join("\n").as_bytes(), "lids.csv")
            .unwrap();
        assert_eq!(rows[0].line, 2);
        assert_eq!(rows[0].record.description.as_deref(), Some("tall\nglass"));
    }

    #[test]
    fn test_existing_id_is_reported_not_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stock.csv");
        std::fs::write(&path, CSV).unwrap();

        let store = SqliteStore::open_in_memory().unwrap();
        store
            .insert(&CatalogRecord::new("Oak Chair", Category::UsedGoods, "each", 1.0, 40.0).with_id("flour-1"))
            .unwrap();

        let summary = import_csv(&store, &path).unwrap();
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.skipped, 0);
        assert_eq!(summary.id_conflicts, vec!["flour-1"]);
        assert_eq!(store.get("flour-1").unwrap().unwrap().name, "Oak Chair");
    }
}
