// 📦 Catalog Record - one stock-keeping entry as owned by the Catalog Store
//
// Identity is the `id` (never changes, survives merges).
// Everything else is a value that the store may replace with a new version.

use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// CATEGORY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Ingredients and consumables safe for food production
    FoodGrade,

    /// Unprocessed inputs (wool, clay, timber)
    RawMaterials,

    /// Jars, labels, boxes
    Packaging,

    /// Second-hand stock
    UsedGoods,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::FoodGrade => "food_grade",
            Category::RawMaterials => "raw_materials",
            Category::Packaging => "packaging",
            Category::UsedGoods => "used_goods",
        }
    }

    pub fn all() -> [Category; 4] {
        [
            Category::FoodGrade,
            Category::RawMaterials,
            Category::Packaging,
            Category::UsedGoods,
        ]
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let key = s.trim().to_lowercase().replace([' ', '-'], "_");
        Category::all()
            .into_iter()
            .find(|c| c.as_str() == key)
            .ok_or_else(|| EngineError::validation(format!("unknown category: {s}")))
    }
}

// ============================================================================
// CATALOG RECORD
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogRecord {
    /// Stable identity - NEVER changes, the surviving id after a merge
    pub id: String,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub category: Category,

    /// Unit of measure ("kg", "jar", "each")
    pub unit: String,

    /// Current stock on hand (fractional for weighed goods)
    pub quantity: f64,

    pub unit_price: f64,

    /// Stored aggregate value; equals quantity × unit_price until a merge
    /// with an operator override sets it explicitly
    pub total_value: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supplier: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    #[serde(default)]
    pub reorder_point: f64,

    /// Optimistic concurrency counter, bumped on every write
    #[serde(default = "default_version")]
    pub version: i64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_version() -> i64 {
    1
}

impl CatalogRecord {
    /// Create a new record with a fresh UUID and derived total value
    pub fn new(
        name: impl Into<String>,
        category: Category,
        unit: impl Into<String>,
        quantity: f64,
        unit_price: f64,
    ) -> Self {
        let now = Utc::now();
        CatalogRecord {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            description: None,
            category,
            unit: unit.into(),
            quantity,
            unit_price,
            total_value: quantity * unit_price,
            supplier: None,
            tags: BTreeSet::new(),
            location: None,
            reorder_point: 0.0,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_supplier(mut self, supplier: impl Into<String>) -> Self {
        self.supplier = Some(supplier.into());
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_reorder_point(mut self, reorder_point: f64) -> Self {
        self.reorder_point = reorder_point;
        self
    }

    /// quantity × unit_price, independent of the stored total
    pub fn derived_value(&self) -> f64 {
        self.quantity * self.unit_price
    }

    /// Check the numeric invariants the store enforces on every write
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(EngineError::validation("record id is empty"));
        }
        for (field, value) in [
            ("quantity", self.quantity),
            ("unit_price", self.unit_price),
            ("total_value", self.total_value),
            ("reorder_point", self.reorder_point),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(EngineError::validation(format!(
                    "{field} must be a non-negative number, got {value} on {}",
                    self.id
                )));
            }
        }
        Ok(())
    }

    /// Content hash used to make CSV import idempotent.
    /// NOTE: this is for re-import detection, not identity.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!(
            "{}|{}|{}|{}|{}|{}|{}",
            self.name,
            self.category,
            self.unit,
            self.supplier.as_deref().unwrap_or(""),
            self.location.as_deref().unwrap_or(""),
            self.quantity,
            self.unit_price
        ));
        format!("{:x}", hasher.finalize())
    }

    /// Next version of this record: same identity, bumped version and timestamp
    pub fn next_version(&self) -> CatalogRecord {
        let mut next = self.clone();
        next.version += 1;
        next.updated_at = Utc::now();
        next
    }
}

// ============================================================================
// TESTS
// ============================================================================
