// 🔍 Candidate Matcher - decide whether two catalog records are duplicates
//
// Name similarity is the gate; category, supplier, unit and description
// add bonuses on top. Only lexical signals, no semantics.

use crate::error::{EngineError, Result};
use crate::normalize::{normalize, normalize_opt, NormalizedText};
use crate::record::{CatalogRecord, Category};
use crate::similarity::{similarity, similarity_at_least};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bonus added whenever the two categories are equal
pub const CATEGORY_MATCH_BONUS: f64 = 0.10;

/// Description similarity must exceed this to contribute
pub const DESCRIPTION_FLOOR: f64 = 0.5;

/// Weight applied to description similarity when it contributes
pub const DESCRIPTION_WEIGHT: f64 = 0.10;

// ============================================================================
// OPTIONS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchOptions {
    /// Minimum name similarity to be considered at all (default: 0.70)
    pub name_similarity_threshold: f64,

    /// Reject pairs whose categories differ (default: true)
    pub require_category_match: bool,

    /// Added when both suppliers are present and equal (default: 0.20)
    pub supplier_match_bonus: f64,

    /// Added when units are equal (default: 0.10)
    pub unit_match_bonus: f64,

    /// Minimum composite confidence to accept (default: 0.60).
    /// Below the name threshold with defaults, so it only bites when the
    /// name threshold is lowered.
    pub acceptance_threshold: f64,
}

impl Default for MatchOptions {
    fn default() -> Self {
        MatchOptions {
            name_similarity_threshold: 0.70,
            require_category_match: true,
            supplier_match_bonus: 0.20,
            unit_match_bonus: 0.10,
            acceptance_threshold: 0.60,
        }
    }
}

impl MatchOptions {
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("name_similarity_threshold", self.name_similarity_threshold),
            ("supplier_match_bonus", self.supplier_match_bonus),
            ("unit_match_bonus", self.unit_match_bonus),
            ("acceptance_threshold", self.acceptance_threshold),
        ] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(EngineError::validation(format!(
                    "{field} must be within [0, 1], got {value}"
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// MATCH SIGNAL & EXPLANATION
// ============================================================================

/// Raw comparison outcome for one pair of records
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchSignal {
    pub name_similarity: f64,

    /// Present only when both descriptions are non-empty
    pub description_similarity: Option<f64>,

    pub same_category: bool,
    pub same_supplier: bool,
    pub same_unit: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Name,
    Supplier,
    Unit,
    Category,
    Description,
}

/// One term of the composite confidence
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Contribution {
    pub kind: SignalKind,

    /// Amount added to the confidence (before clamping)
    pub amount: f64,

    /// Similarity behind the amount, for name and description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f64>,
}

/// Ordered list of the signals that fired, in the order they were applied
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Explanation {
    pub contributions: Vec<Contribution>,
}

impl Explanation {
    fn push(&mut self, kind: SignalKind, amount: f64, similarity: Option<f64>) {
        self.contributions.push(Contribution {
            kind,
            amount,
            similarity,
        });
    }

    pub fn has(&self, kind: SignalKind) -> bool {
        self.contributions.iter().any(|c| c.kind == kind)
    }
}

impl fmt::Display for Explanation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .contributions
            .iter()
            .map(|c| match (c.kind, c.similarity) {
                (SignalKind::Name, Some(sim)) => format!("name {:.0}% similar", sim * 100.0),
                (SignalKind::Description, Some(sim)) => {
                    format!("description {:.0}% similar (+{:.2})", sim * 100.0, c.amount)
                }
                (SignalKind::Supplier, _) => format!("same supplier (+{:.2})", c.amount),
                (SignalKind::Unit, _) => format!("same unit (+{:.2})", c.amount),
                (SignalKind::Category, _) => format!("same category (+{:.2})", c.amount),
                (kind, _) => format!("{:?} (+{:.2})", kind, c.amount),
            })
            .collect();
        f.write_str(&parts.join(", "))
    }
}

// ============================================================================
// DUPLICATE CANDIDATE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateCandidate {
    /// Id of the first record of the ordered pair
    pub record_a: String,

    /// Id of the second record of the ordered pair
    pub record_b: String,

    /// Composite confidence (0.0 - 1.0)
    pub confidence: f64,

    pub signal: MatchSignal,

    pub explanation: Explanation,
}

impl DuplicateCandidate {
    /// Human-readable reason
    pub fn reason(&self) -> String {
        self.explanation.to_string()
    }
}

/// Pre-normalized comparison fields of one record
#[derive(Debug, Clone)]
pub(crate) struct MatchKey {
    name: NormalizedText,
    description: NormalizedText,
    supplier: NormalizedText,
    unit: NormalizedText,
    category: Category,
}

impl MatchKey {
    pub(crate) fn from_record(record: &CatalogRecord) -> Self {
        MatchKey {
            name: normalize(&record.name),
            description: normalize_opt(record.description.as_deref()),
            supplier: normalize_opt(record.supplier.as_deref()),
            unit: normalize(&record.unit),
            category: record.category,
        }
    }
}

// ============================================================================
// CANDIDATE MATCHER
// ============================================================================

#[derive(Debug, Clone)]
pub struct CandidateMatcher {
    options: MatchOptions,
}

impl CandidateMatcher {
    /// Create a matcher, rejecting out-of-range options
    pub fn new(options: MatchOptions) -> Result<Self> {
        options.validate()?;
        Ok(CandidateMatcher { options })
    }

    pub fn options(&self) -> &MatchOptions {
        &self.options
    }

    /// Compare an ordered pair of records
    pub fn evaluate(&self, a: &CatalogRecord, b: &CatalogRecord) -> Option<DuplicateCandidate> {
        self.evaluate_keys(a, &MatchKey::from_record(a), b, &MatchKey::from_record(b))
    }

    pub(crate) fn evaluate_keys(
        &self,
        a: &CatalogRecord,
        key_a: &MatchKey,
        b: &CatalogRecord,
        key_b: &MatchKey,
    ) -> Option<DuplicateCandidate> {
        let opts = &self.options;

        // 1-2. Name gate (length delta can rule it out without the DP)
        let name_sim =
            similarity_at_least(&key_a.name, &key_b.name, opts.name_similarity_threshold)?;
        if name_sim < opts.name_similarity_threshold {
            return None;
        }

        // 3. Category gate
        let same_category = key_a.category == key_b.category;
        if opts.require_category_match && !same_category {
            return None;
        }

        let same_supplier = !key_a.supplier.is_empty() && key_a.supplier == key_b.supplier;
        let same_unit = key_a.unit == key_b.unit;
        let description_similarity = if !key_a.description.is_empty()
            && !key_b.description.is_empty()
        {
            Some(similarity(&key_a.description, &key_b.description))
        } else {
            None
        };

        // 4-8. Composite
        let mut explanation = Explanation::default();
        let mut confidence = name_sim;
        explanation.push(SignalKind::Name, name_sim, Some(name_sim));

        if same_supplier {
            confidence += opts.supplier_match_bonus;
            explanation.push(SignalKind::Supplier, opts.supplier_match_bonus, None);
        }
        if same_unit {
            confidence += opts.unit_match_bonus;
            explanation.push(SignalKind::Unit, opts.unit_match_bonus, None);
        }
        if same_category {
            confidence += CATEGORY_MATCH_BONUS;
            explanation.push(SignalKind::Category, CATEGORY_MATCH_BONUS, None);
        }
        if let Some(desc_sim) = description_similarity {
            if desc_sim > DESCRIPTION_FLOOR {
                let amount = desc_sim * DESCRIPTION_WEIGHT;
                confidence += amount;
                explanation.push(SignalKind::Description, amount, Some(desc_sim));
            }
        }

        // 9. Clamp
        let confidence = confidence.min(1.0);

        // 10. Acceptance
        if confidence < opts.acceptance_threshold {
            return None;
        }

        Some(DuplicateCandidate {
            record_a: a.id.clone(),
            record_b: b.id.clone(),
            confidence,
            signal: MatchSignal {
                name_similarity: name_sim,
                description_similarity,
                same_category,
                same_supplier,
                same_unit,
            },
            explanation,
        })
    }
}

impl Default for CandidateMatcher {
    fn default() -> Self {
        CandidateMatcher {
            options: MatchOptions::default(),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn item(name: &str, category: Category, supplier: Option<&str>) -> CatalogRecord {
        let record = CatalogRecord::new(name, category, "kg", 10.0, 3.5);
        match supplier {
            Some(s) => record.with_supplier(s),
            None => record,
        }
    }

    #[test]
    fn test_flour_typo_is_duplicate_with_clamped_confidence() {
        let matcher = CandidateMatcher::default();
        let a = item("Organic Flour", Category::FoodGrade, Some("Farm A"));
        let b = item("Organic Flor", Category::FoodGrade, Some("Farm A"));

        let candidate = matcher.evaluate(&a, &b).expect("should match");

        assert!(candidate.signal.name_similarity > 0.9);
        assert!(candidate.signal.same_supplier);
        assert!(candidate.signal.same_unit);
        assert_eq!(candidate.confidence, 1.0);
        assert_eq!(candidate.record_a, a.id);
        assert_eq!(candidate.record_b, b.id);
    }

    #[test]
    fn test_category_gate_rejects_identical_names() {
        let matcher = CandidateMatcher::default();
        let a = item("Kraft Paper", Category::FoodGrade, None);
        let b = item("Kraft Paper", Category::Packaging, None);

        assert!(matcher.evaluate(&a, &b).is_none());
    }

    #[test]
    fn test_category_gate_can_be_disabled() {
        let matcher = CandidateMatcher::new(MatchOptions {
            require_category_match: false,
            ..MatchOptions::default()
        })
        .unwrap();
        let a = item("Kraft Paper", Category::FoodGrade, None);
        let b = item("Kraft Paper", Category::Packaging, None);

        let candidate = matcher.evaluate(&a, &b).expect("gate disabled");
        assert!(!candidate.signal.same_category);
        assert!(!candidate.explanation.has(SignalKind::Category));
        // name 1.0 + unit 0.10, clamped
        assert_eq!(candidate.confidence, 1.0);
    }

    #[test]
    fn test_name_below_threshold_rejected() {
        let matcher = CandidateMatcher::default();
        let a = item("Beeswax Pellets", Category::RawMaterials, Some("Hive Co"));
        let b = item("Soy Wax Flakes", Category::RawMaterials, Some("Hive Co"));

        assert!(matcher.evaluate(&a, &b).is_none());
    }

    #[test]
    fn test_bonus_accumulation_without_clamp() {
        let matcher = CandidateMatcher::default();
        // "linen thread" vs "linen threads": 12/13
        let a = CatalogRecord::new("Linen Thread", Category::RawMaterials, "spool", 1.0, 1.0);
        let b = CatalogRecord::new("Linen Threads", Category::RawMaterials, "cone", 1.0, 1.0);

        let candidate = matcher.evaluate(&a, &b).unwrap();
        let expected = 12.0 / 13.0 + CATEGORY_MATCH_BONUS;
        assert!((candidate.confidence - expected.min(1.0)).abs() < 1e-12);
        assert!(!candidate.signal.same_unit);
        assert!(!candidate.signal.same_supplier);
    }

    #[test]
    fn test_supplier_requires_both_present() {
        let matcher = CandidateMatcher::new(MatchOptions {
            require_category_match: false,
            unit_match_bonus: 0.0,
            ..MatchOptions::default()
        })
        .unwrap();
        let a = item("Glass Jar", Category::Packaging, None);
        let b = item("Glass Jars", Category::UsedGoods, None);

        let candidate = matcher.evaluate(&a, &b).unwrap();
        assert!(!candidate.signal.same_supplier);
        assert!(!candidate.explanation.has(SignalKind::Supplier));
    }

    #[test]
    fn test_supplier_and_unit_compared_normalized() {
        let matcher = CandidateMatcher::default();
        let a = item("Rye Flour", Category::FoodGrade, Some("Farm A"));
        let mut b = item("Rye Flour", Category::FoodGrade, Some("FARM-A"));
        b.unit = "KG".to_string();

        let candidate = matcher.evaluate(&a, &b).unwrap();
        assert!(!candidate.signal.same_supplier); // "farm a" vs "farma"
        assert!(candidate.signal.same_unit);

        let c = item("Rye Flour", Category::FoodGrade, Some("farm a."));
        assert!(matcher.evaluate(&a, &c).unwrap().signal.same_supplier);
    }

    #[test]
    fn test_description_bonus_only_above_floor() {
        let matcher = CandidateMatcher::new(MatchOptions {
            name_similarity_threshold: 0.5,
            supplier_match_bonus: 0.0,
            unit_match_bonus: 0.0,
            ..MatchOptions::default()
        })
        .unwrap();

        let a = item("Honey Jar", Category::FoodGrade, None).with_description("raw wildflower honey");
        let b = item("Honey Jars", Category::FoodGrade, None).with_description("raw wildflower honey");
        let candidate = matcher.evaluate(&a, &b).unwrap();
        assert_eq!(candidate.signal.description_similarity, Some(1.0));
        assert!(candidate.explanation.has(SignalKind::Description));

        let c = item("Honey Jars", Category::FoodGrade, None).with_description("xyz");
        let candidate = matcher.evaluate(&a, &c).unwrap();
        assert!(candidate.signal.description_similarity.unwrap() <= DESCRIPTION_FLOOR);
        assert!(!candidate.explanation.has(SignalKind::Description));

        let d = item("Honey Jars", Category::FoodGrade, None);
        let candidate = matcher.evaluate(&a, &d).unwrap();
        assert_eq!(candidate.signal.description_similarity, None);
    }

    #[test]
    fn test_empty_names() {
        let matcher = CandidateMatcher::default();
        let a = item("", Category::UsedGoods, None);
        let b = item("???", Category::UsedGoods, None);
        let c = item("Oak Chair", Category::UsedGoods, None);

        // both normalize to empty: similarity 1.0
        assert!(matcher.evaluate(&a, &b).is_some());
        assert!(matcher.evaluate(&a, &c).is_none());
    }

    /// With default options the acceptance threshold (0.60) sits below the
    /// name gate (0.70), so every pair passing the gate is accepted. This
    /// pins that behavior so a change to either default is noticed.
    #[test]
    fn test_acceptance_threshold_redundant_under_defaults() {
        let opts = MatchOptions::default();
        assert!(opts.acceptance_threshold < opts.name_similarity_threshold);

        let matcher = CandidateMatcher::new(MatchOptions {
            require_category_match: false,
            ..MatchOptions::default()
        })
        .unwrap();
        // 7/10 name similarity, different category and unit: no bonuses
        let a = CatalogRecord::new("abcdefghij", Category::FoodGrade, "kg", 1.0, 1.0);
        let b = CatalogRecord::new("abcdefgxyz", Category::Packaging, "each", 1.0, 1.0);
        let candidate = matcher.evaluate(&a, &b).expect("accepted at the gate minimum");
        assert!((candidate.confidence - 0.7).abs() < 1e-12);
    }

    #[test]
    fn test_acceptance_threshold_bites_when_gate_lowered() {
        let matcher = CandidateMatcher::new(MatchOptions {
            name_similarity_threshold: 0.3,
            require_category_match: false,
            acceptance_threshold: 0.6,
            ..MatchOptions::default()
        })
        .unwrap();
        // 5/10 name similarity, nothing else in common
        let a = CatalogRecord::new("abcdefghij", Category::FoodGrade, "kg", 1.0, 1.0);
        let b = CatalogRecord::new("abcdevwxyz", Category::Packaging, "each", 1.0, 1.0);

        assert!(matcher.evaluate(&a, &b).is_none());
    }

    #[test]
    fn test_invalid_options_rejected() {
        let err = CandidateMatcher::new(MatchOptions {
            name_similarity_threshold: 1.5,
            ..MatchOptions::default()
        })
        .unwrap_err();
        assert!(err.to_string().contains("name_similarity_threshold"));

        assert!(CandidateMatcher::new(MatchOptions {
            unit_match_bonus: -0.1,
            ..MatchOptions::default()
        })
        .is_err());
        assert!(CandidateMatcher::new(MatchOptions {
            acceptance_threshold: f64::NAN,
            ..MatchOptions::default()
        })
        .is_err());
    }

    #[test]
    fn test_explanation_text() {
        let matcher = CandidateMatcher::default();
        let a = item("Organic Flour", Category::FoodGrade, Some("Farm A"));
        let b = item("Organic Flor", Category::FoodGrade, Some("Farm A"));
        let reason = matcher.evaluate(&a, &b).unwrap().reason();

        assert_eq!(
            reason,
            "name 92% similar, same supplier (+0.20), same unit (+0.10), same category (+0.10)"
        );
    }
}
