// Text canonicalization applied before any comparison

use serde::Serialize;
use std::fmt;

/// Lower-cased, punctuation-free, single-spaced text
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize)]
pub struct NormalizedText(String);

impl NormalizedText {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Length in Unicode scalar values (the unit the scorer works in)
    pub fn len_chars(&self) -> usize {
        self.0.chars().count()
    }
}

impl fmt::Display for NormalizedText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonicalize free text for matching.
///
/// - Lowercase
/// - Drop everything that is not a letter, digit or whitespace
/// - Collapse whitespace runs to one space, trim the ends
///
/// Punctuation is dropped before whitespace is collapsed, so "Flour - Rye"
/// becomes "flour rye" rather than keeping a double space.
pub fn normalize(text: &str) -> NormalizedText {
    let stripped: String = text
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect();

    NormalizedText(stripped.split_whitespace().collect::<Vec<_>>().join(" "))
}

/// Normalize an optional field; `None` and blank text both become empty
pub fn normalize_opt(text: Option<&str>) -> NormalizedText {
    text.map(normalize).unwrap_or_default()
}
