// 📏 Similarity Scorer - bounded edit-distance similarity

use crate::normalize::NormalizedText;

/// Calculate Levenshtein distance between two strings
///
/// Minimum number of single-character edits (insertions, deletions,
/// substitutions) to turn one string into the other. Counted in Unicode
/// scalar values, not bytes. Only two rows of the DP table are kept alive.
pub fn levenshtein_distance(s1: &str, s2: &str) -> usize {
    let s1_chars: Vec<char> = s1.chars().collect();
    let s2_chars: Vec<char> = s2.chars().collect();

    if s1_chars.is_empty() {
        return s2_chars.len();
    }
    if s2_chars.is_empty() {
        return s1_chars.len();
    }

    let mut prev: Vec<usize> = (0..=s2_chars.len()).collect();
    let mut curr = vec![0; s2_chars.len() + 1];

    for (i, c1) in s1_chars.iter().enumerate() {
        curr[0] = i + 1;
        for (j, c2) in s2_chars.iter().enumerate() {
            let cost = if c1 == c2 { 0 } else { 1 };

            curr[j + 1] = std::cmp::min(
                std::cmp::min(
                    prev[j + 1] + 1, // deletion
                    curr[j] + 1,     // insertion
                ),
                prev[j] + cost, // substitution
            );
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[s2_chars.len()]
}

/// Similarity in [0, 1]: `(maxLen - distance) / maxLen`.
///
/// Two empty strings are identical (1.0); empty vs non-empty is 0.0.
pub fn similarity(a: &NormalizedText, b: &NormalizedText) -> f64 {
    similarity_str(a.as_str(), b.as_str())
}

pub(crate) fn similarity_str(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }

    let distance = levenshtein_distance(a, b);
    (max_len - distance) as f64 / max_len as f64
}

/// Like [`similarity`], but skips the DP when the length difference alone
/// rules out reaching `floor`.
///
/// The distance is at least `|la - lb|`, so similarity is at most
/// `min(la, lb) / max(la, lb)`. Returns `None` when that bound is below
/// `floor`; otherwise the exact similarity (which may still be below `floor`).
pub fn similarity_at_least(a: &NormalizedText, b: &NormalizedText, floor: f64) -> Option<f64> {
    let la = a.len_chars();
    let lb = b.len_chars();
    let max_len = la.max(lb);
    if max_len == 0 {
        return Some(1.0);
    }

    let upper_bound = la.min(lb) as f64 / max_len as f64;
    if upper_bound < floor {
        return None;
    }

    Some(similarity(a, b))
}

// ============================================================================
// TESTS
// ============================================================================
