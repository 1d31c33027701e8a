//! Input validation and fuzzy matching for CLI ergonomics.
//!
//! Provides O(1) validation sets and synonym maps so operators can type
//! natural words for sync statuses, plus the edit-distance helpers used to
//! rank identity candidates and "did you mean" suggestions. Three-tier
//! resolution: exact match → synonym lookup → error with suggestion.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use crate::model::EntityKind;

// ── Valid value sets (O(1) lookups) ──────────────────────────

pub static VALID_STATUSES: LazyLock<HashSet<&str>> = LazyLock::new(|| {
    ["to_push", "to_pull", "conflict", "unchanged", "to_delete"]
        .into_iter()
        .collect()
});

// ── Synonym maps (typo recovery) ─────────────────────────────

pub static STATUS_SYNONYMS: LazyLock<HashMap<&str, &str>> = LazyLock::new(|| {
    [
        ("push", "to_push"),
        ("outgoing", "to_push"),
        ("local", "to_push"),
        ("pull", "to_pull"),
        ("incoming", "to_pull"),
        ("remote", "to_pull"),
        ("conflicts", "conflict"),
        ("diverged", "conflict"),
        ("clean", "unchanged"),
        ("same", "unchanged"),
        ("delete", "to_delete"),
        ("orphan", "to_delete"),
        ("orphaned", "to_delete"),
    ]
    .into_iter()
    .collect()
});

/// Normalize a sync status filter via exact match or synonym lookup.
///
/// Returns the canonical status, or an error with the original input
/// and an optional suggestion.
pub fn normalize_status(input: &str) -> Result<String, (String, Option<String>)> {
    let lower = input.to_lowercase().replace('-', "_");

    if VALID_STATUSES.contains(lower.as_str()) {
        return Ok(lower);
    }
    if let Some(&canonical) = STATUS_SYNONYMS.get(lower.as_str()) {
        return Ok(canonical.to_string());
    }

    let suggestion = find_closest_match(&lower, &VALID_STATUSES, &STATUS_SYNONYMS);
    Err((input.to_string(), suggestion))
}

/// Find the closest matching value across valid set and synonyms.
fn find_closest_match(
    input: &str,
    valid: &HashSet<&str>,
    synonyms: &HashMap<&str, &str>,
) -> Option<String> {
    let mut best: Option<(&str, usize)> = None;

    for &v in valid.iter().chain(synonyms.keys()) {
        let dist = levenshtein_distance(input, v);
        if dist <= 3 && best.is_none_or(|(_, d)| dist < d) {
            // For synonyms, show what it maps to
            let shown = synonyms.get(v).copied().unwrap_or(v);
            best = Some((shown, dist));
        }
    }

    best.map(|(v, _)| v.to_string())
}

/// Check a workspace file path before storing it.
///
/// Paths are repository-relative with `/` separators. Paths reserved for
/// virtual files are rejected so a literal file never shadows an entity.
pub fn validate_workspace_path(path: &str) -> Result<(), String> {
    if path.is_empty() {
        return Err("path is empty".to_string());
    }
    if path.starts_with('/') || path.contains('\\') {
        return Err(format!("'{path}' must be relative and use '/' separators"));
    }
    if path.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..") {
        return Err(format!("'{path}' contains an empty, '.' or '..' segment"));
    }
    if let Some(kind) = EntityKind::ALL
        .into_iter()
        .find(|k| path.starts_with(&format!("{}/", k.dir())) && path.ends_with(k.suffix()))
    {
        return Err(format!(
            "'{path}' is reserved for {kind} entities; import it as an entity instead"
        ));
    }
    Ok(())
}

// ── Levenshtein distance ─────────────────────────────────────

/// Compute the Levenshtein edit distance between two strings.
#[must_use]
pub fn levenshtein_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let a_len = a.len();
    let b_len = b.len();

    if a_len == 0 {
        return b_len;
    }
    if b_len == 0 {
        return a_len;
    }

    // Use single-row optimization (O(min(m,n)) space)
    let mut prev: Vec<usize> = (0..=b_len).collect();
    let mut curr = vec![0; b_len + 1];

    for i in 1..=a_len {
        curr[0] = i;
        for j in 1..=b_len {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1) // deletion
                .min(curr[j - 1] + 1) // insertion
                .min(prev[j - 1] + cost); // substitution
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b_len]
}

/// Find existing IDs similar to the searched ID.
///
/// Returns up to `max` suggestions with edit distance ≤ 3,
/// sorted by distance then alphabetically.
#[must_use]
pub fn find_similar_ids(searched: &str, existing: &[String], max: usize) -> Vec<String> {
    let mut candidates: Vec<(usize, &str)> = existing
        .iter()
        .map(|id| (levenshtein_distance(searched, id), id.as_str()))
        .filter(|(dist, _)| *dist <= 3)
        .collect();

    candidates.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)));

    candidates
        .into_iter()
        .take(max)
        .map(|(_, id)| id.to_string())
        .collect()
}

/// Similarity of two display names in `[0.0, 1.0]`, case-insensitive.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn name_similarity(a: &str, b: &str) -> f64 {
    let a = a.trim().to_lowercase();
    let b = b.trim().to_lowercase();
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 1.0;
    }
    1.0 - levenshtein_distance(&a, &b) as f64 / longest as f64
}
