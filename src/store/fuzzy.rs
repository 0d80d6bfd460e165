// store/fuzzy.rs
// Rune-set match predicate, the second tier of name search

use std::collections::HashSet;

/// True iff every Unicode scalar of `query` appears somewhere in `target`,
/// in any order, possibly non-contiguous. Catches abbreviation patterns
/// common in Chinese: `資工系` matches `資訊工程學系`.
///
/// An empty query matches nothing — callers filter those out before the
/// search tiers run.
pub fn rune_set_match(query: &str, target: &str) -> bool {
    if query.is_empty() {
        return false;
    }
    let have: HashSet<char> = target.chars().collect();
    query.chars().all(|c| have.contains(&c))
}

/// Filter `items` down to those whose designated field rune-set-matches the
/// query, preserving input order.
pub fn filter_rune_set<T>(query: &str, items: Vec<T>, field: impl Fn(&T) -> &str) -> Vec<T> {
    items
        .into_iter()
        .filter(|item| rune_set_match(query, field(item)))
        .collect()
}
