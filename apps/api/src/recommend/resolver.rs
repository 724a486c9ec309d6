use std::collections::HashMap;

use sha2::{Digest, Sha256};

use crate::models::SimilarityEntry;

/// Items per feed page.
pub const PAGE_SIZE: usize = 50;
/// History depth feeding the personalized path.
pub const HISTORY_LIMIT: i64 = 15;
/// Growth window for the anonymous trending feed, in days.
pub const TRENDING_WINDOW_DAYS: u32 = 30;

/// Splits a comma-list query parameter into a sorted, deduplicated facet
/// list. Sorting makes facet order irrelevant to cache keys.
pub fn normalize_facets(raw: Option<&str>) -> Vec<String> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    let mut facets: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
    facets.sort();
    facets.dedup();
    facets
}

/// Key for the whole-response cache. The session id participates so
/// personalized feeds never leak across sessions; a hash keeps key size
/// flat no matter how many facets arrive.
pub fn response_cache_key(
    session_id: &str,
    languages: &[String],
    tags: &[String],
    topics: &[String],
    page: usize,
) -> String {
    let raw = format!(
        "retrieveList:{}:{}:{}:{}:{}",
        session_id,
        languages.join(","),
        tags.join(","),
        topics.join(","),
        page
    );
    format!("cache:{:x}", Sha256::digest(raw.as_bytes()))
}

/// Key for a filtered id-list cache entry, derived from the ordered input
/// ids plus the facets.
pub fn filter_cache_key(
    ids: &[i64],
    languages: &[String],
    tags: &[String],
    topics: &[String],
) -> String {
    let mut joined = String::new();
    for id in ids {
        joined.push_str(&id.to_string());
    }
    format!(
        "filtered_ids:{:x}:{}:{}:{}",
        Sha256::digest(joined.as_bytes()),
        languages.join(","),
        tags.join(","),
        topics.join(",")
    )
}

/// Accumulates neighborhood scores across all history entries and returns
/// candidate ids ordered by total score descending.
pub fn accumulate_scores<I>(neighborhoods: I) -> Vec<i64>
where
    I: IntoIterator<Item = Vec<SimilarityEntry>>,
{
    let mut totals: HashMap<i64, f64> = HashMap::new();
    for neighborhood in neighborhoods {
        for entry in neighborhood {
            *totals.entry(entry.member).or_default() += entry.score;
        }
    }

    let mut scored: Vec<(i64, f64)> = totals.into_iter().collect();
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    scored.into_iter().map(|(id, _)| id).collect()
}

/// Slice of the candidate list for a 0-based page; past-the-end pages are
/// empty, not an error.
pub fn paginate(ids: &[i64], page: usize) -> Vec<i64> {
    let start = page.saturating_mul(PAGE_SIZE);
    if start >= ids.len() {
        return Vec::new();
    }
    let end = (start + PAGE_SIZE).min(ids.len());
    ids[start..end].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(member: i64, score: f64) -> SimilarityEntry {
        SimilarityEntry { member, score }
    }

    #[test]
    fn test_accumulate_scores_orders_by_total() {
        // History A neighbors: 7@0.9, 8@0.4; history B neighbors: 7@0.2, 9@0.5.
        let a = vec![entry(7, 0.9), entry(8, 0.4)];
        let b = vec![entry(7, 0.2), entry(9, 0.5)];
        assert_eq!(accumulate_scores([a, b]), vec![7, 9, 8]);
    }

    #[test]
    fn test_accumulate_scores_empty() {
        assert_eq!(accumulate_scores(Vec::<Vec<SimilarityEntry>>::new()), Vec::<i64>::new());
    }

    #[test]
    fn test_paginate_past_end_is_empty() {
        let ids: Vec<i64> = (0..30).collect();
        assert!(paginate(&ids, 1).is_empty());
        assert!(paginate(&ids, 100).is_empty());
    }

    #[test]
    fn test_paginate_full_and_partial_pages() {
        let ids: Vec<i64> = (0..120).collect();
        assert_eq!(paginate(&ids, 0).len(), PAGE_SIZE);
        assert_eq!(paginate(&ids, 1).len(), PAGE_SIZE);
        assert_eq!(paginate(&ids, 2).len(), 20);
        assert_eq!(paginate(&ids, 2)[0], 100);
    }

    #[test]
    fn test_normalize_facets_sorts_and_drops_empties() {
        assert_eq!(normalize_facets(Some("rust,, go ,")), vec!["go", "rust"]);
        assert_eq!(normalize_facets(Some("")), Vec::<String>::new());
        assert_eq!(normalize_facets(None), Vec::<String>::new());
    }

    #[test]
    fn test_response_cache_key_varies_by_page_and_session() {
        let langs = vec!["rust".to_string()];
        let none: Vec<String> = Vec::new();
        let key_a = response_cache_key("s1", &langs, &none, &none, 0);
        let key_b = response_cache_key("s1", &langs, &none, &none, 1);
        let key_c = response_cache_key("s2", &langs, &none, &none, 0);
        assert_ne!(key_a, key_b);
        assert_ne!(key_a, key_c);
        assert!(key_a.starts_with("cache:"));
        // Deterministic for identical inputs.
        assert_eq!(key_a, response_cache_key("s1", &langs, &none, &none, 0));
    }

    #[test]
    fn test_filter_cache_key_depends_on_id_order() {
        let none: Vec<String> = Vec::new();
        let langs = vec!["rust".to_string()];
        let forward = filter_cache_key(&[1, 2, 3], &langs, &none, &none);
        let backward = filter_cache_key(&[3, 2, 1], &langs, &none, &none);
        assert_ne!(forward, backward);
    }
}
