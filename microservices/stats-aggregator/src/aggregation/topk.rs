//! Top-keyword ranking

use std::collections::HashMap;
use trendpulse_core::TOP_KEYWORDS_LIMIT;

/// Rank keywords by occurrence count, most frequent first. Equal counts
/// keep the order in which the keywords were first seen. Blank entries
/// are ignored.
pub fn rank_keywords<'a, I>(occurrences: I, limit: usize) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut counts: HashMap<&'a str, (usize, usize)> = HashMap::new();
    for (position, keyword) in occurrences.into_iter().enumerate() {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            continue;
        }
        counts.entry(keyword).or_insert((0, position)).0 += 1;
    }

    let mut ranked: Vec<(&str, usize, usize)> = counts
        .into_iter()
        .map(|(keyword, (count, first_seen))| (keyword, count, first_seen))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
    ranked
        .into_iter()
        .take(limit)
        .map(|(keyword, _, _)| keyword.to_string())
        .collect()
}

/// Merge an existing top list with newly observed keywords
pub fn merge_top_keywords(existing: &[String], incoming: &[String]) -> Vec<String> {
    rank_keywords(
        existing.iter().chain(incoming).map(String::as_str),
        TOP_KEYWORDS_LIMIT,
    )
}

/// Recount every keyword across several buckets' lists
pub fn recount_top_keywords<'a, I>(lists: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a [String]>,
{
    rank_keywords(
        lists.into_iter().flatten().map(String::as_str),
        TOP_KEYWORDS_LIMIT,
    )
}
