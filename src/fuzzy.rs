//! Trigram fuzzy matching.
//!
//! Strings are lowercased and padded with one space on each side; every
//! 3-character window is a trigram and each string contributes a *set* of
//! trigrams. Similarity is the Jaccard index of two sets.
//!
//! ## Example
//! ```rust
//! use fleet_tracker::fuzzy::{similarity, search, FuzzyConfig};
//!
//! assert_eq!(similarity("ABC123", "ABC123"), 1.0);
//! let hits = search("ABC123", [(1, "ABD123"), (2, "ZZZZZZZ")], 10, &FuzzyConfig::default());
//! assert_eq!(hits.len(), 1);
//! assert_eq!(hits[0].id, 1);
//! ```

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// Three characters of a padded, lowercased string.
pub type Trigram = [char; 3];

/// Default minimum similarity for a candidate to be returned.
pub const DEFAULT_THRESHOLD: f64 = 0.3;

/// Configuration for fuzzy search.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FuzzyConfig {
    /// Candidates scoring below this are dropped.
    /// Default: 0.3
    pub threshold: f64,
}

impl Default for FuzzyConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

impl FuzzyConfig {
    pub fn with_threshold(threshold: f64) -> Self {
        Self { threshold }
    }
}

/// One ranked search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuzzyMatch {
    pub id: u64,
    pub text: String,
    /// Jaccard similarity in [0, 1]
    pub score: f64,
}

/// Trigram set of `s`.
pub fn trigrams(s: &str) -> HashSet<Trigram> {
    let padded: Vec<char> = std::iter::once(' ')
        .chain(s.to_lowercase().chars())
        .chain(std::iter::once(' '))
        .collect();
    padded.windows(3).map(|w| [w[0], w[1], w[2]]).collect()
}

fn jaccard(shared: usize, len_a: usize, len_b: usize) -> f64 {
    let union = len_a + len_b - shared;
    if union == 0 {
        0.0
    } else {
        shared as f64 / union as f64
    }
}

/// Jaccard similarity of the trigram sets of `a` and `b`.
pub fn similarity(a: &str, b: &str) -> f64 {
    let ta = trigrams(a);
    let tb = trigrams(b);
    let shared = ta.intersection(&tb).count();
    jaccard(shared, ta.len(), tb.len())
}

/// Score descending, id ascending.
fn rank(matches: &mut Vec<FuzzyMatch>, limit: usize) {
    matches.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then(a.id.cmp(&b.id))
    });
    matches.truncate(limit);
}

/// Score `query` against every candidate and return those at or above the
/// threshold, best first, at most `limit` of them.
///
/// Never fails: no qualifying candidate yields an empty list.
pub fn search<I, S>(query: &str, candidates: I, limit: usize, config: &FuzzyConfig) -> Vec<FuzzyMatch>
where
    I: IntoIterator<Item = (u64, S)>,
    S: AsRef<str>,
{
    let query_grams = trigrams(query);
    let mut matches: Vec<FuzzyMatch> = candidates
        .into_iter()
        .filter_map(|(id, text)| {
            let text = text.as_ref();
            let grams = trigrams(text);
            let shared = query_grams.intersection(&grams).count();
            let score = jaccard(shared, query_grams.len(), grams.len());
            (score >= config.threshold).then(|| FuzzyMatch {
                id,
                text: text.to_string(),
                score,
            })
        })
        .collect();
    rank(&mut matches, limit);
    matches
}

// ============================================================================
// Prebuilt Index
// ============================================================================

#[derive(Debug, Clone)]
struct IndexEntry {
    id: u64,
    text: String,
    gram_count: usize,
}

/// Prebuilt trigram sets for a collection of identifiers, with an inverted
/// trigram -> entry map.
///
/// With a positive threshold only entries sharing at least one trigram with
/// the query can qualify, so the postings lists are the complete candidate
/// set. A threshold of zero or below falls back to scoring every entry.
#[derive(Debug, Clone, Default)]
pub struct TrigramIndex {
    entries: Vec<IndexEntry>,
    postings: HashMap<Trigram, Vec<usize>>,
}

impl TrigramIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = (u64, S)>,
        S: AsRef<str>,
    {
        let mut index = Self::new();
        for (id, text) in items {
            index.insert(id, text.as_ref());
        }
        index
    }

    pub fn insert(&mut self, id: u64, text: &str) {
        let slot = self.entries.len();
        let grams = trigrams(text);
        for gram in &grams {
            self.postings.entry(*gram).or_default().push(slot);
        }
        self.entries.push(IndexEntry {
            id,
            text: text.to_string(),
            gram_count: grams.len(),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.postings.clear();
    }

    /// Same contract as [`search`], over the indexed collection.
    pub fn search(&self, query: &str, limit: usize, config: &FuzzyConfig) -> Vec<FuzzyMatch> {
        let query_grams = trigrams(query);

        // slot -> shared trigram count
        let mut shared: HashMap<usize, usize> = HashMap::new();
        for gram in &query_grams {
            if let Some(slots) = self.postings.get(gram) {
                for &slot in slots {
                    *shared.entry(slot).or_insert(0) += 1;
                }
            }
        }

        let score_of = |slot: usize, common: usize| {
            let entry = &self.entries[slot];
            let score = jaccard(common, query_grams.len(), entry.gram_count);
            (score >= config.threshold).then(|| FuzzyMatch {
                id: entry.id,
                text: entry.text.clone(),
                score,
            })
        };

        let mut matches: Vec<FuzzyMatch> = if config.threshold > 0.0 {
            shared
                .iter()
                .filter_map(|(&slot, &common)| score_of(slot, common))
                .collect()
        } else {
            (0..self.entries.len())
                .filter_map(|slot| score_of(slot, shared.get(&slot).copied().unwrap_or(0)))
                .collect()
        };
        rank(&mut matches, limit);
        matches
    }
}
