use crate::embedding::Embedding;
use serde::Serialize;

/// Outcome of comparing a probe against every enrolled embedding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    /// Label of the closest entry, present only when it is within tolerance.
    pub label: Option<String>,
    /// Distance to the closest entry, `None` for an empty gallery.
    pub distance: Option<f64>,
}

impl MatchResult {
    pub fn matched(&self) -> bool {
        self.label.is_some()
    }
}

/// Strategy for resolving a probe embedding to an enrolled label.
pub trait Matcher {
    /// `entries` must be ordered by label; ties resolve to the earliest entry.
    fn best_match<'a, I>(&self, probe: &Embedding, entries: I, tolerance: f64) -> MatchResult
    where
        I: IntoIterator<Item = (&'a str, &'a Embedding)>;
}

/// Nearest-neighbour matcher over Euclidean distance.
///
/// Traverses every entry with no early exit. A match requires the minimum
/// distance to be strictly below the tolerance.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn best_match<'a, I>(&self, probe: &Embedding, entries: I, tolerance: f64) -> MatchResult
    where
        I: IntoIterator<Item = (&'a str, &'a Embedding)>,
    {
        let mut best: Option<(&str, f64)> = None;

        for (label, embedding) in entries {
            let distance = probe.distance(embedding);
            // Strict comparison keeps the first (lexicographically smallest) on ties.
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((label, distance));
            }
        }

        match best {
            Some((label, distance)) if distance < tolerance => MatchResult {
                label: Some(label.to_string()),
                distance: Some(distance),
            },
            Some((_, distance)) => MatchResult {
                label: None,
                distance: Some(distance),
            },
            None => MatchResult {
                label: None,
                distance: None,
            },
        }
    }
}
