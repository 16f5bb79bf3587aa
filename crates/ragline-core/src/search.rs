//! Score normalisation and hybrid merging of retrieval candidates.
//!
//! # Hybrid Scoring Algorithm
//!
//! 1. Fetch keyword candidates and vector candidates for one query string.
//! 2. Normalize both sets to `[0, 1]` using min-max normalization.
//! 3. Merge: `score = (1 - w) × keyword + w × vector`, where `w` is the
//!    strategy's vector weight (`0` for keyword-only, `1` for vector-only).
//! 4. Across query strings, keep the best score per chunk id.
//! 5. Sort by score (desc), chunk id (asc); apply the optional threshold.
//! 6. Truncate to `top_k`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::RetrievedDocument;
use crate::store::ChunkCandidate;

/// How keyword and vector results are combined.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Weighted sum of normalised scores.
    Hybrid { vector_weight: f64 },
    VectorOnly,
    KeywordOnly,
}

impl Default for MergeStrategy {
    fn default() -> Self {
        MergeStrategy::Hybrid { vector_weight: 0.7 }
    }
}

impl MergeStrategy {
    pub fn uses_vector(&self) -> bool {
        !matches!(self, MergeStrategy::KeywordOnly)
    }

    pub fn uses_keyword(&self) -> bool {
        !matches!(self, MergeStrategy::VectorOnly)
    }

    /// Weight applied to the vector score.
    pub fn vector_weight(&self) -> f64 {
        match self {
            MergeStrategy::Hybrid { vector_weight } => *vector_weight,
            MergeStrategy::VectorOnly => 1.0,
            MergeStrategy::KeywordOnly => 0.0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let w = self.vector_weight();
        if !(0.0..=1.0).contains(&w) {
            return Err(Error::InvalidConfiguration(format!(
                "vector_weight must be within [0, 1], got {}",
                w
            )));
        }
        Ok(())
    }
}

/// Min-max normalize raw scores to `[0.0, 1.0]`.
///
/// If all scores are equal, they are normalized to `1.0`.
pub fn normalize_scores(candidates: &[ChunkCandidate]) -> Vec<(&ChunkCandidate, f64)> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let s_min = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::INFINITY, f64::min);
    let s_max = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::NEG_INFINITY, f64::max);

    candidates
        .iter()
        .map(|c| {
            let norm = if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (c.raw_score - s_min) / (s_max - s_min)
            };
            (c, norm)
        })
        .collect()
}

/// Merge one query string's keyword and vector candidates.
///
/// The result is unsorted; pass it through [`finalize`] after collecting
/// every query string's hits.
pub fn merge_candidates(
    keyword: &[ChunkCandidate],
    vector: &[ChunkCandidate],
    strategy: MergeStrategy,
) -> Vec<RetrievedDocument> {
    let weight = strategy.vector_weight();
    let keyword: &[ChunkCandidate] = if strategy.uses_keyword() { keyword } else { &[] };
    let vector: &[ChunkCandidate] = if strategy.uses_vector() { vector } else { &[] };

    let kw_map: HashMap<&str, f64> = normalize_scores(keyword)
        .into_iter()
        .map(|(c, s)| (c.chunk_id.as_str(), s))
        .collect();
    let vec_map: HashMap<&str, f64> = normalize_scores(vector)
        .into_iter()
        .map(|(c, s)| (c.chunk_id.as_str(), s))
        .collect();

    let mut all: HashMap<&str, &ChunkCandidate> = HashMap::new();
    for c in keyword.iter().chain(vector.iter()) {
        all.entry(c.chunk_id.as_str()).or_insert(c);
    }

    all.into_iter()
        .map(|(id, cand)| {
            let k = kw_map.get(id).copied().unwrap_or(0.0);
            let v = vec_map.get(id).copied().unwrap_or(0.0);
            RetrievedDocument {
                chunk_id: cand.chunk_id.clone(),
                source_doc_id: cand.source_doc_id.clone(),
                text: cand.text.clone(),
                score: (1.0 - weight) * k + weight * v,
                metadata: cand.metadata.clone(),
            }
        })
        .collect()
}

/// Dedup by chunk id (max score), sort, apply threshold and truncate.
pub fn finalize(
    docs: Vec<RetrievedDocument>,
    top_k: usize,
    score_threshold: Option<f64>,
) -> Vec<RetrievedDocument> {
    let mut best: HashMap<String, RetrievedDocument> = HashMap::new();
    for doc in docs {
        match best.get(&doc.chunk_id) {
            Some(existing) if existing.score >= doc.score => {}
            _ => {
                best.insert(doc.chunk_id.clone(), doc);
            }
        }
    }

    let mut results: Vec<RetrievedDocument> = best
        .into_values()
        .filter(|d| score_threshold.map_or(true, |t| d.score >= t))
        .collect();
    sort_by_score(&mut results);
    results.truncate(top_k);
    results
}

/// Sort by score (desc), chunk id (asc).
pub fn sort_by_score(docs: &mut [RetrievedDocument]) {
    docs.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_candidate(chunk_id: &str, score: f64) -> ChunkCandidate {
        ChunkCandidate {
            chunk_id: chunk_id.to_string(),
            source_doc_id: "d1".to_string(),
            raw_score: score,
            text: format!("text of {}", chunk_id),
            metadata: Default::default(),
        }
    }

    fn order(docs: &[RetrievedDocument]) -> Vec<&str> {
        docs.iter().map(|d| d.chunk_id.as_str()).collect()
    }

    #[test]
    fn test_normalize_empty() {
        assert!(normalize_scores(&[]).is_empty());
    }

    #[test]
    fn test_normalize_range() {
        let candidates = vec![
            make_candidate("c1", 10.0),
            make_candidate("c2", 5.0),
            make_candidate("c3", 0.0),
        ];
        let result = normalize_scores(&candidates);
        assert!((result[0].1 - 1.0).abs() < 1e-9);
        assert!((result[1].1 - 0.5).abs() < 1e-9);
        assert!((result[2].1 - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_all_equal() {
        let candidates = vec![make_candidate("c1", 3.0), make_candidate("c2", 3.0)];
        for (_, score) in normalize_scores(&candidates) {
            assert!((score - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_weight_zero_equals_keyword_order() {
        let kw = vec![
            make_candidate("c1", 10.0),
            make_candidate("c2", 5.0),
            make_candidate("c3", 1.0),
        ];
        let vec_cands = vec![make_candidate("c1", 0.1), make_candidate("c2", 0.9)];
        let merged = finalize(
            merge_candidates(&kw, &vec_cands, MergeStrategy::Hybrid { vector_weight: 0.0 }),
            10,
            None,
        );
        assert_eq!(order(&merged), vec!["c1", "c2", "c3"]);
    }

    #[test]
    fn test_vector_only_ignores_keyword_hits() {
        let kw = vec![make_candidate("k", 10.0)];
        let vec_cands = vec![make_candidate("c1", 0.1), make_candidate("c2", 0.9)];
        let merged = finalize(
            merge_candidates(&kw, &vec_cands, MergeStrategy::VectorOnly),
            10,
            None,
        );
        assert_eq!(order(&merged), vec!["c2", "c1"]);
    }

    #[test]
    fn test_hybrid_blends_scores() {
        let kw = vec![make_candidate("a", 1.0), make_candidate("b", 0.0)];
        let vec_cands = vec![make_candidate("a", 0.0), make_candidate("b", 1.0)];
        let merged = merge_candidates(&kw, &vec_cands, MergeStrategy::Hybrid { vector_weight: 0.7 });
        let b = merged.iter().find(|d| d.chunk_id == "b").unwrap();
        let a = merged.iter().find(|d| d.chunk_id == "a").unwrap();
        assert!((b.score - 0.7).abs() < 1e-9);
        assert!((a.score - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_finalize_dedups_with_max_and_ties_by_id() {
        let doc = |id: &str, score: f64| RetrievedDocument {
            chunk_id: id.to_string(),
            source_doc_id: "d".to_string(),
            text: String::new(),
            score,
            metadata: Default::default(),
        };
        let out = finalize(
            vec![doc("b", 0.4), doc("a", 0.5), doc("b", 0.5), doc("c", 0.1)],
            2,
            None,
        );
        assert_eq!(order(&out), vec!["a", "b"]);
        assert!((out[1].score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_threshold_filters() {
        let kw = vec![make_candidate("a", 2.0), make_candidate("b", 1.0), make_candidate("c", 0.0)];
        let out = finalize(
            merge_candidates(&kw, &[], MergeStrategy::KeywordOnly),
            10,
            Some(0.5),
        );
        assert_eq!(order(&out), vec!["a", "b"]);
    }

    #[test]
    fn test_validate_weight() {
        assert!(MergeStrategy::default().validate().is_ok());
        assert!(MergeStrategy::Hybrid { vector_weight: 1.5 }.validate().is_err());
    }
}
