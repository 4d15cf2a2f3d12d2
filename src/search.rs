//! Hybrid retrieval: vector + BM25 fusion.
//!
//! # Scoring
//!
//! 1. Fetch the top `K = max(2·k, 20)` candidates from each index.
//! 2. Min-max normalize each candidate set separately to `[0, 1]`.
//! 3. Fuse: `score = α·vector + (1-α)·lexical`; a chunk present in only
//!    one set takes zero for the missing side.
//! 4. Sort by fused score descending, ties by raw lexical score
//!    descending then chunk id ascending, truncate to `k`.
//! 5. Hydrate from `meta.db` with chunk text and document metadata.
//!
//! With hybrid disabled the vector top-k is returned as-is, cosine
//! clamped into `[0, 1]`. Either way the score handed to clients is a
//! similarity in the unit interval.

use std::collections::HashMap;

use crate::embedding::{l2_normalize, EmbeddingProvider};
use crate::error::{Error, Result};
use crate::lexical_index::LexicalIndex;
use crate::models::{KbConfig, SearchResult};
use crate::storage::KbStorage;
use crate::vector_index::VectorIndex;

/// Minimum candidate pool fetched from each index before fusion.
const MIN_CANDIDATES: usize = 20;

pub struct IndexPair {
    pub vector: VectorIndex,
    pub lexical: LexicalIndex,
}

/// Execute a query against one KB and return hydrated, ranked passages.
pub async fn run_query(
    storage: &KbStorage,
    indices: &IndexPair,
    embedder: &dyn EmbeddingProvider,
    cfg: &KbConfig,
    query: &str,
    limit: usize,
) -> Result<Vec<SearchResult>> {
    if query.trim().is_empty() {
        return Err(Error::InvalidInput("query must not be empty".into()));
    }
    let limit = limit.max(1);

    let query_vec = embedder
        .embed(&[query.to_string()])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| Error::EmbeddingFailed("empty embedding response".into()))?;

    let candidate_k = (2 * limit).max(MIN_CANDIDATES);
    let vector_hits = indices
        .vector
        .search(&query_vec, candidate_k, embedder.model_id(), None);

    if !cfg.hybrid_search {
        let ranked: Vec<(String, f64, f64)> = vector_hits
            .into_iter()
            .take(limit)
            .map(|(id, score)| (id, (score as f64).clamp(0.0, 1.0), 0.0))
            .collect();
        return hydrate(storage, ranked).await;
    }

    let lexical_hits = indices
        .lexical
        .search(query, candidate_k, cfg.bm25_k1, cfg.bm25_b);

    let fused = fuse(&vector_hits, &lexical_hits, cfg.hybrid_alpha, limit);
    hydrate(storage, fused).await
}

/// Fuse normalized candidate sets. Returns `(chunk_id, fused, raw_lexical)`
/// triples, ranked and truncated.
fn fuse(
    vector_hits: &[(String, f32)],
    lexical_hits: &[(String, f64)],
    alpha: f64,
    limit: usize,
) -> Vec<(String, f64, f64)> {
    let vector_norm = min_max(vector_hits.iter().map(|(id, s)| (id.as_str(), *s as f64)));
    let lexical_norm = min_max(lexical_hits.iter().map(|(id, s)| (id.as_str(), *s)));
    let lexical_raw: HashMap<&str, f64> = lexical_hits
        .iter()
        .map(|(id, s)| (id.as_str(), *s))
        .collect();

    let mut ids: Vec<&str> = vector_norm.keys().copied().collect();
    for id in lexical_norm.keys() {
        if !vector_norm.contains_key(id) {
            ids.push(id);
        }
    }

    let mut scored: Vec<(String, f64, f64)> = ids
        .into_iter()
        .map(|id| {
            let v = vector_norm.get(id).copied().unwrap_or(0.0);
            let l = lexical_norm.get(id).copied().unwrap_or(0.0);
            let fusedscore = alpha * v + (1.0 - alpha) * l;
            (
                id.to_string(),
                fusedscore.clamp(0.0, 1.0),
                lexical_raw.get(id).copied().unwrap_or(0.0),
            )
        })
        .collect();

    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal))
            .then_with(|| a.0.cmp(&b.0))
    });
    scored.truncate(limit);
    scored
}

/// Min-max normalize to `[0, 1]`; a uniform set maps to 1.0.
fn min_max<'a, I: Iterator<Item = (&'a str, f64)>>(scores: I) -> HashMap<&'a str, f64> {
    let pairs: Vec<(&str, f64)> = scores.collect();
    if pairs.is_empty() {
        return HashMap::new();
    }
    let min = pairs.iter().map(|(_, s)| *s).fold(f64::INFINITY, f64::min);
    let max = pairs
        .iter()
        .map(|(_, s)| *s)
        .fold(f64::NEG_INFINITY, f64::max);

    pairs
        .into_iter()
        .map(|(id, s)| {
            let norm = if (max - min).abs() < f64::EPSILON {
                1.0
            } else {
                (s - min) / (max - min)
            };
            (id, norm)
        })
        .collect()
}

async fn hydrate(
    storage: &KbStorage,
    ranked: Vec<(String, f64, f64)>,
) -> Result<Vec<SearchResult>> {
    let ids: Vec<String> = ranked.iter().map(|(id, _, _)| id.clone()).collect();
    let rows = storage.hydrate_chunks(&ids).await?;

    let mut results = Vec::with_capacity(ranked.len());
    for (chunk_id, score, _) in ranked {
        // A chunk retired by a concurrent reindex swap simply drops out.
        if let Some((chunk, doc)) = rows.get(&chunk_id) {
            results.push(SearchResult {
                content: chunk.text.clone(),
                filename: doc.filename.clone(),
                format: doc.format,
                score,
                seq: chunk.seq,
                document_id: doc.id.clone(),
                chunk_id,
            });
        }
    }
    Ok(results)
}

/// Rank passages similar to an existing document: the centroid of its
/// vectors is the query, and the document's own chunks are excluded.
pub async fn find_similar(
    storage: &KbStorage,
    indices: &IndexPair,
    embedder: &dyn EmbeddingProvider,
    doc_id: &str,
    limit: usize,
) -> Result<Vec<SearchResult>> {
    // Validates existence.
    storage.document(doc_id).await?;

    let vectors = indices.vector.vectors_for_document(doc_id);
    if vectors.is_empty() {
        return Ok(Vec::new());
    }

    let dims = vectors[0].len();
    let mut centroid = vec![0.0f32; dims];
    for v in &vectors {
        for (c, x) in centroid.iter_mut().zip(v.iter()) {
            *c += x;
        }
    }
    l2_normalize(&mut centroid);

    let hits = indices.vector.search(
        &centroid,
        limit.max(1),
        embedder.model_id(),
        Some(doc_id),
    );
    let ranked: Vec<(String, f64, f64)> = hits
        .into_iter()
        .map(|(id, s)| (id, (s as f64).clamp(0.0, 1.0), 0.0))
        .collect();
    hydrate(storage, ranked).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(pairs: &[(&str, f32)]) -> Vec<(String, f32)> {
        pairs.iter().map(|(id, s)| (id.to_string(), *s)).collect()
    }

    fn l(pairs: &[(&str, f64)]) -> Vec<(String, f64)> {
        pairs.iter().map(|(id, s)| (id.to_string(), *s)).collect()
    }

    #[test]
    fn fused_scores_stay_in_unit_interval() {
        let fused = fuse(
            &v(&[("a", 0.9), ("b", 0.1), ("c", -0.4)]),
            &l(&[("a", 12.0), ("d", 3.0)]),
            0.5,
            10,
        );
        for (_, score, _) in &fused {
            assert!(*score >= 0.0 && *score <= 1.0, "score {}", score);
        }
    }

    #[test]
    fn chunk_in_both_sets_beats_single_set() {
        let fused = fuse(
            &v(&[("both", 0.8), ("vec_only", 0.9), ("low", 0.1)]),
            &l(&[("both", 5.0), ("lex_only", 4.0), ("low", 0.5)]),
            0.5,
            10,
        );
        assert_eq!(fused[0].0, "both");
    }

    #[test]
    fn alpha_one_is_pure_vector_ranking() {
        let fused = fuse(
            &v(&[("a", 0.9), ("b", 0.5), ("c", 0.1)]),
            &l(&[("c", 100.0), ("b", 50.0)]),
            1.0,
            10,
        );
        assert_eq!(fused[0].0, "a");
    }

    #[test]
    fn alpha_zero_is_pure_lexical_ranking() {
        let fused = fuse(
            &v(&[("a", 0.99), ("b", 0.1)]),
            &l(&[("b", 9.0), ("a", 1.0)]),
            0.0,
            10,
        );
        assert_eq!(fused[0].0, "b");
    }

    #[test]
    fn monotonic_in_each_underlying_score() {
        // Same lexical score, higher vector score must not rank lower.
        let fused = fuse(
            &v(&[("hi", 0.9), ("lo", 0.2), ("pad", 0.0)]),
            &l(&[("hi", 3.0), ("lo", 3.0), ("pad", 1.0)]),
            0.5,
            10,
        );
        let pos = |id: &str| fused.iter().position(|(i, _, _)| i == id).unwrap();
        assert!(pos("hi") < pos("lo"));
    }

    #[test]
    fn ties_break_by_lexical_then_chunk_id() {
        // a and b fuse identically; b has the higher raw lexical score.
        let fused = fuse(
            &v(&[("a", 1.0), ("b", 1.0)]),
            &l(&[("a", 2.0), ("b", 2.0)]),
            0.5,
            10,
        );
        // Same normalized and raw everywhere: falls to chunk id.
        assert_eq!(fused[0].0, "a");

        let fused = fuse(&v(&[]), &l(&[("b", 5.0), ("a", 5.0)]), 0.0, 10);
        assert_eq!(fused[0].0, "a");
    }

    #[test]
    fn truncates_to_limit() {
        let fused = fuse(
            &v(&[("a", 0.9), ("b", 0.8), ("c", 0.7), ("d", 0.6)]),
            &l(&[]),
            1.0,
            2,
        );
        assert_eq!(fused.len(), 2);
    }

    #[test]
    fn min_max_uniform_set_maps_to_one() {
        let m = min_max([("a", 3.0), ("b", 3.0)].into_iter());
        assert_eq!(m["a"], 1.0);
        assert_eq!(m["b"], 1.0);
    }

    #[test]
    fn min_max_spreads_range() {
        let m = min_max([("a", 10.0), ("b", 5.0), ("c", 0.0)].into_iter());
        assert!((m["a"] - 1.0).abs() < 1e-9);
        assert!((m["b"] - 0.5).abs() < 1e-9);
        assert!(m["c"].abs() < 1e-9);
    }
}
