use crate::db::Db;
use crate::error::Result;
use crate::search::{bm25, vector, SearchResult};
use std::collections::HashMap;

/// Hybrid retrieval: BM25 keyword search and cosine vector search run
/// in parallel, fused with Reciprocal Rank Fusion.
///
/// Over-fetches `k * 4` candidates from each method for fusion quality,
/// then min-max normalizes the fused scores to 0-1 so the caller's
/// similarity threshold applies uniformly.
#[allow(clippy::too_many_arguments)]
pub async fn search_hybrid(
    db: &Db,
    query: &str,
    query_vec: &[f32],
    kb_id: &str,
    file_ids: Option<&[String]>,
    k: usize,
    min_score: f32,
    bm25_weight: f32,
    vector_weight: f32,
) -> Result<Vec<SearchResult>> {
    let start = std::time::Instant::now();

    let fetch_k = k * 4;

    let (bm25_results, vector_results) = tokio::join!(
        bm25::search_bm25(db, query, kb_id, file_ids, fetch_k, 0.0),
        vector::search_vector(db, query_vec, kb_id, file_ids, fetch_k, 0.0)
    );
    let bm25_results = bm25_results?;
    let vector_results = vector_results?;

    let fused = reciprocal_rank_fusion(bm25_results, vector_results, k, bm25_weight, vector_weight);

    // RRF scores are rank-based (~0.01-0.1), not 0-1; normalize so the
    // caller's threshold is meaningful
    let max_score = fused.first().map(|r| r.score).unwrap_or(0.0);
    let min_fused = fused.last().map(|r| r.score).unwrap_or(0.0);
    let range = max_score - min_fused;

    let normalized: Vec<SearchResult> = if range > 0.0 {
        fused
            .into_iter()
            .map(|mut r| {
                r.score = (r.score - min_fused) / range;
                r
            })
            .collect()
    } else {
        fused
    };

    let filtered: Vec<SearchResult> = normalized
        .into_iter()
        .filter(|r| r.score >= min_score)
        .collect();

    log::debug!(
        "Hybrid search took {:?}, returned {} results",
        start.elapsed(),
        filtered.len()
    );

    Ok(filtered)
}

/// Combine ranked lists using Reciprocal Rank Fusion (RRF).
///
/// For each chunk: `score = Σ weight_i / (K + rank_i)` with K = 60, the
/// standard constant. Chunks appearing in both lists accumulate both
/// contributions, which is what makes fusion reward agreement.
pub fn reciprocal_rank_fusion(
    bm25_results: Vec<SearchResult>,
    vector_results: Vec<SearchResult>,
    k: usize,
    bm25_weight: f32,
    vector_weight: f32,
) -> Vec<SearchResult> {
    const K: f32 = 60.0;

    let mut scores: HashMap<String, (f32, SearchResult)> = HashMap::new();

    for (rank, result) in bm25_results.into_iter().enumerate() {
        let rrf_score = bm25_weight / (K + (rank + 1) as f32);
        scores.insert(result.chunk_id.clone(), (rrf_score, result));
    }

    for (rank, result) in vector_results.into_iter().enumerate() {
        let rrf_score = vector_weight / (K + (rank + 1) as f32);
        scores
            .entry(result.chunk_id.clone())
            .and_modify(|(score, _)| *score += rrf_score)
            .or_insert((rrf_score, result));
    }

    let mut ranked: Vec<_> = scores
        .into_values()
        .map(|(score, mut result)| {
            result.score = score;
            result
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    ranked
        .into_iter()
        .take(k)
        .enumerate()
        .map(|(idx, mut result)| {
            result.rank = idx + 1;
            result
        })
        .collect()
}
