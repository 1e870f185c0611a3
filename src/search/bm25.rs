use crate::db::Db;
use crate::error::{KbServeError, Result};
use crate::search::SearchResult;

/// Sanitize and format an FTS5 query string for optimal matching.
///
/// Escapes special characters and formats multi-word queries with OR
/// logic for better recall. Removes FTS5 special characters that cause
/// syntax errors and filters out common stop words.
pub fn sanitize_fts5_query(query: &str) -> String {
    let trimmed = query.trim();

    // FTS5: ? * ( ) { } - and single quote (') cause syntax errors in MATCH
    let cleaned: String = trimmed
        .chars()
        .filter(|c| !matches!(c, '?' | '*' | '(' | ')' | '{' | '}' | '-' | '\''))
        .collect();

    let stop_words: std::collections::HashSet<&str> = [
        "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with",
        "by", "from", "as", "is", "are", "was", "were", "be", "been", "being", "have",
        "has", "had", "do", "does", "did", "will", "would", "should", "could", "what",
        "which", "who", "where", "when", "why", "how", "this", "that", "these", "those",
    ]
    .iter()
    .cloned()
    .collect();

    let terms: Vec<&str> = cleaned
        .split_whitespace()
        .filter(|term| {
            let lower = term.to_lowercase();
            !stop_words.contains(lower.as_str()) && term.len() >= 2
        })
        .collect();

    if terms.is_empty() {
        return cleaned.replace('"', "\"\"");
    }

    if terms.len() == 1 {
        return terms[0].replace('"', "\"\"");
    }

    let escaped_terms: Vec<String> = terms.iter().map(|t| t.replace('"', "\"\"")).collect();
    escaped_terms.join(" OR ")
}

/// Normalize a raw BM25 score (negative = better) into 0-1 where higher
/// is better, via sigmoid, so it can fuse with vector scores.
pub fn normalize_bm25_score(raw_score: f64) -> f32 {
    if raw_score.is_nan() || raw_score.is_infinite() {
        return 0.0;
    }

    let normalized = 1.0 / (1.0 + raw_score.exp());
    normalized as f32
}

/// Keyword search over a knowledge base's chunks via FTS5, ranked by
/// BM25 relevance.
pub async fn search_bm25(
    db: &Db,
    query: &str,
    kb_id: &str,
    file_ids: Option<&[String]>,
    k: usize,
    min_score: f32,
) -> Result<Vec<SearchResult>> {
    let start = std::time::Instant::now();

    // FTS5 rejects empty MATCH expressions
    if query.trim().is_empty() {
        return Ok(Vec::new());
    }

    let sanitized_query = sanitize_fts5_query(query);
    if sanitized_query.is_empty() {
        return Ok(Vec::new());
    }

    let kb = kb_id.to_string();
    let filter: Option<Vec<String>> = file_ids.map(|ids| ids.to_vec());

    let mut rows = db
        .with_connection(move |conn| {
            let mut sql = String::from(
                r#"
                SELECT
                    c.chunk_id,
                    c.doc_id,
                    d.file_name,
                    c.chunk_index,
                    c.chunk_text,
                    bm25(chunks_fts) AS raw_score
                FROM chunks_fts
                JOIN chunks c ON chunks_fts.chunk_id = c.chunk_id
                JOIN documents d ON c.doc_id = d.doc_id
                WHERE chunks_fts MATCH ?1 AND d.kb_id = ?2
                "#,
            );

            let mut bind: Vec<Box<dyn rusqlite::ToSql>> =
                vec![Box::new(sanitized_query.clone()), Box::new(kb.clone())];
            if let Some(ids) = &filter {
                let placeholders = (0..ids.len())
                    .map(|i| format!("?{}", i + 3))
                    .collect::<Vec<_>>()
                    .join(",");
                sql.push_str(&format!(" AND c.doc_id IN ({})", placeholders));
                for id in ids {
                    bind.push(Box::new(id.clone()));
                }
            }
            let limit_index = bind.len() + 1;
            sql.push_str(&format!(" ORDER BY raw_score LIMIT ?{}", limit_index));
            bind.push(Box::new(k as i64));

            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(rusqlite::params_from_iter(bind))?;

            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                let chunk_id: String = row.get(0)?;
                let doc_id: String = row.get(1)?;
                let file_name: String = row.get(2)?;
                let chunk_index: i64 = row.get(3)?;
                let chunk_text: String = row.get(4)?;
                let raw_score: f64 = row.get(5)?;

                let normalized_score = normalize_bm25_score(raw_score);
                if normalized_score < min_score {
                    continue;
                }

                results.push(SearchResult {
                    chunk_id,
                    doc_id,
                    file_name,
                    chunk_index: chunk_index as usize,
                    chunk_text,
                    score: normalized_score,
                    rank: 0,
                });
            }

            Ok::<Vec<SearchResult>, KbServeError>(results)
        })
        .await?;

    rows.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    for (idx, result) in rows.iter_mut().enumerate() {
        result.rank = idx + 1;
    }

    log::debug!(
        "BM25 search took {:?}, returned {} results",
        start.elapsed(),
        rows.len()
    );

    Ok(rows)
}
