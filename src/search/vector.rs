use crate::db::Db;
use crate::error::{KbServeError, Result};
use crate::search::SearchResult;

/// Search a knowledge base's chunks by cosine similarity to a
/// pre-embedded query vector.
///
/// Scans stored embeddings for the knowledge base (optionally narrowed
/// to specific document ids), keeps hits at or above `min_score`, and
/// returns the top `k` sorted by similarity. The same call serves both
/// answer retrieval and guardrail denylist checks — only the corpus
/// role differs.
pub async fn search_vector(
    db: &Db,
    query_vec: &[f32],
    kb_id: &str,
    file_ids: Option<&[String]>,
    k: usize,
    min_score: f32,
) -> Result<Vec<SearchResult>> {
    let start = std::time::Instant::now();

    let query_vec = query_vec.to_vec();
    let kb = kb_id.to_string();
    let filter: Option<Vec<String>> = file_ids.map(|ids| ids.to_vec());

    let mut scored = db
        .with_connection(move |conn| {
            let mut sql = String::from(
                r#"
                SELECT
                    c.chunk_id,
                    c.doc_id,
                    d.file_name,
                    c.chunk_index,
                    c.chunk_text,
                    c.embedding
                FROM chunks c
                JOIN documents d ON c.doc_id = d.doc_id
                WHERE d.kb_id = ?1 AND c.embedding IS NOT NULL
                "#,
            );

            let mut bind: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(kb.clone())];
            if let Some(ids) = &filter {
                let placeholders = (0..ids.len())
                    .map(|i| format!("?{}", i + 2))
                    .collect::<Vec<_>>()
                    .join(",");
                sql.push_str(&format!(" AND c.doc_id IN ({})", placeholders));
                for id in ids {
                    bind.push(Box::new(id.clone()));
                }
            }

            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(rusqlite::params_from_iter(bind))?;

            let mut scored: Vec<(f32, SearchResult)> = Vec::new();
            while let Some(row) = rows.next()? {
                let chunk_id: String = row.get(0)?;
                let doc_id: String = row.get(1)?;
                let file_name: String = row.get(2)?;
                let chunk_index: i64 = row.get(3)?;
                let chunk_text: String = row.get(4)?;
                let blob: Vec<u8> = row.get(5)?;

                let embedding = match parse_embedding(&blob) {
                    Some(e) if e.len() == query_vec.len() => e,
                    _ => continue,
                };

                let similarity = cosine_similarity(&query_vec, &embedding);
                if similarity < min_score {
                    continue;
                }

                scored.push((
                    similarity,
                    SearchResult {
                        chunk_id,
                        doc_id,
                        file_name,
                        chunk_index: chunk_index as usize,
                        chunk_text,
                        score: similarity,
                        rank: 0,
                    },
                ));
            }
            Ok::<Vec<_>, KbServeError>(scored)
        })
        .await?;

    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    let results: Vec<SearchResult> = scored
        .into_iter()
        .take(k)
        .enumerate()
        .map(|(idx, (_, mut result))| {
            result.rank = idx + 1;
            result
        })
        .collect();

    log::debug!(
        "Vector search took {:?}, returned {} results",
        start.elapsed(),
        results.len()
    );

    Ok(results)
}

/// Parse embedding BLOB (little-endian f32 array) to Vec<f32>.
pub fn parse_embedding(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }

    blob.chunks(4)
        .map(|bytes| {
            let arr: [u8; 4] = bytes.try_into().ok()?;
            Some(f32::from_le_bytes(arr))
        })
        .collect()
}

/// Cosine similarity between two equal-length vectors; 0.0 when either
/// has zero magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(
        a.len(),
        b.len(),
        "Vectors must have same length for cosine similarity"
    );

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }

    dot / (mag_a * mag_b)
}
