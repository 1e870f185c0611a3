use super::chunker::Chunk;
use crate::db::Db;
use crate::error::{KbServeError, Result};
use chrono::Utc;
use rusqlite::params;
use sha2::{Digest, Sha256};

/// Insert or update a document in the database.
///
/// Returns the document id (SHA256 of kb id + file name, so re-ingesting
/// the same file replaces the previous document). Any previous chunks
/// are deleted first; FTS rows follow via triggers.
#[allow(clippy::too_many_arguments)]
pub async fn insert_document(
    db: &Db,
    kb_id: &str,
    file_name: &str,
    connector: &str,
    content_type: Option<&str>,
    content: &str,
    tokens: usize,
    file_hash: &str,
    last_modified: Option<&str>,
) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(kb_id.as_bytes());
    hasher.update(b"/");
    hasher.update(file_name.as_bytes());
    let doc_id = format!("{:x}", hasher.finalize());

    let doc_id_clone = doc_id.clone();
    let kb_id = kb_id.to_string();
    let file_name = file_name.to_string();
    let connector = connector.to_string();
    let content_type = content_type.map(String::from);
    let content = content.to_string();
    let file_hash = file_hash.to_string();
    let last_modified = last_modified.map(String::from);
    let ingested_at = Utc::now().to_rfc3339();

    db.with_connection(move |conn| {
        // Explicit even though ON DELETE CASCADE would also cover it
        conn.execute(
            "DELETE FROM chunks WHERE doc_id = ?1",
            params![doc_id_clone],
        )?;

        conn.execute(
            r#"
            INSERT INTO documents (
                doc_id, kb_id, file_name, connector, content_type,
                content_text, content_tokens, file_hash, last_modified, ingested_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(kb_id, file_name) DO UPDATE SET
                doc_id = excluded.doc_id,
                connector = excluded.connector,
                content_type = excluded.content_type,
                content_text = excluded.content_text,
                content_tokens = excluded.content_tokens,
                file_hash = excluded.file_hash,
                last_modified = excluded.last_modified,
                ingested_at = excluded.ingested_at
            "#,
            params![
                doc_id_clone,
                kb_id,
                file_name,
                connector,
                content_type,
                content,
                tokens as i64,
                file_hash,
                last_modified,
                ingested_at,
            ],
        )?;

        Ok(())
    })
    .await?;

    Ok(doc_id)
}

/// Serialize an embedding to the storage format (little-endian f32 BLOB).
pub fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Insert chunks with their embeddings in batches of 100.
///
/// FTS5 triggers populate chunks_fts on insert. Returns the number of
/// chunks written.
pub async fn insert_chunks(
    db: &Db,
    doc_id: &str,
    chunks: Vec<(Chunk, Vec<f32>)>,
) -> Result<usize> {
    if chunks.is_empty() {
        return Ok(0);
    }

    let doc_id = doc_id.to_string();
    let count = db
        .with_connection(move |conn| {
            let mut count = 0;
            const BATCH_SIZE: usize = 100;

            for batch in chunks.chunks(BATCH_SIZE) {
                let mut stmt = conn.prepare(
                    r#"
                    INSERT INTO chunks (
                        chunk_id, doc_id, chunk_index, chunk_text, chunk_tokens, embedding
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                    "#,
                )?;

                for (idx, (chunk, embedding)) in batch.iter().enumerate() {
                    let chunk_index = count + idx;
                    let chunk_id = format!("{}::{}", doc_id, chunk_index);

                    stmt.execute(params![
                        chunk_id,
                        doc_id,
                        chunk_index as i64,
                        chunk.text,
                        chunk.tokens as i64,
                        embedding_to_blob(embedding),
                    ])?;
                }

                count += batch.len();
            }

            Ok::<usize, KbServeError>(count)
        })
        .await?;

    Ok(count)
}
