use crate::db::Db;
use crate::error::{KbServeError, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Connector identifier recorded on documents ingested through the
/// local upload store.
pub const LOCAL_CONNECTOR: &str = "local";

/// A stored (or pending) upload slot minted by an upload link.
#[derive(Debug, Clone)]
pub struct Upload {
    pub token: String,
    pub kb_id: String,
    pub file_name: String,
    pub content_type: Option<String>,
    pub stored_path: Option<PathBuf>,
    pub byte_size: Option<u64>,
}

impl Upload {
    /// Whether a payload has actually been PUT to the slot.
    pub fn is_uploaded(&self) -> bool {
        self.stored_path.is_some()
    }
}

/// File names land on the local filesystem, so path traversal is
/// rejected up front.
fn validate_file_name(file_name: &str) -> Result<()> {
    if file_name.trim().is_empty() {
        return Err(KbServeError::InvalidInput(
            "fileName must not be empty".to_string(),
        ));
    }
    if file_name.contains('/') || file_name.contains('\\') || file_name.contains("..") {
        return Err(KbServeError::InvalidInput(format!(
            "fileName must be a plain file name: {}",
            file_name
        )));
    }
    Ok(())
}

/// Mint an upload link for (knowledge base, file name).
///
/// Returns the `{fileName: uploadUri}` map shape the wire contract uses.
/// The token is an unguessable 128-bit value; PUT-ing to the URI stores
/// the payload, and re-PUT overwrites it (the re-ingestion path).
pub async fn create_upload_link(
    db: &Db,
    kb_id: &str,
    file_name: &str,
) -> Result<HashMap<String, String>> {
    validate_file_name(file_name)?;

    // 404 for unknown knowledge bases before minting anything
    crate::registry::get_knowledge_base(db, kb_id).await?;

    let token = URL_SAFE_NO_PAD.encode(Uuid::new_v4().as_bytes());
    let kb = kb_id.to_string();
    let name = file_name.to_string();
    let token_clone = token.clone();
    let created_at = Utc::now().to_rfc3339();

    db.with_connection(move |conn| {
        conn.execute(
            "INSERT INTO uploads (upload_token, kb_id, file_name, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![token_clone, kb, name, created_at],
        )?;
        Ok(())
    })
    .await?;

    let mut links = HashMap::new();
    links.insert(
        file_name.to_string(),
        format!("/connectors/local/uploads/{}", token),
    );
    Ok(links)
}

/// Store a PUT payload against a previously minted upload token.
///
/// Writes the bytes under `upload_dir/<kb_id>/<file_name>` and records
/// the MIME type sent in the Content-Type header.
pub async fn store_upload(
    db: &Db,
    upload_dir: &Path,
    token: &str,
    content_type: Option<String>,
    body: Vec<u8>,
) -> Result<Upload> {
    let token_owned = token.to_string();
    let slot = db
        .with_connection(move |conn| {
            conn.query_row(
                "SELECT kb_id, file_name FROM uploads WHERE upload_token = ?1",
                params![token_owned],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?
            .ok_or(KbServeError::UploadNotFound(token_owned))
        })
        .await?;
    let (kb_id, file_name) = slot;

    let dir = upload_dir.join(&kb_id);
    tokio::fs::create_dir_all(&dir).await?;
    let path = dir.join(&file_name);
    let byte_size = body.len() as u64;
    tokio::fs::write(&path, body).await?;

    let upload = Upload {
        token: token.to_string(),
        kb_id,
        file_name,
        content_type,
        stored_path: Some(path),
        byte_size: Some(byte_size),
    };

    let token_owned = token.to_string();
    let ct = upload.content_type.clone();
    let stored = upload
        .stored_path
        .as_ref()
        .map(|p| p.to_string_lossy().to_string());
    let uploaded_at = Utc::now().to_rfc3339();
    db.with_connection(move |conn| {
        conn.execute(
            "UPDATE uploads
             SET content_type = ?2, stored_path = ?3, byte_size = ?4, uploaded_at = ?5
             WHERE upload_token = ?1",
            params![token_owned, ct, stored, byte_size as i64, uploaded_at],
        )?;
        Ok(())
    })
    .await?;

    log::info!(
        "Stored upload {} ({} bytes) for kb {}",
        upload.file_name,
        byte_size,
        upload.kb_id
    );

    Ok(upload)
}

/// Most recent completed upload for (knowledge base, file name), used by
/// the ingestion pipeline to locate a job file's payload.
pub async fn find_upload(db: &Db, kb_id: &str, file_name: &str) -> Result<Option<Upload>> {
    let kb = kb_id.to_string();
    let name = file_name.to_string();
    db.with_connection(move |conn| {
        let row = conn
            .query_row(
                "SELECT upload_token, kb_id, file_name, content_type, stored_path, byte_size
                 FROM uploads
                 WHERE kb_id = ?1 AND file_name = ?2 AND uploaded_at IS NOT NULL
                 ORDER BY uploaded_at DESC
                 LIMIT 1",
                params![kb, name],
                |row| {
                    Ok(Upload {
                        token: row.get(0)?,
                        kb_id: row.get(1)?,
                        file_name: row.get(2)?,
                        content_type: row.get(3)?,
                        stored_path: row.get::<_, Option<String>>(4)?.map(PathBuf::from),
                        byte_size: row.get::<_, Option<i64>>(5)?.map(|n| n as u64),
                    })
                },
            )
            .optional()?;
        Ok(row)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrate;
    use crate::registry::{create_knowledge_base, KbType, ParagraphConfig};
    use tempfile::TempDir;

    async fn setup() -> (Db, TempDir, String) {
        let temp_dir = TempDir::new().unwrap();
        let db = Db::new(temp_dir.path().join("test.db"));
        let migrations_dir =
            std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations");
        db.with_connection(move |conn| migrate::run_migrations(conn, &migrations_dir))
            .await
            .unwrap();
        let kb = create_knowledge_base(
            &db,
            "docs",
            KbType::Query,
            ParagraphConfig {
                chunk_size: 100,
                chunk_overlap: 10,
            },
        )
        .await
        .unwrap();
        (db, temp_dir, kb.id)
    }

    #[tokio::test]
    async fn test_link_then_put_then_find() {
        let (db, tmp, kb_id) = setup().await;

        let links = create_upload_link(&db, &kb_id, "guide.md").await.unwrap();
        let uri = links.get("guide.md").unwrap();
        let token = uri.rsplit('/').next().unwrap();

        let upload = store_upload(
            &db,
            &tmp.path().join("uploads"),
            token,
            Some("text/markdown".to_string()),
            b"# Hello".to_vec(),
        )
        .await
        .unwrap();

        assert!(upload.is_uploaded());
        assert_eq!(upload.byte_size, Some(7));

        let found = find_upload(&db, &kb_id, "guide.md").await.unwrap().unwrap();
        assert_eq!(found.content_type.as_deref(), Some("text/markdown"));
        let bytes = std::fs::read(found.stored_path.unwrap()).unwrap();
        assert_eq!(bytes, b"# Hello");
    }

    #[tokio::test]
    async fn test_unknown_token_is_not_found() {
        let (db, tmp, _kb_id) = setup().await;
        let result = store_upload(
            &db,
            &tmp.path().join("uploads"),
            "bogus-token",
            None,
            vec![1, 2, 3],
        )
        .await;
        assert!(matches!(result, Err(KbServeError::UploadNotFound(_))));
    }

    #[tokio::test]
    async fn test_link_for_unknown_kb_is_not_found() {
        let (db, _tmp, _kb_id) = setup().await;
        let result = create_upload_link(&db, "missing-kb", "a.txt").await;
        assert!(matches!(
            result,
            Err(KbServeError::KnowledgeBaseNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_traversal_file_names_rejected() {
        let (db, _tmp, kb_id) = setup().await;
        for bad in ["../evil.txt", "a/b.txt", ""] {
            let result = create_upload_link(&db, &kb_id, bad).await;
            assert!(matches!(result, Err(KbServeError::InvalidInput(_))), "{}", bad);
        }
    }

    #[tokio::test]
    async fn test_reupload_overwrites() {
        let (db, tmp, kb_id) = setup().await;
        let upload_dir = tmp.path().join("uploads");

        let links = create_upload_link(&db, &kb_id, "doc.txt").await.unwrap();
        let token = links["doc.txt"].rsplit('/').next().unwrap().to_string();

        store_upload(&db, &upload_dir, &token, None, b"first".to_vec())
            .await
            .unwrap();
        store_upload(&db, &upload_dir, &token, None, b"second".to_vec())
            .await
            .unwrap();

        let found = find_upload(&db, &kb_id, "doc.txt").await.unwrap().unwrap();
        let bytes = std::fs::read(found.stored_path.unwrap()).unwrap();
        assert_eq!(bytes, b"second");
    }
}
