use super::{chunker, db_writer, extract};
use crate::connectors;
use crate::db::Db;
use crate::embeddings::EmbedderHandle;
use crate::error::{KbServeError, Result};
use crate::registry::{self, KnowledgeBase};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Ingestion job lifecycle. Two-phase protocol: a job is created empty,
/// populated with file descriptors (repeatable, to batch files), then
/// triggered, which is the explicit signal to start processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Created,
    Populated,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Populated => "populated",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "populated" => JobStatus::Populated,
            "running" => JobStatus::Running,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            "cancelled" => JobStatus::Cancelled,
            _ => JobStatus::Created,
        }
    }
}

/// Per-file outcome within a job. A failed file never aborts the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Completed,
    Failed,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::Completed => "completed",
            FileStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "completed" => FileStatus::Completed,
            "failed" => FileStatus::Failed,
            _ => FileStatus::Pending,
        }
    }
}

/// File descriptor submitted when populating a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFileSpec {
    pub file_name: String,
    #[serde(default)]
    pub last_modified: Option<String>,
    #[serde(default = "default_connector")]
    pub connector: String,
}

fn default_connector() -> String {
    connectors::LOCAL_CONNECTOR.to_string()
}

/// A job file with its processing status.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFile {
    pub file_name: String,
    pub last_modified: Option<String>,
    pub connector: String,
    pub status: FileStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionJob {
    pub id: String,
    pub knowledge_base: String,
    pub status: JobStatus,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub triggered_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    pub files: Vec<JobFile>,
}

/// Create an empty job for a knowledge base.
pub async fn create_job(db: &Db, kb_id: &str) -> Result<IngestionJob> {
    registry::get_knowledge_base(db, kb_id).await?;

    let job = IngestionJob {
        id: Uuid::new_v4().to_string(),
        knowledge_base: kb_id.to_string(),
        status: JobStatus::Created,
        created_at: Utc::now().to_rfc3339(),
        triggered_at: None,
        finished_at: None,
        files: Vec::new(),
    };

    let stored = job.clone();
    db.with_connection(move |conn| {
        conn.execute(
            "INSERT INTO ingestion_jobs (job_id, kb_id, status, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                stored.id,
                stored.knowledge_base,
                stored.status.as_str(),
                stored.created_at
            ],
        )?;
        Ok(())
    })
    .await?;

    Ok(job)
}

/// Replace the job's file list. Allowed until the job is triggered, so
/// clients can batch several uploads into one processing run.
pub async fn populate_job(
    db: &Db,
    kb_id: &str,
    job_id: &str,
    files: Vec<JobFileSpec>,
) -> Result<IngestionJob> {
    if files.is_empty() {
        return Err(KbServeError::InvalidInput(
            "Job file list must not be empty".to_string(),
        ));
    }
    for spec in &files {
        if spec.file_name.trim().is_empty() {
            return Err(KbServeError::InvalidInput(
                "fileName must not be empty".to_string(),
            ));
        }
    }

    let job = get_job(db, kb_id, job_id).await?;
    match job.status {
        JobStatus::Created | JobStatus::Populated => {}
        other => {
            return Err(KbServeError::JobState(format!(
                "Job {} cannot be populated in state {}",
                job_id,
                other.as_str()
            )))
        }
    }

    let job_id_owned = job_id.to_string();
    db.with_connection(move |conn| {
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM job_files WHERE job_id = ?1",
            params![job_id_owned],
        )?;
        for spec in &files {
            tx.execute(
                "INSERT INTO job_files (job_id, file_name, last_modified, connector, status)
                 VALUES (?1, ?2, ?3, ?4, 'pending')",
                params![
                    job_id_owned,
                    spec.file_name,
                    spec.last_modified,
                    spec.connector
                ],
            )?;
        }
        tx.execute(
            "UPDATE ingestion_jobs SET status = 'populated' WHERE job_id = ?1",
            params![job_id_owned],
        )?;
        tx.commit()?;
        Ok(())
    })
    .await?;

    get_job(db, kb_id, job_id).await
}

/// Load a job with its per-file statuses. A job id under the wrong
/// knowledge base is treated as unknown.
pub async fn get_job(db: &Db, kb_id: &str, job_id: &str) -> Result<IngestionJob> {
    let kb = kb_id.to_string();
    let id = job_id.to_string();
    db.with_connection(move |conn| {
        let job = conn
            .query_row(
                "SELECT job_id, kb_id, status, created_at, triggered_at, finished_at
                 FROM ingestion_jobs WHERE job_id = ?1 AND kb_id = ?2",
                params![id, kb],
                |row| {
                    let status: String = row.get(2)?;
                    Ok(IngestionJob {
                        id: row.get(0)?,
                        knowledge_base: row.get(1)?,
                        status: JobStatus::parse(&status),
                        created_at: row.get(3)?,
                        triggered_at: row.get(4)?,
                        finished_at: row.get(5)?,
                        files: Vec::new(),
                    })
                },
            )
            .optional()?;

        let mut job = job.ok_or(KbServeError::JobNotFound(id.clone()))?;

        let mut stmt = conn.prepare(
            "SELECT file_name, last_modified, connector, status, error
             FROM job_files WHERE job_id = ?1 ORDER BY file_name",
        )?;
        job.files = stmt
            .query_map(params![id], |row| {
                let status: String = row.get(3)?;
                Ok(JobFile {
                    file_name: row.get(0)?,
                    last_modified: row.get(1)?,
                    connector: row.get(2)?,
                    status: FileStatus::parse(&status),
                    error: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;

        Ok(job)
    })
    .await
}

async fn set_job_status(
    db: &Db,
    job_id: &str,
    status: JobStatus,
    triggered: bool,
    finished: bool,
) -> Result<()> {
    let id = job_id.to_string();
    let now = Utc::now().to_rfc3339();
    db.with_connection(move |conn| {
        conn.execute(
            "UPDATE ingestion_jobs SET status = ?2,
                 triggered_at = CASE WHEN ?3 THEN ?4 ELSE triggered_at END,
                 finished_at = CASE WHEN ?5 THEN ?4 ELSE finished_at END
             WHERE job_id = ?1",
            params![id, status.as_str(), triggered, now, finished],
        )?;
        Ok(())
    })
    .await
}

async fn set_file_status(
    db: &Db,
    job_id: &str,
    file_name: &str,
    status: FileStatus,
    error: Option<String>,
) -> Result<()> {
    let id = job_id.to_string();
    let name = file_name.to_string();
    db.with_connection(move |conn| {
        conn.execute(
            "UPDATE job_files SET status = ?3, error = ?4
             WHERE job_id = ?1 AND file_name = ?2",
            params![id, name, status.as_str(), error],
        )?;
        Ok(())
    })
    .await
}

/// Runs triggered jobs as background tasks, one per job id, and keeps
/// their handles so a job can be cancelled independently.
pub struct JobRunner {
    db: Arc<Db>,
    embedder: Arc<EmbedderHandle>,
    running: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl JobRunner {
    pub fn new(db: Arc<Db>, embedder: Arc<EmbedderHandle>) -> Self {
        Self {
            db,
            embedder,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Trigger a populated job: transition to running and spawn the
    /// processing task. Triggering twice, or before populating, is a
    /// state conflict.
    pub async fn trigger(&self, kb_id: &str, job_id: &str) -> Result<IngestionJob> {
        let job = get_job(&self.db, kb_id, job_id).await?;
        if job.status != JobStatus::Populated {
            return Err(KbServeError::JobState(format!(
                "Job {} cannot be triggered in state {}",
                job_id,
                job.status.as_str()
            )));
        }

        let kb = registry::get_knowledge_base(&self.db, kb_id).await?;
        set_job_status(&self.db, job_id, JobStatus::Running, true, false).await?;

        let db = Arc::clone(&self.db);
        let embedder = Arc::clone(&self.embedder);
        let running = Arc::clone(&self.running);
        let job_id_owned = job_id.to_string();
        let files = job.files.clone();

        let handle = tokio::spawn({
            let job_id = job_id_owned.clone();
            async move {
                process_job(&db, &embedder, &kb, &job_id, files).await;
                running.lock().unwrap().remove(&job_id);
            }
        });

        self.running
            .lock()
            .unwrap()
            .insert(job_id_owned, handle);

        get_job(&self.db, kb_id, job_id).await
    }

    /// Cancel a job. Aborts the background task if it is running;
    /// finished jobs cannot be cancelled.
    pub async fn cancel(&self, kb_id: &str, job_id: &str) -> Result<IngestionJob> {
        let job = get_job(&self.db, kb_id, job_id).await?;
        match job.status {
            JobStatus::Created | JobStatus::Populated | JobStatus::Running => {}
            other => {
                return Err(KbServeError::JobState(format!(
                    "Job {} cannot be cancelled in state {}",
                    job_id,
                    other.as_str()
                )))
            }
        }

        if let Some(handle) = self.running.lock().unwrap().remove(job_id) {
            handle.abort();
        }
        set_job_status(&self.db, job_id, JobStatus::Cancelled, false, true).await?;

        log::info!("Cancelled job {}", job_id);
        get_job(&self.db, kb_id, job_id).await
    }

    /// Wait for a job's background task to finish. Used by tests and
    /// graceful shutdown; requests never block on this.
    pub async fn wait(&self, job_id: &str) {
        let handle = self.running.lock().unwrap().remove(job_id);
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// Process every file of a triggered job. A file failure is recorded on
/// that file and processing continues; the job fails only if no file
/// succeeded.
async fn process_job(
    db: &Db,
    embedder: &EmbedderHandle,
    kb: &KnowledgeBase,
    job_id: &str,
    files: Vec<JobFile>,
) {
    let start = std::time::Instant::now();
    let mut completed = 0usize;
    let mut failed = 0usize;

    for file in &files {
        match process_file(db, embedder, kb, file).await {
            Ok(chunk_count) => {
                completed += 1;
                log::info!(
                    "Ingested {} into kb {} ({} chunks)",
                    file.file_name,
                    kb.id,
                    chunk_count
                );
                if let Err(e) =
                    set_file_status(db, job_id, &file.file_name, FileStatus::Completed, None).await
                {
                    log::error!("Failed to record file status: {}", e);
                }
            }
            Err(e) => {
                failed += 1;
                log::warn!("File {} failed in job {}: {}", file.file_name, job_id, e);
                if let Err(e) = set_file_status(
                    db,
                    job_id,
                    &file.file_name,
                    FileStatus::Failed,
                    Some(e.to_string()),
                )
                .await
                {
                    log::error!("Failed to record file status: {}", e);
                }
            }
        }
    }

    let final_status = if completed > 0 {
        JobStatus::Completed
    } else {
        JobStatus::Failed
    };
    if let Err(e) = set_job_status(db, job_id, final_status, false, true).await {
        log::error!("Failed to finalize job {}: {}", job_id, e);
    }

    log::info!(
        "Job {} finished in {:?}: {} completed, {} failed",
        job_id,
        start.elapsed(),
        completed,
        failed
    );
}

/// Ingest a single job file: locate its upload, extract text, chunk per
/// the knowledge base's paragraph config, embed, and index.
async fn process_file(
    db: &Db,
    embedder: &EmbedderHandle,
    kb: &KnowledgeBase,
    file: &JobFile,
) -> Result<usize> {
    let upload = connectors::find_upload(db, &kb.id, &file.file_name)
        .await?
        .ok_or_else(|| {
            KbServeError::UploadNotFound(format!(
                "No uploaded payload for {} in kb {}",
                file.file_name, kb.id
            ))
        })?;

    let path = upload.stored_path.as_ref().ok_or_else(|| {
        KbServeError::UploadNotFound(format!("Upload for {} has no payload", file.file_name))
    })?;
    let bytes = tokio::fs::read(path).await?;

    let text = extract::extract_text(&bytes, upload.content_type.as_deref(), &file.file_name)?;
    let chunks = chunker::chunk_text(&text, &kb.paragraphs)?;
    if chunks.is_empty() {
        return Err(KbServeError::Parse(format!(
            "{} produced no text to index",
            file.file_name
        )));
    }

    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let embeddings = embedder.embed_batch(texts).await?;

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let file_hash = format!("{:x}", hasher.finalize());

    let doc_id = db_writer::insert_document(
        db,
        &kb.id,
        &file.file_name,
        &file.connector,
        upload.content_type.as_deref(),
        &text,
        chunker::count_tokens(&text),
        &file_hash,
        file.last_modified.as_deref(),
    )
    .await?;

    db_writer::insert_chunks(db, &doc_id, chunks.into_iter().zip(embeddings).collect()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::EmbeddingCache;
    use crate::config::EmbeddingsConfig;
    use crate::db::migrate;
    use crate::embeddings::Embedder;
    use crate::registry::{create_knowledge_base, KbType, ParagraphConfig};
    use tempfile::TempDir;

    async fn setup() -> (Arc<Db>, TempDir, String, JobRunner) {
        let temp_dir = TempDir::new().unwrap();
        let db = Arc::new(Db::new(temp_dir.path().join("test.db")));
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
                chunk_size: 50,
                chunk_overlap: 10,
            },
        )
        .await
        .unwrap();

        let embedder = Arc::new(
            Embedder::from_config(
                &EmbeddingsConfig {
                    provider: "local".to_string(),
                    model: "hashed-ngram".to_string(),
                    api_key_env: "OPENAI_API_KEY".to_string(),
                    batch_size: 100,
                    dimensions: 128,
                    cache_capacity: 10,
                },
                Some(Arc::new(EmbeddingCache::new(10))),
            )
            .unwrap(),
        );

        let runner = JobRunner::new(Arc::clone(&db), embedder);

        (db, temp_dir, kb.id, runner)
    }

    async fn upload_file(db: &Db, tmp: &TempDir, kb_id: &str, name: &str, body: &[u8]) {
        let links = connectors::create_upload_link(db, kb_id, name).await.unwrap();
        let token = links[name].rsplit('/').next().unwrap().to_string();
        connectors::store_upload(
            db,
            &tmp.path().join("uploads"),
            &token,
            Some("text/plain".to_string()),
            body.to_vec(),
        )
        .await
        .unwrap();
    }

    fn spec(name: &str) -> JobFileSpec {
        JobFileSpec {
            file_name: name.to_string(),
            last_modified: Some("2026-01-01T00:00:00Z".to_string()),
            connector: "local".to_string(),
        }
    }

    #[tokio::test]
    async fn test_two_phase_job_happy_path() {
        let (db, tmp, kb_id, runner) = setup().await;
        upload_file(&db, &tmp, &kb_id, "a.txt", b"alpha beta gamma delta").await;

        let job = create_job(&db, &kb_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Created);

        let job = populate_job(&db, &kb_id, &job.id, vec![spec("a.txt")])
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Populated);
        assert_eq!(job.files.len(), 1);

        let job = runner.trigger(&kb_id, &job.id).await.unwrap();
        // The background task may already have finished on fast machines
        assert!(matches!(
            job.status,
            JobStatus::Running | JobStatus::Completed
        ));

        runner.wait(&job.id).await;
        let job = get_job(&db, &kb_id, &job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.files[0].status, FileStatus::Completed);

        // Chunks are searchable via the document
        db.with_connection(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?;
            assert!(count >= 1);
            Ok::<(), KbServeError>(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_trigger_requires_populated() {
        let (db, _tmp, kb_id, runner) = setup().await;
        let job = create_job(&db, &kb_id).await.unwrap();

        let result = runner.trigger(&kb_id, &job.id).await;
        assert!(matches!(result, Err(KbServeError::JobState(_))));
    }

    #[tokio::test]
    async fn test_double_trigger_conflicts() {
        let (db, tmp, kb_id, runner) = setup().await;
        upload_file(&db, &tmp, &kb_id, "a.txt", b"some words here").await;

        let job = create_job(&db, &kb_id).await.unwrap();
        populate_job(&db, &kb_id, &job.id, vec![spec("a.txt")])
            .await
            .unwrap();
        runner.trigger(&kb_id, &job.id).await.unwrap();
        runner.wait(&job.id).await;

        let result = runner.trigger(&kb_id, &job.id).await;
        assert!(matches!(result, Err(KbServeError::JobState(_))));
    }

    #[tokio::test]
    async fn test_populate_after_trigger_conflicts() {
        let (db, tmp, kb_id, runner) = setup().await;
        upload_file(&db, &tmp, &kb_id, "a.txt", b"some words here").await;

        let job = create_job(&db, &kb_id).await.unwrap();
        populate_job(&db, &kb_id, &job.id, vec![spec("a.txt")])
            .await
            .unwrap();
        runner.trigger(&kb_id, &job.id).await.unwrap();
        runner.wait(&job.id).await;

        let result = populate_job(&db, &kb_id, &job.id, vec![spec("a.txt")]).await;
        assert!(matches!(result, Err(KbServeError::JobState(_))));
    }

    #[tokio::test]
    async fn test_partial_failure_tolerated() {
        let (db, tmp, kb_id, runner) = setup().await;
        upload_file(&db, &tmp, &kb_id, "good.txt", b"ingestable text content").await;
        // "missing.txt" never gets an upload

        let job = create_job(&db, &kb_id).await.unwrap();
        populate_job(
            &db,
            &kb_id,
            &job.id,
            vec![spec("good.txt"), spec("missing.txt")],
        )
        .await
        .unwrap();
        runner.trigger(&kb_id, &job.id).await.unwrap();
        runner.wait(&job.id).await;

        let job = get_job(&db, &kb_id, &job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);

        let good = job.files.iter().find(|f| f.file_name == "good.txt").unwrap();
        let missing = job
            .files
            .iter()
            .find(|f| f.file_name == "missing.txt")
            .unwrap();
        assert_eq!(good.status, FileStatus::Completed);
        assert_eq!(missing.status, FileStatus::Failed);
        assert!(missing.error.as_deref().unwrap().contains("missing.txt"));
    }

    #[tokio::test]
    async fn test_all_files_failing_fails_job() {
        let (db, _tmp, kb_id, runner) = setup().await;

        let job = create_job(&db, &kb_id).await.unwrap();
        populate_job(&db, &kb_id, &job.id, vec![spec("missing.txt")])
            .await
            .unwrap();
        runner.trigger(&kb_id, &job.id).await.unwrap();
        runner.wait(&job.id).await;

        let job = get_job(&db, &kb_id, &job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancel_before_trigger() {
        let (db, _tmp, kb_id, runner) = setup().await;
        let job = create_job(&db, &kb_id).await.unwrap();

        let job = runner.cancel(&kb_id, &job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);

        // Cancelled job cannot be cancelled again
        let result = runner.cancel(&kb_id, &job.id).await;
        assert!(matches!(result, Err(KbServeError::JobState(_))));
    }

    #[tokio::test]
    async fn test_populate_rejects_empty_list() {
        let (db, _tmp, kb_id, _runner) = setup().await;
        let job = create_job(&db, &kb_id).await.unwrap();
        let result = populate_job(&db, &kb_id, &job.id, vec![]).await;
        assert!(matches!(result, Err(KbServeError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_job_scoped_to_knowledge_base() {
        let (db, _tmp, kb_id, _runner) = setup().await;
        let other = create_knowledge_base(
            &db,
            "other",
            KbType::Query,
            ParagraphConfig {
                chunk_size: 50,
                chunk_overlap: 10,
            },
        )
        .await
        .unwrap();

        let job = create_job(&db, &kb_id).await.unwrap();
        let result = get_job(&db, &other.id, &job.id).await;
        assert!(matches!(result, Err(KbServeError::JobNotFound(_))));
    }
}
