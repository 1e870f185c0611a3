use crate::db::Db;
use crate::error::{KbServeError, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Chunking configuration, fixed at knowledge-base creation and applied
/// to every future ingest into that knowledge base.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ParagraphConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl ParagraphConfig {
    /// Reject degenerate configurations: a zero chunk size, or an
    /// overlap that would make the chunk window never advance.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(KbServeError::InvalidInput(
                "chunkSize must be greater than 0".to_string(),
            ));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(KbServeError::InvalidInput(format!(
                "chunkOverlap ({}) must be less than chunkSize ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        Ok(())
    }
}

/// Role of a knowledge base: `query` corpora answer questions, `tech`
/// corpora hold specialized material such as guardrail denylists. Same
/// storage either way; the type selects the semantic role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KbType {
    Query,
    Tech,
}

impl KbType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KbType::Query => "query",
            KbType::Tech => "tech",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "query" => Ok(KbType::Query),
            "tech" => Ok(KbType::Tech),
            other => Err(KbServeError::InvalidInput(format!(
                "Unknown knowledge base type: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeBase {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kb_type: KbType,
    pub paragraphs: ParagraphConfig,
    pub date_created: String,
}

fn kb_from_row(row: &Row<'_>) -> rusqlite::Result<KnowledgeBase> {
    let type_str: String = row.get(2)?;
    Ok(KnowledgeBase {
        id: row.get(0)?,
        name: row.get(1)?,
        kb_type: KbType::parse(&type_str).unwrap_or(KbType::Query),
        paragraphs: ParagraphConfig {
            chunk_size: row.get::<_, i64>(3)? as usize,
            chunk_overlap: row.get::<_, i64>(4)? as usize,
        },
        date_created: row.get(5)?,
    })
}

const KB_COLUMNS: &str = "kb_id, name, kb_type, chunk_size, chunk_overlap, date_created";

/// Create a knowledge base. Rejects invalid chunk configuration, an
/// empty name, and duplicate names.
pub async fn create_knowledge_base(
    db: &Db,
    name: &str,
    kb_type: KbType,
    paragraphs: ParagraphConfig,
) -> Result<KnowledgeBase> {
    let name = name.trim().to_string();
    if name.is_empty() {
        return Err(KbServeError::InvalidInput(
            "Knowledge base name must not be empty".to_string(),
        ));
    }
    paragraphs.validate()?;

    let kb = KnowledgeBase {
        id: Uuid::new_v4().to_string(),
        name,
        kb_type,
        paragraphs,
        date_created: Utc::now().to_rfc3339(),
    };

    let stored = kb.clone();
    db.with_connection(move |conn| {
        let existing: Option<String> = conn
            .query_row(
                "SELECT kb_id FROM knowledge_bases WHERE name = ?1",
                params![stored.name],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Err(KbServeError::InvalidInput(format!(
                "Knowledge base name already in use: {}",
                stored.name
            )));
        }

        conn.execute(
            "INSERT INTO knowledge_bases (kb_id, name, kb_type, chunk_size, chunk_overlap, date_created)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                stored.id,
                stored.name,
                stored.kb_type.as_str(),
                stored.paragraphs.chunk_size as i64,
                stored.paragraphs.chunk_overlap as i64,
                stored.date_created,
            ],
        )?;
        Ok(())
    })
    .await?;

    log::info!(
        "Created knowledge base {} ({}, chunk {}/{})",
        kb.id,
        kb.kb_type.as_str(),
        kb.paragraphs.chunk_size,
        kb.paragraphs.chunk_overlap
    );

    Ok(kb)
}

/// Fetch a knowledge base by id.
pub async fn get_knowledge_base(db: &Db, kb_id: &str) -> Result<KnowledgeBase> {
    let id = kb_id.to_string();
    db.with_connection(move |conn| {
        conn.query_row(
            &format!("SELECT {} FROM knowledge_bases WHERE kb_id = ?1", KB_COLUMNS),
            params![id],
            kb_from_row,
        )
        .optional()?
        .ok_or(KbServeError::KnowledgeBaseNotFound(id))
    })
    .await
}

/// List all knowledge bases, newest first.
pub async fn list_knowledge_bases(db: &Db) -> Result<Vec<KnowledgeBase>> {
    db.with_connection(move |conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM knowledge_bases ORDER BY date_created DESC",
            KB_COLUMNS
        ))?;
        let rows = stmt
            .query_map([], kb_from_row)?
            .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
        Ok(rows)
    })
    .await
}
