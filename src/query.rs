use crate::agent;
use crate::config::SearchConfig;
use crate::db::Db;
use crate::embeddings::EmbedderHandle;
use crate::error::{KbServeError, Result};
use crate::guardrail::{self, GuardRail, TriggeredGuardRail};
use crate::registry;
use crate::search::{hybrid, vector, SearchResult};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// Options accepted by the ask endpoints.
#[derive(Debug, Clone, Default)]
pub struct AskOptions {
    pub with_reference: bool,
    pub hybrid: bool,
    pub similarity_threshold: Option<f32>,
    pub top_k: Option<usize>,
    pub file_ids: Option<Vec<String>>,
    pub conversation_id: Option<String>,
}

/// Source reference attached to an answer fragment.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reference {
    pub file_id: String,
    pub file_name: String,
    pub chunk_id: String,
    pub chunk_index: usize,
    pub score: f32,
}

/// One retrieved answer fragment.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerFragment {
    pub answer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<Reference>,
}

/// Response of an ask call. A guardrail block is not an error: the
/// response simply carries the triggered guardrails and no fragments.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub response: Vec<AnswerFragment>,
    pub query_id: String,
    pub conversation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub triggered_guard_rails: Option<Vec<TriggeredGuardRail>>,
}

/// Retrieval-augmented query engine over knowledge bases and agents.
pub struct QueryEngine {
    db: Arc<Db>,
    embedder: Arc<EmbedderHandle>,
    search: SearchConfig,
}

impl QueryEngine {
    pub fn new(db: Arc<Db>, embedder: Arc<EmbedderHandle>, search: SearchConfig) -> Self {
        Self {
            db,
            embedder,
            search,
        }
    }

    /// Ask a question against a single knowledge base.
    pub async fn ask_knowledge_base(
        &self,
        kb_id: &str,
        question: &str,
        opts: AskOptions,
    ) -> Result<QueryResponse> {
        registry::get_knowledge_base(&self.db, kb_id).await?;
        self.ask(
            vec![kb_id.to_string()],
            Vec::new(),
            Some(kb_id.to_string()),
            None,
            question,
            opts,
        )
        .await
    }

    /// Ask a question against an agent: its guardrails gate the query,
    /// and its knowledge-base search layers define the retrieval scope.
    pub async fn ask_agent(
        &self,
        agent_id: &str,
        question: &str,
        opts: AskOptions,
    ) -> Result<QueryResponse> {
        let agent = agent::get_agent(&self.db, agent_id).await?;
        let rails = guardrail::guard_rails_for_agent(&self.db, &agent.id).await?;
        let kb_ids = agent::knowledge_bases_for_agent(&self.db, &agent.id).await?;
        self.ask(kb_ids, rails, None, Some(agent.id), question, opts)
            .await
    }

    async fn ask(
        &self,
        kb_ids: Vec<String>,
        rails: Vec<GuardRail>,
        kb_scope: Option<String>,
        agent_id: Option<String>,
        question: &str,
        opts: AskOptions,
    ) -> Result<QueryResponse> {
        let question = question.trim();
        if question.is_empty() {
            return Err(KbServeError::InvalidInput(
                "Query text must not be empty".to_string(),
            ));
        }

        let query_id = Uuid::new_v4().to_string();
        let (conversation_id, prior_questions) =
            self.resolve_conversation(opts.conversation_id.as_deref()).await?;

        // Prior turns inform retrieval: embed the question in the
        // context of what the conversation already asked.
        let embedding_text = if prior_questions.is_empty() {
            question.to_string()
        } else {
            format!("{}\n{}", prior_questions.join("\n"), question)
        };
        let query_vec = self.embedder.embed_query(&embedding_text).await?;

        // Guardrail gate runs before any answer assembly; block wins.
        let triggered = guardrail::evaluate(&self.db, &query_vec, &rails).await?;
        if guardrail::any_blocking(&triggered) {
            log::info!(
                "Query {} blocked by {} guardrail(s)",
                query_id,
                triggered.len()
            );
            self.log_query(&query_id, &conversation_id, &kb_scope, &agent_id, question, 0, true)
                .await?;
            return Ok(QueryResponse {
                response: Vec::new(),
                query_id,
                conversation_id,
                triggered_guard_rails: Some(triggered),
            });
        }

        let threshold = opts
            .similarity_threshold
            .unwrap_or(self.search.similarity_threshold);
        let k = opts.top_k.unwrap_or(self.search.default_k);
        let file_ids = opts.file_ids.as_deref();

        let mut hits: Vec<SearchResult> = Vec::new();
        for kb_id in &kb_ids {
            let kb_hits = if opts.hybrid {
                hybrid::search_hybrid(
                    &self.db,
                    question,
                    &query_vec,
                    kb_id,
                    file_ids,
                    k,
                    threshold,
                    self.search.hybrid_bm25_weight,
                    self.search.hybrid_vector_weight,
                )
                .await?
            } else {
                vector::search_vector(&self.db, &query_vec, kb_id, file_ids, k, threshold).await?
            };
            hits.extend(kb_hits);
        }

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);

        let response: Vec<AnswerFragment> = hits
            .into_iter()
            .map(|hit| AnswerFragment {
                reference: opts.with_reference.then(|| Reference {
                    file_id: hit.doc_id.clone(),
                    file_name: hit.file_name.clone(),
                    chunk_id: hit.chunk_id.clone(),
                    chunk_index: hit.chunk_index,
                    score: hit.score,
                }),
                answer: hit.chunk_text,
            })
            .collect();

        self.log_query(
            &query_id,
            &conversation_id,
            &kb_scope,
            &agent_id,
            question,
            response.len(),
            false,
        )
        .await?;

        Ok(QueryResponse {
            response,
            query_id,
            conversation_id,
            triggered_guard_rails: if triggered.is_empty() {
                None
            } else {
                Some(triggered)
            },
        })
    }

    /// Reuse the supplied conversation (creating its row on first use)
    /// or mint a fresh one. Returns the id plus the conversation's
    /// recent questions, oldest first.
    async fn resolve_conversation(
        &self,
        conversation_id: Option<&str>,
    ) -> Result<(String, Vec<String>)> {
        let id = conversation_id
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let id_owned = id.clone();
        let now = Utc::now().to_rfc3339();
        let prior = self
            .db
            .with_connection(move |conn| {
                let exists: Option<String> = conn
                    .query_row(
                        "SELECT conversation_id FROM conversations WHERE conversation_id = ?1",
                        params![id_owned],
                        |row| row.get(0),
                    )
                    .optional()?;
                if exists.is_none() {
                    conn.execute(
                        "INSERT INTO conversations (conversation_id, created_at) VALUES (?1, ?2)",
                        params![id_owned, now],
                    )?;
                    return Ok(Vec::new());
                }

                // Last three turns are enough context for retrieval
                let mut stmt = conn.prepare(
                    "SELECT question FROM query_logs
                     WHERE conversation_id = ?1
                     ORDER BY created_at DESC
                     LIMIT 3",
                )?;
                let mut questions = stmt
                    .query_map(params![id_owned], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
                questions.reverse();
                Ok(questions)
            })
            .await?;

        Ok((id, prior))
    }

    #[allow(clippy::too_many_arguments)]
    async fn log_query(
        &self,
        query_id: &str,
        conversation_id: &str,
        kb_scope: &Option<String>,
        agent_id: &Option<String>,
        question: &str,
        answer_count: usize,
        blocked: bool,
    ) -> Result<()> {
        let query_id = query_id.to_string();
        let conversation_id = conversation_id.to_string();
        let kb = kb_scope.clone();
        let agent = agent_id.clone();
        let question = question.to_string();
        let created_at = Utc::now().to_rfc3339();
        self.db
            .with_connection(move |conn| {
                conn.execute(
                    "INSERT INTO query_logs (query_id, conversation_id, kb_id, agent_id,
                                             question, answer_count, blocked, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        query_id,
                        conversation_id,
                        kb,
                        agent,
                        question,
                        answer_count as i64,
                        blocked as i64,
                        created_at
                    ],
                )?;
                Ok(())
            })
            .await
    }
}
