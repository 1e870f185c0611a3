use crate::db::Db;
use crate::error::{KbServeError, Result};
use crate::search::vector;
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use uuid::Uuid;

/// A guardrail: a similarity detector over a denylist knowledge base
/// (conventionally of type `tech` holding banned example phrases).
///
/// The detection mechanism is the same cosine search used for answer
/// retrieval; only the corpus role differs.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardRail {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub source_knowledge_base: String,
    pub threshold: f32,
    pub level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub response_blocking: bool,
    pub created_at: String,
}

/// A guardrail that fired on a query.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggeredGuardRail {
    pub id: String,
    pub name: String,
    pub level: String,
    /// The banned phrase the query matched.
    pub source_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub score: f32,
    pub response_blocking: bool,
}

fn rail_from_row(row: &Row<'_>) -> rusqlite::Result<GuardRail> {
    Ok(GuardRail {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        source_knowledge_base: row.get(3)?,
        threshold: row.get::<_, f64>(4)? as f32,
        level: row.get(5)?,
        message: row.get(6)?,
        response_blocking: row.get::<_, i64>(7)? != 0,
        created_at: row.get(8)?,
    })
}

const RAIL_COLUMNS: &str = "guard_rail_id, name, description, source_kb_id, threshold, level, \
                            message, response_blocking, created_at";

/// Create a guardrail sourced from an existing knowledge base.
#[allow(clippy::too_many_arguments)]
pub async fn create_guard_rail(
    db: &Db,
    name: &str,
    description: Option<&str>,
    source_kb_id: &str,
    threshold: f32,
    level: &str,
    message: Option<&str>,
    response_blocking: bool,
) -> Result<GuardRail> {
    if name.trim().is_empty() {
        return Err(KbServeError::InvalidInput(
            "Guardrail name must not be empty".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&threshold) {
        return Err(KbServeError::InvalidInput(format!(
            "Guardrail threshold must be between 0.0 and 1.0, got {}",
            threshold
        )));
    }
    // The denylist corpus must exist before a detector can reference it
    crate::registry::get_knowledge_base(db, source_kb_id).await?;

    let rail = GuardRail {
        id: Uuid::new_v4().to_string(),
        name: name.trim().to_string(),
        description: description.map(String::from),
        source_knowledge_base: source_kb_id.to_string(),
        threshold,
        level: level.to_string(),
        message: message.map(String::from),
        response_blocking,
        created_at: Utc::now().to_rfc3339(),
    };

    let stored = rail.clone();
    db.with_connection(move |conn| {
        conn.execute(
            "INSERT INTO guard_rails (guard_rail_id, name, description, source_kb_id, threshold,
                                      level, message, response_blocking, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                stored.id,
                stored.name,
                stored.description,
                stored.source_knowledge_base,
                stored.threshold as f64,
                stored.level,
                stored.message,
                stored.response_blocking as i64,
                stored.created_at,
            ],
        )?;
        Ok(())
    })
    .await?;

    log::info!(
        "Created guardrail {} over kb {} (threshold {}, blocking: {})",
        rail.id,
        rail.source_knowledge_base,
        rail.threshold,
        rail.response_blocking
    );

    Ok(rail)
}

/// Fetch a guardrail by id.
pub async fn get_guard_rail(db: &Db, rail_id: &str) -> Result<GuardRail> {
    let id = rail_id.to_string();
    db.with_connection(move |conn| {
        conn.query_row(
            &format!("SELECT {} FROM guard_rails WHERE guard_rail_id = ?1", RAIL_COLUMNS),
            params![id],
            rail_from_row,
        )
        .optional()?
        .ok_or(KbServeError::GuardRailNotFound(id))
    })
    .await
}

/// List all guardrails.
pub async fn list_guard_rails(db: &Db) -> Result<Vec<GuardRail>> {
    db.with_connection(move |conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM guard_rails ORDER BY created_at DESC",
            RAIL_COLUMNS
        ))?;
        let rows = stmt
            .query_map([], rail_from_row)?
            .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
        Ok(rows)
    })
    .await
}

/// Guardrails attached to an agent.
pub async fn guard_rails_for_agent(db: &Db, agent_id: &str) -> Result<Vec<GuardRail>> {
    let id = agent_id.to_string();
    db.with_connection(move |conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM guard_rails g
             JOIN agent_guard_rails ag ON ag.guard_rail_id = g.guard_rail_id
             WHERE ag.agent_id = ?1
             ORDER BY g.created_at",
            RAIL_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![id], rail_from_row)?
            .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
        Ok(rows)
    })
    .await
}

/// Evaluate guardrails against an already-embedded query.
///
/// Runs the standard cosine search against each guardrail's denylist
/// corpus with that guardrail's own threshold; the best match above
/// threshold marks the guardrail triggered. Evaluated as a pre-check,
/// before any answer assembly.
pub async fn evaluate(
    db: &Db,
    query_vec: &[f32],
    rails: &[GuardRail],
) -> Result<Vec<TriggeredGuardRail>> {
    let mut triggered = Vec::new();

    for rail in rails {
        let hits = vector::search_vector(
            db,
            query_vec,
            &rail.source_knowledge_base,
            None,
            1,
            rail.threshold,
        )
        .await?;

        if let Some(best) = hits.into_iter().next() {
            log::info!(
                "Guardrail {} triggered (score {:.3} >= {:.3})",
                rail.name,
                best.score,
                rail.threshold
            );
            triggered.push(TriggeredGuardRail {
                id: rail.id.clone(),
                name: rail.name.clone(),
                level: rail.level.clone(),
                source_text: best.chunk_text,
                message: rail.message.clone(),
                score: best.score,
                response_blocking: rail.response_blocking,
            });
        }
    }

    Ok(triggered)
}

/// Block-wins policy: any triggered guardrail with response blocking
/// suppresses the answer.
pub fn any_blocking(triggered: &[TriggeredGuardRail]) -> bool {
    triggered.iter().any(|t| t.response_blocking)
}
