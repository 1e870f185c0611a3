use crate::db::Db;
use crate::error::{KbServeError, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// System prompt text governing an agent's behavior.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub id: String,
    pub name: String,
    pub content: String,
    pub created_at: String,
}

/// Kind of tool an execution layer defines. Only knowledge-base search
/// is executed by this service; the other kinds are stored for the
/// external model's function-calling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    KnowledgeBaseSearch,
    WebSearch,
    ApiCall,
}

impl LayerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LayerKind::KnowledgeBaseSearch => "knowledge_base_search",
            LayerKind::WebSearch => "web_search",
            LayerKind::ApiCall => "api_call",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "knowledge_base_search" => Ok(LayerKind::KnowledgeBaseSearch),
            "web_search" => Ok(LayerKind::WebSearch),
            "api_call" => Ok(LayerKind::ApiCall),
            other => Err(KbServeError::InvalidInput(format!(
                "Unknown execution layer kind: {}",
                other
            ))),
        }
    }
}

/// A tool definition an agent's model may invoke.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionLayer {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub kind: LayerKind,
    pub config: serde_json::Value,
    pub created_at: String,
}

/// Agent = template + ordered execution layers + guardrails.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    pub execution_layers: Vec<String>,
    pub guard_rails: Vec<String>,
    pub created_at: String,
}

/// Create a template.
pub async fn create_template(db: &Db, name: &str, content: &str) -> Result<Template> {
    if name.trim().is_empty() || content.trim().is_empty() {
        return Err(KbServeError::InvalidInput(
            "Template name and content must not be empty".to_string(),
        ));
    }

    let template = Template {
        id: Uuid::new_v4().to_string(),
        name: name.trim().to_string(),
        content: content.to_string(),
        created_at: Utc::now().to_rfc3339(),
    };

    let stored = template.clone();
    db.with_connection(move |conn| {
        conn.execute(
            "INSERT INTO templates (template_id, name, content, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![stored.id, stored.name, stored.content, stored.created_at],
        )?;
        Ok(())
    })
    .await?;

    Ok(template)
}

/// Fetch a template by id.
pub async fn get_template(db: &Db, template_id: &str) -> Result<Template> {
    let id = template_id.to_string();
    db.with_connection(move |conn| {
        conn.query_row(
            "SELECT template_id, name, content, created_at FROM templates WHERE template_id = ?1",
            params![id],
            |row| {
                Ok(Template {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    content: row.get(2)?,
                    created_at: row.get(3)?,
                })
            },
        )
        .optional()?
        .ok_or(KbServeError::TemplateNotFound(id))
    })
    .await
}

/// Create an execution layer. A knowledge-base search layer must name
/// an existing knowledge base in its config.
pub async fn create_execution_layer(
    db: &Db,
    name: &str,
    description: Option<&str>,
    kind: LayerKind,
    config: serde_json::Value,
) -> Result<ExecutionLayer> {
    if name.trim().is_empty() {
        return Err(KbServeError::InvalidInput(
            "Execution layer name must not be empty".to_string(),
        ));
    }

    if kind == LayerKind::KnowledgeBaseSearch {
        let kb_id = config
            .get("knowledgeBase")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                KbServeError::InvalidInput(
                    "knowledge_base_search layer config requires a knowledgeBase id".to_string(),
                )
            })?;
        crate::registry::get_knowledge_base(db, kb_id).await?;
    }

    let layer = ExecutionLayer {
        id: Uuid::new_v4().to_string(),
        name: name.trim().to_string(),
        description: description.map(String::from),
        kind,
        config,
        created_at: Utc::now().to_rfc3339(),
    };

    let stored = layer.clone();
    db.with_connection(move |conn| {
        conn.execute(
            "INSERT INTO execution_layers (layer_id, name, description, kind, config_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                stored.id,
                stored.name,
                stored.description,
                stored.kind.as_str(),
                stored.config.to_string(),
                stored.created_at,
            ],
        )?;
        Ok(())
    })
    .await?;

    Ok(layer)
}

fn layer_from_parts(
    id: String,
    name: String,
    description: Option<String>,
    kind: String,
    config_json: String,
    created_at: String,
) -> ExecutionLayer {
    ExecutionLayer {
        id,
        name,
        description,
        kind: LayerKind::parse(&kind).unwrap_or(LayerKind::ApiCall),
        config: serde_json::from_str(&config_json).unwrap_or(serde_json::Value::Null),
        created_at,
    }
}

/// Fetch an execution layer by id.
pub async fn get_execution_layer(db: &Db, layer_id: &str) -> Result<ExecutionLayer> {
    let id = layer_id.to_string();
    db.with_connection(move |conn| {
        conn.query_row(
            "SELECT layer_id, name, description, kind, config_json, created_at
             FROM execution_layers WHERE layer_id = ?1",
            params![id],
            |row| {
                Ok(layer_from_parts(
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            },
        )
        .optional()?
        .ok_or(KbServeError::ExecutionLayerNotFound(id))
    })
    .await
}

/// Execution layers attached to an agent, in attachment order.
pub async fn layers_for_agent(db: &Db, agent_id: &str) -> Result<Vec<ExecutionLayer>> {
    let id = agent_id.to_string();
    db.with_connection(move |conn| {
        let mut stmt = conn.prepare(
            "SELECT l.layer_id, l.name, l.description, l.kind, l.config_json, l.created_at
             FROM execution_layers l
             JOIN agent_execution_layers al ON al.layer_id = l.layer_id
             WHERE al.agent_id = ?1
             ORDER BY al.position",
        )?;
        let rows = stmt
            .query_map(params![id], |row| {
                Ok(layer_from_parts(
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
        Ok(rows)
    })
    .await
}

/// Knowledge bases an agent searches: the targets of its
/// knowledge_base_search layers.
pub async fn knowledge_bases_for_agent(db: &Db, agent_id: &str) -> Result<Vec<String>> {
    let layers = layers_for_agent(db, agent_id).await?;
    let mut kb_ids = Vec::new();
    for layer in layers {
        if layer.kind == LayerKind::KnowledgeBaseSearch {
            if let Some(kb_id) = layer.config.get("knowledgeBase").and_then(|v| v.as_str()) {
                if !kb_ids.iter().any(|existing| existing == kb_id) {
                    kb_ids.push(kb_id.to_string());
                }
            }
        }
    }
    Ok(kb_ids)
}

/// Create an agent composing a template, execution layers and guardrails.
pub async fn create_agent(
    db: &Db,
    name: &str,
    template_id: Option<&str>,
    layer_ids: &[String],
    rail_ids: &[String],
) -> Result<Agent> {
    if name.trim().is_empty() {
        return Err(KbServeError::InvalidInput(
            "Agent name must not be empty".to_string(),
        ));
    }

    // Referenced components must exist
    if let Some(tid) = template_id {
        get_template(db, tid).await?;
    }
    for lid in layer_ids {
        get_execution_layer(db, lid).await?;
    }
    for rid in rail_ids {
        crate::guardrail::get_guard_rail(db, rid).await?;
    }

    let agent = Agent {
        id: Uuid::new_v4().to_string(),
        name: name.trim().to_string(),
        template_id: template_id.map(String::from),
        execution_layers: layer_ids.to_vec(),
        guard_rails: rail_ids.to_vec(),
        created_at: Utc::now().to_rfc3339(),
    };

    let stored = agent.clone();
    db.with_connection(move |conn| {
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO agents (agent_id, name, template_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![stored.id, stored.name, stored.template_id, stored.created_at],
        )?;
        for (position, lid) in stored.execution_layers.iter().enumerate() {
            tx.execute(
                "INSERT INTO agent_execution_layers (agent_id, layer_id, position)
                 VALUES (?1, ?2, ?3)",
                params![stored.id, lid, position as i64],
            )?;
        }
        for rid in &stored.guard_rails {
            tx.execute(
                "INSERT INTO agent_guard_rails (agent_id, guard_rail_id) VALUES (?1, ?2)",
                params![stored.id, rid],
            )?;
        }
        tx.commit()?;
        Ok(())
    })
    .await?;

    log::info!("Created agent {} ({})", agent.id, agent.name);
    Ok(agent)
}

/// Fetch an agent with its attached component ids.
pub async fn get_agent(db: &Db, agent_id: &str) -> Result<Agent> {
    let id = agent_id.to_string();
    db.with_connection(move |conn| {
        let agent = conn
            .query_row(
                "SELECT agent_id, name, template_id, created_at FROM agents WHERE agent_id = ?1",
                params![id],
                |row| {
                    Ok(Agent {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        template_id: row.get(2)?,
                        execution_layers: Vec::new(),
                        guard_rails: Vec::new(),
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()?;

        let mut agent = agent.ok_or(KbServeError::AgentNotFound(id.clone()))?;

        let mut stmt = conn.prepare(
            "SELECT layer_id FROM agent_execution_layers WHERE agent_id = ?1 ORDER BY position",
        )?;
        agent.execution_layers = stmt
            .query_map(params![id], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;

        let mut stmt = conn.prepare(
            "SELECT guard_rail_id FROM agent_guard_rails WHERE agent_id = ?1",
        )?;
        agent.guard_rails = stmt
            .query_map(params![id], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;

        Ok(agent)
    })
    .await
}

/// PATCH semantics: each present field replaces the agent's current set.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentPatch {
    pub template_id: Option<String>,
    pub execution_layers: Option<Vec<String>>,
    pub guard_rails: Option<Vec<String>>,
}

/// Update an agent's composition.
pub async fn update_agent(db: &Db, agent_id: &str, patch: AgentPatch) -> Result<Agent> {
    // Existence checks first so the update is all-or-nothing
    get_agent(db, agent_id).await?;
    if let Some(tid) = &patch.template_id {
        get_template(db, tid).await?;
    }
    if let Some(layer_ids) = &patch.execution_layers {
        for lid in layer_ids {
            get_execution_layer(db, lid).await?;
        }
    }
    if let Some(rail_ids) = &patch.guard_rails {
        for rid in rail_ids {
            crate::guardrail::get_guard_rail(db, rid).await?;
        }
    }

    let id = agent_id.to_string();
    db.with_connection(move |conn| {
        let tx = conn.transaction()?;
        if let Some(tid) = &patch.template_id {
            tx.execute(
                "UPDATE agents SET template_id = ?2 WHERE agent_id = ?1",
                params![id, tid],
            )?;
        }
        if let Some(layer_ids) = &patch.execution_layers {
            tx.execute(
                "DELETE FROM agent_execution_layers WHERE agent_id = ?1",
                params![id],
            )?;
            for (position, lid) in layer_ids.iter().enumerate() {
                tx.execute(
                    "INSERT INTO agent_execution_layers (agent_id, layer_id, position)
                     VALUES (?1, ?2, ?3)",
                    params![id, lid, position as i64],
                )?;
            }
        }
        if let Some(rail_ids) = &patch.guard_rails {
            tx.execute(
                "DELETE FROM agent_guard_rails WHERE agent_id = ?1",
                params![id],
            )?;
            for rid in rail_ids {
                tx.execute(
                    "INSERT INTO agent_guard_rails (agent_id, guard_rail_id) VALUES (?1, ?2)",
                    params![id, rid],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    })
    .await?;

    get_agent(db, agent_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrate;
    use crate::guardrail::create_guard_rail;
    use crate::registry::{create_knowledge_base, KbType, ParagraphConfig};
    use serde_json::json;
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
    async fn test_template_round_trip() {
        let (db, _tmp, _kb) = setup().await;
        let template = create_template(&db, "helpful", "You are a helpful assistant.")
            .await
            .unwrap();
        let fetched = get_template(&db, &template.id).await.unwrap();
        assert_eq!(fetched.content, "You are a helpful assistant.");

        assert!(create_template(&db, "", "x").await.is_err());
    }

    #[tokio::test]
    async fn test_kb_search_layer_requires_existing_kb() {
        let (db, _tmp, kb_id) = setup().await;

        let layer = create_execution_layer(
            &db,
            "kb-search",
            Some("Searches the docs corpus"),
            LayerKind::KnowledgeBaseSearch,
            json!({"knowledgeBase": kb_id}),
        )
        .await
        .unwrap();
        assert_eq!(layer.kind, LayerKind::KnowledgeBaseSearch);

        let missing_config = create_execution_layer(
            &db,
            "bad",
            None,
            LayerKind::KnowledgeBaseSearch,
            json!({}),
        )
        .await;
        assert!(matches!(missing_config, Err(KbServeError::InvalidInput(_))));

        let missing_kb = create_execution_layer(
            &db,
            "bad",
            None,
            LayerKind::KnowledgeBaseSearch,
            json!({"knowledgeBase": "missing"}),
        )
        .await;
        assert!(matches!(
            missing_kb,
            Err(KbServeError::KnowledgeBaseNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_agent_composition_and_patch() {
        let (db, _tmp, kb_id) = setup().await;

        let template = create_template(&db, "helpful", "Be helpful.").await.unwrap();
        let layer = create_execution_layer(
            &db,
            "kb-search",
            None,
            LayerKind::KnowledgeBaseSearch,
            json!({"knowledgeBase": kb_id}),
        )
        .await
        .unwrap();
        let rail = create_guard_rail(&db, "g", None, &kb_id, 0.9, "high", None, true)
            .await
            .unwrap();

        let agent = create_agent(
            &db,
            "support-bot",
            Some(&template.id),
            std::slice::from_ref(&layer.id),
            &[],
        )
        .await
        .unwrap();
        assert_eq!(agent.execution_layers, vec![layer.id.clone()]);
        assert!(agent.guard_rails.is_empty());

        // Attach the guardrail via PATCH
        let patched = update_agent(
            &db,
            &agent.id,
            AgentPatch {
                guard_rails: Some(vec![rail.id.clone()]),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(patched.guard_rails, vec![rail.id]);
        // Layers untouched by a guardrail-only patch
        assert_eq!(patched.execution_layers, vec![layer.id]);
    }

    #[tokio::test]
    async fn test_agent_rejects_unknown_components() {
        let (db, _tmp, _kb) = setup().await;

        assert!(matches!(
            create_agent(&db, "a", Some("missing-template"), &[], &[]).await,
            Err(KbServeError::TemplateNotFound(_))
        ));
        assert!(matches!(
            create_agent(&db, "a", None, &["missing-layer".to_string()], &[]).await,
            Err(KbServeError::ExecutionLayerNotFound(_))
        ));
        assert!(matches!(
            create_agent(&db, "a", None, &[], &["missing-rail".to_string()]).await,
            Err(KbServeError::GuardRailNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_knowledge_bases_for_agent_dedupes() {
        let (db, _tmp, kb_id) = setup().await;

        let layer1 = create_execution_layer(
            &db,
            "kb-search-1",
            None,
            LayerKind::KnowledgeBaseSearch,
            json!({"knowledgeBase": kb_id}),
        )
        .await
        .unwrap();
        let layer2 = create_execution_layer(
            &db,
            "kb-search-2",
            None,
            LayerKind::KnowledgeBaseSearch,
            json!({"knowledgeBase": kb_id}),
        )
        .await
        .unwrap();
        let web = create_execution_layer(
            &db,
            "web",
            None,
            LayerKind::WebSearch,
            json!({"allowedDomains": ["docs.example.com"]}),
        )
        .await
        .unwrap();

        let agent = create_agent(
            &db,
            "bot",
            None,
            &[layer1.id, layer2.id, web.id],
            &[],
        )
        .await
        .unwrap();

        let kbs = knowledge_bases_for_agent(&db, &agent.id).await.unwrap();
        assert_eq!(kbs, vec![kb_id]);
    }

    #[test]
    fn test_layer_kind_parse() {
        assert_eq!(
            LayerKind::parse("knowledge_base_search").unwrap(),
            LayerKind::KnowledgeBaseSearch
        );
        assert!(LayerKind::parse("shell").is_err());
    }
}
