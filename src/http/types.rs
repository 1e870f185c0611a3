use crate::agent::LayerKind;
use crate::registry::ParagraphConfig;
use serde::Deserialize;

/// Body of `POST /knowledge-base/`. Paragraph configuration falls back
/// to the service defaults when omitted.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateKnowledgeBaseRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub kb_type: String,
    #[serde(default)]
    pub paragraphs: Option<ParagraphConfig>,
}

/// Query params of `GET /connectors/local/s3-upload-links`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadLinkParams {
    pub kb: String,
    pub file_name: String,
}

/// Body of `POST /users/guard-rails`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGuardRailRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub source_fabric: SourceFabric,
    #[serde(default)]
    pub response_blocking: bool,
}

/// Detector source: names the detection mechanism and its configuration.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceFabric {
    #[allow(dead_code)]
    pub name: String,
    pub config: SourceFabricConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceFabricConfig {
    /// The denylist knowledge base holding banned example phrases.
    pub knowledge_base: String,
    #[serde(default = "default_guard_rail_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_guard_rail_level")]
    pub level: String,
    #[serde(default)]
    pub message: Option<String>,
}

fn default_guard_rail_threshold() -> f32 {
    0.8
}

fn default_guard_rail_level() -> String {
    "high".to_string()
}

/// Body of `POST /ask/templates`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTemplateRequest {
    pub name: String,
    pub content: String,
}

/// Body of `POST /users/agents/execution-layers`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateExecutionLayerRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub kind: LayerKind,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// Body of `POST /users/agents`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAgentRequest {
    pub name: String,
    #[serde(default)]
    pub template_id: Option<String>,
    #[serde(default)]
    pub execution_layers: Vec<String>,
    #[serde(default)]
    pub guard_rails: Vec<String>,
}

/// Query params of the ask endpoints. `fileIds` is comma-separated.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AskParams {
    pub q: String,
    #[serde(default)]
    pub kb: Option<String>,
    #[serde(default)]
    pub with_reference: Option<bool>,
    #[serde(default)]
    pub hybrid: Option<bool>,
    #[serde(default)]
    pub similarity_threshold: Option<f32>,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub file_ids: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

impl AskParams {
    pub fn to_options(&self) -> crate::query::AskOptions {
        crate::query::AskOptions {
            with_reference: self.with_reference.unwrap_or(false),
            hybrid: self.hybrid.unwrap_or(false),
            similarity_threshold: self.similarity_threshold,
            top_k: self.top_k,
            file_ids: self.file_ids.as_ref().map(|s| {
                s.split(',')
                    .map(|id| id.trim().to_string())
                    .filter(|id| !id.is_empty())
                    .collect()
            }),
            conversation_id: self.conversation_id.clone(),
        }
    }
}
