use crate::cache::EmbeddingCache;
use crate::config::EmbeddingsConfig;
use crate::error::{KbServeError, Result};
use std::sync::Arc;

pub mod local;
pub mod openai;

pub use local::LocalEmbedder;
pub use openai::OpenAiEmbedder;

/// Embedding provider selected by `embeddings.provider` in config.toml.
///
/// Both backends produce vectors of the configured dimensionality;
/// document chunks and queries must be embedded by the same provider
/// for similarity scores to be meaningful.
pub enum Embedder {
    OpenAi(OpenAiEmbedder),
    Local(LocalEmbedder),
}

impl Embedder {
    /// Build the configured provider, wiring in an optional LRU cache
    /// for query embeddings.
    pub fn from_config(
        config: &EmbeddingsConfig,
        cache: Option<Arc<EmbeddingCache>>,
    ) -> Result<EmbedderHandle> {
        let embedder = match config.provider.as_str() {
            "openai" => {
                let api_key = std::env::var(&config.api_key_env).map_err(|_| {
                    KbServeError::Config(format!(
                        "Environment variable {} not set. Set it in your .env file or as an environment variable.",
                        config.api_key_env
                    ))
                })?;
                Embedder::OpenAi(OpenAiEmbedder::new(
                    api_key,
                    config.model.clone(),
                    config.batch_size,
                    config.dimensions,
                ))
            }
            "local" => Embedder::Local(LocalEmbedder::new(config.dimensions)),
            other => {
                return Err(KbServeError::Config(format!(
                    "Unknown embeddings provider: {}",
                    other
                )))
            }
        };

        Ok(EmbedderHandle { embedder, cache })
    }

    /// Embedding dimensionality produced by this provider.
    pub fn dimensions(&self) -> usize {
        match self {
            Embedder::OpenAi(e) => e.dimensions(),
            Embedder::Local(e) => e.dimensions(),
        }
    }

    /// Embed a batch of document chunks.
    pub async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        match self {
            Embedder::OpenAi(e) => e.embed_batch(texts).await,
            Embedder::Local(e) => e.embed_batch(&texts),
        }
    }

    /// Embed a single query text, with retry for the API-backed provider.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        match self {
            Embedder::OpenAi(e) => e.embed_with_retry(text, 3).await,
            Embedder::Local(e) => Ok(e.embed(text)),
        }
    }
}

/// Embedder plus its query-embedding cache.
pub struct EmbedderHandle {
    embedder: Embedder,
    cache: Option<Arc<EmbeddingCache>>,
}

impl EmbedderHandle {
    pub fn dimensions(&self) -> usize {
        self.embedder.dimensions()
    }

    /// Embed document chunks (never cached; chunk sets rarely repeat).
    pub async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        self.embedder.embed_batch(texts).await
    }

    /// Embed a query, consulting the cache first.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(cache) = &self.cache {
            if let Some(cached) = cache.get(text) {
                log::debug!("Embedding cache hit");
                return Ok(cached);
            }
        }

        let embedding = self.embedder.embed_query(text).await?;

        if let Some(cache) = &self.cache {
            cache.put(text.to_string(), embedding.clone());
        }

        Ok(embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingsConfig;

    fn local_config() -> EmbeddingsConfig {
        EmbeddingsConfig {
            provider: "local".to_string(),
            model: "hashed-ngram".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            batch_size: 100,
            dimensions: 128,
            cache_capacity: 10,
        }
    }

    #[tokio::test]
    async fn test_local_provider_from_config() {
        let handle = Embedder::from_config(&local_config(), None).unwrap();
        assert_eq!(handle.dimensions(), 128);

        let v = handle.embed_query("hello world").await.unwrap();
        assert_eq!(v.len(), 128);
    }

    #[tokio::test]
    async fn test_batch_matches_single() {
        let handle = Embedder::from_config(&local_config(), None).unwrap();
        let single = handle.embed_query("knowledge base").await.unwrap();
        let batch = handle
            .embed_batch(vec!["knowledge base".to_string()])
            .await
            .unwrap();
        assert_eq!(batch[0], single);
    }

    #[tokio::test]
    async fn test_query_cache_round_trip() {
        let cache = Arc::new(EmbeddingCache::new(10));
        let handle = Embedder::from_config(&local_config(), Some(cache.clone())).unwrap();

        assert!(cache.is_empty());
        let first = handle.embed_query("cached question").await.unwrap();
        assert_eq!(cache.len(), 1);
        let second = handle.embed_query("cached question").await.unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let mut config = local_config();
        config.provider = "qdrant".to_string();
        assert!(Embedder::from_config(&config, None).is_err());
    }
}
