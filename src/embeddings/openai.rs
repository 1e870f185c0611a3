use crate::error::{KbServeError, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Request structure for the OpenAI embeddings API
#[derive(Serialize)]
struct EmbeddingRequest {
    model: String,
    input: Vec<String>,
}

/// Response structure from the OpenAI embeddings API
#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// OpenAI embeddings client
///
/// Handles batch embedding generation with retry logic and rate limiting.
pub struct OpenAiEmbedder {
    client: Client,
    api_key: String,
    model: String,
    batch_size: usize,
    dimensions: usize,
}

impl OpenAiEmbedder {
    /// Create a new OpenAI embedder.
    ///
    /// `batch_size` is capped at the API limit of 2048 inputs per request.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client cannot be created (should not happen in
    /// normal operation).
    pub fn new(api_key: String, model: String, batch_size: usize, dimensions: usize) -> Self {
        let batch_size = batch_size.min(2048);

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            api_key,
            model,
            batch_size,
            dimensions,
        }
    }

    /// Expected embedding dimensionality (e.g. 1536 for text-embedding-3-small).
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Embed a batch of texts, automatically splitting into API-sized batches.
    ///
    /// Returns one embedding per input text, in the same order.
    pub async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut all_embeddings = Vec::new();

        for chunk in texts.chunks(self.batch_size) {
            let embeddings = self.embed_batch_internal(chunk.to_vec()).await?;
            all_embeddings.extend(embeddings);

            // Small delay between full batches to stay under rate limits
            if chunk.len() == self.batch_size {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }

        Ok(all_embeddings)
    }

    /// Embed a single text with retry on transient API failures.
    pub async fn embed_with_retry(&self, text: &str, max_retries: usize) -> Result<Vec<f32>> {
        let start = std::time::Instant::now();
        let mut attempt = 0;
        let mut delay = Duration::from_secs(1);

        loop {
            match self.embed_batch_internal(vec![text.to_string()]).await {
                Ok(mut embeddings) => {
                    if embeddings.is_empty() {
                        return Err(KbServeError::Embedding(
                            "Empty response from OpenAI API".to_string(),
                        ));
                    }
                    log::debug!(
                        "Embedding API call took {:?} (attempt {})",
                        start.elapsed(),
                        attempt + 1
                    );
                    return Ok(embeddings.remove(0));
                }
                Err(e) if attempt < max_retries => {
                    // Retry on 429 rate limit or 5xx server errors
                    let should_retry = e.to_string().contains("429")
                        || e.to_string().contains("500")
                        || e.to_string().contains("502")
                        || e.to_string().contains("503")
                        || e.to_string().contains("504");

                    if should_retry {
                        log::warn!("Retry {}/{} after error: {}", attempt + 1, max_retries, e);
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                        attempt += 1;
                    } else {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One API request for up to `batch_size` texts.
    async fn embed_batch_internal(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let request = EmbeddingRequest {
            model: self.model.clone(),
            input: texts,
        };

        let response = self
            .client
            .post("https://api.openai.com/v1/embeddings")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| KbServeError::Embedding(format!("Network error: {}", e)))?;

        let status = response.status();

        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());

            return Err(KbServeError::Embedding(format!(
                "OpenAI API error {}: {}",
                status, body
            )));
        }

        let result: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| KbServeError::Embedding(format!("Failed to parse response: {}", e)))?;

        Ok(result.data.into_iter().map(|d| d.embedding).collect())
    }
}
