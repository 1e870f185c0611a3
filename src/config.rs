use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub kbserve: KbServeConfig,
    pub embeddings: EmbeddingsConfig,
    pub search: SearchConfig,
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub http_server: HttpServerConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct KbServeConfig {
    pub db_path: PathBuf,
    /// Directory where uploaded document payloads are stored before
    /// an ingestion job picks them up.
    pub upload_dir: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Embeddings configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingsConfig {
    /// "openai" for the hosted API, "local" for the deterministic
    /// hashed-ngram provider (offline operation and tests).
    pub provider: String,
    pub model: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    pub batch_size: usize,
    pub dimensions: usize,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

fn default_cache_capacity() -> usize {
    1000
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

/// Search configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
    pub default_k: usize,
    /// Default minimum cosine similarity for retrieval; callers can
    /// override per query.
    pub similarity_threshold: f32,
    pub hybrid_bm25_weight: f32,
    pub hybrid_vector_weight: f32,
}

/// Defaults applied when a knowledge base is created without an
/// explicit paragraph configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkingConfig {
    pub default_chunk_size: usize,
    pub default_chunk_overlap: usize,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HttpServerConfig {
    #[serde(default = "default_http_port")]
    pub port: u16,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            port: default_http_port(),
            allowed_origins: Vec::new(),
        }
    }
}

fn default_http_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from file
    ///
    /// Loads environment variables from .env file (if present) before loading config.
    /// Looks for config file in this order:
    /// 1. Path specified in KBSERVE_CONFIG environment variable
    /// 2. ./config.toml in current directory
    pub fn load() -> Result<Self> {
        // Load .env file if it exists (ignore errors - file is optional)
        let _ = dotenv::dotenv();

        let config_path = std::env::var("KBSERVE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: Config = toml::from_str(&config_str)
            .context("Failed to parse config.toml")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        match self.embeddings.provider.as_str() {
            "openai" => {
                // Check both environment variable and .env file (dotenv already loaded)
                std::env::var(&self.embeddings.api_key_env).with_context(|| {
                    format!(
                        "Environment variable {} not set. Set it in your .env file or as an environment variable, or switch embeddings.provider to \"local\".",
                        self.embeddings.api_key_env
                    )
                })?;
            }
            "local" => {}
            other => anyhow::bail!(
                "embeddings.provider must be \"openai\" or \"local\", got \"{}\"",
                other
            ),
        }

        if self.embeddings.dimensions == 0 {
            anyhow::bail!("embeddings.dimensions must be greater than 0");
        }

        if self.search.default_k == 0 {
            anyhow::bail!("search.default_k must be greater than 0");
        }

        if !(0.0..=1.0).contains(&self.search.similarity_threshold) {
            anyhow::bail!("search.similarity_threshold must be between 0.0 and 1.0");
        }

        if self.chunking.default_chunk_size == 0 {
            anyhow::bail!("chunking.default_chunk_size must be greater than 0");
        }

        if self.chunking.default_chunk_overlap >= self.chunking.default_chunk_size {
            anyhow::bail!(
                "chunking.default_chunk_overlap must be less than default_chunk_size"
            );
        }

        Ok(())
    }

    /// Get database path
    pub fn db_path(&self) -> &Path {
        &self.kbserve.db_path
    }

    /// Get the upload storage directory
    pub fn upload_dir(&self) -> &Path {
        &self.kbserve.upload_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Serialize config tests that mutate process-wide cwd and env so they don't race.
    static CONFIG_TEST_LOCK: Mutex<()> = Mutex::new(());

    fn create_test_config(provider: &str) -> String {
        format!(
            r#"
[kbserve]
db_path = "./test.db"
upload_dir = "./uploads"
log_level = "debug"

[embeddings]
provider = "{}"
model = "text-embedding-3-small"
api_key_env = "OPENAI_API_KEY"
batch_size = 100
dimensions = 256

[search]
default_k = 5
similarity_threshold = 0.8
hybrid_bm25_weight = 0.5
hybrid_vector_weight = 0.5

[chunking]
default_chunk_size = 400
default_chunk_overlap = 200
"#,
            provider
        )
    }

    fn with_config_env(config_path: &std::path::Path, api_key: Option<&str>, f: impl FnOnce()) {
        let original_config = std::env::var("KBSERVE_CONFIG").ok();
        let original_key = std::env::var("OPENAI_API_KEY").ok();
        std::env::set_var("KBSERVE_CONFIG", config_path.to_str().unwrap());
        match api_key {
            Some(k) => std::env::set_var("OPENAI_API_KEY", k),
            None => std::env::remove_var("OPENAI_API_KEY"),
        }
        f();
        std::env::remove_var("KBSERVE_CONFIG");
        std::env::remove_var("OPENAI_API_KEY");
        if let Some(val) = original_config {
            std::env::set_var("KBSERVE_CONFIG", val);
        }
        if let Some(val) = original_key {
            std::env::set_var("OPENAI_API_KEY", val);
        }
    }

    #[test]
    fn test_config_load_local_provider() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, create_test_config("local")).unwrap();
        with_config_env(&config_path, None, || {
            let config = Config::load();
            assert!(config.is_ok(), "Config::load() failed: {:?}", config.err());
            let config = config.unwrap();
            assert_eq!(config.kbserve.log_level, "debug");
            assert_eq!(config.search.default_k, 5);
            assert_eq!(config.chunking.default_chunk_size, 400);
            assert_eq!(config.http_server.port, 8080);
        });
    }

    #[test]
    fn test_config_openai_requires_api_key() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, create_test_config("openai")).unwrap();
        with_config_env(&config_path, None, || {
            let config = Config::load();
            assert!(config.is_err(), "Expected missing API key error");
            assert!(config.unwrap_err().to_string().contains("OPENAI_API_KEY"));
        });
    }

    #[test]
    fn test_config_openai_with_key() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, create_test_config("openai")).unwrap();
        with_config_env(&config_path, Some("test-key"), || {
            assert!(Config::load().is_ok());
        });
    }

    #[test]
    fn test_config_rejects_unknown_provider() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, create_test_config("qdrant")).unwrap();
        with_config_env(&config_path, None, || {
            let config = Config::load();
            assert!(config.is_err());
            assert!(config.unwrap_err().to_string().contains("provider"));
        });
    }

    #[test]
    fn test_config_rejects_degenerate_chunking() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        let bad = create_test_config("local")
            .replace("default_chunk_overlap = 200", "default_chunk_overlap = 400");
        fs::write(&config_path, bad).unwrap();
        with_config_env(&config_path, None, || {
            let config = Config::load();
            assert!(config.is_err());
            assert!(config
                .unwrap_err()
                .to_string()
                .contains("default_chunk_overlap"));
        });
    }

    #[test]
    fn test_config_invalid_path() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        let original = std::env::var("KBSERVE_CONFIG").ok();
        std::env::set_var("KBSERVE_CONFIG", "nonexistent.toml");
        let config = Config::load();
        assert!(config.is_err());
        std::env::remove_var("KBSERVE_CONFIG");
        if let Some(v) = original {
            std::env::set_var("KBSERVE_CONFIG", v);
        }
    }
}
