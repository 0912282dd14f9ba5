//! This module provides functionality for loading and handling the application's configuration.
//!
//! It defines the [`RagConfig`] struct, which holds every tunable of the pipeline, and a
//! [`load_config`] function to load it from a YAML file. Every section has defaults, so
//! a config file only needs the values that differ. Secrets can also come from the
//! environment (`OPENAI_API_KEY`, `OPENAI_API_BASE`, `WEAVIATE_URL`, `WEAVIATE_API_KEY`).
//!
//! # Examples
//!
//! ```no_run
//! use sigma_rag::config::{RagConfig, load_config};
//!
//! let config: RagConfig = load_config("/path/to/config.yaml").unwrap();
//! println!("{:?}", config.vector_index.url);
//! ```

use serde::{Deserialize, Serialize};
use std::{error::Error, fs, time::Duration};
use thiserror::Error;
use tracing::*;

use crate::chunker::{ChunkError, Chunker};
use crate::retry::{Backoff, RetryPolicy};

/// Problems found by [`RagConfig::validate`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid chunking settings: {0}")]
    Chunking(#[from] ChunkError),
    #[error("invalid setting `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Top-level configuration.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(default)]
pub struct RagConfig {
    /// Chat-completion provider.
    pub llm: LlmConfig,

    /// Similarity-search backend.
    pub vector_index: VectorIndexConfig,

    pub chunking: ChunkingConfig,

    pub generation: GenerationConfig,

    /// Retry budget shared by every external call.
    pub retry: RetryConfig,

    /// SQLite database holding per-session conversation turns.
    pub session_db_url: String,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            vector_index: VectorIndexConfig::default(),
            chunking: ChunkingConfig::default(),
            generation: GenerationConfig::default(),
            retry: RetryConfig::default(),
            session_db_url: String::from("sigma_rag.db"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(default)]
pub struct LlmConfig {
    /// Bearer key for the OpenAI-compatible API.
    pub api_key: String,

    /// Base URL, e.g. `https://api.openai.com/v1` or a local server.
    pub api_base: String,

    /// Completion model; also selects the tokenizer used for the prompt budget.
    pub model: String,

    pub temperature: f32,

    pub timeout_secs: u64,

    /// Cap on generated tokens; provider default when unset.
    pub max_response_tokens: Option<u32>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base: String::from("https://api.openai.com/v1"),
            model: String::from("gpt-3.5-turbo-0125"),
            temperature: 0.2,
            timeout_secs: 60,
            max_response_tokens: None,
        }
    }
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Which [`VectorIndex`](crate::vector_store::VectorIndex) implementation to run.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum IndexBackend {
    #[default]
    Weaviate,
    Memory,
}

/// Embedder used by the in-process store.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmbedderKind {
    #[default]
    Hashing,
    Openai,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(default)]
pub struct VectorIndexConfig {
    pub backend: IndexBackend,

    /// Weaviate base URL.
    pub url: String,

    /// Weaviate API key, tried after an anonymous connection fails.
    pub api_key: Option<String>,

    /// Collection (Weaviate class) holding the chunks.
    pub class_name: String,

    /// Embedding model for the server-side vectorizer and the OpenAI embedder.
    pub embedding_model: String,

    pub connect_timeout_secs: u64,

    pub read_timeout_secs: u64,

    /// Minimum time between re-bootstrap attempts while degraded.
    pub reconnect_cooldown_secs: u64,

    /// Only used with `backend: memory`.
    pub memory_embedder: EmbedderKind,
}

impl Default for VectorIndexConfig {
    fn default() -> Self {
        Self {
            backend: IndexBackend::default(),
            url: String::from("http://localhost:8080"),
            api_key: None,
            class_name: String::from("LSSDocument"),
            embedding_model: String::from("text-embedding-ada-002"),
            connect_timeout_secs: 5,
            read_timeout_secs: 60,
            reconnect_cooldown_secs: 60,
            memory_embedder: EmbedderKind::default(),
        }
    }
}

impl VectorIndexConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn reconnect_cooldown(&self) -> Duration {
        Duration::from_secs(self.reconnect_cooldown_secs)
    }
}

/// Character window settings for the chunker.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(default)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
        }
    }
}

/// What to do when retrieval produced nothing to ground an answer on.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum NoContextMode {
    /// Reply with a canned apology, no model call.
    #[default]
    Apologize,
    /// Ask the model directly, without retrieved context.
    Direct,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(default)]
pub struct GenerationConfig {
    /// Hard ceiling on the assembled prompt, in model tokens.
    pub max_prompt_tokens: usize,

    /// Number of chunks to retrieve per query.
    pub top_k: usize,

    /// Prior messages (user and assistant counted separately) injected into
    /// each request.
    pub memory_turns: usize,

    pub no_context: NoContextMode,

    /// Template name under `<config_dir>/templates/`; built-in default when missing.
    pub template: Option<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_prompt_tokens: 4000,
            top_k: 3,
            memory_turns: 5,
            no_context: NoContextMode::default(),
            template: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub delay_ms: u64,
    pub backoff: Backoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 1000,
            backoff: Backoff::Fixed,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.delay_ms))
            .with_backoff(self.backoff)
    }
}

impl RagConfig {
    /// Overlay values from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok().filter(|v| !v.is_empty()));
    }

    /// Overlay values from `lookup`, keyed by environment variable name.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("OPENAI_API_KEY") {
            debug!("Using OPENAI_API_KEY from environment");
            self.llm.api_key = key;
        }
        if let Some(base) = lookup("OPENAI_API_BASE") {
            self.llm.api_base = base;
        }
        if let Some(url) = lookup("WEAVIATE_URL") {
            self.vector_index.url = url;
        }
        if let Some(key) = lookup("WEAVIATE_API_KEY") {
            self.vector_index.api_key = Some(key);
        }
    }

    /// Reject settings the pipeline can't run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Chunker::new(self.chunking.chunk_size, self.chunking.chunk_overlap)?;
        if self.generation.top_k == 0 {
            return Err(ConfigError::Invalid {
                field: "generation.top_k",
                reason: "must be at least 1".into(),
            });
        }
        if self.generation.max_prompt_tokens == 0 {
            return Err(ConfigError::Invalid {
                field: "generation.max_prompt_tokens",
                reason: "must be at least 1".into(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "retry.max_attempts",
                reason: "must be at least 1".into(),
            });
        }
        if self.vector_index.class_name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "vector_index.class_name",
                reason: "must not be empty".into(),
            });
        }
        Ok(())
    }
}

/// Loads the application's configuration from a YAML file.
///
/// Reads the file, parses it, overlays environment variables and validates the
/// result.
///
/// # Errors
/// - the file cannot be read,
/// - the YAML does not match [`RagConfig`],
/// - validation fails (for example `chunk_overlap >= chunk_size`).
pub fn load_config(file: &str) -> Result<RagConfig, Box<dyn Error>> {
    info!("Loading config: {}", file);
    let content = fs::read_to_string(file)?;
    let mut config: RagConfig = serde_yaml::from_str(&content)?;
    config.apply_env();
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_config_valid_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(
            temp_file,
            r#"
llm:
  api_key: "example_api_key"
  api_base: "http://example.com/v1"
  model: "gpt-4o-mini"
vector_index:
  url: "http://weaviate:8080"
  class_name: "LSSDocument"
chunking:
  chunk_size: 500
  chunk_overlap: 50
generation:
  no_context: direct
retry:
  max_attempts: 5
  backoff: exponential
session_db_url: "rag.db"
"#
        )
        .unwrap();

        let config = load_config(temp_file.path().to_str().unwrap());

        assert!(config.is_ok(), "{:?}", config.err().map(|e| e.to_string()));
        let config = config.unwrap();
        assert_eq!(config.llm.api_base, "http://example.com/v1");
        assert_eq!(config.llm.model, "gpt-4o-mini");
        assert_eq!(config.vector_index.url, "http://weaviate:8080");
        assert_eq!(config.chunking.chunk_size, 500);
        assert_eq!(config.generation.no_context, NoContextMode::Direct);
        assert_eq!(config.retry.backoff, Backoff::Exponential);
        assert_eq!(config.session_db_url, "rag.db");
        // untouched sections keep their defaults
        assert_eq!(config.generation.top_k, 3);
        assert_eq!(config.vector_index.connect_timeout_secs, 5);
    }

    #[test]
    fn test_load_config_invalid_file() {
        let config = load_config("non/existent/path");
        assert!(config.is_err());
    }

    #[test]
    fn test_load_config_invalid_format() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, r#"invalid: config: format"#).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap());
        assert!(config.is_err());
    }

    #[test]
    fn test_load_config_rejects_overlap_not_below_size() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "chunking:\n  chunk_size: 100\n  chunk_overlap: 100").unwrap();

        let config = load_config(temp_file.path().to_str().unwrap());
        assert!(config.is_err());
    }

    #[test]
    fn test_defaults() {
        let config = RagConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.chunking.chunk_size, 1000);
        assert_eq!(config.chunking.chunk_overlap, 200);
        assert_eq!(config.generation.max_prompt_tokens, 4000);
        assert_eq!(config.generation.memory_turns, 5);
        assert_eq!(config.vector_index.class_name, "LSSDocument");
        assert_eq!(config.retry.policy(), RetryPolicy::new(3, Duration::from_secs(1)));
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("OPENAI_API_KEY", "sk-env"),
            ("WEAVIATE_URL", "http://remote:8080"),
            ("WEAVIATE_API_KEY", "wv-key"),
        ]);
        let mut config = RagConfig::default();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.llm.api_key, "sk-env");
        assert_eq!(config.llm.api_base, "https://api.openai.com/v1");
        assert_eq!(config.vector_index.url, "http://remote:8080");
        assert_eq!(config.vector_index.api_key.as_deref(), Some("wv-key"));
    }

    #[test]
    fn test_validate_rejects_zero_top_k() {
        let mut config = RagConfig::default();
        config.generation.top_k = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "generation.top_k", .. })
        ));
    }
}
