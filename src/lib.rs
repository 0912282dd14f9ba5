//! # sigma_rag (library root)
//!
//! Retrieval-augmented question answering over a Lean Six Sigma knowledge base:
//! - Document preparation: front matter (`metadata`), character windows (`chunker`).
//! - Retrieval: vector store contract and in-process store (`vector_store`), the
//!   Weaviate backend (`weaviate`), embedding providers (`embedding`).
//! - Generation: token counting (`tokens`), prompt assembly (`prompt`), the
//!   language-model client (`api`), prompt templates (`template`).
//! - Orchestration: the [`rag::RagService`] pipeline with retry (`retry`) and
//!   conversation memory (`conversation`).
//! - Application plumbing: configuration (`config`), CLI (`commands`), directory
//!   ingestion (`ingest`), SQLite session history (`models`, `schema`,
//!   `session_messages`).
//!
//! The helpers below wire a [`rag::RagService`] from a [`config::RagConfig`].
//!
//! ## Modules
//! - [`api`], [`chunker`], [`commands`], [`config`], [`conversation`], [`embedding`],
//!   [`ingest`], [`metadata`], [`models`], [`prompt`], [`rag`], [`retry`], [`schema`],
//!   [`session_messages`], [`template`], [`tokens`], [`vector_store`], [`weaviate`]

use directories::ProjectDirs;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

pub mod api;
pub mod chunker;
pub mod commands;
pub mod config;
pub mod conversation;
pub mod embedding;
pub mod ingest;
pub mod metadata;
pub mod models;
pub mod prompt;
pub mod rag;
pub mod retry;
pub mod schema;
pub mod session_messages;
pub mod template;
pub mod tokens;
pub mod vector_store;
pub mod weaviate;

use crate::api::{LanguageModel, OpenAiChat};
use crate::config::{EmbedderKind, IndexBackend, RagConfig};
use crate::embedding::{HashingEmbedder, OpenAiEmbedder};
use crate::rag::RagService;
use crate::vector_store::{FixedConnector, IndexConnector, MemoryVectorStore, VectorIndex};
use crate::weaviate::WeaviateConnector;

/// Return the per-platform configuration directory.
///
/// This uses [`directories::ProjectDirs`] with the application triple
/// `("com", "sigma-rag", "sigma-rag")`, so you get the right place on each OS
/// (e.g., `~/.config/sigma-rag` on Linux).
///
/// The directory is **not** created by this function; callers that need it should
/// create it with `fs::create_dir_all`.
///
/// # Errors
/// Returns an error if the platform configuration directory cannot be determined.
///
/// # Examples
/// ```rust
/// let cfg = sigma_rag::config_dir().expect("has a config dir");
/// assert!(cfg.is_absolute());
/// ```
pub fn config_dir() -> Result<PathBuf, Box<dyn Error>> {
    let proj_dirs = ProjectDirs::from("com", "sigma-rag", "sigma-rag")
        .ok_or("Unable to determine config directory")?;
    Ok(proj_dirs.config_dir().to_path_buf())
}

/// Build the [`IndexConnector`] selected by `vector_index.backend`.
///
/// The memory backend lives only as long as the process; it suits tests and
/// single-process use.
pub fn connector_from_config(
    config: &RagConfig,
) -> Result<Arc<dyn IndexConnector>, Box<dyn Error>> {
    let index = &config.vector_index;
    match index.backend {
        IndexBackend::Weaviate => {
            let openai_key = Some(config.llm.api_key.clone()).filter(|k| !k.is_empty());
            Ok(Arc::new(WeaviateConnector::new(
                index.clone(),
                openai_key,
                config.retry.policy(),
            )))
        }
        IndexBackend::Memory => {
            let store: Arc<dyn VectorIndex> = match index.memory_embedder {
                EmbedderKind::Hashing => Arc::new(MemoryVectorStore::new(HashingEmbedder::default())),
                EmbedderKind::Openai => Arc::new(MemoryVectorStore::new(OpenAiEmbedder::new(
                    &config.llm.api_base,
                    &config.llm.api_key,
                    &index.embedding_model,
                    index.read_timeout(),
                )?)),
            };
            Ok(Arc::new(FixedConnector::new(store)))
        }
    }
}

/// Build a ready [`RagService`] from configuration: connector, OpenAI chat client
/// and the configured prompt template.
pub async fn build_service(config: &RagConfig) -> Result<RagService, Box<dyn Error>> {
    let connector = connector_from_config(config)?;
    let llm: Arc<dyn LanguageModel> = Arc::new(OpenAiChat::new(&config.llm)?);
    let template = template::resolve_template(config.generation.template.as_deref()).await;
    Ok(RagService::new(connector, llm, config, template).await?)
}
