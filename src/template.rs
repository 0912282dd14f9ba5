//! # Prompt templates
//!
//! A template is a small YAML document that sets the assistant's persona and the
//! answering instructions wrapped around retrieved context:
//!
//! - `system_prompt`: system message for grounded (RAG) answers,
//! - `fallback_system_prompt`: system message when answering without context,
//! - `instructions`: text placed before the context block of every user prompt.
//!
//! Templates live under the configuration directory:
//!
//! ```text
//! <config_dir>/templates/<name>.yaml
//! ```
//!
//! where `<config_dir>` comes from [`crate::config_dir()`]. Missing fields fall back
//! to the built-in Lean Six Sigma consultant.
//!
//! ## Minimal YAML example
//!
//! ```yaml
//! system_prompt: "You are a concise quality-engineering assistant."
//! instructions: "Answer using only the context below."
//! ```
//!
//! ## Loading a template
//!
//! ```no_run
//! use sigma_rag::template::{PromptTemplate, load_template};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let template: PromptTemplate = load_template("lean_six_sigma").await?;
//! println!("System prompt: {}", template.system_prompt);
//! # Ok(()) }
//! ```

use serde::{Deserialize, Serialize};
use std::{error::Error, fs, path::Path};

const DEFAULT_SYSTEM_PROMPT: &str = "You are an expert Lean Six Sigma consultant providing \
accurate and helpful advice. Ground your answers in the reference material you are given \
and mention which document an answer comes from when it helps.";

const DEFAULT_FALLBACK_SYSTEM_PROMPT: &str = "You are an expert Lean Six Sigma consultant \
providing accurate and helpful advice. Answer the user's question based on your knowledge \
of Lean Six Sigma methodologies, tools, and concepts. If you don't know the answer, be \
honest about it.";

const DEFAULT_INSTRUCTIONS: &str = "Use the following pieces of context to answer the \
question at the end. If the context does not contain the answer, say that you don't know \
instead of making one up.";

/// Persona and instructions for prompt assembly.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct PromptTemplate {
    /// System message for grounded answers.
    pub system_prompt: String,

    /// System message for direct answers without retrieved context.
    pub fallback_system_prompt: String,

    /// Placed before the context block in the user prompt.
    pub instructions: String,
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            fallback_system_prompt: DEFAULT_FALLBACK_SYSTEM_PROMPT.to_string(),
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
        }
    }
}

/// Load a template by name from `<config_dir>/templates/<name>.yaml`.
///
/// ### Errors
/// - the config directory cannot be determined,
/// - the file does not exist or cannot be read,
/// - the YAML cannot be deserialized into a [`PromptTemplate`].
pub async fn load_template(name: &str) -> Result<PromptTemplate, Box<dyn Error>> {
    let path = crate::config_dir()?.join(format!("templates/{}.yaml", name));
    load_template_from(&path).await
}

/// Load a template from an explicit path.
pub async fn load_template_from(path: &Path) -> Result<PromptTemplate, Box<dyn Error>> {
    tracing::info!("Loading template: {}", path.display());

    let content = fs::read_to_string(path)?;
    let template: PromptTemplate = serde_yaml::from_str(&content)?;
    Ok(template)
}

/// Resolve the template named in the config, falling back to the built-in one when
/// no name is set or the file can't be loaded.
pub async fn resolve_template(name: Option<&str>) -> PromptTemplate {
    match name {
        Some(name) => match load_template(name).await {
            Ok(template) => template,
            Err(e) => {
                tracing::warn!("Template {} unavailable ({}); using built-in", name, e);
                PromptTemplate::default()
            }
        },
        None => PromptTemplate::default(),
    }
}
