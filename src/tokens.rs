//! # Token counting
//!
//! Measures prompt length in model tokens so the prompt assembler can enforce a hard
//! ceiling. The exact path uses the `tiktoken` BPE registered for the model name.
//! Unknown names (common on OpenAI-compatible servers) get `cl100k_base`; if no
//! tokenizer can be built at all, a conservative heuristic is used instead.
//! Counting never fails.

use std::fmt;
use tiktoken_rs::{CoreBPE, cl100k_base, get_bpe_from_model};
use tracing::{debug, error, warn};

/// Token counter bound to a single model.
///
/// The BPE tables are loaded once at construction; [`TokenCounter::count`] is then
/// pure computation.
pub struct TokenCounter {
    model: String,
    bpe: Option<CoreBPE>,
}

impl TokenCounter {
    /// Load the tokenizer for `model`, then `cl100k_base`, then the heuristic.
    pub fn for_model(model: &str) -> Self {
        let bpe = match get_bpe_from_model(model) {
            Ok(bpe) => {
                debug!("Loaded tokenizer for model {}", model);
                Some(bpe)
            }
            Err(e) => {
                warn!("No tokenizer for model {} ({}); using cl100k_base", model, e);
                match cl100k_base() {
                    Ok(bpe) => Some(bpe),
                    Err(e) => {
                        error!("Error counting tokens: {}; using estimate", e);
                        None
                    }
                }
            }
        };
        Self {
            model: model.to_string(),
            bpe,
        }
    }

    /// A counter that only ever uses the heuristic estimate.
    pub fn heuristic() -> Self {
        Self {
            model: String::from("heuristic"),
            bpe: None,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Whether counts come from the exact tokenizer.
    pub fn is_exact(&self) -> bool {
        self.bpe.is_some()
    }

    pub fn count(&self, text: &str) -> usize {
        match &self.bpe {
            Some(bpe) => bpe.encode_with_special_tokens(text).len(),
            None => estimate_tokens(text),
        }
    }
}

impl fmt::Debug for TokenCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCounter")
            .field("model", &self.model)
            .field("exact", &self.is_exact())
            .finish()
    }
}

/// Conservative token estimate: the larger of `ceil(chars / 4)` and `2 × words`.
pub fn estimate_tokens(text: &str) -> usize {
    let by_chars = text.chars().count().div_ceil(4);
    let by_words = text.split_whitespace().count() * 2;
    by_chars.max(by_words)
}

/// Count tokens in `text` for `model`.
///
/// Convenience for one-off measurements; keep a [`TokenCounter`] around when
/// counting repeatedly.
pub fn count_tokens(text: &str, model: &str) -> usize {
    TokenCounter::for_model(model).count(text)
}
