//! # Prompt assembly
//!
//! Builds the user prompt from retrieved contexts and the question, then enforces
//! the token ceiling by dropping the lowest-ranked context until the prompt fits.
//! Contexts arrive best-first, so the tail is the least relevant.
//!
//! The loop renders at most `contexts.len() + 1` times: each pass either returns or
//! removes one context.

use tracing::{debug, warn};

use crate::tokens::TokenCounter;
use crate::vector_store::ContextResult;

/// Outcome of [`PromptAssembler::assemble`].
#[derive(Debug, Clone, PartialEq)]
pub enum Assembly {
    /// A prompt within budget and the contexts it actually contains.
    Prompt {
        prompt: String,
        contexts: Vec<ContextResult>,
        tokens: usize,
    },
    /// Too large even after dropping every context.
    NoRoom,
}

#[derive(Debug)]
pub struct PromptAssembler {
    counter: TokenCounter,
    max_tokens: usize,
    instructions: String,
}

impl PromptAssembler {
    pub fn new(counter: TokenCounter, max_tokens: usize, instructions: impl Into<String>) -> Self {
        Self {
            counter,
            max_tokens,
            instructions: instructions.into(),
        }
    }

    pub fn counter(&self) -> &TokenCounter {
        &self.counter
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Render the prompt for `query` over `contexts`, in order.
    pub fn render(&self, query: &str, contexts: &[ContextResult]) -> String {
        let mut prompt = String::new();
        if !contexts.is_empty() {
            if !self.instructions.is_empty() {
                prompt.push_str(&self.instructions);
                prompt.push_str("\n\n");
            }
            prompt.push_str("Context:\n");
            for (i, context) in contexts.iter().enumerate() {
                prompt.push_str(&format!(
                    "[{}] Source: {} | Category: {}\n{}\n\n",
                    i + 1,
                    context.metadata.source,
                    context.metadata.category,
                    context.content
                ));
            }
        }
        prompt.push_str(&format!("Question: {}\nAnswer:", query));
        prompt
    }

    /// Fit `query` and `contexts` into the budget, leaving `reserved` tokens for the
    /// rest of the request (system prompt, conversation memory).
    ///
    /// With no contexts to begin with, the bare question is checked against the
    /// budget. Otherwise contexts are dropped from the tail; running out of them
    /// yields [`Assembly::NoRoom`].
    pub fn assemble(
        &self,
        query: &str,
        mut contexts: Vec<ContextResult>,
        reserved: usize,
    ) -> Assembly {
        let budget = self.max_tokens.saturating_sub(reserved);
        let had_contexts = !contexts.is_empty();

        loop {
            let prompt = self.render(query, &contexts);
            let tokens = self.counter.count(&prompt);
            if tokens <= budget {
                debug!(
                    "Assembled prompt: {} tokens, {} contexts (budget {})",
                    tokens,
                    contexts.len(),
                    budget
                );
                return Assembly::Prompt {
                    prompt,
                    contexts,
                    tokens,
                };
            }

            warn!(
                "Prompt exceeds token limit ({} > {}) with {} contexts",
                tokens,
                budget,
                contexts.len()
            );
            if contexts.pop().is_none() || (had_contexts && contexts.is_empty()) {
                return Assembly::NoRoom;
            }
        }
    }
}
