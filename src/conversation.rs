//! # Conversation memory
//!
//! A bounded FIFO of recent turns, injected into each completion request so
//! follow-up questions have context. The memory is a plain value: the caller passes
//! prior turns in with the query and gets the updated history back in the
//! [`GenerationResult`](crate::rag::GenerationResult). Persisting it across
//! processes is the caller's job (see [`crate::session_messages`]).
//!
//! ```rust
//! use sigma_rag::conversation::{ConversationMemory, Turn};
//!
//! let mut memory = ConversationMemory::new(3);
//! memory.record("What is DMAIC?", "Define, Measure, Analyze, Improve, Control.");
//! memory.record("And DMADV?", "Define, Measure, Analyze, Design, Verify.");
//!
//! // three messages kept, the oldest question dropped
//! assert_eq!(memory.len(), 3);
//! assert_eq!(
//!     memory.turns().next(),
//!     Some(&Turn::assistant("Define, Measure, Analyze, Improve, Control."))
//! );
//! ```

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

/// Who said it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "user" | "human" => Ok(Role::User),
            "assistant" | "ai" => Ok(Role::Assistant),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// One message of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// The last `max_turns` messages of a conversation, counting questions and
/// answers separately.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationMemory {
    turns: VecDeque<Turn>,
    max_turns: usize,
}

impl ConversationMemory {
    pub fn new(max_turns: usize) -> Self {
        Self {
            turns: VecDeque::new(),
            max_turns,
        }
    }

    /// Start from caller-supplied history. An empty history is a fresh conversation.
    /// Blank turns are skipped and only the most recent window is kept.
    pub fn from_history(history: &[Turn], max_turns: usize) -> Self {
        let mut memory = Self::new(max_turns);
        history
            .iter()
            .filter(|t| !t.content.trim().is_empty())
            .cloned()
            .for_each(|t| memory.push(t));
        memory
    }

    /// Append a turn, evicting the oldest ones past capacity.
    pub fn push(&mut self, turn: Turn) {
        self.turns.push_back(turn);
        while self.turns.len() > self.max_turns {
            self.turns.pop_front();
        }
    }

    /// Append one completed exchange.
    pub fn record(&mut self, query: &str, answer: &str) {
        self.push(Turn::user(query));
        self.push(Turn::assistant(answer));
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    pub fn turns(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn into_turns(self) -> Vec<Turn> {
        self.turns.into()
    }
}
