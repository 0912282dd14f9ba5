//! # Data models for session persistence
//!
//! Diesel models mapped onto the tables declared in [`crate::schema`]. They back the
//! CLI's per-session conversation history; the RAG pipeline itself never touches
//! the database.
//!
//! Both tables use `INTEGER PRIMARY KEY`; ids are `Option<i32>` so new rows can be
//! inserted with `None` and read back with the assigned value.

use chrono::Utc;
use diesel::prelude::*;

use crate::conversation::{Role, Turn};

/// A named chat session.
#[derive(Queryable, Identifiable, Insertable, Debug, Selectable, Clone)]
#[diesel(table_name = crate::schema::conversations)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Conversation {
    #[diesel(deserialize_as = i32)]
    pub id: Option<i32>,
    pub session_name: String,
    /// RFC 3339 creation time.
    pub created_at: String,
}

impl Conversation {
    pub fn new(session_name: &str) -> Self {
        Self {
            id: None,
            session_name: session_name.to_string(),
            created_at: Utc::now().to_rfc3339(),
        }
    }

    #[inline]
    pub fn id(&self) -> Option<i32> {
        self.id
    }
}

/// One stored turn of a conversation.
#[derive(Queryable, Associations, Insertable, Debug, Selectable, Clone)]
#[diesel(belongs_to(Conversation))]
#[diesel(table_name = crate::schema::messages)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Message {
    #[diesel(deserialize_as = i32)]
    pub id: Option<i32>,
    /// `"user"` or `"assistant"`.
    pub role: String,
    pub content: String,
    pub created_at: String,
    pub conversation_id: Option<i32>,
}

impl Message {
    pub fn from_turn(turn: &Turn, conversation: &Conversation) -> Self {
        Self {
            id: None,
            role: turn.role.to_string(),
            content: turn.content.clone(),
            created_at: Utc::now().to_rfc3339(),
            conversation_id: conversation.id(),
        }
    }

    /// The stored row as a [`Turn`]; `None` for roles the pipeline doesn't know.
    pub fn to_turn(&self) -> Option<Turn> {
        self.role
            .parse::<Role>()
            .ok()
            .map(|role| Turn::new(role, self.content.clone()))
    }
}
