//! # Session Messages Module
//!
//! SQLite persistence (via Diesel) for conversation history, keyed by session name.
//! The RAG pipeline treats history as a value passed in and out of each call; this
//! module is what the CLI uses to carry it across runs:
//!
//! 1. [`SessionStore::open`] connects and creates the tables if needed.
//! 2. [`SessionStore::load_turns`] fetches the most recent turns of a session.
//! 3. After answering, [`SessionStore::append_turns`] stores the new exchange.
//!
//! ```no_run
//! use sigma_rag::conversation::Turn;
//! use sigma_rag::session_messages::SessionStore;
//!
//! # fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut store = SessionStore::open("sigma_rag.db")?;
//! let history = store.load_turns("default", 10)?;
//! store.append_turns("default", &[Turn::user("What is 5S?"), Turn::assistant("Sort, ...")])?;
//! # Ok(()) }
//! ```

use diesel::prelude::*;
use diesel::{Connection, SqliteConnection};
use std::error::Error;
use tracing::{debug, warn};

use crate::conversation::Turn;
use crate::models::{Conversation, Message};
use crate::schema::{conversations, messages};

const CREATE_CONVERSATIONS: &str = "CREATE TABLE IF NOT EXISTS conversations (
    id INTEGER PRIMARY KEY NOT NULL,
    session_name TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL
)";

const CREATE_MESSAGES: &str = "CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL,
    conversation_id INTEGER REFERENCES conversations(id)
)";

/// Conversation history backed by SQLite.
pub struct SessionStore {
    sqlite_connection: SqliteConnection,
}

impl SessionStore {
    /// Connect to `db_url` and make sure the schema exists.
    pub fn open(db_url: &str) -> Result<Self, Box<dyn Error>> {
        let mut sqlite_connection = SqliteConnection::establish(db_url)?;
        sqlite_connection.transaction(|conn| {
            diesel::sql_query(CREATE_CONVERSATIONS).execute(conn)?;
            diesel::sql_query(CREATE_MESSAGES).execute(conn)?;
            Ok::<_, diesel::result::Error>(())
        })?;
        debug!("Opened session store at {}", db_url);
        Ok(Self { sqlite_connection })
    }

    /// Look up a conversation by session name.
    pub fn query_conversation(
        &mut self,
        session_name: &str,
    ) -> Result<Option<Conversation>, diesel::result::Error> {
        conversations::table
            .filter(conversations::session_name.eq(session_name))
            .select(Conversation::as_select())
            .first(&mut self.sqlite_connection)
            .optional()
    }

    /// Look up a conversation, creating it on first use.
    pub fn find_or_create_conversation(
        &mut self,
        session_name: &str,
    ) -> Result<Conversation, diesel::result::Error> {
        self.sqlite_connection.transaction(|conn| {
            let existing = conversations::table
                .filter(conversations::session_name.eq(session_name))
                .select(Conversation::as_select())
                .first(conn)
                .optional()?;

            match existing {
                Some(conversation) => Ok(conversation),
                None => diesel::insert_into(conversations::table)
                    .values(&Conversation::new(session_name))
                    .returning(Conversation::as_returning())
                    .get_result(conn),
            }
        })
    }

    /// The most recent `limit` turns of a session, oldest first. Unknown sessions
    /// have no turns.
    pub fn load_turns(
        &mut self,
        session_name: &str,
        limit: usize,
    ) -> Result<Vec<Turn>, diesel::result::Error> {
        let Some(conversation) = self.query_conversation(session_name)? else {
            return Ok(Vec::new());
        };

        let mut recent: Vec<Message> = messages::table
            .filter(messages::conversation_id.eq(conversation.id()))
            .order(messages::id.desc())
            .limit(i64::try_from(limit).unwrap_or(i64::MAX))
            .select(Message::as_select())
            .load(&mut self.sqlite_connection)?;
        recent.reverse();

        Ok(recent
            .iter()
            .filter_map(|m| {
                let turn = m.to_turn();
                if turn.is_none() {
                    warn!("Skipping stored message with unknown role '{}'", m.role);
                }
                turn
            })
            .collect())
    }

    /// Append `turns` to a session in one transaction.
    pub fn append_turns(
        &mut self,
        session_name: &str,
        turns: &[Turn],
    ) -> Result<Vec<Message>, diesel::result::Error> {
        let conversation = self.find_or_create_conversation(session_name)?;
        self.sqlite_connection.transaction(|conn| {
            turns
                .iter()
                .map(|turn| {
                    diesel::insert_into(messages::table)
                        .values(&Message::from_turn(turn, &conversation))
                        .returning(Message::as_returning())
                        .get_result(conn)
                })
                .collect()
        })
    }

    /// Delete every stored turn of a session. Returns how many were removed.
    pub fn clear(&mut self, session_name: &str) -> Result<usize, diesel::result::Error> {
        let Some(conversation) = self.query_conversation(session_name)? else {
            return Ok(0);
        };
        diesel::delete(messages::table.filter(messages::conversation_id.eq(conversation.id())))
            .execute(&mut self.sqlite_connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, SessionStore) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sessions.db");
        let store = SessionStore::open(path.to_str().unwrap()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_unknown_session_has_no_turns() {
        let (_dir, mut store) = store();
        assert!(store.load_turns("nobody", 10).unwrap().is_empty());
        assert_eq!(store.clear("nobody").unwrap(), 0);
    }

    #[test]
    fn test_append_then_load_recent_window() {
        let (_dir, mut store) = store();
        for i in 0..3 {
            store
                .append_turns(
                    "lss",
                    &[Turn::user(format!("q{i}")), Turn::assistant(format!("a{i}"))],
                )
                .unwrap();
        }
        store
            .append_turns("other", &[Turn::user("unrelated")])
            .unwrap();

        let turns = store.load_turns("lss", 4).unwrap();
        assert_eq!(
            turns,
            vec![
                Turn::user("q1"),
                Turn::assistant("a1"),
                Turn::user("q2"),
                Turn::assistant("a2"),
            ]
        );
    }

    #[test]
    fn test_conversation_is_created_once() {
        let (_dir, mut store) = store();
        let first = store.find_or_create_conversation("lss").unwrap();
        let second = store.find_or_create_conversation("lss").unwrap();
        assert!(first.id().is_some());
        assert_eq!(first.id(), second.id());
    }

    #[test]
    fn test_clear_removes_session_turns() {
        let (_dir, mut store) = store();
        store
            .append_turns("lss", &[Turn::user("q"), Turn::assistant("a")])
            .unwrap();
        assert_eq!(store.clear("lss").unwrap(), 2);
        assert!(store.load_turns("lss", 10).unwrap().is_empty());
    }

    #[test]
    fn test_reopen_keeps_history() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sessions.db");
        let url = path.to_str().unwrap();
        SessionStore::open(url)
            .unwrap()
            .append_turns("lss", &[Turn::user("persisted")])
            .unwrap();

        let turns = SessionStore::open(url).unwrap().load_turns("lss", 10).unwrap();
        assert_eq!(turns, vec![Turn::user("persisted")]);
    }
}
