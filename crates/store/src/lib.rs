//! Persistence layer — atomic JSON files plus the embedded relational store.
//!
//! Two write paths exist and nothing else may touch disk directly:
//! * [`json`] — write-tmp-then-rename JSON documents with an optional
//!   debounced writer for chatty state (conversation history, goals cache).
//! * [`db`] — a single SQLite database (WAL) holding crons, goals, costs,
//!   reply outcomes, and the error journal, serialised behind one writer.

pub mod archive;
pub mod db;
pub mod history;
pub mod json;
pub mod models;

pub use archive::PromptArchive;
pub use db::Db;
pub use history::{ChatTurn, ConversationHistory, Role};
pub use json::{DebouncedWriter, atomic_write_json, read_json};
pub use models::*;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate name: {0}")]
    DuplicateName(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
