//! Persistent-session bookkeeping and token accounting.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::info;

use attache_store::{atomic_write_json, read_json};

use crate::events::Usage;

/// On-disk session state. While `started` is true every persistent-mode call
/// must resume `id`; a compression cycle replaces the id, zeroes the token
/// count, and carries continuity in `summary`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionState {
    pub id: Option<String>,
    pub tokens: u64,
    pub started: bool,
    pub summary: Option<String>,
}

#[derive(Debug)]
pub struct SessionTracker {
    state: SessionState,
    path: PathBuf,
}

impl SessionTracker {
    pub fn load(path: PathBuf) -> Self {
        let state = read_json(&path).ok().flatten().unwrap_or_default();
        Self { state, path }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn tokens(&self) -> u64 {
        self.state.tokens
    }

    pub fn session_id(&self) -> Option<&str> {
        self.state.id.as_deref()
    }

    pub fn summary(&self) -> Option<&str> {
        self.state.summary.as_deref()
    }

    /// Record the terminal usage of one call.
    ///
    /// Session growth counts `input + output` tokens only. `cache_read`
    /// tokens re-expose context the subprocess already holds, so adding them
    /// would overestimate pressure and trigger compression far too early.
    pub async fn note_usage(&mut self, session_id: Option<&str>, usage: &Usage) {
        if let Some(id) = session_id {
            if self.state.id.as_deref() != Some(id) {
                self.state.id = Some(id.to_string());
            }
            self.state.started = true;
        }
        let grown = (usage.input_tokens + usage.output_tokens).max(0) as u64;
        self.state.tokens = self.state.tokens.saturating_add(grown);
        self.persist().await;
    }

    /// Install the replacement session after a compression cycle. The token
    /// count resets; the summary seeds the next prompt.
    pub async fn reset_with_summary(&mut self, summary: Option<String>) {
        info!(
            old_tokens = self.state.tokens,
            had_summary = summary.is_some(),
            "session reset"
        );
        self.state = SessionState {
            id: None,
            tokens: 0,
            started: false,
            summary,
        };
        self.persist().await;
    }

    /// Forget a session id the CLI refused to resume, keeping token count
    /// and summary intact so the retry seeds a fresh session properly.
    pub async fn discard_id(&mut self) {
        self.state.id = None;
        self.state.started = false;
        self.persist().await;
    }

    async fn persist(&self) {
        if let Err(err) = atomic_write_json(&self.path, &self.state).await {
            tracing::warn!(%err, "session state persist failed — memory stays authoritative");
        }
    }
}
