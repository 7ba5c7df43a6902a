//! Per-correspondent conversation history.
//!
//! The history is a bounded transcript used for prompt recaps and the
//! post-compression rebuild. Two invariants hold at every observation
//! point: the first turn, if any, has the user role (a leading non-user
//! prefix is discarded), and the length never exceeds the configured cap.
//! Persistence goes through the debounced writer, so disk lags memory by at
//! most the flush window.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into(), timestamp: Utc::now() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into(), timestamp: Utc::now() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationHistory {
    turns: Vec<ChatTurn>,
}

impl ConversationHistory {
    pub fn push(&mut self, turn: ChatTurn, max_turns: usize) {
        self.turns.push(turn);
        self.enforce(max_turns);
    }

    pub fn turns(&self) -> &[ChatTurn] {
        &self.turns
    }

    pub fn last(&self) -> Option<&ChatTurn> {
        self.turns.last()
    }

    pub fn last_user_at(&self) -> Option<DateTime<Utc>> {
        self.turns
            .iter()
            .rev()
            .find(|t| t.role == Role::User)
            .map(|t| t.timestamp)
    }

    pub fn recent(&self, n: usize) -> &[ChatTurn] {
        let start = self.turns.len().saturating_sub(n);
        &self.turns[start..]
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    /// Trim to the cap, then discard any leading non-user turns. The discard
    /// is kept even though the subprocess owns full session context: after a
    /// compression cycle this view is rebuilt into fresh prompts, where an
    /// assistant-first transcript would desynchronise role alternation.
    fn enforce(&mut self, max_turns: usize) {
        if self.turns.len() > max_turns {
            let excess = self.turns.len() - max_turns;
            self.turns.drain(..excess);
        }
        let lead = self
            .turns
            .iter()
            .position(|t| t.role == Role::User)
            .unwrap_or(self.turns.len());
        if lead > 0 {
            self.turns.drain(..lead);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_turn_is_always_user() {
        let mut history = ConversationHistory::default();
        history.push(ChatTurn::assistant("hello, I woke up"), 10);
        assert!(history.turns().is_empty(), "leading assistant turn is discarded");

        history.push(ChatTurn::user("hi"), 10);
        history.push(ChatTurn::assistant("hello!"), 10);
        assert_eq!(history.turns().len(), 2);
        assert_eq!(history.turns()[0].role, Role::User);
    }

    #[test]
    fn trimming_respects_cap_and_user_first() {
        let mut history = ConversationHistory::default();
        for i in 0..6 {
            history.push(ChatTurn::user(format!("u{i}")), 100);
            history.push(ChatTurn::assistant(format!("a{i}")), 100);
        }

        // Force a trim that would start on an assistant turn.
        history.push(ChatTurn::user("u6"), 4);
        assert!(history.turns().len() <= 4);
        assert_eq!(history.turns()[0].role, Role::User);
    }

    #[test]
    fn recent_returns_tail() {
        let mut history = ConversationHistory::default();
        for i in 0..5 {
            history.push(ChatTurn::user(format!("m{i}")), 10);
        }
        let recent = history.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].content, "m4");
    }
}
