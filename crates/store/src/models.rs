//! Persisted entity types shared across the daemon.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Cron jobs ─────────────────────────────────────────────────────────────────

/// How a cron job's reply reaches the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Deliver the reply to the channel (outside quiet hours).
    #[default]
    Announce,
    /// Run without any user-visible message.
    Silent,
}

impl DeliveryMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "announce" => Some(Self::Announce),
            "silent" => Some(Self::Silent),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Announce => "announce",
            Self::Silent => "silent",
        }
    }
}

/// Result of the most recent execution of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CronStatus {
    #[default]
    Never,
    Ok,
    Running,
    Error(String),
}

impl CronStatus {
    pub fn encode(&self) -> String {
        match self {
            Self::Never => "never".to_string(),
            Self::Ok => "ok".to_string(),
            Self::Running => "running".to_string(),
            Self::Error(msg) => format!("error:{msg}"),
        }
    }

    pub fn decode(s: &str) -> Self {
        match s {
            "never" => Self::Never,
            "ok" => Self::Ok,
            "running" => Self::Running,
            other => match other.strip_prefix("error:") {
                Some(msg) => Self::Error(msg.to_string()),
                None => Self::Never,
            },
        }
    }
}

/// Mutable per-job execution state, persisted atomically with each tick.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CronState {
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub last_status: CronStatus,
    pub last_duration_ms: Option<i64>,
    pub consecutive_errors: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJob {
    pub id: Uuid,
    /// Unique per store, compared case-insensitively.
    pub name: String,
    /// Five-field cron expression, validated at creation time.
    pub schedule: String,
    /// IANA timezone; empty means the daemon default.
    pub timezone: String,
    pub prompt: String,
    pub enabled: bool,
    pub delivery: DeliveryMode,
    /// Optional per-job model override.
    pub model: Option<String>,
    /// Per-job session id so each cron accumulates its own continuity.
    pub session_id: Option<String>,
    pub state: CronState,
    pub created_at: DateTime<Utc>,
}

impl CronJob {
    pub fn new(name: impl Into<String>, schedule: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            schedule: schedule.into(),
            timezone: String::new(),
            prompt: prompt.into(),
            enabled: true,
            delivery: DeliveryMode::Announce,
            model: None,
            session_id: None,
            state: CronState::default(),
            created_at: Utc::now(),
        }
    }
}

// ── Goals ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GoalStatus {
    #[default]
    Active,
    Paused,
    Done,
}

impl GoalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            "done" => Some(Self::Done),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Milestone {
    pub title: String,
    pub done: bool,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub id: Uuid,
    pub title: String,
    pub status: GoalStatus,
    pub notes: String,
    pub milestones: Vec<Milestone>,
    /// Append-only log of `(timestamp, note)` lines shown at the full tier.
    pub activity: Vec<(DateTime<Utc>, String)>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Goal {
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            status: GoalStatus::Active,
            notes: String::new(),
            milestones: Vec::new(),
            activity: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

// ── Cost ledger ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostRow {
    pub ts: DateTime<Utc>,
    /// `chat`, `cron:<id>`, or `wf:<id>`.
    pub source: String,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_usd: f64,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CostSummary {
    pub today_usd: f64,
    pub today_calls: i64,
    pub total_usd: f64,
    pub total_calls: i64,
}

// ── Reply outcomes ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Negative,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyOutcome {
    pub bot_msg_id: String,
    pub signal: String,
    pub sentiment: Option<Sentiment>,
    pub classification: String,
    /// User response, truncated before persisting.
    pub user_response: String,
    pub window_ms: i64,
    pub ts: DateTime<Utc>,
}

// ── Error journal ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRow {
    pub ts: DateTime<Utc>,
    /// `cron:<id>`, `wf:<id>`, `llm`, `pipeline`, `ipc`.
    pub component: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cron_status_roundtrips_through_encoding() {
        for status in [
            CronStatus::Never,
            CronStatus::Ok,
            CronStatus::Running,
            CronStatus::Error("spawn failed: no such file".to_string()),
        ] {
            assert_eq!(CronStatus::decode(&status.encode()), status);
        }
    }

    #[test]
    fn error_status_preserves_colons_in_message() {
        let status = CronStatus::Error("timeout: 900s: hard".to_string());
        assert_eq!(CronStatus::decode(&status.encode()), status);
    }

    #[test]
    fn delivery_mode_parses_case_insensitively() {
        assert_eq!(DeliveryMode::parse("Announce"), Some(DeliveryMode::Announce));
        assert_eq!(DeliveryMode::parse(" silent "), Some(DeliveryMode::Silent));
        assert_eq!(DeliveryMode::parse("loud"), None);
    }
}
