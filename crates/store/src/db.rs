//! The embedded relational store.
//!
//! One SQLite database holds every table that benefits from queries and
//! aggregation: cron jobs, goals, the cost ledger, reply outcomes, and the
//! error journal. WAL mode with a single writer serialised behind a mutex;
//! every public method takes the lock for the duration of one statement or
//! transaction, so callers never observe partial writes.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;
use uuid::Uuid;

use crate::models::*;
use crate::{Result, StoreError};

pub struct Db {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS crons (
    id                 TEXT PRIMARY KEY,
    name               TEXT NOT NULL,
    schedule           TEXT NOT NULL,
    timezone           TEXT NOT NULL DEFAULT '',
    prompt             TEXT NOT NULL,
    enabled            INTEGER NOT NULL DEFAULT 1,
    delivery           TEXT NOT NULL DEFAULT 'announce',
    model              TEXT,
    session_id         TEXT,
    last_run           TEXT,
    next_run           TEXT,
    last_status        TEXT NOT NULL DEFAULT 'never',
    last_duration_ms   INTEGER,
    consecutive_errors INTEGER NOT NULL DEFAULT 0,
    created_at         TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_crons_name ON crons(lower(name));

CREATE TABLE IF NOT EXISTS goals (
    id         TEXT PRIMARY KEY,
    title      TEXT NOT NULL,
    status     TEXT NOT NULL DEFAULT 'active',
    notes      TEXT NOT NULL DEFAULT '',
    milestones TEXT NOT NULL DEFAULT '[]',
    activity   TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS costs (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    ts            TEXT NOT NULL,
    source        TEXT NOT NULL,
    model         TEXT NOT NULL,
    input_tokens  INTEGER NOT NULL,
    output_tokens INTEGER NOT NULL,
    cost_usd      REAL NOT NULL,
    duration_ms   INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_costs_ts ON costs(ts);

CREATE TABLE IF NOT EXISTS reply_outcomes (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    bot_msg_id     TEXT NOT NULL,
    signal         TEXT NOT NULL,
    sentiment      TEXT,
    classification TEXT NOT NULL,
    user_response  TEXT NOT NULL,
    window_ms      INTEGER NOT NULL,
    ts             TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS errors (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    ts        TEXT NOT NULL,
    component TEXT NOT NULL,
    message   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_errors_ts ON errors(ts);
";

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl Db {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ── Crons ─────────────────────────────────────────────────────────────────

    pub fn insert_cron(&self, job: &CronJob) -> Result<()> {
        let conn = self.lock();
        let exists: Option<String> = conn
            .query_row(
                "SELECT id FROM crons WHERE lower(name) = lower(?1)",
                params![job.name],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(StoreError::DuplicateName(job.name.clone()));
        }

        conn.execute(
            "INSERT INTO crons (id, name, schedule, timezone, prompt, enabled, delivery, model,
                                session_id, last_run, next_run, last_status, last_duration_ms,
                                consecutive_errors, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                job.id.to_string(),
                job.name,
                job.schedule,
                job.timezone,
                job.prompt,
                job.enabled,
                job.delivery.as_str(),
                job.model,
                job.session_id,
                job.state.last_run.map(ts),
                job.state.next_run.map(ts),
                job.state.last_status.encode(),
                job.state.last_duration_ms,
                job.state.consecutive_errors,
                ts(job.created_at),
            ],
        )?;
        debug!(name = %job.name, "cron persisted");
        Ok(())
    }

    pub fn list_crons(&self) -> Result<Vec<CronJob>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT * FROM crons ORDER BY created_at")?;
        let rows = stmt.query_map([], row_to_cron)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Look a job up by UUID, or by name compared case-insensitively.
    pub fn find_cron(&self, id_or_name: &str) -> Result<CronJob> {
        let conn = self.lock();
        let job = conn
            .query_row(
                "SELECT * FROM crons WHERE id = ?1 OR lower(name) = lower(?1)",
                params![id_or_name],
                row_to_cron,
            )
            .optional()?;
        job.ok_or_else(|| StoreError::NotFound(format!("cron '{id_or_name}'")))
    }

    pub fn update_cron_state(&self, id: Uuid, state: &CronState) -> Result<()> {
        let changed = self.lock().execute(
            "UPDATE crons SET last_run = ?2, next_run = ?3, last_status = ?4,
                              last_duration_ms = ?5, consecutive_errors = ?6
             WHERE id = ?1",
            params![
                id.to_string(),
                state.last_run.map(ts),
                state.next_run.map(ts),
                state.last_status.encode(),
                state.last_duration_ms,
                state.consecutive_errors,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("cron {id}")));
        }
        Ok(())
    }

    pub fn set_cron_enabled(&self, id: Uuid, enabled: bool) -> Result<()> {
        let changed = self.lock().execute(
            "UPDATE crons SET enabled = ?2 WHERE id = ?1",
            params![id.to_string(), enabled],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("cron {id}")));
        }
        Ok(())
    }

    pub fn set_cron_session(&self, id: Uuid, session_id: &str) -> Result<()> {
        self.lock().execute(
            "UPDATE crons SET session_id = ?2 WHERE id = ?1",
            params![id.to_string(), session_id],
        )?;
        Ok(())
    }

    pub fn delete_cron(&self, id: Uuid) -> Result<()> {
        let changed = self
            .lock()
            .execute("DELETE FROM crons WHERE id = ?1", params![id.to_string()])?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("cron {id}")));
        }
        Ok(())
    }

    // ── Goals ─────────────────────────────────────────────────────────────────

    pub fn insert_goal(&self, goal: &Goal) -> Result<()> {
        self.lock().execute(
            "INSERT INTO goals (id, title, status, notes, milestones, activity, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                goal.id.to_string(),
                goal.title,
                goal.status.as_str(),
                goal.notes,
                serde_json::to_string(&goal.milestones)?,
                serde_json::to_string(&goal.activity)?,
                ts(goal.created_at),
                ts(goal.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn list_goals(&self) -> Result<Vec<Goal>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT * FROM goals ORDER BY created_at")?;
        let rows = stmt.query_map([], row_to_goal)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn get_goal(&self, id: Uuid) -> Result<Goal> {
        let conn = self.lock();
        conn.query_row(
            "SELECT * FROM goals WHERE id = ?1",
            params![id.to_string()],
            row_to_goal,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("goal {id}")))
    }

    /// Persist a goal after in-memory mutation.
    pub fn save_goal(&self, goal: &Goal) -> Result<()> {
        let changed = self.lock().execute(
            "UPDATE goals SET title = ?2, status = ?3, notes = ?4, milestones = ?5,
                              activity = ?6, updated_at = ?7
             WHERE id = ?1",
            params![
                goal.id.to_string(),
                goal.title,
                goal.status.as_str(),
                goal.notes,
                serde_json::to_string(&goal.milestones)?,
                serde_json::to_string(&goal.activity)?,
                ts(Utc::now()),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("goal {}", goal.id)));
        }
        Ok(())
    }

    pub fn delete_goal(&self, id: Uuid) -> Result<()> {
        let changed = self
            .lock()
            .execute("DELETE FROM goals WHERE id = ?1", params![id.to_string()])?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("goal {id}")));
        }
        Ok(())
    }

    // ── Cost ledger ───────────────────────────────────────────────────────────

    /// Batched insert — the adapter accumulates rows and flushes periodically.
    pub fn insert_costs(&self, rows: &[CostRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO costs (ts, source, model, input_tokens, output_tokens, cost_usd, duration_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for row in rows {
                stmt.execute(params![
                    ts(row.ts),
                    row.source,
                    row.model,
                    row.input_tokens,
                    row.output_tokens,
                    row.cost_usd,
                    row.duration_ms,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn cost_summary(&self) -> Result<CostSummary> {
        let conn = self.lock();
        let midnight = ts(Utc::now().date_naive().and_hms_opt(0, 0, 0).unwrap_or_default().and_utc());
        let (today_usd, today_calls): (f64, i64) = conn.query_row(
            "SELECT COALESCE(SUM(cost_usd), 0.0), COUNT(*) FROM costs WHERE ts >= ?1",
            params![midnight],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let (total_usd, total_calls): (f64, i64) = conn.query_row(
            "SELECT COALESCE(SUM(cost_usd), 0.0), COUNT(*) FROM costs",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(CostSummary { today_usd, today_calls, total_usd, total_calls })
    }

    // ── Reply outcomes ────────────────────────────────────────────────────────

    pub fn insert_outcome(&self, outcome: &ReplyOutcome) -> Result<()> {
        self.lock().execute(
            "INSERT INTO reply_outcomes (bot_msg_id, signal, sentiment, classification,
                                         user_response, window_ms, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                outcome.bot_msg_id,
                outcome.signal,
                outcome.sentiment.map(|s| match s {
                    Sentiment::Positive => "positive",
                    Sentiment::Negative => "negative",
                }),
                outcome.classification,
                outcome.user_response,
                outcome.window_ms,
                ts(outcome.ts),
            ],
        )?;
        Ok(())
    }

    pub fn recent_outcomes(&self, limit: usize) -> Result<Vec<ReplyOutcome>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT bot_msg_id, signal, sentiment, classification, user_response, window_ms, ts
             FROM reply_outcomes ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let sentiment: Option<String> = row.get(2)?;
            Ok(ReplyOutcome {
                bot_msg_id: row.get(0)?,
                signal: row.get(1)?,
                sentiment: sentiment.and_then(|s| match s.as_str() {
                    "positive" => Some(Sentiment::Positive),
                    "negative" => Some(Sentiment::Negative),
                    _ => None,
                }),
                classification: row.get(3)?,
                user_response: row.get(4)?,
                window_ms: row.get(5)?,
                ts: parse_ts(&row.get::<_, String>(6)?),
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    // ── Error journal ─────────────────────────────────────────────────────────

    pub fn log_error(&self, component: &str, message: &str) -> Result<()> {
        self.lock().execute(
            "INSERT INTO errors (ts, component, message) VALUES (?1, ?2, ?3)",
            params![ts(Utc::now()), component, message],
        )?;
        Ok(())
    }

    pub fn recent_errors(&self, limit: usize) -> Result<Vec<ErrorRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT ts, component, message FROM errors ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(ErrorRow {
                ts: parse_ts(&row.get::<_, String>(0)?),
                component: row.get(1)?,
                message: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }
}

fn row_to_cron(row: &rusqlite::Row<'_>) -> rusqlite::Result<CronJob> {
    let id: String = row.get("id")?;
    let delivery: String = row.get("delivery")?;
    let last_run: Option<String> = row.get("last_run")?;
    let next_run: Option<String> = row.get("next_run")?;
    let status: String = row.get("last_status")?;
    Ok(CronJob {
        id: Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::nil()),
        name: row.get("name")?,
        schedule: row.get("schedule")?,
        timezone: row.get("timezone")?,
        prompt: row.get("prompt")?,
        enabled: row.get("enabled")?,
        delivery: DeliveryMode::parse(&delivery).unwrap_or_default(),
        model: row.get("model")?,
        session_id: row.get("session_id")?,
        state: CronState {
            last_run: last_run.as_deref().map(parse_ts),
            next_run: next_run.as_deref().map(parse_ts),
            last_status: CronStatus::decode(&status),
            last_duration_ms: row.get("last_duration_ms")?,
            consecutive_errors: row.get("consecutive_errors")?,
        },
        created_at: parse_ts(&row.get::<_, String>("created_at")?),
    })
}

fn row_to_goal(row: &rusqlite::Row<'_>) -> rusqlite::Result<Goal> {
    let id: String = row.get("id")?;
    let status: String = row.get("status")?;
    let milestones: String = row.get("milestones")?;
    let activity: String = row.get("activity")?;
    Ok(Goal {
        id: Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::nil()),
        title: row.get("title")?,
        status: GoalStatus::parse(&status).unwrap_or_default(),
        notes: row.get("notes")?,
        milestones: serde_json::from_str(&milestones).unwrap_or_default(),
        activity: serde_json::from_str(&activity).unwrap_or_default(),
        created_at: parse_ts(&row.get::<_, String>("created_at")?),
        updated_at: parse_ts(&row.get::<_, String>("updated_at")?),
    })
}
