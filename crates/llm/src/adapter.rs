//! The LLM CLI subprocess adapter.
//!
//! Two operating modes share one streaming core:
//!
//! * **Persistent** — a long-lived subprocess holds prior turns in its own
//!   context. Each chat turn writes one user message to its stdin and reads
//!   events until the terminal `result`. Compression replaces the process
//!   with a fresh one seeded from the previous session's summary.
//! * **One-shot** — a fresh subprocess per call, optionally resuming an
//!   externally-managed session id (crons carry their own continuity).
//!
//! Every call is bracketed by an absolute timeout and an inactivity watchdog,
//! and accepts an abort signal from the composing watchdog or a workflow
//! cancel. Retries happen only while zero output has been forwarded.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info, warn};

use attache_config::LlmConfig;
use attache_store::{CostRow, Db, PromptArchive};

use crate::events::{ContentBlock, Delta, ResultEvent, StreamEvent, ToolUse, Usage};
use crate::session::SessionTracker;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("failed to spawn LLM CLI: {0}")]
    Spawn(std::io::Error),

    #[error("stream io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("call exceeded the absolute timeout ({0}s)")]
    Timeout(u64),

    #[error("no output for {0}s — inactivity watchdog fired")]
    Inactive(u64),

    #[error("call aborted")]
    Aborted,

    #[error("stream ended without a result event")]
    Truncated,

    #[error("model reported an error: {0}")]
    Permanent(String),

    #[error("a call is already in flight for this session")]
    Busy,
}

impl LlmError {
    /// Transient errors may be retried before any output is delivered.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Spawn(_) | Self::Io(_) | Self::Timeout(_) | Self::Inactive(_) | Self::Truncated
        )
    }
}

// ── Abort plumbing ────────────────────────────────────────────────────────────

/// Cancellation handle owned by a watchdog. Cloned freely; firing it
/// terminates the subprocess of any call carrying the paired signal.
#[derive(Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
}

pub type AbortSignal = watch::Receiver<bool>;

impl AbortHandle {
    pub fn new() -> (Self, AbortSignal) {
        let (tx, rx) = watch::channel(false);
        (Self { tx: Arc::new(tx) }, rx)
    }

    pub fn abort(&self) {
        let _ = self.tx.send(true);
    }
}

async fn aborted(signal: &mut Option<AbortSignal>) {
    match signal {
        Some(rx) => {
            loop {
                if *rx.borrow() {
                    return;
                }
                if rx.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        }
        None => std::future::pending().await,
    }
}

// ── Call surface ──────────────────────────────────────────────────────────────

/// Streaming callbacks. Both are optional; send errors are ignored because a
/// closed receiver just means nobody is rendering the stream.
#[derive(Default)]
pub struct Callbacks {
    pub on_text: Option<mpsc::Sender<String>>,
    pub on_tool_use: Option<mpsc::Sender<String>>,
}

#[derive(Debug, Clone)]
pub struct LlmReply {
    pub text: String,
    pub session_id: Option<String>,
    pub usage: Usage,
    pub cost_usd: f64,
    pub duration_ms: i64,
    pub api_duration_ms: i64,
    pub tool_uses: Vec<ToolUse>,
}

#[derive(Debug, Clone, Default)]
pub struct OneShotOptions {
    /// Resume this session id (per-cron continuity).
    pub session_id: Option<String>,
    pub model: Option<String>,
    /// Cost attribution label: `chat`, `cron:<id>`, `wf:<id>`.
    pub source: String,
}

struct PersistentChild {
    child: Child,
    stdin: ChildStdin,
    reader: tokio::io::Lines<BufReader<ChildStdout>>,
}

struct CallOutcome {
    text: String,
    result: ResultEvent,
    tool_uses: Vec<ToolUse>,
    deltas_forwarded: bool,
}

/// Stream failure paired with whether output already reached the caller —
/// the fact that decides retry eligibility.
struct StreamFailure {
    error: LlmError,
    deltas_forwarded: bool,
}

impl From<std::io::Error> for StreamFailure {
    fn from(err: std::io::Error) -> Self {
        Self { error: err.into(), deltas_forwarded: false }
    }
}

/// How many cost rows accumulate before a batched insert.
const COST_FLUSH_THRESHOLD: usize = 8;

const SUMMARY_PROMPT: &str = "Summarise our conversation so far in 2-3 dense paragraphs. \
Preserve decisions, names, open tasks, commitments, and user preferences verbatim where they \
matter. The summary replaces the full history, so include everything needed to continue \
seamlessly.";

pub struct CliAdapter {
    config: LlmConfig,
    archive: PromptArchive,
    db: Arc<Db>,
    session: Mutex<SessionTracker>,
    child: Mutex<Option<PersistentChild>>,
    /// Serialises persistent-session calls; overlap is rejected, not queued.
    call_lock: Mutex<()>,
    /// Mirror of the session token count for lock-free pressure reads.
    tokens: AtomicU64,
    costs: std::sync::Mutex<Vec<CostRow>>,
}

impl CliAdapter {
    pub fn new(config: LlmConfig, session_path: std::path::PathBuf, archive: PromptArchive, db: Arc<Db>) -> Self {
        let tracker = SessionTracker::load(session_path);
        let tokens = AtomicU64::new(tracker.tokens());
        Self {
            config,
            archive,
            db,
            session: Mutex::new(tracker),
            child: Mutex::new(None),
            call_lock: Mutex::new(()),
            tokens,
            costs: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Cumulative token estimate of the live session.
    pub fn session_tokens(&self) -> u64 {
        self.tokens.load(Ordering::Relaxed)
    }

    pub fn session_token_ceiling(&self) -> u64 {
        self.config.session_token_ceiling
    }

    /// Summary carried over from the last compression, if any.
    pub async fn session_summary(&self) -> Option<String> {
        self.session.lock().await.summary().map(str::to_string)
    }

    // ── Persistent mode ───────────────────────────────────────────────────────

    /// Run one chat turn against the persistent session.
    ///
    /// Rejects with [`LlmError::Busy`] when another turn is already in
    /// flight — the pipeline serialises per correspondent, so overlap here
    /// means a bug upstream and silently queuing would hide it.
    pub async fn chat_turn(
        &self,
        prompt: &str,
        callbacks: &Callbacks,
        abort: Option<AbortSignal>,
    ) -> Result<LlmReply, LlmError> {
        let Ok(_guard) = self.call_lock.try_lock() else {
            return Err(LlmError::Busy);
        };
        self.archive.save("chat", prompt).await;

        match self.chat_turn_inner(prompt, callbacks, abort.clone()).await {
            Err(LlmError::Permanent(msg)) if looks_like_resume_failure(&msg) => {
                // The CLI no longer knows our session — discard it and retry
                // once against a fresh one.
                warn!(%msg, "session resume failed — starting a fresh session");
                self.session.lock().await.discard_id().await;
                *self.child.lock().await = None;
                self.chat_turn_inner(prompt, callbacks, abort).await
            }
            other => other,
        }
    }

    async fn chat_turn_inner(
        &self,
        prompt: &str,
        callbacks: &Callbacks,
        abort: Option<AbortSignal>,
    ) -> Result<LlmReply, LlmError> {
        let mut child_slot = self.child.lock().await;
        if child_slot.is_none() {
            let session = self.session.lock().await;
            let args = self.build_args(None, session.session_id(), session.summary());
            drop(session);
            *child_slot = Some(self.spawn(&args)?);
        }
        let Some(active) = child_slot.as_mut() else {
            return Err(LlmError::Truncated);
        };

        write_user_message(&mut active.stdin, prompt).await?;

        let outcome = stream_events(
            &mut active.reader,
            callbacks,
            abort,
            Duration::from_secs(self.config.timeout_secs),
            Duration::from_secs(self.config.inactivity_secs),
        )
        .await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(failure) => {
                // Any failure invalidates the process; the next turn respawns.
                if let Some(mut dead) = child_slot.take() {
                    let _ = dead.child.kill().await;
                }
                return Err(failure.error);
            }
        };
        drop(child_slot);

        let model = self.config.model.clone();
        self.finish_call("chat", &model, outcome).await
    }

    /// Compress the persistent session: ask it for a summary (60 s cap),
    /// terminate the process, and seed the replacement from the summary.
    /// Returns whether a summary was captured; the reset happens regardless.
    pub async fn compress(&self) -> bool {
        let _guard = self.call_lock.lock().await;

        let summary = self.try_summarise().await;
        if let Some(mut dead) = self.child.lock().await.take() {
            let _ = dead.child.kill().await;
        }
        let captured = summary.is_some();
        let mut session = self.session.lock().await;
        session.reset_with_summary(summary).await;
        self.tokens.store(0, Ordering::Relaxed);
        info!(captured, "session compressed");
        captured
    }

    /// Discard the session entirely — no summary carries over. Used by the
    /// explicit "new conversation" verb.
    pub async fn reset_session(&self) {
        let _guard = self.call_lock.lock().await;
        if let Some(mut dead) = self.child.lock().await.take() {
            let _ = dead.child.kill().await;
        }
        self.session.lock().await.reset_with_summary(None).await;
        self.tokens.store(0, Ordering::Relaxed);
    }

    async fn try_summarise(&self) -> Option<String> {
        let mut child_slot = self.child.lock().await;
        let active = child_slot.as_mut()?;

        if write_user_message(&mut active.stdin, SUMMARY_PROMPT).await.is_err() {
            return None;
        }
        let outcome = stream_events(
            &mut active.reader,
            &Callbacks::default(),
            None,
            Duration::from_secs(self.config.compress_timeout_secs),
            Duration::from_secs(self.config.compress_timeout_secs),
        )
        .await;

        match outcome {
            Ok(outcome) if !outcome.result.is_error && !outcome.text.trim().is_empty() => {
                Some(outcome.text)
            }
            Ok(_) => None,
            Err(failure) => {
                debug!(err = %failure.error, "summary call failed — resetting without one");
                None
            }
        }
    }

    // ── One-shot mode ─────────────────────────────────────────────────────────

    /// Spawn a fresh subprocess for one call, with retries while nothing has
    /// been forwarded to the text callback. Permanent model errors are never
    /// retried.
    pub async fn one_shot(
        &self,
        prompt: &str,
        opts: &OneShotOptions,
        callbacks: &Callbacks,
        abort: Option<AbortSignal>,
    ) -> Result<LlmReply, LlmError> {
        self.archive.save(&opts.source, prompt).await;

        let mut attempt = 0u32;
        loop {
            match self.one_shot_once(prompt, opts, callbacks, abort.clone()).await {
                Ok(reply) => return Ok(reply),
                Err((err, forwarded)) => {
                    let retryable =
                        err.is_transient() && !forwarded && attempt + 1 < self.config.max_retries;
                    if !retryable {
                        return Err(err);
                    }
                    attempt += 1;
                    let backoff = Duration::from_secs(1 << attempt.min(4));
                    warn!(%err, attempt, ?backoff, "transient LLM failure — retrying");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    async fn one_shot_once(
        &self,
        prompt: &str,
        opts: &OneShotOptions,
        callbacks: &Callbacks,
        abort: Option<AbortSignal>,
    ) -> Result<LlmReply, (LlmError, bool)> {
        let args = self.build_args(opts.model.as_deref(), opts.session_id.as_deref(), None);
        let mut spawned = self.spawn(&args).map_err(|e| (e, false))?;

        if let Err(err) = write_user_message(&mut spawned.stdin, prompt).await {
            let _ = spawned.child.kill().await;
            return Err((err.into(), false));
        }
        // Closing stdin tells the CLI this is the only turn.
        drop(spawned.stdin);

        let outcome = stream_events(
            &mut spawned.reader,
            callbacks,
            abort,
            Duration::from_secs(self.config.timeout_secs),
            Duration::from_secs(self.config.inactivity_secs),
        )
        .await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(failure) => {
                let _ = spawned.child.kill().await;
                return Err((failure.error, failure.deltas_forwarded));
            }
        };
        let _ = spawned.child.wait().await;

        let forwarded = outcome.deltas_forwarded;
        let model = opts.model.clone().unwrap_or_else(|| self.config.model.clone());
        self.finish_one_shot(&opts.source, &model, outcome)
            .await
            .map_err(|e| (e, forwarded))
    }

    // ── Shared internals ──────────────────────────────────────────────────────

    fn build_args(
        &self,
        model: Option<&str>,
        resume: Option<&str>,
        system_seed: Option<&str>,
    ) -> Vec<String> {
        let mut args = self.config.base_args.clone();
        args.push("--input-format".to_string());
        args.push("stream-json".to_string());
        let model = model.filter(|m| !m.is_empty()).or(if self.config.model.is_empty() {
            None
        } else {
            Some(self.config.model.as_str())
        });
        if let Some(model) = model {
            args.push("--model".to_string());
            args.push(model.to_string());
        }
        if let Some(id) = resume {
            args.push("--resume".to_string());
            args.push(id.to_string());
        }
        if let Some(seed) = system_seed {
            args.push("--append-system-prompt".to_string());
            args.push(format!("Context carried over from the previous session:\n{seed}"));
        }
        args
    }

    fn spawn(&self, args: &[String]) -> Result<PersistentChild, LlmError> {
        debug!(command = %self.config.command, ?args, "spawning LLM CLI");
        let mut child = Command::new(&self.config.command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(LlmError::Spawn)?;

        let stdin = child.stdin.take().ok_or(LlmError::Truncated)?;
        let stdout = child.stdout.take().ok_or(LlmError::Truncated)?;
        Ok(PersistentChild {
            child,
            stdin,
            reader: BufReader::new(stdout).lines(),
        })
    }

    async fn finish_call(
        &self,
        source: &str,
        model: &str,
        outcome: CallOutcome,
    ) -> Result<LlmReply, LlmError> {
        if outcome.result.is_error {
            let msg = outcome
                .result
                .result
                .clone()
                .unwrap_or_else(|| "unspecified model error".to_string());
            return Err(LlmError::Permanent(msg));
        }

        {
            let mut session = self.session.lock().await;
            session
                .note_usage(outcome.result.session_id.as_deref(), &outcome.result.usage)
                .await;
            self.tokens.store(session.tokens(), Ordering::Relaxed);
        }
        self.push_cost(source, model, &outcome.result);
        Ok(reply_from(outcome))
    }

    async fn finish_one_shot(
        &self,
        source: &str,
        model: &str,
        outcome: CallOutcome,
    ) -> Result<LlmReply, LlmError> {
        if outcome.result.is_error {
            let msg = outcome
                .result
                .result
                .clone()
                .unwrap_or_else(|| "unspecified model error".to_string());
            return Err(LlmError::Permanent(msg));
        }
        self.push_cost(source, model, &outcome.result);
        Ok(reply_from(outcome))
    }

    fn push_cost(&self, source: &str, model: &str, result: &ResultEvent) {
        let row = CostRow {
            ts: chrono::Utc::now(),
            source: source.to_string(),
            model: model.to_string(),
            input_tokens: result.usage.input_tokens,
            output_tokens: result.usage.output_tokens,
            cost_usd: result.total_cost_usd,
            duration_ms: result.duration_ms,
        };
        let to_flush = {
            let mut costs = self.costs.lock().unwrap_or_else(|p| p.into_inner());
            costs.push(row);
            if costs.len() >= COST_FLUSH_THRESHOLD {
                std::mem::take(&mut *costs)
            } else {
                Vec::new()
            }
        };
        if !to_flush.is_empty() {
            if let Err(err) = self.db.insert_costs(&to_flush) {
                warn!(%err, "cost batch insert failed");
            }
        }
    }

    /// Flush buffered cost rows; called during shutdown.
    pub fn flush_costs(&self) {
        let to_flush = {
            let mut costs = self.costs.lock().unwrap_or_else(|p| p.into_inner());
            std::mem::take(&mut *costs)
        };
        if !to_flush.is_empty() {
            if let Err(err) = self.db.insert_costs(&to_flush) {
                warn!(%err, "final cost flush failed");
            }
        }
    }

    /// Terminate the persistent subprocess without resetting session state.
    pub async fn close(&self) {
        if let Some(mut dead) = self.child.lock().await.take() {
            let _ = dead.child.kill().await;
        }
        self.flush_costs();
    }
}

fn reply_from(outcome: CallOutcome) -> LlmReply {
    LlmReply {
        text: outcome.text,
        session_id: outcome.result.session_id,
        usage: outcome.result.usage,
        cost_usd: outcome.result.total_cost_usd,
        duration_ms: outcome.result.duration_ms,
        api_duration_ms: outcome.result.duration_api_ms,
        tool_uses: outcome.tool_uses,
    }
}

fn looks_like_resume_failure(msg: &str) -> bool {
    let lower = msg.to_ascii_lowercase();
    lower.contains("no conversation") || lower.contains("resume") || lower.contains("unknown session")
}

async fn write_user_message(stdin: &mut ChildStdin, prompt: &str) -> std::io::Result<()> {
    let line = serde_json::json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": [{ "type": "text", "text": prompt }],
        },
    });
    stdin.write_all(line.to_string().as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

/// Drive the stream until the terminal `result` event.
///
/// EOF before a `result` means the stream was truncated. The assistant
/// messages are the canonical reply text; accumulated deltas are the
/// fallback when the CLI emits deltas only.
async fn stream_events(
    reader: &mut tokio::io::Lines<BufReader<ChildStdout>>,
    callbacks: &Callbacks,
    abort: Option<AbortSignal>,
    absolute: Duration,
    inactivity: Duration,
) -> Result<CallOutcome, StreamFailure> {
    let deadline = tokio::time::Instant::now() + absolute;
    let mut abort = abort;
    let mut delta_text = String::new();
    let mut assistant_text = String::new();
    let mut tool_uses = Vec::new();
    let mut deltas_forwarded = false;

    let fail = |error: LlmError, deltas_forwarded: bool| StreamFailure { error, deltas_forwarded };

    loop {
        let line = tokio::select! {
            read = tokio::time::timeout(inactivity, reader.next_line()) => match read {
                Err(_) => return Err(fail(LlmError::Inactive(inactivity.as_secs()), deltas_forwarded)),
                Ok(Err(err)) => return Err(fail(err.into(), deltas_forwarded)),
                Ok(Ok(None)) => return Err(fail(LlmError::Truncated, deltas_forwarded)),
                Ok(Ok(Some(line))) => line,
            },
            _ = aborted(&mut abort) => return Err(fail(LlmError::Aborted, deltas_forwarded)),
            _ = tokio::time::sleep_until(deadline) => {
                return Err(fail(LlmError::Timeout(absolute.as_secs()), deltas_forwarded));
            }
        };

        if line.trim().is_empty() {
            continue;
        }
        let event: StreamEvent = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(err) => {
                debug!(%err, "unparseable stream line skipped");
                continue;
            }
        };

        match event {
            StreamEvent::ContentBlockDelta { delta: Delta::TextDelta { text } } => {
                delta_text.push_str(&text);
                if let Some(tx) = &callbacks.on_text {
                    deltas_forwarded = true;
                    let _ = tx.send(text).await;
                }
            }
            StreamEvent::ContentBlockDelta { .. } => {}
            StreamEvent::ContentBlockStart { content_block } => {
                if let ContentBlock::ToolUse { name, .. } = content_block {
                    if let Some(tx) = &callbacks.on_tool_use {
                        let _ = tx.send(name).await;
                    }
                }
            }
            StreamEvent::Assistant { message } => {
                let text = message.text();
                if !text.is_empty() {
                    if !assistant_text.is_empty() {
                        assistant_text.push('\n');
                    }
                    assistant_text.push_str(&text);
                }
                tool_uses.extend(message.tool_uses());
            }
            StreamEvent::Result(result) => {
                let text = if assistant_text.is_empty() { delta_text } else { assistant_text };
                return Ok(CallOutcome { text, result, tool_uses, deltas_forwarded });
            }
            StreamEvent::Other => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    /// Write an executable script that plays the role of the LLM CLI.
    fn fake_cli(dir: &Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-cli.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().to_string()
    }

    fn adapter_for(dir: &Path, command: String, max_retries: u32) -> CliAdapter {
        let config = LlmConfig {
            command,
            base_args: vec![],
            model: "test-model".to_string(),
            timeout_secs: 5,
            inactivity_secs: 2,
            compress_timeout_secs: 2,
            max_retries,
            session_token_ceiling: 1000,
        };
        CliAdapter::new(
            config,
            dir.join("session.json"),
            PromptArchive::new(dir.join("prompts")),
            Arc::new(Db::open_in_memory().unwrap()),
        )
    }

    const HAPPY_SCRIPT: &str = r#"
cat > /dev/null &
echo '{"type":"content_block_delta","delta":{"type":"text_delta","text":"Hello "}}'
echo '{"type":"content_block_delta","delta":{"type":"text_delta","text":"there"}}'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"Hello there"}]}}'
echo '{"type":"result","is_error":false,"session_id":"sess-1","duration_ms":10,"duration_api_ms":8,"total_cost_usd":0.001,"usage":{"input_tokens":12,"output_tokens":3,"cache_read_input_tokens":0}}'
"#;

    #[tokio::test]
    async fn one_shot_happy_path_returns_text_and_usage() {
        let dir = tempfile::tempdir().unwrap();
        let cli = fake_cli(dir.path(), HAPPY_SCRIPT);
        let adapter = adapter_for(dir.path(), cli, 1);

        let (tx, mut rx) = mpsc::channel(16);
        let callbacks = Callbacks { on_text: Some(tx), on_tool_use: None };
        let reply = adapter
            .one_shot(
                "hi",
                &OneShotOptions { source: "chat".to_string(), ..Default::default() },
                &callbacks,
                None,
            )
            .await
            .unwrap();

        assert_eq!(reply.text, "Hello there");
        assert_eq!(reply.session_id.as_deref(), Some("sess-1"));
        assert_eq!(reply.usage.input_tokens, 12);

        let mut streamed = String::new();
        while let Ok(chunk) = rx.try_recv() {
            streamed.push_str(&chunk);
        }
        assert_eq!(streamed, "Hello there");
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("attempts");
        let script = format!(
            r#"echo run >> {}
cat > /dev/null &
echo '{{"type":"result","is_error":true,"result":"billing hard stop","usage":{{}}}}'"#,
            marker.display()
        );
        let cli = fake_cli(dir.path(), &script);
        let adapter = adapter_for(dir.path(), cli, 3);

        let err = adapter
            .one_shot("hi", &OneShotOptions::default(), &Callbacks::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Permanent(msg) if msg.contains("billing")));

        let attempts = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(attempts.lines().count(), 1, "permanent errors must not retry");
    }

    #[tokio::test]
    async fn truncated_stream_is_retried_then_fails() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("attempts");
        let script = format!(
            r#"echo run >> {}
echo '{{"type":"content_block_start","content_block":{{"type":"text","text":""}}}}'"#,
            marker.display()
        );
        let cli = fake_cli(dir.path(), &script);
        let adapter = adapter_for(dir.path(), cli, 2);

        let err = adapter
            .one_shot("hi", &OneShotOptions::default(), &Callbacks::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Truncated));

        let attempts = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(attempts.lines().count(), 2, "transient errors retry up to max_retries");
    }

    #[tokio::test]
    async fn inactivity_watchdog_fires() {
        let dir = tempfile::tempdir().unwrap();
        let cli = fake_cli(dir.path(), "sleep 30");
        let adapter = adapter_for(dir.path(), cli, 1);

        let start = std::time::Instant::now();
        let err = adapter
            .one_shot("hi", &OneShotOptions::default(), &Callbacks::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Inactive(_)));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn abort_signal_terminates_the_call() {
        let dir = tempfile::tempdir().unwrap();
        let cli = fake_cli(dir.path(), "sleep 30");
        let adapter = adapter_for(dir.path(), cli, 1);

        let (handle, signal) = AbortHandle::new();
        let abort_task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.abort();
        });

        let err = adapter
            .one_shot("hi", &OneShotOptions::default(), &Callbacks::default(), Some(signal))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Aborted));
        abort_task.await.unwrap();
    }

    #[tokio::test]
    async fn chat_turn_accumulates_session_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let cli = fake_cli(dir.path(), HAPPY_SCRIPT);
        let adapter = adapter_for(dir.path(), cli, 1);

        let reply = adapter.chat_turn("hello", &Callbacks::default(), None).await.unwrap();
        assert_eq!(reply.text, "Hello there");
        assert_eq!(adapter.session_tokens(), 15, "input 12 + output 3");
        adapter.close().await;
    }

    #[tokio::test]
    async fn tool_use_callback_receives_tool_names() {
        let dir = tempfile::tempdir().unwrap();
        let script = r#"
cat > /dev/null &
echo '{"type":"content_block_start","content_block":{"type":"tool_use","name":"Read","input":{}}}'
echo '{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Read","input":{"path":"x"}},{"type":"text","text":"done"}]}}'
echo '{"type":"result","is_error":false,"session_id":"s","usage":{"input_tokens":1,"output_tokens":1}}'
"#;
        let cli = fake_cli(dir.path(), script);
        let adapter = adapter_for(dir.path(), cli, 1);

        let (tx, mut rx) = mpsc::channel(4);
        let callbacks = Callbacks { on_text: None, on_tool_use: Some(tx) };
        let reply = adapter
            .one_shot("hi", &OneShotOptions::default(), &callbacks, None)
            .await
            .unwrap();

        assert_eq!(rx.try_recv().unwrap(), "Read");
        assert_eq!(reply.tool_uses.len(), 1);
        assert_eq!(reply.tool_uses[0].name, "Read");
    }
}
