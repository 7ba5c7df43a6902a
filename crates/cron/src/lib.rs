//! Cron scheduler — time-triggered LLM jobs with overlap protection,
//! quiet-hours delivery policy, persistent run state, and failure alerting.
//!
//! Each enabled job gets its own ticker task that computes the next fire
//! time from its cron expression in its declared timezone, persists
//! `next_run`, sleeps, and fires. Firing is serialised per job by a running
//! set, and every execution flows through the shared work queue so heavy
//! crons never starve interactive chat.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use attache_config::CronConfig;
use attache_llm::{Callbacks, CliAdapter, LlmError, OneShotOptions};
use attache_queue::WorkQueue;
use attache_store::{CronJob, CronState, CronStatus, Db, DeliveryMode, StoreError};

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CronError {
    #[error("invalid cron expression '{0}': {1}")]
    InvalidExpression(String, String),

    #[error("unknown timezone '{0}'")]
    InvalidTimezone(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

// ── Delivery contract ─────────────────────────────────────────────────────────

/// How cron results reach the outside world. Injected by the runtime so the
/// scheduler never imports upward.
#[async_trait]
pub trait CronDelivery: Send + Sync {
    /// Deliver a job's reply to the user channel.
    async fn deliver(&self, job_name: &str, text: &str);
    /// Raise an out-of-band alert (failures, silent-job errors).
    async fn alert(&self, message: &str);
}

// ── Schedule helpers ──────────────────────────────────────────────────────────

/// Parse a classic five-field expression. The `cron` crate wants a seconds
/// field, so a `0` is prepended; six- and seven-field forms pass through for
/// operators who know what they are doing.
pub fn parse_schedule(expr: &str) -> Result<cron::Schedule, CronError> {
    let fields = expr.split_whitespace().count();
    let normalised = if fields == 5 { format!("0 {expr}") } else { expr.to_string() };
    cron::Schedule::from_str(&normalised)
        .map_err(|e| CronError::InvalidExpression(expr.to_string(), e.to_string()))
}

/// Next fire time for `expr` in `tz`, as UTC.
pub fn next_run(expr: &str, tz: Tz) -> Result<Option<DateTime<Utc>>, CronError> {
    let schedule = parse_schedule(expr)?;
    Ok(schedule.upcoming(tz).next().map(|t| t.with_timezone(&Utc)))
}

/// Returns `true` when `now` falls within the `[start_hour, end_hour)`
/// window expressed in the given timezone. Handles midnight wrap
/// (e.g. 23..7 spans midnight).
pub fn is_in_window(now: DateTime<Utc>, tz: Tz, start_hour: u32, end_hour: u32) -> bool {
    let hour = now.with_timezone(&tz).hour();
    if start_hour <= end_hour {
        hour >= start_hour && hour < end_hour
    } else {
        hour >= start_hour || hour < end_hour
    }
}

// ── Scheduler ─────────────────────────────────────────────────────────────────

pub struct CronScheduler {
    db: Arc<Db>,
    queue: WorkQueue,
    adapter: Arc<CliAdapter>,
    delivery: Arc<dyn CronDelivery>,
    config: CronConfig,
    default_tz: Tz,
    /// Ticker shutdown senders, one per scheduled job.
    tickers: Mutex<HashMap<Uuid, watch::Sender<bool>>>,
    /// Overlap protection: job ids currently executing.
    running: Mutex<HashSet<Uuid>>,
}

impl CronScheduler {
    pub fn new(
        db: Arc<Db>,
        queue: WorkQueue,
        adapter: Arc<CliAdapter>,
        delivery: Arc<dyn CronDelivery>,
        config: CronConfig,
    ) -> Result<Arc<Self>, CronError> {
        let default_tz: Tz = config
            .timezone
            .parse()
            .map_err(|_| CronError::InvalidTimezone(config.timezone.clone()))?;
        Ok(Arc::new(Self {
            db,
            queue,
            adapter,
            delivery,
            config,
            default_tz,
            tickers: Mutex::new(HashMap::new()),
            running: Mutex::new(HashSet::new()),
        }))
    }

    fn job_tz(&self, job: &CronJob) -> Tz {
        if job.timezone.is_empty() {
            self.default_tz
        } else {
            job.timezone.parse().unwrap_or(self.default_tz)
        }
    }

    /// Schedule tickers for every enabled persisted job.
    pub async fn start(self: &Arc<Self>) -> Result<(), CronError> {
        let jobs = self.db.list_crons()?;
        info!(count = jobs.len(), "cron scheduler starting");
        for job in jobs {
            // A crash mid-execution leaves `running` behind; demote it.
            if job.state.last_status == CronStatus::Running {
                let mut state = job.state.clone();
                state.last_status = CronStatus::Error("interrupted by restart".to_string());
                let _ = self.db.update_cron_state(job.id, &state);
            }
            if job.enabled {
                self.spawn_ticker(job.id).await;
            }
        }
        Ok(())
    }

    pub async fn shutdown(&self) {
        let mut tickers = self.tickers.lock().await;
        for (_, stop) in tickers.drain() {
            let _ = stop.send(true);
        }
    }

    // ── CRUD (no restart required) ────────────────────────────────────────────

    pub async fn add_job(
        self: &Arc<Self>,
        name: &str,
        schedule: &str,
        prompt: &str,
        delivery: DeliveryMode,
        model: Option<String>,
        timezone: Option<String>,
    ) -> Result<CronJob, CronError> {
        parse_schedule(schedule)?;
        if let Some(tz) = &timezone {
            let _: Tz = tz.parse().map_err(|_| CronError::InvalidTimezone(tz.clone()))?;
        }

        let mut job = CronJob::new(name, schedule, prompt);
        job.delivery = delivery;
        job.model = model;
        job.timezone = timezone.unwrap_or_default();
        job.state.next_run = next_run(schedule, self.job_tz(&job))?;

        self.db.insert_cron(&job)?;
        self.spawn_ticker(job.id).await;
        info!(name = %job.name, schedule = %job.schedule, "cron added");
        Ok(job)
    }

    /// Remove both the schedule binding and the persisted row.
    pub async fn remove_job(&self, id_or_name: &str) -> Result<CronJob, CronError> {
        let job = self.db.find_cron(id_or_name)?;
        if let Some(stop) = self.tickers.lock().await.remove(&job.id) {
            let _ = stop.send(true);
        }
        self.db.delete_cron(job.id)?;
        info!(name = %job.name, "cron removed");
        Ok(job)
    }

    /// Flip enabled. Disabling stops the ticker and nulls `next_run`.
    pub async fn toggle_job(self: &Arc<Self>, id_or_name: &str) -> Result<CronJob, CronError> {
        let mut job = self.db.find_cron(id_or_name)?;
        job.enabled = !job.enabled;
        self.db.set_cron_enabled(job.id, job.enabled)?;

        if job.enabled {
            job.state.next_run = next_run(&job.schedule, self.job_tz(&job))?;
            self.db.update_cron_state(job.id, &job.state)?;
            self.spawn_ticker(job.id).await;
        } else {
            if let Some(stop) = self.tickers.lock().await.remove(&job.id) {
                let _ = stop.send(true);
            }
            job.state.next_run = None;
            self.db.update_cron_state(job.id, &job.state)?;
        }
        info!(name = %job.name, enabled = job.enabled, "cron toggled");
        Ok(job)
    }

    /// One-off fire outside the schedule.
    pub async fn run_now(self: &Arc<Self>, id_or_name: &str) -> Result<(), CronError> {
        let job = self.db.find_cron(id_or_name)?;
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.fire(job.id).await });
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<CronJob>, CronError> {
        Ok(self.db.list_crons()?)
    }

    // ── Execution ─────────────────────────────────────────────────────────────

    async fn spawn_ticker(self: &Arc<Self>, id: Uuid) {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let mut tickers = self.tickers.lock().await;
        if let Some(old) = tickers.insert(id, stop_tx) {
            let _ = old.send(true);
        }
        drop(tickers);

        let scheduler = self.clone();
        tokio::spawn(async move {
            loop {
                let Ok(job) = scheduler.db.find_cron(&id.to_string()) else {
                    break; // deleted
                };
                if !job.enabled {
                    break;
                }
                let tz = scheduler.job_tz(&job);
                let Ok(Some(next)) = next_run(&job.schedule, tz) else {
                    warn!(name = %job.name, "schedule yields no future fire time — ticker stopping");
                    break;
                };
                let mut state = job.state.clone();
                state.next_run = Some(next);
                let _ = scheduler.db.update_cron_state(id, &state);

                let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                scheduler.fire(id).await;
            }
            debug!(%id, "cron ticker exited");
        });
    }

    /// Execute one job now. Public mainly for tests; normal entry is the
    /// ticker or `run_now`.
    pub async fn fire(self: &Arc<Self>, id: Uuid) {
        // Overlap protection.
        {
            let mut running = self.running.lock().await;
            if !running.insert(id) {
                info!(%id, "cron already running — tick skipped");
                return;
            }
        }
        let result = self.fire_locked(id).await;
        self.running.lock().await.remove(&id);
        if let Err(err) = result {
            warn!(%id, %err, "cron execution bookkeeping failed");
        }
    }

    async fn fire_locked(self: &Arc<Self>, id: Uuid) -> Result<(), CronError> {
        let job = self.db.find_cron(&id.to_string())?;
        let started = Utc::now();

        let mut state = job.state.clone();
        state.last_run = Some(started);
        state.last_status = CronStatus::Running;
        self.db.update_cron_state(id, &state)?;

        // Cooperative cap-sharing with chat.
        let key = format!("cron:{id}");
        let permit = match self.queue.acquire_slot(&key).await {
            Ok(permit) => permit,
            Err(err) => {
                state.last_status = CronStatus::Error(err.to_string());
                state.consecutive_errors += 1;
                self.db.update_cron_state(id, &state)?;
                return Ok(());
            }
        };

        let opts = OneShotOptions {
            session_id: job.session_id.clone(),
            model: job.model.clone(),
            source: key.clone(),
        };
        let outcome = self
            .adapter
            .one_shot(&job.prompt, &opts, &Callbacks::default(), None)
            .await;
        drop(permit);

        let duration_ms = (Utc::now() - started).num_milliseconds();
        state.last_duration_ms = Some(duration_ms);

        match outcome {
            Ok(reply) => {
                state.last_status = CronStatus::Ok;
                state.consecutive_errors = 0;
                self.db.update_cron_state(id, &state)?;

                // Each cron accumulates its own session continuity.
                if let Some(session_id) = &reply.session_id {
                    if job.session_id.as_deref() != Some(session_id) {
                        self.db.set_cron_session(id, session_id)?;
                    }
                }

                let quiet = is_in_window(
                    Utc::now(),
                    self.job_tz(&job),
                    self.config.quiet_start_hour as u32,
                    self.config.quiet_end_hour as u32,
                );
                if job.delivery == DeliveryMode::Announce && !quiet {
                    self.delivery.deliver(&job.name, &reply.text).await;
                } else {
                    debug!(name = %job.name, quiet, delivery = ?job.delivery, "cron reply suppressed");
                }
            }
            Err(err) => {
                let message = describe_error(&err);
                state.last_status = CronStatus::Error(message.clone());
                state.consecutive_errors += 1;
                self.db.update_cron_state(id, &state)?;
                let _ = self.db.log_error(&key, &message);
                warn!(name = %job.name, consecutive = state.consecutive_errors, %message, "cron failed");

                // Silent jobs surface their very first failure; everything
                // alerts after the configured streak.
                let first_silent_failure =
                    job.delivery == DeliveryMode::Silent && state.consecutive_errors == 1;
                if state.consecutive_errors >= self.config.alert_after_errors || first_silent_failure {
                    self.delivery
                        .alert(&format!(
                            "cron '{}' failed {} time(s) in a row: {}",
                            job.name, state.consecutive_errors, message
                        ))
                        .await;
                }
            }
        }
        Ok(())
    }
}

fn describe_error(err: &LlmError) -> String {
    match err {
        LlmError::Permanent(msg) => msg.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attache_config::LlmConfig;
    use attache_store::PromptArchive;
    use std::path::Path;
    use std::sync::Mutex as StdMutex;

    // ── Pure helpers ──────────────────────────────────────────────────────────

    #[test]
    fn five_field_expression_is_accepted() {
        assert!(parse_schedule("*/5 * * * *").is_ok());
        assert!(parse_schedule("0 9 * * 1-5").is_ok());
    }

    #[test]
    fn invalid_expression_fails_validation() {
        assert!(matches!(
            parse_schedule("every tuesday"),
            Err(CronError::InvalidExpression(..))
        ));
        assert!(parse_schedule("61 * * * *").is_err());
    }

    #[test]
    fn next_run_is_in_the_future() {
        let next = next_run("*/1 * * * *", chrono_tz::UTC).unwrap().unwrap();
        assert!(next > Utc::now());
        assert!(next <= Utc::now() + chrono::Duration::seconds(61));
    }

    #[test]
    fn quiet_window_handles_midnight_wrap() {
        let tz = chrono_tz::UTC;
        let at = |h: u32| Utc::now().date_naive().and_hms_opt(h, 30, 0).unwrap().and_utc();
        // Window 23..7 wraps midnight.
        assert!(is_in_window(at(23), tz, 23, 7));
        assert!(is_in_window(at(2), tz, 23, 7));
        assert!(!is_in_window(at(12), tz, 23, 7));
        // Plain window 9..17.
        assert!(is_in_window(at(9), tz, 9, 17));
        assert!(!is_in_window(at(17), tz, 9, 17));
    }

    // ── Execution tests against a scripted CLI ────────────────────────────────

    #[derive(Default)]
    struct RecordingDelivery {
        delivered: StdMutex<Vec<(String, String)>>,
        alerts: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl CronDelivery for RecordingDelivery {
        async fn deliver(&self, job_name: &str, text: &str) {
            self.delivered
                .lock()
                .unwrap()
                .push((job_name.to_string(), text.to_string()));
        }
        async fn alert(&self, message: &str) {
            self.alerts.lock().unwrap().push(message.to_string());
        }
    }

    fn fake_cli(dir: &Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-cli.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().to_string()
    }

    const OK_SCRIPT: &str = r#"
cat > /dev/null &
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"morning brief ready"}]}}'
echo '{"type":"result","is_error":false,"session_id":"cron-sess","usage":{"input_tokens":5,"output_tokens":5}}'
"#;

    const FAIL_SCRIPT: &str = r#"
cat > /dev/null &
echo '{"type":"result","is_error":true,"result":"model exploded","usage":{}}'
"#;

    struct Fixture {
        scheduler: Arc<CronScheduler>,
        delivery: Arc<RecordingDelivery>,
        db: Arc<Db>,
        _dir: tempfile::TempDir,
    }

    fn fixture(script: &str, quiet_all_day: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let cli = fake_cli(dir.path(), script);
        let db = Arc::new(Db::open_in_memory().unwrap());
        let llm_config = LlmConfig {
            command: cli,
            base_args: vec![],
            model: String::new(),
            timeout_secs: 5,
            inactivity_secs: 2,
            compress_timeout_secs: 2,
            max_retries: 1,
            session_token_ceiling: 1000,
        };
        let adapter = Arc::new(CliAdapter::new(
            llm_config,
            dir.path().join("session.json"),
            PromptArchive::new(dir.path().join("prompts")),
            db.clone(),
        ));
        let delivery = Arc::new(RecordingDelivery::default());
        let config = CronConfig {
            timezone: "UTC".to_string(),
            // quiet 0..0 = never quiet; 0..24 = always quiet.
            quiet_start_hour: 0,
            quiet_end_hour: if quiet_all_day { 24 } else { 0 },
            alert_after_errors: 3,
        };
        let scheduler = CronScheduler::new(
            db.clone(),
            WorkQueue::new(2, 4),
            adapter,
            delivery.clone(),
            config,
        )
        .unwrap();
        Fixture { scheduler, delivery, db, _dir: dir }
    }

    #[tokio::test]
    async fn happy_path_updates_state_and_delivers() {
        let f = fixture(OK_SCRIPT, false);
        let job = f
            .scheduler
            .add_job("hello", "*/1 * * * *", "Say hi", DeliveryMode::Announce, None, None)
            .await
            .unwrap();
        assert!(job.state.next_run.is_some());

        f.scheduler.fire(job.id).await;

        let after = f.db.find_cron("hello").unwrap();
        assert_eq!(after.state.last_status, CronStatus::Ok);
        assert_eq!(after.state.consecutive_errors, 0);
        assert!(after.state.last_run.is_some());
        assert_eq!(after.session_id.as_deref(), Some("cron-sess"));

        let delivered = f.delivery.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].1, "morning brief ready");
        f.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn quiet_hours_suppress_delivery_but_run_the_job() {
        let f = fixture(OK_SCRIPT, true);
        let job = f
            .scheduler
            .add_job("night", "*/1 * * * *", "p", DeliveryMode::Announce, None, None)
            .await
            .unwrap();

        f.scheduler.fire(job.id).await;

        let after = f.db.find_cron("night").unwrap();
        assert_eq!(after.state.last_status, CronStatus::Ok, "the LLM call still runs");
        assert!(f.delivery.delivered.lock().unwrap().is_empty(), "no user-visible message");
        f.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn silent_job_never_delivers() {
        let f = fixture(OK_SCRIPT, false);
        let job = f
            .scheduler
            .add_job("quiet-one", "*/1 * * * *", "p", DeliveryMode::Silent, None, None)
            .await
            .unwrap();
        f.scheduler.fire(job.id).await;
        assert!(f.delivery.delivered.lock().unwrap().is_empty());
        f.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn overlap_is_suppressed() {
        let f = fixture(OK_SCRIPT, false);
        let job = f
            .scheduler
            .add_job("overlap", "*/1 * * * *", "p", DeliveryMode::Announce, None, None)
            .await
            .unwrap();

        // Simulate an in-progress execution.
        f.scheduler.running.lock().await.insert(job.id);
        f.scheduler.fire(job.id).await;

        let after = f.db.find_cron("overlap").unwrap();
        assert_eq!(after.state.last_status, CronStatus::Never, "skipped tick must not touch state");
        f.scheduler.running.lock().await.remove(&job.id);
        f.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn errors_accumulate_and_alert_after_three() {
        let f = fixture(FAIL_SCRIPT, false);
        let job = f
            .scheduler
            .add_job("flaky", "*/1 * * * *", "p", DeliveryMode::Announce, None, None)
            .await
            .unwrap();

        for _ in 0..3 {
            f.scheduler.fire(job.id).await;
        }

        let after = f.db.find_cron("flaky").unwrap();
        assert_eq!(after.state.consecutive_errors, 3);
        assert!(matches!(after.state.last_status, CronStatus::Error(_)));
        let alerts = f.delivery.alerts.lock().unwrap();
        assert_eq!(alerts.len(), 1, "alert exactly at the threshold");
        assert!(alerts[0].contains("flaky"));
        f.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn silent_job_alerts_on_first_error() {
        let f = fixture(FAIL_SCRIPT, false);
        let job = f
            .scheduler
            .add_job("silent-flaky", "*/1 * * * *", "p", DeliveryMode::Silent, None, None)
            .await
            .unwrap();

        f.scheduler.fire(job.id).await;
        assert_eq!(f.delivery.alerts.lock().unwrap().len(), 1);
        f.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn toggle_disables_and_nulls_next_run() {
        let f = fixture(OK_SCRIPT, false);
        f.scheduler
            .add_job("t", "*/1 * * * *", "p", DeliveryMode::Announce, None, None)
            .await
            .unwrap();

        let toggled = f.scheduler.toggle_job("t").await.unwrap();
        assert!(!toggled.enabled);
        assert!(toggled.state.next_run.is_none());

        let again = f.scheduler.toggle_job("t").await.unwrap();
        assert!(again.enabled);
        assert!(again.state.next_run.is_some());
        f.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn add_rejects_invalid_schedule() {
        let f = fixture(OK_SCRIPT, false);
        let err = f
            .scheduler
            .add_job("bad", "not a cron", "p", DeliveryMode::Announce, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CronError::InvalidExpression(..)));
        assert!(f.db.list_crons().unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_deletes_persisted_row() {
        let f = fixture(OK_SCRIPT, false);
        f.scheduler
            .add_job("gone", "*/1 * * * *", "p", DeliveryMode::Announce, None, None)
            .await
            .unwrap();
        f.scheduler.remove_job("gone").await.unwrap();
        assert!(f.db.list_crons().unwrap().is_empty());
        f.scheduler.shutdown().await;
    }
}
