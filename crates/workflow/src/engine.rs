//! Event-driven DAG execution.
//!
//! There is no polling loop: advancement happens on creation and after every
//! step termination. Eligible steps are marked `running`, persisted, and
//! spawned; LLM and tool steps go through the shared work queue (key
//! `wf:<id>`), while the control steps — `wait_input`, `conditional`,
//! `delay` — run inline so a day-long pause can never pin a queue slot.
//!
//! The workflow file is fully rewritten via atomic replace on every state
//! transition, which is what makes crash-safe resumption possible: on
//! startup, `running` steps of a `running` workflow are demoted to `pending`
//! and the DAG is re-advanced.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::{Mutex, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use attache_config::WorkflowConfig;
use attache_llm::{AbortHandle, AbortSignal, Callbacks, CliAdapter, OneShotOptions};
use attache_queue::WorkQueue;
use attache_store::{Db, atomic_write_json};

use crate::condition;
use crate::model::{GraphError, Step, StepConfig, StepStatus, Workflow, WorkflowStatus};

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("workflow not found: {0}")]
    NotFound(String),

    #[error("workflow '{0}' is {1:?} and cannot {2}")]
    WrongState(String, WorkflowStatus, &'static str),
}

/// Outward-facing notifications, injected by the runtime.
#[async_trait]
pub trait WorkflowNotify: Send + Sync {
    /// A `wait_input` step wants an answer from the user.
    async fn ask_user(&self, workflow_name: &str, question: &str);
    /// Operator-attention events: stalls, overdue workflows.
    async fn workflow_event(&self, message: &str);
    /// A workflow reached a new status (dashboard push, no chat traffic).
    async fn transitioned(&self, id: Uuid, name: &str, status: WorkflowStatus) {
        let _ = (id, name, status);
    }
}

enum StepOutcome {
    Done { result: Value, cost_usd: f64, skips: Vec<String> },
    Failed { message: String },
    /// The workflow was cancelled under the step; drop everything.
    Evicted,
}

pub struct WorkflowEngine {
    dir: PathBuf,
    db: Arc<Db>,
    queue: WorkQueue,
    adapter: Arc<CliAdapter>,
    notify: Arc<dyn WorkflowNotify>,
    config: WorkflowConfig,
    workflows: Mutex<HashMap<Uuid, Workflow>>,
    /// FIFO of `(workflow, step)` waiting for user input.
    pending_inputs: Mutex<VecDeque<(Uuid, String)>>,
    /// Live waiters for `wait_input` steps. `None` payload = timeout.
    input_waiters: Mutex<HashMap<(Uuid, String), oneshot::Sender<Option<String>>>>,
    /// Abort handle per workflow, fired on cancel.
    aborts: Mutex<HashMap<Uuid, (AbortHandle, AbortSignal)>>,
}

impl WorkflowEngine {
    pub fn new(
        dir: PathBuf,
        db: Arc<Db>,
        queue: WorkQueue,
        adapter: Arc<CliAdapter>,
        notify: Arc<dyn WorkflowNotify>,
        config: WorkflowConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            dir,
            db,
            queue,
            adapter,
            notify,
            config,
            workflows: Mutex::new(HashMap::new()),
            pending_inputs: Mutex::new(VecDeque::new()),
            input_waiters: Mutex::new(HashMap::new()),
            aborts: Mutex::new(HashMap::new()),
        })
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Load persisted workflows and resume the interrupted ones.
    pub async fn load_persisted(self: &Arc<Self>) {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return;
        };
        let mut resumed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let workflow: Workflow = match attache_store::read_json(&path) {
                Ok(Some(workflow)) => workflow,
                Ok(None) => continue,
                Err(err) => {
                    warn!(path = %path.display(), %err, "unreadable workflow file skipped");
                    continue;
                }
            };
            if workflow.status.is_terminal() {
                continue;
            }

            let id = workflow.id;
            self.workflows.lock().await.insert(id, workflow);
            {
                // Steps that were mid-flight when the process died were
                // interrupted; demote and re-drive. Paused workflows re-ask
                // their question and pause again.
                let mut workflows = self.workflows.lock().await;
                if let Some(workflow) = workflows.get_mut(&id) {
                    for step in &mut workflow.steps {
                        if step.status == StepStatus::Running {
                            step.status = StepStatus::Pending;
                            step.started_at = None;
                        }
                    }
                    if workflow.status == WorkflowStatus::Paused {
                        workflow.status = WorkflowStatus::Running;
                    }
                    self.persist(workflow).await;
                }
            }
            resumed += 1;
            self.advance(id).await;
        }
        if resumed > 0 {
            info!(resumed, "workflows resumed after restart");
        }
    }

    pub async fn create(
        self: &Arc<Self>,
        name: &str,
        steps: Vec<Step>,
        max_duration_secs: Option<u64>,
    ) -> Result<Uuid, WorkflowError> {
        let mut workflow = Workflow::new(name, steps);
        workflow.max_duration_secs = max_duration_secs;
        workflow.validate()?;

        let id = workflow.id;
        self.persist(&workflow).await;
        self.workflows.lock().await.insert(id, workflow);
        info!(%id, name, "workflow created");
        self.advance(id).await;
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Option<Workflow> {
        self.workflows.lock().await.get(&id).cloned()
    }

    pub async fn list(&self) -> Vec<Workflow> {
        let mut all: Vec<Workflow> = self.workflows.lock().await.values().cloned().collect();
        all.sort_by_key(|w| w.created_at);
        all
    }

    pub async fn find_by_name_prefix(&self, prefix: &str) -> Option<Workflow> {
        let prefix = prefix.to_lowercase();
        self.workflows
            .lock()
            .await
            .values()
            .find(|w| w.name.to_lowercase().starts_with(&prefix))
            .cloned()
    }

    /// Pause: stops further advancement; in-flight steps finish. No-op when
    /// already paused.
    pub async fn pause(&self, id: Uuid) -> Result<(), WorkflowError> {
        let mut workflows = self.workflows.lock().await;
        let workflow = workflows
            .get_mut(&id)
            .ok_or_else(|| WorkflowError::NotFound(id.to_string()))?;
        match workflow.status {
            WorkflowStatus::Paused => Ok(()),
            WorkflowStatus::Running | WorkflowStatus::Pending => {
                workflow.status = WorkflowStatus::Paused;
                self.persist(workflow).await;
                Ok(())
            }
            status => Err(WorkflowError::WrongState(workflow.name.clone(), status, "pause")),
        }
    }

    pub async fn resume(self: &Arc<Self>, id: Uuid) -> Result<(), WorkflowError> {
        {
            let mut workflows = self.workflows.lock().await;
            let workflow = workflows
                .get_mut(&id)
                .ok_or_else(|| WorkflowError::NotFound(id.to_string()))?;
            match workflow.status {
                WorkflowStatus::Paused => {
                    workflow.status = WorkflowStatus::Running;
                    self.persist(workflow).await;
                }
                WorkflowStatus::Running => return Ok(()),
                status => {
                    return Err(WorkflowError::WrongState(workflow.name.clone(), status, "resume"));
                }
            }
        }
        self.advance(id).await;
        Ok(())
    }

    /// Cancel: terminal, idempotent, aborts in-flight LLM work and purges
    /// every resource owned by the workflow.
    pub async fn cancel(&self, id: Uuid) -> Result<(), WorkflowError> {
        {
            let mut workflows = self.workflows.lock().await;
            let workflow = workflows
                .get_mut(&id)
                .ok_or_else(|| WorkflowError::NotFound(id.to_string()))?;
            if workflow.status == WorkflowStatus::Cancelled {
                return Ok(());
            }
            if workflow.status.is_terminal() {
                return Err(WorkflowError::WrongState(
                    workflow.name.clone(),
                    workflow.status,
                    "cancel",
                ));
            }
            workflow.status = WorkflowStatus::Cancelled;
            workflow.completed_at = Some(Utc::now());
            self.persist(workflow).await;
            self.notify
                .transitioned(id, &workflow.name, WorkflowStatus::Cancelled)
                .await;
            info!(%id, name = %workflow.name, "workflow cancelled");
        }
        self.evict(id).await;
        Ok(())
    }

    /// Route a user message to the oldest pending `wait_input` step.
    /// Returns `true` when the message was consumed. Entries whose waiter
    /// already expired are discarded and the next one is tried.
    pub async fn fulfill_input(&self, text: &str) -> bool {
        loop {
            let target = self.pending_inputs.lock().await.pop_front();
            let Some((workflow_id, step_id)) = target else {
                return false;
            };
            let waiter = self
                .input_waiters
                .lock()
                .await
                .remove(&(workflow_id, step_id.clone()));
            if let Some(tx) = waiter {
                if tx.send(Some(text.to_string())).is_ok() {
                    return true;
                }
            }
        }
    }

    pub async fn has_pending_input(&self) -> bool {
        !self.pending_inputs.lock().await.is_empty()
    }

    /// Periodic stall detection: long-running steps and overdue workflows
    /// are surfaced for operator attention.
    pub async fn scan_for_stalls(&self) {
        let threshold = chrono::Duration::seconds(self.config.stall_threshold_secs as i64);
        let now = Utc::now();
        let workflows = self.workflows.lock().await;
        for workflow in workflows.values() {
            if workflow.status != WorkflowStatus::Running {
                continue;
            }
            for step in &workflow.steps {
                if step.status == StepStatus::Running {
                    if let Some(started) = step.started_at {
                        if now - started > threshold {
                            self.notify
                                .workflow_event(&format!(
                                    "workflow '{}' step '{}' has been running for {} minutes",
                                    workflow.name,
                                    step.id,
                                    (now - started).num_minutes()
                                ))
                                .await;
                        }
                    }
                }
            }
            let max_duration = workflow
                .max_duration_secs
                .unwrap_or(self.config.max_duration_secs);
            if now - workflow.created_at > chrono::Duration::seconds(max_duration as i64) {
                self.notify
                    .workflow_event(&format!(
                        "workflow '{}' exceeded its max duration and may be stuck",
                        workflow.name
                    ))
                    .await;
            }
        }
    }

    /// Spawn the periodic stall scanner; stops when `shutdown` flips.
    pub fn spawn_stall_scanner(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let engine = self.clone();
        let interval = Duration::from_secs(engine.config.stall_scan_interval_secs.max(1));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => engine.scan_for_stalls().await,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    // ── Advancement ───────────────────────────────────────────────────────────

    /// Start every currently-eligible step. Called on create/start and after
    /// each step terminates — never from a polling loop.
    // Boxed to break the indirect recursion through `complete_step` (which
    // awaits `advance` directly, while `advance` spawns tasks that call
    // `complete_step`): without boxing, rustc's Send auto-trait check on the
    // mutually-referential opaque future types fails to resolve.
    pub fn advance<'a>(
        self: &'a Arc<Self>,
        id: Uuid,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(self.advance_inner(id))
    }

    async fn advance_inner(self: &Arc<Self>, id: Uuid) {
        let to_start: Vec<(String, StepConfig)> = {
            let mut workflows = self.workflows.lock().await;
            let Some(workflow) = workflows.get_mut(&id) else {
                return;
            };
            if workflow.status.is_terminal() || workflow.status == WorkflowStatus::Paused {
                return;
            }
            workflow.status = WorkflowStatus::Running;

            let eligible = workflow.eligible_steps();
            if eligible.is_empty() {
                if !workflow.has_unfinished_steps() {
                    self.finalize(workflow).await;
                    let done = workflow.id;
                    drop(workflows);
                    self.evict(done).await;
                }
                return;
            }

            let now = Utc::now();
            let mut started = Vec::new();
            for step_id in eligible {
                if let Some(step) = workflow.step_mut(&step_id) {
                    step.status = StepStatus::Running;
                    step.started_at = Some(now);
                    started.push((step_id, step.config.clone()));
                }
            }
            self.persist(workflow).await;
            started
        };

        for (step_id, config) in to_start {
            let engine = self.clone();
            tokio::spawn(async move {
                let outcome = engine.run_step(id, &step_id, config).await;
                engine.complete_step(id, &step_id, outcome).await;
            });
        }
    }

    async fn run_step(self: &Arc<Self>, id: Uuid, step_id: &str, config: StepConfig) -> StepOutcome {
        let (name, context) = {
            let workflows = self.workflows.lock().await;
            match workflows.get(&id) {
                Some(w) => (w.name.clone(), w.context.clone()),
                None => return StepOutcome::Evicted,
            }
        };
        let context: serde_json::Map<String, Value> =
            context.into_iter().collect();

        match config {
            StepConfig::Llm { prompt, model } => {
                let prompt = interpolate(&prompt, &context);
                let abort = self.abort_signal(id).await;
                // Per-step keys let independent branches hold slots
                // concurrently; ordering comes from the DAG, not the queue.
                let key = format!("wf:{id}:{step_id}");
                let opts = OneShotOptions {
                    session_id: None,
                    model,
                    source: format!("wf:{id}"),
                };
                let submitted = self
                    .queue
                    .submit(&key, async {
                        self.adapter
                            .one_shot(&prompt, &opts, &Callbacks::default(), abort)
                            .await
                    })
                    .await;
                match submitted {
                    Ok(Ok(reply)) => StepOutcome::Done {
                        result: json!({ "output": reply.text }),
                        cost_usd: reply.cost_usd,
                        skips: Vec::new(),
                    },
                    Ok(Err(err)) => StepOutcome::Failed { message: err.to_string() },
                    Err(err) => StepOutcome::Failed { message: err.to_string() },
                }
            }

            StepConfig::Tool { command, timeout_secs } => {
                let timeout =
                    Duration::from_secs(timeout_secs.unwrap_or(self.config.tool_timeout_secs));
                let key = format!("wf:{id}:{step_id}");
                let cap = self.config.tool_output_cap;
                let submitted = self
                    .queue
                    .submit(&key, run_tool(&command, &context, timeout, cap))
                    .await;
                match submitted {
                    Ok(Ok(result)) => StepOutcome::Done { result, cost_usd: 0.0, skips: Vec::new() },
                    Ok(Err(message)) => StepOutcome::Failed { message },
                    Err(err) => StepOutcome::Failed { message: err.to_string() },
                }
            }

            StepConfig::WaitInput { question, timeout_secs } => {
                let question = interpolate(&question, &context);
                self.notify.ask_user(&name, &question).await;

                let (tx, rx) = oneshot::channel();
                self.input_waiters
                    .lock()
                    .await
                    .insert((id, step_id.to_string()), tx);
                self.pending_inputs
                    .lock()
                    .await
                    .push_back((id, step_id.to_string()));

                // Pause the workflow until the answer (or timeout) arrives.
                {
                    let mut workflows = self.workflows.lock().await;
                    if let Some(workflow) = workflows.get_mut(&id) {
                        if workflow.status == WorkflowStatus::Running {
                            workflow.status = WorkflowStatus::Paused;
                            self.persist(workflow).await;
                        }
                    }
                }

                let timeout = Duration::from_secs(
                    timeout_secs.unwrap_or(self.config.wait_input_timeout_secs),
                );
                let engine = self.clone();
                let step_key = (id, step_id.to_string());
                tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    let waiter = engine.input_waiters.lock().await.remove(&step_key);
                    if let Some(tx) = waiter {
                        engine
                            .pending_inputs
                            .lock()
                            .await
                            .retain(|(w, s)| !(*w == step_key.0 && *s == step_key.1));
                        let _ = tx.send(None);
                    }
                });

                match rx.await {
                    Ok(Some(input)) => StepOutcome::Done {
                        result: json!({ "input": input }),
                        cost_usd: 0.0,
                        skips: Vec::new(),
                    },
                    Ok(None) => StepOutcome::Failed { message: "user input timed out".to_string() },
                    Err(_) => StepOutcome::Evicted,
                }
            }

            StepConfig::Conditional { condition, skip_if_false } => {
                let holds = match condition::evaluate(&condition, &context) {
                    Ok(holds) => holds,
                    Err(err) => {
                        warn!(%err, condition, "condition rejected — defaulting to true");
                        true
                    }
                };
                let skips = if holds { Vec::new() } else { skip_if_false };
                StepOutcome::Done {
                    result: json!({ "condition": holds }),
                    cost_usd: 0.0,
                    skips,
                }
            }

            StepConfig::Delay { seconds } => {
                let mut abort = self.abort_signal(id).await;
                let sleep = tokio::time::sleep(Duration::from_secs(seconds));
                tokio::pin!(sleep);
                let evicted = async {
                    match &mut abort {
                        Some(rx) => loop {
                            if *rx.borrow() {
                                break;
                            }
                            if rx.changed().await.is_err() {
                                std::future::pending::<()>().await;
                            }
                        },
                        None => std::future::pending().await,
                    }
                };
                tokio::select! {
                    _ = &mut sleep => StepOutcome::Done {
                        result: json!({ "delayed_secs": seconds }),
                        cost_usd: 0.0,
                        skips: Vec::new(),
                    },
                    _ = evicted => StepOutcome::Evicted,
                }
            }
        }
    }

    async fn complete_step(self: &Arc<Self>, id: Uuid, step_id: &str, outcome: StepOutcome) {
        let rollback_cmd: Option<String> = {
            let mut workflows = self.workflows.lock().await;
            let Some(workflow) = workflows.get_mut(&id) else {
                return;
            };
            if workflow.status == WorkflowStatus::Cancelled {
                return;
            }

            match outcome {
                StepOutcome::Evicted => return,
                StepOutcome::Done { result, cost_usd, skips } => {
                    workflow.cost_usd += cost_usd;
                    workflow.context.insert(step_id.to_string(), result.clone());
                    if let Some(step) = workflow.step_mut(step_id) {
                        step.status = StepStatus::Completed;
                        step.completed_at = Some(Utc::now());
                        step.result = Some(result);
                    }
                    for skip_id in skips {
                        if let Some(step) = workflow.step_mut(&skip_id) {
                            if step.status == StepStatus::Pending {
                                step.status = StepStatus::Skipped;
                                step.skip_reason =
                                    Some(format!("condition in '{step_id}' was false"));
                            }
                        }
                    }
                    if workflow.status == WorkflowStatus::Paused {
                        workflow.status = WorkflowStatus::Running;
                    }
                    workflow.updated_at = Utc::now();
                    self.persist(workflow).await;
                    None
                }
                StepOutcome::Failed { message } => {
                    let step = match workflow.step_mut(step_id) {
                        Some(step) => step,
                        None => return,
                    };
                    if step.retries < step.max_retries {
                        step.retries += 1;
                        step.status = StepStatus::Pending;
                        step.started_at = None;
                        debug!(%id, step_id, retry = step.retries, "step retrying");
                        if workflow.status == WorkflowStatus::Paused {
                            workflow.status = WorkflowStatus::Running;
                        }
                        self.persist(workflow).await;
                        drop(workflows);
                        self.advance(id).await;
                        return;
                    }

                    step.status = StepStatus::Failed;
                    step.completed_at = Some(Utc::now());
                    let rollback = step.rollback.clone();
                    warn!(%id, step_id, %message, "step failed permanently");
                    let _ = self.db.log_error(&format!("wf:{id}"), &message);
                    if workflow.status == WorkflowStatus::Paused {
                        workflow.status = WorkflowStatus::Running;
                    }
                    self.persist(workflow).await;
                    rollback
                }
            }
        };

        // Rollback runs outside the lock; its success is recorded in the
        // skip reason of the cascade.
        let rolled_back = match &rollback_cmd {
            Some(command) => {
                let context = {
                    let workflows = self.workflows.lock().await;
                    workflows
                        .get(&id)
                        .map(|w| w.context.clone().into_iter().collect())
                        .unwrap_or_default()
                };
                let timeout = Duration::from_secs(self.config.tool_timeout_secs);
                match run_tool(command, &context, timeout, self.config.tool_output_cap).await {
                    Ok(_) => {
                        info!(%id, step_id, "rollback succeeded");
                        true
                    }
                    Err(err) => {
                        warn!(%id, step_id, %err, "rollback failed");
                        false
                    }
                }
            }
            None => false,
        };

        // Cascade skip for a failed step, then continue driving the DAG.
        {
            let mut workflows = self.workflows.lock().await;
            if let Some(workflow) = workflows.get_mut(&id) {
                if workflow
                    .step(step_id)
                    .map(|s| s.status == StepStatus::Failed)
                    .unwrap_or(false)
                {
                    let reason = if rolled_back {
                        format!("dependency '{step_id}' failed (rolled back)")
                    } else {
                        format!("dependency '{step_id}' failed")
                    };
                    for descendant in workflow.descendants(step_id) {
                        if let Some(step) = workflow.step_mut(&descendant) {
                            if step.status == StepStatus::Pending {
                                step.status = StepStatus::Skipped;
                                step.skip_reason = Some(reason.clone());
                            }
                        }
                    }
                    workflow.updated_at = Utc::now();
                    self.persist(workflow).await;
                }
            }
        }

        self.advance(id).await;
    }

    /// Terminal-state bookkeeping. Caller holds the workflows lock.
    async fn finalize(&self, workflow: &mut Workflow) {
        workflow.status = if workflow.any_failed() {
            WorkflowStatus::Failed
        } else {
            WorkflowStatus::Completed
        };
        workflow.completed_at = Some(Utc::now());
        workflow.updated_at = Utc::now();
        self.persist(workflow).await;
        self.notify
            .transitioned(workflow.id, &workflow.name, workflow.status)
            .await;
        info!(
            id = %workflow.id,
            name = %workflow.name,
            status = ?workflow.status,
            cost_usd = workflow.cost_usd,
            "workflow finished"
        );
    }

    /// Purge everything a finished or cancelled workflow owns: pending-input
    /// entries, input waiters, queue backlog, and the abort handle.
    async fn evict(&self, id: Uuid) {
        self.pending_inputs.lock().await.retain(|(w, _)| *w != id);
        self.input_waiters.lock().await.retain(|(w, _), _| *w != id);
        if let Some((handle, _)) = self.aborts.lock().await.remove(&id) {
            handle.abort();
        }
        let purged = self.queue.purge_prefix(&format!("wf:{id}"));
        if purged > 0 {
            debug!(%id, purged, "workflow queue backlog purged");
        }
    }

    async fn abort_signal(&self, id: Uuid) -> Option<AbortSignal> {
        let mut aborts = self.aborts.lock().await;
        let (_, signal) = aborts.entry(id).or_insert_with(AbortHandle::new);
        Some(signal.clone())
    }

    async fn persist(&self, workflow: &Workflow) {
        let path = self.dir.join(format!("{}.json", workflow.id));
        if let Err(err) = atomic_write_json(&path, workflow).await {
            // In-memory state stays authoritative until the next save works.
            warn!(id = %workflow.id, %err, "workflow persist failed");
        }
    }
}

// ── Tool execution ────────────────────────────────────────────────────────────

/// Run a tool command: tokenise the template first, substitute placeholders
/// into the already-split argv, and exec directly — substituted values are
/// never parsed by a shell.
async fn run_tool(
    template: &str,
    context: &serde_json::Map<String, Value>,
    timeout: Duration,
    output_cap: usize,
) -> Result<Value, String> {
    let tokens = shell_words::split(template).map_err(|e| format!("bad command template: {e}"))?;
    let tokens: Vec<String> = tokens.iter().map(|t| interpolate(t, context)).collect();
    let Some((program, args)) = tokens.split_first() else {
        return Err("empty command".to_string());
    };

    let output = tokio::time::timeout(
        timeout,
        tokio::process::Command::new(program)
            .args(args)
            .stdin(std::process::Stdio::null())
            .output(),
    )
    .await
    .map_err(|_| format!("tool timed out after {}s", timeout.as_secs()))?
    .map_err(|e| format!("tool spawn failed: {e}"))?;

    let stdout = bounded_lossy(&output.stdout, output_cap);
    let stderr = bounded_lossy(&output.stderr, output_cap);
    let code = output.status.code().unwrap_or(-1);
    if output.status.success() {
        Ok(json!({ "stdout": stdout, "stderr": stderr, "exit_code": code }))
    } else {
        let brief: String = stderr.chars().take(200).collect();
        Err(format!("exit code {code}: {brief}"))
    }
}

fn bounded_lossy(bytes: &[u8], cap: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= cap {
        return text.to_string();
    }
    let mut end = cap;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…[truncated]", &text[..end])
}

/// Substitute `{{context.<stepId>.<field>}}` placeholders. A missing path
/// renders as an empty string with a warning.
pub fn interpolate(template: &str, context: &serde_json::Map<String, Value>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        let (before, tail) = rest.split_at(start);
        out.push_str(before);
        let Some(end) = tail.find("}}") else {
            out.push_str(tail);
            return out;
        };
        let path = tail[2..end].trim();
        out.push_str(&resolve_path(path, context));
        rest = &tail[end + 2..];
    }
    out.push_str(rest);
    out
}

fn resolve_path(path: &str, context: &serde_json::Map<String, Value>) -> String {
    let mut parts = path.split('.').peekable();
    if parts.peek() == Some(&"context") {
        parts.next();
    }
    let Some(head) = parts.next() else {
        return String::new();
    };
    let mut current = match context.get(head) {
        Some(value) => value.clone(),
        None => {
            warn!(path, "placeholder path not found in workflow context");
            return String::new();
        }
    };
    for part in parts {
        current = match current.get(part) {
            Some(value) => value.clone(),
            None => {
                warn!(path, "placeholder path not found in workflow context");
                return String::new();
            }
        };
    }
    match current {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Step, StepConfig};
    use attache_config::LlmConfig;
    use attache_store::PromptArchive;
    use std::path::Path;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingNotify {
        questions: StdMutex<Vec<String>>,
        events: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl WorkflowNotify for RecordingNotify {
        async fn ask_user(&self, _workflow_name: &str, question: &str) {
            self.questions.lock().unwrap().push(question.to_string());
        }
        async fn workflow_event(&self, message: &str) {
            self.events.lock().unwrap().push(message.to_string());
        }
    }

    fn fake_cli(dir: &Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-cli.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().to_string()
    }

    const LLM_SCRIPT: &str = r#"
cat > /dev/null &
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"draft ready"}]}}'
echo '{"type":"result","is_error":false,"session_id":"wf-sess","total_cost_usd":0.02,"usage":{"input_tokens":5,"output_tokens":5}}'
"#;

    struct Fixture {
        engine: Arc<WorkflowEngine>,
        notify: Arc<RecordingNotify>,
        dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let cli = fake_cli(dir.path(), LLM_SCRIPT);
        let db = Arc::new(Db::open_in_memory().unwrap());
        let adapter = Arc::new(CliAdapter::new(
            LlmConfig {
                command: cli,
                base_args: vec![],
                model: String::new(),
                timeout_secs: 5,
                inactivity_secs: 2,
                compress_timeout_secs: 2,
                max_retries: 1,
                session_token_ceiling: 1000,
            },
            dir.path().join("session.json"),
            PromptArchive::new(dir.path().join("prompts")),
            db.clone(),
        ));
        let notify = Arc::new(RecordingNotify::default());
        let wf_dir = dir.path().join("workflows");
        std::fs::create_dir_all(&wf_dir).unwrap();
        let engine = WorkflowEngine::new(
            wf_dir,
            db,
            WorkQueue::new(4, 8),
            adapter,
            notify.clone(),
            WorkflowConfig {
                tool_timeout_secs: 5,
                wait_input_timeout_secs: 60,
                ..Default::default()
            },
        );
        Fixture { engine, notify, dir }
    }

    async fn wait_for_status(
        engine: &Arc<WorkflowEngine>,
        id: Uuid,
        want: WorkflowStatus,
    ) -> Workflow {
        for _ in 0..200 {
            if let Some(wf) = engine.get(id).await {
                if wf.status == want {
                    return wf;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("workflow never reached {want:?}");
    }

    // ── Interpolation and argv safety ─────────────────────────────────────────

    #[test]
    fn interpolate_resolves_nested_paths() {
        let context: serde_json::Map<String, Value> =
            json!({"s1": {"output": "hello", "n": 3}}).as_object().cloned().unwrap();
        assert_eq!(interpolate("say {{context.s1.output}}", &context), "say hello");
        assert_eq!(interpolate("n={{s1.n}}", &context), "n=3");
        assert_eq!(interpolate("{{missing.path}}", &context), "");
        assert_eq!(interpolate("no placeholders", &context), "no placeholders");
    }

    #[tokio::test]
    async fn tool_substitution_cannot_inject_extra_argv() {
        // The malicious value stays one argument: the arg-count probe sees
        // exactly two args regardless of spaces or shell metacharacters.
        let dir = tempfile::tempdir().unwrap();
        let probe = dir.path().join("probe.sh");
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::write(&probe, "#!/bin/sh\necho \"$#\"\n").unwrap();
            std::fs::set_permissions(&probe, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        let context: serde_json::Map<String, Value> =
            json!({"s1": {"output": "a; rm -rf / --no-preserve-root b"}})
                .as_object()
                .cloned()
                .unwrap();
        let template = format!("{} \"{{{{s1.output}}}}\" second", probe.display());
        let result = run_tool(&template, &context, Duration::from_secs(5), 4096)
            .await
            .unwrap();
        assert_eq!(result["stdout"].as_str().unwrap().trim(), "2");
    }

    // ── End-to-end scenarios ──────────────────────────────────────────────────

    #[tokio::test]
    async fn linear_workflow_with_wait_input_pauses_and_resumes() {
        let f = fixture();
        let steps = vec![
            Step::new("s1", StepConfig::Llm { prompt: "draft it".to_string(), model: None }),
            Step::new(
                "s2",
                StepConfig::WaitInput { question: "ok?".to_string(), timeout_secs: None },
            )
            .after(&["s1"]),
            Step::new(
                "s3",
                StepConfig::Tool { command: "echo done".to_string(), timeout_secs: None },
            )
            .after(&["s2"]),
        ];
        let id = f.engine.create("review", steps, None).await.unwrap();

        let paused = wait_for_status(&f.engine, id, WorkflowStatus::Paused).await;
        assert_eq!(paused.step("s1").unwrap().status, StepStatus::Completed);
        assert_eq!(f.notify.questions.lock().unwrap().as_slice(), ["ok?"]);
        assert!(f.engine.has_pending_input().await);

        assert!(f.engine.fulfill_input("go").await);
        let done = wait_for_status(&f.engine, id, WorkflowStatus::Completed).await;
        assert_eq!(done.step("s2").unwrap().result.as_ref().unwrap()["input"], "go");
        assert_eq!(done.step("s3").unwrap().status, StepStatus::Completed);
        assert!(done.cost_usd > 0.0, "llm step cost attributed to the workflow");
    }

    #[tokio::test]
    async fn failed_step_rolls_back_and_cascades_skips() {
        let f = fixture();
        let scratch = f.dir.path().join("scratch-dir");
        let steps = vec![
            Step::new(
                "make",
                StepConfig::Tool {
                    command: format!("mkdir {}", scratch.display()),
                    timeout_secs: None,
                },
            ),
            Step::new("boom", StepConfig::Tool { command: "false".to_string(), timeout_secs: None })
                .after(&["make"])
                .with_rollback(format!("rmdir {}", scratch.display())),
            Step::new("never", StepConfig::Tool { command: "echo no".to_string(), timeout_secs: None })
                .after(&["boom"]),
        ];
        let id = f.engine.create("rollback", steps, None).await.unwrap();

        let done = wait_for_status(&f.engine, id, WorkflowStatus::Failed).await;
        assert_eq!(done.step("boom").unwrap().status, StepStatus::Failed);
        assert_eq!(done.step("never").unwrap().status, StepStatus::Skipped);
        assert!(
            done.step("never").unwrap().skip_reason.as_ref().unwrap().contains("rolled back"),
        );
        assert!(!scratch.exists(), "rollback must undo the mkdir");
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let f = fixture();
        // Fails while the marker file is missing, creating it as a side
        // effect, so the second attempt succeeds.
        let marker = f.dir.path().join("marker");
        let flaky = f.dir.path().join("flaky.sh");
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::write(
                &flaky,
                format!("#!/bin/sh\nif [ -f {m} ]; then exit 0; fi\ntouch {m}\nexit 1\n", m = marker.display()),
            )
            .unwrap();
            std::fs::set_permissions(&flaky, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        let steps = vec![
            Step::new(
                "flaky",
                StepConfig::Tool { command: flaky.display().to_string(), timeout_secs: None },
            )
            .with_retries(2),
        ];
        let id = f.engine.create("retry", steps, None).await.unwrap();

        let done = wait_for_status(&f.engine, id, WorkflowStatus::Completed).await;
        assert_eq!(done.step("flaky").unwrap().retries, 1);
    }

    #[tokio::test]
    async fn conditional_false_skips_listed_steps_only() {
        let f = fixture();
        let steps = vec![
            Step::new(
                "probe",
                StepConfig::Tool { command: "echo 5".to_string(), timeout_secs: None },
            ),
            Step::new(
                "gate",
                StepConfig::Conditional {
                    condition: "probe.exit_code != 0".to_string(),
                    skip_if_false: vec!["alarm".to_string()],
                },
            )
            .after(&["probe"]),
            Step::new("alarm", StepConfig::Tool { command: "echo alarm".to_string(), timeout_secs: None })
                .after(&["gate"]),
            Step::new("always", StepConfig::Tool { command: "echo always".to_string(), timeout_secs: None })
                .after(&["gate"]),
        ];
        let id = f.engine.create("gated", steps, None).await.unwrap();

        let done = wait_for_status(&f.engine, id, WorkflowStatus::Completed).await;
        assert_eq!(done.step("gate").unwrap().result.as_ref().unwrap()["condition"], false);
        assert_eq!(done.step("alarm").unwrap().status, StepStatus::Skipped);
        assert_eq!(done.step("always").unwrap().status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn malformed_condition_defaults_to_true() {
        let f = fixture();
        let steps = vec![
            Step::new(
                "gate",
                StepConfig::Conditional {
                    condition: "require('child_process')".to_string(),
                    skip_if_false: vec![],
                },
            ),
        ];
        let id = f.engine.create("bad-cond", steps, None).await.unwrap();
        let done = wait_for_status(&f.engine, id, WorkflowStatus::Completed).await;
        assert_eq!(done.step("gate").unwrap().result.as_ref().unwrap()["condition"], true);
    }

    #[tokio::test]
    async fn delay_step_completes_and_advances() {
        let f = fixture();
        let steps = vec![
            Step::new("wait", StepConfig::Delay { seconds: 0 }),
            Step::new("then", StepConfig::Tool { command: "echo hi".to_string(), timeout_secs: None })
                .after(&["wait"]),
        ];
        let id = f.engine.create("delayed", steps, None).await.unwrap();
        let done = wait_for_status(&f.engine, id, WorkflowStatus::Completed).await;
        assert_eq!(done.step("then").unwrap().status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn step_results_flow_through_placeholders() {
        let f = fixture();
        let steps = vec![
            Step::new(
                "first",
                StepConfig::Tool { command: "echo payload".to_string(), timeout_secs: None },
            ),
            Step::new(
                "second",
                StepConfig::Llm {
                    prompt: "previous said: {{context.first.stdout}}".to_string(),
                    model: None,
                },
            )
            .after(&["first"]),
        ];
        let id = f.engine.create("chained", steps, None).await.unwrap();
        let done = wait_for_status(&f.engine, id, WorkflowStatus::Completed).await;
        assert_eq!(done.step("second").unwrap().result.as_ref().unwrap()["output"], "draft ready");
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_cleans_up() {
        let f = fixture();
        let steps = vec![Step::new(
            "ask",
            StepConfig::WaitInput { question: "?".to_string(), timeout_secs: None },
        )];
        let id = f.engine.create("c", steps, None).await.unwrap();
        wait_for_status(&f.engine, id, WorkflowStatus::Paused).await;
        assert!(f.engine.has_pending_input().await);

        f.engine.cancel(id).await.unwrap();
        f.engine.cancel(id).await.unwrap(); // idempotent
        assert!(!f.engine.has_pending_input().await);
        assert_eq!(f.engine.get(id).await.unwrap().status, WorkflowStatus::Cancelled);
        assert!(!f.engine.fulfill_input("late").await);
    }

    #[tokio::test]
    async fn pause_on_paused_is_a_noop() {
        let f = fixture();
        let steps = vec![Step::new(
            "ask",
            StepConfig::WaitInput { question: "?".to_string(), timeout_secs: None },
        )];
        let id = f.engine.create("p", steps, None).await.unwrap();
        wait_for_status(&f.engine, id, WorkflowStatus::Paused).await;
        f.engine.pause(id).await.unwrap();
        f.engine.pause(id).await.unwrap();
        assert_eq!(f.engine.get(id).await.unwrap().status, WorkflowStatus::Paused);
    }

    #[tokio::test]
    async fn crash_resume_demotes_running_steps_and_finishes() {
        let f = fixture();

        // Persist a workflow that "crashed" with a step mid-flight.
        let mut wf = Workflow::new(
            "resumable",
            vec![
                Step::new("a", StepConfig::Tool { command: "echo a".to_string(), timeout_secs: None }),
                Step::new("b", StepConfig::Tool { command: "echo b".to_string(), timeout_secs: None })
                    .after(&["a"]),
            ],
        );
        wf.status = WorkflowStatus::Running;
        wf.step_mut("a").unwrap().status = StepStatus::Running;
        wf.step_mut("a").unwrap().started_at = Some(Utc::now());
        let id = wf.id;
        let path = f.dir.path().join("workflows").join(format!("{id}.json"));
        atomic_write_json(&path, &wf).await.unwrap();

        f.engine.load_persisted().await;
        let done = wait_for_status(&f.engine, id, WorkflowStatus::Completed).await;
        assert_eq!(done.step("a").unwrap().status, StepStatus::Completed);
        assert_eq!(done.step("b").unwrap().status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn wait_input_timeout_fails_the_step() {
        let f = fixture();
        let steps = vec![Step::new(
            "ask",
            StepConfig::WaitInput { question: "?".to_string(), timeout_secs: Some(1) },
        )];
        let id = f.engine.create("timeout", steps, None).await.unwrap();
        let done = wait_for_status(&f.engine, id, WorkflowStatus::Failed).await;
        assert_eq!(done.step("ask").unwrap().status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn parallel_branches_run_independently() {
        let f = fixture();
        let steps = vec![
            Step::new("root", StepConfig::Tool { command: "echo r".to_string(), timeout_secs: None }),
            Step::new("left", StepConfig::Tool { command: "echo l".to_string(), timeout_secs: None })
                .after(&["root"]),
            Step::new("right", StepConfig::Tool { command: "false".to_string(), timeout_secs: None })
                .after(&["root"]),
            Step::new("left2", StepConfig::Tool { command: "echo l2".to_string(), timeout_secs: None })
                .after(&["left"]),
        ];
        let id = f.engine.create("branches", steps, None).await.unwrap();

        // The right branch fails but the left branch still completes; the
        // workflow as a whole is failed because one step failed.
        let done = wait_for_status(&f.engine, id, WorkflowStatus::Failed).await;
        assert_eq!(done.step("left2").unwrap().status, StepStatus::Completed);
        assert_eq!(done.step("right").unwrap().status, StepStatus::Failed);
    }
}
