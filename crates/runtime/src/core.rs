//! The `Core` — explicit wiring of every component, lifecycle
//! `new / start / shutdown`.
//!
//! A messaging-adapter callback lands an inbound message here; quick paths
//! (workflow input fulfillment, built-in verbs) are handled inline, and
//! everything else becomes a chat turn: admission through the work queue,
//! tiered context assembly, the gate, the persistent LLM session, chunked
//! delivery, and marker side-effects. Crons and workflows feed the same
//! queue from their own tasks.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

use attache_config::AppConfig;
use attache_context::{AssembleRequest, ContextAssembler, ContextGate, Tier, sanitize_user_text};
use attache_cron::{CronDelivery, CronScheduler};
use attache_ipc::{IpcCommand, IpcServer, PushEvent, ServerDeps};
use attache_llm::{
    AbortHandle, Callbacks, Chunker, CliAdapter, LlmError, MarkerAction, extract_markers,
};
use attache_memory::MemoryIndex;
use attache_queue::{QueueError, WorkQueue};
use attache_store::{
    ChatTurn, ConversationHistory, CronStatus, Db, DebouncedWriter, DeliveryMode, PromptArchive,
    read_json,
};
use attache_workflow::{WorkflowEngine, WorkflowNotify};

use crate::channel::{ChannelAdapter, InboundMessage, MessageKind};
use crate::outcome::OutcomeTracker;
use crate::router::{Intent, classify};

/// External tool servers (MCP and friends) are collaborators; this is their
/// whole contract.
#[async_trait]
pub trait ExternalTools: Send + Sync {
    fn list(&self) -> Vec<String>;
    async fn invoke(&self, name: &str, params: Value) -> Result<String>;
}

/// Bridges cron/workflow callbacks onto the channel without upward imports.
struct ChannelBridge {
    channel: Arc<dyn ChannelAdapter>,
    events: broadcast::Sender<PushEvent>,
}

#[async_trait]
impl CronDelivery for ChannelBridge {
    async fn deliver(&self, job_name: &str, text: &str) {
        if let Err(err) = self.channel.send(text, Some("cron")).await {
            warn!(job_name, %err, "cron delivery failed");
        }
        let _ = self.events.send(PushEvent::CronFired { name: job_name.to_string() });
    }

    async fn alert(&self, message: &str) {
        if let Err(err) = self.channel.send(&format!("⚠️ {message}"), Some("alert")).await {
            warn!(%err, "alert delivery failed");
        }
        let _ = self.events.send(PushEvent::Notice { text: message.to_string() });
    }
}

#[async_trait]
impl WorkflowNotify for ChannelBridge {
    async fn ask_user(&self, workflow_name: &str, question: &str) {
        let text = format!("[{workflow_name}] {question}");
        if let Err(err) = self.channel.send(&text, Some("workflow")).await {
            warn!(workflow_name, %err, "workflow question delivery failed");
        }
    }

    async fn workflow_event(&self, message: &str) {
        let _ = self.events.send(PushEvent::Notice { text: message.to_string() });
        if let Err(err) = self.channel.send(&format!("⚠️ {message}"), Some("alert")).await {
            warn!(%err, "workflow event delivery failed");
        }
    }

    async fn transitioned(
        &self,
        id: uuid::Uuid,
        _name: &str,
        status: attache_workflow::WorkflowStatus,
    ) {
        let _ = self.events.send(PushEvent::WorkflowChanged {
            id,
            status: format!("{status:?}").to_lowercase(),
        });
    }
}

pub struct Core {
    config: AppConfig,
    db: Arc<Db>,
    queue: WorkQueue,
    adapter: Arc<CliAdapter>,
    memory: Arc<MemoryIndex>,
    assembler: ContextAssembler,
    gate: ContextGate,
    cron: Arc<CronScheduler>,
    engine: Arc<WorkflowEngine>,
    channel: Arc<dyn ChannelAdapter>,
    tools: Option<Arc<dyn ExternalTools>>,
    events: broadcast::Sender<PushEvent>,
    histories: Mutex<HashMap<String, ConversationHistory>>,
    history_writers: Mutex<HashMap<String, DebouncedWriter<ConversationHistory>>>,
    outcome: Mutex<OutcomeTracker>,
    ipc: Mutex<Option<IpcServer>>,
    ipc_commands: Mutex<Option<mpsc::UnboundedReceiver<IpcCommand>>>,
    shutdown_tx: watch::Sender<bool>,
    started_at: Instant,
}

impl Core {
    pub fn new(
        config: AppConfig,
        channel: Arc<dyn ChannelAdapter>,
        tools: Option<Arc<dyn ExternalTools>>,
    ) -> Result<Arc<Self>> {
        std::fs::create_dir_all(config.data_dir()).context("create data dir")?;
        let db = Arc::new(Db::open(config.db_path()).context("open relational store")?);
        let queue = WorkQueue::new(config.queue.max_concurrent, config.queue.max_queue_per_user);
        let archive = PromptArchive::new(config.prompts_dir());
        let adapter = Arc::new(CliAdapter::new(
            config.llm.clone(),
            config.session_path(),
            archive,
            db.clone(),
        ));

        let memory = Arc::new(MemoryIndex::new(
            config.memory.clone(),
            db.clone(),
            config.notes_dir(),
        ));
        let assembler = ContextAssembler::new(
            memory.clone(),
            db.clone(),
            config.context.clone(),
            config.memory.clone(),
            PathBuf::from(&config.agent.persona_path),
        );
        let gate = ContextGate::new(config.llm.session_token_ceiling);

        let (events, _) = broadcast::channel(256);
        let bridge = Arc::new(ChannelBridge { channel: channel.clone(), events: events.clone() });

        let cron = CronScheduler::new(
            db.clone(),
            queue.clone(),
            adapter.clone(),
            bridge.clone(),
            config.cron.clone(),
        )?;
        let engine = WorkflowEngine::new(
            config.workflows_dir(),
            db.clone(),
            queue.clone(),
            adapter.clone(),
            bridge,
            config.workflow.clone(),
        );

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            config,
            db,
            queue,
            adapter,
            memory,
            assembler,
            gate,
            cron,
            engine,
            channel,
            tools,
            events,
            histories: Mutex::new(HashMap::new()),
            history_writers: Mutex::new(HashMap::new()),
            outcome: Mutex::new(OutcomeTracker::new()),
            ipc: Mutex::new(None),
            ipc_commands: Mutex::new(None),
            shutdown_tx,
            started_at: Instant::now(),
        }))
    }

    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    pub fn events(&self) -> broadcast::Sender<PushEvent> {
        self.events.clone()
    }

    /// Bring up background services and run the inbound loop until shutdown.
    pub async fn start(self: &Arc<Self>, mut inbound: mpsc::Receiver<InboundMessage>) -> Result<()> {
        self.cron.start().await?;
        self.engine.load_persisted().await;
        self.engine.spawn_stall_scanner(self.shutdown_tx.subscribe());

        if self.config.ipc.enabled {
            let (commands_tx, commands_rx) = mpsc::unbounded_channel();
            let server = IpcServer::start(
                ServerDeps {
                    db: self.db.clone(),
                    queue: self.queue.clone(),
                    adapter: self.adapter.clone(),
                    cron: self.cron.clone(),
                    engine: self.engine.clone(),
                    commands: commands_tx,
                    events: self.events.clone(),
                    config: self.config.ipc.clone(),
                },
                self.config.ipc_port_path(),
            )
            .await?;
            *self.ipc.lock().await = Some(server);
            *self.ipc_commands.lock().await = Some(commands_rx);
        }

        // Daily prompt-archive sweep.
        {
            let archive = PromptArchive::new(self.config.prompts_dir());
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(24 * 60 * 60)) => {
                            let removed = archive.sweep().await;
                            if removed > 0 {
                                info!(removed, "prompt archive swept");
                            }
                        }
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            });
        }

        info!(name = %self.config.agent.name, "core started");
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut commands = self.ipc_commands.lock().await.take();

        loop {
            tokio::select! {
                message = inbound.recv() => {
                    match message {
                        Some(message) => {
                            let core = self.clone();
                            tokio::spawn(async move {
                                if let Err(err) = core.handle_message(message).await {
                                    error!(%err, "message pipeline error");
                                    let _ = core.db.log_error("pipeline", &err.to_string());
                                    let _ = core
                                        .channel
                                        .send("Something went wrong handling that — noted in the error log.", Some("error"))
                                        .await;
                                }
                            });
                        }
                        None => break,
                    }
                }
                command = recv_command(&mut commands) => {
                    if let Some(command) = command {
                        self.handle_ipc_command(command).await;
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        self.drain_and_close().await;
        Ok(())
    }

    /// Drain order: stop admission, settle in-flight, flush debounced
    /// writes, stop schedulers, close the LLM subprocess, close IPC, then
    /// the offline notice.
    async fn drain_and_close(&self) {
        info!("shutting down");
        let drained = self
            .queue
            .drain(Duration::from_secs(self.config.queue.drain_timeout_secs))
            .await;
        debug!(drained, "queue drained");

        for (peer, writer) in self.history_writers.lock().await.iter() {
            if let Err(err) = writer.flush_now().await {
                warn!(peer, %err, "history flush failed during shutdown");
            }
        }
        self.cron.shutdown().await;
        self.adapter.close().await;
        if let Some(server) = self.ipc.lock().await.take() {
            server.shutdown().await;
        }
        if self.config.agent.shutdown_notice {
            let _ = self.channel.send("Going offline for a moment — back soon.", Some("system")).await;
        }
    }

    // ── Inbound pipeline ──────────────────────────────────────────────────────

    pub async fn handle_message(self: &Arc<Self>, message: InboundMessage) -> Result<()> {
        if message.kind != MessageKind::Text || message.body.trim().is_empty() {
            return Ok(());
        }
        let text = message.body.trim().to_string();

        // Reaction tracking and memory feedback happen for every message.
        self.outcome.lock().await.note_inbound(&self.db, &text);
        self.memory.note_user_message(&text).await;

        // A paused workflow waiting for input consumes the message outright.
        if self.engine.fulfill_input(&text).await {
            debug!(from = %message.from, "message routed to waiting workflow");
            return Ok(());
        }

        match classify(&text) {
            Intent::Chat => self.run_chat_turn(&message.from, &text).await,
            verb => self.run_verb(verb).await,
        }
    }

    async fn run_verb(self: &Arc<Self>, intent: Intent) -> Result<()> {
        let reply = match intent {
            Intent::Status => self.status_text().await,
            Intent::Help => help_text(),
            Intent::ListCrons => self.crons_text()?,
            Intent::ListGoals => self.goals_text()?,
            Intent::NewSession => {
                self.adapter.reset_session().await;
                self.histories.lock().await.clear();
                "Fresh start — previous context cleared.".to_string()
            }
            Intent::PauseWorkflow(name) => match self.engine.find_by_name_prefix(&name).await {
                Some(wf) => match self.engine.pause(wf.id).await {
                    Ok(()) => format!("Workflow '{}' paused.", wf.name),
                    Err(err) => format!("Can't pause '{}': {err}", wf.name),
                },
                None => format!("No workflow matching '{name}'."),
            },
            Intent::ResumeWorkflow(name) => match self.engine.find_by_name_prefix(&name).await {
                Some(wf) => match self.engine.resume(wf.id).await {
                    Ok(()) => format!("Workflow '{}' resumed.", wf.name),
                    Err(err) => format!("Can't resume '{}': {err}", wf.name),
                },
                None => format!("No workflow matching '{name}'."),
            },
            Intent::Chat => return Ok(()),
        };

        let msg_id = self.channel.send(&reply, Some("verb")).await?;
        self.outcome.lock().await.note_outbound(&msg_id);
        Ok(())
    }

    async fn run_chat_turn(self: &Arc<Self>, peer: &str, text: &str) -> Result<()> {
        let sanitized = sanitize_user_text(text);

        // Tier selection inputs.
        let pressure = self.adapter.session_tokens() as f32
            / self.adapter.session_token_ceiling().max(1) as f32;
        let budget_frac = self
            .db
            .cost_summary()
            .map(|c| c.today_usd / self.config.context.daily_budget_usd.max(0.01))
            .unwrap_or(0.0);
        let frustrated = ["ugh", "wtf", "broken", "still not"]
            .iter()
            .any(|w| sanitized.to_lowercase().contains(w));
        let tier = Tier::select(&sanitized, pressure, budget_frac, frustrated);

        let tools: Vec<String> = self.tools.as_ref().map(|t| t.list()).unwrap_or_default();
        let gate_outcome = {
            let histories = self.histories.lock().await;
            let history = histories.get(peer).cloned().unwrap_or_default();
            drop(histories);
            let sections = self
                .assembler
                .assemble(
                    tier,
                    &AssembleRequest {
                        message: &sanitized,
                        history: &history,
                        tools: &tools,
                        frustrated_hint: frustrated,
                    },
                )
                .await;
            self.gate.compose(
                sections,
                &sanitized,
                self.adapter.session_tokens(),
                tier.byte_budget(&self.config.context),
            )
        };
        debug!(?tier, pressure = gate_outcome.pressure, dropped = ?gate_outcome.dropped, "prompt composed");

        self.push_history(peer, ChatTurn::user(text)).await;

        // Composing watchdog — the cascade breaker. If the outbound
        // composition runs past the timer, the in-flight call is aborted and
        // the queue slot comes back.
        let (abort_handle, abort_signal) = AbortHandle::new();
        {
            let handle = abort_handle.clone();
            let timeout = Duration::from_secs(self.config.channel.composing_timeout_secs);
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                handle.abort();
            });
        }

        // Chunked streaming: deltas feed the chunker; each completed chunk is
        // stripped of (always whole, thanks to holdback) markers and sent in
        // order by this single task.
        let (delta_tx, mut delta_rx) = mpsc::channel::<String>(64);
        let sender = self.clone();
        let soft = self.config.channel.chunk_soft_bytes;
        let hard = self.config.channel.chunk_hard_bytes;
        let chunk_task = tokio::spawn(async move {
            let mut chunker = Chunker::new(soft, hard);
            let mut sent = 0usize;
            while let Some(delta) = delta_rx.recv().await {
                for chunk in chunker.push(&delta) {
                    sent += sender.send_clean(&chunk).await;
                }
            }
            if let Some(rest) = chunker.finish() {
                sent += sender.send_clean(&rest).await;
            }
            sent
        });

        let callbacks = Callbacks { on_text: Some(delta_tx), on_tool_use: None };
        let result = self
            .queue
            .submit(peer, async {
                self.adapter
                    .chat_turn(&gate_outcome.prompt, &callbacks, Some(abort_signal))
                    .await
            })
            .await;
        drop(callbacks);
        let chunks_sent = chunk_task.await.unwrap_or(0);

        let reply = match result {
            Ok(Ok(reply)) => reply,
            Ok(Err(err)) => {
                self.send_llm_failure(&err).await;
                return Ok(());
            }
            Err(QueueError::BacklogFull(_)) => {
                let _ = self.channel.send("I'm too busy right now — try again in a moment.", None).await;
                return Ok(());
            }
            Err(QueueError::Draining) => return Ok(()),
        };

        let extraction = extract_markers(&reply.text);

        // A reply that produced no streamed chunks (assistant-only events)
        // still reaches the user.
        if chunks_sent == 0 && !extraction.clean_text.is_empty() {
            let msg_id = self.channel.send(&extraction.clean_text, None).await?;
            self.outcome.lock().await.note_outbound(&msg_id);
        }

        self.push_history(peer, ChatTurn::assistant(extraction.clean_text.clone()))
            .await;

        for action in extraction.actions {
            self.execute_action(action).await;
        }

        // Compression runs after the reply is delivered, never before.
        if gate_outcome.reset_needed
            || self.adapter.session_tokens() >= self.adapter.session_token_ceiling()
        {
            let captured = self.adapter.compress().await;
            if !captured {
                let _ = self
                    .channel
                    .send(
                        "(I had to reset my working context and couldn't save a summary — ask again if I lose the thread.)",
                        Some("system"),
                    )
                    .await;
            }
        }
        Ok(())
    }

    /// Strip markers from one chunk and send it. Returns 1 when something
    /// user-visible went out.
    async fn send_clean(self: &Arc<Self>, chunk: &str) -> usize {
        let clean = extract_markers(chunk).clean_text;
        if clean.is_empty() {
            return 0;
        }
        match self.channel.send(&clean, None).await {
            Ok(msg_id) => {
                self.outcome.lock().await.note_outbound(&msg_id);
                1
            }
            Err(err) => {
                warn!(%err, "chunk delivery failed");
                0
            }
        }
    }

    async fn send_llm_failure(&self, err: &LlmError) {
        let text = match err {
            LlmError::Permanent(_) => "Sorry — the model refused that one. Try rephrasing?",
            LlmError::Busy => "Still working on your previous message — one moment.",
            LlmError::Aborted => "That took too long, so I stopped it. Ask again to retry.",
            _ => "I hit a technical problem reaching the model. Trying again later should work.",
        };
        let _ = self.db.log_error("llm", &err.to_string());
        let _ = self.channel.send(text, Some("error")).await;
    }

    // ── Marker side-effects ───────────────────────────────────────────────────

    async fn execute_action(self: &Arc<Self>, action: MarkerAction) {
        match action {
            MarkerAction::CronAdd { name, schedule, prompt, delivery, model } => {
                let delivery = delivery
                    .as_deref()
                    .and_then(DeliveryMode::parse)
                    .unwrap_or_default();
                match self.cron.add_job(&name, &schedule, &prompt, delivery, model, None).await {
                    Ok(job) => {
                        let _ = self
                            .channel
                            .send(&format!("✓ scheduled '{}' ({})", job.name, job.schedule), Some("cron"))
                            .await;
                    }
                    Err(err) => {
                        warn!(%err, name, "cron add marker failed");
                        let _ = self
                            .channel
                            .send(&format!("Couldn't schedule '{name}': {err}"), Some("cron"))
                            .await;
                    }
                }
            }
            MarkerAction::CronDelete { target } => {
                if let Err(err) = self.cron.remove_job(&target).await {
                    let _ = self.channel.send(&format!("Couldn't remove '{target}': {err}"), Some("cron")).await;
                }
            }
            MarkerAction::CronToggle { target } => {
                if let Err(err) = self.cron.toggle_job(&target).await {
                    let _ = self.channel.send(&format!("Couldn't toggle '{target}': {err}"), Some("cron")).await;
                }
            }
            MarkerAction::CronRun { target } => {
                if let Err(err) = self.cron.run_now(&target).await {
                    let _ = self.channel.send(&format!("Couldn't run '{target}': {err}"), Some("cron")).await;
                }
            }
            MarkerAction::SendFile { path } => self.send_workspace_file(&path).await,
            MarkerAction::ToolCall { name, params } => self.invoke_tool(&name, params).await,
        }
    }

    /// `[SEND_FILE: …]` paths resolve strictly inside the workspace root.
    async fn send_workspace_file(&self, relative: &str) {
        let root = match std::fs::canonicalize(&self.config.agent.workspace_path) {
            Ok(root) => root,
            Err(err) => {
                warn!(%err, "workspace root missing");
                return;
            }
        };
        let candidate = root.join(relative);
        let resolved = match std::fs::canonicalize(&candidate) {
            Ok(resolved) => resolved,
            Err(_) => {
                let _ = self.channel.send(&format!("File '{relative}' not found."), None).await;
                return;
            }
        };
        if !resolved.starts_with(&root) {
            warn!(path = relative, "file request outside workspace rejected");
            let _ = self.channel.send("That file is outside my workspace.", None).await;
            return;
        }
        if let Err(err) = self.channel.send_file(&resolved).await {
            warn!(%err, path = relative, "file transfer failed");
            let _ = self.channel.send(&format!("Couldn't send '{relative}': {err}"), None).await;
        }
    }

    async fn invoke_tool(&self, name: &str, params: Value) {
        let Some(tools) = &self.tools else {
            let _ = self.channel.send(&format!("Tool '{name}' isn't connected."), None).await;
            return;
        };
        match tools.invoke(name, params).await {
            Ok(result) => {
                let _ = self.channel.send(&result, Some("tool")).await;
            }
            Err(err) => {
                warn!(name, %err, "external tool failed");
                let _ = self.channel.send(&format!("Tool '{name}' failed: {err}"), None).await;
            }
        }
    }

    // ── History ───────────────────────────────────────────────────────────────

    async fn push_history(&self, peer: &str, turn: ChatTurn) {
        let mut histories = self.histories.lock().await;
        if !histories.contains_key(peer) {
            // Lazy-load from disk on first contact this process life.
            let loaded: ConversationHistory =
                read_json(&self.history_path(peer)).ok().flatten().unwrap_or_default();
            histories.insert(peer.to_string(), loaded);
        }
        let Some(history) = histories.get_mut(peer) else {
            return;
        };
        history.push(turn, self.config.history.max_turns);
        let snapshot = history.clone();
        drop(histories);

        let mut writers = self.history_writers.lock().await;
        let writer = writers.entry(peer.to_string()).or_insert_with(|| {
            DebouncedWriter::spawn(
                self.history_path(peer),
                Duration::from_millis(self.config.history.flush_ms),
            )
        });
        writer.write(snapshot).await;
    }

    fn history_path(&self, peer: &str) -> PathBuf {
        let safe: String = peer
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.config.history_dir().join(format!("{safe}.json"))
    }

    async fn handle_ipc_command(&self, command: IpcCommand) {
        match command {
            IpcCommand::ClearHistory => {
                self.histories.lock().await.clear();
                for (_, writer) in self.history_writers.lock().await.drain() {
                    let _ = writer.flush_now().await;
                }
                if let Ok(entries) = std::fs::read_dir(self.config.history_dir()) {
                    for entry in entries.flatten() {
                        let _ = std::fs::remove_file(entry.path());
                    }
                }
                info!("conversation history cleared via ipc");
            }
        }
    }

    // ── Verb renderers ────────────────────────────────────────────────────────

    async fn status_text(&self) -> String {
        let queue = self.queue.stats();
        let costs = self.db.cost_summary().unwrap_or_default();
        let crons = self.cron.list().unwrap_or_default();
        let workflows = self.engine.list().await;
        let active_wf = workflows.iter().filter(|w| !w.status.is_terminal()).count();
        format!(
            "{} up {}m · session {}k/{}k tokens · queue {} running / {} waiting · \
             {} crons · {} active workflows · ${:.2} today",
            self.config.agent.name,
            self.started_at.elapsed().as_secs() / 60,
            self.adapter.session_tokens() / 1000,
            self.adapter.session_token_ceiling() / 1000,
            queue.in_flight,
            queue.waiting,
            crons.len(),
            active_wf,
            costs.today_usd,
        )
    }

    fn crons_text(&self) -> Result<String> {
        let jobs = self.cron.list()?;
        if jobs.is_empty() {
            return Ok("No scheduled jobs.".to_string());
        }
        let lines = jobs
            .iter()
            .map(|job| {
                let status = match &job.state.last_status {
                    CronStatus::Never => "never ran".to_string(),
                    CronStatus::Ok => "ok".to_string(),
                    CronStatus::Running => "running".to_string(),
                    CronStatus::Error(e) => format!("error: {e}"),
                };
                let next = job
                    .state
                    .next_run
                    .map(|t| t.format("%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "—".to_string());
                format!(
                    "{} {} · {} · last {} · next {}",
                    if job.enabled { "●" } else { "○" },
                    job.name,
                    job.schedule,
                    status,
                    next,
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        Ok(lines)
    }

    fn goals_text(&self) -> Result<String> {
        let goals = self.db.list_goals()?;
        if goals.is_empty() {
            return Ok("No goals yet.".to_string());
        }
        let lines = goals
            .iter()
            .map(|goal| {
                let done = goal.milestones.iter().filter(|m| m.done).count();
                format!(
                    "[{}] {} ({}/{} milestones)",
                    goal.status.as_str(),
                    goal.title,
                    done,
                    goal.milestones.len(),
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        Ok(lines)
    }
}

async fn recv_command(
    commands: &mut Option<mpsc::UnboundedReceiver<IpcCommand>>,
) -> Option<IpcCommand> {
    match commands {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn help_text() -> String {
    "Just talk to me. Short commands: status · crons · goals · new (fresh session) · \
     pause/resume <workflow>. I can schedule reminders, run multi-step plans, and send \
     you files from my workspace."
        .to_string()
}
