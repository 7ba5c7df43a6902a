use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    pub user_name: String,
    /// Directory holding all persisted state (`data/` by default).
    pub data_dir: String,
    /// Workspace root that `[SEND_FILE: …]` paths are resolved against.
    pub workspace_path: String,
    /// Path to the persona ("soul") document injected into every prompt.
    pub persona_path: String,
    /// Send a short offline notice to the channel during shutdown.
    pub shutdown_notice: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "Attache".to_string(),
            user_name: String::new(),
            data_dir: "data".to_string(),
            workspace_path: ".".to_string(),
            persona_path: "data/persona.md".to_string(),
            shutdown_notice: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// The LLM CLI executable, e.g. `claude`.
    pub command: String,
    /// Extra arguments placed before the mode flags.
    pub base_args: Vec<String>,
    pub model: String,
    /// Absolute per-call cap in seconds.
    pub timeout_secs: u64,
    /// Inactivity watchdog: no stdout bytes for this long fails the call.
    pub inactivity_secs: u64,
    /// Cap on the compression summary call.
    pub compress_timeout_secs: u64,
    pub max_retries: u32,
    /// Session token ceiling that drives compression.
    pub session_token_ceiling: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            base_args: vec!["--output-format".to_string(), "stream-json".to_string()],
            model: String::new(),
            timeout_secs: 900,
            inactivity_secs: 120,
            compress_timeout_secs: 60,
            max_retries: 3,
            session_token_ceiling: 150_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_concurrent: usize,
    pub max_queue_per_user: usize,
    pub drain_timeout_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            max_queue_per_user: 3,
            drain_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CronConfig {
    /// IANA timezone used when a job does not declare its own.
    pub timezone: String,
    pub quiet_start_hour: u8,
    pub quiet_end_hour: u8,
    /// Consecutive errors before an out-of-band alert fires.
    pub alert_after_errors: u32,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
            quiet_start_hour: 23,
            quiet_end_hour: 7,
            alert_after_errors: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub tool_timeout_secs: u64,
    pub wait_input_timeout_secs: u64,
    pub max_duration_secs: u64,
    /// A `running` step older than this is reported by the stall scan.
    pub stall_threshold_secs: u64,
    pub stall_scan_interval_secs: u64,
    /// Cap on captured stdout/stderr per tool step, in bytes.
    pub tool_output_cap: usize,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 30,
            wait_input_timeout_secs: 24 * 60 * 60,
            max_duration_secs: 48 * 60 * 60,
            stall_threshold_secs: 30 * 60,
            stall_scan_interval_secs: 5 * 60,
            tool_output_cap: 16 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Per-tier byte budgets for the assembled dynamic context.
    pub minimal_budget: usize,
    pub standard_budget: usize,
    pub full_budget: usize,
    /// Directory of skill documents matched by keyword.
    pub skills_dir: String,
    pub max_skills_standard: usize,
    pub max_skills_full: usize,
    /// Idle gap (hours) after which a conversation recap is injected.
    pub recap_after_hours: i64,
    /// Daily spend target driving tier downgrades as it fills up.
    pub daily_budget_usd: f64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            minimal_budget: 2 * 1024,
            standard_budget: 5 * 1024,
            full_budget: 12 * 1024,
            skills_dir: "data/skills".to_string(),
            max_skills_standard: 2,
            max_skills_full: 4,
            recap_after_hours: 4,
            daily_budget_usd: 5.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Base URL of the external semantic-memory service.
    pub store_url: String,
    /// Token budget for the assembled memory block.
    pub token_budget: usize,
    pub results_minimal: usize,
    pub results_standard: usize,
    pub results_full: usize,
    /// TTL for cached goal-linked memory sets, in seconds.
    pub goal_cache_ttl_secs: u64,
    pub daily_notes: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            store_url: "http://127.0.0.1:8230".to_string(),
            token_budget: 700,
            results_minimal: 3,
            results_standard: 6,
            results_full: 10,
            goal_cache_ttl_secs: 30 * 60,
            daily_notes: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub max_turns: usize,
    /// Debounce window for history writes, in milliseconds.
    pub flush_ms: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_turns: 40,
            flush_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    pub enabled: bool,
    pub snapshot_interval_secs: u64,
    pub max_body_bytes: usize,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            snapshot_interval_secs: 5,
            max_body_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Composing watchdog: outbound composition longer than this aborts the
    /// in-flight LLM call.
    pub composing_timeout_secs: u64,
    /// Soft chunk threshold for outbound messages, in bytes.
    pub chunk_soft_bytes: usize,
    pub chunk_hard_bytes: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            composing_timeout_secs: 600,
            chunk_soft_bytes: 3_584,
            chunk_hard_bytes: 3_891,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub llm: LlmConfig,
    pub queue: QueueConfig,
    pub cron: CronConfig,
    pub workflow: WorkflowConfig,
    pub context: ContextConfig,
    pub memory: MemoryConfig,
    pub history: HistoryConfig,
    pub ipc: IpcConfig,
    pub channel: ChannelConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("ATTACHE_DATA_DIR") {
            if !value.is_empty() {
                config.agent.data_dir = value;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.agent.data_dir)
    }

    pub fn workflows_dir(&self) -> PathBuf {
        self.data_dir().join("workflows")
    }

    pub fn history_dir(&self) -> PathBuf {
        self.data_dir().join("history")
    }

    pub fn prompts_dir(&self) -> PathBuf {
        self.data_dir().join("cli-prompts")
    }

    pub fn notes_dir(&self) -> PathBuf {
        self.data_dir().join("notes")
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir().join("attache.db")
    }

    pub fn session_path(&self) -> PathBuf {
        self.data_dir().join("session.json")
    }

    pub fn ipc_port_path(&self) -> PathBuf {
        self.data_dir().join(".ipc-port")
    }
}
