//! Tiered assembly of the dynamic per-turn prompt.
//!
//! Three tiers trade context richness against size: minimal (~2 KB) for
//! throwaway exchanges, standard (~5 KB) for normal turns, full (~12 KB)
//! when the message looks complex or the user asked for depth. The selected
//! tier drives how much persona text, how many skill documents, and how many
//! memory results are pulled in.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Local, Utc};
use tracing::debug;

use attache_config::{ContextConfig, MemoryConfig};
use attache_memory::{MemoryIndex, SearchOptions};
use attache_store::{ConversationHistory, Db, GoalStatus};

// ── Tier selection ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Tier {
    Minimal,
    Standard,
    Full,
}

/// Words that suggest a turn needs the full context treatment.
const COMPLEXITY_KEYWORDS: &[&str] = &[
    "plan", "analyse", "analyze", "compare", "design", "research", "organise",
    "organize", "summarise", "summarize", "workflow", "schedule", "project",
    "explain", "detail", "review",
];

impl Tier {
    pub fn select(
        message: &str,
        pressure: f32,
        budget_used_frac: f64,
        frustrated_hint: bool,
    ) -> Tier {
        let lower = message.to_lowercase();
        let complex = COMPLEXITY_KEYWORDS.iter().any(|kw| lower.contains(kw));

        let mut tier = if message.len() > 400 || complex {
            Tier::Full
        } else if message.len() < 60 {
            Tier::Minimal
        } else {
            Tier::Standard
        };

        // A frustrated user gets at least the standard treatment.
        if frustrated_hint && tier == Tier::Minimal {
            tier = Tier::Standard;
        }
        // Under context or cost pressure, step down one level.
        if pressure > 0.85 || budget_used_frac > 0.9 {
            tier = match tier {
                Tier::Full => Tier::Standard,
                _ => Tier::Minimal,
            };
        }
        tier
    }

    pub fn byte_budget(self, config: &ContextConfig) -> usize {
        match self {
            Tier::Minimal => config.minimal_budget,
            Tier::Standard => config.standard_budget,
            Tier::Full => config.full_budget,
        }
    }

    fn memory_limit(self, config: &MemoryConfig) -> usize {
        match self {
            Tier::Minimal => config.results_minimal,
            Tier::Standard => config.results_standard,
            Tier::Full => config.results_full,
        }
    }
}

// ── Sections ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PromptSection {
    pub name: &'static str,
    pub text: String,
    /// Lower is more important; priority 0 is never dropped for budget.
    pub priority: u8,
    /// Dropped first under context pressure.
    pub low_signal: bool,
}

pub struct AssembleRequest<'a> {
    pub message: &'a str,
    pub history: &'a ConversationHistory,
    /// Names of the external tools currently registered.
    pub tools: &'a [String],
    pub frustrated_hint: bool,
}

/// Strip header-like lines from user-controlled text so a message cannot
/// smuggle fake context sections into the prompt.
pub fn sanitize_user_text(text: &str) -> String {
    text.lines()
        .filter(|line| {
            let trimmed = line.trim_start();
            !(trimmed.starts_with("##") || trimmed.starts_with("###"))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub struct ContextAssembler {
    memory: Arc<MemoryIndex>,
    db: Arc<Db>,
    config: ContextConfig,
    memory_config: MemoryConfig,
    persona_path: PathBuf,
}

impl ContextAssembler {
    pub fn new(
        memory: Arc<MemoryIndex>,
        db: Arc<Db>,
        config: ContextConfig,
        memory_config: MemoryConfig,
        persona_path: PathBuf,
    ) -> Self {
        Self { memory, db, config, memory_config, persona_path }
    }

    /// Build the ordered section list for one turn. The caller passes the
    /// result through the gate, which owns fitting and measurement.
    pub async fn assemble(&self, tier: Tier, req: &AssembleRequest<'_>) -> Vec<PromptSection> {
        let mut sections = Vec::new();

        if let Some(persona) = self.persona_section(tier).await {
            sections.push(persona);
        }
        if !req.tools.is_empty() {
            sections.push(PromptSection {
                name: "capabilities",
                text: format!(
                    "AVAILABLE TOOLS (invoke with [TOOL_CALL: name | {{json}}]):\n{}",
                    req.tools.iter().map(|t| format!("- {t}")).collect::<Vec<_>>().join("\n"),
                ),
                priority: 1,
                low_signal: false,
            });
        }
        if tier >= Tier::Standard {
            if let Some(skills) = self.skills_section(tier, req.message).await {
                sections.push(skills);
            }
        }
        if let Some(goals) = self.goals_section(tier) {
            sections.push(goals);
        }

        let memory_result = self
            .memory
            .search(
                req.message,
                SearchOptions {
                    limit: tier.memory_limit(&self.memory_config),
                    token_budget: self.memory_config.token_budget,
                },
            )
            .await;
        if !memory_result.context_block.is_empty() {
            sections.push(PromptSection {
                name: "memories",
                text: format!("MEMORY CONTEXT:\n{}", memory_result.context_block),
                priority: 2,
                low_signal: false,
            });
        }
        debug!(
            injected = memory_result.stats.injected,
            tokens = memory_result.stats.tokens_used,
            "memory context assembled"
        );

        sections.push(self.environment_section(req.history));

        if let Some(flags) = tone_flags(req.message, req.frustrated_hint) {
            sections.push(flags);
        }

        sections
    }

    async fn persona_section(&self, tier: Tier) -> Option<PromptSection> {
        let raw = tokio::fs::read_to_string(&self.persona_path).await.ok()?;
        let text = match tier {
            Tier::Minimal => raw.lines().take(30).collect::<Vec<_>>().join("\n"),
            Tier::Standard => raw.lines().take(80).collect::<Vec<_>>().join("\n"),
            Tier::Full => raw,
        };
        Some(PromptSection { name: "persona", text, priority: 0, low_signal: false })
    }

    /// Skill documents matched by filename/heading keywords against the
    /// message. Speculative by nature, so they are the first thing the gate
    /// sheds under pressure.
    async fn skills_section(&self, tier: Tier, message: &str) -> Option<PromptSection> {
        let cap = match tier {
            Tier::Full => self.config.max_skills_full,
            _ => self.config.max_skills_standard,
        };
        let dir = PathBuf::from(&self.config.skills_dir);
        let mut entries = tokio::fs::read_dir(&dir).await.ok()?;
        let message_lower = message.to_lowercase();

        let mut matched = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            if matched.len() >= cap {
                break;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let stem = name.trim_end_matches(".md").replace(['-', '_'], " ");
            let hit = stem
                .split_whitespace()
                .any(|word| word.len() >= 4 && message_lower.contains(word));
            if !hit {
                continue;
            }
            if let Ok(content) = tokio::fs::read_to_string(entry.path()).await {
                let head: String = content.lines().take(40).collect::<Vec<_>>().join("\n");
                matched.push(format!("### Skill: {stem}\n{head}"));
            }
        }

        if matched.is_empty() {
            return None;
        }
        Some(PromptSection {
            name: "skills",
            text: format!("RELEVANT SKILLS:\n{}", matched.join("\n\n")),
            priority: 5,
            low_signal: true,
        })
    }

    fn goals_section(&self, tier: Tier) -> Option<PromptSection> {
        let goals = self.db.list_goals().ok()?;
        let active: Vec<_> = goals.iter().filter(|g| g.status == GoalStatus::Active).collect();
        if active.is_empty() {
            return None;
        }

        let body = active
            .iter()
            .map(|goal| {
                let next = goal
                    .milestones
                    .iter()
                    .find(|m| !m.done)
                    .map(|m| format!(" (next: {})", m.title))
                    .unwrap_or_default();
                let mut line = format!("- {}{next}", goal.title);
                if tier == Tier::Full && !goal.activity.is_empty() {
                    let tail = goal
                        .activity
                        .iter()
                        .rev()
                        .take(3)
                        .map(|(at, note)| format!("    {} {}", at.format("%m-%d"), note))
                        .collect::<Vec<_>>()
                        .join("\n");
                    line.push('\n');
                    line.push_str(&tail);
                }
                line
            })
            .collect::<Vec<_>>()
            .join("\n");

        Some(PromptSection {
            name: "goals",
            text: format!("ACTIVE GOALS:\n{body}"),
            priority: 3,
            low_signal: false,
        })
    }

    fn environment_section(&self, history: &ConversationHistory) -> PromptSection {
        let now = Local::now();
        let mut text = format!("Current local time: {}.", now.format("%A %H:%M"));

        // A long silence earns a short recap so the model re-anchors.
        let gap_hours = history
            .last()
            .map(|turn| (Utc::now() - turn.timestamp).num_hours())
            .unwrap_or(0);
        if gap_hours >= self.config.recap_after_hours {
            let recap = history
                .recent(6)
                .iter()
                .map(|turn| {
                    let who = match turn.role {
                        attache_store::Role::User => "User",
                        attache_store::Role::Assistant => "You",
                    };
                    format!("{who}: {}", truncate_chars(&turn.content, 120))
                })
                .collect::<Vec<_>>()
                .join("\n");
            if !recap.is_empty() {
                text.push_str(&format!(
                    "\nIt has been {gap_hours}h since the last exchange. Recap:\n{recap}"
                ));
            }
        }

        PromptSection { name: "environment", text, priority: 4, low_signal: false }
    }
}

/// Short-message heuristics: terse follow-ups and frustrated tone.
fn tone_flags(message: &str, frustrated_hint: bool) -> Option<PromptSection> {
    let trimmed = message.trim();
    let mut flags = Vec::new();

    if trimmed.len() < 20 && (trimmed.ends_with('?') || trimmed.ends_with("??")) {
        flags.push("The message is a terse follow-up to your previous reply.");
    }
    let lower = trimmed.to_lowercase();
    let frustrated = frustrated_hint
        || ["ugh", "wtf", "broken", "again??", "still not", "doesn't work", "doesnt work"]
            .iter()
            .any(|phrase| lower.contains(phrase));
    if frustrated {
        flags.push("The user sounds frustrated — acknowledge and fix, do not over-explain.");
    }

    if flags.is_empty() {
        return None;
    }
    Some(PromptSection {
        name: "tone",
        text: flags.join("\n"),
        priority: 6,
        low_signal: false,
    })
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= max_chars {
        return text.to_string();
    }
    let truncated: String = chars.into_iter().take(max_chars).collect();
    format!("{truncated}…")
}
