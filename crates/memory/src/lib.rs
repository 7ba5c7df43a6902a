//! Memory index — the unified retrieval façade over the external semantic
//! store, goal intentions, and notes.
//!
//! One entry point: [`MemoryIndex::search`]. It fans out to every source in
//! parallel, deduplicates by fingerprint, applies per-source bonuses and
//! mention-feedback boosts, packs greedily into the caller's token budget,
//! and returns a section-grouped context block plus stats.

pub mod client;
pub mod mentions;

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use attache_config::MemoryConfig;
use attache_store::{Db, GoalStatus};

use client::SemanticClient;
use mentions::MentionTracker;

// ── Types ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Section {
    Core,
    Memories,
    Goals,
    Notes,
}

impl Section {
    fn header(self) -> &'static str {
        match self {
            Self::Core => "CORE:",
            Self::Memories => "MEMORIES:",
            Self::Goals => "GOALS:",
            Self::Notes => "NOTES:",
        }
    }

    /// Source bonus added on top of the raw relevance score.
    fn bonus(self) -> f32 {
        match self {
            Self::Core => 0.20,
            Self::Goals => 0.15,
            Self::Notes => 0.10,
            Self::Memories => 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemoryItem {
    pub text: String,
    pub score: f32,
    pub section: Section,
    pub fingerprint: String,
}

#[derive(Debug, Clone, Copy)]
pub struct SearchOptions {
    /// Semantic-store result count (tier dependent).
    pub limit: usize,
    /// Token budget for the final block.
    pub token_budget: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SearchStats {
    pub candidates: usize,
    pub after_dedup: usize,
    pub injected: usize,
    pub tokens_used: usize,
}

#[derive(Debug, Clone, Default)]
pub struct SearchResult {
    pub context_block: String,
    pub stats: SearchStats,
    pub injected: Vec<MemoryItem>,
}

/// Normalised lowercase prefix used to deduplicate across sources.
pub fn fingerprint(text: &str) -> String {
    let mut out = String::with_capacity(64);
    let mut last_space = true;
    for c in text.chars().flat_map(char::to_lowercase) {
        if out.len() >= 64 {
            break;
        }
        if c.is_alphanumeric() {
            out.push(c);
            last_space = false;
        } else if !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    out.trim_end().to_string()
}

fn estimate_tokens(text: &str) -> usize {
    text.len() / 4 + 1
}

// ── The index ─────────────────────────────────────────────────────────────────

pub struct MemoryIndex {
    client: SemanticClient,
    db: Arc<Db>,
    notes_dir: PathBuf,
    config: MemoryConfig,
    goal_cache: Mutex<LruCache<Uuid, (Instant, Vec<MemoryItem>)>>,
    mentions: Mutex<MentionTracker>,
}

impl MemoryIndex {
    pub fn new(config: MemoryConfig, db: Arc<Db>, notes_dir: PathBuf) -> Self {
        let cache_cap = NonZeroUsize::new(32).unwrap_or(NonZeroUsize::MIN);
        Self {
            client: SemanticClient::new(config.store_url.clone()),
            db,
            notes_dir,
            config,
            goal_cache: Mutex::new(LruCache::new(cache_cap)),
            mentions: Mutex::new(MentionTracker::default()),
        }
    }

    /// Feed the next user message into mention tracking before searching.
    pub async fn note_user_message(&self, message: &str) {
        let boosted = self.mentions.lock().await.note_user_message(message);
        if !boosted.is_empty() {
            debug!(count = boosted.len(), "mention feedback boosted injected memories");
        }
    }

    pub async fn search(&self, query: &str, opts: SearchOptions) -> SearchResult {
        let (semantic, intentions, goal_linked, notes) = tokio::join!(
            self.semantic_items(query, opts.limit),
            self.intention_items(query),
            self.goal_linked_items(query),
            self.notes_items(),
        );

        let mut stats = SearchStats::default();
        let candidates: Vec<MemoryItem> = semantic
            .into_iter()
            .chain(intentions)
            .chain(goal_linked)
            .chain(notes)
            .collect();
        stats.candidates = candidates.len();

        // Dedup across sources: the highest-scoring occurrence wins.
        let mut by_fingerprint: HashMap<String, MemoryItem> = HashMap::new();
        for item in candidates {
            match by_fingerprint.get(&item.fingerprint) {
                Some(existing) if existing.score >= item.score => {}
                _ => {
                    by_fingerprint.insert(item.fingerprint.clone(), item);
                }
            }
        }
        stats.after_dedup = by_fingerprint.len();

        let mentions = self.mentions.lock().await;
        let mut ranked: Vec<MemoryItem> = by_fingerprint
            .into_values()
            .map(|mut item| {
                item.score += item.section.bonus() + mentions.boost_for(&item.fingerprint);
                item
            })
            .collect();
        drop(mentions);
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));

        // Greedy token-budget packing.
        let mut injected = Vec::new();
        let mut tokens_used = 0usize;
        for item in ranked {
            let cost = estimate_tokens(&item.text);
            if tokens_used + cost > opts.token_budget {
                continue;
            }
            tokens_used += cost;
            injected.push(item);
        }
        stats.injected = injected.len();
        stats.tokens_used = tokens_used;

        self.mentions
            .lock()
            .await
            .record_injected(injected.iter().map(|i| (i.fingerprint.as_str(), i.text.as_str())));

        SearchResult {
            context_block: render_block(&injected),
            stats,
            injected,
        }
    }

    // ── Sources ───────────────────────────────────────────────────────────────

    async fn semantic_items(&self, query: &str, limit: usize) -> Vec<MemoryItem> {
        self.client
            .search(query, limit)
            .await
            .into_iter()
            .map(|hit| {
                let section = if hit.tier.eq_ignore_ascii_case("core") {
                    Section::Core
                } else {
                    Section::Memories
                };
                MemoryItem {
                    fingerprint: fingerprint(&hit.text),
                    text: hit.text,
                    score: hit.score,
                    section,
                }
            })
            .collect()
    }

    /// Goals and reminders whose topic overlaps the query.
    async fn intention_items(&self, query: &str) -> Vec<MemoryItem> {
        let goals = match self.db.list_goals() {
            Ok(goals) => goals,
            Err(err) => {
                warn!(%err, "goal store unavailable for intentions lookup");
                return Vec::new();
            }
        };

        goals
            .iter()
            .filter(|g| g.status == GoalStatus::Active)
            .filter_map(|goal| {
                let overlap = word_overlap(query, &format!("{} {}", goal.title, goal.notes));
                if overlap == 0 {
                    return None;
                }
                let next = goal
                    .milestones
                    .iter()
                    .find(|m| !m.done)
                    .map(|m| format!(" — next: {}", m.title))
                    .unwrap_or_default();
                let text = format!("Goal \"{}\"{next}", goal.title);
                Some(MemoryItem {
                    fingerprint: fingerprint(&text),
                    text,
                    score: 0.4 + 0.1 * overlap as f32,
                    section: Section::Goals,
                })
            })
            .collect()
    }

    /// Memories linked to a goal whose topic matches the query, with a
    /// 30-minute cache per goal id so repeated turns on one topic do not
    /// hammer the store.
    async fn goal_linked_items(&self, query: &str) -> Vec<MemoryItem> {
        let goals = self.db.list_goals().unwrap_or_default();
        let ttl = Duration::from_secs(self.config.goal_cache_ttl_secs);
        let mut out = Vec::new();

        for goal in goals.iter().filter(|g| g.status == GoalStatus::Active) {
            if word_overlap(query, &goal.title) == 0 {
                continue;
            }
            let cached = {
                let mut cache = self.goal_cache.lock().await;
                cache
                    .get(&goal.id)
                    .filter(|(at, _)| at.elapsed() < ttl)
                    .map(|(_, items)| items.clone())
            };
            let items = match cached {
                Some(items) => items,
                None => {
                    let items: Vec<MemoryItem> = self
                        .client
                        .search(&goal.title, 3)
                        .await
                        .into_iter()
                        .map(|hit| MemoryItem {
                            fingerprint: fingerprint(&hit.text),
                            text: hit.text,
                            score: hit.score * 0.9,
                            section: Section::Goals,
                        })
                        .collect();
                    self.goal_cache
                        .lock()
                        .await
                        .put(goal.id, (Instant::now(), items.clone()));
                    items
                }
            };
            out.extend(items);
        }
        out
    }

    async fn notes_items(&self) -> Vec<MemoryItem> {
        if !self.config.daily_notes {
            return Vec::new();
        }
        let today = chrono::Local::now().format("%Y-%m-%d").to_string();
        let paths = [
            self.notes_dir.join(format!("{today}.md")),
            self.notes_dir.join("user.md"),
        ];

        let mut items = Vec::new();
        for path in paths {
            let Ok(raw) = tokio::fs::read_to_string(&path).await else {
                continue;
            };
            let slice: String = raw
                .lines()
                .filter(|l| !l.trim().is_empty())
                .take(8)
                .collect::<Vec<_>>()
                .join(" / ");
            if slice.is_empty() {
                continue;
            }
            let text = truncate_chars(&slice, 280);
            items.push(MemoryItem {
                fingerprint: fingerprint(&text),
                text,
                score: 0.3,
                section: Section::Notes,
            });
        }
        items
    }
}

fn render_block(items: &[MemoryItem]) -> String {
    if items.is_empty() {
        return String::new();
    }
    let mut grouped: Vec<(Section, Vec<&MemoryItem>)> = Vec::new();
    for section in [Section::Core, Section::Memories, Section::Goals, Section::Notes] {
        let members: Vec<&MemoryItem> = items.iter().filter(|i| i.section == section).collect();
        if !members.is_empty() {
            grouped.push((section, members));
        }
    }

    grouped
        .into_iter()
        .map(|(section, members)| {
            let lines = members
                .iter()
                .map(|i| format!("- {}", i.text))
                .collect::<Vec<_>>()
                .join("\n");
            format!("{}\n{lines}", section.header())
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn word_overlap(a: &str, b: &str) -> usize {
    let set_a: std::collections::HashSet<String> = significant(a);
    let set_b: std::collections::HashSet<String> = significant(b);
    set_a.intersection(&set_b).count()
}

fn significant(text: &str) -> std::collections::HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 4)
        .map(|w| w.to_lowercase())
        .collect()
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= max_chars {
        return text.to_string();
    }
    let truncated: String = chars.into_iter().take(max_chars).collect();
    format!("{truncated}…")
}

#[cfg(test)]
mod tests {
    use super::*;
    use attache_store::{Goal, Milestone};

    fn index_with(db: Arc<Db>, notes_dir: PathBuf) -> MemoryIndex {
        let config = MemoryConfig {
            // Unreachable port — the semantic source degrades to empty.
            store_url: "http://127.0.0.1:1".to_string(),
            ..Default::default()
        };
        MemoryIndex::new(config, db, notes_dir)
    }

    #[test]
    fn fingerprint_normalises_case_punctuation_and_length() {
        assert_eq!(fingerprint("User LIKES  Rust!"), fingerprint("user likes rust"));
        let long = "x".repeat(500);
        assert!(fingerprint(&long).len() <= 64);
    }

    #[tokio::test]
    async fn active_goal_matching_query_is_injected() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let mut goal = Goal::new("Plan sailing holiday");
        goal.milestones.push(Milestone {
            title: "book the boat".to_string(),
            done: false,
            completed_at: None,
        });
        db.insert_goal(&goal).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let index = index_with(db, dir.path().to_path_buf());
        let result = index
            .search("when is the sailing holiday", SearchOptions { limit: 5, token_budget: 400 })
            .await;

        assert!(result.context_block.contains("GOALS:"));
        assert!(result.context_block.contains("Plan sailing holiday"));
        assert!(result.context_block.contains("book the boat"));
    }

    #[tokio::test]
    async fn paused_goals_are_not_injected() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let mut goal = Goal::new("Paused sailing project");
        goal.status = GoalStatus::Paused;
        db.insert_goal(&goal).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let index = index_with(db, dir.path().to_path_buf());
        let result = index
            .search("sailing project", SearchOptions { limit: 5, token_budget: 400 })
            .await;
        assert!(!result.context_block.contains("Paused sailing project"));
    }

    #[tokio::test]
    async fn token_budget_bounds_the_block() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        for i in 0..20 {
            db.insert_goal(&Goal::new(format!("alpha topic goal number {i} with a long title")))
                .unwrap();
        }
        let dir = tempfile::tempdir().unwrap();
        let index = index_with(db, dir.path().to_path_buf());

        let budget = 40;
        let result = index
            .search("alpha topic", SearchOptions { limit: 5, token_budget: budget })
            .await;
        assert!(result.stats.tokens_used <= budget);
        assert!(result.stats.injected < 20);
    }

    #[tokio::test]
    async fn no_duplicate_fingerprints_in_result() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        // Same normalised title twice under different case/punctuation —
        // the unique index is on the exact name so use distinct titles with
        // identical fingerprints.
        db.insert_goal(&Goal::new("Ship the report")).unwrap();
        db.insert_goal(&Goal::new("ship the REPORT!")).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let index = index_with(db, dir.path().to_path_buf());
        let result = index
            .search("ship report", SearchOptions { limit: 5, token_budget: 400 })
            .await;

        let mut seen = std::collections::HashSet::new();
        for item in &result.injected {
            assert!(seen.insert(item.fingerprint.clone()), "duplicate fingerprint injected");
        }
    }

    #[tokio::test]
    async fn notes_are_read_from_disk() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("user.md"), "Prefers short answers.\nHates spam.\n").unwrap();

        let index = index_with(db, dir.path().to_path_buf());
        let result = index
            .search("anything", SearchOptions { limit: 3, token_budget: 400 })
            .await;
        assert!(result.context_block.contains("NOTES:"));
        assert!(result.context_block.contains("Prefers short answers."));
    }

    #[tokio::test]
    async fn mention_feedback_boosts_future_rank() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        db.insert_goal(&Goal::new("Finish quarterly budget review")).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let index = index_with(db, dir.path().to_path_buf());

        let first = index
            .search("quarterly budget", SearchOptions { limit: 3, token_budget: 400 })
            .await;
        assert_eq!(first.injected.len(), 1);
        let fp = first.injected[0].fingerprint.clone();
        let base_score = first.injected[0].score;

        index.note_user_message("yes the quarterly budget review matters").await;

        let second = index
            .search("quarterly budget", SearchOptions { limit: 3, token_budget: 400 })
            .await;
        let boosted = second.injected.iter().find(|i| i.fingerprint == fp).unwrap();
        assert!(boosted.score > base_score, "mention must boost the item's score");
    }
}
