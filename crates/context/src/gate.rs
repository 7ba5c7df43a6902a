//! The context gate — measure, dedup, drop, truncate, or demand a reset.
//!
//! Sits between the assembler and the adapter. Pressure is the ratio of the
//! session's cumulative token estimate to the configured ceiling: above 0.85
//! low-signal sections are dropped, above 0.95 the prompt is truncated from
//! the low-priority end, and when even the compacted build cannot fit the
//! gate reports `reset_needed` so the adapter runs a compression cycle.

use std::collections::HashSet;

use tracing::debug;

use crate::assembler::PromptSection;

pub const DROP_PRESSURE: f32 = 0.85;
pub const TRUNCATE_PRESSURE: f32 = 0.95;

/// Rough token estimate: four bytes per token.
pub fn estimate_tokens(text: &str) -> usize {
    text.len() / 4 + 1
}

#[derive(Debug, Clone, Default)]
pub struct GateOutcome {
    pub prompt: String,
    pub pressure: f32,
    pub reset_needed: bool,
    pub dropped: Vec<&'static str>,
}

#[derive(Debug, Clone)]
pub struct ContextGate {
    token_ceiling: u64,
}

impl ContextGate {
    pub fn new(token_ceiling: u64) -> Self {
        Self { token_ceiling: token_ceiling.max(1) }
    }

    /// Compose the final prompt from assembled sections plus the user text.
    ///
    /// `byte_budget` is the tier's size target for the dynamic context;
    /// `session_tokens` drives the pressure thresholds.
    pub fn compose(
        &self,
        sections: Vec<PromptSection>,
        user_message: &str,
        session_tokens: u64,
        byte_budget: usize,
    ) -> GateOutcome {
        let pressure = session_tokens as f32 / self.token_ceiling as f32;
        let mut dropped = Vec::new();

        let mut sections = dedup_paragraphs(sections);

        if pressure > DROP_PRESSURE {
            sections.retain(|s| {
                if s.low_signal {
                    dropped.push(s.name);
                    false
                } else {
                    true
                }
            });
        }

        // Fit to the byte budget by dropping the least important sections
        // (highest priority number) first. The user message is never cut.
        let mut total: usize = sections.iter().map(|s| s.text.len()).sum();
        let over_budget = |total: usize| total > byte_budget;
        while over_budget(total) && sections.len() > 1 {
            let Some((idx, _)) = sections
                .iter()
                .enumerate()
                .max_by_key(|(_, s)| s.priority)
                .filter(|(_, s)| s.priority > 0)
            else {
                break;
            };
            let removed = sections.remove(idx);
            total -= removed.text.len();
            dropped.push(removed.name);
        }

        if pressure > TRUNCATE_PRESSURE && over_budget(total) {
            // Last resort: cut the tail of the lowest-priority survivor.
            if let Some(last) = sections.iter_mut().max_by_key(|s| s.priority) {
                let excess = total - byte_budget;
                let keep = last.text.len().saturating_sub(excess);
                let keep = floor_char_boundary(&last.text, keep);
                last.text.truncate(keep);
                total = sections.iter().map(|s| s.text.len()).sum();
            }
        }

        let mut prompt = String::with_capacity(total + user_message.len() + 64);
        for section in &sections {
            if section.text.trim().is_empty() {
                continue;
            }
            prompt.push_str(&section.text);
            if !prompt.ends_with('\n') {
                prompt.push('\n');
            }
            prompt.push('\n');
        }
        prompt.push_str(user_message);

        let prompt_tokens = estimate_tokens(&prompt) as u64;
        let reset_needed = session_tokens.saturating_add(prompt_tokens) >= self.token_ceiling;
        if reset_needed {
            debug!(session_tokens, prompt_tokens, ceiling = self.token_ceiling, "gate: reset needed");
        }

        GateOutcome { prompt, pressure, reset_needed, dropped }
    }
}

/// Remove paragraphs that repeat verbatim across the assembled sections.
fn dedup_paragraphs(sections: Vec<PromptSection>) -> Vec<PromptSection> {
    let mut seen: HashSet<String> = HashSet::new();
    sections
        .into_iter()
        .map(|mut section| {
            let kept: Vec<&str> = section
                .text
                .split("\n\n")
                .filter(|para| {
                    let norm = para.trim().to_string();
                    if norm.is_empty() {
                        return true;
                    }
                    seen.insert(norm)
                })
                .collect();
            section.text = kept.join("\n\n");
            section
        })
        .filter(|s| !s.text.trim().is_empty())
        .collect()
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    index = index.min(text.len());
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}
