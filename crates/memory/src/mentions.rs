//! Mention tracking — did the user engage with what we injected?
//!
//! The last successfully-injected memory set is remembered. When the next
//! user message shares two or more significant words with one of those
//! items, that item's fingerprint earns a weight boost applied to future
//! searches. This closes the relevance feedback loop without any model call.

use std::collections::{HashMap, HashSet};

/// Boost added per confirmed mention; capped so one lucky overlap cannot
/// dominate ranking forever.
const MENTION_BOOST: f32 = 0.15;
const MAX_BOOST: f32 = 0.45;
const MIN_OVERLAP: usize = 2;

#[derive(Debug, Default)]
pub struct MentionTracker {
    /// fingerprint → accumulated boost.
    boosts: HashMap<String, f32>,
    /// `(fingerprint, significant words)` of the last injected set.
    last_injected: Vec<(String, HashSet<String>)>,
}

impl MentionTracker {
    /// Record the items that made it into the last assembled context.
    pub fn record_injected<'a>(&mut self, items: impl Iterator<Item = (&'a str, &'a str)>) {
        self.last_injected = items
            .map(|(fingerprint, text)| (fingerprint.to_string(), significant_words(text)))
            .collect();
    }

    /// Inspect an incoming user message and boost any injected item it
    /// engages with. Returns the fingerprints that were boosted.
    pub fn note_user_message(&mut self, message: &str) -> Vec<String> {
        let message_words = significant_words(message);
        let mut boosted = Vec::new();
        for (fingerprint, item_words) in &self.last_injected {
            let overlap = item_words.intersection(&message_words).count();
            if overlap >= MIN_OVERLAP {
                let entry = self.boosts.entry(fingerprint.clone()).or_insert(0.0);
                *entry = (*entry + MENTION_BOOST).min(MAX_BOOST);
                boosted.push(fingerprint.clone());
            }
        }
        boosted
    }

    pub fn boost_for(&self, fingerprint: &str) -> f32 {
        self.boosts.get(fingerprint).copied().unwrap_or(0.0)
    }
}

/// Common English stop words excluded from the overlap test, so that shared
/// filler ("that", "with") never counts as engagement.
const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "was", "has", "are", "not", "this", "that",
    "with", "from", "have", "you", "can", "its", "will", "but", "they",
    "all", "been", "also", "into", "more", "than", "when", "who", "what",
    "how", "out", "our", "new", "now", "about", "just", "like", "some",
];

fn significant_words(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 4)
        .map(|w| w.to_lowercase())
        .filter(|w| !STOP_WORDS.contains(&w.as_str()))
        .collect()
}
