//! Reply-outcome tracking — post-hoc classification of user reactions.
//!
//! When the user replies within a window of the bot's last outbound message,
//! the reaction is classified with keyword heuristics and persisted. The
//! rows feed memory trust signals and the dashboard; no model call is made.

use chrono::{DateTime, Utc};
use tracing::debug;

use attache_store::{Db, ReplyOutcome, Sentiment};

/// Reactions later than this are not attributed to the bot message.
const DEFAULT_WINDOW_MS: i64 = 5 * 60 * 1000;
const RESPONSE_SNIPPET_CHARS: usize = 200;

const POSITIVE_WORDS: &[&str] = &[
    "thanks", "thank", "great", "perfect", "nice", "awesome", "love", "good",
    "works", "helpful", "exactly", "yes",
];

const NEGATIVE_WORDS: &[&str] = &[
    "wrong", "bad", "no", "stop", "broken", "useless", "annoying", "not",
    "failed", "worse", "ugh", "terrible",
];

#[derive(Debug, Clone)]
struct LastOutbound {
    msg_id: String,
    at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct OutcomeTracker {
    last: Option<LastOutbound>,
    window_ms: i64,
}

impl OutcomeTracker {
    pub fn new() -> Self {
        Self { last: None, window_ms: DEFAULT_WINDOW_MS }
    }

    /// Note an outbound bot message so the next user reply can be matched.
    pub fn note_outbound(&mut self, msg_id: &str) {
        self.last = Some(LastOutbound { msg_id: msg_id.to_string(), at: Utc::now() });
    }

    /// Inspect an inbound user message. Records an outcome row only when the
    /// reply landed inside the window; the pairing is consumed either way.
    pub fn note_inbound(&mut self, db: &Db, text: &str) {
        let Some(last) = self.last.take() else {
            return;
        };
        let elapsed_ms = (Utc::now() - last.at).num_milliseconds();
        if elapsed_ms > self.window_ms {
            return;
        }

        let (sentiment, classification) = classify_reaction(text);
        let outcome = ReplyOutcome {
            bot_msg_id: last.msg_id,
            signal: "reply".to_string(),
            sentiment,
            classification: classification.to_string(),
            user_response: truncate_chars(text, RESPONSE_SNIPPET_CHARS),
            window_ms: elapsed_ms,
            ts: Utc::now(),
        };
        if let Err(err) = db.insert_outcome(&outcome) {
            debug!(%err, "reply outcome not persisted");
        }
    }
}

/// Keyword sentiment with a one-word negation lookback, plus a coarse
/// classification of what kind of reaction this is.
fn classify_reaction(text: &str) -> (Option<Sentiment>, &'static str) {
    let lower = text.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    let mut score = 0i32;
    for (i, word) in words.iter().enumerate() {
        let negated = i > 0 && matches!(words[i - 1], "not" | "no" | "never");
        if POSITIVE_WORDS.contains(word) {
            score += if negated { -1 } else { 1 };
        } else if NEGATIVE_WORDS.contains(word) {
            score += if negated { 1 } else { -1 };
        }
    }

    let sentiment = match score {
        s if s > 0 => Some(Sentiment::Positive),
        s if s < 0 => Some(Sentiment::Negative),
        _ => None,
    };

    let classification = if lower.contains('?') {
        "question"
    } else if matches!(sentiment, Some(Sentiment::Negative)) {
        "complaint"
    } else if matches!(sentiment, Some(Sentiment::Positive)) {
        "ack"
    } else if words.len() <= 3 {
        "terse"
    } else {
        "neutral"
    };

    (sentiment, classification)
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= max_chars {
        return text.to_string();
    }
    chars.into_iter().take(max_chars).collect()
}
