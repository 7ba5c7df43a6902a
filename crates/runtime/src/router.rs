//! Intent router — classify short utterances into built-in verbs.
//!
//! Only terse messages are considered; anything over the length cutoff, and
//! anything that does not match a verb pattern, falls through to a full LLM
//! turn. Misrouting a real question to a canned verb is worse than an
//! unnecessary model call, so patterns are anchored and conservative.

use regex::Regex;
use std::sync::OnceLock;

/// Messages longer than this are never routed to a verb.
const MAX_VERB_LEN: usize = 80;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Status,
    Help,
    ListCrons,
    ListGoals,
    /// Reset the persistent session ("new", "new chat").
    NewSession,
    PauseWorkflow(String),
    ResumeWorkflow(String),
    /// Everything else: a normal LLM turn.
    Chat,
}

fn workflow_verb_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(pause|resume)\s+(?:workflow\s+)?(\S.*)$")
            .expect("workflow verb pattern is valid")
    })
}

pub fn classify(message: &str) -> Intent {
    let trimmed = message.trim();
    if trimmed.len() > MAX_VERB_LEN || trimmed.is_empty() {
        return Intent::Chat;
    }
    let lower = trimmed.to_lowercase();

    match lower.as_str() {
        "status" | "/status" => return Intent::Status,
        "help" | "/help" | "?" => return Intent::Help,
        "crons" | "/crons" | "list crons" => return Intent::ListCrons,
        "goals" | "/goals" | "list goals" => return Intent::ListGoals,
        "new" | "/new" | "new chat" | "new session" => return Intent::NewSession,
        _ => {}
    }

    if let Some(captures) = workflow_verb_re().captures(trimmed) {
        if let (Some(verb), Some(name)) = (captures.get(1), captures.get(2)) {
            let name = name.as_str().trim().to_string();
            return if verb.as_str().eq_ignore_ascii_case("pause") {
                Intent::PauseWorkflow(name)
            } else {
                Intent::ResumeWorkflow(name)
            };
        }
    }

    Intent::Chat
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_verbs_route() {
        assert_eq!(classify("status"), Intent::Status);
        assert_eq!(classify("  STATUS "), Intent::Status);
        assert_eq!(classify("/help"), Intent::Help);
        assert_eq!(classify("crons"), Intent::ListCrons);
        assert_eq!(classify("new chat"), Intent::NewSession);
    }

    #[test]
    fn workflow_verbs_capture_the_name() {
        assert_eq!(
            classify("pause workflow weekly-report"),
            Intent::PauseWorkflow("weekly-report".to_string())
        );
        assert_eq!(classify("resume trip-plan"), Intent::ResumeWorkflow("trip-plan".to_string()));
    }

    #[test]
    fn questions_fall_through_to_chat() {
        assert_eq!(classify("what is my status at work?"), Intent::Chat);
        assert_eq!(classify("can you help me write an email"), Intent::Chat);
        assert_eq!(classify("pause"), Intent::Chat, "bare verb without a target is ambiguous");
    }

    #[test]
    fn long_messages_are_never_verbs() {
        let long = format!("status {}", "x".repeat(100));
        assert_eq!(classify(&long), Intent::Chat);
    }
}
