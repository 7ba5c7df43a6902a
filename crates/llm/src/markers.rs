//! Action-marker extraction from completed replies.
//!
//! The model signals side-effects with short bracketed tokens
//! (`[CRON_ADD: …]`, `[SEND_FILE: …]`, …) and an XML-ish
//! `<tool_call name="…">…</tool_call>` form. This module is a small
//! tokeniser over that grammar: it walks the full final text once, yields a
//! typed action list, and returns the text with every marker stripped so
//! downstream consumers never see raw markers.
//!
//! Keywords match case-sensitively. An opening bracket that is not followed
//! by a known keyword is ordinary text and survives untouched.

use serde_json::Value;
use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub enum MarkerAction {
    CronAdd {
        name: String,
        schedule: String,
        prompt: String,
        delivery: Option<String>,
        model: Option<String>,
    },
    CronDelete { target: String },
    CronToggle { target: String },
    CronRun { target: String },
    SendFile { path: String },
    ToolCall { name: String, params: Value },
}

#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub clean_text: String,
    pub actions: Vec<MarkerAction>,
}

const BRACKET_KEYWORDS: &[&str] = &[
    "CRON_ADD", "CRON_DELETE", "CRON_TOGGLE", "CRON_RUN", "SEND_FILE", "TOOL_CALL",
];

/// Scan `text` for action markers. Always succeeds; malformed markers are
/// logged, dropped from the action list, and stripped from the text anyway
/// (a half-formed marker shown to the user is worse than a swallowed one).
pub fn extract(text: &str) -> Extraction {
    let mut clean = String::with_capacity(text.len());
    let mut actions = Vec::new();
    let mut rest = text;

    loop {
        let Some(open) = rest.find('[') else {
            clean.push_str(rest);
            break;
        };
        let (before, from_bracket) = rest.split_at(open);
        clean.push_str(before);

        match parse_bracket(from_bracket) {
            Some((consumed, action)) => {
                if let Some(action) = action {
                    actions.push(action);
                }
                rest = &from_bracket[consumed..];
            }
            None => {
                // Not a marker — keep the bracket as text.
                clean.push('[');
                rest = &from_bracket[1..];
            }
        }
    }

    let (clean, tool_calls) = extract_xml_tool_calls(&clean);
    actions.extend(tool_calls);

    Extraction { clean_text: tidy(&clean), actions }
}

/// Parse one `[KEYWORD: body]` starting at `text[0] == '['`.
///
/// Returns `Some((bytes_consumed, action))` when the bracket holds a known
/// keyword; the action is `None` for recognised-but-malformed bodies.
fn parse_bracket(text: &str) -> Option<(usize, Option<MarkerAction>)> {
    let inner = &text[1..];
    let keyword = BRACKET_KEYWORDS
        .iter()
        .find(|kw| inner.starts_with(**kw) && inner[kw.len()..].starts_with(':'))?;
    let body_start = keyword.len() + 1;

    let (body, consumed) = match *keyword {
        // TOOL_CALL params are JSON and may themselves contain `]`; try each
        // candidate closer until the params parse.
        "TOOL_CALL" => find_json_aware_close(&inner[body_start..])
            .map(|(body, end)| (body, 1 + body_start + end + 1))?,
        _ => {
            let end = inner[body_start..].find(']')?;
            (&inner[body_start..body_start + end], 1 + body_start + end + 1)
        }
    };

    let action = build_action(keyword, body.trim());
    if action.is_none() {
        warn!(keyword, body, "malformed action marker dropped");
    }
    Some((consumed, action))
}

/// For TOOL_CALL bodies: locate the `]` that terminates the marker by trying
/// each candidate and checking whether the JSON half parses.
fn find_json_aware_close(body: &str) -> Option<(&str, usize)> {
    let mut search_from = 0;
    let mut first: Option<usize> = None;
    while let Some(at) = body[search_from..].find(']') {
        let end = search_from + at;
        first.get_or_insert(end);
        let candidate = &body[..end];
        match candidate.split_once('|') {
            Some((_, params)) if serde_json::from_str::<Value>(params.trim()).is_ok() => {
                return Some((candidate, end));
            }
            None => return Some((candidate, end)),
            Some(_) => search_from = end + 1,
        }
    }
    // No candidate parsed — fall back to the first `]` so the marker is at
    // least stripped from the text.
    first.map(|end| (&body[..end], end))
}

fn build_action(keyword: &str, body: &str) -> Option<MarkerAction> {
    match keyword {
        "CRON_ADD" => {
            let parts: Vec<&str> = body.split('|').map(str::trim).collect();
            if parts.len() < 3 {
                return None;
            }
            let name = parts[0].to_string();
            let schedule = parts[1].to_string();
            if name.is_empty() || schedule.is_empty() {
                return None;
            }

            // Optional trailing fields: `… | delivery | model`. The delivery
            // slot is only claimed when it parses, so a prompt containing a
            // pipe keeps its tail.
            let mut prompt_end = parts.len();
            let mut delivery = None;
            let mut model = None;
            if parts.len() >= 5 && is_delivery(parts[parts.len() - 2]) {
                delivery = Some(parts[parts.len() - 2].to_ascii_lowercase());
                model = Some(parts[parts.len() - 1].to_string());
                prompt_end = parts.len() - 2;
            } else if parts.len() >= 4 && is_delivery(parts[parts.len() - 1]) {
                delivery = Some(parts[parts.len() - 1].to_ascii_lowercase());
                prompt_end = parts.len() - 1;
            }

            let prompt = parts[2..prompt_end].join(" | ");
            if prompt.is_empty() {
                return None;
            }
            Some(MarkerAction::CronAdd { name, schedule, prompt, delivery, model })
        }
        "CRON_DELETE" | "CRON_TOGGLE" | "CRON_RUN" => {
            let target = body.to_string();
            if target.is_empty() {
                return None;
            }
            Some(match keyword {
                "CRON_DELETE" => MarkerAction::CronDelete { target },
                "CRON_TOGGLE" => MarkerAction::CronToggle { target },
                _ => MarkerAction::CronRun { target },
            })
        }
        "SEND_FILE" => {
            if body.is_empty() {
                return None;
            }
            Some(MarkerAction::SendFile { path: body.to_string() })
        }
        "TOOL_CALL" => {
            let (name, params) = match body.split_once('|') {
                Some((name, params)) => {
                    let params = serde_json::from_str(params.trim()).ok()?;
                    (name.trim(), params)
                }
                None => (body, Value::Null),
            };
            if name.is_empty() {
                return None;
            }
            Some(MarkerAction::ToolCall { name: name.to_string(), params })
        }
        _ => None,
    }
}

fn is_delivery(s: &str) -> bool {
    s.eq_ignore_ascii_case("announce") || s.eq_ignore_ascii_case("silent")
}

/// The `<tool_call name="…">json</tool_call>` alternative form.
fn extract_xml_tool_calls(text: &str) -> (String, Vec<MarkerAction>) {
    let mut clean = String::with_capacity(text.len());
    let mut actions = Vec::new();
    let mut rest = text;

    while let Some(start) = rest.find("<tool_call ") {
        let (before, tag) = rest.split_at(start);
        let parsed = tag.find('>').and_then(|head_end| {
            let head = &tag[..head_end];
            let name = head.split_once("name=\"").and_then(|(_, after)| {
                after.split_once('"').map(|(name, _)| name.to_string())
            })?;
            let close = tag.find("</tool_call>")?;
            let body = tag[head_end + 1..close].trim();
            let params = serde_json::from_str(body).unwrap_or(Value::Null);
            Some((close + "</tool_call>".len(), name, params))
        });

        clean.push_str(before);
        match parsed {
            Some((consumed, name, params)) => {
                actions.push(MarkerAction::ToolCall { name, params });
                rest = &tag[consumed..];
            }
            None => {
                clean.push_str("<tool_call ");
                rest = &tag["<tool_call ".len()..];
            }
        }
    }
    clean.push_str(rest);
    (clean, actions)
}

/// Collapse the holes markers leave behind: runs of 3+ newlines and
/// whitespace-only lines produced by stripping.
fn tidy(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0;
    for line in text.lines() {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
            out.push('\n');
        } else {
            blank_run = 0;
            out.push_str(line.trim_end());
            out.push('\n');
        }
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cron_add_with_all_fields() {
        let text = "Done! [CRON_ADD: standup | 0 9 * * 1-5 | Summarise my calendar | silent | haiku]";
        let extraction = extract(text);
        assert_eq!(extraction.clean_text, "Done!");
        assert_eq!(
            extraction.actions,
            vec![MarkerAction::CronAdd {
                name: "standup".to_string(),
                schedule: "0 9 * * 1-5".to_string(),
                prompt: "Summarise my calendar".to_string(),
                delivery: Some("silent".to_string()),
                model: Some("haiku".to_string()),
            }]
        );
    }

    #[test]
    fn cron_add_prompt_keeps_unclaimed_pipes() {
        let text = "[CRON_ADD: j | * * * * * | do this | then that]";
        let extraction = extract(text);
        let MarkerAction::CronAdd { prompt, delivery, .. } = &extraction.actions[0] else {
            panic!("expected CronAdd");
        };
        assert_eq!(prompt, "do this | then that");
        assert!(delivery.is_none());
    }

    #[test]
    fn delete_toggle_run_by_name() {
        let extraction = extract("[CRON_DELETE: old-job] [CRON_TOGGLE: nightly] [CRON_RUN: nightly]");
        assert_eq!(extraction.actions.len(), 3);
        assert_eq!(extraction.clean_text, "");
    }

    #[test]
    fn tool_call_with_json_params_containing_brackets() {
        let text = r#"[TOOL_CALL: search | {"q": "arrays like [1, 2]"}]"#;
        let extraction = extract(text);
        assert_eq!(
            extraction.actions,
            vec![MarkerAction::ToolCall {
                name: "search".to_string(),
                params: json!({"q": "arrays like [1, 2]"}),
            }]
        );
        assert_eq!(extraction.clean_text, "");
    }

    #[test]
    fn xml_tool_call_form() {
        let text = "Let me check.\n<tool_call name=\"weather\">{\"city\":\"Oslo\"}</tool_call>\nBack soon.";
        let extraction = extract(text);
        assert_eq!(extraction.clean_text, "Let me check.\n\nBack soon.");
        assert_eq!(
            extraction.actions,
            vec![MarkerAction::ToolCall {
                name: "weather".to_string(),
                params: json!({"city": "Oslo"}),
            }]
        );
    }

    #[test]
    fn unknown_bracket_content_is_left_alone() {
        let text = "scores were [3, 2] yesterday [not a marker]";
        let extraction = extract(text);
        assert!(extraction.actions.is_empty());
        assert_eq!(extraction.clean_text, text);
    }

    #[test]
    fn lowercase_keyword_is_not_a_marker() {
        let extraction = extract("[cron_add: x | * * * * * | y]");
        assert!(extraction.actions.is_empty());
        assert!(extraction.clean_text.contains("[cron_add:"));
    }

    #[test]
    fn malformed_marker_is_stripped_but_yields_no_action() {
        let extraction = extract("before [CRON_ADD: only-name] after");
        assert!(extraction.actions.is_empty());
        assert_eq!(extraction.clean_text, "before  after");
    }

    #[test]
    fn send_file() {
        let extraction = extract("Here you go [SEND_FILE: reports/week-31.pdf]");
        assert_eq!(
            extraction.actions,
            vec![MarkerAction::SendFile { path: "reports/week-31.pdf".to_string() }]
        );
    }

    #[test]
    fn marker_text_is_fully_removed_even_mid_paragraph() {
        let text = "a\n\n[CRON_RUN: x]\n\nb";
        let extraction = extract(text);
        assert_eq!(extraction.clean_text, "a\n\nb");
    }
}
