//! Serde model of the CLI's newline-delimited stream output.
//!
//! The subprocess emits one JSON object per line. Only four event shapes
//! matter to the adapter; everything else is decoded as [`StreamEvent::Other`]
//! and ignored so new CLI versions cannot break the stream loop.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Incremental text — forwarded to the per-token callback.
    ContentBlockDelta { delta: Delta },
    /// A new content block opened; tool blocks are surfaced to the tool-use
    /// callback with the tool name.
    ContentBlockStart { content_block: ContentBlock },
    /// A complete assistant message; its `tool_use` blocks are the canonical
    /// record of what the model touched.
    Assistant { message: AssistantMessage },
    /// Terminal event. Its absence means the stream was truncated.
    Result(ResultEvent),
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Delta {
    TextDelta { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResultEvent {
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub duration_ms: i64,
    #[serde(default)]
    pub duration_api_ms: i64,
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default)]
    pub usage: Usage,
    /// Error text when `is_error` is set.
    #[serde(default)]
    pub result: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
    #[serde(default)]
    pub cache_read_input_tokens: i64,
}

/// One tool invocation reported by an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolUse {
    pub name: String,
    pub input: serde_json::Value,
}

impl AssistantMessage {
    pub fn tool_uses(&self) -> Vec<ToolUse> {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse { name, input } => Some(ToolUse {
                    name: name.clone(),
                    input: input.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}
