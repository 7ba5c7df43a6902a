//! Messaging adapter contract.
//!
//! The transport (WhatsApp, Telegram, console) lives outside the core; its
//! whole contract is this trait plus the inbound event struct. The core
//! never touches the wire.

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Media,
    Other,
}

/// One inbound message from the channel adapter.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Correspondent id (JID, chat id, …). Doubles as the queue key.
    pub from: String,
    pub body: String,
    pub ts: DateTime<Utc>,
    pub kind: MessageKind,
}

impl InboundMessage {
    pub fn text(from: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            body: body.into(),
            ts: Utc::now(),
            kind: MessageKind::Text,
        }
    }
}

/// Outbound side of the transport.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Send a text message; returns a transport message id used by the
    /// outcome tracker. `tag` distinguishes traffic classes (cron, alert).
    async fn send(&self, text: &str, tag: Option<&str>) -> Result<String>;

    /// Transfer a workspace file to the user.
    async fn send_file(&self, path: &Path) -> Result<()>;
}
