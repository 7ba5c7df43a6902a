//! LLM CLI adapter — subprocess management, stream decoding, chunking,
//! marker extraction, and session/compression bookkeeping.

pub mod adapter;
pub mod chunker;
pub mod events;
pub mod markers;
pub mod session;

pub use adapter::{AbortHandle, AbortSignal, Callbacks, CliAdapter, LlmError, LlmReply, OneShotOptions};
pub use chunker::Chunker;
pub use events::{ToolUse, Usage};
pub use markers::{Extraction, MarkerAction, extract as extract_markers};
pub use session::{SessionState, SessionTracker};
