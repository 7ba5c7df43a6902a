//! Dynamic prompt construction: tiered assembly plus the context gate.

pub mod assembler;
pub mod gate;

pub use assembler::{AssembleRequest, ContextAssembler, PromptSection, Tier, sanitize_user_text};
pub use gate::{ContextGate, GateOutcome, estimate_tokens};
