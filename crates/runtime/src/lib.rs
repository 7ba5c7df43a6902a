//! The daemon core: lifecycle, message pipeline, intent routing, outcome
//! tracking, and the channel adapter contract.

pub mod channel;
pub mod core;
pub mod outcome;
pub mod router;

pub use channel::{ChannelAdapter, InboundMessage, MessageKind};
pub use core::{Core, ExternalTools};
pub use outcome::OutcomeTracker;
pub use router::{Intent, classify};
