//! Loopback IPC surface: bearer-authenticated HTTP + WebSocket for
//! operational tools and the dashboard.

pub mod auth;
pub mod server;

pub use auth::{TokenGuard, generate_token};
pub use server::{IpcCommand, IpcServer, PushEvent, ServerDeps};
