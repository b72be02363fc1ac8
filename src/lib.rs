//! Session orchestration core for desktop shells that supervise
//! long-lived command-line agent sessions, each in its own PTY and,
//! typically, its own isolated git worktree.
//!
//! The [`orchestrator::Orchestrator`] context owns the moving parts: the
//! hook callback server, the worktree reservation pool, the session
//! registry and the activity monitor. The embedding window surface talks
//! to the registry's contract and subscribes through the
//! [`services::RemoteControl`] façade.

pub mod config;
pub mod domains;
pub mod errors;
pub mod infrastructure;
pub mod orchestrator;
pub mod services;
pub mod shared;

pub use config::CoreConfig;
pub use errors::CoreError;
pub use orchestrator::{CleanupGuard, Orchestrator};
