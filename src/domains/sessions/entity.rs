use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Lifecycle of a supervised session.
///
/// `Starting → Running → {Idle, WaitingInput, NeedsAttention} → Exiting →
/// Terminated`. Attention states are derived by the activity monitor; a
/// terminated session is removed from the registry and its id never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionLifecycle {
    Starting,
    Running,
    Idle,
    WaitingInput,
    NeedsAttention,
    Exiting,
    Terminated,
}

impl SessionLifecycle {
    pub fn is_live(&self) -> bool {
        !matches!(self, SessionLifecycle::Exiting | SessionLifecycle::Terminated)
    }
}

/// Snapshot of a supervised session, as exposed through the remote control
/// façade. The process handle itself stays inside the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    /// Owning window, by identifier only. A closed window simply stops
    /// matching; there is nothing to dangle.
    pub window_id: String,
    pub command: String,
    pub reservation_id: Option<String>,
    pub worktree_path: Option<PathBuf>,
    pub lifecycle: SessionLifecycle,
    pub correlation_token: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: Option<DateTime<Utc>>,
}
