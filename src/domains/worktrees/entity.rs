use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationState {
    /// Idle in the pool, ready for fast checkout.
    Reserved,
    /// Bound to exactly one session.
    CheckedOut,
    Released,
    /// On disk with no living owner; reclaimed by cleanup.
    Orphaned,
}

/// A checked-out, isolated git working tree bound to at most one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeReservation {
    pub id: String,
    pub repository_path: PathBuf,
    pub worktree_path: PathBuf,
    pub branch: String,
    pub base_branch: String,
    pub state: ReservationState,
    pub owning_session_id: Option<String>,
    pub reserved_at: DateTime<Utc>,
}

impl WorktreeReservation {
    pub fn is_idle(&self) -> bool {
        self.state == ReservationState::Reserved
    }
}
