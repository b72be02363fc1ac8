use anyhow::Result;
use serde::{Deserialize, Serialize};

/// State-change notifications the core pushes outward. The window surface
/// (or an outside controller) subscribes through the remote control façade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoreEvent {
    SessionAdded,
    SessionRemoved,
    SessionActivity,
    SessionAttention,
    WorktreeReserved,
    WorktreeReleased,
    WorktreeReclaimed,
    HookReceived,
}

impl CoreEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoreEvent::SessionAdded => "leitwerk:session-added",
            CoreEvent::SessionRemoved => "leitwerk:session-removed",
            CoreEvent::SessionActivity => "leitwerk:session-activity",
            CoreEvent::SessionAttention => "leitwerk:session-attention",
            CoreEvent::WorktreeReserved => "leitwerk:worktree-reserved",
            CoreEvent::WorktreeReleased => "leitwerk:worktree-released",
            CoreEvent::WorktreeReclaimed => "leitwerk:worktree-reclaimed",
            CoreEvent::HookReceived => "leitwerk:hook-received",
        }
    }
}

/// Seam between the core and whatever surfaces events to the outside.
/// Implementations must never block: a slow consumer is the façade's
/// problem, not the registry's.
pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: CoreEvent, payload: serde_json::Value);
}

pub fn emit_event<T: Serialize>(
    emitter: &dyn EventEmitter,
    event: CoreEvent,
    payload: &T,
) -> Result<()> {
    let value = serde_json::to_value(payload)?;
    emitter.emit(event, value);
    Ok(())
}

/// Emitter that drops everything; used by teardown paths that must not
/// fire notifications and by tests that don't observe events.
pub struct NullEmitter;

impl EventEmitter for NullEmitter {
    fn emit(&self, _event: CoreEvent, _payload: serde_json::Value) {}
}
