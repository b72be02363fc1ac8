use crate::domains::sessions::entity::Session;
use crate::domains::sessions::registry::SessionRegistry;
use crate::domains::worktrees::{WorktreePool, WorktreeReservation};
use crate::infrastructure::events::{CoreEvent, EventEmitter};
use log::debug;
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

/// An event as handed to the attached sink (or buffered until one shows up).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundEvent {
    pub name: String,
    pub payload: serde_json::Value,
}

/// Where state-change events go: the window surface or an outside
/// controller. Implementations must return quickly; anything slow belongs
/// on the consumer's side of the seam.
pub trait EventSink: Send + Sync {
    fn send(&self, event: &OutboundEvent);
}

struct RemoteState {
    sink: Option<Arc<dyn EventSink>>,
    buffer: VecDeque<OutboundEvent>,
}

/// Read-mostly façade over the core: session/worktree snapshots plus a
/// subscription stream of state-change events.
///
/// Without a sink, events accumulate in a bounded buffer and the oldest are
/// dropped beyond the bound; the core never blocks on a missing or slow
/// consumer.
pub struct RemoteControl {
    buffer_size: usize,
    state: Mutex<RemoteState>,
    registry: OnceCell<Weak<SessionRegistry>>,
    pool: OnceCell<Weak<WorktreePool>>,
}

impl RemoteControl {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size,
            state: Mutex::new(RemoteState {
                sink: None,
                buffer: VecDeque::new(),
            }),
            registry: OnceCell::new(),
            pool: OnceCell::new(),
        }
    }

    /// Wire the snapshot sources; called once during orchestrator assembly.
    pub fn attach_sources(&self, registry: &Arc<SessionRegistry>, pool: &Arc<WorktreePool>) {
        let _ = self.registry.set(Arc::downgrade(registry));
        let _ = self.pool.set(Arc::downgrade(pool));
    }

    /// Attach (or replace) the active output sink. Idempotent for the same
    /// sink. Buffered events flush to the new sink in arrival order.
    pub fn set_sink(&self, sink: Arc<dyn EventSink>) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());

        if let Some(current) = &state.sink
            && Arc::ptr_eq(current, &sink)
        {
            return;
        }

        for event in state.buffer.drain(..) {
            sink.send(&event);
        }
        state.sink = Some(sink);
    }

    pub fn clear_sink(&self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.sink = None;
    }

    pub async fn session_snapshot(&self) -> Vec<Session> {
        match self.registry.get().and_then(Weak::upgrade) {
            Some(registry) => registry.snapshot().await,
            None => Vec::new(),
        }
    }

    pub async fn worktree_snapshot(&self) -> Vec<WorktreeReservation> {
        match self.pool.get().and_then(Weak::upgrade) {
            Some(pool) => pool.snapshot().await,
            None => Vec::new(),
        }
    }
}

impl EventEmitter for RemoteControl {
    fn emit(&self, event: CoreEvent, payload: serde_json::Value) {
        let outbound = OutboundEvent {
            name: event.as_str().to_string(),
            payload,
        };

        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        match &state.sink {
            Some(sink) => sink.send(&outbound),
            None => {
                state.buffer.push_back(outbound);
                while state.buffer.len() > self.buffer_size {
                    state.buffer.pop_front();
                    debug!("Remote event buffer full; dropped oldest event");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingSink {
        received: Mutex<Vec<OutboundEvent>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                received: Mutex::new(Vec::new()),
            })
        }

        fn names(&self) -> Vec<String> {
            self.received
                .lock()
                .unwrap()
                .iter()
                .map(|e| e.name.clone())
                .collect()
        }
    }

    impl EventSink for RecordingSink {
        fn send(&self, event: &OutboundEvent) {
            self.received.lock().unwrap().push(event.clone());
        }
    }

    fn payload(n: u64) -> serde_json::Value {
        serde_json::json!({ "n": n })
    }

    #[test]
    fn events_buffer_until_a_sink_attaches_then_flush_in_order() {
        let remote = RemoteControl::new(8);
        remote.emit(CoreEvent::SessionAdded, payload(1));
        remote.emit(CoreEvent::SessionActivity, payload(2));

        let sink = RecordingSink::new();
        remote.set_sink(sink.clone());

        assert_eq!(
            sink.names(),
            vec!["leitwerk:session-added", "leitwerk:session-activity"]
        );

        remote.emit(CoreEvent::SessionRemoved, payload(3));
        assert_eq!(sink.received.lock().unwrap().len(), 3);
    }

    #[test]
    fn buffer_drops_oldest_beyond_bound() {
        let remote = RemoteControl::new(2);
        remote.emit(CoreEvent::SessionAdded, payload(1));
        remote.emit(CoreEvent::SessionActivity, payload(2));
        remote.emit(CoreEvent::SessionRemoved, payload(3));

        let sink = RecordingSink::new();
        remote.set_sink(sink.clone());

        let received = sink.received.lock().unwrap();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].payload["n"], 2);
        assert_eq!(received[1].payload["n"], 3);
    }

    #[test]
    fn setting_the_same_sink_twice_is_idempotent() {
        let remote = RemoteControl::new(8);
        remote.emit(CoreEvent::SessionAdded, payload(1));

        let sink = RecordingSink::new();
        remote.set_sink(sink.clone());
        remote.set_sink(sink.clone());

        assert_eq!(sink.received.lock().unwrap().len(), 1, "no duplicate flush");
    }

    #[test]
    fn replacing_the_sink_routes_new_events_to_the_replacement() {
        let remote = RemoteControl::new(8);
        let first = RecordingSink::new();
        let second = RecordingSink::new();

        remote.set_sink(first.clone());
        remote.emit(CoreEvent::SessionAdded, payload(1));
        remote.set_sink(second.clone());
        remote.emit(CoreEvent::SessionRemoved, payload(2));

        assert_eq!(first.received.lock().unwrap().len(), 1);
        assert_eq!(second.received.lock().unwrap().len(), 1);
    }

    #[test]
    fn clear_sink_returns_to_buffering() {
        let remote = RemoteControl::new(8);
        let sink = RecordingSink::new();
        remote.set_sink(sink.clone());
        remote.clear_sink();

        remote.emit(CoreEvent::SessionAdded, payload(1));
        assert!(sink.received.lock().unwrap().is_empty());

        let late = RecordingSink::new();
        remote.set_sink(late.clone());
        assert_eq!(late.received.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn snapshots_are_empty_before_sources_attach() {
        let remote = RemoteControl::new(8);
        assert!(remote.session_snapshot().await.is_empty());
        assert!(remote.worktree_snapshot().await.is_empty());
    }
}
