use crate::config::CoreConfig;
use crate::domains::sessions::entity::SessionLifecycle;
use crate::infrastructure::events::{CoreEvent, EventEmitter, emit_event};
use dashmap::DashMap;
use log::info;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Surfaces native alerts; the desktop shell provides the real
/// implementation.
pub trait Notifier: Send + Sync {
    fn notify(&self, summary: &str, body: &str);
}

pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _summary: &str, _body: &str) {}
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionActivityPayload {
    pub session_id: String,
    pub state: SessionLifecycle,
}

/// Per-session attention state machine.
///
/// Pure: fed observation instants, returns the transition to publish (if
/// any). Raw state derives from recent output and explicit waiting-input
/// signals; a transition is published only once the raw state has been
/// stable for the debounce window, so bursty output cannot flap
/// running/idle externally. First output and process exit publish
/// immediately.
#[derive(Debug)]
pub struct AttentionMachine {
    quiet_interval: Duration,
    debounce_window: Duration,
    current: SessionLifecycle,
    candidate: Option<(SessionLifecycle, Instant)>,
    last_output: Option<Instant>,
    waiting_since: Option<Instant>,
    exited: bool,
}

impl AttentionMachine {
    pub fn new(quiet_interval: Duration, debounce_window: Duration) -> Self {
        Self {
            quiet_interval,
            debounce_window,
            current: SessionLifecycle::Starting,
            candidate: None,
            last_output: None,
            waiting_since: None,
            exited: false,
        }
    }

    pub fn current(&self) -> SessionLifecycle {
        self.current
    }

    pub fn on_output(&mut self, now: Instant) -> Option<SessionLifecycle> {
        self.last_output = Some(now);
        self.waiting_since = None;
        self.advance(now)
    }

    pub fn on_waiting_input(&mut self, now: Instant) -> Option<SessionLifecycle> {
        // Keep the earliest waiting signal; the quiet clock runs from there.
        self.waiting_since.get_or_insert(now);
        self.advance(now)
    }

    pub fn on_exit(&mut self, now: Instant) -> Option<SessionLifecycle> {
        self.exited = true;
        self.advance(now)
    }

    pub fn tick(&mut self, now: Instant) -> Option<SessionLifecycle> {
        self.advance(now)
    }

    fn raw_state(&self, now: Instant) -> SessionLifecycle {
        if self.exited {
            return SessionLifecycle::Terminated;
        }
        if let Some(waiting_since) = self.waiting_since {
            return if now.duration_since(waiting_since) >= self.quiet_interval {
                SessionLifecycle::NeedsAttention
            } else {
                SessionLifecycle::WaitingInput
            };
        }
        match self.last_output {
            None => SessionLifecycle::Starting,
            Some(last) if now.duration_since(last) >= self.quiet_interval => {
                SessionLifecycle::Idle
            }
            Some(_) => SessionLifecycle::Running,
        }
    }

    fn advance(&mut self, now: Instant) -> Option<SessionLifecycle> {
        let raw = self.raw_state(now);
        if raw == self.current {
            self.candidate = None;
            return None;
        }

        // Definitive edges bypass the debounce: first output means the
        // process accepts input, and exit is not negotiable.
        let immediate = raw == SessionLifecycle::Terminated
            || (self.current == SessionLifecycle::Starting && raw == SessionLifecycle::Running);
        if immediate {
            self.current = raw;
            self.candidate = None;
            return Some(raw);
        }

        let since = match self.candidate {
            Some((state, since)) if state == raw => since,
            _ => {
                self.candidate = Some((raw, now));
                now
            }
        };

        if now.duration_since(since) >= self.debounce_window {
            self.current = raw;
            self.candidate = None;
            Some(raw)
        } else {
            None
        }
    }
}

/// Drives one `AttentionMachine` per registered session and publishes
/// stable transitions outward. Read-only towards the registry: it never
/// mutates the session table, it only reports.
pub struct ActivityMonitor {
    config: Arc<CoreConfig>,
    emitter: Arc<dyn EventEmitter>,
    notifier: Arc<dyn Notifier>,
    notifications_enabled: AtomicBool,
    suppressed: AtomicBool,
    machines: DashMap<String, AttentionMachine>,
}

impl ActivityMonitor {
    pub fn new(
        config: Arc<CoreConfig>,
        emitter: Arc<dyn EventEmitter>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let notifications_enabled = AtomicBool::new(config.notifications_enabled);
        Self {
            config,
            emitter,
            notifier,
            notifications_enabled,
            suppressed: AtomicBool::new(false),
            machines: DashMap::new(),
        }
    }

    pub fn attach(&self, session_id: &str) {
        self.machines.insert(
            session_id.to_string(),
            AttentionMachine::new(self.config.quiet_interval(), self.config.debounce_window()),
        );
    }

    pub fn detach(&self, session_id: &str) {
        self.machines.remove(session_id);
    }

    pub fn detach_all(&self) {
        self.machines.clear();
    }

    /// Stop raising notifications entirely; used during teardown so dying
    /// sessions do not spam the user.
    pub fn suppress_notifications(&self) {
        self.suppressed.store(true, Ordering::SeqCst);
    }

    pub fn set_notifications_enabled(&self, enabled: bool) {
        self.notifications_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn observe_output(&self, session_id: &str) -> Option<SessionLifecycle> {
        let published = self
            .machines
            .get_mut(session_id)?
            .on_output(Instant::now());
        self.publish(session_id, published)
    }

    pub fn observe_waiting_input(&self, session_id: &str) -> Option<SessionLifecycle> {
        let published = self
            .machines
            .get_mut(session_id)?
            .on_waiting_input(Instant::now());
        self.publish(session_id, published)
    }

    pub fn observe_exit(&self, session_id: &str) -> Option<SessionLifecycle> {
        let published = self.machines.get_mut(session_id)?.on_exit(Instant::now());
        self.publish(session_id, published)
    }

    /// Periodic sweep; returns the transitions that became stable.
    pub fn tick_all(&self) -> Vec<(String, SessionLifecycle)> {
        let now = Instant::now();
        let mut transitions = Vec::new();
        for mut entry in self.machines.iter_mut() {
            if let Some(state) = entry.value_mut().tick(now) {
                transitions.push((entry.key().clone(), state));
            }
        }
        for (session_id, state) in &transitions {
            self.publish(session_id, Some(*state));
        }
        transitions
    }

    pub fn current_state(&self, session_id: &str) -> Option<SessionLifecycle> {
        self.machines.get(session_id).map(|m| m.current())
    }

    fn publish(
        &self,
        session_id: &str,
        published: Option<SessionLifecycle>,
    ) -> Option<SessionLifecycle> {
        let state = published?;
        info!("Session {session_id} is now {state:?}");

        let payload = SessionActivityPayload {
            session_id: session_id.to_string(),
            state,
        };
        let _ = emit_event(&*self.emitter, CoreEvent::SessionActivity, &payload);

        if state == SessionLifecycle::NeedsAttention {
            let _ = emit_event(&*self.emitter, CoreEvent::SessionAttention, &payload);
            if self.notifications_enabled.load(Ordering::SeqCst)
                && !self.suppressed.load(Ordering::SeqCst)
            {
                self.notifier
                    .notify("Agent session needs attention", session_id);
            }
        }

        Some(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::events::NullEmitter;
    use std::sync::Mutex;

    const QUIET: Duration = Duration::from_millis(1000);
    const DEBOUNCE: Duration = Duration::from_millis(200);
    const TICK: Duration = Duration::from_millis(1);

    fn machine(debounce: Duration) -> AttentionMachine {
        AttentionMachine::new(QUIET, debounce)
    }

    #[test]
    fn first_output_publishes_running_immediately() {
        let mut m = machine(DEBOUNCE);
        let t0 = Instant::now();
        assert_eq!(m.on_output(t0), Some(SessionLifecycle::Running));
    }

    #[test]
    fn quiet_boundary_below_at_and_above_threshold() {
        // Debounce zero isolates the quiet-interval boundary itself.
        let mut m = machine(Duration::ZERO);
        let t0 = Instant::now();
        m.on_output(t0);

        assert_eq!(m.tick(t0 + QUIET - TICK), None, "threshold-1 stays running");
        assert_eq!(m.current(), SessionLifecycle::Running);

        assert_eq!(
            m.tick(t0 + QUIET),
            Some(SessionLifecycle::Idle),
            "exactly at threshold flips to idle"
        );

        let mut m = machine(Duration::ZERO);
        let t0 = Instant::now();
        m.on_output(t0);
        assert_eq!(m.tick(t0 + QUIET + TICK), Some(SessionLifecycle::Idle));
    }

    #[test]
    fn bursty_output_does_not_flap_through_idle() {
        let mut m = machine(DEBOUNCE);
        let t0 = Instant::now();
        m.on_output(t0);

        // Quiet long enough for a raw idle candidate, but not debounce-stable.
        assert_eq!(m.tick(t0 + QUIET), None);
        // Output arrives before the debounce window closes: candidate dies.
        assert_eq!(m.on_output(t0 + QUIET + TICK), None);
        assert_eq!(m.current(), SessionLifecycle::Running);
        // And idle is only published after a full stable window later.
        assert_eq!(m.tick(t0 + QUIET + QUIET + TICK), None);
        assert_eq!(
            m.tick(t0 + QUIET + QUIET + TICK + DEBOUNCE),
            Some(SessionLifecycle::Idle)
        );
    }

    #[test]
    fn waiting_input_escalates_to_needs_attention_after_quiet_and_debounce() {
        let mut m = machine(DEBOUNCE);
        let t0 = Instant::now();
        m.on_output(t0);

        assert_eq!(
            m.on_waiting_input(t0 + TICK),
            None,
            "waiting-input itself debounces"
        );
        assert_eq!(
            m.tick(t0 + TICK + DEBOUNCE),
            Some(SessionLifecycle::WaitingInput)
        );

        // The quiet clock runs from the waiting signal.
        assert_eq!(m.tick(t0 + TICK + QUIET - TICK), None);
        assert_eq!(m.tick(t0 + TICK + QUIET), None, "raw flip, not yet stable");
        assert_eq!(
            m.tick(t0 + TICK + QUIET + DEBOUNCE),
            Some(SessionLifecycle::NeedsAttention)
        );
    }

    #[test]
    fn output_while_waiting_returns_to_running() {
        let mut m = machine(Duration::ZERO);
        let t0 = Instant::now();
        m.on_output(t0);
        m.on_waiting_input(t0 + TICK);
        assert_eq!(
            m.on_output(t0 + 2 * TICK),
            Some(SessionLifecycle::Running)
        );
    }

    #[test]
    fn exit_publishes_terminated_immediately_from_any_state() {
        let mut m = machine(DEBOUNCE);
        let t0 = Instant::now();
        m.on_output(t0);
        assert_eq!(m.on_exit(t0 + TICK), Some(SessionLifecycle::Terminated));

        let mut m = machine(DEBOUNCE);
        assert_eq!(
            m.on_exit(Instant::now()),
            Some(SessionLifecycle::Terminated),
            "even straight out of starting"
        );
    }

    struct RecordingNotifier {
        notifications: Mutex<Vec<String>>,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, _summary: &str, body: &str) {
            self.notifications.lock().unwrap().push(body.to_string());
        }
    }

    fn monitor_with(
        quiet_ms: u64,
        debounce_ms: u64,
        notifier: Arc<RecordingNotifier>,
    ) -> ActivityMonitor {
        let config = CoreConfig {
            quiet_interval_ms: quiet_ms,
            debounce_window_ms: debounce_ms,
            ..CoreConfig::default()
        };
        ActivityMonitor::new(Arc::new(config), Arc::new(NullEmitter), notifier)
    }

    #[test]
    fn notifies_on_needs_attention_when_enabled() {
        let notifier = Arc::new(RecordingNotifier {
            notifications: Mutex::new(Vec::new()),
        });
        let monitor = monitor_with(0, 0, notifier.clone());

        monitor.attach("s-1");
        monitor.observe_output("s-1");
        // Quiet interval and debounce of zero: escalation is due at once.
        assert_eq!(
            monitor.observe_waiting_input("s-1"),
            Some(SessionLifecycle::NeedsAttention)
        );
        assert_eq!(notifier.notifications.lock().unwrap().as_slice(), ["s-1"]);
    }

    #[test]
    fn no_notification_when_preference_disabled_or_suppressed() {
        let notifier = Arc::new(RecordingNotifier {
            notifications: Mutex::new(Vec::new()),
        });
        let monitor = monitor_with(0, 0, notifier.clone());

        monitor.set_notifications_enabled(false);
        monitor.attach("s-1");
        monitor.observe_output("s-1");
        monitor.observe_waiting_input("s-1");
        monitor.tick_all();
        assert!(notifier.notifications.lock().unwrap().is_empty());

        monitor.set_notifications_enabled(true);
        monitor.suppress_notifications();
        monitor.attach("s-2");
        monitor.observe_output("s-2");
        monitor.observe_waiting_input("s-2");
        monitor.tick_all();
        assert!(notifier.notifications.lock().unwrap().is_empty());
    }

    #[test]
    fn observations_for_unknown_sessions_are_ignored() {
        let notifier = Arc::new(RecordingNotifier {
            notifications: Mutex::new(Vec::new()),
        });
        let monitor = monitor_with(0, 0, notifier);
        assert_eq!(monitor.observe_output("ghost"), None);
        assert_eq!(monitor.observe_exit("ghost"), None);
    }

    #[test]
    fn detach_drops_the_machine() {
        let notifier = Arc::new(RecordingNotifier {
            notifications: Mutex::new(Vec::new()),
        });
        let monitor = monitor_with(0, 0, notifier);
        monitor.attach("s-1");
        assert!(monitor.current_state("s-1").is_some());
        monitor.detach("s-1");
        assert!(monitor.current_state("s-1").is_none());
    }
}
