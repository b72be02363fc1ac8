use crate::config::CoreConfig;
use crate::domains::hooks::{HookEvent, HookEventKind, HookServer, HookSink};
use crate::domains::sessions::entity::{Session, SessionLifecycle};
use crate::domains::sessions::monitor::ActivityMonitor;
use crate::domains::sessions::process::{
    ProcessBackend, ProcessController, ProcessEvent, ProcessSpec,
};
use crate::domains::worktrees::WorktreePool;
use crate::errors::CoreError;
use crate::infrastructure::events::{CoreEvent, EventEmitter, emit_event};
use crate::shared::ids::{new_correlation_token, new_session_id};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use log::{info, warn};
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

pub const HOOK_ENDPOINT_ENV: &str = "LEITWERK_HOOK_ENDPOINT";
pub const HOOK_TOKEN_ENV: &str = "LEITWERK_HOOK_TOKEN";
pub const SESSION_ID_ENV: &str = "LEITWERK_SESSION_ID";

/// What the registry needs to know about the hook server: whether spawning
/// is allowed yet, and the endpoint spawned sessions must be told about.
pub trait HookEndpoint: Send + Sync {
    fn is_listening(&self) -> bool;
    fn endpoint_url(&self) -> Option<String>;
}

impl HookEndpoint for HookServer {
    fn is_listening(&self) -> bool {
        HookServer::is_listening(self)
    }

    fn endpoint_url(&self) -> Option<String> {
        HookServer::endpoint_url(self)
    }
}

#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub window_id: String,
    pub command: String,
    pub working_dir: PathBuf,
    /// Checked-out reservation the session should run inside. `None` spawns
    /// a plain session in `working_dir`. On spawn failure the reservation
    /// stays with the caller, who may retry or release it.
    pub reservation: Option<crate::domains::worktrees::WorktreeReservation>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionAddedPayload {
    pub session_id: String,
    pub window_id: String,
    pub worktree_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRemovedPayload {
    pub session_id: String,
    pub window_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HookReceivedPayload {
    pub session_id: String,
    pub kind: HookEventKind,
}

struct SessionRecord {
    session: Session,
    controller: Arc<dyn ProcessController>,
    pump_task: Option<JoinHandle<()>>,
}

type SessionTable = Arc<Mutex<HashMap<String, SessionRecord>>>;

/// Shared state the per-session pump tasks need for exit cleanup.
#[derive(Clone)]
struct PumpContext {
    sessions: SessionTable,
    pool: Arc<WorktreePool>,
    monitor: Arc<ActivityMonitor>,
    emitter: Arc<dyn EventEmitter>,
    token_index: Arc<DashMap<String, String>>,
}

/// Owns the session table: the only writer of session lifecycle state.
///
/// The activity monitor and the remote control façade observe; anything
/// that wants a session killed goes through this contract.
pub struct SessionRegistry {
    config: Arc<CoreConfig>,
    backend: Arc<dyn ProcessBackend>,
    pool: Arc<WorktreePool>,
    monitor: Arc<ActivityMonitor>,
    emitter: Arc<dyn EventEmitter>,
    hook_endpoint: Arc<dyn HookEndpoint>,
    sessions: SessionTable,
    token_index: Arc<DashMap<String, String>>,
}

impl SessionRegistry {
    pub fn new(
        config: Arc<CoreConfig>,
        backend: Arc<dyn ProcessBackend>,
        pool: Arc<WorktreePool>,
        monitor: Arc<ActivityMonitor>,
        emitter: Arc<dyn EventEmitter>,
        hook_endpoint: Arc<dyn HookEndpoint>,
    ) -> Self {
        Self {
            config,
            backend,
            pool,
            monitor,
            emitter,
            hook_endpoint,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            token_index: Arc::new(DashMap::new()),
        }
    }

    /// Spawn a supervised session for a window. Fails with `ServerNotReady`
    /// until the hook server is listening, since the spawned process is
    /// handed the server's endpoint at startup.
    pub async fn spawn(&self, request: SpawnRequest) -> Result<Session, CoreError> {
        if request.window_id.is_empty() {
            return Err(CoreError::invalid_input("window_id", "must not be empty"));
        }
        let Some(endpoint_url) = self
            .hook_endpoint
            .is_listening()
            .then(|| self.hook_endpoint.endpoint_url())
            .flatten()
        else {
            return Err(CoreError::ServerNotReady);
        };

        let session_id = new_session_id();
        let correlation_token = new_correlation_token();

        let working_dir = request
            .reservation
            .as_ref()
            .map(|r| r.worktree_path.clone())
            .unwrap_or_else(|| request.working_dir.clone());

        let spec = ProcessSpec {
            command: request.command.clone(),
            working_dir: working_dir.clone(),
            env: vec![
                (HOOK_ENDPOINT_ENV.to_string(), endpoint_url),
                (HOOK_TOKEN_ENV.to_string(), correlation_token.clone()),
                (SESSION_ID_ENV.to_string(), session_id.clone()),
            ],
        };

        let handle = self.backend.spawn(&spec).await?;

        if let Some(reservation) = &request.reservation
            && let Err(e) = self.pool.bind_session(&reservation.id, &session_id).await
        {
            warn!("Could not bind reservation to session {session_id}: {e}");
        }

        let session = Session {
            id: session_id.clone(),
            window_id: request.window_id.clone(),
            command: request.command,
            reservation_id: request.reservation.as_ref().map(|r| r.id.clone()),
            worktree_path: request.reservation.as_ref().map(|r| r.worktree_path.clone()),
            lifecycle: SessionLifecycle::Starting,
            correlation_token: correlation_token.clone(),
            created_at: Utc::now(),
            last_activity: None,
        };

        self.monitor.attach(&session_id);
        self.token_index
            .insert(correlation_token, session_id.clone());

        // Insert before starting the pump so a process that exits instantly
        // still finds its record to clean up.
        {
            let mut table = self.sessions.lock().await;
            table.insert(
                session_id.clone(),
                SessionRecord {
                    session: session.clone(),
                    controller: handle.controller.clone(),
                    pump_task: None,
                },
            );

            let ctx = PumpContext {
                sessions: self.sessions.clone(),
                pool: self.pool.clone(),
                monitor: self.monitor.clone(),
                emitter: self.emitter.clone(),
                token_index: self.token_index.clone(),
            };
            let pump = tokio::spawn(pump_events(ctx, session_id.clone(), handle.events));
            if let Some(record) = table.get_mut(&session_id) {
                record.pump_task = Some(pump);
            }
        }

        info!(
            "Spawned session {session_id} for window '{}' in {}",
            session.window_id,
            working_dir.display()
        );
        let _ = emit_event(
            &*self.emitter,
            CoreEvent::SessionAdded,
            &SessionAddedPayload {
                session_id: session_id.clone(),
                window_id: session.window_id.clone(),
                worktree_path: session
                    .worktree_path
                    .as_ref()
                    .map(|p| p.display().to_string()),
            },
        );

        Ok(session)
    }

    /// Terminate every session owned by the given window. Unknown window
    /// ids mean "no sessions". Best-effort: failures are logged per
    /// session, never surfaced.
    pub async fn kill_by_owner(&self, window_id: &str) {
        let ids: Vec<String> = {
            let table = self.sessions.lock().await;
            table
                .values()
                .filter(|r| r.session.window_id == window_id)
                .map(|r| r.session.id.clone())
                .collect()
        };

        if ids.is_empty() {
            return;
        }
        info!("Killing {} session(s) owned by window '{window_id}'", ids.len());
        join_all(ids.iter().map(|id| self.kill_session(id, "window-closed"))).await;
    }

    /// Terminate every live session; called at application shutdown.
    /// Suppresses attention notifications first so teardown stays silent.
    pub async fn kill_all(&self) {
        self.kill_all_with_grace(self.config.termination_grace()).await;
    }

    /// Emergency teardown: no grace period, straight to forced kill.
    pub async fn force_kill_all(&self) {
        self.kill_all_with_grace(std::time::Duration::ZERO).await;
    }

    async fn kill_all_with_grace(&self, grace: std::time::Duration) {
        self.monitor.suppress_notifications();

        let ids: Vec<String> = {
            let table = self.sessions.lock().await;
            table.keys().cloned().collect()
        };

        info!("Killing all {} live session(s)", ids.len());
        join_all(
            ids.iter()
                .map(|id| self.kill_session_with_grace(id, "shutdown", grace)),
        )
        .await;
        self.monitor.detach_all();
    }

    pub fn set_notification_preference(&self, enabled: bool) {
        self.monitor.set_notifications_enabled(enabled);
    }

    pub async fn snapshot(&self) -> Vec<Session> {
        let table = self.sessions.lock().await;
        table.values().map(|r| r.session.clone()).collect()
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Session, CoreError> {
        let table = self.sessions.lock().await;
        table
            .get(session_id)
            .map(|r| r.session.clone())
            .ok_or_else(|| CoreError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    /// Worktree paths currently claimed by live sessions; the pool's orphan
    /// sweep spares these.
    pub async fn live_worktree_paths(&self) -> HashSet<PathBuf> {
        let table = self.sessions.lock().await;
        table
            .values()
            .filter_map(|r| r.session.worktree_path.clone())
            .collect()
    }

    /// Apply monitor timer transitions to the table. Driven by the
    /// orchestrator's periodic sweep.
    pub async fn poll_activity(&self) {
        let transitions = self.monitor.tick_all();
        if transitions.is_empty() {
            return;
        }
        let mut table = self.sessions.lock().await;
        for (session_id, state) in transitions {
            if let Some(record) = table.get_mut(&session_id) {
                record.session.lifecycle = state;
            }
        }
    }

    /// Two-phase termination of one session, then cleanup. Races benignly
    /// with natural-exit cleanup: whichever removes the record does the
    /// bookkeeping, the other finds nothing.
    async fn kill_session(&self, session_id: &str, reason: &str) {
        self.kill_session_with_grace(session_id, reason, self.config.termination_grace())
            .await;
    }

    async fn kill_session_with_grace(
        &self,
        session_id: &str,
        reason: &str,
        grace: std::time::Duration,
    ) {
        let (controller, pump) = {
            let mut table = self.sessions.lock().await;
            let Some(record) = table.get_mut(session_id) else {
                return;
            };
            record.session.lifecycle = SessionLifecycle::Exiting;
            (record.controller.clone(), record.pump_task.take())
        };

        if let Some(pump) = pump {
            pump.abort();
        }

        match controller.terminate(session_id, grace).await {
            Ok(()) => {}
            Err(CoreError::TerminationTimeout { .. }) => {
                warn!("Session {session_id} ignored graceful stop; force-killed");
            }
            Err(e) => warn!("Terminating session {session_id} failed: {e}"),
        }

        let record = { self.sessions.lock().await.remove(session_id) };
        if let Some(record) = record {
            self.monitor.observe_exit(session_id);
            self.monitor.detach(session_id);
            self.token_index.remove(&record.session.correlation_token);
            if let Some(reservation_id) = &record.session.reservation_id {
                self.pool.release(reservation_id).await;
            }
            let _ = emit_event(
                &*self.emitter,
                CoreEvent::SessionRemoved,
                &SessionRemovedPayload {
                    session_id: session_id.to_string(),
                    window_id: record.session.window_id.clone(),
                    reason: reason.to_string(),
                },
            );
        }
    }
}

#[async_trait]
impl HookSink for SessionRegistry {
    async fn deliver(&self, event: HookEvent) -> Result<(), CoreError> {
        let Some(session_id) = self
            .token_index
            .get(&event.correlation_token)
            .map(|entry| entry.value().clone())
        else {
            return Err(CoreError::CorrelationMiss {
                token: event.correlation_token,
            });
        };

        let published = match event.kind {
            HookEventKind::WaitingInput => self.monitor.observe_waiting_input(&session_id),
            _ => self.monitor.observe_output(&session_id),
        };

        {
            let mut table = self.sessions.lock().await;
            if let Some(record) = table.get_mut(&session_id) {
                record.session.last_activity = Some(event.received_at);
                if let Some(state) = published {
                    record.session.lifecycle = state;
                }
            }
        }

        let _ = emit_event(
            &*self.emitter,
            CoreEvent::HookReceived,
            &HookReceivedPayload {
                session_id,
                kind: event.kind,
            },
        );
        Ok(())
    }
}

async fn pump_events(
    ctx: PumpContext,
    session_id: String,
    mut events: mpsc::UnboundedReceiver<ProcessEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ProcessEvent::Output(_bytes) => {
                let published = ctx.monitor.observe_output(&session_id);
                let mut table = ctx.sessions.lock().await;
                if let Some(record) = table.get_mut(&session_id) {
                    record.session.last_activity = Some(Utc::now());
                    if let Some(state) = published {
                        record.session.lifecycle = state;
                    }
                }
            }
            ProcessEvent::Exited => break,
        }
    }

    // Natural exit: clean up unless an explicit kill already did.
    let record = { ctx.sessions.lock().await.remove(&session_id) };
    let Some(record) = record else {
        return;
    };

    info!("Session {session_id} exited");
    ctx.monitor.observe_exit(&session_id);
    ctx.monitor.detach(&session_id);
    ctx.token_index.remove(&record.session.correlation_token);
    if let Some(reservation_id) = &record.session.reservation_id {
        ctx.pool.release(reservation_id).await;
    }
    let _ = emit_event(
        &*ctx.emitter,
        CoreEvent::SessionRemoved,
        &SessionRemovedPayload {
            session_id: session_id.clone(),
            window_id: record.session.window_id.clone(),
            reason: "exited".to_string(),
        },
    );
}

/// Forwards hook events from the server to the registry once both exist.
/// The server starts before the registry (spawn-eligibility depends on it),
/// so the sink is wired after construction.
#[derive(Default)]
pub struct HookDispatcher {
    registry: OnceCell<Weak<SessionRegistry>>,
}

impl HookDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach_registry(&self, registry: &Arc<SessionRegistry>) {
        let _ = self.registry.set(Arc::downgrade(registry));
    }
}

#[async_trait]
impl HookSink for HookDispatcher {
    async fn deliver(&self, event: HookEvent) -> Result<(), CoreError> {
        match self.registry.get().and_then(Weak::upgrade) {
            Some(registry) => registry.deliver(event).await,
            None => Err(CoreError::CorrelationMiss {
                token: event.correlation_token,
            }),
        }
    }
}
