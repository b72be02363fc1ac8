use crate::config::CoreConfig;
use crate::domains::hooks::HookServer;
use crate::domains::sessions::monitor::{ActivityMonitor, Notifier, NullNotifier};
use crate::domains::sessions::process::{ProcessBackend, PtyBackend};
use crate::domains::sessions::registry::{HookDispatcher, SessionRegistry};
use crate::domains::worktrees::WorktreePool;
use crate::errors::CoreError;
use crate::infrastructure::events::EventEmitter;
use crate::services::RemoteControl;
use crate::shared::tools::ToolCache;
use log::{info, warn};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, interval};

const ACTIVITY_TICK: Duration = Duration::from_millis(250);

/// Context object owning the whole orchestration core.
///
/// Assembly wires the components; `start` enforces the startup order the
/// design depends on: the hook server binds before the registry becomes
/// spawn-eligible, then background reclamation runs per repository.
pub struct Orchestrator {
    config: Arc<CoreConfig>,
    tools: ToolCache,
    hook_server: Arc<HookServer>,
    pool: Arc<WorktreePool>,
    registry: Arc<SessionRegistry>,
    remote: Arc<RemoteControl>,
    background: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(
        config: CoreConfig,
        backend: Arc<dyn ProcessBackend>,
        notifier: Arc<dyn Notifier>,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let remote = Arc::new(RemoteControl::new(config.event_buffer_size));
        let emitter: Arc<dyn EventEmitter> = remote.clone();

        let pool = Arc::new(WorktreePool::new(config.clone(), emitter.clone()));
        let monitor = Arc::new(ActivityMonitor::new(
            config.clone(),
            emitter.clone(),
            notifier,
        ));

        let dispatcher = Arc::new(HookDispatcher::new());
        let hook_server = Arc::new(HookServer::new(config.clone(), dispatcher.clone()));

        let registry = Arc::new(SessionRegistry::new(
            config.clone(),
            backend,
            pool.clone(),
            monitor,
            emitter,
            hook_server.clone(),
        ));
        dispatcher.attach_registry(&registry);
        remote.attach_sources(&registry, &pool);

        Arc::new(Self {
            config,
            tools: ToolCache::new(),
            hook_server,
            pool,
            registry,
            remote,
            background: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Production assembly: PTY-backed sessions, no native notifier until
    /// the desktop shell provides one.
    pub fn with_defaults(config: CoreConfig) -> Arc<Self> {
        Self::new(config, Arc::new(PtyBackend), Arc::new(NullNotifier))
    }

    /// Bind the hook server and start the activity sweep. After this
    /// returns the registry accepts spawn calls.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, CoreError> {
        let addr = self.hook_server.start().await?;

        let registry = self.registry.clone();
        let sweep = tokio::spawn(async move {
            let mut ticker = interval(ACTIVITY_TICK);
            loop {
                ticker.tick().await;
                registry.poll_activity().await;
            }
        });
        self.background.lock().unwrap().push(sweep);

        Ok(addr)
    }

    /// Fire-and-forget startup reclamation for one repository: orphaned
    /// worktrees are deleted, then the idle pool is trimmed to its ceiling.
    /// Failures stay inside this task's error boundary.
    pub fn spawn_orphan_cleanup(self: &Arc<Self>, repository: PathBuf) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let live = this.registry.live_worktree_paths().await;
            match this
                .pool
                .cleanup_orphaned_reserves(&repository, &live)
                .await
            {
                Ok(0) => {}
                Ok(count) => info!(
                    "Reclaimed {count} orphaned worktree(s) in {}",
                    repository.display()
                ),
                Err(e) => warn!(
                    "Orphan cleanup for {} failed: {e}",
                    repository.display()
                ),
            }
            this.pool.trim_idle(&repository).await;
        });
        self.background.lock().unwrap().push(handle);
    }

    /// Best-effort teardown, never fails: kill sessions (graceful, bounded),
    /// stop the hook server with its drain timeout, drop background tasks.
    pub async fn shutdown(&self) {
        info!("Orchestrator shutting down");
        self.registry.kill_all().await;
        self.hook_server.stop().await;
        for task in self.background.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<WorktreePool> {
        &self.pool
    }

    pub fn remote(&self) -> &Arc<RemoteControl> {
        &self.remote
    }

    pub fn hook_server(&self) -> &Arc<HookServer> {
        &self.hook_server
    }

    pub fn tools(&self) -> &ToolCache {
        &self.tools
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }
}

/// Force-kills every session if the host tears down without a clean
/// shutdown. Hold one for the lifetime of the embedding application.
pub struct CleanupGuard {
    orchestrator: Arc<Orchestrator>,
}

impl CleanupGuard {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        info!("Emergency cleanup (panic/unexpected exit)");
        let orchestrator = self.orchestrator.clone();

        // Prefer a blocking cleanup so sessions are actually killed during
        // shutdown; fall back to a throwaway runtime outside of one.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let done = std::thread::spawn(move || {
                handle.block_on(async move {
                    orchestrator.registry().force_kill_all().await;
                })
            });
            let _ = done.join();
        } else if let Ok(rt) = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            rt.block_on(async move {
                orchestrator.registry().force_kill_all().await;
            });
        } else {
            warn!("No runtime available for emergency cleanup");
        }
    }
}
