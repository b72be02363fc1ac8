use crate::errors::CoreError;
use async_trait::async_trait;
use log::{debug, warn};
use portable_pty::{CommandBuilder, MasterPty, PtySize, native_pty_system};
use std::io::Read;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep};

const PTY_ROWS: u16 = 24;
const PTY_COLS: u16 = 120;
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// What to run and where, plus the environment the session needs to find
/// its way back to the hook server.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub command: String,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
}

/// Raw observations from a session's pseudo-terminal. Output is opaque
/// bytes; classification happens in the activity monitor.
#[derive(Debug)]
pub enum ProcessEvent {
    Output(Vec<u8>),
    Exited,
}

/// Control half of a spawned process; the event half is consumed by the
/// registry's pump task.
#[async_trait]
pub trait ProcessController: Send + Sync {
    fn pid(&self) -> Option<u32>;
    fn is_alive(&self) -> bool;
    /// Two-phase stop: graceful signal, bounded wait, forced kill.
    /// `Err(TerminationTimeout)` means the forced kill was needed.
    async fn terminate(&self, session_id: &str, grace: Duration) -> Result<(), CoreError>;
}

pub struct ProcessHandle {
    pub controller: Arc<dyn ProcessController>,
    pub events: mpsc::UnboundedReceiver<ProcessEvent>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle").finish_non_exhaustive()
    }
}

/// Seam between the registry and the operating system; mocked in tests.
#[async_trait]
pub trait ProcessBackend: Send + Sync {
    async fn spawn(&self, spec: &ProcessSpec) -> Result<ProcessHandle, CoreError>;
}

/// Production backend: one PTY per session via portable-pty, with a
/// blocking reader thread feeding the event channel.
pub struct PtyBackend;

#[async_trait]
impl ProcessBackend for PtyBackend {
    async fn spawn(&self, spec: &ProcessSpec) -> Result<ProcessHandle, CoreError> {
        let argv = shell_words::split(&spec.command)
            .map_err(|e| CoreError::invalid_input("command", e))?;
        if argv.is_empty() {
            return Err(CoreError::invalid_input("command", "command is empty"));
        }
        if !spec.working_dir.is_dir() {
            return Err(CoreError::spawn(
                &spec.command,
                format!(
                    "working directory does not exist: {}",
                    spec.working_dir.display()
                ),
            ));
        }
        if crate::shared::tools::resolve_program(&argv[0]).is_none() {
            return Err(CoreError::spawn(
                &spec.command,
                format!("executable not found: {}", argv[0]),
            ));
        }

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: PTY_ROWS,
                cols: PTY_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| CoreError::spawn(&spec.command, e))?;

        let mut cmd = CommandBuilder::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.cwd(&spec.working_dir);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| CoreError::spawn(&spec.command, e))?;
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| CoreError::spawn(&spec.command, e))?;

        let (tx, rx) = mpsc::unbounded_channel();
        spawn_reader_thread(reader, tx);

        let controller = Arc::new(PtyController {
            pid: child.process_id(),
            child: Mutex::new(child),
            _master: Mutex::new(pair.master),
        });

        Ok(ProcessHandle {
            controller,
            events: rx,
        })
    }
}

fn spawn_reader_thread(
    mut reader: Box<dyn Read + Send>,
    tx: mpsc::UnboundedSender<ProcessEvent>,
) {
    // Blocking PTY read loop; ends with EOF when the process side closes.
    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(ProcessEvent::Output(buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("PTY reader finished: {e}");
                    break;
                }
            }
        }
        let _ = tx.send(ProcessEvent::Exited);
    });
}

struct PtyController {
    pid: Option<u32>,
    child: Mutex<Box<dyn portable_pty::Child + Send + Sync>>,
    // Held so the PTY stays open for the process lifetime.
    _master: Mutex<Box<dyn MasterPty + Send>>,
}

impl PtyController {
    fn has_exited(&self) -> bool {
        let mut child = self.child.lock().unwrap_or_else(|p| p.into_inner());
        matches!(child.try_wait(), Ok(Some(_)))
    }

    fn send_sigterm(&self) {
        let Some(pid) = self.pid else {
            return;
        };
        let result = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGTERM,
        );
        if let Err(e) = result
            && e != nix::errno::Errno::ESRCH
        {
            warn!("SIGTERM to pid {pid} failed: {e}");
        }
    }

    fn force_kill(&self) {
        let mut child = self.child.lock().unwrap_or_else(|p| p.into_inner());
        if let Err(e) = child.kill() {
            warn!("Force kill failed: {e}");
        }
    }
}

#[async_trait]
impl ProcessController for PtyController {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn is_alive(&self) -> bool {
        !self.has_exited()
    }

    async fn terminate(&self, session_id: &str, grace: Duration) -> Result<(), CoreError> {
        if self.has_exited() {
            return Ok(());
        }

        self.send_sigterm();

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if self.has_exited() {
                return Ok(());
            }
            sleep(WAIT_POLL_INTERVAL).await;
        }

        self.force_kill();
        Err(CoreError::TerminationTimeout {
            session_id: session_id.to_string(),
            grace_ms: grace.as_millis() as u64,
        })
    }
}
