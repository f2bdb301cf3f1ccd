//! Process supervisor — spawns and kills backend children.
//!
//! The supervisor owns the child handles; launchers hold only PIDs and
//! references. Kill escalation is SIGTERM, then SIGKILL after the configured
//! grace. Spawn failures and immediate exits feed the circuit breaker.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use bc_domain::config::SupervisorConfig;
use bc_domain::trace::TraceEvent;
use bc_domain::{Error, Result, Tracer};
use parking_lot::Mutex;
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::watch;
use uuid::Uuid;

use crate::breaker::CircuitBreaker;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Spawn spec & handle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything needed to spawn a backend child. Built by the per-backend
/// launcher profile so the supervisor stays backend-agnostic.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl SpawnSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
        }
    }

    pub fn display(&self) -> String {
        let mut out = self.command.clone();
        for arg in &self.args {
            out.push(' ');
            out.push_str(arg);
        }
        out
    }
}

/// Stdio pipes of a spawned child, claimable once by a stdio adapter.
pub struct ChildIo {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

/// A supervised child process.
pub struct ProcessHandle {
    pub pid: u32,
    /// `None` while running, `Some(exit_code)` once exited
    /// (`Some(None)` when killed by signal).
    exited: watch::Receiver<Option<Option<i32>>>,
    io: Mutex<Option<ChildIo>>,
}

impl ProcessHandle {
    /// Resolve when the process exits; returns the exit code, `None` when
    /// terminated by signal.
    pub async fn wait_exit(&self) -> Option<i32> {
        let mut rx = self.exited.clone();
        loop {
            if let Some(code) = *rx.borrow() {
                return code;
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }

    pub fn has_exited(&self) -> bool {
        self.exited.borrow().is_some()
    }

    /// Claim the child's stdio pipes. Only the first caller gets them.
    pub fn take_io(&self) -> Option<ChildIo> {
        self.io.lock().take()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Supervisor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ProcessSupervisor {
    config: SupervisorConfig,
    breaker: Arc<CircuitBreaker>,
    children: Mutex<HashMap<Uuid, Arc<ProcessHandle>>>,
    tracer: Tracer,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig, tracer: Tracer) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone()));
        Self {
            config,
            breaker,
            children: Mutex::new(HashMap::new()),
            tracer,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn get(&self, session_id: &Uuid) -> Option<Arc<ProcessHandle>> {
        self.children.lock().get(session_id).cloned()
    }

    /// Spawn a child for the given session. Replaces any prior handle for the
    /// same session (the prior child should already be dead or dying).
    pub fn spawn_process(
        &self,
        session_id: Uuid,
        spec: &SpawnSpec,
        label: &str,
    ) -> Result<Arc<ProcessHandle>> {
        self.breaker.try_acquire()?;

        let mut cmd = tokio::process::Command::new(&spec.command);
        cmd.args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        for (k, v) in &spec.env {
            cmd.env(k, v);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.breaker.record_failure();
                self.tracer.emit(TraceEvent::SpawnAttempt {
                    session_id: session_id.to_string(),
                    command: spec.display(),
                    attempt_ok: false,
                });
                return Err(Error::Adapter {
                    adapter: label.into(),
                    message: format!("spawn {}: {e}", spec.command),
                });
            }
        };

        let pid = child.id().ok_or_else(|| Error::Other("child exited before pid".into()))?;
        let io = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => Some(ChildIo { stdin, stdout }),
            _ => None,
        };

        let (exit_tx, exit_rx) = watch::channel(None);
        let handle = Arc::new(ProcessHandle {
            pid,
            exited: exit_rx,
            io: Mutex::new(io),
        });

        tracing::info!(
            session_id = %session_id,
            pid,
            command = %spec.display(),
            label,
            "spawned backend process"
        );
        self.tracer.emit(TraceEvent::SpawnAttempt {
            session_id: session_id.to_string(),
            command: spec.display(),
            attempt_ok: true,
        });

        self.watch_child(session_id, child, exit_tx);
        self.children.lock().insert(session_id, handle.clone());
        Ok(handle)
    }

    /// Kill the session's child: SIGTERM, then SIGKILL after the grace
    /// period. Resolves once the process has actually exited. A missing or
    /// already-dead child is a no-op.
    pub async fn kill_process(&self, session_id: &Uuid) -> Result<()> {
        let handle = match self.get(session_id) {
            Some(h) => h,
            None => return Ok(()),
        };
        if handle.has_exited() {
            self.children.lock().remove(session_id);
            return Ok(());
        }

        send_signal(handle.pid, false);
        let grace = Duration::from_millis(self.config.kill_grace_period_ms);
        let exited = tokio::time::timeout(grace, handle.wait_exit()).await;
        if exited.is_err() {
            tracing::warn!(
                session_id = %session_id,
                pid = handle.pid,
                grace_ms = self.config.kill_grace_period_ms,
                "SIGTERM grace expired, escalating to SIGKILL"
            );
            send_signal(handle.pid, true);
            handle.wait_exit().await;
        }

        self.children.lock().remove(session_id);
        Ok(())
    }

    pub async fn kill_all(&self) {
        let ids: Vec<Uuid> = self.children.lock().keys().copied().collect();
        for id in ids {
            let _ = self.kill_process(&id).await;
        }
    }

    /// Background task: wait for the child, resolve the exit watch, and feed
    /// the breaker. An exit inside the probation window with a non-zero code
    /// counts as a spawn failure; surviving probation counts as a success.
    fn watch_child(
        &self,
        session_id: Uuid,
        mut child: Child,
        exit_tx: watch::Sender<Option<Option<i32>>>,
    ) {
        let probation = Duration::from_millis(self.config.spawn_probation_ms);
        let breaker = self.breaker.clone();
        tokio::spawn(async move {
            let early_exit = tokio::select! {
                status = child.wait() => Some(status.ok().and_then(|s| s.code())),
                _ = tokio::time::sleep(probation) => None,
            };

            let code = match early_exit {
                Some(code) => {
                    if code == Some(0) {
                        breaker.record_success();
                    } else {
                        tracing::warn!(
                            session_id = %session_id,
                            exit_code = ?code,
                            "backend exited within probation window"
                        );
                        breaker.record_failure();
                    }
                    code
                }
                None => {
                    // Survived probation: the spawn itself succeeded.
                    breaker.record_success();
                    child.wait().await.ok().and_then(|s| s.code())
                }
            };

            tracing::info!(session_id = %session_id, exit_code = ?code, "backend process exited");
            let _ = exit_tx.send(Some(code));
        });
    }

}

fn send_signal(pid: u32, kill: bool) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill as nix_kill, Signal};
        use nix::unistd::Pid;
        let sig = if kill { Signal::SIGKILL } else { Signal::SIGTERM };
        // ESRCH means the process is already gone — that is fine.
        let _ = nix_kill(Pid::from_raw(pid as i32), sig);
    }
    #[cfg(not(unix))]
    {
        let _ = (pid, kill);
    }
}
