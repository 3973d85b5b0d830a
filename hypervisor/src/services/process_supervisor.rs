//! Backend process supervision
//!
//! Owns exactly one backend process. A watcher task owns the child and
//! publishes its exit status, so crashes are noticed without polling. Start
//! and stop are serialized against each other.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::time::{sleep, timeout};

use shared::{
    logging, process_debug, process_error, process_info, process_warn, BackendHealth, ProcessId, SupervisorState,
};

use crate::error::{HypervisorError, HypervisorResult};
use crate::traits::{BackendLaunch, BackendSupervisor, TerminationOutcome};

/// Upper bound on waiting for a forced kill to be reaped
const KILL_TIMEOUT: Duration = Duration::from_secs(5);
/// Pause between launch attempts
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// How the backend process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub success: bool,
}

/// Identity of the running backend process
pub struct ProcessHandle {
    pub pid: u32,
    pub executable: PathBuf,
    pub launched_at: Instant,
    pub model: Option<String>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl ProcessHandle {
    pub fn exit_status(&self) -> Option<ExitInfo> {
        *self.exit_rx.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_status().is_some()
    }

    /// Ask the watcher to force-kill the child
    fn kill(&mut self) {
        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }
    }

    /// True once the process has exited, false after `limit`
    async fn wait_exit(&mut self, limit: Duration) -> bool {
        timeout(limit, self.exit_rx.wait_for(Option::is_some)).await.is_ok()
    }
}

/// Supervisor launching the backend as a child process
pub struct RealProcessSupervisor {
    current: Mutex<Option<ProcessHandle>>,
    state: Arc<watch::Sender<SupervisorState>>,
    lifecycle: Mutex<()>,
}

impl Default for RealProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl RealProcessSupervisor {
    pub fn new() -> Self {
        let (state, _) = watch::channel(SupervisorState::NotStarted);
        Self {
            current: Mutex::new(None),
            state: Arc::new(state),
            lifecycle: Mutex::new(()),
        }
    }

    /// Lifecycle change notifications
    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    fn set_state(&self, next: SupervisorState) {
        self.state.send_replace(next);
    }

    fn spawn(&self, launch: &BackendLaunch) -> HypervisorResult<(ProcessHandle, oneshot::Receiver<()>)> {
        check_files(launch)?;

        let mut command = Command::new(&launch.executable);
        command
            .args(launch.args())
            .current_dir(&launch.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| HypervisorError::launch(format!("spawning {}: {}", launch.executable.display(), e)))?;
        let pid = child.id().unwrap_or(0);

        let (ready_tx, ready_rx) = oneshot::channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(watch_stdout(stdout, launch.ready_marker.clone(), ready_tx, pid));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, pid));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(watch_exit(child, pid, kill_rx, exit_tx, self.state.clone()));

        process_debug!(
            ProcessId::current(),
            "🚀 Spawned backend {} (PID: {}) with {:?}",
            launch.executable.display(),
            pid,
            launch.args()
        );

        let handle = ProcessHandle {
            pid,
            executable: launch.executable.clone(),
            launched_at: Instant::now(),
            model: launch.model.clone(),
            exit_rx,
            kill_tx: Some(kill_tx),
        };
        Ok((handle, ready_rx))
    }

    async fn terminate(&self, handle: &mut ProcessHandle, grace: Duration) -> HypervisorResult<TerminationOutcome> {
        if handle.has_exited() {
            return Ok(TerminationOutcome::AlreadyExited);
        }

        if send_sigterm(handle.pid) && handle.wait_exit(grace).await {
            return Ok(TerminationOutcome::Terminated);
        }

        process_warn!(
            ProcessId::current(),
            "🔨 Backend {} still running after {:?}, killing",
            handle.pid,
            grace
        );
        handle.kill();
        if handle.wait_exit(KILL_TIMEOUT).await {
            Ok(TerminationOutcome::Killed)
        } else {
            Err(HypervisorError::TerminationFailed {
                pid: handle.pid,
                reason: "still alive after forced kill".to_string(),
            })
        }
    }

    async fn snapshot(&self) -> BackendHealth {
        let state = self.state();
        let current = self.current.lock().await;
        let live = current
            .as_ref()
            .filter(|_| matches!(state, SupervisorState::Running | SupervisorState::Stopping));
        BackendHealth {
            state,
            pid: live.map(|h| h.pid),
            uptime_seconds: live.map(|h| h.launched_at.elapsed().as_secs()),
            model: live.and_then(|h| h.model.clone()),
        }
    }
}

#[async_trait]
impl BackendSupervisor for RealProcessSupervisor {
    async fn start(&self, launch: &BackendLaunch) -> HypervisorResult<BackendHealth> {
        let _op = self.lifecycle.lock().await;

        if self.state() == SupervisorState::Running {
            let alive = self.current.lock().await.as_ref().is_some_and(|h| !h.has_exited());
            if alive {
                return Ok(self.snapshot().await);
            }
        }

        self.set_state(SupervisorState::Starting);
        let (mut handle, ready_rx) = match self.spawn(launch) {
            Ok(spawned) => spawned,
            Err(e) => {
                self.set_state(SupervisorState::Stopped);
                return Err(e);
            }
        };

        let readiness = timeout(launch.ready_timeout, wait_ready(ready_rx, handle.exit_rx.clone())).await;
        let failure = match readiness {
            Ok(true) => None,
            Ok(false) => Some(match handle.exit_status() {
                Some(exit) => format!("exited before becoming ready (code {:?})", exit.code),
                None => "closed its output before becoming ready".to_string(),
            }),
            Err(_) => Some(format!("not ready within {:?}", launch.ready_timeout)),
        };

        if let Some(reason) = failure {
            handle.kill();
            handle.wait_exit(KILL_TIMEOUT).await;
            self.set_state(SupervisorState::Stopped);
            return Err(HypervisorError::launch(reason));
        }

        let pid = handle.pid;
        let exit_rx = handle.exit_rx.clone();
        *self.current.lock().await = Some(handle);
        if promote_ready(&self.state, &exit_rx) == SupervisorState::Crashed {
            let code = exit_rx.borrow().as_ref().and_then(|exit| exit.code);
            process_error!(
                ProcessId::current(),
                "💥 Backend {} exited right after becoming ready (code {:?})",
                pid,
                code
            );
            return Err(HypervisorError::launch(format!(
                "exited right after becoming ready (code {code:?})"
            )));
        }
        logging::log_success(ProcessId::current(), &format!("Backend ready (PID: {pid})"));
        Ok(self.snapshot().await)
    }

    async fn stop(&self, grace: Duration) -> HypervisorResult<TerminationOutcome> {
        let _op = self.lifecycle.lock().await;

        let taken = self.current.lock().await.take();
        let Some(mut handle) = taken else {
            // Not running; only tidy up the reported state
            self.state.send_if_modified(|state| {
                if *state == SupervisorState::Crashed {
                    *state = SupervisorState::Stopped;
                    true
                } else {
                    false
                }
            });
            return Ok(TerminationOutcome::AlreadyExited);
        };

        self.set_state(SupervisorState::Stopping);
        let outcome = self.terminate(&mut handle, grace).await;
        self.set_state(SupervisorState::Stopped);

        match &outcome {
            Ok(outcome) => process_info!(ProcessId::current(), "🛑 Backend {} stopped: {:?}", handle.pid, outcome),
            Err(e) => logging::log_error(ProcessId::current(), "Stopping backend", e),
        }
        outcome
    }

    async fn restart(&self, launch: &BackendLaunch) -> HypervisorResult<BackendHealth> {
        self.stop(launch.stop_timeout).await?;
        start_with_retries(self, launch).await
    }

    async fn health(&self) -> BackendHealth {
        self.snapshot().await
    }
}

/// Start, retrying launch failures up to `launch.retries` times
pub async fn start_with_retries<S>(supervisor: &S, launch: &BackendLaunch) -> HypervisorResult<BackendHealth>
where
    S: BackendSupervisor + ?Sized,
{
    let mut attempt = 0;
    loop {
        match supervisor.start(launch).await {
            Err(HypervisorError::LaunchFailed { reason }) if attempt < launch.retries => {
                attempt += 1;
                process_warn!(
                    ProcessId::current(),
                    "⚠️ Backend launch attempt {} failed: {}. Retrying",
                    attempt,
                    reason
                );
                sleep(RETRY_DELAY).await;
            }
            other => return other,
        }
    }
}

fn check_files(launch: &BackendLaunch) -> HypervisorResult<()> {
    if !launch.executable.is_file() {
        return Err(HypervisorError::launch(format!(
            "backend executable {} not found",
            launch.executable.display()
        )));
    }
    for file in &launch.required_files {
        let path = if file.is_absolute() {
            file.clone()
        } else {
            launch.working_dir.join(file)
        };
        if !path.exists() {
            return Err(HypervisorError::launch(format!("required file {} is missing", path.display())));
        }
    }
    Ok(())
}

/// `Starting → Running`, or `Crashed` when the exit was already published
///
/// The exit check happens under the state lock, so an exit reported later is
/// seen by `watch_exit` as a crash of a `Running` backend.
pub(crate) fn promote_ready(
    state: &watch::Sender<SupervisorState>,
    exit_rx: &watch::Receiver<Option<ExitInfo>>,
) -> SupervisorState {
    let mut promoted = *state.borrow();
    state.send_if_modified(|current| {
        if *current != SupervisorState::Starting {
            return false;
        }
        *current = if exit_rx.borrow().is_some() {
            SupervisorState::Crashed
        } else {
            SupervisorState::Running
        };
        promoted = *current;
        true
    });
    promoted
}

async fn wait_ready(ready_rx: oneshot::Receiver<()>, mut exit_rx: watch::Receiver<Option<ExitInfo>>) -> bool {
    tokio::select! {
        ready = ready_rx => ready.is_ok(),
        _ = exit_rx.wait_for(Option::is_some) => false,
    }
}

/// Look for the readiness marker, then keep forwarding output to the log
async fn watch_stdout<R>(stdout: R, marker: String, ready_tx: oneshot::Sender<()>, pid: u32)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stdout).lines();
    let mut ready_tx = Some(ready_tx);
    while let Ok(Some(line)) = lines.next_line().await {
        if ready_tx.is_some() && line.contains(&marker) {
            if let Some(tx) = ready_tx.take() {
                let _ = tx.send(());
            }
        }
        process_debug!(ProcessId::current(), "[backend {}] {}", pid, line);
    }
}

async fn forward_lines<R>(output: R, pid: u32)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(output).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        process_debug!(ProcessId::current(), "[backend {}] {}", pid, line);
    }
}

/// Owns the child until it exits, then publishes the exit and flags crashes
async fn watch_exit(
    mut child: Child,
    pid: u32,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
    state: Arc<watch::Sender<SupervisorState>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            let _ = child.start_kill();
            child.wait().await
        }
    };

    let exit = match status {
        Ok(status) => ExitInfo {
            code: status.code(),
            success: status.success(),
        },
        Err(e) => {
            process_warn!(ProcessId::current(), "⚠️ Lost track of backend {}: {}", pid, e);
            ExitInfo {
                code: None,
                success: false,
            }
        }
    };
    let _ = exit_tx.send(Some(exit));

    let crashed = state.send_if_modified(|state| {
        if *state == SupervisorState::Running {
            *state = SupervisorState::Crashed;
            true
        } else {
            false
        }
    });
    if crashed {
        process_error!(
            ProcessId::current(),
            "💥 Backend {} exited unexpectedly (code {:?})",
            pid,
            exit.code
        );
    }
}

/// Send SIGTERM; false when the platform has no graceful signal
#[cfg(unix)]
fn send_sigterm(pid: u32) -> bool {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match signal::kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => true,
        Err(e) => {
            process_warn!(ProcessId::current(), "⚠️ SIGTERM to backend {} failed: {}", pid, e);
            false
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) -> bool {
    false
}
