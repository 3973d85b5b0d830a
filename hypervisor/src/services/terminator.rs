//! Signal-based termination of arbitrary processes
//!
//! SIGTERM first, poll for the process to disappear, then SIGKILL. A process
//! that is already gone counts as success.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::HypervisorResult;
use crate::traits::{ProcessTerminator, TerminationOutcome};

/// Interval between liveness checks
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// How long to wait for SIGKILL to take effect
const KILL_SETTLE: Duration = Duration::from_secs(1);

#[derive(Debug, Default, Clone)]
pub struct RealProcessTerminator;

impl RealProcessTerminator {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(unix)]
mod platform {
    use super::*;
    use crate::error::HypervisorError;
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;
    use shared::{deadline_after, process_debug, process_warn, ProcessId};
    use std::time::Instant;
    use tokio::time::sleep;

    pub async fn terminate(pid: u32, grace: Duration) -> HypervisorResult<TerminationOutcome> {
        let nix_pid = to_pid(pid)?;

        match signal::kill(nix_pid, Signal::SIGTERM) {
            Ok(()) => {
                process_debug!(ProcessId::current(), "📤 Sent SIGTERM to process {}", pid);
            }
            Err(Errno::ESRCH) => {
                process_debug!(ProcessId::current(), "✅ Process {} already gone", pid);
                return Ok(TerminationOutcome::AlreadyExited);
            }
            Err(e) => return Err(failed(pid, format!("SIGTERM: {e}"))),
        }

        if wait_for_exit(pid, nix_pid, grace).await? {
            return Ok(TerminationOutcome::Terminated);
        }

        process_warn!(
            ProcessId::current(),
            "🔨 Process {} ignored SIGTERM for {:?}, sending SIGKILL",
            pid,
            grace
        );
        match signal::kill(nix_pid, Signal::SIGKILL) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return Ok(TerminationOutcome::Terminated),
            Err(e) => return Err(failed(pid, format!("SIGKILL: {e}"))),
        }

        if wait_for_exit(pid, nix_pid, KILL_SETTLE).await? {
            Ok(TerminationOutcome::Killed)
        } else {
            Err(failed(pid, "still alive after SIGKILL".to_string()))
        }
    }

    async fn wait_for_exit(pid: u32, nix_pid: Pid, limit: Duration) -> HypervisorResult<bool> {
        let deadline = deadline_after(Instant::now(), limit);
        loop {
            if !process_exists(pid, nix_pid)? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    fn process_exists(pid: u32, nix_pid: Pid) -> HypervisorResult<bool> {
        match signal::kill(nix_pid, None) {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            Err(e) => Err(failed(pid, format!("liveness check: {e}"))),
        }
    }

    fn to_pid(pid: u32) -> HypervisorResult<Pid> {
        // 0 and negative values address process groups
        i32::try_from(pid)
            .ok()
            .filter(|raw| *raw > 0)
            .map(Pid::from_raw)
            .ok_or_else(|| failed(pid, "not a valid process id".to_string()))
    }

    fn failed(pid: u32, reason: String) -> HypervisorError {
        HypervisorError::TerminationFailed { pid, reason }
    }
}

#[cfg(not(unix))]
mod platform {
    use super::*;
    use tokio::process::Command;

    pub async fn terminate(pid: u32, _grace: Duration) -> HypervisorResult<TerminationOutcome> {
        let status = Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/F"])
            .status()
            .await?;
        if status.success() {
            Ok(TerminationOutcome::Killed)
        } else {
            Ok(TerminationOutcome::AlreadyExited)
        }
    }
}

#[async_trait]
impl ProcessTerminator for RealProcessTerminator {
    async fn terminate(&self, pid: u32, grace: Duration) -> HypervisorResult<TerminationOutcome> {
        platform::terminate(pid, grace).await
    }
}
