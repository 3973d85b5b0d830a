//! Update orchestrator
//!
//! Drives one [`UpdateJob`] through draining, termination of the supervising
//! process, replacement of the installed bundle, verification and relaunch.
//! Only one job can be in flight; the status is published through a `watch`
//! channel so callers can observe every phase.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use shared::{
    logging, process_debug, process_info, process_warn, BundleDescriptor, ProcessId, UpdatePhase, UpdateStatus,
    VersionDescriptor,
};

use crate::core::update::{self as phases, UpdateJob};
use crate::error::HypervisorResult;
use crate::traits::{
    DrainReport, Installer, ProcessTerminator, SessionLauncher, TerminationOutcome, UpdateHost, Updater,
};

/// Wait between the graceful and the forced signal to the supervising process
pub const TERMINATION_GRACE: Duration = Duration::from_secs(1);

pub struct UpdateOrchestrator<T, I, L>
where
    T: ProcessTerminator + 'static,
    I: Installer + 'static,
    L: SessionLauncher + 'static,
{
    terminator: T,
    installer: I,
    launcher: L,

    /// Version the candidate bundle is compared against
    installed: VersionDescriptor,
    own_pid: u32,
    termination_grace: Duration,

    status: watch::Sender<UpdateStatus>,
}

impl<T, I, L> UpdateOrchestrator<T, I, L>
where
    T: ProcessTerminator + 'static,
    I: Installer + 'static,
    L: SessionLauncher + 'static,
{
    pub fn new(terminator: T, installer: I, launcher: L, installed: VersionDescriptor) -> Self {
        let (status, _) = watch::channel(UpdateStatus::idle());
        Self {
            terminator,
            installer,
            launcher,
            installed,
            own_pid: std::process::id(),
            termination_grace: TERMINATION_GRACE,
            status,
        }
    }

    pub fn with_own_pid(mut self, pid: u32) -> Self {
        self.own_pid = pid;
        self
    }

    pub fn with_termination_grace(mut self, grace: Duration) -> Self {
        self.termination_grace = grace;
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<UpdateStatus> {
        self.status.subscribe()
    }

    fn enter(&self, phase: UpdatePhase) {
        let moved = self
            .status
            .send_if_modified(|status| phases::advance(status, phase, Utc::now()));
        if moved {
            process_info!(ProcessId::current(), "🔄 Update phase: {:?}", phase);
        } else {
            process_warn!(ProcessId::current(), "⚠️ Update could not enter {:?}", phase);
        }
    }

    fn fail(&self, reason: &str) {
        self.status
            .send_if_modified(|status| phases::fail(status, reason, Utc::now()));
    }

    async fn execute(&self, job: &UpdateJob, host: &dyn UpdateHost) -> HypervisorResult<()> {
        let shape = job.shape();

        self.enter(UpdatePhase::Draining);
        let report: DrainReport = host.drain(job.grace_period).await?;
        if !report.drained {
            process_warn!(
                ProcessId::current(),
                "⏳ Grace period elapsed: {} in-flight cancelled, {} queued rejected",
                report.cancelled,
                report.rejected_queued
            );
        }

        self.enter(UpdatePhase::Terminating);
        match host.stop_backend().await {
            Ok(outcome) => process_debug!(ProcessId::current(), "🛑 Backend stopped: {:?}", outcome),
            Err(e) => process_warn!(ProcessId::current(), "⚠️ Stopping backend before update: {}", e),
        }
        self.terminate_supervisor(job.supervising_process_id).await?;

        self.enter(UpdatePhase::Replacing);
        let replacement = self
            .installer
            .replace(&job.new_bundle_path, &job.old_installed_path, shape)
            .await?;

        self.enter(UpdatePhase::Verifying);
        if let Err(e) = self.installer.verify(&job.old_installed_path, shape).await {
            if let Err(rollback) = self.installer.rollback(replacement).await {
                logging::log_error(ProcessId::current(), "Restoring previous install", &rollback);
            }
            return Err(e);
        }
        if let Err(e) = self.installer.commit(replacement).await {
            process_warn!(ProcessId::current(), "⚠️ Could not remove backup: {}", e);
        }

        self.enter(UpdatePhase::Relaunching);
        self.installer.make_executable(&job.old_installed_path, shape).await?;
        let method = self.launcher.launch(&job.old_installed_path).await?;
        process_info!(
            ProcessId::current(),
            "🚀 Relaunched {} via {:?}",
            job.old_installed_path.display(),
            method
        );
        Ok(())
    }

    async fn terminate_supervisor(&self, pid: u32) -> HypervisorResult<()> {
        if pid == self.own_pid {
            process_info!(
                ProcessId::current(),
                "👋 Supervising process is this process ({}); it exits after the relaunch",
                pid
            );
            return Ok(());
        }

        let outcome = self.terminator.terminate(pid, self.termination_grace).await?;
        match outcome {
            TerminationOutcome::AlreadyExited => {
                process_debug!(ProcessId::current(), "✅ Supervising process {} had already exited", pid)
            }
            other => process_info!(ProcessId::current(), "🛑 Supervising process {}: {:?}", pid, other),
        }
        Ok(())
    }
}

#[async_trait]
impl<T, I, L> Updater for UpdateOrchestrator<T, I, L>
where
    T: ProcessTerminator + 'static,
    I: Installer + 'static,
    L: SessionLauncher + 'static,
{
    fn status(&self) -> UpdateStatus {
        self.status.borrow().clone()
    }

    fn request(&self, descriptor: BundleDescriptor) -> Result<UpdateJob, UpdateStatus> {
        let id = Uuid::new_v4();
        let opened = self
            .status
            .send_if_modified(|status| phases::begin(status, id, Utc::now()));
        if !opened {
            process_debug!(ProcessId::current(), "🔁 Update already in flight, reporting current status");
            return Err(self.status());
        }

        match UpdateJob::from_descriptor(id, descriptor, &self.installed) {
            Ok(job) => {
                process_info!(
                    ProcessId::current(),
                    "📥 Update {} requested: {} -> {}",
                    id,
                    job.new_bundle_path.display(),
                    job.old_installed_path.display()
                );
                Ok(job)
            }
            Err(e) => {
                logging::log_error(ProcessId::current(), "Update request rejected", &e);
                self.fail(&e.to_string());
                Err(self.status())
            }
        }
    }

    async fn run(&self, job: UpdateJob, host: Arc<dyn UpdateHost>) -> UpdateStatus {
        let current = self.status();
        if current.job_id != Some(job.id) || current.phase != UpdatePhase::Requested {
            process_warn!(ProcessId::current(), "⚠️ Update {} is not the pending job, ignoring", job.id);
            return current;
        }

        match self.execute(&job, host.as_ref()).await {
            Ok(()) => {
                self.enter(UpdatePhase::Done);
                logging::log_success(ProcessId::current(), &format!("Update {} installed", job.id));
            }
            Err(e) => {
                logging::log_error(ProcessId::current(), "Update failed", &e);
                self.fail(&e.to_string());
            }
        }
        self.status()
    }
}

/// Host used when the update runs outside a serving process
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedHost;

#[async_trait]
impl UpdateHost for DetachedHost {
    async fn drain(&self, _grace: Duration) -> HypervisorResult<DrainReport> {
        Ok(DrainReport {
            drained: true,
            ..DrainReport::default()
        })
    }

    async fn stop_backend(&self) -> HypervisorResult<TerminationOutcome> {
        Ok(TerminationOutcome::AlreadyExited)
    }
}
