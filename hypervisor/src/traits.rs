//! Trait definitions with mockall annotations for testing
//!
//! Every I/O boundary of the hypervisor sits behind one of these traits so the
//! control loop and the update state machine can be driven with mocks.

use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use shared::{
    BackendHealth, BundleDescriptor, BundleShape, InferenceRequest, Settings, UpdateStatus, VersionDescriptor,
    WorkerId,
};

use crate::core::update::UpdateJob;
use crate::error::{HypervisorError, HypervisorResult};

/// How a termination request was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationOutcome {
    /// Exited after the graceful signal
    Terminated,
    /// Needed the forced signal
    Killed,
    /// Was not running in the first place
    AlreadyExited,
}

/// Everything needed to launch the backend process once
#[derive(Debug, Clone, PartialEq)]
pub struct BackendLaunch {
    pub executable: PathBuf,
    pub working_dir: PathBuf,
    pub port: u16,
    pub workers: u32,
    pub model: Option<String>,
    pub required_files: Vec<PathBuf>,
    pub ready_marker: String,
    pub ready_timeout: Duration,
    pub stop_timeout: Duration,
    pub retries: u32,
}

impl BackendLaunch {
    /// Derive a launch description from the current settings
    pub fn from_settings(settings: &Settings) -> HypervisorResult<Self> {
        let executable = settings
            .backend_executable
            .clone()
            .ok_or_else(|| HypervisorError::config("backend_executable is not configured"))?;

        let working_dir = settings
            .backend_working_dir
            .clone()
            .or_else(|| executable.parent().map(Path::to_path_buf))
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            executable,
            working_dir,
            port: settings.backend_port,
            workers: settings.worker_count,
            model: settings.model.clone(),
            required_files: settings.backend_required_files.clone(),
            ready_marker: settings.backend_ready_marker.clone(),
            ready_timeout: Duration::from_secs(settings.backend_ready_timeout_seconds),
            stop_timeout: Duration::from_secs(settings.backend_stop_timeout_seconds),
            retries: settings.launch_retries,
        })
    }

    /// Command-line arguments handed to the backend
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "--port".to_string(),
            self.port.to_string(),
            "--workers".to_string(),
            self.workers.to_string(),
        ];
        if let Some(model) = &self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        args
    }
}

/// Installed target swapped in by [`Installer::replace`], with the previous one kept aside
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replacement {
    pub target: PathBuf,
    pub backup: Option<PathBuf>,
}

/// Mechanism that ended up starting the relaunched bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchMethod {
    /// Started inside a new terminal session through the named program
    Terminal { program: String },
    /// Started directly, detached from the current session
    Detached,
}

/// Result of draining the pool ahead of an update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainReport {
    /// True when in-flight work finished within the grace period
    pub drained: bool,
    /// In-flight requests cancelled when the grace period ran out
    pub cancelled: usize,
    /// Queued requests rejected because the process is being replaced
    pub rejected_queued: usize,
}

/// Version and settings source
///
/// The accessor is the only writer of settings; every change is broadcast to
/// subscribers so the control loop can resize or restart.
#[mockall::automock]
#[async_trait::async_trait]
pub trait ConfigAccessor: Send + Sync {
    /// Version descriptor of an installed component
    fn version(&self, component: &str) -> VersionDescriptor;

    /// Current settings snapshot
    fn settings(&self) -> Settings;

    /// Change notifications
    fn subscribe(&self) -> watch::Receiver<Settings>;

    /// Validate, persist and broadcast new settings
    async fn update(&self, settings: Settings) -> HypervisorResult<Settings>;
}

/// Executes one inference request on a worker
#[mockall::automock]
#[async_trait::async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Run `request` on `worker`; implementations return early once `cancel` fires
    async fn infer(&self, worker: WorkerId, request: InferenceRequest, cancel: CancellationToken) -> HypervisorResult<Value>;
}

/// Lifecycle owner of the external backend process
#[mockall::automock]
#[async_trait::async_trait]
pub trait BackendSupervisor: Send + Sync {
    /// Launch once and wait for readiness
    async fn start(&self, launch: &BackendLaunch) -> HypervisorResult<BackendHealth>;

    /// Graceful signal, then a forced one after `timeout`
    async fn stop(&self, timeout: Duration) -> HypervisorResult<TerminationOutcome>;

    /// Stop followed by a start with retries
    async fn restart(&self, launch: &BackendLaunch) -> HypervisorResult<BackendHealth>;

    /// Current lifecycle snapshot
    async fn health(&self) -> BackendHealth;
}

/// Terminates arbitrary processes by id
#[mockall::automock]
#[async_trait::async_trait]
pub trait ProcessTerminator: Send + Sync {
    /// Graceful signal, wait `grace`, then forced; a missing process is not an error
    async fn terminate(&self, pid: u32, grace: Duration) -> HypervisorResult<TerminationOutcome>;
}

/// Installs a new bundle in place of the old one
#[mockall::automock]
#[async_trait::async_trait]
pub trait Installer: Send + Sync {
    /// Stage the new bundle next to `target` and swap it in, keeping a backup
    async fn replace(&self, new_bundle: &Path, target: &Path, shape: BundleShape) -> HypervisorResult<Replacement>;

    /// Confirm `target` exists and has the expected shape
    async fn verify(&self, target: &Path, shape: BundleShape) -> HypervisorResult<()>;

    /// Drop the backup of a verified replacement
    async fn commit(&self, replacement: Replacement) -> HypervisorResult<()>;

    /// Put the backup back in place
    async fn rollback(&self, replacement: Replacement) -> HypervisorResult<()>;

    /// Set executable permissions on the installed target
    async fn make_executable(&self, target: &Path, shape: BundleShape) -> HypervisorResult<()>;
}

/// Starts an executable in a new top-level session
#[mockall::automock]
#[async_trait::async_trait]
pub trait SessionLauncher: Send + Sync {
    async fn launch(&self, target: &Path) -> HypervisorResult<LaunchMethod>;
}

/// What the update state machine needs from the process it is replacing
#[mockall::automock]
#[async_trait::async_trait]
pub trait UpdateHost: Send + Sync {
    /// Close admission and wait for in-flight work, bounded by `grace`
    async fn drain(&self, grace: Duration) -> HypervisorResult<DrainReport>;

    /// Stop the supervised backend
    async fn stop_backend(&self) -> HypervisorResult<TerminationOutcome>;
}

/// Serialized update state machine
#[mockall::automock]
#[async_trait::async_trait]
pub trait Updater: Send + Sync {
    /// Status of the current or most recent job
    fn status(&self) -> UpdateStatus;

    /// Open a job; `Err` carries the status to report instead (in flight or rejected)
    fn request(&self, descriptor: BundleDescriptor) -> Result<UpdateJob, UpdateStatus>;

    /// Drive an accepted job to `Done` or `Failed`
    async fn run(&self, job: UpdateJob, host: Arc<dyn UpdateHost>) -> UpdateStatus;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_launch_from_settings() {
        let settings = Settings {
            backend_executable: Some(PathBuf::from("/opt/station/backend/server")),
            worker_count: 3,
            model: Some("2025-04-14".to_string()),
            ..Settings::default()
        };

        let launch = BackendLaunch::from_settings(&settings).unwrap();
        assert_eq!(launch.working_dir, PathBuf::from("/opt/station/backend"));
        assert_eq!(
            launch.args(),
            vec!["--port", "20200", "--workers", "3", "--model", "2025-04-14"]
        );
        assert_eq!(launch.ready_timeout, Duration::from_secs(600));
    }

    #[test]
    fn test_backend_launch_requires_executable() {
        let result = BackendLaunch::from_settings(&Settings::default());
        assert!(matches!(result, Err(HypervisorError::Configuration { .. })));
    }

    #[test]
    fn test_mock_trait_instantiation() {
        let _config = MockConfigAccessor::new();
        let _backend = MockInferenceBackend::new();
        let _supervisor = MockBackendSupervisor::new();
        let _terminator = MockProcessTerminator::new();
        let _installer = MockInstaller::new();
        let _launcher = MockSessionLauncher::new();
        let _host = MockUpdateHost::new();
        let _updater = MockUpdater::new();
    }
}
