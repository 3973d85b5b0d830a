//! Test helpers and builders for hypervisor tests
//!
//! Provides a gated inference backend, a builder that wires a control loop
//! from real settings storage and mocked process services, and polling helpers.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use hypervisor::{
    services::FileConfigAccessor,
    traits::{
        LaunchMethod, MockBackendSupervisor, MockInstaller, MockProcessTerminator, MockSessionLauncher,
        Replacement,
    },
    ConfigAccessor, Exit, Hypervisor, HypervisorError, HypervisorHandle, HypervisorResult, InferenceBackend,
    TerminationOutcome, UpdateOrchestrator,
};
use shared::{BackendHealth, InferenceRequest, PoolStats, Settings, SupervisorState, WorkerId};

use super::fixtures::TestFixtures;

/// Backend whose calls block until the test releases a permit
///
/// Every call takes one permit. Cancellation wins over a missing permit.
pub struct GatedBackend {
    gate: Semaphore,
    calls: AtomicUsize,
}

impl GatedBackend {
    /// Calls block until [`GatedBackend::release`]
    pub fn closed() -> Self {
        Self {
            gate: Semaphore::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    /// Calls complete immediately
    pub fn open() -> Self {
        Self {
            gate: Semaphore::new(Semaphore::MAX_PERMITS),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn release(&self, calls: usize) {
        self.gate.add_permits(calls);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceBackend for GatedBackend {
    async fn infer(&self, worker: WorkerId, request: InferenceRequest, cancel: CancellationToken) -> HypervisorResult<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::select! {
            permit = self.gate.acquire() => {
                permit.map_err(|_| HypervisorError::backend("gate closed"))?.forget();
                Ok(json!({
                    "worker": worker.0,
                    "function": request.function,
                    "payload": request.payload,
                }))
            }
            _ = cancel.cancelled() => Err(HypervisorError::backend("cancelled")),
        }
    }
}

type TestUpdater = UpdateOrchestrator<MockProcessTerminator, MockInstaller, MockSessionLauncher>;

/// A running control loop and the pieces tests inspect
pub struct TestStation {
    pub handle: HypervisorHandle,
    pub backend: Arc<GatedBackend>,
    pub config: Arc<FileConfigAccessor>,
    pub task: JoinHandle<HypervisorResult<Exit>>,
    pub dir: TempDir,
}

impl TestStation {
    pub fn data_dir(&self) -> &Path {
        self.dir.path()
    }

    /// Ask the loop to stop and return how it exited
    pub async fn shutdown(self) -> Exit {
        let _ = self.handle.shutdown().await;
        self.exit().await
    }

    /// Wait for the loop to end on its own
    pub async fn exit(self) -> Exit {
        tokio::time::timeout(TestFixtures::WAIT, self.task)
            .await
            .expect("control loop did not exit")
            .expect("control loop panicked")
            .expect("control loop failed")
    }
}

/// Builder pattern for creating control loops under test
pub struct HypervisorBuilder {
    settings: Settings,
    backend: Arc<GatedBackend>,
    supervisor: MockBackendSupervisor,
    terminator: MockProcessTerminator,
    installer: MockInstaller,
    launcher: MockSessionLauncher,
}

impl HypervisorBuilder {
    pub fn new() -> Self {
        Self {
            settings: TestFixtures::settings(2, 4),
            backend: Arc::new(GatedBackend::open()),
            supervisor: TestHelpers::idle_supervisor(),
            terminator: MockProcessTerminator::new(),
            installer: MockInstaller::new(),
            launcher: MockSessionLauncher::new(),
        }
    }

    pub fn with_pool(mut self, workers: u32, max_queue: usize) -> Self {
        self.settings.worker_count = workers;
        self.settings.max_queue_size = max_queue;
        self
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_backend(mut self, backend: GatedBackend) -> Self {
        self.backend = Arc::new(backend);
        self
    }

    pub fn with_supervisor(mut self, supervisor: MockBackendSupervisor) -> Self {
        self.supervisor = supervisor;
        self
    }

    /// Update services that install successfully
    pub fn with_successful_update(mut self) -> Self {
        let (terminator, installer, launcher) = TestHelpers::successful_update_services();
        self.terminator = terminator;
        self.installer = installer;
        self.launcher = launcher;
        self
    }

    pub fn with_update_services(
        mut self,
        terminator: MockProcessTerminator,
        installer: MockInstaller,
        launcher: MockSessionLauncher,
    ) -> Self {
        self.terminator = terminator;
        self.installer = installer;
        self.launcher = launcher;
        self
    }

    /// Persist the settings in a fresh data directory and start the loop
    pub async fn start(self) -> TestStation {
        let dir = TempDir::new().unwrap();
        let config = FileConfigAccessor::load_with(dir.path(), |_| None);
        config.update(self.settings).await.unwrap();
        let config = Arc::new(config);

        let updater: TestUpdater =
            UpdateOrchestrator::new(self.terminator, self.installer, self.launcher, TestFixtures::installed());
        let hypervisor = Hypervisor::new(
            config.clone(),
            self.backend.clone(),
            Arc::new(self.supervisor),
            Arc::new(updater),
        )
        .with_tick(TestFixtures::TICK);
        let handle = hypervisor.handle();
        let task = tokio::spawn(hypervisor.run(false));

        TestStation {
            handle,
            backend: self.backend,
            config,
            task,
            dir,
        }
    }
}

impl Default for HypervisorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Test helper functions
pub struct TestHelpers;

impl TestHelpers {
    /// Supervisor that reports a stopped backend and accepts every call
    pub fn idle_supervisor() -> MockBackendSupervisor {
        let mut supervisor = MockBackendSupervisor::new();
        supervisor.expect_health().returning(BackendHealth::not_started);
        supervisor
            .expect_stop()
            .times(0..)
            .returning(|_| Ok(TerminationOutcome::AlreadyExited));
        supervisor
            .expect_start()
            .times(0..)
            .returning(|launch| Ok(Self::running(launch.model.clone())));
        supervisor
            .expect_restart()
            .times(0..)
            .returning(|launch| Ok(Self::running(launch.model.clone())));
        supervisor
    }

    pub fn running(model: Option<String>) -> BackendHealth {
        BackendHealth {
            state: SupervisorState::Running,
            pid: Some(31337),
            uptime_seconds: Some(0),
            model,
        }
    }

    /// Terminator, installer and launcher for an update that goes all the way through
    pub fn successful_update_services() -> (MockProcessTerminator, MockInstaller, MockSessionLauncher) {
        let mut terminator = MockProcessTerminator::new();
        terminator
            .expect_terminate()
            .returning(|_, _| Ok(TerminationOutcome::AlreadyExited));

        let mut installer = MockInstaller::new();
        installer.expect_replace().returning(|_, target: &Path, _| {
            Ok(Replacement {
                target: target.to_path_buf(),
                backup: Some(PathBuf::from("/tmp/station.bak")),
            })
        });
        installer.expect_verify().returning(|_, _| Ok(()));
        installer.expect_commit().returning(|_| Ok(()));
        installer.expect_make_executable().returning(|_, _| Ok(()));

        let mut launcher = MockSessionLauncher::new();
        launcher.expect_launch().returning(|_| Ok(LaunchMethod::Detached));

        (terminator, installer, launcher)
    }

    /// Poll `check` against fresh stats until it holds
    pub async fn wait_for_stats<F>(handle: &HypervisorHandle, check: F) -> PoolStats
    where
        F: Fn(&PoolStats) -> bool,
    {
        let deadline = tokio::time::Instant::now() + TestFixtures::WAIT;
        loop {
            let stats = handle.stats().await.unwrap();
            if check(&stats) {
                return stats;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition never held, last stats: {stats:?}"
            );
            tokio::time::sleep(TestFixtures::TICK).await;
        }
    }

    /// Await `future` with the standard test timeout
    pub async fn within<F: Future>(future: F) -> F::Output {
        tokio::time::timeout(TestFixtures::WAIT, future)
            .await
            .expect("operation timed out")
    }
}
