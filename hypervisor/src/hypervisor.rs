//! Hypervisor control loop
//!
//! A single task owns the [`WorkerPool`], the maintenance state (resize,
//! restart, update) and the worker channels. Everything else talks to it
//! through a [`HypervisorHandle`]. Long-running work such as restarting the
//! backend or running an update happens in spawned tasks that report back
//! with an [`Event`], so admission keeps answering while they run.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use shared::{
    deadline_after, logging, process_debug, process_error, process_info, process_warn, AdminResponse, Admission,
    BundleDescriptor,
    HealthReport, InferenceRequest, PoolStats, ProcessId, RequestId, RequestOutcome, RequestStatus, Settings,
    UpdatePhase, UpdateStatus, VersionDescriptor, WorkerId,
};

use crate::core::{Dispatch, WorkerPool};
use crate::error::{HypervisorError, HypervisorResult};
use crate::services::start_with_retries;
use crate::traits::{
    BackendLaunch, BackendSupervisor, ConfigAccessor, DrainReport, InferenceBackend, TerminationOutcome, UpdateHost,
    Updater,
};

/// Default deadline sweep interval
pub const DEFAULT_TICK: Duration = Duration::from_millis(250);
/// Component name reported by the version endpoint
pub const COMPONENT: &str = "hypervisor";

const COMMAND_BUFFER: usize = 256;
const WORKER_UNAVAILABLE: &str = "worker unavailable";

type AdminReply = oneshot::Sender<HypervisorResult<AdminResponse>>;

/// Why the control loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Shutdown was requested
    Shutdown,
    /// An update was installed and relaunched; this process is finished
    Updated,
}

/// Result of a submit that waits for the outcome
#[derive(Debug, Clone, PartialEq)]
pub enum InferenceReply {
    Saturated,
    Finished(RequestOutcome),
}

struct Submitted {
    admission: Admission,
    outcome: Option<oneshot::Receiver<RequestOutcome>>,
}

enum Command {
    Submit {
        request: InferenceRequest,
        wait: bool,
        reply: oneshot::Sender<Submitted>,
    },
    Poll {
        request_id: RequestId,
        reply: oneshot::Sender<Option<RequestStatus>>,
    },
    Stats {
        reply: oneshot::Sender<PoolStats>,
    },
    Health {
        reply: oneshot::Sender<HealthReport>,
    },
    Start {
        reply: AdminReply,
    },
    Stop {
        reply: AdminReply,
    },
    Restart {
        reply: AdminReply,
    },
    Resize {
        workers: u32,
        reply: AdminReply,
    },
    SetModel {
        model: String,
        reply: AdminReply,
    },
    Update {
        descriptor: BundleDescriptor,
        reply: oneshot::Sender<HypervisorResult<UpdateStatus>>,
    },
    UpdateStatus {
        reply: oneshot::Sender<UpdateStatus>,
    },
    Settings {
        reply: oneshot::Sender<Settings>,
    },
    PutSettings {
        settings: Settings,
        reply: oneshot::Sender<HypervisorResult<Settings>>,
    },
    Version {
        reply: oneshot::Sender<VersionDescriptor>,
    },
    Drain {
        grace: Duration,
        reply: oneshot::Sender<DrainReport>,
    },
    StopBackend {
        reply: oneshot::Sender<HypervisorResult<TerminationOutcome>>,
    },
    Shutdown,
}

/// Reports from spawned tasks back to the loop
enum Event {
    BackendRestarted(HypervisorResult<String>),
    SupervisorOpFinished {
        op: SupervisorOp,
        result: HypervisorResult<String>,
    },
    UpdateFinished(UpdateStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SupervisorOp {
    Start,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MaintenanceKind {
    Restart,
    Resize,
    Update,
}

impl MaintenanceKind {
    fn describe(&self) -> &'static str {
        match self {
            MaintenanceKind::Restart => "restart",
            MaintenanceKind::Resize => "resize",
            MaintenanceKind::Update => "update",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MaintenancePhase {
    Draining,
    Restarting,
    /// Drained for an update; waiting for the update task to finish
    Handed,
}

/// Admission is closed while one of these is active
struct Maintenance {
    kind: MaintenanceKind,
    phase: MaintenancePhase,
    /// Settings the pool and backend end up with
    next: Settings,
    drain_deadline: Instant,
    replies: Vec<AdminReply>,
    drain_reply: Option<oneshot::Sender<DrainReport>>,
    drain_report: Option<DrainReport>,
    backend_stopped: bool,
}

struct WorkerJob {
    request_id: RequestId,
    request: InferenceRequest,
    cancel: CancellationToken,
}

struct Completion {
    worker: WorkerId,
    request_id: RequestId,
    result: Result<Value, String>,
}

/// Cloneable client of the control loop
#[derive(Clone)]
pub struct HypervisorHandle {
    commands: mpsc::Sender<Command>,
}

impl HypervisorHandle {
    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> HypervisorResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| HypervisorError::ControlLoopClosed)?;
        rx.await.map_err(|_| HypervisorError::ControlLoopClosed)
    }

    /// Admit a request without waiting for its outcome
    pub async fn submit(&self, request: InferenceRequest) -> HypervisorResult<Admission> {
        request.validate()?;
        let submitted = self
            .call(|reply| Command::Submit {
                request,
                wait: false,
                reply,
            })
            .await?;
        Ok(submitted.admission)
    }

    /// Admit a request and wait for its terminal outcome
    pub async fn infer(&self, request: InferenceRequest) -> HypervisorResult<InferenceReply> {
        request.validate()?;
        let submitted = self
            .call(|reply| Command::Submit {
                request,
                wait: true,
                reply,
            })
            .await?;
        match (submitted.admission, submitted.outcome) {
            (Admission::Accepted { .. }, Some(outcome)) => outcome
                .await
                .map(InferenceReply::Finished)
                .map_err(|_| HypervisorError::ControlLoopClosed),
            _ => Ok(InferenceReply::Saturated),
        }
    }

    pub async fn poll(&self, request_id: RequestId) -> HypervisorResult<Option<RequestStatus>> {
        self.call(|reply| Command::Poll { request_id, reply }).await
    }

    pub async fn stats(&self) -> HypervisorResult<PoolStats> {
        self.call(|reply| Command::Stats { reply }).await
    }

    pub async fn health(&self) -> HypervisorResult<HealthReport> {
        self.call(|reply| Command::Health { reply }).await
    }

    pub async fn start(&self) -> HypervisorResult<AdminResponse> {
        self.call(|reply| Command::Start { reply }).await?
    }

    pub async fn stop(&self) -> HypervisorResult<AdminResponse> {
        self.call(|reply| Command::Stop { reply }).await?
    }

    pub async fn restart(&self) -> HypervisorResult<AdminResponse> {
        self.call(|reply| Command::Restart { reply }).await?
    }

    pub async fn resize(&self, workers: u32) -> HypervisorResult<AdminResponse> {
        self.call(|reply| Command::Resize { workers, reply }).await?
    }

    pub async fn set_model(&self, model: impl Into<String>) -> HypervisorResult<AdminResponse> {
        let model = model.into();
        self.call(|reply| Command::SetModel { model, reply }).await?
    }

    /// Request an update; a job already in flight is reported instead of starting another
    pub async fn update(&self, descriptor: BundleDescriptor) -> HypervisorResult<UpdateStatus> {
        self.call(|reply| Command::Update { descriptor, reply }).await?
    }

    pub async fn update_status(&self) -> HypervisorResult<UpdateStatus> {
        self.call(|reply| Command::UpdateStatus { reply }).await
    }

    pub async fn settings(&self) -> HypervisorResult<Settings> {
        self.call(|reply| Command::Settings { reply }).await
    }

    pub async fn put_settings(&self, settings: Settings) -> HypervisorResult<Settings> {
        self.call(|reply| Command::PutSettings { settings, reply }).await?
    }

    pub async fn version(&self) -> HypervisorResult<VersionDescriptor> {
        self.call(|reply| Command::Version { reply }).await
    }

    pub async fn shutdown(&self) -> HypervisorResult<()> {
        self.commands
            .send(Command::Shutdown)
            .await
            .map_err(|_| HypervisorError::ControlLoopClosed)
    }
}

#[async_trait::async_trait]
impl UpdateHost for HypervisorHandle {
    async fn drain(&self, grace: Duration) -> HypervisorResult<DrainReport> {
        self.call(|reply| Command::Drain { grace, reply }).await
    }

    async fn stop_backend(&self) -> HypervisorResult<TerminationOutcome> {
        self.call(|reply| Command::StopBackend { reply }).await?
    }
}

/// Control loop with injected services
pub struct Hypervisor<C, B, S, U>
where
    C: ConfigAccessor + 'static,
    B: InferenceBackend + 'static,
    S: BackendSupervisor + 'static,
    U: Updater + 'static,
{
    /// Injected services
    config: Arc<C>,
    backend: Arc<B>,
    supervisor: Arc<S>,
    updater: Arc<U>,

    pool: WorkerPool,
    /// Settings the pool and backend currently run with
    applied: Settings,
    pending_settings: Option<Settings>,
    maintenance: Option<Maintenance>,
    supervisor_op: Option<(SupervisorOp, Vec<AdminReply>)>,

    workers: HashMap<WorkerId, mpsc::Sender<WorkerJob>>,
    cancels: HashMap<RequestId, CancellationToken>,
    waiters: HashMap<RequestId, oneshot::Sender<RequestOutcome>>,

    command_tx: mpsc::Sender<Command>,
    command_rx: mpsc::Receiver<Command>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    completion_rx: mpsc::UnboundedReceiver<Completion>,
    event_tx: mpsc::UnboundedSender<Event>,
    event_rx: mpsc::UnboundedReceiver<Event>,
    settings_rx: watch::Receiver<Settings>,
    settings_open: bool,

    tick: Duration,
    exit: Option<Exit>,
}

impl<C, B, S, U> Hypervisor<C, B, S, U>
where
    C: ConfigAccessor + 'static,
    B: InferenceBackend + 'static,
    S: BackendSupervisor + 'static,
    U: Updater + 'static,
{
    pub fn new(config: Arc<C>, backend: Arc<B>, supervisor: Arc<S>, updater: Arc<U>) -> Self {
        let applied = config.settings();
        let settings_rx = config.subscribe();
        let pool = WorkerPool::from_settings(&applied, Instant::now());
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Self {
            config,
            backend,
            supervisor,
            updater,
            pool,
            applied,
            pending_settings: None,
            maintenance: None,
            supervisor_op: None,
            workers: HashMap::new(),
            cancels: HashMap::new(),
            waiters: HashMap::new(),
            command_tx,
            command_rx,
            completion_tx,
            completion_rx,
            event_tx,
            event_rx,
            settings_rx,
            settings_open: true,
            tick: DEFAULT_TICK,
            exit: None,
        }
    }

    /// Override the deadline sweep interval
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn handle(&self) -> HypervisorHandle {
        HypervisorHandle {
            commands: self.command_tx.clone(),
        }
    }

    /// Run until shutdown or until an installed update takes over
    pub async fn run(mut self, autostart: bool) -> HypervisorResult<Exit> {
        logging::log_startup(
            ProcessId::current(),
            &format!(
                "{} workers, queue {}, timeout {}s",
                self.applied.worker_count, self.applied.max_queue_size, self.applied.timeout_seconds
            ),
        );

        self.spawn_workers();
        if autostart && self.applied.backend_executable.is_some() {
            self.supervisor_command(SupervisorOp::Start, None);
        }

        let mut sweep = interval(self.tick);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while self.exit.is_none() {
            tokio::select! {
                Some(command) = self.command_rx.recv() => {
                    self.handle_command(command).await;
                },

                Some(completion) = self.completion_rx.recv() => {
                    self.on_completion(completion);
                },

                Some(event) = self.event_rx.recv() => {
                    self.on_event(event);
                },

                changed = self.settings_rx.changed(), if self.settings_open => {
                    match changed {
                        Ok(()) => {
                            let next = self.settings_rx.borrow_and_update().clone();
                            self.on_settings_changed(next);
                        }
                        Err(_) => {
                            process_warn!(ProcessId::current(), "⚠️ Settings source closed, no further changes");
                            self.settings_open = false;
                        }
                    }
                },

                _ = sweep.tick() => {
                    self.on_tick();
                },
            }
        }

        let exit = self.exit.unwrap_or(Exit::Shutdown);
        self.shutdown(exit).await;
        Ok(exit)
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Submit { request, wait, reply } => {
                let submitted = self.submit(request, wait);
                let _ = reply.send(submitted);
            }
            Command::Poll { request_id, reply } => {
                let _ = reply.send(self.pool.poll(&request_id));
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.pool.stats());
            }
            Command::Health { reply } => {
                let supervisor = self.supervisor.clone();
                tokio::spawn(async move {
                    let backend = supervisor.health().await;
                    let _ = reply.send(HealthReport::from_backend(backend));
                });
            }
            Command::Start { reply } => self.supervisor_command(SupervisorOp::Start, Some(reply)),
            Command::Stop { reply } => self.supervisor_command(SupervisorOp::Stop, Some(reply)),
            Command::Restart { reply } => self.restart_command(reply),
            Command::Resize { workers, reply } => self.resize_command(workers, reply).await,
            Command::SetModel { model, reply } => self.set_model_command(model, reply).await,
            Command::Update { descriptor, reply } => {
                let _ = reply.send(self.update_command(descriptor));
            }
            Command::UpdateStatus { reply } => {
                let _ = reply.send(self.updater.status());
            }
            Command::Settings { reply } => {
                let _ = reply.send(self.config.settings());
            }
            Command::PutSettings { settings, reply } => {
                let _ = reply.send(self.config.update(settings).await);
            }
            Command::Version { reply } => {
                let _ = reply.send(self.config.version(COMPONENT));
            }
            Command::Drain { grace, reply } => self.drain_command(grace, reply),
            Command::StopBackend { reply } => {
                if let Some(maintenance) = self.maintenance.as_mut() {
                    maintenance.backend_stopped = true;
                }
                let supervisor = self.supervisor.clone();
                let timeout = Duration::from_secs(self.applied.backend_stop_timeout_seconds);
                tokio::spawn(async move {
                    let _ = reply.send(supervisor.stop(timeout).await);
                });
            }
            Command::Shutdown => {
                process_info!(ProcessId::current(), "🛑 Shutdown requested");
                self.exit = Some(Exit::Shutdown);
            }
        }
    }

    // Admission and workers

    fn submit(&mut self, request: InferenceRequest, wait: bool) -> Submitted {
        let now = Instant::now();
        let (admission, dispatch) = self.pool.submit(request, now);

        let outcome = match admission {
            Admission::Accepted { request_id } if wait => {
                let (tx, rx) = oneshot::channel();
                self.waiters.insert(request_id, tx);
                Some(rx)
            }
            Admission::Accepted { .. } => None,
            Admission::Saturated => {
                process_debug!(ProcessId::current(), "🚫 Request rejected: saturated");
                None
            }
        };

        if let Some(dispatch) = dispatch {
            self.dispatch(dispatch);
        }
        self.notify_finished();
        Submitted { admission, outcome }
    }

    fn spawn_workers(&mut self) {
        for worker in self.pool.workers() {
            let (tx, rx) = mpsc::channel(1);
            tokio::spawn(run_worker(
                worker.id,
                rx,
                self.backend.clone(),
                self.completion_tx.clone(),
            ));
            self.workers.insert(worker.id, tx);
        }
        process_debug!(ProcessId::current(), "👷 {} worker tasks running", self.workers.len());
    }

    fn dispatch(&mut self, dispatch: Dispatch) {
        let mut next = Some(dispatch);
        while let Some(dispatch) = next.take() {
            let cancel = CancellationToken::new();
            let job = WorkerJob {
                request_id: dispatch.request_id,
                request: dispatch.request,
                cancel: cancel.clone(),
            };
            let sent = self
                .workers
                .get(&dispatch.worker)
                .is_some_and(|tx| tx.try_send(job).is_ok());

            if sent {
                self.cancels.insert(dispatch.request_id, cancel);
            } else {
                process_warn!(
                    ProcessId::current(),
                    "⚠️ {} unavailable for request {}",
                    dispatch.worker,
                    dispatch.request_id
                );
                next = self.pool.complete(
                    dispatch.worker,
                    dispatch.request_id,
                    Err(WORKER_UNAVAILABLE.to_string()),
                    Instant::now(),
                );
            }
        }
    }

    fn on_completion(&mut self, completion: Completion) {
        let now = Instant::now();
        self.cancels.remove(&completion.request_id);
        if let Some(next) = self
            .pool
            .complete(completion.worker, completion.request_id, completion.result, now)
        {
            self.dispatch(next);
        }
        self.notify_finished();
        self.progress_maintenance(now);
    }

    fn on_tick(&mut self) {
        let now = Instant::now();
        for cancel in self.pool.sweep(now) {
            if let Some(token) = self.cancels.remove(&cancel.request_id) {
                token.cancel();
            }
            process_debug!(
                ProcessId::current(),
                "⏰ Request {} on {} timed out",
                cancel.request_id,
                cancel.worker
            );
        }
        self.notify_finished();
        self.progress_maintenance(now);
    }

    fn notify_finished(&mut self) {
        for (request_id, outcome) in self.pool.take_finished() {
            if let Some(waiter) = self.waiters.remove(&request_id) {
                let _ = waiter.send(outcome);
            }
        }
    }

    // Supervisor control

    fn supervisor_command(&mut self, op: SupervisorOp, reply: Option<AdminReply>) {
        if let Some((current, waiters)) = self.supervisor_op.as_mut() {
            if *current == op {
                waiters.extend(reply);
            } else if let Some(reply) = reply {
                let _ = reply.send(Err(HypervisorError::in_progress(format!("{:?}", current).to_lowercase())));
            }
            return;
        }
        if let Some(maintenance) = &self.maintenance {
            if let Some(reply) = reply {
                let _ = reply.send(Err(HypervisorError::in_progress(maintenance.kind.describe())));
            }
            return;
        }

        let launch = match op {
            SupervisorOp::Start => match BackendLaunch::from_settings(&self.applied) {
                Ok(launch) => Some(launch),
                Err(e) => {
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(e));
                    }
                    return;
                }
            },
            SupervisorOp::Stop => None,
        };

        let supervisor = self.supervisor.clone();
        let events = self.event_tx.clone();
        let stop_timeout = Duration::from_secs(self.applied.backend_stop_timeout_seconds);
        tokio::spawn(async move {
            let result = match launch {
                Some(launch) => start_with_retries(supervisor.as_ref(), &launch)
                    .await
                    .map(|health| format!("backend running (pid {:?})", health.pid)),
                None => supervisor
                    .stop(stop_timeout)
                    .await
                    .map(|outcome| format!("backend stopped ({:?})", outcome)),
            };
            let _ = events.send(Event::SupervisorOpFinished { op, result });
        });

        self.supervisor_op = Some((op, reply.into_iter().collect()));
    }

    fn restart_command(&mut self, reply: AdminReply) {
        if let Some(err) = self.conflict_with(MaintenanceKind::Restart, |m| m.next == self.applied) {
            let _ = reply.send(err);
            return;
        }
        if let Some(maintenance) = self.maintenance.as_mut() {
            maintenance.replies.push(reply);
            return;
        }
        let next = self.applied.clone();
        self.begin_maintenance(MaintenanceKind::Restart, next, vec![reply]);
    }

    async fn resize_command(&mut self, workers: u32, reply: AdminReply) {
        if workers == 0 {
            let _ = reply.send(Err(HypervisorError::config("worker count must be at least 1")));
            return;
        }
        if let Some(err) = self.conflict_with(MaintenanceKind::Resize, |m| m.next.worker_count == workers) {
            let _ = reply.send(err);
            return;
        }
        if let Some(maintenance) = self.maintenance.as_mut() {
            maintenance.replies.push(reply);
            return;
        }
        if self.applied.worker_count == workers {
            let _ = reply.send(Ok(AdminResponse::ok(format!("already running {workers} workers"))));
            return;
        }

        let next = Settings {
            worker_count: workers,
            ..self.applied.clone()
        };
        match self.config.update(next).await {
            Ok(saved) => self.begin_maintenance(MaintenanceKind::Resize, saved, vec![reply]),
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    async fn set_model_command(&mut self, model: String, reply: AdminReply) {
        let wanted = Some(model.clone());
        if let Some(err) = self.conflict_with(MaintenanceKind::Restart, |m| m.next.model == wanted) {
            let _ = reply.send(err);
            return;
        }
        if let Some(maintenance) = self.maintenance.as_mut() {
            maintenance.replies.push(reply);
            return;
        }
        if self.applied.model == wanted {
            let _ = reply.send(Ok(AdminResponse::ok(format!("model {model} already active"))));
            return;
        }

        let next = Settings {
            model: wanted,
            ..self.applied.clone()
        };
        match self.config.update(next).await {
            Ok(saved) => self.begin_maintenance(MaintenanceKind::Restart, saved, vec![reply]),
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    /// Error for an admin call that collides with running work
    ///
    /// `None` means the call may proceed: nothing is running, or the running
    /// maintenance is the same operation (`same` holds) and the caller joins it.
    fn conflict_with<F>(&self, kind: MaintenanceKind, same: F) -> Option<HypervisorResult<AdminResponse>>
    where
        F: Fn(&Maintenance) -> bool,
    {
        if let Some((op, _)) = &self.supervisor_op {
            return Some(Err(HypervisorError::in_progress(format!("{:?}", op).to_lowercase())));
        }
        match &self.maintenance {
            Some(m) if m.kind == kind && same(m) => None,
            Some(m) => Some(Err(HypervisorError::in_progress(m.kind.describe()))),
            None => None,
        }
    }

    // Maintenance: drain, restart the backend, resume

    fn begin_maintenance(&mut self, kind: MaintenanceKind, next: Settings, replies: Vec<AdminReply>) {
        self.begin_maintenance_with_grace(kind, next, replies, self.applied.drain_grace());
    }

    fn begin_maintenance_with_grace(
        &mut self,
        kind: MaintenanceKind,
        next: Settings,
        replies: Vec<AdminReply>,
        grace: Duration,
    ) {
        let now = Instant::now();
        self.pool.begin_drain();
        process_info!(
            ProcessId::current(),
            "🚧 {} started, draining {} running and {} queued requests (grace {:?})",
            kind.describe(),
            self.pool.running(),
            self.pool.queued(),
            grace
        );
        self.maintenance = Some(Maintenance {
            kind,
            phase: MaintenancePhase::Draining,
            next,
            drain_deadline: deadline_after(now, grace),
            replies,
            drain_reply: None,
            drain_report: None,
            backend_stopped: false,
        });
        self.progress_maintenance(now);
    }

    fn progress_maintenance(&mut self, now: Instant) {
        let Some((kind, deadline)) = self
            .maintenance
            .as_ref()
            .filter(|m| m.phase == MaintenancePhase::Draining)
            .map(|m| (m.kind, m.drain_deadline))
        else {
            return;
        };

        let drained = self.pool.is_drained();
        if !drained && now < deadline {
            return;
        }

        let mut report = DrainReport {
            drained,
            ..DrainReport::default()
        };
        if !drained {
            let reject_queue = kind == MaintenanceKind::Update;
            if reject_queue {
                report.rejected_queued = self.pool.queued();
            }
            let cancels = self.pool.expire_drain(reject_queue);
            report.cancelled = cancels.len();
            for cancel in cancels {
                if let Some(token) = self.cancels.remove(&cancel.request_id) {
                    token.cancel();
                }
            }
            self.notify_finished();
            process_warn!(
                ProcessId::current(),
                "⏳ Drain grace period elapsed: {} cancelled, {} queued rejected",
                report.cancelled,
                report.rejected_queued
            );
        }

        match kind {
            MaintenanceKind::Update => {
                if let Some(maintenance) = self.maintenance.as_mut() {
                    maintenance.phase = MaintenancePhase::Handed;
                    match maintenance.drain_reply.take() {
                        Some(reply) => {
                            let _ = reply.send(report);
                        }
                        None => maintenance.drain_report = Some(report),
                    }
                }
            }
            MaintenanceKind::Restart | MaintenanceKind::Resize => self.restart_backend(now),
        }
    }

    fn restart_backend(&mut self, now: Instant) {
        let Some(maintenance) = self.maintenance.as_mut() else {
            return;
        };
        maintenance.phase = MaintenancePhase::Restarting;
        let next = maintenance.next.clone();

        self.pool.begin_restart(now);
        // Dropping the senders ends the old worker tasks once their current job unwinds
        self.workers.clear();

        let supervisor = self.supervisor.clone();
        let events = self.event_tx.clone();
        tokio::spawn(async move {
            let result = match next.backend_executable {
                Some(_) => match BackendLaunch::from_settings(&next) {
                    Ok(launch) => supervisor
                        .restart(&launch)
                        .await
                        .map(|health| format!("backend restarted (pid {:?})", health.pid)),
                    Err(e) => Err(e),
                },
                None => Ok("no backend configured".to_string()),
            };
            let _ = events.send(Event::BackendRestarted(result));
        });
    }

    fn finish_maintenance(&mut self, result: HypervisorResult<String>) {
        let Some(maintenance) = self.maintenance.take() else {
            return;
        };
        let now = Instant::now();

        self.applied = maintenance.next;
        self.pool.set_default_timeout(self.applied.timeout());
        let dispatches = self
            .pool
            .finish_restart(self.applied.worker_count, self.applied.max_queue_size, now);
        self.spawn_workers();
        for dispatch in dispatches {
            self.dispatch(dispatch);
        }
        self.notify_finished();

        match &result {
            Ok(message) => logging::log_success(
                ProcessId::current(),
                &format!(
                    "{} finished with {} workers: {}",
                    maintenance.kind.describe(),
                    self.applied.worker_count,
                    message
                ),
            ),
            Err(e) => logging::log_error(ProcessId::current(), "Backend restart", e),
        }
        for reply in maintenance.replies {
            let answer = match &result {
                Ok(message) => Ok(AdminResponse::ok(message.clone())),
                Err(e) => Err(share_error(e)),
            };
            let _ = reply.send(answer);
        }

        if let Some(pending) = self.pending_settings.take() {
            self.on_settings_changed(pending);
        }
    }

    // Updates

    fn update_command(&mut self, descriptor: BundleDescriptor) -> HypervisorResult<UpdateStatus> {
        if let Some(maintenance) = &self.maintenance {
            if maintenance.kind != MaintenanceKind::Update {
                return Err(HypervisorError::in_progress(maintenance.kind.describe()));
            }
        }

        let job = match self.updater.request(descriptor) {
            Ok(job) => job,
            Err(status) => return Ok(status),
        };

        let grace = job.grace_period;
        let next = self.applied.clone();
        self.begin_maintenance_with_grace(MaintenanceKind::Update, next, Vec::new(), grace);

        let updater = self.updater.clone();
        let host: Arc<dyn UpdateHost> = Arc::new(self.handle());
        let events = self.event_tx.clone();
        tokio::spawn(async move {
            let status = updater.run(job, host).await;
            let _ = events.send(Event::UpdateFinished(status));
        });

        Ok(self.updater.status())
    }

    fn drain_command(&mut self, grace: Duration, reply: oneshot::Sender<DrainReport>) {
        match self.maintenance.as_mut() {
            Some(maintenance) if maintenance.kind == MaintenanceKind::Update => {
                match maintenance.drain_report {
                    Some(report) => {
                        let _ = reply.send(report);
                    }
                    None => maintenance.drain_reply = Some(reply),
                }
            }
            Some(maintenance) => {
                process_warn!(
                    ProcessId::current(),
                    "⚠️ Drain requested during {}",
                    maintenance.kind.describe()
                );
                let _ = reply.send(DrainReport::default());
            }
            None => {
                let next = self.applied.clone();
                self.begin_maintenance_with_grace(MaintenanceKind::Update, next, Vec::new(), grace);
                if let Some(maintenance) = self.maintenance.as_mut() {
                    match maintenance.drain_report.take() {
                        Some(report) => {
                            let _ = reply.send(report);
                        }
                        None => maintenance.drain_reply = Some(reply),
                    }
                }
            }
        }
    }

    fn on_update_finished(&mut self, status: UpdateStatus) {
        if status.phase == UpdatePhase::Done {
            logging::log_success(ProcessId::current(), "Update installed, handing over to the new build");
            self.exit = Some(Exit::Updated);
            return;
        }

        process_error!(
            ProcessId::current(),
            "❌ Update ended in {:?}: {}",
            status.phase,
            status.reason.as_deref().unwrap_or("no reason given")
        );

        match self.maintenance.take() {
            Some(maintenance) if maintenance.kind == MaintenanceKind::Update => {
                if maintenance.backend_stopped && self.applied.backend_executable.is_some() {
                    self.maintenance = Some(Maintenance {
                        kind: MaintenanceKind::Restart,
                        phase: MaintenancePhase::Draining,
                        next: self.applied.clone(),
                        drain_deadline: Instant::now(),
                        replies: Vec::new(),
                        drain_reply: None,
                        drain_report: None,
                        backend_stopped: true,
                    });
                    self.restart_backend(Instant::now());
                } else {
                    self.pool.resume();
                    if let Some(pending) = self.pending_settings.take() {
                        self.on_settings_changed(pending);
                    }
                }
            }
            other => self.maintenance = other,
        }
    }

    // Events and settings

    fn on_event(&mut self, event: Event) {
        match event {
            Event::BackendRestarted(result) => self.finish_maintenance(result),
            Event::SupervisorOpFinished { op, result } => {
                let waiters = match self.supervisor_op.take() {
                    Some((current, waiters)) if current == op => waiters,
                    other => {
                        self.supervisor_op = other;
                        Vec::new()
                    }
                };
                match &result {
                    Ok(message) => process_info!(ProcessId::current(), "✅ {:?}: {}", op, message),
                    Err(e) => logging::log_error(ProcessId::current(), &format!("{:?}", op), e),
                }
                for reply in waiters {
                    let answer = match &result {
                        Ok(message) => Ok(AdminResponse::ok(message.clone())),
                        Err(e) => Err(share_error(e)),
                    };
                    let _ = reply.send(answer);
                }
            }
            Event::UpdateFinished(status) => self.on_update_finished(status),
        }
    }

    fn on_settings_changed(&mut self, next: Settings) {
        if let Some(maintenance) = self.maintenance.as_mut() {
            if maintenance.next == next {
                return;
            }
            let structural = maintenance.next.requires_resize(&next) || maintenance.next.requires_restart(&next);
            if structural || maintenance.kind == MaintenanceKind::Update {
                process_debug!(ProcessId::current(), "📝 Settings change deferred until {} finishes", maintenance.kind.describe());
                self.pending_settings = Some(next);
            } else {
                self.pool.set_default_timeout(next.timeout());
                maintenance.next = next;
            }
            return;
        }

        if self.applied.requires_resize(&next) {
            self.begin_maintenance(MaintenanceKind::Resize, next, Vec::new());
        } else if self.applied.requires_restart(&next) {
            self.begin_maintenance(MaintenanceKind::Restart, next, Vec::new());
        } else if next != self.applied {
            process_debug!(ProcessId::current(), "📝 Settings applied in place");
            self.pool.set_default_timeout(next.timeout());
            self.applied = next;
        }
    }

    async fn shutdown(&mut self, exit: Exit) {
        for (_, token) in self.cancels.drain() {
            token.cancel();
        }
        self.workers.clear();

        let timeout = Duration::from_secs(self.applied.backend_stop_timeout_seconds);
        match self.supervisor.stop(timeout).await {
            Ok(TerminationOutcome::AlreadyExited) => {}
            Ok(outcome) => process_info!(ProcessId::current(), "🛑 Backend stopped on shutdown: {:?}", outcome),
            Err(e) => logging::log_error(ProcessId::current(), "Stopping backend on shutdown", &e),
        }

        let reason = match exit {
            Exit::Shutdown => "shutdown requested",
            Exit::Updated => "replaced by an updated build",
        };
        logging::log_shutdown(ProcessId::current(), reason);
    }
}

/// Worker task: runs one job at a time and reports every result
async fn run_worker<B>(
    id: WorkerId,
    mut jobs: mpsc::Receiver<WorkerJob>,
    backend: Arc<B>,
    completions: mpsc::UnboundedSender<Completion>,
) where
    B: InferenceBackend + ?Sized,
{
    while let Some(job) = jobs.recv().await {
        let result = backend
            .infer(id, job.request, job.cancel)
            .await
            .map_err(|e| e.to_string());
        let completion = Completion {
            worker: id,
            request_id: job.request_id,
            result,
        };
        if completions.send(completion).is_err() {
            break;
        }
    }
}

/// Copy of an error for every caller waiting on the same operation
fn share_error(error: &HypervisorError) -> HypervisorError {
    match error {
        HypervisorError::LaunchFailed { reason } => HypervisorError::launch(reason.clone()),
        HypervisorError::TerminationFailed { pid, reason } => HypervisorError::TerminationFailed {
            pid: *pid,
            reason: reason.clone(),
        },
        HypervisorError::Configuration { message } => HypervisorError::config(message.clone()),
        HypervisorError::OperationInProgress { operation } => HypervisorError::in_progress(operation.clone()),
        other => HypervisorError::backend(other.to_string()),
    }
}
