//! Worker pool and admission control
//!
//! Bounds the number of concurrently running model instances, buffers
//! overflow in a [`RequestQueue`] and enforces per-request deadlines. The pool
//! never performs I/O: it returns [`Dispatch`] and [`Cancel`] instructions that
//! the control loop turns into messages for worker tasks.

use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use shared::{
    deadline_after, Admission, InferenceRequest, PoolStats, RequestId, RequestOutcome, RequestState, RequestStatus,
    Settings, WorkerId,
};

use super::queue::RequestQueue;

/// Terminal outcomes kept for polling
pub const OUTCOME_HISTORY: usize = 1024;

const DRAIN_EXPIRED: &str = "drain grace period elapsed";
const QUEUE_SHRUNK: &str = "queue capacity reduced";
const STATION_UPDATING: &str = "station is being updated";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Busy,
    Restarting,
}

/// One model instance slot
#[derive(Debug, Clone)]
pub struct Worker {
    pub id: WorkerId,
    pub state: WorkerState,
    pub last_activity: Instant,
    /// Request currently executing; stays set after a timeout until the worker reports back
    pub bound: Option<RequestId>,
}

impl Worker {
    fn idle(id: WorkerId, now: Instant) -> Self {
        Self {
            id,
            state: WorkerState::Idle,
            last_activity: now,
            bound: None,
        }
    }
}

/// Book-keeping for a non-terminal request
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub id: RequestId,
    pub function: String,
    pub payload_size: usize,
    pub enqueued_at: Instant,
    pub deadline: Instant,
    pub state: RequestState,
    pub worker: Option<WorkerId>,
}

/// Instruction to hand a request to a worker
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub worker: WorkerId,
    pub request_id: RequestId,
    pub request: InferenceRequest,
}

/// Instruction to cancel the computation running on a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancel {
    pub worker: WorkerId,
    pub request_id: RequestId,
}

#[derive(Debug)]
struct Queued {
    id: RequestId,
    request: InferenceRequest,
}

#[derive(Debug, Default)]
struct Counters {
    completed: u64,
    timeouts: u64,
    rejected: u64,
    saturated: u64,
}

#[derive(Debug)]
pub struct WorkerPool {
    workers: Vec<Worker>,
    queue: RequestQueue<Queued>,
    records: HashMap<RequestId, RequestRecord>,
    outcomes: HashMap<RequestId, RequestOutcome>,
    history: VecDeque<RequestId>,
    history_limit: usize,
    finished: Vec<(RequestId, RequestOutcome)>,
    default_timeout: Duration,
    accepting: bool,
    counters: Counters,
}

impl WorkerPool {
    pub fn new(worker_count: u32, max_queue_size: usize, default_timeout: Duration, now: Instant) -> Self {
        Self {
            workers: (0..worker_count).map(|i| Worker::idle(WorkerId(i), now)).collect(),
            queue: RequestQueue::new(max_queue_size),
            records: HashMap::new(),
            outcomes: HashMap::new(),
            history: VecDeque::new(),
            history_limit: OUTCOME_HISTORY,
            finished: Vec::new(),
            default_timeout,
            accepting: true,
            counters: Counters::default(),
        }
    }

    pub fn from_settings(settings: &Settings, now: Instant) -> Self {
        Self::new(settings.worker_count, settings.max_queue_size, settings.timeout(), now)
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    /// Admit a request: run it on an idle worker, queue it, or report saturation
    pub fn submit(&mut self, request: InferenceRequest, now: Instant) -> (Admission, Option<Dispatch>) {
        if !self.accepting {
            self.counters.saturated += 1;
            return (Admission::Saturated, None);
        }

        let id = RequestId::new();
        let timeout = request.timeout().unwrap_or(self.default_timeout);
        let mut record = RequestRecord {
            id,
            function: request.function.clone(),
            payload_size: request.payload_size(),
            enqueued_at: now,
            deadline: deadline_after(now, timeout),
            state: RequestState::Queued,
            worker: None,
        };

        // Only bypass the queue when nobody is waiting ahead of us
        if self.queue.is_empty() {
            if let Some(worker) = self.workers.iter_mut().find(|w| w.state == WorkerState::Idle) {
                worker.state = WorkerState::Busy;
                worker.bound = Some(id);
                worker.last_activity = now;
                record.state = RequestState::Running;
                record.worker = Some(worker.id);
                let dispatch = Dispatch {
                    worker: worker.id,
                    request_id: id,
                    request,
                };
                self.records.insert(id, record);
                return (Admission::Accepted { request_id: id }, Some(dispatch));
            }
        }

        if self.queue.push(Queued { id, request }).is_err() {
            self.counters.saturated += 1;
            return (Admission::Saturated, None);
        }
        self.records.insert(id, record);
        (Admission::Accepted { request_id: id }, None)
    }

    /// Record a worker's result, free the worker and hand it the queue head
    ///
    /// Results for requests that already reached a terminal state are dropped,
    /// but the worker is still released.
    pub fn complete(
        &mut self,
        worker_id: WorkerId,
        request_id: RequestId,
        result: Result<Value, String>,
        now: Instant,
    ) -> Option<Dispatch> {
        if self.records.remove(&request_id).is_some() {
            let outcome = match result {
                Ok(result) => RequestOutcome::Completed { result },
                Err(reason) => RequestOutcome::Rejected { reason },
            };
            self.finish(request_id, outcome);
        }

        let worker = self
            .workers
            .iter_mut()
            .find(|w| w.id == worker_id && w.bound == Some(request_id))?;
        worker.bound = None;
        worker.last_activity = now;
        if worker.state != WorkerState::Busy {
            return None;
        }
        worker.state = WorkerState::Idle;
        self.dispatch_next(worker_id, now)
    }

    /// Deadline sweep: expire queued requests and cancel running ones past their deadline
    pub fn sweep(&mut self, now: Instant) -> Vec<Cancel> {
        let records = &self.records;
        let expired = self
            .queue
            .remove_where(|queued| records.get(&queued.id).is_some_and(|r| r.deadline <= now));
        for queued in expired {
            self.records.remove(&queued.id);
            self.finish(queued.id, RequestOutcome::TimedOut);
        }

        let overdue: Vec<Cancel> = self
            .workers
            .iter()
            .filter(|w| w.state == WorkerState::Busy)
            .filter_map(|w| {
                let request_id = w.bound?;
                let record = self.records.get(&request_id)?;
                (record.deadline <= now).then_some(Cancel {
                    worker: w.id,
                    request_id,
                })
            })
            .collect();

        for cancel in &overdue {
            self.records.remove(&cancel.request_id);
            self.finish(cancel.request_id, RequestOutcome::TimedOut);
        }
        overdue
    }

    /// Stop admitting; queued requests keep being dispatched
    pub fn begin_drain(&mut self) {
        self.accepting = false;
    }

    pub fn resume(&mut self) {
        self.accepting = true;
    }

    /// No worker busy and nothing queued
    pub fn is_drained(&self) -> bool {
        self.queue.is_empty() && !self.workers.iter().any(|w| w.state == WorkerState::Busy)
    }

    /// Grace period ran out: reject in-flight requests, and the queue too when `reject_queue`
    pub fn expire_drain(&mut self, reject_queue: bool) -> Vec<Cancel> {
        let running: Vec<Cancel> = self
            .workers
            .iter()
            .filter(|w| w.state == WorkerState::Busy)
            .filter_map(|w| {
                w.bound.map(|request_id| Cancel {
                    worker: w.id,
                    request_id,
                })
            })
            .collect();

        for cancel in &running {
            if self.records.remove(&cancel.request_id).is_some() {
                self.finish(
                    cancel.request_id,
                    RequestOutcome::Rejected {
                        reason: DRAIN_EXPIRED.to_string(),
                    },
                );
            }
        }

        if reject_queue {
            for queued in self.queue.drain() {
                self.records.remove(&queued.id);
                self.finish(
                    queued.id,
                    RequestOutcome::Rejected {
                        reason: STATION_UPDATING.to_string(),
                    },
                );
            }
        }
        running
    }

    /// Mark every worker as restarting while the backend is relaunched
    pub fn begin_restart(&mut self, now: Instant) {
        for worker in &mut self.workers {
            worker.state = WorkerState::Restarting;
            worker.bound = None;
            worker.last_activity = now;
        }
    }

    /// Recreate workers at the new size, apply the queue capacity and resume admission
    pub fn finish_restart(&mut self, worker_count: u32, max_queue_size: usize, now: Instant) -> Vec<Dispatch> {
        self.workers = (0..worker_count).map(|i| Worker::idle(WorkerId(i), now)).collect();

        for queued in self.queue.set_capacity(max_queue_size) {
            self.records.remove(&queued.id);
            self.finish(
                queued.id,
                RequestOutcome::Rejected {
                    reason: QUEUE_SHRUNK.to_string(),
                },
            );
        }

        self.accepting = true;

        let idle: Vec<WorkerId> = self.workers.iter().map(|w| w.id).collect();
        idle.into_iter()
            .map_while(|worker| self.dispatch_next(worker, now))
            .collect()
    }

    /// Current state of a request, live or from the outcome history
    pub fn poll(&self, request_id: &RequestId) -> Option<RequestStatus> {
        if let Some(record) = self.records.get(request_id) {
            return Some(RequestStatus {
                request_id: *request_id,
                state: record.state,
                outcome: None,
            });
        }
        self.outcomes.get(request_id).map(|outcome| RequestStatus {
            request_id: *request_id,
            state: outcome.state(),
            outcome: Some(outcome.clone()),
        })
    }

    /// Terminal transitions since the last call
    pub fn take_finished(&mut self) -> Vec<(RequestId, RequestOutcome)> {
        std::mem::take(&mut self.finished)
    }

    pub fn stats(&self) -> PoolStats {
        let count = |state: WorkerState| self.workers.iter().filter(|w| w.state == state).count();
        PoolStats {
            workers: self.workers.len(),
            idle: count(WorkerState::Idle),
            busy: count(WorkerState::Busy),
            restarting: count(WorkerState::Restarting),
            queue_size: self.queue.len(),
            max_queue_size: self.queue.capacity(),
            accepting: self.accepting,
            completed: self.counters.completed,
            timeouts: self.counters.timeouts,
            rejected: self.counters.rejected,
            saturated: self.counters.saturated,
            default_timeout: self.default_timeout.as_secs_f64(),
        }
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    pub fn record(&self, request_id: &RequestId) -> Option<&RequestRecord> {
        self.records.get(request_id)
    }

    /// Requests in the `Running` state
    pub fn running(&self) -> usize {
        self.records
            .values()
            .filter(|r| r.state == RequestState::Running)
            .count()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn set_default_timeout(&mut self, timeout: Duration) {
        self.default_timeout = timeout;
    }

    fn dispatch_next(&mut self, worker_id: WorkerId, now: Instant) -> Option<Dispatch> {
        let queued = self.queue.pop()?;
        let worker = self.workers.iter_mut().find(|w| w.id == worker_id)?;
        worker.state = WorkerState::Busy;
        worker.bound = Some(queued.id);
        worker.last_activity = now;

        if let Some(record) = self.records.get_mut(&queued.id) {
            record.state = RequestState::Running;
            record.worker = Some(worker_id);
        }

        Some(Dispatch {
            worker: worker_id,
            request_id: queued.id,
            request: queued.request,
        })
    }

    fn finish(&mut self, request_id: RequestId, outcome: RequestOutcome) {
        match &outcome {
            RequestOutcome::Completed { .. } => self.counters.completed += 1,
            RequestOutcome::TimedOut => self.counters.timeouts += 1,
            RequestOutcome::Rejected { .. } => self.counters.rejected += 1,
        }

        if self.history.len() >= self.history_limit {
            if let Some(oldest) = self.history.pop_front() {
                self.outcomes.remove(&oldest);
            }
        }
        self.history.push_back(request_id);
        self.outcomes.insert(request_id, outcome.clone());
        self.finished.push((request_id, outcome));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(n: u32) -> InferenceRequest {
        InferenceRequest::new("caption", json!({ "n": n }))
    }

    fn accepted(admission: Admission) -> RequestId {
        match admission {
            Admission::Accepted { request_id } => request_id,
            Admission::Saturated => panic!("expected admission"),
        }
    }

    #[test]
    fn test_two_workers_three_submits_then_saturated() {
        let now = Instant::now();
        let mut pool = WorkerPool::new(2, 1, Duration::from_secs(30), now);

        let (_, first) = pool.submit(request(1), now);
        let (_, second) = pool.submit(request(2), now);
        let (third, dispatch) = pool.submit(request(3), now);

        assert!(first.is_some() && second.is_some());
        assert!(dispatch.is_none());
        let third = accepted(third);
        assert_eq!(pool.poll(&third).unwrap().state, RequestState::Queued);
        assert_eq!(pool.running(), 2);

        let (fourth, _) = pool.submit(request(4), now);
        assert_eq!(fourth, Admission::Saturated);
        assert_eq!(pool.stats().saturated, 1);
    }

    #[test]
    fn test_completion_dispatches_queue_head() {
        let now = Instant::now();
        let mut pool = WorkerPool::new(1, 5, Duration::from_secs(30), now);

        let (_, running) = pool.submit(request(0), now);
        let running = running.unwrap();
        let queued: Vec<RequestId> = (1..4).map(|n| accepted(pool.submit(request(n), now).0)).collect();

        let next = pool
            .complete(running.worker, running.request_id, Ok(json!("done")), now)
            .unwrap();
        assert_eq!(next.request_id, queued[0]);
        assert_eq!(next.worker, running.worker);

        let status = pool.poll(&running.request_id).unwrap();
        assert_eq!(status.state, RequestState::Completed);
        assert_eq!(status.outcome, Some(RequestOutcome::Completed { result: json!("done") }));
    }

    #[test]
    fn test_queued_request_times_out_on_sweep() {
        let now = Instant::now();
        let mut pool = WorkerPool::new(1, 5, Duration::from_secs(30), now);
        pool.submit(request(0), now);
        let queued = accepted(pool.submit(request(1).with_timeout(Duration::from_secs(1)), now).0);

        assert!(pool.sweep(now + Duration::from_millis(500)).is_empty());
        assert_eq!(pool.poll(&queued).unwrap().state, RequestState::Queued);

        pool.sweep(now + Duration::from_secs(1));
        assert_eq!(pool.poll(&queued).unwrap().state, RequestState::TimedOut);
        assert_eq!(pool.queued(), 0);
    }

    #[test]
    fn test_running_timeout_cancels_and_late_result_is_discarded() {
        let now = Instant::now();
        let mut pool = WorkerPool::new(1, 5, Duration::from_secs(2), now);
        let dispatch = pool.submit(request(0), now).1.unwrap();
        let waiting = accepted(pool.submit(request(1).with_timeout(Duration::from_secs(60)), now).0);

        let cancels = pool.sweep(now + Duration::from_secs(3));
        assert_eq!(
            cancels,
            vec![Cancel {
                worker: dispatch.worker,
                request_id: dispatch.request_id
            }]
        );
        assert_eq!(pool.poll(&dispatch.request_id).unwrap().state, RequestState::TimedOut);
        // The worker stays busy until the cancelled computation unwinds
        assert_eq!(pool.stats().busy, 1);

        let next = pool.complete(dispatch.worker, dispatch.request_id, Ok(json!("late")), now + Duration::from_secs(4));
        assert_eq!(next.unwrap().request_id, waiting);
        assert_eq!(
            pool.poll(&dispatch.request_id).unwrap().outcome,
            Some(RequestOutcome::TimedOut)
        );
        assert_eq!(pool.stats().completed, 0);
    }

    #[test]
    fn test_backend_error_becomes_rejected() {
        let now = Instant::now();
        let mut pool = WorkerPool::new(1, 0, Duration::from_secs(5), now);
        let dispatch = pool.submit(request(0), now).1.unwrap();
        pool.complete(dispatch.worker, dispatch.request_id, Err("HTTP 500".to_string()), now);

        let finished = pool.take_finished();
        assert_eq!(
            finished,
            vec![(
                dispatch.request_id,
                RequestOutcome::Rejected {
                    reason: "HTTP 500".to_string()
                }
            )]
        );
        assert!(pool.take_finished().is_empty());
    }

    #[test]
    fn test_resize_down_while_busy() {
        let now = Instant::now();
        let mut pool = WorkerPool::new(2, 4, Duration::from_secs(30), now);
        let a = pool.submit(request(0), now).1.unwrap();
        let b = pool.submit(request(1), now).1.unwrap();

        pool.begin_drain();
        assert_eq!(pool.submit(request(2), now).0, Admission::Saturated);
        assert!(!pool.is_drained());

        pool.complete(a.worker, a.request_id, Ok(json!(1)), now);
        assert!(!pool.is_drained());
        pool.complete(b.worker, b.request_id, Ok(json!(2)), now);
        assert!(pool.is_drained());

        pool.begin_restart(now);
        assert_eq!(pool.stats().restarting, 2);
        assert!(pool.finish_restart(1, 4, now).is_empty());

        let stats = pool.stats();
        assert_eq!(stats.workers, 1);
        assert_eq!(stats.idle, 1);
        assert!(stats.accepting);
    }

    #[test]
    fn test_drain_expiry_keeps_queue_for_resize() {
        let now = Instant::now();
        let mut pool = WorkerPool::new(1, 4, Duration::from_secs(30), now);
        let running = pool.submit(request(0), now).1.unwrap();
        let queued = accepted(pool.submit(request(1), now).0);

        pool.begin_drain();
        let cancels = pool.expire_drain(false);
        assert_eq!(cancels.len(), 1);
        assert_eq!(pool.poll(&running.request_id).unwrap().state, RequestState::Rejected);
        assert_eq!(pool.poll(&queued).unwrap().state, RequestState::Queued);

        pool.begin_restart(now);
        let dispatches = pool.finish_restart(2, 4, now);
        assert_eq!(dispatches.len(), 1);
        assert_eq!(dispatches[0].request_id, queued);

        // Old worker reporting back after the restart does not disturb the new one
        assert!(pool
            .complete(running.worker, running.request_id, Ok(json!("stale")), now)
            .is_none());
        assert_eq!(pool.stats().busy, 1);
    }

    #[test]
    fn test_drain_expiry_for_update_rejects_queue() {
        let now = Instant::now();
        let mut pool = WorkerPool::new(1, 4, Duration::from_secs(30), now);
        pool.submit(request(0), now);
        let queued = accepted(pool.submit(request(1), now).0);

        pool.begin_drain();
        pool.expire_drain(true);
        assert_eq!(pool.poll(&queued).unwrap().state, RequestState::Rejected);
        assert_eq!(pool.stats().rejected, 2);
    }

    #[test]
    fn test_shrinking_queue_rejects_tail() {
        let now = Instant::now();
        let mut pool = WorkerPool::new(1, 3, Duration::from_secs(30), now);
        pool.submit(request(0), now);
        let queued: Vec<RequestId> = (1..4).map(|n| accepted(pool.submit(request(n), now).0)).collect();

        pool.begin_restart(now);
        pool.finish_restart(1, 1, now);

        assert_eq!(pool.poll(&queued[0]).unwrap().state, RequestState::Running);
        assert_eq!(pool.poll(&queued[1]).unwrap().state, RequestState::Rejected);
        assert_eq!(pool.poll(&queued[2]).unwrap().state, RequestState::Rejected);
    }

    #[test]
    fn test_history_is_bounded() {
        let now = Instant::now();
        let mut pool = WorkerPool::new(1, 0, Duration::from_secs(30), now).with_history_limit(2);
        let mut ids = Vec::new();
        for n in 0..3 {
            let dispatch = pool.submit(request(n), now).1.unwrap();
            pool.complete(dispatch.worker, dispatch.request_id, Ok(json!(n)), now);
            ids.push(dispatch.request_id);
        }

        assert!(pool.poll(&ids[0]).is_none());
        assert!(pool.poll(&ids[1]).is_some());
        assert!(pool.poll(&ids[2]).is_some());
    }

    #[test]
    fn test_request_timeout_overrides_default() {
        let now = Instant::now();
        let mut pool = WorkerPool::new(1, 1, Duration::from_secs(30), now);
        let id = accepted(pool.submit(request(0).with_timeout(Duration::from_secs(5)), now).0);
        assert_eq!(pool.record(&id).unwrap().deadline, now + Duration::from_secs(5));
    }
}
