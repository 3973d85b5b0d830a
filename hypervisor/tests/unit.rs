//! Unit tests for the admission pool and update bookkeeping
//!
//! These drive the pure state machines directly with a controlled clock.

use serde_json::json;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

use hypervisor::{core::update as phases, RequestQueue, UpdateJob, WorkerPool, WorkerState};
use shared::{Admission, RequestId, RequestState, UpdatePhase, UpdateStatus};

mod common;
use common::TestFixtures;

/// Small deterministic generator so failures replay exactly
struct Lcg(u64);

impl Lcg {
    fn next(&mut self, bound: u64) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (self.0 >> 33) % bound
    }
}

/// Random submits, completions and sweeps never break the pool's capacity bounds
#[test]
fn test_pool_bounds_hold_under_random_load() {
    for seed in [1_u64, 7, 42, 1234] {
        let mut rng = Lcg(seed);
        let workers = 1 + rng.next(4) as u32;
        let max_queue = rng.next(5) as usize;
        let mut now = Instant::now();
        let mut pool = WorkerPool::new(workers, max_queue, Duration::from_millis(500), now);
        let mut running = Vec::new();

        for _ in 0..500 {
            match rng.next(3) {
                0 => {
                    let (admission, dispatch) = pool.submit(TestFixtures::request(), now);
                    if let Some(dispatch) = dispatch {
                        assert!(matches!(admission, Admission::Accepted { .. }));
                        running.push((dispatch.worker, dispatch.request_id));
                    }
                }
                1 if !running.is_empty() => {
                    let index = rng.next(running.len() as u64) as usize;
                    let (worker, request_id) = running.swap_remove(index);
                    if let Some(next) = pool.complete(worker, request_id, Ok(json!({"ok": true})), now) {
                        running.push((next.worker, next.request_id));
                    }
                }
                _ => {
                    now += Duration::from_millis(rng.next(200));
                    // Timed-out work keeps its worker until the backend reports back
                    pool.sweep(now);
                }
            }

            let stats = pool.stats();
            assert!(pool.running() <= workers as usize, "seed {seed}: too many running");
            assert!(pool.queued() <= max_queue, "seed {seed}: queue over capacity");
            assert_eq!(stats.idle + stats.busy, stats.workers);
            assert_eq!(stats.busy, running.len());
        }
    }
}

/// Queued requests reach workers in submission order
#[test]
fn test_queue_dispatches_in_fifo_order() {
    let now = Instant::now();
    let mut pool = WorkerPool::new(1, 8, Duration::from_secs(30), now);

    let (_, first) = pool.submit(TestFixtures::request(), now);
    let mut current = first.unwrap();

    let mut expected = VecDeque::new();
    for i in 0..5 {
        let request = shared::InferenceRequest::new(TestFixtures::FUNCTION, json!({"n": i}));
        match pool.submit(request, now).0 {
            Admission::Accepted { request_id } => expected.push_back(request_id),
            Admission::Saturated => panic!("queue should have room"),
        }
    }

    while let Some(next) = pool.complete(current.worker, current.request_id, Ok(json!(null)), now) {
        assert_eq!(Some(next.request_id), expected.pop_front());
        current = next;
    }
    assert!(expected.is_empty());
    assert!(pool.is_drained());
}

#[test]
fn test_restart_rebuilds_workers_and_keeps_queue() {
    let now = Instant::now();
    let mut pool = WorkerPool::new(1, 4, Duration::from_secs(30), now);
    let (_, running) = pool.submit(TestFixtures::request(), now);
    let running = running.unwrap();
    let (queued, _) = pool.submit(TestFixtures::request(), now);

    pool.begin_drain();
    assert!(!pool.is_accepting());
    pool.begin_restart(now);
    assert!(pool.workers().iter().all(|w| w.state == WorkerState::Restarting));

    // A late result from the old worker is recorded but hands out nothing
    assert!(pool.complete(running.worker, running.request_id, Ok(json!(1)), now).is_none());

    let dispatches = pool.finish_restart(2, 4, now);
    assert!(pool.is_accepting());
    assert_eq!(pool.workers().len(), 2);
    assert_eq!(dispatches.len(), 1);
    let Admission::Accepted { request_id } = queued else {
        panic!("expected the second request to queue");
    };
    assert_eq!(dispatches[0].request_id, request_id);
    assert_eq!(pool.poll(&request_id).unwrap().state, RequestState::Running);
}

/// An oversized timeout that slips past validation falls back to the default instead of panicking
#[test]
fn test_oversized_timeout_uses_default_deadline() {
    let now = Instant::now();
    let mut pool = WorkerPool::new(1, 1, Duration::from_secs(30), now);
    let mut request = TestFixtures::request();
    request.timeout_seconds = Some(1e20);

    let (admission, _) = pool.submit(request, now);

    let Admission::Accepted { request_id } = admission else {
        panic!("expected the request to be accepted");
    };
    assert!(pool.sweep(now + Duration::from_secs(29)).is_empty());
    assert_eq!(pool.sweep(now + Duration::from_secs(31)).len(), 1);
    assert_eq!(pool.poll(&request_id).unwrap().state, RequestState::TimedOut);
}

#[test]
fn test_unknown_request_polls_as_none() {
    let pool = WorkerPool::new(1, 1, Duration::from_secs(1), Instant::now());

    assert!(pool.poll(&RequestId::new()).is_none());
}

#[test]
fn test_request_queue_capacity_and_shrink() {
    let mut queue = RequestQueue::new(3);
    for i in 0..3 {
        queue.push(i).unwrap();
    }

    assert_eq!(queue.push(3), Err(3));
    let overflow = queue.set_capacity(1);
    assert_eq!(overflow, vec![2, 1]);
    assert_eq!(queue.pop(), Some(0));
    assert!(queue.is_empty());
}

#[test]
fn test_update_job_rejects_older_version() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut descriptor = TestFixtures::bundle(dir.path(), 1.0);
    descriptor.version = Some("v0.0.9".to_string());

    assert_err!(UpdateJob::from_descriptor(
        Uuid::new_v4(),
        descriptor.clone(),
        &TestFixtures::installed()
    ));

    descriptor.force = true;
    let job = assert_ok!(UpdateJob::from_descriptor(
        Uuid::new_v4(),
        descriptor,
        &TestFixtures::installed()
    ));
    assert_eq!(job.grace_period, Duration::from_secs(1));
}

#[test]
fn test_update_phases_advance_in_order() {
    let mut status = UpdateStatus::idle();
    let now = chrono::Utc::now();

    assert!(phases::begin(&mut status, Uuid::new_v4(), now));
    assert!(!phases::begin(&mut status, Uuid::new_v4(), now));

    let mut phase = UpdatePhase::Requested;
    while let Some(next) = phases::successor(phase) {
        assert!(phases::advance(&mut status, next, now));
        phase = next;
    }
    assert_eq!(status.phase, UpdatePhase::Done);
    assert!(!phases::fail(&mut status, "too late", now));
}
