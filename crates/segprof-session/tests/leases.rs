use segprof_api::{default_backends, BackendId, SessionId, BACKEND_CATALOG};
use segprof_session::{
    CloseHook, InMemoryQuota, Lease, LeaseManager, LeasePool, LeaseState, QuotaAccounting,
    SessionError, SessionOptions,
};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn manager_with(quota: usize, timeout: Duration) -> (LeaseManager, Arc<InMemoryQuota>) {
    let accounting = Arc::new(InMemoryQuota::new(quota));
    let manager = LeaseManager::new(
        "ada",
        LeasePool::catalog(1),
        accounting.clone(),
        SessionOptions {
            queue_timeout: timeout,
            poll_interval: Duration::from_millis(10),
        },
    );
    (manager, accounting)
}

fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(5));
    }
}

#[derive(Default)]
struct RecordingHook {
    closed: Mutex<Vec<(SessionId, Vec<Lease>)>>,
}

impl CloseHook for RecordingHook {
    fn on_session_closed(&self, session: SessionId, leases: &[Lease]) {
        self.closed.lock().unwrap().push((session, leases.to_vec()));
    }
}

#[test]
fn default_session_leases_cpu_and_gpu() {
    let (manager, quota) = manager_with(4, Duration::from_secs(1));
    let session = manager.open_default().expect("open");
    assert_eq!(session.state(), LeaseState::Active);
    assert_eq!(session.backends(), default_backends().as_slice());
    assert_eq!(quota.in_use("ada"), 2);
    for backend in default_backends() {
        assert_eq!(manager.free_instances(&backend), 0);
    }
    session.close();
    assert_eq!(session.state(), LeaseState::Closed);
    assert_eq!(quota.in_use("ada"), 0);
}

#[test]
fn malformed_requests_fail_synchronously() {
    let (manager, _) = manager_with(4, Duration::from_secs(1));
    let err = manager.open(&[]).unwrap_err();
    assert_eq!(err, SessionError::EmptyBackendList);
    assert!(err.is_configuration());

    let cpu = BACKEND_CATALOG[0];
    assert_eq!(
        manager.open(&[cpu, cpu]).unwrap_err(),
        SessionError::DuplicateBackend(cpu)
    );

    let err = manager.open_named(&["r6i.large/onnxrt-tensorrt"]).unwrap_err();
    assert!(matches!(err, SessionError::Unsupported(_)));
    assert!(err.to_string().contains("supported backends"));
}

#[test]
fn backend_missing_from_pool_is_unsupported() {
    let manager = LeaseManager::new(
        "ada",
        LeasePool::new().with_backend(BACKEND_CATALOG[0], 1),
        Arc::new(InMemoryQuota::new(4)),
        SessionOptions::default(),
    );
    let err = manager.open(&[BACKEND_CATALOG[1]]).unwrap_err();
    assert!(matches!(err, SessionError::Unsupported(_)));
}

#[test]
fn request_larger_than_quota_is_a_capacity_error() {
    let (manager, _) = manager_with(1, Duration::from_secs(5));
    let started = Instant::now();
    let err = manager.open_default().unwrap_err();
    assert_eq!(
        err,
        SessionError::QuotaExceeded {
            requested: 2,
            limit: 1
        }
    );
    assert!(err.is_capacity());
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
fn queued_request_activates_when_quota_frees() {
    let (manager, quota) = manager_with(2, Duration::from_secs(5));
    let first = manager.open_default().expect("first session");

    let waiter = {
        let manager = manager.clone();
        thread::spawn(move || manager.open(&[BACKEND_CATALOG[2]]))
    };
    wait_until(|| manager.pending_count() == 1);
    assert!(!waiter.is_finished());
    assert_eq!(quota.in_use("ada"), 2);

    first.close();
    let second = waiter.join().unwrap().expect("second session");
    assert_eq!(second.state(), LeaseState::Active);
    assert_eq!(manager.pending_count(), 0);
    assert_eq!(quota.in_use("ada"), 1);
}

#[test]
fn busy_instance_blocks_until_released() {
    let (manager, _) = manager_with(8, Duration::from_secs(5));
    let cpu = BACKEND_CATALOG[0];
    let holder = manager.open(&[cpu]).expect("holder");

    let waiter = {
        let manager = manager.clone();
        thread::spawn(move || manager.open(&[cpu, BACKEND_CATALOG[1]]))
    };
    wait_until(|| manager.pending_count() == 1);
    // partially available requests do not grab the free backend
    assert_eq!(manager.free_instances(&BACKEND_CATALOG[1]), 1);

    drop(holder);
    let session = waiter.join().unwrap().expect("waiter");
    assert_eq!(session.leases().len(), 2);
}

#[test]
fn pending_request_times_out() {
    let (manager, _) = manager_with(1, Duration::from_millis(60));
    let _holder = manager.open(&[BACKEND_CATALOG[0]]).expect("holder");
    let err = manager.open(&[BACKEND_CATALOG[1]]).unwrap_err();
    match err {
        SessionError::QueueTimeout { requested, waited } => {
            assert_eq!(requested, 1);
            assert!(waited >= Duration::from_millis(60));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(manager.pending_count(), 0);
}

#[test]
fn close_is_idempotent_and_runs_hooks_once() {
    let (manager, _) = manager_with(4, Duration::from_secs(1));
    let hook = Arc::new(RecordingHook::default());
    manager.add_close_hook(hook.clone());

    let session = manager.open_default().expect("open");
    let id = session.id();
    session.close();
    session.close();
    drop(session);

    let closed = hook.closed.lock().unwrap();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].0, id);
    assert_eq!(closed[0].1.len(), 2);
}

#[test]
fn dropping_session_releases_leases() {
    let (manager, quota) = manager_with(4, Duration::from_secs(1));
    {
        let _session = manager.open_default().expect("open");
        assert_eq!(manager.snapshot().len(), 1);
    }
    assert!(manager.snapshot().is_empty());
    assert_eq!(quota.in_use("ada"), 0);
}

#[test]
fn close_waits_for_in_flight_work() {
    let (manager, _) = manager_with(4, Duration::from_secs(1));
    let session = manager.open_default().expect("open");
    let cpu = BACKEND_CATALOG[0];

    thread::scope(|scope| {
        let guard = session.begin_work(cpu).expect("work");
        let closer = scope.spawn(|| session.close());
        wait_until(|| session.is_closing());
        thread::sleep(Duration::from_millis(20));
        assert_eq!(session.state(), LeaseState::Active);
        assert_eq!(manager.free_instances(&cpu), 0);
        assert!(matches!(
            session.begin_work(cpu),
            Err(SessionError::Closed(_))
        ));
        drop(guard);
        closer.join().unwrap();
    });

    assert_eq!(session.state(), LeaseState::Closed);
    assert_eq!(manager.free_instances(&cpu), 1);
}

#[test]
fn work_on_unleased_backend_is_rejected() {
    let (manager, _) = manager_with(4, Duration::from_secs(1));
    let session = manager.open(&[BACKEND_CATALOG[0]]).expect("open");
    let err = session.begin_work(BACKEND_CATALOG[2]).err().expect("rejected");
    assert!(matches!(err, SessionError::NotLeased { .. }));
}

#[test]
fn quota_is_shared_between_managers_of_one_user() {
    let quota = Arc::new(InMemoryQuota::new(2));
    let options = SessionOptions {
        queue_timeout: Duration::from_millis(80),
        poll_interval: Duration::from_millis(10),
    };
    let a = LeaseManager::new("ada", LeasePool::catalog(1), quota.clone(), options.clone());
    let b = LeaseManager::new("ada", LeasePool::catalog(1), quota.clone(), options);

    let _held = a.open_default().expect("a");
    let err = b.open(&[BACKEND_CATALOG[2]]).unwrap_err();
    assert!(matches!(err, SessionError::QueueTimeout { .. }));
    assert_eq!(quota.in_use("ada"), 2);
}

#[test]
fn close_all_closes_open_sessions() {
    let (manager, quota) = manager_with(4, Duration::from_secs(1));
    let a = manager.open(&[BACKEND_CATALOG[0]]).expect("a");
    let b = manager.open(&[BACKEND_CATALOG[1]]).expect("b");
    manager.close_all();
    assert_eq!(a.state(), LeaseState::Closed);
    assert_eq!(b.state(), LeaseState::Closed);
    assert_eq!(quota.in_use("ada"), 0);
    let _: Vec<BackendId> = a.backends().to_vec();
}
