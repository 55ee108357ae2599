use crate::quota::QuotaAccounting;
use crate::session::{CloseHook, Lease, LeaseState, Session, SessionInner};
use crate::{Result, SessionError};
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex, RwLock};
use segprof_api::{default_backends, BackendId, SessionId, UnsupportedBackend, BACKEND_CATALOG};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime};

/// Instances available per backend.
#[derive(Debug, Clone)]
pub struct LeasePool {
    capacity: BTreeMap<BackendId, usize>,
}

impl LeasePool {
    pub fn new() -> Self {
        Self {
            capacity: BTreeMap::new(),
        }
    }

    /// Every catalog backend with `instances` instances each.
    pub fn catalog(instances: usize) -> Self {
        BACKEND_CATALOG
            .iter()
            .fold(Self::new(), |pool, b| pool.with_backend(*b, instances))
    }

    pub fn with_backend(mut self, backend: BackendId, instances: usize) -> Self {
        if instances > 0 {
            self.capacity.insert(backend, instances);
        }
        self
    }

    pub fn offers(&self, backend: &BackendId) -> bool {
        self.capacity.contains_key(backend)
    }
}

impl Default for LeasePool {
    fn default() -> Self {
        Self::catalog(1)
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Longest a request may stay pending before failing.
    pub queue_timeout: Duration,
    /// Upper bound on one condition-variable wait; quota released by another
    /// manager sharing the accounting service is noticed at this granularity.
    pub poll_interval: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            queue_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: SessionId,
    pub backends: Vec<BackendId>,
    pub state: LeaseState,
    pub created_at: SystemTime,
}

struct PoolState {
    free: BTreeMap<BackendId, Vec<usize>>,
    sessions: BTreeMap<SessionId, SessionSummary>,
    handles: Vec<(SessionId, Weak<SessionInner>)>,
}

pub(crate) struct ManagerInner {
    user: String,
    quota: Arc<dyn QuotaAccounting>,
    pool: LeasePool,
    options: SessionOptions,
    state: Mutex<PoolState>,
    freed: Condvar,
    hooks: RwLock<Vec<Arc<dyn CloseHook>>>,
}

/// Grants backend leases to sessions of one user.
#[derive(Clone)]
pub struct LeaseManager {
    inner: Arc<ManagerInner>,
}

impl LeaseManager {
    pub fn new(
        user: impl Into<String>,
        pool: LeasePool,
        quota: Arc<dyn QuotaAccounting>,
        options: SessionOptions,
    ) -> Self {
        let free = pool
            .capacity
            .iter()
            .map(|(backend, count)| (*backend, (0..*count).rev().collect()))
            .collect();
        Self {
            inner: Arc::new(ManagerInner {
                user: user.into(),
                quota,
                pool,
                options,
                state: Mutex::new(PoolState {
                    free,
                    sessions: BTreeMap::new(),
                    handles: Vec::new(),
                }),
                freed: Condvar::new(),
                hooks: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn user(&self) -> &str {
        &self.inner.user
    }

    /// Registers work to run on every session close, before the leases are
    /// handed to anyone else.
    pub fn add_close_hook(&self, hook: Arc<dyn CloseHook>) {
        self.inner.hooks.write().push(hook);
    }

    pub fn open_default(&self) -> Result<Session> {
        self.open(&default_backends())
    }

    pub fn open_named<S: AsRef<str>>(&self, names: &[S]) -> Result<Session> {
        let backends = BackendId::parse_list(names)?;
        self.open(&backends)
    }

    /// Leases every backend in `backends`, waiting while the quota or the
    /// instance pool is exhausted.
    pub fn open(&self, backends: &[BackendId]) -> Result<Session> {
        self.validate(backends)?;
        let requested = backends.len();
        let limit = self.inner.quota.limit(&self.inner.user);
        if requested > limit {
            return Err(SessionError::QuotaExceeded { requested, limit });
        }

        let id = SessionId::new_v4();
        let created_at = SystemTime::now();
        let started = Instant::now();
        let deadline = started + self.inner.options.queue_timeout;

        let mut state = self.inner.state.lock();
        state.sessions.insert(
            id,
            SessionSummary {
                id,
                backends: backends.to_vec(),
                state: LeaseState::Pending,
                created_at,
            },
        );

        let leases = loop {
            let available = backends
                .iter()
                .all(|b| state.free.get(b).map(|f| !f.is_empty()).unwrap_or(false));
            if available && self.inner.quota.try_acquire(&self.inner.user, requested) {
                let leases: Vec<Lease> = backends
                    .iter()
                    .filter_map(|b| {
                        let instance = state.free.get_mut(b)?.pop()?;
                        Some(Lease {
                            backend: *b,
                            instance,
                        })
                    })
                    .collect();
                break leases;
            }

            let now = Instant::now();
            if now >= deadline {
                state.sessions.remove(&id);
                warn!(
                    "session {id} timed out waiting for {requested} backend(s) after {:?}",
                    now - started
                );
                return Err(SessionError::QueueTimeout {
                    requested,
                    waited: now - started,
                });
            }
            debug!("session {id} pending: backends or quota unavailable");
            let wait = (deadline - now).min(self.inner.options.poll_interval);
            self.inner.freed.wait_for(&mut state, wait);
        };

        let inner = Arc::new(SessionInner::new(
            id,
            backends.to_vec(),
            leases,
            created_at,
            self.inner.clone(),
        ));
        if let Some(summary) = state.sessions.get_mut(&id) {
            summary.state = LeaseState::Active;
        }
        state.handles.retain(|(_, weak)| weak.strong_count() > 0);
        state.handles.push((id, Arc::downgrade(&inner)));
        drop(state);

        info!(
            "session {id} active with {} after {:?}",
            backends
                .iter()
                .map(|b| b.to_string())
                .collect::<Vec<_>>()
                .join(", "),
            started.elapsed()
        );
        Ok(Session::from_inner(inner))
    }

    fn validate(&self, backends: &[BackendId]) -> Result<()> {
        if backends.is_empty() {
            return Err(SessionError::EmptyBackendList);
        }
        let mut seen = BTreeSet::new();
        for backend in backends {
            if !seen.insert(*backend) {
                return Err(SessionError::DuplicateBackend(*backend));
            }
            if !self.inner.pool.offers(backend) {
                return Err(SessionError::Unsupported(UnsupportedBackend {
                    requested: backend.to_string(),
                }));
            }
        }
        Ok(())
    }

    pub fn snapshot(&self) -> Vec<SessionSummary> {
        self.inner.state.lock().sessions.values().cloned().collect()
    }

    pub fn pending_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .sessions
            .values()
            .filter(|s| s.state == LeaseState::Pending)
            .count()
    }

    pub fn free_instances(&self, backend: &BackendId) -> usize {
        self.inner
            .state
            .lock()
            .free
            .get(backend)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Closes every session still open. Meant for process shutdown.
    pub fn close_all(&self) {
        let handles: Vec<Arc<SessionInner>> = {
            let state = self.inner.state.lock();
            state
                .handles
                .iter()
                .filter_map(|(_, weak)| weak.upgrade())
                .collect()
        };
        for inner in handles {
            inner.close();
        }
    }
}

impl ManagerInner {
    pub(crate) fn run_close_hooks(&self, session: SessionId, leases: &[Lease]) {
        let hooks = self.hooks.read().clone();
        for hook in hooks {
            hook.on_session_closed(session, leases);
        }
    }

    pub(crate) fn release(&self, session: SessionId, leases: &[Lease]) {
        let mut state = self.state.lock();
        for lease in leases {
            state
                .free
                .entry(lease.backend)
                .or_default()
                .push(lease.instance);
        }
        self.quota.release(&self.user, leases.len());
        state.sessions.remove(&session);
        state.handles.retain(|(id, _)| *id != session);
        drop(state);
        self.freed.notify_all();
        info!("session {session} closed, released {} lease(s)", leases.len());
    }
}
