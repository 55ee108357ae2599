use crate::manager::ManagerInner;
use crate::{Result, SessionError};
use log::debug;
use parking_lot::{Condvar, Mutex};
use segprof_api::{BackendId, SessionId};
use std::sync::Arc;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeaseState {
    Pending,
    Active,
    Closed,
}

/// One leased instance of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Lease {
    pub backend: BackendId,
    pub instance: usize,
}

/// Runs when a session closes, after in-flight work drained and before the
/// leases return to the pool.
pub trait CloseHook: Send + Sync {
    fn on_session_closed(&self, session: SessionId, leases: &[Lease]);
}

struct Lifecycle {
    state: LeaseState,
    closing: bool,
    in_flight: usize,
}

pub(crate) struct SessionInner {
    id: SessionId,
    backends: Vec<BackendId>,
    leases: Vec<Lease>,
    created_at: SystemTime,
    manager: Arc<ManagerInner>,
    lifecycle: Mutex<Lifecycle>,
    idle: Condvar,
}

impl SessionInner {
    pub(crate) fn new(
        id: SessionId,
        backends: Vec<BackendId>,
        leases: Vec<Lease>,
        created_at: SystemTime,
        manager: Arc<ManagerInner>,
    ) -> Self {
        Self {
            id,
            backends,
            leases,
            created_at,
            manager,
            lifecycle: Mutex::new(Lifecycle {
                state: LeaseState::Active,
                closing: false,
                in_flight: 0,
            }),
            idle: Condvar::new(),
        }
    }

    pub(crate) fn close(&self) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state == LeaseState::Closed {
                return;
            }
            if lifecycle.closing {
                // another thread is closing; wait for it to finish
                while lifecycle.state != LeaseState::Closed {
                    self.idle.wait(&mut lifecycle);
                }
                return;
            }
            lifecycle.closing = true;
            while lifecycle.in_flight > 0 {
                debug!(
                    "session {} closing, waiting on {} in-flight dispatch(es)",
                    self.id, lifecycle.in_flight
                );
                self.idle.wait(&mut lifecycle);
            }
        }

        self.manager.run_close_hooks(self.id, &self.leases);
        self.manager.release(self.id, &self.leases);

        let mut lifecycle = self.lifecycle.lock();
        lifecycle.state = LeaseState::Closed;
        drop(lifecycle);
        self.idle.notify_all();
    }
}

/// Exclusive reservation of a set of backends.
///
/// Dropping the session closes it, so leases are returned on every exit path.
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub(crate) fn from_inner(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn backends(&self) -> &[BackendId] {
        &self.inner.backends
    }

    pub fn leases(&self) -> &[Lease] {
        &self.inner.leases
    }

    pub fn created_at(&self) -> SystemTime {
        self.inner.created_at
    }

    pub fn state(&self) -> LeaseState {
        self.inner.lifecycle.lock().state
    }

    pub fn is_closing(&self) -> bool {
        let lifecycle = self.inner.lifecycle.lock();
        lifecycle.closing && lifecycle.state != LeaseState::Closed
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lifecycle.lock().in_flight
    }

    /// Marks one dispatch against `backend` as outstanding. Close waits until
    /// every guard is dropped.
    pub fn begin_work(&self, backend: BackendId) -> Result<WorkGuard<'_>> {
        if !self.inner.backends.contains(&backend) {
            return Err(SessionError::NotLeased {
                session: self.inner.id,
                backend,
            });
        }
        let mut lifecycle = self.inner.lifecycle.lock();
        if lifecycle.closing || lifecycle.state == LeaseState::Closed {
            return Err(SessionError::Closed(self.inner.id));
        }
        lifecycle.in_flight += 1;
        Ok(WorkGuard {
            session: &self.inner,
            backend,
        })
    }

    /// Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("backends", &self.inner.backends)
            .field("state", &self.state())
            .finish()
    }
}

pub struct WorkGuard<'a> {
    session: &'a SessionInner,
    backend: BackendId,
}

impl WorkGuard<'_> {
    pub fn backend(&self) -> BackendId {
        self.backend
    }

    pub fn session_id(&self) -> SessionId {
        self.session.id
    }
}

impl Drop for WorkGuard<'_> {
    fn drop(&mut self) {
        let mut lifecycle = self.session.lifecycle.lock();
        lifecycle.in_flight = lifecycle.in_flight.saturating_sub(1);
        if lifecycle.in_flight == 0 {
            self.session.idle.notify_all();
        }
    }
}
