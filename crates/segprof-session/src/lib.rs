//! Session / lease manager.
//!
//! A [`LeaseManager`] owns the pool of remote backend instances one user can
//! reach. [`LeaseManager::open`] blocks until every requested backend is
//! leased (or the queue timeout elapses), and the returned [`Session`] gives
//! the instances back when it is closed or dropped.

mod manager;
mod quota;
mod session;

pub use manager::{LeaseManager, LeasePool, SessionOptions, SessionSummary};
pub use quota::{InMemoryQuota, QuotaAccounting};
pub use session::{CloseHook, Lease, LeaseState, Session, WorkGuard};

use segprof_api::{BackendId, SessionId, UnsupportedBackend};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("a session needs at least one backend")]
    EmptyBackendList,
    #[error("backend {0} requested more than once")]
    DuplicateBackend(BackendId),
    #[error(transparent)]
    Unsupported(#[from] UnsupportedBackend),
    #[error("requested {requested} backends but the quota allows at most {limit} at once")]
    QuotaExceeded { requested: usize, limit: usize },
    #[error("gave up waiting for {requested} backend(s) after {waited:?}")]
    QueueTimeout { requested: usize, waited: Duration },
    #[error("session {0} is closed")]
    Closed(SessionId),
    #[error("backend {backend} is not leased by session {session}")]
    NotLeased {
        session: SessionId,
        backend: BackendId,
    },
}

impl SessionError {
    /// Malformed request, reported before anything is queued.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            SessionError::EmptyBackendList
                | SessionError::DuplicateBackend(_)
                | SessionError::Unsupported(_)
        )
    }

    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            SessionError::QuotaExceeded { .. } | SessionError::QueueTimeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
