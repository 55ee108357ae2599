use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters describing what the dispatch client did so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub uploads: u64,
    pub uploads_skipped: u64,
    pub compilations: u64,
    pub compile_failures: u64,
    pub cache_hits: u64,
    pub executions: u64,
    pub execution_failures: u64,
    pub retries: u64,
}

#[derive(Default)]
pub(crate) struct DispatchTelemetry {
    uploads: AtomicU64,
    uploads_skipped: AtomicU64,
    compilations: AtomicU64,
    compile_failures: AtomicU64,
    cache_hits: AtomicU64,
    executions: AtomicU64,
    execution_failures: AtomicU64,
    retries: AtomicU64,
}

impl DispatchTelemetry {
    pub(crate) fn record_upload(&self, skipped: bool) {
        if skipped {
            self.uploads_skipped.fetch_add(1, Ordering::Relaxed);
        } else {
            self.uploads.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_compilation(&self, ok: bool) {
        self.compilations.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.compile_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_execution(&self, ok: bool) {
        self.executions.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.execution_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            uploads: self.uploads.load(Ordering::Relaxed),
            uploads_skipped: self.uploads_skipped.load(Ordering::Relaxed),
            compilations: self.compilations.load(Ordering::Relaxed),
            compile_failures: self.compile_failures.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            executions: self.executions.load(Ordering::Relaxed),
            execution_failures: self.execution_failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}
