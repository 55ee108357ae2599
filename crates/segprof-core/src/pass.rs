use crate::recorder::{Segment, SegmentKind};
use segprof_api::{BackendId, UnitId};
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Duration;

/// The frozen result of one profiling scope.
#[derive(Debug, Clone, Serialize)]
pub struct ProfilePass {
    segments: Vec<Segment>,
    backends: Vec<BackendId>,
    calls: u64,
    started_at_ms: u64,
    finished_at_ms: u64,
}

impl ProfilePass {
    pub fn new(
        segments: Vec<Segment>,
        backends: Vec<BackendId>,
        calls: u64,
        started_at_ms: u64,
        finished_at_ms: u64,
    ) -> Self {
        Self {
            segments,
            backends,
            calls,
            started_at_ms,
            finished_at_ms,
        }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Backends of the session the pass ran against, in session order.
    pub fn backends(&self) -> &[BackendId] {
        &self.backends
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }

    pub fn started_at_ms(&self) -> u64 {
        self.started_at_ms
    }

    pub fn finished_at_ms(&self) -> u64 {
        self.finished_at_ms
    }

    pub fn compiled_segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter().filter(|s| s.is_compiled())
    }

    pub fn compiled_segment_count(&self) -> usize {
        self.compiled_segments().count()
    }

    /// Distinct units seen in the pass.
    pub fn graphs_compiled(&self) -> usize {
        self.compiled_segments()
            .filter_map(Segment::unit)
            .collect::<BTreeSet<UnitId>>()
            .len()
    }

    /// Times any compiled segment was entered.
    pub fn compiled_segment_runs(&self) -> u64 {
        self.segments
            .iter()
            .map(|s| match &s.kind {
                SegmentKind::Compiled { occurrences, .. } => *occurrences,
                SegmentKind::Uncompiled(_) => 0,
            })
            .sum()
    }

    /// Compiled-segment occurrences that served as a compilation run on at
    /// least one backend. One occurrence counts once however many backends
    /// compiled during it; per-backend counts live in
    /// [`BackendStats`](crate::recorder::BackendStats).
    pub fn discarded_runs(&self) -> u64 {
        self.segments
            .iter()
            .map(|s| match &s.kind {
                SegmentKind::Compiled {
                    discarded_occurrences,
                    ..
                } => *discarded_occurrences,
                SegmentKind::Uncompiled(_) => 0,
            })
            .sum()
    }

    pub fn total_uncompiled(&self) -> Duration {
        self.segments
            .iter()
            .filter(|s| !s.is_compiled())
            .map(Segment::duration)
            .sum()
    }

    /// Compiled time on `backend`: the sum of its per-segment means.
    pub fn backend_total(&self, backend: BackendId) -> Duration {
        self.segments
            .iter()
            .filter_map(|s| s.backend(backend))
            .map(|b| b.mean())
            .sum()
    }

    pub fn backend_totals(&self) -> Vec<(BackendId, Duration)> {
        self.backends
            .iter()
            .map(|&b| (b, self.backend_total(b)))
            .collect()
    }

    /// Local time plus compiled time on `backend`.
    pub fn grand_total(&self, backend: BackendId) -> Duration {
        self.total_uncompiled() + self.backend_total(backend)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
