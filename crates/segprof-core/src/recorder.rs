use log::{debug, warn};
use segprof_api::{BackendId, BackendOutcome, UnitId};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecorderError {
    #[error("segment boundary outside of a call")]
    NotInCall,
    #[error("call started while another call is still open")]
    CallAlreadyOpen,
    #[error("{0} is still open")]
    UnitStillOpen(UnitId),
    #[error("no compiled segment is open")]
    NoOpenUnit,
    #[error("segment handle for {got} does not match the open {expected}")]
    HandleMismatch { expected: UnitId, got: UnitId },
}

/// Local time accumulated by one uncompiled slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LocalStats {
    pub runs: u64,
    #[serde(serialize_with = "ser_ms")]
    pub total: Duration,
}

impl LocalStats {
    pub fn mean(&self) -> Duration {
        mean_of(self.total.as_nanos(), self.runs)
    }
}

/// Accumulated runs of one unit on one backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendStats {
    pub backend: BackendId,
    pub runs: u64,
    pub failures: u64,
    pub discarded: u64,
    #[serde(skip)]
    success_ns: u128,
}

impl BackendStats {
    pub fn new(backend: BackendId) -> Self {
        Self {
            backend,
            runs: 0,
            failures: 0,
            discarded: 0,
            success_ns: 0,
        }
    }

    pub fn successes(&self) -> u64 {
        self.runs.saturating_sub(self.failures)
    }

    /// Mean over successful runs only.
    pub fn mean(&self) -> Duration {
        mean_of(self.success_ns, self.successes())
    }

    pub fn merge(&mut self, outcome: &BackendOutcome) {
        self.runs += outcome.runs;
        self.failures += outcome.failures;
        self.discarded += outcome.discarded;
        self.success_ns += outcome.mean.as_nanos() * outcome.successes() as u128;
    }

    pub fn absorb(&mut self, other: &BackendStats) {
        self.runs += other.runs;
        self.failures += other.failures;
        self.discarded += other.discarded;
        self.success_ns += other.success_ns;
    }

    pub fn to_outcome(&self) -> BackendOutcome {
        BackendOutcome {
            backend: self.backend,
            runs: self.runs,
            mean: self.mean(),
            failures: self.failures,
            discarded: self.discarded,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SegmentKind {
    Uncompiled(LocalStats),
    Compiled {
        unit: UnitId,
        /// Times the segment was entered.
        occurrences: u64,
        /// Occurrences that were a compilation run on at least one backend.
        discarded_occurrences: u64,
        /// In the order the backends first reported.
        backends: Vec<BackendStats>,
    },
}

/// One slot of the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Segment {
    pub index: usize,
    pub kind: SegmentKind,
}

impl Segment {
    pub fn is_compiled(&self) -> bool {
        matches!(self.kind, SegmentKind::Compiled { .. })
    }

    pub fn unit(&self) -> Option<UnitId> {
        match &self.kind {
            SegmentKind::Compiled { unit, .. } => Some(*unit),
            SegmentKind::Uncompiled(_) => None,
        }
    }

    /// Mean per call for a local slot, sum of the per-backend means for a
    /// compiled one.
    pub fn duration(&self) -> Duration {
        match &self.kind {
            SegmentKind::Uncompiled(local) => local.mean(),
            SegmentKind::Compiled { backends, .. } => {
                backends.iter().map(BackendStats::mean).sum()
            }
        }
    }

    pub fn backend(&self, backend: BackendId) -> Option<&BackendStats> {
        match &self.kind {
            SegmentKind::Compiled { backends, .. } => {
                backends.iter().find(|b| b.backend == backend)
            }
            SegmentKind::Uncompiled(_) => None,
        }
    }
}

/// Ticket for an open compiled segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHandle {
    index: usize,
    unit: UnitId,
}

impl SegmentHandle {
    pub fn unit(&self) -> UnitId {
        self.unit
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SlotKey {
    ordinal: usize,
    unit: Option<UnitId>,
}

/// Ordered ledger of segments.
///
/// Calls of the instrumented function fold into the same slots: the n-th
/// segment of a call lands in the slot keyed by (n, unit). A call that takes
/// a different path appends new slots at the end, so segments are listed in
/// the order their slot was first seen. Within a diverging call that order
/// can differ from execution order: a slot reused from an earlier call keeps
/// its earlier position ahead of slots the diverging call created.
#[derive(Debug, Default)]
pub struct SegmentRecorder {
    segments: Vec<Segment>,
    slots: HashMap<SlotKey, usize>,
    ordinal: Option<usize>,
    open: Option<SegmentHandle>,
    calls: u64,
}

impl SegmentRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_call(&self) -> bool {
        self.ordinal.is_some()
    }

    pub fn open_unit(&self) -> Option<SegmentHandle> {
        self.open
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn begin_call(&mut self) -> Result<(), RecorderError> {
        if self.ordinal.is_some() {
            return Err(RecorderError::CallAlreadyOpen);
        }
        self.ordinal = Some(0);
        Ok(())
    }

    pub fn end_call(&mut self) -> Result<(), RecorderError> {
        if self.ordinal.is_none() {
            return Err(RecorderError::NotInCall);
        }
        if let Some(open) = self.open {
            return Err(RecorderError::UnitStillOpen(open.unit));
        }
        self.ordinal = None;
        self.calls += 1;
        Ok(())
    }

    pub fn record_uncompiled(&mut self, elapsed: Duration) -> Result<(), RecorderError> {
        if let Some(open) = self.open {
            return Err(RecorderError::UnitStillOpen(open.unit));
        }
        let index = self.slot(None)?;
        if let SegmentKind::Uncompiled(local) = &mut self.segments[index].kind {
            local.runs += 1;
            local.total += elapsed;
        }
        Ok(())
    }

    pub fn begin_unit(&mut self, unit: UnitId) -> Result<SegmentHandle, RecorderError> {
        if let Some(open) = self.open {
            return Err(RecorderError::UnitStillOpen(open.unit));
        }
        let index = self.slot(Some(unit))?;
        if let SegmentKind::Compiled { occurrences, .. } = &mut self.segments[index].kind {
            *occurrences += 1;
        }
        let handle = SegmentHandle { index, unit };
        self.open = Some(handle);
        Ok(handle)
    }

    pub fn end_unit(
        &mut self,
        handle: SegmentHandle,
        outcomes: &[BackendOutcome],
    ) -> Result<(), RecorderError> {
        let open = self.open.ok_or(RecorderError::NoOpenUnit)?;
        if open != handle {
            return Err(RecorderError::HandleMismatch {
                expected: open.unit,
                got: handle.unit,
            });
        }
        if let SegmentKind::Compiled {
            backends,
            discarded_occurrences,
            ..
        } = &mut self.segments[handle.index].kind
        {
            if outcomes.iter().any(|o| o.discarded > 0) {
                *discarded_occurrences += 1;
            }
            for outcome in outcomes {
                if !outcome.is_consistent() {
                    warn!(
                        "{} on {}: {} failures over {} runs, clamping",
                        handle.unit, outcome.backend, outcome.failures, outcome.runs
                    );
                }
                let mut outcome = outcome.clone();
                outcome.failures = outcome.failures.min(outcome.runs);
                match backends.iter_mut().find(|b| b.backend == outcome.backend) {
                    Some(stats) => stats.merge(&outcome),
                    None => {
                        let mut stats = BackendStats::new(outcome.backend);
                        stats.merge(&outcome);
                        backends.push(stats);
                    }
                }
            }
        }
        self.open = None;
        Ok(())
    }

    /// Closes whatever is still open and hands the segments over. Used when
    /// a pass ends mid-call, e.g. while unwinding.
    pub fn finalize(mut self) -> (Vec<Segment>, u64) {
        if let Some(open) = self.open.take() {
            warn!("pass finalized with {} still open", open.unit);
        }
        if self.ordinal.take().is_some() {
            debug!("pass finalized inside a call; partial call not counted");
        }
        (self.segments, self.calls)
    }

    fn slot(&mut self, unit: Option<UnitId>) -> Result<usize, RecorderError> {
        let ordinal = self.ordinal.as_mut().ok_or(RecorderError::NotInCall)?;
        let key = SlotKey {
            ordinal: *ordinal,
            unit,
        };
        *ordinal += 1;
        if let Some(&index) = self.slots.get(&key) {
            return Ok(index);
        }
        let index = self.segments.len();
        let kind = match unit {
            Some(unit) => SegmentKind::Compiled {
                unit,
                occurrences: 0,
                discarded_occurrences: 0,
                backends: Vec::new(),
            },
            None => SegmentKind::Uncompiled(LocalStats::default()),
        };
        self.segments.push(Segment { index, kind });
        self.slots.insert(key, index);
        Ok(index)
    }
}

fn mean_of(total_ns: u128, count: u64) -> Duration {
    if count == 0 {
        return Duration::ZERO;
    }
    let mean = total_ns / count as u128;
    Duration::from_nanos(mean.min(u64::MAX as u128) as u64)
}

fn ser_ms<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(segprof_time::as_millis_f64(*d))
}
