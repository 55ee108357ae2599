use crate::recorder::{RecorderError, SegmentHandle, SegmentRecorder};
use log::trace;
use segprof_api::{BackendOutcome, ComputationUnit, InputsDescriptor, UnitDispatcher};
use segprof_time::SharedClock;
use std::time::Duration;

/// What the graph extractor reports while the instrumented function runs.
#[derive(Debug, Clone)]
pub enum BoundaryEvent {
    CallStart,
    /// A remote-eligible unit is about to execute with these inputs.
    BeginUnit {
        unit: ComputationUnit,
        inputs: InputsDescriptor,
    },
    EndUnit,
    /// Local code reached a break that is not followed by a unit.
    LocalBoundary,
    CallEnd,
}

/// Turns a boundary event stream into ledger entries.
///
/// Time between boundaries is local time. Remote dispatch happens when a
/// unit begins; the outcomes are attached when it ends, and the time spent
/// in between is not counted as local.
pub struct BoundaryTracker<D> {
    recorder: SegmentRecorder,
    dispatcher: D,
    clock: SharedClock,
    mark: Duration,
    pending: Option<(SegmentHandle, Vec<BackendOutcome>)>,
}

impl<D: UnitDispatcher> BoundaryTracker<D> {
    pub fn new(dispatcher: D, clock: SharedClock) -> Self {
        let mark = clock.now();
        Self {
            recorder: SegmentRecorder::new(),
            dispatcher,
            clock,
            mark,
            pending: None,
        }
    }

    pub fn recorder(&self) -> &SegmentRecorder {
        &self.recorder
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn handle(&mut self, event: BoundaryEvent) -> Result<(), RecorderError> {
        trace!("boundary {event:?}");
        match event {
            BoundaryEvent::CallStart => {
                self.recorder.begin_call()?;
                self.mark = self.clock.now();
            }
            BoundaryEvent::BeginUnit { unit, inputs } => {
                self.flush_local()?;
                let handle = self.recorder.begin_unit(unit.id)?;
                let outcomes = self.dispatcher.dispatch_all(&unit, &inputs);
                self.pending = Some((handle, outcomes));
            }
            BoundaryEvent::EndUnit => {
                let (handle, outcomes) = self.pending.take().ok_or(RecorderError::NoOpenUnit)?;
                self.recorder.end_unit(handle, &outcomes)?;
                self.mark = self.clock.now();
            }
            BoundaryEvent::LocalBoundary => self.flush_local()?,
            BoundaryEvent::CallEnd => {
                if let Some((handle, _)) = &self.pending {
                    return Err(RecorderError::UnitStillOpen(handle.unit()));
                }
                self.flush_local()?;
                self.recorder.end_call()?;
            }
        }
        Ok(())
    }

    pub(crate) fn take_recorder(&mut self) -> SegmentRecorder {
        self.pending = None;
        std::mem::take(&mut self.recorder)
    }

    /// Splits the tracker into the ledger and the dispatcher.
    pub fn into_parts(self) -> (SegmentRecorder, D) {
        (self.recorder, self.dispatcher)
    }

    fn flush_local(&mut self) -> Result<(), RecorderError> {
        let now = self.clock.now();
        self.recorder.record_uncompiled(now.saturating_sub(self.mark))?;
        self.mark = now;
        Ok(())
    }
}
