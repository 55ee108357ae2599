//! Segment recording and reporting.
//!
//! A [`ProfileScope`] watches the instrumented function through boundary
//! events, keeps an ordered ledger of local and compiled segments, and turns
//! it into a [`ProfilePass`] that [`report`] renders.

pub mod identity;
pub mod pass;
pub mod recorder;
pub mod report;
pub mod scope;
pub mod tracker;

pub use identity::UnitRegistry;
pub use pass::ProfilePass;
pub use recorder::{
    BackendStats, LocalStats, RecorderError, Segment, SegmentHandle, SegmentKind,
    SegmentRecorder,
};
pub use report::{
    render, report, AggregateFooter, BackendRow, BackendTotal, RenderedReport, ReportOptions,
    ReportRow, ReportTotals, ReportView,
};
pub use scope::{CallFrame, ProfileScope, Profiler};
pub use tracker::{BoundaryEvent, BoundaryTracker};
