use parking_lot::Mutex;
use segprof_api::{
    BackendId, BackendOutcome, ComputationUnit, DType, GraphUnit, IdentityStrictness,
    InputsDescriptor, OpNode, TensorSpec, UnitDispatcher, UnitId, BACKEND_CATALOG,
};
use segprof_core::{
    report, BoundaryEvent, ProfilePass, Profiler, ReportView, SegmentKind, UnitRegistry,
};
use segprof_time::ManualClock;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

const CPU: BackendId = BACKEND_CATALOG[0];
const GPU: BackendId = BACKEND_CATALOG[1];

/// Dispatcher that mimics the compile-once behavior of the real client.
struct FakeDispatcher {
    backends: Vec<BackendId>,
    compiled: Mutex<HashSet<(UnitId, BackendId)>>,
    failing: HashSet<BackendId>,
    closed: Arc<Mutex<bool>>,
}

impl FakeDispatcher {
    fn new(backends: Vec<BackendId>) -> Self {
        Self {
            backends,
            compiled: Mutex::new(HashSet::new()),
            failing: HashSet::new(),
            closed: Arc::new(Mutex::new(false)),
        }
    }
}

impl UnitDispatcher for FakeDispatcher {
    fn backends(&self) -> Vec<BackendId> {
        self.backends.clone()
    }

    fn dispatch_all(
        &self,
        unit: &ComputationUnit,
        _inputs: &InputsDescriptor,
    ) -> Vec<BackendOutcome> {
        self.backends
            .iter()
            .map(|&backend| {
                if !self.compiled.lock().insert((unit.id, backend)) {
                    if self.failing.contains(&backend) {
                        BackendOutcome::failure(backend)
                    } else {
                        let base = if backend == CPU { 4 } else { 1 };
                        let cost = Duration::from_millis(base * unit.id.0 as u64);
                        BackendOutcome::success(backend, cost)
                    }
                } else {
                    BackendOutcome::compilation_run(backend)
                }
            })
            .collect()
    }
}

impl Drop for FakeDispatcher {
    fn drop(&mut self) {
        *self.closed.lock() = true;
    }
}

fn mlp(width: usize) -> GraphUnit {
    GraphUnit::new(
        vec![
            OpNode::new("matmul"),
            OpNode::new("add"),
            OpNode::new("gelu"),
        ],
        vec![TensorSpec::new(DType::F32, [width, width])],
    )
}

fn profiler(clock: &ManualClock) -> Profiler {
    Profiler::new(UnitRegistry::shared(IdentityStrictness::Strict))
        .with_clock(Arc::new(clock.clone()))
        .print_report(false)
}

fn check_totals(pass: &ProfilePass) {
    let segments: Duration = pass.segments().iter().map(|s| s.duration()).sum();
    let backends: Duration = pass.backend_totals().iter().map(|(_, d)| *d).sum();
    assert_eq!(segments, pass.total_uncompiled() + backends);
}

#[test]
fn ten_calls_of_one_unit_give_three_segments() {
    let clock = ManualClock::new();
    let profiler = profiler(&clock);
    let mut scope = profiler.profile(FakeDispatcher::new(vec![CPU, GPU]));
    for _ in 0..10 {
        scope.run(|frame| {
            clock.advance_ms(2);
            frame.compiled(mlp(64), || clock.advance_ms(50));
            clock.advance_ms(3);
        });
    }
    let pass = scope.finish();

    assert_eq!(pass.calls(), 10);
    assert_eq!(pass.segments().len(), 3);
    assert!(matches!(pass.segments()[0].kind, SegmentKind::Uncompiled(_)));
    assert!(pass.segments()[1].is_compiled());
    assert!(matches!(pass.segments()[2].kind, SegmentKind::Uncompiled(_)));

    for backend in [CPU, GPU] {
        let stats = pass.segments()[1].backend(backend).unwrap();
        assert_eq!(stats.runs, 9);
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.failures, 0);
    }
    // one compilation run for the occurrence, whichever backends compiled
    assert_eq!(pass.discarded_runs(), 1);
    let header = report(&pass, false).to_string();
    assert!(header
        .lines()
        .any(|line| line == "Compilation runs discarded: 1"));
    assert_eq!(pass.total_uncompiled(), Duration::from_millis(5));
    assert_eq!(pass.backend_total(CPU), Duration::from_millis(4));
    assert_eq!(pass.grand_total(GPU), Duration::from_millis(6));
    check_totals(&pass);
}

#[test]
fn nine_units_render_the_aggregated_view() {
    let clock = ManualClock::new();
    let profiler = profiler(&clock);
    let mut scope = profiler.profile(FakeDispatcher::new(vec![CPU, GPU]));
    for _ in 0..2 {
        scope.run(|frame| {
            for width in 1..=9 {
                clock.advance_ms(1);
                frame.compiled(mlp(width), || ());
            }
        });
    }
    let pass = scope.finish();
    assert_eq!(pass.graphs_compiled(), 9);
    assert_eq!(pass.compiled_segment_count(), 9);
    assert_eq!(pass.discarded_runs(), 9);

    let rendered = report(&pass, false);
    assert_eq!(rendered.view, ReportView::Aggregated);
    let footer = rendered.footer.unwrap();
    assert_eq!(footer.shown, 3);
    assert_eq!(footer.graphs_compiled, 9);
    assert_eq!(footer.compiled_segments_run, 18);
    let top: Vec<_> = rendered.rows.iter().filter_map(|r| r.unit).collect();
    assert_eq!(top, vec![UnitId(9), UnitId(8), UnitId(7)]);
    assert_eq!(rendered.totals, report(&pass, true).totals);
    check_totals(&pass);
}

#[test]
fn failing_backend_leaves_the_other_untouched() {
    let clock = ManualClock::new();
    let profiler = profiler(&clock);
    let mut dispatcher = FakeDispatcher::new(vec![CPU, GPU]);
    dispatcher.failing.insert(GPU);
    let mut scope = profiler.profile(dispatcher);
    for _ in 0..4 {
        scope.run(|frame| frame.compiled(mlp(8), || ()));
    }
    let pass = scope.finish();
    let segment = &pass.segments()[1];
    let cpu = segment.backend(CPU).unwrap();
    let gpu = segment.backend(GPU).unwrap();
    assert_eq!((cpu.runs, cpu.failures), (3, 0));
    assert_eq!(cpu.mean(), Duration::from_millis(4));
    assert_eq!((gpu.runs, gpu.failures), (3, 3));
    assert_eq!(gpu.mean(), Duration::ZERO);
}

#[test]
fn local_errors_propagate_and_the_call_still_counts() {
    let clock = ManualClock::new();
    let profiler = profiler(&clock);
    let mut scope = profiler.profile(FakeDispatcher::new(vec![CPU]));
    let result: Result<(), String> = scope.call(|frame| {
        frame.compiled(mlp(4), || ());
        Err("shape mismatch".to_string())
    });
    assert_eq!(result, Err("shape mismatch".to_string()));
    let pass = scope.finish();
    assert_eq!(pass.calls(), 1);
    assert_eq!(pass.discarded_runs(), 1);
}

#[test]
fn dropping_the_scope_releases_the_dispatcher() {
    let clock = ManualClock::new();
    let profiler = profiler(&clock);
    let dispatcher = FakeDispatcher::new(vec![CPU]);
    let closed = dispatcher.closed.clone();
    {
        let mut scope = profiler.profile(dispatcher);
        scope.run(|frame| frame.compiled(mlp(4), || ()));
    }
    assert!(*closed.lock());
}

#[test]
fn scope_is_finalized_while_unwinding() {
    let clock = ManualClock::new();
    let profiler = profiler(&clock);
    let dispatcher = FakeDispatcher::new(vec![CPU]);
    let closed = dispatcher.closed.clone();
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let mut scope = profiler.profile(dispatcher);
        scope.run(|frame| {
            frame.compiled(mlp(4), || panic!("user code failed"));
        });
    }));
    assert!(outcome.is_err());
    assert!(*closed.lock());
}

#[test]
fn identities_are_stable_across_passes() {
    let clock = ManualClock::new();
    let profiler = profiler(&clock);

    let mut first = profiler.profile(FakeDispatcher::new(vec![CPU]));
    first.run(|frame| {
        frame.compiled(mlp(4), || ());
        frame.compiled(mlp(8), || ());
    });
    let first = first.finish();

    let mut second = profiler.profile(FakeDispatcher::new(vec![CPU]));
    second.run(|frame| frame.compiled(mlp(8), || ()));
    let second = second.finish();

    assert_eq!(first.segments()[1].unit(), Some(UnitId(1)));
    assert_eq!(first.segments()[3].unit(), Some(UnitId(2)));
    assert_eq!(second.segments()[1].unit(), Some(UnitId(2)));
    assert_eq!(profiler.registry().len(), 2);
}

#[test]
fn permissive_identity_merges_shapes() {
    let clock = ManualClock::new();
    let profiler = Profiler::new(UnitRegistry::shared(IdentityStrictness::Permissive))
        .with_clock(Arc::new(clock.clone()))
        .print_report(false);
    let mut scope = profiler.profile(FakeDispatcher::new(vec![CPU]));
    scope.run(|frame| {
        frame.compiled(mlp(4), || ());
        frame.compiled(mlp(8), || ());
    });
    let pass = scope.finish();
    assert_eq!(pass.graphs_compiled(), 1);
}

#[test]
fn raw_event_stream_drives_the_ledger() {
    let clock = ManualClock::new();
    let profiler = profiler(&clock);
    let registry = profiler.registry().clone();
    let mut scope = profiler.profile(FakeDispatcher::new(vec![CPU]));
    let unit = registry.identify(mlp(16));
    scope.record(BoundaryEvent::CallStart).unwrap();
    clock.advance_ms(7);
    scope
        .record(BoundaryEvent::BeginUnit {
            inputs: InputsDescriptor::from(unit.graph.as_ref()),
            unit,
        })
        .unwrap();
    scope.record(BoundaryEvent::EndUnit).unwrap();
    scope.record(BoundaryEvent::CallEnd).unwrap();
    assert!(scope.record(BoundaryEvent::EndUnit).is_err());
    let pass = scope.finish();
    assert_eq!(pass.segments().len(), 3);
    assert_eq!(pass.total_uncompiled(), Duration::from_millis(7));
}
