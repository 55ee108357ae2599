use crate::identity::UnitRegistry;
use crate::pass::ProfilePass;
use crate::recorder::RecorderError;
use crate::report::{render, ReportOptions};
use crate::tracker::{BoundaryEvent, BoundaryTracker};
use log::{info, warn};
use segprof_api::{GraphUnit, InputsDescriptor, UnitDispatcher};
use segprof_time::{unix_timestamp_ms, MonotonicClock, SharedClock};
use std::convert::Infallible;
use std::sync::Arc;

/// Builds profiling scopes that share one unit registry.
#[derive(Clone)]
pub struct Profiler {
    registry: Arc<UnitRegistry>,
    clock: SharedClock,
    options: ReportOptions,
    print_report: bool,
}

impl Profiler {
    pub fn new(registry: Arc<UnitRegistry>) -> Self {
        Self {
            registry,
            clock: MonotonicClock::shared(),
            options: ReportOptions::default(),
            print_report: true,
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_report_options(mut self, options: ReportOptions) -> Self {
        self.options = options;
        self
    }

    /// Whether dropped scopes print their report to stdout.
    pub fn print_report(mut self, enabled: bool) -> Self {
        self.print_report = enabled;
        self
    }

    pub fn registry(&self) -> &Arc<UnitRegistry> {
        &self.registry
    }

    pub fn report_options(&self) -> &ReportOptions {
        &self.options
    }

    /// Opens a capture window dispatching compiled units through `dispatcher`.
    pub fn profile<D: UnitDispatcher>(&self, dispatcher: D) -> ProfileScope<D> {
        ProfileScope {
            tracker: BoundaryTracker::new(dispatcher, self.clock.clone()),
            registry: self.registry.clone(),
            options: self.options,
            print_report: self.print_report,
            started_at_ms: unix_timestamp_ms(),
            finished: false,
        }
    }
}

/// One capture window.
///
/// Dropping the scope, on any exit path including unwinding, finalizes the
/// pass and prints its report unless printing is off. [`ProfileScope::finish`]
/// returns the pass instead of printing it.
pub struct ProfileScope<D: UnitDispatcher> {
    tracker: BoundaryTracker<D>,
    registry: Arc<UnitRegistry>,
    options: ReportOptions,
    print_report: bool,
    started_at_ms: u64,
    finished: bool,
}

impl<D: UnitDispatcher> ProfileScope<D> {
    pub fn registry(&self) -> &Arc<UnitRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &D {
        self.tracker.dispatcher()
    }

    pub fn suppress_report(&mut self) {
        self.print_report = false;
    }

    /// Feeds one extractor event into the ledger.
    pub fn record(&mut self, event: BoundaryEvent) -> Result<(), RecorderError> {
        self.tracker.handle(event)
    }

    /// Runs one invocation of the instrumented function. Errors from `body`
    /// come back untouched; the call is recorded either way.
    pub fn call<R, E>(
        &mut self,
        body: impl FnOnce(&mut CallFrame<'_, D>) -> Result<R, E>,
    ) -> Result<R, E> {
        if let Err(err) = self.tracker.handle(BoundaryEvent::CallStart) {
            warn!("call start not recorded: {err}");
        }
        let result = {
            let mut frame = CallFrame {
                tracker: &mut self.tracker,
                registry: &self.registry,
            };
            body(&mut frame)
        };
        if let Err(err) = self.tracker.handle(BoundaryEvent::CallEnd) {
            warn!("call end not recorded: {err}");
        }
        result
    }

    pub fn run<R>(&mut self, body: impl FnOnce(&mut CallFrame<'_, D>) -> R) -> R {
        match self.call(|frame| Ok::<R, Infallible>(body(frame))) {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    pub fn finish(mut self) -> ProfilePass {
        self.finalize()
    }

    fn finalize(&mut self) -> ProfilePass {
        self.finished = true;
        let (segments, calls) = self.tracker.take_recorder().finalize();
        let pass = ProfilePass::new(
            segments,
            self.tracker.dispatcher().backends(),
            calls,
            self.started_at_ms,
            unix_timestamp_ms(),
        );
        info!(
            "profiling pass finished: {} call(s), {} segment(s), {} compilation run(s) discarded",
            pass.calls(),
            pass.segments().len(),
            pass.discarded_runs()
        );
        pass
    }
}

impl<D: UnitDispatcher> Drop for ProfileScope<D> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let pass = self.finalize();
        if self.print_report {
            println!("{}", render(&pass, &self.options));
        }
    }
}

/// Handle given to the instrumented function for one call.
pub struct CallFrame<'s, D: UnitDispatcher> {
    tracker: &'s mut BoundaryTracker<D>,
    registry: &'s UnitRegistry,
}

impl<D: UnitDispatcher> CallFrame<'_, D> {
    pub fn registry(&self) -> &UnitRegistry {
        self.registry
    }

    /// Marks `run` as the local execution of a remote-eligible unit whose
    /// inputs are the graph's declared inputs.
    pub fn compiled<R>(&mut self, graph: GraphUnit, run: impl FnOnce() -> R) -> R {
        let inputs = InputsDescriptor::from(&graph);
        self.compiled_with_inputs(graph, inputs, run)
    }

    pub fn compiled_with_inputs<R>(
        &mut self,
        graph: GraphUnit,
        inputs: InputsDescriptor,
        run: impl FnOnce() -> R,
    ) -> R {
        let unit = self.registry.identify(graph);
        let id = unit.id;
        let began = self
            .tracker
            .handle(BoundaryEvent::BeginUnit { unit, inputs });
        if let Err(err) = &began {
            warn!("{id} not recorded: {err}");
        }
        let value = run();
        if began.is_ok() {
            if let Err(err) = self.tracker.handle(BoundaryEvent::EndUnit) {
                warn!("{id} end not recorded: {err}");
            }
        }
        value
    }

    /// A break in local code that does not lead into a unit.
    pub fn boundary(&mut self) {
        if let Err(err) = self.tracker.handle(BoundaryEvent::LocalBoundary) {
            warn!("local boundary not recorded: {err}");
        }
    }
}
