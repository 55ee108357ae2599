use crate::cache::{ArtifactCache, ArtifactKey, ArtifactState};
use crate::retry::RetryPolicy;
use crate::stats::{DispatchStats, DispatchTelemetry};
use crossbeam_utils::thread;
use log::{debug, info, warn};
use parking_lot::Mutex;
use segprof_api::{
    ArtifactHandle, BackendId, BackendOutcome, CompileRequest, ComputationUnit, ContentDigest,
    InputsDescriptor, RemoteError, RemoteService, SessionId, UnitDispatcher, UnitId, UnitPayload,
};
use segprof_session::{CloseHook, Lease, LeaseManager, Session};
use segprof_time::{MonotonicClock, SharedClock};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::info_span;

/// Compiles units once per session and backend, then executes and times them.
pub struct DispatchClient {
    service: Arc<dyn RemoteService>,
    retry: RetryPolicy,
    clock: SharedClock,
    artifacts: ArtifactCache,
    uploaded: Mutex<HashSet<ContentDigest>>,
    telemetry: DispatchTelemetry,
}

impl DispatchClient {
    pub fn new(service: Arc<dyn RemoteService>, retry: RetryPolicy) -> Self {
        Self {
            service,
            retry,
            clock: MonotonicClock::shared(),
            artifacts: ArtifactCache::default(),
            uploaded: Mutex::new(HashSet::new()),
            telemetry: DispatchTelemetry::default(),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Registers the client as a close hook so a closing session's artifacts
    /// are purged here and on the remote side.
    pub fn attach(self: &Arc<Self>, manager: &LeaseManager) {
        manager.add_close_hook(self.clone());
    }

    pub fn stats(&self) -> DispatchStats {
        self.telemetry.snapshot()
    }

    pub fn artifact_state(
        &self,
        session: SessionId,
        unit: UnitId,
        backend: BackendId,
    ) -> ArtifactState {
        self.artifacts.state(&ArtifactKey {
            session,
            unit,
            backend,
        })
    }

    pub fn cached_artifacts(&self) -> usize {
        self.artifacts.len()
    }

    /// Runs `unit` once on `backend`.
    ///
    /// The first dispatch for a (session, unit, backend) compiles and is
    /// reported as a discarded compilation run. Remote failures never escape:
    /// they come back as a failed run.
    pub fn dispatch(
        &self,
        session: &Session,
        unit: &ComputationUnit,
        inputs: &InputsDescriptor,
        backend: BackendId,
    ) -> BackendOutcome {
        let _work = match session.begin_work(backend) {
            Ok(guard) => guard,
            Err(err) => {
                warn!("{} not dispatched to {backend}: {err}", unit.id);
                return BackendOutcome::failure(backend);
            }
        };
        let _span = info_span!(
            "remote.dispatch",
            unit = unit.id.0,
            backend = %backend,
            session = %session.id()
        )
        .entered();
        let key = ArtifactKey {
            session: session.id(),
            unit: unit.id,
            backend,
        };
        let slot = self.artifacts.slot(key);
        let mut state = slot.lock();
        let current = state.clone();
        match current {
            ArtifactState::Compiled(handle) => {
                drop(state);
                self.telemetry.record_cache_hit();
                self.execute(unit.id, backend, &handle, inputs)
            }
            ArtifactState::Failed(reason) => {
                debug!("{} has no artifact on {backend}: {reason}", unit.id);
                BackendOutcome::failure(backend)
            }
            ArtifactState::Uncompiled => match self.compile(key, unit, inputs) {
                Ok(handle) => {
                    *state = ArtifactState::Compiled(handle.clone());
                    drop(state);
                    self.warm_up(unit.id, backend, &handle, inputs);
                    BackendOutcome::compilation_run(backend)
                }
                Err(RemoteError::Transport(reason)) => {
                    // nothing was decided remotely; the next dispatch compiles again
                    warn!("{} could not reach {backend}: {reason}", unit.id);
                    BackendOutcome::failure(backend)
                }
                Err(err) => {
                    warn!("{} will not run on {backend}: {err}", unit.id);
                    *state = ArtifactState::Failed(err.to_string());
                    BackendOutcome::compilation_run(backend)
                }
            },
        }
    }

    /// One dispatch per session backend, in parallel, joined before
    /// returning. Outcomes follow the session's backend order.
    pub fn dispatch_all(
        &self,
        session: &Session,
        unit: &ComputationUnit,
        inputs: &InputsDescriptor,
    ) -> Vec<BackendOutcome> {
        let backends = session.backends();
        if let [backend] = backends {
            return vec![self.dispatch(session, unit, inputs, *backend)];
        }
        let joined = thread::scope(|scope| {
            let handles: Vec<_> = backends
                .iter()
                .map(|&backend| {
                    let handle =
                        scope.spawn(move |_| self.dispatch(session, unit, inputs, backend));
                    (backend, handle)
                })
                .collect();
            handles
                .into_iter()
                .map(|(backend, handle)| {
                    handle.join().unwrap_or_else(|_| {
                        warn!("dispatch of {} to {backend} panicked", unit.id);
                        BackendOutcome::failure(backend)
                    })
                })
                .collect::<Vec<_>>()
        });
        joined.unwrap_or_else(|_| {
            backends
                .iter()
                .map(|&backend| BackendOutcome::failure(backend))
                .collect()
        })
    }

    fn compile(
        &self,
        key: ArtifactKey,
        unit: &ComputationUnit,
        inputs: &InputsDescriptor,
    ) -> Result<ArtifactHandle, RemoteError> {
        let payload = UnitPayload {
            unit: (*unit.graph).clone(),
            example_inputs: inputs.clone(),
        };
        let digest = self.ensure_uploaded(&payload)?;
        let request = CompileRequest {
            session: key.session,
            unit: key.unit,
            payload: digest,
            backend: key.backend,
            example_inputs: inputs.clone(),
        };
        let result = self.retry.run(
            "compile",
            || self.telemetry.record_retry(),
            || self.service.compile(&request),
        );
        self.telemetry.record_compilation(result.is_ok());
        if let Ok(handle) = &result {
            info!(
                "compiled {} for {} as artifact {}",
                key.unit, key.backend, handle.id
            );
        }
        result
    }

    fn ensure_uploaded(&self, payload: &UnitPayload) -> Result<ContentDigest, RemoteError> {
        let bytes = payload.to_bytes();
        let digest = ContentDigest::of(&bytes);
        let mut uploaded = self.uploaded.lock();
        if uploaded.contains(&digest) {
            self.telemetry.record_upload(true);
            return Ok(digest);
        }
        let known = self.retry.run(
            "blob lookup",
            || self.telemetry.record_retry(),
            || self.service.has_blob(&digest),
        )?;
        if !known {
            self.retry.run(
                "upload",
                || self.telemetry.record_retry(),
                || self.service.upload_blob(&digest, &bytes),
            )?;
            debug!("uploaded {} byte payload {digest}", bytes.len());
        }
        self.telemetry.record_upload(known);
        uploaded.insert(digest);
        Ok(digest)
    }

    fn warm_up(
        &self,
        unit: UnitId,
        backend: BackendId,
        handle: &ArtifactHandle,
        inputs: &InputsDescriptor,
    ) {
        match self.timed_execute(handle, inputs) {
            Ok(elapsed) => debug!(
                "{unit} compilation run on {backend} took {:.3} ms (discarded)",
                elapsed.as_secs_f64() * 1e3
            ),
            Err(err) => warn!("{unit} compilation run on {backend} failed: {err}"),
        }
    }

    fn execute(
        &self,
        unit: UnitId,
        backend: BackendId,
        handle: &ArtifactHandle,
        inputs: &InputsDescriptor,
    ) -> BackendOutcome {
        match self.timed_execute(handle, inputs) {
            Ok(elapsed) => BackendOutcome::success(backend, elapsed),
            Err(err) => {
                warn!("{unit} failed on {backend}: {err}");
                BackendOutcome::failure(backend)
            }
        }
    }

    fn timed_execute(
        &self,
        handle: &ArtifactHandle,
        inputs: &InputsDescriptor,
    ) -> Result<Duration, RemoteError> {
        let result = self.retry.run(
            "execute",
            || self.telemetry.record_retry(),
            || {
                let started = self.clock.now();
                let report = self.service.execute(handle, inputs)?;
                Ok(report
                    .device_elapsed
                    .unwrap_or_else(|| self.clock.elapsed_since(started)))
            },
        );
        self.telemetry.record_execution(result.is_ok());
        result
    }
}

impl CloseHook for DispatchClient {
    fn on_session_closed(&self, session: SessionId, _leases: &[Lease]) {
        let purged = self.artifacts.purge_session(session);
        let released = self.retry.run(
            "release session",
            || self.telemetry.record_retry(),
            || self.service.release_session(session),
        );
        match released {
            Ok(()) => debug!("session {session}: dropped {purged} cached artifact key(s)"),
            Err(err) => warn!("session {session}: remote artifacts not released: {err}"),
        }
    }
}

/// A session paired with the client that dispatches into it.
///
/// This is what the recorder sees as its [`UnitDispatcher`]. Dropping it
/// closes the session.
pub struct SessionDispatcher {
    client: Arc<DispatchClient>,
    session: Session,
}

impl SessionDispatcher {
    pub fn new(client: Arc<DispatchClient>, session: Session) -> Self {
        Self { client, session }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn client(&self) -> &Arc<DispatchClient> {
        &self.client
    }

    pub fn close(self) {
        self.session.close();
    }
}

impl UnitDispatcher for SessionDispatcher {
    fn backends(&self) -> Vec<BackendId> {
        self.session.backends().to_vec()
    }

    fn dispatch_all(
        &self,
        unit: &ComputationUnit,
        inputs: &InputsDescriptor,
    ) -> Vec<BackendOutcome> {
        self.client.dispatch_all(&self.session, unit, inputs)
    }
}
