//! Remote segment profiling.
//!
//! Wraps a function body in a profiling scope, runs every compiled segment on
//! each leased remote backend and prints where the time went when the scope
//! ends.
//!
//! ```no_run
//! # fn main() -> anyhow::Result<()> {
//! let segprof = segprof::Segprof::from_env()?;
//! let mut scope = segprof.profile()?;
//! for _ in 0..10 {
//!     scope.run(|frame| {
//!         frame.boundary();
//!     });
//! }
//! drop(scope); // prints the report
//! # Ok(())
//! # }
//! ```

pub mod config;

use anyhow::Context;
use log::info;
use segprof_api::{BackendId, RemoteService};
use segprof_core::{Profiler, UnitRegistry};
use segprof_dispatch::{DispatchClient, DispatchStats, HttpRemoteService, SessionDispatcher};
pub use segprof_logging::{run_id, set_log_hook, set_trace_hook, LogRecord, LoggingGuard, TraceEvent};
use segprof_session::{InMemoryQuota, LeaseManager, LeasePool, QuotaAccounting};
use std::sync::Arc;

pub use config::{ConfigLoader, SegprofConfig};
pub use segprof_api::{
    default_backends, DType, GraphUnit, IdentityStrictness, InputsDescriptor, OpNode, TensorSpec,
    UnitId, BACKEND_CATALOG,
};
pub use segprof_core::{
    render, report, BoundaryEvent, CallFrame, ProfilePass, ProfileScope, RenderedReport,
    ReportOptions, ReportView, Segment, SegmentKind,
};
pub use segprof_dispatch::RetryPolicy;
pub use segprof_session::SessionError;

/// Profiling scope backed by a leased session.
pub type RemoteScope = ProfileScope<SessionDispatcher>;

/// Leasing, dispatch and profiling wired together from one configuration.
pub struct Segprof {
    config: SegprofConfig,
    manager: LeaseManager,
    client: Arc<DispatchClient>,
    profiler: Profiler,
}

impl Segprof {
    pub fn new(
        config: SegprofConfig,
        service: Arc<dyn RemoteService>,
        quota: Arc<dyn QuotaAccounting>,
    ) -> Self {
        let manager = LeaseManager::new(
            config.session.user.clone(),
            LeasePool::catalog(config.session.instances_per_backend),
            quota,
            config.session.to_options(),
        );
        let client = Arc::new(DispatchClient::new(service, config.remote.retry_policy()));
        client.attach(&manager);
        let registry = UnitRegistry::shared(config.identity.strictness);
        let profiler = Profiler::new(registry)
            .with_report_options(config.report.to_options())
            .print_report(config.report.print);
        Self {
            config,
            manager,
            client,
            profiler,
        }
    }

    /// Talks to the configured HTTP endpoint with an in-process quota.
    pub fn from_config(config: SegprofConfig) -> anyhow::Result<Self> {
        let http = HttpRemoteService::new(config.remote.http_config()?)
            .context("Failed to set up the remote service client")?;
        info!("Remote compilation service at {}", http.base_url());
        let quota = Arc::new(InMemoryQuota::new(config.session.quota));
        Ok(Self::new(config, Arc::new(http), quota))
    }

    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_config(ConfigLoader::load()?)
    }

    /// Replaces the profiler, e.g. to install a test clock.
    pub fn with_profiler(mut self, profiler: Profiler) -> Self {
        self.profiler = profiler;
        self
    }

    /// Leases the configured backends and opens a profiling scope on them.
    pub fn profile(&self) -> Result<RemoteScope, SessionError> {
        let backends = self.config.session.backend_ids()?;
        self.profile_on(&backends)
    }

    pub fn profile_on(&self, backends: &[BackendId]) -> Result<RemoteScope, SessionError> {
        let session = self.manager.open(backends)?;
        Ok(self
            .profiler
            .profile(SessionDispatcher::new(self.client.clone(), session)))
    }

    pub fn config(&self) -> &SegprofConfig {
        &self.config
    }

    pub fn manager(&self) -> &LeaseManager {
        &self.manager
    }

    pub fn client(&self) -> &Arc<DispatchClient> {
        &self.client
    }

    pub fn profiler(&self) -> &Profiler {
        &self.profiler
    }

    pub fn stats(&self) -> DispatchStats {
        self.client.stats()
    }

    /// Closes every open session.
    pub fn shutdown(&self) {
        self.manager.close_all();
    }
}

impl Drop for Segprof {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Installs the logging stack described by `config.logging`.
pub fn init_logging(config: &SegprofConfig) -> LoggingGuard {
    segprof_logging::init_logging(config.logging.to_options())
}
