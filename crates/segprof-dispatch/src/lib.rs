//! Remote dispatch client.
//!
//! [`DispatchClient`] turns "run this unit on these backends" into calls on a
//! [`RemoteService`](segprof_api::RemoteService): upload the payload once per
//! digest, compile once per (session, unit, backend), then execute and time.
//! [`HttpRemoteService`] is the production binding of that trait.

mod cache;
mod client;
mod http;
mod retry;
mod stats;

pub use cache::{ArtifactKey, ArtifactState};
pub use client::{DispatchClient, SessionDispatcher};
pub use http::{HttpRemoteConfig, HttpRemoteService, HttpSetupError};
pub use retry::RetryPolicy;
pub use stats::DispatchStats;
