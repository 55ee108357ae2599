use crate::{BackendId, BackendOutcome, ComputationUnit, ContentDigest, InputsDescriptor, UnitId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new_v4() -> Self {
        SessionId(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque reference to a compiled artifact living on the remote side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactHandle {
    pub id: String,
    pub backend: BackendId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileRequest {
    pub session: SessionId,
    pub unit: UnitId,
    pub payload: ContentDigest,
    pub backend: BackendId,
    pub example_inputs: InputsDescriptor,
}

impl Serialize for ContentDigest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ContentDigest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_digest(&raw).ok_or_else(|| serde::de::Error::custom("invalid sha256 digest"))
    }
}

fn parse_digest(raw: &str) -> Option<ContentDigest> {
    if raw.len() != 64 || !raw.is_ascii() {
        return None;
    }
    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&raw[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(ContentDigest(out))
}

/// Timing reported for one remote execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    /// Device-side duration when the service measures it; callers fall back
    /// to their own wall-clock measurement otherwise.
    pub device_elapsed: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// Network-level problem; safe to retry.
    #[error("transport error: {0}")]
    Transport(String),
    /// The service cannot build a runnable artifact for this unit and backend.
    #[error("compilation failed: {0}")]
    Compilation(String),
    /// The artifact exists but could not be loaded (e.g. out of device memory).
    #[error("artifact load failed: {0}")]
    Load(String),
    #[error("execution failed: {0}")]
    Runtime(String),
    #[error("unknown artifact '{0}'")]
    UnknownArtifact(String),
}

impl RemoteError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Transport(_))
    }
}

/// The remote compilation/acceleration service.
///
/// Implementations are shared across the per-backend dispatch threads.
pub trait RemoteService: Send + Sync {
    fn has_blob(&self, digest: &ContentDigest) -> Result<bool, RemoteError>;
    fn upload_blob(&self, digest: &ContentDigest, bytes: &[u8]) -> Result<(), RemoteError>;
    fn compile(&self, request: &CompileRequest) -> Result<ArtifactHandle, RemoteError>;
    fn execute(
        &self,
        artifact: &ArtifactHandle,
        inputs: &InputsDescriptor,
    ) -> Result<ExecutionReport, RemoteError>;
    /// Drops every artifact compiled for `session`.
    fn release_session(&self, session: SessionId) -> Result<(), RemoteError>;
}

/// What the recorder calls when a compiled segment opens: run the unit on
/// every backend held by the active session and return one outcome each.
pub trait UnitDispatcher {
    fn backends(&self) -> Vec<BackendId>;
    fn dispatch_all(
        &self,
        unit: &ComputationUnit,
        inputs: &InputsDescriptor,
    ) -> Vec<BackendOutcome>;
}
