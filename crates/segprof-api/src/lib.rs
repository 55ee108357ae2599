//! Types shared by every segprof crate.
//!
//! The backend catalog, the structural description of extracted graph units,
//! per-backend outcomes, and the two seams the engine is built around: the
//! opaque [`RemoteService`] that compiles and runs units, and the
//! [`UnitDispatcher`] the recorder calls when a compiled segment opens.

pub mod backend;
pub mod graph;
pub mod outcome;
pub mod remote;

pub use backend::{
    default_backends, AccelLibrary, BackendId, Hardware, UnsupportedBackend, BACKEND_CATALOG,
};
pub use graph::{
    ComputationUnit, ContentDigest, DType, GraphUnit, IdentityStrictness, InputsDescriptor,
    OpNode, TensorSpec, UnitFingerprint, UnitId, UnitPayload,
};
pub use outcome::BackendOutcome;
pub use remote::{
    ArtifactHandle, CompileRequest, ExecutionReport, RemoteError, RemoteService, SessionId,
    UnitDispatcher,
};
