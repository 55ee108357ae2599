use crate::BackendId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Runs of one unit on one backend.
///
/// A single dispatch produces an outcome with at most one run; the recorder
/// merges occurrences into the ledger entry for the segment. `mean` only
/// covers successful runs, and a compilation run is counted in `discarded`
/// instead of `runs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendOutcome {
    pub backend: BackendId,
    pub runs: u64,
    #[serde(with = "duration_ns")]
    pub mean: Duration,
    pub failures: u64,
    #[serde(default)]
    pub discarded: u64,
}

impl BackendOutcome {
    pub fn success(backend: BackendId, elapsed: Duration) -> Self {
        Self {
            backend,
            runs: 1,
            mean: elapsed,
            failures: 0,
            discarded: 0,
        }
    }

    pub fn failure(backend: BackendId) -> Self {
        Self {
            backend,
            runs: 1,
            mean: Duration::ZERO,
            failures: 1,
            discarded: 0,
        }
    }

    /// The one-time compilation run; excluded from `runs` and `mean`.
    pub fn compilation_run(backend: BackendId) -> Self {
        Self {
            backend,
            runs: 0,
            mean: Duration::ZERO,
            failures: 0,
            discarded: 1,
        }
    }

    pub fn successes(&self) -> u64 {
        self.runs.saturating_sub(self.failures)
    }

    pub fn is_consistent(&self) -> bool {
        self.failures <= self.runs
    }
}

mod duration_ns {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_nanos().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_nanos(u64::deserialize(d)?))
    }
}
