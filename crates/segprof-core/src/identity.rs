use log::debug;
use parking_lot::Mutex;
use segprof_api::{ComputationUnit, GraphUnit, IdentityStrictness, UnitFingerprint, UnitId};
use std::collections::HashMap;
use std::sync::Arc;

/// Hands out unit ids by structural fingerprint.
///
/// Ids start at 1, grow monotonically and are never reused for a different
/// structure. One registry is meant to live for the whole process and be
/// shared (via `Arc`) by every profiling pass, so ids stay stable across
/// passes.
pub struct UnitRegistry {
    strictness: IdentityStrictness,
    state: Mutex<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    by_fingerprint: HashMap<UnitFingerprint, UnitId>,
    graphs: Vec<Arc<GraphUnit>>,
}

impl UnitRegistry {
    pub fn new(strictness: IdentityStrictness) -> Self {
        Self {
            strictness,
            state: Mutex::new(RegistryState::default()),
        }
    }

    pub fn shared(strictness: IdentityStrictness) -> Arc<Self> {
        Arc::new(Self::new(strictness))
    }

    pub fn strictness(&self) -> IdentityStrictness {
        self.strictness
    }

    /// Returns the unit for `graph`, assigning the next id on first sight.
    pub fn identify(&self, graph: GraphUnit) -> ComputationUnit {
        let fingerprint = graph.fingerprint(self.strictness);
        let mut state = self.state.lock();
        if let Some(&id) = state.by_fingerprint.get(&fingerprint) {
            let graph = state.graphs[(id.0 - 1) as usize].clone();
            return ComputationUnit {
                id,
                fingerprint,
                graph,
            };
        }
        let id = UnitId(state.graphs.len() as u32 + 1);
        let graph = Arc::new(graph);
        state.graphs.push(graph.clone());
        state.by_fingerprint.insert(fingerprint, id);
        debug!("new unit {id} ({} ops, fingerprint {fingerprint:?})", graph.ops.len());
        ComputationUnit {
            id,
            fingerprint,
            graph,
        }
    }

    pub fn get(&self, id: UnitId) -> Option<Arc<GraphUnit>> {
        let index = (id.0 as usize).checked_sub(1)?;
        self.state.lock().graphs.get(index).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().graphs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for UnitRegistry {
    fn default() -> Self {
        Self::new(IdentityStrictness::default())
    }
}
