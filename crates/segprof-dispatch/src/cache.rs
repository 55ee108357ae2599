use parking_lot::Mutex;
use segprof_api::{ArtifactHandle, BackendId, SessionId, UnitId};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArtifactKey {
    pub session: SessionId,
    pub unit: UnitId,
    pub backend: BackendId,
}

/// Compile state of one (session, unit, backend).
///
/// Only `Uncompiled -> Compiled` and `Uncompiled -> Failed` are taken; the
/// dispatch that takes either one is the unit's compilation run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ArtifactState {
    #[default]
    Uncompiled,
    Compiled(ArtifactHandle),
    Failed(String),
}

/// Per-key slots. A dispatcher holds the slot lock while compiling, so a
/// concurrent dispatch for the same key waits and then sees the result.
#[derive(Default)]
pub(crate) struct ArtifactCache {
    slots: Mutex<HashMap<ArtifactKey, Arc<Mutex<ArtifactState>>>>,
}

impl ArtifactCache {
    pub(crate) fn slot(&self, key: ArtifactKey) -> Arc<Mutex<ArtifactState>> {
        self.slots.lock().entry(key).or_default().clone()
    }

    pub(crate) fn state(&self, key: &ArtifactKey) -> ArtifactState {
        self.slots
            .lock()
            .get(key)
            .map(|slot| slot.lock().clone())
            .unwrap_or_default()
    }

    /// Forgets everything compiled for `session`; returns how many keys went.
    pub(crate) fn purge_session(&self, session: SessionId) -> usize {
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|key, _| key.session != session);
        before - slots.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.lock().len()
    }
}
