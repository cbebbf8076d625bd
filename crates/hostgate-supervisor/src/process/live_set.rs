use super::ProcessHandle;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Identifier of a tracked process, unique within one [`LiveProcessSet`]
pub type HandleId = u64;

#[derive(Default)]
struct Inner {
    handles: Mutex<HashMap<HandleId, ProcessHandle>>,
    next_id: AtomicU64,
}

/// Child processes that have been spawned and not yet observed to exit.
///
/// Cheap to clone; clones share the same set. Entries are removed by each
/// process's monitor task before its exit becomes observable.
#[derive(Clone, Default)]
pub struct LiveProcessSet {
    inner: Arc<Inner>,
}

impl LiveProcessSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn handles(&self) -> MutexGuard<'_, HashMap<HandleId, ProcessHandle>> {
        self.inner
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn allocate_id(&self) -> HandleId {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Track a process; an already exited one is not added
    pub fn insert(&self, handle: ProcessHandle) {
        if handle.has_exited() {
            return;
        }
        self.handles().insert(handle.id(), handle);
    }

    pub fn remove(&self, id: HandleId) -> bool {
        self.handles().remove(&id).is_some()
    }

    pub fn contains(&self, id: HandleId) -> bool {
        self.handles().contains_key(&id)
    }

    /// Copy of the current entries, safe to iterate while the set changes
    pub fn snapshot(&self) -> Vec<ProcessHandle> {
        let mut handles: Vec<ProcessHandle> = self.handles().values().cloned().collect();
        handles.sort_by_key(ProcessHandle::id);
        handles
    }

    pub fn len(&self) -> usize {
        self.handles().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles().is_empty()
    }

    /// Drop every entry, returning what was still tracked
    pub(crate) fn drain(&self) -> Vec<ProcessHandle> {
        self.handles().drain().map(|(_, handle)| handle).collect()
    }
}

impl std::fmt::Debug for LiveProcessSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.snapshot()).finish()
    }
}
