//! Local object reference table.
//!
//! Every in-flight remote command is registered here so the worker side can
//! call back into it by its locally unique id (luid). The table is shared by
//! the dispatch path and the callback path and is guarded by a single mutex.

use super::command::CommandListener;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Process-wide identity of a local object
pub type ProcessUniqueId = u64;

/// Identifier the remote side uses to address a registered object
pub type Luid = u64;

#[derive(Default)]
struct TableInner {
    next_luid: Luid,
    luids: HashMap<ProcessUniqueId, Luid>,
    local_objects: HashMap<Luid, Arc<dyn CommandListener>>,
}

/// Reference table of one broker (one worker connection)
#[derive(Default)]
pub struct ReferenceTable {
    inner: Mutex<TableInner>,
}

impl ReferenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `object` under `puid`, returning its luid. Registering an
    /// already registered object returns the existing luid.
    pub fn register(&self, puid: ProcessUniqueId, object: Arc<dyn CommandListener>) -> Luid {
        let mut inner = self.inner.lock();
        if let Some(luid) = inner.luids.get(&puid) {
            return *luid;
        }
        inner.next_luid += 1;
        let luid = inner.next_luid;
        inner.luids.insert(puid, luid);
        inner.local_objects.insert(luid, object);
        luid
    }

    /// Drop the reference held for `puid`. Returns false, and touches nothing,
    /// when the object is not registered.
    pub fn release(&self, puid: ProcessUniqueId) -> bool {
        let mut inner = self.inner.lock();
        match inner.luids.remove(&puid) {
            Some(luid) => {
                inner.local_objects.remove(&luid);
                true
            }
            None => false,
        }
    }

    /// Resolve a luid received from the remote side
    pub fn lookup(&self, luid: Luid) -> Option<Arc<dyn CommandListener>> {
        self.inner.lock().local_objects.get(&luid).cloned()
    }

    pub fn luid_for(&self, puid: ProcessUniqueId) -> Option<Luid> {
        self.inner.lock().luids.get(&puid).copied()
    }

    pub fn contains(&self, puid: ProcessUniqueId) -> bool {
        self.inner.lock().luids.contains_key(&puid)
    }

    /// Number of live references
    pub fn len(&self) -> usize {
        self.inner.lock().local_objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the `puid -> luid` mapping
    pub fn registered(&self) -> HashMap<ProcessUniqueId, Luid> {
        self.inner.lock().luids.clone()
    }
}

impl fmt::Debug for ReferenceTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ReferenceTable")
            .field("luids", &inner.luids)
            .field("local_objects", &inner.local_objects.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::command::CommandUpdate;

    struct Inert;

    impl CommandListener for Inert {
        fn remote_update(&self, _updates: Vec<CommandUpdate>) {}
        fn remote_complete(&self, _failure: Option<String>) {}
    }

    #[test]
    fn test_register_is_stable_per_object() {
        let table = ReferenceTable::new();
        let first = table.register(7, Arc::new(Inert));
        let again = table.register(7, Arc::new(Inert));
        assert_eq!(first, again);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_release_twice_is_noop() {
        let table = ReferenceTable::new();
        table.register(1, Arc::new(Inert));
        let other = table.register(2, Arc::new(Inert));

        assert!(table.release(1));
        assert!(!table.release(1));

        assert_eq!(table.len(), 1);
        assert!(table.lookup(other).is_some());
        assert_eq!(table.luid_for(2), Some(other));
    }
}
