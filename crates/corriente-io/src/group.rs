//! Bulk resource teardown for stream construction.
//!
//! Opening a stream acquires resources in sequence: driver handles,
//! scratch memory, worker state. If a later step fails, everything
//! acquired so far must be released in reverse order. A [`ResourceGroup`]
//! collects owned resources and cleanup actions as they are acquired and
//! releases them all, last-in first-out, when dropped or explicitly
//! released. A group that reaches the end of a successful open is
//! [`disarm`](ResourceGroup::disarm)ed and hands ownership to the stream.

enum Entry {
    /// A value kept alive until release; dropping it is its cleanup.
    Owned(Box<dyn std::any::Any + Send>),
    /// An explicit cleanup action.
    Cleanup(Box<dyn FnOnce() + Send>),
}

/// LIFO bulk releaser for partially constructed streams.
#[derive(Default)]
pub struct ResourceGroup {
    entries: Vec<Entry>,
}

impl ResourceGroup {
    /// An empty group.
    #[must_use]
    pub fn new() -> ResourceGroup {
        ResourceGroup {
            entries: Vec::new(),
        }
    }

    /// Keep `resource` alive until the group releases; its `Drop` is its
    /// cleanup.
    pub fn adopt<T: Send + 'static>(&mut self, resource: T) {
        self.entries.push(Entry::Owned(Box::new(resource)));
    }

    /// Register an explicit cleanup action.
    pub fn defer(&mut self, cleanup: impl FnOnce() + Send + 'static) {
        self.entries.push(Entry::Cleanup(Box::new(cleanup)));
    }

    /// Number of registered entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Release everything now, in reverse order of registration.
    pub fn release_all(&mut self) {
        while let Some(entry) = self.entries.pop() {
            match entry {
                Entry::Owned(resource) => drop(resource),
                Entry::Cleanup(cleanup) => cleanup(),
            }
        }
    }

    /// Forget all entries without running cleanups; used when construction
    /// succeeded and ownership has moved to the stream.
    pub fn disarm(&mut self) {
        // Owned entries must not be dropped here (their Drop is cleanup),
        // so leak-free disarming only applies to groups whose owned
        // resources were taken back by the caller. Cleanup-only entries
        // are simply discarded.
        let entries = std::mem::take(&mut self.entries);
        for entry in entries {
            match entry {
                Entry::Owned(resource) => {
                    // Ownership transfers nowhere; keep the value alive by
                    // conventional drop at scope end would run cleanup, so
                    // owned resources are not allowed in a disarmed group.
                    debug_assert!(false, "disarm called with owned resources still registered");
                    drop(resource);
                }
                Entry::Cleanup(_) => {}
            }
        }
    }

    /// Take back the most recently adopted resource of type `T`, removing
    /// it from the group.
    pub fn reclaim<T: Send + 'static>(&mut self) -> Option<T> {
        let index = self.entries.iter().rposition(|entry| {
            matches!(entry, Entry::Owned(resource) if resource.is::<T>())
        })?;
        match self.entries.remove(index) {
            Entry::Owned(resource) => resource.downcast::<T>().ok().map(|boxed| *boxed),
            Entry::Cleanup(_) => None,
        }
    }
}

impl Drop for ResourceGroup {
    fn drop(&mut self) {
        self.release_all();
    }
}

impl std::fmt::Debug for ResourceGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGroup")
            .field("entries", &self.entries.len())
            .finish()
    }
}
