use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Access token separating mutator work from a relocation cycle.
///
/// Register and reference accessors, and every walker query, require a
/// shared guard; any number of threads may hold one concurrently. The
/// collector takes the lock exclusively for the span of a relocation, and
/// mutating a frame's method pointer also requires the exclusive side since
/// the collector reads method pointers while scanning.
#[derive(Debug, Default)]
pub struct MutatorLock {
    inner: RwLock<()>,
}

/// Shared access token. Holding one guarantees no relocation is in flight.
pub struct SharedMutator<'l> {
    _guard: RwLockReadGuard<'l, ()>,
}

/// Exclusive access token, held by the collector during relocation and by
/// mutators rewriting fields the collector reads concurrently.
pub struct ExclusiveMutator<'l> {
    _guard: RwLockWriteGuard<'l, ()>,
}

impl MutatorLock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(()),
        }
    }

    #[must_use]
    pub fn lock_shared(&self) -> SharedMutator<'_> {
        SharedMutator {
            _guard: self.inner.read(),
        }
    }

    #[must_use]
    pub fn lock_exclusive(&self) -> ExclusiveMutator<'_> {
        ExclusiveMutator {
            _guard: self.inner.write(),
        }
    }
}
