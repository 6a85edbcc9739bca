//! Generic keyed store with per-key write locks.
//!
//! Reads never take a key lock; they return snapshot clones so a reader never
//! holds a live reference while the entry is concurrently replaced. Writes
//! that belong to a transaction go through [`KeyedStore::modify`], which
//! requires the caller to own the key's lock.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;

use super::lock::{KeyLocks, WriteLock};
use super::StoreError;
use crate::entity::{EntityId, EntityKind};

/// Mapping from id to entity, one per id space.
#[derive(Debug)]
pub struct KeyedStore<V> {
    kind: EntityKind,
    entries: RwLock<HashMap<EntityId, V>>,
    locks: KeyLocks,
    lock_timeout: RwLock<Option<Duration>>,
}

impl<V: Clone> KeyedStore<V> {
    /// Creates an empty store.
    ///
    /// `kind` labels errors raised by this store; `lock_timeout` bounds every
    /// [`acquire_write_lock`](Self::acquire_write_lock) call (`None` waits
    /// forever) until replaced through [`set_lock_timeout`](Self::set_lock_timeout).
    #[must_use]
    pub fn new(kind: EntityKind, lock_timeout: Option<Duration>) -> Self {
        Self {
            kind,
            entries: RwLock::new(HashMap::new()),
            locks: KeyLocks::default(),
            lock_timeout: RwLock::new(lock_timeout),
        }
    }

    /// Bound applied to later lock acquisitions. Waiters already blocked keep
    /// the bound they started with.
    pub fn set_lock_timeout(&self, lock_timeout: Option<Duration>) {
        *self.lock_timeout.write() = lock_timeout;
    }

    #[must_use]
    pub fn lock_timeout(&self) -> Option<Duration> {
        *self.lock_timeout.read()
    }

    /// Kind used in error reports.
    #[must_use]
    pub const fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Returns a snapshot of the entry.
    pub fn get(&self, id: EntityId) -> Result<V, StoreError> {
        self.try_get(id).ok_or(StoreError::NotFound { kind: self.kind, id })
    }

    /// Returns a snapshot of the entry, if present.
    #[must_use]
    pub fn try_get(&self, id: EntityId) -> Option<V> {
        self.entries.read().get(&id).cloned()
    }

    #[must_use]
    pub fn contains(&self, id: EntityId) -> bool {
        self.entries.read().contains_key(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// All ids, ascending.
    #[must_use]
    pub fn ids(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self.entries.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Snapshot of every entry, ordered by id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<V> {
        let entries = self.entries.read();
        let mut ids: Vec<&EntityId> = entries.keys().collect();
        ids.sort_unstable();
        ids.into_iter().filter_map(|id| entries.get(id).cloned()).collect()
    }

    /// Inserts or replaces without taking the key lock.
    ///
    /// Only for commit points and recovery: the caller is either the lock
    /// holder or runs before any transaction can observe the key.
    pub fn put_quiet(&self, id: EntityId, value: V) -> Option<V> {
        self.entries.write().insert(id, value)
    }

    /// Removes the entry, returning it if present.
    pub fn remove(&self, id: EntityId) -> Option<V> {
        self.entries.write().remove(&id)
    }

    /// Acquires the write lock on `id`. Reentrant for the calling thread.
    ///
    /// The key does not need to exist; creation locks the id it is about to
    /// occupy.
    pub fn acquire_write_lock(&self, id: EntityId) -> Result<WriteLock<'_>, StoreError> {
        match self.locks.acquire(id, self.lock_timeout()) {
            Ok(()) => Ok(WriteLock::new(&self.locks, id)),
            Err(waited) => Err(StoreError::LockTimeout {
                kind: self.kind,
                id,
                waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    #[must_use]
    pub fn is_write_locked_by_current_thread(&self, id: EntityId) -> bool {
        self.locks.is_held_by_current_thread(id)
    }

    /// Returns true if any thread holds the key.
    #[must_use]
    pub fn is_write_locked(&self, id: EntityId) -> bool {
        self.locks.is_locked(id)
    }

    /// Mutates an entry in place. The current thread must own the key.
    pub fn modify<R>(&self, id: EntityId, f: impl FnOnce(&mut V) -> R) -> Result<R, StoreError> {
        if !self.locks.is_held_by_current_thread(id) {
            return Err(StoreError::LockNotHeld { kind: self.kind, id });
        }
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(&id)
            .ok_or(StoreError::NotFound { kind: self.kind, id })?;
        Ok(f(entry))
    }
}
