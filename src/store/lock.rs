//! Per-key reentrant write locks.
//!
//! A key is owned by at most one thread at a time; the owning thread may
//! re-acquire it any number of times (update flows re-enter while already
//! holding the lock). Unrelated keys never wait on each other: the table
//! mutex is only held for the bookkeeping, never while a caller owns a key.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::entity::EntityId;

#[derive(Debug)]
struct Owner {
    thread: ThreadId,
    depth: usize,
}

/// Lock table shared by all keys of one store.
#[derive(Debug, Default)]
pub(crate) struct KeyLocks {
    table: Mutex<HashMap<EntityId, Owner>>,
    released: Condvar,
}

impl KeyLocks {
    /// Blocks until the current thread owns `id`.
    ///
    /// Returns the time spent waiting as the error when `timeout` elapses.
    pub(crate) fn acquire(&self, id: EntityId, timeout: Option<Duration>) -> Result<(), Duration> {
        let me = thread::current().id();
        let start = Instant::now();
        let deadline = timeout.map(|t| start + t);

        let mut table = self.table.lock();
        loop {
            let holder = table.get(&id).map(|o| o.thread);
            match holder {
                None => {
                    table.insert(id, Owner { thread: me, depth: 1 });
                    return Ok(());
                }
                Some(thread) if thread == me => {
                    if let Some(owner) = table.get_mut(&id) {
                        owner.depth += 1;
                    }
                    return Ok(());
                }
                Some(_) => match deadline {
                    None => self.released.wait(&mut table),
                    Some(deadline) => {
                        if self.released.wait_until(&mut table, deadline).timed_out() {
                            let still_foreign = table.get(&id).is_some_and(|o| o.thread != me);
                            if still_foreign {
                                return Err(start.elapsed());
                            }
                        }
                    }
                },
            }
        }
    }

    /// Drops one level of ownership. Returns false if the current thread did
    /// not own `id`.
    pub(crate) fn release(&self, id: EntityId) -> bool {
        let me = thread::current().id();
        let mut table = self.table.lock();
        let Some(owner) = table.get_mut(&id) else {
            return false;
        };
        if owner.thread != me {
            return false;
        }
        owner.depth -= 1;
        if owner.depth == 0 {
            table.remove(&id);
            drop(table);
            self.released.notify_all();
        }
        true
    }

    pub(crate) fn is_held_by_current_thread(&self, id: EntityId) -> bool {
        let me = thread::current().id();
        self.table.lock().get(&id).is_some_and(|o| o.thread == me)
    }

    pub(crate) fn is_locked(&self, id: EntityId) -> bool {
        self.table.lock().contains_key(&id)
    }
}

/// Guard for one level of ownership of a key.
///
/// Released exactly once: either explicitly through [`WriteLock::release`]
/// (further calls are no-ops) or when the guard is dropped. The guard is
/// bound to the acquiring thread and cannot be sent elsewhere.
#[must_use = "the key is unlocked as soon as the guard is dropped"]
#[derive(Debug)]
pub struct WriteLock<'a> {
    locks: &'a KeyLocks,
    id: EntityId,
    held: bool,
    _thread_bound: PhantomData<*const ()>,
}

impl<'a> WriteLock<'a> {
    pub(crate) const fn new(locks: &'a KeyLocks, id: EntityId) -> Self {
        Self {
            locks,
            id,
            held: true,
            _thread_bound: PhantomData,
        }
    }

    /// The locked key.
    #[must_use]
    pub const fn id(&self) -> EntityId {
        self.id
    }

    /// True until the guard has been released.
    #[must_use]
    pub const fn is_held(&self) -> bool {
        self.held
    }

    /// Releases the lock early. Idempotent.
    pub fn release(&mut self) {
        if self.held {
            self.held = false;
            self.locks.release(self.id);
        }
    }
}

impl Drop for WriteLock<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_reentrant_acquire() {
        let locks = KeyLocks::default();
        let id = EntityId::new(1);
        locks.acquire(id, None).unwrap();
        locks.acquire(id, None).unwrap();
        assert!(locks.release(id));
        assert!(locks.is_held_by_current_thread(id));
        assert!(locks.release(id));
        assert!(!locks.is_locked(id));
        assert!(!locks.release(id));
    }

    #[test]
    fn test_foreign_thread_times_out() {
        let locks = Arc::new(KeyLocks::default());
        let id = EntityId::new(7);
        locks.acquire(id, None).unwrap();

        let other = Arc::clone(&locks);
        let waited = thread::spawn(move || other.acquire(id, Some(Duration::from_millis(30))))
            .join()
            .unwrap();
        assert!(waited.unwrap_err() >= Duration::from_millis(30));
        assert!(locks.release(id));
    }

    #[test]
    fn test_unrelated_keys_do_not_block() {
        let locks = Arc::new(KeyLocks::default());
        locks.acquire(EntityId::new(1), None).unwrap();

        let other = Arc::clone(&locks);
        let ok = thread::spawn(move || {
            let r = other.acquire(EntityId::new(2), Some(Duration::from_millis(10)));
            other.release(EntityId::new(2));
            r
        })
        .join()
        .unwrap();
        assert!(ok.is_ok());
    }

    #[test]
    fn test_waiter_wakes_on_release() {
        let locks = Arc::new(KeyLocks::default());
        let id = EntityId::new(3);
        locks.acquire(id, None).unwrap();

        let acquired = Arc::new(AtomicBool::new(false));
        let (l, a) = (Arc::clone(&locks), Arc::clone(&acquired));
        let handle = thread::spawn(move || {
            l.acquire(id, None).unwrap();
            a.store(true, Ordering::SeqCst);
            l.release(id);
        });

        thread::sleep(Duration::from_millis(20));
        assert!(!acquired.load(Ordering::SeqCst));
        locks.release(id);
        handle.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_guard_release_is_idempotent() {
        let locks = KeyLocks::default();
        let id = EntityId::new(9);
        locks.acquire(id, None).unwrap();
        let mut guard = WriteLock::new(&locks, id);
        guard.release();
        guard.release();
        assert!(!guard.is_held());
        drop(guard);
        assert!(!locks.is_locked(id));
    }
}
