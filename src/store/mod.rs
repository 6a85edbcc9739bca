//! In-memory entity cache.
//!
//! The cache is the single source of truth while the process runs. It is
//! split into one [`KeyedStore`] per id space; every store carries its own
//! per-key lock table so unrelated entities never contend.

mod cache;
mod keyed;
mod listener;
mod lock;

use thiserror::Error;

use crate::entity::{EntityId, EntityKind};

pub use cache::{EntityCache, PreloadSummary};
pub use keyed::KeyedStore;
pub use listener::{CacheChange, CacheListener, CacheListenerSet};
pub use lock::WriteLock;

/// Errors raised by a keyed store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// No entry under this id.
    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: EntityId },

    /// The key stayed locked by another thread for the whole timeout.
    #[error("Timed out after {waited_ms}ms waiting for the write lock on {kind} {id}")]
    LockTimeout {
        kind: EntityKind,
        id: EntityId,
        waited_ms: u64,
    },

    /// A mutation was attempted without owning the key.
    #[error("Write lock on {kind} {id} is not held by the current thread")]
    LockNotHeld { kind: EntityKind, id: EntityId },
}
