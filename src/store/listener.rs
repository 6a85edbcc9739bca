//! Cache listeners.
//!
//! Listeners see committed state only. The configuration engine queues a
//! [`CacheChange`] per committed step and publishes the batch once the
//! enclosing root transaction has committed; rolled-back work is never
//! published.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::warn;

use crate::entity::{Entity, EntityId, EntityKind};

/// A committed change to the cache.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "change", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheChange {
    /// Snapshot of a newly created entity.
    Created { entity: Entity },
    /// Snapshot of an entity after an update.
    Updated { entity: Entity },
    /// An entity that no longer exists.
    Removed { kind: EntityKind, id: EntityId },
}

impl CacheChange {
    #[must_use]
    pub const fn id(&self) -> EntityId {
        match self {
            Self::Created { entity } | Self::Updated { entity } => entity.id(),
            Self::Removed { id, .. } => *id,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> EntityKind {
        match self {
            Self::Created { entity } | Self::Updated { entity } => entity.kind(),
            Self::Removed { kind, .. } => *kind,
        }
    }
}

/// Consumer of committed cache changes (index projectors, client notifiers).
///
/// Called on the committing thread after all locks of the transaction have
/// been released; implementations should hand off slow work.
pub trait CacheListener: Send + Sync {
    /// Receives one committed change.
    fn on_committed(&self, change: &CacheChange);
}

/// Registered cache listeners.
#[derive(Default)]
pub struct CacheListenerSet {
    listeners: RwLock<Vec<Arc<dyn CacheListener>>>,
}

impl std::fmt::Debug for CacheListenerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheListenerSet")
            .field("listeners", &self.len())
            .finish()
    }
}

impl CacheListenerSet {
    pub fn register(&self, listener: Arc<dyn CacheListener>) {
        self.listeners.write().push(listener);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Delivers `changes` in order to every listener.
    ///
    /// A panicking listener is logged and skipped for the rest of the batch;
    /// other listeners still receive every change.
    pub fn publish(&self, changes: &[CacheChange]) {
        if changes.is_empty() {
            return;
        }
        let listeners = self.listeners.read().clone();
        for listener in &listeners {
            for change in changes {
                let delivered =
                    panic::catch_unwind(AssertUnwindSafe(|| listener.on_committed(change)));
                if delivered.is_err() {
                    warn!(
                        kind = %change.kind(),
                        id = %change.id(),
                        "cache listener panicked; skipping remaining changes for it"
                    );
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::entity::DataTag;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<EntityId>>);

    impl CacheListener for Recorder {
        fn on_committed(&self, change: &CacheChange) {
            self.0.lock().push(change.id());
        }
    }

    struct Panicker;

    impl CacheListener for Panicker {
        fn on_committed(&self, _change: &CacheChange) {
            panic!("listener failure");
        }
    }

    #[test]
    fn test_publish_reaches_all_listeners_in_order() {
        let set = CacheListenerSet::default();
        let rec = Arc::new(Recorder::default());
        set.register(Arc::new(Panicker));
        set.register(rec.clone());

        set.publish(&[
            CacheChange::Created {
                entity: Entity::DataTag(DataTag::new(EntityId::new(1), "a")),
            },
            CacheChange::Removed {
                kind: EntityKind::Alarm,
                id: EntityId::new(2),
            },
        ]);

        assert_eq!(*rec.0.lock(), vec![EntityId::new(1), EntityId::new(2)]);
        assert_eq!(set.len(), 2);
    }
}
