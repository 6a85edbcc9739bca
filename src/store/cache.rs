//! Entity cache: one keyed store per id space plus the listener set.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::keyed::KeyedStore;
use super::listener::CacheListenerSet;
use super::lock::WriteLock;
use super::StoreError;
use crate::entity::{Alarm, Entity, EntityId, EntityKind, Equipment, Process, SubEquipment, Tag};
use crate::error::{TagCoreError, TagCoreResult, ValidationError};
use crate::graph::{self, GraphViolation};
use crate::persistence::PersistenceAdapter;

/// Counts and integrity findings of a cache preload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreloadSummary {
    /// Entities loaded per kind.
    pub loaded: BTreeMap<EntityKind, usize>,
    /// Forward references that point at nothing (skipped during rebuild).
    pub dangling: Vec<GraphViolation>,
}

impl PreloadSummary {
    /// Total number of entities loaded.
    #[must_use]
    pub fn total(&self) -> usize {
        self.loaded.values().sum()
    }
}

/// The live configuration graph.
#[derive(Debug)]
pub struct EntityCache {
    tags: KeyedStore<Tag>,
    alarms: KeyedStore<Alarm>,
    processes: KeyedStore<Process>,
    equipment: KeyedStore<Equipment>,
    sub_equipment: KeyedStore<SubEquipment>,
    listeners: CacheListenerSet,
}

impl Default for EntityCache {
    fn default() -> Self {
        Self::new(None)
    }
}

impl EntityCache {
    /// Creates an empty cache. `lock_timeout` applies to every key lock.
    #[must_use]
    pub fn new(lock_timeout: Option<Duration>) -> Self {
        Self {
            // Data, rule and control tags share one id space.
            tags: KeyedStore::new(EntityKind::DataTag, lock_timeout),
            alarms: KeyedStore::new(EntityKind::Alarm, lock_timeout),
            processes: KeyedStore::new(EntityKind::Process, lock_timeout),
            equipment: KeyedStore::new(EntityKind::Equipment, lock_timeout),
            sub_equipment: KeyedStore::new(EntityKind::SubEquipment, lock_timeout),
            listeners: CacheListenerSet::default(),
        }
    }

    #[must_use]
    pub const fn tags(&self) -> &KeyedStore<Tag> {
        &self.tags
    }

    #[must_use]
    pub const fn alarms(&self) -> &KeyedStore<Alarm> {
        &self.alarms
    }

    #[must_use]
    pub const fn processes(&self) -> &KeyedStore<Process> {
        &self.processes
    }

    #[must_use]
    pub const fn equipment(&self) -> &KeyedStore<Equipment> {
        &self.equipment
    }

    #[must_use]
    pub const fn sub_equipment(&self) -> &KeyedStore<SubEquipment> {
        &self.sub_equipment
    }

    #[must_use]
    pub const fn listeners(&self) -> &CacheListenerSet {
        &self.listeners
    }

    /// Total number of cached entities across all id spaces.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tags.len()
            + self.alarms.len()
            + self.processes.len()
            + self.equipment.len()
            + self.sub_equipment.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replaces the lock bound of every id space.
    pub fn set_lock_timeout(&self, lock_timeout: Option<Duration>) {
        self.tags.set_lock_timeout(lock_timeout);
        self.alarms.set_lock_timeout(lock_timeout);
        self.processes.set_lock_timeout(lock_timeout);
        self.equipment.set_lock_timeout(lock_timeout);
        self.sub_equipment.set_lock_timeout(lock_timeout);
    }

    /// Acquires the write lock of `id` in the id space of `kind`.
    pub fn lock(&self, kind: EntityKind, id: EntityId) -> Result<WriteLock<'_>, StoreError> {
        match kind {
            EntityKind::DataTag | EntityKind::RuleTag | EntityKind::ControlTag => {
                self.tags.acquire_write_lock(id)
            }
            EntityKind::Alarm => self.alarms.acquire_write_lock(id),
            EntityKind::Process => self.processes.acquire_write_lock(id),
            EntityKind::Equipment => self.equipment.acquire_write_lock(id),
            EntityKind::SubEquipment => self.sub_equipment.acquire_write_lock(id),
        }
    }

    /// Returns true if an entity of exactly this kind is cached.
    #[must_use]
    pub fn contains(&self, kind: EntityKind, id: EntityId) -> bool {
        match kind {
            EntityKind::DataTag | EntityKind::RuleTag | EntityKind::ControlTag => {
                self.tags.try_get(id).is_some_and(|t| t.kind() == kind)
            }
            EntityKind::Alarm => self.alarms.contains(id),
            EntityKind::Process => self.processes.contains(id),
            EntityKind::Equipment => self.equipment.contains(id),
            EntityKind::SubEquipment => self.sub_equipment.contains(id),
        }
    }

    /// Snapshot of an entity of exactly this kind.
    #[must_use]
    pub fn entity(&self, kind: EntityKind, id: EntityId) -> Option<Entity> {
        match kind {
            EntityKind::DataTag | EntityKind::RuleTag | EntityKind::ControlTag => self
                .tags
                .try_get(id)
                .filter(|t| t.kind() == kind)
                .map(Entity::from),
            EntityKind::Alarm => self.alarms.try_get(id).map(Entity::Alarm),
            EntityKind::Process => self.processes.try_get(id).map(Entity::Process),
            EntityKind::Equipment => self.equipment.try_get(id).map(Entity::Equipment),
            EntityKind::SubEquipment => self.sub_equipment.try_get(id).map(Entity::SubEquipment),
        }
    }

    /// Snapshot of a tag, checked against the expected tag kind.
    pub fn tag_of_kind(&self, kind: EntityKind, id: EntityId) -> TagCoreResult<Tag> {
        let tag = self
            .tags
            .try_get(id)
            .ok_or(TagCoreError::NotFound { kind, id })?;
        if tag.kind() != kind {
            return Err(ValidationError::KindMismatch {
                id,
                expected: kind,
                actual: tag.kind(),
            }
            .into());
        }
        Ok(tag)
    }

    /// Inserts or replaces an entity without locking.
    pub fn put_quiet(&self, entity: Entity) {
        let id = entity.id();
        match entity {
            Entity::DataTag(t) => {
                self.tags.put_quiet(id, Tag::Data(t));
            }
            Entity::RuleTag(t) => {
                self.tags.put_quiet(id, Tag::Rule(t));
            }
            Entity::ControlTag(t) => {
                self.tags.put_quiet(id, Tag::Control(t));
            }
            Entity::Alarm(a) => {
                self.alarms.put_quiet(id, a);
            }
            Entity::Process(p) => {
                self.processes.put_quiet(id, p);
            }
            Entity::Equipment(e) => {
                self.equipment.put_quiet(id, e);
            }
            Entity::SubEquipment(s) => {
                self.sub_equipment.put_quiet(id, s);
            }
        }
    }

    /// Removes an entity from its id space, returning the removed snapshot.
    pub fn remove(&self, kind: EntityKind, id: EntityId) -> Option<Entity> {
        match kind {
            EntityKind::DataTag | EntityKind::RuleTag | EntityKind::ControlTag => {
                self.tags.remove(id).map(Entity::from)
            }
            EntityKind::Alarm => self.alarms.remove(id).map(Entity::Alarm),
            EntityKind::Process => self.processes.remove(id).map(Entity::Process),
            EntityKind::Equipment => self.equipment.remove(id).map(Entity::Equipment),
            EntityKind::SubEquipment => self.sub_equipment.remove(id).map(Entity::SubEquipment),
        }
    }

    /// Loads every kind from the durable store and rebuilds back-references.
    ///
    /// Must run before any transaction touches the cache. Back-reference sets
    /// stored with the entities are discarded and derived again from the
    /// forward references (rule inputs, alarm owners, parent ids).
    pub fn preload(&self, dao: &dyn PersistenceAdapter) -> TagCoreResult<PreloadSummary> {
        let mut summary = PreloadSummary::default();
        for kind in EntityKind::ALL {
            let entities = dao.load_all(kind)?;
            debug!(kind = %kind, count = entities.len(), "loaded entities");
            summary.loaded.insert(kind, entities.len());
            for entity in entities {
                if entity.kind() != kind {
                    warn!(
                        expected = %kind,
                        actual = %entity.kind(),
                        id = %entity.id(),
                        "persistence adapter returned an entity of the wrong kind; skipping"
                    );
                    continue;
                }
                self.put_quiet(entity);
            }
        }

        summary.dangling = graph::rebuild_back_references(self);
        for violation in &summary.dangling {
            warn!(violation = %violation, "dangling reference found during preload");
        }
        info!(
            entities = summary.total(),
            dangling = summary.dangling.len(),
            "entity cache preloaded"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{DataTag, RuleTag};
    use crate::persistence::InMemoryPersistence;

    #[test]
    fn test_tag_kinds_share_one_id_space() {
        let cache = EntityCache::default();
        cache.put_quiet(Entity::DataTag(DataTag::new(EntityId::new(1), "d")));
        assert!(cache.contains(EntityKind::DataTag, EntityId::new(1)));
        assert!(!cache.contains(EntityKind::RuleTag, EntityId::new(1)));

        let err = cache.tag_of_kind(EntityKind::RuleTag, EntityId::new(1)).unwrap_err();
        assert!(err.is_validation());
        let err = cache.tag_of_kind(EntityKind::RuleTag, EntityId::new(2)).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_remove_returns_snapshot() {
        let cache = EntityCache::default();
        cache.put_quiet(Entity::Process(Process::new(EntityId::new(1), "P")));
        let removed = cache.remove(EntityKind::Process, EntityId::new(1)).unwrap();
        assert_eq!(removed.kind(), EntityKind::Process);
        assert!(cache.is_empty());
        assert!(cache.remove(EntityKind::Process, EntityId::new(1)).is_none());
    }

    #[test]
    fn test_preload_rebuilds_back_references() {
        let dao = InMemoryPersistence::new();
        let mut data = DataTag::new(EntityId::new(100), "in");
        // Stale back-reference stored with the row; discarded on rebuild.
        data.common.rule_ids.insert(EntityId::new(999));
        dao.seed(Entity::DataTag(data));
        dao.seed(Entity::RuleTag(RuleTag::new(EntityId::new(200), "r", "#100 > 1")));
        dao.seed(Entity::Alarm(Alarm::new(EntityId::new(300), EntityId::new(100), "FF", "FM", 1)));

        let cache = EntityCache::default();
        let summary = cache.preload(&dao).unwrap();
        assert_eq!(summary.total(), 3);
        assert!(summary.dangling.is_empty());

        let tag = cache.tags().get(EntityId::new(100)).unwrap();
        assert_eq!(tag.rule_ids().iter().copied().collect::<Vec<_>>(), vec![EntityId::new(200)]);
        assert!(tag.alarm_ids().contains(&EntityId::new(300)));
    }

    #[test]
    fn test_preload_reports_dangling_rule_input() {
        let dao = InMemoryPersistence::new();
        dao.seed(Entity::RuleTag(RuleTag::new(EntityId::new(200), "r", "#404")));
        let cache = EntityCache::default();
        let summary = cache.preload(&dao).unwrap();
        assert_eq!(summary.dangling.len(), 1);
        assert!(cache.tags().contains(EntityId::new(200)));
    }
}
