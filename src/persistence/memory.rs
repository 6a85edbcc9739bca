//! In-memory persistence adapter.
//!
//! Reference implementation of [`PersistenceAdapter`] for embedded use and
//! tests. Failure injection is built in: register a [`FailPoint`] and the
//! matching call fails before touching any row.

use std::collections::BTreeMap;

use parking_lot::{Mutex, RwLock};

use super::traits::{PersistenceAdapter, PersistenceError, PersistenceOp};
use crate::entity::{Entity, EntityId, EntityKind};

type Rows = BTreeMap<(EntityKind, EntityId), Entity>;

/// Selects the calls an injected failure applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailPoint {
    pub op: PersistenceOp,
    /// `None` matches any kind.
    pub kind: Option<EntityKind>,
    /// `None` matches any id.
    pub id: Option<EntityId>,
    /// Fail this many matching calls, then disarm. `None` never disarms.
    pub remaining: Option<u32>,
    /// Report the failure as transient.
    pub transient: bool,
}

impl FailPoint {
    fn matches(&self, op: PersistenceOp, kind: EntityKind, id: EntityId) -> bool {
        self.op == op && self.kind.map_or(true, |k| k == kind) && self.id.map_or(true, |i| i == id)
    }
}

/// One adapter call, as recorded in the journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub op: PersistenceOp,
    pub kind: EntityKind,
    pub id: EntityId,
    pub succeeded: bool,
}

/// Thread-safe in-memory adapter.
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    rows: RwLock<Rows>,
    fail_points: Mutex<Vec<FailPoint>>,
    journal: Mutex<Vec<JournalEntry>>,
}

impl InMemoryPersistence {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a row directly, bypassing fail points and the journal.
    pub fn seed(&self, entity: Entity) {
        self.rows.write().insert((entity.kind(), entity.id()), entity);
    }

    /// Current durable copy of an entity.
    #[must_use]
    pub fn get(&self, kind: EntityKind, id: EntityId) -> Option<Entity> {
        self.rows.read().get(&(kind, id)).cloned()
    }

    #[must_use]
    pub fn contains(&self, kind: EntityKind, id: EntityId) -> bool {
        self.rows.read().contains_key(&(kind, id))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    /// Fails the next matching call once.
    pub fn fail_next(&self, op: PersistenceOp, kind: EntityKind, id: EntityId) {
        self.add_fail_point(FailPoint {
            op,
            kind: Some(kind),
            id: Some(id),
            remaining: Some(1),
            transient: false,
        });
    }

    pub fn add_fail_point(&self, point: FailPoint) {
        self.fail_points.lock().push(point);
    }

    pub fn clear_fail_points(&self) {
        self.fail_points.lock().clear();
    }

    /// Every call made so far, in order.
    #[must_use]
    pub fn journal(&self) -> Vec<JournalEntry> {
        self.journal.lock().clone()
    }

    fn check_fail_points(
        &self,
        op: PersistenceOp,
        kind: EntityKind,
        id: EntityId,
    ) -> Result<(), PersistenceError> {
        let mut points = self.fail_points.lock();
        let Some(pos) = points.iter().position(|p| p.matches(op, kind, id)) else {
            return Ok(());
        };
        let transient = points[pos].transient;
        if let Some(remaining) = points[pos].remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                points.remove(pos);
            }
        }
        let message = format!("injected {op} failure for {kind} {id}");
        if transient {
            Err(PersistenceError::Unavailable(message))
        } else {
            Err(PersistenceError::Rejected(message))
        }
    }

    fn record(
        &self,
        op: PersistenceOp,
        kind: EntityKind,
        id: EntityId,
        result: &Result<(), PersistenceError>,
    ) {
        self.journal.lock().push(JournalEntry {
            op,
            kind,
            id,
            succeeded: result.is_ok(),
        });
    }

    fn apply(
        &self,
        op: PersistenceOp,
        kind: EntityKind,
        id: EntityId,
        write: impl FnOnce(&mut Rows) -> Result<(), PersistenceError>,
    ) -> Result<(), PersistenceError> {
        let result = self
            .check_fail_points(op, kind, id)
            .and_then(|()| write(&mut *self.rows.write()));
        self.record(op, kind, id, &result);
        result
    }
}

impl PersistenceAdapter for InMemoryPersistence {
    fn load_all(&self, kind: EntityKind) -> Result<Vec<Entity>, PersistenceError> {
        Ok(self
            .rows
            .read()
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|(_, e)| e.clone())
            .collect())
    }

    fn insert(&self, entity: &Entity) -> Result<(), PersistenceError> {
        let (kind, id) = (entity.kind(), entity.id());
        self.apply(PersistenceOp::Insert, kind, id, |rows| {
            if rows.contains_key(&(kind, id)) {
                return Err(PersistenceError::Duplicate { kind, id });
            }
            rows.insert((kind, id), entity.clone());
            Ok(())
        })
    }

    fn update(&self, entity: &Entity, _changed_fields: &[String]) -> Result<(), PersistenceError> {
        let (kind, id) = (entity.kind(), entity.id());
        self.apply(PersistenceOp::Update, kind, id, |rows| match rows.get_mut(&(kind, id)) {
            Some(row) => {
                *row = entity.clone();
                Ok(())
            }
            None => Err(PersistenceError::Missing { kind, id }),
        })
    }

    fn delete(&self, kind: EntityKind, id: EntityId) -> Result<(), PersistenceError> {
        self.apply(PersistenceOp::Delete, kind, id, |rows| {
            rows.remove(&(kind, id));
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{DataTag, Process};

    fn tag(raw: u64) -> Entity {
        Entity::DataTag(DataTag::new(EntityId::new(raw), "t"))
    }

    #[test]
    fn test_insert_update_delete() {
        let dao = InMemoryPersistence::new();
        dao.insert(&tag(1)).unwrap();
        assert!(matches!(dao.insert(&tag(1)), Err(PersistenceError::Duplicate { .. })));
        dao.update(&tag(1), &["name".to_string()]).unwrap();
        dao.delete(EntityKind::DataTag, EntityId::new(1)).unwrap();
        assert!(dao.is_empty());
        assert!(matches!(
            dao.update(&tag(1), &[]),
            Err(PersistenceError::Missing { .. })
        ));
        // Deleting an absent row is not an error.
        dao.delete(EntityKind::DataTag, EntityId::new(1)).unwrap();
    }

    #[test]
    fn test_fail_next_fires_once() {
        let dao = InMemoryPersistence::new();
        dao.fail_next(PersistenceOp::Insert, EntityKind::DataTag, EntityId::new(2));
        dao.insert(&tag(1)).unwrap();
        let err = dao.insert(&tag(2)).unwrap_err();
        assert!(!err.is_transient());
        assert!(!dao.contains(EntityKind::DataTag, EntityId::new(2)));
        dao.insert(&tag(2)).unwrap();

        let journal = dao.journal();
        assert_eq!(journal.len(), 3);
        assert!(!journal[1].succeeded);
        assert!(journal[2].succeeded);
    }

    #[test]
    fn test_persistent_transient_fail_point() {
        let dao = InMemoryPersistence::new();
        dao.add_fail_point(FailPoint {
            op: PersistenceOp::Delete,
            kind: None,
            id: None,
            remaining: None,
            transient: true,
        });
        for _ in 0..3 {
            let err = dao.delete(EntityKind::Alarm, EntityId::new(9)).unwrap_err();
            assert!(err.is_transient());
        }
        dao.clear_fail_points();
        dao.delete(EntityKind::Alarm, EntityId::new(9)).unwrap();
    }

    #[test]
    fn test_load_all_filters_by_kind() {
        let dao = InMemoryPersistence::new();
        dao.seed(tag(1));
        dao.seed(Entity::Process(Process::new(EntityId::new(1), "P")));
        assert_eq!(dao.load_all(EntityKind::DataTag).unwrap().len(), 1);
        assert_eq!(dao.load_all(EntityKind::Process).unwrap().len(), 1);
        assert!(dao.load_all(EntityKind::Alarm).unwrap().is_empty());
        assert!(dao.journal().is_empty());
    }
}
