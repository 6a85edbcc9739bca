//! Explicit transaction scopes with compensating rollback.
//!
//! A [`Transaction`] records, for every step that succeeded, how to undo it.
//! Durable steps (`insert`, `update`, `delete`) register their inverse
//! automatically; in-memory steps register one with
//! [`Transaction::on_rollback`]. Rolling back runs the inverses newest first
//! and keeps going past failures, so a failed compensation never hides the
//! remaining ones.
//!
//! Scopes nest. [`Propagation::Required`] joins the parent: its steps and
//! queued changes belong to the parent and are only finalized by the root.
//! [`Propagation::RequiresNew`] opens an independent scope that commits or
//! rolls back on its own.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, trace, warn};

use super::traits::PersistenceAdapter;
use crate::entity::Entity;
use crate::error::TagCoreResult;
use crate::store::CacheChange;

/// How a nested scope relates to its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Propagation {
    /// Join the parent scope.
    Required,
    /// Run in a fresh scope that commits independently.
    #[default]
    RequiresNew,
}

/// An undo action for one applied step.
pub type Compensation = Box<dyn FnOnce() -> TagCoreResult<()> + Send>;

/// Result of rolling a scope back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackOutcome {
    /// Every compensation succeeded.
    Complete,
    /// Some compensations failed; the listed steps were not undone.
    Partial { failures: Vec<String> },
    /// The scope was joined to a parent, which owns the rollback.
    Deferred,
}

impl RollbackOutcome {
    /// False only when a compensation failed.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        !matches!(self, Self::Partial { .. })
    }
}

impl fmt::Display for RollbackOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Complete => f.write_str("rolled back"),
            Self::Partial { failures } => write!(f, "rollback incomplete ({})", failures.join("; ")),
            Self::Deferred => f.write_str("rollback deferred to the enclosing transaction"),
        }
    }
}

struct Step {
    label: String,
    undo: Compensation,
}

#[derive(Default)]
struct TxState {
    steps: Vec<Step>,
    committed: Vec<CacheChange>,
}

enum Scope<'p> {
    Root(TxState),
    Joined(&'p mut TxState),
}

/// One transaction scope.
///
/// Dropping an unfinished root scope rolls it back.
pub struct Transaction<'p> {
    dao: Arc<dyn PersistenceAdapter>,
    scope: Scope<'p>,
    finished: bool,
}

impl fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("root", &self.is_root())
            .field("steps", &self.step_count())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl Transaction<'static> {
    /// Opens a root scope.
    #[must_use]
    pub fn begin(dao: Arc<dyn PersistenceAdapter>) -> Self {
        trace!("transaction begin");
        Self {
            dao,
            scope: Scope::Root(TxState::default()),
            finished: false,
        }
    }
}

impl<'p> Transaction<'p> {
    /// Opens a scope nested in this one.
    pub fn nested(&mut self, propagation: Propagation) -> Transaction<'_> {
        let dao = Arc::clone(&self.dao);
        let scope = match propagation {
            Propagation::Required => Scope::Joined(self.state_mut()),
            Propagation::RequiresNew => Scope::Root(TxState::default()),
        };
        Transaction {
            dao,
            scope,
            finished: false,
        }
    }

    /// True for a scope that finalizes its own steps.
    #[must_use]
    pub const fn is_root(&self) -> bool {
        matches!(self.scope, Scope::Root(_))
    }

    /// Number of undoable steps recorded so far (including joined ones).
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.state().steps.len()
    }

    fn state(&self) -> &TxState {
        match &self.scope {
            Scope::Root(state) => state,
            Scope::Joined(state) => &**state,
        }
    }

    fn state_mut(&mut self) -> &mut TxState {
        match &mut self.scope {
            Scope::Root(state) => state,
            Scope::Joined(state) => &mut **state,
        }
    }

    /// Persists a new entity; undone by deleting it.
    pub fn insert(&mut self, entity: &Entity) -> TagCoreResult<()> {
        self.dao.insert(entity)?;
        let (kind, id) = (entity.kind(), entity.id());
        let dao = Arc::clone(&self.dao);
        self.push(format!("insert {kind} {id}"), move || {
            dao.delete(kind, id).map_err(Into::into)
        });
        Ok(())
    }

    /// Persists `after`; undone by writing `before` back.
    pub fn update(
        &mut self,
        before: &Entity,
        after: &Entity,
        changed_fields: &[String],
    ) -> TagCoreResult<()> {
        self.dao.update(after, changed_fields)?;
        let dao = Arc::clone(&self.dao);
        let before = before.clone();
        let fields = changed_fields.to_vec();
        self.push(format!("update {} {}", after.kind(), after.id()), move || {
            dao.update(&before, &fields).map_err(Into::into)
        });
        Ok(())
    }

    /// Deletes the durable copy of `before`; undone by re-inserting it.
    pub fn delete(&mut self, before: &Entity) -> TagCoreResult<()> {
        self.dao.delete(before.kind(), before.id())?;
        let dao = Arc::clone(&self.dao);
        let before = before.clone();
        self.push(format!("delete {} {}", before.kind(), before.id()), move || {
            dao.insert(&before).map_err(Into::into)
        });
        Ok(())
    }

    /// Registers the inverse of an in-memory step that just succeeded.
    pub fn on_rollback(
        &mut self,
        label: impl Into<String>,
        undo: impl FnOnce() -> TagCoreResult<()> + Send + 'static,
    ) {
        self.push(label.into(), undo);
    }

    fn push(&mut self, label: String, undo: impl FnOnce() -> TagCoreResult<()> + Send + 'static) {
        trace!(step = %label, "transaction step applied");
        self.state_mut().steps.push(Step {
            label,
            undo: Box::new(undo),
        });
    }

    /// Queues a change for cache listeners; released by the root commit.
    pub fn on_commit(&mut self, change: CacheChange) {
        self.state_mut().committed.push(change);
    }

    /// Finalizes the scope.
    ///
    /// A root scope drops its compensations and returns the queued changes
    /// for publication. A joined scope returns nothing; its work stays with
    /// the parent.
    #[must_use = "committed changes must be published to cache listeners"]
    pub fn commit(mut self) -> Vec<CacheChange> {
        self.finished = true;
        match &mut self.scope {
            Scope::Root(state) => {
                trace!(steps = state.steps.len(), "transaction commit");
                state.steps.clear();
                std::mem::take(&mut state.committed)
            }
            Scope::Joined(_) => Vec::new(),
        }
    }

    /// Undoes every recorded step, newest first.
    pub fn rollback(mut self) -> RollbackOutcome {
        self.finished = true;
        match &mut self.scope {
            Scope::Root(state) => run_compensations(state),
            Scope::Joined(_) => RollbackOutcome::Deferred,
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Scope::Root(state) = &mut self.scope {
            if !state.steps.is_empty() {
                warn!(steps = state.steps.len(), "transaction dropped without commit; rolling back");
                run_compensations(state);
            }
        }
    }
}

fn run_compensations(state: &mut TxState) -> RollbackOutcome {
    state.committed.clear();
    let mut failures = Vec::new();
    while let Some(step) = state.steps.pop() {
        trace!(step = %step.label, "compensating");
        if let Err(e) = (step.undo)() {
            error!(
                step = %step.label,
                error = %e,
                "compensation failed; cache may be left inconsistent"
            );
            failures.push(format!("{}: {e}", step.label));
        }
    }
    if failures.is_empty() {
        RollbackOutcome::Complete
    } else {
        RollbackOutcome::Partial { failures }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::entity::{DataTag, EntityId, EntityKind};
    use crate::error::TagCoreError;
    use crate::persistence::{InMemoryPersistence, PersistenceOp};

    fn tag(raw: u64) -> Entity {
        Entity::DataTag(DataTag::new(EntityId::new(raw), "t"))
    }

    fn setup() -> (Arc<InMemoryPersistence>, Arc<dyn PersistenceAdapter>) {
        let mem = Arc::new(InMemoryPersistence::new());
        let dao: Arc<dyn PersistenceAdapter> = mem.clone();
        (mem, dao)
    }

    #[test]
    fn test_rollback_undoes_durable_steps() {
        let (mem, dao) = setup();
        let mut tx = Transaction::begin(dao);
        tx.insert(&tag(1)).unwrap();
        tx.insert(&tag(2)).unwrap();
        assert_eq!(mem.len(), 2);
        assert_eq!(tx.rollback(), RollbackOutcome::Complete);
        assert!(mem.is_empty());
    }

    #[test]
    fn test_compensations_run_in_reverse_order() {
        let (_mem, dao) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut tx = Transaction::begin(dao);
        for i in 0..3 {
            let log = Arc::clone(&log);
            tx.on_rollback(format!("step {i}"), move || {
                log.lock().unwrap().push(i);
                Ok(())
            });
        }
        assert!(tx.rollback().is_complete());
        assert_eq!(*log.lock().unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn test_failed_compensation_is_partial_and_others_still_run() {
        let (_mem, dao) = setup();
        let ran = Arc::new(Mutex::new(false));
        let mut tx = Transaction::begin(dao);
        let r = Arc::clone(&ran);
        tx.on_rollback("first", move || {
            *r.lock().unwrap() = true;
            Ok(())
        });
        tx.on_rollback("second", || Err(TagCoreError::internal("boom")));
        match tx.rollback() {
            RollbackOutcome::Partial { failures } => {
                assert_eq!(failures.len(), 1);
                assert!(failures[0].starts_with("second"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(*ran.lock().unwrap());
    }

    #[test]
    fn test_required_scope_defers_to_parent() {
        let (mem, dao) = setup();
        let mut root = Transaction::begin(dao);
        {
            let mut child = root.nested(Propagation::Required);
            child.insert(&tag(1)).unwrap();
            assert!(!child.is_root());
            assert!(child.commit().is_empty());
        }
        assert_eq!(root.step_count(), 1);
        assert_eq!(root.rollback(), RollbackOutcome::Complete);
        assert!(mem.is_empty());
    }

    #[test]
    fn test_requires_new_scope_commits_independently() {
        let (mem, dao) = setup();
        let mut root = Transaction::begin(dao);
        {
            let mut child = root.nested(Propagation::RequiresNew);
            child.insert(&tag(1)).unwrap();
            child.on_commit(CacheChange::Removed {
                kind: EntityKind::DataTag,
                id: EntityId::new(1),
            });
            assert_eq!(child.commit().len(), 1);
        }
        root.insert(&tag(2)).unwrap();
        root.rollback();
        assert!(mem.contains(EntityKind::DataTag, EntityId::new(1)));
        assert!(!mem.contains(EntityKind::DataTag, EntityId::new(2)));
    }

    #[test]
    fn test_failed_step_registers_nothing() {
        let (mem, dao) = setup();
        mem.fail_next(PersistenceOp::Insert, EntityKind::DataTag, EntityId::new(1));
        let mut tx = Transaction::begin(dao);
        assert!(tx.insert(&tag(1)).unwrap_err().is_persistence());
        assert_eq!(tx.step_count(), 0);
    }

    #[test]
    fn test_drop_rolls_back_unfinished_root() {
        let (mem, dao) = setup();
        {
            let mut tx = Transaction::begin(dao);
            tx.insert(&tag(1)).unwrap();
        }
        assert!(mem.is_empty());
    }

    #[test]
    fn test_commit_releases_queued_changes_once() {
        let (_mem, dao) = setup();
        let mut tx = Transaction::begin(dao);
        tx.insert(&tag(1)).unwrap();
        tx.on_commit(CacheChange::Created { entity: tag(1) });
        let changes = tx.commit();
        assert_eq!(changes.len(), 1);
    }
}
