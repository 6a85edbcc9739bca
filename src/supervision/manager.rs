//! Applies external status reports to cached supervised entities.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::notifier::SupervisionNotifier;
use super::state::{SupervisionEntity, SupervisionEvent, SupervisionState, SupervisionStatus, Transition};
use crate::entity::EntityId;
use crate::error::TagCoreResult;
use crate::store::EntityCache;

/// Entry point for the acquisition/health-check layer.
///
/// Each report is applied under the entity's write lock; the resulting event
/// is built from a snapshot and handed to the notifier after the lock is
/// released.
#[derive(Debug, Clone)]
pub struct SupervisionManager {
    cache: Arc<EntityCache>,
    notifier: Arc<SupervisionNotifier>,
}

impl SupervisionManager {
    #[must_use]
    pub const fn new(cache: Arc<EntityCache>, notifier: Arc<SupervisionNotifier>) -> Self {
        Self { cache, notifier }
    }

    #[must_use]
    pub const fn notifier(&self) -> &Arc<SupervisionNotifier> {
        &self.notifier
    }

    /// Applies a status report and notifies listeners.
    ///
    /// Changes go to [`SupervisionListener::on_supervision_event`], redundant
    /// reports to [`SupervisionListener::on_heartbeat`].
    ///
    /// [`SupervisionListener::on_supervision_event`]: super::SupervisionListener::on_supervision_event
    /// [`SupervisionListener::on_heartbeat`]: super::SupervisionListener::on_heartbeat
    pub fn report_status(
        &self,
        entity: SupervisionEntity,
        id: EntityId,
        status: SupervisionStatus,
        description: Option<&str>,
        time: DateTime<Utc>,
    ) -> TagCoreResult<Transition> {
        let (transition, state) = {
            let _guard = self.cache.lock(entity.kind(), id)?;
            self.modify_state(entity, id, |state| {
                let transition = state.apply(status, description, time);
                (transition, state.clone())
            })?
        };

        let event = SupervisionEvent::from_state(entity, id, &state);
        match transition {
            Transition::Changed { from, to } => {
                debug!(entity = %entity, id = %id, from = %from, to = %to, "supervision status changed");
                self.notifier.notify(event);
            }
            Transition::Heartbeat => {
                self.notifier.notify_heartbeat(event);
            }
        }
        Ok(transition)
    }

    /// Snapshot of the current state of a supervised entity.
    pub fn current_event(&self, entity: SupervisionEntity, id: EntityId) -> TagCoreResult<SupervisionEvent> {
        let state = match entity {
            SupervisionEntity::Process => self.cache.processes().get(id)?.state,
            SupervisionEntity::Equipment => self.cache.equipment().get(id)?.state,
            SupervisionEntity::SubEquipment => self.cache.sub_equipment().get(id)?.state,
        };
        Ok(SupervisionEvent::from_state(entity, id, &state))
    }

    fn modify_state<R>(
        &self,
        entity: SupervisionEntity,
        id: EntityId,
        f: impl FnOnce(&mut SupervisionState) -> R,
    ) -> TagCoreResult<R> {
        let result = match entity {
            SupervisionEntity::Process => self.cache.processes().modify(id, |p| f(&mut p.state)),
            SupervisionEntity::Equipment => self.cache.equipment().modify(id, |e| f(&mut e.state)),
            SupervisionEntity::SubEquipment => {
                self.cache.sub_equipment().modify(id, |s| f(&mut s.state))
            }
        };
        Ok(result?)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::config::NotifierConfig;
    use crate::entity::{Entity, Process};

    fn manager() -> SupervisionManager {
        let cache = Arc::new(EntityCache::default());
        cache.put_quiet(Entity::Process(Process::new(EntityId::new(1), "P")));
        SupervisionManager::new(cache, Arc::new(SupervisionNotifier::new(NotifierConfig::default())))
    }

    #[test]
    fn test_report_status_updates_cached_state() {
        let mgr = manager();
        let t0 = Utc::now();
        let tr = mgr
            .report_status(SupervisionEntity::Process, EntityId::new(1), SupervisionStatus::Running, Some("up"), t0)
            .unwrap();
        assert!(tr.is_change());
        let tr = mgr
            .report_status(
                SupervisionEntity::Process,
                EntityId::new(1),
                SupervisionStatus::Running,
                Some("up"),
                t0 + Duration::seconds(1),
            )
            .unwrap();
        assert_eq!(tr, Transition::Heartbeat);

        let current = mgr.current_event(SupervisionEntity::Process, EntityId::new(1)).unwrap();
        assert_eq!(current.status, SupervisionStatus::Running);
        assert_eq!(current.timestamp, t0 + Duration::seconds(1));
        mgr.notifier().shutdown();
    }

    #[test]
    fn test_report_for_unknown_entity_is_not_found() {
        let mgr = manager();
        let err = mgr
            .report_status(
                SupervisionEntity::Equipment,
                EntityId::new(9),
                SupervisionStatus::Down,
                None,
                Utc::now(),
            )
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(mgr.current_event(SupervisionEntity::Equipment, EntityId::new(9)).is_err());
        mgr.notifier().shutdown();
    }
}
