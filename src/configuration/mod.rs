//! Configuration transaction engine.
//!
//! Every [`ConfigurationElement`] runs as one root [`Transaction`]:
//!
//! 1. the primary key is locked (create: the new id, update/remove: the
//!    existing one);
//! 2. the handler for the element's kind validates, persists and applies its
//!    steps, registering a compensation for each;
//! 3. on success the transaction commits, the held locks are released and the
//!    queued changes are published to cache listeners; on failure the
//!    compensations run newest first before the locks are released.
//!
//! Removals cascade to dependents before the entity itself goes; each
//! cascaded removal runs in a nested scope (see
//! [`EngineConfig::cascade_propagation`]) and is reported as a sub-report.
//!
//! Locks are always taken dependent first, owner second (rule before input
//! tag, alarm before tag, tag before equipment before process).

mod alarm_handler;
mod element;
mod properties;
mod rule_handler;
mod supervision_handler;
mod tag_handler;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

pub use element::{
    Action, Configuration, ConfigurationElement, ConfigurationElementReport, ConfigurationReport,
    FailureClass, ReportStatus,
};

use self::properties::Properties;
use crate::config::EngineConfig;
use crate::entity::{Entity, EntityId, EntityKind};
use crate::error::{TagCoreError, TagCoreResult, ValidationError};
use crate::graph::{DependencyGraph, TagGateway};
use crate::persistence::{PersistenceAdapter, RollbackOutcome, Transaction};
use crate::store::{CacheChange, EntityCache, PreloadSummary, StoreError, WriteLock};

/// Locks held by one transaction scope, released after it finishes.
type Held<'a> = Vec<WriteLock<'a>>;

/// Work that runs only after the root transaction has committed.
#[must_use]
enum AfterCommit {
    Nothing,
    /// Recompute the supervision ids of every rule reading this one.
    RefreshDependents(EntityId),
}

/// Parent → child sets of the supervision tree.
#[derive(Debug, Clone, Copy)]
enum ParentLink {
    ProcessEquipment,
    EquipmentSubEquipment,
    EquipmentDataTag,
}

impl ParentLink {
    const fn parent_kind(self) -> EntityKind {
        match self {
            Self::ProcessEquipment => EntityKind::Process,
            Self::EquipmentSubEquipment | Self::EquipmentDataTag => EntityKind::Equipment,
        }
    }

    /// Adds or drops `child` in the parent's set. Needs the parent's lock.
    fn set(self, cache: &EntityCache, parent: EntityId, child: EntityId, present: bool) -> Result<(), StoreError> {
        let toggle = |ids: &mut BTreeSet<EntityId>| {
            if present {
                ids.insert(child);
            } else {
                ids.remove(&child);
            }
        };
        match self {
            Self::ProcessEquipment => cache.processes().modify(parent, |p| toggle(&mut p.equipment_ids)),
            Self::EquipmentSubEquipment => {
                cache.equipment().modify(parent, |e| toggle(&mut e.sub_equipment_ids))
            }
            Self::EquipmentDataTag => cache.equipment().modify(parent, |e| toggle(&mut e.data_tag_ids)),
        }
    }
}

/// Applies configuration elements to the cache and the durable store.
///
/// Never returns an error: every outcome, including internal failures, is
/// folded into a [`ConfigurationElementReport`].
pub struct ConfigurationEngine {
    cache: Arc<EntityCache>,
    dao: Arc<dyn PersistenceAdapter>,
    gateway: Arc<dyn TagGateway>,
    graph: DependencyGraph,
    config: EngineConfig,
    quarantine: Mutex<BTreeSet<(EntityKind, EntityId)>>,
}

impl fmt::Debug for ConfigurationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigurationEngine")
            .field("cached", &self.cache.len())
            .field("config", &self.config)
            .field("quarantined", &self.quarantine.lock().len())
            .finish_non_exhaustive()
    }
}

impl ConfigurationEngine {
    /// Creates an engine whose edge updates go through a [`DependencyGraph`]
    /// over `cache`.
    #[must_use]
    pub fn new(cache: Arc<EntityCache>, dao: Arc<dyn PersistenceAdapter>, config: EngineConfig) -> Self {
        let gateway: Arc<dyn TagGateway> = Arc::new(DependencyGraph::new(Arc::clone(&cache)));
        Self::with_gateway(cache, dao, gateway, config)
    }

    /// Creates an engine with an explicit tag gateway.
    ///
    /// The cache's key locks take their bound from `config.lock_timeout_ms`
    /// from here on.
    #[must_use]
    pub fn with_gateway(
        cache: Arc<EntityCache>,
        dao: Arc<dyn PersistenceAdapter>,
        gateway: Arc<dyn TagGateway>,
        config: EngineConfig,
    ) -> Self {
        cache.set_lock_timeout(config.lock_timeout());
        let graph = DependencyGraph::new(Arc::clone(&cache));
        Self {
            cache,
            dao,
            gateway,
            graph,
            config,
            quarantine: Mutex::new(BTreeSet::new()),
        }
    }

    #[must_use]
    pub const fn cache(&self) -> &Arc<EntityCache> {
        &self.cache
    }

    #[must_use]
    pub const fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Loads the cache from the durable store.
    pub fn preload(&self) -> TagCoreResult<PreloadSummary> {
        self.cache.preload(self.dao.as_ref())
    }

    /// Entities whose post-commit derived step failed and that need an
    /// operator (or a later successful update/remove) to recover.
    #[must_use]
    pub fn quarantined(&self) -> Vec<(EntityKind, EntityId)> {
        self.quarantine.lock().iter().copied().collect()
    }

    #[must_use]
    pub fn is_quarantined(&self, kind: EntityKind, id: EntityId) -> bool {
        self.quarantine.lock().contains(&(kind, id))
    }

    /// Applies every element in order. A failed element does not stop the
    /// batch; the batch status is the worst element status.
    pub fn apply_configuration(&self, configuration: &Configuration) -> ConfigurationReport {
        info!(
            configuration = configuration.id,
            name = %configuration.name,
            elements = configuration.elements.len(),
            "applying configuration"
        );
        let element_reports: Vec<ConfigurationElementReport> =
            configuration.elements.iter().map(|e| self.apply(e)).collect();
        let status = element_reports
            .iter()
            .map(|r| r.status)
            .max()
            .unwrap_or(ReportStatus::Ok);
        info!(configuration = configuration.id, status = ?status, "configuration applied");
        ConfigurationReport {
            id: configuration.id,
            name: configuration.name.clone(),
            status,
            element_reports,
        }
    }

    /// Applies one element as a single transaction.
    pub fn apply(&self, element: &ConfigurationElement) -> ConfigurationElementReport {
        let (action, kind, id) = (element.action, element.entity_kind, element.entity_id);
        debug!(action = %action, kind = %kind, id = %id, "applying configuration element");

        let mut report = ConfigurationElementReport::for_element(element);
        let mut tx = Transaction::begin(Arc::clone(&self.dao));
        let mut held = Held::new();

        match self.dispatch(element, &mut tx, &mut held, &mut report) {
            Ok(after) => {
                let changes = tx.commit();
                drop(held);
                self.cache.listeners().publish(&changes);
                if action != Action::Create {
                    self.clear_quarantine(kind, id);
                }
                self.clear_cascaded_quarantine(&report);
                if let AfterCommit::RefreshDependents(rule_id) = after {
                    self.refresh_dependent_rules(rule_id, &mut report);
                }
            }
            Err(err) => {
                let applied = tx.step_count();
                let outcome = tx.rollback();
                drop(held);
                if applied == 0 && !err.is_aborted() {
                    warn!(action = %action, kind = %kind, id = %id, error = %err, "configuration action rejected");
                    report.fail(&err);
                } else {
                    let err = into_aborted(err, &outcome);
                    error!(
                        action = %action,
                        kind = %kind,
                        id = %id,
                        error = %err,
                        outcome = %outcome,
                        "configuration action failed; transaction rolled back"
                    );
                    report.fail_rolled_back(&err, &outcome);
                }
            }
        }
        report
    }

    fn dispatch<'a>(
        &'a self,
        element: &ConfigurationElement,
        tx: &mut Transaction<'_>,
        held: &mut Held<'a>,
        report: &mut ConfigurationElementReport,
    ) -> TagCoreResult<AfterCommit> {
        let (kind, id) = (element.entity_kind, element.entity_id);
        match element.action {
            Action::Create => {
                let props = Properties::new(kind, &element.properties)?;
                self.create_entity(kind, id, &props, tx, held)?;
                Ok(AfterCommit::Nothing)
            }
            Action::Update => {
                let props = Properties::new(kind, &element.properties)?;
                self.update_entity(kind, id, &props, tx, held)
            }
            Action::Remove => {
                self.remove_entity(kind, id, tx, held, report)?;
                Ok(AfterCommit::Nothing)
            }
        }
    }

    fn create_entity<'a>(
        &'a self,
        kind: EntityKind,
        id: EntityId,
        props: &Properties<'_>,
        tx: &mut Transaction<'_>,
        held: &mut Held<'a>,
    ) -> TagCoreResult<()> {
        match kind {
            EntityKind::DataTag => self.create_data_tag(id, props, tx, held),
            EntityKind::RuleTag => self.create_rule(id, props, tx, held),
            EntityKind::ControlTag => self.create_control_tag(id, props, tx, held),
            EntityKind::Alarm => self.create_alarm(id, props, tx, held),
            EntityKind::Process => self.create_process(id, props, tx, held),
            EntityKind::Equipment => self.create_equipment(id, props, tx, held),
            EntityKind::SubEquipment => self.create_sub_equipment(id, props, tx, held),
        }
    }

    fn update_entity<'a>(
        &'a self,
        kind: EntityKind,
        id: EntityId,
        props: &Properties<'_>,
        tx: &mut Transaction<'_>,
        held: &mut Held<'a>,
    ) -> TagCoreResult<AfterCommit> {
        match kind {
            EntityKind::RuleTag => return self.update_rule(id, props, tx, held),
            EntityKind::DataTag => self.update_data_tag(id, props, tx, held),
            EntityKind::ControlTag => self.update_control_tag(id, props, tx, held),
            EntityKind::Alarm => self.update_alarm(id, props, tx, held),
            EntityKind::Process => self.update_process(id, props, tx, held),
            EntityKind::Equipment => self.update_equipment(id, props, tx, held),
            EntityKind::SubEquipment => self.update_sub_equipment(id, props, tx, held),
        }?;
        Ok(AfterCommit::Nothing)
    }

    fn remove_entity<'a>(
        &'a self,
        kind: EntityKind,
        id: EntityId,
        tx: &mut Transaction<'_>,
        held: &mut Held<'a>,
        report: &mut ConfigurationElementReport,
    ) -> TagCoreResult<()> {
        match kind {
            EntityKind::DataTag | EntityKind::RuleTag | EntityKind::ControlTag => {
                self.remove_tag(kind, id, tx, held, report)
            }
            EntityKind::Alarm => self.remove_alarm(id, tx, held, report),
            EntityKind::Process => self.remove_process(id, tx, held, report),
            EntityKind::Equipment => self.remove_equipment(id, tx, held, report),
            EntityKind::SubEquipment => self.remove_sub_equipment(id, tx, held, report),
        }
    }

    /// Removes a dependent in a nested scope and records its sub-report.
    ///
    /// A failure rolls the nested scope back and aborts the caller.
    fn remove_cascaded<'a>(
        &'a self,
        kind: EntityKind,
        id: EntityId,
        tx: &mut Transaction<'_>,
        held: &mut Held<'a>,
        report: &mut ConfigurationElementReport,
    ) -> TagCoreResult<()> {
        debug!(kind = %kind, id = %id, parent = %report.entity_id, "cascading removal");
        let mut sub = ConfigurationElementReport::new(Action::Remove, kind, id);
        let mut child = tx.nested(self.config.cascade_propagation);
        // A joined scope is finalized by the parent, so its locks must
        // outlive this call.
        let joined = !child.is_root();
        let mut child_held = Held::new();

        match self.remove_entity(kind, id, &mut child, &mut child_held, &mut sub) {
            Ok(()) => {
                let changes = child.commit();
                if joined {
                    held.append(&mut child_held);
                }
                drop(child_held);
                self.cache.listeners().publish(&changes);
                // Joined removals only become final with the outer commit.
                if !joined {
                    self.clear_quarantine(kind, id);
                    self.clear_cascaded_quarantine(&sub);
                }
                report.add_sub_report(sub);
                Ok(())
            }
            Err(err) => {
                let outcome = child.rollback();
                if joined {
                    held.append(&mut child_held);
                }
                drop(child_held);
                sub.fail_rolled_back(&err, &outcome);
                report.add_sub_report(sub);
                let rollback_complete = outcome.is_complete()
                    && !matches!(err, TagCoreError::TransactionAborted { rollback_complete: false, .. });
                Err(TagCoreError::aborted(
                    format!("cascaded removal of {kind} {id} failed: {err}"),
                    rollback_complete,
                ))
            }
        }
    }

    fn lock_into<'a>(&'a self, held: &mut Held<'a>, kind: EntityKind, id: EntityId) -> TagCoreResult<()> {
        held.push(self.cache.lock(kind, id)?);
        Ok(())
    }

    fn ensure_absent(&self, kind: EntityKind, id: EntityId) -> TagCoreResult<()> {
        let exists = if kind.is_tag() {
            self.cache.tags().contains(id)
        } else {
            self.cache.contains(kind, id)
        };
        if exists {
            return Err(ValidationError::AlreadyExists { kind, id }.into());
        }
        Ok(())
    }

    /// Soft outcome of removing something that is not there.
    fn missing_on_remove(kind: EntityKind, id: EntityId, report: &mut ConfigurationElementReport) {
        warn!(kind = %kind, id = %id, "attempted to remove an entity that does not exist; nothing to do");
        report.warn(format!("{kind} {id} does not exist; nothing removed"));
    }

    fn cache_created(&self, tx: &mut Transaction<'_>, entity: Entity) {
        let (kind, id) = (entity.kind(), entity.id());
        self.cache.put_quiet(entity.clone());
        let cache = Arc::clone(&self.cache);
        tx.on_rollback(format!("cache {kind} {id}"), move || {
            cache.remove(kind, id);
            Ok(())
        });
        tx.on_commit(CacheChange::Created { entity });
    }

    fn cache_replaced(&self, tx: &mut Transaction<'_>, before: Entity, after: Entity) {
        let label = format!("cache update {} {}", after.kind(), after.id());
        self.cache.put_quiet(after.clone());
        let cache = Arc::clone(&self.cache);
        tx.on_rollback(label, move || {
            cache.put_quiet(before);
            Ok(())
        });
        tx.on_commit(CacheChange::Updated { entity: after });
    }

    fn cache_removed(&self, tx: &mut Transaction<'_>, entity: Entity) {
        let (kind, id) = (entity.kind(), entity.id());
        self.cache.remove(kind, id);
        let cache = Arc::clone(&self.cache);
        tx.on_rollback(format!("uncache {kind} {id}"), move || {
            cache.put_quiet(entity);
            Ok(())
        });
        tx.on_commit(CacheChange::Removed { kind, id });
    }

    /// Persists and caches a new version of an entity whose lock is held.
    fn replace(&self, tx: &mut Transaction<'_>, before: Entity, after: Entity, changed: &[String]) -> TagCoreResult<()> {
        tx.update(&before, &after, changed)?;
        self.cache_replaced(tx, before, after);
        Ok(())
    }

    /// Adds or drops `child` in a supervision parent's child set, locking the
    /// parent for the rest of the scope.
    fn set_parent_link<'a>(
        &'a self,
        tx: &mut Transaction<'_>,
        held: &mut Held<'a>,
        link: ParentLink,
        parent: EntityId,
        child: EntityId,
        present: bool,
    ) -> TagCoreResult<()> {
        self.lock_into(held, link.parent_kind(), parent)?;
        match link.set(&self.cache, parent, child, present) {
            Ok(()) => {}
            Err(StoreError::NotFound { .. }) if !present => {
                debug!(parent = %parent, child = %child, "parent already gone; nothing to unlink");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
        let cache = Arc::clone(&self.cache);
        tx.on_rollback(format!("{link:?} {parent} -> {child}"), move || {
            link.set(&cache, parent, child, !present).map_err(Into::into)
        });
        Ok(())
    }

    fn clear_quarantine(&self, kind: EntityKind, id: EntityId) {
        if self.quarantine.lock().remove(&(kind, id)) {
            info!(kind = %kind, id = %id, "entity released from quarantine");
        }
    }

    /// Releases every entity removed by a committed cascade under `report`.
    fn clear_cascaded_quarantine(&self, report: &ConfigurationElementReport) {
        for sub in &report.sub_reports {
            if sub.action == Action::Remove && !sub.is_failure() {
                self.clear_quarantine(sub.entity_kind, sub.entity_id);
            }
            self.clear_cascaded_quarantine(sub);
        }
    }

    /// Recomputes the supervision ids of every rule above `rule_id`, inputs
    /// before the rules reading them.
    ///
    /// Runs after commit, so nothing can be rolled back: a step that still
    /// fails after the configured retries quarantines `rule_id`.
    fn refresh_dependent_rules(&self, rule_id: EntityId, report: &mut ConfigurationElementReport) {
        let mut order = self.graph.removal_order(rule_id);
        order.reverse();
        for dependent in order.into_iter().filter(|id| *id != rule_id) {
            if let Err(err) = self.retrying(|| self.gateway.reset_supervision_ids(dependent)) {
                error!(
                    rule = %rule_id,
                    dependent = %dependent,
                    error = %err,
                    "failed to refresh supervision ids of a dependent rule; cache may be left inconsistent"
                );
                if self.config.quarantine_on_derived_failure {
                    self.quarantine.lock().insert((EntityKind::RuleTag, rule_id));
                    warn!(rule = %rule_id, "rule quarantined");
                }
                report.fail_derived(format!(
                    "committed, but refreshing dependent rule {dependent} failed: {err}; cache may be left inconsistent"
                ));
                return;
            }
        }
    }

    fn retrying(&self, mut step: impl FnMut() -> TagCoreResult<()>) -> TagCoreResult<()> {
        let mut attempt = 0;
        loop {
            match step() {
                Ok(()) => return Ok(()),
                Err(err) if attempt < self.config.derived_step_retries => {
                    attempt += 1;
                    warn!(attempt, error = %err, "derived step failed; retrying");
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Folds a failure that happened after steps were applied into
/// `TransactionAborted`.
fn into_aborted(err: TagCoreError, outcome: &RollbackOutcome) -> TagCoreError {
    match err {
        TagCoreError::TransactionAborted {
            reason,
            rollback_complete,
        } => TagCoreError::aborted(reason, rollback_complete && outcome.is_complete()),
        other => TagCoreError::aborted(other.to_string(), outcome.is_complete()),
    }
}
