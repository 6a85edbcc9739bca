//! Dependency graph between rules, their input tags, and alarms.
//!
//! Edges are stored on the entities themselves: a rule lists its inputs in
//! `rule_input_tag_ids`, an alarm names its owner in `tag_id`, and each tag
//! carries the reverse sets (`rule_ids`, `alarm_ids`). [`DependencyGraph`]
//! keeps both directions consistent and answers the cascade questions the
//! configuration engine asks ("what has to go before this tag can go?").
//!
//! Handlers never mutate another handler's entities directly; they go through
//! the [`TagGateway`] seam, which the engine resolves after construction.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use thiserror::Error;
use tracing::trace;

use crate::entity::{EntityId, EntityKind, Tag};
use crate::error::{TagCoreError, TagCoreResult};
use crate::store::EntityCache;

/// Edge mutations on tags, used by the rule and alarm handlers.
///
/// Every method takes the target tag's write lock (reentrant). Removing an
/// edge from a tag that no longer exists is a no-op.
pub trait TagGateway: Send + Sync {
    /// Records `rule_id` as a dependent of `tag_id`.
    fn add_rule_to_tag(&self, tag_id: EntityId, rule_id: EntityId) -> TagCoreResult<()>;

    /// Drops `rule_id` from the dependents of `tag_id`.
    fn remove_rule_from_tag(&self, tag_id: EntityId, rule_id: EntityId) -> TagCoreResult<()>;

    /// Records `alarm_id` as owned by `tag_id`.
    fn add_alarm_to_tag(&self, tag_id: EntityId, alarm_id: EntityId) -> TagCoreResult<()>;

    /// Drops `alarm_id` from the alarms of `tag_id`.
    fn remove_alarm_from_tag(&self, tag_id: EntityId, alarm_id: EntityId) -> TagCoreResult<()>;

    /// Recomputes the process/equipment ids of a rule from its inputs.
    fn reset_supervision_ids(&self, rule_id: EntityId) -> TagCoreResult<()>;
}

/// A broken invariant of the dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphViolation {
    #[error("rule {rule_id} reads tag {tag_id}, which does not exist")]
    MissingRuleInput { rule_id: EntityId, tag_id: EntityId },

    #[error("rule {rule_id} reads tag {tag_id}, but the tag does not list the rule")]
    MissingRuleBackReference { rule_id: EntityId, tag_id: EntityId },

    #[error("tag {tag_id} lists rule {rule_id}, which does not read it")]
    StaleRuleBackReference { tag_id: EntityId, rule_id: EntityId },

    #[error("alarm {alarm_id} belongs to tag {tag_id}, which does not exist")]
    MissingAlarmOwner { alarm_id: EntityId, tag_id: EntityId },

    #[error("alarm {alarm_id} belongs to tag {tag_id}, but the tag does not list it")]
    MissingAlarmBackReference { alarm_id: EntityId, tag_id: EntityId },

    #[error("tag {tag_id} lists alarm {alarm_id}, which belongs elsewhere")]
    StaleAlarmBackReference { tag_id: EntityId, alarm_id: EntityId },

    #[error("{kind} {id} names parent {parent_kind} {parent_id}, which does not exist")]
    MissingParent {
        kind: EntityKind,
        id: EntityId,
        parent_kind: EntityKind,
        parent_id: EntityId,
    },
}

/// Graph queries and edge maintenance over the entity cache.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    cache: Arc<EntityCache>,
}

impl DependencyGraph {
    #[must_use]
    pub const fn new(cache: Arc<EntityCache>) -> Self {
        Self { cache }
    }

    /// Rules that read `tag_id` directly.
    #[must_use]
    pub fn dependent_rules(&self, tag_id: EntityId) -> BTreeSet<EntityId> {
        self.cache
            .tags()
            .try_get(tag_id)
            .map(|t| t.rule_ids().clone())
            .unwrap_or_default()
    }

    /// Alarms owned by `tag_id`.
    #[must_use]
    pub fn dependent_alarms(&self, tag_id: EntityId) -> BTreeSet<EntityId> {
        self.cache
            .tags()
            .try_get(tag_id)
            .map(|t| t.alarm_ids().clone())
            .unwrap_or_default()
    }

    /// Order in which `tag_id` and every rule above it must be removed.
    ///
    /// Dependents come first; each id appears once, `tag_id` last.
    #[must_use]
    pub fn removal_order(&self, tag_id: EntityId) -> Vec<EntityId> {
        let mut order = Vec::new();
        let mut seen = HashSet::new();
        self.visit_dependents(tag_id, &mut seen, &mut order);
        order
    }

    fn visit_dependents(&self, id: EntityId, seen: &mut HashSet<EntityId>, order: &mut Vec<EntityId>) {
        if !seen.insert(id) {
            return;
        }
        for rule_id in self.dependent_rules(id) {
            self.visit_dependents(rule_id, seen, order);
        }
        order.push(id);
    }

    /// Every rule that reads `tag_id` directly or through other rules,
    /// nearest first.
    #[must_use]
    pub fn ancestor_rules(&self, tag_id: EntityId) -> Vec<EntityId> {
        let mut out = Vec::new();
        let mut seen = HashSet::from([tag_id]);
        let mut queue: VecDeque<EntityId> = self.dependent_rules(tag_id).into_iter().collect();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            out.push(id);
            queue.extend(self.dependent_rules(id));
        }
        out
    }

    /// Returns the first input that would close a cycle if `rule_id` read
    /// `inputs`.
    #[must_use]
    pub fn would_create_cycle(&self, rule_id: EntityId, inputs: &BTreeSet<EntityId>) -> Option<EntityId> {
        if inputs.contains(&rule_id) {
            return Some(rule_id);
        }
        let above: HashSet<EntityId> = self.ancestor_rules(rule_id).into_iter().collect();
        inputs.iter().copied().find(|input| above.contains(input))
    }

    /// Checks every edge in both directions.
    #[must_use]
    pub fn verify(&self) -> Vec<GraphViolation> {
        let tags: HashMap<EntityId, Tag> = self
            .cache
            .tags()
            .snapshot()
            .into_iter()
            .map(|t| (t.id(), t))
            .collect();
        let alarms = self.cache.alarms().snapshot();
        let mut violations = Vec::new();

        for tag in tags.values() {
            if let Some(rule) = tag.as_rule() {
                for input in &rule.rule_input_tag_ids {
                    match tags.get(input) {
                        None => violations.push(GraphViolation::MissingRuleInput {
                            rule_id: tag.id(),
                            tag_id: *input,
                        }),
                        Some(t) if !t.rule_ids().contains(&tag.id()) => {
                            violations.push(GraphViolation::MissingRuleBackReference {
                                rule_id: tag.id(),
                                tag_id: *input,
                            });
                        }
                        Some(_) => {}
                    }
                }
            }
            for rule_id in tag.rule_ids() {
                let reads_tag = tags
                    .get(rule_id)
                    .and_then(Tag::as_rule)
                    .is_some_and(|r| r.rule_input_tag_ids.contains(&tag.id()));
                if !reads_tag {
                    violations.push(GraphViolation::StaleRuleBackReference {
                        tag_id: tag.id(),
                        rule_id: *rule_id,
                    });
                }
            }
            for alarm_id in tag.alarm_ids() {
                let owned = alarms.iter().any(|a| a.id == *alarm_id && a.tag_id == tag.id());
                if !owned {
                    violations.push(GraphViolation::StaleAlarmBackReference {
                        tag_id: tag.id(),
                        alarm_id: *alarm_id,
                    });
                }
            }
        }

        for alarm in &alarms {
            match tags.get(&alarm.tag_id) {
                None => violations.push(GraphViolation::MissingAlarmOwner {
                    alarm_id: alarm.id,
                    tag_id: alarm.tag_id,
                }),
                Some(t) if !t.alarm_ids().contains(&alarm.id) => {
                    violations.push(GraphViolation::MissingAlarmBackReference {
                        alarm_id: alarm.id,
                        tag_id: alarm.tag_id,
                    });
                }
                Some(_) => {}
            }
        }

        violations.sort_by_key(ToString::to_string);
        violations
    }

    /// Rebuilds every back-reference from the forward references.
    pub fn rebuild_back_references(&self) -> Vec<GraphViolation> {
        rebuild_back_references(&self.cache)
    }

    /// Process and equipment ids a rule inherits from its inputs.
    pub fn supervision_ids_of_inputs(
        &self,
        inputs: &BTreeSet<EntityId>,
    ) -> (BTreeSet<EntityId>, BTreeSet<EntityId>) {
        let mut processes = BTreeSet::new();
        let mut equipment = BTreeSet::new();
        for input in inputs {
            if let Some(tag) = self.cache.tags().try_get(*input) {
                processes.extend(tag.common().process_ids.iter().copied());
                equipment.extend(tag.common().equipment_ids.iter().copied());
            }
        }
        (processes, equipment)
    }

    fn modify_tag(&self, tag_id: EntityId, f: impl FnOnce(&mut Tag)) -> TagCoreResult<bool> {
        let tags = self.cache.tags();
        let _guard = tags.acquire_write_lock(tag_id)?;
        if !tags.contains(tag_id) {
            return Ok(false);
        }
        tags.modify(tag_id, f)?;
        Ok(true)
    }
}

impl TagGateway for DependencyGraph {
    fn add_rule_to_tag(&self, tag_id: EntityId, rule_id: EntityId) -> TagCoreResult<()> {
        trace!(tag = %tag_id, rule = %rule_id, "adding rule back-reference");
        let found = self.modify_tag(tag_id, |t| {
            t.common_mut().rule_ids.insert(rule_id);
        })?;
        if found {
            Ok(())
        } else {
            Err(TagCoreError::not_found(EntityKind::DataTag, tag_id))
        }
    }

    fn remove_rule_from_tag(&self, tag_id: EntityId, rule_id: EntityId) -> TagCoreResult<()> {
        trace!(tag = %tag_id, rule = %rule_id, "removing rule back-reference");
        self.modify_tag(tag_id, |t| {
            t.common_mut().rule_ids.remove(&rule_id);
        })?;
        Ok(())
    }

    fn add_alarm_to_tag(&self, tag_id: EntityId, alarm_id: EntityId) -> TagCoreResult<()> {
        trace!(tag = %tag_id, alarm = %alarm_id, "adding alarm back-reference");
        let found = self.modify_tag(tag_id, |t| {
            t.common_mut().alarm_ids.insert(alarm_id);
        })?;
        if found {
            Ok(())
        } else {
            Err(TagCoreError::not_found(EntityKind::DataTag, tag_id))
        }
    }

    fn remove_alarm_from_tag(&self, tag_id: EntityId, alarm_id: EntityId) -> TagCoreResult<()> {
        trace!(tag = %tag_id, alarm = %alarm_id, "removing alarm back-reference");
        self.modify_tag(tag_id, |t| {
            t.common_mut().alarm_ids.remove(&alarm_id);
        })?;
        Ok(())
    }

    fn reset_supervision_ids(&self, rule_id: EntityId) -> TagCoreResult<()> {
        let rule = self.cache.tag_of_kind(EntityKind::RuleTag, rule_id)?;
        let (processes, equipment) = self.supervision_ids_of_inputs(&rule.input_tag_ids());
        self.modify_tag(rule_id, |t| {
            let common = t.common_mut();
            common.process_ids = processes;
            common.equipment_ids = equipment;
        })?;
        Ok(())
    }
}

/// Derives every back-reference and supervision id from forward references.
///
/// Runs without key locks; only valid while no transaction is active.
pub(crate) fn rebuild_back_references(cache: &EntityCache) -> Vec<GraphViolation> {
    let mut violations = Vec::new();
    let mut tags: HashMap<EntityId, Tag> = cache
        .tags()
        .snapshot()
        .into_iter()
        .map(|mut t| {
            let common = t.common_mut();
            common.rule_ids.clear();
            common.alarm_ids.clear();
            common.process_ids.clear();
            common.equipment_ids.clear();
            (t.id(), t)
        })
        .collect();
    let mut processes = cache.processes().snapshot();
    let mut equipment = cache.equipment().snapshot();
    let sub_equipment = cache.sub_equipment().snapshot();

    for process in &mut processes {
        process.equipment_ids.clear();
    }
    for eq in &mut equipment {
        eq.sub_equipment_ids.clear();
        eq.data_tag_ids.clear();
    }
    let process_index: HashMap<EntityId, usize> =
        processes.iter().enumerate().map(|(i, p)| (p.id, i)).collect();
    let equipment_index: HashMap<EntityId, usize> =
        equipment.iter().enumerate().map(|(i, e)| (e.id, i)).collect();

    for eq in &equipment {
        match process_index.get(&eq.process_id) {
            Some(&i) => {
                processes[i].equipment_ids.insert(eq.id);
            }
            None => violations.push(GraphViolation::MissingParent {
                kind: EntityKind::Equipment,
                id: eq.id,
                parent_kind: EntityKind::Process,
                parent_id: eq.process_id,
            }),
        }
    }
    for sub in &sub_equipment {
        match equipment_index.get(&sub.equipment_id) {
            Some(&i) => {
                equipment[i].sub_equipment_ids.insert(sub.id);
            }
            None => violations.push(GraphViolation::MissingParent {
                kind: EntityKind::SubEquipment,
                id: sub.id,
                parent_kind: EntityKind::Equipment,
                parent_id: sub.equipment_id,
            }),
        }
    }

    // Data tags: supervision ids come from their equipment.
    for tag in tags.values_mut() {
        let Tag::Data(data) = tag else { continue };
        let Some(eq_id) = data.equipment_id else { continue };
        match equipment_index.get(&eq_id) {
            Some(&i) => {
                let eq = &mut equipment[i];
                eq.data_tag_ids.insert(data.common.id);
                data.common.equipment_ids.insert(eq.id);
                data.common.process_ids.insert(eq.process_id);
            }
            None => violations.push(GraphViolation::MissingParent {
                kind: EntityKind::DataTag,
                id: data.common.id,
                parent_kind: EntityKind::Equipment,
                parent_id: eq_id,
            }),
        }
    }

    // Rule edges.
    let rule_inputs: Vec<(EntityId, BTreeSet<EntityId>)> = tags
        .values()
        .filter_map(|t| t.as_rule().map(|r| (t.id(), r.rule_input_tag_ids.clone())))
        .collect();
    for (rule_id, inputs) in &rule_inputs {
        for input in inputs {
            match tags.get_mut(input) {
                Some(t) => {
                    t.common_mut().rule_ids.insert(*rule_id);
                }
                None => violations.push(GraphViolation::MissingRuleInput {
                    rule_id: *rule_id,
                    tag_id: *input,
                }),
            }
        }
    }

    // Rule supervision ids: union over inputs, resolved depth first.
    let mut resolved: HashMap<EntityId, (BTreeSet<EntityId>, BTreeSet<EntityId>)> = HashMap::new();
    for (rule_id, _) in &rule_inputs {
        let mut visiting = HashSet::new();
        resolve_rule_supervision(*rule_id, &tags, &mut resolved, &mut visiting);
    }
    for (rule_id, (procs, eqs)) in resolved {
        if let Some(t) = tags.get_mut(&rule_id) {
            if t.as_rule().is_some() {
                let common = t.common_mut();
                common.process_ids = procs;
                common.equipment_ids = eqs;
            }
        }
    }

    // Alarm owners.
    for alarm in cache.alarms().snapshot() {
        match tags.get_mut(&alarm.tag_id) {
            Some(t) => {
                t.common_mut().alarm_ids.insert(alarm.id);
            }
            None => violations.push(GraphViolation::MissingAlarmOwner {
                alarm_id: alarm.id,
                tag_id: alarm.tag_id,
            }),
        }
    }

    for (id, tag) in tags {
        cache.tags().put_quiet(id, tag);
    }
    for process in processes {
        cache.processes().put_quiet(process.id, process);
    }
    for eq in equipment {
        cache.equipment().put_quiet(eq.id, eq);
    }
    violations
}

fn resolve_rule_supervision(
    id: EntityId,
    tags: &HashMap<EntityId, Tag>,
    resolved: &mut HashMap<EntityId, (BTreeSet<EntityId>, BTreeSet<EntityId>)>,
    visiting: &mut HashSet<EntityId>,
) -> (BTreeSet<EntityId>, BTreeSet<EntityId>) {
    if let Some(done) = resolved.get(&id) {
        return done.clone();
    }
    let Some(tag) = tags.get(&id) else {
        return Default::default();
    };
    let Some(rule) = tag.as_rule() else {
        let common = tag.common();
        return (common.process_ids.clone(), common.equipment_ids.clone());
    };
    // A stored cycle contributes nothing further.
    if !visiting.insert(id) {
        return Default::default();
    }
    let mut procs = BTreeSet::new();
    let mut eqs = BTreeSet::new();
    for input in &rule.rule_input_tag_ids {
        let (p, e) = resolve_rule_supervision(*input, tags, resolved, visiting);
        procs.extend(p);
        eqs.extend(e);
    }
    visiting.remove(&id);
    resolved.insert(id, (procs.clone(), eqs.clone()));
    (procs, eqs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Alarm, DataTag, Entity, Equipment, Process, RuleTag};

    fn id(raw: u64) -> EntityId {
        EntityId::new(raw)
    }

    fn graph_with_chain() -> DependencyGraph {
        // 100 <- 200 <- 201, 100 <- 202
        let cache = Arc::new(EntityCache::default());
        cache.put_quiet(Entity::DataTag(DataTag::new(id(100), "t")));
        cache.put_quiet(Entity::RuleTag(RuleTag::new(id(200), "r1", "#100")));
        cache.put_quiet(Entity::RuleTag(RuleTag::new(id(201), "r2", "#200 + 1")));
        cache.put_quiet(Entity::RuleTag(RuleTag::new(id(202), "r3", "#100 * 2")));
        let graph = DependencyGraph::new(cache);
        assert!(graph.rebuild_back_references().is_empty());
        graph
    }

    #[test]
    fn test_removal_order_puts_dependents_first() {
        let graph = graph_with_chain();
        let order = graph.removal_order(id(100));
        assert_eq!(order.last(), Some(&id(100)));
        let pos = |x: u64| order.iter().position(|o| *o == id(x)).unwrap();
        assert!(pos(201) < pos(200));
        assert!(pos(200) < pos(100));
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn test_ancestor_rules_are_transitive() {
        let graph = graph_with_chain();
        let above = graph.ancestor_rules(id(100));
        assert_eq!(above.len(), 3);
        assert_eq!(graph.ancestor_rules(id(200)), vec![id(201)]);
        assert!(graph.ancestor_rules(id(201)).is_empty());
    }

    #[test]
    fn test_cycle_detection() {
        let graph = graph_with_chain();
        assert_eq!(graph.would_create_cycle(id(200), &BTreeSet::from([id(201)])), Some(id(201)));
        assert_eq!(graph.would_create_cycle(id(200), &BTreeSet::from([id(200)])), Some(id(200)));
        assert_eq!(graph.would_create_cycle(id(201), &BTreeSet::from([id(202)])), None);
    }

    #[test]
    fn test_gateway_edges_keep_graph_symmetric() {
        let graph = graph_with_chain();
        graph.remove_rule_from_tag(id(100), id(202)).unwrap();
        let violations = graph.verify();
        assert_eq!(
            violations,
            vec![GraphViolation::MissingRuleBackReference {
                rule_id: id(202),
                tag_id: id(100)
            }]
        );
        graph.add_rule_to_tag(id(100), id(202)).unwrap();
        assert!(graph.verify().is_empty());
    }

    #[test]
    fn test_add_edge_to_missing_tag_fails_remove_is_noop() {
        let graph = graph_with_chain();
        assert!(graph.add_rule_to_tag(id(555), id(200)).unwrap_err().is_not_found());
        assert!(graph.remove_alarm_from_tag(id(555), id(1)).is_ok());
    }

    #[test]
    fn test_verify_flags_alarm_without_back_reference() {
        let graph = graph_with_chain();
        graph
            .cache
            .put_quiet(Entity::Alarm(Alarm::new(id(300), id(100), "FF", "FM", 1)));
        assert_eq!(
            graph.verify(),
            vec![GraphViolation::MissingAlarmBackReference {
                alarm_id: id(300),
                tag_id: id(100)
            }]
        );
        graph.add_alarm_to_tag(id(100), id(300)).unwrap();
        assert!(graph.verify().is_empty());
    }

    #[test]
    fn test_supervision_ids_flow_up_rules() {
        let cache = Arc::new(EntityCache::default());
        cache.put_quiet(Entity::Process(Process::new(id(1), "P")));
        cache.put_quiet(Entity::Equipment(Equipment::new(id(10), "E", id(1))));
        let mut data = DataTag::new(id(100), "t");
        data.equipment_id = Some(id(10));
        cache.put_quiet(Entity::DataTag(data));
        cache.put_quiet(Entity::RuleTag(RuleTag::new(id(200), "r1", "#100")));
        cache.put_quiet(Entity::RuleTag(RuleTag::new(id(201), "r2", "#200")));
        let graph = DependencyGraph::new(Arc::clone(&cache));
        assert!(graph.rebuild_back_references().is_empty());

        let top = cache.tags().get(id(201)).unwrap();
        assert!(top.common().process_ids.contains(&id(1)));
        assert!(top.common().equipment_ids.contains(&id(10)));
        assert!(cache.equipment().get(id(10)).unwrap().data_tag_ids.contains(&id(100)));
        assert!(cache.processes().get(id(1)).unwrap().equipment_ids.contains(&id(10)));

        cache
            .tags()
            .put_quiet(id(201), Tag::Rule(RuleTag::new(id(201), "r2", "#200")));
        graph.reset_supervision_ids(id(201)).unwrap();
        assert!(cache.tags().get(id(201)).unwrap().common().process_ids.contains(&id(1)));
    }
}
