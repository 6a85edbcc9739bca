//! Rule tags: creation and rewiring of rule → input edges.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::trace;

use super::properties::Properties;
use super::tag_handler::apply_common;
use super::{AfterCommit, ConfigurationEngine, Held};
use crate::entity::{parse_rule_inputs, Entity, EntityId, EntityKind, RuleTag, Tag};
use crate::error::{TagCoreResult, ValidationError};
use crate::persistence::Transaction;

impl ConfigurationEngine {
    /// Persists the rule, then registers it on every input, then caches it.
    pub(super) fn create_rule<'a>(
        &'a self,
        id: EntityId,
        props: &Properties<'_>,
        tx: &mut Transaction<'_>,
        held: &mut Held<'a>,
    ) -> TagCoreResult<()> {
        self.lock_into(held, EntityKind::RuleTag, id)?;
        self.ensure_absent(EntityKind::RuleTag, id)?;

        let name = props.required("name")?;
        let rule_text = props.required("ruleText")?;
        parse_rule_inputs(rule_text).map_err(|reference| unparseable_input(id, reference))?;
        let mut rule = RuleTag::new(id, name, rule_text);
        apply_common(&mut rule.common, props)?;
        self.lock_inputs(held, rule.rule_input_tag_ids.iter())?;
        self.check_rule_inputs(id, &rule.rule_input_tag_ids)?;
        let (processes, equipment) = self.graph.supervision_ids_of_inputs(&rule.rule_input_tag_ids);
        rule.common.process_ids = processes;
        rule.common.equipment_ids = equipment;

        let inputs = rule.rule_input_tag_ids.clone();
        let entity = Entity::RuleTag(rule);
        tx.insert(&entity)?;
        for input in inputs {
            self.link_rule(tx, input, id)?;
        }
        self.cache_created(tx, entity);
        Ok(())
    }

    /// Applies the new properties; when the rule text changes, swaps the
    /// input edges after the durable update (new edges first, then stale
    /// ones dropped).
    pub(super) fn update_rule<'a>(
        &'a self,
        id: EntityId,
        props: &Properties<'_>,
        tx: &mut Transaction<'_>,
        held: &mut Held<'a>,
    ) -> TagCoreResult<AfterCommit> {
        self.lock_into(held, EntityKind::RuleTag, id)?;
        let before = self.cache.tag_of_kind(EntityKind::RuleTag, id)?;
        let mut rule = match &before {
            Tag::Rule(rule) => rule.clone(),
            other => {
                return Err(ValidationError::KindMismatch {
                    id,
                    expected: EntityKind::RuleTag,
                    actual: other.kind(),
                }
                .into())
            }
        };
        let old_inputs = rule.rule_input_tag_ids.clone();

        apply_common(&mut rule.common, props)?;
        if props.contains("ruleText") {
            let rule_text = props.required("ruleText")?;
            parse_rule_inputs(rule_text).map_err(|reference| unparseable_input(id, reference))?;
            rule.set_rule_text(rule_text);
        }
        let new_inputs = rule.rule_input_tag_ids.clone();
        let rewired = new_inputs != old_inputs;
        if rewired {
            self.lock_inputs(held, new_inputs.symmetric_difference(&old_inputs))?;
            self.check_rule_inputs(id, &new_inputs)?;
            let (processes, equipment) = self.graph.supervision_ids_of_inputs(&new_inputs);
            rule.common.process_ids = processes;
            rule.common.equipment_ids = equipment;
        }

        let before = Entity::from(before);
        let after = Entity::RuleTag(rule);
        tx.update(&before, &after, &props.changed_fields())?;
        for input in new_inputs.difference(&old_inputs) {
            self.link_rule(tx, *input, id)?;
        }
        for input in old_inputs.difference(&new_inputs) {
            self.unlink_rule(tx, *input, id)?;
        }
        self.cache_replaced(tx, before, after);

        if rewired {
            trace!(rule = %id, added = new_inputs.difference(&old_inputs).count(), "rule inputs rewired");
            Ok(AfterCommit::RefreshDependents(id))
        } else {
            Ok(AfterCommit::Nothing)
        }
    }

    /// Locks input tags in ascending id order ahead of any durable write, so
    /// two rules rewired onto each other meet at a bounded lock wait instead
    /// of both passing the cycle check.
    fn lock_inputs<'a, 'i>(
        &'a self,
        held: &mut Held<'a>,
        inputs: impl Iterator<Item = &'i EntityId>,
    ) -> TagCoreResult<()> {
        let mut ordered: Vec<EntityId> = inputs.copied().collect();
        ordered.sort_unstable();
        for input in ordered {
            self.lock_into(held, EntityKind::DataTag, input)?;
        }
        Ok(())
    }

    /// Inputs must exist and must not lead back to the rule. Run with the
    /// inputs locked.
    fn check_rule_inputs(&self, rule_id: EntityId, inputs: &BTreeSet<EntityId>) -> Result<(), ValidationError> {
        if let Some(tag_id) = self.graph.would_create_cycle(rule_id, inputs) {
            return Err(ValidationError::DependencyCycle { rule_id, tag_id });
        }
        for input in inputs {
            if !self.cache.tags().contains(*input) {
                return Err(ValidationError::InvalidRuleInput {
                    rule_id,
                    reference: format!("#{input}"),
                    reason: "tag does not exist".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Records `rule_id` on `tag_id`; undone by dropping it again.
    pub(super) fn link_rule(&self, tx: &mut Transaction<'_>, tag_id: EntityId, rule_id: EntityId) -> TagCoreResult<()> {
        self.gateway.add_rule_to_tag(tag_id, rule_id)?;
        let gateway = Arc::clone(&self.gateway);
        tx.on_rollback(format!("add rule {rule_id} to tag {tag_id}"), move || {
            gateway.remove_rule_from_tag(tag_id, rule_id)
        });
        Ok(())
    }

    /// Drops `rule_id` from `tag_id`; undone by recording it again.
    pub(super) fn unlink_rule(&self, tx: &mut Transaction<'_>, tag_id: EntityId, rule_id: EntityId) -> TagCoreResult<()> {
        if !self.cache.tags().contains(tag_id) {
            trace!(tag = %tag_id, rule = %rule_id, "input tag already gone; nothing to unlink");
            return Ok(());
        }
        self.gateway.remove_rule_from_tag(tag_id, rule_id)?;
        let gateway = Arc::clone(&self.gateway);
        tx.on_rollback(format!("remove rule {rule_id} from tag {tag_id}"), move || {
            gateway.add_rule_to_tag(tag_id, rule_id)
        });
        Ok(())
    }
}

fn unparseable_input(rule_id: EntityId, reference: String) -> ValidationError {
    ValidationError::InvalidRuleInput {
        rule_id,
        reference,
        reason: "not a valid tag id".to_string(),
    }
}
