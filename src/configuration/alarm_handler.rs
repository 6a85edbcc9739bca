//! Alarms and their owner edge.

use std::sync::Arc;

use tracing::trace;

use super::properties::Properties;
use super::{ConfigurationElementReport, ConfigurationEngine, Held};
use crate::entity::{Alarm, Entity, EntityId, EntityKind};
use crate::error::{TagCoreResult, ValidationError};
use crate::persistence::Transaction;

fn apply_alarm_properties(alarm: &mut Alarm, props: &Properties<'_>) -> Result<(), ValidationError> {
    if props.contains("faultFamily") {
        alarm.fault_family = props.required("faultFamily")?.to_string();
    }
    if props.contains("faultMember") {
        alarm.fault_member = props.required("faultMember")?.to_string();
    }
    if let Some(code) = props.parse::<u32>("faultCode")? {
        alarm.fault_code = code;
    }
    if let Some(condition) = props.text("condition") {
        alarm.condition = condition;
    }
    if let Some(info) = props.text("info") {
        alarm.info = info;
    }
    Ok(())
}

impl ConfigurationEngine {
    pub(super) fn create_alarm<'a>(
        &'a self,
        id: EntityId,
        props: &Properties<'_>,
        tx: &mut Transaction<'_>,
        held: &mut Held<'a>,
    ) -> TagCoreResult<()> {
        self.lock_into(held, EntityKind::Alarm, id)?;
        self.ensure_absent(EntityKind::Alarm, id)?;

        let tag_id = props.required_id("tagId")?;
        if !self.cache.tags().contains(tag_id) {
            return Err(ValidationError::MissingReference {
                property: "tagId".to_string(),
                id: tag_id,
            }
            .into());
        }
        let mut alarm = Alarm::new(
            id,
            tag_id,
            props.required("faultFamily")?,
            props.required("faultMember")?,
            props.required_parse("faultCode")?,
        );
        apply_alarm_properties(&mut alarm, props)?;

        let entity = Entity::Alarm(alarm);
        tx.insert(&entity)?;
        self.link_alarm(tx, tag_id, id)?;
        self.cache_created(tx, entity);
        Ok(())
    }

    pub(super) fn update_alarm<'a>(
        &'a self,
        id: EntityId,
        props: &Properties<'_>,
        tx: &mut Transaction<'_>,
        held: &mut Held<'a>,
    ) -> TagCoreResult<()> {
        self.lock_into(held, EntityKind::Alarm, id)?;
        let before = self.cache.alarms().get(id)?;
        props.immutable("tagId", &before.tag_id.get())?;
        let mut after = before.clone();
        apply_alarm_properties(&mut after, props)?;
        self.replace(tx, Entity::Alarm(before), Entity::Alarm(after), &props.changed_fields())
    }

    pub(super) fn remove_alarm<'a>(
        &'a self,
        id: EntityId,
        tx: &mut Transaction<'_>,
        held: &mut Held<'a>,
        report: &mut ConfigurationElementReport,
    ) -> TagCoreResult<()> {
        self.lock_into(held, EntityKind::Alarm, id)?;
        let Some(alarm) = self.cache.alarms().try_get(id) else {
            Self::missing_on_remove(EntityKind::Alarm, id, report);
            return Ok(());
        };
        self.unlink_alarm(tx, alarm.tag_id, id)?;
        let entity = Entity::Alarm(alarm);
        tx.delete(&entity)?;
        self.cache_removed(tx, entity);
        Ok(())
    }

    fn link_alarm(&self, tx: &mut Transaction<'_>, tag_id: EntityId, alarm_id: EntityId) -> TagCoreResult<()> {
        self.gateway.add_alarm_to_tag(tag_id, alarm_id)?;
        let gateway = Arc::clone(&self.gateway);
        tx.on_rollback(format!("add alarm {alarm_id} to tag {tag_id}"), move || {
            gateway.remove_alarm_from_tag(tag_id, alarm_id)
        });
        Ok(())
    }

    fn unlink_alarm(&self, tx: &mut Transaction<'_>, tag_id: EntityId, alarm_id: EntityId) -> TagCoreResult<()> {
        if !self.cache.tags().contains(tag_id) {
            trace!(tag = %tag_id, alarm = %alarm_id, "owner tag already gone; nothing to unlink");
            return Ok(());
        }
        self.gateway.remove_alarm_from_tag(tag_id, alarm_id)?;
        let gateway = Arc::clone(&self.gateway);
        tx.on_rollback(format!("remove alarm {alarm_id} from tag {tag_id}"), move || {
            gateway.add_alarm_to_tag(tag_id, alarm_id)
        });
        Ok(())
    }
}
