//! Data and control tags, and the removal path shared by every tag kind.

use std::collections::BTreeSet;

use tracing::debug;

use super::properties::Properties;
use super::{ConfigurationElementReport, ConfigurationEngine, Held, ParentLink};
use crate::entity::{ControlTag, DataTag, DataType, Entity, EntityId, EntityKind, Tag, TagCommon, TagMode};
use crate::error::{TagCoreResult, ValidationError};
use crate::persistence::Transaction;

/// Applies the properties every tag kind understands.
pub(super) fn apply_common(common: &mut TagCommon, props: &Properties<'_>) -> Result<(), ValidationError> {
    props.apply_name(&mut common.name)?;
    if let Some(description) = props.text("description") {
        common.description = description;
    }
    if let Some(data_type) = props.parse::<DataType>("dataType")? {
        common.data_type = data_type;
    }
    if let Some(mode) = props.parse::<TagMode>("mode")? {
        common.mode = mode;
    }
    for (key, value) in props.metadata() {
        if value.trim().is_empty() {
            common.metadata.remove(key);
        } else {
            common.metadata.insert(key.to_string(), value.to_string());
        }
    }
    Ok(())
}

impl ConfigurationEngine {
    pub(super) fn create_data_tag<'a>(
        &'a self,
        id: EntityId,
        props: &Properties<'_>,
        tx: &mut Transaction<'_>,
        held: &mut Held<'a>,
    ) -> TagCoreResult<()> {
        self.lock_into(held, EntityKind::DataTag, id)?;
        self.ensure_absent(EntityKind::DataTag, id)?;

        let mut tag = DataTag::new(id, props.required("name")?);
        apply_common(&mut tag.common, props)?;
        if let Some(address) = props.text("address") {
            tag.address = address;
        }
        if let Some(equipment_id) = props.id("equipmentId")? {
            let equipment = self.cache.equipment().try_get(equipment_id).ok_or_else(|| {
                ValidationError::MissingReference {
                    property: "equipmentId".to_string(),
                    id: equipment_id,
                }
            })?;
            tag.equipment_id = Some(equipment_id);
            tag.common.process_ids = BTreeSet::from([equipment.process_id]);
            tag.common.equipment_ids = BTreeSet::from([equipment_id]);
        }

        let equipment_id = tag.equipment_id;
        let entity = Entity::DataTag(tag);
        tx.insert(&entity)?;
        if let Some(equipment_id) = equipment_id {
            self.set_parent_link(tx, held, ParentLink::EquipmentDataTag, equipment_id, id, true)?;
        }
        self.cache_created(tx, entity);
        Ok(())
    }

    pub(super) fn update_data_tag<'a>(
        &'a self,
        id: EntityId,
        props: &Properties<'_>,
        tx: &mut Transaction<'_>,
        held: &mut Held<'a>,
    ) -> TagCoreResult<()> {
        self.update_plain_tag(EntityKind::DataTag, id, props, tx, held, |tag| {
            let Tag::Data(data) = tag else {
                return Ok(());
            };
            match data.equipment_id {
                Some(current) => props.immutable("equipmentId", &current.get())?,
                None if props.contains("equipmentId") => {
                    return Err(ValidationError::ImmutableProperty {
                        property: "equipmentId".to_string(),
                    });
                }
                None => {}
            }
            if let Some(address) = props.text("address") {
                data.address = address;
            }
            Ok(())
        })
    }

    pub(super) fn create_control_tag<'a>(
        &'a self,
        id: EntityId,
        props: &Properties<'_>,
        tx: &mut Transaction<'_>,
        held: &mut Held<'a>,
    ) -> TagCoreResult<()> {
        self.lock_into(held, EntityKind::ControlTag, id)?;
        self.ensure_absent(EntityKind::ControlTag, id)?;
        let mut tag = ControlTag::new(id, props.required("name")?);
        apply_common(&mut tag.common, props)?;
        let entity = Entity::ControlTag(tag);
        tx.insert(&entity)?;
        self.cache_created(tx, entity);
        Ok(())
    }

    pub(super) fn update_control_tag<'a>(
        &'a self,
        id: EntityId,
        props: &Properties<'_>,
        tx: &mut Transaction<'_>,
        held: &mut Held<'a>,
    ) -> TagCoreResult<()> {
        self.update_plain_tag(EntityKind::ControlTag, id, props, tx, held, |_| Ok(()))
    }

    /// Update of a tag whose changes never touch dependency edges.
    fn update_plain_tag<'a>(
        &'a self,
        kind: EntityKind,
        id: EntityId,
        props: &Properties<'_>,
        tx: &mut Transaction<'_>,
        held: &mut Held<'a>,
        specific: impl FnOnce(&mut Tag) -> Result<(), ValidationError>,
    ) -> TagCoreResult<()> {
        self.lock_into(held, kind, id)?;
        let before = self.cache.tag_of_kind(kind, id)?;
        let mut after = before.clone();
        apply_common(after.common_mut(), props)?;
        specific(&mut after)?;
        self.replace(tx, before.into(), after.into(), &props.changed_fields())
    }

    /// Removes a tag of any kind after everything that depends on it.
    ///
    /// Dependent rules go first (each cascading further up), then alarms.
    /// Only then is the tag itself locked; dependents that appeared in the
    /// meantime abort the removal.
    pub(super) fn remove_tag<'a>(
        &'a self,
        kind: EntityKind,
        id: EntityId,
        tx: &mut Transaction<'_>,
        held: &mut Held<'a>,
        report: &mut ConfigurationElementReport,
    ) -> TagCoreResult<()> {
        let tag = match self.cache.tag_of_kind(kind, id) {
            Ok(tag) => tag,
            Err(err) if err.is_not_found() => {
                Self::missing_on_remove(kind, id, report);
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        if !tag.rule_ids().is_empty() {
            debug!(kind = %kind, id = %id, rules = tag.rule_ids().len(), "removing dependent rules");
        }
        for rule_id in tag.rule_ids() {
            // An earlier cascade may already have taken it.
            if !self.cache.contains(EntityKind::RuleTag, *rule_id) {
                debug!(rule = %rule_id, "dependent rule already removed");
                continue;
            }
            self.remove_cascaded(EntityKind::RuleTag, *rule_id, tx, held, report)?;
        }
        for alarm_id in tag.alarm_ids() {
            if !self.cache.alarms().contains(*alarm_id) {
                continue;
            }
            self.remove_cascaded(EntityKind::Alarm, *alarm_id, tx, held, report)?;
        }

        self.lock_into(held, kind, id)?;
        let tag = match self.cache.tag_of_kind(kind, id) {
            Ok(tag) => tag,
            Err(err) if err.is_not_found() => {
                Self::missing_on_remove(kind, id, report);
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        if let Some(dependent) = tag.rule_ids().iter().chain(tag.alarm_ids()).next() {
            return Err(ValidationError::HasDependents {
                kind,
                id,
                dependent: *dependent,
            }
            .into());
        }

        for input in tag.input_tag_ids() {
            self.unlink_rule(tx, input, id)?;
        }
        if let Some(equipment_id) = tag.as_data().and_then(|d| d.equipment_id) {
            self.set_parent_link(tx, held, ParentLink::EquipmentDataTag, equipment_id, id, false)?;
        }
        let entity = Entity::from(tag);
        tx.delete(&entity)?;
        self.cache_removed(tx, entity);
        Ok(())
    }
}
