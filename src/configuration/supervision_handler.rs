//! Processes, equipment and sub-equipment.
//!
//! Children register themselves in their parent's child set under the
//! parent's lock; removing a parent first removes its children.

use tracing::debug;

use super::properties::Properties;
use super::{ConfigurationElementReport, ConfigurationEngine, Held, ParentLink};
use crate::entity::{Entity, EntityId, EntityKind, Equipment, Process, SubEquipment};
use crate::error::{TagCoreResult, ValidationError};
use crate::persistence::Transaction;

fn apply_description(description: &mut Option<String>, props: &Properties<'_>) {
    if let Some(text) = props.text("description") {
        *description = text;
    }
}

fn apply_process_properties(process: &mut Process, props: &Properties<'_>) -> Result<(), ValidationError> {
    props.apply_name(&mut process.name)?;
    apply_description(&mut process.description, props);
    if let Some(interval) = props.parse::<u64>("aliveInterval")? {
        process.alive_interval_ms = Some(interval);
    }
    Ok(())
}

impl ConfigurationEngine {
    pub(super) fn create_process<'a>(
        &'a self,
        id: EntityId,
        props: &Properties<'_>,
        tx: &mut Transaction<'_>,
        held: &mut Held<'a>,
    ) -> TagCoreResult<()> {
        self.lock_into(held, EntityKind::Process, id)?;
        self.ensure_absent(EntityKind::Process, id)?;
        let mut process = Process::new(id, props.required("name")?);
        apply_process_properties(&mut process, props)?;
        let entity = Entity::Process(process);
        tx.insert(&entity)?;
        self.cache_created(tx, entity);
        Ok(())
    }

    pub(super) fn update_process<'a>(
        &'a self,
        id: EntityId,
        props: &Properties<'_>,
        tx: &mut Transaction<'_>,
        held: &mut Held<'a>,
    ) -> TagCoreResult<()> {
        self.lock_into(held, EntityKind::Process, id)?;
        let before = self.cache.processes().get(id)?;
        let mut after = before.clone();
        apply_process_properties(&mut after, props)?;
        self.replace(tx, Entity::Process(before), Entity::Process(after), &props.changed_fields())
    }

    pub(super) fn remove_process<'a>(
        &'a self,
        id: EntityId,
        tx: &mut Transaction<'_>,
        held: &mut Held<'a>,
        report: &mut ConfigurationElementReport,
    ) -> TagCoreResult<()> {
        let Some(process) = self.cache.processes().try_get(id) else {
            Self::missing_on_remove(EntityKind::Process, id, report);
            return Ok(());
        };
        for equipment_id in &process.equipment_ids {
            if self.cache.equipment().contains(*equipment_id) {
                self.remove_cascaded(EntityKind::Equipment, *equipment_id, tx, held, report)?;
            }
        }

        self.lock_into(held, EntityKind::Process, id)?;
        let Some(process) = self.cache.processes().try_get(id) else {
            Self::missing_on_remove(EntityKind::Process, id, report);
            return Ok(());
        };
        if let Some(dependent) = process.equipment_ids.first() {
            return Err(ValidationError::HasDependents {
                kind: EntityKind::Process,
                id,
                dependent: *dependent,
            }
            .into());
        }
        let entity = Entity::Process(process);
        tx.delete(&entity)?;
        self.cache_removed(tx, entity);
        Ok(())
    }

    pub(super) fn create_equipment<'a>(
        &'a self,
        id: EntityId,
        props: &Properties<'_>,
        tx: &mut Transaction<'_>,
        held: &mut Held<'a>,
    ) -> TagCoreResult<()> {
        self.lock_into(held, EntityKind::Equipment, id)?;
        self.ensure_absent(EntityKind::Equipment, id)?;
        let process_id = props.required_id("processId")?;
        if !self.cache.processes().contains(process_id) {
            return Err(ValidationError::MissingReference {
                property: "processId".to_string(),
                id: process_id,
            }
            .into());
        }
        let mut equipment = Equipment::new(id, props.required("name")?, process_id);
        apply_description(&mut equipment.description, props);

        let entity = Entity::Equipment(equipment);
        tx.insert(&entity)?;
        self.set_parent_link(tx, held, ParentLink::ProcessEquipment, process_id, id, true)?;
        self.cache_created(tx, entity);
        Ok(())
    }

    pub(super) fn update_equipment<'a>(
        &'a self,
        id: EntityId,
        props: &Properties<'_>,
        tx: &mut Transaction<'_>,
        held: &mut Held<'a>,
    ) -> TagCoreResult<()> {
        self.lock_into(held, EntityKind::Equipment, id)?;
        let before = self.cache.equipment().get(id)?;
        props.immutable("processId", &before.process_id.get())?;
        let mut after = before.clone();
        props.apply_name(&mut after.name)?;
        apply_description(&mut after.description, props);
        self.replace(tx, Entity::Equipment(before), Entity::Equipment(after), &props.changed_fields())
    }

    /// Removes sub-equipment and data tags first, then the equipment.
    pub(super) fn remove_equipment<'a>(
        &'a self,
        id: EntityId,
        tx: &mut Transaction<'_>,
        held: &mut Held<'a>,
        report: &mut ConfigurationElementReport,
    ) -> TagCoreResult<()> {
        let Some(equipment) = self.cache.equipment().try_get(id) else {
            Self::missing_on_remove(EntityKind::Equipment, id, report);
            return Ok(());
        };
        debug!(
            equipment = %id,
            sub_equipment = equipment.sub_equipment_ids.len(),
            data_tags = equipment.data_tag_ids.len(),
            "removing equipment children"
        );
        for sub_id in &equipment.sub_equipment_ids {
            if self.cache.sub_equipment().contains(*sub_id) {
                self.remove_cascaded(EntityKind::SubEquipment, *sub_id, tx, held, report)?;
            }
        }
        for tag_id in &equipment.data_tag_ids {
            if self.cache.contains(EntityKind::DataTag, *tag_id) {
                self.remove_cascaded(EntityKind::DataTag, *tag_id, tx, held, report)?;
            }
        }

        self.lock_into(held, EntityKind::Equipment, id)?;
        let Some(equipment) = self.cache.equipment().try_get(id) else {
            Self::missing_on_remove(EntityKind::Equipment, id, report);
            return Ok(());
        };
        if let Some(dependent) = equipment
            .sub_equipment_ids
            .first()
            .or_else(|| equipment.data_tag_ids.first())
        {
            return Err(ValidationError::HasDependents {
                kind: EntityKind::Equipment,
                id,
                dependent: *dependent,
            }
            .into());
        }
        self.set_parent_link(tx, held, ParentLink::ProcessEquipment, equipment.process_id, id, false)?;
        let entity = Entity::Equipment(equipment);
        tx.delete(&entity)?;
        self.cache_removed(tx, entity);
        Ok(())
    }

    pub(super) fn create_sub_equipment<'a>(
        &'a self,
        id: EntityId,
        props: &Properties<'_>,
        tx: &mut Transaction<'_>,
        held: &mut Held<'a>,
    ) -> TagCoreResult<()> {
        self.lock_into(held, EntityKind::SubEquipment, id)?;
        self.ensure_absent(EntityKind::SubEquipment, id)?;
        let equipment_id = props.required_id("equipmentId")?;
        if !self.cache.equipment().contains(equipment_id) {
            return Err(ValidationError::MissingReference {
                property: "equipmentId".to_string(),
                id: equipment_id,
            }
            .into());
        }
        let mut sub = SubEquipment::new(id, props.required("name")?, equipment_id);
        apply_description(&mut sub.description, props);

        let entity = Entity::SubEquipment(sub);
        tx.insert(&entity)?;
        self.set_parent_link(tx, held, ParentLink::EquipmentSubEquipment, equipment_id, id, true)?;
        self.cache_created(tx, entity);
        Ok(())
    }

    pub(super) fn update_sub_equipment<'a>(
        &'a self,
        id: EntityId,
        props: &Properties<'_>,
        tx: &mut Transaction<'_>,
        held: &mut Held<'a>,
    ) -> TagCoreResult<()> {
        self.lock_into(held, EntityKind::SubEquipment, id)?;
        let before = self.cache.sub_equipment().get(id)?;
        props.immutable("equipmentId", &before.equipment_id.get())?;
        let mut after = before.clone();
        props.apply_name(&mut after.name)?;
        apply_description(&mut after.description, props);
        self.replace(
            tx,
            Entity::SubEquipment(before),
            Entity::SubEquipment(after),
            &props.changed_fields(),
        )
    }

    pub(super) fn remove_sub_equipment<'a>(
        &'a self,
        id: EntityId,
        tx: &mut Transaction<'_>,
        held: &mut Held<'a>,
        report: &mut ConfigurationElementReport,
    ) -> TagCoreResult<()> {
        self.lock_into(held, EntityKind::SubEquipment, id)?;
        let Some(sub) = self.cache.sub_equipment().try_get(id) else {
            Self::missing_on_remove(EntityKind::SubEquipment, id, report);
            return Ok(());
        };
        self.set_parent_link(tx, held, ParentLink::EquipmentSubEquipment, sub.equipment_id, id, false)?;
        let entity = Entity::SubEquipment(sub);
        tx.delete(&entity)?;
        self.cache_removed(tx, entity);
        Ok(())
    }
}
