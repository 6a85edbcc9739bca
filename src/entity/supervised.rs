//! Supervised entities: the process → equipment → sub-equipment tree.
//!
//! Each node carries its own [`SupervisionState`]. The state of a parent is
//! computed by the acquisition layer; this crate only stores and validates
//! the reported transitions.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::EntityId;
use crate::supervision::SupervisionState;

/// Root of a supervision subtree, usually one acquisition process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Process {
    pub id: EntityId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Expected interval between alive signals.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alive_interval_ms: Option<u64>,
    #[serde(default)]
    pub equipment_ids: BTreeSet<EntityId>,
    #[serde(default)]
    pub state: SupervisionState,
}

impl Process {
    #[must_use]
    pub fn new(id: EntityId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            description: None,
            alive_interval_ms: None,
            equipment_ids: BTreeSet::new(),
            state: SupervisionState::default(),
        }
    }
}

/// Equipment attached to a process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Equipment {
    pub id: EntityId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub process_id: EntityId,
    #[serde(default)]
    pub sub_equipment_ids: BTreeSet<EntityId>,
    /// Data tags acquired through this equipment.
    #[serde(default)]
    pub data_tag_ids: BTreeSet<EntityId>,
    #[serde(default)]
    pub state: SupervisionState,
}

impl Equipment {
    #[must_use]
    pub fn new(id: EntityId, name: impl Into<String>, process_id: EntityId) -> Self {
        Self {
            id,
            name: name.into(),
            description: None,
            process_id,
            sub_equipment_ids: BTreeSet::new(),
            data_tag_ids: BTreeSet::new(),
            state: SupervisionState::default(),
        }
    }
}

/// Sub-equipment attached to an equipment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubEquipment {
    pub id: EntityId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub equipment_id: EntityId,
    #[serde(default)]
    pub state: SupervisionState,
}

impl SubEquipment {
    #[must_use]
    pub fn new(id: EntityId, name: impl Into<String>, equipment_id: EntityId) -> Self {
        Self {
            id,
            name: name.into(),
            description: None,
            equipment_id,
            state: SupervisionState::default(),
        }
    }
}
