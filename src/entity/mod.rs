//! Entity model.
//!
//! Every configurable object known to the runtime is an [`Entity`]. Tags
//! (data, rule and control tags) share a single id space; alarms and the
//! supervised process/equipment/sub-equipment tree each have their own.

mod alarm;
mod supervised;
mod tag;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use alarm::{Alarm, AlarmState};
pub use supervised::{Equipment, Process, SubEquipment};
pub use tag::{extract_rule_inputs, parse_rule_inputs, ControlTag, DataTag, DataType, RuleTag, Tag, TagCommon, TagMode};

/// Stable 64-bit entity identifier.
///
/// Ids are assigned by the configuration source and never change after
/// creation.
///
/// # Examples
///
/// ```
/// use tagcore::EntityId;
///
/// let id = EntityId::new(100);
/// assert_eq!(id.get(), 100);
/// assert_eq!(id.to_string(), "100");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(u64);

impl EntityId {
    /// Wraps a raw id.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for EntityId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl From<EntityId> for u64 {
    fn from(id: EntityId) -> Self {
        id.0
    }
}

/// Classification of configurable entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityKind {
    /// Raw acquired data point.
    DataTag,
    /// Tag computed from other tags.
    RuleTag,
    /// Internal supervision signal.
    ControlTag,
    /// Condition bound to one owning tag.
    Alarm,
    /// Top of the supervision tree.
    Process,
    /// Child of a process.
    Equipment,
    /// Child of an equipment.
    SubEquipment,
}

impl EntityKind {
    /// All kinds, in the order the cache is preloaded.
    pub const ALL: [Self; 7] = [
        Self::Process,
        Self::Equipment,
        Self::SubEquipment,
        Self::ControlTag,
        Self::DataTag,
        Self::RuleTag,
        Self::Alarm,
    ];

    /// Returns true for the kinds stored in the shared tag id space.
    #[must_use]
    pub const fn is_tag(self) -> bool {
        matches!(self, Self::DataTag | Self::RuleTag | Self::ControlTag)
    }

    /// Returns true for process/equipment/sub-equipment.
    #[must_use]
    pub const fn is_supervised(self) -> bool {
        matches!(self, Self::Process | Self::Equipment | Self::SubEquipment)
    }

    /// Canonical upper-case name, as used in configuration reports.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DataTag => "DATATAG",
            Self::RuleTag => "RULETAG",
            Self::ControlTag => "CONTROLTAG",
            Self::Alarm => "ALARM",
            Self::Process => "PROCESS",
            Self::Equipment => "EQUIPMENT",
            Self::SubEquipment => "SUBEQUIPMENT",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Any configurable entity, as exchanged with the persistence adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Entity {
    DataTag(DataTag),
    RuleTag(RuleTag),
    ControlTag(ControlTag),
    Alarm(Alarm),
    Process(Process),
    Equipment(Equipment),
    SubEquipment(SubEquipment),
}

impl Entity {
    /// Returns the entity id.
    #[must_use]
    pub const fn id(&self) -> EntityId {
        match self {
            Self::DataTag(t) => t.common.id,
            Self::RuleTag(t) => t.common.id,
            Self::ControlTag(t) => t.common.id,
            Self::Alarm(a) => a.id,
            Self::Process(p) => p.id,
            Self::Equipment(e) => e.id,
            Self::SubEquipment(s) => s.id,
        }
    }

    /// Returns the entity kind.
    #[must_use]
    pub const fn kind(&self) -> EntityKind {
        match self {
            Self::DataTag(_) => EntityKind::DataTag,
            Self::RuleTag(_) => EntityKind::RuleTag,
            Self::ControlTag(_) => EntityKind::ControlTag,
            Self::Alarm(_) => EntityKind::Alarm,
            Self::Process(_) => EntityKind::Process,
            Self::Equipment(_) => EntityKind::Equipment,
            Self::SubEquipment(_) => EntityKind::SubEquipment,
        }
    }

    /// Returns the tag view of this entity, if it is a tag.
    #[must_use]
    pub fn into_tag(self) -> Option<Tag> {
        match self {
            Self::DataTag(t) => Some(Tag::Data(t)),
            Self::RuleTag(t) => Some(Tag::Rule(t)),
            Self::ControlTag(t) => Some(Tag::Control(t)),
            _ => None,
        }
    }
}

impl From<Tag> for Entity {
    fn from(tag: Tag) -> Self {
        match tag {
            Tag::Data(t) => Self::DataTag(t),
            Tag::Rule(t) => Self::RuleTag(t),
            Tag::Control(t) => Self::ControlTag(t),
        }
    }
}
