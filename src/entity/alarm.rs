//! Alarm entity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::EntityId;

/// Whether an alarm is currently raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlarmState {
    Active,
    #[default]
    Terminate,
}

/// A condition bound to exactly one owning tag.
///
/// The triple (`fault_family`, `fault_member`, `fault_code`) identifies the
/// alarm towards external alarm systems.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alarm {
    pub id: EntityId,
    /// Owning tag (data, rule or control tag).
    pub tag_id: EntityId,
    pub fault_family: String,
    pub fault_member: String,
    pub fault_code: u32,
    /// Condition expression evaluated against the owning tag's value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default)]
    pub state: AlarmState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Alarm {
    /// Creates a terminated alarm owned by `tag_id`.
    #[must_use]
    pub fn new(
        id: EntityId,
        tag_id: EntityId,
        fault_family: impl Into<String>,
        fault_member: impl Into<String>,
        fault_code: u32,
    ) -> Self {
        Self {
            id,
            tag_id,
            fault_family: fault_family.into(),
            fault_member: fault_member.into(),
            fault_code,
            condition: None,
            state: AlarmState::Terminate,
            info: None,
            timestamp: None,
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == AlarmState::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_alarm_is_terminated() {
        let alarm = Alarm::new(EntityId::new(300), EntityId::new(100), "FF", "FM", 1);
        assert!(!alarm.is_active());
        assert_eq!(alarm.tag_id, EntityId::new(100));
    }
}
