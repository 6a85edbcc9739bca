//! Supervision state machine.
//!
//! Every supervised entity starts `DOWN`. Transitions are accepted from any
//! external status report; health is decided by the acquisition layer, not
//! here. What this machine does own:
//! - redundant reports (same status, same description) become heartbeats
//!   instead of changes, which keeps listeners out of event storms
//! - timestamps never move backwards for one entity

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::{EntityId, EntityKind};

/// Operational status of a supervised entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SupervisionStatus {
    #[default]
    Down,
    Startup,
    Running,
    Stopped,
    Uncertain,
}

impl SupervisionStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Down => "DOWN",
            Self::Startup => "STARTUP",
            Self::Running => "RUNNING",
            Self::Stopped => "STOPPED",
            Self::Uncertain => "UNCERTAIN",
        }
    }

    /// Running is the only status in which data is considered valid.
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for SupervisionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SupervisionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DOWN" => Ok(Self::Down),
            "STARTUP" => Ok(Self::Startup),
            "RUNNING" => Ok(Self::Running),
            "STOPPED" => Ok(Self::Stopped),
            "UNCERTAIN" => Ok(Self::Uncertain),
            other => Err(format!("unknown supervision status '{other}'")),
        }
    }
}

/// The kinds of entity that carry supervision state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SupervisionEntity {
    Process,
    Equipment,
    SubEquipment,
}

impl SupervisionEntity {
    #[must_use]
    pub const fn kind(self) -> EntityKind {
        match self {
            Self::Process => EntityKind::Process,
            Self::Equipment => EntityKind::Equipment,
            Self::SubEquipment => EntityKind::SubEquipment,
        }
    }
}

impl TryFrom<EntityKind> for SupervisionEntity {
    type Error = EntityKind;

    fn try_from(kind: EntityKind) -> Result<Self, Self::Error> {
        match kind {
            EntityKind::Process => Ok(Self::Process),
            EntityKind::Equipment => Ok(Self::Equipment),
            EntityKind::SubEquipment => Ok(Self::SubEquipment),
            other => Err(other),
        }
    }
}

impl fmt::Display for SupervisionEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.kind(), f)
    }
}

/// Result of applying a status report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Status or description changed; listeners receive a change event.
    Changed {
        from: SupervisionStatus,
        to: SupervisionStatus,
    },
    /// Nothing material changed; only the timestamp advanced.
    Heartbeat,
}

impl Transition {
    #[must_use]
    pub const fn is_change(self) -> bool {
        matches!(self, Self::Changed { .. })
    }
}

/// Status, timestamp and description of one supervised entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisionState {
    pub status: SupervisionStatus,
    pub status_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_description: Option<String>,
}

impl Default for SupervisionState {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

fn normalize_description(description: Option<&str>) -> Option<String> {
    description
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(ToString::to_string)
}

impl SupervisionState {
    /// Initial `DOWN` state.
    #[must_use]
    pub const fn new(now: DateTime<Utc>) -> Self {
        Self {
            status: SupervisionStatus::Down,
            status_time: now,
            status_description: None,
        }
    }

    /// Applies an externally reported status.
    ///
    /// Never rejects a transition. A report older than the current state
    /// keeps the current timestamp so the per-entity clock is monotonic.
    pub fn apply(
        &mut self,
        status: SupervisionStatus,
        description: Option<&str>,
        time: DateTime<Utc>,
    ) -> Transition {
        let description = normalize_description(description);
        let time = time.max(self.status_time);

        if status == self.status && description == self.status_description {
            self.status_time = time;
            return Transition::Heartbeat;
        }

        let from = self.status;
        self.status = status;
        self.status_description = description;
        self.status_time = time;
        Transition::Changed { from, to: status }
    }
}

/// A status change (or heartbeat) of one supervised entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisionEvent {
    pub entity: SupervisionEntity,
    pub entity_id: EntityId,
    pub status: SupervisionStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SupervisionEvent {
    /// Builds the event describing `state`.
    #[must_use]
    pub fn from_state(entity: SupervisionEntity, entity_id: EntityId, state: &SupervisionState) -> Self {
        Self {
            entity,
            entity_id,
            status: state.status,
            timestamp: state.status_time,
            message: state.status_description.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn test_initial_state_is_down() {
        let state = SupervisionState::default();
        assert_eq!(state.status, SupervisionStatus::Down);
        assert!(state.status_description.is_none());
    }

    #[test]
    fn test_any_transition_is_accepted() {
        let t0 = Utc::now();
        let mut state = SupervisionState::new(t0);
        let tr = state.apply(SupervisionStatus::Stopped, None, t0 + Duration::seconds(1));
        assert_eq!(
            tr,
            Transition::Changed {
                from: SupervisionStatus::Down,
                to: SupervisionStatus::Stopped
            }
        );
        let tr = state.apply(SupervisionStatus::Running, Some("alive"), t0 + Duration::seconds(2));
        assert!(tr.is_change());
        assert_eq!(state.status_description.as_deref(), Some("alive"));
    }

    #[test]
    fn test_same_status_same_description_is_heartbeat() {
        let t0 = Utc::now();
        let mut state = SupervisionState::new(t0);
        state.apply(SupervisionStatus::Running, Some("ok"), t0);
        let tr = state.apply(SupervisionStatus::Running, Some("  ok "), t0 + Duration::seconds(5));
        assert_eq!(tr, Transition::Heartbeat);
        assert_eq!(state.status_time, t0 + Duration::seconds(5));
    }

    #[test]
    fn test_empty_description_equals_absent() {
        let t0 = Utc::now();
        let mut state = SupervisionState::new(t0);
        assert_eq!(state.apply(SupervisionStatus::Down, Some(""), t0), Transition::Heartbeat);
    }

    #[test]
    fn test_description_change_is_material() {
        let t0 = Utc::now();
        let mut state = SupervisionState::new(t0);
        state.apply(SupervisionStatus::Running, Some("ok"), t0);
        assert!(state.apply(SupervisionStatus::Running, Some("degraded"), t0).is_change());
    }

    #[test]
    fn test_timestamps_are_monotonic() {
        let t0 = Utc::now();
        let mut state = SupervisionState::new(t0);
        state.apply(SupervisionStatus::Running, None, t0 + Duration::seconds(10));
        state.apply(SupervisionStatus::Stopped, None, t0);
        assert_eq!(state.status, SupervisionStatus::Stopped);
        assert_eq!(state.status_time, t0 + Duration::seconds(10));
    }

    #[test]
    fn test_status_parse_and_entity_mapping() {
        assert_eq!("running".parse::<SupervisionStatus>(), Ok(SupervisionStatus::Running));
        assert!("FLAPPING".parse::<SupervisionStatus>().is_err());
        assert_eq!(
            SupervisionEntity::try_from(EntityKind::Equipment),
            Ok(SupervisionEntity::Equipment)
        );
        assert!(SupervisionEntity::try_from(EntityKind::Alarm).is_err());
    }
}
