//! Configuration requests and reports.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::entity::{EntityId, EntityKind};
use crate::error::TagCoreError;
use crate::persistence::RollbackOutcome;

/// What to do with an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Create,
    Update,
    Remove,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Remove => "REMOVE",
        })
    }
}

/// One configuration request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationElement {
    pub entity_id: EntityId,
    pub entity_kind: EntityKind,
    pub action: Action,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl ConfigurationElement {
    #[must_use]
    pub const fn new(action: Action, entity_kind: EntityKind, entity_id: EntityId) -> Self {
        Self {
            entity_id,
            entity_kind,
            action,
            properties: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn create(entity_kind: EntityKind, entity_id: u64) -> Self {
        Self::new(Action::Create, entity_kind, EntityId::new(entity_id))
    }

    #[must_use]
    pub fn update(entity_kind: EntityKind, entity_id: u64) -> Self {
        Self::new(Action::Update, entity_kind, EntityId::new(entity_id))
    }

    #[must_use]
    pub fn remove(entity_kind: EntityKind, entity_id: u64) -> Self {
        Self::new(Action::Remove, entity_kind, EntityId::new(entity_id))
    }

    /// Adds a property (builder style).
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Outcome class of one action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportStatus {
    Ok,
    Warning,
    Failure,
}

/// Why an action failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureClass {
    Validation,
    NotFound,
    Persistence,
    TransactionAborted,
    LockTimeout,
    Internal,
    /// Committed, but a follow-up step failed and the entity was quarantined.
    DerivedStep,
}

impl From<&TagCoreError> for FailureClass {
    fn from(err: &TagCoreError) -> Self {
        match err {
            TagCoreError::Validation(_) => Self::Validation,
            TagCoreError::NotFound { .. } => Self::NotFound,
            TagCoreError::Persistence(_) => Self::Persistence,
            TagCoreError::TransactionAborted { .. } => Self::TransactionAborted,
            TagCoreError::LockTimeout { .. } => Self::LockTimeout,
            TagCoreError::Internal { .. } => Self::Internal,
        }
    }
}

/// Result of one action, with the reports of any cascaded actions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationElementReport {
    pub action: Action,
    pub entity_kind: EntityKind,
    pub entity_id: EntityId,
    pub status: ReportStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureClass>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_reports: Vec<ConfigurationElementReport>,
}

impl ConfigurationElementReport {
    /// A fresh `OK` report.
    #[must_use]
    pub const fn new(action: Action, entity_kind: EntityKind, entity_id: EntityId) -> Self {
        Self {
            action,
            entity_kind,
            entity_id,
            status: ReportStatus::Ok,
            message: None,
            failure: None,
            sub_reports: Vec::new(),
        }
    }

    #[must_use]
    pub fn for_element(element: &ConfigurationElement) -> Self {
        Self::new(element.action, element.entity_kind, element.entity_id)
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == ReportStatus::Ok
    }

    #[must_use]
    pub fn is_warning(&self) -> bool {
        self.status == ReportStatus::Warning
    }

    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.status == ReportStatus::Failure
    }

    /// Marks the report as a soft warning; never downgrades a failure.
    pub fn warn(&mut self, message: impl Into<String>) {
        if self.status < ReportStatus::Warning {
            self.status = ReportStatus::Warning;
        }
        self.message = Some(message.into());
    }

    /// Marks the report as failed by `err`.
    pub fn fail(&mut self, err: &TagCoreError) {
        self.status = ReportStatus::Failure;
        self.failure = Some(FailureClass::from(err));
        self.message = Some(err.to_string());
    }

    /// Marks the report as failed after rollback, recording the outcome.
    pub(crate) fn fail_rolled_back(&mut self, err: &TagCoreError, outcome: &RollbackOutcome) {
        self.fail(err);
        if !matches!(outcome, RollbackOutcome::Deferred) {
            self.message = Some(format!("{err} ({outcome})"));
        }
    }

    /// Marks a committed action whose follow-up step failed.
    pub(crate) fn fail_derived(&mut self, message: impl Into<String>) {
        self.status = ReportStatus::Failure;
        self.failure = Some(FailureClass::DerivedStep);
        self.message = Some(message.into());
    }

    pub fn add_sub_report(&mut self, report: Self) {
        self.sub_reports.push(report);
    }

    /// Reports in the order the actions took effect: cascaded actions
    /// before the action that caused them.
    #[must_use]
    pub fn execution_order(&self) -> Vec<&Self> {
        let mut out = Vec::new();
        self.collect_post_order(&mut out);
        out
    }

    fn collect_post_order<'a>(&'a self, out: &mut Vec<&'a Self>) {
        for sub in &self.sub_reports {
            sub.collect_post_order(out);
        }
        out.push(self);
    }
}

impl fmt::Display for ConfigurationElementReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}: {:?}", self.action, self.entity_kind, self.entity_id, self.status)?;
        if let Some(message) = &self.message {
            write!(f, " ({message})")?;
        }
        Ok(())
    }
}

/// A batch of configuration requests, applied in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    pub elements: Vec<ConfigurationElement>,
}

/// Result of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationReport {
    pub id: u64,
    pub name: String,
    /// Worst status over all element reports.
    pub status: ReportStatus,
    pub element_reports: Vec<ConfigurationElementReport>,
}

impl ConfigurationReport {
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.status == ReportStatus::Failure
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_json_shape() {
        let json = r##"{
            "entityId": 200,
            "entityKind": "RULE_TAG",
            "action": "CREATE",
            "properties": {"name": "r", "ruleText": "#100 > 1"}
        }"##;
        let element: ConfigurationElement = serde_json::from_str(json).unwrap();
        assert_eq!(element.entity_id, EntityId::new(200));
        assert_eq!(element.entity_kind, EntityKind::RuleTag);
        assert_eq!(element.properties["ruleText"], "#100 > 1");
        assert_eq!(
            element,
            ConfigurationElement::create(EntityKind::RuleTag, 200)
                .with("name", "r")
                .with("ruleText", "#100 > 1")
        );
    }

    #[test]
    fn test_execution_order_is_post_order() {
        let mut top = ConfigurationElementReport::new(Action::Remove, EntityKind::DataTag, EntityId::new(100));
        let mut rule = ConfigurationElementReport::new(Action::Remove, EntityKind::RuleTag, EntityId::new(200));
        rule.add_sub_report(ConfigurationElementReport::new(
            Action::Remove,
            EntityKind::RuleTag,
            EntityId::new(201),
        ));
        top.add_sub_report(rule);
        top.add_sub_report(ConfigurationElementReport::new(
            Action::Remove,
            EntityKind::Alarm,
            EntityId::new(300),
        ));

        let ids: Vec<u64> = top.execution_order().iter().map(|r| r.entity_id.get()).collect();
        assert_eq!(ids, vec![201, 200, 300, 100]);
    }

    #[test]
    fn test_warn_never_downgrades_failure() {
        let mut report = ConfigurationElementReport::new(Action::Remove, EntityKind::Alarm, EntityId::new(1));
        report.fail(&TagCoreError::internal("x"));
        report.warn("later warning");
        assert!(report.is_failure());
        assert_eq!(report.failure, Some(FailureClass::Internal));
    }

    #[test]
    fn test_report_serializes_without_empty_fields() {
        let report = ConfigurationElementReport::new(Action::Create, EntityKind::Process, EntityId::new(1));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "OK");
        assert_eq!(json["entityKind"], "PROCESS");
        assert!(json.get("subReports").is_none());
        assert!(json.get("message").is_none());
    }
}
