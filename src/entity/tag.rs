//! Tag entities: data tags, rule tags and control tags.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{EntityId, EntityKind};

static RULE_INPUT_RE: OnceLock<Regex> = OnceLock::new();

fn rule_input_regex() -> &'static Regex {
    RULE_INPUT_RE.get_or_init(|| Regex::new(r"#(\d+)").expect("rule input pattern is a valid regex"))
}

/// Extracts the ids of the tags referenced by a rule expression.
///
/// Inputs are written `#<id>` anywhere in the expression. Duplicates collapse
/// and the result is ordered. References that do not fit a tag id are
/// skipped; configuration input goes through [`parse_rule_inputs`] first.
///
/// ```
/// use tagcore::entity::extract_rule_inputs;
/// use tagcore::EntityId;
///
/// let ids = extract_rule_inputs("(#101 > 5) & (#100 = true) | #101 < 0 [2]");
/// assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec![EntityId::new(100), EntityId::new(101)]);
/// ```
#[must_use]
pub fn extract_rule_inputs(rule_text: &str) -> BTreeSet<EntityId> {
    rule_input_regex()
        .captures_iter(rule_text)
        .filter_map(|caps| caps.get(1))
        .filter_map(|m| m.as_str().parse::<u64>().ok())
        .map(EntityId::new)
        .collect()
}

/// Like [`extract_rule_inputs`], but fails on the first reference that does
/// not fit a tag id, returning that reference as written.
///
/// ```
/// use tagcore::entity::parse_rule_inputs;
///
/// assert_eq!(parse_rule_inputs("#1 + #2").unwrap().len(), 2);
/// assert_eq!(parse_rule_inputs("#99999999999999999999 > 1").unwrap_err(), "#99999999999999999999");
/// ```
pub fn parse_rule_inputs(rule_text: &str) -> Result<BTreeSet<EntityId>, String> {
    rule_input_regex()
        .captures_iter(rule_text)
        .filter_map(|caps| caps.get(1))
        .map(|m| {
            m.as_str()
                .parse::<u64>()
                .map(EntityId::new)
                .map_err(|_| format!("#{}", m.as_str()))
        })
        .collect()
}

/// Value type carried by a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataType {
    Boolean,
    Integer,
    Long,
    #[default]
    Float,
    Double,
    String,
}

impl FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Accept fully qualified names from legacy configuration sources.
        let short = s.trim().rsplit('.').next().unwrap_or_default();
        match short.to_ascii_lowercase().as_str() {
            "boolean" => Ok(Self::Boolean),
            "integer" | "int" => Ok(Self::Integer),
            "long" => Ok(Self::Long),
            "float" => Ok(Self::Float),
            "double" => Ok(Self::Double),
            "string" => Ok(Self::String),
            other => Err(format!("unsupported data type '{other}'")),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Boolean => "Boolean",
            Self::Integer => "Integer",
            Self::Long => "Long",
            Self::Float => "Float",
            Self::Double => "Double",
            Self::String => "String",
        };
        f.write_str(s)
    }
}

/// Operational mode of a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TagMode {
    #[default]
    Operational,
    Test,
    Maintenance,
}

impl FromStr for TagMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "0" => Ok(Self::Operational),
            "1" => Ok(Self::Test),
            "2" => Ok(Self::Maintenance),
            other => match other.to_ascii_lowercase().as_str() {
                "operational" => Ok(Self::Operational),
                "test" => Ok(Self::Test),
                "maintenance" => Ok(Self::Maintenance),
                _ => Err(format!("unsupported tag mode '{other}'")),
            },
        }
    }
}

/// Fields shared by every tag variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagCommon {
    pub id: EntityId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub data_type: DataType,
    #[serde(default)]
    pub mode: TagMode,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    /// Rules using this tag as an input.
    #[serde(default)]
    pub rule_ids: BTreeSet<EntityId>,
    /// Alarms owned by this tag.
    #[serde(default)]
    pub alarm_ids: BTreeSet<EntityId>,
    /// Processes this tag ultimately depends on.
    #[serde(default)]
    pub process_ids: BTreeSet<EntityId>,
    /// Equipment this tag ultimately depends on.
    #[serde(default)]
    pub equipment_ids: BTreeSet<EntityId>,
}

impl TagCommon {
    fn new(id: EntityId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            description: None,
            data_type: DataType::default(),
            mode: TagMode::default(),
            metadata: BTreeMap::new(),
            rule_ids: BTreeSet::new(),
            alarm_ids: BTreeSet::new(),
            process_ids: BTreeSet::new(),
            equipment_ids: BTreeSet::new(),
        }
    }
}

/// A raw data point acquired from the field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataTag {
    #[serde(flatten)]
    pub common: TagCommon,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equipment_id: Option<EntityId>,
    /// Opaque hardware address; interpreted by the acquisition layer only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl DataTag {
    /// Creates a data tag not yet attached to any equipment.
    #[must_use]
    pub fn new(id: EntityId, name: impl Into<String>) -> Self {
        Self {
            common: TagCommon::new(id, name),
            equipment_id: None,
            address: None,
        }
    }
}

/// A tag computed from other tags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleTag {
    #[serde(flatten)]
    pub common: TagCommon,
    pub rule_text: String,
    pub rule_input_tag_ids: BTreeSet<EntityId>,
}

impl RuleTag {
    /// Creates a rule tag; inputs are extracted from `rule_text`.
    #[must_use]
    pub fn new(id: EntityId, name: impl Into<String>, rule_text: impl Into<String>) -> Self {
        let rule_text = rule_text.into();
        let rule_input_tag_ids = extract_rule_inputs(&rule_text);
        Self {
            common: TagCommon::new(id, name),
            rule_text,
            rule_input_tag_ids,
        }
    }

    /// Replaces the expression and re-derives the input set.
    pub fn set_rule_text(&mut self, rule_text: impl Into<String>) {
        self.rule_text = rule_text.into();
        self.rule_input_tag_ids = extract_rule_inputs(&self.rule_text);
    }
}

/// An internal supervision signal (alive, state or communication-fault tag).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlTag {
    #[serde(flatten)]
    pub common: TagCommon,
}

impl ControlTag {
    #[must_use]
    pub fn new(id: EntityId, name: impl Into<String>) -> Self {
        Self {
            common: TagCommon::new(id, name),
        }
    }
}

/// A tag of any variant, as held by the tag store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag_kind", rename_all = "snake_case")]
pub enum Tag {
    Data(DataTag),
    Rule(RuleTag),
    Control(ControlTag),
}

impl Tag {
    #[must_use]
    pub const fn common(&self) -> &TagCommon {
        match self {
            Self::Data(t) => &t.common,
            Self::Rule(t) => &t.common,
            Self::Control(t) => &t.common,
        }
    }

    pub fn common_mut(&mut self) -> &mut TagCommon {
        match self {
            Self::Data(t) => &mut t.common,
            Self::Rule(t) => &mut t.common,
            Self::Control(t) => &mut t.common,
        }
    }

    #[must_use]
    pub const fn id(&self) -> EntityId {
        self.common().id
    }

    #[must_use]
    pub const fn kind(&self) -> EntityKind {
        match self {
            Self::Data(_) => EntityKind::DataTag,
            Self::Rule(_) => EntityKind::RuleTag,
            Self::Control(_) => EntityKind::ControlTag,
        }
    }

    /// Rules that use this tag as an input.
    #[must_use]
    pub const fn rule_ids(&self) -> &BTreeSet<EntityId> {
        &self.common().rule_ids
    }

    /// Alarms owned by this tag.
    #[must_use]
    pub const fn alarm_ids(&self) -> &BTreeSet<EntityId> {
        &self.common().alarm_ids
    }

    /// Tags this tag reads from (empty unless it is a rule).
    #[must_use]
    pub fn input_tag_ids(&self) -> BTreeSet<EntityId> {
        match self {
            Self::Rule(r) => r.rule_input_tag_ids.clone(),
            Self::Data(_) | Self::Control(_) => BTreeSet::new(),
        }
    }

    #[must_use]
    pub const fn as_rule(&self) -> Option<&RuleTag> {
        match self {
            Self::Rule(r) => Some(r),
            Self::Data(_) | Self::Control(_) => None,
        }
    }

    #[must_use]
    pub const fn as_data(&self) -> Option<&DataTag> {
        match self {
            Self::Data(d) => Some(d),
            Self::Rule(_) | Self::Control(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_rule_inputs_dedupes() {
        let ids = extract_rule_inputs("#3 + #1 + #3");
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&EntityId::new(1)));
        assert!(ids.contains(&EntityId::new(3)));
    }

    #[test]
    fn test_extract_rule_inputs_ignores_plain_numbers() {
        let ids = extract_rule_inputs("(#100 > 25) ? 3 : 4");
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec![EntityId::new(100)]);
        assert!(extract_rule_inputs("1 + 2").is_empty());
    }

    #[test]
    fn test_parse_rule_inputs_rejects_oversized_reference() {
        let err = parse_rule_inputs("#1 & #18446744073709551616").unwrap_err();
        assert_eq!(err, "#18446744073709551616");
        // The lenient form drops it instead.
        assert_eq!(extract_rule_inputs("#1 & #18446744073709551616").len(), 1);
        let ok = parse_rule_inputs("#18446744073709551615").unwrap();
        assert!(ok.contains(&EntityId::new(u64::MAX)));
    }

    #[test]
    fn test_set_rule_text_rederives_inputs() {
        let mut rule = RuleTag::new(EntityId::new(10), "r", "#1");
        rule.set_rule_text("#2 & #3");
        assert_eq!(rule.rule_input_tag_ids.len(), 2);
        assert!(!rule.rule_input_tag_ids.contains(&EntityId::new(1)));
    }

    #[test]
    fn test_data_type_parse() {
        assert_eq!("java.lang.Float".parse::<DataType>(), Ok(DataType::Float));
        assert_eq!("boolean".parse::<DataType>(), Ok(DataType::Boolean));
        assert!("Complex".parse::<DataType>().is_err());
    }

    #[test]
    fn test_tag_mode_parse() {
        assert_eq!("2".parse::<TagMode>(), Ok(TagMode::Maintenance));
        assert_eq!("test".parse::<TagMode>(), Ok(TagMode::Test));
        assert!("9".parse::<TagMode>().is_err());
    }

    #[test]
    fn test_tag_accessors() {
        let tag = Tag::Rule(RuleTag::new(EntityId::new(4), "r", "#1 | #2"));
        assert_eq!(tag.kind(), EntityKind::RuleTag);
        assert_eq!(tag.input_tag_ids().len(), 2);
        assert!(tag.as_data().is_none());
        assert!(Tag::Data(DataTag::new(EntityId::new(1), "d")).input_tag_ids().is_empty());
    }
}
