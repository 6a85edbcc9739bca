//! Typed access to the string properties of a configuration element.
//!
//! Every handler declares the keys it understands; anything else (other than
//! `metadata.<key>`) is rejected before any mutation.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;

use crate::entity::{EntityId, EntityKind};
use crate::error::ValidationError;

const METADATA_PREFIX: &str = "metadata.";

const TAG_KEYS: &[&str] = &["name", "description", "dataType", "mode"];
const DATA_TAG_KEYS: &[&str] = &["equipmentId", "address"];
const RULE_TAG_KEYS: &[&str] = &["ruleText"];
const ALARM_KEYS: &[&str] = &[
    "tagId",
    "faultFamily",
    "faultMember",
    "faultCode",
    "condition",
    "info",
];
const PROCESS_KEYS: &[&str] = &["name", "description", "aliveInterval"];
const EQUIPMENT_KEYS: &[&str] = &["name", "description", "processId"];
const SUB_EQUIPMENT_KEYS: &[&str] = &["name", "description", "equipmentId"];

/// Keys a handler accepts for one entity kind.
fn allowed_keys(kind: EntityKind) -> Vec<&'static str> {
    match kind {
        EntityKind::DataTag => [TAG_KEYS, DATA_TAG_KEYS].concat(),
        EntityKind::RuleTag => [TAG_KEYS, RULE_TAG_KEYS].concat(),
        EntityKind::ControlTag => TAG_KEYS.to_vec(),
        EntityKind::Alarm => ALARM_KEYS.to_vec(),
        EntityKind::Process => PROCESS_KEYS.to_vec(),
        EntityKind::Equipment => EQUIPMENT_KEYS.to_vec(),
        EntityKind::SubEquipment => SUB_EQUIPMENT_KEYS.to_vec(),
    }
}

pub(crate) struct Properties<'a> {
    props: &'a BTreeMap<String, String>,
}

impl<'a> Properties<'a> {
    /// Wraps `props`, rejecting unknown keys.
    pub(crate) fn new(kind: EntityKind, props: &'a BTreeMap<String, String>) -> Result<Self, ValidationError> {
        let allowed = allowed_keys(kind);
        for key in props.keys() {
            let known = allowed.contains(&key.as_str())
                || key
                    .strip_prefix(METADATA_PREFIX)
                    .is_some_and(|k| !k.is_empty());
            if !known {
                return Err(ValidationError::UnknownProperty {
                    property: key.clone(),
                    kind,
                });
            }
        }
        Ok(Self { props })
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.props.contains_key(key)
    }

    /// Raw value, if present.
    pub(crate) fn get(&self, key: &str) -> Option<&'a str> {
        self.props.get(key).map(String::as_str)
    }

    /// Non-blank value, or `MissingProperty`.
    pub(crate) fn required(&self, key: &str) -> Result<&'a str, ValidationError> {
        match self.get(key).map(str::trim) {
            Some(v) if !v.is_empty() => Ok(v),
            _ => Err(ValidationError::MissingProperty {
                property: key.to_string(),
            }),
        }
    }

    /// Optional free text; blank clears the field.
    pub(crate) fn text(&self, key: &str) -> Option<Option<String>> {
        self.get(key).map(|v| {
            let v = v.trim();
            (!v.is_empty()).then(|| v.to_string())
        })
    }

    pub(crate) fn parse<T>(&self, key: &str) -> Result<Option<T>, ValidationError>
    where
        T: FromStr,
        T::Err: Display,
    {
        let Some(raw) = self.get(key) else {
            return Ok(None);
        };
        raw.trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ValidationError::InvalidProperty {
                property: key.to_string(),
                value: raw.to_string(),
                reason: e.to_string(),
            })
    }

    pub(crate) fn required_parse<T>(&self, key: &str) -> Result<T, ValidationError>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.required(key)?;
        self.parse(key)?.ok_or_else(|| ValidationError::MissingProperty {
            property: key.to_string(),
        })
    }

    pub(crate) fn id(&self, key: &str) -> Result<Option<EntityId>, ValidationError> {
        Ok(self.parse::<u64>(key)?.map(EntityId::new))
    }

    pub(crate) fn required_id(&self, key: &str) -> Result<EntityId, ValidationError> {
        self.required_parse::<u64>(key).map(EntityId::new)
    }

    /// Applies a non-blank `name`, if present.
    pub(crate) fn apply_name(&self, name: &mut String) -> Result<(), ValidationError> {
        if self.contains("name") {
            *name = self.required("name")?.to_string();
        }
        Ok(())
    }

    /// `metadata.<key>` entries with the prefix stripped.
    pub(crate) fn metadata(&self) -> impl Iterator<Item = (&'a str, &'a str)> {
        self.props
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(METADATA_PREFIX).map(|k| (k, v.as_str())))
    }

    /// Keys present, as reported to the persistence adapter.
    pub(crate) fn changed_fields(&self) -> Vec<String> {
        self.props.keys().cloned().collect()
    }

    /// Rejects an attempt to change a property fixed at creation.
    pub(crate) fn immutable<T: PartialEq + FromStr>(&self, key: &str, current: &T) -> Result<(), ValidationError>
    where
        T::Err: Display,
    {
        match self.parse::<T>(key)? {
            Some(v) if v != *current => Err(ValidationError::ImmutableProperty {
                property: key.to_string(),
            }),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect()
    }

    #[test]
    fn test_unknown_key_rejected() {
        let p = props(&[("name", "x"), ("colour", "red")]);
        let err = Properties::new(EntityKind::DataTag, &p).err().unwrap();
        assert!(matches!(err, ValidationError::UnknownProperty { ref property, .. } if property == "colour"));
    }

    #[test]
    fn test_metadata_keys_accepted() {
        let p = props(&[("metadata.building", "B2"), ("name", "x")]);
        let props = Properties::new(EntityKind::ControlTag, &p).unwrap();
        assert_eq!(props.metadata().collect::<Vec<_>>(), vec![("building", "B2")]);

        let p = props_bad();
        assert!(Properties::new(EntityKind::ControlTag, &p).is_err());
    }

    fn props_bad() -> BTreeMap<String, String> {
        props(&[("metadata.", "x")])
    }

    #[test]
    fn test_required_and_parse() {
        let p = props(&[("faultCode", "abc"), ("tagId", " 100 "), ("faultFamily", "  ")]);
        let props = Properties::new(EntityKind::Alarm, &p).unwrap();
        assert!(matches!(
            props.parse::<u32>("faultCode"),
            Err(ValidationError::InvalidProperty { .. })
        ));
        assert_eq!(props.required_id("tagId").unwrap(), EntityId::new(100));
        assert!(matches!(
            props.required("faultFamily"),
            Err(ValidationError::MissingProperty { .. })
        ));
        assert_eq!(props.parse::<u32>("condition").unwrap(), None);
    }

    #[test]
    fn test_text_blank_clears() {
        let p = props(&[("description", "  ")]);
        let props = Properties::new(EntityKind::Process, &p).unwrap();
        assert_eq!(props.text("description"), Some(None));
        assert_eq!(props.text("name"), None);
    }

    #[test]
    fn test_immutable_property() {
        let p = props(&[("equipmentId", "11")]);
        let props = Properties::new(EntityKind::DataTag, &p).unwrap();
        assert!(props.immutable("equipmentId", &11_u64).is_ok());
        assert!(matches!(
            props.immutable("equipmentId", &12_u64),
            Err(ValidationError::ImmutableProperty { .. })
        ));
    }
}
