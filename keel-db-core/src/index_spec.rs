//! Secondary index specifications.
//!
//! A spec describes one index: a name, an ordered key pattern, a uniqueness
//! flag, and an optional collation. Specs are normalized before a build is
//! registered: the collection's default collation is applied where the spec
//! is silent, and validation rejects empty names and empty key patterns.
//!
//! Two specs describe the *same* index only when name, keys, uniqueness, and
//! collation all agree. A name match with a different body is a conflict,
//! distinguished as a key-pattern conflict or an options conflict so callers
//! can honor constraint-relaxed setups.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sort direction of one key field.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyDirection {
    Ascending,
    Descending,
}

/// One field of an index key pattern.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub struct IndexKey {
    pub field: String,
    pub direction: KeyDirection,
}

impl IndexKey {
    pub fn ascending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: KeyDirection::Ascending,
        }
    }

    pub fn descending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: KeyDirection::Descending,
        }
    }
}

/// A secondary index specification.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub keys: Vec<IndexKey>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collation: Option<String>,
}

impl IndexSpec {
    /// Shorthand for a non-unique ascending index over the given fields.
    pub fn ascending(name: impl Into<String>, fields: &[&str]) -> Self {
        Self {
            name: name.into(),
            keys: fields.iter().map(|f| IndexKey::ascending(*f)).collect(),
            unique: false,
            collation: None,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn with_collation(mut self, collation: impl Into<String>) -> Self {
        self.collation = Some(collation.into());
        self
    }

    /// Reject specs that cannot name a buildable index.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::invalid_index_spec(
                "index spec requires a non-empty name",
            ));
        }
        if self.keys.is_empty() {
            return Err(Error::invalid_index_spec(format!(
                "index '{}' has an empty key pattern",
                self.name
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for key in &self.keys {
            if key.field.is_empty() {
                return Err(Error::invalid_index_spec(format!(
                    "index '{}' has an empty key field",
                    self.name
                )));
            }
            if !seen.insert(key.field.as_str()) {
                return Err(Error::invalid_index_spec(format!(
                    "index '{}' repeats key field '{}'",
                    self.name, key.field
                )));
            }
        }
        Ok(())
    }

    /// Fill in the collection's default collation where this spec is silent.
    pub fn with_default_collation(mut self, default: Option<&str>) -> Self {
        if self.collation.is_none() {
            self.collation = default.map(str::to_owned);
        }
        self
    }

    /// True when `fields` form a prefix of this spec's key pattern. Used for
    /// the shard-key compatibility rule: a unique index is enforceable only
    /// if the shard key is a prefix of the index key.
    pub fn is_prefixed_by(&self, fields: &[String]) -> bool {
        if fields.len() > self.keys.len() {
            return false;
        }
        self.keys
            .iter()
            .zip(fields.iter())
            .all(|(key, field)| &key.field == field)
    }

    /// Ordered key field names.
    pub fn key_fields(&self) -> Vec<&str> {
        self.keys.iter().map(|k| k.field.as_str()).collect()
    }

    /// True when both specs describe the same index.
    pub fn same_index(&self, other: &IndexSpec) -> bool {
        self == other
    }
}

/// Renders the key pattern the way operators write it: `name{a:1,b:-1}`,
/// with `u` appended for unique indexes.
impl fmt::Display for IndexSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{{", self.name)?;
        for (i, key) in self.keys.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            let dir = match key.direction {
                KeyDirection::Ascending => 1,
                KeyDirection::Descending => -1,
            };
            write!(f, "{}:{}", key.field, dir)?;
        }
        write!(f, "}}")?;
        if self.unique {
            write!(f, "u")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_bad_specs() {
        assert!(IndexSpec::ascending("", &["a"]).validate().is_err());
        assert!(IndexSpec::ascending("i", &[]).validate().is_err());
        assert!(IndexSpec::ascending("i", &["a", "a"]).validate().is_err());
        assert!(IndexSpec::ascending("i", &["a", "b"]).validate().is_ok());
    }

    #[test]
    fn default_collation_applies_only_when_silent() {
        let spec = IndexSpec::ascending("i", &["a"]).with_default_collation(Some("fr"));
        assert_eq!(spec.collation.as_deref(), Some("fr"));

        let spec = IndexSpec::ascending("i", &["a"])
            .with_collation("en")
            .with_default_collation(Some("fr"));
        assert_eq!(spec.collation.as_deref(), Some("en"));
    }

    #[test]
    fn shard_key_prefix_rule() {
        let spec = IndexSpec::ascending("i", &["region", "user", "ts"]);
        assert!(spec.is_prefixed_by(&["region".into()]));
        assert!(spec.is_prefixed_by(&["region".into(), "user".into()]));
        assert!(!spec.is_prefixed_by(&["user".into()]));
        assert!(!spec.is_prefixed_by(&[
            "region".into(),
            "user".into(),
            "ts".into(),
            "extra".into()
        ]));
    }

    #[test]
    fn spec_json_round_trip() {
        let spec = IndexSpec::ascending("by_user", &["user", "ts"]).unique();
        let json = serde_json::to_string(&spec).unwrap();
        let back: IndexSpec = serde_json::from_str(&json).unwrap();
        assert!(spec.same_index(&back));
    }
}
