//! Tags: the `namespace::name` handles data is assimilated under.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Validated tag. Both parts are non-empty and use `[A-Za-z0-9_.-]`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Tag {
    namespace: String,
    name: String,
}

fn valid_part(part: &str) -> bool {
    !part.is_empty()
        && part
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
}

impl Tag {
    /// Builds a tag from its parts.
    pub fn new(namespace: &str, name: &str) -> Result<Self, StorageError> {
        let invalid = |reason: &str| StorageError::InvalidTag {
            tag: format!("{}::{}", namespace, name),
            reason: reason.to_string(),
        };
        if !valid_part(namespace) {
            return Err(invalid("namespace must be non-empty [A-Za-z0-9_.-]"));
        }
        if !valid_part(name) {
            return Err(invalid("name must be non-empty [A-Za-z0-9_.-]"));
        }
        Ok(Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }

    /// Parses `namespace::name`.
    pub fn parse(s: &str) -> Result<Self, StorageError> {
        let (namespace, name) = s.split_once("::").ok_or_else(|| StorageError::InvalidTag {
            tag: s.to_string(),
            reason: "expected 'namespace::name'".to_string(),
        })?;
        Self::new(namespace, name)
    }

    /// Namespace part.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Name part.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.namespace, self.name)
    }
}

impl FromStr for Tag {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Tag {
    type Error = StorageError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Tag> for String {
    fn from(tag: Tag) -> String {
        tag.to_string()
    }
}
