//! Identity types for GMA entities

use crate::ValidationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Entity identifier of the form `urn:<namespace>:<entityType>:<id>`.
///
/// The id part may itself contain colons. Urns order by their string form,
/// which is also the tie-breaker order of index queries.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Urn(String);

impl Urn {
    /// Namespace used by [`Urn::new`].
    pub const DEFAULT_NAMESPACE: &'static str = "li";

    /// Build `urn:li:<entity_type>:<id>`.
    pub fn new(entity_type: &str, id: impl fmt::Display) -> Self {
        Self(format!(
            "urn:{}:{}:{}",
            Self::DEFAULT_NAMESPACE,
            entity_type,
            id
        ))
    }

    /// Parse and validate a urn string.
    pub fn parse(value: &str) -> Result<Self, ValidationError> {
        let invalid = |reason: &str| ValidationError::InvalidUrn {
            value: value.to_string(),
            reason: reason.to_string(),
        };

        let mut parts = value.splitn(4, ':');
        if parts.next() != Some("urn") {
            return Err(invalid("must start with 'urn:'"));
        }
        let namespace = parts.next().ok_or_else(|| invalid("missing namespace"))?;
        let entity_type = parts.next().ok_or_else(|| invalid("missing entity type"))?;
        let id = parts.next().ok_or_else(|| invalid("missing id"))?;
        if namespace.is_empty() || entity_type.is_empty() || id.is_empty() {
            return Err(invalid("empty segment"));
        }
        Ok(Self(value.to_string()))
    }

    /// Entity kind, e.g. `foo` for `urn:li:foo:42`.
    pub fn entity_type(&self) -> &str {
        self.0.split(':').nth(2).unwrap_or_default()
    }

    /// Entity-local id, e.g. `42` for `urn:li:foo:42`.
    pub fn id(&self) -> &str {
        self.0.splitn(4, ':').nth(3).unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Urn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Urn {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Urn {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Urn> for String {
    fn from(urn: Urn) -> Self {
        urn.0
    }
}

/// Truncate a timestamp to the millisecond precision stored by backends.
pub fn truncate_to_millis(ts: Timestamp) -> Timestamp {
    DateTime::from_timestamp_millis(ts.timestamp_millis()).unwrap_or(ts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_formats_li_namespace() {
        let urn = Urn::new("foo", 7);
        assert_eq!(urn.as_str(), "urn:li:foo:7");
        assert_eq!(urn.entity_type(), "foo");
        assert_eq!(urn.id(), "7");
    }

    #[test]
    fn test_id_may_contain_colons() {
        let urn = Urn::parse("urn:li:dataset:(urn:li:platform:hive,db.tbl,PROD)").unwrap();
        assert_eq!(urn.entity_type(), "dataset");
        assert_eq!(urn.id(), "(urn:li:platform:hive,db.tbl,PROD)");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(Urn::parse("foo:li:bar:1").is_err());
        assert!(Urn::parse("urn:li:foo").is_err());
        assert!(Urn::parse("urn:li::1").is_err());
        assert!("urn:li:foo:1".parse::<Urn>().is_ok());
    }

    #[test]
    fn test_serde_is_transparent_string() {
        let urn = Urn::new("foo", 1);
        let json = serde_json::to_string(&urn).unwrap();
        assert_eq!(json, "\"urn:li:foo:1\"");
        let back: Urn = serde_json::from_str(&json).unwrap();
        assert_eq!(back, urn);
        assert!(serde_json::from_str::<Urn>("\"nope\"").is_err());
    }

    #[test]
    fn test_truncate_to_millis_drops_sub_millisecond() {
        let ts = DateTime::from_timestamp(1_700_000_000, 123_456_789).unwrap();
        let truncated = truncate_to_millis(ts);
        assert_eq!(truncated.timestamp_millis(), ts.timestamp_millis());
        assert_eq!(truncated.timestamp_subsec_nanos(), 123_000_000);
    }
}
