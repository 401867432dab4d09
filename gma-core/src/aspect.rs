//! Aspect records, lookup keys and the typed aspect bridge

use crate::{AuditStamp, GmaResult, Timestamp, Urn, ValidationError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Version number of the current snapshot of an aspect.
pub const LATEST_VERSION: i64 = 0;

/// A typed aspect payload with a fully-qualified type name.
pub trait Aspect: Serialize + DeserializeOwned {
    const ASPECT_TYPE: &'static str;
}

/// Encode a typed aspect into payload text.
pub fn encode_aspect<A: Aspect>(aspect: &A) -> GmaResult<String> {
    serde_json::to_string(aspect).map_err(|e| {
        ValidationError::Payload {
            aspect_type: A::ASPECT_TYPE.to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}

/// One stored version of one aspect of one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AspectRecord {
    pub urn: Urn,
    pub aspect_type: String,
    /// `0` is the current snapshot; historical versions are positive.
    pub version: i64,
    pub payload: String,
    pub created_by: Urn,
    pub created_on: Timestamp,
    pub created_for: Option<Urn>,
}

impl AspectRecord {
    pub fn new(
        urn: Urn,
        aspect_type: impl Into<String>,
        version: i64,
        payload: impl Into<String>,
        audit: &AuditStamp,
    ) -> Self {
        Self {
            urn,
            aspect_type: aspect_type.into(),
            version,
            payload: payload.into(),
            created_by: audit.actor.clone(),
            created_on: audit.time,
            created_for: audit.impersonator.clone(),
        }
    }

    pub fn is_latest(&self) -> bool {
        self.version == LATEST_VERSION
    }

    pub fn key(&self) -> AspectKey {
        AspectKey::new(self.aspect_type.clone(), self.urn.clone(), self.version)
    }

    /// Decode the payload as a typed aspect.
    pub fn decode<A: Aspect>(&self) -> GmaResult<A> {
        if self.aspect_type != A::ASPECT_TYPE {
            return Err(ValidationError::Payload {
                aspect_type: A::ASPECT_TYPE.to_string(),
                reason: format!("record holds {}", self.aspect_type),
            }
            .into());
        }
        serde_json::from_str(&self.payload).map_err(|e| {
            ValidationError::Payload {
                aspect_type: self.aspect_type.clone(),
                reason: e.to_string(),
            }
            .into()
        })
    }
}

/// Address of a specific aspect version.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AspectKey {
    pub aspect_type: String,
    pub urn: Urn,
    pub version: i64,
}

impl AspectKey {
    pub fn new(aspect_type: impl Into<String>, urn: Urn, version: i64) -> Self {
        Self {
            aspect_type: aspect_type.into(),
            urn,
            version,
        }
    }

    /// Key of the current version.
    pub fn latest(aspect_type: impl Into<String>, urn: Urn) -> Self {
        Self::new(aspect_type, urn, LATEST_VERSION)
    }

    /// Key for a typed aspect.
    pub fn of<A: Aspect>(urn: Urn, version: i64) -> Self {
        Self::new(A::ASPECT_TYPE, urn, version)
    }

    /// Reject keys that cannot address a stored row.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.version < 0 {
            return Err(ValidationError::InvalidKey {
                urn: self.urn.to_string(),
                reason: format!("version must be non-negative, got {}", self.version),
            });
        }
        if self.aspect_type.is_empty() {
            return Err(ValidationError::InvalidKey {
                urn: self.urn.to_string(),
                reason: "aspect type is empty".to_string(),
            });
        }
        Ok(())
    }
}
