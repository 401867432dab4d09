//! Audit provenance recorded with each aspect write

use crate::{truncate_to_millis, Timestamp, Urn};
use serde::{Deserialize, Serialize};

/// Who wrote an aspect version, when, and on whose behalf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditStamp {
    pub actor: Urn,
    /// Millisecond precision.
    pub time: Timestamp,
    pub impersonator: Option<Urn>,
}

impl AuditStamp {
    pub fn new(actor: Urn, time: Timestamp) -> Self {
        Self {
            actor,
            time: truncate_to_millis(time),
            impersonator: None,
        }
    }

    /// Stamp for `actor` acting on behalf of `impersonator`.
    pub fn on_behalf_of(mut self, impersonator: Urn) -> Self {
        self.impersonator = Some(impersonator);
        self
    }
}
