//! Error types for GMA local access operations

use crate::IndexValueType;
use thiserror::Error;

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    /// Two writers raced on the same versioning key. The whole write may be retried.
    #[error("Write conflict on {urn} for aspect {aspect_type}: {reason}")]
    Conflict {
        urn: String,
        aspect_type: String,
        reason: String,
    },

    #[error("Storage I/O failure: {reason}")]
    Io { reason: String },

    #[error("Corrupt row in {table}: {reason}")]
    CorruptRow { table: String, reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Validation errors. Never retryable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid aspect key for {urn}: {reason}")]
    InvalidKey { urn: String, reason: String },

    #[error("Invalid pagination {field}={value}: {reason}")]
    InvalidPagination {
        field: String,
        value: i64,
        reason: String,
    },

    #[error("Invalid urn {value:?}: {reason}")]
    InvalidUrn { value: String, reason: String },

    #[error("Aspect type not registered: {aspect_type}")]
    UnknownAspect { aspect_type: String },

    #[error("Field {field_path} of {aspect_type} is not indexed")]
    UnknownIndexField {
        aspect_type: String,
        field_path: String,
    },

    #[error("Aspect {aspect_type} belongs to entity type {expected}, got urn {urn}")]
    EntityTypeMismatch {
        urn: String,
        aspect_type: String,
        expected: String,
    },

    #[error("Filter spans tables {first} and {second}")]
    CrossEntityFilter { first: String, second: String },

    #[error("Cannot compare {aspect_type}{field_path} ({expected:?}) with {got}")]
    TypeMismatch {
        aspect_type: String,
        field_path: String,
        expected: IndexValueType,
        got: String,
    },

    #[error("Cannot project {aspect_type}{field_path}: {reason}")]
    Projection {
        aspect_type: String,
        field_path: String,
        reason: String,
    },

    #[error("Invalid payload for {aspect_type}: {reason}")]
    Payload { aspect_type: String, reason: String },

    #[error("Index filter references no aspect")]
    EmptyFilter,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Aspect type registered twice: {aspect_type}")]
    DuplicateAspect { aspect_type: String },

    #[error("Index column {column} already used in table {table}")]
    DuplicateColumn { table: String, column: String },

    #[error("Entity types {existing} and {entity_type} both map to table {table}")]
    DuplicateTable {
        table: String,
        existing: String,
        entity_type: String,
    },
}

/// Master error type for all GMA local access errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GmaError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl GmaError {
    /// Whether the caller may retry the failed operation as a whole.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GmaError::Storage(StorageError::Conflict { .. }))
    }
}

/// Result type alias for GMA operations.
pub type GmaResult<T> = Result<T, GmaError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_display_conflict() {
        let err = StorageError::Conflict {
            urn: "urn:li:foo:1".to_string(),
            aspect_type: "com.linkedin.testing.AspectFoo".to_string(),
            reason: "database is locked".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Write conflict"));
        assert!(msg.contains("urn:li:foo:1"));
        assert!(msg.contains("AspectFoo"));
    }

    #[test]
    fn test_validation_error_display_invalid_pagination() {
        let err = ValidationError::InvalidPagination {
            field: "limit".to_string(),
            value: -1,
            reason: "must be non-negative".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("limit=-1"));
        assert!(msg.contains("non-negative"));
    }

    #[test]
    fn test_validation_error_display_type_mismatch() {
        let err = ValidationError::TypeMismatch {
            aspect_type: "com.linkedin.testing.AspectFoo".to_string(),
            field_path: "/value".to_string(),
            expected: IndexValueType::Long,
            got: "string \"abc\"".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("AspectFoo/value"));
        assert!(msg.contains("Long"));
    }

    #[test]
    fn test_config_error_display_duplicate_column() {
        let err = ConfigError::DuplicateColumn {
            table: "metadata_entity_foo".to_string(),
            column: "i_aspectfoo$value".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("metadata_entity_foo"));
        assert!(msg.contains("i_aspectfoo$value"));
    }

    #[test]
    fn test_gma_error_from_variants() {
        let storage = GmaError::from(StorageError::LockPoisoned);
        assert!(matches!(storage, GmaError::Storage(_)));

        let validation = GmaError::from(ValidationError::EmptyFilter);
        assert!(matches!(validation, GmaError::Validation(_)));

        let config = GmaError::from(ConfigError::DuplicateAspect {
            aspect_type: "x".to_string(),
        });
        assert!(matches!(config, GmaError::Config(_)));
    }

    #[test]
    fn test_only_conflicts_are_retryable() {
        let conflict = GmaError::from(StorageError::Conflict {
            urn: "urn:li:foo:1".to_string(),
            aspect_type: "a".to_string(),
            reason: "busy".to_string(),
        });
        assert!(conflict.is_retryable());

        let io = GmaError::from(StorageError::Io {
            reason: "disk full".to_string(),
        });
        assert!(!io.is_retryable());

        let validation = GmaError::from(ValidationError::EmptyFilter);
        assert!(!validation.is_retryable());
    }
}
