//! Schema registry: aspect type -> backing table and indexed columns
//!
//! Dispatch over aspect kinds is a data lookup. The registry is populated
//! once at process start and shared read-only (typically behind an `Arc`)
//! by the writer, which projects payloads into indexed columns, and by the
//! query planner, which resolves criteria against those columns.

use crate::{
    Aspect, ConfigError, GmaResult, IndexValue, IndexValueType, ValidationError,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};

/// Deterministic table name for an entity kind.
pub fn entity_table_name(entity_type: &str) -> String {
    format!("metadata_entity_{}", entity_type.to_ascii_lowercase())
}

/// Normalize a field path to JSON-pointer form (`value` -> `/value`).
pub fn normalize_field_path(field_path: &str) -> String {
    if field_path.starts_with('/') {
        field_path.to_string()
    } else {
        format!("/{}", field_path)
    }
}

/// Deterministic index column name for `(aspect_type, field_path)`.
///
/// `com.linkedin.testing.AspectFoo` + `/value` -> `i_aspectfoo$value`.
pub fn index_column_name(aspect_type: &str, field_path: &str) -> String {
    let simple = aspect_type.rsplit('.').next().unwrap_or(aspect_type);
    let path = normalize_field_path(field_path).replace('/', "$");
    format!("i_{}{}", simple.to_ascii_lowercase(), path)
}

/// One materialized index column of an aspect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedField {
    /// JSON-pointer path into the payload.
    pub field_path: String,
    pub column_name: String,
    pub value_type: IndexValueType,
}

/// Storage descriptor of one aspect type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AspectDescriptor {
    pub aspect_type: String,
    pub entity_type: String,
    pub table_name: String,
    pub indexed_fields: Vec<IndexedField>,
}

impl AspectDescriptor {
    pub fn new(aspect_type: impl Into<String>, entity_type: impl Into<String>) -> Self {
        let entity_type = entity_type.into();
        Self {
            aspect_type: aspect_type.into(),
            table_name: entity_table_name(&entity_type),
            entity_type,
            indexed_fields: Vec::new(),
        }
    }

    /// Descriptor for a typed aspect.
    pub fn of<A: Aspect>(entity_type: impl Into<String>) -> Self {
        Self::new(A::ASPECT_TYPE, entity_type)
    }

    /// Materialize `field_path` as an indexed column.
    pub fn with_index(mut self, field_path: &str, value_type: IndexValueType) -> Self {
        let field_path = normalize_field_path(field_path);
        self.indexed_fields.push(IndexedField {
            column_name: index_column_name(&self.aspect_type, &field_path),
            field_path,
            value_type,
        });
        self
    }

    pub fn field(&self, field_path: &str) -> Option<&IndexedField> {
        let field_path = normalize_field_path(field_path);
        self.indexed_fields.iter().find(|f| f.field_path == field_path)
    }
}

/// Value of one indexed column derived from a payload. `None` is NULL.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectedColumn {
    pub column_name: String,
    pub value: Option<IndexValue>,
}

/// Registry of aspect descriptors keyed by aspect type.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    aspects: HashMap<String, AspectDescriptor>,
    /// entity type -> table name
    tables: BTreeMap<String, String>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`SchemaRegistry::register`].
    pub fn with(mut self, descriptor: AspectDescriptor) -> GmaResult<Self> {
        self.register(descriptor)?;
        Ok(self)
    }

    /// Register an aspect descriptor.
    ///
    /// Fails on a duplicate aspect type, when another entity kind already
    /// maps to the same table, or when one of its columns is already
    /// claimed in the same table.
    pub fn register(&mut self, descriptor: AspectDescriptor) -> GmaResult<()> {
        if self.aspects.contains_key(&descriptor.aspect_type) {
            return Err(ConfigError::DuplicateAspect {
                aspect_type: descriptor.aspect_type,
            }
            .into());
        }

        if let Some((existing, _)) = self.tables.iter().find(|(entity, table)| {
            **table == descriptor.table_name && **entity != descriptor.entity_type
        }) {
            return Err(ConfigError::DuplicateTable {
                table: descriptor.table_name.clone(),
                existing: existing.clone(),
                entity_type: descriptor.entity_type.clone(),
            }
            .into());
        }

        let mut seen: Vec<&str> = self
            .aspects_in_table(&descriptor.table_name)
            .flat_map(|d| d.indexed_fields.iter().map(|f| f.column_name.as_str()))
            .collect();
        for field in &descriptor.indexed_fields {
            if seen.contains(&field.column_name.as_str()) {
                return Err(ConfigError::DuplicateColumn {
                    table: descriptor.table_name.clone(),
                    column: field.column_name.clone(),
                }
                .into());
            }
            seen.push(&field.column_name);
        }

        self.tables
            .insert(descriptor.entity_type.clone(), descriptor.table_name.clone());
        self.aspects.insert(descriptor.aspect_type.clone(), descriptor);
        Ok(())
    }

    pub fn get(&self, aspect_type: &str) -> Option<&AspectDescriptor> {
        self.aspects.get(aspect_type)
    }

    /// Descriptor of a registered aspect type.
    pub fn descriptor(&self, aspect_type: &str) -> Result<&AspectDescriptor, ValidationError> {
        self.get(aspect_type)
            .ok_or_else(|| ValidationError::UnknownAspect {
                aspect_type: aspect_type.to_string(),
            })
    }

    /// Resolve `(aspect_type, field_path)` to its indexed column.
    pub fn resolve_field(
        &self,
        aspect_type: &str,
        field_path: &str,
    ) -> Result<(&AspectDescriptor, &IndexedField), ValidationError> {
        let descriptor = self.descriptor(aspect_type)?;
        let field = descriptor
            .field(field_path)
            .ok_or_else(|| ValidationError::UnknownIndexField {
                aspect_type: aspect_type.to_string(),
                field_path: normalize_field_path(field_path),
            })?;
        Ok((descriptor, field))
    }

    /// Table backing an entity kind, if any of its aspects is registered.
    pub fn table_for_entity(&self, entity_type: &str) -> Option<&str> {
        self.tables.get(entity_type).map(String::as_str)
    }

    /// All backing tables, ordered by name.
    pub fn tables(&self) -> Vec<&str> {
        let mut tables: Vec<&str> = self.tables.values().map(String::as_str).collect();
        tables.sort_unstable();
        tables.dedup();
        tables
    }

    /// Descriptors stored in `table_name`, ordered by aspect type.
    pub fn aspects_in_table<'a>(
        &'a self,
        table_name: &'a str,
    ) -> impl Iterator<Item = &'a AspectDescriptor> + 'a {
        let mut descriptors: Vec<&AspectDescriptor> = self
            .aspects
            .values()
            .filter(|d| d.table_name == table_name)
            .collect();
        descriptors.sort_by(|a, b| a.aspect_type.cmp(&b.aspect_type));
        descriptors.into_iter()
    }

    /// Derive every indexed column of `aspect_type` from `payload`.
    pub fn project(&self, aspect_type: &str, payload: &str) -> GmaResult<Vec<ProjectedColumn>> {
        let descriptor = self.descriptor(aspect_type)?;
        if descriptor.indexed_fields.is_empty() {
            return Ok(Vec::new());
        }

        let document: JsonValue =
            serde_json::from_str(payload).map_err(|e| ValidationError::Projection {
                aspect_type: aspect_type.to_string(),
                field_path: String::new(),
                reason: format!("payload is not valid JSON: {}", e),
            })?;

        descriptor
            .indexed_fields
            .iter()
            .map(|field| -> GmaResult<ProjectedColumn> {
                let raw = document.pointer(&field.field_path);
                let value = coerce(raw, field.value_type).map_err(|reason| {
                    ValidationError::Projection {
                        aspect_type: aspect_type.to_string(),
                        field_path: field.field_path.clone(),
                        reason,
                    }
                })?;
                Ok(ProjectedColumn {
                    column_name: field.column_name.clone(),
                    value,
                })
            })
            .collect()
    }
}

/// Coerce a JSON value into a column of `value_type`.
fn coerce(raw: Option<&JsonValue>, value_type: IndexValueType) -> Result<Option<IndexValue>, String> {
    let raw = match raw {
        None | Some(JsonValue::Null) => return Ok(None),
        Some(raw) => raw,
    };
    let mismatch = || format!("cannot convert {} to {:?}", raw, value_type);

    let value = match (value_type, raw) {
        (IndexValueType::Boolean, JsonValue::Bool(b)) => IndexValue::Boolean(*b),
        (IndexValueType::Boolean, JsonValue::String(s)) => {
            IndexValue::Boolean(s.parse().map_err(|_| mismatch())?)
        }
        (IndexValueType::Long, JsonValue::Number(n)) => {
            IndexValue::Long(n.as_i64().ok_or_else(mismatch)?)
        }
        (IndexValueType::Long, JsonValue::String(s)) => {
            IndexValue::Long(s.trim().parse().map_err(|_| mismatch())?)
        }
        (IndexValueType::Double, JsonValue::Number(n)) => {
            IndexValue::Double(n.as_f64().ok_or_else(mismatch)?)
        }
        (IndexValueType::Double, JsonValue::String(s)) => {
            let parsed: f64 = s.trim().parse().map_err(|_| mismatch())?;
            if !parsed.is_finite() {
                return Err(mismatch());
            }
            IndexValue::Double(parsed)
        }
        (IndexValueType::String, JsonValue::String(s)) => IndexValue::String(s.clone()),
        (IndexValueType::String, JsonValue::Number(n)) => IndexValue::String(n.to_string()),
        (IndexValueType::String, JsonValue::Bool(b)) => IndexValue::String(b.to_string()),
        _ => return Err(mismatch()),
    };
    Ok(Some(value))
}
