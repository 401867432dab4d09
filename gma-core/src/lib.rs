//! GMA Core - Types, Schema Registry and Errors
//!
//! Pure data structures shared by every GMA crate: entity identity, audit
//! provenance, versioned aspect records, index query value objects, the
//! schema registry that maps aspect types to tables and indexed columns,
//! and the error taxonomy. No storage behavior lives here.

pub mod aspect;
pub mod audit;
pub mod config;
pub mod error;
pub mod identity;
pub mod query;
pub mod schema;

pub use aspect::{encode_aspect, Aspect, AspectKey, AspectRecord, LATEST_VERSION};
pub use audit::AuditStamp;
pub use config::{EmptyPageCount, StoreConfig};
pub use error::{ConfigError, GmaError, GmaResult, StorageError, ValidationError};
pub use identity::{truncate_to_millis, Timestamp, Urn};
pub use query::{
    Condition, IndexCriterion, IndexFilter, IndexGroupByCriterion, IndexSortCriterion,
    IndexValue, IndexValueType, ListResult, SortOrder,
};
pub use schema::{
    entity_table_name, index_column_name, normalize_field_path, AspectDescriptor, IndexedField,
    ProjectedColumn, SchemaRegistry,
};

// ============================================================================
// PROPERTY-BASED TESTS
// ============================================================================

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Any urn built from a simple kind and id parses back to the same parts.
        #[test]
        fn prop_urn_parts_survive_parse(
            entity_type in "[a-z][a-zA-Z]{0,12}",
            id in "[a-zA-Z0-9_(),:.]{1,24}",
        ) {
            let urn = Urn::new(&entity_type, &id);
            let parsed = Urn::parse(urn.as_str()).unwrap();
            prop_assert_eq!(parsed.entity_type(), entity_type.as_str());
            prop_assert_eq!(parsed.id(), id.as_str());
        }

        /// Long columns accept any integer written as a JSON string or number.
        #[test]
        fn prop_long_projection_accepts_both_encodings(n in any::<i64>()) {
            let registry = SchemaRegistry::new()
                .with(AspectDescriptor::new("com.example.Count", "thing")
                    .with_index("n", IndexValueType::Long))
                .unwrap();
            let as_number = registry.project("com.example.Count", &format!("{{\"n\":{}}}", n)).unwrap();
            let as_string = registry.project("com.example.Count", &format!("{{\"n\":\"{}\"}}", n)).unwrap();
            prop_assert_eq!(&as_number[0].value, &Some(IndexValue::Long(n)));
            prop_assert_eq!(as_number, as_string);
        }

        /// Page count is the ceiling of total over page size.
        #[test]
        fn prop_total_page_count_is_ceiling(total in 0i64..10_000, page_size in 1i32..500) {
            let page: ListResult<()> = ListResult::new(Vec::new(), total, 0, page_size);
            let size = i64::from(page_size);
            prop_assert!(page.total_page_count * size >= total);
            prop_assert!(page.total_page_count == 0 || (page.total_page_count - 1) * size < total);
        }
    }
}
