//! GMA Test Utilities
//!
//! Shared test infrastructure for the GMA workspace:
//! - Test aspects and a registry that indexes them
//! - Fixtures for seeding a local access backend
//! - Proptest generators for identities, stamps and index queries
//! - Assertions for GMA error categories

// Re-export backends from their source crate
pub use gma_storage::{LocalAccess, MemoryLocalAccess, SqliteLocalAccess};

// Re-export core types for convenience
pub use gma_core::{
    Aspect, AspectDescriptor, AspectKey, AspectRecord, AuditStamp, Condition, EmptyPageCount,
    GmaError, GmaResult, IndexCriterion, IndexFilter, IndexGroupByCriterion, IndexSortCriterion,
    IndexValue, IndexValueType, ListResult, SchemaRegistry, SortOrder, StorageError, StoreConfig,
    Timestamp, Urn, ValidationError,
};

use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ============================================================================
// TEST ASPECTS
// ============================================================================

/// Single-field test aspect; `value` holds a decimal number as text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AspectFoo {
    pub value: String,
}

impl Aspect for AspectFoo {
    const ASPECT_TYPE: &'static str = "com.linkedin.testing.AspectFoo";
}

impl AspectFoo {
    pub fn new(value: impl ToString) -> Self {
        Self {
            value: value.to_string(),
        }
    }
}

/// Multi-typed test aspect stored alongside [`AspectFoo`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AspectBar {
    pub label: String,
    pub active: bool,
    pub rank: f64,
}

impl Aspect for AspectBar {
    const ASPECT_TYPE: &'static str = "com.linkedin.testing.AspectBar";
}

/// Entity kind every test aspect belongs to.
pub const FOO_ENTITY: &str = "foo";

// ============================================================================
// TRACING
// ============================================================================

/// Install a fmt subscriber honoring `RUST_LOG`. Safe to call from every test.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built registries, stamps and seeded stores.

    use super::*;
    use chrono::DateTime;

    /// Registry indexing `AspectFoo.value` as Long and every `AspectBar` field.
    pub fn foo_registry() -> GmaResult<Arc<SchemaRegistry>> {
        let registry = SchemaRegistry::new()
            .with(AspectDescriptor::of::<AspectFoo>(FOO_ENTITY).with_index("value", IndexValueType::Long))?
            .with(
                AspectDescriptor::of::<AspectBar>(FOO_ENTITY)
                    .with_index("label", IndexValueType::String)
                    .with_index("active", IndexValueType::Boolean)
                    .with_index("rank", IndexValueType::Double),
            )?;
        Ok(Arc::new(registry))
    }

    pub fn make_foo_urn(id: i64) -> Urn {
        Urn::new(FOO_ENTITY, id)
    }

    /// Audit stamp for actor `urn:li:testActor:<actor>` at `millis` since the epoch.
    pub fn make_audit_stamp(actor: &str, millis: i64) -> AuditStamp {
        let time = DateTime::from_timestamp_millis(millis).unwrap_or_default();
        AuditStamp::new(Urn::new("testActor", actor), time)
    }

    pub fn memory_store() -> GmaResult<MemoryLocalAccess> {
        Ok(MemoryLocalAccess::new(foo_registry()?))
    }

    pub fn sqlite_store() -> GmaResult<SqliteLocalAccess> {
        SqliteLocalAccess::open_in_memory(foo_registry()?)
    }

    /// Write `AspectFoo { value: i }` for `foo:0..n`, stamped by `testActor:foo`.
    pub fn seed_foo_entities<L: LocalAccess>(access: &L, n: i64) -> GmaResult<Vec<Urn>> {
        let audit = make_audit_stamp("foo", 0);
        (0..n)
            .map(|i| {
                let urn = make_foo_urn(i);
                access.add_aspect(&urn, &AspectFoo::new(i), &audit)?;
                Ok(urn)
            })
            .collect()
    }

    /// Filter `low <= AspectFoo.value < high`.
    pub fn foo_value_range(low: i64, high: i64) -> IndexFilter {
        IndexFilter::default()
            .and(IndexCriterion::new(
                AspectFoo::ASPECT_TYPE,
                "value",
                Condition::GreaterThanOrEqualTo,
                low,
            ))
            .and(IndexCriterion::new(
                AspectFoo::ASPECT_TYPE,
                "value",
                Condition::LessThan,
                high,
            ))
    }

    pub fn foo_value_sort(order: SortOrder) -> IndexSortCriterion {
        IndexSortCriterion::new(AspectFoo::ASPECT_TYPE, "value", order)
    }
}

// ============================================================================
// GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for GMA identities and index queries.

    use super::*;
    use proptest::prelude::*;

    /// Generate a urn of entity kind `foo`.
    pub fn arb_foo_urn() -> impl Strategy<Value = Urn> {
        (0i64..10_000).prop_map(fixtures::make_foo_urn)
    }

    /// Generate a Timestamp at millisecond precision (2020-2030).
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (1_577_836_800_000i64..1_893_456_000_000i64).prop_map(|millis| {
            chrono::DateTime::from_timestamp_millis(millis).unwrap_or_default()
        })
    }

    pub fn arb_audit_stamp() -> impl Strategy<Value = AuditStamp> {
        ("[a-z]{1,8}", arb_timestamp(), proptest::option::of("[a-z]{1,8}")).prop_map(
            |(actor, time, impersonator)| {
                let stamp = AuditStamp::new(Urn::new("corpuser", actor), time);
                match impersonator {
                    Some(other) => stamp.on_behalf_of(Urn::new("corpuser", other)),
                    None => stamp,
                }
            },
        )
    }

    pub fn arb_sort_order() -> impl Strategy<Value = SortOrder> {
        prop_oneof![Just(SortOrder::Ascending), Just(SortOrder::Descending)]
    }

    /// Generate a comparison condition (no prefix match).
    pub fn arb_comparison() -> impl Strategy<Value = Condition> {
        prop_oneof![
            Just(Condition::Equal),
            Just(Condition::GreaterThan),
            Just(Condition::GreaterThanOrEqualTo),
            Just(Condition::LessThan),
            Just(Condition::LessThanOrEqualTo),
        ]
    }

    /// Generate a filter of one to three comparisons on `AspectFoo.value`.
    pub fn arb_foo_filter(max_value: i64) -> impl Strategy<Value = IndexFilter> {
        prop::collection::vec((arb_comparison(), 0..max_value), 1..=3).prop_map(|criteria| {
            IndexFilter::new(
                criteria
                    .into_iter()
                    .map(|(condition, value)| {
                        IndexCriterion::new(AspectFoo::ASPECT_TYPE, "value", condition, value)
                    })
                    .collect(),
            )
        })
    }

    /// Generate a value for an indexed column of the given type.
    pub fn arb_index_value(value_type: IndexValueType) -> BoxedStrategy<IndexValue> {
        match value_type {
            IndexValueType::Boolean => any::<bool>().prop_map(IndexValue::Boolean).boxed(),
            IndexValueType::Long => any::<i64>().prop_map(IndexValue::Long).boxed(),
            IndexValueType::Double => (-1.0e9f64..1.0e9).prop_map(IndexValue::Double).boxed(),
            IndexValueType::String => "[a-z0-9]{0,12}".prop_map(IndexValue::String).boxed(),
        }
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over GMA error categories.

    use super::*;

    /// Assert that a result is Ok.
    pub fn assert_ok<T: std::fmt::Debug>(result: &GmaResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got {:?}", result);
    }

    /// Assert that a result failed with a retryable write conflict.
    pub fn assert_conflict<T: std::fmt::Debug>(result: &GmaResult<T>) {
        assert!(
            matches!(result, Err(GmaError::Storage(StorageError::Conflict { .. }))),
            "Expected write conflict, got {:?}",
            result
        );
    }

    /// Assert that a result failed validation.
    pub fn assert_validation_error<T: std::fmt::Debug>(result: &GmaResult<T>) {
        assert!(
            matches!(result, Err(GmaError::Validation(_))),
            "Expected validation error, got {:?}",
            result
        );
    }

    /// Assert that a result failed on pagination arguments.
    pub fn assert_invalid_pagination<T: std::fmt::Debug>(result: &GmaResult<T>) {
        assert!(
            matches!(
                result,
                Err(GmaError::Validation(ValidationError::InvalidPagination { .. }))
            ),
            "Expected invalid pagination, got {:?}",
            result
        );
    }

    /// Assert the paging arithmetic of an offset page.
    pub fn assert_page<T: std::fmt::Debug>(
        page: &ListResult<T>,
        values: usize,
        total_count: i64,
        page_size: i32,
    ) {
        assert_eq!(page.values.len(), values, "page values: {:?}", page.values);
        assert_eq!(page.total_count, total_count);
        assert_eq!(page.page_size, page_size);
        let size = i64::from(page_size);
        assert_eq!(page.total_page_count, (total_count + size - 1) / size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_foo_registry_indexes_both_aspects() {
        let registry = fixtures::foo_registry().unwrap();
        assert!(registry.get(AspectFoo::ASPECT_TYPE).is_some());
        assert!(registry.resolve_field(AspectBar::ASPECT_TYPE, "/rank").is_ok());
        assert_eq!(registry.tables(), vec!["metadata_entity_foo"]);
    }

    #[test]
    fn test_seed_writes_current_rows() {
        init_test_tracing();
        let store = fixtures::memory_store().unwrap();
        let urns = fixtures::seed_foo_entities(&store, 3).unwrap();
        assert_eq!(urns, vec![
            fixtures::make_foo_urn(0),
            fixtures::make_foo_urn(1),
            fixtures::make_foo_urn(2),
        ]);
        let records = store
            .batch_get_union(&[AspectKey::of::<AspectFoo>(urns[1].clone(), 0)], 1, 0)
            .unwrap();
        assert_eq!(records[0].decode::<AspectFoo>().unwrap(), AspectFoo::new(1));
        assert_eq!(records[0].created_by.as_str(), "urn:li:testActor:foo");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn prop_generated_stamps_are_millisecond_precise(stamp in generators::arb_audit_stamp()) {
            prop_assert_eq!(stamp.time.timestamp_subsec_nanos() % 1_000_000, 0);
        }

        #[test]
        fn prop_generated_filters_plan(filter in generators::arb_foo_filter(100)) {
            let store = fixtures::memory_store().unwrap();
            assertions::assert_ok(&store.list_urns(&filter, None, 0, 10));
        }

        #[test]
        fn prop_generated_values_match_type(value in generators::arb_index_value(IndexValueType::Double)) {
            prop_assert_eq!(value.value_type(), IndexValueType::Double);
        }
    }
}
