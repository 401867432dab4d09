//! Behavioral Tests for Local Access Backends
//!
//! Every check runs against both the memory and the SQLite backend over the
//! same fixture: 100 `foo` entities whose `AspectFoo.value` is their id,
//! written by `urn:li:testActor:foo`.

use gma_storage::{LocalAccess, SqliteLocalAccess};
use gma_test_utils::{
    assertions, fixtures, init_test_tracing, AspectBar, AspectFoo, AspectKey, Aspect, Condition,
    GmaError, IndexCriterion, IndexFilter, IndexGroupByCriterion, IndexSortCriterion, SortOrder,
    StoreConfig, Urn, ValidationError, FOO_ENTITY,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;

// ============================================================================
// SHARED CHECKS
// ============================================================================

fn seed<L: LocalAccess>(store: &L) {
    init_test_tracing();
    fixtures::seed_foo_entities(store, 100).unwrap();
}

fn check_batch_get_union_returns_current<L: LocalAccess>(store: &L) {
    seed(store);
    let key = AspectKey::of::<AspectFoo>(fixtures::make_foo_urn(0), 0);
    let records = store.batch_get_union(&[key], 99, 0).unwrap();

    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.aspect_type, "com.linkedin.testing.AspectFoo");
    assert_eq!(record.payload, "{\"value\":\"0\"}");
    assert_eq!(record.created_by.as_str(), "urn:li:testActor:foo");
    assert_eq!(record.decode::<AspectFoo>().unwrap(), AspectFoo::new(0));
}

fn check_batch_get_union_merges_keys<L: LocalAccess>(store: &L) {
    seed(store);
    let key = |i: i64| AspectKey::of::<AspectFoo>(fixtures::make_foo_urn(i), 0);
    let keys = vec![
        key(7),
        key(3),
        key(7),
        AspectKey::of::<AspectFoo>(fixtures::make_foo_urn(3), 4),
        key(500),
        key(5),
    ];

    let all = store.batch_get_union(&keys, 10, 0).unwrap();
    let ids: Vec<&str> = all.iter().map(|r| r.urn.id()).collect();
    assert_eq!(ids, vec!["7", "3", "5"]);

    let window = store.batch_get_union(&keys, 2, 1).unwrap();
    let ids: Vec<&str> = window.iter().map(|r| r.urn.id()).collect();
    assert_eq!(ids, vec!["3", "5"]);

    assert!(store.batch_get_union(&keys, 0, 0).unwrap().is_empty());
    assertions::assert_invalid_pagination(&store.batch_get_union(&keys, -1, 0));

    let bad_key = AspectKey::of::<AspectFoo>(fixtures::make_foo_urn(1), -1);
    assert!(matches!(
        store.batch_get_union(&[bad_key], 10, 0),
        Err(GmaError::Validation(ValidationError::InvalidKey { .. }))
    ));
}

fn check_exists<L: LocalAccess>(store: &L) {
    seed(store);
    assert!(store.exists(&fixtures::make_foo_urn(0)).unwrap());
    assert!(!store.exists(&fixtures::make_foo_urn(9999)).unwrap());
    assert!(!store.exists(&Urn::new("unknown", 0)).unwrap());
}

fn check_offset_page<L: LocalAccess>(store: &L) {
    seed(store);
    let filter = fixtures::foo_value_range(25, 50);
    let sort = fixtures::foo_value_sort(SortOrder::Ascending);
    let page = store.list_urns(&filter, Some(&sort), 5, 5).unwrap();

    assertions::assert_page(&page, 5, 25, 5);
    assert_eq!(page.next_start, 10);
    assert_eq!(page.total_page_count, 5);
    let ids: Vec<&str> = page.values.iter().map(Urn::id).collect();
    assert_eq!(ids, vec!["30", "31", "32", "33", "34"]);
}

fn check_cursor_page<L: LocalAccess>(store: &L) {
    seed(store);
    let filter = fixtures::foo_value_range(25, 50);
    let sort = fixtures::foo_value_sort(SortOrder::Ascending);
    let last = fixtures::make_foo_urn(29);
    let urns = store
        .list_urns_after(&filter, Some(&sort), Some(&last), 5)
        .unwrap();

    assert_eq!(urns.len(), 5);
    assert_eq!(urns[0].id(), "30");

    let first = store.list_urns_after(&filter, Some(&sort), None, 5).unwrap();
    assert_eq!(first[0].id(), "25");
}

fn cursor_ids<L: LocalAccess>(
    store: &L,
    sort: Option<&IndexSortCriterion>,
    last: &Urn,
) -> Vec<String> {
    store
        .list_urns_after(&fixtures::foo_value_range(25, 50), sort, Some(last), 5)
        .unwrap()
        .iter()
        .map(|u| u.id().to_string())
        .collect()
}

fn check_cursor_after_urn_outside_listing<L: LocalAccess>(store: &L) {
    seed(store);
    let sort = fixtures::foo_value_sort(SortOrder::Ascending);
    let first_five = vec!["25", "26", "27", "28", "29"];

    // Never written: bounded by urn alone.
    let after_all = Urn::new(FOO_ENTITY, 9999);
    assert!(cursor_ids(store, Some(&sort), &after_all).is_empty());
    let before_all = Urn::new(FOO_ENTITY, "00");
    assert_eq!(cursor_ids(store, Some(&sort), &before_all), first_five);

    // Written but filtered out: its sort value still positions the cursor.
    assert_eq!(cursor_ids(store, Some(&sort), &fixtures::make_foo_urn(3)), first_five);
    assert_eq!(cursor_ids(store, Some(&sort), &fixtures::make_foo_urn(80)), Vec::<String>::new());
}

fn check_unsorted_cursor<L: LocalAccess>(store: &L) {
    seed(store);
    let filter = fixtures::foo_value_range(25, 50);

    // Without a sort the cursor compares urn strings: "foo:3" < "foo:30".
    assert_eq!(
        cursor_ids(store, None, &fixtures::make_foo_urn(3)),
        vec!["30", "31", "32", "33", "34"]
    );
    assert!(cursor_ids(store, None, &fixtures::make_foo_urn(9999)).is_empty());

    let everything = store.list_urns(&filter, None, 0, 1000).unwrap().values;
    assert_eq!(everything.len(), 25);
    let mut walked = Vec::new();
    let mut last: Option<Urn> = None;
    loop {
        let page = store.list_urns_after(&filter, None, last.as_ref(), 4).unwrap();
        if page.is_empty() {
            break;
        }
        last = page.last().cloned();
        walked.extend(page);
    }
    assert_eq!(walked, everything);
}

fn check_cursor_walk_matches_offset_listing<L: LocalAccess>(store: &L) {
    seed(store);
    let filter = fixtures::foo_value_range(10, 40);
    let sort = fixtures::foo_value_sort(SortOrder::Descending);
    let everything = store.list_urns(&filter, Some(&sort), 0, 1000).unwrap().values;
    assert_eq!(everything.len(), 30);

    let mut walked = Vec::new();
    let mut last: Option<Urn> = None;
    loop {
        let page = store
            .list_urns_after(&filter, Some(&sort), last.as_ref(), 7)
            .unwrap();
        if page.is_empty() {
            break;
        }
        last = page.last().cloned();
        walked.extend(page);
    }
    assert_eq!(walked, everything);
}

fn check_full_listing<L: LocalAccess>(store: &L) {
    seed(store);
    let first = store.list_aspect_urns(AspectFoo::ASPECT_TYPE, 0, 50).unwrap();
    assertions::assert_page(&first, 50, 100, 50);

    let tail = store.list_aspect_urns(AspectFoo::ASPECT_TYPE, 55, 50).unwrap();
    assertions::assert_page(&tail, 45, 100, 50);

    let past_end = store.list_aspect_urns(AspectFoo::ASPECT_TYPE, 101, 50).unwrap();
    assertions::assert_page(&past_end, 0, 0, 50);

    let mut sorted = first.values.clone();
    sorted.sort();
    assert_eq!(first.values, sorted);
}

fn check_reads_are_idempotent<L: LocalAccess>(store: &L) {
    seed(store);
    let filter = fixtures::foo_value_range(0, 60);
    let sort = fixtures::foo_value_sort(SortOrder::Ascending);
    assert_eq!(
        store.list_urns(&filter, Some(&sort), 10, 10).unwrap(),
        store.list_urns(&filter, Some(&sort), 10, 10).unwrap()
    );
    let keys = [AspectKey::of::<AspectFoo>(fixtures::make_foo_urn(42), 0)];
    assert_eq!(
        store.batch_get_union(&keys, 1, 0).unwrap(),
        store.batch_get_union(&keys, 1, 0).unwrap()
    );
}

fn check_write_ordering<L: LocalAccess>(store: &L) {
    let urn = fixtures::make_foo_urn(1);
    for i in 0..5 {
        store
            .add_aspect(&urn, &AspectFoo::new(i), &fixtures::make_audit_stamp("writer", i))
            .unwrap();
    }

    let keys: Vec<AspectKey> = (0..10)
        .map(|v| AspectKey::of::<AspectFoo>(urn.clone(), v))
        .collect();
    let records = store.batch_get_union(&keys, 100, 0).unwrap();
    let versions: Vec<i64> = records.iter().map(|r| r.version).collect();
    assert_eq!(versions, vec![0, 1, 2, 3, 4]);
    assert_eq!(records[0].decode::<AspectFoo>().unwrap(), AspectFoo::new(4));
    // Historical versions keep their original payload and stamp.
    assert_eq!(records[1].decode::<AspectFoo>().unwrap(), AspectFoo::new(0));
    assert_eq!(records[4].created_on.timestamp_millis(), 3);

    let listed = store
        .list_urns(&fixtures::foo_value_range(0, 4), None, 0, 10)
        .unwrap();
    assert!(listed.values.is_empty(), "only the current version is indexed");
}

fn check_invalid_arguments<L: LocalAccess>(store: &L) {
    let filter = fixtures::foo_value_range(0, 10);
    assertions::assert_invalid_pagination(&store.list_urns(&filter, None, -1, 10));
    assertions::assert_invalid_pagination(&store.list_urns(&filter, None, 0, 0));
    assertions::assert_invalid_pagination(&store.list_urns_after(&filter, None, None, 0));
    assertions::assert_invalid_pagination(&store.list_aspect_urns(AspectFoo::ASPECT_TYPE, 0, -5));

    assert!(matches!(
        store.list_urns(&IndexFilter::default(), None, 0, 10),
        Err(GmaError::Validation(ValidationError::EmptyFilter))
    ));
    let unindexed = IndexFilter::default().and(IndexCriterion::new(
        AspectFoo::ASPECT_TYPE,
        "missing",
        Condition::Equal,
        1,
    ));
    assert!(matches!(
        store.list_urns(&unindexed, None, 0, 10),
        Err(GmaError::Validation(ValidationError::UnknownIndexField { .. }))
    ));
    assertions::assert_validation_error(&store.add(
        &fixtures::make_foo_urn(1),
        "com.linkedin.testing.Unregistered",
        "{}",
        &fixtures::make_audit_stamp("foo", 0),
    ));
}

fn check_cross_aspect_filter_and_counts<L: LocalAccess>(store: &L) {
    seed(store);
    let audit = fixtures::make_audit_stamp("bar", 1);
    for i in 0..10 {
        let bar = AspectBar {
            label: if i % 2 == 0 { "even".to_string() } else { "odd".to_string() },
            active: i < 5,
            rank: i as f64 / 2.0,
        };
        store
            .add_aspect(&fixtures::make_foo_urn(i), &bar, &audit)
            .unwrap();
    }

    let filter = fixtures::foo_value_range(0, 8).and(IndexCriterion::new(
        AspectBar::ASPECT_TYPE,
        "active",
        Condition::Equal,
        true,
    ));
    let sort = fixtures::foo_value_sort(SortOrder::Descending);
    let page = store.list_urns(&filter, Some(&sort), 0, 10).unwrap();
    let ids: Vec<&str> = page.values.iter().map(Urn::id).collect();
    assert_eq!(ids, vec!["4", "3", "2", "1", "0"]);

    let by_label = IndexGroupByCriterion::new(AspectBar::ASPECT_TYPE, "label");
    let counts = store
        .count_aggregate(&fixtures::foo_value_range(0, 100), &by_label)
        .unwrap();
    assert_eq!(counts.get("even"), Some(&5));
    assert_eq!(counts.get("odd"), Some(&5));

    let prefix = IndexFilter::default().and(IndexCriterion::new(
        AspectBar::ASPECT_TYPE,
        "label",
        Condition::StartWith,
        "ev",
    ));
    let ranked = IndexFilter::new(prefix.criteria.clone()).and(IndexCriterion::new(
        AspectBar::ASPECT_TYPE,
        "rank",
        Condition::GreaterThanOrEqualTo,
        2.0,
    ));
    assert_eq!(store.list_urns(&prefix, None, 0, 100).unwrap().total_count, 5);
    let ids: Vec<String> = store
        .list_urns(&ranked, None, 0, 100)
        .unwrap()
        .values
        .iter()
        .map(|u| u.id().to_string())
        .collect();
    assert_eq!(ids, vec!["4", "6", "8"]);
}

// ============================================================================
// BACKEND INSTANTIATION
// ============================================================================

macro_rules! backend_tests {
    ($backend:ident, $make:expr) => {
        mod $backend {
            use super::*;

            #[test]
            fn test_batch_get_union_returns_current() {
                check_batch_get_union_returns_current(&$make);
            }

            #[test]
            fn test_batch_get_union_merges_keys() {
                check_batch_get_union_merges_keys(&$make);
            }

            #[test]
            fn test_exists() {
                check_exists(&$make);
            }

            #[test]
            fn test_offset_page() {
                check_offset_page(&$make);
            }

            #[test]
            fn test_cursor_page() {
                check_cursor_page(&$make);
            }

            #[test]
            fn test_cursor_after_urn_outside_listing() {
                check_cursor_after_urn_outside_listing(&$make);
            }

            #[test]
            fn test_unsorted_cursor() {
                check_unsorted_cursor(&$make);
            }

            #[test]
            fn test_cursor_walk_matches_offset_listing() {
                check_cursor_walk_matches_offset_listing(&$make);
            }

            #[test]
            fn test_full_listing() {
                check_full_listing(&$make);
            }

            #[test]
            fn test_reads_are_idempotent() {
                check_reads_are_idempotent(&$make);
            }

            #[test]
            fn test_write_ordering() {
                check_write_ordering(&$make);
            }

            #[test]
            fn test_invalid_arguments() {
                check_invalid_arguments(&$make);
            }

            #[test]
            fn test_cross_aspect_filter_and_counts() {
                check_cross_aspect_filter_and_counts(&$make);
            }
        }
    };
}

backend_tests!(memory, fixtures::memory_store().unwrap());
backend_tests!(sqlite, fixtures::sqlite_store().unwrap());

// ============================================================================
// SQLITE FILE DATABASE
// ============================================================================

#[test]
fn test_concurrent_writers_never_duplicate_versions() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig {
        database_path: Some(dir.path().join("gma.db")),
        ..StoreConfig::default()
    };
    let registry = fixtures::foo_registry().unwrap();
    // Provision once before the writers race.
    drop(SqliteLocalAccess::open(&config, Arc::clone(&registry)).unwrap());

    const WRITERS: i64 = 2;
    const WRITES: i64 = 15;
    let urn = fixtures::make_foo_urn(1);

    let handles: Vec<_> = (0..WRITERS)
        .map(|writer| {
            let store = SqliteLocalAccess::open(&config, Arc::clone(&registry)).unwrap();
            let urn = urn.clone();
            thread::spawn(move || {
                let audit = fixtures::make_audit_stamp(&format!("writer{}", writer), writer);
                for i in 0..WRITES {
                    let aspect = AspectFoo::new(writer * 1000 + i);
                    loop {
                        match store.add_aspect(&urn, &aspect, &audit) {
                            Ok(()) => break,
                            Err(e) if e.is_retryable() => continue,
                            Err(e) => panic!("write failed: {}", e),
                        }
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let store = SqliteLocalAccess::open(&config, registry).unwrap();
    let total = WRITERS * WRITES;
    let keys: Vec<AspectKey> = (0..total + 5)
        .map(|v| AspectKey::of::<AspectFoo>(urn.clone(), v))
        .collect();
    let records = store.batch_get_union(&keys, 1000, 0).unwrap();
    let versions: BTreeSet<i64> = records.iter().map(|r| r.version).collect();

    assert_eq!(records.len() as i64, total);
    assert_eq!(versions, (0..total).collect::<BTreeSet<_>>());
}

#[test]
fn test_count_all_policy_on_file_database() {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig {
        database_path: Some(dir.path().join("gma.db")),
        empty_page_count: gma_test_utils::EmptyPageCount::CountAll,
        ..StoreConfig::default()
    };
    let store = SqliteLocalAccess::open(&config, fixtures::foo_registry().unwrap()).unwrap();
    fixtures::seed_foo_entities(&store, 100).unwrap();

    let past_end = store.list_aspect_urns(AspectFoo::ASPECT_TYPE, 101, 50).unwrap();
    assertions::assert_page(&past_end, 0, 100, 50);

    let filter = fixtures::foo_value_range(25, 50);
    let beyond = store.list_urns(&filter, None, 30, 5).unwrap();
    assertions::assert_page(&beyond, 0, 25, 5);
}
