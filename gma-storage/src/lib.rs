//! GMA Storage - Local Access Trait and Backends
//!
//! Defines the local access layer over versioned entity aspects: writing new
//! aspect versions, reading by key union, existence checks, and index
//! listings with offset or cursor pagination. Two backends are provided:
//! [`MemoryLocalAccess`] for tests and embedding, and [`SqliteLocalAccess`]
//! for a relational store with one table per entity kind.

pub mod async_trait;
pub mod plan;
pub mod sqlite;

pub use async_trait::{AsyncLocalAccess, BlockingLocalAccess};
pub use plan::{ColumnPredicate, ColumnRef, IndexRow, QueryPlan, SortKey};
pub use sqlite::SqliteLocalAccess;

use gma_core::{
    encode_aspect, Aspect, AspectDescriptor, AspectKey, AspectRecord, AuditStamp, EmptyPageCount,
    GmaResult, IndexFilter, IndexGroupByCriterion, IndexSortCriterion, IndexValue, ListResult,
    SchemaRegistry, StorageError, StoreConfig, Urn, ValidationError, LATEST_VERSION,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

// ============================================================================
// LOCAL ACCESS TRAIT
// ============================================================================

/// Local access to versioned entity aspects.
///
/// Version `0` of an `(urn, aspect_type)` is always the current snapshot;
/// every write pushes the previous snapshot to the next free positive
/// version. Lookups that find nothing return empty results, never errors.
pub trait LocalAccess: Send + Sync {
    // === Aspect Writer ===

    /// Write a new current version of an aspect.
    ///
    /// The existing current row, if any, is renumbered to
    /// `max(version) + 1` and the new payload becomes version `0` with
    /// freshly projected index columns. Atomic per `(urn, aspect_type)`.
    fn add(&self, urn: &Urn, aspect_type: &str, payload: &str, audit: &AuditStamp)
        -> GmaResult<()>;

    /// Write a typed aspect.
    fn add_aspect<A: Aspect>(&self, urn: &Urn, aspect: &A, audit: &AuditStamp) -> GmaResult<()>
    where
        Self: Sized,
    {
        let payload = encode_aspect(aspect)?;
        self.add(urn, A::ASPECT_TYPE, &payload, audit)
    }

    // === Key Reader ===

    /// Fetch the records addressed by `keys`, in key order, then window the
    /// merged sequence with `offset` and `limit`.
    fn batch_get_union(
        &self,
        keys: &[AspectKey],
        limit: i32,
        offset: i32,
    ) -> GmaResult<Vec<AspectRecord>>;

    // === Existence Checker ===

    /// Whether the entity has any current aspect.
    fn exists(&self, urn: &Urn) -> GmaResult<bool>;

    // === Index Query Planner ===

    /// List urns matching `filter`, offset paged.
    fn list_urns(
        &self,
        filter: &IndexFilter,
        sort: Option<&IndexSortCriterion>,
        start: i32,
        page_size: i32,
    ) -> GmaResult<ListResult<Urn>>;

    /// List urns matching `filter` strictly after `last_urn` in sort order.
    fn list_urns_after(
        &self,
        filter: &IndexFilter,
        sort: Option<&IndexSortCriterion>,
        last_urn: Option<&Urn>,
        page_size: i32,
    ) -> GmaResult<Vec<Urn>>;

    /// Count matching entities grouped by the string form of one column.
    fn count_aggregate(
        &self,
        filter: &IndexFilter,
        group_by: &IndexGroupByCriterion,
    ) -> GmaResult<BTreeMap<String, i64>>;

    // === Full Listing ===

    /// List urns holding a current row of `aspect_type`, ordered by urn.
    fn list_aspect_urns(
        &self,
        aspect_type: &str,
        start: i32,
        page_size: i32,
    ) -> GmaResult<ListResult<Urn>>;
}

// ============================================================================
// SHARED HELPERS
// ============================================================================

pub(crate) fn check_entity_type(urn: &Urn, descriptor: &AspectDescriptor) -> GmaResult<()> {
    if urn.entity_type() != descriptor.entity_type {
        return Err(ValidationError::EntityTypeMismatch {
            urn: urn.to_string(),
            aspect_type: descriptor.aspect_type.clone(),
            expected: descriptor.entity_type.clone(),
        }
        .into());
    }
    Ok(())
}

/// Validate keys and drop repeats, keeping key order.
pub(crate) fn distinct_keys(keys: &[AspectKey]) -> GmaResult<Vec<&AspectKey>> {
    let mut seen = BTreeSet::new();
    let mut distinct = Vec::with_capacity(keys.len());
    for key in keys {
        key.validate()?;
        if seen.insert(key) {
            distinct.push(key);
        }
    }
    Ok(distinct)
}

/// Table a key can live in, if its aspect is known and matches the urn.
pub(crate) fn key_table<'r>(registry: &'r SchemaRegistry, key: &AspectKey) -> Option<&'r str> {
    registry
        .get(&key.aspect_type)
        .filter(|d| d.entity_type == key.urn.entity_type())
        .map(|d| d.table_name.as_str())
}

// ============================================================================
// MEMORY BACKEND
// ============================================================================

#[derive(Debug, Clone)]
struct StoredAspect {
    record: AspectRecord,
    index: IndexRow,
}

/// Rows of one entity table keyed by `(urn, aspect_type, version)`.
type AspectTable = BTreeMap<(Urn, String, i64), StoredAspect>;

/// In-memory local access.
///
/// Mirrors the relational layout: one ordered table per entity kind, with
/// index columns projected on write.
#[derive(Debug)]
pub struct MemoryLocalAccess {
    registry: Arc<SchemaRegistry>,
    empty_page_count: EmptyPageCount,
    tables: Arc<RwLock<HashMap<String, AspectTable>>>,
}

impl MemoryLocalAccess {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self::with_config(registry, &StoreConfig::default())
    }

    /// Create with the paging policy from `config`.
    pub fn with_config(registry: Arc<SchemaRegistry>, config: &StoreConfig) -> Self {
        Self {
            registry,
            empty_page_count: config.empty_page_count,
            tables: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Clear all stored rows.
    pub fn clear(&self) -> GmaResult<()> {
        self.write_tables()?.clear();
        Ok(())
    }

    /// Number of stored rows across all versions and tables.
    pub fn row_count(&self) -> GmaResult<usize> {
        Ok(self.read_tables()?.values().map(BTreeMap::len).sum())
    }

    fn read_tables(&self) -> GmaResult<RwLockReadGuard<'_, HashMap<String, AspectTable>>> {
        self.tables
            .read()
            .map_err(|_| StorageError::LockPoisoned.into())
    }

    fn write_tables(&self) -> GmaResult<RwLockWriteGuard<'_, HashMap<String, AspectTable>>> {
        self.tables
            .write()
            .map_err(|_| StorageError::LockPoisoned.into())
    }

    /// Current rows of a table grouped by urn, in urn order.
    fn current_by_urn(table: &AspectTable) -> BTreeMap<&Urn, HashMap<&str, &StoredAspect>> {
        let mut grouped: BTreeMap<&Urn, HashMap<&str, &StoredAspect>> = BTreeMap::new();
        for ((urn, aspect_type, version), stored) in table {
            if *version == LATEST_VERSION {
                grouped
                    .entry(urn)
                    .or_default()
                    .insert(aspect_type.as_str(), stored);
            }
        }
        grouped
    }

    /// Matching urns with their sort values, in plan order.
    fn ordered_matches(table: Option<&AspectTable>, plan: &QueryPlan) -> Vec<(Option<IndexValue>, Urn)> {
        let Some(table) = table else {
            return Vec::new();
        };
        let mut rows: Vec<(Option<IndexValue>, Urn)> = Self::current_by_urn(table)
            .into_iter()
            .filter_map(|(urn, aspects)| {
                let lookup = |aspect_type: &str| aspects.get(aspect_type).copied().map(|s| &s.index);
                if !plan.matches(&lookup) {
                    return None;
                }
                Some((plan.sort_value(&lookup).cloned(), urn.clone()))
            })
            .collect();
        rows.sort_by(|a, b| plan.compare((a.0.as_ref(), &a.1), (b.0.as_ref(), &b.1)));
        rows
    }

    fn offset_page(&self, urns: Vec<Urn>, start: i32, page_size: i32) -> ListResult<Urn> {
        let total = urns.len() as i64;
        let values: Vec<Urn> = urns
            .into_iter()
            .skip(start as usize)
            .take(page_size as usize)
            .collect();
        let total = plan::reported_total(self.empty_page_count, values.is_empty(), total);
        ListResult::new(values, total, start, page_size)
    }
}

impl LocalAccess for MemoryLocalAccess {
    fn add(
        &self,
        urn: &Urn,
        aspect_type: &str,
        payload: &str,
        audit: &AuditStamp,
    ) -> GmaResult<()> {
        let descriptor = self.registry.descriptor(aspect_type)?;
        check_entity_type(urn, descriptor)?;
        let index: IndexRow = self
            .registry
            .project(aspect_type, payload)?
            .into_iter()
            .filter_map(|c| c.value.map(|v| (c.column_name, v)))
            .collect();

        let mut tables = self.write_tables()?;
        let table = tables.entry(descriptor.table_name.clone()).or_default();

        let current_key = (urn.clone(), aspect_type.to_string(), LATEST_VERSION);
        let last_key = (urn.clone(), aspect_type.to_string(), i64::MAX);
        let max_version = table
            .range(current_key.clone()..=last_key)
            .next_back()
            .map(|((_, _, version), _)| *version)
            .unwrap_or(LATEST_VERSION);

        if let Some(mut previous) = table.remove(&current_key) {
            let next = max_version + 1;
            previous.record.version = next;
            table.insert((urn.clone(), aspect_type.to_string(), next), previous);
            debug!(urn = %urn, aspect_type, version = next, "Renumbered current aspect");
        }

        table.insert(
            current_key,
            StoredAspect {
                record: AspectRecord::new(urn.clone(), aspect_type, LATEST_VERSION, payload, audit),
                index,
            },
        );
        debug!(urn = %urn, aspect_type, "Wrote current aspect");
        Ok(())
    }

    fn batch_get_union(
        &self,
        keys: &[AspectKey],
        limit: i32,
        offset: i32,
    ) -> GmaResult<Vec<AspectRecord>> {
        plan::check_limit_offset(limit, offset)?;
        let keys = distinct_keys(keys)?;
        let tables = self.read_tables()?;

        let records = keys
            .into_iter()
            .filter_map(|key| {
                let table = tables.get(key_table(&self.registry, key)?)?;
                table
                    .get(&(key.urn.clone(), key.aspect_type.clone(), key.version))
                    .map(|stored| stored.record.clone())
            })
            .skip(offset as usize)
            .take(limit as usize)
            .collect();
        Ok(records)
    }

    fn exists(&self, urn: &Urn) -> GmaResult<bool> {
        let Some(table_name) = self.registry.table_for_entity(urn.entity_type()) else {
            return Ok(false);
        };
        let tables = self.read_tables()?;
        let Some(table) = tables.get(table_name) else {
            return Ok(false);
        };
        let found = table
            .range((urn.clone(), String::new(), i64::MIN)..)
            .take_while(|((row_urn, _, _), _)| row_urn == urn)
            .any(|((_, _, version), _)| *version == LATEST_VERSION);
        Ok(found)
    }

    fn list_urns(
        &self,
        filter: &IndexFilter,
        sort: Option<&IndexSortCriterion>,
        start: i32,
        page_size: i32,
    ) -> GmaResult<ListResult<Urn>> {
        let plan = QueryPlan::build(&self.registry, filter, sort)?;
        plan::check_window(start, page_size)?;

        let tables = self.read_tables()?;
        let urns: Vec<Urn> = Self::ordered_matches(tables.get(&plan.table), &plan)
            .into_iter()
            .map(|(_, urn)| urn)
            .collect();
        debug!(table = %plan.table, start, page_size, "Listed urns by offset");
        Ok(self.offset_page(urns, start, page_size))
    }

    fn list_urns_after(
        &self,
        filter: &IndexFilter,
        sort: Option<&IndexSortCriterion>,
        last_urn: Option<&Urn>,
        page_size: i32,
    ) -> GmaResult<Vec<Urn>> {
        let plan = QueryPlan::build(&self.registry, filter, sort)?;
        plan::check_page_size(page_size)?;

        let tables = self.read_tables()?;
        let table = tables.get(&plan.table);
        let bound = last_urn.map(|last| {
            let value = plan.sort.as_ref().and_then(|sort| {
                table
                    .and_then(|t| t.get(&(last.clone(), sort.column.aspect_type.clone(), LATEST_VERSION)))
                    .and_then(|stored| stored.index.get(&sort.column.column))
                    .cloned()
            });
            (value, last)
        });

        let urns = Self::ordered_matches(table, &plan)
            .into_iter()
            .filter(|(value, urn)| match &bound {
                Some((bound_value, bound_urn)) => {
                    plan.is_after((value.as_ref(), urn), (bound_value.as_ref(), *bound_urn))
                }
                None => true,
            })
            .take(page_size as usize)
            .map(|(_, urn)| urn)
            .collect();
        debug!(table = %plan.table, page_size, "Listed urns by cursor");
        Ok(urns)
    }

    fn count_aggregate(
        &self,
        filter: &IndexFilter,
        group_by: &IndexGroupByCriterion,
    ) -> GmaResult<BTreeMap<String, i64>> {
        let plan = QueryPlan::for_group_by(&self.registry, filter, group_by)?;
        let tables = self.read_tables()?;
        let mut counts = BTreeMap::new();
        let Some(table) = tables.get(&plan.table) else {
            return Ok(counts);
        };
        let Some(column) = plan.group_by.as_ref() else {
            return Ok(counts);
        };

        for aspects in Self::current_by_urn(table).into_values() {
            let lookup = |aspect_type: &str| aspects.get(aspect_type).copied().map(|s| &s.index);
            if !plan.matches(&lookup) {
                continue;
            }
            if let Some(value) = column.value(&lookup) {
                *counts.entry(value.to_string()).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    fn list_aspect_urns(
        &self,
        aspect_type: &str,
        start: i32,
        page_size: i32,
    ) -> GmaResult<ListResult<Urn>> {
        let descriptor = self.registry.descriptor(aspect_type)?;
        plan::check_window(start, page_size)?;

        let tables = self.read_tables()?;
        let urns: Vec<Urn> = tables
            .get(&descriptor.table_name)
            .map(|table| {
                table
                    .keys()
                    .filter(|(_, aspect, version)| aspect == aspect_type && *version == LATEST_VERSION)
                    .map(|(urn, _, _)| urn.clone())
                    .collect()
            })
            .unwrap_or_default();
        Ok(self.offset_page(urns, start, page_size))
    }
}


// ============================================================================
// PROPERTY-BASED TESTS
// ============================================================================
