//! Index query planning
//!
//! A [`QueryPlan`] is built once from an [`IndexFilter`] plus an optional
//! sort or group-by criterion. It resolves every referenced
//! `(aspect_type, field_path)` through the [`SchemaRegistry`] and exposes
//! the result two ways: as plain data that the SQLite backend renders into
//! a statement, and as an in-process predicate and comparator used by the
//! memory backend. Offset and cursor windowing are layered on top by each
//! backend.
//!
//! Every distinct aspect type in a plan binds that aspect's current
//! (`version = 0`) row for the same urn, so cross-aspect filters behave as
//! inner joins on the urn. Binding `0` is the driving row.

use gma_core::{
    normalize_field_path, Condition, EmptyPageCount, GmaResult, IndexFilter,
    IndexGroupByCriterion, IndexSortCriterion, IndexValue, IndexValueType, SchemaRegistry,
    SortOrder, Urn, ValidationError,
};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Indexed column values of one current aspect row, keyed by column name.
/// NULL columns are absent.
pub type IndexRow = BTreeMap<String, IndexValue>;

/// An indexed column resolved against a plan binding.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnRef {
    pub binding: usize,
    pub aspect_type: String,
    pub field_path: String,
    pub column: String,
    pub value_type: IndexValueType,
}

impl ColumnRef {
    /// Value of this column among the bound rows.
    pub fn value<'a, F>(&self, lookup: &F) -> Option<&'a IndexValue>
    where
        F: Fn(&str) -> Option<&'a IndexRow>,
    {
        lookup(self.aspect_type.as_str()).and_then(|row| row.get(&self.column))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnPredicate {
    pub column: ColumnRef,
    pub condition: Condition,
    pub value: IndexValue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortKey {
    pub column: ColumnRef,
    pub order: SortOrder,
}

/// Sort position of one result row.
pub type RowKey<'a> = (Option<&'a IndexValue>, &'a Urn);

/// Resolved predicate and ordering over one entity table.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub table: String,
    /// Aspect types bound by the plan, in first-reference order.
    pub bindings: Vec<String>,
    pub predicates: Vec<ColumnPredicate>,
    pub sort: Option<SortKey>,
    pub group_by: Option<ColumnRef>,
}

impl QueryPlan {
    /// Plan a filtered listing.
    pub fn build(
        registry: &SchemaRegistry,
        filter: &IndexFilter,
        sort: Option<&IndexSortCriterion>,
    ) -> GmaResult<Self> {
        let mut builder = PlanBuilder::new(registry);
        builder.filter(filter)?;
        if let Some(sort) = sort {
            let column = builder.bind(&sort.aspect_type, &sort.field_path)?;
            builder.sort = Some(SortKey {
                column,
                order: sort.order,
            });
        }
        builder.finish()
    }

    /// Plan a count aggregation grouped by one column.
    pub fn for_group_by(
        registry: &SchemaRegistry,
        filter: &IndexFilter,
        group_by: &IndexGroupByCriterion,
    ) -> GmaResult<Self> {
        let mut builder = PlanBuilder::new(registry);
        builder.filter(filter)?;
        builder.group_by = Some(builder.bind(&group_by.aspect_type, &group_by.field_path)?);
        builder.finish()
    }

    /// Whether the rows bound for one urn satisfy the plan.
    ///
    /// `lookup` returns the current row of an aspect type for that urn.
    pub fn matches<'a, F>(&self, lookup: &F) -> bool
    where
        F: Fn(&str) -> Option<&'a IndexRow>,
    {
        if !self.bindings.iter().all(|aspect| lookup(aspect.as_str()).is_some()) {
            return false;
        }
        if !self
            .predicates
            .iter()
            .all(|p| p.condition.evaluate(p.column.value(lookup), &p.value))
        {
            return false;
        }
        // Rows without a sort or group value never take part.
        let mut required = self.sort.iter().map(|s| &s.column).chain(self.group_by.iter());
        required.all(|column| column.value(lookup).is_some())
    }

    pub fn sort_value<'a, F>(&self, lookup: &F) -> Option<&'a IndexValue>
    where
        F: Fn(&str) -> Option<&'a IndexRow>,
    {
        self.sort.as_ref().and_then(|s| s.column.value(lookup))
    }

    /// Total order of result rows: sort value in sort order, then urn ascending.
    pub fn compare(&self, a: RowKey<'_>, b: RowKey<'_>) -> Ordering {
        let by_value = match (&self.sort, a.0, b.0) {
            (Some(sort), Some(x), Some(y)) => {
                sort.order.apply(x.compare(y).unwrap_or(Ordering::Equal))
            }
            _ => Ordering::Equal,
        };
        by_value.then_with(|| a.1.cmp(b.1))
    }

    /// Whether `row` lies strictly after the cursor `bound`.
    ///
    /// A bound without a sort value (its entity holds no current sort
    /// column) limits by urn alone.
    pub fn is_after(&self, row: RowKey<'_>, bound: RowKey<'_>) -> bool {
        match (&self.sort, bound.0) {
            (Some(_), None) => row.1 > bound.1,
            _ => self.compare(row, bound) == Ordering::Greater,
        }
    }
}

struct PlanBuilder<'r> {
    registry: &'r SchemaRegistry,
    table: Option<String>,
    bindings: Vec<String>,
    predicates: Vec<ColumnPredicate>,
    sort: Option<SortKey>,
    group_by: Option<ColumnRef>,
}

impl<'r> PlanBuilder<'r> {
    fn new(registry: &'r SchemaRegistry) -> Self {
        Self {
            registry,
            table: None,
            bindings: Vec::new(),
            predicates: Vec::new(),
            sort: None,
            group_by: None,
        }
    }

    fn filter(&mut self, filter: &IndexFilter) -> GmaResult<()> {
        for criterion in &filter.criteria {
            let column = self.bind(&criterion.aspect_type, &criterion.field_path)?;
            check_comparable(&column, criterion.condition, &criterion.value)?;
            self.predicates.push(ColumnPredicate {
                column,
                condition: criterion.condition,
                value: criterion.value.clone(),
            });
        }
        Ok(())
    }

    /// Resolve a column and bind its aspect's current row.
    fn bind(&mut self, aspect_type: &str, field_path: &str) -> Result<ColumnRef, ValidationError> {
        let (descriptor, field) = self.registry.resolve_field(aspect_type, field_path)?;

        match &self.table {
            None => self.table = Some(descriptor.table_name.clone()),
            Some(table) if *table != descriptor.table_name => {
                return Err(ValidationError::CrossEntityFilter {
                    first: table.clone(),
                    second: descriptor.table_name.clone(),
                });
            }
            Some(_) => {}
        }

        let binding = match self.bindings.iter().position(|a| a == aspect_type) {
            Some(position) => position,
            None => {
                self.bindings.push(aspect_type.to_string());
                self.bindings.len() - 1
            }
        };

        Ok(ColumnRef {
            binding,
            aspect_type: aspect_type.to_string(),
            field_path: normalize_field_path(field_path),
            column: field.column_name.clone(),
            value_type: field.value_type,
        })
    }

    fn finish(self) -> GmaResult<QueryPlan> {
        let table = self.table.ok_or(ValidationError::EmptyFilter)?;
        Ok(QueryPlan {
            table,
            bindings: self.bindings,
            predicates: self.predicates,
            sort: self.sort,
            group_by: self.group_by,
        })
    }
}

fn check_comparable(
    column: &ColumnRef,
    condition: Condition,
    value: &IndexValue,
) -> Result<(), ValidationError> {
    let accepted = match condition {
        Condition::StartWith => {
            column.value_type == IndexValueType::String
                && value.value_type() == IndexValueType::String
        }
        _ => column.value_type.accepts(value.value_type()),
    };
    if accepted {
        Ok(())
    } else {
        Err(ValidationError::TypeMismatch {
            aspect_type: column.aspect_type.clone(),
            field_path: column.field_path.clone(),
            expected: column.value_type,
            got: format!("{:?} {:?}", condition, value),
        })
    }
}

// ============================================================================
// PAGINATION CHECKS
// ============================================================================

/// Validate an offset window (`start >= 0`, `page_size > 0`).
pub fn check_window(start: i32, page_size: i32) -> Result<(), ValidationError> {
    if start < 0 {
        return Err(ValidationError::InvalidPagination {
            field: "start".to_string(),
            value: start.into(),
            reason: "must be non-negative".to_string(),
        });
    }
    check_page_size(page_size)
}

pub fn check_page_size(page_size: i32) -> Result<(), ValidationError> {
    if page_size <= 0 {
        return Err(ValidationError::InvalidPagination {
            field: "page_size".to_string(),
            value: page_size.into(),
            reason: "must be positive".to_string(),
        });
    }
    Ok(())
}

/// Validate a batch-read window (`limit >= 0`, `offset >= 0`).
pub fn check_limit_offset(limit: i32, offset: i32) -> Result<(), ValidationError> {
    for (field, value) in [("limit", limit), ("offset", offset)] {
        if value < 0 {
            return Err(ValidationError::InvalidPagination {
                field: field.to_string(),
                value: value.into(),
                reason: "must be non-negative".to_string(),
            });
        }
    }
    Ok(())
}

/// Total reported for an offset page under `policy`, given the full count.
pub fn reported_total(policy: EmptyPageCount, page_is_empty: bool, total: i64) -> i64 {
    match policy {
        EmptyPageCount::ReportZero if page_is_empty => 0,
        _ => total,
    }
}
