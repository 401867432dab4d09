//! Index query value objects: values, criteria, sort and result pages
//!
//! These are request-scoped and carry no persistence. Criteria are assumed
//! to be well-formed; resolving them against indexed columns is the job of
//! the storage crate's query planner.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

// ============================================================================
// INDEX VALUES
// ============================================================================

/// Declared type of an indexed column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexValueType {
    Boolean,
    Long,
    Double,
    String,
}

impl IndexValueType {
    /// Whether values of `other` can be compared against a column of this type.
    pub fn accepts(self, other: IndexValueType) -> bool {
        use IndexValueType::*;
        matches!(
            (self, other),
            (Boolean, Boolean) | (String, String) | (Long | Double, Long | Double)
        )
    }
}

/// A typed value stored in, or compared against, an indexed column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexValue {
    Boolean(bool),
    Long(i64),
    Double(f64),
    String(String),
}

impl IndexValue {
    pub fn value_type(&self) -> IndexValueType {
        match self {
            IndexValue::Boolean(_) => IndexValueType::Boolean,
            IndexValue::Long(_) => IndexValueType::Long,
            IndexValue::Double(_) => IndexValueType::Double,
            IndexValue::String(_) => IndexValueType::String,
        }
    }

    /// Compare two values the way the relational backend does: numbers
    /// compare exactly across Long/Double, other kinds only with
    /// themselves.
    pub fn compare(&self, other: &IndexValue) -> Option<Ordering> {
        match (self, other) {
            (IndexValue::Boolean(a), IndexValue::Boolean(b)) => Some(a.cmp(b)),
            (IndexValue::Long(a), IndexValue::Long(b)) => Some(a.cmp(b)),
            (IndexValue::Long(a), IndexValue::Double(b)) => compare_long_double(*a, *b),
            (IndexValue::Double(a), IndexValue::Long(b)) => {
                compare_long_double(*b, *a).map(Ordering::reverse)
            }
            (IndexValue::Double(a), IndexValue::Double(b)) => a.partial_cmp(b),
            (IndexValue::String(a), IndexValue::String(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

/// Exact comparison of an integer with a double, without rounding the integer.
fn compare_long_double(long: i64, double: f64) -> Option<Ordering> {
    // 2^63: the first double above every i64.
    const I64_BOUND: f64 = 9_223_372_036_854_775_808.0;

    if double.is_nan() {
        return None;
    }
    if double >= I64_BOUND {
        return Some(Ordering::Less);
    }
    if double < -I64_BOUND {
        return Some(Ordering::Greater);
    }
    let whole = double.trunc();
    match long.cmp(&(whole as i64)) {
        Ordering::Equal => 0.0f64.partial_cmp(&(double - whole)),
        unequal => Some(unequal),
    }
}

impl fmt::Display for IndexValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexValue::Boolean(v) => write!(f, "{}", v),
            IndexValue::Long(v) => write!(f, "{}", v),
            IndexValue::Double(v) => write!(f, "{}", v),
            IndexValue::String(v) => f.write_str(v),
        }
    }
}

impl From<bool> for IndexValue {
    fn from(v: bool) -> Self {
        IndexValue::Boolean(v)
    }
}

impl From<i32> for IndexValue {
    fn from(v: i32) -> Self {
        IndexValue::Long(v.into())
    }
}

impl From<i64> for IndexValue {
    fn from(v: i64) -> Self {
        IndexValue::Long(v)
    }
}

impl From<f64> for IndexValue {
    fn from(v: f64) -> Self {
        IndexValue::Double(v)
    }
}

impl From<&str> for IndexValue {
    fn from(v: &str) -> Self {
        IndexValue::String(v.to_string())
    }
}

impl From<String> for IndexValue {
    fn from(v: String) -> Self {
        IndexValue::String(v)
    }
}

// ============================================================================
// CRITERIA
// ============================================================================

/// Comparison applied between an indexed column and a criterion value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Condition {
    Equal,
    GreaterThan,
    GreaterThanOrEqualTo,
    LessThan,
    LessThanOrEqualTo,
    /// String prefix match
    StartWith,
}

impl Condition {
    /// Evaluate `column <condition> operand`. A missing column never matches.
    pub fn evaluate(self, column: Option<&IndexValue>, operand: &IndexValue) -> bool {
        let Some(column) = column else {
            return false;
        };
        if let Condition::StartWith = self {
            return match (column, operand) {
                (IndexValue::String(c), IndexValue::String(prefix)) => c.starts_with(prefix.as_str()),
                _ => false,
            };
        }
        let Some(ordering) = column.compare(operand) else {
            return false;
        };
        match self {
            Condition::Equal => ordering == Ordering::Equal,
            Condition::GreaterThan => ordering == Ordering::Greater,
            Condition::GreaterThanOrEqualTo => ordering != Ordering::Less,
            Condition::LessThan => ordering == Ordering::Less,
            Condition::LessThanOrEqualTo => ordering != Ordering::Greater,
            Condition::StartWith => false,
        }
    }
}

/// One field-level comparison over an aspect's indexed column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexCriterion {
    pub aspect_type: String,
    pub field_path: String,
    pub condition: Condition,
    pub value: IndexValue,
}

impl IndexCriterion {
    pub fn new(
        aspect_type: impl Into<String>,
        field_path: impl Into<String>,
        condition: Condition,
        value: impl Into<IndexValue>,
    ) -> Self {
        Self {
            aspect_type: aspect_type.into(),
            field_path: field_path.into(),
            condition,
            value: value.into(),
        }
    }
}

/// Conjunction of criteria.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexFilter {
    pub criteria: Vec<IndexCriterion>,
}

impl IndexFilter {
    pub fn new(criteria: Vec<IndexCriterion>) -> Self {
        Self { criteria }
    }

    /// Add another ANDed criterion.
    pub fn and(mut self, criterion: IndexCriterion) -> Self {
        self.criteria.push(criterion);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.criteria.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SortOrder {
    Ascending,
    Descending,
}

impl SortOrder {
    /// Orient an ascending comparison.
    pub fn apply(self, ordering: Ordering) -> Ordering {
        match self {
            SortOrder::Ascending => ordering,
            SortOrder::Descending => ordering.reverse(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSortCriterion {
    pub aspect_type: String,
    pub field_path: String,
    pub order: SortOrder,
}

impl IndexSortCriterion {
    pub fn new(
        aspect_type: impl Into<String>,
        field_path: impl Into<String>,
        order: SortOrder,
    ) -> Self {
        Self {
            aspect_type: aspect_type.into(),
            field_path: field_path.into(),
            order,
        }
    }
}

/// Column whose distinct values bucket a count aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexGroupByCriterion {
    pub aspect_type: String,
    pub field_path: String,
}

impl IndexGroupByCriterion {
    pub fn new(aspect_type: impl Into<String>, field_path: impl Into<String>) -> Self {
        Self {
            aspect_type: aspect_type.into(),
            field_path: field_path.into(),
        }
    }
}

// ============================================================================
// RESULT PAGES
// ============================================================================

/// One offset-paginated window of results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListResult<T> {
    pub values: Vec<T>,
    pub total_count: i64,
    pub page_size: i32,
    /// `start + page_size`, not clamped to `total_count`.
    pub next_start: i32,
    pub total_page_count: i64,
}

impl<T> ListResult<T> {
    /// Assemble a page. `page_size` must be positive.
    pub fn new(values: Vec<T>, total_count: i64, start: i32, page_size: i32) -> Self {
        let size = i64::from(page_size.max(1));
        Self {
            values,
            total_count,
            page_size,
            next_start: start.saturating_add(page_size),
            total_page_count: (total_count + size - 1) / size,
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> ListResult<U> {
        ListResult {
            values: self.values.into_iter().map(f).collect(),
            total_count: self.total_count,
            page_size: self.page_size,
            next_start: self.next_start,
            total_page_count: self.total_page_count,
        }
    }
}
