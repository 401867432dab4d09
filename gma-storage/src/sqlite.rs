//! SQLite-backed local access
//!
//! One table per entity kind (`metadata_entity_<kind>`) holding every
//! version of every aspect, plus one typed nullable column per indexed
//! field. Writes run in `BEGIN IMMEDIATE` transactions so competing writers
//! on the same database serialize; a writer that cannot get the lock within
//! the busy timeout reports a retryable conflict.

use crate::plan::{self, ColumnPredicate, ColumnRef, QueryPlan};
use crate::{check_entity_type, distinct_keys, key_table, LocalAccess};
use chrono::DateTime;
use gma_core::{
    AspectKey, AspectRecord, AuditStamp, Condition, EmptyPageCount, GmaError, GmaResult,
    IndexFilter, IndexGroupByCriterion, IndexSortCriterion, IndexValue, IndexValueType,
    ListResult, SchemaRegistry, SortOrder, StorageError, StoreConfig, Urn,
};
use rusqlite::types::Value;
use rusqlite::{
    params, params_from_iter, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

const RECORD_COLUMNS: &str =
    "entity_id, aspect_type, version, payload, created_by, created_on, created_for";

/// Local access over a SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteLocalAccess {
    conn: Arc<Mutex<Connection>>,
    registry: Arc<SchemaRegistry>,
    empty_page_count: EmptyPageCount,
}

impl SqliteLocalAccess {
    /// Open the configured database and provision every registered table.
    pub fn open(config: &StoreConfig, registry: Arc<SchemaRegistry>) -> GmaResult<Self> {
        config.validate()?;
        let conn = match &config.database_path {
            Some(path) => Connection::open(path),
            None => Connection::open_in_memory(),
        }
        .map_err(io_error)?;
        conn.busy_timeout(config.busy_timeout).map_err(io_error)?;

        let access = Self {
            conn: Arc::new(Mutex::new(conn)),
            registry,
            empty_page_count: config.empty_page_count,
        };
        access.provision_schema()?;
        debug!(path = ?config.database_path, "Opened SQLite local access");
        Ok(access)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory(registry: Arc<SchemaRegistry>) -> GmaResult<Self> {
        Self::open(&StoreConfig::default(), registry)
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Create missing entity tables and index columns.
    ///
    /// Existing columns are left alone, so this only ever adds.
    pub fn provision_schema(&self) -> GmaResult<()> {
        self.with_conn(|conn| provision(conn, &self.registry).map_err(io_error))
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> GmaResult<T>) -> GmaResult<T> {
        let mut guard = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
        f(&mut *guard)
    }

    /// Total for an offset page, counting separately only when the policy asks.
    fn page_total(
        &self,
        conn: &Connection,
        windowed: Option<i64>,
        count: &Sql,
    ) -> rusqlite::Result<i64> {
        match (windowed, self.empty_page_count) {
            (Some(total), _) => Ok(total),
            (None, EmptyPageCount::ReportZero) => Ok(0),
            (None, EmptyPageCount::CountAll) => conn.query_row(
                &count.text,
                params_from_iter(count.params.iter()),
                |row| row.get(0),
            ),
        }
    }
}

impl LocalAccess for SqliteLocalAccess {
    fn add(
        &self,
        urn: &Urn,
        aspect_type: &str,
        payload: &str,
        audit: &AuditStamp,
    ) -> GmaResult<()> {
        let descriptor = self.registry.descriptor(aspect_type)?;
        check_entity_type(urn, descriptor)?;
        let columns = self.registry.project(aspect_type, payload)?;

        let mut names: Vec<String> = RECORD_COLUMNS.split(", ").map(str::to_string).collect();
        let mut values = vec![
            Value::Text(urn.to_string()),
            Value::Text(aspect_type.to_string()),
            Value::Integer(0),
            Value::Text(payload.to_string()),
            Value::Text(audit.actor.to_string()),
            Value::Integer(audit.time.timestamp_millis()),
            audit
                .impersonator
                .as_ref()
                .map_or(Value::Null, |u| Value::Text(u.to_string())),
        ];
        for column in &columns {
            names.push(quote_ident(&column.column_name));
            values.push(column.value.as_ref().map_or(Value::Null, sql_value));
        }
        let table = quote_ident(&descriptor.table_name);
        let insert = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            names.join(", "),
            vec!["?"; names.len()].join(", ")
        );

        self.with_conn(|conn| {
            let renumbered = write_current(conn, &table, &insert, &values, urn, aspect_type)
                .map_err(|err| write_error(err, urn, aspect_type))?;
            if let Some(version) = renumbered {
                debug!(urn = %urn, aspect_type, version, "Renumbered current aspect");
            }
            debug!(urn = %urn, aspect_type, "Wrote current aspect");
            Ok(())
        })
    }

    fn batch_get_union(
        &self,
        keys: &[AspectKey],
        limit: i32,
        offset: i32,
    ) -> GmaResult<Vec<AspectRecord>> {
        plan::check_limit_offset(limit, offset)?;
        let keys = distinct_keys(keys)?;
        let wanted = (offset as usize).saturating_add(limit as usize);

        self.with_conn(|conn| {
            let tx = conn.transaction().map_err(io_error)?;
            let mut found = Vec::new();
            for key in keys {
                if found.len() >= wanted {
                    break;
                }
                let Some(table) = key_table(&self.registry, key) else {
                    continue;
                };
                if let Some(raw) = fetch_record(&tx, table, key).map_err(io_error)? {
                    found.push(raw.into_record(table)?);
                }
            }
            Ok(found.into_iter().skip(offset as usize).collect())
        })
    }

    fn exists(&self, urn: &Urn) -> GmaResult<bool> {
        let Some(table) = self.registry.table_for_entity(urn.entity_type()) else {
            return Ok(false);
        };
        let sql = format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE entity_id = ?1 AND version = 0)",
            quote_ident(table)
        );
        self.with_conn(|conn| {
            conn.query_row(&sql, params![urn.as_str()], |row| row.get(0))
                .map_err(io_error)
        })
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

        let mut select = Sql::new("SELECT a0.entity_id, COUNT(*) OVER ()");
        render_match(&plan, &mut select);
        render_order(&plan, &mut select);
        select.push(" LIMIT ").bind(page_size).push(" OFFSET ").bind(start);

        let mut count = Sql::new("SELECT COUNT(*)");
        render_match(&plan, &mut count);

        debug!(table = %plan.table, sql = %select.text, "Listing urns by offset");
        self.with_conn(|conn| {
            let tx = conn.transaction().map_err(io_error)?;
            let rows = query_rows(&tx, &select, |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(io_error)?;
            let total = self
                .page_total(&tx, rows.first().map(|(_, total)| *total), &count)
                .map_err(io_error)?;
            let values = rows
                .into_iter()
                .map(|(id, _)| parse_urn(&plan.table, id))
                .collect::<GmaResult<Vec<_>>>()?;
            Ok(ListResult::new(values, total, start, page_size))
        })
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

        self.with_conn(|conn| {
            let tx = conn.transaction().map_err(io_error)?;

            let mut select = Sql::new("SELECT a0.entity_id");
            render_match(&plan, &mut select);
            if let Some(last) = last_urn {
                let bound_value = fetch_sort_value(&tx, &plan, last).map_err(io_error)?;
                render_cursor(&plan, bound_value, last, &mut select);
            }
            render_order(&plan, &mut select);
            select.push(" LIMIT ").bind(page_size);

            debug!(table = %plan.table, sql = %select.text, "Listing urns by cursor");
            let ids = query_rows(&tx, &select, |row| row.get::<_, String>(0)).map_err(io_error)?;
            ids.into_iter()
                .map(|id| parse_urn(&plan.table, id))
                .collect()
        })
    }

    fn count_aggregate(
        &self,
        filter: &IndexFilter,
        group_by: &IndexGroupByCriterion,
    ) -> GmaResult<BTreeMap<String, i64>> {
        let plan = QueryPlan::for_group_by(&self.registry, filter, group_by)?;
        let mut counts = BTreeMap::new();
        let Some(column) = plan.group_by.as_ref() else {
            return Ok(counts);
        };

        let group = column_sql(column);
        let mut select = Sql::new(&format!("SELECT {}, COUNT(*)", group));
        render_match(&plan, &mut select);
        select.push(&format!(" GROUP BY {}", group));

        let rows = self.with_conn(|conn| {
            query_rows(conn, &select, |row| {
                Ok((row.get::<_, Value>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(io_error)
        })?;
        for (value, count) in rows {
            if let Some(value) = index_value(value, column.value_type) {
                *counts.entry(value.to_string()).or_insert(0) += count;
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
        let table = quote_ident(&descriptor.table_name);

        let mut select = Sql::new(&format!(
            "SELECT entity_id, COUNT(*) OVER () FROM {} WHERE version = 0 AND aspect_type = ",
            table
        ));
        select
            .bind(aspect_type.to_string())
            .push(" ORDER BY entity_id ASC LIMIT ")
            .bind(page_size)
            .push(" OFFSET ")
            .bind(start);

        let mut count = Sql::new(&format!(
            "SELECT COUNT(*) FROM {} WHERE version = 0 AND aspect_type = ",
            table
        ));
        count.bind(aspect_type.to_string());

        self.with_conn(|conn| {
            let tx = conn.transaction().map_err(io_error)?;
            let rows = query_rows(&tx, &select, |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(io_error)?;
            let total = self
                .page_total(&tx, rows.first().map(|(_, total)| *total), &count)
                .map_err(io_error)?;
            let values = rows
                .into_iter()
                .map(|(id, _)| parse_urn(&descriptor.table_name, id))
                .collect::<GmaResult<Vec<_>>>()?;
            Ok(ListResult::new(values, total, start, page_size))
        })
    }
}

// ============================================================================
// WRITES AND SCHEMA
// ============================================================================

/// Renumber the current row, if any, and insert the new current row.
///
/// Returns the version the previous current row moved to.
fn write_current(
    conn: &mut Connection,
    table: &str,
    insert: &str,
    values: &[Value],
    urn: &Urn,
    aspect_type: &str,
) -> rusqlite::Result<Option<i64>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let (max_version, has_current): (Option<i64>, bool) = tx.query_row(
        &format!(
            "SELECT MAX(version), COUNT(CASE WHEN version = 0 THEN 1 END) > 0 \
             FROM {} WHERE entity_id = ?1 AND aspect_type = ?2",
            table
        ),
        params![urn.as_str(), aspect_type],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    let renumbered = if has_current {
        let next = max_version.unwrap_or(0) + 1;
        tx.execute(
            &format!(
                "UPDATE {} SET version = ?3 WHERE entity_id = ?1 AND aspect_type = ?2 AND version = 0",
                table
            ),
            params![urn.as_str(), aspect_type, next],
        )?;
        Some(next)
    } else {
        None
    };

    tx.execute(insert, params_from_iter(values.iter()))?;
    tx.commit()?;
    Ok(renumbered)
}

fn provision(conn: &mut Connection, registry: &SchemaRegistry) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    for table_name in registry.tables() {
        let table = quote_ident(table_name);
        tx.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                entity_id TEXT NOT NULL,
                aspect_type TEXT NOT NULL,
                version INTEGER NOT NULL,
                payload TEXT NOT NULL,
                created_by TEXT NOT NULL,
                created_on INTEGER NOT NULL,
                created_for TEXT,
                PRIMARY KEY (entity_id, aspect_type, version)
            );
            CREATE INDEX IF NOT EXISTS {index} ON {table} (aspect_type, version, entity_id);",
            table = table,
            index = quote_ident(&format!("{}_current", table_name)),
        ))?;

        let existing = table_columns(&tx, &table)?;
        for descriptor in registry.aspects_in_table(table_name) {
            for field in &descriptor.indexed_fields {
                if existing.contains(&field.column_name) {
                    continue;
                }
                tx.execute_batch(&format!(
                    "ALTER TABLE {} ADD COLUMN {} {}",
                    table,
                    quote_ident(&field.column_name),
                    column_type(field.value_type)
                ))?;
                debug!(table = table_name, column = %field.column_name, "Added index column");
            }
        }
    }
    tx.commit()
}

fn table_columns(conn: &Connection, table: &str) -> rusqlite::Result<HashSet<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    rows.collect()
}

fn column_type(value_type: IndexValueType) -> &'static str {
    match value_type {
        IndexValueType::Boolean | IndexValueType::Long => "INTEGER",
        IndexValueType::Double => "REAL",
        IndexValueType::String => "TEXT",
    }
}

// ============================================================================
// READS
// ============================================================================

/// A stored row before urn and timestamp decoding.
struct RawRecord {
    entity_id: String,
    aspect_type: String,
    version: i64,
    payload: String,
    created_by: String,
    created_on: i64,
    created_for: Option<String>,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            entity_id: row.get(0)?,
            aspect_type: row.get(1)?,
            version: row.get(2)?,
            payload: row.get(3)?,
            created_by: row.get(4)?,
            created_on: row.get(5)?,
            created_for: row.get(6)?,
        })
    }

    fn into_record(self, table: &str) -> GmaResult<AspectRecord> {
        let created_on = DateTime::from_timestamp_millis(self.created_on)
            .ok_or_else(|| corrupt(table, format!("created_on out of range: {}", self.created_on)))?;
        Ok(AspectRecord {
            urn: parse_urn(table, self.entity_id)?,
            aspect_type: self.aspect_type,
            version: self.version,
            payload: self.payload,
            created_by: parse_urn(table, self.created_by)?,
            created_on,
            created_for: self
                .created_for
                .map(|urn| parse_urn(table, urn))
                .transpose()?,
        })
    }
}

fn fetch_record(
    conn: &Connection,
    table: &str,
    key: &AspectKey,
) -> rusqlite::Result<Option<RawRecord>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM {} WHERE entity_id = ?1 AND aspect_type = ?2 AND version = ?3",
            RECORD_COLUMNS,
            quote_ident(table)
        ),
        params![key.urn.as_str(), key.aspect_type, key.version],
        RawRecord::from_row,
    )
    .optional()
}

/// Current sort column value of `last`, if the plan sorts and the row has one.
fn fetch_sort_value(
    conn: &Connection,
    plan: &QueryPlan,
    last: &Urn,
) -> rusqlite::Result<Option<Value>> {
    let Some(sort) = &plan.sort else {
        return Ok(None);
    };
    let value = conn
        .query_row(
            &format!(
                "SELECT {} FROM {} WHERE entity_id = ?1 AND aspect_type = ?2 AND version = 0",
                quote_ident(&sort.column.column),
                quote_ident(&plan.table)
            ),
            params![last.as_str(), sort.column.aspect_type],
            |row| row.get::<_, Value>(0),
        )
        .optional()?;
    Ok(value.filter(|v| *v != Value::Null))
}

fn query_rows<T>(
    conn: &Connection,
    sql: &Sql,
    f: impl FnMut(&Row<'_>) -> rusqlite::Result<T>,
) -> rusqlite::Result<Vec<T>> {
    let mut stmt = conn.prepare(&sql.text)?;
    let rows = stmt.query_map(params_from_iter(sql.params.iter()), f)?;
    rows.collect()
}

// ============================================================================
// SQL RENDERING
// ============================================================================

/// Statement text with positional parameters.
#[derive(Debug, Default)]
struct Sql {
    text: String,
    params: Vec<Value>,
}

impl Sql {
    fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            params: Vec::new(),
        }
    }

    fn push(&mut self, text: &str) -> &mut Self {
        self.text.push_str(text);
        self
    }

    fn bind(&mut self, value: impl Into<Value>) -> &mut Self {
        self.text.push('?');
        self.params.push(value.into());
        self
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn column_sql(column: &ColumnRef) -> String {
    format!("a{}.{}", column.binding, quote_ident(&column.column))
}

fn sql_value(value: &IndexValue) -> Value {
    match value {
        IndexValue::Boolean(b) => Value::Integer(i64::from(*b)),
        IndexValue::Long(n) => Value::Integer(*n),
        IndexValue::Double(d) => Value::Real(*d),
        IndexValue::String(s) => Value::Text(s.clone()),
    }
}

fn index_value(value: Value, value_type: IndexValueType) -> Option<IndexValue> {
    let value = match (value, value_type) {
        (Value::Null, _) => return None,
        (Value::Integer(n), IndexValueType::Boolean) => IndexValue::Boolean(n != 0),
        (Value::Integer(n), IndexValueType::Long) => IndexValue::Long(n),
        (Value::Integer(n), IndexValueType::Double) => IndexValue::Double(n as f64),
        (Value::Real(d), IndexValueType::Long) => IndexValue::Long(d as i64),
        (Value::Real(d), _) => IndexValue::Double(d),
        (Value::Text(s), _) => IndexValue::String(s),
        (Value::Integer(n), IndexValueType::String) => IndexValue::String(n.to_string()),
        (Value::Blob(_), _) => return None,
    };
    Some(value)
}

/// FROM, joins and WHERE for every current row the plan binds.
fn render_match(plan: &QueryPlan, sql: &mut Sql) {
    let table = quote_ident(&plan.table);
    sql.push(&format!(" FROM {} AS a0", table));
    for (binding, aspect_type) in plan.bindings.iter().enumerate().skip(1) {
        sql.push(&format!(
            " JOIN {table} AS a{b} ON a{b}.entity_id = a0.entity_id AND a{b}.version = 0 AND a{b}.aspect_type = ",
            table = table,
            b = binding
        ))
        .bind(aspect_type.clone());
    }

    let driving = plan.bindings.first().map(String::as_str).unwrap_or_default();
    sql.push(" WHERE a0.version = 0 AND a0.aspect_type = ").bind(driving.to_string());

    for predicate in &plan.predicates {
        sql.push(" AND ");
        render_predicate(predicate, sql);
    }
    let required = plan.sort.iter().map(|s| &s.column).chain(plan.group_by.iter());
    for column in required {
        sql.push(&format!(" AND {} IS NOT NULL", column_sql(column)));
    }
}

fn render_predicate(predicate: &ColumnPredicate, sql: &mut Sql) {
    let column = column_sql(&predicate.column);
    let operand = sql_value(&predicate.value);
    let operator = match predicate.condition {
        Condition::Equal => "=",
        Condition::GreaterThan => ">",
        Condition::GreaterThanOrEqualTo => ">=",
        Condition::LessThan => "<",
        Condition::LessThanOrEqualTo => "<=",
        Condition::StartWith => {
            sql.push(&format!("substr({}, 1, length(", column))
                .bind(operand.clone())
                .push(")) = ")
                .bind(operand);
            return;
        }
    };
    sql.push(&format!("{} {} ", column, operator)).bind(operand);
}

/// Keyset bound: rows strictly after `(bound_value, last)` in plan order.
fn render_cursor(plan: &QueryPlan, bound_value: Option<Value>, last: &Urn, sql: &mut Sql) {
    match (&plan.sort, bound_value) {
        (Some(sort), Some(value)) => {
            let column = column_sql(&sort.column);
            let operator = match sort.order {
                SortOrder::Ascending => ">",
                SortOrder::Descending => "<",
            };
            sql.push(&format!(" AND ({} {} ", column, operator))
                .bind(value.clone())
                .push(&format!(" OR ({} = ", column))
                .bind(value)
                .push(" AND a0.entity_id > ")
                .bind(last.to_string())
                .push("))");
        }
        _ => {
            sql.push(" AND a0.entity_id > ").bind(last.to_string());
        }
    }
}

fn render_order(plan: &QueryPlan, sql: &mut Sql) {
    match &plan.sort {
        Some(sort) => {
            let direction = match sort.order {
                SortOrder::Ascending => "ASC",
                SortOrder::Descending => "DESC",
            };
            sql.push(&format!(
                " ORDER BY {} {}, a0.entity_id ASC",
                column_sql(&sort.column),
                direction
            ));
        }
        None => {
            sql.push(" ORDER BY a0.entity_id ASC");
        }
    }
}

// ============================================================================
// ERROR MAPPING
// ============================================================================

fn io_error(err: rusqlite::Error) -> GmaError {
    StorageError::Io {
        reason: err.to_string(),
    }
    .into()
}

/// Lock contention and key collisions during a write are retryable conflicts.
fn write_error(err: rusqlite::Error, urn: &Urn, aspect_type: &str) -> GmaError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(
                failure.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::ConstraintViolation
            ) =>
        {
            warn!(urn = %urn, aspect_type, error = %err, "Aspect write conflict");
            StorageError::Conflict {
                urn: urn.to_string(),
                aspect_type: aspect_type.to_string(),
                reason: err.to_string(),
            }
            .into()
        }
        _ => io_error(err),
    }
}

fn corrupt(table: &str, reason: String) -> GmaError {
    StorageError::CorruptRow {
        table: table.to_string(),
        reason,
    }
    .into()
}

fn parse_urn(table: &str, value: String) -> GmaResult<Urn> {
    Urn::try_from(value).map_err(|e| corrupt(table, e.to_string()))
}
