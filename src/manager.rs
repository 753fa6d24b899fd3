//! Data access facade.
//!
//! [`DataManager`] is the single entry point for CRUD, batch, raw-SQL and
//! transactional access. It owns a [`ConnectionPool`] handle and is cheap to
//! clone; every operation checks a connection out, runs, and returns it on
//! all paths.
//!
//! Statement rendering is separated from execution: the `render_*` helpers
//! are pure and validate every identifier before it reaches SQL text, so a
//! bad table or column name fails before a connection is ever acquired.

use std::fmt;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::config::DbConfig;
use crate::error::{DbError, DbResult};
use crate::ident::{validate_identifier, validate_qualified};
use crate::pool::{ConnectionPool, PoolStatus};
use crate::query::{Filter, QueryBuilder};
use crate::row::Row;
use crate::transaction::TransactionScope;
use crate::value::{Record, SqlValue};

/// Options for [`DataManager::read`].
///
/// `page` and `page_size` paginate only when both are set; the offset is
/// `(page - 1) * page_size` with pages starting at 1. A non-empty
/// `distinct_columns` switches the projection to `SELECT DISTINCT` and
/// overrides `columns`.
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    pub columns: Vec<String>,
    pub filter: Filter,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    pub distinct_columns: Vec<String>,
}

/// Shared facade over one connection pool.
#[derive(Clone)]
pub struct DataManager {
    pool: ConnectionPool,
}

impl DataManager {
    /// Create a manager with its own pool for `config`.
    pub fn new(config: DbConfig) -> DbResult<Self> {
        Ok(Self {
            pool: ConnectionPool::new(config)?,
        })
    }

    /// Create a manager over an existing pool, sharing its connections.
    pub fn with_pool(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Insert one record; returns the affected-row count.
    pub async fn create(&self, table: &str, record: &Record) -> DbResult<u64> {
        let (sql, params) = render_insert(table, record)?;
        let started = Instant::now();
        let affected = self.execute_raw(&sql, &params).await?;
        info!(
            table,
            rows = affected,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Row created"
        );
        Ok(affected)
    }

    /// Query rows with optional projection, filter, pagination and DISTINCT.
    pub async fn read(&self, table: &str, options: &ReadOptions) -> DbResult<Vec<Row>> {
        let (sql, params) = render_read(table, options)?;
        self.query_raw(&sql, &params).await
    }

    /// Update rows matching `filter`; returns the affected-row count.
    ///
    /// An empty filter is rejected so a forgotten WHERE clause cannot
    /// rewrite a whole table.
    pub async fn update(&self, table: &str, changes: &Record, filter: &Filter) -> DbResult<u64> {
        let (sql, params) = render_update(table, changes, filter)?;
        let started = Instant::now();
        let affected = self.execute_raw(&sql, &params).await?;
        info!(
            table,
            rows = affected,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Rows updated"
        );
        Ok(affected)
    }

    /// Delete rows matching `filter`; returns the affected-row count.
    ///
    /// An empty filter is rejected, as with [`update`](Self::update).
    pub async fn delete(&self, table: &str, filter: &Filter) -> DbResult<u64> {
        let (sql, params) = render_delete(table, filter)?;
        let started = Instant::now();
        let affected = self.execute_raw(&sql, &params).await?;
        info!(
            table,
            rows = affected,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Rows deleted"
        );
        Ok(affected)
    }

    /// Insert many records in one statement, atomically.
    ///
    /// All records must carry the first record's column set; field order may
    /// differ, values bind in the first record's order. An empty slice
    /// succeeds without touching the pool. The insert runs inside a
    /// transaction, so the whole batch commits or none of it does.
    pub async fn batch_create(&self, table: &str, records: &[Record]) -> DbResult<u64> {
        if records.is_empty() {
            return Ok(0);
        }
        let (sql, params) = render_batch_insert(table, records)?;
        let started = Instant::now();
        debug!(sql = %sql, params = params.len(), "Executing batch insert");

        let mut tx = self.transaction().await?;
        match tx.execute(&sql, &params).await {
            Ok(affected) => {
                tx.commit().await?;
                info!(
                    table,
                    rows = affected,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Batch insert committed"
                );
                Ok(affected)
            }
            Err(e) => {
                error!(table, error = %e, "Batch insert failed, rolling back");
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "Rollback after failed batch insert failed");
                }
                Err(e)
            }
        }
    }

    /// Run an arbitrary parameterized query and return its rows.
    pub async fn query_raw(&self, sql: &str, params: &[SqlValue]) -> DbResult<Vec<Row>> {
        debug!(sql = %sql, params = params.len(), "Executing query");
        let mut conn = self.pool.acquire().await?;
        let result = conn.fetch_all(sql, params).await;
        conn.release().await;
        result
    }

    /// Run an arbitrary parameterized statement and return affected rows.
    pub async fn execute_raw(&self, sql: &str, params: &[SqlValue]) -> DbResult<u64> {
        debug!(sql = %sql, params = params.len(), "Executing statement");
        let mut conn = self.pool.acquire().await?;
        let result = conn.execute(sql, params).await;
        conn.release().await;
        result
    }

    /// Start a [`QueryBuilder`] whose `execute()` runs through this manager.
    pub fn query(&self) -> QueryBuilder {
        QueryBuilder::attached(self.clone())
    }

    /// Open a transaction on a dedicated connection.
    pub async fn transaction(&self) -> DbResult<TransactionScope> {
        let conn = self.pool.acquire().await?;
        TransactionScope::begin(conn).await
    }

    /// Pre-open connections up to the configured minimum and verify one.
    pub async fn warm_up(&self) -> DbResult<()> {
        self.pool.warm_up().await
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }
}

impl fmt::Debug for DataManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataManager")
            .field("url", &self.pool.config().masked_url())
            .finish()
    }
}

// =============================================================================
// Statement Rendering
// =============================================================================

fn render_insert(table: &str, record: &Record) -> DbResult<(String, Vec<SqlValue>)> {
    validate_qualified(table)?;
    if record.is_empty() {
        return Err(DbError::invalid_argument("Record has no fields"));
    }
    let mut columns = String::new();
    let mut placeholders = String::new();
    let mut params = Vec::with_capacity(record.len());
    for (i, (column, value)) in record.fields().iter().enumerate() {
        validate_identifier(column)?;
        if i > 0 {
            columns.push_str(", ");
            placeholders.push_str(", ");
        }
        columns.push_str(column);
        placeholders.push('?');
        params.push(value.clone());
    }
    let sql = format!("INSERT INTO {table} ({columns}) VALUES ({placeholders})");
    Ok((sql, params))
}

fn render_read(table: &str, options: &ReadOptions) -> DbResult<(String, Vec<SqlValue>)> {
    let mut query = QueryBuilder::new().from_table(table);
    if !options.distinct_columns.is_empty() {
        query = query.select(options.distinct_columns.clone()).distinct();
    } else if !options.columns.is_empty() {
        query = query.select(options.columns.clone());
    }
    query = query.filter(options.filter.clone());
    if let (Some(page), Some(page_size)) = (options.page, options.page_size) {
        if page < 1 {
            return Err(DbError::invalid_argument("page numbers start at 1"));
        }
        let offset = u64::from(page - 1) * u64::from(page_size);
        query = query.limit(u64::from(page_size)).offset(offset);
    }
    query.build()
}

fn render_update(table: &str, changes: &Record, filter: &Filter) -> DbResult<(String, Vec<SqlValue>)> {
    validate_qualified(table)?;
    if changes.is_empty() {
        return Err(DbError::invalid_argument("Update has no fields to set"));
    }
    if filter.is_empty() {
        return Err(DbError::invalid_argument(
            "Refusing an update without a WHERE filter",
        ));
    }
    let mut params = Vec::new();
    let mut sql = format!("UPDATE {table} SET ");
    for (i, (column, value)) in changes.fields().iter().enumerate() {
        validate_identifier(column)?;
        if i > 0 {
            sql.push_str(", ");
        }
        sql.push_str(column);
        sql.push_str(" = ?");
        params.push(value.clone());
    }
    sql.push_str(" WHERE ");
    let clause = filter.render(&mut params)?;
    sql.push_str(&clause);
    Ok((sql, params))
}

fn render_delete(table: &str, filter: &Filter) -> DbResult<(String, Vec<SqlValue>)> {
    validate_qualified(table)?;
    if filter.is_empty() {
        return Err(DbError::invalid_argument(
            "Refusing a delete without a WHERE filter",
        ));
    }
    let mut params = Vec::new();
    let clause = filter.render(&mut params)?;
    Ok((format!("DELETE FROM {table} WHERE {clause}"), params))
}

fn render_batch_insert(table: &str, records: &[Record]) -> DbResult<(String, Vec<SqlValue>)> {
    validate_qualified(table)?;
    let Some(first) = records.first() else {
        return Err(DbError::invalid_argument("Batch has no records"));
    };
    if first.is_empty() {
        return Err(DbError::invalid_argument("Record has no fields"));
    }

    let columns: Vec<&str> = first.columns().collect();
    let mut column_list = String::new();
    for (i, column) in columns.iter().enumerate() {
        validate_identifier(column)?;
        if i > 0 {
            column_list.push_str(", ");
        }
        column_list.push_str(column);
    }

    let mut params = Vec::with_capacity(records.len() * columns.len());
    for (idx, record) in records.iter().enumerate() {
        if record.len() != columns.len() {
            return Err(DbError::invalid_argument(format!(
                "Record {idx} does not match the first record's columns"
            )));
        }
        for &column in &columns {
            let Some(value) = record.get(column) else {
                return Err(DbError::invalid_argument(format!(
                    "Record {idx} is missing column '{column}'"
                )));
            };
            params.push(value.clone());
        }
    }

    let row = format!("({})", vec!["?"; columns.len()].join(", "));
    let mut sql = format!("INSERT INTO {table} ({column_list}) VALUES ");
    for i in 0..records.len() {
        if i > 0 {
            sql.push_str(", ");
        }
        sql.push_str(&row);
    }
    Ok((sql, params))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_placeholders_match_record_len() {
        let record = Record::new().set("name", "Ada").set("age", 36).set("active", true);
        let (sql, params) = render_insert("users", &record).unwrap();
        assert_eq!(sql, "INSERT INTO users (name, age, active) VALUES (?, ?, ?)");
        assert_eq!(sql.matches('?').count(), record.len());
        assert_eq!(
            params,
            vec![
                SqlValue::Text("Ada".into()),
                SqlValue::Int(36),
                SqlValue::Bool(true)
            ]
        );
    }

    #[test]
    fn test_insert_requires_fields() {
        let err = render_insert("users", &Record::new()).unwrap_err();
        assert!(matches!(err, DbError::InvalidArgument { .. }));
    }

    #[test]
    fn test_insert_rejects_bad_column() {
        let record = Record::new().set("name) VALUES ('x'); --", "x");
        let err = render_insert("users", &record).unwrap_err();
        assert!(matches!(err, DbError::InvalidIdentifier { .. }));
    }

    #[test]
    fn test_update_binds_record_then_filter() {
        let changes = Record::new().set("status", "closed").set("total", 9);
        let filter = Filter::new().eq("id", 3);
        let (sql, params) = render_update("orders", &changes, &filter).unwrap();
        assert_eq!(sql, "UPDATE orders SET status = ?, total = ? WHERE id = ?");
        assert_eq!(
            params,
            vec![
                SqlValue::Text("closed".into()),
                SqlValue::Int(9),
                SqlValue::Int(3)
            ]
        );
    }

    #[test]
    fn test_update_requires_filter() {
        let changes = Record::new().set("status", "closed");
        let err = render_update("orders", &changes, &Filter::new()).unwrap_err();
        assert!(matches!(err, DbError::InvalidArgument { .. }));
    }

    #[test]
    fn test_delete_renders_where() {
        let filter = Filter::new().eq("id", 5).is_null("deleted_at");
        let (sql, params) = render_delete("orders", &filter).unwrap();
        assert_eq!(sql, "DELETE FROM orders WHERE id = ? AND deleted_at IS NULL");
        assert_eq!(params, vec![SqlValue::Int(5)]);
    }

    #[test]
    fn test_delete_requires_filter() {
        let err = render_delete("orders", &Filter::new()).unwrap_err();
        assert!(matches!(err, DbError::InvalidArgument { .. }));
    }

    #[test]
    fn test_batch_insert_is_one_statement() {
        let records = vec![
            Record::new().set("sku", "A-1").set("qty", 2),
            Record::new().set("sku", "B-2").set("qty", 5),
            Record::new().set("sku", "C-3").set("qty", 1),
        ];
        let (sql, params) = render_batch_insert("items", &records).unwrap();
        assert_eq!(
            sql,
            "INSERT INTO items (sku, qty) VALUES (?, ?), (?, ?), (?, ?)"
        );
        assert_eq!(params.len(), 6);
        assert_eq!(params[4], SqlValue::Text("C-3".into()));
    }

    #[test]
    fn test_batch_binds_in_first_record_order() {
        let records = vec![
            Record::new().set("sku", "A-1").set("qty", 2),
            Record::new().set("qty", 5).set("sku", "B-2"),
        ];
        let (_, params) = render_batch_insert("items", &records).unwrap();
        assert_eq!(params[2], SqlValue::Text("B-2".into()));
        assert_eq!(params[3], SqlValue::Int(5));
    }

    #[test]
    fn test_batch_rejects_mismatched_columns() {
        let records = vec![
            Record::new().set("sku", "A-1").set("qty", 2),
            Record::new().set("sku", "B-2").set("price", 10),
        ];
        let err = render_batch_insert("items", &records).unwrap_err();
        assert!(matches!(err, DbError::InvalidArgument { .. }));

        let records = vec![
            Record::new().set("sku", "A-1"),
            Record::new().set("sku", "B-2").set("qty", 5),
        ];
        let err = render_batch_insert("items", &records).unwrap_err();
        assert!(matches!(err, DbError::InvalidArgument { .. }));
    }

    #[test]
    fn test_read_page_math() {
        let options = ReadOptions {
            page: Some(2),
            page_size: Some(10),
            ..Default::default()
        };
        let (sql, params) = render_read("users", &options).unwrap();
        assert_eq!(sql, "SELECT * FROM users LIMIT ? OFFSET ?");
        assert_eq!(params, vec![SqlValue::Int(10), SqlValue::Int(10)]);
    }

    #[test]
    fn test_read_first_page_starts_at_zero() {
        let options = ReadOptions {
            page: Some(1),
            page_size: Some(25),
            ..Default::default()
        };
        let (_, params) = render_read("users", &options).unwrap();
        assert_eq!(params, vec![SqlValue::Int(25), SqlValue::Int(0)]);
    }

    #[test]
    fn test_read_page_zero_rejected() {
        let options = ReadOptions {
            page: Some(0),
            page_size: Some(10),
            ..Default::default()
        };
        let err = render_read("users", &options).unwrap_err();
        assert!(matches!(err, DbError::InvalidArgument { .. }));
    }

    #[test]
    fn test_read_ignores_page_without_size() {
        let options = ReadOptions {
            page: Some(3),
            ..Default::default()
        };
        let (sql, _) = render_read("users", &options).unwrap();
        assert_eq!(sql, "SELECT * FROM users");
    }

    #[test]
    fn test_read_distinct_overrides_columns() {
        let options = ReadOptions {
            columns: vec!["id".into(), "name".into()],
            distinct_columns: vec!["city".into()],
            ..Default::default()
        };
        let (sql, _) = render_read("customers", &options).unwrap();
        assert_eq!(sql, "SELECT DISTINCT city FROM customers");
    }

    #[test]
    fn test_read_renders_filter() {
        let options = ReadOptions {
            filter: Filter::new().eq("status", "open").gt("total", 50),
            ..Default::default()
        };
        let (sql, params) = render_read("orders", &options).unwrap();
        assert_eq!(sql, "SELECT * FROM orders WHERE status = ? AND total > ?");
        assert_eq!(params.len(), 2);
    }
}
