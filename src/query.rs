//! SELECT statement builder.
//!
//! [`QueryBuilder`] assembles a statement from typed parts and renders it
//! with [`build`](QueryBuilder::build): a SQL string using `?` placeholders
//! plus the parameters in placeholder order. Rendering is pure; the same
//! builder always renders the same statement, and building does not touch
//! the database.
//!
//! Every identifier that reaches the SQL text is validated against the
//! grammar in [`crate::ident`]. Values never appear in the text; they travel
//! as bound parameters.

use tracing::debug;

use crate::error::{DbError, DbResult};
use crate::ident::{validate_on_clause, validate_projection_entry, validate_qualified};
use crate::manager::DataManager;
use crate::row::Row;
use crate::value::SqlValue;

// =============================================================================
// Predicates
// =============================================================================

/// One WHERE condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Equals { column: String, value: SqlValue },
    Like { column: String, pattern: String },
    GreaterThan { column: String, value: SqlValue },
    Between { column: String, low: SqlValue, high: SqlValue },
    IsNull { column: String },
}

impl Predicate {
    fn column(&self) -> &str {
        match self {
            Self::Equals { column, .. }
            | Self::Like { column, .. }
            | Self::GreaterThan { column, .. }
            | Self::Between { column, .. }
            | Self::IsNull { column } => column,
        }
    }

    fn render(&self, sql: &mut String, params: &mut Vec<SqlValue>) -> DbResult<()> {
        validate_qualified(self.column())?;
        match self {
            Self::Equals { column, value } => {
                sql.push_str(column);
                sql.push_str(" = ?");
                params.push(value.clone());
            }
            Self::Like { column, pattern } => {
                sql.push_str(column);
                sql.push_str(" LIKE ?");
                params.push(SqlValue::Text(pattern.clone()));
            }
            Self::GreaterThan { column, value } => {
                sql.push_str(column);
                sql.push_str(" > ?");
                params.push(value.clone());
            }
            Self::Between { column, low, high } => {
                sql.push_str(column);
                sql.push_str(" BETWEEN ? AND ?");
                params.push(low.clone());
                params.push(high.clone());
            }
            Self::IsNull { column } => {
                sql.push_str(column);
                sql.push_str(" IS NULL");
            }
        }
        Ok(())
    }
}

/// Ordered conjunction of predicates.
///
/// Conditions are combined with `AND` in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    predicates: Vec<Predicate>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.predicates.push(Predicate::Equals {
            column: column.into(),
            value: value.into(),
        });
        self
    }

    /// Substring match: the value is wrapped in `%` wildcards on both sides.
    /// For a custom pattern, push a [`Predicate::Like`] through
    /// [`Filter::push`] instead.
    pub fn like(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.predicates.push(Predicate::Like {
            column: column.into(),
            pattern: format!("%{}%", value.into()),
        });
        self
    }

    pub fn gt(mut self, column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.predicates.push(Predicate::GreaterThan {
            column: column.into(),
            value: value.into(),
        });
        self
    }

    pub fn between(
        mut self,
        column: impl Into<String>,
        low: impl Into<SqlValue>,
        high: impl Into<SqlValue>,
    ) -> Self {
        self.predicates.push(Predicate::Between {
            column: column.into(),
            low: low.into(),
            high: high.into(),
        });
        self
    }

    pub fn is_null(mut self, column: impl Into<String>) -> Self {
        self.predicates.push(Predicate::IsNull {
            column: column.into(),
        });
        self
    }

    /// Append a predicate built directly, bypassing the helpers.
    pub fn push(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.predicates.len()
    }

    /// Render as `a = ? AND b LIKE ? ...`, appending values to `params`.
    pub(crate) fn render(&self, params: &mut Vec<SqlValue>) -> DbResult<String> {
        let mut sql = String::new();
        for (i, predicate) in self.predicates.iter().enumerate() {
            if i > 0 {
                sql.push_str(" AND ");
            }
            predicate.render(&mut sql, params)?;
        }
        Ok(sql)
    }
}

// =============================================================================
// Joins
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    Left,
    Right,
}

impl JoinType {
    fn as_sql(self) -> &'static str {
        match self {
            Self::Inner => "INNER JOIN",
            Self::Left => "LEFT JOIN",
            Self::Right => "RIGHT JOIN",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct JoinClause {
    kind: JoinType,
    table: String,
    on: String,
}

// =============================================================================
// Query Builder
// =============================================================================

/// Fluent builder for SELECT statements.
///
/// Obtained detached via [`QueryBuilder::new`], or bound to a manager via
/// [`DataManager::query`] so [`execute`](Self::execute) can run the result.
#[derive(Debug, Clone, Default)]
pub struct QueryBuilder {
    manager: Option<DataManager>,
    table: Option<String>,
    columns: Vec<String>,
    distinct: bool,
    filter: Filter,
    joins: Vec<JoinClause>,
    group_by: Vec<String>,
    order_by: Vec<(String, bool)>,
    limit: Option<u64>,
    offset: Option<u64>,
}

impl QueryBuilder {
    /// A detached builder; [`build`](Self::build) works, [`execute`](Self::execute) does not.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn attached(manager: DataManager) -> Self {
        Self {
            manager: Some(manager),
            ..Self::default()
        }
    }

    /// Set the projection. An empty selection renders as `*`.
    pub fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Deduplicate result rows with `SELECT DISTINCT`.
    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn from_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn where_eq(mut self, column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.filter = self.filter.eq(column, value);
        self
    }

    /// Substring match; the value is wrapped in `%` wildcards on both sides.
    pub fn where_like(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.filter = self.filter.like(column, value);
        self
    }

    pub fn where_gt(mut self, column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.filter = self.filter.gt(column, value);
        self
    }

    pub fn where_between(
        mut self,
        column: impl Into<String>,
        low: impl Into<SqlValue>,
        high: impl Into<SqlValue>,
    ) -> Self {
        self.filter = self.filter.between(column, low, high);
        self
    }

    pub fn where_null(mut self, column: impl Into<String>) -> Self {
        self.filter = self.filter.is_null(column);
        self
    }

    /// Replace the WHERE clause with a prebuilt [`Filter`].
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    /// Add a join. `on` must be column equalities joined by `AND`, for
    /// example `orders.user_id = users.id`.
    pub fn join(
        mut self,
        kind: JoinType,
        table: impl Into<String>,
        on: impl Into<String>,
    ) -> Self {
        self.joins.push(JoinClause {
            kind,
            table: table.into(),
            on: on.into(),
        });
        self
    }

    pub fn group_by<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group_by.extend(columns.into_iter().map(Into::into));
        self
    }

    /// Append an ordering term; `descending` selects `DESC`.
    pub fn order_by(mut self, column: impl Into<String>, descending: bool) -> Self {
        self.order_by.push((column.into(), descending));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skip rows before the result window. Emitted only when a limit is set.
    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Render the statement and its parameters.
    ///
    /// Fails with [`DbError::MissingTable`] when no table was set, and with
    /// [`DbError::InvalidIdentifier`] when any name falls outside the
    /// identifier grammar.
    pub fn build(&self) -> DbResult<(String, Vec<SqlValue>)> {
        let Some(table) = &self.table else {
            return Err(DbError::MissingTable);
        };
        validate_qualified(table)?;

        let mut params = Vec::new();
        let mut sql = String::from("SELECT ");
        if self.distinct {
            sql.push_str("DISTINCT ");
        }

        if self.columns.is_empty() {
            sql.push('*');
        } else {
            for (i, column) in self.columns.iter().enumerate() {
                validate_projection_entry(column)?;
                if i > 0 {
                    sql.push_str(", ");
                }
                sql.push_str(column);
            }
        }

        sql.push_str(" FROM ");
        sql.push_str(table);

        for join in &self.joins {
            validate_qualified(&join.table)?;
            validate_on_clause(&join.on)?;
            sql.push(' ');
            sql.push_str(join.kind.as_sql());
            sql.push(' ');
            sql.push_str(&join.table);
            sql.push_str(" ON ");
            sql.push_str(join.on.trim());
        }

        if !self.filter.is_empty() {
            sql.push_str(" WHERE ");
            let clause = self.filter.render(&mut params)?;
            sql.push_str(&clause);
        }

        if !self.group_by.is_empty() {
            sql.push_str(" GROUP BY ");
            for (i, column) in self.group_by.iter().enumerate() {
                validate_qualified(column)?;
                if i > 0 {
                    sql.push_str(", ");
                }
                sql.push_str(column);
            }
        }

        if !self.order_by.is_empty() {
            sql.push_str(" ORDER BY ");
            for (i, (column, descending)) in self.order_by.iter().enumerate() {
                validate_qualified(column)?;
                if i > 0 {
                    sql.push_str(", ");
                }
                sql.push_str(column);
                if *descending {
                    sql.push_str(" DESC");
                }
            }
        }

        if let Some(limit) = self.limit {
            sql.push_str(" LIMIT ?");
            params.push(SqlValue::Int(count_param("LIMIT", limit)?));
            if let Some(offset) = self.offset {
                sql.push_str(" OFFSET ?");
                params.push(SqlValue::Int(count_param("OFFSET", offset)?));
            }
        }

        Ok((sql, params))
    }

    /// Build and run the query through the bound manager.
    pub async fn execute(&self) -> DbResult<Vec<Row>> {
        let Some(manager) = &self.manager else {
            return Err(DbError::invalid_argument(
                "Query builder is not attached to a data manager",
            ));
        };
        let (sql, params) = self.build()?;
        debug!(sql = %sql, params = params.len(), "Executing built query");
        manager.query_raw(&sql, &params).await
    }
}

/// LIMIT and OFFSET bind as signed 64-bit parameters.
fn count_param(clause: &str, value: u64) -> DbResult<i64> {
    i64::try_from(value).map_err(|_| {
        DbError::invalid_argument(format!("{clause} value {value} is out of range"))
    })
}

// =============================================================================
// Tests
// =============================================================================
