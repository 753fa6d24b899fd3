//! Single database connections.
//!
//! [`DbConnection`] wraps one live backend connection behind an enum so the
//! pool and the operations above it stay backend-agnostic. Both backends use
//! `?` placeholders, so rendered SQL is shared; the per-backend submodules
//! below provide identical execute/fetch functionality adapted to each
//! driver.
//!
//! Statements with no parameters run unprepared. Transaction control
//! (`BEGIN`, `COMMIT`, `ROLLBACK`) is not preparable on MySQL, and the
//! unprepared path handles it uniformly.

use sqlx::{Connection, MySqlConnection, SqliteConnection};
use sqlx::mysql::MySqlConnectOptions;
use sqlx::sqlite::SqliteConnectOptions;
use tracing::debug;

use crate::config::{Backend, DbConfig};
use crate::error::{DbError, DbResult};
use crate::row::{Row, RowToJson};
use crate::value::SqlValue;

/// One live connection to the configured database.
#[derive(Debug)]
pub(crate) enum DbConnection {
    MySql(MySqlConnection),
    Sqlite(SqliteConnection),
}

impl DbConnection {
    /// Open a new connection for the given configuration.
    pub(crate) async fn connect(config: &DbConfig) -> DbResult<Self> {
        match config.backend {
            Backend::MySql => {
                let mut options = MySqlConnectOptions::new()
                    .host(&config.host)
                    .port(config.port)
                    .username(&config.user)
                    .database(&config.database);
                if !config.password.is_empty() {
                    options = options.password(&config.password);
                }
                if !config.charset.is_empty() {
                    options = options.charset(&config.charset);
                }
                let conn = MySqlConnection::connect_with(&options).await.map_err(|e| {
                    DbError::connection(format!(
                        "Failed to connect to {}: {}",
                        config.masked_url(),
                        e
                    ))
                })?;
                Ok(Self::MySql(conn))
            }
            Backend::Sqlite => {
                let options = SqliteConnectOptions::new()
                    .filename(&config.database)
                    .create_if_missing(true);
                let conn = SqliteConnection::connect_with(&options).await.map_err(|e| {
                    DbError::connection(format!(
                        "Failed to connect to {}: {}",
                        config.masked_url(),
                        e
                    ))
                })?;
                Ok(Self::Sqlite(conn))
            }
        }
    }

    /// Execute a statement and return the affected-row count.
    ///
    /// Raw `sqlx::Error` is surfaced so the pool can decide whether the
    /// connection is still usable.
    pub(crate) async fn execute(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<u64, sqlx::Error> {
        match self {
            Self::MySql(conn) => mysql::execute_write(conn, sql, params).await,
            Self::Sqlite(conn) => sqlite::execute_write(conn, sql, params).await,
        }
    }

    /// Run a query and return all rows as JSON maps.
    pub(crate) async fn fetch_all(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Vec<Row>, sqlx::Error> {
        match self {
            Self::MySql(conn) => {
                let rows = mysql::fetch_rows(conn, sql, params).await?;
                Ok(rows.iter().map(|row| row.to_json_map()).collect())
            }
            Self::Sqlite(conn) => {
                let rows = sqlite::fetch_rows(conn, sql, params).await?;
                Ok(rows.iter().map(|row| row.to_json_map()).collect())
            }
        }
    }

    /// Liveness check on the underlying connection.
    pub(crate) async fn ping(&mut self) -> Result<(), sqlx::Error> {
        match self {
            Self::MySql(conn) => conn.ping().await,
            Self::Sqlite(conn) => conn.ping().await,
        }
    }

    /// Close the connection, logging (not surfacing) close errors.
    pub(crate) async fn close(self) {
        let result = match self {
            Self::MySql(conn) => conn.close().await,
            Self::Sqlite(conn) => conn.close().await,
        };
        if let Err(e) = result {
            debug!(error = %e, "Error closing connection");
        }
    }
}

// =============================================================================
// Database-Specific Implementations
// =============================================================================
//
// Each module provides the same interface adapted to its database type. The
// code structure is intentionally parallel to make differences obvious.

mod mysql {
    use sqlx::Executor;
    use sqlx::mysql::MySqlRow;

    use crate::value::{SqlValue, bind_mysql_value};

    pub async fn fetch_rows(
        conn: &mut sqlx::MySqlConnection,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Vec<MySqlRow>, sqlx::Error> {
        if params.is_empty() {
            conn.fetch_all(sql).await
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_mysql_value(query, param);
            }
            query.fetch_all(&mut *conn).await
        }
    }

    pub async fn execute_write(
        conn: &mut sqlx::MySqlConnection,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<u64, sqlx::Error> {
        if params.is_empty() {
            conn.execute(sql).await.map(|r| r.rows_affected())
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_mysql_value(query, param);
            }
            query.execute(&mut *conn).await.map(|r| r.rows_affected())
        }
    }
}

mod sqlite {
    use sqlx::Executor;
    use sqlx::sqlite::SqliteRow;

    use crate::value::{SqlValue, bind_sqlite_value};

    pub async fn fetch_rows(
        conn: &mut sqlx::SqliteConnection,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Vec<SqliteRow>, sqlx::Error> {
        if params.is_empty() {
            conn.fetch_all(sql).await
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_sqlite_value(query, param);
            }
            query.fetch_all(&mut *conn).await
        }
    }

    pub async fn execute_write(
        conn: &mut sqlx::SqliteConnection,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<u64, sqlx::Error> {
        if params.is_empty() {
            conn.execute(sql).await.map(|r| r.rows_affected())
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_sqlite_value(query, param);
            }
            query.execute(&mut *conn).await.map(|r| r.rows_affected())
        }
    }
}
