//! Explicit transaction scopes.
//!
//! A [`TransactionScope`] pins one pooled connection for the lifetime of a
//! transaction. Statements issued through the scope run on that connection
//! in order. The scope ends in exactly one of three ways: an explicit
//! [`commit`](TransactionScope::commit), an explicit
//! [`rollback`](TransactionScope::rollback), or a drop, which rolls back.
//! All three return the connection to the pool.
//!
//! `BEGIN`, `COMMIT` and `ROLLBACK` run unprepared, which both backends
//! accept for transaction control.

use tokio::runtime::Handle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{DbError, DbResult};
use crate::pool::PooledConnection;
use crate::row::Row;
use crate::value::SqlValue;

/// An open transaction on one pooled connection.
pub struct TransactionScope {
    conn: Option<PooledConnection>,
    id: String,
}

impl TransactionScope {
    /// Start a transaction on the given connection.
    ///
    /// On failure the connection goes back to the pool and the error is
    /// surfaced as [`DbError::Transaction`].
    pub(crate) async fn begin(mut conn: PooledConnection) -> DbResult<Self> {
        let id = format!("tx_{}", Uuid::new_v4().simple());
        if let Err(e) = conn.execute("BEGIN", &[]).await {
            conn.release().await;
            return Err(DbError::transaction(
                format!("Failed to begin transaction: {e}"),
                &id,
            ));
        }
        info!(transaction_id = %id, "Transaction started");
        Ok(Self { conn: Some(conn), id })
    }

    /// Identifier for correlating this transaction in logs and errors.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Execute a statement inside the transaction.
    ///
    /// A statement error leaves the transaction open; the caller chooses
    /// whether to roll back or try something else.
    pub async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<u64> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(DbError::transaction("Transaction already finished", &self.id));
        };
        conn.execute(sql, params).await
    }

    /// Run a query inside the transaction, seeing its uncommitted writes.
    pub async fn fetch(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<Vec<Row>> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(DbError::transaction("Transaction already finished", &self.id));
        };
        conn.fetch_all(sql, params).await
    }

    /// Commit and return the connection to the pool.
    pub async fn commit(mut self) -> DbResult<()> {
        let Some(mut conn) = self.conn.take() else {
            return Err(DbError::transaction("Transaction already finished", &self.id));
        };
        let result = conn.execute("COMMIT", &[]).await;
        if result.is_err() {
            // Commit state is unknown; the connection must not be reused.
            conn.mark_broken();
        }
        conn.release().await;
        match result {
            Ok(_) => {
                info!(transaction_id = %self.id, "Transaction committed");
                Ok(())
            }
            Err(e) => Err(DbError::transaction(
                format!("Commit failed: {e}"),
                &self.id,
            )),
        }
    }

    /// Roll back and return the connection to the pool.
    pub async fn rollback(mut self) -> DbResult<()> {
        let Some(mut conn) = self.conn.take() else {
            return Err(DbError::transaction("Transaction already finished", &self.id));
        };
        let result = conn.execute("ROLLBACK", &[]).await;
        if result.is_err() {
            conn.mark_broken();
        }
        conn.release().await;
        match result {
            Ok(_) => {
                info!(transaction_id = %self.id, "Transaction rolled back");
                Ok(())
            }
            Err(e) => Err(DbError::transaction(
                format!("Rollback failed: {e}"),
                &self.id,
            )),
        }
    }
}

impl Drop for TransactionScope {
    fn drop(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        let id = self.id.clone();
        match Handle::try_current() {
            Ok(handle) => {
                warn!(transaction_id = %id, "Transaction dropped without commit, rolling back");
                handle.spawn(async move {
                    if conn.execute("ROLLBACK", &[]).await.is_err() {
                        conn.mark_broken();
                    }
                    conn.release().await;
                });
            }
            Err(_) => {
                // No runtime left; dropping the guard closes the connection
                // and the server aborts the open transaction with it.
                drop(conn);
            }
        }
    }
}
