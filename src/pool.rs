//! Bounded connection pool.
//!
//! [`ConnectionPool`] owns every physical connection for one database and
//! hands them out as [`PooledConnection`] guards. Capacity is enforced with a
//! semaphore sized to `max_connections`; idle connections are kept on a stack
//! so the most recently used one is reused first.
//!
//! A limit of `max_connections` connections holds at all times: a new
//! connection is only opened while holding a semaphore permit, and a permit is
//! only released after its connection has been returned to the idle stack or
//! closed.
//!
//! Pools are cheap to clone and safe to share across tasks; all internal
//! state is synchronized.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::DbConfig;
use crate::connection::DbConnection;
use crate::error::{DbError, DbResult, poisons_connection};
use crate::row::Row;
use crate::value::SqlValue;

// =============================================================================
// Pool
// =============================================================================

/// Shared handle to a connection pool.
#[derive(Debug, Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

/// Counters describing the pool at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Connections parked and ready for reuse.
    pub idle: usize,
    /// Connections currently checked out.
    pub in_use: usize,
    /// Upper bound on open connections.
    pub max_connections: u32,
}

#[derive(Debug)]
struct PoolInner {
    config: DbConfig,
    /// Idle connections, most recently released last.
    state: Mutex<PoolState>,
    /// Open connections, idle and checked out together.
    total: AtomicUsize,
    semaphore: Arc<Semaphore>,
}

#[derive(Debug)]
struct PoolState {
    idle: Vec<IdleConn>,
}

#[derive(Debug)]
struct IdleConn {
    conn: DbConnection,
    /// Completed checkouts of this connection.
    uses: u32,
}

impl ConnectionPool {
    /// Create a pool for the given configuration.
    ///
    /// Validates the configuration but opens no connections; the first
    /// connection is opened on [`acquire`](Self::acquire) or
    /// [`warm_up`](Self::warm_up).
    pub fn new(config: DbConfig) -> DbResult<Self> {
        config.validate()?;
        let max_connections = config.options.max_connections_or_default();
        info!(
            url = %config.masked_url(),
            max_connections,
            "Connection pool created"
        );
        Ok(Self {
            inner: Arc::new(PoolInner {
                semaphore: Arc::new(Semaphore::new(max_connections as usize)),
                state: Mutex::new(PoolState { idle: Vec::new() }),
                total: AtomicUsize::new(0),
                config,
            }),
        })
    }

    /// Check out a connection.
    ///
    /// With `blocking` enabled (the default) this waits for a free slot, up
    /// to the configured acquire timeout. With `blocking` disabled a full
    /// pool fails immediately with [`DbError::PoolExhausted`].
    pub async fn acquire(&self) -> DbResult<PooledConnection> {
        let inner = &self.inner;
        let options = &inner.config.options;

        let permit = if options.blocking_or_default() {
            match options.acquire_timeout() {
                Some(limit) => {
                    match timeout(limit, inner.semaphore.clone().acquire_owned()).await {
                        Ok(Ok(permit)) => permit,
                        Ok(Err(_)) => {
                            return Err(DbError::connection("Connection pool is closed"));
                        }
                        Err(_) => {
                            warn!(
                                elapsed_secs = limit.as_secs(),
                                "Timed out waiting for a pool slot"
                            );
                            return Err(DbError::timeout("connection acquire", limit.as_secs()));
                        }
                    }
                }
                None => match inner.semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return Err(DbError::connection("Connection pool is closed")),
                },
            }
        } else {
            match inner.semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    return Err(DbError::pool_exhausted(options.max_connections_or_default()));
                }
            }
        };

        if let Some(entry) = inner.state().idle.pop() {
            debug!(uses = entry.uses, "Reusing idle connection");
            return Ok(PooledConnection::attach(
                entry.conn,
                entry.uses,
                Arc::clone(inner),
                permit,
            ));
        }

        inner.total.fetch_add(1, Ordering::SeqCst);
        match inner.open_connection().await {
            Ok(conn) => Ok(PooledConnection::attach(conn, 0, Arc::clone(inner), permit)),
            Err(err) => {
                inner.total.fetch_sub(1, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    /// Open connections until `min_cached` are available, then verify the
    /// pool hands out a working connection.
    pub async fn warm_up(&self) -> DbResult<()> {
        let inner = &self.inner;
        let target = inner.config.options.min_cached_or_default() as usize;

        loop {
            if inner.total.load(Ordering::SeqCst) >= target {
                break;
            }
            // Opening is permit-gated, so a busy pool is never pushed past
            // capacity; in that case warm-up has nothing left to do.
            let Ok(permit) = inner.semaphore.clone().try_acquire_owned() else {
                break;
            };
            inner.total.fetch_add(1, Ordering::SeqCst);
            match inner.open_connection().await {
                Ok(conn) => {
                    inner.state().idle.push(IdleConn { conn, uses: 0 });
                }
                Err(err) => {
                    inner.total.fetch_sub(1, Ordering::SeqCst);
                    return Err(err);
                }
            }
            drop(permit);
        }

        let mut conn = self.acquire().await?;
        let checked = conn.fetch_all("SELECT 1", &[]).await;
        conn.release().await;
        checked?;

        let status = self.status();
        info!(idle = status.idle, "Connection pool warmed up");
        Ok(())
    }

    /// Snapshot of idle and in-use counts.
    pub fn status(&self) -> PoolStatus {
        let idle = self.inner.state().idle.len();
        let total = self.inner.total.load(Ordering::SeqCst);
        PoolStatus {
            idle,
            in_use: total.saturating_sub(idle),
            max_connections: self.inner.config.options.max_connections_or_default(),
        }
    }

    pub(crate) fn config(&self) -> &DbConfig {
        &self.inner.config
    }
}

impl PoolInner {
    /// The idle list stays usable even if a holder panicked, so recover the
    /// guard instead of propagating poison.
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn open_connection(&self) -> DbResult<DbConnection> {
        let mut conn = DbConnection::connect(&self.config).await?;
        for statement in &self.config.options.set_session {
            if let Err(e) = conn.execute(statement, &[]).await {
                conn.close().await;
                return Err(DbError::connection(format!(
                    "Session setup statement failed: {e}"
                )));
            }
        }
        debug!(url = %self.config.masked_url(), "Opened new connection");
        Ok(conn)
    }

    /// Return a connection after a checkout: park it for reuse, or close it
    /// if it is broken, worn out, or the idle stack is full.
    async fn give_back(&self, conn: DbConnection, uses: u32, broken: bool) {
        if broken {
            debug!("Discarding broken connection");
            self.discard(conn).await;
            return;
        }
        let max_usage = self.config.options.max_usage_or_default();
        if max_usage > 0 && uses >= max_usage {
            debug!(uses, max_usage, "Connection reached usage limit, closing");
            self.discard(conn).await;
            return;
        }
        let max_cached = self.config.options.max_cached_or_default() as usize;
        let overflow = {
            let mut state = self.state();
            if state.idle.len() >= max_cached {
                Some(conn)
            } else {
                state.idle.push(IdleConn { conn, uses });
                None
            }
        };
        if let Some(conn) = overflow {
            debug!("Idle stack full, closing released connection");
            self.discard(conn).await;
        }
    }

    async fn discard(&self, conn: DbConnection) {
        self.total.fetch_sub(1, Ordering::SeqCst);
        conn.close().await;
    }
}

// =============================================================================
// Pooled Connection Guard
// =============================================================================

/// A connection checked out from a [`ConnectionPool`].
///
/// Prefer [`release`](Self::release) when done; dropping the guard returns
/// the connection too, via a background task. The pool slot is freed only
/// after the connection is parked or closed.
#[derive(Debug)]
pub struct PooledConnection {
    conn: Option<DbConnection>,
    uses: u32,
    broken: bool,
    pool: Arc<PoolInner>,
    permit: Option<OwnedSemaphorePermit>,
}

impl PooledConnection {
    fn attach(
        conn: DbConnection,
        uses: u32,
        pool: Arc<PoolInner>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            conn: Some(conn),
            uses,
            broken: false,
            pool,
            permit: Some(permit),
        }
    }

    /// Execute a statement, returning the affected-row count.
    ///
    /// Applies the configured statement timeout. A timeout or a transport
    /// error marks the connection broken so it is closed instead of reused.
    pub async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<u64> {
        let limit = self.pool.config.options.query_timeout();
        let outcome = {
            let Some(conn) = self.conn.as_mut() else {
                return Err(DbError::connection("Connection already released"));
            };
            match limit {
                Some(duration) => timeout(duration, conn.execute(sql, params))
                    .await
                    .map_err(|_| duration),
                None => Ok(conn.execute(sql, params).await),
            }
        };
        match outcome {
            Ok(result) => self.check(result),
            Err(duration) => {
                self.broken = true;
                warn!(elapsed_secs = duration.as_secs(), "Statement timed out");
                Err(DbError::timeout("statement execution", duration.as_secs()))
            }
        }
    }

    /// Run a query, returning all rows.
    pub async fn fetch_all(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<Vec<Row>> {
        let limit = self.pool.config.options.query_timeout();
        let outcome = {
            let Some(conn) = self.conn.as_mut() else {
                return Err(DbError::connection("Connection already released"));
            };
            match limit {
                Some(duration) => timeout(duration, conn.fetch_all(sql, params))
                    .await
                    .map_err(|_| duration),
                None => Ok(conn.fetch_all(sql, params).await),
            }
        };
        match outcome {
            Ok(result) => self.check(result),
            Err(duration) => {
                self.broken = true;
                warn!(elapsed_secs = duration.as_secs(), "Query timed out");
                Err(DbError::timeout("query execution", duration.as_secs()))
            }
        }
    }

    /// Liveness check on the held connection.
    pub async fn ping(&mut self) -> DbResult<()> {
        let outcome = {
            let Some(conn) = self.conn.as_mut() else {
                return Err(DbError::connection("Connection already released"));
            };
            conn.ping().await
        };
        self.check(outcome)
    }

    /// Return the connection to the pool.
    pub async fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.give_back(conn, self.uses + 1, self.broken).await;
        }
    }

    pub(crate) fn mark_broken(&mut self) {
        self.broken = true;
    }

    fn check<T>(&mut self, result: Result<T, sqlx::Error>) -> DbResult<T> {
        result.map_err(|e| {
            if poisons_connection(&e) {
                self.broken = true;
            }
            DbError::from(e)
        })
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let pool = Arc::clone(&self.pool);
        let uses = self.uses + 1;
        let broken = self.broken;
        let permit = self.permit.take();
        match Handle::try_current() {
            Ok(handle) => {
                debug!("Releasing pooled connection on drop");
                handle.spawn(async move {
                    pool.give_back(conn, uses, broken).await;
                    drop(permit);
                });
            }
            Err(_) => {
                // No runtime to close on; account for it and let the socket
                // drop with the connection.
                pool.total.fetch_sub(1, Ordering::SeqCst);
                drop(conn);
                drop(permit);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
