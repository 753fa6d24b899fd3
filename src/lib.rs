//! dbkit
//!
//! Pooled database access for MySQL and SQLite: a bounded connection pool,
//! a validated SELECT builder, and a CRUD facade with explicit transaction
//! scopes. Values always travel as bound parameters; identifiers are
//! validated before they reach SQL text.

pub mod config;
pub mod error;
pub mod manager;
pub mod pool;
pub mod query;
pub mod row;
pub mod transaction;
pub mod value;

mod connection;
mod ident;

pub use config::{Backend, DbConfig, PoolOptions};
pub use error::{DbError, DbResult};
pub use manager::{DataManager, ReadOptions};
pub use pool::{ConnectionPool, PoolStatus, PooledConnection};
pub use query::{Filter, JoinType, Predicate, QueryBuilder};
pub use row::Row;
pub use transaction::TransactionScope;
pub use value::{Record, SqlValue};
