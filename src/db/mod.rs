//! Database access layer.
//!
//! This module provides:
//! - The connection pool and its single-construction manager
//! - Leased connections and transactions
//! - SQL execution tracing
//! - Driver dispatch macro for the per-driver enums

mod macros;

pub mod connection;
pub mod manager;
pub mod pool;
pub mod tracer;
pub mod transaction;

pub use connection::DbConnection;
pub use manager::PoolManager;
pub use pool::{ConnectionPool, DbPool, Pool, PoolStats, PoolStatus, RawPoolAccess};
pub use tracer::{QueryScope, SqlTracer};
pub use transaction::{
    AccessMode, DbTransaction, IsolationLevel, TransactionAccessor, TransactionOptions,
};
