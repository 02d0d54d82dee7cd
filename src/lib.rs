//! Database connection pool manager.
//!
//! This library owns a process-wide database connection pool (PostgreSQL or
//! SQLite): it constructs the pool exactly once, verifies it is reachable,
//! leases connections, begins transactions with explicit isolation levels,
//! traces SQL execution, and classifies every failure with a stable numeric
//! error code.

pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod logger;

pub use config::{Config, PoolConfig};
pub use context::RequestContext;
pub use db::{ConnectionPool, Pool, PoolManager, TransactionAccessor};
pub use error::{ChainedError, Code, DbResult};
pub use logger::{Logger, TracingLogger};
