//! Leased connections.

use super::macros::dispatch;
use super::tracer::{SqlTracer, traced};
use crate::config::Driver;
use crate::context::RequestContext;
use crate::error::{ChainedError, Code, DbResult, statement_code};
use sqlx::pool::PoolConnection;
use sqlx::{Connection, Postgres, Sqlite};
use std::sync::Arc;

/// Deadline classification for statements run on a leased handle.
pub(crate) const STATEMENT_TIMEOUT_CODE: Code = Code::DependencyFailure;

pub(crate) enum Lease {
    Postgres(PoolConnection<Postgres>),
    Sqlite(PoolConnection<Sqlite>),
}

/// A connection checked out of the pool for the exclusive use of one caller.
///
/// The connection goes back to the pool when this handle is dropped or
/// [`released`](Self::release). It is not meant to be shared between tasks.
pub struct DbConnection {
    lease: Lease,
    tracer: Option<Arc<SqlTracer>>,
}

impl DbConnection {
    pub(crate) fn new(lease: Lease, tracer: Option<Arc<SqlTracer>>) -> Self {
        Self { lease, tracer }
    }

    pub fn driver(&self) -> Driver {
        match self.lease {
            Lease::Postgres(_) => Driver::Postgres,
            Lease::Sqlite(_) => Driver::Sqlite,
        }
    }

    /// Execute a single statement and return the number of affected rows.
    pub async fn execute(&mut self, ctx: &RequestContext, sql: &str) -> DbResult<u64> {
        let tracer = self.tracer.clone();
        let lease = &mut self.lease;
        let statement = async move {
            dispatch!(lease, Lease, conn => sqlx::query(sql)
                .execute(&mut **conn)
                .await
                .map(|done| done.rows_affected()))
        };
        ctx.run(STATEMENT_TIMEOUT_CODE, "execute a statement", async {
            traced(tracer.as_deref(), ctx, sql, statement)
                .await
                .map_err(|e| {
                    ChainedError::from_sqlx(statement_code(&e), "failed to execute statement", e)
                })
        })
        .await
    }

    /// Run a query returning one row and decode its first column as `i64`.
    ///
    /// PostgreSQL integer literals are `int4`; cast them (`SELECT 1::bigint`).
    pub async fn fetch_scalar_i64(&mut self, ctx: &RequestContext, sql: &str) -> DbResult<i64> {
        let tracer = self.tracer.clone();
        let lease = &mut self.lease;
        let statement = async move {
            dispatch!(lease, Lease, conn => sqlx::query_scalar::<_, i64>(sql)
                .fetch_one(&mut **conn)
                .await)
        };
        ctx.run(STATEMENT_TIMEOUT_CODE, "fetch a scalar", async {
            traced(tracer.as_deref(), ctx, sql, statement)
                .await
                .map_err(|e| ChainedError::from_sqlx(statement_code(&e), "failed to fetch scalar", e))
        })
        .await
    }

    /// Check that this particular connection is still alive.
    pub async fn ping(&mut self, ctx: &RequestContext) -> DbResult<()> {
        let lease = &mut self.lease;
        ctx.run(Code::DbConnection, "ping a connection", async move {
            dispatch!(lease, Lease, conn => conn.ping().await)
                .map_err(|e| ChainedError::from_sqlx(Code::DbConnection, "connection ping failed", e))
        })
        .await
    }

    /// Return the connection to the pool.
    pub fn release(self) {
        drop(self);
    }
}

impl std::fmt::Debug for DbConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbConnection")
            .field("driver", &self.driver())
            .field("traced", &self.tracer.is_some())
            .finish()
    }
}
