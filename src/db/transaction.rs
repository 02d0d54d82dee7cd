//! Transactions and the transaction accessor.

use super::connection::STATEMENT_TIMEOUT_CODE;
use super::macros::dispatch;
use super::pool::{ConnectionPool, DbPool};
use super::tracer::{SqlTracer, traced};
use crate::config::Driver;
use crate::context::RequestContext;
use crate::error::{ChainedError, Code, DbResult, statement_code};
use crate::logger::Logger;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Transaction isolation level.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    #[default]
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    #[default]
    ReadWrite,
    ReadOnly,
}

impl AccessMode {
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::ReadWrite => "READ WRITE",
            Self::ReadOnly => "READ ONLY",
        }
    }
}

/// Options applied when a transaction begins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionOptions {
    pub isolation_level: IsolationLevel,
    pub access_mode: AccessMode,
    /// Only meaningful for serializable read-only transactions on PostgreSQL.
    pub deferrable: bool,
}

impl TransactionOptions {
    pub fn new(isolation_level: IsolationLevel) -> Self {
        Self {
            isolation_level,
            ..Self::default()
        }
    }

    pub fn read_only(mut self) -> Self {
        self.access_mode = AccessMode::ReadOnly;
        self
    }

    pub fn deferrable(mut self) -> Self {
        self.deferrable = true;
        self
    }

    /// The PostgreSQL statement that applies these options. It must be the
    /// first statement of the transaction.
    pub fn set_transaction_sql(&self) -> String {
        let mut sql = format!(
            "SET TRANSACTION ISOLATION LEVEL {}, {}",
            self.isolation_level.as_sql(),
            self.access_mode.as_sql()
        );
        if self.deferrable {
            sql.push_str(", DEFERRABLE");
        }
        sql
    }
}

enum TxInner {
    Postgres(sqlx::Transaction<'static, sqlx::Postgres>),
    Sqlite(sqlx::Transaction<'static, sqlx::Sqlite>),
}

/// An open transaction owned by the caller.
///
/// Finish it with [`commit`](Self::commit) or [`rollback`](Self::rollback).
/// Dropping it without either rolls back. Nothing here retries.
pub struct DbTransaction {
    inner: TxInner,
    options: TransactionOptions,
    tracer: Option<Arc<SqlTracer>>,
}

impl DbTransaction {
    /// Begin a transaction on `pool` with `options`.
    ///
    /// SQLite transactions are always serializable: any other requested level
    /// is ignored with a debug observation, and read-only mode is rejected.
    pub(crate) async fn begin(
        pool: &DbPool,
        options: TransactionOptions,
        tracer: Option<Arc<SqlTracer>>,
        logger: &dyn Logger,
    ) -> DbResult<Self> {
        let inner = match pool {
            DbPool::Postgres(pool) => {
                let mut tx = pool.begin().await.map_err(begin_error)?;
                let sql = options.set_transaction_sql();
                sqlx::query(&sql).execute(&mut *tx).await.map_err(|e| {
                    ChainedError::from_sqlx(
                        Code::DbTransaction,
                        format!("failed to apply transaction options ({sql})"),
                        e,
                    )
                })?;
                TxInner::Postgres(tx)
            }
            DbPool::Sqlite(pool) => {
                if options.access_mode == AccessMode::ReadOnly {
                    return Err(ChainedError::wrap(
                        Code::DbTransaction,
                        ChainedError::with_message(
                            Code::InvalidParam,
                            "read-only transactions are not supported by sqlite",
                        ),
                    ));
                }
                if options.isolation_level != IsolationLevel::Serializable {
                    let requested = options.isolation_level;
                    logger.debug(
                        "SQLite transactions are serializable; requested isolation level ignored",
                        &[("isolation_level", &requested)],
                    );
                }
                TxInner::Sqlite(pool.begin().await.map_err(begin_error)?)
            }
        };

        Ok(Self {
            inner,
            options,
            tracer,
        })
    }

    pub fn driver(&self) -> Driver {
        match self.inner {
            TxInner::Postgres(_) => Driver::Postgres,
            TxInner::Sqlite(_) => Driver::Sqlite,
        }
    }

    /// The isolation level in effect. Always `Serializable` on SQLite.
    pub fn isolation_level(&self) -> IsolationLevel {
        match self.inner {
            TxInner::Postgres(_) => self.options.isolation_level,
            TxInner::Sqlite(_) => IsolationLevel::Serializable,
        }
    }

    pub fn options(&self) -> &TransactionOptions {
        &self.options
    }

    /// Execute a single statement inside the transaction and return the
    /// number of affected rows.
    pub async fn execute(&mut self, ctx: &RequestContext, sql: &str) -> DbResult<u64> {
        let tracer = self.tracer.clone();
        let inner = &mut self.inner;
        let statement = async move {
            dispatch!(inner, TxInner, tx => sqlx::query(sql)
                .execute(&mut **tx)
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
    pub async fn fetch_scalar_i64(&mut self, ctx: &RequestContext, sql: &str) -> DbResult<i64> {
        let tracer = self.tracer.clone();
        let inner = &mut self.inner;
        let statement = async move {
            dispatch!(inner, TxInner, tx => sqlx::query_scalar::<_, i64>(sql)
                .fetch_one(&mut **tx)
                .await)
        };
        ctx.run(STATEMENT_TIMEOUT_CODE, "fetch a scalar", async {
            traced(tracer.as_deref(), ctx, sql, statement)
                .await
                .map_err(|e| ChainedError::from_sqlx(statement_code(&e), "failed to fetch scalar", e))
        })
        .await
    }

    pub async fn commit(self) -> DbResult<()> {
        dispatch!(self.inner, TxInner, tx => tx.commit().await).map_err(|e| {
            ChainedError::from_sqlx(Code::DbTransaction, "failed to commit transaction", e)
        })
    }

    pub async fn rollback(self) -> DbResult<()> {
        dispatch!(self.inner, TxInner, tx => tx.rollback().await).map_err(|e| {
            ChainedError::from_sqlx(Code::DbTransaction, "failed to roll back transaction", e)
        })
    }
}

impl fmt::Debug for DbTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbTransaction")
            .field("driver", &self.driver())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

fn begin_error(err: sqlx::Error) -> ChainedError {
    ChainedError::from_sqlx(Code::DbTransaction, "failed to begin transaction", err)
}

/// Begins transactions on a pool with caller-chosen options.
#[derive(Clone)]
pub struct TransactionAccessor {
    pool: Arc<dyn ConnectionPool>,
}

impl TransactionAccessor {
    pub fn new(pool: Arc<dyn ConnectionPool>) -> Self {
        Self { pool }
    }

    /// Begin with the pool's default options.
    pub async fn begin(&self, ctx: &RequestContext) -> DbResult<DbTransaction> {
        self.pool.begin_tx(ctx, None).await
    }

    pub async fn begin_with(
        &self,
        ctx: &RequestContext,
        options: TransactionOptions,
    ) -> DbResult<DbTransaction> {
        self.pool.begin_tx(ctx, Some(options)).await
    }

    /// Begin a serializable, read-only transaction.
    pub async fn read_only(&self, ctx: &RequestContext) -> DbResult<DbTransaction> {
        self.begin_with(ctx, TransactionOptions::new(IsolationLevel::Serializable).read_only())
            .await
    }
}

impl fmt::Debug for TransactionAccessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionAccessor").finish_non_exhaustive()
    }
}
