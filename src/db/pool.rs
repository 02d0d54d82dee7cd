//! Connection pool.
//!
//! [`Pool`] owns the sqlx pool handle for one database. It is built by
//! [`Pool::connect`], which either returns a live, health-verified pool or a
//! classified error; there is no partially initialized state. Every failure
//! is logged at error level through the injected [`Logger`] and returned.
//!
//! Callers normally go through [`PoolManager`](super::PoolManager), which guarantees a single
//! construction per manager and runs the periodic health check.

use super::connection::{DbConnection, Lease};
use super::tracer::SqlTracer;
use super::transaction::{DbTransaction, TransactionOptions};
use crate::config::{Driver, PoolConfig, SQLITE_MEMORY};
use crate::context::RequestContext;
use crate::error::{ChainedError, Code, DbResult};
use crate::logger::Logger;
use async_trait::async_trait;
use sqlx::pool::PoolOptions;
use sqlx::postgres::PgConnectOptions;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Connection, Database, PgPool, SqlitePool};
use std::future::Future;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Driver-specific sqlx pool.
#[derive(Debug, Clone)]
pub enum DbPool {
    Postgres(PgPool),
    Sqlite(SqlitePool),
}

impl DbPool {
    pub async fn close(&self) {
        match self {
            DbPool::Postgres(pool) => pool.close().await,
            DbPool::Sqlite(pool) => pool.close().await,
        }
    }

    pub fn driver(&self) -> Driver {
        match self {
            DbPool::Postgres(_) => Driver::Postgres,
            DbPool::Sqlite(_) => Driver::Sqlite,
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            DbPool::Postgres(pool) => pool.is_closed(),
            DbPool::Sqlite(pool) => pool.is_closed(),
        }
    }

    pub fn stats(&self) -> PoolStats {
        match self {
            DbPool::Postgres(pool) => PoolStats {
                size: pool.size(),
                idle: pool.num_idle(),
                max_connections: pool.options().get_max_connections(),
            },
            DbPool::Sqlite(pool) => PoolStats {
                size: pool.size(),
                idle: pool.num_idle(),
                max_connections: pool.options().get_max_connections(),
            },
        }
    }

    pub(crate) async fn acquire(&self) -> Result<Lease, sqlx::Error> {
        Ok(match self {
            DbPool::Postgres(pool) => Lease::Postgres(pool.acquire().await?),
            DbPool::Sqlite(pool) => Lease::Sqlite(pool.acquire().await?),
        })
    }

    /// Lease a connection and ping it.
    pub(crate) async fn ping(&self) -> Result<(), sqlx::Error> {
        match self {
            DbPool::Postgres(pool) => pool.acquire().await?.ping().await,
            DbPool::Sqlite(pool) => pool.acquire().await?.ping().await,
        }
    }
}

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Open connections, idle or in use.
    pub size: u32,
    pub idle: usize,
    pub max_connections: u32,
}

/// Lifecycle state of a pool as seen by its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolStatus {
    Uninitialized,
    Initializing,
    Ready,
    /// Construction failed and will not be attempted again.
    Failed,
    Closed,
}

impl std::fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PoolStatus::Uninitialized => "uninitialized",
            PoolStatus::Initializing => "initializing",
            PoolStatus::Ready => "ready",
            PoolStatus::Failed => "failed",
            PoolStatus::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Operations every pool consumer may use.
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    /// Lease a connection, waiting for a free slot up to the context deadline.
    async fn acquire(&self, ctx: &RequestContext) -> DbResult<DbConnection>;

    async fn ping(&self, ctx: &RequestContext) -> DbResult<()>;

    /// Release every pooled connection. Closing twice is an error.
    ///
    /// Waits for leased connections to be returned.
    async fn close(&self) -> DbResult<()>;

    /// Begin a transaction. `None` applies the pool's default options.
    async fn begin_tx(
        &self,
        ctx: &RequestContext,
        options: Option<TransactionOptions>,
    ) -> DbResult<DbTransaction>;

    fn status(&self) -> PoolStatus;
}

/// Access to the underlying sqlx pool, for adapters that hand it to code
/// written directly against sqlx.
pub trait RawPoolAccess: ConnectionPool {
    fn raw_pool(&self) -> DbResult<DbPool>;
}

/// A live database connection pool.
pub struct Pool {
    handle: RwLock<Option<DbPool>>,
    driver: Driver,
    target: String,
    tracer: Option<Arc<SqlTracer>>,
    logger: Arc<dyn Logger>,
    default_options: TransactionOptions,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl Pool {
    /// Build a pool from `config` and verify the database is reachable.
    ///
    /// No periodic health check runs on the returned pool:
    /// [`PoolManager`](super::PoolManager) starts one after construction,
    /// direct callers wrap the pool in an `Arc` and call
    /// [`start_health_check`](Self::start_health_check).
    ///
    /// Error classification:
    /// - invalid configuration or connection string: `InvalidParam`
    ///   (configuration rule violations: `ValidationFailed`)
    /// - unreachable database within `connect_timeout`: `DbConnection`
    /// - any other failure to create the pool: `ResourceInitFailed`
    /// - failed health check after creation: `DbConnection`, with the
    ///   half-open pool closed before returning
    pub async fn connect(config: &PoolConfig, logger: Arc<dyn Logger>) -> DbResult<Self> {
        let target = config.masked_target();
        match Self::establish(config, &logger).await {
            Ok(handle) => {
                let tracer = config.debug_sql.then(|| {
                    logger.info("SQL debug mode is enabled", &[]);
                    Arc::new(SqlTracer::new(logger.clone()))
                });
                let driver = config.driver;
                let max_open_conns = config.max_open_conns;
                logger.info(
                    "Successfully connected to database",
                    &[
                        ("driver", &driver),
                        ("target", &target),
                        ("max_open_conns", &max_open_conns),
                    ],
                );
                Ok(Self {
                    handle: RwLock::new(Some(handle)),
                    driver,
                    target,
                    tracer,
                    logger,
                    default_options: TransactionOptions::new(config.default_isolation_level),
                    health_task: Mutex::new(None),
                })
            }
            Err(err) => {
                logger.error(
                    "Failed to construct database connection pool",
                    &[("target", &target), ("error", &err)],
                );
                Err(err)
            }
        }
    }

    async fn establish(config: &PoolConfig, logger: &Arc<dyn Logger>) -> DbResult<DbPool> {
        config.validate()?;
        let timeout = config.connect_timeout;

        let handle = match config.driver {
            Driver::Postgres => {
                let url = config.connection_url()?;
                let options = PgConnectOptions::from_str(url.as_str()).map_err(|e| {
                    ChainedError::from_sqlx(
                        Code::InvalidParam,
                        "failed to parse connection string",
                        e,
                    )
                })?;
                let connecting = pool_options::<sqlx::Postgres>(config).connect_with(options);
                DbPool::Postgres(open(connecting, timeout).await?)
            }
            Driver::Sqlite => {
                let options = if config.database == SQLITE_MEMORY {
                    SqliteConnectOptions::from_str("sqlite::memory:").map_err(|e| {
                        ChainedError::from_sqlx(
                            Code::InvalidParam,
                            "failed to parse connection string",
                            e,
                        )
                    })?
                } else {
                    SqliteConnectOptions::new()
                        .filename(&config.database)
                        .create_if_missing(true)
                };
                let connecting = pool_options::<sqlx::Sqlite>(config).connect_with(options);
                DbPool::Sqlite(open(connecting, timeout).await?)
            }
            Driver::Mysql => {
                return Err(ChainedError::with_message(
                    Code::InvalidParam,
                    "driver 'mysql' is not supported",
                ));
            }
        };

        logger.debug("Database connection pool created, verifying", &[]);
        verify(handle, timeout).await
    }

    /// Spawn the periodic health check, replacing one already running.
    ///
    /// The task holds only a weak reference and exits once the pool is closed
    /// or dropped.
    pub fn start_health_check(self: &Arc<Self>, period: Duration) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(Self::health_check_task(weak, period));
        let mut guard = self
            .health_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = guard.replace(handle) {
            previous.abort();
        }
    }

    async fn health_check_task(weak: Weak<Self>, period: Duration) {
        let mut interval = tokio::time::interval(period);
        // The first tick completes immediately; construction already pinged.
        interval.tick().await;

        loop {
            interval.tick().await;

            let Some(pool) = weak.upgrade() else {
                break;
            };
            if pool.is_closed() {
                break;
            }
            let ctx = RequestContext::background().with_timeout(period);
            if pool.ping(&ctx).await.is_ok() {
                pool.logger.debug("Periodic health check passed", &[]);
            }
        }
    }

    pub fn driver(&self) -> Driver {
        self.driver
    }

    pub fn is_closed(&self) -> bool {
        self.handle
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Whether SQL statements are traced.
    pub fn is_traced(&self) -> bool {
        self.tracer.is_some()
    }

    pub fn stats(&self) -> DbResult<PoolStats> {
        Ok(self.live_handle()?.stats())
    }

    fn live_handle(&self) -> DbResult<DbPool> {
        self.handle
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| {
                ChainedError::with_message(Code::ResourceClosed, "database connection pool is closed")
            })
    }

    /// Log a failed operation at error level and hand the error back.
    fn observe<T>(&self, operation: &str, ctx: &RequestContext, result: DbResult<T>) -> DbResult<T> {
        if let Err(err) = &result {
            let request_id = ctx.request_id();
            self.logger.error(
                operation,
                &[
                    ("request_id", &request_id),
                    ("code", &err.code().as_u32()),
                    ("error", err),
                ],
            );
        }
        result
    }
}

#[async_trait]
impl ConnectionPool for Pool {
    async fn acquire(&self, ctx: &RequestContext) -> DbResult<DbConnection> {
        let result: DbResult<DbConnection> = async {
            let handle = self.live_handle()?;
            let lease = ctx
                .run(Code::DbConnection, "acquire a connection", async {
                    handle.acquire().await.map_err(|e| {
                        ChainedError::from_sqlx(
                            Code::DbConnection,
                            "failed to acquire database connection",
                            e,
                        )
                    })
                })
                .await?;
            Ok(DbConnection::new(lease, self.tracer.clone()))
        }
        .await;
        self.observe("Failed to acquire connection", ctx, result)
    }

    async fn ping(&self, ctx: &RequestContext) -> DbResult<()> {
        let result: DbResult<()> = async {
            let handle = self.live_handle()?;
            ctx.run(Code::DbConnection, "ping the database", async {
                handle.ping().await.map_err(|e| {
                    ChainedError::from_sqlx(Code::DbConnection, "failed to ping database", e)
                })
            })
            .await
        }
        .await;
        self.observe("Failed to ping database", ctx, result)
    }

    async fn close(&self) -> DbResult<()> {
        let taken = self
            .handle
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = taken else {
            let err = ChainedError::with_message(Code::Unknown, "database connection pool is nil");
            self.logger.error(
                "Failed to close connection pool",
                &[("target", &self.target), ("error", &err)],
            );
            return Err(err);
        };

        if let Some(task) = self
            .health_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        handle.close().await;
        self.logger
            .info("Database connection pool closed", &[("target", &self.target)]);
        Ok(())
    }

    async fn begin_tx(
        &self,
        ctx: &RequestContext,
        options: Option<TransactionOptions>,
    ) -> DbResult<DbTransaction> {
        let options = options.unwrap_or(self.default_options);
        let result: DbResult<DbTransaction> = async {
            let handle = self.live_handle()?;
            ctx.run(
                Code::DbTransaction,
                "begin a transaction",
                DbTransaction::begin(&handle, options, self.tracer.clone(), self.logger.as_ref()),
            )
            .await
        }
        .await;
        self.observe("Failed to begin transaction", ctx, result)
    }

    fn status(&self) -> PoolStatus {
        if self.is_closed() {
            PoolStatus::Closed
        } else {
            PoolStatus::Ready
        }
    }
}

impl RawPoolAccess for Pool {
    fn raw_pool(&self) -> DbResult<DbPool> {
        self.live_handle()
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("driver", &self.driver)
            .field("target", &self.target)
            .field("closed", &self.is_closed())
            .field("traced", &self.tracer.is_some())
            .finish_non_exhaustive()
    }
}

/// Map configuration onto sqlx pool options.
fn pool_options<DB: Database>(config: &PoolConfig) -> PoolOptions<DB> {
    PoolOptions::<DB>::new()
        .max_connections(config.max_open_conns)
        .min_connections(config.max_idle_conns)
        .max_lifetime(PoolConfig::limit(config.conn_max_lifetime))
        .idle_timeout(PoolConfig::limit(config.conn_max_idle_time))
        .acquire_timeout(config.connect_timeout)
        .test_before_acquire(true)
}

/// Await pool creation, bounded by `timeout`.
async fn open<DB, F>(connecting: F, timeout: Duration) -> DbResult<sqlx::Pool<DB>>
where
    DB: Database,
    F: Future<Output = Result<sqlx::Pool<DB>, sqlx::Error>>,
{
    match tokio::time::timeout(timeout, connecting).await {
        Ok(Ok(pool)) => Ok(pool),
        Ok(Err(e)) => {
            let code = match &e {
                sqlx::Error::Io(_)
                | sqlx::Error::Tls(_)
                | sqlx::Error::Protocol(_)
                | sqlx::Error::PoolTimedOut => Code::DbConnection,
                _ => Code::ResourceInitFailed,
            };
            Err(ChainedError::from_sqlx(
                code,
                "failed to create database connection pool",
                e,
            ))
        }
        Err(elapsed) => Err(ChainedError::wrap(
            Code::DbConnection,
            ChainedError::context(
                Code::Timeout,
                format!("database not reachable within {timeout:?}"),
                elapsed,
            ),
        )),
    }
}

/// Ping a freshly created pool within `timeout`. A pool that fails the
/// check is closed before the error is returned.
async fn verify(handle: DbPool, timeout: Duration) -> DbResult<DbPool> {
    let err = match tokio::time::timeout(timeout, handle.ping()).await {
        Ok(Ok(())) => return Ok(handle),
        Ok(Err(e)) => ChainedError::from_sqlx(Code::DbConnection, "failed to ping database", e),
        Err(elapsed) => ChainedError::wrap(
            Code::DbConnection,
            ChainedError::context(Code::Timeout, "database ping timed out", elapsed),
        ),
    };
    handle.close().await;
    Err(err)
}
