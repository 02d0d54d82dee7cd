//! Single-construction owner of the process pool.
//!
//! # Design Decisions
//!
//! - **`OnceCell` fast path**: once the pool is live, readers never touch the
//!   construction lock
//! - **`tokio::sync::Mutex` around construction**: exactly one caller builds
//!   the pool while the others wait, then all of them read the memoized pool
//!   or the memoized error
//! - **Bounded retry budget**: `max_init_attempts` construction attempts are
//!   made; after the last failure the error is cached and handed to every
//!   later caller unchanged. The default of 1 means a failed construction is
//!   never retried and the process must restart.
//!
//! # Cancellation
//!
//! Construction runs inside the calling future. A caller that gives up
//! (deadline or drop) abandons its attempt without counting it against the
//! budget; the next waiter starts a fresh one.

use super::connection::DbConnection;
use super::pool::{ConnectionPool, Pool, PoolStatus};
use super::transaction::{DbTransaction, TransactionOptions};
use crate::config::PoolConfig;
use crate::context::RequestContext;
use crate::error::{ChainedError, Code, DbResult};
use crate::logger::Logger;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::{Mutex, OnceCell};

/// Owns the configuration and lazily constructs the pool exactly once.
///
/// Pass a shared reference (`Arc<PoolManager>`) to every consumer instead of
/// keeping the pool in a global.
pub struct PoolManager {
    config: PoolConfig,
    logger: Arc<dyn Logger>,
    ready: OnceCell<Arc<Pool>>,
    /// Last construction failure. Guards construction.
    last_error: Mutex<Option<ChainedError>>,
    attempts: AtomicU32,
    initializing: AtomicBool,
    failed: AtomicBool,
}

impl PoolManager {
    pub fn new(config: PoolConfig, logger: Arc<dyn Logger>) -> Self {
        Self {
            config,
            logger,
            ready: OnceCell::new(),
            last_error: Mutex::new(None),
            attempts: AtomicU32::new(0),
            initializing: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// The live pool, constructing it on first use.
    ///
    /// Concurrent callers share one construction. Once the attempt budget is
    /// spent, the cached error is returned as is. A closed pool yields
    /// `ResourceClosed`. Every failure is logged at error level before it is
    /// returned.
    pub async fn pool(&self, ctx: &RequestContext) -> DbResult<Arc<Pool>> {
        if let Some(pool) = self.ready.get() {
            return self.observe("Connection pool is not available", ctx, self.live(pool));
        }
        let Some(deadline) = ctx.deadline() else {
            return self.initialize(ctx).await;
        };
        match tokio::time::timeout_at(deadline, self.initialize(ctx)).await {
            Ok(result) => result,
            Err(elapsed) => {
                let err = ChainedError::wrap(
                    Code::DbConnection,
                    ChainedError::context(
                        Code::Timeout,
                        "deadline exceeded while trying to construct the connection pool",
                        elapsed,
                    ),
                );
                self.observe("Timed out waiting for connection pool", ctx, Err(err))
            }
        }
    }

    /// Construction failures are logged by [`Pool::connect`]; the other
    /// failures returned here are logged on the way out.
    async fn initialize(&self, ctx: &RequestContext) -> DbResult<Arc<Pool>> {
        let mut last_error = self.last_error.lock().await;

        // Another caller may have finished while this one waited.
        if let Some(pool) = self.ready.get() {
            return self.observe("Connection pool is not available", ctx, self.live(pool));
        }
        let max_attempts = self.config.max_init_attempts;
        let attempts = self.attempts.load(Ordering::Acquire);
        if attempts >= max_attempts {
            if let Some(err) = last_error.as_ref() {
                return self.observe(
                    "Connection pool construction failed earlier",
                    ctx,
                    Err(err.clone()),
                );
            }
        }

        self.initializing.store(true, Ordering::Release);
        let _initializing = InitializingGuard(&self.initializing);

        let attempt = attempts + 1;
        let target = self.config.masked_target();
        self.logger.info(
            "Constructing database connection pool",
            &[
                ("target", &target),
                ("attempt", &attempt),
                ("max_attempts", &max_attempts),
            ],
        );

        match Pool::connect(&self.config, self.logger.clone()).await {
            Ok(pool) => {
                self.attempts.store(attempt, Ordering::Release);
                *last_error = None;
                let pool = Arc::new(pool);
                pool.start_health_check(self.config.health_check_period);
                // Only the holder of `last_error` sets the cell.
                let _ = self.ready.set(pool.clone());
                Ok(pool)
            }
            Err(err) => {
                self.attempts.store(attempt, Ordering::Release);
                if attempt >= max_attempts {
                    self.failed.store(true, Ordering::Release);
                    self.logger.error(
                        "Database connection pool construction failed; caching error",
                        &[("attempts", &attempt), ("error", &err)],
                    );
                }
                *last_error = Some(err.clone());
                Err(err)
            }
        }
    }

    fn live(&self, pool: &Arc<Pool>) -> DbResult<Arc<Pool>> {
        if pool.is_closed() {
            return Err(ChainedError::with_message(
                Code::ResourceClosed,
                "database connection pool is closed",
            ));
        }
        Ok(pool.clone())
    }

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

    pub fn status(&self) -> PoolStatus {
        if let Some(pool) = self.ready.get() {
            return pool.status();
        }
        if self.initializing.load(Ordering::Acquire) {
            PoolStatus::Initializing
        } else if self.failed.load(Ordering::Acquire) {
            PoolStatus::Failed
        } else {
            PoolStatus::Uninitialized
        }
    }

    /// Completed construction attempts, successful or not.
    pub fn construction_attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    /// Close the managed pool. Fails with `Unknown` when no pool was ever
    /// constructed or it is already closed.
    pub async fn close(&self) -> DbResult<()> {
        match self.ready.get() {
            Some(pool) => pool.close().await,
            None => {
                let err =
                    ChainedError::with_message(Code::Unknown, "database connection pool is nil");
                self.logger
                    .error("Failed to close connection pool", &[("error", &err)]);
                Err(err)
            }
        }
    }
}

#[async_trait]
impl ConnectionPool for PoolManager {
    async fn acquire(&self, ctx: &RequestContext) -> DbResult<DbConnection> {
        self.pool(ctx).await?.acquire(ctx).await
    }

    async fn ping(&self, ctx: &RequestContext) -> DbResult<()> {
        self.pool(ctx).await?.ping(ctx).await
    }

    async fn close(&self) -> DbResult<()> {
        PoolManager::close(self).await
    }

    async fn begin_tx(
        &self,
        ctx: &RequestContext,
        options: Option<TransactionOptions>,
    ) -> DbResult<DbTransaction> {
        self.pool(ctx).await?.begin_tx(ctx, options).await
    }

    fn status(&self) -> PoolStatus {
        PoolManager::status(self)
    }
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager")
            .field("target", &self.config.masked_target())
            .field("status", &self.status())
            .field("attempts", &self.construction_attempts())
            .finish_non_exhaustive()
    }
}

/// Clears the initializing flag however the attempt ends.
struct InitializingGuard<'a>(&'a AtomicBool);

impl Drop for InitializingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::TracingLogger;

    fn manager(config: PoolConfig) -> PoolManager {
        PoolManager::new(config, Arc::new(TracingLogger))
    }

    #[tokio::test]
    async fn test_status_transitions() {
        let manager = manager(PoolConfig::sqlite_memory());
        assert_eq!(manager.status(), PoolStatus::Uninitialized);

        let ctx = RequestContext::new();
        manager.pool(&ctx).await.unwrap();
        assert_eq!(manager.status(), PoolStatus::Ready);
        assert_eq!(manager.construction_attempts(), 1);

        manager.close().await.unwrap();
        assert_eq!(manager.status(), PoolStatus::Closed);
        assert_eq!(
            manager.pool(&ctx).await.unwrap_err().code(),
            Code::ResourceClosed
        );
    }

    #[tokio::test]
    async fn test_close_before_construction_is_unknown() {
        let manager = manager(PoolConfig::sqlite_memory());
        let err = manager.close().await.unwrap_err();
        assert_eq!(err.code(), Code::Unknown);
        assert_eq!(manager.status(), PoolStatus::Uninitialized);
    }

    #[tokio::test]
    async fn test_repeated_calls_return_same_pool() {
        let manager = manager(PoolConfig::sqlite_memory());
        let ctx = RequestContext::new();
        let first = manager.pool(&ctx).await.unwrap();
        let second = manager.pool(&ctx).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.construction_attempts(), 1);
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_is_cached() {
        let config = PoolConfig {
            driver: crate::config::Driver::Mysql,
            port: 3306,
            database: "app".into(),
            ..PoolConfig::default()
        };
        let manager = manager(config);
        let ctx = RequestContext::new();

        let first = manager.pool(&ctx).await.unwrap_err();
        let second = manager.pool(&ctx).await.unwrap_err();
        assert_eq!(first.code(), Code::InvalidParam);
        assert_eq!(first, second);
        assert_eq!(second.to_string(), first.to_string());
        assert_eq!(manager.construction_attempts(), 1);
        assert_eq!(manager.status(), PoolStatus::Failed);
    }

    #[tokio::test]
    async fn test_retry_budget_allows_more_attempts() {
        let config = PoolConfig {
            driver: crate::config::Driver::Mysql,
            port: 3306,
            database: "app".into(),
            max_init_attempts: 3,
            ..PoolConfig::default()
        };
        let manager = manager(config);
        let ctx = RequestContext::new();

        for expected in 1..=3 {
            manager.pool(&ctx).await.unwrap_err();
            assert_eq!(manager.construction_attempts(), expected);
        }
        assert_eq!(manager.status(), PoolStatus::Failed);

        manager.pool(&ctx).await.unwrap_err();
        assert_eq!(manager.construction_attempts(), 3);
    }
}
