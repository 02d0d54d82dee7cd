//! db-pool-manager - construct, health-check and exercise a connection pool.

use db_pool_manager::config::{Config, LoggerConfig};
use db_pool_manager::db::{ConnectionPool, PoolManager, PoolStatus, TransactionAccessor};
use db_pool_manager::{ChainedError, RequestContext, TracingLogger};
use std::future::Future;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &LoggerConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

async fn run(config: &Config) -> Result<(), ChainedError> {
    let manager = Arc::new(PoolManager::new(
        config.pool_config(),
        Arc::new(TracingLogger),
    ));
    with_pool(manager, |manager| exercise(manager, config)).await
}

/// Run `work` against the manager, then close the pool whether or not the
/// work succeeded. The work error wins over a close error.
async fn with_pool<F, Fut>(manager: Arc<PoolManager>, work: F) -> Result<(), ChainedError>
where
    F: FnOnce(Arc<PoolManager>) -> Fut,
    Fut: Future<Output = Result<(), ChainedError>>,
{
    let result = work(manager.clone()).await;
    if manager.status() != PoolStatus::Ready {
        return result;
    }
    let closed = manager.close().await;
    match (result, closed) {
        (Err(e), Err(close)) => {
            error!(error = %close, "Failed to close pool after error");
            Err(e)
        }
        (result, closed) => result.and(closed),
    }
}

async fn exercise(manager: Arc<PoolManager>, config: &Config) -> Result<(), ChainedError> {
    let ctx = RequestContext::new().with_timeout(config.query_timeout_duration());
    let pool = manager.pool(&ctx).await?;
    pool.ping(&ctx).await?;
    info!(request_id = %ctx.request_id(), "Database is reachable");

    if let Some(sql) = &config.query {
        let accessor = TransactionAccessor::new(manager.clone());
        let mut tx = accessor.begin(&ctx).await?;
        info!(isolation = %tx.isolation_level(), "Transaction started");
        match tx.fetch_scalar_i64(&ctx, sql).await {
            Ok(value) => {
                tx.commit().await?;
                println!("{value}");
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    error!(error = %rollback, "Rollback failed");
                }
                return Err(e);
            }
        }
    }

    let stats = pool.stats()?;
    info!(
        size = stats.size,
        idle = stats.idle,
        max_connections = stats.max_connections,
        status = %manager.status(),
        "Pool statistics"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    // Parse configuration from command line and environment
    let config = Config::parse_args();

    // Initialize logging
    init_tracing(&config.logger_config());

    info!(
        driver = %config.driver,
        "Starting db-pool-manager v{}",
        env!("CARGO_PKG_VERSION")
    );

    match run(&config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(code = e.code().as_u32(), error = %e, "db-pool-manager failed");
            eprintln!("error [{}]: {}", e.code().as_u32(), e);
            ExitCode::FAILURE
        }
    }
}
