//! Periodic health check of a constructed pool.

mod common;

use common::RecordingLogger;
use db_pool_manager::db::{ConnectionPool, Pool};
use db_pool_manager::{PoolConfig, PoolManager, RequestContext};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

const PASSED: &str = "Periodic health check passed";
const PERIOD: Duration = Duration::from_millis(100);

fn short_period_config() -> PoolConfig {
    PoolConfig {
        health_check_period: PERIOD,
        ..PoolConfig::sqlite_memory()
    }
}

#[tokio::test]
async fn test_manager_pings_periodically_until_closed() {
    let logger = RecordingLogger::new();
    let manager = PoolManager::new(short_period_config(), logger.clone());
    manager.pool(&RequestContext::new()).await.unwrap();

    // The first tick is skipped; construction already verified the pool.
    assert!(logger.with_message(PASSED).is_empty());

    sleep(PERIOD * 4 + PERIOD / 2).await;
    assert!(logger.with_message(PASSED).len() >= 2);

    manager.close().await.unwrap();
    sleep(PERIOD / 2).await;
    let after_close = logger.with_message(PASSED).len();

    sleep(PERIOD * 4).await;
    assert_eq!(logger.with_message(PASSED).len(), after_close);
}

#[tokio::test]
async fn test_directly_connected_pool_has_no_health_check_until_started() {
    let logger = RecordingLogger::new();
    let pool = Arc::new(
        Pool::connect(&short_period_config(), logger.clone())
            .await
            .unwrap(),
    );

    sleep(PERIOD * 3).await;
    assert!(logger.with_message(PASSED).is_empty());

    pool.start_health_check(PERIOD);
    sleep(PERIOD * 3 + PERIOD / 2).await;
    assert!(!logger.with_message(PASSED).is_empty());

    pool.close().await.unwrap();
}
