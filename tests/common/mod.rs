//! Shared helpers for integration tests.

#![allow(dead_code)]

use db_pool_manager::PoolConfig;
use db_pool_manager::config::Driver;
use db_pool_manager::logger::{Field, Logger};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tracing::Level;

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub level: Level,
    pub message: String,
    pub fields: String,
}

/// Logger that keeps every observation for later assertions.
#[derive(Debug, Default)]
pub struct RecordingLogger {
    entries: Mutex<Vec<LogEntry>>,
}

impl RecordingLogger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().unwrap().clone()
    }

    pub fn with_message(&self, message: &str) -> Vec<LogEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.message == message)
            .collect()
    }

    pub fn count_at(&self, level: Level) -> usize {
        self.entries().iter().filter(|e| e.level == level).count()
    }
}

impl Logger for RecordingLogger {
    fn log(&self, level: Level, message: &str, fields: &[Field<'_>]) {
        let fields = fields
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(" ");
        self.entries.lock().unwrap().push(LogEntry {
            level,
            message: message.to_string(),
            fields,
        });
    }
}

/// A SQLite database file inside a fresh temporary directory.
///
/// Keep the `TempDir` alive for as long as the pool is in use.
pub fn sqlite_file_config() -> (TempDir, PoolConfig) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pool.sqlite");
    let config = PoolConfig::sqlite(path.to_str().unwrap());
    (dir, config)
}

/// PostgreSQL configuration from `TEST_PG_*` variables, if `TEST_PG_HOST` is set.
///
/// Example: TEST_PG_HOST=localhost TEST_PG_USER=postgres TEST_PG_PASSWORD=postgres
/// TEST_PG_DATABASE=postgres
pub fn postgres_config_from_env() -> Option<PoolConfig> {
    let host = std::env::var("TEST_PG_HOST").ok()?;
    let var = |name: &str, default: &str| std::env::var(name).unwrap_or_else(|_| default.into());
    Some(PoolConfig {
        driver: Driver::Postgres,
        host,
        port: var("TEST_PG_PORT", "5432").parse().unwrap(),
        username: var("TEST_PG_USER", "postgres"),
        password: var("TEST_PG_PASSWORD", ""),
        database: var("TEST_PG_DATABASE", "postgres"),
        ssl_mode: var("TEST_PG_SSL_MODE", "disable"),
        connect_timeout: Duration::from_secs(5),
        ..PoolConfig::default()
    })
}
