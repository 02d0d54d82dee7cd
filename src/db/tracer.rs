//! SQL execution tracing.
//!
//! [`SqlTracer`] observes the start and end of every statement run through a
//! leased connection or transaction when `debug_sql` is enabled. The start
//! time travels in an explicit [`QueryScope`] from the start hook to the end
//! hook. Tracing is best-effort: it only emits log observations and never
//! alters the outcome of the statement it observes.

use crate::context::RequestContext;
use crate::logger::Logger;
use std::error::Error as StdError;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-statement tracing state carried from the start hook to the end hook.
#[derive(Debug, Clone, Default)]
pub struct QueryScope {
    request_id: Option<String>,
    started_at: Option<Instant>,
}

impl QueryScope {
    /// A scope for a statement issued on behalf of `ctx`.
    pub fn new(ctx: &RequestContext) -> Self {
        Self {
            request_id: Some(ctx.request_id().to_string()),
            started_at: None,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    /// Set once the start hook has run.
    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }
}

/// Query start/end hooks that report through the injected logger.
#[derive(Clone)]
pub struct SqlTracer {
    logger: Arc<dyn Logger>,
}

impl SqlTracer {
    pub fn new(logger: Arc<dyn Logger>) -> Self {
        Self { logger }
    }

    /// Record the start time and log the statement text.
    pub fn trace_query_start(&self, mut scope: QueryScope, sql: &str) -> QueryScope {
        scope.started_at = Some(Instant::now());
        let request_id = scope.request_id().unwrap_or("-");
        self.logger.debug(
            "SQL execution started",
            &[("sql", &sql), ("request_id", &request_id)],
        );
        scope
    }

    /// Log the outcome of a statement.
    ///
    /// Returns the elapsed time when the scope carries a start time and the
    /// statement succeeded. A scope that never passed through
    /// [`trace_query_start`](Self::trace_query_start) only produces a warning.
    pub fn trace_query_end(
        &self,
        scope: &QueryScope,
        error: Option<&(dyn StdError + 'static)>,
    ) -> Option<Duration> {
        let request_id = scope.request_id().unwrap_or("-");
        if scope.started_at.is_none() {
            self.logger.warn(
                "Failed to get query start time from query scope",
                &[("request_id", &request_id)],
            );
        }

        if let Some(error) = error {
            self.logger.error(
                "SQL execution failed",
                &[("error", &error), ("request_id", &request_id)],
            );
            return None;
        }

        let duration = scope.started_at?.elapsed();
        let duration_ms = duration.as_secs_f64() * 1000.0;
        self.logger.debug(
            "SQL execution completed",
            &[("duration_ms", &duration_ms), ("request_id", &request_id)],
        );
        Some(duration)
    }

    /// Run `statement` between the start and end hooks.
    ///
    /// The statement's result is returned untouched.
    pub async fn trace<T, F>(
        &self,
        ctx: &RequestContext,
        sql: &str,
        statement: F,
    ) -> Result<T, sqlx::Error>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        let scope = self.trace_query_start(QueryScope::new(ctx), sql);
        let result = statement.await;
        self.trace_query_end(
            &scope,
            result.as_ref().err().map(|e| e as &(dyn StdError + 'static)),
        );
        result
    }
}

impl std::fmt::Debug for SqlTracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlTracer").finish_non_exhaustive()
    }
}

/// Run `statement` through `tracer` when one is attached.
pub(crate) async fn traced<T, F>(
    tracer: Option<&SqlTracer>,
    ctx: &RequestContext,
    sql: &str,
    statement: F,
) -> Result<T, sqlx::Error>
where
    F: Future<Output = Result<T, sqlx::Error>>,
{
    match tracer {
        Some(tracer) => tracer.trace(ctx, sql, statement).await,
        None => statement.await,
    }
}
