//! Request-scoped context passed to every blocking pool operation.

use crate::error::{ChainedError, Code, DbResult};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Identifies a logical request and bounds how long its operations may block.
///
/// Dropping the future of an operation cancels it; the deadline turns a slow
/// operation into a `Timeout`-classified error instead of a hang.
#[derive(Debug, Clone)]
pub struct RequestContext {
    request_id: String,
    deadline: Option<Instant>,
}

impl RequestContext {
    /// A new context with a random request id and no deadline.
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            deadline: None,
        }
    }

    /// Context for work not tied to a caller request (startup, health checks).
    pub fn background() -> Self {
        Self {
            request_id: "background".to_string(),
            deadline: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// Bound the context by `timeout` from now. An earlier existing deadline wins.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Bound the context by `deadline`. An earlier existing deadline wins.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Run `operation` bounded by this context's deadline.
    ///
    /// When the deadline elapses first the error is classified under `code`
    /// with a `Timeout` cause.
    pub async fn run<T, F>(&self, code: Code, what: &str, operation: F) -> DbResult<T>
    where
        F: Future<Output = DbResult<T>>,
    {
        let Some(deadline) = self.deadline else {
            return operation.await;
        };
        match tokio::time::timeout_at(deadline, operation).await {
            Ok(result) => result,
            Err(elapsed) => Err(ChainedError::wrap(
                code,
                ChainedError::context(
                    Code::Timeout,
                    format!("deadline exceeded while trying to {what}"),
                    elapsed,
                ),
            )),
        }
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}
