//! Logging collaborator.
//!
//! The pool manager and the SQL tracer never call `tracing` directly; they
//! log through an injected [`Logger`] so that callers can redirect or capture
//! observations. [`TracingLogger`] is the production implementation.

use std::fmt;
use tracing::Level;

/// A structured key/value pair attached to a log observation.
pub type Field<'a> = (&'static str, &'a dyn fmt::Display);

/// Leveled, structured logger.
pub trait Logger: Send + Sync {
    fn log(&self, level: Level, message: &str, fields: &[Field<'_>]);

    fn debug(&self, message: &str, fields: &[Field<'_>]) {
        self.log(Level::DEBUG, message, fields);
    }

    fn info(&self, message: &str, fields: &[Field<'_>]) {
        self.log(Level::INFO, message, fields);
    }

    fn warn(&self, message: &str, fields: &[Field<'_>]) {
        self.log(Level::WARN, message, fields);
    }

    fn error(&self, message: &str, fields: &[Field<'_>]) {
        self.log(Level::ERROR, message, fields);
    }
}

/// Forwards observations to `tracing` events under the `db_pool` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: Level, message: &str, fields: &[Field<'_>]) {
        let fields = FieldList(fields);
        if level == Level::ERROR {
            tracing::error!(target: "db_pool", fields = %fields, "{}", message);
        } else if level == Level::WARN {
            tracing::warn!(target: "db_pool", fields = %fields, "{}", message);
        } else if level == Level::INFO {
            tracing::info!(target: "db_pool", fields = %fields, "{}", message);
        } else if level == Level::DEBUG {
            tracing::debug!(target: "db_pool", fields = %fields, "{}", message);
        } else {
            tracing::trace!(target: "db_pool", fields = %fields, "{}", message);
        }
    }
}

/// Renders fields as `key=value key=value`.
struct FieldList<'a, 'b>(&'a [Field<'b>]);

impl fmt::Display for FieldList<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{key}={value}")?;
        }
        Ok(())
    }
}
