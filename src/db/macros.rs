//! Driver dispatch macro.
//!
//! Leased connections, transactions and pool handles are all enums with one
//! variant per supported driver. Each variant wraps a differently typed sqlx
//! value, so a body that calls generic sqlx functions must be expanded once
//! per arm; this macro writes those arms.

/// Expand `$body` once for every driver variant of `$kind`.
///
/// ```ignore
/// dispatch!(&mut self.lease, Lease, conn => sqlx::query(sql).execute(&mut **conn).await)
/// ```
macro_rules! dispatch {
    ($value:expr, $kind:ident, $bind:ident => $body:expr) => {
        match $value {
            $kind::Postgres($bind) => $body,
            $kind::Sqlite($bind) => $body,
        }
    };
}

pub(crate) use dispatch;
