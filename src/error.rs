//! Classified error taxonomy.
//!
//! Every failure this crate returns is a [`ChainedError`]: a stable numeric
//! [`Code`] plus an ordered list of causes. Causes may themselves be
//! `ChainedError`s, so one error can carry a tree of classifications (for
//! example, an aggregated validation failure with one cause per violation).
//! Upstream layers branch on codes and code ranges, never on message text.

use std::error::Error as StdError;
use std::fmt;
use std::ops::RangeInclusive;
use std::sync::Arc;
use thiserror::Error;

/// A shared, thread-safe cause in an error chain.
pub type Cause = Arc<dyn StdError + Send + Sync + 'static>;

/// Stable numeric error codes, grouped into ranges by category.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Code {
    // General (1-999)
    Unknown = 1,

    // Request handling (1000-1999)
    BadRequest = 1000,
    InvalidParam = 1001,
    NotFound = 1002,
    Conflict = 1003,
    Gone = 1004,
    ValidationFailed = 1005,
    RateLimited = 1006,
    Timeout = 1007,
    PayloadTooLarge = 1008,
    UnsupportedMediaType = 1009,

    // Authentication and authorization (2000-2999)
    Unauthorized = 2000,
    Forbidden = 2001,
    TokenExpired = 2002,
    InvalidToken = 2003,
    InsufficientScope = 2004,
    AccountLocked = 2005,
    AccountDisabled = 2006,

    // Server state and dependencies (3000-3999)
    InternalServer = 3000,
    ServiceUnavailable = 3001,
    MaintenanceMode = 3002,
    Overloaded = 3003,
    DependencyFailure = 3004,
    NotImplemented = 3005,
    NilPointer = 3006,
    EnvironmentConfig = 3007,

    // Storage (4000-4999)
    DbConnection = 4000,
    DbTransaction = 4001,
    DbConstraint = 4002,
    DbDeadlock = 4003,
    DataCorruption = 4004,

    // Resource lifecycle (6000-6999)
    ResourceInitFailed = 6000,
    ResourceClosed = 6001,
}

/// Code ranges used by the category predicates.
pub mod ranges {
    use std::ops::RangeInclusive;

    pub const GENERAL: RangeInclusive<u32> = 1..=999;
    pub const REQUEST: RangeInclusive<u32> = 1000..=1999;
    pub const AUTH: RangeInclusive<u32> = 2000..=2999;
    pub const INTERNAL: RangeInclusive<u32> = 3000..=3999;
    pub const STORAGE: RangeInclusive<u32> = 4000..=4999;
    pub const BUSINESS: RangeInclusive<u32> = 5000..=5999;
    pub const RESOURCE: RangeInclusive<u32> = 6000..=6999;
}

const ALL_CODES: &[Code] = &[
    Code::Unknown,
    Code::BadRequest,
    Code::InvalidParam,
    Code::NotFound,
    Code::Conflict,
    Code::Gone,
    Code::ValidationFailed,
    Code::RateLimited,
    Code::Timeout,
    Code::PayloadTooLarge,
    Code::UnsupportedMediaType,
    Code::Unauthorized,
    Code::Forbidden,
    Code::TokenExpired,
    Code::InvalidToken,
    Code::InsufficientScope,
    Code::AccountLocked,
    Code::AccountDisabled,
    Code::InternalServer,
    Code::ServiceUnavailable,
    Code::MaintenanceMode,
    Code::Overloaded,
    Code::DependencyFailure,
    Code::NotImplemented,
    Code::NilPointer,
    Code::EnvironmentConfig,
    Code::DbConnection,
    Code::DbTransaction,
    Code::DbConstraint,
    Code::DbDeadlock,
    Code::DataCorruption,
    Code::ResourceInitFailed,
    Code::ResourceClosed,
];

impl Code {
    /// Numeric value of this code.
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Look up a code by its numeric value.
    pub fn from_u32(value: u32) -> Option<Self> {
        ALL_CODES.iter().copied().find(|code| code.as_u32() == value)
    }

    /// Whether this code falls inside `range`.
    pub fn in_range(self, range: &RangeInclusive<u32>) -> bool {
        range.contains(&self.as_u32())
    }

    /// Human-readable description, stable across releases.
    pub fn message(self) -> &'static str {
        match self {
            Self::Unknown => "unknown error",
            Self::BadRequest => "bad request",
            Self::InvalidParam => "invalid parameter",
            Self::NotFound => "resource not found",
            Self::Conflict => "resource conflict",
            Self::Gone => "resource no longer available",
            Self::ValidationFailed => "validation failed",
            Self::RateLimited => "rate limited",
            Self::Timeout => "timed out",
            Self::PayloadTooLarge => "payload too large",
            Self::UnsupportedMediaType => "unsupported media type",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::TokenExpired => "token expired",
            Self::InvalidToken => "invalid token",
            Self::InsufficientScope => "insufficient scope",
            Self::AccountLocked => "account locked",
            Self::AccountDisabled => "account disabled",
            Self::InternalServer => "internal server error",
            Self::ServiceUnavailable => "service unavailable",
            Self::MaintenanceMode => "maintenance mode",
            Self::Overloaded => "system overloaded",
            Self::DependencyFailure => "dependency failure",
            Self::NotImplemented => "not implemented",
            Self::NilPointer => "nil pointer",
            Self::EnvironmentConfig => "environment configuration error",
            Self::DbConnection => "database connection failed",
            Self::DbTransaction => "database transaction error",
            Self::DbConstraint => "database constraint violation",
            Self::DbDeadlock => "database deadlock",
            Self::DataCorruption => "data corruption",
            Self::ResourceInitFailed => "resource initialization failed",
            Self::ResourceClosed => "resource closed",
        }
    }

    /// HTTP status an upstream response layer should use for this code.
    pub fn http_status(self) -> u16 {
        match self {
            Self::BadRequest | Self::InvalidParam => 400,
            Self::NotFound => 404,
            Self::Conflict | Self::DbConstraint => 409,
            Self::Gone => 410,
            Self::ValidationFailed => 422,
            Self::RateLimited => 429,
            Self::Timeout => 408,
            Self::PayloadTooLarge => 413,
            Self::UnsupportedMediaType => 415,
            Self::Unauthorized | Self::TokenExpired | Self::InvalidToken => 401,
            Self::InsufficientScope
            | Self::Forbidden
            | Self::AccountLocked
            | Self::AccountDisabled => 403,
            Self::NotImplemented => 501,
            Self::ServiceUnavailable
            | Self::MaintenanceMode
            | Self::Overloaded
            | Self::DbConnection
            | Self::ResourceClosed => 503,
            _ => 500,
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Leaf cause carrying a human-readable message and no further source.
#[derive(Error, Debug, Clone)]
#[error("{0}")]
pub struct Message(pub String);

/// Leaf cause that prefixes an underlying error with what was being attempted.
#[derive(Error, Debug)]
#[error("{message}: {source}")]
pub struct Context {
    message: String,
    #[source]
    source: Box<dyn StdError + Send + Sync + 'static>,
}

impl Context {
    pub fn new<E>(message: impl Into<String>, source: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Self {
            message: message.into(),
            source: source.into(),
        }
    }
}

/// An error carrying a classification code and zero or more causes.
///
/// Equality compares codes only, so `wrap(X, e) == e` whenever `e` already
/// carries `X`.
#[derive(Debug, Clone)]
pub struct ChainedError {
    code: Code,
    causes: Vec<Cause>,
}

impl ChainedError {
    /// A bare classified error with no causes.
    pub fn new(code: Code) -> Self {
        Self {
            code,
            causes: Vec::new(),
        }
    }

    /// Classify `cause` under `code`.
    ///
    /// Wrapping a `ChainedError` that already carries `code` returns it
    /// unchanged instead of nesting it.
    pub fn wrap<E>(code: Code, cause: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        if let Some(existing) = (&cause as &dyn std::any::Any).downcast_ref::<ChainedError>() {
            if existing.code == code {
                return existing.clone();
            }
        }
        Self {
            code,
            causes: vec![Arc::new(cause)],
        }
    }

    /// Classify several causes together under one code.
    pub fn wrap_all<I>(code: Code, causes: I) -> Self
    where
        I: IntoIterator<Item = Cause>,
    {
        Self {
            code,
            causes: causes.into_iter().collect(),
        }
    }

    /// A classified error whose single cause is a plain message.
    pub fn with_message(code: Code, message: impl Into<String>) -> Self {
        Self::wrap(code, Message(message.into()))
    }

    /// A classified error whose cause is `source` prefixed with `message`.
    pub fn context<E>(code: Code, message: impl Into<String>, source: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Self::wrap(code, Context::new(message, source))
    }

    /// Classify a driver error under `code`, refining it when the driver
    /// reports a timeout, a constraint violation or a deadlock.
    ///
    /// The refinement becomes an inner node so the operation code stays on
    /// top: a pool timeout during acquire is `DbConnection` with a `Timeout`
    /// cause.
    pub fn from_sqlx(code: Code, message: impl Into<String>, err: sqlx::Error) -> Self {
        match refine_sqlx(&err) {
            Some(refined) if refined != code => {
                Self::wrap(code, Self::context(refined, message, err))
            }
            _ => Self::context(code, message, err),
        }
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn causes(&self) -> &[Cause] {
        &self.causes
    }

    /// Whether the outermost code is one of `codes`.
    pub fn is_code(&self, codes: &[Code]) -> bool {
        codes.contains(&self.code)
    }

    /// Depth-first search for a code in `range` anywhere in the causal tree.
    pub fn has_code_in_range(&self, range: RangeInclusive<u32>) -> bool {
        has_error_in_range(self, range)
    }

    /// Whether `code` appears anywhere in the causal tree.
    pub fn contains_code(&self, code: Code) -> bool {
        self.has_code_in_range(code.as_u32()..=code.as_u32())
    }

    pub fn is_bad_request(&self) -> bool {
        self.code.in_range(&ranges::REQUEST)
    }

    pub fn is_authentication(&self) -> bool {
        self.code.in_range(&ranges::AUTH)
    }

    pub fn is_internal(&self) -> bool {
        self.code.in_range(&ranges::INTERNAL)
    }

    pub fn is_database(&self) -> bool {
        self.code.in_range(&ranges::STORAGE)
    }

    pub fn is_business(&self) -> bool {
        self.code.in_range(&ranges::BUSINESS)
    }

    pub fn is_resource(&self) -> bool {
        self.code.in_range(&ranges::RESOURCE)
    }
}

impl PartialEq for ChainedError {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code
    }
}

impl Eq for ChainedError {}

impl fmt::Display for ChainedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_u32(), self.code)?;
        for cause in &self.causes {
            write!(f, ", {cause}")?;
        }
        Ok(())
    }
}

impl StdError for ChainedError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.causes
            .first()
            .map(|cause| cause.as_ref() as &(dyn StdError + 'static))
    }
}

/// Whether the first `ChainedError` found along `err`'s source chain carries
/// one of `codes`.
pub fn is_error_code(err: &(dyn StdError + 'static), codes: &[Code]) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(chained) = e.downcast_ref::<ChainedError>() {
            return chained.is_code(codes);
        }
        current = e.source();
    }
    false
}

/// Recursively search `err` for a code inside `range`.
///
/// `ChainedError` nodes are checked and then every cause is searched;
/// foreign errors are followed through [`StdError::source`]. Use a
/// single-value range to look for one specific code.
pub fn has_error_in_range(err: &(dyn StdError + 'static), range: RangeInclusive<u32>) -> bool {
    if let Some(chained) = err.downcast_ref::<ChainedError>() {
        if chained.code.in_range(&range) {
            return true;
        }
        return chained
            .causes
            .iter()
            .any(|cause| has_error_in_range(cause.as_ref(), range.clone()));
    }
    match err.source() {
        Some(source) => has_error_in_range(source, range),
        None => false,
    }
}

fn refine_sqlx(err: &sqlx::Error) -> Option<Code> {
    match err {
        sqlx::Error::PoolTimedOut => Some(Code::Timeout),
        sqlx::Error::Database(db_err) => {
            if db_err.is_unique_violation()
                || db_err.is_foreign_key_violation()
                || db_err.is_check_violation()
            {
                return Some(Code::DbConstraint);
            }
            match db_err.code().as_deref() {
                // serialization_failure, deadlock_detected
                Some("40001") | Some("40P01") => Some(Code::DbDeadlock),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Code for a failed SQL statement, when the driver error says nothing more
/// specific than "the database rejected it".
pub(crate) fn statement_code(err: &sqlx::Error) -> Code {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolClosed
        | sqlx::Error::PoolTimedOut => Code::DbConnection,
        sqlx::Error::RowNotFound => Code::NotFound,
        _ => refine_sqlx(err).unwrap_or(Code::DependencyFailure),
    }
}

/// Result type alias for pool operations.
pub type DbResult<T> = Result<T, ChainedError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_display_includes_code_and_causes() {
        let err = ChainedError::with_message(Code::DbConnection, "connection refused");
        assert_eq!(
            err.to_string(),
            "[4000] database connection failed, connection refused"
        );
    }

    #[test]
    fn test_display_without_causes() {
        assert_eq!(ChainedError::new(Code::Unknown).to_string(), "[1] unknown error");
    }

    #[test]
    fn test_wrap_same_code_is_idempotent() {
        let inner = ChainedError::with_message(Code::DbTransaction, "begin failed");
        let wrapped = ChainedError::wrap(Code::DbTransaction, inner.clone());
        assert_eq!(wrapped, inner);
        assert_eq!(wrapped.causes().len(), 1);
        assert!(wrapped.causes()[0].downcast_ref::<Message>().is_some());
    }

    #[test]
    fn test_wrap_different_code_nests() {
        let inner = ChainedError::with_message(Code::DbConnection, "refused");
        let wrapped = ChainedError::wrap(Code::ResourceInitFailed, inner);
        assert_eq!(wrapped.code(), Code::ResourceInitFailed);
        assert!(wrapped.causes()[0].downcast_ref::<ChainedError>().is_some());
    }

    #[test]
    fn test_equality_is_by_code() {
        let a = ChainedError::with_message(Code::DbDeadlock, "a");
        let b = ChainedError::with_message(Code::DbDeadlock, "b");
        assert_eq!(a, b);
        assert_ne!(a, ChainedError::new(Code::DbConnection));
    }

    #[test]
    fn test_has_error_in_range_finds_nested_code() {
        let root = io::Error::new(io::ErrorKind::Other, "root");
        let err = ChainedError::wrap(
            Code::InternalServer,
            ChainedError::wrap(Code::DbTransaction, root),
        );
        assert!(!err.is_database());
        assert!(err.has_code_in_range(ranges::STORAGE));
        assert!(!err.has_code_in_range(ranges::AUTH));
    }

    #[test]
    fn test_has_error_in_range_searches_every_cause() {
        let err = ChainedError::wrap_all(
            Code::ValidationFailed,
            vec![
                Arc::new(Message("first".into())) as Cause,
                Arc::new(ChainedError::new(Code::Forbidden)) as Cause,
            ],
        );
        assert!(err.has_code_in_range(ranges::AUTH));
        assert!(err.contains_code(Code::Forbidden));
        assert!(!err.contains_code(Code::Unauthorized));
    }

    #[test]
    fn test_has_error_in_range_follows_foreign_sources() {
        let inner = ChainedError::new(Code::DbConstraint);
        let outer = Context::new("insert failed", inner);
        assert!(has_error_in_range(&outer, ranges::STORAGE));
        assert!(is_error_code(&outer, &[Code::DbConstraint]));
        assert!(!is_error_code(&outer, &[Code::DbConnection]));
    }

    #[test]
    fn test_category_predicates_use_outer_code() {
        assert!(ChainedError::new(Code::InvalidParam).is_bad_request());
        assert!(ChainedError::new(Code::TokenExpired).is_authentication());
        assert!(ChainedError::new(Code::DependencyFailure).is_internal());
        assert!(ChainedError::new(Code::DbConnection).is_database());
        assert!(ChainedError::new(Code::ResourceClosed).is_resource());
        assert!(!ChainedError::new(Code::ResourceClosed).is_business());
    }

    #[test]
    fn test_from_sqlx_pool_timeout_adds_timeout_node() {
        let err = ChainedError::from_sqlx(
            Code::DbConnection,
            "failed to acquire database connection",
            sqlx::Error::PoolTimedOut,
        );
        assert_eq!(err.code(), Code::DbConnection);
        assert!(err.contains_code(Code::Timeout));
        assert!(err.to_string().contains("failed to acquire database connection"));
    }

    #[test]
    fn test_from_sqlx_plain_error_keeps_single_level() {
        let err = ChainedError::from_sqlx(Code::DbTransaction, "commit", sqlx::Error::PoolClosed);
        assert_eq!(err.code(), Code::DbTransaction);
        assert!(err.causes()[0].downcast_ref::<Context>().is_some());
    }

    #[test]
    fn test_statement_code() {
        assert_eq!(statement_code(&sqlx::Error::PoolClosed), Code::DbConnection);
        assert_eq!(statement_code(&sqlx::Error::RowNotFound), Code::NotFound);
        assert_eq!(
            statement_code(&sqlx::Error::ColumnNotFound("id".into())),
            Code::DependencyFailure
        );
    }

    #[test]
    fn test_code_round_trip_and_http_status() {
        assert_eq!(Code::from_u32(4001), Some(Code::DbTransaction));
        assert_eq!(Code::from_u32(4999), None);
        assert_eq!(Code::InvalidParam.http_status(), 400);
        assert_eq!(Code::DbConnection.http_status(), 503);
        assert_eq!(Code::Unknown.http_status(), 500);
    }
}
