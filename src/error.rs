//! The tagged error taxonomy used throughout the engine.

use thiserror::Error;

/// A single validation failure, optionally anchored to an XPath.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    /// Human-readable description of the failure.
    pub message: String,
    /// XPath of the offending node, when the schema library can identify one.
    pub xpath: Option<String>,
}

impl ValidationIssue {
    /// Build an issue with no XPath anchor.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            xpath: None,
        }
    }

    /// Build an issue anchored to an XPath.
    pub fn at(message: impl Into<String>, xpath: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            xpath: Some(xpath.into()),
        }
    }
}

/// Error taxonomy for the module manager and commit pipeline.
///
/// Every error that escapes the commit pipeline maps to exactly one of
/// these variants; callers should match on this enum rather than on
/// formatted messages.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An argument failed a precondition (duplicate name, malformed path, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The named module, record, or file does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The requested operation conflicts with a live reference (e.g. removing
    /// a module another module still depends on).
    #[error("in use: {0}")]
    InUse(String),

    /// A lock or retry loop exceeded its deadline.
    #[error("timed out: {0}")]
    TimedOut(String),

    /// The shared segment has no room to grow, or a configured size limit
    /// was exceeded.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Schema validation rejected the working tree.
    #[error("validation failed ({} issue(s))", .0.len())]
    ValidationFailed(Vec<ValidationIssue>),

    /// A subscriber callback returned a non-ok status during notification.
    #[error("callback failed: {0}")]
    CallbackFailed(String),

    /// A broken internal invariant (dangling offset, corrupt header, ...).
    ///
    /// Never expected in steady state. Logged at `error` level wherever it
    /// is raised.
    #[error("internal error: {0}")]
    Internal(String),

    /// Wrapped I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Wrapped POSIX failure (pthread, mmap, signal, ...).
    #[error(transparent)]
    Nix(#[from] nix::Error),

    /// Wrapped (de)serialization failure for persisted data trees.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Convenience alias used throughout the crate.
pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    /// True for errors that should trigger the commit pipeline's abort branch.
    pub fn triggers_abort(&self) -> bool {
        matches!(self, StoreError::CallbackFailed(_))
    }
}
