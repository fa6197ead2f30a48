//! Error types for the modelmerge core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.
//!
//! Integrity violations are not errors: a merged document that fails
//! validation moves the merge engine to its fallback state.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// Repository errors
// ---------------------------------------------------------------------------

/// Errors from the revision store (git2-backed).
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// A revision, ref, or the document at a revision does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The store cannot be opened or is locked by another operation.
    #[error("repository unavailable at '{path}': {reason}")]
    RepositoryUnavailable { path: String, reason: String },

    /// A `git2` library error.
    #[error("git2 error: {0}")]
    Git2Error(#[from] git2::Error),

    /// Push was rejected (e.g. non-fast-forward).
    #[error("git push rejected for branch '{branch}': {detail}")]
    PushRejected { branch: String, detail: String },

    /// The index still holds conflicts that were expected to be resolved.
    #[error("unresolved merge conflict: {0}")]
    MergeConflict(String),

    /// Failed to load the document extracted from a revision.
    #[error("document at revision '{revision}' could not be loaded: {source}")]
    Document {
        revision: String,
        #[source]
        source: DocumentError,
    },

    /// Generic I/O wrapper.
    #[error("repository I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl RepositoryError {
    /// Whether a caller may retry the operation after a delay.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RepositoryUnavailable { .. })
    }
}

/// Map a git2 lookup failure to [`RepositoryError::NotFound`] where it means
/// "no such object", keeping every other error as-is.
pub(crate) fn not_found_or(err: git2::Error, what: impl Into<String>) -> RepositoryError {
    match err.code() {
        git2::ErrorCode::NotFound | git2::ErrorCode::InvalidSpec | git2::ErrorCode::Ambiguous => {
            RepositoryError::NotFound(what.into())
        }
        git2::ErrorCode::Locked => RepositoryError::RepositoryUnavailable {
            path: what.into(),
            reason: err.message().to_string(),
        },
        _ => RepositoryError::Git2Error(err),
    }
}

// ---------------------------------------------------------------------------
// Document errors
// ---------------------------------------------------------------------------

/// Errors from loading or saving a document.
#[derive(Debug, Error)]
pub enum DocumentError {
    /// The document file could not be parsed.
    #[error("document parse error: {0}")]
    ParseError(String),

    /// The document could not be serialized.
    #[error("document serialization error: {0}")]
    SerializeError(String),

    /// The declared root node is not present in the node table.
    #[error("document root '{0}' is not a node of the document")]
    MissingRoot(String),

    /// An attachment payload is malformed.
    #[error("invalid attachment '{path}': {detail}")]
    InvalidAttachment { path: String, detail: String },

    /// Generic I/O wrapper.
    #[error("document I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Merge errors
// ---------------------------------------------------------------------------

/// Errors that abort a merge attempt.
///
/// By the time one of these reaches the caller the repository has been reset
/// to the pre-merge HEAD and the exclusivity lock released.
#[derive(Debug, Error)]
pub enum MergeError {
    /// The two refs share no history, so no three-way merge is possible.
    #[error("'{ours}' and '{theirs}' have no common ancestor")]
    UnrelatedHistories { ours: String, theirs: String },

    /// HEAD does not point at a branch.
    #[error("HEAD is detached; check out a branch before merging")]
    DetachedHead,

    /// Tracked files have uncommitted changes a merge would overwrite.
    #[error("working tree has uncommitted changes: {}", .paths.join(", "))]
    DirtyWorkingTree { paths: Vec<String> },

    /// Underlying repository error.
    #[error("merge repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// Underlying document error.
    #[error("merge document error: {0}")]
    Document(#[from] DocumentError),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A required environment variable is not set.
    #[error("required environment variable '{var}' is not set (referenced by config field '{field}')")]
    EnvVarMissing { var: String, field: String },

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
