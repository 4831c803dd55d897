//! Error taxonomy for the media store.
//!
//! Security and argument errors propagate synchronously to the caller.
//! Schema corruption and dimension-key ambiguity are recovered locally
//! (destructive recreation / sentinel fallback) and only logged.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Unknown resource path, unattached volume, or an expected-single-row
    /// lookup that matched nothing.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Hidden-surface access refused, or the security predicate excludes
    /// the operation entirely.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Malformed selection, conflicting group-by, missing required column,
    /// or an otherwise invalid caller-supplied value.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Attach requested for a medium that is not mounted or whose storage
    /// identifier cannot be determined yet.
    #[error("Volume unavailable: {0}")]
    VolumeUnavailable(String),

    /// Operation that is structurally forbidden, e.g. detaching the
    /// internal volume.
    #[error("Illegal operation: {0}")]
    IllegalOperation(String),

    /// A hidden-marker check exhausted its retry budget without the file
    /// becoming visible.
    #[error("Timed out waiting for path: {0}")]
    MarkerTimeout(String),

    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    pub fn not_found<S: Into<String>>(what: S) -> Self {
        Error::NotFound(what.into())
    }

    pub fn invalid<S: Into<String>>(what: S) -> Self {
        Error::InvalidArgument(what.into())
    }

    pub fn denied<S: Into<String>>(what: S) -> Self {
        Error::PermissionDenied(what.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
