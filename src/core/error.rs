use std::io;

use thiserror::Error;

use crate::geometry::Int2;

/// Errors surfaced by construction, activation and persistence.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("{what}: expected {expected:?}, got {actual:?}")]
    SizeMismatch {
        what: &'static str,
        expected: Int2,
        actual: Int2,
    },

    #[error("expected {expected} visible states, got {actual}")]
    SourceCount { expected: usize, actual: usize },

    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),

    /// Paths that exist in the API but are deliberately not backed by an
    /// implementation (for example agent persistence).
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    #[error("parse error: {0}")]
    Parse(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = core::result::Result<T, Error>;

/// Check that `actual` matches `expected`, naming the offending input.
pub(crate) fn ensure_size(what: &'static str, expected: Int2, actual: Int2) -> Result<()> {
    if expected != actual {
        return Err(Error::SizeMismatch {
            what,
            expected,
            actual,
        });
    }
    Ok(())
}
