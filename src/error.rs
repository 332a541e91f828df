use thiserror::Error;

/// Failure surfaced by a resolution.
///
/// "Nothing found within the timeout" is not an error; it is reported as
/// `Ok(None)` by the resolver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("metadata hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("resolution cancelled")]
    Cancelled,

    #[error("{0}")]
    Fatal(String),

    #[error("invalid magnet reference: {0}")]
    InvalidReference(String),
}

impl ResolveError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        ResolveError::Transport(err.to_string())
    }

    pub fn fatal(err: impl std::fmt::Display) -> Self {
        ResolveError::Fatal(err.to_string())
    }
}
