//! Error types for the file-serving core
//!
//! Each public surface gets its own enum so embedders can map variants onto
//! their HTTP layer without string matching.

use thiserror::Error;

/// Why a listener admission was refused.
///
/// The embedder owns response framing; the variants carry everything needed
/// to build the corresponding HTTP response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmitError {
    /// The file behind the mount could not be found or opened (404). The
    /// caller's `FInfo` gets `MISSING` set so retries short-circuit.
    #[error("file not found")]
    NotFound,

    /// Policy refused the listener (403) with a human-readable reason.
    #[error("forbidden: {0}")]
    Forbidden(&'static str),

    /// Mount is at capacity (403); the embedder may redirect the listener
    /// toward the named mount on a relay instead.
    #[error("max listeners reached on {0}")]
    ForbiddenRedirect(String),

    /// The request asked for bytes past the end of the file (416).
    #[error("requested range not satisfiable")]
    RangeNotSatisfiable,

    /// The descriptor itself was unusable: `MISSING` already set, or a
    /// fallback request with no target bitrate. No response is owed; the
    /// caller simply drops the request.
    #[error("unusable file descriptor record")]
    Rejected,
}

/// Failures from admin operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdminError {
    /// A required parameter was absent or unparsable (400).
    #[error("missing or invalid parameter: {0}")]
    BadRequest(&'static str),

    /// No handle exists for the named mount (400 "mount does not exist").
    #[error("mount does not exist: {0}")]
    NoSuchMount(String),
}
