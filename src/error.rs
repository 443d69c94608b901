//! Error taxonomy, per spec.md §7.
//!
//! Mirrors the teacher's preference for `panic!`-on-startup
//! (`whisper.rs::Whisper::load`) generalized into a typed boundary:
//! truly unrecoverable conditions still exit the process, but every
//! other failure kind is a value callers can branch on.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DexterError {
    /// Network call that is worth retrying with backoff: event-bus
    /// publication, engagement call, chat stream open (§7).
    #[error("transient network failure after {attempts} attempt(s): {source}")]
    Transient {
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    /// Platform reported the edit target no longer exists ("unknown
    /// message"); recovered in place by the caller (§7).
    #[error("deleted target: {0}")]
    DeletedTarget(String),

    /// Role add/remove failed with the platform's well-known
    /// permission-denied code; logged with a hint, never retried (§7).
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Caller-supplied input failed validation; surfaced as 4xx (§7).
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// A dependency this request needs isn't available right now;
    /// surfaced as 503 (§7).
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// Invalid configuration or invalid port; the process should exit (§7).
    #[error("unrecoverable: {0}")]
    Unrecoverable(String),
}

impl DexterError {
    pub fn transient(attempts: u32, source: impl Into<anyhow::Error>) -> Self {
        DexterError::Transient {
            attempts,
            source: source.into(),
        }
    }

    /// True if this error kind represents a platform permission failure
    /// that should be logged-and-dropped rather than retried (§7, §4.6).
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, DexterError::PermissionDenied(_))
    }

    pub fn is_deleted_target(&self) -> bool {
        matches!(self, DexterError::DeletedTarget(_))
    }
}

pub type DexterResult<T> = Result<T, DexterError>;
