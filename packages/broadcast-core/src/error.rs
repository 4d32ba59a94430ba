//! Centralized error types for the streaming core.
//!
//! Mirrors the error-handling shape used elsewhere in this codebase: a
//! `thiserror` enum, a machine-readable [`ErrorCode`], and a status-code
//! mapping so a hosting transport can turn a `BroadcastError` into a
//! response without this crate depending on any particular web framework.

use thiserror::Error;

/// Trait for error types that provide machine-readable error codes.
///
/// Implement this trait to provide consistent error codes across different
/// error conversion paths.
pub trait ErrorCode {
    /// Returns a machine-readable error code for API responses.
    fn code(&self) -> &'static str;
}

/// Crate-wide error type for the streaming core.
#[derive(Debug, Error)]
pub enum BroadcastError {
    /// The requested mountpoint does not exist and no fallback resolved it.
    #[error("no such mount: {0}")]
    MountNotFound(String),

    /// `reserve` found the mountpoint already occupied by a non-hijacking
    /// source, or occupied by a source mid-`LISTENERS_SYNC`.
    #[error("mountpoint in use: {0}")]
    MountInUse(String),

    /// Admission rejected the listener on a bandwidth or listener-count
    /// limit with no configured `fallback_when_full`.
    #[error("max listeners reached on {0}")]
    MaxListenersReached(String),

    /// Admission rejected the listener because it would exceed the
    /// server-wide bandwidth ceiling.
    #[error("server bandwidth limit reached")]
    BandwidthLimitReached,

    /// Duplicate-login policy rejected the connecting user.
    #[error("account already in use: {0}")]
    DuplicateLogin(String),

    /// Fallback chain exceeded `MAX_FALLBACK_DEPTH` without resolving.
    #[error("fallback through too many mountpoints starting at {0}")]
    FallbackChainTooDeep(String),

    /// A hijack attempt was refused because the incoming format type did
    /// not match the format type already running on the mountpoint.
    #[error("format type mismatch on hijack of {0}")]
    FormatMismatch(String),

    /// The `Format` adapter failed while building listener headers/preamble.
    #[error("format adapter error: {0}")]
    FormatAdapter(String),

    /// A queue invariant was violated (e.g. `min_queue_point` unreachable
    /// from `head`). The offending source is terminated; the process is not.
    #[error("queue invariant violated on {0}: {1}")]
    QueueInvariantViolated(String, String),

    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    Configuration(String),
}

impl BroadcastError {
    /// Returns a machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MountNotFound(_) => "mount_not_found",
            Self::MountInUse(_) => "mount_in_use",
            Self::MaxListenersReached(_) => "max_listeners_reached",
            Self::BandwidthLimitReached => "bandwidth_limit_reached",
            Self::DuplicateLogin(_) => "duplicate_login",
            Self::FallbackChainTooDeep(_) => "fallback_chain_too_deep",
            Self::FormatMismatch(_) => "format_mismatch",
            Self::FormatAdapter(_) => "format_adapter_error",
            Self::QueueInvariantViolated(..) => "queue_invariant_violated",
            Self::Configuration(_) => "configuration_error",
        }
    }

    /// Maps the error to a conventional HTTP-style status code, without
    /// this crate depending on an HTTP framework to express it.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::MountNotFound(_) => 404,
            Self::MountInUse(_)
            | Self::MaxListenersReached(_)
            | Self::BandwidthLimitReached
            | Self::DuplicateLogin(_)
            | Self::FallbackChainTooDeep(_)
            | Self::FormatMismatch(_) => 403,
            Self::FormatAdapter(_) | Self::QueueInvariantViolated(..) => 500,
            Self::Configuration(_) => 500,
        }
    }
}

impl ErrorCode for BroadcastError {
    fn code(&self) -> &'static str {
        BroadcastError::code(self)
    }
}

/// Convenience result alias for the streaming core.
pub type BroadcastResult<T> = Result<T, BroadcastError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_not_found_maps_to_404() {
        let err = BroadcastError::MountNotFound("/live.ogg".into());
        assert_eq!(err.code(), "mount_not_found");
        assert_eq!(err.status_code(), 404);
    }

    #[test]
    fn max_listeners_maps_to_403() {
        let err = BroadcastError::MaxListenersReached("/live.ogg".into());
        assert_eq!(err.status_code(), 403);
    }

    #[test]
    fn fallback_chain_too_deep_maps_to_403() {
        let err = BroadcastError::FallbackChainTooDeep("/a".into());
        assert_eq!(err.code(), "fallback_chain_too_deep");
        assert_eq!(err.status_code(), 403);
    }
}
