//! Error types for the repartitioning coordinator.

use crate::types::SiteId;
use thiserror::Error;

/// Result type alias for coordinator operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for reconfiguration operations.
///
/// Transport errors (`ChannelUnavailable`) are logged and swallowed at
/// the call site rather than propagated: the protocol carries no retry
/// layer, so callers observe a dropped message only indirectly, through
/// a stalled semaphore or an incomplete completion barrier.
#[derive(Error, Debug)]
pub enum Error {
    /// An unrecognized migration strategy identifier. Fatal to the call;
    /// no session is created.
    #[error("unsupported reconfiguration protocol: {0}")]
    UnsupportedProtocol(String),

    /// The plan resolver failed. The session is left not-in-progress so
    /// the caller may retry.
    #[error("plan resolution failed: {0}")]
    PlanResolution(String),

    /// No channel registered for the destination site.
    #[error("no channel for site {site}")]
    ChannelUnavailable { site: SiteId },

    /// Row batch encode/decode failed. Fatal for the operation, no
    /// partial application.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
