//! Configuration for the repartitioning coordinator.
//!
//! All protocol behavior is driven by an immutable configuration struct
//! threaded through the coordinator's constructor; there are no global
//! mutable flags.

use crate::error::{Error, Result};
use std::fmt;
use std::time::Duration;

/// Migration strategy selected for a reconfiguration session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconfigProtocol {
    /// Pause partitions and push all outgoing ranges eagerly.
    StopCopy,
    /// Keep serving traffic; destinations pull data on demand.
    LivePull,
}

impl ReconfigProtocol {
    /// Parse a protocol identifier as supplied by the embedding process.
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "STOPCOPY" => Ok(ReconfigProtocol::StopCopy),
            "LIVEPULL" => Ok(ReconfigProtocol::LivePull),
            other => Err(Error::UnsupportedProtocol(other.to_string())),
        }
    }
}

impl fmt::Display for ReconfigProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconfigProtocol::StopCopy => write!(f, "stopcopy"),
            ReconfigProtocol::LivePull => write!(f, "livepull"),
        }
    }
}

/// How pull requests issued on behalf of a local partition are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncDispatchMode {
    /// Pulls are issued immediately; blocking callers wait on a semaphore.
    Sync,
    /// Pulls are queued at the source for out-of-band scheduling and
    /// paired with an explicit acknowledgment handshake.
    Queued,
}

/// Sub-mode for the stop-and-copy protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCopyMode {
    /// Each site pushes its outgoing ranges and finishes independently,
    /// with no cross-site barrier.
    Direct,
    /// A prepare/ready handshake with every destination site precedes a
    /// one-shot bulk transfer.
    Coordinated,
}

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct ReconfigConfig {
    /// Migration strategy to use when none is requested explicitly.
    pub protocol: ReconfigProtocol,

    /// Record and report per-partition source-side pull timings.
    pub detailed_profiling: bool,

    /// Dispatch mode for destination-initiated pulls.
    pub async_dispatch: AsyncDispatchMode,

    /// Stop-and-copy sub-mode.
    pub stopcopy_mode: StopCopyMode,

    /// How many retry intervals a losing `init_reconfiguration` caller
    /// waits for the winner to publish the plan before giving up.
    pub init_wait_retries: u32,

    /// Length of one wait interval for the losing caller.
    pub init_retry_interval: Duration,

    /// Maximum rows per extracted push/pull chunk.
    pub chunk_rows: usize,
}

impl Default for ReconfigConfig {
    fn default() -> Self {
        Self {
            protocol: ReconfigProtocol::LivePull,
            detailed_profiling: false,
            async_dispatch: AsyncDispatchMode::Sync,
            stopcopy_mode: StopCopyMode::Direct,
            init_wait_retries: 20,
            init_retry_interval: Duration::from_millis(50),
            chunk_rows: 1000,
        }
    }
}

impl ReconfigConfig {
    /// Create a configuration for the given protocol.
    pub fn new(protocol: ReconfigProtocol) -> Self {
        Self {
            protocol,
            ..Default::default()
        }
    }

    /// Enable or disable detailed profiling.
    pub fn with_detailed_profiling(mut self, enabled: bool) -> Self {
        self.detailed_profiling = enabled;
        self
    }

    /// Set the pull dispatch mode.
    pub fn with_async_dispatch(mut self, mode: AsyncDispatchMode) -> Self {
        self.async_dispatch = mode;
        self
    }

    /// Set the stop-and-copy sub-mode.
    pub fn with_stopcopy_mode(mut self, mode: StopCopyMode) -> Self {
        self.stopcopy_mode = mode;
        self
    }

    /// Set the bounded wait for losing init callers.
    pub fn with_init_wait(mut self, retries: u32, interval: Duration) -> Self {
        self.init_wait_retries = retries;
        self.init_retry_interval = interval;
        self
    }

    /// Set the maximum rows per transfer chunk.
    pub fn with_chunk_rows(mut self, rows: usize) -> Self {
        self.chunk_rows = rows;
        self
    }

    /// Total bounded wait for a losing init caller.
    pub fn init_wait_budget(&self) -> Duration {
        self.init_retry_interval * self.init_wait_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_parse() {
        assert_eq!(
            ReconfigProtocol::parse("STOPCOPY").unwrap(),
            ReconfigProtocol::StopCopy
        );
        assert_eq!(
            ReconfigProtocol::parse("livepull").unwrap(),
            ReconfigProtocol::LivePull
        );
        assert!(matches!(
            ReconfigProtocol::parse("zigzag"),
            Err(Error::UnsupportedProtocol(_))
        ));
    }

    #[test]
    fn test_builder() {
        let config = ReconfigConfig::new(ReconfigProtocol::StopCopy)
            .with_detailed_profiling(true)
            .with_stopcopy_mode(StopCopyMode::Coordinated)
            .with_init_wait(4, Duration::from_millis(10))
            .with_chunk_rows(2);
        assert!(config.detailed_profiling);
        assert_eq!(config.stopcopy_mode, StopCopyMode::Coordinated);
        assert_eq!(config.init_wait_budget(), Duration::from_millis(40));
        assert_eq!(config.chunk_rows, 2);
    }
}
