//! Relay configuration

use std::time::Duration;
use thiserror::Error;

/// How a clean EOF on one side is propagated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CloseMode {
    /// EOF closes the side in both directions; the peer is closed once its
    /// pending data is flushed
    #[default]
    Full,
    /// EOF only ends the direction out of that side; the peer keeps sending
    /// until it reaches EOF as well
    HalfClose,
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum RelayConfigError {
    #[error("read_size must be greater than zero")]
    ZeroReadSize,

    #[error("queue_depth must be greater than zero")]
    ZeroQueueDepth,

    #[error("drain_timeout must be greater than zero (use None to disable it)")]
    ZeroDrainTimeout,
}

/// Relay pair configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Maximum size of a single chunk read from a side
    pub read_size: usize,
    /// Chunks queued per direction before the source stops being read
    pub queue_depth: usize,
    /// EOF propagation policy
    pub close_mode: CloseMode,
    /// Time allowed to finish once no side is read anymore before both
    /// sides are force-closed (None = wait forever)
    ///
    /// With `CloseMode::Full` this starts at the first close. With
    /// `CloseMode::HalfClose` it starts once both sides were closed.
    pub drain_timeout: Option<Duration>,
    /// Flush each side once on start as a liveness probe
    pub probe_on_start: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            read_size: 16 * 1024, // 16KB
            queue_depth: 8,
            close_mode: CloseMode::Full,
            drain_timeout: Some(Duration::from_secs(30)),
            probe_on_start: true,
        }
    }
}

impl RelayConfig {
    pub fn with_read_size(mut self, read_size: usize) -> Self {
        self.read_size = read_size;
        self
    }

    pub fn with_queue_depth(mut self, queue_depth: usize) -> Self {
        self.queue_depth = queue_depth;
        self
    }

    pub fn with_close_mode(mut self, close_mode: CloseMode) -> Self {
        self.close_mode = close_mode;
        self
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Option<Duration>) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn with_probe_on_start(mut self, probe_on_start: bool) -> Self {
        self.probe_on_start = probe_on_start;
        self
    }

    /// Check the configuration for values the relay cannot run with
    pub fn validate(&self) -> Result<(), RelayConfigError> {
        if self.read_size == 0 {
            return Err(RelayConfigError::ZeroReadSize);
        }
        if self.queue_depth == 0 {
            return Err(RelayConfigError::ZeroQueueDepth);
        }
        if self.drain_timeout == Some(Duration::ZERO) {
            return Err(RelayConfigError::ZeroDrainTimeout);
        }
        Ok(())
    }

    /// Upper bound on payload bytes held in one direction at any time
    pub fn max_in_flight_bytes(&self) -> usize {
        // Queue plus the chunk held by the writer and the one held by the reader
        (self.queue_depth + 2) * self.read_size
    }

    pub(crate) fn normalized(mut self) -> Self {
        self.read_size = self.read_size.max(1);
        self.queue_depth = self.queue_depth.max(1);
        self
    }
}
