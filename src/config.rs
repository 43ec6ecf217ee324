//! Service sizing and operational configuration.
//!
//! Defaults live here as constants; `ServiceConfig` carries the values a running
//! context actually uses. Shared limits (e.g. `MAX_SERVICE_THREADS`) live in `constants`.

use crate::constants::{MAX_FDS_PER_THREAD, MAX_SERVICE_THREADS};
use crate::error::ConfigError;

/// Default number of service threads.
pub const DEFAULT_THREADS: usize = 1;

/// Default poll table capacity per service thread.
pub const DEFAULT_FD_LIMIT_PER_THREAD: usize = 4096;

/// Cross-thread handoff queue size (disruptor capacity). Must be >= the fd limit so a
/// registered connection always finds a slot: every queued connection holds a table slot.
pub const DEFAULT_HANDOFF_QUEUE_SIZE: usize = DEFAULT_FD_LIMIT_PER_THREAD;

/// Smallest ring the multi-producer disruptor accepts.
pub const MIN_HANDOFF_QUEUE_SIZE: usize = 64;

/// Parse contexts available per thread. Connections that cannot get one defer their readahead.
pub const DEFAULT_PARSE_CONTEXTS_PER_THREAD: usize = 64;

/// Read buffer owned by each parse context (bytes).
pub const DEFAULT_RX_BUFFER_SIZE: usize = 4096;

const _: () = assert!(
    DEFAULT_HANDOFF_QUEUE_SIZE >= DEFAULT_FD_LIMIT_PER_THREAD,
    "handoff queue must cover every table slot"
);
const _: () = assert!(
    DEFAULT_HANDOFF_QUEUE_SIZE >= MIN_HANDOFF_QUEUE_SIZE,
    "handoff queue below disruptor minimum"
);
const _: () = assert!(
    DEFAULT_HANDOFF_QUEUE_SIZE.is_power_of_two(),
    "disruptor capacity must be a power of two"
);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub threads: usize,
    pub fd_limit_per_thread: usize,
    pub handoff_queue_size: usize,
    pub parse_contexts_per_thread: usize,
    pub rx_buffer_size: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            threads: DEFAULT_THREADS,
            fd_limit_per_thread: DEFAULT_FD_LIMIT_PER_THREAD,
            handoff_queue_size: DEFAULT_HANDOFF_QUEUE_SIZE,
            parse_contexts_per_thread: DEFAULT_PARSE_CONTEXTS_PER_THREAD,
            rx_buffer_size: DEFAULT_RX_BUFFER_SIZE,
        }
    }
}

impl ServiceConfig {
    /// Config with `threads` service threads of `fd_limit` slots each; the handoff
    /// queue is sized to match, never below `MIN_HANDOFF_QUEUE_SIZE`.
    pub fn with_threads(threads: usize, fd_limit: usize) -> Self {
        Self {
            threads,
            fd_limit_per_thread: fd_limit,
            handoff_queue_size: fd_limit
                .max(MIN_HANDOFF_QUEUE_SIZE)
                .next_power_of_two(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threads == 0 || self.threads > MAX_SERVICE_THREADS {
            return Err(ConfigError::Threads {
                threads: self.threads,
                max: MAX_SERVICE_THREADS,
            });
        }
        if self.fd_limit_per_thread == 0 || self.fd_limit_per_thread > MAX_FDS_PER_THREAD {
            return Err(ConfigError::FdLimit {
                limit: self.fd_limit_per_thread,
                max: MAX_FDS_PER_THREAD,
            });
        }
        if !self.handoff_queue_size.is_power_of_two()
            || self.handoff_queue_size < MIN_HANDOFF_QUEUE_SIZE
            || self.handoff_queue_size < self.fd_limit_per_thread
        {
            return Err(ConfigError::HandoffQueue {
                size: self.handoff_queue_size,
                min: MIN_HANDOFF_QUEUE_SIZE,
                fd_limit: self.fd_limit_per_thread,
            });
        }
        if self.rx_buffer_size == 0 {
            return Err(ConfigError::RxBuffer);
        }
        Ok(())
    }
}
