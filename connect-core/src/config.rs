//! Tunables for the protocol core. Time is counted in host ticks.

use crate::chunk::DEFAULT_CHUNK_SIZE;

/// Default ticks to wait for a response before re-sending.
pub const DEFAULT_REQUEST_TIMEOUT_TICKS: u64 = 30;

/// Default re-sends of a timed-out request before giving up.
pub const DEFAULT_MAX_RETRIES: u32 = 1;

/// Default ticks a session with a continuation token waits for the transport to come back.
pub const DEFAULT_RECONNECT_GRACE_TICKS: u64 = 60;

/// Default ticks the responder waits for the next request.
pub const DEFAULT_IDLE_TIMEOUT_TICKS: u64 = 120;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectConfig {
    pub chunk_size: usize,
    pub request_timeout_ticks: u64,
    pub max_retries: u32,
    pub reconnect_grace_ticks: u64,
    pub idle_timeout_ticks: u64,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            request_timeout_ticks: DEFAULT_REQUEST_TIMEOUT_TICKS,
            max_retries: DEFAULT_MAX_RETRIES,
            reconnect_grace_ticks: DEFAULT_RECONNECT_GRACE_TICKS,
            idle_timeout_ticks: DEFAULT_IDLE_TIMEOUT_TICKS,
        }
    }
}
