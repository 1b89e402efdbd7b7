//! Session configuration.

/// Default backpressure settings for a session.
pub struct SessionDefaults;

impl SessionDefaults {
    /// Maximum number of calls in flight per direction.
    pub const PENDING_LIMIT: usize = 50;
    /// Number of oldest calls discarded when the limit is reached.
    pub const PENDING_DISCARD: usize = 10;
}

/// Per-session settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Maximum outstanding calls in each direction. `0` disables the bound.
    pub pending_limit: usize,
    /// How many of the oldest calls to discard once the bound is hit.
    pub pending_discard: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pending_limit: SessionDefaults::PENDING_LIMIT,
            pending_discard: SessionDefaults::PENDING_DISCARD,
        }
    }
}

impl SessionConfig {
    pub fn unbounded() -> Self {
        Self {
            pending_limit: 0,
            pending_discard: 0,
        }
    }
}
