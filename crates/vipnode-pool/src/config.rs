//! Pool configuration and defaults.

use std::time::Duration;

/// Admission defaults.
pub struct PoolDefaults;

impl PoolDefaults {
    /// Hosts requested per `connect`.
    pub const NUM_REQUEST_HOSTS: usize = 3;
    /// Shared deadline for the whitelist fan-out.
    pub const WHITELIST_TIMEOUT: Duration = Duration::from_secs(5);
    /// Credit paid per interval of connection time.
    pub const CREDIT_PER_INTERVAL: i64 = 1000;
    /// Billing interval.
    pub const INTERVAL: Duration = Duration::from_secs(60);
}

/// Storage defaults.
pub struct StoreDefaults;

impl StoreDefaults {
    /// Expected time between node updates. Hosts not seen for twice this
    /// long are no longer offered to clients.
    pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);
    /// SQLite busy timeout in milliseconds.
    pub const BUSY_TIMEOUT_MS: u32 = 5000;
}

/// Runtime settings of a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum number of hosts returned to a connecting client.
    pub num_request_hosts: usize,
    /// How long to wait for hosts to whitelist a client.
    pub whitelist_timeout: Duration,
    /// Return candidate hosts without asking them to whitelist the client.
    pub skip_whitelist: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            num_request_hosts: PoolDefaults::NUM_REQUEST_HOSTS,
            whitelist_timeout: PoolDefaults::WHITELIST_TIMEOUT,
            skip_whitelist: false,
        }
    }
}
