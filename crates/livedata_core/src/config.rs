//! Live query configuration.

use std::time::Duration;

/// Configuration shared by a connection and the live queries it creates.
#[derive(Debug, Clone)]
pub struct Config {
    /// Window within which dirty signals collapse into one poll.
    pub poll_throttle: Duration,

    /// How often every live query re-polls even without invalidations.
    ///
    /// Catches writes the crossbar was never told about.
    pub refresh_interval: Duration,

    /// Whether writes to the failure test collection honor `fail: true`.
    pub failure_injection: bool,

    /// Consecutive failed polls after which a live query gives up on the
    /// fence writes it is holding and releases them.
    ///
    /// Until then every failed poll is retried after the throttle window.
    pub poll_failure_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_throttle: Duration::from_millis(50),
            refresh_interval: Duration::from_secs(10),
            failure_injection: true,
            poll_failure_retries: 3,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the dirty-signal coalescing window.
    #[must_use]
    pub const fn poll_throttle(mut self, window: Duration) -> Self {
        self.poll_throttle = window;
        self
    }

    /// Sets the periodic refresh interval.
    #[must_use]
    pub const fn refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Sets whether fault injection is honored.
    #[must_use]
    pub const fn failure_injection(mut self, value: bool) -> Self {
        self.failure_injection = value;
        self
    }

    /// Sets how many failed polls in a row hold back fence writes.
    #[must_use]
    pub const fn poll_failure_retries(mut self, retries: u32) -> Self {
        self.poll_failure_retries = retries;
        self
    }
}
