//! per-connection deadline bookkeeping.
//!
//! three independent timers are tracked per connection: `connect`, `drain` and `request`.
//! the first two are rearmed on every retry attempt; `request` spans the whole lifetime of
//! the connection (all attempts combined) as the end-to-end wall clock budget.

use core::{pin::Pin, time::Duration};

use tokio::time::{Instant, Sleep};

/// timeout durations shared by every connection created from a given [`crate::builder::DriverBuilder`],
/// overridable per request.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutConfig {
    /// time budget from entry into `CONNECTING` to entry into `CONNECTED`
    /// (or a completed TLS handshake, for https targets).
    pub connect_timeout: Duration,
    /// time budget from entry into `WRITING` to entry into `READING`.
    pub drain_timeout: Duration,
    /// end to end time budget for the request, spanning every attempt.
    pub request_timeout: Duration,
}

impl TimeoutConfig {
    pub const fn new() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// the live deadlines for one connection. `request` is armed once, on the first entry into
/// `INITIALIZED`; `connect` and `drain` are (re)armed on every attempt by [`Deadlines::arm_attempt`].
pub(crate) struct Deadlines {
    config: TimeoutConfig,
    request: Pin<Box<Sleep>>,
    connect: Pin<Box<Sleep>>,
    drain: Pin<Box<Sleep>>,
}

impl Deadlines {
    pub(crate) fn new(config: TimeoutConfig) -> Self {
        let far_future = Instant::now() + Duration::from_secs(365 * 24 * 3600);
        Self {
            config,
            request: Box::pin(tokio::time::sleep_until(Instant::now() + config.request_timeout)),
            connect: Box::pin(tokio::time::sleep_until(far_future)),
            drain: Box::pin(tokio::time::sleep_until(far_future)),
        }
    }

    /// rearm the per-attempt timers. called every time a connection (re-)enters `INITIALIZED`.
    pub(crate) fn arm_attempt(&mut self) {
        let now = Instant::now();
        self.connect.as_mut().reset(now + self.config.connect_timeout);
        self.drain.as_mut().reset(now + self.config.drain_timeout);
    }

    pub(crate) fn connect(&mut self) -> Pin<&mut Sleep> {
        self.connect.as_mut()
    }

    pub(crate) fn drain(&mut self) -> Pin<&mut Sleep> {
        self.drain.as_mut()
    }

    pub(crate) fn request(&mut self) -> Pin<&mut Sleep> {
        self.request.as_mut()
    }
}
