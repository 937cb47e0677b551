//! Fluent builder for event loop construction.
//!
//! Provides a builder pattern interface for creating and configuring
//! [`EventLoop`] and [`Proactor`] instances.

use crate::error::Result;
use crate::proactor::Proactor;
use crate::runtime::EventLoop;

use std::time::Duration;

/// Tunables shared by the proactor and the pipe helpers.
#[derive(Clone, Debug)]
pub struct Config {
    /// Wait used by each round of the close-time drain.
    pub close_poll_interval: Duration,
    /// How long `connect_pipe` keeps retrying an address nobody accepts on.
    pub pipe_connect_timeout: Duration,
    /// Listen backlog of pipe servers.
    pub pipe_backlog: i32,
    /// Capacity of the poller's event buffer.
    pub max_events: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            close_poll_interval: Duration::from_secs(1),
            pipe_connect_timeout: Duration::from_secs(1),
            pipe_backlog: 128,
            max_events: 64,
        }
    }
}

/// Builder for constructing event loops with a fluent API.
///
/// # Example
/// ```ignore
/// let event_loop = RuntimeBuilder::new()
///     .pipe_connect_timeout(Duration::from_millis(200))
///     .build()?;
/// ```
#[derive(Clone, Debug, Default)]
pub struct RuntimeBuilder {
    config: Config,
}

impl RuntimeBuilder {
    /// Creates a builder holding the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close_poll_interval(mut self, interval: Duration) -> Self {
        self.config.close_poll_interval = interval;
        self
    }

    pub fn pipe_connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.pipe_connect_timeout = timeout;
        self
    }

    pub fn pipe_backlog(mut self, backlog: i32) -> Self {
        self.config.pipe_backlog = backlog;
        self
    }

    pub fn max_events(mut self, capacity: usize) -> Self {
        self.config.max_events = capacity.max(1);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Builds an event loop driven by a [`Proactor`].
    ///
    /// Fails if the OS refuses to create the completion facility.
    pub fn build(self) -> Result<EventLoop> {
        EventLoop::with_backend(self.build_proactor()?)
    }

    /// Builds a standalone proactor, not yet attached to any loop.
    pub fn build_proactor(self) -> Result<Proactor> {
        Proactor::with_config(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let builder = RuntimeBuilder::new()
            .close_poll_interval(Duration::from_millis(10))
            .pipe_backlog(4)
            .max_events(0);

        assert_eq!(builder.config().close_poll_interval, Duration::from_millis(10));
        assert_eq!(builder.config().pipe_backlog, 4);
        assert_eq!(builder.config().max_events, 1);
        assert_eq!(builder.config().pipe_connect_timeout, Duration::from_secs(1));
    }
}
