//! Configuration shared by the thread-bridged producer and consumer.

use std::time::Duration;

/// Configuration for a component whose work runs on a dedicated OS thread
#[derive(Clone)]
pub struct ThreadConfig {
    /// Name given to the worker thread
    pub name: String,
    /// How long a blocked worker waits before re-checking the shutdown flag
    pub poll_interval: Duration,
    /// Items buffered between the worker and the runtime before `put` blocks
    pub channel_capacity: usize,
}

impl ThreadConfig {
    /// Name the worker thread
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    /// Set the shutdown polling interval
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the worker to runtime channel capacity (at least 1)
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }
}

impl std::fmt::Debug for ThreadConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadConfig")
            .field("name", &self.name)
            .field("poll_interval", &self.poll_interval)
            .field("channel_capacity", &self.channel_capacity)
            .finish()
    }
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            name: "subweld-worker".to_string(),
            poll_interval: Duration::from_secs(1),
            channel_capacity: 1024,
        }
    }
}
