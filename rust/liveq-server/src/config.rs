use std::time::Duration;

/// Configuration for the channel registry and its heartbeat transport.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Interval between keep-alive frames on each open connection.
    pub keep_alive_interval: Duration,
    /// Capacity of the per-connection outbound event queue. Frames published
    /// while the queue is full are dropped (fire-and-forget delivery).
    pub event_queue_size: usize,
}

impl RegistryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    pub fn with_event_queue_size(mut self, size: usize) -> Self {
        self.event_queue_size = size;
        self
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval: Duration::from_secs(45),
            event_queue_size: 1000,
        }
    }
}
