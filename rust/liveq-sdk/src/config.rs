use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub auto_reconnect: bool,
    pub reconnect_intervals: Vec<Duration>,
    pub max_reconnect_attempts: u32,
    /// Interval between keep-alive-query calls reporting active query ids
    /// to the broker's storage.
    pub keep_alive_query_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            reconnect_intervals: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(16),
            ],
            max_reconnect_attempts: 5,
            keep_alive_query_interval: Duration::from_secs(120),
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn with_reconnect_intervals(mut self, intervals: Vec<Duration>) -> Self {
        self.reconnect_intervals = intervals;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_keep_alive_query_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_query_interval = interval;
        self
    }

    pub(crate) fn reconnect_delay(&self, attempt: u32) -> Duration {
        self.reconnect_intervals
            .get(attempt as usize)
            .copied()
            .unwrap_or_else(|| {
                self.reconnect_intervals
                    .last()
                    .copied()
                    .unwrap_or(Duration::from_secs(16))
            })
    }
}
