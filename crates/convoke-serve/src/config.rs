// ABOUTME: Router configuration: listen address, liveness thresholds and routing windows.
// ABOUTME: Durations here are runtime values; file configuration is converted by the CLI.

use std::time::Duration;

/// Configuration for the router.
#[derive(Debug, Clone, PartialEq)]
pub struct RouterConfig {
    /// TCP listen address (default: 127.0.0.1:7450)
    pub listen_addr: String,
    /// Interval agents are expected to heartbeat at.
    pub heartbeat_interval: Duration,
    /// Consecutive missed intervals before an agent is DEGRADED.
    pub missed_heartbeats: u32,
    /// Further silence after DEGRADED before the agent is EVICTED.
    pub eviction_grace: Duration,
    /// How long a task waits for a matching agent before a routing error.
    pub queue_window: Duration,
    /// How long the router waits for a routed task's reply.
    pub task_timeout: Duration,
    /// How often liveness is re-evaluated.
    pub sweep_interval: Duration,
    /// Capacity of the router's command channel.
    pub command_buffer: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7450".to_string(),
            heartbeat_interval: Duration::from_secs(10),
            missed_heartbeats: 3,
            eviction_grace: Duration::from_secs(10),
            queue_window: Duration::from_secs(5),
            task_timeout: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(1),
            command_buffer: 256,
        }
    }
}

impl RouterConfig {
    /// Silence after which an ACTIVE agent becomes DEGRADED.
    pub fn degraded_after(&self) -> Duration {
        self.heartbeat_interval * self.missed_heartbeats.max(1)
    }

    /// Silence after which an agent is EVICTED.
    pub fn evicted_after(&self) -> Duration {
        self.degraded_after() + self.eviction_grace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_liveness_thresholds() {
        let config = RouterConfig {
            heartbeat_interval: Duration::from_millis(100),
            missed_heartbeats: 3,
            eviction_grace: Duration::from_millis(200),
            ..RouterConfig::default()
        };
        assert_eq!(config.degraded_after(), Duration::from_millis(300));
        assert_eq!(config.evicted_after(), Duration::from_millis(500));
    }

    #[test]
    fn test_zero_missed_heartbeats_is_one() {
        let config = RouterConfig {
            missed_heartbeats: 0,
            ..RouterConfig::default()
        };
        assert_eq!(config.degraded_after(), config.heartbeat_interval);
    }
}
