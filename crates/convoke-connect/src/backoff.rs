// ABOUTME: Reconnect backoff: a pure delay function and the connection state machine.
// ABOUTME: Delays grow exponentially with jitter, never shrink, and never exceed the cap.

use std::time::Duration;

/// Exponential backoff settings.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Fraction of the raw delay added at most as jitter (0.0 disables it).
    pub jitter: f64,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: 0.1,
            max_attempts: None,
        }
    }
}

/// Delay before retry number `attempt` (1-based).
///
/// `jitter_sample` is expected in `[0, 1)`. The result is at least `previous`
/// and at most `config.max_delay`.
pub fn next_delay(
    previous: Option<Duration>,
    attempt: u32,
    config: &BackoffConfig,
    jitter_sample: f64,
) -> Duration {
    let exponent = attempt.saturating_sub(1).min(64) as i32;
    let raw = config.base_delay.as_nanos() as f64 * config.multiplier.max(1.0).powi(exponent);
    let jitter = raw * config.jitter.max(0.0) * jitter_sample.clamp(0.0, 1.0);
    let max = config.max_delay.as_nanos() as f64;

    let candidate = (raw + jitter).min(max);
    let floor = previous.map(|p| p.as_nanos() as f64).unwrap_or(0.0).min(max);
    Duration::from_nanos(candidate.max(floor).round() as u64)
}

/// A fresh jitter sample in `[0, 1)`.
pub fn jitter_sample() -> f64 {
    rand::random::<f64>()
}

/// Where the reconnect loop currently is.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReconnectState {
    Disconnected,
    Connecting { attempt: u32 },
    Backoff { attempt: u32, delay: Duration },
    Connected,
}

/// Pure reconnect state machine driven by the connector's run loop.
#[derive(Debug, Clone)]
pub struct ReconnectMachine {
    config: BackoffConfig,
    state: ReconnectState,
    attempt: u32,
    last_delay: Option<Duration>,
}

impl ReconnectMachine {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            state: ReconnectState::Disconnected,
            attempt: 0,
            last_delay: None,
        }
    }

    pub fn state(&self) -> ReconnectState {
        self.state
    }

    /// Enter CONNECTING and return the attempt number.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempt += 1;
        self.state = ReconnectState::Connecting {
            attempt: self.attempt,
        };
        self.attempt
    }

    /// The attempt failed. Returns the delay to wait, or `None` when attempts are exhausted.
    pub fn on_failure(&mut self, jitter_sample: f64) -> Option<Duration> {
        if let Some(max) = self.config.max_attempts {
            if self.attempt >= max {
                self.state = ReconnectState::Disconnected;
                return None;
            }
        }
        let delay = next_delay(self.last_delay, self.attempt, &self.config, jitter_sample);
        self.last_delay = Some(delay);
        self.state = ReconnectState::Backoff {
            attempt: self.attempt,
            delay,
        };
        Some(delay)
    }

    /// Connection and registration succeeded; the next outage starts from scratch.
    pub fn on_connected(&mut self) {
        self.state = ReconnectState::Connected;
        self.attempt = 0;
        self.last_delay = None;
    }

    pub fn on_disconnected(&mut self) {
        self.state = ReconnectState::Disconnected;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}
