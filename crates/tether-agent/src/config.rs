//! Agent configuration.

use std::time::Duration;

use tether_core::TcpConnector;

/// Default controller port.
pub const DEFAULT_PORT: u16 = 4422;

/// Delay before the first reconnect attempt.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// How long to wait between connection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Same delay every time, forever.
    Fixed(Duration),
    /// Doubling delay, capped at `max`; reset after a successful connect.
    Exponential { initial: Duration, max: Duration },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::Fixed(DEFAULT_RETRY_DELAY)
    }
}

impl RetryPolicy {
    /// Delay after the first failure.
    #[must_use]
    pub const fn initial(&self) -> Duration {
        match self {
            Self::Fixed(delay) => *delay,
            Self::Exponential { initial, .. } => *initial,
        }
    }

    /// Delay following `current`.
    #[must_use]
    pub fn next(&self, current: Duration) -> Duration {
        match self {
            Self::Fixed(delay) => *delay,
            Self::Exponential { max, .. } => current.saturating_mul(2).min(*max),
        }
    }
}

/// Everything the agent needs to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    pub host: String,
    pub port: u16,
    pub retry: RetryPolicy,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            retry: RetryPolicy::default(),
        }
    }
}

impl AgentConfig {
    /// Connector for the configured controller address.
    #[must_use]
    pub fn connector(&self) -> TcpConnector {
        TcpConnector::new(self.host.clone(), self.port)
    }
}
