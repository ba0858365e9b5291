//! Connect/serve/retry state machine.

use std::sync::Arc;

use tether_core::Connector;
use tether_executor::Handlers;
use tokio::sync::watch;

use crate::{RetryPolicy, serve};

/// Where the agent is in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Serving,
    /// The stream broke; a reconnect is pending.
    Failed,
    /// The controller asked the agent to stop. Final.
    Terminated,
}

/// Keeps one agent attached to its controller.
pub struct AgentConnection<C: Connector> {
    connector: C,
    handlers: Arc<Handlers>,
    retry: RetryPolicy,
    state: watch::Sender<ConnectionState>,
    attempts: u64,
}

impl<C: Connector> AgentConnection<C> {
    pub fn new(connector: C, handlers: Handlers, retry: RetryPolicy) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Self {
            connector,
            handlers: Arc::new(handlers),
            retry,
            state,
            attempts: 0,
        }
    }

    /// Observe state transitions.
    #[must_use]
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Connection attempts made so far.
    #[must_use]
    pub const fn attempts(&self) -> u64 {
        self.attempts
    }

    /// Connect and serve until the controller sends `Shutdown`.
    ///
    /// Connect failures and broken streams are retried forever after the
    /// policy's delay; there is no attempt cap. Returns only once the
    /// agent is `Terminated`.
    pub async fn run(&mut self) {
        let target = self.connector.target();
        let mut delay = self.retry.initial();
        loop {
            self.state.send_replace(ConnectionState::Connecting);
            self.attempts += 1;
            tracing::debug!(attempt = self.attempts, "Connecting to {target}");

            match self.connector.connect().await {
                Ok(stream) => {
                    tracing::info!("Connected to controller at {target}");
                    delay = self.retry.initial();
                    self.state.send_replace(ConnectionState::Serving);
                    match serve(stream, Arc::clone(&self.handlers)).await {
                        Ok(()) => {
                            self.state.send_replace(ConnectionState::Terminated);
                            return;
                        }
                        Err(e) => {
                            tracing::warn!("Lost connection to controller: {e}");
                            self.state.send_replace(ConnectionState::Failed);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to connect to {target}: {e}");
                }
            }

            tracing::info!("Retrying in {}s", delay.as_secs_f32());
            tokio::time::sleep(delay).await;
            delay = self.retry.next(delay);
        }
    }
}
