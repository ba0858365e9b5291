use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tether_agent::{AgentConfig, AgentConnection, RetryPolicy, config::DEFAULT_PORT};
use tether_executor::Handlers;
use tracing_subscriber::{EnvFilter, prelude::*};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backoff {
    Fixed,
    Exponential,
}

#[derive(Debug, Parser)]
#[command(name = "tether-agent", version, about = "Connects to a tether controller and serves its requests")]
struct Cli {
    /// Controller host name or address.
    #[arg(long, env = "TETHER_HOST", default_value = "localhost")]
    host: String,

    /// Controller port.
    #[arg(long, env = "TETHER_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Seconds to wait before reconnecting.
    #[arg(long, default_value_t = 5)]
    retry_secs: u64,

    #[arg(long, value_enum, default_value_t = Backoff::Fixed)]
    backoff: Backoff,

    /// Upper bound for exponential backoff, in seconds.
    #[arg(long, default_value_t = 60)]
    max_retry_secs: u64,
}

impl Cli {
    fn config(&self) -> AgentConfig {
        let initial = Duration::from_secs(self.retry_secs);
        let retry = match self.backoff {
            Backoff::Fixed => RetryPolicy::Fixed(initial),
            Backoff::Exponential => RetryPolicy::Exponential {
                initial,
                max: Duration::from_secs(self.max_retry_secs).max(initial),
            },
        };
        AgentConfig {
            host: self.host.clone(),
            port: self.port,
            retry,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Cli::parse().config();
    let handlers = Handlers::builtin().context("failed to register request handlers")?;
    tracing::info!(kinds = ?handlers.kinds(), "Starting tether agent");

    let mut agent = AgentConnection::new(config.connector(), handlers, config.retry);
    agent.run().await;
    tracing::info!("Shut down by controller");
    Ok(())
}
