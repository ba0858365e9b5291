//! tether controller: accepts agents and gives the operator a console.

mod commands;
mod console;

use std::{net::SocketAddr, time::Duration};

use anyhow::Context;
use clap::Parser;
use tether_session::{Controller, ControllerConfig};
use tokio::{io::BufReader, net::TcpListener};
use tracing_subscriber::{EnvFilter, prelude::*};

use crate::{commands::CommandTable, console::Console};

#[derive(Debug, Parser)]
#[command(name = "tether-controller", version, about = "Accepts tether agents and runs commands on them")]
struct Cli {
    /// Address to accept agents on.
    #[arg(long, env = "TETHER_BIND", default_value = "0.0.0.0:4422")]
    bind: SocketAddr,

    /// Seconds to wait for a ping (and shutdown) reply.
    #[arg(long, default_value_t = 10)]
    ping_timeout_secs: u64,

    /// Seconds to wait for a foreground command; waits forever if unset.
    #[arg(long)]
    command_timeout_secs: Option<u64>,
}

impl Cli {
    const fn config(&self) -> ControllerConfig {
        ControllerConfig {
            ping_timeout: Duration::from_secs(self.ping_timeout_secs),
            command_timeout: match self.command_timeout_secs {
                Some(secs) => Some(Duration::from_secs(secs)),
                None => None,
            },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let table = CommandTable::builtin().context("invalid console command table")?;
    let listener = TcpListener::bind(cli.bind)
        .await
        .with_context(|| format!("failed to bind {}", cli.bind))?;

    let controller = Controller::new(cli.config());
    let acceptor = controller.clone();
    let server = tokio::spawn(async move { acceptor.serve(listener).await });

    let console = Console::new(controller, table);
    let result = console.run(BufReader::new(tokio::io::stdin())).await;
    server.abort();
    result
}
