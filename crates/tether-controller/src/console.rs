//! Operator console: reads command lines and runs them against agents.

use std::{
    fmt::{Display, Write as _},
    future::Future,
    io::Write as _,
    sync::Arc,
    time::SystemTime,
};

use anyhow::Context;
use futures::future::join_all;
use tether_core::{CommandError, SessionId};
use tether_session::Controller;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::commands::{CommandKind, CommandTable};

const PROMPT: &str = "tether> ";
const CLEAR_SCREEN: &str = "\x1b[2J\x1b[H";

/// What the read loop should do after a line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Print(String),
    Clear,
    Exit,
}

pub struct Console {
    controller: Controller,
    table: CommandTable,
}

impl Console {
    #[must_use]
    pub const fn new(controller: Controller, table: CommandTable) -> Self {
        Self { controller, table }
    }

    /// Read and execute lines from `input` until `exit` or end of input.
    ///
    /// Background output is printed as it arrives, between command results.
    ///
    /// # Errors
    /// Returns error if reading input fails.
    pub async fn run<R>(&self, input: R) -> anyhow::Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let printer = Arc::clone(self.controller.output()).spawn_printer(|output| {
            println!("{output}");
        });

        let result = self.read_loop(input).await;
        printer.abort();
        result
    }

    async fn read_loop<R>(&self, input: R) -> anyhow::Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = input.lines();
        loop {
            prompt();
            let Some(line) = lines
                .next_line()
                .await
                .context("failed to read console input")?
            else {
                return Ok(());
            };
            match self.execute(&line).await {
                Outcome::Print(text) if text.is_empty() => {}
                Outcome::Print(text) => println!("{text}"),
                Outcome::Clear => print!("{CLEAR_SCREEN}"),
                Outcome::Exit => return Ok(()),
            }
        }
    }

    /// Execute one command line.
    pub async fn execute(&self, line: &str) -> Outcome {
        let Some(words) = shlex::split(line) else {
            return Outcome::Print("Invalid quoting".to_string());
        };
        let Some((word, args)) = words.split_first() else {
            return Outcome::Print(String::new());
        };
        let Some(spec) = self.table.get(word) else {
            return Outcome::Print(format!(
                "Unknown command: {word}. Type 'help' for a list of commands."
            ));
        };
        if args.len() < spec.min_args {
            return Outcome::Print(format!(
                "Not enough arguments\n{}",
                spec.description()
            ));
        }
        tracing::debug!(command = spec.name, ?args, "Executing console command");

        let text = match spec.kind {
            CommandKind::Help => self.table.help(args.first().map(String::as_str)),
            CommandKind::Clear => return Outcome::Clear,
            CommandKind::Exit => return Outcome::Exit,
            CommandKind::List => self.list(),
            CommandKind::Output => self.history(args.first().map(String::as_str)),
            CommandKind::Prune => {
                let removed = self.controller.registry().prune();
                format!("Removed {removed} disconnected client(s)")
            }
            CommandKind::Ping => {
                self.fan_out(&args[0], |id| async move {
                    let rtt = self.controller.ping(id).await;
                    rtt.map(|rtt| format!("pong in {rtt:.2?}"))
                })
                .await
            }
            CommandKind::Run | CommandKind::Background => {
                let background = spec.kind == CommandKind::Background;
                let (command, rest) = (&args[1], &args[2..]);
                self.fan_out(&args[0], |id| {
                    self.controller.run_command(id, command, rest, background)
                })
                .await
            }
            CommandKind::DownloadExecute => {
                let (url, rest) = (&args[1], &args[2..]);
                self.fan_out(&args[0], |id| {
                    self.controller.download_execute(id, url, rest)
                })
                .await
            }
            CommandKind::SystemInfo => {
                self.fan_out(&args[0], |id| async move {
                    let info = self.controller.system_info(id).await;
                    info.map(|info| format!("\n{}", info.to_string().trim_end()))
                })
                .await
            }
            CommandKind::Kick => {
                self.fan_out(&args[0], |id| async move {
                    self.controller.disconnect(id).await.map(|()| "disconnected")
                })
                .await
            }
        };
        Outcome::Print(text)
    }

    /// Run `op` against every session `token` selects, concurrently, and
    /// report each result on its own line.
    async fn fan_out<F, Fut, T>(&self, token: &str, op: F) -> String
    where
        F: Fn(SessionId) -> Fut,
        Fut: Future<Output = Result<T, CommandError>>,
        T: Display,
    {
        let sessions = match self.controller.resolve(token) {
            Ok(sessions) => sessions,
            Err(e) => return e.to_string(),
        };
        let results = join_all(sessions.iter().map(|session| {
            let id = session.id();
            let call = op(id);
            async move { (id, call.await) }
        }))
        .await;

        let mut text = String::new();
        for (id, result) in results {
            if !text.is_empty() {
                text.push('\n');
            }
            match result {
                Ok(value) => {
                    let _ = write!(text, "[client {id}] {value}");
                }
                Err(e) => {
                    let _ = write!(text, "[client {id}] error: {e}");
                }
            }
        }
        text
    }

    /// Background results kept in the output log, oldest first.
    fn history(&self, client: Option<&str>) -> String {
        let log = self.controller.output();
        let entries = match client {
            None => log.history(),
            Some(word) => match word.parse::<SessionId>() {
                Ok(id) => log.history_for(id),
                Err(_) => return format!("Invalid client id: {word}"),
            },
        };
        if entries.is_empty() {
            return "No background output".to_string();
        }
        entries
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn list(&self) -> String {
        let sessions = self.controller.registry().list();
        if sessions.is_empty() {
            return "No clients".to_string();
        }
        let mut text = format!(
            "{:>4}  {:<22}  {:<12}  {:>8}  {}",
            "ID", "ADDRESS", "STATUS", "UPTIME", "JOBS"
        );
        for (session, connected) in sessions {
            let uptime = SystemTime::now()
                .duration_since(session.connected_at())
                .map_or(0, |d| d.as_secs());
            let _ = write!(
                text,
                "\n{:>4}  {:<22}  {:<12}  {:>7}s  {}",
                session.id(),
                session.peer().unwrap_or("-"),
                if connected { "connected" } else { "disconnected" },
                uptime,
                session.outstanding_jobs()
            );
        }
        text
    }
}

fn prompt() {
    print!("{PROMPT}");
    let _ = std::io::stdout().flush();
}
