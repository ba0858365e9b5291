//! Shell command handler.

use std::{process::Stdio, time::Instant};

use async_trait::async_trait;
use tether_transport::{Request, RequestKind, Response};
use tokio::process::Command;

use crate::{CommandParts, ExecError, Handler};

/// Runs a command line through the platform shell and returns its output.
///
/// A non-zero exit is not an error: the output is returned together with the
/// exit code so the operator sees what the command printed.
#[derive(Debug, Default, Clone)]
pub struct RunHandler;

impl RunHandler {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    async fn run(&self, command: &str, args: &[String]) -> Result<Response, ExecError> {
        let (program, args) = CommandParts::shell(command, args)?.into_resolved().await?;

        let started = Instant::now();
        let output = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ExecError::SpawnFailed(format!("{}: {e}", program.display())))?;

        let exit_code = output.status.code();
        tracing::debug!(
            command,
            ?exit_code,
            elapsed_ms = started.elapsed().as_millis(),
            "Command finished"
        );

        let mut data = output.stdout;
        data.extend_from_slice(&output.stderr);
        Ok(Response::output(&data, exit_code))
    }
}

#[async_trait]
impl Handler for RunHandler {
    fn kind(&self) -> RequestKind {
        RequestKind::RunCommand
    }

    async fn handle(&self, request: Request) -> Result<Response, ExecError> {
        match request {
            Request::RunCommand { command, args, .. } => self.run(&command, &args).await,
            other => Err(ExecError::WrongRequest {
                expected: RequestKind::RunCommand,
                actual: other.kind(),
            }),
        }
    }
}
