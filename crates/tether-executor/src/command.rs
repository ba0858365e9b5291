//! Shell command lines for the run handler.

use std::path::PathBuf;

use thiserror::Error;

use crate::shell::{get_shell_command, resolve_executable_path};

/// Command build error.
#[derive(Debug, Error)]
pub enum CommandBuildError {
    #[error("Command line is empty")]
    EmptyCommand,
    #[error("Failed to quote command: {0}")]
    QuoteError(#[from] shlex::QuoteError),
    #[error("Executable not found: {0}")]
    NotFound(String),
}

/// Program and arguments ready to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandParts {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandParts {
    /// Create new command parts.
    #[must_use]
    pub const fn new(program: String, args: Vec<String>) -> Self {
        Self { program, args }
    }

    /// Wrap a command line so the platform shell interprets it.
    ///
    /// `args` are quoted and appended, so pipes and redirects in
    /// `command_line` still work while each argument stays one word.
    ///
    /// # Errors
    /// Returns error if the command line is empty or an argument cannot be
    /// quoted.
    pub fn shell(command_line: &str, args: &[String]) -> Result<Self, CommandBuildError> {
        if command_line.trim().is_empty() {
            return Err(CommandBuildError::EmptyCommand);
        }
        let line = if args.is_empty() {
            command_line.to_string()
        } else {
            let quoted = shlex::try_join(args.iter().map(String::as_str))?;
            format!("{command_line} {quoted}")
        };
        let (shell, flag) = get_shell_command();
        Ok(Self::new(shell, vec![flag.to_string(), line]))
    }

    /// Resolve the program to an absolute path.
    ///
    /// # Errors
    /// Returns error if executable not found.
    pub async fn into_resolved(self) -> Result<(PathBuf, Vec<String>), CommandBuildError> {
        let Self { program, args } = self;
        let executable = resolve_executable_path(&program)
            .await
            .ok_or(CommandBuildError::NotFound(program))?;
        Ok((executable, args))
    }
}
