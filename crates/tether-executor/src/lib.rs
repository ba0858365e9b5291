//! Agent-side execution of controller requests.
//!
//! Provides:
//! - `Handler` trait and the `Handlers` table keyed by request kind
//! - Built-in handlers for shell commands, download-and-execute and
//!   system info
//! - Command building and executable resolution utilities

pub mod command;
pub mod download;
pub mod handler;
pub mod run;
pub mod shell;
pub mod system_info;

pub use command::CommandParts;
pub use download::DownloadHandler;
pub use handler::{ExecError, Handler, HandlerError, Handlers};
pub use run::RunHandler;
pub use shell::{get_shell_command, resolve_executable_path};
pub use system_info::SystemInfoHandler;
