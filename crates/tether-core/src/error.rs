//! Operator-facing error taxonomy.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::SessionId;

/// Error returned by controller-side commands.
///
/// Transport failures are only ever seen inside the session layer; by the
/// time an error reaches the console they have been folded into
/// `NotConnected`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("Client {0} is not connected")]
    NotConnected(SessionId),
    #[error("No clients match '{0}'")]
    NoMatch(String),
    #[error("Remote execution failed: {0}")]
    RemoteExecution(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Timed out after {0:?}")]
    TimedOut(Duration),
}

/// Kind of failure an agent reports back over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    /// Running a command or a downloaded resource failed.
    Execution,
    /// Fetching a resource failed.
    Download,
    /// The request could not be understood.
    Protocol,
    /// No handler is registered for the request.
    Unsupported,
}

impl CommandError {
    /// Map an agent-reported failure into the operator taxonomy.
    #[must_use]
    pub fn from_remote(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            RemoteErrorKind::Execution | RemoteErrorKind::Download => {
                Self::RemoteExecution(message)
            }
            RemoteErrorKind::Protocol | RemoteErrorKind::Unsupported => Self::Protocol(message),
        }
    }
}
