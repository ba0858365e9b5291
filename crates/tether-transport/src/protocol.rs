//! Wire protocol for controller-agent communication.

use std::fmt;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use tether_core::error::RemoteErrorKind;

/// Per-session request identifier, echoed by the agent in its reply.
pub type RequestId = u64;

/// One frame on the wire: a correlation id plus a typed body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub id: RequestId,
    pub body: T,
}

impl<T> Envelope<T> {
    #[must_use]
    pub const fn new(id: RequestId, body: T) -> Self {
        Self { id, body }
    }
}

/// Message from controller to agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Liveness check.
    Ping,
    /// Run a command line through the agent's shell.
    RunCommand {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        background: bool,
    },
    /// Fetch a resource and execute it.
    DownloadExecute {
        url: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Host/OS identity snapshot.
    SystemInfo,
    /// Clean disconnect: the agent stops retrying and exits.
    Shutdown,
}

/// Discriminant of a [`Request`], used to key agent-side handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RequestKind {
    Ping,
    RunCommand,
    DownloadExecute,
    SystemInfo,
    Shutdown,
}

impl Request {
    #[must_use]
    pub const fn kind(&self) -> RequestKind {
        match self {
            Self::Ping => RequestKind::Ping,
            Self::RunCommand { .. } => RequestKind::RunCommand,
            Self::DownloadExecute { .. } => RequestKind::DownloadExecute,
            Self::SystemInfo => RequestKind::SystemInfo,
            Self::Shutdown => RequestKind::Shutdown,
        }
    }

    /// Whether the controller does not wait for this request's reply.
    #[must_use]
    pub const fn is_background(&self) -> bool {
        matches!(self, Self::RunCommand { background: true, .. })
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ping => "ping",
            Self::RunCommand => "run_command",
            Self::DownloadExecute => "download_execute",
            Self::SystemInfo => "system_info",
            Self::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// Message from agent to controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Reply to `Ping`.
    Pong,
    /// Command output (base64 encoded, stdout followed by stderr).
    Output {
        data: String,
        #[serde(default)]
        exit_code: Option<i32>,
    },
    /// Reply to `SystemInfo`.
    SystemInfo { info: SystemInfo },
    /// A downloaded resource was started.
    Started {
        #[serde(default)]
        pid: Option<u32>,
    },
    /// Acknowledgement with no payload.
    Ack,
    /// The agent failed to serve the request.
    Error {
        kind: RemoteErrorKind,
        message: String,
    },
}

impl Response {
    /// Create an output message from raw bytes.
    #[must_use]
    pub fn output(data: &[u8], exit_code: Option<i32>) -> Self {
        Self::Output {
            data: BASE64.encode(data),
            exit_code,
        }
    }

    /// Create an error message.
    #[must_use]
    pub fn error(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            kind,
            message: message.into(),
        }
    }

    /// Decode output data from base64, replacing invalid UTF-8.
    #[must_use]
    pub fn decode_output(&self) -> Option<String> {
        if let Self::Output { data, .. } = self {
            BASE64
                .decode(data)
                .ok()
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        } else {
            None
        }
    }
}

/// Host/OS identity snapshot reported by an agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub hostname: Option<String>,
    pub username: Option<String>,
    pub os_name: Option<String>,
    pub os_version: Option<String>,
    pub kernel_version: Option<String>,
    pub arch: String,
    pub family: String,
    pub cpu_count: usize,
    pub total_memory: u64,
}

impl fmt::Display for SystemInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn or_unknown(value: Option<&String>) -> &str {
            value.map_or("unknown", String::as_str)
        }
        writeln!(f, "Hostname: {}", or_unknown(self.hostname.as_ref()))?;
        writeln!(f, "User:     {}", or_unknown(self.username.as_ref()))?;
        writeln!(
            f,
            "OS:       {} {}",
            or_unknown(self.os_name.as_ref()),
            or_unknown(self.os_version.as_ref())
        )?;
        writeln!(f, "Kernel:   {}", or_unknown(self.kernel_version.as_ref()))?;
        writeln!(f, "Arch:     {} ({})", self.arch, self.family)?;
        writeln!(f, "CPUs:     {}", self.cpu_count)?;
        write!(f, "Memory:   {} MiB", self.total_memory / (1024 * 1024))
    }
}
