//! Core identifiers and the connector trait.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use uuid::Uuid;

/// Session identifier, assigned by the controller registry at connect time.
pub type SessionId = u64;

/// Background job identifier.
pub type JobId = Uuid;

/// Trait for opening a reliable, ordered byte stream to the controller.
///
/// The agent connection loop only needs "a stream, or an error"; tests swap
/// in connectors that fail on demand or hand out in-memory duplex pipes.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Stream type produced by a successful connect.
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Open a new stream.
    async fn connect(&self) -> io::Result<Self::Stream>;

    /// Human readable target, used in log lines.
    fn target(&self) -> String;
}

/// TCP connector for a `host:port` controller address.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: String,
    port: u16,
}

impl TcpConnector {
    /// Create a connector for the given controller address.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self) -> io::Result<TcpStream> {
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
