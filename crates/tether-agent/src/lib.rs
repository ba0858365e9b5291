//! Agent side of tether.
//!
//! Provides:
//! - `AgentConnection` - connect/serve/retry state machine
//! - `serve` - request loop over one established stream
//! - `AgentConfig` / `RetryPolicy` - controller address and retry timing

pub mod config;
pub mod connection;
pub mod serve;

pub use config::{AgentConfig, RetryPolicy};
pub use connection::{AgentConnection, ConnectionState};
pub use serve::{AgentError, serve};
