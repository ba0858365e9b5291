//! Core abstractions shared by the tether controller and agent.
//!
//! This crate provides the fundamental building blocks:
//! - `SessionId` / `JobId` - identifiers for sessions and background jobs
//! - `CommandError` - the operator-facing error taxonomy
//! - `OutputLog` - Broadcast + history for background command output
//! - `Connector` trait for opening agent-side streams

pub mod error;
pub mod output;
pub mod traits;

pub use error::CommandError;
pub use output::{BackgroundOutput, OutputLog};
pub use traits::{Connector, JobId, SessionId, TcpConnector};
