//! Controller-side session orchestration for tether.
//!
//! Provides:
//! - `Session` - one agent connection and its one-way connected flag
//! - `Registry` - lock-guarded set of sessions
//! - Capture resolution of operator tokens into sessions
//! - `Controller` - remote command RPC over session streams

pub mod capture;
pub mod controller;
pub mod registry;
pub mod session;

pub use controller::{Controller, ControllerConfig, RunOutcome};
pub use registry::{Registry, RegistryError};
pub use session::Session;
