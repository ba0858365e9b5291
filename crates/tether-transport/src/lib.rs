//! Wire layer between controller and agent.
//!
//! Provides:
//! - Wire protocol (tagged JSON, base64 command output)
//! - Line-delimited framing over any async byte stream

pub mod codec;
pub mod protocol;

pub use codec::{FrameReader, FrameWriter, MAX_FRAME_BYTES, WireError};
pub use protocol::{Envelope, Request, RequestId, RequestKind, Response, SystemInfo};
