//! Device API framing and message types.
//!
//! The hub talks to the satellite over a persistent TCP connection using a
//! small binary envelope around protobuf payloads.
//!
//! # Frame layout
//!
//! ```text
//! +------+-----------------+------------------+-----------------+
//! | 0x00 | varint length   | varint type id   | payload         |
//! +------+-----------------+------------------+-----------------+
//! ```
//!
//! `length` counts payload bytes only. The leading indicator byte marks the
//! plaintext transport; any other value is rejected.
//!
//! # Example
//!
//! ```rust
//! use voicesat_protocol::{Message, PingRequest, decode_frame};
//!
//! let bytes = Message::PingRequest(PingRequest {}).to_bytes().unwrap();
//! let (frame, used) = decode_frame(&bytes).unwrap().unwrap();
//! assert_eq!(used, bytes.len());
//! assert!(matches!(Message::decode(frame).unwrap(), Message::PingRequest(_)));
//! ```

mod error;
mod framing;
pub mod messages;
mod registry;

pub use error::{ProtocolError, ProtocolResult};
pub use framing::{FRAME_INDICATOR, Frame, FrameCodec, decode_frame, encode_frame};
pub use messages::*;
pub use registry::Message;

/// API version reported in the hello response.
pub const API_VERSION_MAJOR: u32 = 1;

/// API minor version reported in the hello response.
pub const API_VERSION_MINOR: u32 = 10;

/// Largest payload accepted from a peer (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;
