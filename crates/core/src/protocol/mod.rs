//! # Protocol Layer
//!
//! Wire-level pieces shared by every target implementation.
//!
//! ## Message Flow
//!
//! ```text
//! Client → Proxy:  JSON text (one envelope per WebSocket message)
//! Proxy  → Device: [u32 length, big endian][UTF-8 JSON]
//! Device → Proxy:  [u32 length, big endian][UTF-8 JSON]
//! Proxy  → Client: JSON text
//! ```
//!
//! When a device multiplexes sessions, client messages are wrapped in
//! `Target.sendMessageToTarget` and device messages arrive wrapped in
//! `Target.dispatchMessageFromTarget`.

pub mod envelope;
pub mod frame;

pub use envelope::{ProxyRequestId, RequestId};
pub use frame::{FrameDecoder, encode_frame};
