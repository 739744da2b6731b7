//! RESP2 wire protocol for the rcluster proxy: reply values with their
//! codec, and the streaming request framer.

pub mod frame;
pub mod reply;

pub use frame::{FrameError, Request, RequestReader};
pub use reply::{ParseError, Reply, ReplyKind};
