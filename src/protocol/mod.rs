//! RESP protocol implementation
//!
//! Client-side subset of the Redis Serialization Protocol: the reply types a
//! Redis or Valkey server sends back to a RESP2 client, plus command encoding.

mod encoder;
mod frame;
mod parser;

pub use encoder::{encode_command, encode_frame};
pub use frame::Frame;
pub use parser::{parse_frame, parse_frame_with_limits, ParseError, ParserLimits};
