//! Wire protocol: protobuf message types and length-prefixed framing.

pub mod codec;
pub mod messages;

pub use codec::{decode_client, decode_server, encode_frame, FrameReader, MESSAGE_SIZE_MAX};
