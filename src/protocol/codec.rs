//! Length-prefixed framing over a byte stream.
//!
//! Every message is preceded by a 4-byte big-endian length covering the
//! protobuf body only. The same framing and size limit apply to client
//! connections and relay links, in both directions.

use bytes::{Buf, Bytes, BytesMut};
use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error_handling::types::CodecError;
use crate::protocol::messages::{ClientMessage, ServerMessage};

/// Maximum size of a message body. Applies to both read directions.
pub const MESSAGE_SIZE_MAX: u32 = 2 * 1024 * 1024;

const LEN_PREFIX: usize = 4;

/// Serialize a message and prepend the 4-byte network-order length.
pub fn encode_frame<M: Message>(msg: &M) -> Result<Bytes, CodecError> {
    let len = msg.encoded_len();
    if len > MESSAGE_SIZE_MAX as usize {
        return Err(CodecError::Oversize(len as u32));
    }
    let mut buf = BytesMut::with_capacity(LEN_PREFIX + len);
    buf.extend_from_slice(&(len as u32).to_be_bytes());
    msg.encode(&mut buf)
        .map_err(|e| CodecError::IoError(std::io::Error::other(e)))?;
    Ok(buf.freeze())
}

pub fn decode_client(frame: &[u8]) -> Result<ClientMessage, CodecError> {
    Ok(ClientMessage::decode(frame)?)
}

pub fn decode_server(frame: &[u8]) -> Result<ServerMessage, CodecError> {
    Ok(ServerMessage::decode(frame)?)
}

/// Accumulates bytes from a non-blocking stream and yields complete frames.
///
/// Partial frames stay buffered between calls, so `next_frame` is safe to
/// use inside `select!`: cancellation never loses bytes already read.
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        FrameReader {
            inner,
            buf: BytesMut::with_capacity(8 * 1024),
        }
    }

    /// Read the next frame body, without the length prefix.
    ///
    /// Returns `Ok(None)` on a clean EOF at a frame boundary. EOF in the
    /// middle of a frame is `CodecError::Truncated`; a length prefix over
    /// [`MESSAGE_SIZE_MAX`] is `CodecError::Oversize` and the connection
    /// must be dropped since framing is lost.
    pub async fn next_frame(&mut self) -> Result<Option<Bytes>, CodecError> {
        loop {
            if let Some(frame) = self.buffered_frame()? {
                return Ok(Some(frame));
            }
            let nread = self.inner.read_buf(&mut self.buf).await?;
            if nread == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(CodecError::Truncated);
            }
        }
    }

    fn buffered_frame(&mut self) -> Result<Option<Bytes>, CodecError> {
        if self.buf.len() < LEN_PREFIX {
            return Ok(None);
        }
        let mut len_bytes = [0u8; LEN_PREFIX];
        len_bytes.copy_from_slice(&self.buf[..LEN_PREFIX]);
        let msg_len = u32::from_be_bytes(len_bytes);
        if msg_len > MESSAGE_SIZE_MAX {
            return Err(CodecError::Oversize(msg_len));
        }
        let total = LEN_PREFIX + msg_len as usize;
        if self.buf.len() < total {
            // Incomplete message, read the rest next time.
            self.buf.reserve(total - self.buf.len());
            return Ok(None);
        }
        self.buf.advance(LEN_PREFIX);
        Ok(Some(self.buf.split_to(msg_len as usize).freeze()))
    }
}
