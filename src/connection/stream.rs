//! Transport-neutral byte streams and the shared frame writer task.

use std::time::Duration;

use bytes::Bytes;
use log::debug;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A plain TCP stream or a TLS-wrapped one; framing never needs to know.
pub trait NetStream: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> NetStream for T {}

pub type BoxedStream = Box<dyn NetStream>;

/// Spawn the task draining a connection's write queue onto the socket.
///
/// Frames are written strictly in queue order, which is what preserves
/// message ordering across the relay hop. Closing the sender drains the
/// queue, shuts the stream down cleanly and ends the task.
pub fn spawn_frame_writer(
    mut writer: WriteHalf<BoxedStream>,
    mut rx: mpsc::Receiver<Bytes>,
    write_timeout: Duration,
) -> JoinHandle<Result<(), std::io::Error>> {
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match tokio::time::timeout(write_timeout, writer.write_all(&frame)).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "write timed out",
                    ))
                }
            }
        }
        debug!("write queue drained, closing stream");
        let _ = writer.shutdown().await;
        Ok(())
    })
}
