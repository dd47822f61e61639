use std::fmt::{Debug, Formatter};
use std::mem::size_of;
use anyhow::bail;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::trace;

pub const FRAME_LEN_PREFIX_SIZE: usize = size_of::<u32>();

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct FrameWriter {
    stream: BoxedWriter,
    /// set while a frame is being written. If it is still set when the lock is acquired, a
    ///  previous write was cancelled half way and the byte stream is corrupt
    in_progress: bool,
}

/// One connection to the peer, with length-prefixed framing:
///
/// ```ascii
/// 0: payload length N (u32 LE)
/// 4: payload (N bytes)
/// ```
///
/// Read and write halves are locked separately, so the single reader never blocks writers. All
///  writers share the write lock for an entire frame - the protocol has no way to re-synchronize
///  after interleaved length prefixes and payloads, so frame writes *must* be atomic.
pub struct FramedTransport {
    reader: Mutex<BoxedReader>,
    writer: Mutex<FrameWriter>,
    max_frame_size: usize,
}

impl Debug for FramedTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "FramedTransport{{max_frame_size:{}}}", self.max_frame_size)
    }
}

impl FramedTransport {
    pub fn new(reader: BoxedReader, writer: BoxedWriter, max_frame_size: usize) -> FramedTransport {
        FramedTransport {
            reader: Mutex::new(reader),
            writer: Mutex::new(FrameWriter {
                stream: writer,
                in_progress: false,
            }),
            max_frame_size,
        }
    }

    pub fn from_tcp(stream: TcpStream, max_frame_size: usize) -> FramedTransport {
        let (read_half, write_half) = stream.into_split();
        Self::new(Box::new(read_half), Box::new(write_half), max_frame_size)
    }

    /// for any other byte stream, e.g. in-memory pipes in tests
    pub fn from_stream<S: AsyncRead + AsyncWrite + Send + 'static>(stream: S, max_frame_size: usize) -> FramedTransport {
        let (read_half, write_half) = tokio::io::split(stream);
        Self::new(Box::new(read_half), Box::new(write_half), max_frame_size)
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    pub async fn write_frame(&self, payload: &[u8]) -> anyhow::Result<()> {
        if payload.len() > self.max_frame_size {
            bail!("frame of {} bytes exceeds the maximum frame size of {}", payload.len(), self.max_frame_size);
        }
        let len = u32::try_from(payload.len())?;

        let mut writer = self.writer.lock().await;
        if writer.in_progress {
            bail!("an earlier frame write on this connection was interrupted - the stream is corrupt");
        }

        writer.in_progress = true;
        writer.stream.write_all(&len.to_le_bytes()).await?;
        writer.stream.write_all(payload).await?;
        writer.stream.flush().await?;
        writer.in_progress = false;

        trace!("wrote frame of {} bytes", len);
        Ok(())
    }

    /// Reads the next frame. Callers must not read concurrently - the protocol has a single
    ///  reader per connection, and the lock only guards against misuse.
    pub async fn read_frame(&self) -> anyhow::Result<Bytes> {
        let mut reader = self.reader.lock().await;

        let mut len_buf = [0u8; FRAME_LEN_PREFIX_SIZE];
        reader.read_exact(&mut len_buf).await?;
        let frame_len = usize::try_from(u32::from_le_bytes(len_buf))?;

        if frame_len > self.max_frame_size {
            bail!("received a frame length of {} bytes, exceeding the maximum of {} - the stream is apparently corrupt", frame_len, self.max_frame_size);
        }

        let mut frame = BytesMut::zeroed(frame_len);
        reader.read_exact(&mut frame).await?;

        trace!("read frame of {} bytes", frame_len);
        Ok(frame.freeze())
    }

    /// closes the write direction, signalling EOF to the peer
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.stream.shutdown().await?;
        Ok(())
    }
}
