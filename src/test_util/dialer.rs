use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::task::{Context, Poll};
use std::time::Duration;
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{duplex, AsyncWrite, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::debug;

use crate::protocol::codec::BinaryCodec;
use crate::protocol::{Request, Response};
use crate::transport::dialer::Dialer;
use crate::transport::framed::FramedTransport;

const PIPE_CAPACITY: usize = 64*1024;

/// A [Dialer] that connects through in-memory pipes. The server end of every successful dial is
///  sent to the receiver returned from [TestDialer::new], in dial order.
pub struct TestDialer {
    dial_count: AtomicUsize,
    failures_remaining: AtomicUsize,
    broken_remaining: AtomicUsize,
    latency: Option<Duration>,
    peers: mpsc::UnboundedSender<TestPeer>,
    /// server ends of broken connections - kept open so that reads on them stay pending
    held_open: Mutex<Vec<DuplexStream>>,
}

impl TestDialer {
    pub fn new() -> (TestDialer, mpsc::UnboundedReceiver<TestPeer>) {
        let (peers, peer_receiver) = mpsc::unbounded_channel();
        let dialer = TestDialer {
            dial_count: AtomicUsize::new(0),
            failures_remaining: AtomicUsize::new(0),
            broken_remaining: AtomicUsize::new(0),
            latency: None,
            peers,
            held_open: Default::default(),
        };
        (dialer, peer_receiver)
    }

    /// every dial takes this long, successful or not
    pub fn with_latency(mut self, latency: Duration) -> TestDialer {
        self.latency = Some(latency);
        self
    }

    /// total number of dial attempts, including failed ones
    pub fn dial_count(&self) -> usize {
        self.dial_count.load(Ordering::SeqCst)
    }

    /// the next `n` dials fail
    pub fn fail_next_dials(&self, n: usize) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    /// The next `n` successful dials return connections on which every write fails, while reads
    ///  never complete. No [TestPeer] is created for them.
    pub fn break_next_connections(&self, n: usize) {
        self.broken_remaining.store(n, Ordering::SeqCst);
    }

    fn take_one(counter: &AtomicUsize) -> bool {
        counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
    }
}

#[async_trait]
impl Dialer for TestDialer {
    async fn dial(&self, addr: &str, max_frame_size: usize) -> anyhow::Result<FramedTransport> {
        let dial_number = self.dial_count.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(latency) = self.latency {
            sleep(latency).await;
        }

        if Self::take_one(&self.failures_remaining) {
            bail!("dial #{} to {}: connection refused (simulated)", dial_number, addr);
        }

        let (client_end, server_end) = duplex(PIPE_CAPACITY);

        if Self::take_one(&self.broken_remaining) {
            debug!("dial #{} to {}: handing out a broken connection", dial_number, addr);
            self.held_open.lock()
                .map_err(|_| anyhow!("poisoned lock"))?
                .push(server_end);
            let (read_half, _) = tokio::io::split(client_end);
            return Ok(FramedTransport::new(Box::new(read_half), Box::new(FailingWriter), max_frame_size));
        }

        self.peers.send(TestPeer {
            transport: FramedTransport::from_stream(server_end, max_frame_size),
        })
            .map_err(|_| anyhow!("peer receiver was dropped"))?;
        Ok(FramedTransport::from_stream(client_end, max_frame_size))
    }
}

/// A writer whose writes all fail, simulating a connection that broke
pub struct FailingWriter;

impl AsyncWrite for FailingWriter {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &[u8]) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "simulated broken connection")))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// The server end of a connection created by [TestDialer], speaking [BinaryCodec]
pub struct TestPeer {
    pub transport: FramedTransport,
}

impl TestPeer {
    pub async fn next_request(&self) -> anyhow::Result<Request> {
        let frame = self.transport.read_frame().await?;
        BinaryCodec::decode_request(&frame)
    }

    pub async fn respond(&self, response: &Response) -> anyhow::Result<()> {
        let mut buf = BytesMut::new();
        BinaryCodec::encode_response(response, &mut buf);
        self.transport.write_frame(&buf).await
    }

    /// sends a frame that is not a valid response
    pub async fn send_garbage(&self, frame: &[u8]) -> anyhow::Result<()> {
        self.transport.write_frame(frame).await
    }
}
