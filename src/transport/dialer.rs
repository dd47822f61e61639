use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::TcpStream;
use tracing::trace;

use crate::transport::framed::FramedTransport;


/// This is an abstraction for establishing a connection to the server, introduced to facilitate
///  replacing the network part for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self, addr: &str, max_frame_size: usize) -> anyhow::Result<FramedTransport>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str, max_frame_size: usize) -> anyhow::Result<FramedTransport> {
        trace!("dialing {}", addr);
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(FramedTransport::from_tcp(stream, max_frame_size))
    }
}
