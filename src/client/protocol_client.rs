use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

use crate::client::config::ClientConfig;
use crate::client::connection::ConnectionManager;
use crate::client::dispatcher::run_dispatcher;
use crate::client::registry::{RequestRegistry, ResponseSink};
use crate::client::sender::RequestSender;
use crate::client::sweeper::run_sweeper;
use crate::error::RequestError;
use crate::protocol::codec::{BinaryCodec, MessageCodec};
use crate::protocol::{Request, RequestIdGenerator, Response};
use crate::transport::dialer::{Dialer, TcpDialer};


/// A client for one peer node. Cheap to share behind an `Arc`: all operations take `&self`, and
///  any number of tasks can issue requests concurrently.
///
/// Creating the client starts three background tasks: the initial connect, the response
///  dispatcher and the timeout sweeper. They run until the client is closed or dropped.
pub struct ProtocolClient {
    config: Arc<ClientConfig>,
    connection: Arc<ConnectionManager>,
    registry: Arc<RequestRegistry>,
    sender: RequestSender,
    request_ids: RequestIdGenerator,
    cancel_sender: broadcast::Sender<()>,
}
impl Debug for ProtocolClient {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ProtocolClient{{addr:{}}}", self.config.server_addr)
    }
}

impl ProtocolClient {
    /// NB: This must be called from within a tokio runtime
    pub fn new(config: ClientConfig, dialer: Arc<dyn Dialer>, codec: Arc<dyn MessageCodec>) -> anyhow::Result<ProtocolClient> {
        config.validate()?;
        let config = Arc::new(config);

        let connection = ConnectionManager::new(config.clone(), dialer);
        let registry = Arc::new(RequestRegistry::new());
        let sender = RequestSender::new(config.clone(), connection.clone(), registry.clone(), codec.clone());
        let (cancel_sender, _) = broadcast::channel(1);

        info!("starting client for {}", config.server_addr);
        connection.trigger_reconnect(None);
        tokio::spawn(run_dispatcher(connection.clone(), registry.clone(), codec, cancel_sender.subscribe()));
        tokio::spawn(run_sweeper(config.clone(), registry.clone(), cancel_sender.subscribe()));

        Ok(ProtocolClient {
            config,
            connection,
            registry,
            sender,
            request_ids: RequestIdGenerator::new(),
            cancel_sender,
        })
    }

    /// a client talking [BinaryCodec] over TCP
    pub fn connect_tcp(config: ClientConfig) -> anyhow::Result<ProtocolClient> {
        Self::new(config, Arc::new(TcpDialer), Arc::new(BinaryCodec))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// the next id from the client's wrapping id counter - callers are free to use their own ids
    ///  instead, as long as they are unique among outstanding requests
    pub fn next_request_id(&self) -> u32 {
        self.request_ids.next_id()
    }

    /// Sends a request. Without a sink this is fire-and-forget: success means the request was
    ///  written to the connection. With a sink, every response for the request's id is sent to
    ///  it until a terminal response (END_STREAM or WRITE_OK) arrives, and then the sink is closed.
    ///
    /// The sink is also closed without a terminal response if the request outlives the configured
    ///  maximum request lifetime, or if sending fails. There is no other timeout: callers that
    ///  need one must apply it while reading from the sink.
    ///
    /// NB: Pass the only sender of the channel - the sink is only closed when the client drops it
    pub async fn make_request(&self, request: &Request, sink: Option<ResponseSink>) -> Result<(), RequestError> {
        self.sender.send_request(request, sink).await
    }

    /// convenience for [ProtocolClient::make_request] with a sink of the configured capacity
    pub async fn request_stream(&self, request: &Request) -> Result<mpsc::Receiver<Response>, RequestError> {
        let (sink, receiver) = mpsc::channel(self.config.response_buffer_size);
        self.make_request(request, Some(sink)).await?;
        Ok(receiver)
    }

    /// number of requests that are waiting for (more) responses
    pub async fn pending_requests(&self) -> usize {
        self.registry.len().await
    }

    /// Stops the background tasks, drops the connection and closes the sinks of all pending
    ///  requests. Requests after this fail with [RequestError::Closed]. Closing twice is a no-op.
    pub fn close(&self) {
        if self.connection.is_closed() {
            return;
        }

        let _ = self.cancel_sender.send(());
        self.connection.close();

        let registry = self.registry.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { registry.clear().await });
            }
            Err(_) => debug!("no runtime for clearing pending requests - they are dropped with the client"),
        }
    }
}

impl Drop for ProtocolClient {
    fn drop(&mut self) {
        self.close();
    }
}
