use std::sync::Arc;
use anyhow::anyhow;
use bytes::BytesMut;
use tracing::{debug, trace, warn};

use crate::client::config::ClientConfig;
use crate::client::connection::ConnectionManager;
use crate::client::registry::{RequestRegistry, ResponseSink};
use crate::error::RequestError;
use crate::protocol::codec::MessageCodec;
use crate::protocol::Request;


/// Writes requests to the current connection, retrying on a fresh connection if a write fails.
#[derive(Clone)]
pub struct RequestSender {
    config: Arc<ClientConfig>,
    connection: Arc<ConnectionManager>,
    registry: Arc<RequestRegistry>,
    codec: Arc<dyn MessageCodec>,
}

impl RequestSender {
    pub fn new(config: Arc<ClientConfig>, connection: Arc<ConnectionManager>, registry: Arc<RequestRegistry>, codec: Arc<dyn MessageCodec>) -> RequestSender {
        RequestSender {
            config,
            connection,
            registry,
            codec,
        }
    }

    /// Sends a request. If a sink is passed, it is registered for the request's id before
    ///  anything is written, so responses can not overtake the registration.
    ///
    /// Only two failures are returned: an encoding error (nothing sent, nothing registered) and
    ///  running out of write attempts (the registration is removed again, closing the sink).
    pub async fn send_request(&self, request: &Request, sink: Option<ResponseSink>) -> Result<(), RequestError> {
        let frame = self.encode(request)?;

        let registration = match sink {
            Some(sink) => Some(self.register(request.id, sink).await),
            None => None,
        };

        match self.write_with_retry(request.id, &frame).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Some(registration) = registration {
                    if self.registry.retire(request.id, registration).await.is_some() {
                        debug!(request_id = request.id, "removed pending request after failing to send it");
                    }
                }
                Err(e)
            }
        }
    }

    fn encode(&self, request: &Request) -> Result<BytesMut, RequestError> {
        let mut buf = BytesMut::new();
        self.codec.encode(request, &mut buf)
            .map_err(RequestError::Encode)?;

        if buf.len() > self.config.max_frame_size {
            return Err(RequestError::Encode(anyhow!("encoded request has {} bytes, exceeding the maximum frame size of {}", buf.len(), self.config.max_frame_size)));
        }
        Ok(buf)
    }

    async fn register(&self, request_id: u32, sink: ResponseSink) -> u64 {
        let (registration, displaced) = self.registry.register(request_id, sink).await;
        if let Some(displaced) = displaced {
            // ids should be swept long before the id space wraps around
            warn!(request_id, ?displaced, "there is already a pending request with this id - it must have timed out. Closing it");
        }
        registration
    }

    async fn write_with_retry(&self, request_id: u32, frame: &[u8]) -> Result<(), RequestError> {
        let attempts = self.config.request_retry_attempts;
        let mut last_error = None;

        for attempt in 1..=attempts {
            let transport = self.connection.current_transport().await
                .map_err(|_| RequestError::Closed)?;

            match transport.write_frame(frame).await {
                Ok(()) => {
                    trace!(request_id, attempt, "sent request");
                    return Ok(());
                }
                Err(e) => {
                    warn!(request_id, attempt, "error sending request: {}", e);
                    if attempt < attempts {
                        self.connection.reconnect(Some(&transport)).await;
                    }
                    else {
                        // repair the connection for later requests, but don't make the caller wait for it
                        self.connection.trigger_reconnect(Some(&transport));
                    }
                    last_error = Some(e);
                }
            }
        }

        if self.connection.is_closed() {
            return Err(RequestError::Closed);
        }
        Err(RequestError::WriteRetriesExhausted {
            attempts,
            source: last_error.unwrap_or_else(|| anyhow!("no write attempt was made")),
        })
    }
}
