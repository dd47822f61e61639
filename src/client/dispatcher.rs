use std::sync::Arc;
use tokio::select;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, trace, warn};

use crate::client::connection::ConnectionManager;
use crate::client::registry::{RequestRegistry, SinkHandle};
use crate::protocol::codec::MessageCodec;
use crate::protocol::Response;


/// The single reader of the connection: reads frames, decodes them and hands each response to the
///  sink that was registered for its request id. Because there is exactly one reader and each
///  response is delivered before the next frame is read, responses for the same request arrive
///  in wire order.
///
/// Read errors trigger a reconnect, and the loop continues on the new connection - it only ends
///  when the client is closed.
#[instrument(name="dispatcher", skip_all)]
pub async fn run_dispatcher(
    connection: Arc<ConnectionManager>,
    registry: Arc<RequestRegistry>,
    codec: Arc<dyn MessageCodec>,
    mut cancel_receiver: broadcast::Receiver<()>,
) {
    debug!("starting response dispatcher");

    loop {
        let transport = select! {
            t = connection.current_transport() => t,
            _ = cancel_receiver.recv() => break,
        };
        let transport = match transport {
            Ok(t) => t,
            Err(_) => break,
        };

        let frame = select! {
            f = transport.read_frame() => f,
            _ = connection.wait_until_replaced(&transport) => {
                debug!("connection was replaced - reading from the new connection");
                continue;
            }
            _ = cancel_receiver.recv() => break,
        };

        match frame {
            Ok(frame) => {
                match codec.decode(&frame) {
                    Ok(response) => dispatch(registry.as_ref(), response).await,
                    Err(e) => warn!("error decoding response - discarding frame: {}", e),
                }
            }
            Err(e) => {
                if connection.is_closed() {
                    break;
                }
                warn!("error reading from connection - reconnecting: {}", e);
                connection.reconnect(Some(&transport)).await;
            }
        }
    }

    info!("response dispatcher stopped");
}

/// Delivers a response to its pending request, retiring the request after a terminal response.
///  Responses for unknown ids are dropped: the request was retired or swept already.
///
/// A full sink blocks delivery, and with it the whole connection, until the requester reads or
///  the request is retired - e.g. by the sweeper. In the latter case the response is dropped.
pub async fn dispatch(registry: &RequestRegistry, response: Response) {
    let request_id = response.request_id;
    let Some(SinkHandle { registration, sink, mut retired }) = registry.lookup(request_id).await else {
        trace!(request_id, "no pending request for response - dropping it");
        return;
    };

    let is_terminal = response.kind.is_terminal();
    trace!(request_id, kind = ?response.kind, "dispatching response");

    let delivered = select! {
        r = sink.send(response) => r.is_ok(),
        _ = retired.wait() => {
            debug!(request_id, "request was retired while waiting for its sink - dropping response");
            return;
        }
    };

    if !delivered {
        debug!(request_id, "requester is no longer listening - removing pending request");
        registry.retire(request_id, registration).await;
        return;
    }

    if is_terminal {
        // dropping the last sender closes the sink
        drop(sink);
        registry.retire(request_id, registration).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use bytes::Bytes;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;
    use tokio::time::{sleep, timeout};
    use crate::client::config::ClientConfig;
    use crate::client::sweeper::run_sweeper;
    use crate::protocol::codec::BinaryCodec;
    use crate::protocol::ResponseKind;
    use crate::test_util::dialer::{TestDialer, TestPeer};
    use super::*;

    fn response(id: u32, kind: ResponseKind, payload: &'static [u8]) -> Response {
        Response::new(id, kind, Bytes::from_static(payload))
    }

    #[tokio::test]
    async fn test_dispatch_stream_then_end() {
        let registry = RequestRegistry::new();
        let (tx, mut rx) = mpsc::channel(8);
        registry.register(7, tx).await;

        dispatch(&registry, response(7, ResponseKind::StreamItem, b"1")).await;
        assert!(registry.contains(7).await);
        dispatch(&registry, response(7, ResponseKind::EndStream, b"")).await;
        assert!(!registry.contains(7).await);

        assert_eq!(rx.recv().await.unwrap(), response(7, ResponseKind::StreamItem, b"1"));
        assert_eq!(rx.recv().await.unwrap(), response(7, ResponseKind::EndStream, b""));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_dispatch_write_ok_is_terminal() {
        let registry = RequestRegistry::new();
        let (tx, mut rx) = mpsc::channel(8);
        registry.register(3, tx).await;

        dispatch(&registry, response(3, ResponseKind::WriteOk, b"")).await;
        assert!(registry.is_empty().await);
        assert_eq!(rx.recv().await.unwrap().kind, ResponseKind::WriteOk);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_dispatch_error_and_unknown_kinds_are_not_terminal() {
        let registry = RequestRegistry::new();
        let (tx, mut rx) = mpsc::channel(8);
        registry.register(4, tx).await;

        dispatch(&registry, response(4, ResponseKind::Error, b"boom")).await;
        dispatch(&registry, response(4, ResponseKind::Other(77), b"")).await;
        assert!(registry.contains(4).await);
        assert_eq!(rx.recv().await.unwrap().kind, ResponseKind::Error);
        assert_eq!(rx.recv().await.unwrap().kind, ResponseKind::Other(77));
    }

    #[tokio::test]
    async fn test_dispatch_unknown_id_is_dropped() {
        let registry = RequestRegistry::new();
        let (tx, mut rx) = mpsc::channel(8);
        registry.register(1, tx).await;

        dispatch(&registry, response(2, ResponseKind::EndStream, b"")).await;
        assert!(registry.contains(1).await);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dispatch_to_abandoned_sink_retires() {
        let registry = RequestRegistry::new();
        let (tx, rx) = mpsc::channel(8);
        registry.register(5, tx).await;
        drop(rx);

        dispatch(&registry, response(5, ResponseKind::StreamItem, b"")).await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_dispatch_to_full_sink_gives_up_when_retired() {
        let registry = Arc::new(RequestRegistry::new());
        let (tx, mut rx) = mpsc::channel(1);
        registry.register(6, tx).await;
        dispatch(&registry, response(6, ResponseKind::StreamItem, b"1")).await;

        let blocked = {
            let registry = registry.clone();
            tokio::spawn(async move { dispatch(&registry, response(6, ResponseKind::StreamItem, b"2")).await })
        };
        tokio::task::yield_now().await;
        assert!(!blocked.is_finished());

        assert_eq!(registry.sweep_older_than(Duration::ZERO).await, 1);
        timeout(Duration::from_secs(5), blocked).await.unwrap().unwrap();

        assert_eq!(rx.recv().await.unwrap().payload.as_ref(), b"1");
        assert!(rx.recv().await.is_none());
    }

    struct Fixture {
        connection: Arc<ConnectionManager>,
        registry: Arc<RequestRegistry>,
        dialer: Arc<TestDialer>,
        peers: mpsc::UnboundedReceiver<TestPeer>,
        cancel_sender: broadcast::Sender<()>,
        handle: JoinHandle<()>,
    }

    fn start_dispatcher() -> Fixture {
        let config = Arc::new(ClientConfig::new("test:1"));
        let (dialer, peers) = TestDialer::new();
        let dialer = Arc::new(dialer);
        let connection = ConnectionManager::new(config, dialer.clone());
        let registry = Arc::new(RequestRegistry::new());
        let (cancel_sender, cancel_receiver) = broadcast::channel(1);

        connection.trigger_reconnect(None);
        let handle = tokio::spawn(run_dispatcher(connection.clone(), registry.clone(), Arc::new(BinaryCodec), cancel_receiver));
        Fixture { connection, registry, dialer, peers, cancel_sender, handle }
    }

    #[tokio::test]
    async fn test_loop_delivers_in_wire_order() {
        let mut f = start_dispatcher();
        let (tx, mut rx) = mpsc::channel(4);
        f.registry.register(11, tx).await;

        let peer = f.peers.recv().await.unwrap();
        for i in 0..20u8 {
            peer.respond(&Response::new(11, ResponseKind::StreamItem, vec![i])).await.unwrap();
        }
        peer.respond(&response(11, ResponseKind::EndStream, b"")).await.unwrap();

        for i in 0..20u8 {
            let r = rx.recv().await.unwrap();
            assert_eq!(r.kind, ResponseKind::StreamItem);
            assert_eq!(r.payload.as_ref(), &[i]);
        }
        assert_eq!(rx.recv().await.unwrap().kind, ResponseKind::EndStream);
        assert!(rx.recv().await.is_none());
        assert!(f.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_loop_skips_undecodable_frames() {
        let mut f = start_dispatcher();
        let (tx, mut rx) = mpsc::channel(4);
        f.registry.register(12, tx).await;

        let peer = f.peers.recv().await.unwrap();
        peer.send_garbage(b"\x01").await.unwrap();
        peer.respond(&response(12, ResponseKind::EndStream, b"")).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().kind, ResponseKind::EndStream);
        assert_eq!(f.dialer.dial_count(), 1);
    }

    #[tokio::test]
    async fn test_loop_reconnects_after_read_failure() {
        let mut f = start_dispatcher();
        let (tx, mut rx) = mpsc::channel(4);
        f.registry.register(9, tx).await;

        let first_peer = f.peers.recv().await.unwrap();
        drop(first_peer);

        let second_peer = timeout(Duration::from_secs(5), f.peers.recv()).await.unwrap().unwrap();
        second_peer.respond(&response(9, ResponseKind::EndStream, b"")).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().kind, ResponseKind::EndStream);
        assert!(rx.recv().await.is_none());
        assert_eq!(f.dialer.dial_count(), 2);
    }

    #[tokio::test]
    async fn test_loop_follows_replaced_connection() {
        let mut f = start_dispatcher();
        let (tx, mut rx) = mpsc::channel(4);
        f.registry.register(13, tx).await;

        // the first connection stays open, but a writer replaces it
        let _first_peer = f.peers.recv().await.unwrap();
        let first = f.connection.current_transport().await.unwrap();
        f.connection.reconnect(Some(&first)).await;

        let second_peer = f.peers.recv().await.unwrap();
        second_peer.respond(&response(13, ResponseKind::WriteOk, b"")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().kind, ResponseKind::WriteOk);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unread_sink_does_not_block_other_requests_after_sweep() {
        let mut f = start_dispatcher();
        let mut config = ClientConfig::new("test:1");
        config.sweep_interval = Duration::from_secs(60);
        config.max_request_lifetime = Duration::from_secs(60);
        tokio::spawn(run_sweeper(Arc::new(config), f.registry.clone(), f.cancel_sender.subscribe()));

        // the requester never reads, so the second item blocks the dispatcher
        let (stalled_tx, mut stalled_rx) = mpsc::channel(1);
        f.registry.register(1, stalled_tx).await;
        let peer = f.peers.recv().await.unwrap();
        peer.respond(&response(1, ResponseKind::StreamItem, b"a")).await.unwrap();
        peer.respond(&response(1, ResponseKind::StreamItem, b"b")).await.unwrap();

        while f.registry.contains(1).await {
            sleep(Duration::from_secs(1)).await;
        }

        let (tx, mut rx) = mpsc::channel(4);
        f.registry.register(2, tx).await;
        peer.respond(&response(2, ResponseKind::EndStream, b"")).await.unwrap();
        let delivered = timeout(Duration::from_secs(30), rx.recv()).await.unwrap();
        assert_eq!(delivered.unwrap().kind, ResponseKind::EndStream);

        assert_eq!(stalled_rx.recv().await.unwrap().payload.as_ref(), b"a");
        assert!(stalled_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_loop_stops_on_cancel() {
        let f = start_dispatcher();
        f.cancel_sender.send(()).unwrap();
        timeout(Duration::from_secs(5), f.handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_loop_stops_on_close() {
        let f = start_dispatcher();
        f.connection.current_transport().await.unwrap();
        f.connection.close();
        timeout(Duration::from_secs(5), f.handle).await.unwrap().unwrap();
    }
}
