use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, instrument, trace, warn};

use crate::client::config::ClientConfig;
use crate::error::RequestError;
use crate::transport::dialer::Dialer;
use crate::transport::framed::FramedTransport;


#[derive(Clone)]
pub enum ConnectionState {
    /// initial state, before the first connection attempt was triggered
    Disconnected,
    Connected(Arc<FramedTransport>),
    Reconnecting,
    Closed,
}
impl Debug for ConnectionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connected(_) => write!(f, "Connected"),
            ConnectionState::Reconnecting => write!(f, "Reconnecting"),
            ConnectionState::Closed => write!(f, "Closed"),
        }
    }
}

/// Owns the connection to the server. Everybody else gets the current transport from here for
///  each I/O operation, and reports failures back by calling [ConnectionManager::reconnect].
///
/// Reconnecting is single-flight: the first failure report for a connection moves the state from
///  `Connected` to `Reconnecting` and starts the one redial loop. Concurrent reports (e.g. from
///  several writers and the reader hitting the same dead socket) just wait for that loop to
///  finish, and reports for a connection that was replaced already are ignored.
pub struct ConnectionManager {
    config: Arc<ClientConfig>,
    dialer: Arc<dyn Dialer>,
    state: watch::Sender<ConnectionState>,
    /// when the most recent connection was established - only the redial loop uses this
    last_connected_at: Mutex<Option<Instant>>,
}
impl Debug for ConnectionManager {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConnectionManager{{addr:{}, state:{:?}}}", self.config.server_addr, *self.state.borrow())
    }
}

impl ConnectionManager {
    pub fn new(config: Arc<ClientConfig>, dialer: Arc<dyn Dialer>) -> Arc<ConnectionManager> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(ConnectionManager {
            config,
            dialer,
            state,
            last_connected_at: Mutex::new(None),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.state.borrow(), ConnectionState::Closed)
    }

    /// Waits for an established connection and returns it. The result must not be cached across
    ///  a reconnect - fetch it again for every operation.
    ///
    /// NB: This waits indefinitely in `Disconnected` state, i.e. until a connection attempt was
    ///      triggered and succeeded
    pub async fn current_transport(&self) -> anyhow::Result<Arc<FramedTransport>> {
        let mut receiver = self.state.subscribe();
        let state = receiver
            .wait_for(|s| matches!(s, ConnectionState::Connected(_) | ConnectionState::Closed))
            .await?;
        match &*state {
            ConnectionState::Connected(transport) => Ok(transport.clone()),
            _ => Err(RequestError::Closed.into()),
        }
    }

    /// Starts a reconnect unless one is running already, without waiting for it. `failed` is the
    ///  transport on which the caller saw an error: if it was replaced in the meantime, nothing
    ///  happens. `None` replaces whatever connection is current.
    ///
    /// Returns `true` if this call started the redial loop.
    pub fn trigger_reconnect(self: &Arc<Self>, failed: Option<&Arc<FramedTransport>>) -> bool {
        let mut old_transport = None;
        let started = self.state.send_if_modified(|state| {
            let start = match state {
                ConnectionState::Disconnected => true,
                ConnectionState::Connected(current) => failed.map_or(true, |f| Arc::ptr_eq(current, f)),
                ConnectionState::Reconnecting | ConnectionState::Closed => false,
            };
            if start {
                if let ConnectionState::Connected(transport) = std::mem::replace(state, ConnectionState::Reconnecting) {
                    old_transport = Some(transport);
                }
            }
            start
        });

        if started {
            debug!("starting to reconnect to {}", self.config.server_addr);
            let this = self.clone();
            tokio::spawn(async move {
                this.redial_loop(old_transport).await
            });
        }
        started
    }

    /// Triggers a reconnect (see [ConnectionManager::trigger_reconnect]) and waits until the
    ///  client is connected again - whoever did the actual dialing - or closed.
    pub async fn reconnect(self: &Arc<Self>, failed: Option<&Arc<FramedTransport>>) {
        self.trigger_reconnect(failed);

        let mut receiver = self.state.subscribe();
        let _ = receiver
            .wait_for(|s| matches!(s, ConnectionState::Connected(_) | ConnectionState::Closed))
            .await;
    }

    /// resolves once the given transport is no longer the current connection
    pub async fn wait_until_replaced(&self, transport: &Arc<FramedTransport>) {
        let mut receiver = self.state.subscribe();
        let _ = receiver
            .wait_for(|s| !matches!(s, ConnectionState::Connected(current) if Arc::ptr_eq(current, transport)))
            .await;
    }

    /// Drops the current connection and ends a running redial loop. Waiting and later calls to
    ///  [ConnectionManager::current_transport] fail.
    pub fn close(&self) {
        let previous = self.state.send_replace(ConnectionState::Closed);
        if !matches!(previous, ConnectionState::Closed) {
            info!("closing connection to {}", self.config.server_addr);
        }
    }

    #[instrument(name="reconnect", skip_all, fields(addr = %self.config.server_addr))]
    async fn redial_loop(self: Arc<Self>, old_transport: Option<Arc<FramedTransport>>) {
        if let Some(old_transport) = old_transport {
            // a writer may be stuck on the old connection, holding its write lock
            match timeout(self.config.reconnect_backoff, old_transport.shutdown()).await {
                Ok(Ok(())) => trace!("shut down previous connection"),
                Ok(Err(e)) => trace!("error shutting down previous connection: {}", e),
                Err(_) => debug!("timeout shutting down previous connection - dropping it"),
            }
        }

        // a peer that accepts connections and closes them right away must not cause a redial storm
        let last_connected_at = *self.last_connected_at.lock().await;
        if let Some(connected_at) = last_connected_at {
            let connection_age = connected_at.elapsed();
            if connection_age < self.config.reconnect_backoff {
                debug!("previous connection lasted only {:?} - delaying the redial", connection_age);
                sleep(self.config.reconnect_backoff - connection_age).await;
            }
        }

        let attempts_per_log = self.config.reconnect_attempts_per_log();
        let mut attempts: u32 = 0;
        loop {
            if self.is_closed() {
                debug!("client was closed - stopping to reconnect");
                return;
            }

            attempts = attempts.wrapping_add(1);
            match self.dialer.dial(&self.config.server_addr, self.config.max_frame_size).await {
                Ok(transport) => {
                    let transport = Arc::new(transport);
                    // recorded before publishing, so a failure reported right away sees it
                    *self.last_connected_at.lock().await = Some(Instant::now());
                    let installed = self.state.send_if_modified(|state| {
                        if matches!(state, ConnectionState::Reconnecting) {
                            *state = ConnectionState::Connected(transport.clone());
                            true
                        }
                        else {
                            false
                        }
                    });

                    if installed {
                        info!("connected to {}", self.config.server_addr);
                    }
                    else {
                        debug!("client was closed while dialing - discarding the new connection");
                    }
                    return;
                }
                Err(e) => {
                    if attempts % attempts_per_log == 0 {
                        warn!("failed to connect to {} after {} attempts, continuing to retry: {}", self.config.server_addr, attempts, e);
                    }
                    else {
                        trace!("failed to connect: {}", e);
                    }
                    sleep(self.config.reconnect_backoff).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use anyhow::anyhow;
    use mockall::Sequence;
    use tokio::io::duplex;
    use tokio::time::Instant;
    use crate::test_util::dialer::TestDialer;
    use crate::transport::dialer::MockDialer;
    use super::*;

    fn config() -> Arc<ClientConfig> {
        Arc::new(ClientConfig::new("test:1"))
    }

    fn manager(dialer: Arc<dyn Dialer>) -> Arc<ConnectionManager> {
        ConnectionManager::new(config(), dialer)
    }

    #[tokio::test]
    async fn test_initial_connect() {
        let (dialer, _peers) = TestDialer::new();
        let dialer = Arc::new(dialer);
        let connection = manager(dialer.clone());

        assert!(matches!(connection.state(), ConnectionState::Disconnected));
        assert!(connection.trigger_reconnect(None));
        connection.current_transport().await.unwrap();

        assert!(matches!(connection.state(), ConnectionState::Connected(_)));
        assert_eq!(dialer.dial_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_reconnects_dial_once() {
        let (dialer, _peers) = TestDialer::new();
        let dialer = Arc::new(dialer.with_latency(Duration::from_millis(50)));
        let connection = manager(dialer.clone());
        connection.reconnect(None).await;
        let failed = connection.current_transport().await.unwrap();
        assert_eq!(dialer.dial_count(), 1);

        let mut handles = Vec::new();
        for _ in 0..20 {
            let connection = connection.clone();
            let failed = failed.clone();
            handles.push(tokio::spawn(async move {
                connection.reconnect(Some(&failed)).await;
                connection.current_transport().await.unwrap()
            }));
        }

        let mut transports = Vec::new();
        for h in handles {
            transports.push(h.await.unwrap());
        }

        assert_eq!(dialer.dial_count(), 2);
        let current = connection.current_transport().await.unwrap();
        assert!(!Arc::ptr_eq(&current, &failed));
        assert!(transports.iter().all(|t| Arc::ptr_eq(t, &current)));
    }

    #[tokio::test]
    async fn test_stale_failure_report_is_ignored() {
        let (dialer, _peers) = TestDialer::new();
        let dialer = Arc::new(dialer);
        let connection = manager(dialer.clone());
        connection.reconnect(None).await;

        let first = connection.current_transport().await.unwrap();
        connection.reconnect(Some(&first)).await;
        assert_eq!(dialer.dial_count(), 2);

        // a second report for the same dead connection arrives after it was replaced
        assert!(!connection.trigger_reconnect(Some(&first)));
        connection.reconnect(Some(&first)).await;
        assert_eq!(dialer.dial_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_redial_with_fixed_backoff() {
        let mut dialer = MockDialer::new();
        let mut seq = Sequence::new();
        dialer.expect_dial()
            .times(5)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(anyhow!("connection refused")));
        dialer.expect_dial()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|addr, max_frame_size| {
                assert_eq!(addr, "test:1");
                Ok(FramedTransport::from_stream(duplex(64).0, max_frame_size))
            });

        let connection = manager(Arc::new(dialer));
        let start = Instant::now();
        connection.reconnect(None).await;

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(500) && elapsed < Duration::from_millis(600), "{:?}", elapsed);
        assert!(matches!(connection.state(), ConnectionState::Connected(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_redials_after_short_lived_connections_are_spaced() {
        let (dialer, _peers) = TestDialer::new();
        let dialer = Arc::new(dialer);
        let connection = manager(dialer.clone());
        connection.reconnect(None).await;

        let start = Instant::now();
        for _ in 0..5 {
            let current = connection.current_transport().await.unwrap();
            connection.reconnect(Some(&current)).await;
        }

        assert_eq!(dialer.dial_count(), 6);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(500) && elapsed < Duration::from_millis(600), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_stops_redial_loop() {
        let (dialer, _peers) = TestDialer::new();
        let dialer = Arc::new(dialer);
        dialer.fail_next_dials(usize::MAX);
        let connection = manager(dialer.clone());

        connection.trigger_reconnect(None);
        sleep(Duration::from_millis(1050)).await;
        let dials_before_close = dialer.dial_count();
        assert!(dials_before_close >= 10);

        connection.close();
        assert!(connection.current_transport().await.is_err());

        sleep(Duration::from_secs(1)).await;
        assert!(dialer.dial_count() <= dials_before_close + 1);
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let (dialer, _peers) = TestDialer::new();
        let connection = manager(Arc::new(dialer));

        let waiter = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.current_transport().await })
        };
        tokio::task::yield_now().await;

        connection.close();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err.downcast_ref::<RequestError>(), Some(RequestError::Closed)));

        // closed is final
        assert!(!connection.trigger_reconnect(None));
        assert!(matches!(connection.state(), ConnectionState::Closed));
    }

    #[tokio::test]
    async fn test_wait_until_replaced() {
        let (dialer, _peers) = TestDialer::new();
        let connection = manager(Arc::new(dialer));
        connection.reconnect(None).await;
        let first = connection.current_transport().await.unwrap();

        let waiter = {
            let connection = connection.clone();
            let first = first.clone();
            tokio::spawn(async move { connection.wait_until_replaced(&first).await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        connection.reconnect(Some(&first)).await;
        waiter.await.unwrap();
    }
}
