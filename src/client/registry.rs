use std::fmt::{Debug, Formatter};
use std::time::Duration;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::protocol::Response;

/// The destination for the responses of one request. The client holds the only sending end, so
///  the sink is closed - and the requester's receiver returns `None` - exactly when the pending
///  request is dropped.
pub type ResponseSink = mpsc::Sender<Response>;

pub struct PendingRequest {
    pub request_id: u32,
    pub created_at: Instant,
    /// distinguishes this entry from earlier or later requests that use the same id
    pub registration: u64,
    pub sink: ResponseSink,
    /// never sent to: dropping it together with the entry signals [Retirement::wait]
    retired_signal: watch::Sender<()>,
}
impl Debug for PendingRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PendingRequest{{id:{}, registration:{}, created_at:{:?}}}", self.request_id, self.registration, self.created_at)
    }
}

/// A pending request's sink as handed out by [RequestRegistry::lookup], for delivering responses
///  without holding the registry lock
pub struct SinkHandle {
    pub registration: u64,
    pub sink: ResponseSink,
    pub retired: Retirement,
}

pub struct Retirement(watch::Receiver<()>);
impl Retirement {
    /// Resolves once the entry is no longer in the registry, however it was removed. A delivery
    ///  that is blocked on a full sink must give up then - the sink is about to be closed.
    pub async fn wait(&mut self) {
        while self.0.changed().await.is_ok() {}
    }
}

#[derive(Default)]
struct Entries {
    by_id: FxHashMap<u32, PendingRequest>,
    next_registration: u64,
}

/// Maps request ids to the sinks that are waiting for their responses. There is at most one
///  entry per id. The dispatcher only needs shared access for lookups, all modifications are
///  serialized.
#[derive(Default)]
pub struct RequestRegistry {
    pending: RwLock<Entries>,
}

impl RequestRegistry {
    pub fn new() -> RequestRegistry {
        Default::default()
    }

    /// Registers a sink for a request id, returning the registration that identifies this entry.
    ///  Registrations are numbered in the order in which they are inserted.
    ///
    /// If there is a live entry for the same id, it is removed and returned. Callers should treat
    ///  this as an anomaly and drop it (closing its sink): ids should not wrap around before the
    ///  sweeper reclaims them.
    pub async fn register(&self, request_id: u32, sink: ResponseSink) -> (u64, Option<PendingRequest>) {
        let mut pending = self.pending.write().await;
        let registration = pending.next_registration;
        pending.next_registration += 1;

        let (retired_signal, _) = watch::channel(());
        let displaced = pending.by_id
            .insert(request_id, PendingRequest {
                request_id,
                created_at: Instant::now(),
                registration,
                sink,
                retired_signal,
            });
        (registration, displaced)
    }

    /// returns a clone of the sink, so that delivery does not hold the lock
    pub async fn lookup(&self, request_id: u32) -> Option<SinkHandle> {
        self.pending.read().await
            .by_id
            .get(&request_id)
            .map(|p| SinkHandle {
                registration: p.registration,
                sink: p.sink.clone(),
                retired: Retirement(p.retired_signal.subscribe()),
            })
    }

    /// Removes the entry for an id, provided it is still the given registration - a different
    ///  registration means the entry was already retired and the id was reused.
    pub async fn retire(&self, request_id: u32, registration: u64) -> Option<PendingRequest> {
        let mut pending = self.pending.write().await;
        match pending.by_id.get(&request_id) {
            Some(p) if p.registration == registration => pending.by_id.remove(&request_id),
            Some(_) => {
                debug!(request_id, registration, "not retiring request: its id was registered again in the meantime");
                None
            }
            None => None,
        }
    }

    /// Drops every pending request that is at least `max_age` old, closing its sink. Returns the
    ///  number of evicted requests.
    pub async fn sweep_older_than(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut pending = self.pending.write().await;

        let before = pending.by_id.len();
        pending.by_id.retain(|&request_id, p| {
            let age = now.saturating_duration_since(p.created_at);
            if age >= max_age {
                warn!(request_id, ?age, "request timed out - dropping it");
                false
            }
            else {
                true
            }
        });
        before - pending.by_id.len()
    }

    pub async fn len(&self) -> usize {
        self.pending.read().await.by_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.read().await.by_id.is_empty()
    }

    pub async fn contains(&self, request_id: u32) -> bool {
        self.pending.read().await.by_id.contains_key(&request_id)
    }

    /// drops all pending requests, closing their sinks
    pub async fn clear(&self) {
        self.pending.write().await.by_id.clear();
    }
}
