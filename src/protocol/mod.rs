pub mod codec;

use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU32, Ordering};
use bytes::Bytes;
use num_enum::FromPrimitive;


/// A request as it is handed to the client. The id is assigned by the caller and must be unique
///  among the requests that are currently outstanding - see [RequestIdGenerator].
#[derive(Clone, Eq, PartialEq)]
pub struct Request {
    pub id: u32,
    pub payload: Bytes,
}
impl Request {
    pub fn new(id: u32, payload: impl Into<Bytes>) -> Request {
        Request {
            id,
            payload: payload.into(),
        }
    }
}
impl Debug for Request {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Request{{id:{}, {} bytes}}", self.id, self.payload.len())
    }
}

#[derive(Clone, Eq, PartialEq)]
pub struct Response {
    pub request_id: u32,
    pub kind: ResponseKind,
    pub payload: Bytes,
}
impl Response {
    pub fn new(request_id: u32, kind: ResponseKind, payload: impl Into<Bytes>) -> Response {
        Response {
            request_id,
            kind,
            payload: payload.into(),
        }
    }
}
impl Debug for Response {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Response{{request_id:{}, {:?}, {} bytes}}", self.request_id, self.kind, self.payload.len())
    }
}

/// The kind tag of a response. Unknown tags are preserved in [ResponseKind::Other] and forwarded
///  to the requester like any other non-terminal response.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, FromPrimitive)]
#[repr(u8)]
pub enum ResponseKind {
    /// one item of a streamed result - more responses for the same request may follow
    StreamItem = 1,
    /// the end of a stream: no more responses for this request
    EndStream = 2,
    /// acknowledgement of a write request: no more responses for this request
    WriteOk = 3,
    /// a server side error report. This is *not* terminal - the server sends an END_STREAM
    ///  after it if it is done with the request
    Error = 4,
    #[num_enum(catch_all)]
    Other(u8),
}
impl ResponseKind {
    /// Terminal responses retire the pending request after they are delivered
    pub fn is_terminal(&self) -> bool {
        matches!(self, ResponseKind::EndStream | ResponseKind::WriteOk)
    }

    pub fn tag(&self) -> u8 {
        match *self {
            ResponseKind::StreamItem => 1,
            ResponseKind::EndStream => 2,
            ResponseKind::WriteOk => 3,
            ResponseKind::Error => 4,
            ResponseKind::Other(tag) => tag,
        }
    }
}

/// Request ids are a 32 bit domain that wraps around. Pending requests are swept after a maximum
///  lifetime, which keeps the set of live ids small compared to 2^32, so a wrapped id does not
///  normally collide with a request that is still outstanding.
#[derive(Debug, Default)]
pub struct RequestIdGenerator {
    next: AtomicU32,
}
impl RequestIdGenerator {
    pub fn new() -> RequestIdGenerator {
        Self::starting_at(0)
    }

    pub fn starting_at(first: u32) -> RequestIdGenerator {
        RequestIdGenerator {
            next: AtomicU32::new(first),
        }
    }

    pub fn next_id(&self) -> u32 {
        // fetch_add wraps on overflow
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}
