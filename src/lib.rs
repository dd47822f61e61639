//! Client runtime for the coordinator's binary RPC protocol.
//!
//! A [client::protocol_client::ProtocolClient] owns one TCP connection to a peer node. Requests
//!  are written as length-prefixed frames, and responses are read back by a single dispatcher loop
//!  that routes them to the caller who issued the request - possibly several responses per
//!  request for streaming queries. Connection loss is handled internally by a single-flight
//!  reconnect, and a periodic sweeper bounds the memory held by requests that never get a reply.
//!
//! ```ascii
//! [u32 LE length N] [N bytes encoded message]
//! ```

pub mod client;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod util;
pub mod test_util;
