//! Utilities for testing code that uses the client: an in-memory [dialer::TestDialer] that
//!  hands out the server end of every connection it creates, plus the server side helpers in
//!  [dialer::TestPeer]. They are part of the regular (non-#[cfg(test)]) code so applications can
//!  use them in their own tests.

pub mod dialer;
