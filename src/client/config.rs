use std::time::Duration;
use anyhow::bail;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `host:port` of the peer node
    pub server_addr: String,

    /// number of attempts for writing a request before the error is returned to the caller. The
    ///  client reconnects between attempts.
    pub request_retry_attempts: usize,

    /// delay between two failed attempts to (re)connect. Reconnecting never gives up.
    pub reconnect_backoff: Duration,
    /// while reconnecting keeps failing, a warning is logged roughly this often
    pub reconnect_log_interval: Duration,

    pub sweep_interval: Duration,
    /// Pending requests older than this are dropped by the sweeper, closing their response
    ///  sinks. This bounds the memory held by requests the server never answers, and it keeps the
    ///  set of live request ids small enough for the id domain to wrap around safely.
    ///
    /// NB: This is not a per-request timeout - callers that need one must apply it while
    ///      reading from their response sink
    pub max_request_lifetime: Duration,

    /// upper bound for frames in both directions. A received length prefix above this is treated
    ///  as a corrupt stream.
    pub max_frame_size: usize,

    /// capacity of response sinks created by the client. A full sink back-pressures the
    ///  dispatcher, i.e. *all* responses on the connection
    pub response_buffer_size: usize,
}

impl ClientConfig {
    pub fn new(server_addr: impl Into<String>) -> ClientConfig {
        ClientConfig {
            server_addr: server_addr.into(),
            request_retry_attempts: 3,
            reconnect_backoff: Duration::from_millis(100),
            reconnect_log_interval: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(60),
            max_request_lifetime: Duration::from_secs(1200),
            max_frame_size: 16*1024*1024,
            response_buffer_size: 64,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.request_retry_attempts == 0 {
            bail!("request retry attempts must be at least 1");
        }
        if self.reconnect_backoff.is_zero() {
            bail!("reconnect backoff must not be zero");
        }
        if self.sweep_interval.is_zero() {
            bail!("sweep interval must not be zero");
        }
        if self.max_request_lifetime < self.sweep_interval {
            bail!("max request lifetime ({:?}) is shorter than the sweep interval ({:?})", self.max_request_lifetime, self.sweep_interval);
        }
        if self.max_frame_size == 0 || self.max_frame_size > u32::MAX as usize {
            bail!("max frame size must be between 1 and {}", u32::MAX);
        }
        if self.response_buffer_size == 0 {
            bail!("response buffer size must be at least 1");
        }
        Ok(())
    }

    /// number of consecutive failed dial attempts between two warnings
    pub fn reconnect_attempts_per_log(&self) -> u32 {
        let per_log = self.reconnect_log_interval.as_nanos() / self.reconnect_backoff.as_nanos().max(1);
        per_log.clamp(1, u32::MAX as u128) as u32
    }
}
