use std::net::SocketAddr;
use std::time::Duration;
use anyhow::bail;
use crate::packet::codec::{MAX_AUTH_TOKEN_LEN, MAX_GREETING_OVERHEAD};

pub struct NetConfig {
    /// If this is set, the end point binds a listening socket to this address and accepts
    ///  incoming sessions. Client-only end points leave it empty.
    pub listen_addr: Option<SocketAddr>,

    /// This is the size of the buffers in the buffer pool, i.e. the maximum number of bytes
    ///  read from a socket in a single read operation. Outgoing frames that do not fit into
    ///  a pooled buffer get a dedicated (non-pooled) buffer.
    pub buffer_size: usize,
    /// This is the number of buffers that will be pooled at a given time - buffers in excess of this
    ///  number are discarded when they are returned.
    pub buffer_pool_size: usize,

    /// Frames declaring a longer payload are treated as a protocol violation
    pub max_payload_len: u32,

    /// Capacity of the protocol engine's inbound queue. `None` means unbounded, i.e. producers
    ///  are never blocked at the cost of unbounded memory growth
    pub protocol_queue_capacity: Option<usize>,
    pub selector_event_capacity: usize,
    /// upper bound for a pump's blocking wait: this is the latency for noticing a stop request
    pub pump_poll_interval: Duration,
    /// interval of the periodic timer that drives time-based acks, nack retries, keep-alive
    ///  and all timeout checks
    pub housekeeping_interval: Duration,

    pub ack_policy: AckPolicy,
    pub nack_retry_interval: Duration,
    /// A missing packet is NAK'ed this many times before the session gives up on it
    pub max_nack_retries: u32,
    /// This is the maximum number of *packets* (not bytes) the receiver buffers ahead of the
    ///  next expected sequence number. Must be below 2^15 for wrap-aware comparison to work.
    pub receive_window: u16,
    /// This is the maximum number of sent packets waiting for an ack. Further data is held back
    ///  (without a sequence number) until acks make room. Must be below 2^15 for wrap-aware
    ///  comparison to work, and should not exceed the peer's receive window.
    pub max_unacked: u16,

    pub keepalive_interval: Duration,
    /// An established session that does not receive anything for this long is terminated with
    ///  SESSION_TIMEOUT. This applies to disconnected sessions waiting for resumption as well.
    pub session_timeout: Duration,
    pub connect_timeout: Duration,
    pub greeting_timeout: Duration,

    pub reconnect: ReconnectPolicy,

    /// sent by clients as part of the greeting
    pub auth_token: Option<Vec<u8>>,
    /// if set, servers reject greetings that do not carry this token
    pub required_auth_token: Option<Vec<u8>>,
}

impl Default for NetConfig {
    fn default() -> Self {
        NetConfig {
            listen_addr: None,
            buffer_size: 16*1024,
            buffer_pool_size: 256,
            max_payload_len: 1024*1024,
            protocol_queue_capacity: None,
            selector_event_capacity: 1024,
            pump_poll_interval: Duration::from_millis(100),
            housekeeping_interval: Duration::from_millis(100),
            ack_policy: AckPolicy {
                every_packets: Some(16),
                interval: Some(Duration::from_millis(200)),
            },
            nack_retry_interval: Duration::from_millis(500),
            max_nack_retries: 5,
            receive_window: 4096,
            max_unacked: 4096,
            keepalive_interval: Duration::from_secs(5),
            session_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            greeting_timeout: Duration::from_secs(5),
            reconnect: ReconnectPolicy::default(),
            auth_token: None,
            required_auth_token: None,
        }
    }
}

impl NetConfig {
    pub fn server(listen_addr: SocketAddr) -> NetConfig {
        NetConfig {
            listen_addr: Some(listen_addr),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.buffer_size < 64 {
            bail!("buffer size is too small: {}", self.buffer_size);
        }
        if self.max_payload_len == 0 {
            bail!("max payload length must be positive");
        }
        if self.protocol_queue_capacity == Some(0) {
            bail!("a bounded protocol queue needs a capacity of at least 1");
        }
        if self.selector_event_capacity == 0 {
            bail!("selector event capacity must be positive");
        }
        if self.pump_poll_interval.is_zero() || self.housekeeping_interval.is_zero() {
            bail!("pump poll interval and housekeeping interval must be positive");
        }
        if self.ack_policy.every_packets.is_none() && self.ack_policy.interval.is_none() {
            bail!("ack policy must define a packet count, an interval or both");
        }
        if self.ack_policy.every_packets == Some(0) {
            bail!("acking every 0 packets is not meaningful");
        }
        if self.receive_window == 0 || self.receive_window > i16::MAX as u16 {
            bail!("receive window must be between 1 and {}, was {}", i16::MAX, self.receive_window);
        }
        if self.max_unacked == 0 || self.max_unacked > i16::MAX as u16 {
            bail!("max unacked packets must be between 1 and {}, was {}", i16::MAX, self.max_unacked);
        }
        if self.keepalive_interval >= self.session_timeout {
            bail!("keep-alive interval {:?} must be shorter than the session timeout {:?}", self.keepalive_interval, self.session_timeout);
        }
        for token in [&self.auth_token, &self.required_auth_token].into_iter().flatten() {
            if token.len() > MAX_AUTH_TOKEN_LEN {
                bail!("auth token is {} bytes long, the maximum is {}", token.len(), MAX_AUTH_TOKEN_LEN);
            }
            if token.len() + MAX_GREETING_OVERHEAD > self.max_payload_len as usize {
                bail!("a greeting with a {} byte auth token exceeds the max payload length of {}", token.len(), self.max_payload_len);
            }
        }
        self.reconnect.validate()
    }
}

/// Determines when the receiver acknowledges packets. NB: Acks are cumulative, so acking less
///  frequently saves bandwidth but keeps packets in the sender's transmit queue for longer
pub struct AckPolicy {
    /// send an ack after this many in-sequence packets were delivered
    pub every_packets: Option<u32>,
    /// send an ack if there are unacknowledged deliveries that are older than this
    pub interval: Option<Duration>,
}

pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// growth factor of the delay between attempts, in eighths (i.e. 16 doubles the delay)
    pub factor_eighths: u32,
    /// `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            factor_eighths: 16,
            max_attempts: Some(10),
        }
    }
}

impl ReconnectPolicy {
    fn validate(&self) -> anyhow::Result<()> {
        if self.factor_eighths < 8 {
            bail!("reconnect delays must not shrink: factor in eighths is {}", self.factor_eighths);
        }
        if self.initial_delay > self.max_delay {
            bail!("initial reconnect delay {:?} exceeds the maximum delay {:?}", self.initial_delay, self.max_delay);
        }
        Ok(())
    }
}
