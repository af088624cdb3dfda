use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use anyhow::bail;
use bytes::Bytes;
use tracing::debug;
use crate::config::NetConfig;
use crate::packet::packet::{Packet, PacketFlags};
use crate::packet::sequence::SequenceNumber;
use crate::reactor::timer::TimerKey;
use crate::session::backoff::ReconnectBackoff;
use crate::session::reorder_buffer::ReorderBuffer;
use crate::transport::channel_transport::ChannelTransport;

/// Local handle for a session, assigned when the session object is created. Unlike the
///  [SessionId], it is known before a session is established, so applications use it to
///  address sessions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey(u64);

impl SessionKey {
    pub const fn from_raw(raw: u64) -> SessionKey {
        SessionKey(raw)
    }

    pub const fn to_raw(self) -> u64 {
        self.0
    }
}

impl Display for SessionKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "S{}", self.0)
    }
}

/// Protocol-level session identity, issued by the server when a session is first established
///  and stable across reconnects
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub const fn from_raw(raw: u64) -> SessionId {
        SessionId(raw)
    }

    pub const fn to_raw(self) -> u64 {
        self.0
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// ```ascii
///  NotConnected --> Connecting --> Connected --> Established --> Disconnecting --> NotConnected
///        ^               |             |              |
///        +---------------+-------------+--------------+  (network failure)
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    NotConnected,
    Connecting,
    /// transport attached, greeting not yet exchanged
    Connected,
    Established,
    Disconnecting,
}

/// Protocol state of a single peer conversation. A session outlives the transports it uses:
///  after a network failure, an established session keeps its queues and sequence counters
///  until it is resumed on a new transport.
pub struct Session {
    key: SessionKey,
    session_id: Option<SessionId>,
    status: SessionStatus,
    status_since: Instant,
    is_client: bool,
    remote_addr: Option<SocketAddr>,
    transport: Option<Arc<ChannelTransport>>,

    next_tx_sequence: SequenceNumber,
    /// outbound data packets that were not acknowledged yet, in sequence order
    transmit_queue: VecDeque<Packet>,
    /// the first `num_sent` packets in the transmit queue were sent at least once
    num_sent: usize,
    /// payloads waiting for room in the transmit queue. They get a sequence number when they
    ///  are admitted, so the transmit queue never spans more than `max_unacked` sequence numbers.
    pending_outbound: VecDeque<Bytes>,
    max_unacked: usize,

    reorder: ReorderBuffer,
    delivered_since_ack: u32,
    oldest_unacked_delivery: Option<Instant>,

    pending_disconnect: bool,
    connections: u32,
    last_comm_time: Instant,
    last_sent_time: Instant,

    backoff: ReconnectBackoff,
    pub reconnect_timer: Option<TimerKey>,
}

impl Session {
    fn new(key: SessionKey, is_client: bool, remote_addr: Option<SocketAddr>, config: &NetConfig, now: Instant) -> Session {
        Session {
            key,
            session_id: None,
            status: SessionStatus::NotConnected,
            status_since: now,
            is_client,
            remote_addr,
            transport: None,
            next_tx_sequence: SequenceNumber::ZERO,
            transmit_queue: Default::default(),
            num_sent: 0,
            pending_outbound: Default::default(),
            max_unacked: config.max_unacked as usize,
            reorder: ReorderBuffer::new(config.receive_window),
            delivered_since_ack: 0,
            oldest_unacked_delivery: None,
            pending_disconnect: false,
            connections: 0,
            last_comm_time: now,
            last_sent_time: now,
            backoff: ReconnectBackoff::new(&config.reconnect),
            reconnect_timer: None,
        }
    }

    pub fn new_client(key: SessionKey, remote_addr: SocketAddr, config: &NetConfig, now: Instant) -> Session {
        Self::new(key, true, Some(remote_addr), config, now)
    }

    /// a server-side session for an accepted transport, waiting for the client's greeting
    pub fn new_server(key: SessionKey, transport: Arc<ChannelTransport>, config: &NetConfig, now: Instant) -> Session {
        let mut result = Self::new(key, false, transport.peer_addr(), config, now);
        let _ = result.attach_transport(transport);
        result.connections = 1;
        result.set_status(SessionStatus::Connected, now);
        result
    }

    pub fn key(&self) -> SessionKey {
        self.key
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn status_since(&self) -> Instant {
        self.status_since
    }

    pub fn is_client(&self) -> bool {
        self.is_client
    }

    pub fn is_established(&self) -> bool {
        self.status == SessionStatus::Established
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn connections(&self) -> u32 {
        self.connections
    }

    pub fn transport(&self) -> Option<&Arc<ChannelTransport>> {
        self.transport.as_ref()
    }

    pub fn is_current_transport(&self, transport: &Arc<ChannelTransport>) -> bool {
        self.transport.as_ref()
            .map(|t| Arc::ptr_eq(t, transport))
            .unwrap_or(false)
    }

    pub fn set_status(&mut self, status: SessionStatus, now: Instant) {
        if status != self.status {
            debug!("session {}: {:?} -> {:?}", self.key, self.status, status);
            self.status = status;
            self.status_since = now;
        }
    }

    /// Starts a (re)connect attempt for a client session. This is only valid while the session
    ///  is not connected.
    pub fn start_connection(&mut self, now: Instant) -> anyhow::Result<()> {
        if !self.is_client {
            bail!("session {} is a server session and can not initiate a connection", self.key);
        }
        if self.status != SessionStatus::NotConnected {
            bail!("session {} can not start a connection in status {:?}", self.key, self.status);
        }
        self.set_status(SessionStatus::Connecting, now);
        Ok(())
    }

    /// called when the attached transport is connected, i.e. when a client's connect attempt
    ///  succeeded or a server session is resumed on a new transport
    pub fn connection_established(&mut self, now: Instant) {
        self.connections += 1;
        self.set_status(SessionStatus::Connected, now);
        self.last_comm_time = now;
    }

    /// Attaches a transport, returning the previously attached transport (if any). The caller
    ///  is responsible for closing a replaced transport.
    #[must_use]
    pub fn attach_transport(&mut self, transport: Arc<ChannelTransport>) -> Option<Arc<ChannelTransport>> {
        if self.is_current_transport(&transport) {
            return None;
        }
        transport.set_attachment(Some(self.key));
        let previous = self.transport.replace(transport);
        if let Some(previous) = &previous {
            previous.set_attachment(None);
        }
        previous
    }

    #[must_use]
    pub fn detach_transport(&mut self) -> Option<Arc<ChannelTransport>> {
        let result = self.transport.take();
        if let Some(transport) = &result {
            transport.set_attachment(None);
        }
        result
    }

    pub fn set_established(&mut self, session_id: SessionId, now: Instant) {
        self.session_id = Some(session_id);
        self.set_status(SessionStatus::Established, now);
        self.backoff.reset();
    }

    pub fn is_pending_disconnect(&self) -> bool {
        self.pending_disconnect
    }

    /// Stops accepting outbound data. The engine sends a DISCONNECT once the transmit queue is
    ///  drained.
    pub fn set_pending_disconnect(&mut self) {
        self.pending_disconnect = true;
    }

    pub fn backoff(&mut self) -> &mut ReconnectBackoff {
        &mut self.backoff
    }

    pub fn reorder_buffer(&mut self) -> &mut ReorderBuffer {
        &mut self.reorder
    }

    pub fn receive_next(&self) -> SequenceNumber {
        self.reorder.next_expected()
    }

    /// Queues an outbound payload. It is assigned the next sequence number right away if there
    ///  is room in the transmit queue, otherwise it waits until acks make room. Returns `false`
    ///  if the payload has to wait.
    pub fn enqueue_outbound(&mut self, payload: Bytes) -> bool {
        self.pending_outbound.push_back(payload);
        self.admit_pending();
        self.pending_outbound.is_empty()
    }

    fn admit_pending(&mut self) -> usize {
        let mut result = 0;
        while self.transmit_queue.len() < self.max_unacked {
            let payload = match self.pending_outbound.pop_front() {
                Some(payload) => payload,
                None => break,
            };
            let packet = Packet::data(self.next_tx_sequence, payload);
            self.next_tx_sequence = self.next_tx_sequence.next();
            self.transmit_queue.push_back(packet);
            result += 1;
        }
        result
    }

    pub fn num_pending_outbound(&self) -> usize {
        self.pending_outbound.len()
    }

    /// true if all outbound data was acknowledged by the peer
    pub fn is_outbound_drained(&self) -> bool {
        self.transmit_queue.is_empty() && self.pending_outbound.is_empty()
    }

    pub fn last_packet_transmitted(&self) -> Option<SequenceNumber> {
        if self.num_sent == 0 {
            return None;
        }
        self.transmit_queue.get(self.num_sent - 1)
            .map(|p| p.sequence())
    }

    pub fn transmit_queue(&self) -> &VecDeque<Packet> {
        &self.transmit_queue
    }

    /// Removes all packets up to and including `up_to` from the transmit queue, returning the
    ///  number of removed packets. Stale acks remove nothing. Pending payloads move up into the
    ///  space that is freed.
    pub fn acknowledge(&mut self, up_to: SequenceNumber) -> usize {
        let mut result = 0;
        while let Some(front) = self.transmit_queue.front() {
            if up_to.distance_from(front.sequence()) < 0 {
                break;
            }
            self.transmit_queue.pop_front();
            result += 1;
        }
        self.num_sent = self.num_sent.saturating_sub(result);
        if result > 0 {
            self.admit_pending();
        }
        result
    }

    /// prune everything the peer reports to have received when a session is (re-)established
    pub fn prune_to_receive_next(&mut self, receive_next: SequenceNumber) -> usize {
        self.acknowledge(receive_next.prev())
    }

    pub fn find_unacked(&self, sequence: SequenceNumber) -> Option<&Packet> {
        let front = self.transmit_queue.front()?;
        let offset = sequence.distance_from(front.sequence());
        if offset < 0 {
            return None;
        }
        self.transmit_queue.get(offset as usize)
            .filter(|p| p.sequence() == sequence)
    }

    /// Returns packets from the transmit queue that were never sent, marking them as sent
    pub fn take_unsent(&mut self) -> Vec<Packet> {
        let result = self.transmit_queue.iter()
            .skip(self.num_sent)
            .cloned()
            .collect();
        self.num_sent = self.transmit_queue.len();
        result
    }

    /// Returns the entire transmit queue for sending after a (re-)establishment. Packets that
    ///  were sent before are flagged as RESENT.
    pub fn take_all_for_resend(&mut self) -> Vec<Packet> {
        let result = self.transmit_queue.iter()
            .enumerate()
            .map(|(i, p)| if i < self.num_sent { p.with_flags(PacketFlags::RESENT) } else { p.clone() })
            .collect();
        self.num_sent = self.transmit_queue.len();
        result
    }

    pub fn last_comm_time(&self) -> Instant {
        self.last_comm_time
    }

    pub fn on_received(&mut self, now: Instant) {
        self.last_comm_time = now;
    }

    pub fn last_sent_time(&self) -> Instant {
        self.last_sent_time
    }

    pub fn on_sent(&mut self, now: Instant) {
        self.last_sent_time = now;
    }

    /// Records in-sequence deliveries and returns the number of deliveries not acknowledged yet
    pub fn on_delivered(&mut self, num_delivered: u32, now: Instant) -> u32 {
        if num_delivered > 0 && self.oldest_unacked_delivery.is_none() {
            self.oldest_unacked_delivery = Some(now);
        }
        self.delivered_since_ack += num_delivered;
        self.delivered_since_ack
    }

    pub fn oldest_unacked_delivery(&self) -> Option<Instant> {
        self.oldest_unacked_delivery
    }

    pub fn on_ack_sent(&mut self) {
        self.delivered_since_ack = 0;
        self.oldest_unacked_delivery = None;
    }
}
