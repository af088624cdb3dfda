use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use bytes::{Bytes, BytesMut};
#[cfg(test)] use mockall::automock;
use tracing::{debug, info, trace, warn};
use crate::buffers::buffer_pool::BufferPool;
use crate::config::NetConfig;
use crate::engine::monitor::{NoopMonitor, ProtocolMonitor};
use crate::event::{CloseReason, Event, TimerTag};
use crate::event::queue::EventSink;
use crate::packet::codec;
use crate::packet::codec::{Greeting, ResumeInfo, Welcome};
use crate::packet::packet::{Packet, PacketFlags, PacketKind};
use crate::packet::sequence::SequenceNumber;
use crate::reactor::pump::EventHandler;
use crate::reactor::selector::SelectorRegistry;
use crate::reactor::timer::{TimerKey, TimerScheduler};
use crate::session::auth::{AllowAll, Authenticator, SharedTokenAuthenticator};
use crate::session::error_code::SessionErrorCode;
use crate::session::reorder_buffer::ReceiveOutcome;
use crate::session::session::{Session, SessionKey, SessionStatus};
use crate::session::session_manager::{SessionIdSource, SessionKeySource, SessionManager};
use crate::transport::channel_transport::ChannelTransport;

/// Initiates outbound connections for client sessions
#[cfg_attr(test, automock)]
pub trait Connector: Send + Sync {
    /// Starts a non-blocking connect, returning a transport that is registered for connect
    ///  readiness. Completion is reported as [Event::Connected] or [Event::ConnectError].
    fn connect(&self, addr: SocketAddr) -> io::Result<Arc<ChannelTransport>>;
}

/// Connects TCP sockets that are registered with the I/O pump's selector
pub struct SelectorConnector {
    registry: Arc<SelectorRegistry>,
    pool: Arc<BufferPool>,
}

impl SelectorConnector {
    pub fn new(registry: Arc<SelectorRegistry>, pool: Arc<BufferPool>) -> SelectorConnector {
        SelectorConnector {
            registry,
            pool,
        }
    }
}

impl Connector for SelectorConnector {
    fn connect(&self, addr: SocketAddr) -> io::Result<Arc<ChannelTransport>> {
        let stream = mio::net::TcpStream::connect(addr)?;
        let transport = Arc::new(ChannelTransport::connecting(Box::new(stream), addr, self.pool.clone()));
        if let Err(e) = transport.register(&self.registry) {
            transport.close();
            return Err(e);
        }
        Ok(transport)
    }
}

/// Where the protocol engine sends its events
pub struct EngineSinks {
    /// the I/O pump, for closing transports
    pub io: Arc<dyn EventSink>,
    /// the engine's own queue, for work that is deferred to after the current event
    pub loopback: Arc<dyn EventSink>,
    /// session notifications for the application
    pub app: Arc<dyn EventSink>,
}

/// The parts of the engine that produce output. They are kept separate from the session
///  manager so that a session can be borrowed mutably while sending.
struct Output {
    pool: Arc<BufferPool>,
    sinks: EngineSinks,
    monitor: Box<dyn ProtocolMonitor>,
}

impl Output {
    fn send(&self, session: &mut Session, packet: &Packet, now: Instant) {
        let transport = match session.transport() {
            Some(transport) => transport.clone(),
            None => {
                trace!("session {} has no transport - not sending {:?}", session.key(), packet);
                return;
            }
        };

        let mut buf = self.pool.acquire(codec::encoded_len(packet));
        codec::encode(packet, &mut buf);
        trace!("session {}: sending {:?}", session.key(), packet);
        if let Err(e) = transport.enqueue_transmit(buf) {
            debug!("error enqueueing data on {:?}: {}", transport, e);
            self.sinks.io.post(Event::WriteError { transport, cause: Arc::new(e) });
            return;
        }

        session.on_sent(now);
        self.monitor.packet_sent(session.key(), packet);
    }

    fn send_control(&self, session: &mut Session, flags: PacketFlags, sequence: SequenceNumber, payload: Bytes, now: Instant) {
        self.send(session, &Packet::new(sequence, flags, payload), now);
    }

    fn send_ack(&self, session: &mut Session, now: Instant) {
        let up_to = session.reorder_buffer().last_delivered();
        self.send_control(session, PacketFlags::ACK, up_to, Bytes::new(), now);
        session.on_ack_sent();
    }

    fn close_transport(&self, transport: Arc<ChannelTransport>, reason: CloseReason) {
        self.sinks.io.post(Event::CloseChannelRequest { transport, reason });
    }

    fn notify(&self, event: Event) {
        self.sinks.app.post(event);
    }

    fn session_error(&self, session: &Session, code: SessionErrorCode, detail: String) {
        warn!("session {}: {} - {}", session.key(), code, detail);
        self.monitor.session_error(session.key(), code);
        self.notify(Event::SessionError {
            session: session.key(),
            session_id: session.session_id(),
            code,
            detail,
        });
    }
}

/// The protocol engine: turns raw input into packets, drives the session state machine and
///  turns outbound data into frames on the sessions' transports.
///
/// All session state is owned by this handler and touched only from the protocol pump.
pub struct PacketIoEventHandler {
    config: Arc<NetConfig>,
    sessions: SessionManager,
    out: Output,
    connector: Arc<dyn Connector>,
    timers: TimerScheduler,
    authenticator: Box<dyn Authenticator>,
    housekeeping: TimerKey,
}

impl PacketIoEventHandler {
    pub fn new(
        config: Arc<NetConfig>,
        key_source: SessionKeySource,
        pool: Arc<BufferPool>,
        sinks: EngineSinks,
        connector: Arc<dyn Connector>,
        timers: TimerScheduler,
    ) -> PacketIoEventHandler {
        let housekeeping = timers.schedule_periodic(config.housekeeping_interval, config.housekeeping_interval, TimerTag::Housekeeping);

        let authenticator: Box<dyn Authenticator> = match &config.required_auth_token {
            Some(token) => Box::new(SharedTokenAuthenticator::new(token.clone())),
            None => Box::new(AllowAll),
        };

        PacketIoEventHandler {
            sessions: SessionManager::new(key_source),
            out: Output {
                pool,
                sinks,
                monitor: Box::new(NoopMonitor),
            },
            connector,
            timers,
            authenticator,
            housekeeping,
            config,
        }
    }

    pub fn with_authenticator(mut self, authenticator: Box<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    pub fn with_monitor(mut self, monitor: Box<dyn ProtocolMonitor>) -> Self {
        self.out.monitor = monitor;
        self
    }

    pub fn with_session_ids(mut self, id_source: Box<dyn SessionIdSource>) -> Self {
        self.sessions.set_session_id_source(id_source);
        self
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn handle_at(&mut self, event: Event, now: Instant) {
        trace!("handling {}", event);
        match event {
            Event::Accepted { transport } => self.on_accepted(transport, now),
            Event::AcceptError { cause } => warn!("error accepting connection: {}", cause),
            Event::Connected { transport } => self.on_connected(transport, now),
            Event::ConnectError { transport, cause } => self.on_transport_failure(transport, Some(cause), now),
            Event::ChannelClosed { transport, cause } => self.on_transport_failure(transport, cause, now),
            Event::InputDataPresent { transport, data } => self.on_input(transport, data, now),
            Event::Time { tag: TimerTag::Housekeeping, .. } => self.on_housekeeping(now),
            Event::Time { tag: TimerTag::Reconnect(key), .. } => self.on_reconnect_timer(key, now),
            Event::StartConnection { session, addr } => self.on_start_connection(session, addr, now),
            Event::PacketWriteRequest { session, data } => self.on_write_request(session, data, now),
            Event::DisconnectRequest { session } => self.on_disconnect_request(session, now),
            Event::NackRequest { session, sequence } => self.on_nack_request(session, sequence, now),
            other => warn!("unexpected event in protocol engine: {}", other),
        }
    }

    fn on_start_connection(&mut self, key: SessionKey, addr: SocketAddr, now: Instant) {
        if let Err(e) = self.sessions.create_client_session(key, addr, &self.config, now) {
            warn!("not starting connection: {}", e);
            return;
        }
        self.connect(key, now);
    }

    fn connect(&mut self, key: SessionKey, now: Instant) {
        let session = match self.sessions.get_mut(key) {
            Some(session) => session,
            None => return,
        };
        if let Err(e) = session.start_connection(now) {
            warn!("{}", e);
            return;
        }

        let addr = match session.remote_addr() {
            Some(addr) => addr,
            None => return,
        };
        debug!("session {}: connecting to {} (attempt {})", key, addr, session.backoff().attempts() + 1);

        match self.connector.connect(addr) {
            Ok(transport) => {
                if let Some(stale) = session.attach_transport(transport) {
                    self.out.close_transport(stale, CloseReason::Replaced);
                }
            }
            Err(e) => {
                debug!("session {}: connecting to {} failed: {}", key, addr, e);
                session.set_status(SessionStatus::NotConnected, now);
                self.schedule_reconnect(key, now);
            }
        }
    }

    fn schedule_reconnect(&mut self, key: SessionKey, now: Instant) {
        let session = match self.sessions.get_mut(key) {
            Some(session) => session,
            None => return,
        };

        match session.backoff().next_delay() {
            Some(delay) => {
                debug!("session {}: reconnecting in {:?}", key, delay);
                session.reconnect_timer = Some(self.timers.schedule_once(delay, TimerTag::Reconnect(key)));
            }
            None => {
                let detail = format!("giving up after {} connect attempts", session.backoff().attempts());
                self.out.session_error(session, SessionErrorCode::ConnectFailed, detail);
                self.terminate(key, CloseReason::Timeout, now);
            }
        }
    }

    fn on_reconnect_timer(&mut self, key: SessionKey, now: Instant) {
        match self.sessions.get_mut(key) {
            Some(session) if session.is_client() && session.status() == SessionStatus::NotConnected => {
                session.reconnect_timer = None;
            }
            _ => {
                trace!("reconnect timer for session {} is obsolete", key);
                return;
            }
        }
        self.connect(key, now);
    }

    fn on_accepted(&mut self, transport: Arc<ChannelTransport>, now: Instant) {
        // provisional until the greeting shows whether this is a new or a resumed session
        let session = self.sessions.create_session(transport, &self.config, now);
        debug!("session {}: accepted connection, waiting for greeting", session.key());
    }

    fn on_connected(&mut self, transport: Arc<ChannelTransport>, now: Instant) {
        let session = match transport.attachment().and_then(|key| self.sessions.get_mut(key)) {
            Some(session) if session.is_current_transport(&transport) => session,
            _ => {
                debug!("{:?} connected, but its session is gone", transport);
                self.out.close_transport(transport, CloseReason::Disconnect);
                return;
            }
        };

        session.connection_established(now);
        self.out.notify(Event::SessionActive { session: session.key() });

        let greeting = Greeting {
            resume: session.session_id().map(|session_id| ResumeInfo {
                session_id,
                receive_next: session.receive_next(),
            }),
            auth_token: self.config.auth_token.as_ref().map(|t| Bytes::copy_from_slice(t)),
        };
        let mut payload = BytesMut::new();
        greeting.ser(&mut payload);
        self.out.send_control(session, PacketFlags::GREETING, SequenceNumber::ZERO, payload.freeze(), now);
    }

    fn on_transport_failure(&mut self, transport: Arc<ChannelTransport>, cause: Option<Arc<io::Error>>, now: Instant) {
        let session = match transport.attachment().and_then(|key| self.sessions.get_mut(key)) {
            Some(session) if session.is_current_transport(&transport) => session,
            _ => {
                trace!("{:?} failed, but is not used by a session", transport);
                return;
            }
        };
        let key = session.key();
        match &cause {
            Some(cause) => debug!("session {}: transport failed: {}", key, cause),
            None => debug!("session {}: transport closed", key),
        }

        let _ = session.detach_transport();
        let was = session.status();
        session.set_status(SessionStatus::NotConnected, now);

        match (was, session.is_client()) {
            (SessionStatus::Established, is_client) => {
                // keep the session and its registration for resumption
                self.out.notify(Event::SessionInactive { session: key, session_id: session.session_id(), permanent: false });
                if is_client {
                    self.schedule_reconnect(key, now);
                }
            }
            (SessionStatus::Disconnecting, _) => {
                self.terminate(key, CloseReason::Disconnect, now);
            }
            (SessionStatus::Connecting, true) => {
                self.schedule_reconnect(key, now);
            }
            (SessionStatus::Connected, true) => {
                self.out.notify(Event::SessionInactive { session: key, session_id: session.session_id(), permanent: false });
                self.schedule_reconnect(key, now);
            }
            (_, false) => {
                if session.session_id().is_none() {
                    debug!("discarding session {} that was never established", key);
                    self.sessions.remove_session(key);
                }
            }
            (SessionStatus::NotConnected, true) => {}
        }
    }

    fn on_input(&mut self, transport: Arc<ChannelTransport>, data: BytesMut, now: Instant) {
        if transport.attachment().is_none() || transport.is_closed() {
            trace!("discarding input for unattached {:?}", transport);
            transport.pool().release(data);
            return;
        }
        transport.received_data().append(data);

        loop {
            // a greeting may move the transport to a different session, so look it up per packet
            let key = match transport.attachment() {
                Some(key) if self.sessions.get(key).map(|s| s.is_current_transport(&transport)).unwrap_or(false) => key,
                _ => break,
            };

            let decoded = codec::try_decode(&mut transport.received_data(), self.config.max_payload_len);
            match decoded {
                Ok(Some(packet)) => {
                    if let Some(session) = self.sessions.get_mut(key) {
                        session.on_received(now);
                        self.out.monitor.packet_received(key, &packet);
                    }
                    self.on_packet(key, &transport, packet, now);
                }
                Ok(None) => break,
                Err(e) => {
                    self.protocol_error(key, SessionErrorCode::BadMessageCode, format!("undecodable frame: {}", e), now);
                    break;
                }
            }
        }
    }

    fn on_packet(&mut self, key: SessionKey, transport: &Arc<ChannelTransport>, packet: Packet, now: Instant) {
        trace!("session {}: received {:?}", key, packet);
        match packet.kind() {
            Some(PacketKind::Greeting) => self.on_greeting(key, transport, packet, now),
            Some(PacketKind::Welcome) => self.on_welcome(key, packet, now),
            Some(PacketKind::Data) => self.on_data(key, packet, now),
            Some(PacketKind::Ack) => self.on_ack(key, packet, now),
            Some(PacketKind::Nack) => self.on_nack(key, packet, now),
            Some(PacketKind::Disconnect) => self.on_peer_disconnect(key, packet, now),
            Some(PacketKind::KeepAlive) => {}
            None => self.protocol_error(key, SessionErrorCode::BadMessageCode, format!("invalid flags {:?}", packet.flags()), now),
        }
    }

    fn on_greeting(&mut self, key: SessionKey, transport: &Arc<ChannelTransport>, packet: Packet, now: Instant) {
        match self.sessions.get(key) {
            Some(session) if !session.is_client() && session.status() == SessionStatus::Connected => {}
            _ => {
                self.protocol_error(key, SessionErrorCode::BadMessageCode, "unexpected greeting".to_string(), now);
                return;
            }
        }

        let greeting = match Greeting::deser(&mut packet.into_payload()) {
            Ok(greeting) => greeting,
            Err(code) => {
                self.reject(key, code, "invalid greeting".to_string(), now);
                return;
            }
        };

        if !self.authenticator.authenticate(transport.peer_addr(), greeting.auth_token.as_deref()) {
            self.reject(key, SessionErrorCode::BadAuth, "authentication failed".to_string(), now);
            return;
        }

        match greeting.resume {
            None => {
                let session_id = self.sessions.issue_session_id();
                self.sessions.register_session(session_id, key);
                let session = match self.sessions.get_mut(key) {
                    Some(session) => session,
                    None => return,
                };
                session.set_established(session_id, now);
                info!("session {}: established as {} with {:?}", key, session_id, session.remote_addr());

                let mut payload = BytesMut::new();
                Welcome::accepted(session_id, session.receive_next()).ser(&mut payload);
                self.out.send_control(session, PacketFlags::WELCOME, SequenceNumber::ZERO, payload.freeze(), now);

                self.out.notify(Event::SessionActive { session: key });
                self.out.notify(Event::SessionEstablished { session: key, session_id, resumed: false });
            }
            Some(resume) => {
                let existing_key = match self.sessions.lookup_session(resume.session_id) {
                    Some(existing_key) if self.sessions.get(existing_key).map(|s| !s.is_client()).unwrap_or(false) => existing_key,
                    _ => {
                        self.reject(key, SessionErrorCode::BadSession, format!("no session {} to resume", resume.session_id), now);
                        return;
                    }
                };

                // the provisional session is replaced by the one being resumed
                if let Some(mut provisional) = self.sessions.remove_session(key) {
                    let _ = provisional.detach_transport();
                }

                let session = match self.sessions.get_mut(existing_key) {
                    Some(session) => session,
                    None => return,
                };
                if let Some(stale) = session.attach_transport(transport.clone()) {
                    debug!("session {}: replacing stale {:?}", existing_key, stale);
                    self.out.close_transport(stale, CloseReason::Replaced);
                }
                session.connection_established(now);
                session.set_established(resume.session_id, now);
                let pruned = session.prune_to_receive_next(resume.receive_next);
                info!("session {}: resumed as {} (connection #{}), {} packets confirmed by the peer", existing_key, resume.session_id, session.connections(), pruned);

                let mut payload = BytesMut::new();
                Welcome::accepted(resume.session_id, session.receive_next()).ser(&mut payload);
                self.out.send_control(session, PacketFlags::WELCOME, SequenceNumber::ZERO, payload.freeze(), now);
                for packet in session.take_all_for_resend() {
                    self.out.send(session, &packet, now);
                }

                self.out.notify(Event::SessionActive { session: existing_key });
                self.out.notify(Event::SessionEstablished { session: existing_key, session_id: resume.session_id, resumed: true });
            }
        }
    }

    /// rejects a greeting: the client is told why in the WELCOME, and the connection is closed
    fn reject(&mut self, key: SessionKey, code: SessionErrorCode, detail: String, now: Instant) {
        let session = match self.sessions.get_mut(key) {
            Some(session) => session,
            None => return,
        };

        let mut payload = BytesMut::new();
        Welcome::rejected(code).ser(&mut payload);
        self.out.send_control(session, PacketFlags::WELCOME, SequenceNumber::ZERO, payload.freeze(), now);
        self.out.session_error(session, code, detail);
        self.terminate(key, CloseReason::ProtocolError, now);
    }

    fn on_welcome(&mut self, key: SessionKey, packet: Packet, now: Instant) {
        match self.sessions.get(key) {
            Some(session) if session.is_client() && session.status() == SessionStatus::Connected => {}
            _ => {
                self.protocol_error(key, SessionErrorCode::BadMessageCode, "unexpected welcome".to_string(), now);
                return;
            }
        }

        let welcome = match Welcome::deser(&mut packet.into_payload()) {
            Ok(welcome) => welcome,
            Err(code) => {
                self.protocol_error(key, code, "invalid welcome".to_string(), now);
                return;
            }
        };

        let session = match self.sessions.get_mut(key) {
            Some(session) => session,
            None => return,
        };

        if let Some(code) = welcome.rejection {
            self.out.session_error(session, code, "greeting was rejected by the server".to_string());
            self.terminate(key, CloseReason::ProtocolError, now);
            return;
        }

        let resumed = match session.session_id() {
            Some(previous) if previous != welcome.session_id => {
                let detail = format!("resumed session {} as {}", previous, welcome.session_id);
                self.protocol_error(key, SessionErrorCode::BadSession, detail, now);
                return;
            }
            Some(_) => true,
            None => false,
        };

        session.set_established(welcome.session_id, now);
        let pruned = session.prune_to_receive_next(welcome.receive_next);
        info!("session {}: established as {} (resumed: {}, {} packets confirmed by the peer)", key, welcome.session_id, resumed, pruned);

        for packet in session.take_all_for_resend() {
            self.out.send(session, &packet, now);
        }
        self.sessions.register_session(welcome.session_id, key);
        self.out.notify(Event::SessionEstablished { session: key, session_id: welcome.session_id, resumed });

        self.try_complete_disconnect(key, now);
    }

    fn on_data(&mut self, key: SessionKey, packet: Packet, now: Instant) {
        let session = match self.sessions.get_mut(key) {
            Some(session) if session.is_established() => session,
            _ => {
                self.protocol_error(key, SessionErrorCode::BadMessageCode, "data packet before establishment".to_string(), now);
                return;
            }
        };
        let session_id = match session.session_id() {
            Some(session_id) => session_id,
            None => return,
        };

        let sequence = packet.sequence();
        match session.reorder_buffer().on_packet(packet) {
            ReceiveOutcome::Duplicate => {
                trace!("session {}: dropping duplicate {}", key, sequence);
            }
            ReceiveOutcome::WindowExceeded => {
                let detail = format!("{} is beyond the receive window starting at {}", sequence, session.receive_next());
                self.protocol_error(key, SessionErrorCode::MissingSequence, detail, now);
            }
            ReceiveOutcome::Accepted { delivered, newly_missing } => {
                for missing in newly_missing {
                    debug!("session {}: missing {}", key, missing);
                    self.out.sinks.loopback.post(Event::NackRequest { session: key, sequence: missing });
                }

                let num_delivered = delivered.len() as u32;
                for packet in delivered {
                    self.out.notify(Event::DataPacketReady { session: key, session_id, packet });
                }

                let unacked = session.on_delivered(num_delivered, now);
                if let Some(every_packets) = self.config.ack_policy.every_packets {
                    if unacked >= every_packets {
                        self.out.send_ack(session, now);
                    }
                }
            }
        }
    }

    fn on_nack_request(&mut self, key: SessionKey, sequence: SequenceNumber, now: Instant) {
        let session = match self.sessions.get_mut(key) {
            Some(session) if session.is_established() => session,
            _ => return,
        };

        if session.reorder_buffer().record_nack(sequence, now) {
            debug!("session {}: requesting retransmission of {}", key, sequence);
            self.out.send_control(session, PacketFlags::NACK, sequence, Bytes::new(), now);
        }
        else {
            trace!("session {}: {} arrived in the meantime", key, sequence);
        }
    }

    fn on_ack(&mut self, key: SessionKey, packet: Packet, now: Instant) {
        let session = match self.sessions.get_mut(key) {
            Some(session) if session.is_established() => session,
            _ => {
                self.protocol_error(key, SessionErrorCode::BadMessageCode, "ack before establishment".to_string(), now);
                return;
            }
        };

        let removed = session.acknowledge(packet.sequence());
        trace!("session {}: ack up to {} confirmed {} packets", key, packet.sequence(), removed);
        // acks make room for payloads that were held back
        for packet in session.take_unsent() {
            self.out.send(session, &packet, now);
        }
        self.try_complete_disconnect(key, now);
    }

    fn on_nack(&mut self, key: SessionKey, packet: Packet, now: Instant) {
        let session = match self.sessions.get_mut(key) {
            Some(session) if session.is_established() => session,
            _ => {
                self.protocol_error(key, SessionErrorCode::BadMessageCode, "nack before establishment".to_string(), now);
                return;
            }
        };

        let sequence = packet.sequence();
        match session.find_unacked(sequence).map(|p| p.with_flags(PacketFlags::RESENT)) {
            Some(resent) => {
                debug!("session {}: retransmitting {}", key, sequence);
                self.out.send(session, &resent, now);
                self.out.monitor.packet_retransmitted(key, sequence);
            }
            None => {
                self.protocol_error(key, SessionErrorCode::BadNack, format!("nack for {} which is not in the transmit queue", sequence), now);
            }
        }
    }

    fn on_peer_disconnect(&mut self, key: SessionKey, packet: Packet, now: Instant) {
        let session = match self.sessions.get_mut(key) {
            Some(session) => session,
            None => return,
        };

        let reason = codec::deser_disconnect_reason(&mut packet.into_payload())
            .unwrap_or(Some(SessionErrorCode::BadMessageCode));
        match reason {
            Some(code) => self.out.session_error(session, code, "disconnected by peer".to_string()),
            None => info!("session {}: disconnected by peer", key),
        }
        self.terminate(key, CloseReason::EndOfStream, now);
    }

    fn on_write_request(&mut self, key: SessionKey, data: Bytes, now: Instant) {
        let session = match self.sessions.get_mut(key) {
            Some(session) => session,
            None => {
                self.out.notify(Event::SessionError {
                    session: key,
                    session_id: None,
                    code: SessionErrorCode::BadSession,
                    detail: "write request for unknown session".to_string(),
                });
                return;
            }
        };

        if session.is_pending_disconnect() || session.status() == SessionStatus::Disconnecting {
            warn!("session {} is disconnecting - dropping {} bytes", key, data.len());
            return;
        }
        if data.len() > self.config.max_payload_len as usize {
            warn!("session {}: dropping packet of {} bytes which exceeds the maximum payload length of {}", key, data.len(), self.config.max_payload_len);
            return;
        }

        if !session.enqueue_outbound(data) {
            debug!("session {}: {} packets are waiting for an ack, holding back {} payloads", key, session.transmit_queue().len(), session.num_pending_outbound());
        }
        if session.is_established() {
            for packet in session.take_unsent() {
                self.out.send(session, &packet, now);
            }
        }
    }

    fn on_disconnect_request(&mut self, key: SessionKey, now: Instant) {
        let session = match self.sessions.get_mut(key) {
            Some(session) => session,
            None => {
                self.out.notify(Event::SessionError {
                    session: key,
                    session_id: None,
                    code: SessionErrorCode::BadSession,
                    detail: "disconnect request for unknown session".to_string(),
                });
                return;
            }
        };

        if session.is_established() {
            debug!("session {}: disconnecting after {} queued packets", key, session.transmit_queue().len() + session.num_pending_outbound());
            session.set_pending_disconnect();
            self.try_complete_disconnect(key, now);
        }
        else {
            // nothing was sent that the peer could confirm
            debug!("session {}: disconnecting in status {:?}", key, session.status());
            self.terminate(key, CloseReason::Disconnect, now);
        }
    }

    /// a session with a pending disconnect sends DISCONNECT once all its packets are acknowledged
    fn try_complete_disconnect(&mut self, key: SessionKey, now: Instant) {
        let session = match self.sessions.get_mut(key) {
            Some(session) => session,
            None => return,
        };
        if !session.is_pending_disconnect() || !session.is_established() || !session.is_outbound_drained() {
            return;
        }

        session.set_status(SessionStatus::Disconnecting, now);
        self.out.send_control(session, PacketFlags::DISCONNECT, SequenceNumber::ZERO, codec::ser_disconnect_reason(None), now);
        info!("session {}: disconnected", key);
        self.terminate(key, CloseReason::Disconnect, now);
    }

    /// Fatal error: the peer is told why, and the session is terminated
    fn protocol_error(&mut self, key: SessionKey, code: SessionErrorCode, detail: String, now: Instant) {
        let session = match self.sessions.get_mut(key) {
            Some(session) => session,
            None => return,
        };

        self.out.session_error(session, code, detail);
        self.out.send_control(session, PacketFlags::DISCONNECT, SequenceNumber::ZERO, codec::ser_disconnect_reason(Some(code)), now);
        self.terminate(key, CloseReason::ProtocolError, now);
    }

    /// Removes a session permanently, closing its transport. Sessions the application knows
    ///  about (client sessions, and server sessions that were established) are reported as
    ///  permanently inactive.
    fn terminate(&mut self, key: SessionKey, close_reason: CloseReason, now: Instant) {
        let mut session = match self.sessions.remove_session(key) {
            Some(session) => session,
            None => return,
        };

        if let Some(timer) = session.reconnect_timer.take() {
            timer.cancel();
        }
        if let Some(transport) = session.detach_transport() {
            self.out.close_transport(transport, close_reason);
        }
        session.set_status(SessionStatus::NotConnected, now);

        if session.is_client() || session.session_id().is_some() {
            self.out.notify(Event::SessionInactive { session: key, session_id: session.session_id(), permanent: true });
        }
    }

    fn on_housekeeping(&mut self, now: Instant) {
        for key in self.sessions.keys() {
            let (status, since, is_client) = match self.sessions.get(key) {
                Some(session) => (session.status(), session.status_since(), session.is_client()),
                None => continue,
            };

            match status {
                SessionStatus::Established => self.housekeeping_established(key, now),
                SessionStatus::Connecting if elapsed(now, since) >= self.config.connect_timeout => {
                    if let Some(session) = self.sessions.get_mut(key) {
                        debug!("session {}: connect timed out", key);
                        if let Some(transport) = session.detach_transport() {
                            self.out.close_transport(transport, CloseReason::Timeout);
                        }
                        session.set_status(SessionStatus::NotConnected, now);
                    }
                    self.schedule_reconnect(key, now);
                }
                SessionStatus::Connected if elapsed(now, since) >= self.config.greeting_timeout => {
                    if is_client {
                        self.protocol_error(key, SessionErrorCode::SessionTimeout, "no welcome from server".to_string(), now);
                    }
                    else {
                        debug!("session {}: no greeting from client - discarding", key);
                        self.terminate(key, CloseReason::Timeout, now);
                    }
                }
                SessionStatus::NotConnected if !is_client && elapsed(now, since) >= self.config.session_timeout => {
                    if let Some(session) = self.sessions.get(key) {
                        self.out.session_error(session, SessionErrorCode::SessionTimeout, "session was not resumed".to_string());
                    }
                    self.terminate(key, CloseReason::Timeout, now);
                }
                _ => {}
            }
        }
    }

    fn housekeeping_established(&mut self, key: SessionKey, now: Instant) {
        let session = match self.sessions.get_mut(key) {
            Some(session) => session,
            None => return,
        };

        // a large frame may still be arriving
        let last_rx = session.transport()
            .map(|t| t.last_rx().max(session.last_comm_time()))
            .unwrap_or(session.last_comm_time());
        let idle = elapsed(now, last_rx);
        if idle >= self.config.session_timeout {
            self.protocol_error(key, SessionErrorCode::SessionTimeout, format!("no traffic for {:?}", idle), now);
            return;
        }

        if let (Some(interval), Some(oldest)) = (self.config.ack_policy.interval, session.oldest_unacked_delivery()) {
            if elapsed(now, oldest) >= interval {
                self.out.send_ack(session, now);
            }
        }

        match session.reorder_buffer().overdue_nacks(now, self.config.nack_retry_interval, self.config.max_nack_retries) {
            Ok(overdue) => {
                for sequence in overdue {
                    debug!("session {}: repeating nack for {}", key, sequence);
                    session.reorder_buffer().record_nack(sequence, now);
                    self.out.send_control(session, PacketFlags::NACK, sequence, Bytes::new(), now);
                }
            }
            Err(sequence) => {
                let missing = session.reorder_buffer().missing();
                let detail = format!("{} is still missing after {} nacks ({} gaps in total)", sequence, self.config.max_nack_retries, missing.len());
                self.protocol_error(key, SessionErrorCode::MissingSequence, detail, now);
                return;
            }
        }

        if elapsed(now, session.last_sent_time()) >= self.config.keepalive_interval {
            trace!("session {}: sending keep-alive", key);
            self.out.send_control(session, PacketFlags::KEEPALIVE, SequenceNumber::ZERO, Bytes::new(), now);
        }
    }
}

fn elapsed(now: Instant, since: Instant) -> Duration {
    now.saturating_duration_since(since)
}

impl EventHandler for PacketIoEventHandler {
    fn handle(&mut self, event: Event) {
        self.handle_at(event, Instant::now());
    }
}

impl Drop for PacketIoEventHandler {
    fn drop(&mut self) {
        self.housekeeping.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::io::ErrorKind;
    use rstest::rstest;
    use super::*;
    use crate::buffers::received_data::ReceivedData;
    use crate::config::AckPolicy;
    use crate::engine::monitor::MockProtocolMonitor;
    use crate::event::EventKind;
    use crate::event::queue::EventQueue;
    use crate::reactor::timer::TimerEventSource;
    use crate::session::session::SessionId;
    use crate::session::session_manager::FixedSessionIds;
    use crate::test_util::memory_channel::MemoryChannel;
    use crate::test_util::memory_connector::MemoryConnector;

    const CLIENT: SessionKey = SessionKey::from_raw(1);
    const SERVER: SessionKey = SessionKey::from_raw(1);
    const SESSION_ID: SessionId = SessionId::from_raw(42);

    fn server_addr() -> SocketAddr {
        "10.0.0.1:9000".parse().unwrap()
    }

    fn config() -> NetConfig {
        NetConfig {
            ack_policy: AckPolicy {
                every_packets: Some(3),
                interval: Some(Duration::from_millis(200)),
            },
            ..Default::default()
        }
    }

    struct Peer {
        engine: PacketIoEventHandler,
        pool: Arc<BufferPool>,
        app: Arc<EventQueue>,
        loopback: Arc<EventQueue>,
        io: Arc<EventQueue>,
        timers: TimerEventSource,
        connector: Arc<MemoryConnector>,
    }

    impl Peer {
        fn new(config: NetConfig) -> Peer {
            Self::build(config, None, Box::new(NoopMonitor))
        }

        fn build(config: NetConfig, connector: Option<Arc<dyn Connector>>, monitor: Box<dyn ProtocolMonitor>) -> Peer {
            let pool = Arc::new(BufferPool::new(256, 16));
            let app = Arc::new(EventQueue::new(None));
            let loopback = Arc::new(EventQueue::new(None));
            let io = Arc::new(EventQueue::new(None));
            let timers = TimerEventSource::new();
            let memory_connector = Arc::new(MemoryConnector::new(pool.clone()));

            let sinks = EngineSinks {
                io: io.clone(),
                loopback: loopback.clone(),
                app: app.clone(),
            };
            let engine = PacketIoEventHandler::new(
                Arc::new(config),
                SessionKeySource::default(),
                pool.clone(),
                sinks,
                connector.unwrap_or_else(|| memory_connector.clone() as Arc<dyn Connector>),
                timers.scheduler(),
            )
                .with_session_ids(Box::new(FixedSessionIds(vec![SESSION_ID.to_raw()])))
                .with_monitor(monitor);

            Peer {
                engine,
                pool,
                app,
                loopback,
                io,
                timers,
                connector: memory_connector,
            }
        }

        fn handle(&mut self, event: Event, now: Instant) {
            self.engine.handle_at(event, now);
        }

        /// returns true if there were any events to handle
        fn run_loopback(&mut self, now: Instant) -> bool {
            let events = self.loopback.drain();
            let result = !events.is_empty();
            for event in events {
                self.handle(event, now);
            }
            result
        }

        fn write(&mut self, session: SessionKey, data: &'static [u8], now: Instant) {
            self.handle(Event::PacketWriteRequest { session, data: Bytes::from_static(data) }, now);
        }

        fn session(&self, key: SessionKey) -> &Session {
            self.engine.sessions().get(key).unwrap()
        }
    }

    fn take_frames(transport: &ChannelTransport) -> BytesMut {
        let mut result = BytesMut::new();
        for buf in transport.transmit_queue().drain() {
            result.extend_from_slice(&buf);
        }
        result
    }

    fn decode_all(pool: &Arc<BufferPool>, data: BytesMut) -> Vec<Packet> {
        let mut received = ReceivedData::new(pool.clone());
        received.append(data);
        let mut result = Vec::new();
        while let Some(packet) = codec::try_decode(&mut received, u32::MAX).unwrap() {
            result.push(packet);
        }
        assert!(received.is_empty());
        result
    }

    fn encode_all(packets: &[Packet]) -> BytesMut {
        let mut result = BytesMut::new();
        for packet in packets {
            codec::encode(packet, &mut result);
        }
        result
    }

    fn kinds(events: &[Event]) -> Vec<EventKind> {
        events.iter().map(|e| e.kind()).collect()
    }

    fn delivered(events: &[Event]) -> Vec<Bytes> {
        events.iter()
            .filter_map(|e| match e {
                Event::DataPacketReady { packet, .. } => Some(packet.payload().clone()),
                _ => None,
            })
            .collect()
    }

    fn error_codes(events: &[Event]) -> Vec<SessionErrorCode> {
        events.iter()
            .filter_map(|e| match e {
                Event::SessionError { code, .. } => Some(*code),
                _ => None,
            })
            .collect()
    }

    fn close_reasons(peer: &Peer) -> Vec<CloseReason> {
        peer.io.drain().iter()
            .filter_map(|e| match e {
                Event::CloseChannelRequest { reason, .. } => Some(*reason),
                _ => None,
            })
            .collect()
    }

    fn bytes(data: &'static [u8]) -> Bytes {
        Bytes::from_static(data)
    }

    struct Link {
        client: Arc<ChannelTransport>,
        server: Arc<ChannelTransport>,
    }

    impl Link {
        fn client_to_server(&self, server: &mut Peer, now: Instant) -> bool {
            let data = take_frames(&self.client);
            if data.is_empty() {
                return false;
            }
            server.handle(Event::InputDataPresent { transport: self.server.clone(), data }, now);
            true
        }

        fn server_to_client(&self, client: &mut Peer, now: Instant) -> bool {
            let data = take_frames(&self.server);
            if data.is_empty() {
                return false;
            }
            client.handle(Event::InputDataPresent { transport: self.client.clone(), data }, now);
            true
        }

        /// moves frames and loopback events until everything settled
        fn exchange(&self, client: &mut Peer, server: &mut Peer, now: Instant) {
            loop {
                let mut moved = client.run_loopback(now);
                moved |= server.run_loopback(now);
                moved |= self.client_to_server(server, now);
                moved |= self.server_to_client(client, now);
                if !moved {
                    break;
                }
            }
        }
    }

    /// a client transport connected to a freshly accepted server transport, with the client's
    ///  greeting waiting in the transmit queue
    fn connect(client: &mut Peer, server: &mut Peer, now: Instant) -> Link {
        client.handle(Event::StartConnection { session: CLIENT, addr: server_addr() }, now);
        let (client_transport, _) = client.connector.last().unwrap();
        client.handle(Event::Connected { transport: client_transport.clone() }, now);

        let server_transport = Arc::new(ChannelTransport::new(Box::new(MemoryChannel::new()), server.pool.clone()));
        server.handle(Event::Accepted { transport: server_transport.clone() }, now);

        Link {
            client: client_transport,
            server: server_transport,
        }
    }

    fn established(client: &mut Peer, server: &mut Peer, now: Instant) -> Link {
        let link = connect(client, server, now);
        link.exchange(client, server, now);

        assert_eq!(kinds(&client.app.drain()), vec![EventKind::SessionActive, EventKind::SessionEstablished]);
        assert_eq!(kinds(&server.app.drain()), vec![EventKind::SessionActive, EventKind::SessionEstablished]);
        assert_eq!(client.session(CLIENT).session_id(), Some(SESSION_ID));
        assert_eq!(server.session(SERVER).session_id(), Some(SESSION_ID));
        link
    }

    #[test]
    fn test_establish() {
        let now = Instant::now();
        let mut client = Peer::new(config());
        let mut server = Peer::new(config());

        let link = connect(&mut client, &mut server, now);
        assert_eq!(client.session(CLIENT).status(), SessionStatus::Connected);
        assert_eq!(server.session(SERVER).status(), SessionStatus::Connected);

        let greeting = decode_all(&client.pool, take_frames(&link.client));
        assert_eq!(greeting.len(), 1);
        assert_eq!(greeting[0].kind(), Some(PacketKind::Greeting));
        assert_eq!(Greeting::deser(&mut greeting[0].payload().clone()), Ok(Greeting { resume: None, auth_token: None }));

        server.handle(Event::InputDataPresent { transport: link.server.clone(), data: encode_all(&greeting) }, now);
        match server.app.drain().as_slice() {
            [Event::SessionActive { session: s1 }, Event::SessionEstablished { session: s2, session_id, resumed: false }] => {
                assert_eq!(*s1, SERVER);
                assert_eq!(*s2, SERVER);
                assert_eq!(*session_id, SESSION_ID);
            }
            other => panic!("unexpected events {:?}", other),
        }
        assert_eq!(server.engine.sessions().lookup_session(SESSION_ID), Some(SERVER));

        link.server_to_client(&mut client, now);
        match client.app.drain().as_slice() {
            [Event::SessionActive { .. }, Event::SessionEstablished { session, session_id, resumed: false }] => {
                assert_eq!(*session, CLIENT);
                assert_eq!(*session_id, SESSION_ID);
            }
            other => panic!("unexpected events {:?}", other),
        }
        assert!(client.session(CLIENT).is_established());
    }

    #[test]
    fn test_data_in_order_and_acked() {
        let now = Instant::now();
        let mut client = Peer::new(config());
        let mut server = Peer::new(config());
        let link = established(&mut client, &mut server, now);

        client.write(CLIENT, b"a", now);
        client.write(CLIENT, b"b", now);
        client.write(CLIENT, b"c", now);
        assert_eq!(client.session(CLIENT).transmit_queue().len(), 3);

        link.exchange(&mut client, &mut server, now);

        let events = server.app.drain();
        assert_eq!(delivered(&events), vec![bytes(b"a"), bytes(b"b"), bytes(b"c")]);
        for e in &events {
            if let Event::DataPacketReady { session, session_id, .. } = e {
                assert_eq!(*session, SERVER);
                assert_eq!(*session_id, SESSION_ID);
            }
        }

        // the third delivery triggered an ack
        assert!(client.session(CLIENT).transmit_queue().is_empty());
        assert!(server.session(SERVER).oldest_unacked_delivery().is_none());
    }

    #[test]
    fn test_lost_packet_is_nacked_and_retransmitted() {
        let now = Instant::now();

        let mut monitor = MockProtocolMonitor::new();
        monitor.expect_packet_sent().return_const(());
        monitor.expect_packet_received().return_const(());
        monitor.expect_session_error().never();
        monitor.expect_packet_retransmitted()
            .withf(|session, sequence| *session == CLIENT && *sequence == SequenceNumber::from_raw(1))
            .times(1)
            .return_const(());

        let mut client = Peer::build(config(), None, Box::new(monitor));
        let mut server = Peer::new(config());
        let link = established(&mut client, &mut server, now);

        client.write(CLIENT, b"a", now);
        client.write(CLIENT, b"b", now);
        client.write(CLIENT, b"c", now);

        let survivors = decode_all(&client.pool, take_frames(&link.client)).into_iter()
            .filter(|p| p.sequence() != SequenceNumber::from_raw(1))
            .collect::<Vec<_>>();
        server.handle(Event::InputDataPresent { transport: link.server.clone(), data: encode_all(&survivors) }, now);

        assert_eq!(delivered(&server.app.drain()), vec![bytes(b"a")]);
        match server.loopback.drain().as_slice() {
            [Event::NackRequest { session, sequence }] => {
                assert_eq!(*session, SERVER);
                assert_eq!(*sequence, SequenceNumber::from_raw(1));
                server.handle(Event::NackRequest { session: *session, sequence: *sequence }, now);
            }
            other => panic!("unexpected events {:?}", other),
        }

        let nack = decode_all(&server.pool, take_frames(&link.server));
        assert_eq!(nack.len(), 1);
        assert_eq!(nack[0].kind(), Some(PacketKind::Nack));
        assert_eq!(nack[0].sequence(), SequenceNumber::from_raw(1));
        client.handle(Event::InputDataPresent { transport: link.client.clone(), data: encode_all(&nack) }, now);

        let resent = decode_all(&client.pool, take_frames(&link.client));
        assert_eq!(resent.len(), 1);
        assert!(resent[0].is_resent());
        assert_eq!(resent[0].payload(), &bytes(b"b"));

        // retransmitting leaves the transmit queue as it was
        let queued = client.session(CLIENT).transmit_queue().iter()
            .map(|p| (p.sequence().to_raw(), p.payload().clone()))
            .collect::<Vec<_>>();
        assert_eq!(queued, vec![(0, bytes(b"a")), (1, bytes(b"b")), (2, bytes(b"c"))]);

        server.handle(Event::InputDataPresent { transport: link.server.clone(), data: encode_all(&resent) }, now);
        assert_eq!(delivered(&server.app.drain()), vec![bytes(b"b"), bytes(b"c")]);

        link.exchange(&mut client, &mut server, now);
        assert!(client.session(CLIENT).transmit_queue().is_empty());
    }

    fn nacked(pool: &Arc<BufferPool>, transport: &ChannelTransport) -> Vec<SequenceNumber> {
        decode_all(pool, take_frames(transport)).iter()
            .filter(|p| p.kind() == Some(PacketKind::Nack))
            .map(|p| p.sequence())
            .collect()
    }

    #[test]
    fn test_missing_packet_is_nacked_repeatedly_then_fails() {
        let now = Instant::now();
        let mut client = Peer::new(config());
        let mut server = Peer::new(config());
        let link = established(&mut client, &mut server, now);

        client.write(CLIENT, b"a", now);
        client.write(CLIENT, b"b", now);
        client.write(CLIENT, b"c", now);
        let survivors = decode_all(&client.pool, take_frames(&link.client)).into_iter()
            .filter(|p| p.sequence() != SequenceNumber::from_raw(1))
            .collect::<Vec<_>>();
        server.handle(Event::InputDataPresent { transport: link.server.clone(), data: encode_all(&survivors) }, now);
        assert_eq!(delivered(&server.app.drain()), vec![bytes(b"a")]);

        assert!(server.run_loopback(now));
        assert_eq!(nacked(&server.pool, &link.server), vec![SequenceNumber::from_raw(1)]);

        // retry interval is 500ms, and a packet is given up on after 5 nacks
        for i in 1..=4 {
            server.handle(Event::Time { key: 0, tag: TimerTag::Housekeeping }, now + Duration::from_millis(600 * i));
            assert_eq!(nacked(&server.pool, &link.server), vec![SequenceNumber::from_raw(1)]);
            assert!(server.app.is_empty());
        }

        server.handle(Event::Time { key: 0, tag: TimerTag::Housekeeping }, now + Duration::from_millis(3000));
        let events = server.app.drain();
        assert_eq!(error_codes(&events), vec![SessionErrorCode::MissingSequence]);
        assert_eq!(events.last().map(|e| e.kind()), Some(EventKind::SessionInactive));
        assert!(server.engine.sessions().is_empty());

        let frames = decode_all(&server.pool, take_frames(&link.server));
        assert_eq!(frames.iter().map(|p| p.kind()).collect::<Vec<_>>(), vec![Some(PacketKind::Disconnect)]);
        assert_eq!(codec::deser_disconnect_reason(&mut frames[0].payload().clone()), Ok(Some(SessionErrorCode::MissingSequence)));
    }

    #[test]
    fn test_nack_for_unknown_packet_is_fatal() {
        let now = Instant::now();
        let mut client = Peer::new(config());
        let mut server = Peer::new(config());
        let link = established(&mut client, &mut server, now);
        let _ = close_reasons(&client);

        let nack = Packet::control(PacketFlags::NACK, SequenceNumber::from_raw(7));
        client.handle(Event::InputDataPresent { transport: link.client.clone(), data: encode_all(&[nack]) }, now);

        let events = client.app.drain();
        assert_eq!(error_codes(&events), vec![SessionErrorCode::BadNack]);
        match events.last() {
            Some(Event::SessionInactive { session, session_id, permanent: true }) => {
                assert_eq!(*session, CLIENT);
                assert_eq!(*session_id, Some(SESSION_ID));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(client.engine.sessions().is_empty());
        assert_eq!(close_reasons(&client), vec![CloseReason::ProtocolError]);

        let disconnect = decode_all(&client.pool, take_frames(&link.client));
        assert_eq!(disconnect.len(), 1);
        assert_eq!(disconnect[0].kind(), Some(PacketKind::Disconnect));
        assert_eq!(codec::deser_disconnect_reason(&mut disconnect[0].payload().clone()), Ok(Some(SessionErrorCode::BadNack)));

        // the server reports the peer's reason and terminates as well
        server.handle(Event::InputDataPresent { transport: link.server.clone(), data: encode_all(&disconnect) }, now);
        let events = server.app.drain();
        assert_eq!(error_codes(&events), vec![SessionErrorCode::BadNack]);
        assert_eq!(events.last().map(|e| e.kind()), Some(EventKind::SessionInactive));
        assert!(server.engine.sessions().is_empty());
    }

    #[test]
    fn test_resume_after_transport_failure() {
        let now = Instant::now();
        let mut client = Peer::new(config());
        let mut server = Peer::new(config());
        let link = established(&mut client, &mut server, now);

        client.write(CLIENT, b"a", now);
        client.write(CLIENT, b"b", now);
        link.client_to_server(&mut server, now);
        assert_eq!(delivered(&server.app.drain()), vec![bytes(b"a"), bytes(b"b")]);

        // "c" is sent, but lost with the connection
        client.write(CLIENT, b"c", now);
        link.client.close();
        link.server.close();

        client.handle(Event::ChannelClosed { transport: link.client.clone(), cause: None }, now);
        match client.app.drain().as_slice() {
            [Event::SessionInactive { session, permanent: false, .. }] => assert_eq!(*session, CLIENT),
            other => panic!("unexpected events {:?}", other),
        }
        assert_eq!(client.session(CLIENT).status(), SessionStatus::NotConnected);
        assert!(client.session(CLIENT).reconnect_timer.is_some());

        server.handle(Event::ChannelClosed { transport: link.server.clone(), cause: None }, now);
        assert_eq!(kinds(&server.app.drain()), vec![EventKind::SessionInactive]);
        assert_eq!(server.engine.sessions().lookup_session(SESSION_ID), Some(SERVER));

        // the reconnect timer fires
        client.handle(Event::Time { key: 0, tag: TimerTag::Reconnect(CLIENT) }, now);
        assert_eq!(client.connector.num_connects(), 2);
        let link = connect_again(&mut client, &mut server, now);

        let greeting = decode_all(&client.pool, take_frames(&link.client));
        let expected = Greeting {
            resume: Some(ResumeInfo { session_id: SESSION_ID, receive_next: SequenceNumber::ZERO }),
            auth_token: None,
        };
        assert_eq!(Greeting::deser(&mut greeting[0].payload().clone()), Ok(expected));
        server.handle(Event::InputDataPresent { transport: link.server.clone(), data: encode_all(&greeting) }, now);

        match server.app.drain().as_slice() {
            [Event::SessionActive { session: s1 }, Event::SessionEstablished { session: s2, session_id, resumed: true }] => {
                assert_eq!(*s1, SERVER);
                assert_eq!(*s2, SERVER);
                assert_eq!(*session_id, SESSION_ID);
            }
            other => panic!("unexpected events {:?}", other),
        }
        // the provisional session for the new transport is gone
        assert_eq!(server.engine.sessions().len(), 1);
        assert!(server.session(SERVER).is_current_transport(&link.server));
        assert_eq!(server.session(SERVER).connections(), 2);

        link.server_to_client(&mut client, now);
        match client.app.drain().as_slice() {
            [Event::SessionEstablished { session_id, resumed: true, .. }] => assert_eq!(*session_id, SESSION_ID),
            other => panic!("unexpected events {:?}", other),
        }
        // the server confirmed "a" and "b" in its welcome, so only "c" is resent
        let resent = decode_all(&client.pool, take_frames(&link.client));
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].sequence(), SequenceNumber::from_raw(2));
        assert!(resent[0].is_resent());

        server.handle(Event::InputDataPresent { transport: link.server.clone(), data: encode_all(&resent) }, now);
        assert_eq!(delivered(&server.app.drain()), vec![bytes(b"c")]);
    }

    /// the client's reconnect after [connect] created the client transport
    fn connect_again(client: &mut Peer, server: &mut Peer, now: Instant) -> Link {
        let (client_transport, _) = client.connector.last().unwrap();
        client.handle(Event::Connected { transport: client_transport.clone() }, now);
        assert_eq!(kinds(&client.app.drain()), vec![EventKind::SessionActive]);

        let server_transport = Arc::new(ChannelTransport::new(Box::new(MemoryChannel::new()), server.pool.clone()));
        server.handle(Event::Accepted { transport: server_transport.clone() }, now);
        Link {
            client: client_transport,
            server: server_transport,
        }
    }

    fn backlog_config() -> NetConfig {
        NetConfig {
            max_unacked: 100,
            ..config()
        }
    }

    #[test]
    fn test_resume_after_large_unacked_backlog() {
        let now = Instant::now();
        let mut client = Peer::new(backlog_config());
        let mut server = Peer::new(backlog_config());
        let link = established(&mut client, &mut server, now);

        let payloads = (0..250u32)
            .map(|i| Bytes::from(i.to_be_bytes().to_vec()))
            .collect::<Vec<_>>();
        for payload in &payloads {
            client.handle(Event::PacketWriteRequest { session: CLIENT, data: payload.clone() }, now);
        }
        assert_eq!(client.session(CLIENT).transmit_queue().len(), 100);
        assert_eq!(client.session(CLIENT).num_pending_outbound(), 150);

        // everything that was sent arrives, but the server's acks are lost with the connection
        link.client_to_server(&mut server, now);
        assert_eq!(delivered(&server.app.drain()), payloads[..100].to_vec());
        let _ = take_frames(&link.server);

        link.client.close();
        link.server.close();
        client.handle(Event::ChannelClosed { transport: link.client.clone(), cause: None }, now);
        server.handle(Event::ChannelClosed { transport: link.server.clone(), cause: None }, now);
        assert_eq!(kinds(&client.app.drain()), vec![EventKind::SessionInactive]);
        assert_eq!(kinds(&server.app.drain()), vec![EventKind::SessionInactive]);

        client.handle(Event::Time { key: 0, tag: TimerTag::Reconnect(CLIENT) }, now);
        let link = connect_again(&mut client, &mut server, now);
        link.exchange(&mut client, &mut server, now);

        match client.app.drain().as_slice() {
            [Event::SessionEstablished { resumed: true, .. }] => {}
            other => panic!("unexpected events {:?}", other),
        }

        // the remaining deliveries are acked once the ack interval elapses
        let later = now + Duration::from_millis(300);
        server.handle(Event::Time { key: 0, tag: TimerTag::Housekeeping }, later);
        link.exchange(&mut client, &mut server, later);

        let events = server.app.drain();
        assert!(error_codes(&events).is_empty());
        assert_eq!(delivered(&events), payloads[100..].to_vec());
        assert!(client.session(CLIENT).is_outbound_drained());
        assert!(server.session(SERVER).is_established());
    }

    #[test]
    fn test_resume_of_unknown_session_is_rejected() {
        let now = Instant::now();
        let mut server = Peer::new(config());
        let transport = Arc::new(ChannelTransport::new(Box::new(MemoryChannel::new()), server.pool.clone()));
        server.handle(Event::Accepted { transport: transport.clone() }, now);

        let mut payload = BytesMut::new();
        Greeting {
            resume: Some(ResumeInfo { session_id: SessionId::from_raw(99), receive_next: SequenceNumber::ZERO }),
            auth_token: None,
        }.ser(&mut payload);
        let greeting = Packet::new(SequenceNumber::ZERO, PacketFlags::GREETING, payload.freeze());
        server.handle(Event::InputDataPresent { transport: transport.clone(), data: encode_all(&[greeting]) }, now);

        assert_eq!(error_codes(&server.app.drain()), vec![SessionErrorCode::BadSession]);
        assert!(server.engine.sessions().is_empty());

        let welcome = decode_all(&server.pool, take_frames(&transport));
        assert_eq!(Welcome::deser(&mut welcome[0].payload().clone()), Ok(Welcome::rejected(SessionErrorCode::BadSession)));
    }

    #[test]
    fn test_bad_magic() {
        let now = Instant::now();
        let mut client = Peer::new(config());
        let mut server = Peer::new(config());
        let link = connect(&mut client, &mut server, now);
        let _ = take_frames(&link.client);

        let greeting = Packet::new(SequenceNumber::ZERO, PacketFlags::GREETING, Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef, 1, 0]));
        server.handle(Event::InputDataPresent { transport: link.server.clone(), data: encode_all(&[greeting]) }, now);

        assert_eq!(error_codes(&server.app.drain()), vec![SessionErrorCode::BadMagic]);
        assert!(server.engine.sessions().is_empty());
        assert_eq!(close_reasons(&server), vec![CloseReason::ProtocolError]);

        // the client learns why it was rejected
        link.server_to_client(&mut client, now);
        let events = client.app.drain();
        assert_eq!(kinds(&events), vec![EventKind::SessionActive, EventKind::SessionError, EventKind::SessionInactive]);
        assert_eq!(error_codes(&events), vec![SessionErrorCode::BadMagic]);
        assert!(client.engine.sessions().is_empty());
    }

    #[rstest]
    #[case::matching(Some(b"secret".to_vec()), None)]
    #[case::wrong(Some(b"wrong".to_vec()), Some(SessionErrorCode::BadAuth))]
    #[case::missing(None, Some(SessionErrorCode::BadAuth))]
    fn test_auth(#[case] token: Option<Vec<u8>>, #[case] expected_error: Option<SessionErrorCode>) {
        let now = Instant::now();
        let mut client = Peer::new(NetConfig { auth_token: token, ..config() });
        let mut server = Peer::new(NetConfig { required_auth_token: Some(b"secret".to_vec()), ..config() });

        let link = connect(&mut client, &mut server, now);
        link.exchange(&mut client, &mut server, now);

        let events = client.app.drain();
        match expected_error {
            None => {
                assert_eq!(kinds(&events), vec![EventKind::SessionActive, EventKind::SessionEstablished]);
                assert_eq!(server.engine.sessions().len(), 1);
            }
            Some(code) => {
                assert_eq!(error_codes(&events), vec![code]);
                assert_eq!(events.last().map(|e| e.kind()), Some(EventKind::SessionInactive));
                assert!(client.engine.sessions().is_empty());
                assert!(server.engine.sessions().is_empty());
            }
        }
    }

    #[test]
    fn test_window_exceeded() {
        let now = Instant::now();
        let mut client = Peer::new(config());
        let mut server = Peer::new(NetConfig { receive_window: 4, ..config() });
        let link = established(&mut client, &mut server, now);

        let far_ahead = Packet::data(SequenceNumber::from_raw(100), bytes(b"x"));
        server.handle(Event::InputDataPresent { transport: link.server.clone(), data: encode_all(&[far_ahead]) }, now);

        assert_eq!(error_codes(&server.app.drain()), vec![SessionErrorCode::MissingSequence]);
        assert!(server.engine.sessions().is_empty());
    }

    #[test]
    fn test_write_to_unknown_session() {
        let now = Instant::now();
        let mut peer = Peer::new(config());
        peer.write(SessionKey::from_raw(99), b"abc", now);

        match peer.app.drain().as_slice() {
            [Event::SessionError { session, session_id: None, code: SessionErrorCode::BadSession, .. }] => {
                assert_eq!(*session, SessionKey::from_raw(99));
            }
            other => panic!("unexpected events {:?}", other),
        }
    }

    #[test]
    fn test_writes_before_establishment_are_sent_after_welcome() {
        let now = Instant::now();
        let mut client = Peer::new(config());
        let mut server = Peer::new(config());
        let link = connect(&mut client, &mut server, now);

        client.write(CLIENT, b"early", now);
        let frames = decode_all(&client.pool, take_frames(&link.client));
        assert_eq!(frames.iter().map(|p| p.kind()).collect::<Vec<_>>(), vec![Some(PacketKind::Greeting)]);
        server.handle(Event::InputDataPresent { transport: link.server.clone(), data: encode_all(&frames) }, now);

        link.exchange(&mut client, &mut server, now);
        assert_eq!(delivered(&server.app.drain()), vec![bytes(b"early")]);
    }

    #[test]
    fn test_reconnect_gives_up() {
        let now = Instant::now();
        let mut connector = MockConnector::new();
        connector.expect_connect()
            .times(3)
            .returning(|_| Err(io::Error::new(ErrorKind::ConnectionRefused, "refused")));

        let mut config = config();
        config.reconnect.max_attempts = Some(2);
        let mut client = Peer::build(config, Some(Arc::new(connector)), Box::new(NoopMonitor));

        client.handle(Event::StartConnection { session: CLIENT, addr: server_addr() }, now);
        assert_eq!(client.session(CLIENT).status(), SessionStatus::NotConnected);
        assert_eq!(client.timers.num_scheduled(), 2);

        client.handle(Event::Time { key: 0, tag: TimerTag::Reconnect(CLIENT) }, now);
        assert!(client.app.is_empty());
        client.handle(Event::Time { key: 0, tag: TimerTag::Reconnect(CLIENT) }, now);

        let events = client.app.drain();
        assert_eq!(error_codes(&events), vec![SessionErrorCode::ConnectFailed]);
        match events.last() {
            Some(Event::SessionInactive { session_id: None, permanent: true, .. }) => {}
            other => panic!("unexpected event {:?}", other),
        }
        assert!(client.engine.sessions().is_empty());

        // a stale timer for the removed session is ignored
        client.handle(Event::Time { key: 0, tag: TimerTag::Reconnect(CLIENT) }, now);
        assert!(client.app.is_empty());
    }

    #[test]
    fn test_reconnect_after_failed_connect() {
        let now = Instant::now();
        let mut client = Peer::new(config());
        let mut server = Peer::new(config());

        client.connector.fail_next(1);
        client.handle(Event::StartConnection { session: CLIENT, addr: server_addr() }, now);
        assert_eq!(client.connector.num_connects(), 0);
        assert_eq!(client.session(CLIENT).status(), SessionStatus::NotConnected);
        assert!(client.session(CLIENT).reconnect_timer.is_some());
        assert!(client.app.is_empty());

        client.handle(Event::Time { key: 0, tag: TimerTag::Reconnect(CLIENT) }, now);
        assert_eq!(client.connector.num_connects(), 1);
        let link = connect_again(&mut client, &mut server, now);
        link.exchange(&mut client, &mut server, now);

        assert_eq!(kinds(&client.app.drain()), vec![EventKind::SessionEstablished]);
        assert!(client.session(CLIENT).is_established());
    }

    #[test]
    fn test_disconnect_waits_for_acks() {
        let now = Instant::now();
        let mut client = Peer::new(config());
        let mut server = Peer::new(config());
        let link = established(&mut client, &mut server, now);
        let _ = close_reasons(&client);

        client.write(CLIENT, b"a", now);
        link.client_to_server(&mut server, now);
        assert_eq!(delivered(&server.app.drain()), vec![bytes(b"a")]);

        client.handle(Event::DisconnectRequest { session: CLIENT }, now);
        assert!(client.session(CLIENT).is_pending_disconnect());
        assert!(link.client.transmit_queue().is_empty());

        // no new data once a disconnect is requested
        client.write(CLIENT, b"b", now);
        assert_eq!(client.session(CLIENT).transmit_queue().len(), 1);

        // the ack interval elapses on the server
        let later = now + Duration::from_millis(300);
        server.handle(Event::Time { key: 0, tag: TimerTag::Housekeeping }, later);
        link.server_to_client(&mut client, later);

        match client.app.drain().as_slice() {
            [Event::SessionInactive { session, permanent: true, .. }] => assert_eq!(*session, CLIENT),
            other => panic!("unexpected events {:?}", other),
        }
        assert_eq!(close_reasons(&client), vec![CloseReason::Disconnect]);

        link.client_to_server(&mut server, later);
        match server.app.drain().as_slice() {
            [Event::SessionInactive { session, session_id, permanent: true }] => {
                assert_eq!(*session, SERVER);
                assert_eq!(*session_id, Some(SESSION_ID));
            }
            other => panic!("unexpected events {:?}", other),
        }
        assert_eq!(close_reasons(&server), vec![CloseReason::EndOfStream]);
        assert!(server.engine.sessions().is_empty());
    }

    #[test]
    fn test_disconnect_before_connected() {
        let now = Instant::now();
        let mut client = Peer::new(config());
        client.handle(Event::StartConnection { session: CLIENT, addr: server_addr() }, now);
        let (transport, _) = client.connector.last().unwrap();

        client.handle(Event::DisconnectRequest { session: CLIENT }, now);
        assert_eq!(kinds(&client.app.drain()), vec![EventKind::SessionInactive]);
        assert!(client.engine.sessions().is_empty());

        // the connect completes after the session is gone
        client.handle(Event::Connected { transport }, now);
        assert!(client.app.is_empty());
        assert_eq!(close_reasons(&client), vec![CloseReason::Disconnect, CloseReason::Disconnect]);
    }

    #[test]
    fn test_keepalive_and_session_timeout() {
        let now = Instant::now();
        let mut client = Peer::new(config());
        let mut server = Peer::new(config());
        let link = established(&mut client, &mut server, now);

        server.handle(Event::Time { key: 0, tag: TimerTag::Housekeeping }, now + Duration::from_secs(1));
        assert!(link.server.transmit_queue().is_empty());

        server.handle(Event::Time { key: 0, tag: TimerTag::Housekeeping }, now + Duration::from_secs(6));
        let keepalive = decode_all(&server.pool, take_frames(&link.server));
        assert_eq!(keepalive.iter().map(|p| p.kind()).collect::<Vec<_>>(), vec![Some(PacketKind::KeepAlive)]);

        client.handle(Event::Time { key: 0, tag: TimerTag::Housekeeping }, now + Duration::from_secs(31));
        let events = client.app.drain();
        assert_eq!(error_codes(&events), vec![SessionErrorCode::SessionTimeout]);
        assert_eq!(events.last().map(|e| e.kind()), Some(EventKind::SessionInactive));
        assert!(client.engine.sessions().is_empty());
    }

    #[test]
    fn test_partial_frame_defers_session_timeout() {
        let short_timeout = || NetConfig {
            keepalive_interval: Duration::from_millis(500),
            session_timeout: Duration::from_secs(1),
            ..config()
        };
        let start = Instant::now();
        let mut client = Peer::new(short_timeout());
        let mut server = Peer::new(short_timeout());
        let link = established(&mut client, &mut server, start);

        // the first bytes of a large frame arrive, but not enough to decode anything
        std::thread::sleep(Duration::from_millis(300));
        let (_, channel) = client.connector.last().unwrap();
        channel.push_incoming(&[0, 0, 0]);
        assert_eq!(link.client.read(&mut [0u8; 16]).unwrap(), 3);

        client.handle(Event::Time { key: 0, tag: TimerTag::Housekeeping }, start + Duration::from_millis(1100));
        assert!(client.app.is_empty());
        assert!(client.session(CLIENT).is_established());

        client.handle(Event::Time { key: 0, tag: TimerTag::Housekeeping }, start + Duration::from_millis(2000));
        assert_eq!(error_codes(&client.app.drain()), vec![SessionErrorCode::SessionTimeout]);
        assert!(client.engine.sessions().is_empty());
    }

    #[test]
    fn test_greeting_timeout_discards_provisional_session() {
        let now = Instant::now();
        let mut server = Peer::new(config());
        let transport = Arc::new(ChannelTransport::new(Box::new(MemoryChannel::new()), server.pool.clone()));
        server.handle(Event::Accepted { transport }, now);
        assert_eq!(server.engine.sessions().len(), 1);

        server.handle(Event::Time { key: 0, tag: TimerTag::Housekeeping }, now + Duration::from_secs(6));
        assert!(server.engine.sessions().is_empty());
        assert!(server.app.is_empty());
        assert_eq!(close_reasons(&server), vec![CloseReason::Timeout]);
    }

    #[test]
    fn test_connect_timeout_schedules_reconnect() {
        let now = Instant::now();
        let mut client = Peer::new(config());
        client.handle(Event::StartConnection { session: CLIENT, addr: server_addr() }, now);
        assert_eq!(client.session(CLIENT).status(), SessionStatus::Connecting);

        client.handle(Event::Time { key: 0, tag: TimerTag::Housekeeping }, now + Duration::from_secs(6));
        assert_eq!(client.session(CLIENT).status(), SessionStatus::NotConnected);
        assert_eq!(close_reasons(&client), vec![CloseReason::Timeout]);
        assert_eq!(client.timers.num_scheduled(), 2);
        assert!(client.app.is_empty());

        client.handle(Event::Time { key: 0, tag: TimerTag::Reconnect(CLIENT) }, now + Duration::from_secs(7));
        assert_eq!(client.connector.num_connects(), 2);
        assert_eq!(client.session(CLIENT).status(), SessionStatus::Connecting);
    }

    #[test]
    fn test_failure_of_replaced_transport_is_ignored() {
        let now = Instant::now();
        let mut client = Peer::new(config());
        let mut server = Peer::new(config());
        let link = established(&mut client, &mut server, now);

        let stale = Arc::new(ChannelTransport::new(Box::new(MemoryChannel::new()), client.pool.clone()));
        client.handle(Event::ChannelClosed { transport: stale, cause: Some(Arc::new(io::Error::from(ErrorKind::ConnectionReset))) }, now);
        assert!(client.app.is_empty());
        assert!(client.session(CLIENT).is_current_transport(&link.client));
    }
}
