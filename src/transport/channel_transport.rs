use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use bytes::BytesMut;
use mio::{Interest, Token};
use tracing::{debug, trace, warn};
use crate::buffers::buffer_pool::BufferPool;
use crate::buffers::received_data::ReceivedData;
use crate::reactor::selector::SelectorRegistry;
use crate::session::session::SessionKey;
use crate::transport::channel::{next_channel_id, ByteChannel};

/// Outbound buffers of a transport, in FIFO order. The head buffer may be partially written;
///  buffers are not advanced so that they keep their capacity and can go back to the pool.
#[derive(Default)]
pub struct TransmitQueue {
    buffers: VecDeque<BytesMut>,
    /// number of bytes of the head buffer that were written already
    written: usize,
}

impl TransmitQueue {
    pub fn push_back(&mut self, buf: BytesMut) {
        self.buffers.push_back(buf);
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// the part of the head buffer that still needs to be written
    pub fn unwritten(&self) -> Option<&[u8]> {
        self.buffers.front()
            .map(|buf| &buf[self.written..])
    }

    /// Marks `n` bytes of the head buffer as written, returning the head buffer once it is
    ///  written completely
    pub fn consume(&mut self, n: usize) -> Option<BytesMut> {
        let head_len = self.buffers.front()?.len();
        self.written = (self.written + n).min(head_len);
        if self.written < head_len {
            return None;
        }
        self.written = 0;
        self.buffers.pop_front()
    }

    /// removes all buffers, whether they were partially written or not
    pub fn drain(&mut self) -> std::collections::vec_deque::Drain<'_, BytesMut> {
        self.written = 0;
        self.buffers.drain(..)
    }
}

struct Registration {
    registry: Arc<SelectorRegistry>,
    write_interest: bool,
}

/// Per-connection state: the channel, its outbound buffer queue, the reassembly stream for
///  inbound data and the registration with the selector.
///
/// A transport is shared between the I/O pump and the protocol pump, so all state is
///  internally synchronized. Locks are acquired in the order transmit queue, channel,
///  registration.
pub struct ChannelTransport {
    id: u64,
    channel: Mutex<Option<Box<dyn ByteChannel>>>,
    closed: AtomicBool,
    connect_pending: AtomicBool,
    transmit: Mutex<TransmitQueue>,
    received: Mutex<ReceivedData>,
    registration: Mutex<Option<Registration>>,
    /// the session using this transport. The transport does not control the session's
    ///  lifecycle.
    attachment: Mutex<Option<SessionKey>>,
    peer_addr: Option<SocketAddr>,
    pool: Arc<BufferPool>,
    last_rx: Mutex<Instant>,
    last_tx: Mutex<Instant>,
}

impl ChannelTransport {
    pub fn new(channel: Box<dyn ByteChannel>, pool: Arc<BufferPool>) -> ChannelTransport {
        let now = Instant::now();
        ChannelTransport {
            id: next_channel_id(),
            peer_addr: channel.peer_addr(),
            channel: Mutex::new(Some(channel)),
            closed: AtomicBool::new(false),
            connect_pending: AtomicBool::new(false),
            transmit: Mutex::new(TransmitQueue::default()),
            received: Mutex::new(ReceivedData::new(pool.clone())),
            registration: Mutex::new(None),
            attachment: Mutex::new(None),
            pool,
            last_rx: Mutex::new(now),
            last_tx: Mutex::new(now),
        }
    }

    /// a transport for a channel with a pending non-blocking connect
    pub fn connecting(channel: Box<dyn ByteChannel>, peer_addr: SocketAddr, pool: Arc<BufferPool>) -> ChannelTransport {
        let mut result = Self::new(channel, pool);
        result.connect_pending = AtomicBool::new(true);
        result.peer_addr = Some(peer_addr);
        result
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn token(&self) -> Token {
        Token(self.id as usize)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_connect_pending(&self) -> bool {
        self.connect_pending.load(Ordering::Acquire)
    }

    pub fn attachment(&self) -> Option<SessionKey> {
        *self.attachment.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_attachment(&self, session: Option<SessionKey>) {
        *self.attachment.lock().unwrap_or_else(PoisonError::into_inner) = session;
    }

    /// when bytes were last read from the channel, regardless of whether they completed a frame
    pub fn last_rx(&self) -> Instant {
        *self.last_rx.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn last_tx(&self) -> Instant {
        *self.last_tx.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers the channel with a selector, making the selector emit readiness events for
    ///  this transport
    pub fn register(self: &Arc<Self>, registry: &Arc<SelectorRegistry>) -> io::Result<()> {
        let mut channel = self.channel.lock().unwrap_or_else(PoisonError::into_inner);
        let channel = match channel.as_mut() {
            Some(channel) => channel,
            None => return Err(io::Error::new(io::ErrorKind::NotConnected, "transport is closed")),
        };

        let write_interest = self.is_connect_pending();
        registry.insert_transport(self.clone());
        if let Err(e) = channel.register(registry.registry(), self.token(), interest(write_interest)) {
            registry.remove(self.token());
            return Err(e);
        }

        *self.registration.lock().unwrap_or_else(PoisonError::into_inner) = Some(Registration {
            registry: registry.clone(),
            write_interest,
        });
        trace!("registered {:?}", self);
        Ok(())
    }

    /// Makes sure there is write interest if and only if there is data to transmit. This is
    ///  called after enqueuing data, and after a connect completed.
    pub fn reregister(&self) -> io::Result<()> {
        let transmit = self.transmit.lock().unwrap_or_else(PoisonError::into_inner);
        self.set_write_interest(!transmit.is_empty() || self.is_connect_pending())
    }

    /// NB: The caller must hold the transmit queue lock (or not hold any of this transport's
    ///      locks) to preserve lock order
    pub fn set_write_interest(&self, write_interest: bool) -> io::Result<()> {
        let mut channel = self.channel.lock().unwrap_or_else(PoisonError::into_inner);
        let mut registration = self.registration.lock().unwrap_or_else(PoisonError::into_inner);

        match (channel.as_mut(), registration.as_mut()) {
            (Some(channel), Some(registration)) => {
                if registration.write_interest == write_interest {
                    return Ok(());
                }
                trace!("{:?}: write interest {}", self, write_interest);
                channel.reregister(registration.registry.registry(), self.token(), interest(write_interest))?;
                registration.write_interest = write_interest;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Appends a buffer to the transmit queue and turns on write interest. The transport takes
    ///  ownership of the buffer and releases it to the pool once it is written (or the transport
    ///  is closed).
    pub fn enqueue_transmit(&self, buf: BytesMut) -> io::Result<()> {
        if self.is_closed() {
            debug!("{:?} is closed, discarding {} bytes", self, buf.len());
            self.pool.release(buf);
            return Ok(());
        }

        let mut transmit = self.transmit.lock().unwrap_or_else(PoisonError::into_inner);
        transmit.push_back(buf);
        if self.is_connect_pending() {
            return Ok(());
        }
        self.set_write_interest(true)
    }

    /// The queue of outbound buffers. Buffers are written strictly in FIFO order.
    pub fn transmit_queue(&self) -> MutexGuard<'_, TransmitQueue> {
        self.transmit.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// the reassembly stream for inbound data
    pub fn received_data(&self) -> MutexGuard<'_, ReceivedData> {
        self.received.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut channel = self.channel.lock().unwrap_or_else(PoisonError::into_inner);
        let channel = channel.as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "transport is closed"))?;

        let result = channel.read(buf)?;
        if result > 0 {
            *self.last_rx.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
        }
        Ok(result)
    }

    /// NB: callers writing from the transmit queue must hold its lock
    pub fn write_channel(&self, buf: &[u8]) -> io::Result<usize> {
        let mut channel = self.channel.lock().unwrap_or_else(PoisonError::into_inner);
        let channel = channel.as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "transport is closed"))?;

        let result = channel.write(buf)?;
        if result > 0 {
            *self.last_tx.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
        }
        Ok(result)
    }

    /// Completes a pending connect. Returns `Ok(false)` if the connect is still in progress.
    pub fn finish_connect(&self) -> io::Result<bool> {
        let connected = {
            let mut channel = self.channel.lock().unwrap_or_else(PoisonError::into_inner);
            let channel = channel.as_mut()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "transport is closed"))?;
            channel.finish_connect()?
        };

        if connected {
            self.connect_pending.store(false, Ordering::Release);
            self.reregister()?;
        }
        Ok(connected)
    }

    /// Closes the transport, releasing the channel, its registration and all buffers. Returns
    ///  `true` if this call closed the transport, and `false` if it was closed before.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        debug!("closing {:?}", self);

        {
            let mut channel = self.channel.lock().unwrap_or_else(PoisonError::into_inner);
            let registration = self.registration.lock().unwrap_or_else(PoisonError::into_inner).take();

            if let Some(mut ch) = channel.take() {
                if let Some(registration) = &registration {
                    if let Err(e) = ch.deregister(registration.registry.registry()) {
                        debug!("error deregistering {:?}: {}", self, e);
                    }
                }
                if let Err(e) = ch.shutdown() {
                    debug!("error shutting down {:?}: {}", self, e);
                }
            }
            if let Some(registration) = registration {
                registration.registry.remove(self.token());
            }
        }

        let mut transmit = self.transmit.lock().unwrap_or_else(PoisonError::into_inner);
        if !transmit.is_empty() {
            warn!("{:?} closed with {} unsent buffers", self, transmit.len());
        }
        for buf in transmit.drain() {
            self.pool.release(buf);
        }
        drop(transmit);

        self.received_data().clear();
        true
    }
}

fn interest(write_interest: bool) -> Interest {
    if write_interest {
        Interest::READABLE | Interest::WRITABLE
    }
    else {
        Interest::READABLE
    }
}

impl Debug for ChannelTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.peer_addr {
            Some(addr) => write!(f, "Transport#{}({})", self.id, addr),
            None => write!(f, "Transport#{}", self.id),
        }
    }
}
