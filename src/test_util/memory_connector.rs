use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use crate::buffers::buffer_pool::BufferPool;
use crate::engine::packet_io_handler::Connector;
use crate::test_util::memory_channel::MemoryChannel;
use crate::transport::channel_transport::ChannelTransport;

/// A [Connector] creating transports on top of [MemoryChannel]s. Tests pick up the created
///  transports (and the channels behind them) to wire them to a peer, and to report the
///  connect's outcome to the engine.
pub struct MemoryConnector {
    pool: Arc<BufferPool>,
    connected: Mutex<Vec<(SocketAddr, Arc<ChannelTransport>, MemoryChannel)>>,
    failures: Mutex<usize>,
}

impl MemoryConnector {
    pub fn new(pool: Arc<BufferPool>) -> MemoryConnector {
        MemoryConnector {
            pool,
            connected: Default::default(),
            failures: Default::default(),
        }
    }

    /// the next `n` connect calls fail immediately
    pub fn fail_next(&self, n: usize) {
        *self.failures.lock().unwrap_or_else(PoisonError::into_inner) = n;
    }

    pub fn num_connects(&self) -> usize {
        self.connected.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// the most recently created transport
    pub fn last(&self) -> Option<(Arc<ChannelTransport>, MemoryChannel)> {
        self.connected.lock().unwrap_or_else(PoisonError::into_inner)
            .last()
            .map(|(_, t, c)| (t.clone(), c.clone()))
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, addr: SocketAddr) -> io::Result<Arc<ChannelTransport>> {
        {
            let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
            if *failures > 0 {
                *failures -= 1;
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"));
            }
        }

        let channel = MemoryChannel::connecting().with_peer_addr(addr);
        let transport = Arc::new(ChannelTransport::connecting(Box::new(channel.clone()), addr, self.pool.clone()));
        self.connected.lock().unwrap_or_else(PoisonError::into_inner)
            .push((addr, transport.clone(), channel));
        Ok(transport)
    }
}
