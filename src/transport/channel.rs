use std::fmt::{Debug, Formatter};
use std::io;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use anyhow::Context;
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry, Token};
use tracing::debug;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_channel_id() -> u64 {
    NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed)
}

/// The OS-level byte stream underneath a transport. All operations are non-blocking.
pub trait ByteChannel: Send {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Completes a pending non-blocking connect. `Ok(false)` means the connect is still in
    ///  progress.
    fn finish_connect(&mut self) -> io::Result<bool>;

    fn register(&mut self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()>;
    fn reregister(&mut self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()>;
    fn deregister(&mut self, registry: &Registry) -> io::Result<()>;

    fn shutdown(&mut self) -> io::Result<()>;
    fn peer_addr(&self) -> Option<SocketAddr>;
}

impl ByteChannel for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(self, buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Write::write(self, buf)
    }

    fn finish_connect(&mut self) -> io::Result<bool> {
        if let Some(e) = self.take_error()? {
            return Err(e);
        }
        match TcpStream::peer_addr(self) {
            Ok(_) => {
                if let Err(e) = self.set_nodelay(true) {
                    debug!("could not set TCP_NODELAY: {}", e);
                }
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotConnected || e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn register(&mut self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()> {
        registry.register(self, token, interest)
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()> {
        registry.reregister(self, token, interest)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(self)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }
}

/// A non-blocking listening socket
pub struct Listener {
    id: u64,
    listener: Mutex<TcpListener>,
    local_addr: SocketAddr,
}

impl Listener {
    pub fn bind(addr: SocketAddr) -> anyhow::Result<Listener> {
        let listener = TcpListener::bind(addr)
            .with_context(|| format!("binding listener to {}", addr))?;
        let local_addr = listener.local_addr()?;
        debug!("listening on {}", local_addr);

        Ok(Listener {
            id: next_channel_id(),
            listener: Mutex::new(listener),
            local_addr,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, addr) = self.listener.lock().unwrap_or_else(PoisonError::into_inner).accept()?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("could not set TCP_NODELAY: {}", e);
        }
        Ok((stream, addr))
    }

    pub fn register(&self, registry: &Registry, token: Token) -> io::Result<()> {
        let mut listener = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
        registry.register(&mut *listener, token, Interest::READABLE)
    }

    pub fn deregister(&self, registry: &Registry) -> io::Result<()> {
        let mut listener = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
        registry.deregister(&mut *listener)
    }
}

impl Debug for Listener {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Listener#{}@{}", self.id, self.local_addr)
    }
}
