use std::collections::VecDeque;
use std::io;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use mio::{Interest, Registry, Token};
use crate::transport::channel::ByteChannel;

#[derive(Default)]
struct State {
    incoming: VecDeque<u8>,
    written: Vec<u8>,
    /// number of bytes that can be written before writes block, `None` for no limit
    write_budget: Option<usize>,
    eof: bool,
    read_error: Option<ErrorKind>,
    write_error: Option<ErrorKind>,
    connect_pending: bool,
    connect_error: Option<ErrorKind>,
    shut_down: bool,
    peer_addr: Option<SocketAddr>,
}

/// An in-memory [ByteChannel]. Clones share the same state, so a test keeps a clone to feed
///  incoming data, inspect written data and inject failures while a transport owns the channel.
#[derive(Clone, Default)]
pub struct MemoryChannel {
    state: Arc<Mutex<State>>,
}

impl MemoryChannel {
    pub fn new() -> MemoryChannel {
        Default::default()
    }

    /// a channel with a pending connect, see [MemoryChannel::complete_connect]
    pub fn connecting() -> MemoryChannel {
        let result = MemoryChannel::new();
        result.state().connect_pending = true;
        result
    }

    pub fn with_peer_addr(self, addr: SocketAddr) -> MemoryChannel {
        self.state().peer_addr = Some(addr);
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push_incoming(&self, data: &[u8]) {
        self.state().incoming.extend(data.iter().copied());
    }

    /// reads return 0 once the incoming data is consumed
    pub fn set_eof(&self) {
        self.state().eof = true;
    }

    pub fn fail_reads(&self, kind: ErrorKind) {
        self.state().read_error = Some(kind);
    }

    pub fn fail_writes(&self, kind: ErrorKind) {
        self.state().write_error = Some(kind);
    }

    pub fn set_write_budget(&self, budget: Option<usize>) {
        self.state().write_budget = budget;
    }

    pub fn complete_connect(&self) {
        self.state().connect_pending = false;
    }

    pub fn fail_connect(&self, kind: ErrorKind) {
        self.state().connect_error = Some(kind);
    }

    pub fn written(&self) -> Vec<u8> {
        self.state().written.clone()
    }

    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.state().written)
    }

    pub fn is_shut_down(&self) -> bool {
        self.state().shut_down
    }
}

impl ByteChannel for MemoryChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state();
        if let Some(kind) = state.read_error {
            return Err(io::Error::new(kind, "injected read error"));
        }
        if state.incoming.is_empty() {
            if state.eof {
                return Ok(0);
            }
            return Err(ErrorKind::WouldBlock.into());
        }

        let n = buf.len().min(state.incoming.len());
        for (dst, src) in buf.iter_mut().zip(state.incoming.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state();
        if let Some(kind) = state.write_error {
            return Err(io::Error::new(kind, "injected write error"));
        }

        let n = match state.write_budget {
            Some(0) => return Err(ErrorKind::WouldBlock.into()),
            Some(budget) => budget.min(buf.len()),
            None => buf.len(),
        };
        if let Some(budget) = state.write_budget.as_mut() {
            *budget -= n;
        }
        state.written.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn finish_connect(&mut self) -> io::Result<bool> {
        let state = self.state();
        if let Some(kind) = state.connect_error {
            return Err(io::Error::new(kind, "injected connect error"));
        }
        Ok(!state.connect_pending)
    }

    fn register(&mut self, _registry: &Registry, _token: Token, _interest: Interest) -> io::Result<()> {
        Ok(())
    }

    fn reregister(&mut self, _registry: &Registry, _token: Token, _interest: Interest) -> io::Result<()> {
        Ok(())
    }

    fn deregister(&mut self, _registry: &Registry) -> io::Result<()> {
        Ok(())
    }

    fn shutdown(&mut self) -> io::Result<()> {
        self.state().shut_down = true;
        Ok(())
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.state().peer_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_budget() {
        let mut channel = MemoryChannel::new();
        channel.set_write_budget(Some(3));

        assert_eq!(channel.write(b"abcde").unwrap(), 3);
        assert_eq!(channel.write(b"de").unwrap_err().kind(), ErrorKind::WouldBlock);
        assert_eq!(channel.written(), b"abc".to_vec());

        channel.set_write_budget(None);
        assert_eq!(channel.write(b"de").unwrap(), 2);
        assert_eq!(channel.take_written(), b"abcde".to_vec());
        assert!(channel.written().is_empty());
    }

    #[test]
    fn test_read_until_eof() {
        let mut channel = MemoryChannel::new();
        channel.push_incoming(b"abc");
        channel.set_eof();

        let mut buf = [0u8; 2];
        assert_eq!(channel.read(&mut buf).unwrap(), 2);
        assert_eq!(channel.read(&mut buf).unwrap(), 1);
        assert_eq!(channel.read(&mut buf).unwrap(), 0);
    }
}
