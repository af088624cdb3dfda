use std::io;
use std::sync::Arc;
use tracing::{debug, trace};
use crate::buffers::buffer_pool::BufferPool;
use crate::event::{CloseReason, Event};
use crate::event::queue::EventSink;
use crate::transport::channel_transport::ChannelTransport;

/// Performs one non-blocking read per event, handing the data to the protocol engine. After a
///  successful read, the handler re-posts the readiness event to itself so that the channel is
///  read until it would block, without starving other transports.
pub struct ReadHandler {
    pool: Arc<BufferPool>,
    io_sink: Arc<dyn EventSink>,
    protocol_sink: Arc<dyn EventSink>,
}

impl ReadHandler {
    pub fn new(pool: Arc<BufferPool>, io_sink: Arc<dyn EventSink>, protocol_sink: Arc<dyn EventSink>) -> ReadHandler {
        ReadHandler {
            pool,
            io_sink,
            protocol_sink,
        }
    }

    pub fn on_read_possible(&self, transport: Arc<ChannelTransport>) {
        if transport.is_closed() {
            trace!("{:?} is closed - ignoring read readiness", transport);
            return;
        }

        let mut buf = self.pool.acquire_default();
        let capacity = buf.capacity();
        buf.resize(capacity, 0);

        match transport.read(&mut buf) {
            Ok(0) => {
                debug!("end of stream on {:?}", transport);
                self.pool.release(buf);
                self.io_sink.post(Event::CloseChannelRequest { transport, reason: CloseReason::EndOfStream });
            }
            Ok(n) => {
                trace!("read {} bytes from {:?}", n, transport);
                buf.truncate(n);
                self.protocol_sink.post(Event::InputDataPresent { transport: transport.clone(), data: buf });
                self.io_sink.post(Event::ReadPossible { transport });
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.pool.release(buf);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                self.pool.release(buf);
                self.io_sink.post(Event::ReadPossible { transport });
            }
            Err(e) => {
                debug!("error reading from {:?}: {}", transport, e);
                self.pool.release(buf);
                self.io_sink.post(Event::ReadError { transport, cause: Arc::new(e) });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::ErrorKind;
    use rstest::rstest;
    use super::*;
    use crate::event::EventKind;
    use crate::event::queue::MockEventSink;
    use crate::test_util::memory_channel::MemoryChannel;

    fn setup(channel: &MemoryChannel) -> (Arc<BufferPool>, Arc<ChannelTransport>) {
        let pool = Arc::new(BufferPool::new(64, 4));
        let transport = Arc::new(ChannelTransport::new(Box::new(channel.clone()), pool.clone()));
        (pool, transport)
    }

    #[test]
    fn test_data_present() {
        let channel = MemoryChannel::new();
        let (pool, transport) = setup(&channel);
        channel.push_incoming(b"hello");

        let mut io_sink = MockEventSink::new();
        io_sink.expect_post()
            .withf(|e| e.kind() == EventKind::ReadPossible)
            .times(1)
            .return_const(());
        let mut protocol_sink = MockEventSink::new();
        protocol_sink.expect_post()
            .withf(|e| matches!(e, Event::InputDataPresent { data, .. } if data.as_ref() == b"hello"))
            .times(1)
            .return_const(());

        ReadHandler::new(pool, Arc::new(io_sink), Arc::new(protocol_sink)).on_read_possible(transport);
    }

    #[test]
    fn test_end_of_stream() {
        let channel = MemoryChannel::new();
        let (pool, transport) = setup(&channel);
        channel.set_eof();

        let mut io_sink = MockEventSink::new();
        io_sink.expect_post()
            .withf(|e| matches!(e, Event::CloseChannelRequest { reason: CloseReason::EndOfStream, .. }))
            .times(1)
            .return_const(());

        ReadHandler::new(pool.clone(), Arc::new(io_sink), Arc::new(MockEventSink::new())).on_read_possible(transport);
        assert_eq!(pool.pooled(), 1);
    }

    #[test]
    fn test_nothing_to_read_releases_buffer() {
        let channel = MemoryChannel::new();
        let (pool, transport) = setup(&channel);

        ReadHandler::new(pool.clone(), Arc::new(MockEventSink::new()), Arc::new(MockEventSink::new())).on_read_possible(transport);
        assert_eq!(pool.pooled(), 1);
    }

    #[rstest]
    #[case::reset(ErrorKind::ConnectionReset, EventKind::ReadError)]
    #[case::interrupted(ErrorKind::Interrupted, EventKind::ReadPossible)]
    fn test_read_error(#[case] error: ErrorKind, #[case] expected: EventKind) {
        let channel = MemoryChannel::new();
        let (pool, transport) = setup(&channel);
        channel.fail_reads(error);

        let mut io_sink = MockEventSink::new();
        io_sink.expect_post()
            .withf(move |e| e.kind() == expected)
            .times(1)
            .return_const(());

        ReadHandler::new(pool.clone(), Arc::new(io_sink), Arc::new(MockEventSink::new())).on_read_possible(transport);
        assert_eq!(pool.pooled(), 1);
    }

    #[test]
    fn test_closed_transport_is_ignored() {
        let channel = MemoryChannel::new();
        let (pool, transport) = setup(&channel);
        channel.push_incoming(b"late");
        transport.close();

        ReadHandler::new(pool, Arc::new(MockEventSink::new()), Arc::new(MockEventSink::new())).on_read_possible(transport);
    }
}
