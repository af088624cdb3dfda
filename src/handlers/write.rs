use std::io;
use std::sync::Arc;
use tracing::{debug, trace};
use crate::event::Event;
use crate::event::queue::EventSink;
use crate::transport::channel_transport::ChannelTransport;

/// Writes as much of a transport's transmit queue as the channel accepts
pub struct WriteHandler {
    io_sink: Arc<dyn EventSink>,
}

impl WriteHandler {
    pub fn new(io_sink: Arc<dyn EventSink>) -> WriteHandler {
        WriteHandler { io_sink }
    }

    pub fn on_write_possible(&self, transport: Arc<ChannelTransport>) {
        if transport.is_closed() {
            trace!("{:?} is closed - ignoring write readiness", transport);
            return;
        }

        if let Err(e) = flush_transmit_queue(&transport) {
            debug!("error writing to {:?}: {}", transport, e);
            self.io_sink.post(Event::WriteError { transport, cause: Arc::new(e) });
        }
    }
}

/// Writes buffers from the head of the transmit queue until the queue is empty or the channel
///  would block. Fully written buffers are returned to the pool, a partially written buffer stays
///  at the head of the queue. Returns `true` if the queue was drained, in which case write
///  interest is turned off.
pub fn flush_transmit_queue(transport: &ChannelTransport) -> io::Result<bool> {
    let mut queue = transport.transmit_queue();

    loop {
        let (written, len) = match queue.unwritten() {
            None => break,
            Some(unwritten) => {
                match transport.write_channel(unwritten) {
                    Ok(n) => (n, unwritten.len()),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }
        };

        if written == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        if written < len {
            trace!("partial write to {:?}: {} of {} bytes", transport, written, len);
        }
        if let Some(buf) = queue.consume(written) {
            transport.pool().release(buf);
        }
    }

    transport.set_write_interest(false)?;
    Ok(true)
}
