use std::io;
use std::sync::Arc;
use tracing::debug;
use crate::event::{CloseReason, Event};
use crate::event::queue::EventSink;
use crate::handlers::write::flush_transmit_queue;
use crate::transport::channel_transport::ChannelTransport;

/// Closes transports, notifying the protocol engine exactly once per transport
pub struct CloseHandler {
    protocol_sink: Arc<dyn EventSink>,
}

impl CloseHandler {
    pub fn new(protocol_sink: Arc<dyn EventSink>) -> CloseHandler {
        CloseHandler { protocol_sink }
    }

    pub fn on_close_request(&self, transport: Arc<ChannelTransport>, reason: CloseReason) {
        if reason.flush_first() && !transport.is_closed() {
            // best effort: the peer should see the final frame, but closing must not wait for it
            match flush_transmit_queue(&transport) {
                Ok(true) => {}
                Ok(false) => debug!("{:?}: could not flush transmit queue before closing", transport),
                Err(e) => debug!("{:?}: error flushing transmit queue before closing: {}", transport, e),
            }
        }
        self.close(transport, None);
    }

    pub fn on_error(&self, transport: Arc<ChannelTransport>, cause: Arc<io::Error>) {
        self.close(transport, Some(cause));
    }

    fn close(&self, transport: Arc<ChannelTransport>, cause: Option<Arc<io::Error>>) {
        if transport.close() {
            debug!("closed {:?}, last read {:?} ago, last write {:?} ago", transport, transport.last_rx().elapsed(), transport.last_tx().elapsed());
            self.protocol_sink.post(Event::ChannelClosed { transport, cause });
        }
        else {
            debug!("{:?} was closed before", transport);
        }
    }
}
