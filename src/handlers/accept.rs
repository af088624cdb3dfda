use std::io;
use std::sync::Arc;
use tracing::{debug, warn};
use crate::buffers::buffer_pool::BufferPool;
use crate::event::Event;
use crate::event::queue::EventSink;
use crate::reactor::selector::SelectorRegistry;
use crate::transport::channel::Listener;
use crate::transport::channel_transport::ChannelTransport;

/// Accepts pending connections on a listener, registering a new transport for each of them
pub struct AcceptHandler {
    registry: Arc<SelectorRegistry>,
    pool: Arc<BufferPool>,
    protocol_sink: Arc<dyn EventSink>,
}

impl AcceptHandler {
    pub fn new(registry: Arc<SelectorRegistry>, pool: Arc<BufferPool>, protocol_sink: Arc<dyn EventSink>) -> AcceptHandler {
        AcceptHandler {
            registry,
            pool,
            protocol_sink,
        }
    }

    pub fn on_accept_possible(&self, listener: &Listener) {
        // readiness is edge-triggered, so accept until there is nothing left
        loop {
            match listener.accept() {
                Ok((stream, addr)) => {
                    let transport = Arc::new(ChannelTransport::new(Box::new(stream), self.pool.clone()));
                    debug!("accepted {:?} from {}", transport, addr);

                    match transport.register(&self.registry) {
                        Ok(()) => self.protocol_sink.post(Event::Accepted { transport }),
                        Err(e) => {
                            warn!("error registering accepted connection from {}: {}", addr, e);
                            transport.close();
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("error accepting connection on {:?}: {}", listener, e);
                    self.protocol_sink.post(Event::AcceptError { cause: Arc::new(e) });
                    break;
                }
            }
        }
    }
}
