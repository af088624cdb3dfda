use std::sync::Arc;
use tracing::{debug, trace};
use crate::event::Event;
use crate::event::queue::EventSink;
use crate::transport::channel_transport::ChannelTransport;

/// Completes pending non-blocking connects
pub struct ConnectHandler {
    io_sink: Arc<dyn EventSink>,
    protocol_sink: Arc<dyn EventSink>,
}

impl ConnectHandler {
    pub fn new(io_sink: Arc<dyn EventSink>, protocol_sink: Arc<dyn EventSink>) -> ConnectHandler {
        ConnectHandler {
            io_sink,
            protocol_sink,
        }
    }

    pub fn on_connect_possible(&self, transport: Arc<ChannelTransport>) {
        if transport.is_closed() {
            trace!("{:?} was closed while connecting", transport);
            return;
        }

        match transport.finish_connect() {
            Ok(true) => {
                debug!("connected {:?}", transport);
                self.protocol_sink.post(Event::Connected { transport });
            }
            Ok(false) => {
                trace!("connect of {:?} still in progress", transport);
            }
            Err(e) => {
                debug!("connect of {:?} failed: {}", transport, e);
                let cause = Arc::new(e);
                // the I/O pump closes the transport, the protocol engine handles the session
                self.io_sink.post(Event::ConnectError { transport: transport.clone(), cause: cause.clone() });
                self.protocol_sink.post(Event::ConnectError { transport, cause });
            }
        }
    }
}
