//! The I/O pump's per-event logic. [IoEventHandler] is the composite handler that routes each
//!  event to the handler for its kind.

pub mod accept;
pub mod close;
pub mod connect;
pub mod read;
pub mod write;

use std::sync::Arc;
use tracing::warn;
use crate::buffers::buffer_pool::BufferPool;
use crate::event::Event;
use crate::event::queue::EventSink;
use crate::handlers::accept::AcceptHandler;
use crate::handlers::close::CloseHandler;
use crate::handlers::connect::ConnectHandler;
use crate::handlers::read::ReadHandler;
use crate::handlers::write::WriteHandler;
use crate::reactor::pump::EventHandler;
use crate::reactor::selector::SelectorRegistry;

pub struct IoEventHandler {
    accept: AcceptHandler,
    connect: ConnectHandler,
    read: ReadHandler,
    write: WriteHandler,
    close: CloseHandler,
}

impl IoEventHandler {
    /// `io_sink` is the I/O pump's own queue (typically the selector's sink), `protocol_sink`
    ///  the protocol engine's queue
    pub fn new(registry: Arc<SelectorRegistry>, pool: Arc<BufferPool>, io_sink: Arc<dyn EventSink>, protocol_sink: Arc<dyn EventSink>) -> IoEventHandler {
        IoEventHandler {
            accept: AcceptHandler::new(registry, pool.clone(), protocol_sink.clone()),
            connect: ConnectHandler::new(io_sink.clone(), protocol_sink.clone()),
            read: ReadHandler::new(pool, io_sink.clone(), protocol_sink.clone()),
            write: WriteHandler::new(io_sink),
            close: CloseHandler::new(protocol_sink),
        }
    }
}

impl EventHandler for IoEventHandler {
    fn handle(&mut self, event: Event) {
        match event {
            Event::AcceptPossible { listener } => self.accept.on_accept_possible(&listener),
            Event::ConnectPossible { transport } => self.connect.on_connect_possible(transport),
            Event::ReadPossible { transport } => self.read.on_read_possible(transport),
            Event::WritePossible { transport } => self.write.on_write_possible(transport),
            Event::CloseChannelRequest { transport, reason } => self.close.on_close_request(transport, reason),
            Event::ReadError { transport, cause } |
            Event::WriteError { transport, cause } |
            Event::ConnectError { transport, cause } => self.close.on_error(transport, cause),
            other => warn!("unexpected event in I/O pump: {}", other),
        }
    }
}
